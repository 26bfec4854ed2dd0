//! Logical-table → segment resolution for the planner.
//!
//! Three placement policies:
//! - **Hash**: rows land on segments by `xxh3(shard key) % HASH_SLOTS`;
//!   segments own contiguous slot ranges.
//! - **Global**: the table is replicated on every backend; any one replica
//!   serves reads.
//! - **Single**: the table lives whole on one backend.
//!
//! All lookups are read-only and safe for concurrent use; the table map is
//! behind a `RwLock` so topology changes never race a planning pass.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use kestrel_common::error::RouteError;
use kestrel_common::types::BackendId;

use crate::segment::{Segment, SlotRange};

/// Total hash slots a sharded table is divided into.
pub const HASH_SLOTS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardType {
    Global,
    Single,
    Hash,
}

/// Routing config for one logical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRoute {
    pub database: String,
    pub table: String,
    pub shard_type: ShardType,
    /// Shard-key column name; empty for Global/Single tables.
    pub shard_key: String,
    pub segments: Vec<Segment>,
}

/// A shard-key literal extracted from a WHERE predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Int(i64),
    Uint(u64),
    Text(String),
}

impl KeyValue {
    /// Type-tagged byte encoding; equal keys encode equally regardless of
    /// the carrying variant.
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match self {
            KeyValue::Int(v) => {
                buf.push(0x01);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            KeyValue::Uint(v) => {
                if let Ok(i) = i64::try_from(*v) {
                    buf.push(0x01);
                    buf.extend_from_slice(&i.to_le_bytes());
                } else {
                    buf.push(0x02);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            KeyValue::Text(s) => {
                buf.push(0x03);
                buf.extend_from_slice(s.as_bytes());
            }
        }
        buf
    }

    pub fn slot(&self) -> u32 {
        (xxh3_64(&self.encode()) % HASH_SLOTS as u64) as u32
    }
}

/// The routing map consumed by the planner. Concurrent reads are the
/// common case; writes only happen on topology changes.
#[derive(Debug, Default)]
pub struct Router {
    tables: RwLock<HashMap<(String, String), TableRoute>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Register a hash-sharded table with `segment_count` segments spread
    /// round-robin over `backends`. Physical names are `<table>_<idx:04>`.
    pub fn add_hash_table(
        &self,
        database: &str,
        table: &str,
        shard_key: &str,
        backends: &[BackendId],
        segment_count: usize,
    ) {
        assert!(segment_count >= 1, "hash table needs at least one segment");
        assert!(!backends.is_empty(), "hash table needs at least one backend");
        let slots_per = HASH_SLOTS / segment_count as u32;
        let segments = (0..segment_count)
            .map(|i| {
                let start = i as u32 * slots_per;
                let end = if i == segment_count - 1 {
                    HASH_SLOTS
                } else {
                    (i as u32 + 1) * slots_per
                };
                Segment {
                    table: format!("{}_{:04}", table, i),
                    backend: backends[i % backends.len()].clone(),
                    range: SlotRange::new(start, end),
                }
            })
            .collect();
        self.insert(TableRoute {
            database: database.to_string(),
            table: table.to_string(),
            shard_type: ShardType::Hash,
            shard_key: shard_key.to_string(),
            segments,
        });
    }

    /// Register a table replicated identically on every backend.
    pub fn add_global_table(&self, database: &str, table: &str, backends: &[BackendId]) {
        let segments = backends
            .iter()
            .map(|b| Segment {
                table: table.to_string(),
                backend: b.clone(),
                range: SlotRange::new(0, HASH_SLOTS),
            })
            .collect();
        self.insert(TableRoute {
            database: database.to_string(),
            table: table.to_string(),
            shard_type: ShardType::Global,
            shard_key: String::new(),
            segments,
        });
    }

    /// Register an unsharded table living whole on one backend.
    pub fn add_single_table(&self, database: &str, table: &str, backend: BackendId) {
        self.insert(TableRoute {
            database: database.to_string(),
            table: table.to_string(),
            shard_type: ShardType::Single,
            shard_key: String::new(),
            segments: vec![Segment {
                table: table.to_string(),
                backend,
                range: SlotRange::new(0, HASH_SLOTS),
            }],
        });
    }

    fn insert(&self, route: TableRoute) {
        tracing::debug!(
            database = %route.database,
            table = %route.table,
            segments = route.segments.len(),
            "router: table registered"
        );
        self.tables
            .write()
            .insert((route.database.clone(), route.table.clone()), route);
    }

    /// Full routing config for a table.
    pub fn table(&self, database: &str, table: &str) -> Result<TableRoute, RouteError> {
        self.tables
            .read()
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| RouteError::TableUnknown(database.to_string(), table.to_string()))
    }

    /// Resolve a shard-key equality to the index of the covering segment.
    pub fn lookup_index(
        &self,
        database: &str,
        table: &str,
        value: &KeyValue,
    ) -> Result<usize, RouteError> {
        let route = self.table(database, table)?;
        let slot = value.slot();
        route
            .segments
            .iter()
            .position(|s| s.range.contains(slot))
            .ok_or_else(|| {
                RouteError::Unresolvable(format!(
                    "no segment of {}.{} covers slot {}",
                    database, table, slot
                ))
            })
    }

    /// Segments at the given indices; an empty index list means all.
    /// Indices are de-duplicated and returned in segment order.
    pub fn segments(
        &self,
        database: &str,
        table: &str,
        indexes: &[usize],
    ) -> Result<Vec<Segment>, RouteError> {
        let route = self.table(database, table)?;
        if indexes.is_empty() {
            return Ok(route.segments);
        }
        let mut picked: Vec<usize> = indexes.to_vec();
        picked.sort_unstable();
        picked.dedup();
        picked
            .into_iter()
            .map(|i| {
                route.segments.get(i).cloned().ok_or_else(|| {
                    RouteError::Unresolvable(format!(
                        "segment index {} out of range for {}.{}",
                        i, database, table
                    ))
                })
            })
            .collect()
    }
}
