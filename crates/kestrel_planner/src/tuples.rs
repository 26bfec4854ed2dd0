use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, SelectItem};

use kestrel_router::KeyValue;

/// Aggregate function kinds, plus the pseudo-kind tagging hash-group-by keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggrType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    GroupBy,
}

impl AggrType {
    pub fn from_name(name: &str) -> Option<AggrType> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggrType::Count),
            "sum" => Some(AggrType::Sum),
            "avg" => Some(AggrType::Avg),
            "min" => Some(AggrType::Min),
            "max" => Some(AggrType::Max),
            _ => None,
        }
    }
}

/// One aggregate (or group key) the proxy must evaluate over the gathered
/// stream. `index` addresses the column in the shard result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregator {
    pub field: String,
    pub index: usize,
    pub typ: AggrType,
    pub distinct: bool,
}

/// Whether the projection's aggregates can execute on the shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggPush {
    /// No aggregates in the projection.
    NoAgg,
    /// Partial aggregates ship to the shards; the proxy combines.
    CanPush,
    /// Shards ship raw values; the proxy aggregates.
    CannotPush,
}

/// A column reference split into qualifier and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    /// Table alias qualifier; empty when unqualified.
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn label(&self) -> String {
        if self.table.is_empty() {
            self.column.clone()
        } else {
            format!("{}.{}", self.table, self.column)
        }
    }
}

/// Aggregate found at the top level of a projected expression.
#[derive(Debug, Clone)]
pub struct AggrInfo {
    pub typ: AggrType,
    pub distinct: bool,
    /// Inner argument expression; `None` for `COUNT(*)`.
    pub arg: Option<Expr>,
}

/// A projected expression with its bookkeeping.
#[derive(Debug, Clone)]
pub struct SelectTuple {
    /// The projection item as written.
    pub item: SelectItem,
    /// Column label; the bare column name for simple references, the
    /// rendered text otherwise, `*` for stars.
    pub field: String,
    /// Alias, possibly empty.
    pub alias: String,
    /// Qualifier of a simple column reference, empty otherwise.
    pub table: String,
    /// Aliases of every table the expression touches.
    pub refer_tables: Vec<String>,
    pub agg: Option<AggrInfo>,
    pub is_star: bool,
}

impl SelectTuple {
    /// Label shown to the client: alias wins over the raw field.
    pub fn label(&self) -> &str {
        if self.alias.is_empty() {
            &self.field
        } else {
            &self.alias
        }
    }
}

/// A WHERE/HAVING conjunct touching at most one side of any join.
#[derive(Debug, Clone)]
pub struct FilterTuple {
    pub expr: Expr,
    pub refer_tables: Vec<String>,
    /// The column of a `col <op> literal` comparison, when that is the shape.
    pub col: Option<ColumnRef>,
    /// Literal equality values (from `=` or an `IN` list), consumed for
    /// shard-key narrowing.
    pub vals: Vec<KeyValue>,
}

/// An equality `t1.a = t2.b` whose sides reference different tables.
#[derive(Debug, Clone)]
pub struct JoinTuple {
    pub expr: Expr,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

/// A GROUP BY key (explicit, or synthesized from DISTINCT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTuple {
    pub field: String,
    pub table: String,
    /// False when the key column must be shipped as a hidden trailing
    /// column because the projection does not carry it.
    pub in_select: bool,
}
