pub mod router;
pub mod segment;

pub use router::{KeyValue, Router, ShardType, TableRoute, HASH_SLOTS};
pub use segment::{Segment, SlotRange};
