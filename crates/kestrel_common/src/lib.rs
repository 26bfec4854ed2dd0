pub mod error;
pub mod types;
pub mod value;

pub use error::{KestrelError, PlanError, RouteError, ValueError};
pub use types::{BackendId, Field, FieldType};
pub use value::Value;
