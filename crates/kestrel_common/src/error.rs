use thiserror::Error;

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Value error: {0}")]
    Value(#[from] ValueError),
}

/// Planner rejections. Structural and semantic rejections are fatal per
/// plan; the message strings are stable identifiers for clients.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("unsupported: subqueries in select")]
    UnsupportedSubquery,

    #[error("unsupported: group by: {0}")]
    UnsupportedGroupBy(String),

    #[error("unsupported: distinct: {0}")]
    UnsupportedDistinct(String),

    #[error("unsupported: aggregate: {0}")]
    UnsupportedAggregate(String),

    #[error("unsupported: having: {0}")]
    UnsupportedHaving(String),

    #[error("unsupported: join shape: {0}")]
    UnsupportedJoinShape(String),

    #[error("unsupported: limit clause: {0}")]
    InvalidLimit(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("unknown column: {0}")]
    ColumnUnknown(String),

    #[error("ambiguous column: {0}")]
    AmbiguousColumn(String),

    #[error("not unique table/alias: {0}")]
    DuplicateTableAlias(String),
}

/// Shard-route resolution errors.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("unknown table: {0}.{1}")]
    TableUnknown(String, String),

    #[error("route unresolvable: {0}")]
    Unresolvable(String),

    #[error("shard key value not hashable: {0}")]
    KeyUnhashable(String),
}

/// Scalar arithmetic faults. The aggregation executor latches these instead
/// of propagating them, so a bad row never aborts a result stream.
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
}

impl KestrelError {
    /// Map to the MySQL error code reported on the wire.
    pub fn mysql_errno(&self) -> u16 {
        match self {
            KestrelError::Parse(_) => 1064,
            KestrelError::Plan(PlanError::ColumnUnknown(_)) => 1054,
            KestrelError::Plan(PlanError::AmbiguousColumn(_)) => 1052,
            KestrelError::Plan(PlanError::DuplicateTableAlias(_)) => 1066,
            KestrelError::Plan(_) => 1235,
            KestrelError::Route(RouteError::TableUnknown(_, _)) => 1146,
            KestrelError::Route(_) => 1105,
            KestrelError::Value(_) => 1105,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_stable() {
        let err = PlanError::UnsupportedSubquery;
        assert_eq!(err.to_string(), "unsupported: subqueries in select");

        let err = RouteError::TableUnknown("sbtest".into(), "missing".into());
        assert_eq!(err.to_string(), "unknown table: sbtest.missing");
    }

    #[test]
    fn test_mysql_errno_mapping() {
        let err: KestrelError = PlanError::ColumnUnknown("t.a".into()).into();
        assert_eq!(err.mysql_errno(), 1054);
        let err: KestrelError = RouteError::TableUnknown("db".into(), "t".into()).into();
        assert_eq!(err.mysql_errno(), 1146);
        let err: KestrelError = PlanError::UnsupportedSubquery.into();
        assert_eq!(err.mysql_errno(), 1235);
    }
}
