use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use kestrel_common::error::KestrelError;

/// Parse a SQL string into one or more AST statements using sqlparser-rs.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>, KestrelError> {
    Parser::parse_sql(&MySqlDialect {}, sql).map_err(|e| KestrelError::Parse(e.to_string()))
}

/// Parse a single query statement. Non-query statements are a parse-level
/// rejection; the body shape is validated later by the planner.
pub fn parse_select(sql: &str) -> Result<Query, KestrelError> {
    let mut stmts = parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(KestrelError::Parse("expected a single statement".to_string()));
    }
    match stmts.remove(0) {
        Statement::Query(q) => Ok(*q),
        other => Err(KestrelError::Parse(format!("expected SELECT, got: {}", other))),
    }
}
