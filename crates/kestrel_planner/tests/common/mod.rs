#![allow(dead_code)]

use kestrel_common::error::KestrelError;
use kestrel_common::types::BackendId;
use kestrel_planner::SelectPlan;
use kestrel_router::Router;

pub fn backends(n: usize) -> Vec<BackendId> {
    (0..n)
        .map(|i| BackendId::new(format!("backend{}", i)))
        .collect()
}

/// Topology shared by the planner scenarios:
/// - `t(id shardkey, a, b)` and `u(id shardkey, c)` hash-sharded over
///   backend0..backend3, four segments each;
/// - `g(x, y)` replicated on every backend;
/// - `s(x, y)` whole on backend0.
pub fn test_router() -> Router {
    let router = Router::new();
    let b = backends(4);
    router.add_hash_table("sbtest", "t", "id", &b, 4);
    router.add_hash_table("sbtest", "u", "id", &b, 4);
    router.add_global_table("sbtest", "g", &b);
    router.add_single_table("sbtest", "s", BackendId::new("backend0"));
    router
}

pub fn build_plan<'a>(router: &'a Router, sql: &str) -> Result<SelectPlan<'a>, KestrelError> {
    let mut plan = SelectPlan::new(router, "sbtest", sql)?;
    plan.build()?;
    Ok(plan)
}
