mod common;

use common::{build_plan, test_router};

use kestrel_common::error::{KestrelError, PlanError, RouteError};
use kestrel_planner::tuples::AggrType;
use kestrel_planner::{ChildPlan, JoinStrategy};
use kestrel_router::KeyValue;

// ---- routing ----

#[test]
fn test_point_select_single_route() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT * FROM t WHERE id = 7").unwrap();

    let merge = plan.root().unwrap().as_merge().unwrap();
    assert_eq!(merge.route_len(), 1);
    assert!(plan.children().unwrap().is_empty());

    let idx = router.lookup_index("sbtest", "t", &KeyValue::Int(7)).unwrap();
    let querys = plan.querys();
    assert_eq!(querys.len(), 1);
    assert_eq!(
        querys[0].query,
        format!("SELECT * FROM t_{:04} WHERE id = 7", idx)
    );
    assert_eq!(querys[0].backend.as_str(), format!("backend{}", idx % 4));
    assert!(!querys[0].range.is_empty());
}

#[test]
fn test_full_scan_fans_out() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT * FROM t").unwrap();

    let merge = plan.root().unwrap().as_merge().unwrap();
    assert_eq!(merge.route_len(), 4);
    let querys = plan.querys();
    assert_eq!(querys.len(), 4);
    for (i, tuple) in querys.iter().enumerate() {
        assert_eq!(tuple.query, format!("SELECT * FROM t_{:04}", i));
        assert_eq!(tuple.backend.as_str(), format!("backend{}", i));
    }

    let json = plan.json();
    assert!(!json.contains("\"Aggregate\""));
    assert!(!json.contains("\"Join\""));
}

#[test]
fn test_in_list_narrows_route() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT * FROM t WHERE id IN (1, 2, 3)").unwrap();

    let mut expect: Vec<usize> = [1i64, 2, 3]
        .iter()
        .map(|k| router.lookup_index("sbtest", "t", &KeyValue::Int(*k)).unwrap())
        .collect();
    expect.sort_unstable();
    expect.dedup();
    assert_eq!(plan.querys().len(), expect.len());
}

#[test]
fn test_route_len_matches_segments() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT a FROM t").unwrap();
    let merge = plan.root().unwrap().as_merge().unwrap();
    let segments = router.segments("sbtest", "t", &[]).unwrap();
    assert_eq!(merge.route_len(), segments.len());
    assert_eq!(plan.querys().len(), segments.len());
    assert_eq!(merge.parsed_querys().len(), segments.len());
}

#[test]
fn test_build_is_deterministic() {
    let router = test_router();
    let mut plan = kestrel_planner::SelectPlan::new(&router, "sbtest", "SELECT a FROM t").unwrap();
    plan.build().unwrap();
    let first = plan.querys();
    plan.build().unwrap();
    assert_eq!(plan.querys(), first);
}

#[test]
fn test_global_only_pins_one_backend() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT x, y FROM g WHERE x > 2").unwrap();
    let querys = plan.querys();
    assert_eq!(querys.len(), 1);
    assert_eq!(querys[0].query, "SELECT x, y FROM g WHERE x > 2");
}

#[test]
fn test_single_table_routes_to_its_backend() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT * FROM s").unwrap();
    let querys = plan.querys();
    assert_eq!(querys.len(), 1);
    assert_eq!(querys[0].backend.as_str(), "backend0");
    assert_eq!(querys[0].query, "SELECT * FROM s");
}

// ---- aggregation split ----

#[test]
fn test_pushdown_count() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT COUNT(*) FROM t").unwrap();

    let querys = plan.querys();
    assert_eq!(querys.len(), 4);
    for (i, tuple) in querys.iter().enumerate() {
        assert_eq!(tuple.query, format!("SELECT COUNT(*) FROM t_{:04}", i));
    }

    let children = plan.children().unwrap();
    assert_eq!(children.len(), 1);
    let ChildPlan::Aggregate(aggr) = &children.plans()[0] else {
        panic!("expected an aggregate plan");
    };
    assert!(aggr.is_push_down());
    assert_eq!(aggr.normal_aggrs().len(), 1);
    assert_eq!(aggr.normal_aggrs()[0].typ, AggrType::Count);
    assert!(aggr.group_aggrs().is_empty());
}

#[test]
fn test_avg_decomposes_into_sum_and_count() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT AVG(a) FROM t").unwrap();

    for tuple in plan.querys() {
        assert!(
            tuple.query.starts_with("SELECT sum(a), count(a) FROM t_"),
            "unexpected shard query: {}",
            tuple.query
        );
    }

    let children = plan.children().unwrap();
    let ChildPlan::Aggregate(aggr) = &children.plans()[0] else {
        panic!("expected an aggregate plan");
    };
    let aggrs = aggr.normal_aggrs();
    assert_eq!(aggrs.len(), 3);
    assert_eq!((aggrs[0].typ, aggrs[0].index), (AggrType::Avg, 0));
    assert_eq!((aggrs[1].typ, aggrs[1].index), (AggrType::Sum, 0));
    assert_eq!((aggrs[2].typ, aggrs[2].index), (AggrType::Count, 1));
}

#[test]
fn test_count_distinct_gathers_values() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT COUNT(DISTINCT a) FROM t").unwrap();

    for tuple in plan.querys() {
        assert!(
            tuple.query.starts_with("SELECT a FROM t_"),
            "distinct aggregates ship the bare argument, got: {}",
            tuple.query
        );
    }
    let children = plan.children().unwrap();
    let ChildPlan::Aggregate(aggr) = &children.plans()[0] else {
        panic!("expected an aggregate plan");
    };
    assert!(!aggr.is_push_down());
    assert!(aggr.normal_aggrs()[0].distinct);
}

#[test]
fn test_group_by_on_shard_key_is_fully_pushed() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT id, COUNT(*) FROM t GROUP BY id").unwrap();

    // Groups are shard-disjoint: no aggregate plan, only the gather-merge
    // ordering over the synthesized group ORDER BY.
    let children = plan.children().unwrap();
    assert_eq!(children.len(), 1);
    assert!(matches!(children.plans()[0], ChildPlan::OrderBy(_)));
    for tuple in plan.querys() {
        assert!(tuple.query.contains("GROUP BY id"));
        assert!(tuple.query.contains("ORDER BY id"));
    }
}

#[test]
fn test_group_by_off_key_aggregates_in_proxy() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT a, COUNT(*) FROM t GROUP BY a").unwrap();

    for tuple in plan.querys() {
        assert!(tuple.query.contains("GROUP BY a"));
        assert!(tuple.query.contains("ORDER BY a"));
    }
    let children = plan.children().unwrap();
    let aggr = children
        .plans()
        .iter()
        .find_map(|p| match p {
            ChildPlan::Aggregate(a) => Some(a),
            _ => None,
        })
        .expect("proxy-side aggregation");
    assert!(aggr.is_push_down());
    assert_eq!(aggr.group_aggrs().len(), 1);
    assert_eq!(aggr.group_aggrs()[0].field, "a");
    assert_eq!(aggr.group_aggrs()[0].index, 0);

    let json = plan.json();
    assert!(json.contains("\"HashGroupBy\""));
}

#[test]
fn test_group_by_key_outside_projection_ships_hidden() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT COUNT(*) FROM t GROUP BY a").unwrap();

    for tuple in plan.querys() {
        assert!(
            tuple.query.starts_with("SELECT COUNT(*), a FROM t_"),
            "hidden group key should trail the projection, got: {}",
            tuple.query
        );
    }
    let children = plan.children().unwrap();
    let ChildPlan::Aggregate(aggr) = &children.plans()[0] else {
        panic!("expected an aggregate plan");
    };
    assert_eq!(aggr.group_aggrs()[0].index, 1);
}

#[test]
fn test_distinct_becomes_grouping() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT DISTINCT a FROM t").unwrap();

    for tuple in plan.querys() {
        assert!(tuple.query.starts_with("SELECT DISTINCT a FROM t_"));
    }
    let children = plan.children().unwrap();
    let ChildPlan::Aggregate(aggr) = &children.plans()[0] else {
        panic!("expected an aggregate plan");
    };
    assert_eq!(aggr.group_aggrs().len(), 1);
}

#[test]
fn test_distinct_on_shard_key_needs_no_proxy_work() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT DISTINCT id FROM t").unwrap();
    assert!(plan.children().unwrap().is_empty());
    for tuple in plan.querys() {
        assert!(tuple.query.starts_with("SELECT DISTINCT id FROM t_"));
    }
}

// ---- order by / limit ----

#[test]
fn test_order_by_limit_fan_out() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT a FROM t ORDER BY a DESC LIMIT 3").unwrap();

    for (i, tuple) in plan.querys().iter().enumerate() {
        assert_eq!(
            tuple.query,
            format!("SELECT a FROM t_{:04} ORDER BY a DESC LIMIT 3", i)
        );
    }
    let json = plan.json();
    assert!(json.contains("\"GatherMerge\""));
    assert!(json.contains("\"Limit\""));
}

#[test]
fn test_limit_offset_folds_into_shard_count() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT a FROM t LIMIT 5, 10").unwrap();

    for tuple in plan.querys() {
        assert!(
            tuple.query.ends_with("LIMIT 15"),
            "shards receive offset+count, got: {}",
            tuple.query
        );
    }
    let children = plan.children().unwrap();
    let ChildPlan::Limit(limit) = &children.plans()[0] else {
        panic!("expected a limit plan");
    };
    assert_eq!((limit.offset(), limit.limit()), (5, 10));
    assert_eq!(limit.rewritten(), (0, 15));
}

#[test]
fn test_limit_kept_in_proxy_under_group_by() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT a, COUNT(*) FROM t GROUP BY a LIMIT 10").unwrap();
    for tuple in plan.querys() {
        assert!(
            !tuple.query.contains("LIMIT"),
            "grouping changes cardinality; the shard limit must be dropped: {}",
            tuple.query
        );
    }
}

// ---- joins ----

#[test]
fn test_global_join_fuses_to_shard_local() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT t.a, g.y FROM t JOIN g ON t.a = g.x").unwrap();

    let root = plan.root().unwrap();
    assert!(root.as_merge().is_some(), "global side fuses into the shards");
    let querys = plan.querys();
    assert_eq!(querys.len(), 4);
    for (i, tuple) in querys.iter().enumerate() {
        assert_eq!(
            tuple.query,
            format!("SELECT t.a, g.y FROM t_{:04} AS t JOIN g ON t.a = g.x", i)
        );
    }
    assert!(!plan.json().contains("\"Join\""));
}

#[test]
fn test_sort_merge_join_with_order_and_limit() {
    let router = test_router();
    let plan = build_plan(
        &router,
        "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a = t2.b ORDER BY t1.a LIMIT 5, 10",
    )
    .unwrap();

    let join = plan.root().unwrap().as_join().unwrap();
    assert_eq!(join.strategy(), JoinStrategy::SortMerge);
    assert!(!join.is_left_join());

    // Both sides fan out to every shard of t.
    let querys = plan.querys();
    assert_eq!(querys.len(), 8);
    for tuple in &querys {
        assert!(
            tuple.query.ends_with("LIMIT 15"),
            "shards receive offset+count, got: {}",
            tuple.query
        );
    }
    // The left side ships the user's order, the right side is ordered on
    // its join key.
    assert!(querys[0].query.contains("ORDER BY t1.a"));
    assert!(querys[4].query.contains("ORDER BY t2.b"));

    let json = plan.json();
    assert!(json.contains("\"Strategy\": \"Sort Merge Join\""));
    assert!(json.contains("\"Type\": \"INNER JOIN\""));
    assert!(json.contains("\"GatherMerge\""));
    assert!(json.contains("t1.a"));
    assert!(json.contains("\"Offset\": 5"));
    assert!(json.contains("\"Limit\": 10"));
}

#[test]
fn test_comma_join_is_cartesian() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT t1.a, t2.b FROM t t1, t t2").unwrap();

    let join = plan.root().unwrap().as_join().unwrap();
    assert_eq!(join.strategy(), JoinStrategy::Cartesian);
    let json = plan.json();
    assert!(json.contains("\"Strategy\": \"Cartesian Join\""));
    assert!(json.contains("\"Type\": \"CROSS JOIN\""));
}

#[test]
fn test_non_equi_join_runs_nested_loop_with_bind_vars() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a > t2.b").unwrap();

    let join = plan.root().unwrap().as_join().unwrap();
    assert_eq!(join.strategy(), JoinStrategy::NestedLoop);
    assert_eq!(join.vars().len(), 1);
    assert_eq!(join.vars()[0].name, "t1_a");

    let right = join.right().as_merge().unwrap();
    let parsed = &right.parsed_querys()[0];
    assert!(
        parsed.query.contains(":t1_a > t2.b"),
        "outer reference becomes a bind variable: {}",
        parsed.query
    );
    assert_eq!(parsed.bind_locations.len(), 1);
    assert_eq!(parsed.bind_locations[0].name, "t1_a");

    let json = plan.json();
    assert!(json.contains("\"Strategy\": \"Nested Loop Join\""));
}

#[test]
fn test_same_backend_join_fuses() {
    let router = test_router();
    // Pick a key living on segment 0 (backend0), where `s` also lives.
    let key = (0..200)
        .find(|k| {
            router
                .lookup_index("sbtest", "t", &KeyValue::Int(*k))
                .unwrap()
                == 0
        })
        .expect("some key maps to the first segment");

    let sql = format!(
        "SELECT t.a, s.y FROM t JOIN s ON t.a = s.x WHERE t.id = {}",
        key
    );
    let plan = build_plan(&router, &sql).unwrap();

    let merge = plan.root().unwrap().as_merge().unwrap();
    assert_eq!(merge.route_len(), 1);
    let querys = plan.querys();
    assert_eq!(querys.len(), 1);
    assert_eq!(querys[0].backend.as_str(), "backend0");
    assert!(querys[0].query.contains("t_0000 AS t"));
    assert!(querys[0].query.contains("JOIN s ON t.a = s.x"));
}

#[test]
fn test_same_backend_left_join_fuses_inner_where_into_on() {
    let router = test_router();
    // Pick a key living on segment 0 (backend0), where `s` also lives, so
    // the LEFT JOIN side pins to one backend and fuses.
    let key = (0..200)
        .find(|k| {
            router
                .lookup_index("sbtest", "t", &KeyValue::Int(*k))
                .unwrap()
                == 0
        })
        .expect("some key maps to the first segment");

    // The inner-side predicate `s.y > 0` reaches s's WHERE through the ON
    // clause; `u` keeps the root a cross-shard join so the fused node's
    // query is actually emitted instead of being grafted over.
    let sql = format!(
        "SELECT t.a, u.c FROM t LEFT JOIN s ON t.a = s.x AND s.y > 0 \
         JOIN u ON t.a = u.c WHERE t.id = {}",
        key
    );
    let plan = build_plan(&router, &sql).unwrap();

    let join = plan.root().unwrap().as_join().unwrap();
    let left = join.left().as_merge().expect("left join fused into one backend");
    assert_eq!(left.route_len(), 1);
    assert_eq!(left.backend().unwrap().as_str(), "backend0");

    // The fused LEFT JOIN keeps the inner side's predicate in the ON
    // clause; folded into the WHERE it would drop preserved rows.
    let query = &left.querys()[0].query;
    assert!(
        query.contains("LEFT JOIN s ON t.a = s.x AND s.y > 0"),
        "inner-side WHERE must fold back into ON, got: {}",
        query
    );
    assert!(query.contains("t_0000 AS t"));
    assert!(query.contains(&format!("WHERE t.id = {}", key)));

    // One fused query plus u's full fan-out.
    assert_eq!(plan.querys().len(), 5);
}

#[test]
fn test_join_where_narrows_one_side() {
    let router = test_router();
    let plan = build_plan(
        &router,
        "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a = t2.b WHERE t1.id = 7",
    )
    .unwrap();

    let join = plan.root().unwrap().as_join().unwrap();
    assert_eq!(join.left().as_merge().unwrap().route_len(), 1);
    assert_eq!(join.right().as_merge().unwrap().route_len(), 4);
    assert_eq!(plan.querys().len(), 5);
}

#[test]
fn test_left_join_keeps_type_in_explain() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT t1.a FROM t t1 LEFT JOIN t t2 ON t1.a = t2.b").unwrap();
    let join = plan.root().unwrap().as_join().unwrap();
    assert!(join.is_left_join());
    assert!(plan.json().contains("\"Type\": \"LEFT JOIN\""));
}

// ---- having / misc ----

#[test]
fn test_having_is_pushed_to_shards() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT a, COUNT(*) FROM t GROUP BY a HAVING a > 3").unwrap();
    for tuple in plan.querys() {
        assert!(tuple.query.contains("HAVING a > 3"));
    }
}

#[test]
fn test_explain_shape_for_point_select() {
    let router = test_router();
    let plan = build_plan(&router, "SELECT * FROM t WHERE id = 7").unwrap();
    let json = plan.json();
    assert!(json.contains("\"RawQuery\": \"SELECT * FROM t WHERE id = 7\""));
    assert!(json.contains("\"Partitions\""));
    assert!(json.contains("\"Project\": \"*\""));
}

// ---- rejections ----

#[test]
fn test_subquery_rejected_before_routing() {
    let router = test_router();
    // `missing` is unknown to the router; the subquery check must fire first.
    let err = build_plan(
        &router,
        "SELECT * FROM t WHERE id IN (SELECT id FROM missing)",
    )
    .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedSubquery)
    ));
}

#[test]
fn test_derived_table_rejected() {
    let router = test_router();
    let err = build_plan(&router, "SELECT * FROM (SELECT a FROM t) AS d").unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedSubquery)
    ));
}

#[test]
fn test_union_rejected() {
    let router = test_router();
    let err = build_plan(&router, "SELECT a FROM t UNION SELECT a FROM t").unwrap_err();
    assert!(matches!(err, KestrelError::Plan(PlanError::Unsupported(_))));
}

#[test]
fn test_unknown_table_rejected() {
    let router = test_router();
    let err = build_plan(&router, "SELECT * FROM missing").unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Route(RouteError::TableUnknown(_, _))
    ));
}

#[test]
fn test_unknown_qualifier_rejected() {
    let router = test_router();
    let err = build_plan(&router, "SELECT ghost.a FROM t").unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::ColumnUnknown(_))
    ));
}

#[test]
fn test_group_by_in_join_rejected() {
    let router = test_router();
    let err = build_plan(
        &router,
        "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a = t2.b GROUP BY t1.a",
    )
    .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedGroupBy(_))
    ));
}

#[test]
fn test_aggregate_in_join_rejected() {
    let router = test_router();
    let err = build_plan(
        &router,
        "SELECT COUNT(t1.a) FROM t t1 JOIN t t2 ON t1.a = t2.b",
    )
    .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedAggregate(_))
    ));
}

#[test]
fn test_having_with_aggregate_rejected() {
    let router = test_router();
    let err = build_plan(
        &router,
        "SELECT a FROM t GROUP BY a HAVING COUNT(a) > 3",
    )
    .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedHaving(_))
    ));
}

#[test]
fn test_where_filter_on_left_join_inner_side_rejected() {
    let router = test_router();
    let err = build_plan(
        &router,
        "SELECT t1.a FROM t t1 LEFT JOIN t t2 ON t1.a = t2.b WHERE t2.b = 5",
    )
    .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedJoinShape(_))
    ));
}

#[test]
fn test_distinct_star_rejected() {
    let router = test_router();
    let err = build_plan(&router, "SELECT DISTINCT * FROM t").unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::UnsupportedDistinct(_))
    ));
}

#[test]
fn test_duplicate_alias_rejected() {
    let router = test_router();
    let err = build_plan(&router, "SELECT t1.a FROM t t1, u t1").unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Plan(PlanError::DuplicateTableAlias(_))
    ));
}
