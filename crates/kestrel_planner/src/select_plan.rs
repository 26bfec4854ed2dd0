//! The top-level SELECT planner: analyze, route, split post-processing,
//! render per-backend queries, expose the explain document.

use std::collections::HashSet;

use serde::Serialize;
use sqlparser::ast::{Query, Select, SetExpr};

use kestrel_common::error::{KestrelError, PlanError};
use kestrel_router::Router;

use crate::analyzer;
use crate::join_node::JoinStrategy;
use crate::merge_node::QueryTuple;
use crate::node::{ChildPlan, PlanTree, PlanType, SelectNode};
use crate::parser::parse_select;
use crate::table_info::scan_table_exprs;

/// Plan for one `SELECT` statement. Built and consumed by a single request
/// handler; only the `Router` is shared between concurrent plans.
#[derive(Debug)]
pub struct SelectPlan<'a> {
    router: &'a Router,
    database: String,
    raw_query: String,
    query: Query,
    typ: PlanType,
    root: Option<SelectNode>,
}

#[derive(Serialize)]
struct ExplainJoin {
    #[serde(rename = "Type")]
    typ: String,
    #[serde(rename = "Strategy")]
    strategy: String,
}

#[derive(Serialize)]
struct ExplainLimit {
    #[serde(rename = "Offset")]
    offset: usize,
    #[serde(rename = "Limit")]
    limit: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Explain {
    #[serde(skip_serializing_if = "String::is_empty")]
    raw_query: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    project: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    partitions: Vec<QueryTuple>,
    #[serde(skip_serializing_if = "Option::is_none")]
    join: Option<ExplainJoin>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    aggregate: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    gather_merge: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hash_group_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<ExplainLimit>,
}

impl<'a> SelectPlan<'a> {
    pub fn new(
        router: &'a Router,
        database: impl Into<String>,
        sql: impl Into<String>,
    ) -> Result<SelectPlan<'a>, KestrelError> {
        let raw_query = sql.into();
        let query = parse_select(&raw_query)?;
        Ok(SelectPlan::with_ast(router, database, raw_query, query))
    }

    /// Plan an already-parsed statement.
    pub fn with_ast(
        router: &'a Router,
        database: impl Into<String>,
        raw_query: impl Into<String>,
        query: Query,
    ) -> SelectPlan<'a> {
        SelectPlan {
            router,
            database: database.into(),
            raw_query: raw_query.into(),
            query,
            typ: PlanType::Select,
            root: None,
        }
    }

    /// Run the full pipeline: analyze, route and render the per-backend
    /// queries. Any error discards the plan.
    pub fn build(&mut self) -> Result<(), KestrelError> {
        self.analyze()?;
        let root = self.root.as_mut().expect("analyze sets the root");
        let aliases: HashSet<String> = root.referred_aliases().into_iter().collect();
        root.build_query(&aliases)
    }

    fn analyze(&mut self) -> Result<(), KestrelError> {
        if analyzer::query_has_subquery(&self.query) {
            return Err(PlanError::UnsupportedSubquery.into());
        }
        let select: Select = match self.query.body.as_ref() {
            SetExpr::Select(s) => (**s).clone(),
            SetExpr::SetOperation { .. } => {
                return Err(PlanError::Unsupported("set operations".to_string()).into())
            }
            other => {
                return Err(KestrelError::Parse(format!(
                    "expected a plain select, got: {}",
                    other
                )))
            }
        };

        let mut root = scan_table_exprs(self.router, &self.database, &select.from)?;
        let scope = root.referred_aliases();

        if let Some(where_expr) = &select.selection {
            let (joins, filters) = analyzer::parse_where_or_join(where_expr, &scope)?;
            root.push_filter(filters, self.router)?;
            root.push_equal_cmpr(joins)?;
        }
        let mut root = root.calc_route(self.router)?;

        // A single-route merge ships the statement wholesale; no
        // post-processing is needed.
        if let SelectNode::Merge(m) = &mut root {
            if m.route_len == 1 {
                m.graft(self.query.clone())?;
                self.root = Some(root);
                return Ok(());
            }
        }

        root.push_misc(&self.query.locks);

        let (fields, agg_push) = analyzer::parse_select_exprs(&select.projection, &scope)?;
        let (is_merge_root, tables) = match &root {
            SelectNode::Merge(m) => (true, m.tables.clone()),
            SelectNode::Join(_) => (false, Default::default()),
        };
        let groups = analyzer::check_group_by(&select.group_by, &fields, is_merge_root, &tables)?;
        let groups = analyzer::check_distinct(
            select.distinct.as_ref(),
            groups,
            &fields,
            is_merge_root,
            &tables,
        )?;

        root.push_select_exprs(fields, groups, &select, &self.query.order_by, agg_push)?;

        if let Some(having) = &select.having {
            let havings = analyzer::parse_having(having, &scope)?;
            root.push_having(havings)?;
        }

        root.push_order_by(&self.query.order_by)?;

        if self.query.limit.is_some() || self.query.offset.is_some() {
            root.push_limit(self.query.limit.as_ref(), self.query.offset.as_ref())?;
        }

        root.re_order(0);
        self.root = Some(root);
        Ok(())
    }

    pub fn plan_type(&self) -> PlanType {
        self.typ
    }

    /// Memory heuristic used by the plan cache.
    pub fn size(&self) -> usize {
        self.raw_query.len()
    }

    pub fn root(&self) -> Option<&SelectNode> {
        self.root.as_ref()
    }

    pub fn children(&self) -> Option<&PlanTree> {
        self.root.as_ref().map(|r| r.children())
    }

    /// The rendered per-backend queries.
    pub fn querys(&self) -> Vec<QueryTuple> {
        self.root.as_ref().map(|r| r.get_query()).unwrap_or_default()
    }

    /// The explain document.
    pub fn json(&self) -> String {
        let root = match &self.root {
            Some(r) => r,
            None => return "{}".to_string(),
        };

        let project = root
            .fields()
            .iter()
            .map(|t| t.label().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let join = root.as_join().map(|j| {
            let strategy = match j.strategy() {
                JoinStrategy::Cartesian => "Cartesian Join",
                JoinStrategy::SortMerge => "Sort Merge Join",
                JoinStrategy::NestedLoop => "Nested Loop Join",
            };
            let typ = if j.is_left_join() {
                "LEFT JOIN"
            } else if j.strategy() == JoinStrategy::Cartesian {
                "CROSS JOIN"
            } else {
                "INNER JOIN"
            };
            ExplainJoin {
                typ: typ.to_string(),
                strategy: strategy.to_string(),
            }
        });

        let mut aggregate = Vec::new();
        let mut hash_group_by = Vec::new();
        let mut gather_merge = Vec::new();
        let mut limit = None;
        for sub in root.children().plans() {
            match sub {
                ChildPlan::Aggregate(plan) => {
                    aggregate.extend(plan.normal_aggrs().iter().map(|a| a.field.clone()));
                    hash_group_by.extend(plan.group_aggrs().iter().map(|a| a.field.clone()));
                }
                ChildPlan::OrderBy(plan) => {
                    gather_merge.extend(plan.order_bys().iter().map(|o| o.label()));
                }
                ChildPlan::Limit(plan) => {
                    limit = Some(ExplainLimit {
                        offset: plan.offset(),
                        limit: plan.limit(),
                    });
                }
            }
        }

        let explain = Explain {
            raw_query: self.raw_query.clone(),
            project,
            partitions: root.get_query(),
            join,
            aggregate,
            gather_merge,
            hash_group_by,
            limit,
        };
        serde_json::to_string_pretty(&explain).unwrap_or_else(|e| e.to_string())
    }
}
