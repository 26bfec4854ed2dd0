//! Expression analysis: WHERE/ON splitting into filter and join tuples,
//! shard-key literal extraction, select-list classification, and the
//! GROUP BY / DISTINCT checks.
//!
//! Conjuncts are flattened CNF-style before classification, so
//! `a = 1 AND t1.x = t2.y AND b IN (2, 3)` splits into one join tuple and
//! two filter tuples.

use std::collections::BTreeMap;

use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, Query,
    SelectItem, SetExpr, TableFactor, Value,
};

use kestrel_common::error::{KestrelError, PlanError};
use kestrel_router::{KeyValue, ShardType};

use crate::table_info::TableInfo;
use crate::tuples::{AggPush, AggrInfo, AggrType, ColumnRef, FilterTuple, GroupTuple, JoinTuple, SelectTuple};

/// Pre-order walk over an expression tree.
pub fn visit_expr(expr: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => visit_expr(expr, f),
        Expr::IsNull(e) | Expr::IsNotNull(e) | Expr::IsTrue(e) | Expr::IsFalse(e) => {
            visit_expr(e, f)
        }
        Expr::Between { expr, low, high, .. } => {
            visit_expr(expr, f);
            visit_expr(low, f);
            visit_expr(high, f);
        }
        Expr::InList { expr, list, .. } => {
            visit_expr(expr, f);
            for e in list {
                visit_expr(e, f);
            }
        }
        Expr::InSubquery { expr, .. } => visit_expr(expr, f),
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            visit_expr(expr, f);
            visit_expr(pattern, f);
        }
        Expr::Cast { expr, .. } => visit_expr(expr, f),
        Expr::Tuple(items) => {
            for e in items {
                visit_expr(e, f);
            }
        }
        Expr::Function(func) => {
            for arg in &func.args {
                if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } = arg
                {
                    visit_expr(e, f);
                }
            }
        }
        _ => {}
    }
}

/// Pre-order mutable walk; `f` may replace the node in place.
pub fn visit_expr_mut(expr: &mut Expr, f: &mut dyn FnMut(&mut Expr)) {
    f(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            visit_expr_mut(left, f);
            visit_expr_mut(right, f);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => visit_expr_mut(expr, f),
        Expr::IsNull(e) | Expr::IsNotNull(e) | Expr::IsTrue(e) | Expr::IsFalse(e) => {
            visit_expr_mut(e, f)
        }
        Expr::Between { expr, low, high, .. } => {
            visit_expr_mut(expr, f);
            visit_expr_mut(low, f);
            visit_expr_mut(high, f);
        }
        Expr::InList { expr, list, .. } => {
            visit_expr_mut(expr, f);
            for e in list {
                visit_expr_mut(e, f);
            }
        }
        Expr::InSubquery { expr, .. } => visit_expr_mut(expr, f),
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            visit_expr_mut(expr, f);
            visit_expr_mut(pattern, f);
        }
        Expr::Cast { expr, .. } => visit_expr_mut(expr, f),
        Expr::Tuple(items) => {
            for e in items {
                visit_expr_mut(e, f);
            }
        }
        Expr::Function(func) => {
            for arg in &mut func.args {
                if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } = arg
                {
                    visit_expr_mut(e, f);
                }
            }
        }
        _ => {}
    }
}

pub fn expr_has_subquery(expr: &Expr) -> bool {
    let mut found = false;
    visit_expr(expr, &mut |e| {
        if matches!(
            e,
            Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. }
        ) {
            found = true;
        }
    });
    found
}

/// Detect subqueries anywhere in a SELECT: expressions, derived tables,
/// CTEs. Runs before any router call.
pub fn query_has_subquery(query: &Query) -> bool {
    if query.with.is_some() {
        return true;
    }
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return false,
    };
    for twj in &select.from {
        if table_factor_has_subquery(&twj.relation) {
            return true;
        }
        for join in &twj.joins {
            if table_factor_has_subquery(&join.relation) {
                return true;
            }
        }
    }
    let mut exprs: Vec<&Expr> = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                exprs.push(e)
            }
            _ => {}
        }
    }
    if let Some(e) = &select.selection {
        exprs.push(e);
    }
    if let Some(e) = &select.having {
        exprs.push(e);
    }
    if let GroupByExpr::Expressions(group) = &select.group_by {
        exprs.extend(group.iter());
    }
    for ob in &query.order_by {
        exprs.push(&ob.expr);
    }
    exprs.into_iter().any(expr_has_subquery)
}

fn table_factor_has_subquery(factor: &TableFactor) -> bool {
    match factor {
        TableFactor::Derived { .. } => true,
        TableFactor::NestedJoin { table_with_joins, .. } => {
            table_factor_has_subquery(&table_with_joins.relation)
                || table_with_joins
                    .joins
                    .iter()
                    .any(|j| table_factor_has_subquery(&j.relation))
        }
        _ => false,
    }
}

/// Interpret an expression as a column reference, when it is one.
pub fn as_column_ref(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(id) => Some(ColumnRef {
            table: String::new(),
            column: id.value.clone(),
        }),
        Expr::CompoundIdentifier(ids) if ids.len() >= 2 => Some(ColumnRef {
            table: ids[ids.len() - 2].value.clone(),
            column: ids[ids.len() - 1].value.clone(),
        }),
        _ => None,
    }
}

pub fn column_refs(expr: &Expr) -> Vec<ColumnRef> {
    let mut refs = Vec::new();
    visit_expr(expr, &mut |e| match e {
        Expr::Identifier(_) => {
            if let Some(c) = as_column_ref(e) {
                refs.push(c);
            }
        }
        Expr::CompoundIdentifier(_) => {
            if let Some(c) = as_column_ref(e) {
                refs.push(c);
            }
        }
        _ => {}
    });
    refs
}

/// Distinct table qualifiers referenced by an expression, in first-seen order.
pub fn refer_tables_of(expr: &Expr) -> Vec<String> {
    let mut tables = Vec::new();
    for c in column_refs(expr) {
        if !c.table.is_empty() && !tables.contains(&c.table) {
            tables.push(c.table);
        }
    }
    tables
}

pub fn contains_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    visit_expr(expr, &mut |e| {
        if let Expr::Function(f) = e {
            if let Some(name) = f.name.0.last() {
                if AggrType::from_name(&name.value).is_some() {
                    found = true;
                }
            }
        }
    });
    found
}

/// Stable structural identity for filter de-duplication.
pub fn canonical(expr: &Expr) -> String {
    expr.to_string()
}

/// Flatten nested ANDs into a conjunction list, unwrapping parentheses.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        Expr::Nested(inner) => split_conjuncts(inner),
        other => vec![other.clone()],
    }
}

/// A literal usable as a shard-key equality value.
pub fn literal_key_value(expr: &Expr) -> Option<KeyValue> {
    match expr {
        Expr::Value(Value::Number(n, _)) => {
            if let Ok(i) = n.parse::<i64>() {
                Some(KeyValue::Int(i))
            } else {
                n.parse::<u64>().ok().map(KeyValue::Uint)
            }
        }
        Expr::Value(Value::SingleQuotedString(s)) => Some(KeyValue::Text(s.clone())),
        _ => None,
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Gt
            | BinaryOperator::Lt
            | BinaryOperator::GtEq
            | BinaryOperator::LtEq
    )
}

/// Split a WHERE (or ON) expression into join tuples and filter tuples.
/// Every table qualifier must resolve within `scope`.
pub fn parse_where_or_join(
    expr: &Expr,
    scope: &[String],
) -> Result<(Vec<JoinTuple>, Vec<FilterTuple>), KestrelError> {
    let mut joins = Vec::new();
    let mut filters = Vec::new();
    for conjunct in split_conjuncts(expr) {
        check_scope(&conjunct, scope)?;
        if let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = &conjunct
        {
            if let (Some(l), Some(r)) = (as_column_ref(left), as_column_ref(right)) {
                if !l.table.is_empty() && !r.table.is_empty() && l.table != r.table {
                    joins.push(JoinTuple {
                        expr: conjunct,
                        left: l,
                        right: r,
                    });
                    continue;
                }
            }
        }
        filters.push(filter_tuple(conjunct));
    }
    Ok((joins, filters))
}

fn filter_tuple(conjunct: Expr) -> FilterTuple {
    let refer_tables = refer_tables_of(&conjunct);
    let (col, vals) = match &conjunct {
        Expr::BinaryOp { left, op, right } if is_comparison(op) => {
            let shape = match (as_column_ref(left), as_column_ref(right)) {
                (Some(c), None) => literal_key_value(right).map(|v| (c, v)),
                (None, Some(c)) => literal_key_value(left).map(|v| (c, v)),
                _ => None,
            };
            match shape {
                Some((c, v)) if *op == BinaryOperator::Eq => (Some(c), vec![v]),
                Some((c, _)) => (Some(c), vec![]),
                None => (None, vec![]),
            }
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => match as_column_ref(expr) {
            Some(c) => {
                let vals: Option<Vec<KeyValue>> = list.iter().map(literal_key_value).collect();
                match vals {
                    Some(vals) => (Some(c), vals),
                    None => (Some(c), vec![]),
                }
            }
            None => (None, vec![]),
        },
        _ => (None, vec![]),
    };
    FilterTuple {
        expr: conjunct,
        refer_tables,
        col,
        vals,
    }
}

/// Split a HAVING expression into filter tuples; aggregates are rejected
/// because the proxy has no post-aggregation filter operator.
pub fn parse_having(expr: &Expr, scope: &[String]) -> Result<Vec<FilterTuple>, KestrelError> {
    let mut havings = Vec::new();
    for conjunct in split_conjuncts(expr) {
        if contains_aggregate(&conjunct) {
            return Err(PlanError::UnsupportedHaving(canonical(&conjunct)).into());
        }
        check_scope(&conjunct, scope)?;
        havings.push(filter_tuple(conjunct));
    }
    Ok(havings)
}

/// Every qualified column reference must resolve to a table in scope.
fn check_scope(expr: &Expr, scope: &[String]) -> Result<(), KestrelError> {
    for col in column_refs(expr) {
        if !col.table.is_empty() && !scope.contains(&col.table) {
            return Err(PlanError::ColumnUnknown(col.label()).into());
        }
    }
    Ok(())
}

/// Classify every projected expression and derive the aggregate pushdown
/// class for the whole projection.
pub fn parse_select_exprs(
    projection: &[SelectItem],
    scope: &[String],
) -> Result<(Vec<SelectTuple>, AggPush), KestrelError> {
    let mut fields = Vec::with_capacity(projection.len());
    let mut has_agg = false;
    let mut has_distinct_agg = false;
    let mut has_star = false;

    for item in projection {
        let tuple = match item {
            SelectItem::Wildcard(_) => {
                has_star = true;
                SelectTuple {
                    item: item.clone(),
                    field: "*".to_string(),
                    alias: String::new(),
                    table: String::new(),
                    refer_tables: scope.to_vec(),
                    agg: None,
                    is_star: true,
                }
            }
            SelectItem::QualifiedWildcard(name, _) => {
                let table = name
                    .0
                    .last()
                    .map(|i| i.value.clone())
                    .unwrap_or_default();
                if !scope.contains(&table) {
                    return Err(PlanError::ColumnUnknown(format!("{}.*", table)).into());
                }
                has_star = true;
                SelectTuple {
                    item: item.clone(),
                    field: format!("{}.*", table),
                    alias: String::new(),
                    table: table.clone(),
                    refer_tables: vec![table],
                    agg: None,
                    is_star: true,
                }
            }
            SelectItem::UnnamedExpr(expr) => select_tuple(item, expr, "", scope)?,
            SelectItem::ExprWithAlias { expr, alias } => {
                select_tuple(item, expr, &alias.value, scope)?
            }
        };
        if let Some(agg) = &tuple.agg {
            has_agg = true;
            if agg.distinct {
                has_distinct_agg = true;
            }
        }
        fields.push(tuple);
    }

    if has_star && has_agg {
        return Err(PlanError::UnsupportedAggregate("mixed with star projection".into()).into());
    }

    let agg_push = if !has_agg {
        AggPush::NoAgg
    } else if has_distinct_agg {
        AggPush::CannotPush
    } else {
        AggPush::CanPush
    };
    Ok((fields, agg_push))
}

fn select_tuple(
    item: &SelectItem,
    expr: &Expr,
    alias: &str,
    scope: &[String],
) -> Result<SelectTuple, KestrelError> {
    check_scope(expr, scope)?;

    if let Expr::Function(func) = expr {
        if let Some(typ) = func
            .name
            .0
            .last()
            .and_then(|n| AggrType::from_name(&n.value))
        {
            if func.args.len() != 1 {
                return Err(PlanError::UnsupportedAggregate(canonical(expr)).into());
            }
            let arg = match &func.args[0] {
                FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => None,
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                    if contains_aggregate(e) {
                        return Err(PlanError::UnsupportedAggregate(canonical(expr)).into());
                    }
                    Some(e.clone())
                }
                _ => return Err(PlanError::UnsupportedAggregate(canonical(expr)).into()),
            };
            let refer_tables = arg.as_ref().map(refer_tables_of).unwrap_or_default();
            return Ok(SelectTuple {
                item: item.clone(),
                field: canonical(expr),
                alias: alias.to_string(),
                table: String::new(),
                refer_tables,
                agg: Some(AggrInfo {
                    typ,
                    distinct: func.distinct,
                    arg,
                }),
                is_star: false,
            });
        }
    }

    if contains_aggregate(expr) {
        return Err(PlanError::UnsupportedAggregate(canonical(expr)).into());
    }

    let (field, table) = match as_column_ref(expr) {
        Some(c) => (c.column, c.table),
        None => (canonical(expr), String::new()),
    };
    Ok(SelectTuple {
        item: item.clone(),
        field,
        alias: alias.to_string(),
        table,
        refer_tables: refer_tables_of(expr),
        agg: None,
        is_star: false,
    })
}

fn find_field<'a>(fields: &'a [SelectTuple], col: &ColumnRef) -> Option<&'a SelectTuple> {
    fields.iter().find(|t| {
        if t.is_star {
            return t.table.is_empty() || col.table.is_empty() || t.table == col.table;
        }
        if !t.alias.is_empty() && t.alias == col.column && col.table.is_empty() {
            return true;
        }
        t.field == col.column && (col.table.is_empty() || t.table == col.table)
    })
}

/// Validate GROUP BY and return the proxy-side grouping keys. An empty
/// result means grouping is fully pushed to the shards.
pub fn check_group_by(
    group_by: &GroupByExpr,
    fields: &[SelectTuple],
    is_merge_root: bool,
    tables: &BTreeMap<String, TableInfo>,
) -> Result<Vec<GroupTuple>, KestrelError> {
    let exprs = match group_by {
        GroupByExpr::Expressions(v) => v,
        GroupByExpr::All => {
            return Err(PlanError::UnsupportedGroupBy("GROUP BY ALL".into()).into())
        }
    };
    if exprs.is_empty() {
        return Ok(Vec::new());
    }
    if !is_merge_root {
        return Err(PlanError::UnsupportedGroupBy("in cross-shard join".into()).into());
    }

    let mut groups = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let col = as_column_ref(expr)
            .ok_or_else(|| PlanError::UnsupportedGroupBy(canonical(expr)))?;
        if !col.table.is_empty() && !tables.contains_key(&col.table) {
            return Err(PlanError::ColumnUnknown(col.label()).into());
        }
        let in_select = find_field(fields, &col).is_some();
        groups.push(GroupTuple {
            field: col.column,
            table: col.table,
            in_select,
        });
    }

    // Grouping on a shard key keeps every group on one shard; the whole
    // GROUP BY then executes on the backends.
    let pushable = groups.iter().any(|g| {
        let candidates: Vec<&TableInfo> = if g.table.is_empty() {
            tables.values().collect()
        } else {
            tables.get(&g.table).into_iter().collect()
        };
        candidates
            .iter()
            .any(|tb| tb.shard_type == ShardType::Hash && tb.shard_key == g.field)
    });
    if pushable {
        return Ok(Vec::new());
    }
    Ok(groups)
}

/// Convert `SELECT DISTINCT` into grouping over the projected expressions,
/// or keep the explicit GROUP BY when one exists.
pub fn check_distinct(
    distinct: Option<&Distinct>,
    groups: Vec<GroupTuple>,
    fields: &[SelectTuple],
    is_merge_root: bool,
    tables: &BTreeMap<String, TableInfo>,
) -> Result<Vec<GroupTuple>, KestrelError> {
    let Some(distinct) = distinct else {
        return Ok(groups);
    };
    if matches!(distinct, Distinct::On(_)) {
        return Err(PlanError::UnsupportedDistinct("DISTINCT ON".into()).into());
    }
    // Grouped output is already distinct per key.
    if !groups.is_empty() {
        return Ok(groups);
    }
    if !is_merge_root {
        return Err(PlanError::UnsupportedDistinct("in cross-shard join".into()).into());
    }

    let mut out = Vec::with_capacity(fields.len());
    for tuple in fields {
        if tuple.is_star {
            return Err(PlanError::UnsupportedDistinct("star projection".into()).into());
        }
        if tuple.agg.is_some() {
            return Err(PlanError::UnsupportedDistinct("aggregate projection".into()).into());
        }
        out.push(GroupTuple {
            field: tuple.field.clone(),
            table: tuple.table.clone(),
            in_select: true,
        });
    }

    // DISTINCT touching the shard key de-duplicates correctly shard-local;
    // the distinct flag already sits in the shard-bound AST.
    let pushable = out.iter().any(|g| {
        let candidates: Vec<&TableInfo> = if g.table.is_empty() {
            tables.values().collect()
        } else {
            tables.get(&g.table).into_iter().collect()
        };
        candidates
            .iter()
            .any(|tb| tb.shard_type == ShardType::Hash && tb.shard_key == g.field)
    });
    if pushable {
        return Ok(Vec::new());
    }
    Ok(out)
}

/// Build a column-reference expression.
pub fn column_expr(col: &ColumnRef) -> Expr {
    if col.table.is_empty() {
        Expr::Identifier(Ident::new(col.column.clone()))
    } else {
        Expr::CompoundIdentifier(vec![
            Ident::new(col.table.clone()),
            Ident::new(col.column.clone()),
        ])
    }
}

/// AND-combine an optional existing predicate with a new conjunct.
pub fn and_expr(existing: Option<Expr>, extra: Expr) -> Expr {
    match existing {
        None => extra,
        Some(prev) => Expr::BinaryOp {
            left: Box::new(prev),
            op: BinaryOperator::And,
            right: Box::new(extra),
        },
    }
}
