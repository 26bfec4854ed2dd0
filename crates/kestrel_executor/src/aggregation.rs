//! Per-aggregate state machine driven during result streaming.
//!
//! Arithmetic faults latch into the context instead of propagating: one
//! bad row must not abort a long-running aggregation, so a latched
//! aggregate reports a typed zero.

use std::collections::HashSet;

use rust_decimal::Decimal;

use kestrel_common::types::{Field, FieldType, DECIMAL_LONGLONG_DIGITS, DOUBLE_DIGITS};
use kestrel_common::value::Value;
use kestrel_planner::tuples::{AggrType, Aggregator};

/// One aggregate operator over the gathered stream.
#[derive(Debug, Clone)]
pub struct Aggregation {
    distinct: bool,
    index: usize,
    typ: AggrType,
    field_type: FieldType,
    is_push_down: bool,
    /// Digits kept in a DECIMAL/float result; -1 when not fixed.
    prec: i32,
}

/// Intermediate state for one aggregate within one group.
#[derive(Debug)]
pub struct AggEvaluateContext {
    count: i64,
    val: Value,
    has_err: bool,
    /// Raw encodings of values already seen, when `distinct`.
    buffer: HashSet<Vec<u8>>,
}

impl AggEvaluateContext {
    pub fn value(&self) -> &Value {
        &self.val
    }

    pub fn count(&self) -> i64 {
        self.count
    }
}

impl Aggregation {
    fn new(plan: &Aggregator, is_push_down: bool) -> Aggregation {
        Aggregation {
            distinct: plan.distinct,
            index: plan.index,
            typ: plan.typ,
            field_type: FieldType::Text,
            is_push_down,
            prec: -1,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn typ(&self) -> AggrType {
        self.typ
    }

    /// Rewrite the result-field metadata so the header announced to the
    /// client matches what the aggregate will produce.
    pub fn fix_field(&mut self, field: &mut Field) {
        if !self.is_push_down || self.typ == AggrType::Avg {
            match self.typ {
                AggrType::Min | AggrType::Max | AggrType::GroupBy => {}
                AggrType::Count => {
                    field.decimals = 0;
                    field.column_length = 21;
                    field.typ = FieldType::Int64;
                }
                AggrType::Avg => {
                    field.column_length += 4;
                    let mut decimals = field.decimals.saturating_add(4);
                    if field.typ.is_integral() || field.typ == FieldType::Decimal {
                        if field.typ.is_unsigned() {
                            field.column_length += 1;
                        }
                        if field.decimals == 0 {
                            field.column_length += 1;
                        }
                        if decimals > 30 {
                            decimals = 30;
                        }
                        field.typ = FieldType::Decimal;
                    } else if field.typ.is_float() {
                        if decimals > 31 {
                            decimals = 31;
                        }
                        field.typ = FieldType::Float64;
                    } else if field.typ.is_temporal() {
                        field.typ = FieldType::Decimal;
                    } else {
                        decimals = 31;
                        field.typ = FieldType::Float64;
                    }
                    field.decimals = decimals;
                }
                AggrType::Sum => {
                    if field.typ.is_integral() || field.typ == FieldType::Decimal {
                        field.column_length += DECIMAL_LONGLONG_DIGITS;
                        if field.typ.is_unsigned() {
                            field.column_length += 1;
                        }
                        field.typ = FieldType::Decimal;
                    } else if field.typ.is_float() {
                        if field.decimals < 31 {
                            field.column_length += DOUBLE_DIGITS + 2;
                        } else {
                            field.column_length = 23;
                        }
                        field.typ = FieldType::Float64;
                    } else if field.typ.is_temporal() {
                        field.typ = FieldType::Decimal;
                    } else {
                        field.decimals = 31;
                        field.column_length = 23;
                        field.typ = FieldType::Float64;
                    }
                }
            }
        }

        if field.typ == FieldType::Decimal || (field.typ.is_float() && field.decimals < 31) {
            self.prec = field.decimals as i32;
        }
        self.field_type = field.typ;
    }

    /// Seed the per-group state from the group's first row, when there is
    /// one.
    pub fn init_eval_ctx(&self, row: Option<&[Value]>) -> AggEvaluateContext {
        let val = row
            .and_then(|r| r.get(self.index).cloned())
            .unwrap_or(Value::Null);
        let mut ctx = AggEvaluateContext {
            count: 0,
            val: val.clone(),
            has_err: false,
            buffer: HashSet::new(),
        };
        if !self.is_push_down && !val.is_null() {
            ctx.count = 1;
            if self.distinct {
                ctx.buffer.insert(val.raw());
            }
        }
        ctx
    }

    /// Fold one row into the state. NULLs and distinct-duplicates are
    /// skipped; arithmetic faults latch.
    pub fn update(&self, row: &[Value], ctx: &mut AggEvaluateContext) {
        if ctx.has_err {
            return;
        }
        let v = match row.get(self.index) {
            Some(v) => v.clone(),
            None => {
                ctx.has_err = true;
                return;
            }
        };
        if v.is_null() {
            return;
        }
        if !self.is_push_down && self.distinct && !ctx.buffer.insert(v.raw()) {
            return;
        }

        let mut faulted = false;
        match self.typ {
            AggrType::Min => {
                let acc = std::mem::replace(&mut ctx.val, Value::Null);
                ctx.val = acc.min(v);
            }
            AggrType::Max => {
                let acc = std::mem::replace(&mut ctx.val, Value::Null);
                ctx.val = acc.max(v);
            }
            AggrType::Sum => {
                ctx.count += 1;
                match Value::nullsafe_add(&ctx.val, &v, self.field_type) {
                    Ok(sum) => ctx.val = sum,
                    Err(_) => faulted = true,
                }
            }
            AggrType::Count => {
                if self.is_push_down {
                    // Partial counts arrive from the shards; merge by adding.
                    match Value::nullsafe_add(&ctx.val, &v, self.field_type) {
                        Ok(sum) => ctx.val = sum,
                        Err(_) => faulted = true,
                    }
                } else {
                    ctx.count += 1;
                }
            }
            AggrType::Avg => {
                if !self.is_push_down {
                    ctx.count += 1;
                    match Value::nullsafe_add(&ctx.val, &v, self.field_type) {
                        Ok(sum) => ctx.val = sum,
                        Err(_) => faulted = true,
                    }
                }
                // Push-down AVG is reconstructed from its SUM and COUNT
                // siblings in get_results.
            }
            AggrType::GroupBy => {}
        }
        if faulted {
            ctx.has_err = true;
        }
    }

    /// Final value of this aggregate. A latched context produces a typed
    /// zero rather than poisoning the result stream.
    pub fn get_result(&self, ctx: &AggEvaluateContext) -> Value {
        if ctx.has_err {
            return typed_zero(self.field_type);
        }
        let result = match self.typ {
            AggrType::Avg => {
                if self.is_push_down {
                    Ok(ctx.val.clone())
                } else {
                    Value::nullsafe_div(
                        &ctx.val,
                        &Value::Int64(ctx.count),
                        self.field_type,
                        self.prec,
                    )
                }
            }
            AggrType::Min | AggrType::Max | AggrType::GroupBy => Ok(ctx.val.clone()),
            AggrType::Sum => Value::cast(ctx.val.clone(), self.field_type),
            AggrType::Count => {
                if self.is_push_down {
                    Ok(ctx.val.clone())
                } else {
                    Ok(Value::Int64(ctx.count))
                }
            }
        };
        result.unwrap_or_else(|_| typed_zero(self.field_type))
    }
}

fn typed_zero(typ: FieldType) -> Value {
    if typ == FieldType::Decimal || typ.is_temporal() {
        Value::Decimal(Decimal::ZERO)
    } else if typ.is_float() {
        Value::Float64(0.0)
    } else if typ.is_unsigned() {
        Value::UInt64(0)
    } else if typ.is_integral() {
        Value::Int64(0)
    } else {
        Value::Text("0".to_string())
    }
}

/// Build the operators for a plan's aggregator list and fix the announced
/// field metadata in place.
pub fn new_aggregations(
    plans: &[Aggregator],
    is_push_down: bool,
    fields: &mut [Field],
) -> Vec<Aggregation> {
    plans
        .iter()
        .map(|plan| {
            let mut aggr = Aggregation::new(plan, is_push_down);
            aggr.fix_field(&mut fields[aggr.index]);
            aggr
        })
        .collect()
}

/// Fresh per-group contexts, seeded from the group's first row.
pub fn new_agg_eval_ctxs(aggrs: &[Aggregation], row: Option<&[Value]>) -> Vec<AggEvaluateContext> {
    aggrs.iter().map(|a| a.init_eval_ctx(row)).collect()
}

/// Combine the final values into `row` once every input row has been
/// folded. A push-down AVG consumes its SUM and COUNT sibling slots: the
/// quotient lands in the AVG's column and the count column's index is
/// returned for the caller to delete from the output row.
pub fn get_results(
    aggrs: &[Aggregation],
    ctxs: &[AggEvaluateContext],
    row: &mut [Value],
) -> Vec<usize> {
    debug_assert_eq!(aggrs.len(), ctxs.len());
    let mut de_idxs = Vec::new();
    let mut i = 0;
    while i < aggrs.len() {
        let aggr = &aggrs[i];
        if aggr.is_push_down && aggr.typ == AggrType::Avg {
            let quotient = Value::nullsafe_div(
                &ctxs[i + 1].val,
                &ctxs[i + 2].val,
                aggr.field_type,
                aggr.prec,
            )
            .unwrap_or_else(|_| typed_zero(aggr.field_type));
            row[aggr.index] = quotient;
            de_idxs.push(aggr.index + 1);
            i += 2;
        } else {
            row[aggr.index] = aggr.get_result(&ctxs[i]);
        }
        i += 1;
    }
    de_idxs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn aggr(typ: AggrType, index: usize, distinct: bool) -> Aggregator {
        Aggregator {
            field: format!("{:?}", typ).to_lowercase(),
            index,
            typ,
            distinct,
        }
    }

    #[test]
    fn test_pushdown_count_merges_partials() {
        let plans = vec![aggr(AggrType::Count, 0, false)];
        let mut fields = vec![Field::new("COUNT(*)", FieldType::Int64, 21, 0)];
        let aggrs = new_aggregations(&plans, true, &mut fields);

        let rows = [
            vec![Value::Int64(100)],
            vec![Value::Int64(200)],
            vec![Value::Int64(50)],
            vec![Value::Int64(50)],
        ];
        let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&rows[0]));
        for row in &rows[1..] {
            aggrs[0].update(row, &mut ctxs[0]);
        }
        let mut out = rows[3].clone();
        let de_idxs = get_results(&aggrs, &ctxs, &mut out);
        assert!(de_idxs.is_empty());
        assert_eq!(out[0], Value::Int64(400));
    }

    #[test]
    fn test_pushdown_avg_reconstructs_quotient() {
        // AVG(a) ships as SUM(a), COUNT(a); the aggregator list carries
        // the AVG at the sum's column plus both siblings.
        let plans = vec![
            aggr(AggrType::Avg, 0, false),
            aggr(AggrType::Sum, 0, false),
            aggr(AggrType::Count, 1, false),
        ];
        let mut fields = vec![
            Field::new("avg(a)", FieldType::Int64, 11, 0),
            Field::new("count(a)", FieldType::Int64, 21, 0),
        ];
        let aggrs = new_aggregations(&plans, true, &mut fields);
        assert_eq!(fields[0].typ, FieldType::Decimal);
        assert_eq!(fields[0].decimals, 4);

        let rows = [
            vec![Value::Int64(10), Value::Int64(2)],
            vec![Value::Int64(20), Value::Int64(4)],
            vec![Value::Int64(0), Value::Int64(0)],
            vec![Value::Int64(30), Value::Int64(3)],
        ];
        let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&rows[0]));
        for row in &rows[1..] {
            for (aggr, ctx) in aggrs.iter().zip(ctxs.iter_mut()) {
                aggr.update(row, ctx);
            }
        }
        let mut out = vec![Value::Null, Value::Null];
        let de_idxs = get_results(&aggrs, &ctxs, &mut out);
        assert_eq!(de_idxs, vec![1]);
        // 60 / 9 at the promoted scale.
        assert_eq!(
            out[0],
            Value::Decimal(Decimal::from_str("6.6667").unwrap())
        );
    }

    #[test]
    fn test_distinct_update_is_idempotent() {
        let plans = vec![aggr(AggrType::Count, 0, true)];
        let mut fields = vec![Field::new("count(distinct a)", FieldType::Int64, 21, 0)];
        let aggrs = new_aggregations(&plans, false, &mut fields);

        let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&[Value::Int64(7)]));
        aggrs[0].update(&[Value::Int64(7)], &mut ctxs[0]);
        aggrs[0].update(&[Value::Int64(7)], &mut ctxs[0]);
        aggrs[0].update(&[Value::Int64(8)], &mut ctxs[0]);
        assert_eq!(aggrs[0].get_result(&ctxs[0]), Value::Int64(2));
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let plans = vec![
            aggr(AggrType::Min, 0, false),
            aggr(AggrType::Max, 1, false),
            aggr(AggrType::Sum, 2, false),
        ];
        let mut fields = vec![
            Field::new("min(a)", FieldType::Int64, 11, 0),
            Field::new("max(b)", FieldType::Int64, 11, 0),
            Field::new("sum(c)", FieldType::Int64, 11, 0),
        ];
        let aggrs = new_aggregations(&plans, false, &mut fields);

        let forward: Vec<Vec<Value>> = (1..=5)
            .map(|i| vec![Value::Int64(i), Value::Int64(i), Value::Int64(i)])
            .collect();
        let mut reversed = forward.clone();
        reversed.reverse();

        let run = |rows: &[Vec<Value>]| {
            let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&rows[0]));
            for row in &rows[1..] {
                for (aggr, ctx) in aggrs.iter().zip(ctxs.iter_mut()) {
                    aggr.update(row, ctx);
                }
            }
            let mut out = vec![Value::Null, Value::Null, Value::Null];
            get_results(&aggrs, &ctxs, &mut out);
            out
        };
        assert_eq!(run(&forward), run(&reversed));
    }

    #[test]
    fn test_null_rows_are_skipped() {
        let plans = vec![aggr(AggrType::Sum, 0, false)];
        let mut fields = vec![Field::new("sum(a)", FieldType::Int64, 11, 0)];
        let aggrs = new_aggregations(&plans, false, &mut fields);

        let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&[Value::Null]));
        assert_eq!(ctxs[0].count(), 0);
        aggrs[0].update(&[Value::Int64(3)], &mut ctxs[0]);
        aggrs[0].update(&[Value::Null], &mut ctxs[0]);
        aggrs[0].update(&[Value::Int64(4)], &mut ctxs[0]);
        assert_eq!(ctxs[0].count(), 2);
        assert_eq!(
            aggrs[0].get_result(&ctxs[0]),
            Value::Decimal(Decimal::from(7))
        );
    }

    #[test]
    fn test_arithmetic_fault_latches_to_typed_zero() {
        let plans = vec![aggr(AggrType::Sum, 0, false)];
        let mut fields = vec![Field::new("sum(a)", FieldType::Int64, 11, 0)];
        let aggrs = new_aggregations(&plans, false, &mut fields);

        let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&[Value::Int64(1)]));
        aggrs[0].update(&[Value::Text("not a number".to_string())], &mut ctxs[0]);
        // Latched: later good rows are ignored, the result is a typed zero.
        aggrs[0].update(&[Value::Int64(5)], &mut ctxs[0]);
        assert_eq!(
            aggrs[0].get_result(&ctxs[0]),
            Value::Decimal(Decimal::ZERO)
        );
    }

    #[test]
    fn test_non_pushdown_avg_accumulates() {
        let plans = vec![aggr(AggrType::Avg, 0, false)];
        let mut fields = vec![Field::new("avg(a)", FieldType::Int64, 11, 0)];
        let aggrs = new_aggregations(&plans, false, &mut fields);

        let mut ctxs = new_agg_eval_ctxs(&aggrs, Some(&[Value::Int64(1)]));
        for v in [2i64, 3, 4] {
            aggrs[0].update(&[Value::Int64(v)], &mut ctxs[0]);
        }
        assert_eq!(
            aggrs[0].get_result(&ctxs[0]),
            Value::Decimal(Decimal::from_str("2.5000").unwrap())
        );
    }

    #[test]
    fn test_fix_field_count() {
        let mut field = Field::new("COUNT(*)", FieldType::Text, 64, 3);
        let plans = vec![aggr(AggrType::Count, 0, false)];
        let mut fields = vec![field.clone()];
        new_aggregations(&plans, false, &mut fields);
        field = fields.remove(0);
        assert_eq!(field.typ, FieldType::Int64);
        assert_eq!(field.column_length, 21);
        assert_eq!(field.decimals, 0);
    }

    #[test]
    fn test_fix_field_sum_widens_integral_to_decimal() {
        let plans = vec![aggr(AggrType::Sum, 0, false)];
        let mut fields = vec![Field::new("sum(a)", FieldType::UInt64, 20, 0)];
        new_aggregations(&plans, false, &mut fields);
        assert_eq!(fields[0].typ, FieldType::Decimal);
        assert_eq!(fields[0].column_length, 20 + DECIMAL_LONGLONG_DIGITS + 1);
    }

    #[test]
    fn test_fix_field_avg_float_caps_decimals() {
        let plans = vec![aggr(AggrType::Avg, 0, false)];
        let mut fields = vec![Field::new("avg(a)", FieldType::Float64, 22, 30)];
        new_aggregations(&plans, false, &mut fields);
        assert_eq!(fields[0].typ, FieldType::Float64);
        assert_eq!(fields[0].decimals, 31);
        assert_eq!(fields[0].column_length, 26);
    }

    #[test]
    fn test_fix_field_min_preserves() {
        let plans = vec![aggr(AggrType::Min, 0, false)];
        let mut fields = vec![Field::new("min(a)", FieldType::Text, 64, 0)];
        new_aggregations(&plans, false, &mut fields);
        assert_eq!(fields[0].typ, FieldType::Text);
        assert_eq!(fields[0].column_length, 64);
    }

    #[test]
    fn test_pushdown_min_field_untouched() {
        let plans = vec![aggr(AggrType::Min, 0, false)];
        let mut fields = vec![Field::new("min(a)", FieldType::Int64, 11, 0)];
        new_aggregations(&plans, true, &mut fields);
        assert_eq!(fields[0].typ, FieldType::Int64);
        assert_eq!(fields[0].column_length, 11);
    }
}
