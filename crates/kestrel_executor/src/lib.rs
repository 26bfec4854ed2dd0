pub mod aggregation;

pub use aggregation::{
    get_results, new_agg_eval_ctxs, new_aggregations, AggEvaluateContext, Aggregation,
};
