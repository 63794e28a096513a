//! Pre-grouping prefilters. Each pass turns a post-grouping condition into
//! a WHERE predicate over physical rows that accepts every row of every
//! call the exact condition accepts. Rows of the part that does not
//! populate a column see it as NULL, so every prefilter lets NULL through.

pub mod like;
pub mod time_range;

use log::debug;

use super::ast::Expr;
use super::columns::{CallPart, ColumnRegistry, FieldDescriptor, SqlCtx};
use super::compiler::expandable_comparison_field;
use super::expand::ExpansionPlanner;
use super::params::ParamBuilder;
use crate::config::CompilerConfig;

pub struct PrefilterCtx<'a> {
    pub sql: &'a SqlCtx<'a>,
    pub config: &'a CompilerConfig,
    pub expansion: &'a ExpansionPlanner,
}

/// WHERE predicate implied by `expr`, if any pass applies.
pub fn prefilter(expr: &Expr, cx: &PrefilterCtx, pb: &mut ParamBuilder) -> Option<String> {
    match expr {
        Expr::And(items) => {
            let parts: Vec<String> = items.iter().filter_map(|i| prefilter(i, cx, pb)).collect();
            join_parts(parts, "AND")
        }
        Expr::Or(items) => {
            if spans_both_parts(expr) {
                debug!("skipping prefilter for $or spanning start and end parts");
                return None;
            }
            // Every branch must be bounded, otherwise an unbounded branch could match anything.
            let mut probe = pb.clone();
            let parts = items.iter().map(|i| prefilter(i, cx, &mut probe)).collect::<Option<Vec<_>>>()?;
            *pb = probe;
            join_parts(parts, "OR")
        }
        Expr::Not(inner) => time_range::id_bound(inner, true, cx, pb),
        _ => leaf(expr, cx, pb),
    }
}

fn leaf(expr: &Expr, cx: &PrefilterCtx, pb: &mut ParamBuilder) -> Option<String> {
    let registry = ColumnRegistry::calls();
    let descriptors: Vec<FieldDescriptor> = expr.field_names().into_iter().filter_map(|n| registry.resolve(n).ok()).collect();
    if descriptors.iter().any(FieldDescriptor::needs_feedback_join) {
        return None;
    }
    if let Some(name) = expandable_comparison_field(expr)
        && let Some(chain) = cx.expansion.chain_for(name)
    {
        // Compared through a reference; the dump itself never holds the value.
        return cx.expansion.guard(&chain, cx.sql);
    }
    time_range::id_bound(expr, false, cx, pb).or_else(|| like::like_prefilter(expr, cx.sql, pb))
}

fn join_parts(parts: Vec<String>, joiner: &str) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(format!("({})", parts.join(&format!(" {} ", joiner)))),
    }
}

fn spans_both_parts(expr: &Expr) -> bool {
    let registry = ColumnRegistry::calls();
    let parts: Vec<CallPart> = expr.field_names().into_iter().filter_map(|n| registry.resolve(n).ok()).map(|d| d.part()).collect();
    parts.contains(&CallPart::Start) && parts.contains(&CallPart::End)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::emitter::dialect::ClickHouseDialect;

    fn run(expr: &Expr, expand: &[String]) -> (Option<String>, ParamBuilder) {
        let sql = SqlCtx { calls: "calls_merged", feedback: "feedback", dialect: &ClickHouseDialect };
        let config = CompilerConfig::default();
        let expansion = ExpansionPlanner::new("p", expand, "object_versions", "table_rows");
        let cx = PrefilterCtx { sql: &sql, config: &config, expansion: &expansion };
        let mut pb = ParamBuilder::new();
        let out = prefilter(expr, &cx, &mut pb);
        (out, pb)
    }

    #[test]
    fn and_keeps_the_bounded_children() {
        let expr = Expr::and(vec![
            Expr::eq(Expr::field("inputs.model"), Expr::lit("gpt")),
            Expr::eq(Expr::field("op_name"), Expr::lit("x")),
        ]);
        let (out, _) = run(&expr, &[]);
        assert_eq!(out.unwrap(), "(calls_merged.inputs_dump LIKE {pb_0:String} OR calls_merged.inputs_dump IS NULL)");
    }

    #[test]
    fn or_needs_every_branch_bounded() {
        let bounded = Expr::eq(Expr::field("inputs.a"), Expr::lit("x"));
        let unbounded = Expr::eq(Expr::field("op_name"), Expr::lit("y"));
        let (out, pb) = run(&Expr::or(vec![bounded.clone(), unbounded]), &[]);
        assert!(out.is_none());
        assert!(pb.is_empty());

        let (out, _) = run(&Expr::or(vec![bounded, Expr::eq(Expr::field("inputs.b"), Expr::lit("z"))]), &[]);
        assert!(out.unwrap().contains(" OR calls_merged.inputs_dump IS NULL) OR ("));
    }

    #[test]
    fn or_across_parts_is_skipped() {
        let expr = Expr::or(vec![
            Expr::eq(Expr::field("inputs.a"), Expr::lit("x")),
            Expr::eq(Expr::field("output.b"), Expr::lit("y")),
        ]);
        assert!(run(&expr, &[]).0.is_none());
    }

    #[test]
    fn feedback_conditions_are_never_prefiltered() {
        let expr = Expr::eq(Expr::field("feedback.[wandb.reaction.1].payload.emoji"), Expr::lit("x"));
        assert!(run(&expr, &[]).0.is_none());
    }

    #[test]
    fn expanded_comparisons_use_the_reference_guard() {
        let expr = Expr::eq(Expr::field("inputs.model.name"), Expr::lit("gpt"));
        let (out, pb) = run(&expr, &["inputs.model".to_string()]);
        assert_eq!(out.unwrap(), "(length(calls_merged.input_refs) > 0 OR calls_merged.started_at IS NULL)");
        assert!(pb.is_empty());
    }
}
