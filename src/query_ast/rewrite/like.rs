//! LIKE fast path for JSON-dump comparisons. A string value `v` extracted
//! from a dump appears in the raw dump text in its JSON-encoded form, so a
//! substring match on the raw column is a cheap superset of the exact check.

use log::debug;
use serde_json::Value;

use crate::query_ast::ast::Expr;
use crate::query_ast::columns::{ColumnRegistry, FieldDescriptor, SqlCtx};
use crate::query_ast::params::ParamBuilder;

pub fn like_prefilter(expr: &Expr, ctx: &SqlCtx, pb: &mut ParamBuilder) -> Option<String> {
    let (column, patterns, lowered) = match expr {
        Expr::Eq(l, r) => {
            let (field, value) = field_and_string(l, r).or_else(|| field_and_string(r, l))?;
            (raw_dump(field, ctx)?, vec![equality_pattern(value)], false)
        }
        Expr::In(l, list) => {
            let Expr::GetField(field) = l.as_ref() else { return None };
            let column = raw_dump(field, ctx)?;
            if list.is_empty() {
                return None;
            }
            let values = list.iter().map(eligible_string).collect::<Option<Vec<_>>>()?;
            (column, values.into_iter().map(equality_pattern).collect(), false)
        }
        Expr::Contains(c) => {
            let Expr::GetField(field) = c.input.as_ref() else { return None };
            let column = raw_dump(field, ctx)?;
            let needle = eligible_string(&c.substr)?;
            let mut pattern = contains_pattern(needle);
            if c.case_insensitive {
                pattern = pattern.to_ascii_lowercase();
            }
            (column, vec![pattern], c.case_insensitive)
        }
        _ => return None,
    };
    debug!("like prefilter on {} with {} pattern(s)", column, patterns.len());
    let haystack = if lowered { format!("lower({})", column) } else { column.clone() };
    let mut clauses: Vec<String> = patterns.into_iter().map(|p| format!("{} LIKE {}", haystack, pb.add(p))).collect();
    clauses.push(format!("{} IS NULL", column));
    Some(format!("({})", clauses.join(" OR ")))
}

fn field_and_string<'a>(field: &'a Expr, value: &'a Expr) -> Option<(&'a str, &'a str)> {
    let Expr::GetField(name) = field else { return None };
    Some((name, eligible_string(value)?))
}

/// Non-empty printable ASCII string literals only; anything else may be
/// encoded differently in the dump.
fn eligible_string(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Literal(Value::String(s)) if !s.is_empty() && s.bytes().all(|b| (0x20..0x7f).contains(&b)) => Some(s),
        _ => None,
    }
}

fn raw_dump(field: &str, ctx: &SqlCtx) -> Option<String> {
    match ColumnRegistry::calls().resolve(field).ok()? {
        desc @ FieldDescriptor::Dynamic { .. } if desc.is_json_valued() => desc.raw_column(ctx),
        _ => None,
    }
}

/// The value may be stored as a JSON string or, when it reads as a bare
/// scalar, unquoted.
fn equality_pattern(value: &str) -> String {
    if is_bare_scalar(value) {
        format!("%{}%", like_escape(value))
    } else {
        format!("%{}%", like_escape(&json_string(value)))
    }
}

fn contains_pattern(needle: &str) -> String {
    let quoted = json_string(needle);
    let inner = &quoted[1..quoted.len() - 1];
    if needle.to_ascii_lowercase().chars().all(|c| "0123456789+-.etruefalsn".contains(c)) {
        // Could be a piece of an unquoted number or keyword.
        format!("%{}%", like_escape(inner))
    } else {
        format!("%\"%{}%\"%", like_escape(inner))
    }
}

fn is_bare_scalar(value: &str) -> bool {
    matches!(value, "true" | "false" | "null") || value.parse::<f64>().is_ok_and(f64::is_finite)
}

fn json_string(value: &str) -> String { Value::String(value.to_string()).to_string() }

pub fn like_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::emitter::dialect::ClickHouseDialect;

    fn ctx() -> SqlCtx<'static> { SqlCtx { calls: "calls_merged", feedback: "feedback", dialect: &ClickHouseDialect } }

    fn patterns(expr: &Expr) -> Option<(String, Vec<String>)> {
        let mut pb = ParamBuilder::new();
        let sql = like_prefilter(expr, &ctx(), &mut pb)?;
        let table = pb.into_table();
        Some((sql, table.iter().map(|(_, p)| p.value.as_str().unwrap_or_default().to_string()).collect()))
    }

    #[test]
    fn equality_matches_the_quoted_value() {
        let (sql, pats) = patterns(&Expr::eq(Expr::field("inputs.model"), Expr::lit("gpt_4"))).unwrap();
        assert_eq!(sql, "(calls_merged.inputs_dump LIKE {pb_0:String} OR calls_merged.inputs_dump IS NULL)");
        assert_eq!(pats, vec![r#"%"gpt\_4"%"#]);

        let (_, pats) = patterns(&Expr::eq(Expr::lit("true"), Expr::field("output.ok"))).unwrap();
        assert_eq!(pats, vec!["%true%"]);
        let (_, pats) = patterns(&Expr::eq(Expr::field("output.n"), Expr::lit("12.5"))).unwrap();
        assert_eq!(pats, vec!["%12.5%"]);
    }

    #[test]
    fn in_emits_one_pattern_per_value() {
        let expr = Expr::in_list(Expr::field("attributes.env"), vec![Expr::lit("prod"), Expr::lit("dev")]);
        let (sql, pats) = patterns(&expr).unwrap();
        assert_eq!(pats, vec![r#"%"prod"%"#, r#"%"dev"%"#]);
        assert!(sql.ends_with("OR calls_merged.attributes_dump IS NULL)"));
        let mixed = Expr::in_list(Expr::field("attributes.env"), vec![Expr::lit("prod"), Expr::lit(3)]);
        assert!(patterns(&mixed).is_none());
    }

    #[test]
    fn contains_case_insensitive_lowers_both_sides() {
        let (sql, pats) = patterns(&Expr::contains(Expr::field("output.text"), "Hello", true)).unwrap();
        assert!(sql.starts_with("(lower(calls_merged.output_dump) LIKE {pb_0:String}"));
        assert_eq!(pats, vec![r#"%"%hello%"%"#]);
        let (_, pats) = patterns(&Expr::contains(Expr::field("output.text"), "12", false)).unwrap();
        assert_eq!(pats, vec!["%12%"]);
    }

    #[test]
    fn ineligible_comparisons_are_left_alone() {
        assert!(patterns(&Expr::eq(Expr::field("inputs.model"), Expr::lit(""))).is_none());
        assert!(patterns(&Expr::eq(Expr::field("op_name"), Expr::lit("x"))).is_none());
        assert!(patterns(&Expr::eq(Expr::field("inputs"), Expr::lit("x"))).is_none());
        assert!(patterns(&Expr::eq(Expr::field("inputs.model"), Expr::lit("caf\u{e9}"))).is_none());
        assert!(patterns(&Expr::gt(Expr::field("inputs.model"), Expr::lit("x"))).is_none());
    }

    #[test]
    fn escapes_like_metacharacters() {
        assert_eq!(like_escape(r"50%_\"), r"50\%\_\\");
    }
}
