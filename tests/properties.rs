use calls_query::query_ast::columns::SqlCtx;
use calls_query::query_ast::emitter::dialect::ClickHouseDialect;
use calls_query::query_ast::rewrite::like::like_prefilter;
use calls_query::query_ast::ParamBuilder;
use calls_query::{CallsQuery, Expr, StructuralFilter};
use proptest::prelude::*;
use regex::Regex;
use serde_json::{Value, json};

fn ctx() -> SqlCtx<'static> { SqlCtx { calls: "calls_merged", feedback: "feedback", dialect: &ClickHouseDialect } }

/// ClickHouse LIKE with backslash escapes.
fn like_matches(haystack: &str, pattern: &str) -> bool {
    let mut re = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push_str(&regex::escape(&next.to_string()));
                }
            }
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).unwrap().is_match(haystack)
}

/// Patterns registered by the LIKE prefilter for `expr`, if it fires.
fn like_patterns(expr: &Expr) -> Option<Vec<String>> {
    let mut pb = ParamBuilder::new();
    like_prefilter(expr, &ctx(), &mut pb)?;
    Some(pb.into_table().iter().filter_map(|(_, p)| p.value.as_str().map(str::to_string)).collect())
}

/// What JSON_VALUE returns for a scalar.
fn json_value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[ -~]{1,16}".prop_map(Value::String),
        any::<i64>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(Value::Bool),
        (-1.0e6f64..1.0e6).prop_map(|f| json!(f)),
    ]
}

fn id_at(millis: u64, rand_a: u16, rand_b: u16, rand_c: u64) -> String {
    format!(
        "{:08x}-{:04x}-7{:03x}-{:04x}-{:012x}",
        millis >> 16,
        millis & 0xffff,
        rand_a & 0xfff,
        0x8000 | (rand_b & 0x3fff),
        rand_c & 0xffff_ffff_ffff
    )
}

fn uuid_v4(bits: u128) -> String {
    let hex = format!("{:032x}", bits);
    format!(
        "{}-{}-4{}-{:x}{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        8 | (bits >> 60 & 0x3),
        &hex[17..20],
        &hex[20..32]
    )
}

/// Evaluates the id-scheme pattern the way ClickHouse `match` does.
fn scheme(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

fn compile_params(expr: Expr) -> (String, Vec<String>) {
    let mut q = CallsQuery::new("p");
    q.add_field("id").unwrap();
    q.add_condition(expr).unwrap();
    let compiled = q.compile().unwrap();
    let params = compiled.params().iter().map(|(_, p)| p.value.as_str().unwrap_or_default().to_string()).collect();
    (compiled.sql().to_string(), params)
}

proptest! {
    #[test]
    fn like_equality_never_rejects_a_match(value in scalar(), noise in "[ -~]{0,16}") {
        let literal = json_value_text(&value);
        let dump = json!({"other": noise, "k": value}).to_string();
        if let Some(patterns) = like_patterns(&Expr::eq(Expr::field("inputs.k"), Expr::lit(literal.as_str()))) {
            prop_assert!(patterns.iter().any(|p| like_matches(&dump, p)), "dump {} patterns {:?}", dump, patterns);
        }
    }

    #[test]
    fn like_contains_never_rejects_a_match(
        value in scalar(),
        start in 0usize..16,
        len in 1usize..8,
        upper in any::<bool>(),
        case_insensitive in any::<bool>(),
    ) {
        let text = json_value_text(&value);
        prop_assume!(text.is_ascii() && !text.is_empty());
        let start = start.min(text.len() - 1);
        let end = (start + len).min(text.len());
        let mut needle = text[start..end].to_string();
        if case_insensitive && upper {
            needle = needle.to_ascii_uppercase();
        }
        let dump = json!({"k": value}).to_string();
        if let Some(patterns) = like_patterns(&Expr::contains(Expr::field("output.k"), needle.as_str(), case_insensitive)) {
            let haystack = if case_insensitive { dump.to_ascii_lowercase() } else { dump.clone() };
            prop_assert!(like_matches(&haystack, &patterns[0]), "dump {} pattern {}", dump, patterns[0]);
        }
    }

    #[test]
    fn started_after_keeps_every_later_id(
        t in 1_000_000_000u64..4_000_000_000,
        delta_ms in 1u64..400_000_000_000,
        rand_a in any::<u16>(),
        rand_b in any::<u16>(),
        rand_c in any::<u64>(),
    ) {
        let (sql, params) = compile_params(Expr::gt(Expr::field("started_at"), Expr::lit(t)));
        let expected = "(NOT match(calls_merged.id, {pb_1:String}) OR calls_merged.id > {pb_2:String})";
        prop_assert!(sql.contains(expected), "{}", sql);
        let id = id_at(t * 1000 + delta_ms, rand_a, rand_b, rand_c);
        prop_assert!(!scheme(&params[1]).is_match(&id) || id > params[2], "id {} floor {}", id, params[2]);
    }

    #[test]
    fn started_before_keeps_every_earlier_id(
        t in 1_000_000_000u64..4_000_000_000,
        back_ms in 0u64..1_000_000_000_000,
        rand_a in any::<u16>(),
        rand_b in any::<u16>(),
        rand_c in any::<u64>(),
    ) {
        let (sql, params) = compile_params(Expr::gt(Expr::lit(t), Expr::field("started_at")));
        let expected = "(NOT match(calls_merged.id, {pb_1:String}) OR calls_merged.id < {pb_2:String})";
        prop_assert!(sql.contains(expected), "{}", sql);
        let id = id_at((t * 1000).saturating_sub(back_ms), rand_a, rand_b, rand_c);
        prop_assert!(!scheme(&params[1]).is_match(&id) || id < params[2], "id {} ceiling {}", id, params[2]);
    }

    #[test]
    fn random_and_external_ids_pass_either_bound(
        t in 1_000_000_000u64..4_000_000_000,
        after in any::<bool>(),
        id in prop_oneof![
            (any::<u128>()).prop_map(uuid_v4),
            "[A-Za-z0-9_:-]{1,40}",
        ],
    ) {
        let expr = if after {
            Expr::gt(Expr::field("started_at"), Expr::lit(t))
        } else {
            Expr::gt(Expr::lit(t), Expr::field("started_at"))
        };
        let (_, params) = compile_params(expr);
        let passes = !scheme(&params[1]).is_match(&id)
            || if after { id > params[2] } else { id < params[2] };
        prop_assert!(passes, "id {} bound {}", id, params[2]);
    }

    #[test]
    fn literal_text_never_shapes_the_sql(literal in "\\PC{1,24}") {
        let build = |s: &str| {
            let mut q = CallsQuery::new("p");
            q.add_field("id").unwrap().add_field("op_name").unwrap();
            q.add_condition(Expr::or(vec![
                Expr::eq(Expr::field("op_name"), Expr::lit(s)),
                Expr::contains(Expr::field("display_name"), s, true),
            ])).unwrap();
            q.set_structural_filter(StructuralFilter { trace_ids: vec![s.to_string()], ..Default::default() });
            q.compile().unwrap()
        };
        let reference = build("x");
        let probe = build(&literal);
        prop_assert_eq!(reference.sql(), probe.sql());
        prop_assert!(probe.params().iter().any(|(_, p)| p.value == json!(literal)), "{:?}", probe.params());
    }
}
