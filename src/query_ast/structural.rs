//! SQL for the structural filter. Each member yields an exact HAVING term
//! over the grouped call and, where one exists, a WHERE superset over the
//! physical rows that lets the other part's NULLs through.

use super::columns::SqlCtx;
use super::logical::StructuralFilter;
use super::params::{ParamBuilder, ParamType};
use super::rewrite::like::like_escape;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StructuralSql {
    pub where_terms: Vec<String>,
    pub having_terms: Vec<String>,
}

fn string_array(pb: &mut ParamBuilder, values: &[String]) -> String {
    pb.add_typed(values.to_vec(), ParamType::Array(Box::new(ParamType::String)))
}

pub fn structural_sql(filter: &StructuralFilter, ctx: &SqlCtx, pb: &mut ParamBuilder) -> StructuralSql {
    let mut out = StructuralSql::default();
    let c = ctx.calls;

    if !filter.op_names.is_empty() {
        let (wildcards, exact): (Vec<&String>, Vec<&String>) = filter.op_names.iter().partition(|n| n.ends_with(":*"));
        let exact: Vec<String> = exact.into_iter().cloned().collect();
        let prefixes: Vec<String> =
            wildcards.iter().map(|n| format!("{}%", like_escape(&n[..n.len() - 1]))).collect();
        for grouped in [true, false] {
            let column = if grouped { format!("any({c}.op_name)") } else { format!("{c}.op_name") };
            let mut terms = Vec::new();
            if !exact.is_empty() {
                terms.push(format!("{} IN {}", column, string_array(pb, &exact)));
            }
            for prefix in &prefixes {
                terms.push(format!("{} LIKE {}", column, pb.add(prefix.as_str())));
            }
            if grouped {
                out.having_terms.push(format!("({})", terms.join(" OR ")));
            } else {
                terms.push(format!("{} IS NULL", column));
                out.where_terms.push(format!("({})", terms.join(" OR ")));
            }
        }
    }

    for (refs, column) in [(&filter.input_refs, "input_refs"), (&filter.output_refs, "output_refs")] {
        if refs.is_empty() {
            continue;
        }
        out.having_terms.push(format!("hasAny(array_concat_agg({c}.{column}), {})", string_array(pb, refs)));
        out.where_terms.push(format!("(hasAny({c}.{column}, {}) OR length({c}.{column}) = 0)", string_array(pb, refs)));
    }

    for (ids, column) in [(&filter.parent_ids, "parent_id"), (&filter.trace_ids, "trace_id")] {
        if ids.is_empty() {
            continue;
        }
        out.having_terms.push(format!("(any({c}.{column}) IN {})", string_array(pb, ids)));
        out.where_terms.push(format!("({c}.{column} IN {} OR {c}.{column} IS NULL)", string_array(pb, ids)));
    }

    if !filter.call_ids.is_empty() {
        out.where_terms.push(format!("({c}.id IN {})", string_array(pb, &filter.call_ids)));
    }

    if filter.trace_roots_only {
        out.having_terms.push(format!("(any({c}.parent_id) IS NULL)"));
    }

    for (ids, column) in [(&filter.wb_user_ids, "wb_user_id"), (&filter.wb_run_ids, "wb_run_id")] {
        if !ids.is_empty() {
            out.having_terms.push(format!("(any({c}.{column}) IN {})", string_array(pb, ids)));
        }
    }
    out
}
