//! Recursive subtree scoping: every call reachable from the root ids through
//! `parent_id`, down to a maximum depth.

use super::logical::DescendantScope;
use super::params::{ParamBuilder, ParamType};

pub const DESCENDANTS_CTE: &str = "descendant_call_ids";

/// `(name, body)` of the recursive CTE. Roots are depth 0.
pub fn descendants_cte(
    scope: &DescendantScope,
    calls: &str,
    project_id: &str,
    default_depth: u64,
    pb: &mut ParamBuilder,
) -> (String, String) {
    let pid = pb.add(project_id);
    let roots = pb.add_typed(scope.root_ids.clone(), ParamType::Array(Box::new(ParamType::String)));
    let pid_again = pb.add(project_id);
    let depth = pb.add_typed(scope.max_depth.unwrap_or(default_depth), ParamType::UInt64);
    let body = format!(
        "SELECT DISTINCT {calls}.id AS id, toUInt64(0) AS depth FROM {calls} \
         WHERE {calls}.project_id = {pid} AND {calls}.id IN {roots} \
         UNION ALL \
         SELECT c.id AS id, d.depth + 1 AS depth FROM {calls} AS c \
         INNER JOIN {DESCENDANTS_CTE} AS d ON c.parent_id = d.id \
         WHERE c.project_id = {pid_again} AND d.depth < {depth}"
    );
    (DESCENDANTS_CTE.to_string(), body)
}

/// Pre-grouping restriction of a phase to the descendant set.
pub fn descendants_predicate(calls: &str) -> String {
    format!("{}.id IN (SELECT id FROM {})", calls, DESCENDANTS_CTE)
}
