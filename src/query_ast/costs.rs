//! Seam for cost/pricing augmentation. The generator lives outside this
//! crate; its output is spliced into the `WITH` chain without inspection.

use super::logical::OrderField;
use super::params::ParamBuilder;

/// CTEs to append after the base query, plus the final SELECT over them.
#[derive(Debug, Clone, PartialEq)]
pub struct CostFragment {
    pub ctes: Vec<(String, String)>,
    pub select: String,
}

pub trait CostQueryGenerator: Send + Sync {
    /// `base_cte` names the CTE holding the assembled calls query. Literals
    /// must be registered through `pb`.
    fn build(
        &self,
        pb: &mut ParamBuilder,
        base_cte: &str,
        project_id: &str,
        fields: &[String],
        order_by: &[OrderField],
    ) -> CostFragment;
}
