//! The calls query request: what to select, filter, sort and scope.
//! Mutated through the builder methods, then handed to `compile`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ast::Expr;
use super::columns::{ColumnRegistry, FieldDescriptor};
use super::costs::CostQueryGenerator;
use super::errors::QueryBuilderError;
use super::planner::{self, CompiledQuery, PhasePlan};
use crate::config::CompilerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection { Asc, Desc }

impl OrderDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_sql()) }
}

impl FromStr for OrderDirection {
    type Err = QueryBuilderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(OrderDirection::Asc),
            "desc" => Ok(OrderDirection::Desc),
            _ => Err(QueryBuilderError::InvalidDirection(s.to_string())),
        }
    }
}

/// Fixed set of always-safe filters, separate from the expression language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralFilter {
    /// Op references; a trailing `:*` matches every version of the op.
    pub op_names: Vec<String>,
    pub input_refs: Vec<String>,
    pub output_refs: Vec<String>,
    pub parent_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub call_ids: Vec<String>,
    pub trace_roots_only: bool,
    pub wb_user_ids: Vec<String>,
    pub wb_run_ids: Vec<String>,
}

impl StructuralFilter {
    pub fn is_trivial(&self) -> bool {
        self.op_names.is_empty()
            && self.input_refs.is_empty()
            && self.output_refs.is_empty()
            && self.parent_ids.is_empty()
            && self.trace_ids.is_empty()
            && self.call_ids.is_empty()
            && !self.trace_roots_only
            && self.wb_user_ids.is_empty()
            && self.wb_run_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescendantScope {
    pub root_ids: Vec<String>,
    #[serde(default)]
    pub max_depth: Option<u64>,
}

/// A condition together with the descriptors of the fields it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub expr: Expr,
    pub fields: Vec<FieldDescriptor>,
}

impl Condition {
    fn new(expr: Expr) -> Result<Self, QueryBuilderError> {
        expr.validate_condition()?;
        let registry = ColumnRegistry::calls();
        let fields = expr.field_names().into_iter().map(|f| registry.resolve(f)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { expr, fields })
    }

    pub fn is_heavy(&self) -> bool { self.fields.iter().any(FieldDescriptor::is_heavy) }

    pub fn needs_feedback_join(&self) -> bool { self.fields.iter().any(FieldDescriptor::needs_feedback_join) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderField {
    pub field: FieldDescriptor,
    pub direction: OrderDirection,
}

#[derive(Clone)]
pub struct CallsQuery {
    pub(crate) project_id: String,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) filter: Option<StructuralFilter>,
    pub(crate) order_fields: Vec<OrderField>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) include_costs: bool,
    pub(crate) descendants: Option<DescendantScope>,
    pub(crate) expand_columns: Vec<String>,
    pub(crate) config: CompilerConfig,
    pub(crate) cost_generator: Option<Arc<dyn CostQueryGenerator>>,
}

impl fmt::Debug for CallsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallsQuery")
            .field("project_id", &self.project_id)
            .field("fields", &self.fields.iter().map(FieldDescriptor::name).collect::<Vec<_>>())
            .field("conditions", &self.conditions.len())
            .field("filter", &self.filter)
            .field("order_fields", &self.order_fields)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("include_costs", &self.include_costs)
            .field("descendants", &self.descendants)
            .field("expand_columns", &self.expand_columns)
            .finish()
    }
}

/// JSON shape accepted by `CallsQuery::from_request_json`.
#[derive(Debug, Deserialize)]
struct CallsRequest {
    fields: Vec<String>,
    #[serde(default)]
    query: Option<Value>,
    #[serde(default)]
    filter: Option<StructuralFilter>,
    #[serde(default)]
    sort_by: Vec<SortBy>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    expand_columns: Vec<String>,
    #[serde(default)]
    descendants: Option<DescendantScope>,
    #[serde(default)]
    include_costs: bool,
}

#[derive(Debug, Deserialize)]
struct SortBy {
    field: String,
    direction: String,
}

impl CallsQuery {
    pub fn new(project_id: impl Into<String>) -> Self { Self::with_config(project_id, CompilerConfig::default()) }

    pub fn with_config(project_id: impl Into<String>, config: CompilerConfig) -> Self {
        Self {
            project_id: project_id.into(),
            fields: Vec::new(),
            conditions: Vec::new(),
            filter: None,
            order_fields: Vec::new(),
            limit: None,
            offset: None,
            include_costs: false,
            descendants: None,
            expand_columns: Vec::new(),
            config,
            cost_generator: None,
        }
    }

    pub fn from_request_json(project_id: impl Into<String>, raw: &str) -> Result<Self, QueryBuilderError> {
        let req: CallsRequest = serde_json::from_str(raw)?;
        let mut q = CallsQuery::new(project_id);
        for f in &req.fields {
            q.add_field(f)?;
        }
        if let Some(expr) = req.query {
            q.add_condition(Expr::from_value(expr)?)?;
        }
        if let Some(filter) = req.filter {
            q.set_structural_filter(filter);
        }
        for s in &req.sort_by {
            q.add_order(&s.field, &s.direction)?;
        }
        if let Some(l) = req.limit {
            q.set_limit(l)?;
        }
        if let Some(o) = req.offset {
            q.set_offset(o)?;
        }
        if !req.expand_columns.is_empty() {
            q.set_expand_columns(req.expand_columns);
        }
        if let Some(scope) = req.descendants {
            q.set_descendant_scope(scope.root_ids, scope.max_depth);
        }
        q.set_include_costs(req.include_costs);
        Ok(q)
    }

    /// Select a field. Fields landing on an already selected output column
    /// (`inputs` and `inputs_dump`) are ignored.
    pub fn add_field(&mut self, name: &str) -> Result<&mut Self, QueryBuilderError> {
        let field = ColumnRegistry::calls().resolve(name)?;
        if !self.fields.iter().any(|f| f.alias() == field.alias()) {
            self.fields.push(field);
        }
        Ok(self)
    }

    pub fn add_condition(&mut self, expr: Expr) -> Result<&mut Self, QueryBuilderError> {
        self.conditions.push(Condition::new(expr)?);
        Ok(self)
    }

    pub fn set_structural_filter(&mut self, filter: StructuralFilter) -> &mut Self {
        self.filter = Some(filter);
        self
    }

    pub fn add_order(&mut self, field: &str, direction: &str) -> Result<&mut Self, QueryBuilderError> {
        let direction = direction.parse::<OrderDirection>()?;
        let field = ColumnRegistry::calls().resolve(field)?;
        self.order_fields.push(OrderField { field, direction });
        Ok(self)
    }

    pub fn set_limit(&mut self, limit: i64) -> Result<&mut Self, QueryBuilderError> {
        self.limit = Some(settle_once("limit", self.limit, limit)?);
        Ok(self)
    }

    pub fn set_offset(&mut self, offset: i64) -> Result<&mut Self, QueryBuilderError> {
        self.offset = Some(settle_once("offset", self.offset, offset)?);
        Ok(self)
    }

    /// Reference-valued paths (`inputs.model`) whose objects may be filtered
    /// or sorted on by nested path.
    pub fn set_expand_columns<S: Into<String>>(&mut self, paths: impl IntoIterator<Item = S>) -> &mut Self {
        self.expand_columns = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_descendant_scope(&mut self, root_ids: Vec<String>, max_depth: Option<u64>) -> &mut Self {
        self.descendants = Some(DescendantScope { root_ids, max_depth });
        self
    }

    pub fn set_include_costs(&mut self, include: bool) -> &mut Self {
        self.include_costs = include;
        self
    }

    pub fn set_cost_generator(&mut self, generator: Arc<dyn CostQueryGenerator>) -> &mut Self {
        self.cost_generator = Some(generator);
        self
    }

    pub fn project_id(&self) -> &str { &self.project_id }
    pub fn config(&self) -> &CompilerConfig { &self.config }

    /// The phase layout `compile` would use for this request.
    pub fn plan(&self) -> PhasePlan { planner::decide(self) }

    pub fn compile(&self) -> Result<CompiledQuery, QueryBuilderError> { planner::compile(self) }

    /// Soft-deleted calls and calls whose start part has not landed are
    /// never returned. These apply to every compiled query and take no part
    /// in the phase decision.
    pub(crate) fn invariant_conditions() -> Result<Vec<Condition>, QueryBuilderError> {
        Ok(vec![
            Condition::new(Expr::eq(Expr::field("deleted_at"), Expr::null()))?,
            Condition::new(Expr::not(Expr::eq(Expr::field("started_at"), Expr::null())))?,
        ])
    }

    pub(crate) fn has_heavy_fields(&self) -> bool {
        self.fields.iter().any(FieldDescriptor::is_heavy)
            || self.conditions.iter().any(Condition::is_heavy)
            || self.order_fields.iter().any(|o| o.field.is_heavy())
    }
}

fn settle_once(what: &str, current: Option<u64>, value: i64) -> Result<u64, QueryBuilderError> {
    if current.is_some() {
        return Err(QueryBuilderError::InvalidLimitOrOffset(format!("{} already set", what)));
    }
    u64::try_from(value).map_err(|_| QueryBuilderError::InvalidLimitOrOffset(format!("{} must be non-negative, got {}", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_deduplicated_in_order() {
        let mut q = CallsQuery::new("p");
        q.add_field("id").unwrap().add_field("op_name").unwrap().add_field("id").unwrap();
        let names: Vec<_> = q.fields.iter().map(FieldDescriptor::name).collect();
        assert_eq!(names, vec!["id", "op_name"]);
        assert!(matches!(q.add_field("nope"), Err(QueryBuilderError::InvalidField(_))));
    }

    #[test]
    fn dump_alias_and_column_name_select_one_column() {
        let mut q = CallsQuery::new("p");
        q.add_field("inputs").unwrap().add_field("inputs_dump").unwrap();
        assert_eq!(q.fields.len(), 1);
        let sql = q.compile().unwrap().sql().to_string();
        assert_eq!(sql.matches("AS inputs_dump").count(), 1);
    }

    #[test]
    fn invariant_conditions_are_light() {
        let invariants = CallsQuery::invariant_conditions().unwrap();
        assert_eq!(invariants.len(), 2);
        assert!(invariants.iter().all(|c| !c.is_heavy()));
    }

    #[test]
    fn limit_and_offset_are_set_once_and_non_negative() {
        let mut q = CallsQuery::new("p");
        assert!(matches!(q.set_limit(-1), Err(QueryBuilderError::InvalidLimitOrOffset(_))));
        q.set_limit(10).unwrap();
        assert!(matches!(q.set_limit(5), Err(QueryBuilderError::InvalidLimitOrOffset(_))));
        q.set_offset(0).unwrap();
        assert!(matches!(q.set_offset(1), Err(QueryBuilderError::InvalidLimitOrOffset(_))));
        assert_eq!((q.limit, q.offset), (Some(10), Some(0)));
    }

    #[test]
    fn order_direction_parsing() {
        let mut q = CallsQuery::new("p");
        q.add_order("started_at", "DESC").unwrap();
        assert_eq!(q.order_fields[0].direction, OrderDirection::Desc);
        assert_eq!(q.add_order("started_at", "up").unwrap_err(), QueryBuilderError::InvalidDirection("up".to_string()));
    }

    #[test]
    fn conditions_are_checked_when_added() {
        let mut q = CallsQuery::new("p");
        assert!(matches!(q.add_condition(Expr::or(vec![])), Err(QueryBuilderError::EmptyBooleanCombinator("$or"))));
        assert!(matches!(
            q.add_condition(Expr::eq(Expr::field("bogus"), Expr::lit(1))),
            Err(QueryBuilderError::InvalidField(_))
        ));
        q.add_condition(Expr::eq(Expr::field("inputs.x"), Expr::lit("y"))).unwrap();
        assert!(q.conditions[0].is_heavy());
    }

    #[test]
    fn request_json_round_trips_into_builder() {
        let raw = r#"{
            "fields": ["id", "inputs"],
            "query": {"$eq": [{"$getField": "op_name"}, {"$literal": "a"}]},
            "filter": {"trace_roots_only": true},
            "sort_by": [{"field": "started_at", "direction": "desc"}],
            "limit": 5,
            "descendants": {"root_ids": ["r1"]},
            "include_costs": false
        }"#;
        let q = CallsQuery::from_request_json("p", raw).unwrap();
        assert_eq!(q.fields.len(), 2);
        assert_eq!(q.conditions.len(), 1);
        assert_eq!(q.limit, Some(5));
        assert_eq!(q.descendants.as_ref().unwrap().max_depth, None);
        assert!(!q.filter.as_ref().unwrap().is_trivial());
        assert!(CallsQuery::from_request_json("p", r#"{"fields": ["id"], "limit": -3}"#).is_err());
        let bad_node = CallsQuery::from_request_json("p", r#"{"fields": ["id"], "query": {"$near": [1, 2]}}"#);
        assert!(matches!(bad_node, Err(QueryBuilderError::UnknownOperationOrOperand(_))));
        let bad_json = CallsQuery::from_request_json("p", r#"{"fields": ["id"], "query": "#);
        assert!(matches!(bad_json, Err(QueryBuilderError::Parse(_))));
    }
}
