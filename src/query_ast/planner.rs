//! Phase planning and SQL assembly.
//!
//! A request runs either as one grouped SELECT, or as two: a cheap filter
//! phase that narrows the call ids using only light columns, and a result
//! phase that loads the heavy columns for those ids alone.

use log::{debug, warn};

use super::columns::{ColumnRegistry, FieldDescriptor, SqlCtx};
use super::compiler::{compile_condition, compile_order};
use super::descendants::{descendants_cte, descendants_predicate};
use super::emitter::dialect::ClickHouseDialect;
use super::emitter::{FlatSelect, JoinSet, emit_with};
use super::errors::QueryBuilderError;
use super::expand::ExpansionPlanner;
use super::feedback::add_feedback_join;
use super::logical::{CallsQuery, Condition, OrderField, StructuralFilter};
use super::params::{ParamBuilder, ParamTable, ParamType};
use super::rewrite::{PrefilterCtx, prefilter};
use super::structural::structural_sql;
use crate::format::format_sql;

pub const FILTERED_CALLS_CTE: &str = "filtered_calls";
pub const ALL_CALLS_CTE: &str = "all_calls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhasePlan {
    SinglePhase,
    /// `push_order_and_limit`: the sort and limit can be decided on light
    /// columns, so the filter phase truncates.
    TwoPhase { push_order_and_limit: bool },
}

impl PhasePlan {
    pub fn is_two_phase(self) -> bool { matches!(self, PhasePlan::TwoPhase { .. }) }
}

/// Decide the phase layout from the caller's request. The invariant
/// conditions are added afterwards and never change the outcome.
pub fn decide(q: &CallsQuery) -> PhasePlan {
    let heavy_condition = q.conditions.iter().any(Condition::is_heavy);
    let heavy_order = q.order_fields.iter().any(|o| o.field.is_heavy());
    let order_pushable = !q.order_fields.is_empty() && q.limit.is_some() && !heavy_condition && !heavy_order;
    let pushdown_possible = q.filter.as_ref().is_some_and(|f| !f.is_trivial())
        || q.descendants.is_some()
        || q.conditions.iter().any(|c| !c.is_heavy())
        || order_pushable;
    if (q.has_heavy_fields() && pushdown_possible) || q.include_costs {
        PhasePlan::TwoPhase { push_order_and_limit: order_pushable }
    } else {
        PhasePlan::SinglePhase
    }
}

/// Compiled SQL and the values for its placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    sql: String,
    params: ParamTable,
}

impl CompiledQuery {
    pub fn sql(&self) -> &str { &self.sql }
    pub fn params(&self) -> &ParamTable { &self.params }
    pub fn into_parts(self) -> (String, ParamTable) { (self.sql, self.params) }
}

/// What one grouped SELECT over the calls table is made of.
struct Phase<'q> {
    fields: Vec<FieldDescriptor>,
    conditions: Vec<&'q Condition>,
    filter: Option<&'q StructuralFilter>,
    scoped_to_descendants: bool,
    restrict_to_filtered: bool,
    order: &'q [OrderField],
    limit: Option<u64>,
    offset: Option<u64>,
}

struct Assembler<'a> {
    q: &'a CallsQuery,
    ctx: SqlCtx<'a>,
    pb: ParamBuilder,
    expansion: ExpansionPlanner,
}

pub fn compile(q: &CallsQuery) -> Result<CompiledQuery, QueryBuilderError> {
    if q.fields.is_empty() {
        return Err(QueryBuilderError::MissingSelectFields);
    }
    q.config.validate()?;
    if q.include_costs && q.cost_generator.is_none() {
        return Err(QueryBuilderError::CostsUnavailable);
    }
    let invariants = CallsQuery::invariant_conditions()?;
    let plan = decide(q);
    debug!(
        "calls query plan {:?}: heavy={}, conditions={}, order={}, limit={:?}",
        plan,
        q.has_heavy_fields(),
        q.conditions.len(),
        q.order_fields.len(),
        q.limit
    );

    let cfg = &q.config;
    let mut asm = Assembler {
        q,
        ctx: SqlCtx { calls: &cfg.calls_table, feedback: &cfg.feedback_table, dialect: &ClickHouseDialect },
        pb: ParamBuilder::new(),
        expansion: ExpansionPlanner::new(&q.project_id, &q.expand_columns, &cfg.object_versions_table, &cfg.table_rows_table),
    };

    let mut ctes = Vec::new();
    if let Some(scope) = &q.descendants {
        ctes.push(descendants_cte(scope, asm.ctx.calls, &q.project_id, cfg.default_descendant_depth, &mut asm.pb));
    }

    let (filter_phase, result_sql) = match plan {
        PhasePlan::SinglePhase => {
            let all = Phase {
                fields: q.fields.clone(),
                conditions: q.conditions.iter().chain(&invariants).collect(),
                filter: q.filter.as_ref(),
                scoped_to_descendants: q.descendants.is_some(),
                restrict_to_filtered: false,
                order: &q.order_fields,
                limit: q.limit,
                offset: q.offset,
            };
            (None, asm.phase_sql(&all)?)
        }
        PhasePlan::TwoPhase { push_order_and_limit } => {
            let id = ColumnRegistry::calls().resolve("id")?;
            let (mut light, heavy): (Vec<&Condition>, Vec<&Condition>) = q.conditions.iter().partition(|c| !c.is_heavy());
            // Ids leaving the filter phase already satisfy the invariants.
            light.extend(&invariants);
            let filter = Phase {
                fields: vec![id],
                conditions: light,
                filter: q.filter.as_ref(),
                scoped_to_descendants: q.descendants.is_some(),
                restrict_to_filtered: false,
                order: if push_order_and_limit { q.order_fields.as_slice() } else { &[] },
                limit: if push_order_and_limit { q.limit } else { None },
                offset: if push_order_and_limit { q.offset } else { None },
            };
            let filter_sql = asm.phase_sql(&filter)?;
            // Ids come back unordered, so the sort is applied again.
            let result = Phase {
                fields: q.fields.clone(),
                conditions: heavy,
                filter: None,
                scoped_to_descendants: false,
                restrict_to_filtered: true,
                order: &q.order_fields,
                limit: if push_order_and_limit { None } else { q.limit },
                offset: if push_order_and_limit { None } else { q.offset },
            };
            (Some(filter_sql), asm.phase_sql(&result)?)
        }
    };

    if !asm.expansion.ctes().is_empty() {
        debug!("reference expansion added {} cte(s)", asm.expansion.ctes().len());
    } else if asm.expansion.has_expand_columns() {
        warn!("expand columns {:?} declared but no field, condition or sort reads through them", q.expand_columns);
    }
    ctes.extend(asm.expansion.ctes().iter().cloned());
    if let Some(filter_sql) = filter_phase {
        ctes.push((FILTERED_CALLS_CTE.to_string(), filter_sql));
    }

    let body = match (&q.cost_generator, q.include_costs) {
        (Some(generator), true) => {
            ctes.push((ALL_CALLS_CTE.to_string(), result_sql));
            let names: Vec<String> = q.fields.iter().map(FieldDescriptor::name).collect();
            let fragment = generator.build(&mut asm.pb, ALL_CALLS_CTE, &q.project_id, &names, &q.order_fields);
            debug!("cost augmentation added {} cte(s)", fragment.ctes.len());
            ctes.extend(fragment.ctes);
            fragment.select
        }
        _ => result_sql,
    };

    let mut sql = emit_with(&ctes, q.descendants.is_some(), &body);
    if cfg.format_sql {
        sql = format_sql(&sql);
    }
    Ok(CompiledQuery { sql, params: asm.pb.into_table() })
}

impl Assembler<'_> {
    fn phase_sql(&mut self, phase: &Phase) -> Result<String, QueryBuilderError> {
        let ctx = &self.ctx;
        let calls = ctx.calls;
        let mut joins = JoinSet::default();

        let needs_feedback = phase.fields.iter().any(FieldDescriptor::needs_feedback_join)
            || phase.conditions.iter().any(|c| c.needs_feedback_join())
            || phase.order.iter().any(|o| o.field.needs_feedback_join());
        if needs_feedback {
            debug!("joining {} for feedback fields", ctx.feedback);
            add_feedback_join(ctx, &self.q.project_id, &mut self.pb, &mut joins);
        }

        let mut projection = Vec::with_capacity(phase.fields.len());
        for field in &phase.fields {
            let value = match self.expansion.chain_for(&field.name()) {
                Some(chain) => self.expansion.value_column(&chain, ctx, &mut self.pb, &mut joins),
                None => field.compile(ctx, &mut self.pb),
            };
            projection.push(format!("{} AS {}", value, field.alias()));
        }

        let mut predicates = vec![format!("{}.project_id = {}", calls, self.pb.add(self.q.project_id.as_str()))];
        if phase.restrict_to_filtered {
            predicates.push(format!("{}.id IN {}", calls, FILTERED_CALLS_CTE));
        }
        if phase.scoped_to_descendants {
            predicates.push(descendants_predicate(calls));
        }
        let mut having = Vec::new();
        if let Some(filter) = phase.filter {
            let structural = structural_sql(filter, ctx, &mut self.pb);
            predicates.extend(structural.where_terms);
            having.extend(structural.having_terms);
        }
        {
            let pcx = PrefilterCtx { sql: ctx, config: &self.q.config, expansion: &self.expansion };
            for cond in &phase.conditions {
                if let Some(pre) = prefilter(&cond.expr, &pcx, &mut self.pb) {
                    predicates.push(pre);
                }
            }
        }
        for cond in &phase.conditions {
            let compiled = compile_condition(&cond.expr, ctx, &mut self.pb, Some(&mut self.expansion))?;
            having.push(compiled.sql);
        }

        let mut sort = Vec::new();
        for order in phase.order {
            sort.extend(compile_order(order, ctx, &mut self.pb, &mut self.expansion, &mut joins));
        }

        let limit = phase.limit.map(|l| self.pb.add_typed(l, ParamType::UInt64));
        let offset = phase.offset.map(|o| self.pb.add_typed(o, ParamType::UInt64));

        let select = FlatSelect {
            table: calls.to_string(),
            projection,
            joins,
            predicates,
            group_exprs: vec![format!("{}.project_id", calls), format!("{}.id", calls)],
            having,
            sort,
            limit,
            offset,
        };
        Ok(select.emit(ctx.dialect))
    }
}
