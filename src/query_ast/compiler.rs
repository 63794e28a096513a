//! Expression compiler: `Expr` → SQL boolean expression over the grouped
//! calls table, collecting the descriptors of every field it touches.

use serde_json::Value;

use super::ast::Expr;
use super::columns::{ColumnRegistry, FieldDescriptor, SqlCtx};
use super::emitter::JoinSet;
use super::errors::QueryBuilderError;
use super::expand::ExpansionPlanner;
use super::logical::OrderField;
use super::params::ParamBuilder;
use crate::query_ast::ast::ConvertTarget;

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    pub sql: String,
    pub fields: Vec<FieldDescriptor>,
}

struct Compiler<'e> {
    ctx: &'e SqlCtx<'e>,
    registry: &'static ColumnRegistry,
    pb: &'e mut ParamBuilder,
    expansion: Option<&'e mut ExpansionPlanner>,
    /// Renders one field name as fixed SQL instead of going through the
    /// registry (object-store leaf conditions).
    field_override: Option<(&'e str, &'e str)>,
    used: Vec<FieldDescriptor>,
}

pub fn compile_condition(
    expr: &Expr,
    ctx: &SqlCtx,
    pb: &mut ParamBuilder,
    expansion: Option<&mut ExpansionPlanner>,
) -> Result<CompiledExpr, QueryBuilderError> {
    let mut c = Compiler { ctx, registry: ColumnRegistry::calls(), pb, expansion, field_override: None, used: Vec::new() };
    let sql = c.compile(expr)?;
    Ok(CompiledExpr { sql, fields: c.used })
}

/// Compile `expr` with `field` rendered as `field_sql`. Used for conditions
/// evaluated against referenced objects rather than calls.
pub(crate) fn compile_with_override(
    expr: &Expr,
    ctx: &SqlCtx,
    pb: &mut ParamBuilder,
    field: &str,
    field_sql: &str,
) -> Result<String, QueryBuilderError> {
    let mut c = Compiler {
        ctx,
        registry: ColumnRegistry::calls(),
        pb,
        expansion: None,
        field_override: Some((field, field_sql)),
        used: Vec::new(),
    };
    c.compile(expr)
}

impl Compiler<'_> {
    fn compile(&mut self, expr: &Expr) -> Result<String, QueryBuilderError> {
        if let Some(sql) = self.try_expand(expr)? {
            return Ok(sql);
        }
        Ok(match expr {
            Expr::Literal(v) => self.pb.add(v.clone()),
            Expr::GetField(name) => self.field(name)?,
            Expr::Convert(c) => {
                let inner = self.compile(&c.input)?;
                self.ctx.dialect.emit_cast(&inner, c.to)
            }
            Expr::And(items) => self.combine(items, "AND", "$and")?,
            Expr::Or(items) => self.combine(items, "OR", "$or")?,
            Expr::Not(inner) => format!("(NOT ({}))", self.compile(inner)?),
            Expr::Eq(l, r) => match (l.as_ref(), r.as_ref()) {
                (other, Expr::Literal(Value::Null)) | (Expr::Literal(Value::Null), other) => {
                    format!("({} IS NULL)", self.compile(other)?)
                }
                _ => format!("({} = {})", self.compile(l)?, self.compile(r)?),
            },
            Expr::Gt(l, r) => format!("({} > {})", self.compile(l)?, self.compile(r)?),
            Expr::Gte(l, r) => format!("({} >= {})", self.compile(l)?, self.compile(r)?),
            Expr::In(l, list) => {
                if list.is_empty() {
                    // Nothing is a member of the empty set.
                    return Ok("0".to_string());
                }
                let lhs = self.compile(l)?;
                let items = list.iter().map(|i| self.compile(i)).collect::<Result<Vec<_>, _>>()?;
                format!("({} IN ({}))", lhs, items.join(", "))
            }
            Expr::Contains(c) => {
                let haystack = self.compile(&c.input)?;
                let needle = self.compile(&c.substr)?;
                format!("({})", self.ctx.dialect.emit_contains(&haystack, &needle, c.case_insensitive))
            }
        })
    }

    fn combine(&mut self, items: &[Expr], joiner: &str, op: &'static str) -> Result<String, QueryBuilderError> {
        match items {
            [] => Err(QueryBuilderError::EmptyBooleanCombinator(op)),
            [only] => self.compile(only),
            _ => {
                let parts = items.iter().map(|i| self.compile(i)).collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", parts.join(&format!(" {} ", joiner))))
            }
        }
    }

    fn field(&mut self, name: &str) -> Result<String, QueryBuilderError> {
        if let Some((over, sql)) = self.field_override
            && over == name
        {
            return Ok(sql.to_string());
        }
        let desc = self.registry.resolve(name)?;
        let sql = desc.compile(self.ctx, self.pb);
        self.used.push(desc);
        Ok(sql)
    }

    /// Comparisons on a path under an expand column become a membership test
    /// against the referenced objects that satisfy them.
    fn try_expand(&mut self, expr: &Expr) -> Result<Option<String>, QueryBuilderError> {
        let Some(expansion) = self.expansion.as_deref_mut() else { return Ok(None) };
        let Some(name) = expandable_comparison_field(expr) else { return Ok(None) };
        let Some(chain) = expansion.chain_for(name) else { return Ok(None) };
        let desc = self.registry.resolve(name)?;
        let sql = expansion.filter_predicate(expr, name, &chain, self.ctx, self.pb)?;
        self.used.push(desc);
        Ok(Some(sql))
    }
}

/// The field operand of a comparison whose other operands are all literals.
pub(crate) fn expandable_comparison_field(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Eq(l, r) | Expr::Gt(l, r) | Expr::Gte(l, r) => match (l.as_field_name(), r.as_field_name()) {
            (Some(f), None) if r.as_literal().is_some() => Some(f),
            (None, Some(f)) if l.as_literal().is_some() => Some(f),
            _ => None,
        },
        Expr::In(l, list) if list.iter().all(|i| i.as_literal().is_some()) => l.as_field_name(),
        Expr::Contains(c) if c.substr.as_literal().is_some() => c.input.as_field_name(),
        _ => None,
    }
}

/// ORDER BY terms for one sort field. JSON-valued fields get the composite
/// existence / numeric / string key so absent and mixed-type values order
/// consistently.
pub fn compile_order(
    order: &OrderField,
    ctx: &SqlCtx,
    pb: &mut ParamBuilder,
    expansion: &mut ExpansionPlanner,
    joins: &mut JoinSet,
) -> Vec<String> {
    let dir = order.direction.as_sql();
    let name = order.field.name();
    if let Some(chain) = expansion.chain_for(&name) {
        let value = expansion.value_column(&chain, ctx, pb, joins);
        return composite_order(&format!("notEmpty({})", value), &value, dir, ctx);
    }
    if order.field.is_json_valued() {
        let value = order.field.compile(ctx, pb);
        if let Some(exists) = order.field.compile_exists(ctx, pb) {
            return composite_order(&exists, &value, dir, ctx);
        }
    }
    vec![format!("{} {}", order.field.compile(ctx, pb), dir)]
}

fn composite_order(exists: &str, value: &str, dir: &str, ctx: &SqlCtx) -> Vec<String> {
    vec![
        format!("{} DESC", exists),
        format!("{} {}", ctx.dialect.emit_cast(value, ConvertTarget::Double), dir),
        format!("{} {}", ctx.dialect.emit_cast(value, ConvertTarget::String), dir),
    ]
}
