//! Mongo-style boolean expression tree accepted by `CallsQuery::add_condition`.
//! Deserializes straight from the JSON query language (`{"$eq": [..]}` etc).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::QueryBuilderError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    #[serde(rename = "$literal")]
    Literal(Value),
    #[serde(rename = "$getField")]
    GetField(String),
    #[serde(rename = "$convert")]
    Convert(ConvertOp),
    #[serde(rename = "$and")]
    And(Vec<Expr>),
    #[serde(rename = "$or")]
    Or(Vec<Expr>),
    #[serde(rename = "$not", with = "single_operand")]
    Not(Box<Expr>),
    #[serde(rename = "$eq")]
    Eq(Box<Expr>, Box<Expr>),
    #[serde(rename = "$gt")]
    Gt(Box<Expr>, Box<Expr>),
    #[serde(rename = "$gte")]
    Gte(Box<Expr>, Box<Expr>),
    #[serde(rename = "$in")]
    In(Box<Expr>, Vec<Expr>),
    #[serde(rename = "$contains")]
    Contains(ContainsOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertOp {
    pub input: Box<Expr>,
    pub to: ConvertTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertTarget {
    Double,
    Int,
    String,
    Bool,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainsOp {
    pub input: Box<Expr>,
    pub substr: Box<Expr>,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// `$not` is written as a one-element list in the query language; a bare
/// operand is accepted as well.
mod single_operand {
    use super::Expr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::borrowed_box)]
    pub fn serialize<S: Serializer>(expr: &Box<Expr>, s: S) -> Result<S::Ok, S::Error> {
        [expr.as_ref()].serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Box<Expr>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrList {
            List(Vec<Expr>),
            One(Expr),
        }
        match OneOrList::deserialize(d)? {
            OneOrList::One(e) => Ok(Box::new(e)),
            OneOrList::List(mut v) if v.len() == 1 => Ok(Box::new(v.remove(0))),
            OneOrList::List(v) => Err(serde::de::Error::invalid_length(v.len(), &"exactly one operand")),
        }
    }
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self { Expr::GetField(name.into()) }
    pub fn lit(value: impl Into<Value>) -> Self { Expr::Literal(value.into()) }
    pub fn null() -> Self { Expr::Literal(Value::Null) }
    pub fn and(items: Vec<Expr>) -> Self { Expr::And(items) }
    pub fn or(items: Vec<Expr>) -> Self { Expr::Or(items) }
    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Expr) -> Self { Expr::Not(Box::new(inner)) }
    pub fn eq(l: Expr, r: Expr) -> Self { Expr::Eq(Box::new(l), Box::new(r)) }
    pub fn gt(l: Expr, r: Expr) -> Self { Expr::Gt(Box::new(l), Box::new(r)) }
    pub fn gte(l: Expr, r: Expr) -> Self { Expr::Gte(Box::new(l), Box::new(r)) }
    pub fn in_list(l: Expr, list: Vec<Expr>) -> Self { Expr::In(Box::new(l), list) }
    pub fn contains(input: Expr, substr: impl Into<String>, case_insensitive: bool) -> Self {
        Expr::Contains(ContainsOp { input: Box::new(input), substr: Box::new(Expr::lit(substr.into())), case_insensitive })
    }
    pub fn convert(input: Expr, to: ConvertTarget) -> Self { Expr::Convert(ConvertOp { input: Box::new(input), to }) }

    /// Text that is not JSON fails with `Parse`; JSON that is not a valid
    /// expression fails with `UnknownOperationOrOperand`.
    pub fn from_json(raw: &str) -> Result<Self, QueryBuilderError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, QueryBuilderError> {
        serde_json::from_value(value).map_err(|e| QueryBuilderError::UnknownOperationOrOperand(e.to_string()))
    }

    /// Operand nodes produce values; everything else produces a boolean.
    pub fn is_operand(&self) -> bool { matches!(self, Expr::Literal(_) | Expr::GetField(_) | Expr::Convert(_)) }

    pub fn op_name(&self) -> &'static str {
        match self {
            Expr::Literal(_) => "$literal",
            Expr::GetField(_) => "$getField",
            Expr::Convert(_) => "$convert",
            Expr::And(_) => "$and",
            Expr::Or(_) => "$or",
            Expr::Not(_) => "$not",
            Expr::Eq(..) => "$eq",
            Expr::Gt(..) => "$gt",
            Expr::Gte(..) => "$gte",
            Expr::In(..) => "$in",
            Expr::Contains(_) => "$contains",
        }
    }

    /// Structural checks run when a condition is added: conditions must be
    /// boolean operations and combinators must not be empty.
    pub fn validate_condition(&self) -> Result<(), QueryBuilderError> {
        if self.is_operand() {
            return Err(QueryBuilderError::UnknownOperationOrOperand(format!("{} is not a boolean operation", self.op_name())));
        }
        self.validate_tree()
    }

    fn validate_tree(&self) -> Result<(), QueryBuilderError> {
        match self {
            Expr::Literal(_) | Expr::GetField(_) => Ok(()),
            Expr::Convert(c) => c.input.validate_tree(),
            Expr::And(items) | Expr::Or(items) => {
                if items.is_empty() { return Err(QueryBuilderError::EmptyBooleanCombinator(self.op_name())); }
                items.iter().try_for_each(Expr::validate_tree)
            }
            Expr::Not(inner) => inner.validate_tree(),
            Expr::Eq(l, r) | Expr::Gt(l, r) | Expr::Gte(l, r) => { l.validate_tree()?; r.validate_tree() }
            Expr::In(l, list) => { l.validate_tree()?; list.iter().try_for_each(Expr::validate_tree) }
            Expr::Contains(c) => {
                c.input.validate_tree()?;
                match c.substr.as_ref() {
                    Expr::Literal(Value::String(_)) => Ok(()),
                    other if other.is_operand() => other.validate_tree(),
                    other => Err(QueryBuilderError::UnknownOperationOrOperand(format!("$contains substr cannot be {}", other.op_name()))),
                }
            }
        }
    }

    /// Every `$getField` name in the tree, in visit order.
    pub fn field_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::GetField(f) => out.push(f),
            Expr::Convert(c) => c.input.collect_fields(out),
            Expr::And(items) | Expr::Or(items) => items.iter().for_each(|i| i.collect_fields(out)),
            Expr::Not(inner) => inner.collect_fields(out),
            Expr::Eq(l, r) | Expr::Gt(l, r) | Expr::Gte(l, r) => { l.collect_fields(out); r.collect_fields(out); }
            Expr::In(l, list) => { l.collect_fields(out); list.iter().for_each(|i| i.collect_fields(out)); }
            Expr::Contains(c) => { c.input.collect_fields(out); c.substr.collect_fields(out); }
        }
    }

    /// Field name of a bare or converted field operand.
    pub fn as_field_name(&self) -> Option<&str> {
        match self {
            Expr::GetField(f) => Some(f),
            Expr::Convert(c) => c.input.as_field_name(),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }
}
