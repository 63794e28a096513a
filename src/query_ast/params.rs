//! Parameter table: every literal that reaches the SQL text goes through here
//! and is referenced only by a typed `{name:Type}` placeholder.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*):([A-Za-z0-9(), ]+)\}").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParamType {
    String,
    UInt64,
    Int64,
    Float64,
    Bool,
    Nullable(Box<ParamType>),
    Array(Box<ParamType>),
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => write!(f, "String"),
            ParamType::UInt64 => write!(f, "UInt64"),
            ParamType::Int64 => write!(f, "Int64"),
            ParamType::Float64 => write!(f, "Float64"),
            ParamType::Bool => write!(f, "Bool"),
            ParamType::Nullable(inner) => write!(f, "Nullable({})", inner),
            ParamType::Array(inner) => write!(f, "Array({})", inner),
        }
    }
}

impl ParamType {
    /// Physical type for a literal, from its JSON type. Objects travel as
    /// their JSON text.
    pub fn infer(value: &Value) -> ParamType {
        match value {
            Value::Null => ParamType::Nullable(Box::new(ParamType::String)),
            Value::Bool(_) => ParamType::Bool,
            Value::Number(n) if n.is_u64() => ParamType::UInt64,
            Value::Number(n) if n.is_i64() => ParamType::Int64,
            Value::Number(_) => ParamType::Float64,
            Value::String(_) | Value::Object(_) => ParamType::String,
            Value::Array(items) => {
                let mut elem: Option<ParamType> = None;
                for item in items {
                    let t = match ParamType::infer(item) {
                        ParamType::Array(_) | ParamType::Nullable(_) => ParamType::String,
                        t => t,
                    };
                    elem = Some(match (elem, t) {
                        (None, t) => t,
                        (Some(a), b) if a == b => a,
                        (Some(ParamType::UInt64 | ParamType::Int64), ParamType::UInt64 | ParamType::Int64) => ParamType::Int64,
                        (Some(ParamType::UInt64 | ParamType::Int64 | ParamType::Float64), ParamType::UInt64 | ParamType::Int64 | ParamType::Float64) => ParamType::Float64,
                        _ => ParamType::String,
                    });
                }
                ParamType::Array(Box::new(elem.unwrap_or(ParamType::String)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub value: Value,
    pub param_type: ParamType,
}

/// Append-only; one per compilation.
#[derive(Debug, Clone)]
pub struct ParamBuilder {
    prefix: String,
    params: Vec<(String, Param)>,
}

impl Default for ParamBuilder {
    fn default() -> Self { Self::new() }
}

impl ParamBuilder {
    pub fn new() -> Self { Self::with_prefix("pb") }

    pub fn with_prefix(prefix: impl Into<String>) -> Self { Self { prefix: prefix.into(), params: Vec::new() } }

    /// Register a literal and return its placeholder.
    pub fn add(&mut self, value: impl Into<Value>) -> String {
        let value = value.into();
        let param_type = ParamType::infer(&value);
        self.add_typed(value, param_type)
    }

    pub fn add_typed(&mut self, value: impl Into<Value>, param_type: ParamType) -> String {
        let mut value = value.into();
        if matches!(param_type, ParamType::String) && value.is_object() {
            value = Value::String(value.to_string());
        }
        if let (ParamType::Array(elem), Value::Array(items)) = (&param_type, &mut value)
            && matches!(elem.as_ref(), ParamType::String)
        {
            for item in items.iter_mut() {
                if !item.is_string() {
                    *item = Value::String(match &*item { Value::Null => String::new(), other => other.to_string() });
                }
            }
        }
        let name = format!("{}_{}", self.prefix, self.params.len());
        let slot = format!("{{{}:{}}}", name, param_type);
        self.params.push((name, Param { value, param_type }));
        slot
    }

    pub fn len(&self) -> usize { self.params.len() }
    pub fn is_empty(&self) -> bool { self.params.is_empty() }

    pub fn into_table(self) -> ParamTable { ParamTable(self.params) }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamTable(Vec<(String, Param)>);

impl ParamTable {
    pub fn get(&self, name: &str) -> Option<&Param> { self.0.iter().find(|(n, _)| n == name).map(|(_, p)| p) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> { self.0.iter().map(|(n, p)| (n.as_str(), p)) }

    /// Values keyed by placeholder name, in the shape ClickHouse clients take
    /// for `param_<name>` bindings.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.iter().map(|(n, p)| (n.clone(), p.value.clone())).collect())
    }
}

/// `(name, type)` for every placeholder in `sql`, in order of appearance.
pub fn placeholders(sql: &str) -> Vec<(String, String)> {
    PLACEHOLDER_RE.captures_iter(sql).map(|c| (c[1].to_string(), c[2].to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_types_from_literals() {
        assert_eq!(ParamType::infer(&json!("a")), ParamType::String);
        assert_eq!(ParamType::infer(&json!(3)), ParamType::UInt64);
        assert_eq!(ParamType::infer(&json!(-3)), ParamType::Int64);
        assert_eq!(ParamType::infer(&json!(1.5)), ParamType::Float64);
        assert_eq!(ParamType::infer(&json!(true)), ParamType::Bool);
        assert_eq!(ParamType::infer(&json!(["a", "b"])).to_string(), "Array(String)");
        assert_eq!(ParamType::infer(&json!([1, -2])).to_string(), "Array(Int64)");
        assert_eq!(ParamType::infer(&json!([1, 2.5])).to_string(), "Array(Float64)");
        assert_eq!(ParamType::infer(&json!([1, "x"])).to_string(), "Array(String)");
        assert_eq!(ParamType::infer(&json!(null)).to_string(), "Nullable(String)");
    }

    #[test]
    fn slots_are_sequential_and_typed() {
        let mut pb = ParamBuilder::new();
        assert_eq!(pb.add("proj"), "{pb_0:String}");
        assert_eq!(pb.add(10u64), "{pb_1:UInt64}");
        assert_eq!(pb.add(json!([1, "x"])), "{pb_2:Array(String)}");
        let table = pb.into_table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("pb_2").unwrap().value, json!(["1", "x"]));
        assert_eq!(table.to_json()["pb_0"], json!("proj"));
    }

    #[test]
    fn string_arrays_stringify_mixed_items() {
        let mut pb = ParamBuilder::new();
        let slot = pb.add_typed(json!(["a", 2, null, true]), ParamType::Array(Box::new(ParamType::String)));
        assert_eq!(slot, "{pb_0:Array(String)}");
        assert_eq!(pb.into_table().get("pb_0").unwrap().value, json!(["a", "2", "", "true"]));
    }

    #[test]
    fn extracts_placeholders() {
        let found = placeholders("a = {pb_0:String} AND b IN {pb_1:Array(String)}");
        assert_eq!(found, vec![("pb_0".to_string(), "String".to_string()), ("pb_1".to_string(), "Array(String)".to_string())]);
    }
}
