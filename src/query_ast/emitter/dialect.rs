//! Dialect trait for SQL emission.
//!
//! The calls store is ClickHouse; the trait keeps the engine-specific
//! spellings (casts, JSON access, substring search, joins) in one place.

use crate::query_ast::ast::ConvertTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind { Inner, Left }

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote an identifier (table/column name). Identifiers reaching the
    /// emitter are already validated, so this only decorates.
    fn quote_ident(&self, ident: &str) -> String { ident.to_string() }

    fn emit_join_kind(&self, kind: JoinKind) -> &'static str {
        match kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }

    /// LIMIT/OFFSET from placeholder slots.
    fn emit_limit(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(l) = limit { out.push_str(&format!(" LIMIT {}", l)); }
        if let Some(o) = offset { out.push_str(&format!(" OFFSET {}", o)); }
        out
    }

    fn emit_cast(&self, expr: &str, target: ConvertTarget) -> String;

    /// Scalar at `path_slot` inside a JSON string, as a string.
    fn emit_json_value(&self, expr: &str, path_slot: &str) -> String;

    fn emit_json_exists(&self, expr: &str, path_slot: &str) -> String;

    fn emit_contains(&self, haystack: &str, needle: &str, case_insensitive: bool) -> String;

    /// Last `/`-separated segment of a reference string.
    fn emit_last_segment(&self, expr: &str, sep_slot: &str) -> String;
}

pub struct ClickHouseDialect;

impl SqlDialect for ClickHouseDialect {
    fn name(&self) -> &'static str { "clickhouse" }

    fn emit_cast(&self, expr: &str, target: ConvertTarget) -> String {
        match target {
            ConvertTarget::Double => format!("toFloat64OrNull({})", expr),
            ConvertTarget::Int => format!("toInt64OrNull({})", expr),
            ConvertTarget::Bool => format!("toUInt8OrNull({})", expr),
            ConvertTarget::String => format!("toString({})", expr),
            ConvertTarget::Exists => format!("isNotNull({})", expr),
        }
    }

    fn emit_json_value(&self, expr: &str, path_slot: &str) -> String { format!("JSON_VALUE({}, {})", expr, path_slot) }

    fn emit_json_exists(&self, expr: &str, path_slot: &str) -> String { format!("JSON_EXISTS({}, {})", expr, path_slot) }

    fn emit_contains(&self, haystack: &str, needle: &str, case_insensitive: bool) -> String {
        if case_insensitive {
            format!("positionCaseInsensitive({}, {}) > 0", haystack, needle)
        } else {
            format!("position({}, {}) > 0", haystack, needle)
        }
    }

    fn emit_last_segment(&self, expr: &str, sep_slot: &str) -> String {
        format!("arrayElement(splitByString({}, {}), -1)", sep_slot, expr)
    }
}
