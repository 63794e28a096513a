//! Column registry for the merged calls table.
//!
//! Maps logical field names to physical columns, the aggregate that folds
//! the start/end parts of a call into one value, and a cost class. Heavy
//! columns are the JSON dumps; everything else is cheap to load.

use once_cell::sync::Lazy;

use super::emitter::dialect::SqlDialect;
use super::errors::QueryBuilderError;
use super::params::ParamBuilder;

/// Which physical row of a call populates a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPart { Start, End, Both }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn { Any, ArrayConcat }

impl AggFn {
    fn wrap(self, expr: &str) -> String {
        match self {
            AggFn::Any => format!("any({})", expr),
            AggFn::ArrayConcat => format!("array_concat_agg({})", expr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub agg: Option<AggFn>,
    pub heavy: bool,
    pub part: CallPart,
}

const fn col(name: &'static str, agg: Option<AggFn>, heavy: bool, part: CallPart) -> ColumnSpec {
    ColumnSpec { name, agg, heavy, part }
}

const CALLS_V1: &[ColumnSpec] = &[
    col("project_id", None, false, CallPart::Both),
    col("id", None, false, CallPart::Both),
    col("trace_id", Some(AggFn::Any), false, CallPart::Start),
    col("parent_id", Some(AggFn::Any), false, CallPart::Start),
    col("thread_id", Some(AggFn::Any), false, CallPart::Start),
    col("op_name", Some(AggFn::Any), false, CallPart::Start),
    col("display_name", Some(AggFn::Any), false, CallPart::Both),
    col("started_at", Some(AggFn::Any), false, CallPart::Start),
    col("ended_at", Some(AggFn::Any), false, CallPart::End),
    col("exception", Some(AggFn::Any), false, CallPart::End),
    col("attributes_dump", Some(AggFn::Any), true, CallPart::Start),
    col("inputs_dump", Some(AggFn::Any), true, CallPart::Start),
    col("input_refs", Some(AggFn::ArrayConcat), false, CallPart::Start),
    col("output_dump", Some(AggFn::Any), true, CallPart::End),
    col("output_refs", Some(AggFn::ArrayConcat), false, CallPart::End),
    col("summary_dump", Some(AggFn::Any), true, CallPart::End),
    col("wb_user_id", Some(AggFn::Any), false, CallPart::Start),
    col("wb_run_id", Some(AggFn::Any), false, CallPart::Start),
    col("deleted_at", Some(AggFn::Any), false, CallPart::Both),
];

/// Table names and dialect a descriptor needs to render itself.
pub struct SqlCtx<'a> {
    pub calls: &'a str,
    pub feedback: &'a str,
    pub dialect: &'a dyn SqlDialect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryField { Status, LatencyMs, TraceName }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackTarget { Payload, RunnableRef }

#[derive(Debug, Clone, PartialEq)]
pub enum FieldDescriptor {
    Column(ColumnSpec),
    /// A JSON dump column narrowed to `path`. An empty path is the whole dump.
    Dynamic { name: String, column: ColumnSpec, path: Vec<String> },
    /// `feedback.[type].payload.<path>` / `feedback.[type].runnable_ref`.
    /// `feedback_type` of `*` matches any feedback.
    Feedback { name: String, feedback_type: String, target: FeedbackTarget, path: Vec<String> },
    Summary(SummaryField),
}

impl FieldDescriptor {
    pub fn name(&self) -> String {
        match self {
            FieldDescriptor::Column(c) => c.name.to_string(),
            FieldDescriptor::Dynamic { name, .. } | FieldDescriptor::Feedback { name, .. } => name.clone(),
            FieldDescriptor::Summary(s) => format!("summary.weave.{}", s.key()),
        }
    }

    pub fn is_heavy(&self) -> bool {
        match self {
            FieldDescriptor::Column(c) => c.heavy,
            FieldDescriptor::Dynamic { .. } | FieldDescriptor::Feedback { .. } => true,
            FieldDescriptor::Summary(_) => false,
        }
    }

    pub fn part(&self) -> CallPart {
        match self {
            FieldDescriptor::Column(c) | FieldDescriptor::Dynamic { column: c, .. } => c.part,
            FieldDescriptor::Feedback { .. } | FieldDescriptor::Summary(_) => CallPart::Both,
        }
    }

    pub fn needs_feedback_join(&self) -> bool { matches!(self, FieldDescriptor::Feedback { .. }) }

    /// Dumps narrowed to a path and feedback payload paths hold untyped JSON
    /// scalars; they sort with the composite existence/number/string key.
    pub fn is_json_valued(&self) -> bool {
        match self {
            FieldDescriptor::Dynamic { path, .. } => !path.is_empty(),
            FieldDescriptor::Feedback { target, .. } => *target == FeedbackTarget::Payload,
            _ => false,
        }
    }

    /// Output column name in the select list.
    pub fn alias(&self) -> String {
        match self {
            FieldDescriptor::Column(c) => c.name.to_string(),
            FieldDescriptor::Dynamic { column, path, .. } if path.is_empty() => column.name.to_string(),
            other => sanitize_alias(&other.name()),
        }
    }

    /// Pre-grouping physical column, for dump-backed descriptors only.
    pub fn raw_column(&self, ctx: &SqlCtx) -> Option<String> {
        match self {
            FieldDescriptor::Dynamic { column, .. } => Some(format!("{}.{}", ctx.calls, column.name)),
            _ => None,
        }
    }

    /// Post-grouping (aggregated) expression.
    pub fn compile(&self, ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
        match self {
            FieldDescriptor::Column(c) => c.compile(ctx),
            FieldDescriptor::Dynamic { column, path, .. } => {
                let dump = column.compile(ctx);
                if path.is_empty() {
                    dump
                } else {
                    let slot = pb.add(json_path(path));
                    ctx.dialect.emit_json_value(&dump, &slot)
                }
            }
            FieldDescriptor::Feedback { feedback_type, target, path, .. } => {
                let column = match target {
                    FeedbackTarget::Payload => "payload_dump",
                    FeedbackTarget::RunnableRef => "runnable_ref",
                };
                let qualified = format!("{}.{}", ctx.feedback, column);
                let picked = if feedback_type == "*" {
                    format!("any({})", qualified)
                } else {
                    let type_slot = pb.add(feedback_type.as_str());
                    format!("anyIf({}, {}.feedback_type = {})", qualified, ctx.feedback, type_slot)
                };
                if path.is_empty() {
                    picked
                } else {
                    let slot = pb.add(json_path(path));
                    ctx.dialect.emit_json_value(&picked, &slot)
                }
            }
            FieldDescriptor::Summary(s) => s.compile(ctx, pb),
        }
    }

    /// Existence test used as the first key of a composite sort.
    pub fn compile_exists(&self, ctx: &SqlCtx, pb: &mut ParamBuilder) -> Option<String> {
        let (container, path) = match self {
            FieldDescriptor::Dynamic { column, path, .. } if !path.is_empty() => (column.compile(ctx), path),
            FieldDescriptor::Feedback { feedback_type, target: FeedbackTarget::Payload, path, .. } if !path.is_empty() => {
                let whole = FieldDescriptor::Feedback {
                    name: String::new(),
                    feedback_type: feedback_type.clone(),
                    target: FeedbackTarget::Payload,
                    path: Vec::new(),
                };
                (whole.compile(ctx, pb), path)
            }
            _ => return None,
        };
        let slot = pb.add(json_path(path));
        Some(ctx.dialect.emit_json_exists(&container, &slot))
    }
}

impl ColumnSpec {
    pub fn compile(&self, ctx: &SqlCtx) -> String {
        let qualified = format!("{}.{}", ctx.calls, self.name);
        match self.agg {
            Some(agg) => agg.wrap(&qualified),
            None => qualified,
        }
    }
}

impl SummaryField {
    fn key(self) -> &'static str {
        match self {
            SummaryField::Status => "status",
            SummaryField::LatencyMs => "latency_ms",
            SummaryField::TraceName => "trace_name",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        match key {
            "status" => Some(SummaryField::Status),
            "latency_ms" => Some(SummaryField::LatencyMs),
            "trace_name" => Some(SummaryField::TraceName),
            _ => None,
        }
    }

    fn compile(self, ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
        let c = ctx.calls;
        match self {
            SummaryField::Status => {
                let error = pb.add("error");
                let running = pb.add("running");
                let success = pb.add("success");
                format!(
                    "CASE WHEN any({c}.exception) IS NOT NULL THEN {error} WHEN any({c}.ended_at) IS NULL THEN {running} ELSE {success} END"
                )
            }
            SummaryField::LatencyMs => {
                format!("(toUnixTimestamp64Milli(any({c}.ended_at)) - toUnixTimestamp64Milli(any({c}.started_at)))")
            }
            SummaryField::TraceName => {
                let empty_a = pb.add("");
                let pattern = pb.add("/op/([^:]+)");
                let empty_b = pb.add("");
                format!(
                    "coalesce(nullIf(any({c}.display_name), {empty_a}), nullIf(regexpExtract(any({c}.op_name), {pattern}, 1), {empty_b}), any({c}.op_name))"
                )
            }
        }
    }
}

/// `$."a"."b"[0]` for a dotted path; numeric segments index arrays.
pub fn json_path(path: &[String]) -> String {
    let mut out = String::from("$");
    for seg in path {
        if !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(&format!("[{}]", seg));
        } else {
            out.push_str(&format!(".\"{}\"", seg.replace('\\', "\\\\").replace('"', "\\\"")));
        }
    }
    out
}

fn sanitize_alias(name: &str) -> String {
    name.replace('.', "__").chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}

fn split_path(raw: &str, whole: &str) -> Result<Vec<String>, QueryBuilderError> {
    let segs: Vec<String> = raw.split('.').map(str::to_string).collect();
    if segs.iter().any(|s| s.is_empty()) {
        return Err(QueryBuilderError::InvalidField(whole.to_string()));
    }
    Ok(segs)
}

pub struct ColumnRegistry {
    columns: &'static [ColumnSpec],
}

static CALLS_REGISTRY: Lazy<ColumnRegistry> = Lazy::new(|| ColumnRegistry { columns: CALLS_V1 });

impl ColumnRegistry {
    /// The registry for the current calls schema.
    pub fn calls() -> &'static ColumnRegistry { &CALLS_REGISTRY }

    pub fn get(&self, name: &str) -> Option<&ColumnSpec> { self.columns.iter().find(|c| c.name == name) }

    pub fn resolve(&self, name: &str) -> Result<FieldDescriptor, QueryBuilderError> {
        if let Some(spec) = self.get(name) {
            return Ok(FieldDescriptor::Column(*spec));
        }
        if let Some(spec) = self.get(&format!("{}_dump", name)) {
            return Ok(FieldDescriptor::Dynamic { name: name.to_string(), column: *spec, path: Vec::new() });
        }
        if let Some(rest) = name.strip_prefix("feedback.") {
            return parse_feedback(rest, name);
        }
        if name == "summary.weave" || name.starts_with("summary.weave.") {
            let key = name.strip_prefix("summary.weave.").unwrap_or_default();
            return SummaryField::from_key(key)
                .map(FieldDescriptor::Summary)
                .ok_or_else(|| QueryBuilderError::InvalidField(name.to_string()));
        }
        if let Some((head, rest)) = name.split_once('.') {
            let dump = if head.ends_with("_dump") { head.to_string() } else { format!("{}_dump", head) };
            if let Some(spec) = self.get(&dump) {
                let path = split_path(rest, name)?;
                return Ok(FieldDescriptor::Dynamic { name: name.to_string(), column: *spec, path });
            }
        }
        Err(QueryBuilderError::InvalidField(name.to_string()))
    }
}

fn parse_feedback(rest: &str, whole: &str) -> Result<FieldDescriptor, QueryBuilderError> {
    let invalid = || QueryBuilderError::InvalidField(whole.to_string());
    let inner = rest.strip_prefix('[').ok_or_else(invalid)?;
    let (feedback_type, tail) = inner.split_once(']').ok_or_else(invalid)?;
    if feedback_type.is_empty() {
        return Err(invalid());
    }
    let tail = tail.strip_prefix('.').ok_or_else(invalid)?;
    let (target, path) = match tail.split_once('.') {
        Some((t, p)) => (t, split_path(p, whole)?),
        None => (tail, Vec::new()),
    };
    let target = match target {
        "payload" => FeedbackTarget::Payload,
        "runnable_ref" if path.is_empty() => FeedbackTarget::RunnableRef,
        _ => return Err(invalid()),
    };
    Ok(FieldDescriptor::Feedback { name: whole.to_string(), feedback_type: feedback_type.to_string(), target, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::emitter::dialect::ClickHouseDialect;

    fn ctx() -> SqlCtx<'static> { SqlCtx { calls: "calls_merged", feedback: "feedback", dialect: &ClickHouseDialect } }

    #[test]
    fn resolves_plain_columns() {
        let reg = ColumnRegistry::calls();
        let id = reg.resolve("id").unwrap();
        assert!(!id.is_heavy());
        assert_eq!(id.compile(&ctx(), &mut ParamBuilder::new()), "calls_merged.id");
        let op = reg.resolve("op_name").unwrap();
        assert_eq!(op.compile(&ctx(), &mut ParamBuilder::new()), "any(calls_merged.op_name)");
        let refs = reg.resolve("input_refs").unwrap();
        assert_eq!(refs.compile(&ctx(), &mut ParamBuilder::new()), "array_concat_agg(calls_merged.input_refs)");
        assert!(matches!(reg.resolve("nope"), Err(QueryBuilderError::InvalidField(_))));
    }

    #[test]
    fn dump_alias_and_dynamic_paths() {
        let reg = ColumnRegistry::calls();
        let inputs = reg.resolve("inputs").unwrap();
        assert!(inputs.is_heavy());
        assert_eq!(inputs.alias(), "inputs_dump");
        assert!(!inputs.is_json_valued());

        let mut pb = ParamBuilder::new();
        let nested = reg.resolve("inputs.model.messages.0").unwrap();
        assert_eq!(nested.part(), CallPart::Start);
        assert_eq!(nested.compile(&ctx(), &mut pb), "JSON_VALUE(any(calls_merged.inputs_dump), {pb_0:String})");
        assert_eq!(pb.into_table().get("pb_0").unwrap().value, "$.\"model\".\"messages\"[0]");
        assert_eq!(nested.alias(), "inputs__model__messages__0");
        assert_eq!(nested.raw_column(&ctx()).as_deref(), Some("calls_merged.inputs_dump"));
        assert!(matches!(reg.resolve("inputs..x"), Err(QueryBuilderError::InvalidField(_))));
        assert!(matches!(reg.resolve("bogus.x"), Err(QueryBuilderError::InvalidField(_))));
    }

    #[test]
    fn summary_fields_are_light() {
        let reg = ColumnRegistry::calls();
        let status = reg.resolve("summary.weave.status").unwrap();
        assert!(!status.is_heavy());
        let mut pb = ParamBuilder::new();
        let sql = status.compile(&ctx(), &mut pb);
        assert!(sql.starts_with("CASE WHEN any(calls_merged.exception) IS NOT NULL"));
        assert_eq!(pb.len(), 3);
        assert!(matches!(reg.resolve("summary.weave.nope"), Err(QueryBuilderError::InvalidField(_))));
        assert!(matches!(reg.resolve("summary.weave"), Err(QueryBuilderError::InvalidField(_))));
        // Anything else under summary is a plain dump path.
        assert!(reg.resolve("summary.usage.tokens").unwrap().is_heavy());
    }

    #[test]
    fn feedback_paths() {
        let reg = ColumnRegistry::calls();
        let fb = reg.resolve("feedback.[wandb.reaction.1].payload.emoji").unwrap();
        assert!(fb.is_heavy() && fb.needs_feedback_join());
        let mut pb = ParamBuilder::new();
        assert_eq!(
            fb.compile(&ctx(), &mut pb),
            "JSON_VALUE(anyIf(feedback.payload_dump, feedback.feedback_type = {pb_0:String}), {pb_1:String})"
        );
        let any_type = reg.resolve("feedback.[*].payload.score").unwrap();
        assert!(any_type.compile(&ctx(), &mut ParamBuilder::new()).starts_with("JSON_VALUE(any(feedback.payload_dump)"));
        assert!(reg.resolve("feedback.[t].runnable_ref").is_ok());
        for bad in ["feedback.t.payload", "feedback.[t]", "feedback.[].payload", "feedback.[t].runnable_ref.x", "feedback.[t].other"] {
            assert!(matches!(reg.resolve(bad), Err(QueryBuilderError::InvalidField(_))), "{bad}");
        }
    }
}
