use super::columns::SqlCtx;
use super::emitter::JoinSet;
use super::emitter::dialect::JoinKind;
use super::params::ParamBuilder;

/// Feedback rows point at calls through `weave-trace-internal:///<project>/call/<id>`.
pub fn add_feedback_join(ctx: &SqlCtx, project_id: &str, pb: &mut ParamBuilder, joins: &mut JoinSet) {
    if joins.contains(ctx.feedback) {
        return;
    }
    let prefix = pb.add(format!("weave-trace-internal:///{}/call/", project_id));
    joins.push(
        ctx.feedback,
        format!(
            "{} {} ON ({}.weave_ref = concat({}, {}.id))",
            ctx.dialect.emit_join_kind(JoinKind::Left),
            ctx.feedback,
            ctx.feedback,
            prefix,
            ctx.calls
        ),
    );
}
