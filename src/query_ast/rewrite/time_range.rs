//! Call ids are UUIDv7, whose leading 48 bits are the creation time in
//! milliseconds. Bounds on `started_at` (and upper bounds on `ended_at`)
//! therefore translate into bounds on the id, which prune before grouping.
//! Ids outside that scheme always pass.

use log::debug;

use super::PrefilterCtx;
use crate::query_ast::ast::Expr;
use crate::query_ast::params::ParamBuilder;

const MAX_UUID_MILLIS: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    /// field >= T
    Lower,
    /// field <= T
    Upper,
}

impl Bound {
    fn flip(self) -> Self {
        match self {
            Bound::Lower => Bound::Upper,
            Bound::Upper => Bound::Lower,
        }
    }
}

/// Id predicate implied by a timestamp comparison, or by its negation when
/// `negated` is set.
pub fn id_bound(expr: &Expr, negated: bool, cx: &PrefilterCtx, pb: &mut ParamBuilder) -> Option<String> {
    let (field, bound, secs) = match expr {
        Expr::Gt(l, r) | Expr::Gte(l, r) => match (l.as_ref(), r.as_ref()) {
            (Expr::GetField(f), Expr::Literal(v)) => (f.as_str(), Bound::Lower, v.as_f64()?),
            (Expr::Literal(v), Expr::GetField(f)) => (f.as_str(), Bound::Upper, v.as_f64()?),
            _ => return None,
        },
        _ => return None,
    };
    let bound = if negated { bound.flip() } else { bound };
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let buffer = cx.config.id_time_buffer_secs as f64;
    let calls = cx.sql.calls;
    let sql = match (field, bound) {
        ("started_at", Bound::Lower) => {
            let scheme = pb.add(cx.config.time_ordered_id_pattern.as_str());
            let millis = ((secs - buffer).max(0.0) * 1000.0).floor() as u64;
            let floor = pb.add(encode_millis(millis.min(MAX_UUID_MILLIS)));
            format!("(NOT match({calls}.id, {scheme}) OR {calls}.id > {floor})")
        }
        // A call cannot end before it starts, so an end bound caps the start too.
        ("started_at" | "ended_at", Bound::Upper) => {
            let millis = ((secs + buffer) * 1000.0).floor() as u64 + 1;
            if millis > MAX_UUID_MILLIS {
                return None;
            }
            let scheme = pb.add(cx.config.time_ordered_id_pattern.as_str());
            let ceiling = pb.add(encode_millis(millis));
            format!("(NOT match({calls}.id, {scheme}) OR {calls}.id < {ceiling})")
        }
        _ => return None,
    };
    debug!("id range prefilter from {} {:?} bound", field, bound);
    Some(sql)
}

/// Smallest UUIDv7 string issued at `millis`.
pub fn encode_millis(millis: u64) -> String {
    format!("{:08x}-{:04x}-7000-8000-000000000000", millis >> 16, millis & 0xffff)
}
