//! Reference expansion: paths under a declared expand column hold object
//! references (`weave:///<project>/object/<name>:<digest>` or the bare
//! `<name>:<digest>` / `<digest>` tail). Conditions and sorts on deeper
//! paths are answered by CTE chains over the object stores instead of the
//! call dumps.

use std::collections::HashMap;

use log::{debug, warn};

use super::ast::Expr;
use super::columns::{ColumnRegistry, ColumnSpec, FieldDescriptor, SqlCtx, json_path};
use super::compiler::compile_with_override;
use super::emitter::JoinSet;
use super::errors::QueryBuilderError;
use super::params::ParamBuilder;

/// How a field path splits across reference hops.
#[derive(Debug, Clone, PartialEq)]
pub struct RefChain {
    /// Dump column on the calls table holding the first reference.
    pub column: ColumnSpec,
    /// Path inside the call dump to the first reference.
    pub calls_path: Vec<String>,
    /// Paths inside intermediate objects to the next reference, outermost first.
    pub hops: Vec<Vec<String>>,
    /// Path inside the final object to the compared value.
    pub leaf: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Store {
    Objects,
    Rows,
}

pub struct ExpansionPlanner {
    project_id: String,
    expand: Vec<(&'static str, Vec<String>)>,
    objects_table: String,
    rows_table: String,
    ctes: Vec<(String, String)>,
    by_key: HashMap<String, String>,
}

impl ExpansionPlanner {
    pub fn new(project_id: &str, expand_columns: &[String], objects_table: &str, rows_table: &str) -> Self {
        let registry = ColumnRegistry::calls();
        let mut expand = Vec::new();
        for raw in expand_columns {
            match registry.resolve(raw) {
                Ok(FieldDescriptor::Dynamic { column, path, .. }) if !path.is_empty() => expand.push((column.name, path)),
                _ => warn!("ignoring expand column {:?}: not a path inside a dump column", raw),
            }
        }
        Self {
            project_id: project_id.to_string(),
            expand,
            objects_table: objects_table.to_string(),
            rows_table: rows_table.to_string(),
            ctes: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn has_expand_columns(&self) -> bool { !self.expand.is_empty() }

    /// CTEs built so far, in dependency order.
    pub fn ctes(&self) -> &[(String, String)] { &self.ctes }

    pub fn chain_for(&self, name: &str) -> Option<RefChain> {
        if self.expand.is_empty() {
            return None;
        }
        let FieldDescriptor::Dynamic { column, path, .. } = ColumnRegistry::calls().resolve(name).ok()? else {
            return None;
        };
        let cuts: Vec<usize> = (1..=path.len())
            .filter(|&i| self.expand.iter().any(|(c, p)| *c == column.name && p.as_slice() == &path[..i]))
            .collect();
        let (&first, &last) = (cuts.first()?, cuts.last()?);
        if last == path.len() {
            // The reference itself is compared; nothing to resolve.
            return None;
        }
        Some(RefChain {
            column,
            calls_path: path[..first].to_vec(),
            hops: cuts.windows(2).map(|w| path[w[0]..w[1]].to_vec()).collect(),
            leaf: path[last..].to_vec(),
        })
    }

    /// Calls-level predicate for a comparison on an expanded path: the
    /// call's reference must resolve to an object satisfying `expr`.
    pub fn filter_predicate(
        &mut self,
        expr: &Expr,
        name: &str,
        chain: &RefChain,
        ctx: &SqlCtx,
        pb: &mut ParamBuilder,
    ) -> Result<String, QueryBuilderError> {
        let key = format!("filter:{}", serde_json::to_string(expr)?);
        let leaf_key = format!("{}#{}", key, chain.hops.len());
        let mut current = match self.by_key.get(&leaf_key) {
            Some(existing) => existing.clone(),
            None => {
                let body = self.leaf_filter_body(expr, name, &chain.leaf, ctx, pb)?;
                self.push_cte(leaf_key, body)
            }
        };
        for (depth, hop) in chain.hops.iter().enumerate().rev() {
            let hop_key = format!("{}#{}", key, depth);
            current = match self.by_key.get(&hop_key) {
                Some(existing) => existing.clone(),
                None => {
                    let body = self.hop_filter_body(hop, &current, ctx, pb);
                    self.push_cte(hop_key, body)
                }
            };
        }
        let slot = pb.add(json_path(&chain.calls_path));
        let value = ctx.dialect.emit_json_value(&chain.column.compile(ctx), &slot);
        Ok(ref_in(&value, &current, ctx, pb))
    }

    /// Post-grouping value of an expanded path, for sorting and selection.
    /// Registers the LEFT JOIN it needs in `joins`.
    pub fn value_column(&mut self, chain: &RefChain, ctx: &SqlCtx, pb: &mut ParamBuilder, joins: &mut JoinSet) -> String {
        let key = format!("value:{}:{}:{:?}:{}", chain.column.name, chain.calls_path.join("."), chain.hops, chain.leaf.join("."));
        let leaf_key = format!("{}#{}", key, chain.hops.len());
        let mut current = match self.by_key.get(&leaf_key) {
            Some(existing) => existing.clone(),
            None => {
                let body = self.leaf_value_body(&chain.leaf, ctx, pb);
                self.push_cte(leaf_key, body)
            }
        };
        for (depth, hop) in chain.hops.iter().enumerate().rev() {
            let hop_key = format!("{}#{}", key, depth);
            current = match self.by_key.get(&hop_key) {
                Some(existing) => existing.clone(),
                None => {
                    let body = self.hop_value_body(hop, &current, ctx, pb);
                    self.push_cte(hop_key, body)
                }
            };
        }
        let alias = format!("{}_v", current);
        if !joins.contains(&alias) {
            let slot = pb.add(json_path(&chain.calls_path));
            let raw = format!("{}.{}", ctx.calls, chain.column.name);
            let value = ctx.dialect.emit_json_value(&raw, &slot);
            let on = ref_matches(&value, &alias, ctx, pb);
            joins.push(alias.clone(), format!("LEFT JOIN {} AS {} ON {}", current, alias, on));
        }
        format!("max({}.leaf_val)", alias)
    }

    /// Pre-grouping guard for a condition resolved through `chain`: only rows
    /// that carry references (or belong to the part that does not populate
    /// the dump) can match.
    pub fn guard(&self, chain: &RefChain, ctx: &SqlCtx) -> Option<String> {
        let (refs, complement) = match chain.column.name {
            "inputs_dump" => ("input_refs", "started_at"),
            "output_dump" => ("output_refs", "ended_at"),
            _ => return None,
        };
        Some(format!("(length({c}.{refs}) > 0 OR {c}.{complement} IS NULL)", c = ctx.calls))
    }

    fn push_cte(&mut self, key: String, body: String) -> String {
        let name = format!("ref_cte_{}", self.ctes.len());
        debug!("reference expansion cte {} for {}", name, key);
        self.ctes.push((name.clone(), body));
        self.by_key.insert(key, name.clone());
        name
    }

    fn table(&self, store: Store) -> &str {
        match store {
            Store::Objects => &self.objects_table,
            Store::Rows => &self.rows_table,
        }
    }

    /// `ref` and `ref_tail` columns for rows of `store`, qualified by `alias`.
    fn ref_columns(&self, store: Store, alias: &str, pb: &mut ParamBuilder) -> (String, String) {
        match store {
            Store::Objects => {
                let prefix = pb.add(format!("weave:///{}/object/", self.project_id));
                let colon = pb.add(":");
                let colon_tail = pb.add(":");
                (
                    format!("concat({prefix}, {alias}object_id, {colon}, {alias}digest)"),
                    format!("concat({alias}object_id, {colon_tail}, {alias}digest)"),
                )
            }
            Store::Rows => (format!("{alias}digest"), format!("{alias}digest")),
        }
    }

    fn leaf_filter_body(
        &self,
        expr: &Expr,
        name: &str,
        leaf: &[String],
        ctx: &SqlCtx,
        pb: &mut ParamBuilder,
    ) -> Result<String, QueryBuilderError> {
        let mut parts = Vec::with_capacity(2);
        for store in [Store::Objects, Store::Rows] {
            let (reference, tail) = self.ref_columns(store, "", pb);
            let slot = pb.add(json_path(leaf));
            let value = ctx.dialect.emit_json_value("val_dump", &slot);
            let cond = compile_with_override(expr, ctx, pb, name, &value)?;
            let pid = pb.add(self.project_id.as_str());
            parts.push(format!(
                "SELECT DISTINCT digest, {reference} AS ref, {tail} AS ref_tail FROM {} WHERE project_id = {pid} AND {cond}",
                self.table(store)
            ));
        }
        Ok(parts.join(" UNION ALL "))
    }

    fn hop_filter_body(&self, hop: &[String], inner: &str, ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
        let mut parts = Vec::with_capacity(2);
        for store in [Store::Objects, Store::Rows] {
            let (reference, tail) = self.ref_columns(store, "", pb);
            let slot = pb.add(json_path(hop));
            let value = ctx.dialect.emit_json_value("val_dump", &slot);
            let matches = ref_in(&value, inner, ctx, pb);
            let pid = pb.add(self.project_id.as_str());
            parts.push(format!(
                "SELECT DISTINCT digest, {reference} AS ref, {tail} AS ref_tail FROM {} WHERE project_id = {pid} AND {matches}",
                self.table(store)
            ));
        }
        parts.join(" UNION ALL ")
    }

    fn leaf_value_body(&self, leaf: &[String], ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
        let mut parts = Vec::with_capacity(2);
        for store in [Store::Objects, Store::Rows] {
            let (reference, tail) = self.ref_columns(store, "", pb);
            let slot = pb.add(json_path(leaf));
            let value = ctx.dialect.emit_json_value("val_dump", &slot);
            let pid = pb.add(self.project_id.as_str());
            parts.push(format!(
                "SELECT digest, {reference} AS ref, {tail} AS ref_tail, {value} AS leaf_val FROM {} WHERE project_id = {pid}",
                self.table(store)
            ));
        }
        parts.join(" UNION ALL ")
    }

    fn hop_value_body(&self, hop: &[String], inner: &str, ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
        let mut parts = Vec::with_capacity(2);
        for store in [Store::Objects, Store::Rows] {
            let (reference, tail) = self.ref_columns(store, "o.", pb);
            let slot = pb.add(json_path(hop));
            let value = ctx.dialect.emit_json_value("o.val_dump", &slot);
            let on = ref_matches(&value, "v", ctx, pb);
            let pid = pb.add(self.project_id.as_str());
            parts.push(format!(
                "SELECT o.digest AS digest, {reference} AS ref, {tail} AS ref_tail, v.leaf_val AS leaf_val FROM {} AS o INNER JOIN {inner} AS v ON {on} WHERE o.project_id = {pid}",
                self.table(store)
            ));
        }
        parts.join(" UNION ALL ")
    }
}

/// `value` names one of the references collected in CTE `cte`, either in
/// full or by its trailing segment.
fn ref_in(value: &str, cte: &str, ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
    let sep = pb.add("/");
    format!(
        "({value} IN (SELECT ref FROM {cte}) OR {} IN (SELECT ref_tail FROM {cte}))",
        ctx.dialect.emit_last_segment(value, &sep)
    )
}

/// Join condition between `value` and a reference CTE aliased `alias`.
fn ref_matches(value: &str, alias: &str, ctx: &SqlCtx, pb: &mut ParamBuilder) -> String {
    let sep = pb.add("/");
    format!("({value} = {alias}.ref OR {} = {alias}.ref_tail)", ctx.dialect.emit_last_segment(value, &sep))
}
