pub mod dialect;
use dialect::SqlDialect;

/// Joins keyed by the alias they introduce, kept in insertion order.
#[derive(Debug, Default, Clone)]
pub struct JoinSet(Vec<(String, String)>);

impl JoinSet {
    pub fn contains(&self, alias: &str) -> bool { self.0.iter().any(|(a, _)| a == alias) }

    /// Adds `clause` unless a join with the same alias is already present.
    pub fn push(&mut self, alias: impl Into<String>, clause: impl Into<String>) {
        let alias = alias.into();
        if !self.contains(&alias) {
            self.0.push((alias, clause.into()));
        }
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &str> { self.0.iter().map(|(_, c)| c.as_str()) }
}

/// One SELECT over the calls table, already compiled to SQL fragments.
#[derive(Debug, Default, Clone)]
pub struct FlatSelect {
    pub table: String,
    pub projection: Vec<String>,
    pub joins: JoinSet,
    pub predicates: Vec<String>,
    pub group_exprs: Vec<String>,
    pub having: Vec<String>,
    pub sort: Vec<String>,
    /// Placeholder slots, never raw numbers.
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl FlatSelect {
    pub fn emit(&self, dialect: &dyn SqlDialect) -> String {
        let proj_sql = if self.projection.is_empty() { "*".to_string() } else { self.projection.join(", ") };
        let mut sql = format!("SELECT {} FROM {}", proj_sql, dialect.quote_ident(&self.table));
        for join in self.joins.iter() {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.predicates.is_empty() {
            sql.push_str(&format!(" WHERE {}", self.predicates.join(" AND ")));
        }
        if !self.group_exprs.is_empty() {
            sql.push_str(&format!(" GROUP BY ({})", self.group_exprs.join(", ")));
        }
        if !self.having.is_empty() {
            sql.push_str(&format!(" HAVING {}", self.having.join(" AND ")));
        }
        if !self.sort.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.sort.join(", ")));
        }
        sql.push_str(&dialect.emit_limit(self.limit.as_deref(), self.offset.as_deref()));
        sql
    }
}

/// Wrap `body` in a WITH clause. Bodies must not carry a trailing semicolon.
pub fn emit_with(ctes: &[(String, String)], recursive: bool, body: &str) -> String {
    if ctes.is_empty() {
        return body.to_string();
    }
    let parts = ctes
        .iter()
        .map(|(name, sql)| format!("{} AS ({})", name, sql.trim().trim_end_matches(';')))
        .collect::<Vec<_>>();
    format!("WITH {}{} {}", if recursive { "RECURSIVE " } else { "" }, parts.join(", "), body)
}

#[cfg(test)]
mod tests {
    use super::dialect::ClickHouseDialect;
    use super::*;

    #[test]
    fn emits_clauses_in_order() {
        let mut joins = JoinSet::default();
        joins.push("feedback", "LEFT JOIN feedback ON (x)");
        joins.push("feedback", "LEFT JOIN feedback ON (y)");
        let flat = FlatSelect {
            table: "calls_merged".into(),
            projection: vec!["calls_merged.id AS id".into()],
            joins,
            predicates: vec!["a".into(), "b".into()],
            group_exprs: vec!["calls_merged.project_id".into(), "calls_merged.id".into()],
            having: vec!["c".into()],
            sort: vec!["d DESC".into()],
            limit: Some("{pb_0:UInt64}".into()),
            offset: Some("{pb_1:UInt64}".into()),
        };
        assert_eq!(
            flat.emit(&ClickHouseDialect),
            "SELECT calls_merged.id AS id FROM calls_merged LEFT JOIN feedback ON (x) WHERE a AND b \
             GROUP BY (calls_merged.project_id, calls_merged.id) HAVING c ORDER BY d DESC LIMIT {pb_0:UInt64} OFFSET {pb_1:UInt64}"
        );
    }

    #[test]
    fn with_clause() {
        let ctes = vec![("a".to_string(), "SELECT 1;".to_string()), ("b".to_string(), "SELECT 2".to_string())];
        assert_eq!(emit_with(&ctes, false, "SELECT 3"), "WITH a AS (SELECT 1), b AS (SELECT 2) SELECT 3");
        assert_eq!(emit_with(&ctes[..1], true, "SELECT 3"), "WITH RECURSIVE a AS (SELECT 1) SELECT 3");
        assert_eq!(emit_with(&[], true, "SELECT 3"), "SELECT 3");
    }
}
