use log::warn;
use sqlformat::{FormatOptions, Indent, QueryParams};

use crate::query_ast::params::placeholders;

// Centralized sqlformat options for compiled queries
pub fn default_sqlformat_options() -> FormatOptions<'static> {
    FormatOptions {
        joins_as_top_level: true,
        indent: Indent::Spaces(4),
        uppercase: None,
        lines_between_queries: 1,
        inline: false,
        max_inline_block: 50, // characters allowed to keep a parenthesized block inline
        max_inline_arguments: Some(40),
        max_inline_top_level: Some(40),
        ..Default::default()
    }
}

/// Reindent compiled SQL. Cosmetic only: if the formatter disturbs any
/// `{name:Type}` placeholder the input comes back unchanged.
pub fn format_sql(sql: &str) -> String {
    let formatted = sqlformat::format(sql, &QueryParams::None, &default_sqlformat_options());
    if formatted.trim().is_empty() || placeholders(&formatted) != placeholders(sql) {
        warn!("sql formatting altered query parameters; returning unformatted sql");
        return sql.to_string();
    }
    formatted
}
