//! Table-changing DDL detection
//!
//! Query events carry statement text only. To keep cached table metadata in
//! step with the server, the statements that change a table's shape are
//! recognised and their target tables extracted:
//!
//! - `CREATE [TEMPORARY] TABLE [IF NOT EXISTS] t ...` (including `LIKE`)
//! - `ALTER [ONLINE] [IGNORE] TABLE t ...`
//! - `RENAME TABLE a TO b [, c TO d ...]`
//! - `DROP [TEMPORARY] TABLE [IF EXISTS] a [, b ...]`
//! - `TRUNCATE [TABLE] t`
//! - `CREATE [UNIQUE|FULLTEXT|SPATIAL] INDEX i ON t ...`, `DROP INDEX i ON t`
//!
//! Before matching, comments are removed (executable `/*!NNNNN ... */`
//! comments keep their body) and quoted literals are replaced through an
//! [`ExprEvaluator`], so text inside `COMMENT '...'` or `DEFAULT '...'`
//! cannot be mistaken for a table name.

use regex::Regex;
use std::sync::{Arc, LazyLock};

/// Produces the stand-in text for literal expressions during normalization.
pub trait ExprEvaluator: Send + Sync {
    /// Replacement for a quoted literal, quotes included in `literal`.
    fn literal(&self, literal: &str) -> String;
}

/// Replaces every literal with `?`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderEvaluator;

impl ExprEvaluator for PlaceholderEvaluator {
    fn literal(&self, _literal: &str) -> String {
        "?".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    CreateTable,
    AlterTable,
    RenameTable,
    DropTable,
    TruncateTable,
    CreateIndex,
    DropIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

/// One table affected by a DDL statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlChange {
    pub kind: DdlKind,
    pub table: TableRef,
    /// New name of a renamed table
    pub renamed_to: Option<TableRef>,
}

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    ddl_regex(r"^CREATE\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?")
});
static ALTER_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    ddl_regex(r"^ALTER\s+(?:ONLINE\s+|OFFLINE\s+)?(?:IGNORE\s+)?TABLE\s+")
});
static RENAME_TABLE: LazyLock<Regex> = LazyLock::new(|| ddl_regex(r"^RENAME\s+TABLES?\s+"));
static DROP_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    ddl_regex(r"^DROP\s+(?:TEMPORARY\s+)?TABLES?\s+(?:IF\s+EXISTS\s+)?")
});
static TRUNCATE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| ddl_regex(r"^TRUNCATE\s+(?:TABLE\s+)?"));
static CREATE_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    ddl_regex(r"^CREATE\s+(?:ONLINE\s+|OFFLINE\s+)?(?:UNIQUE\s+|FULLTEXT\s+|SPATIAL\s+)?INDEX\s+")
});
static DROP_INDEX: LazyLock<Regex> =
    LazyLock::new(|| ddl_regex(r"^DROP\s+(?:ONLINE\s+|OFFLINE\s+)?INDEX\s+"));

#[allow(clippy::expect_used)]
fn ddl_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static DDL pattern")
}

/// Extracts table targets from DDL statement text.
#[derive(Clone)]
pub struct DdlParser {
    evaluator: Arc<dyn ExprEvaluator>,
}

impl Default for DdlParser {
    fn default() -> Self {
        Self::new(Arc::new(PlaceholderEvaluator))
    }
}

impl std::fmt::Debug for DdlParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdlParser").finish_non_exhaustive()
    }
}

impl DdlParser {
    pub fn new(evaluator: Arc<dyn ExprEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Tables changed by `sql`. Unqualified names resolve to `default_schema`.
    ///
    /// Statements that do not change a table yield nothing.
    pub fn parse(&self, sql: &str, default_schema: &str) -> Vec<DdlChange> {
        let normalized = self.normalize(sql);
        normalized
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .flat_map(|stmt| parse_statement(stmt, default_schema))
            .collect()
    }

    /// Strip comments, replace literals and collapse whitespace.
    pub fn normalize(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '/' if sql[i..].starts_with("/*") => {
                    let body_start = i + 2;
                    let end = sql[body_start..]
                        .find("*/")
                        .map(|e| body_start + e)
                        .unwrap_or(sql.len());
                    let body = &sql[body_start..end];
                    if let Some(exec) = body.strip_prefix('!') {
                        let code = exec.trim_start_matches(|c: char| c.is_ascii_digit());
                        out.push(' ');
                        out.push_str(&self.normalize(code));
                    }
                    out.push(' ');
                    skip_to(&mut chars, (end + 2).min(sql.len()));
                }
                '-' if sql[i..].starts_with("-- ") || &sql[i..] == "--" => {
                    let end = sql[i..].find('\n').map(|e| i + e).unwrap_or(sql.len());
                    out.push(' ');
                    skip_to(&mut chars, end);
                }
                '#' => {
                    let end = sql[i..].find('\n').map(|e| i + e).unwrap_or(sql.len());
                    out.push(' ');
                    skip_to(&mut chars, end);
                }
                '\'' | '"' => {
                    let end = literal_end(sql, i, c);
                    out.push_str(&self.evaluator.literal(&sql[i..end]));
                    skip_to(&mut chars, end);
                }
                '`' => {
                    let end = quoted_identifier_end(sql, i);
                    out.push_str(&sql[i..end]);
                    skip_to(&mut chars, end);
                }
                c if c.is_whitespace() => {
                    if !out.ends_with(' ') {
                        out.push(' ');
                    }
                }
                c => out.push(c),
            }
        }

        collapse_whitespace(&out)
    }
}

fn skip_to(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, end: usize) {
    while chars.peek().is_some_and(|(j, _)| *j < end) {
        chars.next();
    }
}

/// Byte offset just past the literal opened by `quote` at `start`.
fn literal_end(sql: &str, start: usize, quote: char) -> usize {
    let bytes = sql.as_bytes();
    let q = quote as u8;
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == q && bytes.get(i + 1) == Some(&q) => i += 2,
            b if b == q => return i + 1,
            _ => i += 1,
        }
    }
    sql.len()
}

fn quoted_identifier_end(sql: &str, start: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'`' {
            if bytes.get(i + 1) == Some(&b'`') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    sql.len()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_statement(stmt: &str, default_schema: &str) -> Vec<DdlChange> {
    let single = |kind: DdlKind, rest: &str| -> Vec<DdlChange> {
        take_table(rest, default_schema)
            .map(|(table, _)| {
                vec![DdlChange {
                    kind,
                    table,
                    renamed_to: None,
                }]
            })
            .unwrap_or_default()
    };

    if let Some(m) = CREATE_TABLE.find(stmt) {
        return single(DdlKind::CreateTable, &stmt[m.end()..]);
    }
    if let Some(m) = ALTER_TABLE.find(stmt) {
        return single(DdlKind::AlterTable, &stmt[m.end()..]);
    }
    if let Some(m) = TRUNCATE_TABLE.find(stmt) {
        return single(DdlKind::TruncateTable, &stmt[m.end()..]);
    }
    if let Some(m) = RENAME_TABLE.find(stmt) {
        return parse_rename(&stmt[m.end()..], default_schema);
    }
    if let Some(m) = DROP_TABLE.find(stmt) {
        return parse_table_list(&stmt[m.end()..], default_schema)
            .into_iter()
            .map(|table| DdlChange {
                kind: DdlKind::DropTable,
                table,
                renamed_to: None,
            })
            .collect();
    }
    for (re, kind) in [
        (&*CREATE_INDEX, DdlKind::CreateIndex),
        (&*DROP_INDEX, DdlKind::DropIndex),
    ] {
        if let Some(m) = re.find(stmt) {
            let Some((_, rest)) = take_ident(&stmt[m.end()..]) else {
                return Vec::new();
            };
            let Some(rest) = strip_keyword(rest, "ON") else {
                return Vec::new();
            };
            return single(kind, rest);
        }
    }
    Vec::new()
}

fn parse_rename(mut rest: &str, default_schema: &str) -> Vec<DdlChange> {
    let mut changes = Vec::new();
    loop {
        let Some((from, after)) = take_table(rest, default_schema) else {
            break;
        };
        let Some(after) = strip_keyword(after, "TO") else {
            break;
        };
        let Some((to, after)) = take_table(after, default_schema) else {
            break;
        };
        changes.push(DdlChange {
            kind: DdlKind::RenameTable,
            table: from,
            renamed_to: Some(to),
        });
        match after.trim_start().strip_prefix(',') {
            Some(next) => rest = next,
            None => break,
        }
    }
    changes
}

fn parse_table_list(mut rest: &str, default_schema: &str) -> Vec<TableRef> {
    let mut tables = Vec::new();
    while let Some((table, after)) = take_table(rest, default_schema) {
        tables.push(table);
        match after.trim_start().strip_prefix(',') {
            Some(next) => rest = next,
            None => break,
        }
    }
    tables
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    let boundary = s[keyword.len()..]
        .chars()
        .next()
        .map_or(true, |c| c.is_whitespace());
    (head.eq_ignore_ascii_case(keyword) && boundary).then(|| &s[keyword.len()..])
}

/// `[schema.]table`, either part optionally backtick-quoted.
fn take_table<'a>(s: &'a str, default_schema: &str) -> Option<(TableRef, &'a str)> {
    let (first, rest) = take_ident(s)?;
    let trimmed = rest.trim_start();
    if let Some(after_dot) = trimmed.strip_prefix('.') {
        let (second, rest) = take_ident(after_dot)?;
        return Some((TableRef::new(first, second), rest));
    }
    Some((TableRef::new(default_schema, first), rest))
}

fn take_ident(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if s.starts_with('`') {
        let end = quoted_identifier_end(s, 0);
        if end < 2 || !s[..end].ends_with('`') {
            return None;
        }
        let name = s[1..end - 1].replace("``", "`");
        return Some((name, &s[end..]));
    }
    let end = s
        .find(|c: char| c.is_whitespace() || matches!(c, '.' | ',' | ';' | '(' | ')'))
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].to_string(), &s[end..]))
}
