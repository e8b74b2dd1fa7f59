//! Placeholder translation.
//!
//! Statements produced by the session layer use the database-agnostic `?` marker.
//! [`ParameterTranslator`] rewrites each marker into the positional syntax a given
//! [`Dialect`] expects (`$1`, `?1`, `:1`, `@P1`) while leaving alone anything that
//! sits inside a quoted literal, a quoted identifier or a comment.

use crate::dialect::Dialect;
use std::borrow::Cow;

/// The result of translating one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translated<'a> {
    /// The rewritten statement; borrowed when nothing had to change.
    pub sql: Cow<'a, str>,
    /// Number of `?` markers that were found outside literals and comments.
    pub count: usize,
}

/// Rewrites generic `?` markers into dialect-specific placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterTranslator {
    dialect: Dialect,
}

impl ParameterTranslator {
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Translate a statement for this translator's dialect.
    pub fn translate<'a>(&self, sql: &'a str) -> Translated<'a> {
        let mut out = String::with_capacity(sql.len() + 16);
        let count = scan(sql, self.dialect, &mut out);
        if count == 0 || self.dialect.uses_anonymous_placeholders() {
            return Translated {
                sql: Cow::Borrowed(sql),
                count,
            };
        }
        Translated {
            sql: Cow::Owned(out),
            count,
        }
    }

    /// Count the markers a statement carries without rewriting it.
    pub fn count_placeholders(&self, sql: &str) -> usize {
        let mut sink = String::with_capacity(sql.len());
        scan(sql, self.dialect, &mut sink)
    }
}

fn scan(sql: &str, dialect: Dialect, out: &mut String) -> usize {
    let chars: Vec<char> = sql.chars().collect();
    let len = chars.len();
    let mut i = 0;
    let mut count = 0;

    while i < len {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match ch {
            '\'' | '"' => {
                i = copy_quoted(&chars, i, ch, dialect.backslash_escapes_in_literals(), out);
            }
            '`' => i = copy_quoted(&chars, i, ch, false, out),
            '[' if dialect.supports_bracket_identifiers() => {
                i = copy_quoted(&chars, i, ']', false, out);
            }
            'E' | 'e'
                if dialect.supports_escape_strings()
                    && next == Some('\'')
                    && !(i > 0 && is_word_char(chars[i - 1])) =>
            {
                out.push(ch);
                i = copy_quoted(&chars, i + 1, '\'', true, out);
            }
            '-' if next == Some('-') => {
                while i < len && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '/' if next == Some('*') => i = copy_block_comment(&chars, i, out),
            '$' if dialect.supports_dollar_quoting() => match dollar_tag_end(&chars, i) {
                Some(tag_end) => i = copy_dollar_quoted(&chars, i, tag_end, out),
                None => {
                    out.push(ch);
                    i += 1;
                }
            },
            '?' if next.is_some_and(|c| c.is_ascii_digit()) => {
                // Already positional (`?2`); copy it through untouched.
                out.push(ch);
                i += 1;
                while i < len && chars[i].is_ascii_digit() {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '?' => {
                count += 1;
                out.push_str(&dialect.placeholder(count));
                i += 1;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }

    count
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Copy a quoted run starting at `start`; a doubled closing quote is an escape, and so
/// is a backslash when `backslash` is set.
fn copy_quoted(
    chars: &[char],
    start: usize,
    close: char,
    backslash: bool,
    out: &mut String,
) -> usize {
    out.push(chars[start]);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if backslash && c == '\\' {
            if let Some(&escaped) = chars.get(i) {
                out.push(escaped);
                i += 1;
            }
            continue;
        }
        if c == close {
            if chars.get(i) == Some(&close) {
                out.push(close);
                i += 1;
            } else {
                break;
            }
        }
    }
    i
}

fn copy_block_comment(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '/' && next == Some('*') {
            depth += 1;
            out.push_str("/*");
            i += 2;
        } else if c == '*' && next == Some('/') {
            depth -= 1;
            out.push_str("*/");
            i += 2;
            if depth == 0 {
                break;
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    i
}

/// If `start` opens a dollar-quote (`$$` or `$tag$`), return the index just past the tag.
fn dollar_tag_end(chars: &[char], start: usize) -> Option<usize> {
    if start > 0 {
        let prev = chars[start - 1];
        if prev.is_alphanumeric() || prev == '_' || prev == '$' {
            return None;
        }
    }
    let mut j = start + 1;
    if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    (chars.get(j) == Some(&'$')).then_some(j + 1)
}

fn copy_dollar_quoted(chars: &[char], start: usize, tag_end: usize, out: &mut String) -> usize {
    let tag = &chars[start..tag_end];
    out.extend(tag.iter());
    let mut i = tag_end;
    while i < chars.len() {
        if chars[i..].starts_with(tag) {
            out.extend(tag.iter());
            return i + tag.len();
        }
        out.push(chars[i]);
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> ParameterTranslator {
        ParameterTranslator::new(Dialect::Postgres)
    }

    #[test]
    fn rewrites_each_marker_in_order() {
        let t = pg().translate("UPDATE orders SET status = ? WHERE id = ? AND version = ?");
        assert_eq!(
            t.sql,
            "UPDATE orders SET status = $1 WHERE id = $2 AND version = $3"
        );
        assert_eq!(t.count, 3);
    }

    #[test]
    fn literal_markers_are_left_alone() {
        let t = pg().translate("SELECT 'it?s', name FROM t WHERE a = ?");
        assert_eq!(t.sql, "SELECT 'it?s', name FROM t WHERE a = $1");
        assert_eq!(t.count, 1);

        let t = pg().translate("SELECT 'it''s ?' FROM t WHERE a = ?");
        assert_eq!(t.sql, "SELECT 'it''s ?' FROM t WHERE a = $1");
    }

    #[test]
    fn backslash_escaped_quotes_stay_inside_the_literal() {
        let mysql = ParameterTranslator::new(Dialect::Mysql);
        assert_eq!(
            mysql.count_placeholders(r"SELECT 'it\'s ?' FROM t WHERE a = ?"),
            1
        );
        assert_eq!(mysql.count_placeholders(r#"SELECT "say \"?\"" WHERE b = ?"#), 1);

        let t = pg().translate(r"SELECT E'it\'s ?' FROM t WHERE a = ?");
        assert_eq!(t.sql, r"SELECT E'it\'s ?' FROM t WHERE a = $1");
        assert_eq!(t.count, 1);

        // Outside an E-string a backslash is an ordinary character in Postgres.
        let t = pg().translate(r"SELECT 'C:\' WHERE a = ?");
        assert_eq!(t.sql, r"SELECT 'C:\' WHERE a = $1");
        // A column named `type` followed by a literal is not an escape string.
        let t = pg().translate(r"SELECT type'x\' WHERE a = ?");
        assert_eq!(t.count, 1);
    }

    #[test]
    fn comment_markers_are_left_alone() {
        let sql = "SELECT a -- who? \nFROM t /* what? /* nested? */ still? */ WHERE b = ?";
        let t = pg().translate(sql);
        assert_eq!(
            t.sql,
            "SELECT a -- who? \nFROM t /* what? /* nested? */ still? */ WHERE b = $1"
        );
        assert_eq!(t.count, 1);
    }

    #[test]
    fn quoted_identifiers_are_left_alone() {
        let t = pg().translate("SELECT \"odd?col\" FROM t WHERE `x?` = ?");
        assert_eq!(t.sql, "SELECT \"odd?col\" FROM t WHERE `x?` = $1");

        let t = ParameterTranslator::new(Dialect::SqlServer)
            .translate("SELECT [what?] FROM t WHERE a = ? AND b = ?");
        assert_eq!(t.sql, "SELECT [what?] FROM t WHERE a = @P1 AND b = @P2");
    }

    #[test]
    fn brackets_are_plain_text_outside_sql_server() {
        let t = pg().translate("SELECT arr[?] FROM t");
        assert_eq!(t.sql, "SELECT arr[$1] FROM t");
    }

    #[test]
    fn dollar_quoted_bodies_are_left_alone() {
        let t = pg().translate("SELECT $$a?b$$, $fn$ ? $fn$ FROM t WHERE c = ?");
        assert_eq!(t.sql, "SELECT $$a?b$$, $fn$ ? $fn$ FROM t WHERE c = $1");
        assert_eq!(t.count, 1);
    }

    #[test]
    fn every_dialect_target() {
        let sql = "INSERT INTO t (a, b) VALUES (?, ?)";
        assert_eq!(
            ParameterTranslator::new(Dialect::Oracle).translate(sql).sql,
            "INSERT INTO t (a, b) VALUES (:1, :2)"
        );
        assert_eq!(
            ParameterTranslator::new(Dialect::Sqlite).translate(sql).sql,
            "INSERT INTO t (a, b) VALUES (?1, ?2)"
        );
        let mysql = ParameterTranslator::new(Dialect::Mysql).translate(sql);
        assert!(matches!(mysql.sql, Cow::Borrowed(_)));
        assert_eq!(mysql.count, 2);
    }

    #[test]
    fn positional_markers_pass_through() {
        let t = ParameterTranslator::new(Dialect::Sqlite).translate("SELECT ?2, ?");
        assert_eq!(t.sql, "SELECT ?2, ?1");
        assert_eq!(t.count, 1);
    }

    #[test]
    fn count_matches_translation() {
        let sql = "SELECT ? , '?' , ? -- ?\n /* ? */ , ?";
        let translator = pg();
        assert_eq!(translator.count_placeholders(sql), 3);
        let translated = translator.translate(sql);
        assert_eq!(translated.count, 3);
        assert_eq!(translated.sql.matches('$').count(), 3);
    }

    #[test]
    fn no_markers_borrows() {
        let t = pg().translate("SELECT 1");
        assert!(matches!(t.sql, Cow::Borrowed("SELECT 1")));
        assert_eq!(t.count, 0);
    }
}
