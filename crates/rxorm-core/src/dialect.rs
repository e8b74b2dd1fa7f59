//! SQL dialects understood by the connection layer.

use serde::{Deserialize, Serialize};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
    /// Oracle dialect (uses :1, :2 placeholders)
    Oracle,
    /// SQL Server dialect (uses @P1, @P2 placeholders)
    SqlServer,
    /// DB2 dialect (uses ? placeholders)
    Db2,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Oracle => format!(":{index}"),
            Dialect::SqlServer => format!("@P{index}"),
            Dialect::Mysql | Dialect::Db2 => "?".to_string(),
        }
    }

    /// Whether the driver consumes the generic `?` syntax unchanged.
    pub const fn uses_anonymous_placeholders(self) -> bool {
        matches!(self, Dialect::Mysql | Dialect::Db2)
    }

    /// Whether `[name]` quotes an identifier in this dialect.
    pub const fn supports_bracket_identifiers(self) -> bool {
        matches!(self, Dialect::SqlServer)
    }

    /// Whether a backslash escapes the next character inside every quoted literal.
    pub const fn backslash_escapes_in_literals(self) -> bool {
        matches!(self, Dialect::Mysql)
    }

    /// Whether `E'...'` introduces a literal with backslash escapes.
    pub const fn supports_escape_strings(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Whether `$tag$ ... $tag$` introduces a string body in this dialect.
    pub const fn supports_dollar_quoting(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Whether INSERT ... RETURNING can hand back generated keys.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are escaped by doubling them.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::Oracle | Dialect::Db2 => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
            Dialect::SqlServer => {
                let escaped = name.replace(']', "]]");
                format!("[{}]", escaped)
            }
        }
    }

    /// SQL that yields the next value of a sequence as a single-row, single-column result.
    pub fn sequence_next_value_sql(self, sequence: &str) -> String {
        match self {
            Dialect::Postgres => format!("SELECT nextval('{}')", sequence.replace('\'', "''")),
            Dialect::Oracle => format!("SELECT {sequence}.NEXTVAL FROM DUAL"),
            Dialect::SqlServer => format!("SELECT NEXT VALUE FOR {sequence}"),
            Dialect::Db2 => format!("VALUES NEXT VALUE FOR {sequence}"),
            Dialect::Mysql | Dialect::Sqlite => {
                format!("SELECT next_value FROM {sequence}")
            }
        }
    }

    /// Clause appended to a SELECT to take a pessimistic row lock.
    pub const fn for_update_clause(self) -> &'static str {
        match self {
            Dialect::Sqlite | Dialect::SqlServer => "",
            _ => " FOR UPDATE",
        }
    }
}
