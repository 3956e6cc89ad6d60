//! Database dialect trait for SQL emission
//!
//! A dialect is a capability profile plus the handful of textual choices
//! the emitter cannot make on its own: quoting, literals and parameter markers.

use crate::device::capabilities::CapabilityProfile;
use crate::models::enums::DatabaseType;

/// Trait for database-specific SQL dialect
pub trait SqlDialect: Send + Sync {
    /// Get the database type
    fn db_type(&self) -> DatabaseType;

    /// Default capability profile for this backend
    fn capabilities(&self) -> CapabilityProfile {
        CapabilityProfile::for_dialect(self.db_type())
    }

    /// Quote an identifier (table/column name)
    fn quote_ident(&self, ident: &str) -> String;

    /// Quote a string literal
    fn quote_string(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    /// Emit boolean literal
    fn emit_boolean(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_string()
    }

    /// Emit binary literal
    fn emit_binary(&self, bytes: &[u8]) -> String {
        format!("X'{}'", hex::encode_upper(bytes))
    }

    /// Marker for the `position`th (1-based) parameter named `name`
    fn parameter_marker(&self, name: &str, position: usize) -> String;

    /// String concatenation of two rendered operands
    fn emit_concat(&self, left: &str, right: &str) -> String {
        format!("{} || {}", left, right)
    }

    /// Keyword for a set difference
    fn except_keyword(&self) -> &'static str {
        "EXCEPT"
    }
}

fn is_plain_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// ANSI-flavored dialect with named `:name` parameters; quotes only when needed.
pub struct GenericDialect;

impl SqlDialect for GenericDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Generic
    }

    fn quote_ident(&self, ident: &str) -> String {
        if is_plain_identifier(ident) {
            ident.to_string()
        } else {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }
    }

    fn parameter_marker(&self, name: &str, _position: usize) -> String {
        format!(":{}", name)
    }
}

/// MySQL dialect
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn emit_boolean(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn parameter_marker(&self, _name: &str, _position: usize) -> String {
        "?".to_string()
    }

    fn emit_concat(&self, left: &str, right: &str) -> String {
        format!("CONCAT({}, {})", left, right)
    }
}

/// PostgreSQL dialect
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn emit_binary(&self, bytes: &[u8]) -> String {
        format!("'\\x{}'::bytea", hex::encode(bytes))
    }

    fn parameter_marker(&self, _name: &str, position: usize) -> String {
        format!("${}", position)
    }
}

/// SQLite dialect
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn emit_boolean(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn parameter_marker(&self, _name: &str, _position: usize) -> String {
        "?".to_string()
    }
}

/// MS SQL Server dialect
pub struct MssqlDialect;

impl SqlDialect for MssqlDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MsSQL
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn quote_string(&self, s: &str) -> String {
        format!("N'{}'", s.replace('\'', "''"))
    }

    fn emit_boolean(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn emit_binary(&self, bytes: &[u8]) -> String {
        format!("0x{}", hex::encode_upper(bytes))
    }

    fn parameter_marker(&self, name: &str, _position: usize) -> String {
        format!("@{}", name)
    }

    fn emit_concat(&self, left: &str, right: &str) -> String {
        format!("{} + {}", left, right)
    }
}

/// Get dialect for a database type
pub fn get_dialect(db_type: &DatabaseType) -> Box<dyn SqlDialect> {
    match db_type {
        DatabaseType::Generic => Box::new(GenericDialect),
        DatabaseType::MySQL => Box::new(MySqlDialect),
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::SQLite => Box::new(SqliteDialect),
        DatabaseType::MsSQL => Box::new(MssqlDialect),
    }
}
