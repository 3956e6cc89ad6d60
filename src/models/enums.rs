use serde::{Deserialize, Serialize};

/// Target backends the device knows a dialect and default profile for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DatabaseType {
    /// Plain ANSI SQL, used when no concrete backend is configured.
    #[default]
    Generic,
    MySQL,
    PostgreSQL,
    SQLite,
    MsSQL,
}

impl DatabaseType {
    /// Best guess from a connection URL scheme.
    pub fn from_connection_string(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Some(DatabaseType::SQLite),
            "postgres" | "postgresql" => Some(DatabaseType::PostgreSQL),
            "mysql" | "mariadb" => Some(DatabaseType::MySQL),
            "mssql" | "sqlserver" => Some(DatabaseType::MsSQL),
            _ => None,
        }
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "ansi" => Ok(DatabaseType::Generic),
            "mysql" => Ok(DatabaseType::MySQL),
            "postgres" | "postgresql" => Ok(DatabaseType::PostgreSQL),
            "sqlite" => Ok(DatabaseType::SQLite),
            "mssql" | "sqlserver" => Ok(DatabaseType::MsSQL),
            other => Err(format!("unknown dialect '{}'", other)),
        }
    }
}

/// Cursor behavior requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CursorType {
    /// Rows may be re-read from the backend after a reconnect (keyset restart).
    #[default]
    Dynamic,
    /// The result is fixed at open; releasing the connection drains the scan.
    Static,
}

/// Isolation a cursor or transaction runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// Read uncommitted, served from the browse pool outside any transaction.
    Browse,
    #[default]
    CursorStability,
    Isolated,
}

impl IsolationLevel {
    pub fn is_browse(self) -> bool {
        matches!(self, IsolationLevel::Browse)
    }
}
