//! Datasets.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::bail;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

/// Matches the URL scheme prefix stripped from dataset hosts.
static HOST_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^http(s)?://").expect("regex should compile"));

/// Matches the characters replaced with `-` in secret names.
static SECRET_NAME_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s_#]+").expect("regex should compile"));

/// The database engine backing a dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetEngine {
    /// PostgreSQL.
    #[default]
    Postgres,
    /// Microsoft SQL Server.
    Mssql,
    /// MySQL.
    Mysql,
    /// MariaDB.
    Mariadb,
    /// Oracle.
    Oracle,
    /// SQLite.
    Sqlite,
}

impl DatasetEngine {
    /// Gets the SQL dialect name for the engine.
    ///
    /// This is the value handed to the query transpiler as `TO_DIALECT`;
    /// SQL Server is known there as `tsql`.
    pub fn dialect(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mssql => "tsql",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for DatasetEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Mssql => write!(f, "mssql"),
            Self::Mysql => write!(f, "mysql"),
            Self::Mariadb => write!(f, "mariadb"),
            Self::Oracle => write!(f, "oracle"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for DatasetEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "mssql" | "tsql" => Ok(Self::Mssql),
            "mysql" => Ok(Self::Mysql),
            "mariadb" => Ok(Self::Mariadb),
            "oracle" => Ok(Self::Oracle),
            "sqlite" => Ok(Self::Sqlite),
            _ => bail!("DB type {s} is not supported"),
        }
    }
}

/// A dataset a task can run against.
///
/// Credentials are not part of the record: they live in a per-dataset
/// Kubernetes secret named by [`Dataset::creds_secret_name`], duplicated
/// across the default and task namespaces. Credential rotation is owned by
/// the dataset administration surface, not by the task engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// The dataset identifier.
    pub id: i64,
    /// The dataset name.
    pub name: String,
    /// The database host, with or without a URL scheme.
    pub host: String,
    /// The database port.
    pub port: u16,
    /// The database engine.
    #[serde(default)]
    pub engine: DatasetEngine,
    /// Extra arguments appended to connection strings, already URL-encoded.
    #[serde(default)]
    pub extra_connection_args: Option<String>,
    /// The schema analytics tasks read from.
    #[serde(default)]
    pub schema_read: Option<String>,
    /// The schema analytics tasks write to.
    #[serde(default)]
    pub schema_write: Option<String>,
}

impl Dataset {
    /// Gets the name of the Kubernetes secret holding the dataset's
    /// database credentials.
    pub fn creds_secret_name(&self) -> String {
        secret_name(&self.host, &self.name)
    }
}

/// Derives a dataset credential secret name from a host and dataset name.
///
/// The URL scheme is stripped from the host, whitespace, underscores, and
/// `#` become `-`, the dataset name is lower-cased, and the whole thing is
/// suffixed `-creds`.
pub fn secret_name(host: &str, dataset_name: &str) -> String {
    let host = HOST_SCHEME.replace(host, "");
    let host = SECRET_NAME_SEPARATORS.replace_all(&host, "-");
    let name = SECRET_NAME_SEPARATORS.replace_all(dataset_name, "-");
    format!("{host}-{name}-creds", name = name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(host: &str, name: &str) -> Dataset {
        Dataset {
            id: 1,
            name: name.to_string(),
            host: host.to_string(),
            port: 5432,
            engine: DatasetEngine::Postgres,
            extra_connection_args: None,
            schema_read: None,
            schema_write: None,
        }
    }

    #[test]
    fn secret_name_strips_scheme() {
        assert_eq!(
            dataset("https://db.example.com", "phenotypes").creds_secret_name(),
            "db.example.com-phenotypes-creds"
        );
        assert_eq!(
            dataset("http://db.example.com", "phenotypes").creds_secret_name(),
            "db.example.com-phenotypes-creds"
        );
    }

    #[test]
    fn secret_name_normalizes_separators() {
        assert_eq!(
            dataset("db.example.com", "My Data_set #2").creds_secret_name(),
            "db.example.com-my-data-set-2-creds"
        );
    }

    #[test]
    fn engine_parses_dialect_aliases() {
        assert_eq!("tsql".parse::<DatasetEngine>().unwrap(), DatasetEngine::Mssql);
        assert_eq!(DatasetEngine::Mssql.dialect(), "tsql");
        assert!("dbase".parse::<DatasetEngine>().is_err());
    }
}
