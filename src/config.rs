use crate::error::DbcapError;
use directories::ProjectDirs;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Row cap applied when neither the profile nor `[defaults]` set one.
pub const DEFAULT_MAX_ROWS: usize = 500;

/// Database engine a query is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    MySql,
    Postgres,
    SqlServer,
    Vertica,
    Hana,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::MySql => "mysql",
            BackendKind::Postgres => "postgres",
            BackendKind::SqlServer => "sqlserver",
            BackendKind::Vertica => "vertica",
            BackendKind::Hana => "hana",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            BackendKind::MySql => 3306,
            BackendKind::Postgres => 5432,
            BackendKind::SqlServer => 1433,
            BackendKind::Vertica => 5433,
            BackendKind::Hana => 30015,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DbcapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(BackendKind::MySql),
            "postgres" => Ok(BackendKind::Postgres),
            "sqlserver" => Ok(BackendKind::SqlServer),
            "vertica" => Ok(BackendKind::Vertica),
            "hana" => Ok(BackendKind::Hana),
            other => Err(DbcapError::Config {
                message: format!(
                    "unknown backend type: '{}' (expected one of mysql, postgres, sqlserver, vertica, hana)",
                    other
                ),
            }),
        }
    }
}

/// Everything needed to open one backend session for one query.
#[derive(Debug)]
pub struct ConnectionSpec {
    pub backend: BackendKind,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: SecretString,
    pub database: Option<String>,
    pub max_rows: usize,
    /// TLS toggle: `sslmode=require` on PostgreSQL, `Encrypt=yes` on SQL Server, ...
    pub tls: bool,
    /// MySQL only: allow the cleartext authentication plugin.
    pub insecure_auth: bool,
    /// SQL Server only.
    pub trust_server_certificate: bool,
    /// SAP HANA current schema.
    pub schema: Option<String>,
    /// Overrides the ODBC driver name for the ODBC-backed engines.
    pub odbc_driver: Option<String>,
}

impl ConnectionSpec {
    pub fn new(
        backend: BackendKind,
        host: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            backend,
            host: host.into(),
            port: None,
            username: username.into(),
            password,
            database: None,
            max_rows: DEFAULT_MAX_ROWS,
            tls: false,
            insecure_auth: false,
            trust_server_certificate: false,
            schema: None,
            odbc_driver: None,
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }

    /// `backend://user@host:port/database`, without the password. Used in logs.
    pub fn describe(&self) -> String {
        let mut target = format!(
            "{}://{}@{}:{}",
            self.backend,
            self.username,
            self.host,
            self.port_or_default()
        );
        if let Some(ref db) = self.database {
            target.push('/');
            target.push_str(db);
        }
        target
    }

    pub fn validate(&self) -> Result<(), DbcapError> {
        if self.host.trim().is_empty() {
            return Err(DbcapError::Config {
                message: format!("no host specified for {} backend", self.backend),
            });
        }
        if self.max_rows == 0 {
            return Err(DbcapError::Config {
                message: "max_rows must be a positive integer".to_string(),
            });
        }
        Ok(())
    }
}

// --- TOML config file structs ---

#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    defaults: TomlDefaults,
    #[serde(default)]
    profiles: HashMap<String, TomlProfile>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlDefaults {
    max_rows: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct TomlProfile {
    backend: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    password_env: Option<String>,
    database: Option<String>,
    tls: Option<bool>,
    insecure_auth: Option<bool>,
    trust_server_certificate: Option<bool>,
    schema: Option<String>,
    odbc_driver: Option<String>,
    max_rows: Option<usize>,
}

/// Resolved config path, and whether the caller asked for it explicitly.
struct ResolvedConfigPath {
    path: PathBuf,
    /// true if the caller passed a path or set DBCAP_CONFIG
    explicit: bool,
}

/// Resolve the config file path: explicit argument > env var > platform default.
fn resolve_config_path(explicit: Option<&Path>) -> Option<ResolvedConfigPath> {
    if let Some(path) = explicit {
        return Some(ResolvedConfigPath {
            path: path.to_path_buf(),
            explicit: true,
        });
    }
    if let Some(path) = env_non_empty("DBCAP_CONFIG") {
        return Some(ResolvedConfigPath {
            path: PathBuf::from(path),
            explicit: true,
        });
    }
    ProjectDirs::from("", "", "dbcap").map(|dirs| ResolvedConfigPath {
        path: dirs.config_dir().join("config.toml"),
        explicit: false,
    })
}

fn load_toml_config(resolved: Option<&ResolvedConfigPath>) -> Result<TomlConfig, DbcapError> {
    let Some(resolved) = resolved else {
        return Ok(TomlConfig::default());
    };

    if !resolved.path.exists() {
        if resolved.explicit {
            return Err(DbcapError::Config {
                message: format!("config file not found: {}", resolved.path.display()),
            });
        }
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(&resolved.path).map_err(|e| DbcapError::Config {
        message: format!("cannot read config file {}: {}", resolved.path.display(), e),
    })?;

    toml::from_str(&content).map_err(|e| DbcapError::Config {
        message: format!("invalid config file {}: {}", resolved.path.display(), e),
    })
}

/// `None` for missing or empty values.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Read an env var, treating an empty value as unset.
pub fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolve a password from direct value, env indirection, or the fallback env var.
fn resolve_secret(
    direct: Option<&str>,
    env_key: Option<&str>,
    fallback_env: &str,
) -> Option<SecretString> {
    if let Some(val) = non_empty(direct) {
        return Some(SecretString::from(val.to_string()));
    }
    if let Some(key) = env_key
        && let Some(val) = env_non_empty(key)
    {
        return Some(SecretString::from(val));
    }
    env_non_empty(fallback_env).map(SecretString::from)
}

/// Build a [`ConnectionSpec`] from a named profile of the config file.
pub fn load_profile(name: &str, config_path: Option<&Path>) -> Result<ConnectionSpec, DbcapError> {
    let resolved_path = resolve_config_path(config_path);
    let toml_config = load_toml_config(resolved_path.as_ref())?;

    let profile = toml_config
        .profiles
        .get(name)
        .cloned()
        .ok_or_else(|| DbcapError::Config {
            message: format!("profile '{}' not found in config file", name),
        })?;

    let backend: BackendKind = non_empty(profile.backend.as_deref())
        .ok_or_else(|| DbcapError::Config {
            message: format!("profile '{}' has no backend", name),
        })?
        .parse()?;

    let host = non_empty(profile.host.as_deref())
        .ok_or_else(|| DbcapError::Config {
            message: format!("no host specified for {} backend", backend),
        })?
        .to_string();

    let username = non_empty(profile.username.as_deref())
        .ok_or_else(|| DbcapError::Config {
            message: format!("no username specified for {} backend", backend),
        })?
        .to_string();

    let password = resolve_secret(
        profile.password.as_deref(),
        profile.password_env.as_deref(),
        "DBCAP_PASSWORD",
    )
    .ok_or_else(|| DbcapError::Config {
        message: format!("no password specified for {} backend", backend),
    })?;

    // max_rows: profile > [defaults] > 500
    let max_rows = profile
        .max_rows
        .or(toml_config.defaults.max_rows)
        .unwrap_or(DEFAULT_MAX_ROWS);

    let spec = ConnectionSpec {
        backend,
        host,
        port: profile.port,
        username,
        password,
        database: non_empty(profile.database.as_deref()).map(str::to_string),
        max_rows,
        tls: profile.tls.unwrap_or(false),
        insecure_auth: profile.insecure_auth.unwrap_or(false),
        trust_server_certificate: profile.trust_server_certificate.unwrap_or(false),
        schema: non_empty(profile.schema.as_deref()).map(str::to_string),
        odbc_driver: non_empty(profile.odbc_driver.as_deref()).map(str::to_string),
    };
    spec.validate()?;
    Ok(spec)
}
