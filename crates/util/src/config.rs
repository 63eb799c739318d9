use std::{env, fmt, net::SocketAddr, path::PathBuf, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DIRECTORY_DATABASE_URL: &str = "sqlite://data/directory.db?mode=rwc";
pub const DEFAULT_TENANT_DATA_DIR: &str = "data/tenants";
pub const DEFAULT_DOMAIN_SUFFIX: &str = "local";
pub const DEFAULT_ADMIN_LOGIN_PATH: &str = "/admin/login";
pub const DEFAULT_CONFIRMATION_TTL_SECS: u64 = 60 * 60 * 24;
pub const DEFAULT_TENANT_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SENDER: &str = "no-reply@clinicdesk.local";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Settings for the outbound mail API. Absent when `MAIL_API_URL` is unset.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    /// Base URL of the registration portal, used in confirmation links.
    pub public_url: String,
    pub directory_database_url: String,
    pub tenant_data_dir: PathBuf,
    pub domain_suffix: String,
    pub admin_login_path: String,
    pub confirmation_ttl: Duration,
    /// Zero disables the resolver cache.
    pub tenant_cache_ttl: Duration,
    pub single_tenant_mode: bool,
    pub fallback_database_url: Option<String>,
    pub supported_languages: Vec<String>,
    pub default_language: String,
    pub mail: Option<MailConfig>,
    pub mail_sender: String,
    /// Bearer token for the operator routes. Unset rejects every operator call.
    pub operator_api_key: Option<String>,
    /// Zero disables the provisioning recovery worker.
    pub recovery_interval: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let public_url = optional("APP_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{bind_addr}"))
            .trim_end_matches('/')
            .to_string();
        if !public_url.starts_with("http://") && !public_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "APP_PUBLIC_URL",
                value: public_url,
            });
        }

        let directory_database_url = optional("DIRECTORY_DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DIRECTORY_DATABASE_URL.to_string());
        let tenant_data_dir = PathBuf::from(
            optional("TENANT_DATA_DIR").unwrap_or_else(|| DEFAULT_TENANT_DATA_DIR.to_string()),
        );

        let domain_suffix = optional("TENANT_DOMAIN_SUFFIX")
            .unwrap_or_else(|| DEFAULT_DOMAIN_SUFFIX.to_string())
            .trim_matches('.')
            .to_ascii_lowercase();
        if domain_suffix.is_empty() {
            return Err(ConfigError::MissingValue("TENANT_DOMAIN_SUFFIX"));
        }

        let admin_login_path = optional("ADMIN_LOGIN_PATH")
            .unwrap_or_else(|| DEFAULT_ADMIN_LOGIN_PATH.to_string());
        if !admin_login_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "ADMIN_LOGIN_PATH",
                value: admin_login_path,
            });
        }

        let confirmation_ttl = Duration::from_secs(parse_u64(
            "CONFIRMATION_TOKEN_TTL_SECS",
            DEFAULT_CONFIRMATION_TTL_SECS,
        )?);
        if confirmation_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CONFIRMATION_TOKEN_TTL_SECS",
                value: "0".to_string(),
            });
        }
        let tenant_cache_ttl = Duration::from_secs(parse_u64(
            "TENANT_CACHE_TTL_SECS",
            DEFAULT_TENANT_CACHE_TTL_SECS,
        )?);
        let recovery_interval = Duration::from_secs(parse_u64(
            "RECOVERY_INTERVAL_SECS",
            DEFAULT_RECOVERY_INTERVAL_SECS,
        )?);

        let single_tenant_mode = parse_bool("SINGLE_TENANT_MODE", false)?;
        let fallback_database_url = optional("FALLBACK_DATABASE_URL");

        let supported_languages: Vec<String> = optional("SUPPORTED_LANGUAGES")
            .unwrap_or_else(|| "en,ar".to_string())
            .split(',')
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .collect();
        if supported_languages.is_empty() {
            return Err(ConfigError::MissingValue("SUPPORTED_LANGUAGES"));
        }
        let default_language = optional("DEFAULT_LANGUAGE")
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_else(|| "en".to_string());

        let mail = match optional("MAIL_API_URL") {
            Some(api_url) => Some(MailConfig {
                api_url,
                api_key: optional("MAIL_API_KEY").ok_or(ConfigError::MissingValue("MAIL_API_KEY"))?,
            }),
            None if environment == Environment::Production => {
                return Err(ConfigError::MissingValue("MAIL_API_URL"));
            }
            None => None,
        };
        let mail_sender = optional("MAIL_SENDER").unwrap_or_else(|| DEFAULT_SENDER.to_string());
        let operator_api_key = optional("OPERATOR_API_KEY");

        Ok(Self {
            bind_addr,
            environment,
            public_url,
            directory_database_url,
            tenant_data_dir,
            domain_suffix,
            admin_login_path,
            confirmation_ttl,
            tenant_cache_ttl,
            single_tenant_mode,
            fallback_database_url,
            supported_languages,
            default_language,
            mail,
            mail_sender,
            operator_api_key,
            recovery_interval,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key).map(|value| value.to_ascii_lowercase()) {
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingValue(&'static str),
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingValue(key) => write!(f, "{key} must be set"),
            Self::InvalidValue { key, value } => write!(f, "invalid {key} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    const KEYS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "APP_PUBLIC_URL",
        "DIRECTORY_DATABASE_URL",
        "TENANT_DATA_DIR",
        "TENANT_DOMAIN_SUFFIX",
        "ADMIN_LOGIN_PATH",
        "CONFIRMATION_TOKEN_TTL_SECS",
        "TENANT_CACHE_TTL_SECS",
        "RECOVERY_INTERVAL_SECS",
        "SINGLE_TENANT_MODE",
        "FALLBACK_DATABASE_URL",
        "SUPPORTED_LANGUAGES",
        "DEFAULT_LANGUAGE",
        "MAIL_API_URL",
        "MAIL_API_KEY",
        "MAIL_SENDER",
        "OPERATOR_API_KEY",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.public_url, format!("http://{DEFAULT_BIND_ADDR}"));
        assert_eq!(config.domain_suffix, DEFAULT_DOMAIN_SUFFIX);
        assert_eq!(config.admin_login_path, "/admin/login");
        assert_eq!(config.supported_languages, vec!["en", "ar"]);
        assert_eq!(config.tenant_cache_ttl, Duration::from_secs(30));
        assert!(!config.single_tenant_mode);
        assert!(config.mail.is_none());
        assert!(config.operator_api_key.is_none());
    }

    #[test]
    fn reads_operator_api_key() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("OPERATOR_API_KEY", "  operator-secret  ");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.operator_api_key.as_deref(), Some("operator-secret"));

        clear_env();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn production_requires_mail_api() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("mail api is required");
        assert!(matches!(err, ConfigError::MissingValue("MAIL_API_URL")));

        env::set_var("MAIL_API_URL", "https://mail.example.com/v1/");
        env::set_var("MAIL_API_KEY", "key");
        env::set_var("TENANT_DOMAIN_SUFFIX", ".Example.COM");
        env::set_var("APP_PUBLIC_URL", "https://portal.example.com/");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.domain_suffix, "example.com");
        assert_eq!(config.public_url, "https://portal.example.com");
        assert_eq!(config.mail.expect("mail config").api_key, "key");

        clear_env();
    }

    #[test]
    fn rejects_malformed_numbers_and_flags() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("TENANT_CACHE_TTL_SECS", "soon");
        let err = AppConfig::from_env().expect_err("ttl must be numeric");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "TENANT_CACHE_TTL_SECS", .. }
        ));

        clear_env();
        env::set_var("SINGLE_TENANT_MODE", "maybe");
        let err = AppConfig::from_env().expect_err("flag must be boolean");
        assert!(matches!(err, ConfigError::InvalidValue { key: "SINGLE_TENANT_MODE", .. }));

        clear_env();
        env::set_var("SINGLE_TENANT_MODE", "yes");
        env::set_var("ADMIN_LOGIN_PATH", "/Admin/Login");
        let config = AppConfig::from_env().expect("config should load");
        assert!(config.single_tenant_mode);
        assert_eq!(config.admin_login_path, "/Admin/Login");

        clear_env();
    }
}
