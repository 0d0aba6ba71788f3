use std::{net::SocketAddr, str::FromStr};

use base64::{engine::general_purpose, Engine as _};
use time::Duration;

#[derive(Clone)]
pub enum JwtKeys {
    Rsa {
        private_pem: Vec<u8>,
        public_pem: Vec<u8>,
    },
    Hmac(Vec<u8>),
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa { .. } => f.write_str("JwtKeys::Rsa(..)"),
            Self::Hmac(..) => f.write_str("JwtKeys::Hmac(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub mongodb_uri: Option<String>,
    pub database_name: String,
    pub jwt_keys: JwtKeys,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub lifecycle: LifecyclePolicy,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub otp_digits: u32,
    pub custody_window: Duration,
    pub escalation_threshold: usize,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            otp_digits: 6,
            custody_window: Duration::hours(72),
            escalation_threshold: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|it| !it.trim().is_empty())
}

fn parsed<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn base64_var(name: &'static str) -> Result<Vec<u8>, ConfigError> {
    let raw = var(name).ok_or(ConfigError::Missing(name))?;

    general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
        })
}

impl JwtKeys {
    pub fn from_env() -> Result<Self, ConfigError> {
        if var("JWT_SECRET_KEY").is_some() {
            return Ok(Self::Rsa {
                private_pem: base64_var("JWT_SECRET_KEY")?,
                public_pem: base64_var("JWT_PUBLIC_KEY")?,
            });
        }

        var("JWT_HMAC_SECRET")
            .map(|it| Self::Hmac(it.into_bytes()))
            .ok_or(ConfigError::Missing("JWT_SECRET_KEY or JWT_HMAC_SECRET"))
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let otp_digits: u32 = parsed("OTP_DIGITS", 6)?;
        if !(4..=9).contains(&otp_digits) {
            return Err(ConfigError::Invalid {
                name: "OTP_DIGITS",
                reason: "must be between 4 and 9".to_string(),
            });
        }

        let bootstrap_admin = match (var("ADMIN_EMAIL"), var("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapAdmin { email, password }),
            (Some(_), None) => return Err(ConfigError::Missing("ADMIN_PASSWORD")),
            _ => None,
        };

        Ok(Self {
            bind_addr: parsed("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            mongodb_uri: var("MONGODB_URI"),
            database_name: var("MONGODB_DATABASE").unwrap_or_else(|| "parceltrack".to_string()),
            jwt_keys: JwtKeys::from_env()?,
            access_token_ttl: Duration::minutes(parsed("ACCESS_TOKEN_MINUTES", 10)?),
            refresh_token_ttl: Duration::days(parsed("REFRESH_TOKEN_DAYS", 7)?),
            lifecycle: LifecyclePolicy {
                otp_digits,
                custody_window: Duration::hours(parsed("CUSTODY_WINDOW_HOURS", 72)?),
                escalation_threshold: parsed("ESCALATION_THRESHOLD", 2)?,
            },
            bootstrap_admin,
        })
    }

    pub fn in_memory(secret: &[u8]) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            mongodb_uri: None,
            database_name: "parceltrack".to_string(),
            jwt_keys: JwtKeys::Hmac(secret.to_vec()),
            access_token_ttl: Duration::minutes(10),
            refresh_token_ttl: Duration::days(7),
            lifecycle: LifecyclePolicy::default(),
            bootstrap_admin: None,
        }
    }
}
