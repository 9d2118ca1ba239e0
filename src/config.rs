//! Environment-driven configuration for the client and the development backend.
//!
//! `.env` files are honoured through dotenvy; a missing file is fine.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ClientError, Result};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_DATA_DIR: &str = ".rbacscan";
/// Lines shown by the collapsed report view before the "more hidden" marker.
pub const DEFAULT_REPORT_LINES: usize = 220;
pub const DEFAULT_ADMIN_LIMIT: usize = 200;
/// Largest avatar accepted into the local profile cache.
pub const MAX_AVATAR_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub report_lines: usize,
    pub admin_limit: usize,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            report_lines: DEFAULT_REPORT_LINES,
            admin_limit: DEFAULT_ADMIN_LIMIT,
            log_dir: None,
            log_json: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            base_url: getenv("RBACSCAN_URL", DEFAULT_BASE_URL),
            data_dir: PathBuf::from(getenv("RBACSCAN_DATA_DIR", DEFAULT_DATA_DIR)),
            report_lines: parse_env("RBACSCAN_REPORT_LINES", DEFAULT_REPORT_LINES)?,
            admin_limit: parse_env("RBACSCAN_ADMIN_LIMIT", DEFAULT_ADMIN_LIMIT)?,
            log_dir: env::var("RBACSCAN_LOG_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            log_json: flag("RBACSCAN_LOG_JSON"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub jwt_secret: String,
    pub admin_emails: Vec<String>,
    pub token_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            jwt_secret: "dev_secret_change_me".to_string(),
            admin_emails: vec![],
            token_ttl_secs: 24 * 3600,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Ok(Self {
            addr: getenv("APP_ADDR", &defaults.addr),
            jwt_secret: getenv("JWT_SECRET", &defaults.jwt_secret),
            admin_emails: getenv("ADMIN_EMAILS", "")
                .split(',')
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            token_ttl_secs: parse_env("TOKEN_TTL_SECS", defaults.token_ttl_secs)?,
        })
    }
}

fn getenv(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn flag(key: &str) -> bool {
    matches!(
        env::var(key).map(|v| v.to_ascii_lowercase()).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v
            .trim()
            .parse()
            .map_err(|_| ClientError::Config(format!("{key} must be a number, got {v:?}"))),
        _ => Ok(default),
    }
}
