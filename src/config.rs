use std::env;
use std::time::Duration;

use crate::error::AppError;

const DEV_JWT_SECRET: &str = "ride-dispatch-dev-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub payment_key_id: Option<String>,
    pub payment_key_secret: Option<String>,
    pub presence_ttl: Duration,
    pub pending_request_ttl: Duration,
    pub sweep_interval: Duration,
    pub broadcast_radius_km: f64,
    pub broadcast_limit: usize,
    pub hub_command_buffer: usize,
    pub client_send_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            database_url: None,
            database_max_connections: 10,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            payment_key_id: None,
            payment_key_secret: None,
            presence_ttl: Duration::from_secs(30),
            pending_request_ttl: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(15),
            broadcast_radius_km: 10.0,
            broadcast_limit: 50,
            hub_command_buffer: 1024,
            client_send_buffer: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let log_format = match env::var("LOG_FORMAT").ok().as_deref() {
            None | Some("compact") => LogFormat::Compact,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other} (expected compact or json)"
                )));
            }
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: parse_or_default(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            jwt_secret: non_empty("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            payment_key_id: non_empty("PAYMENT_KEY_ID"),
            payment_key_secret: non_empty("PAYMENT_KEY_SECRET"),
            presence_ttl: Duration::from_secs(parse_or_default("PRESENCE_TTL_SECS", 30)?),
            pending_request_ttl: Duration::from_secs(parse_or_default(
                "PENDING_REQUEST_TTL_SECS",
                900,
            )?),
            sweep_interval: Duration::from_secs(parse_or_default("SWEEP_INTERVAL_SECS", 15)?),
            broadcast_radius_km: parse_or_default(
                "BROADCAST_RADIUS_KM",
                defaults.broadcast_radius_km,
            )?,
            broadcast_limit: parse_or_default("BROADCAST_LIMIT", defaults.broadcast_limit)?,
            hub_command_buffer: parse_or_default(
                "HUB_COMMAND_BUFFER",
                defaults.hub_command_buffer,
            )?,
            client_send_buffer: parse_or_default(
                "CLIENT_SEND_BUFFER",
                defaults.client_send_buffer,
            )?,
        };

        if config.sweep_interval.is_zero() {
            return Err(AppError::Internal(
                "SWEEP_INTERVAL_SECS must be > 0".to_string(),
            ));
        }
        if config.hub_command_buffer == 0 || config.client_send_buffer == 0 {
            return Err(AppError::Internal(
                "HUB_COMMAND_BUFFER and CLIENT_SEND_BUFFER must be > 0".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
