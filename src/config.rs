//! Process configuration, read once from the environment at startup.

use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};

use crate::validate::clamp_i64;

// Session timeout design constants. Request values and agent overrides are
// clamped into these bounds; the ceiling caps maxDurationMinutes.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 30;
pub const MIN_TIMEOUT_MINUTES: i64 = 5;
pub const MAX_TIMEOUT_MINUTES: i64 = 1440;
pub const DEFAULT_MAX_DURATION_MINUTES: i64 = 720;
pub const MAX_DURATION_CEILING_MINUTES: i64 = 4320;
pub const DEFAULT_WARNING_THRESHOLD_MINUTES: i64 = 5;
pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: i64 = 5;

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub cors_origin: Option<String>,
    /// API key required on `/api/*` routes when set.
    pub auth_token: Option<String>,
    /// Participant-based channel gating for socket joins.
    pub data_isolation: bool,
    /// Fixed id for the current message server, when provided.
    pub server_id: Option<String>,
    pub db_path: String,
    pub uploads_dir: String,
    /// Where agent connectors submit replies. Restricted to localhost.
    pub central_url: String,
    pub clear_sessions_on_shutdown: bool,
    pub session: SessionDefaults,
}

/// Global session timeout defaults, overridable per agent and per request.
#[derive(Debug, Clone, Copy)]
pub struct SessionDefaults {
    pub timeout_minutes: i64,
    pub auto_renew: bool,
    pub max_duration_minutes: i64,
    pub warning_threshold_minutes: i64,
    pub cleanup_interval_minutes: i64,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            auto_renew: true,
            max_duration_minutes: DEFAULT_MAX_DURATION_MINUTES,
            warning_threshold_minutes: DEFAULT_WARNING_THRESHOLD_MINUTES,
            cleanup_interval_minutes: DEFAULT_CLEANUP_INTERVAL_MINUTES,
        }
    }
}

impl Config {
    /// Build configuration from the environment. Numeric variables go
    /// through clamp-and-default parsing; a bad value never aborts startup.
    pub fn from_env() -> Self {
        let port = env_clamped("SERVER_PORT", 3000, 1, 65535);
        let host = std::env::var("SERVER_HOST")
            .ok()
            .and_then(|h| h.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let cors_origin = std::env::var("API_CORS_ORIGIN")
            .or_else(|_| std::env::var("CORS_ORIGIN"))
            .ok()
            .filter(|s| !s.is_empty());

        let auth_token = std::env::var("SERVER_AUTH_TOKEN")
            .ok()
            .filter(|s| !s.is_empty());

        let db_path = std::env::var("SWITCHBOARD_DB_PATH").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.switchboard/switchboard.db")
        });

        let uploads_dir =
            std::env::var("SWITCHBOARD_UPLOADS_DIR").unwrap_or_else(|_| "data/uploads".to_string());

        if let Ok(url) = std::env::var("POSTGRES_URL") {
            if !url.is_empty() {
                tracing::info!("POSTGRES_URL is set; this build persists to sqlite and ignores it");
            }
        }

        Self {
            host,
            port: u16::try_from(port).unwrap_or(3000),
            cors_origin,
            auth_token,
            data_isolation: env_flag("ENABLE_DATA_ISOLATION"),
            server_id: std::env::var("ELIZA_SERVER_ID").ok().filter(|s| !s.is_empty()),
            db_path,
            uploads_dir,
            central_url: std::env::var("CENTRAL_MESSAGE_SERVER_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            clear_sessions_on_shutdown: env_flag_default("CLEAR_SESSIONS_ON_SHUTDOWN", true),
            session: SessionDefaults {
                timeout_minutes: env_clamped(
                    "SESSION_DEFAULT_TIMEOUT_MINUTES",
                    DEFAULT_TIMEOUT_MINUTES,
                    env_clamped(
                        "SESSION_MIN_TIMEOUT_MINUTES",
                        MIN_TIMEOUT_MINUTES,
                        1,
                        MAX_TIMEOUT_MINUTES,
                    ),
                    env_clamped(
                        "SESSION_MAX_TIMEOUT_MINUTES",
                        MAX_TIMEOUT_MINUTES,
                        1,
                        MAX_TIMEOUT_MINUTES,
                    ),
                ),
                auto_renew: true,
                max_duration_minutes: env_clamped(
                    "SESSION_MAX_DURATION_MINUTES",
                    DEFAULT_MAX_DURATION_MINUTES,
                    MIN_TIMEOUT_MINUTES,
                    MAX_DURATION_CEILING_MINUTES,
                ),
                warning_threshold_minutes: env_clamped(
                    "SESSION_WARNING_THRESHOLD_MINUTES",
                    DEFAULT_WARNING_THRESHOLD_MINUTES,
                    1,
                    MAX_TIMEOUT_MINUTES,
                ),
                cleanup_interval_minutes: env_clamped(
                    "SESSION_CLEANUP_INTERVAL_MINUTES",
                    DEFAULT_CLEANUP_INTERVAL_MINUTES,
                    1,
                    1440,
                ),
            },
        }
    }
}

fn env_clamped(name: &str, default: i64, min: i64, max: i64) -> i64 {
    let raw = std::env::var(name).ok().map(Value::String);
    clamp_i64(name, raw.as_ref(), default, min, max)
}

fn env_flag(name: &str) -> bool {
    env_flag_default(name, false)
}

fn env_flag_default(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map_or(default, |v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_defaults_are_consistent() {
        let d = SessionDefaults::default();
        assert!(d.timeout_minutes >= MIN_TIMEOUT_MINUTES);
        assert!(d.timeout_minutes <= MAX_TIMEOUT_MINUTES);
        assert!(d.max_duration_minutes >= d.timeout_minutes);
        assert!(d.warning_threshold_minutes >= 1);
    }
}
