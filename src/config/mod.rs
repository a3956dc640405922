//! Environment-driven runtime configuration

use serde::{Deserialize, Serialize};

use eisv_dynamics::{DynamicsParams, IDynamicsMode};

/// Durable store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbBackend {
    Postgres,
    Sqlite,
}

/// Runtime settings, loaded from the environment.
///
/// Every field maps to the environment variable of the same name in upper
/// case (`db_url` <- `DB_URL`); unset variables fall back to the defaults
/// below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_db_backend")]
    pub db_backend: DbBackend,
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default = "default_db_min_conn")]
    pub db_min_conn: u32,
    #[serde(default = "default_db_max_conn")]
    pub db_max_conn: u32,
    #[serde(default)]
    pub cache_url: Option<String>,
    /// `0` disables the external cache entirely.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: u8,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub stuck_sweep_interval_seconds: u64,
    #[serde(default = "default_i_dynamics_mode")]
    pub i_dynamics_mode: String,
    #[serde(default)]
    pub summarizer_endpoint: Option<String>,
    #[serde(default)]
    pub embeddings_endpoint: Option<String>,
    /// Dimension of the agent-configuration parameter vector.
    #[serde(default = "default_param_dim")]
    pub param_dim: usize,
    /// Dimension of the ethical-drift vector.
    #[serde(default = "default_drift_dim")]
    pub drift_dim: usize,
}

fn default_db_backend() -> DbBackend {
    DbBackend::Postgres
}
fn default_db_min_conn() -> u32 {
    5
}
fn default_db_max_conn() -> u32 {
    25
}
fn default_cache_enabled() -> u8 {
    1
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_lock_timeout() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_i_dynamics_mode() -> String {
    "nonlinear".to_string()
}
fn default_param_dim() -> usize {
    128
}
fn default_drift_dim() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl Settings {
    /// Load from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Connection string for the selected backend.
    pub fn effective_db_url(&self) -> String {
        match (&self.db_url, self.db_backend) {
            (Some(url), _) => url.clone(),
            (None, DbBackend::Postgres) => "postgres://localhost:5432/agentgov".to_string(),
            (None, DbBackend::Sqlite) => "sqlite://agentgov.db?mode=rwc".to_string(),
        }
    }

    pub fn cache_is_enabled(&self) -> bool {
        self.cache_enabled != 0 && self.cache_url.is_some()
    }

    /// Dynamics parameters with the configured integrity mode applied.
    pub fn dynamics_params(&self) -> DynamicsParams {
        DynamicsParams {
            i_mode: IDynamicsMode::parse(&self.i_dynamics_mode),
            ..DynamicsParams::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.db_backend, DbBackend::Postgres);
        assert_eq!(settings.db_min_conn, 5);
        assert_eq!(settings.db_max_conn, 25);
        assert_eq!(settings.session_ttl_seconds, 3600);
        assert_eq!(settings.lock_timeout_seconds, 30);
        assert_eq!(settings.stuck_sweep_interval_seconds, 300);
        assert_eq!(settings.param_dim, 128);
        assert_eq!(settings.drift_dim, 3);
        assert!(!settings.cache_is_enabled());
    }

    #[test]
    fn test_effective_db_url_fallbacks() {
        let mut settings = Settings::default();
        assert!(settings.effective_db_url().starts_with("postgres://"));
        settings.db_backend = DbBackend::Sqlite;
        assert!(settings.effective_db_url().starts_with("sqlite://"));
        settings.db_url = Some("postgres://db.internal/gov".to_string());
        assert_eq!(settings.effective_db_url(), "postgres://db.internal/gov");
    }

    #[test]
    fn test_cache_disabled_by_flag() {
        let mut settings = Settings::default();
        settings.cache_url = Some("redis://localhost".to_string());
        assert!(settings.cache_is_enabled());
        settings.cache_enabled = 0;
        assert!(!settings.cache_is_enabled());
    }

    #[test]
    fn test_dynamics_mode_applied() {
        let mut settings = Settings::default();
        settings.i_dynamics_mode = "linear".to_string();
        assert_eq!(settings.dynamics_params().i_mode, IDynamicsMode::Linear);
    }
}
