//! Hierarchical configuration loading.
//!
//! Precedence (lowest to highest):
//! 1. Programmatic defaults
//! 2. `basalt.yaml` (project config)
//! 3. `basalt.local.yaml` (local overrides, optional)
//! 4. Deployment environment variables (`EXECUTOR_MODE`, `WORLD_SEED`, …)

use anyhow::{Context, Result};
use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::action::ExecutorMode;
use crate::domain::models::config::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid EXECUTOR_MODE: {0}. Must be shadow or live")]
    InvalidMode(String),

    #[error("Invalid poll interval: {0}ms. Must be between 100 and 300000")]
    InvalidPollInterval(u64),

    #[error("Invalid max_steps_per_minute: {0}. Must be at least 1")]
    InvalidRateLimit(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("WORLD_SEED is required when the event store is enabled")]
    MissingWorldSeed,

    #[error("Invalid numeric value for {0}: {1}")]
    InvalidNumber(&'static str, String),
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration.
    pub fn load() -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("basalt.yaml"))
            .merge(Yaml::file("basalt.local.yaml"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::apply_env(&mut config, |name| std::env::var(name).ok())?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit file (bypasses the project files).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;
        Self::apply_env(&mut config, |name| std::env::var(name).ok())?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Apply the deployment environment surface onto a config value.
    pub fn apply_env(
        config: &mut Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn flag(value: &str) -> bool {
            matches!(value, "1" | "true" | "yes" | "on")
        }
        fn number<T: std::str::FromStr>(
            name: &'static str,
            value: &str,
        ) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidNumber(name, value.to_string()))
        }

        if let Some(mode) = lookup("EXECUTOR_MODE") {
            config.executor.mode =
                ExecutorMode::from_str(&mode).ok_or(ConfigError::InvalidMode(mode))?;
        }
        if let Some(enabled) = lookup("ENABLE_PLANNING_EXECUTOR") {
            config.executor.enabled = flag(&enabled);
        }
        if let Some(poll) = lookup("EXECUTOR_POLL_MS") {
            config.executor.poll_ms = number("EXECUTOR_POLL_MS", &poll)?;
        }
        if let Some(backoff) = lookup("EXECUTOR_MAX_BACKOFF_MS") {
            config.executor.max_backoff_ms = number("EXECUTOR_MAX_BACKOFF_MS", &backoff)?;
        }
        if let Some(open) = lookup("BOT_BREAKER_OPEN_MS") {
            config.breaker.open_ms = number("BOT_BREAKER_OPEN_MS", &open)?;
        }
        if let Some(disabled) = lookup("BUILD_EXEC_BUDGET_DISABLED") {
            config.budget.disabled = flag(&disabled);
        }
        if let Some(attempts) = lookup("BUILD_EXEC_MAX_ATTEMPTS") {
            config.budget.max_attempts = number("BUILD_EXEC_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(interval) = lookup("BUILD_EXEC_MIN_INTERVAL_MS") {
            config.budget.min_interval_ms = number("BUILD_EXEC_MIN_INTERVAL_MS", &interval)?;
        }
        if let Some(elapsed) = lookup("BUILD_EXEC_MAX_ELAPSED_MS") {
            config.budget.max_elapsed_ms = number("BUILD_EXEC_MAX_ELAPSED_MS", &elapsed)?;
        }
        if let Some(rig_e) = lookup("ENABLE_RIG_E") {
            config.goal_binding.rig_e_enabled = flag(&rig_e);
        }
        if let Some(binding) = lookup("ENABLE_GOAL_BINDING") {
            config.goal_binding.enabled = flag(&binding);
        }
        if let Some(strict) = lookup("PLANNING_STRICT_FINALIZE") {
            config.planning.strict_finalize = flag(&strict);
        }
        if let Some(store) = lookup("PLANNING_EVENT_STORE") {
            config.planning.event_store = flag(&store);
        }
        if let Some(seed) = lookup("WORLD_SEED") {
            config.world_seed = seed;
        }
        if let Some(mcp_only) = lookup("MCP_ONLY") {
            config.executor.mcp_only = flag(&mcp_only);
        }
        if let Some(compat) = lookup("JOIN_KEYS_DEPRECATED_COMPAT") {
            config.planning.join_keys_deprecated_compat = flag(&compat);
        }
        if let Some(token) = lookup("EXECUTOR_EMERGENCY_TOKEN") {
            config.executor.emergency_token = Some(token);
        }
        if let Some(debug) = lookup("STERLING_EPISODE_DEBUG") {
            config.planning.sterling_episode_debug = flag(&debug);
        }
        if let Some(url) = lookup("BOT_INTERFACE_URL") {
            config.endpoints.bot_url = url;
        }
        if let Some(url) = lookup("STERLING_URL") {
            config.endpoints.solver_url = url;
        }
        if let Some(url) = lookup("COGNITION_URL") {
            config.endpoints.cognition_url = url;
        }
        if let Some(url) = lookup("MEMORY_URL") {
            config.endpoints.memory_url = url;
        }
        if let Some(url) = lookup("DASHBOARD_URL") {
            config.endpoints.dashboard_url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            config.endpoints.database_url = url;
        }
        Ok(())
    }

    /// Validate a loaded configuration.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.executor.poll_ms < 100 || config.executor.poll_ms > 300_000 {
            return Err(ConfigError::InvalidPollInterval(config.executor.poll_ms));
        }
        if config.executor.max_steps_per_minute == 0 {
            return Err(ConfigError::InvalidRateLimit(
                config.executor.max_steps_per_minute,
            ));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        if config.planning.event_store && config.world_seed.trim().is_empty() {
            return Err(ConfigError::MissingWorldSeed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(ToString::to_string)
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        ConfigLoader::apply_env(
            &mut config,
            env(&[
                ("EXECUTOR_MODE", "live"),
                ("EXECUTOR_POLL_MS", "5000"),
                ("WORLD_SEED", "-42"),
                ("PLANNING_EVENT_STORE", "1"),
                ("PLANNING_STRICT_FINALIZE", "true"),
                ("BUILD_EXEC_BUDGET_DISABLED", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.executor.mode, ExecutorMode::Live);
        assert_eq!(config.executor.poll_ms, 5000);
        assert_eq!(config.world_seed, "-42");
        assert!(config.planning.event_store);
        assert!(config.planning.strict_finalize);
        assert!(config.budget.disabled);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut config = Config::default();
        let result = ConfigLoader::apply_env(&mut config, env(&[("EXECUTOR_MODE", "observe")]));
        assert!(matches!(result, Err(ConfigError::InvalidMode(_))));
    }

    #[test]
    fn test_validation_world_seed_gate() {
        let mut config = Config::default();
        config.planning.event_store = true;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingWorldSeed)
        ));
        config.world_seed = "12345".to_string();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validation_poll_bounds() {
        let mut config = Config::default();
        config.executor.poll_ms = 10;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidPollInterval(10))
        ));
    }

    #[test]
    fn test_defaults_validate() {
        assert!(ConfigLoader::validate(&Config::default()).is_ok());
    }
}
