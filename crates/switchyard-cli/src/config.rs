use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use switchyard_core::{HandlerDescriptor, HandlerType, StaticConfigProvider};
use switchyard_orchestrator::QueueConfig;
use switchyard_recovery::FailureTrackerConfig;
use switchyard_routing::RoutingConfig;
use tracing::debug;

/// Config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "switchyard.toml";

/// Contents of `switchyard.toml`. Every section is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Routing rules and scoring.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Task queue capacity, retry limit and retention.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Failure history window and snapshot location.
    #[serde(default)]
    pub tracker: FailureTrackerConfig,
    /// Per-handler retry and timeout settings.
    #[serde(default)]
    pub execution: StaticConfigProvider,
    /// Handlers available for `route`.
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

/// A handler known to the deployment, used for offline routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerEntry {
    /// Unique handler name.
    pub name: String,
    /// Handler family, written as `type` in TOML.
    #[serde(rename = "type")]
    pub handler_type: HandlerType,
    /// Free-form capability tags matched by routing rules.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HandlerEntry {
    /// Descriptor registered with the routing engine.
    pub fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new(self.name.clone(), self.handler_type)
            .with_capabilities(self.capabilities.clone())
    }
}

impl SwitchyardConfig {
    /// Parse a config document.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load an explicit path, or `switchyard.toml` if present, or defaults.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path: PathBuf = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !tokio::fs::try_exists(&fallback).await.unwrap_or(false) {
                    debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
                fallback
            }
        };
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::from_toml(&text)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))
    }

    /// Descriptors for every configured handler.
    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.handlers.iter().map(HandlerEntry::descriptor).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchyard_core::ConfigurationProvider;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SwitchyardConfig::from_toml("").unwrap();
        assert!(config.routing.use_default_rules);
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.tracker.retention_days, 30);
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = SwitchyardConfig::from_toml(
            r#"
            [routing]
            fallback_penalty = 0.5

            [[routing.rules]]
            name = "python-reviews"
            priority = 250
            target_type = "python"
            confidence_boost = 0.1
            conditions = [
                { field = "language", operator = "equals", value = "python" },
            ]

            [queue]
            max_concurrent = 8

            [tracker]
            retention_days = 7
            snapshot_path = "data/failures.json"

            [execution.default]
            timeout_ms = 60000

            [execution.overrides.fixer.retry_policy]
            max_retries = 5

            [[handlers]]
            name = "fixer"
            type = "fixer"

            [[handlers]]
            name = "py"
            type = "python"
            capabilities = ["lint"]
            "#,
        )
        .unwrap();

        assert_eq!(config.routing.fallback_penalty, 0.5);
        assert_eq!(config.routing.rules[0].name, "python-reviews");
        assert_eq!(config.queue.max_concurrent, 8);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.tracker.retention_days, 7);
        assert!(config.tracker.snapshot_path.is_some());
        assert_eq!(config.execution.handler_config("other").timeout_ms, 60_000);
        assert_eq!(
            config
                .execution
                .handler_config("fixer")
                .retry_policy
                .max_retries,
            5
        );

        let descriptors = config.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[1].handler_type, HandlerType::Python);
        assert_eq!(descriptors[1].capabilities, vec!["lint".to_string()]);
    }

    #[test]
    fn test_unknown_handler_type_rejected() {
        assert!(SwitchyardConfig::from_toml(
            r#"
            [[handlers]]
            name = "x"
            type = "wizard"
            "#
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        tokio::fs::write(&path, "[queue]\nidle_poll_ms = 5\n").await.unwrap();
        let config = SwitchyardConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.queue.idle_poll_ms, 5);

        let missing = dir.path().join("missing.toml");
        assert!(SwitchyardConfig::load(Some(&missing)).await.is_err());
    }
}
