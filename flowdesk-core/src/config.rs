//! FlowDesk YAML configuration.
//!
//! Every field has a default, so an empty document is a valid config.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowDeskConfig {
    pub engine: EngineSettings,
    pub retry: RetrySettings,
    pub paging: PagingSettings,
    pub tasks: TaskSettings,
    pub instances: InstanceSettings,
    /// user id → groups; seeds the static identity provider.
    pub identities: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Deadline applied to every engine call.
    pub deadline_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { deadline_ms: 5000 }
    }
}

impl EngineSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingSettings {
    pub default_size: usize,
    pub max_size: usize,
}

impl Default for PagingSettings {
    fn default() -> Self {
        Self {
            default_size: 10,
            max_size: 100,
        }
    }
}

impl PagingSettings {
    /// Zero means "use the default"; anything above `max_size` is clamped.
    pub fn clamp(&self, page: usize, size: usize) -> crate::types::PageRequest {
        let size = if size == 0 { self.default_size } else { size };
        crate::types::PageRequest::of(page, size.min(self.max_size))
    }

    pub fn first_page(&self) -> crate::types::PageRequest {
        crate::types::PageRequest::of(0, self.default_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Variable written by `handle_task` before completing.
    pub approval_variable: String,
    pub approval_value: serde_json::Value,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            approval_variable: "approved".to_string(),
            approval_value: serde_json::Value::Bool(true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    /// Instance variable the submitted form data is bound under.
    pub form_variable: String,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            form_variable: "form".to_string(),
        }
    }
}

impl FlowDeskConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: FlowDeskConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FlowDeskConfig::from_yaml("").unwrap();
        assert_eq!(config.engine.deadline_ms, 5000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.paging.default_size, 10);
        assert_eq!(config.tasks.approval_variable, "approved");
        assert_eq!(config.tasks.approval_value, serde_json::Value::Bool(true));
        assert_eq!(config.instances.form_variable, "form");
        assert!(config.identities.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
engine:
  deadline_ms: 250
retry:
  max_attempts: 5
tasks:
  approval_variable: managerApproved
identities:
  bob: [managers]
  alice: []
"#;
        let config = FlowDeskConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.deadline(), Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 100); // default
        assert_eq!(config.tasks.approval_variable, "managerApproved");
        assert_eq!(config.identities["bob"], vec!["managers"]);
    }

    #[test]
    fn test_page_clamp() {
        let paging = PagingSettings::default();
        assert_eq!(paging.clamp(0, 0).size, 10);
        assert_eq!(paging.clamp(1, 500).size, 100);
        assert_eq!(paging.clamp(3, 25).page, 3);
    }
}
