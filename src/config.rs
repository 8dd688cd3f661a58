use std::{path::Path, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Per-plugin argument lists, keyed by plugin name.
pub type PluginArguments = IndexMap<String, Vec<String>>;

/// An error that can occur when loading a [`MonitorConfig`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON or has the wrong shape.
    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration of one plugin.
///
/// The options are opaque to the monitor and are handed to the plugin
/// system as they are.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin specific options.
    #[serde(flatten)]
    pub options: IndexMap<String, serde_json::Value>,
}

impl PluginConfig {
    /// Returns the option with the given name, if it is a string.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Plugins to initialize, in order.
    pub plugins: IndexMap<String, PluginConfig>,

    /// Upper bound of a single wait for guest events, in milliseconds.
    pub event_timeout_ms: u64,

    /// Whether plugins receive the shutdown notification when the
    /// monitor stops.
    pub shutdown_plugin_action: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            plugins: IndexMap::new(),
            event_timeout_ms: 1000,
            shutdown_plugin_action: true,
        }
    }
}

impl MonitorConfig {
    /// Parses the configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Returns the wait timeout as a [`Duration`].
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// Returns the arguments the plugin `name` is initialized with.
    ///
    /// Without an explicit entry in `overrides`, a plugin receives its own
    /// name as the only argument.
    pub fn plugin_arguments(&self, name: &str, overrides: &PluginArguments) -> Vec<String> {
        match overrides.get(name) {
            Some(arguments) => arguments.clone(),
            None => vec![name.to_owned()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<(), ConfigError> {
        let config = MonitorConfig::from_json("{}")?;

        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.event_timeout(), Duration::from_secs(1));
        assert!(config.shutdown_plugin_action);
        Ok(())
    }

    #[test]
    fn plugins_keep_order_and_options() -> Result<(), ConfigError> {
        let config = MonitorConfig::from_json(
            r#"{
                "plugins": {
                    "template": { "output": "/tmp/template" },
                    "inmemoryscanner": { "directory": "/rules", "scan_all": true }
                },
                "event_timeout_ms": 250
            }"#,
        )?;

        let names = config.plugins.keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(names, ["template", "inmemoryscanner"]);

        assert_eq!(config.plugins["template"].option("output"), Some("/tmp/template"));
        assert_eq!(config.plugins["inmemoryscanner"].option("scan_all"), None);
        assert_eq!(config.event_timeout(), Duration::from_millis(250));
        Ok(())
    }

    #[test]
    fn plugin_arguments_default_to_name() {
        let config = MonitorConfig::default();

        let mut overrides = PluginArguments::new();
        overrides.insert("scanner".into(), vec!["scanner".into(), "--dump".into()]);

        assert_eq!(config.plugin_arguments("template", &overrides), ["template"]);
        assert_eq!(
            config.plugin_arguments("scanner", &overrides),
            ["scanner", "--dump"]
        );
    }

    #[test]
    fn invalid_json_is_rejected() {
        let result = MonitorConfig::from_json(r#"{ "event_timeout_ms": "soon" }"#);
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }
}
