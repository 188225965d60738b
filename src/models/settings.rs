//! Settings Models
//!
//! Application configuration stored in config.json, and the partial update
//! applied from the shell.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use query_gis_llm::{TelemetrySettings, TransportSettings, DEFAULT_CHAT_URL, DEFAULT_FIX_URL};
use query_gis_llm::telemetry::DEFAULT_REPORT_URL;

/// Application configuration stored in config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Chat endpoint
    pub chat_endpoint: String,
    /// Fix endpoint used by self-correction
    pub fix_endpoint: String,
    /// Telemetry report endpoint
    pub report_endpoint: String,
    /// Model id sent with every payload
    pub model: String,
    /// Per-call ceiling for chat requests, in seconds
    pub request_timeout_secs: u64,
    /// Per-call ceiling for fix requests, in seconds
    pub fix_timeout_secs: u64,
    /// Transport tries for transient failures
    pub transport_attempts: u32,
    /// Send masked telemetry rows
    pub telemetry_enabled: bool,
    /// Execute returned code without asking
    pub auto_run: bool,
    /// Upper bound on serialized context size, in characters
    pub context_char_budget: usize,
    /// How long a superseded request may take to wind down, in milliseconds
    pub cancel_wait_ms: u64,
    /// Interpreter used by the console shell's script runtime
    #[serde(default = "default_python_path")]
    pub python_path: String,
    /// Ceiling for one script execution, in seconds
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    /// Version tag attached to telemetry metadata
    pub plugin_version: String,
}

fn default_python_path() -> String {
    "python3".to_string()
}

fn default_exec_timeout() -> u64 {
    600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chat_endpoint: DEFAULT_CHAT_URL.to_string(),
            fix_endpoint: DEFAULT_FIX_URL.to_string(),
            report_endpoint: DEFAULT_REPORT_URL.to_string(),
            model: "gemini-2.5-flash".to_string(),
            request_timeout_secs: 120,
            fix_timeout_secs: 180,
            transport_attempts: 2,
            telemetry_enabled: true,
            auto_run: true,
            context_char_budget: 8000,
            cancel_wait_ms: 2000,
            python_path: default_python_path(),
            exec_timeout_secs: default_exec_timeout(),
            plugin_version: "QueryGIS-Plugin/1.2".to_string(),
        }
    }
}

/// Settings update request (partial update)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettingsUpdate {
    pub chat_endpoint: Option<String>,
    pub fix_endpoint: Option<String>,
    pub model: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub fix_timeout_secs: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub auto_run: Option<bool>,
    pub context_char_budget: Option<usize>,
    pub python_path: Option<String>,
}

impl AppConfig {
    /// Apply a partial update to the configuration
    pub fn apply_update(&mut self, update: SettingsUpdate) {
        if let Some(url) = update.chat_endpoint {
            self.chat_endpoint = url;
        }
        if let Some(url) = update.fix_endpoint {
            self.fix_endpoint = url;
        }
        if let Some(model) = update.model {
            self.model = model;
        }
        if let Some(secs) = update.request_timeout_secs {
            self.request_timeout_secs = secs;
        }
        if let Some(secs) = update.fix_timeout_secs {
            self.fix_timeout_secs = secs;
        }
        if let Some(enabled) = update.telemetry_enabled {
            self.telemetry_enabled = enabled;
        }
        if let Some(auto_run) = update.auto_run {
            self.auto_run = auto_run;
        }
        if let Some(budget) = update.context_char_budget {
            self.context_char_budget = budget;
        }
        if let Some(path) = update.python_path {
            self.python_path = path;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        self.transport_settings()
            .validate()
            .map_err(|e| e.to_string())?;

        if url::Url::parse(&self.report_endpoint).is_err() {
            return Err(format!("Invalid report endpoint: {}", self.report_endpoint));
        }

        if self.model.trim().is_empty() {
            return Err("model must not be empty".to_string());
        }

        // Network calls are bounded to between one and three minutes.
        for (name, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("fix_timeout_secs", self.fix_timeout_secs),
        ] {
            if !(60..=180).contains(&secs) {
                return Err(format!("{} must be between 60 and 180, got {}", name, secs));
            }
        }

        if self.transport_attempts == 0 || self.transport_attempts > 5 {
            return Err("transport_attempts must be between 1 and 5".to_string());
        }

        if self.context_char_budget < 500 {
            return Err("context_char_budget must be at least 500".to_string());
        }

        if self.exec_timeout_secs == 0 {
            return Err("exec_timeout_secs must be positive".to_string());
        }

        Ok(())
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            chat_url: self.chat_endpoint.clone(),
            fix_url: self.fix_endpoint.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            fix_timeout: Duration::from_secs(self.fix_timeout_secs),
            max_attempts: self.transport_attempts,
            ..Default::default()
        }
    }

    pub fn telemetry_settings(&self) -> TelemetrySettings {
        TelemetrySettings {
            enabled: self.telemetry_enabled,
            endpoint: self.report_endpoint.clone(),
            ..Default::default()
        }
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.model, "gemini-2.5-flash");
        assert_eq!(config.chat_endpoint, "https://www.querygis.com/chat");
        assert!(config.auto_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_update() {
        let mut config = AppConfig::default();
        config.apply_update(SettingsUpdate {
            auto_run: Some(false),
            model: Some("gemini-2.5-pro".to_string()),
            ..Default::default()
        });
        assert!(!config.auto_run);
        assert_eq!(config.model, "gemini-2.5-pro");
        assert_eq!(config.request_timeout_secs, 120);
    }

    #[test]
    fn test_validate_rejects_out_of_range_timeout() {
        let config = AppConfig {
            request_timeout_secs: 5,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("request_timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = AppConfig {
            chat_endpoint: "querygis.com/chat".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_settings_mapping() {
        let config = AppConfig::default();
        let transport = config.transport_settings();
        assert_eq!(transport.request_timeout, Duration::from_secs(120));
        assert_eq!(transport.fix_timeout, Duration::from_secs(180));
        assert_eq!(transport.max_attempts, 2);
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let mut value = serde_json::to_value(AppConfig::default()).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("python_path");
        obj.remove("exec_timeout_secs");
        let config: AppConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.python_path, "python3");
        assert_eq!(config.exec_timeout_secs, 600);
    }
}
