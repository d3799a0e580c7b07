//! Server configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables: `KARABO_BROKER`, `KARABO_BROKER_TOPIC`, and any
//!    `KARABO_SERVER_<FIELD>` (nested fields separated by `__`)
//! 4. command line arguments of the form `key=value` (`serverId=S1`,
//!    `init={...}`, `broker.url=tcp://host:7777`)
//!
//! # Example
//! ```no_run
//! use karabo::config::ServerConfig;
//!
//! let args = vec!["serverId=S1".to_string()];
//! let config = ServerConfig::load(None, &args)?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KaraboError, KaraboResult};

/// Top-level configuration of a device server process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Server instance id; derived from host and pid when absent.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Namespace of device classes to load.
    #[serde(default = "default_plugin_namespace")]
    pub plugin_namespace: String,
    /// JSON object `{deviceId: {classId: ..., ...}}` instantiated at boot.
    #[serde(default)]
    pub init: Option<String>,
    /// Host name announced in instance info; the system host name when absent.
    #[serde(default)]
    pub host: Option<String>,
    /// Message bus settings.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Heartbeat period of the server in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Grace before a device ignoring `slotKillDevice` is terminated.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// Default timeout of requests in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// How long to wait for an existing instance to answer a ping.
    #[serde(default = "default_instance_check_timeout")]
    pub instance_check_timeout_ms: u64,
    /// Size of the blocking worker pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Directory for opt-in XML persistence of device configurations.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// `inproc://<name>` or `tcp://host:port`.
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Logical segregation of instances sharing a broker.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,
    /// Upper bound of the reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
    /// Give up reconnecting after this many seconds.
    #[serde(default = "default_reconnect_ceiling")]
    pub reconnect_ceiling_secs: u64,
}

// Default value functions
fn default_plugin_namespace() -> String {
    "karabo.devices".to_string()
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_kill_grace() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_instance_check_timeout() -> u64 {
    1000
}

fn default_worker_threads() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_broker_url() -> String {
    "inproc://default".to_string()
}

fn default_topic() -> String {
    "karabo".to_string()
}

fn default_reconnect_initial() -> u64 {
    100
}

fn default_reconnect_max() -> u64 {
    5000
}

fn default_reconnect_ceiling() -> u64 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            topic: default_topic(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            reconnect_ceiling_secs: default_reconnect_ceiling(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            plugin_namespace: default_plugin_namespace(),
            init: None,
            host: None,
            broker: BrokerConfig::default(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            kill_grace_secs: default_kill_grace(),
            request_timeout_ms: default_request_timeout(),
            instance_check_timeout_ms: default_instance_check_timeout(),
            worker_threads: default_worker_threads(),
            persist_dir: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Command line spellings that do not follow the snake_case field names.
const ARG_ALIASES: &[(&str, &str)] = &[
    ("heartbeatInterval", "heartbeat_interval_secs"),
    ("Logger.priority", "log_level"),
    ("brokerUrl", "broker.url"),
    ("topic", "broker.topic"),
];

impl ServerConfig {
    /// Load configuration from defaults, `file`, environment and `args`.
    pub fn load(file: Option<&Path>, args: &[String]) -> KaraboResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment
            .merge(Env::prefixed("KARABO_SERVER_").split("__"))
            .merge(Env::raw().only(&["KARABO_BROKER", "KARABO_BROKER_TOPIC"]).map(|key| {
                if key.as_str().eq_ignore_ascii_case("KARABO_BROKER_TOPIC") {
                    "broker.topic".into()
                } else {
                    "broker.url".into()
                }
            }));
        for (key, value) in parse_args(args)? {
            figment = figment.merge(Serialized::global(&key, value));
        }
        Ok(figment.extract()?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            ));
        }

        if !(self.broker.url.starts_with("inproc://") || self.broker.url.starts_with("tcp://")) {
            return Err(format!(
                "Invalid broker url '{}'. Must start with inproc:// or tcp://",
                self.broker.url
            ));
        }

        if self.broker.topic.is_empty() {
            return Err("Broker topic must not be empty".to_string());
        }

        if self.broker.reconnect_initial_ms == 0
            || self.broker.reconnect_initial_ms > self.broker.reconnect_max_ms
        {
            return Err(format!(
                "Invalid reconnect delays {}..{} ms",
                self.broker.reconnect_initial_ms, self.broker.reconnect_max_ms
            ));
        }

        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be positive".to_string());
        }

        if self.kill_grace_secs == 0 || self.kill_grace_secs > 600 {
            return Err(format!(
                "Invalid kill_grace_secs {}. Must be 1-600",
                self.kill_grace_secs
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be positive".to_string());
        }

        if self.worker_threads == 0 || self.worker_threads > 256 {
            return Err(format!(
                "Invalid worker_threads {}. Must be 1-256",
                self.worker_threads
            ));
        }

        if let Some(id) = &self.server_id {
            if id.is_empty() || id.contains(['|', ' ', ':']) {
                return Err(format!("Invalid server id '{id}'"));
            }
        }

        if let Some(init) = &self.init {
            match serde_json::from_str::<serde_json::Value>(init) {
                Ok(serde_json::Value::Object(_)) => {}
                Ok(_) => return Err("init must be a JSON object".to_string()),
                Err(e) => return Err(format!("init is not valid JSON: {e}")),
            }
        }

        Ok(())
    }

    /// Host name announced by the server and its devices.
    pub fn host_name(&self) -> String {
        self.host.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }

    /// Configured server id, or `<host>_Server_<pid>`.
    pub fn resolved_server_id(&self) -> String {
        match &self.server_id {
            Some(id) => id.clone(),
            None => {
                let host = self.host_name();
                let short = host.split('.').next().unwrap_or(&host).to_string();
                format!("{short}_Server_{}", std::process::id())
            }
        }
    }
}

/// Split `key=value` arguments into figment keys and typed values.
fn parse_args(args: &[String]) -> KaraboResult<Vec<(String, serde_json::Value)>> {
    args.iter()
        .map(|arg| {
            let (key, raw) = arg
                .split_once('=')
                .ok_or_else(|| KaraboError::Config(format!("Argument '{arg}' is not key=value")))?;
            let key = ARG_ALIASES
                .iter()
                .find(|(alias, _)| *alias == key)
                .map(|(_, field)| field.to_string())
                .unwrap_or_else(|| camel_to_snake(key));
            let value = if let Ok(n) = raw.parse::<u64>() {
                serde_json::Value::from(n)
            } else if let Ok(b) = raw.parse::<bool>() {
                serde_json::Value::from(b)
            } else {
                serde_json::Value::from(raw)
            };
            Ok((key, value))
        })
        .collect()
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kill_grace_secs, 10);
        assert_eq!(config.request_timeout_ms, 5000);
        assert_eq!(config.heartbeat_interval_secs, 20);
    }

    #[test]
    fn camel_case_arguments() {
        assert_eq!(camel_to_snake("serverId"), "server_id");
        assert_eq!(camel_to_snake("pluginNamespace"), "plugin_namespace");
        let parsed = parse_args(&["heartbeatInterval=5".to_string()]).unwrap();
        assert_eq!(parsed[0].0, "heartbeat_interval_secs");
        assert_eq!(parsed[0].1, serde_json::Value::from(5u64));
        assert!(parse_args(&["nonsense".to_string()]).is_err());
    }

    #[test]
    #[serial]
    fn layering_file_env_args() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server_id = \"FromFile\"\nkill_grace_secs = 3\n[broker]\ntopic = \"file\"").unwrap();

        std::env::set_var("KARABO_BROKER_TOPIC", "envtopic");
        let args = vec![
            "serverId=S1".to_string(),
            "init={\"d1\":{\"classId\":\"PropertyTest\"}}".to_string(),
        ];
        let config = ServerConfig::load(Some(file.path()), &args).unwrap();
        std::env::remove_var("KARABO_BROKER_TOPIC");

        assert_eq!(config.server_id.as_deref(), Some("S1"));
        assert_eq!(config.kill_grace_secs, 3);
        assert_eq!(config.broker.topic, "envtopic");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values() {
        let mut config = ServerConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.log_level = "info".to_string();
        config.broker.url = "amqp://x".to_string();
        assert!(config.validate().is_err());

        config.broker.url = "tcp://localhost:7777".to_string();
        config.init = Some("[1,2]".to_string());
        assert!(config.validate().is_err());

        config.init = None;
        config.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_server_id() {
        let config = ServerConfig {
            host: Some("exflqr.desy.de".to_string()),
            ..Default::default()
        };
        let id = config.resolved_server_id();
        assert!(id.starts_with("exflqr_Server_"), "{id}");
    }
}
