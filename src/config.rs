use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("script root {path} is unusable: {source}")]
    ScriptRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    /// Directory every dispatchable script must live under.
    #[serde(default = "default_script_root")]
    pub script_root: PathBuf,
    /// Appended to the logical script name, e.g. `caption` -> `caption.py`.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Program the script is handed to. `null` executes the script directly.
    #[serde(default = "default_interpreter")]
    pub interpreter: Option<String>,
    /// Wall-clock limit per request; `0` disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_size")]
    pub client_max_body_size: usize,
    #[serde(default = "default_max_args")]
    pub max_args: usize,
    #[serde(default = "default_max_arg_len")]
    pub max_arg_len: usize,
    /// Optional allow-list of logical script names.
    pub scripts: Option<Vec<String>>,
    #[serde(default = "default_stdin")]
    pub stdin: StdioPolicy,
    #[serde(default = "default_stderr")]
    pub stderr: StdioPolicy,
}

/// What the child gets on a stream the gateway does not relay.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StdioPolicy {
    Inherit,
    Discard,
}

fn default_script_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_extension() -> String {
    ".py".to_string()
}

fn default_interpreter() -> Option<String> {
    Some("python3".to_string())
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_max_args() -> usize {
    256
}

fn default_max_arg_len() -> usize {
    32 * 1024
}

fn default_stdin() -> StdioPolicy {
    StdioPolicy::Discard
}

fn default_stderr() -> StdioPolicy {
    StdioPolicy::Inherit
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".to_string()));
        }
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.ports.is_empty() {
            return invalid(format!("server {} has no ports", self.host));
        }
        if !self.extension.is_empty()
            && (!self.extension.starts_with('.') || self.extension.contains('/'))
        {
            return invalid(format!(
                "extension {:?} must start with '.' and contain no '/'",
                self.extension
            ));
        }
        if let Some(interpreter) = &self.interpreter {
            if interpreter.trim().is_empty() {
                return invalid("interpreter must not be empty; use null to run scripts directly".to_string());
            }
        }
        if self.max_args == 0 || self.max_arg_len == 0 || self.client_max_body_size == 0 {
            return invalid(format!("server {} has a zero-sized request limit", self.host));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
