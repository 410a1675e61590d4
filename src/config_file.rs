//! Configuration file handling for treegui

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::commands::command::Command;
use crate::commands::flag::{Flag, FlagType, FlagValue, ParseValueError, write_csv_record};
use crate::commands::inherit::Inheritance;
use crate::commands::runner::{Runner, ShellRunner, UsageRunner};

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config file found in current directory or its parents: {0}")]
    ConfigNotFound(PathBuf),
    #[error("Unable to find directory: {path:?} (entry: {entry:?})")]
    DirectoryNotFound {
        entry: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown working directory: {0}")]
    UnknownWorkingDirectory(String),
    #[error("Unable to parse YAML config file {path}: {source}")]
    Yaml {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("Unable to parse JSON config file {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("Invalid default for flag `--{flag}` of `{command}`: {source}")]
    InvalidDefault {
        command: String,
        flag: String,
        #[source]
        source: ParseValueError,
    },
    #[error("Duplicate command `{name}` under `{parent}`")]
    DuplicateCommand { parent: String, name: String },
    #[error("Duplicate flag `--{flag}` in the scope of `{command}`")]
    DuplicateFlag { command: String, flag: String },
    #[error("Unable to read page template {path}: {source}")]
    Page {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Validation(String),
}

/// Configuration for a single flag
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConfigFlag {
    pub name: String,
    #[serde(rename = "type", default)]
    pub flag_type: FlagType,
    pub usage: Option<String>,
    pub default: Option<Value>,
    pub uploadable: Option<bool>,
}

impl ConfigFlag {
    fn build(self, command: &str) -> Result<Flag, ConfigError> {
        let text = default_text(self.flag_type, self.default).map_err(|reason| {
            ConfigError::Validation(format!(
                "Flag `--{}` of `{command}` has an unusable default: {reason}",
                self.name
            ))
        })?;
        let default =
            FlagValue::parse(self.flag_type, &text).map_err(|source| ConfigError::InvalidDefault {
                command: command.to_string(),
                flag: self.name.clone(),
                source,
            })?;
        Ok(Flag {
            name: self.name,
            usage: self.usage.unwrap_or_default(),
            flag_type: self.flag_type,
            default,
            uploadable: self.uploadable.unwrap_or(false),
        })
    }
}

/// Convert a YAML/JSON default into the flag's serialized form
fn default_text(flag_type: FlagType, value: Option<Value>) -> Result<String, String> {
    match value {
        None | Some(Value::Null) => Ok(match flag_type {
            FlagType::Bool => "false".to_string(),
            FlagType::Int => "0".to_string(),
            FlagType::Float => "0".to_string(),
            FlagType::String | FlagType::StringSlice | FlagType::IntSlice => String::new(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Array(items)) if flag_type.is_list() => {
            let items = items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    other => Err(format!("unsupported list element {other}")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if flag_type == FlagType::StringSlice {
                write_csv_record(&items)
            } else {
                items.join(",")
            })
        }
        Some(Value::Array(_)) => Err(format!("a list is not a valid {flag_type} value")),
        Some(Value::Object(_)) => Err("a mapping is not a valid flag value".to_string()),
    }
}

/// Configuration for a command and its subtree
#[derive(Debug, Deserialize, Serialize)]
pub struct ConfigCommand {
    pub name: String,
    pub short: Option<String>,
    pub long: Option<String>,
    pub cmd: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub flags: Option<Vec<ConfigFlag>>,
    pub persistent_flags: Option<Vec<ConfigFlag>>,
    pub children: Option<Vec<ConfigCommand>>,
}

impl ConfigCommand {
    /// Build the command tree, resolving working directories against the
    /// inherited one and checking that they exist.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unusable flag defaults or missing directories.
    pub fn build(self, inheritance: &Inheritance) -> Result<Command, ConfigError> {
        let explicit_cwd = self.cwd.is_some();
        let mut inherited = inheritance.descend(
            &self.name,
            self.cwd.unwrap_or_default(),
            self.env.unwrap_or_default(),
        );
        if explicit_cwd {
            inherited.cwd =
                inherited
                    .cwd
                    .canonicalize()
                    .map_err(|e| ConfigError::DirectoryNotFound {
                        path: inherited.cwd.clone(),
                        entry: inherited.entry_path.join("."),
                        source: e,
                    })?;
        }

        let flags = build_flags(&self.name, self.flags)?;
        let persistent_flags = build_flags(&self.name, self.persistent_flags)?;
        let runner: Arc<dyn Runner> = match self.cmd {
            Some(cmd) => Arc::new(ShellRunner {
                cmd,
                cwd: inherited.cwd.clone(),
                env: inherited.env.clone(),
            }),
            None => Arc::new(UsageRunner),
        };
        let children = self
            .children
            .unwrap_or_default()
            .into_iter()
            .map(|child| child.build(&inherited))
            .collect::<Result<Vec<Command>, ConfigError>>()?;

        Ok(Command {
            name: self.name,
            short: self.short.unwrap_or_default(),
            long: self.long.unwrap_or_default(),
            flags,
            persistent_flags,
            children,
            runner,
        })
    }
}

fn build_flags(command: &str, flags: Option<Vec<ConfigFlag>>) -> Result<Vec<Flag>, ConfigError> {
    flags
        .unwrap_or_default()
        .into_iter()
        .map(|f| f.build(command))
        .collect()
}

/// Settings for the HTTP front-end
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub address: String,
    /// Address the page's script sends requests to; empty means same origin
    pub public_address: String,
    pub allow_cors: bool,
    /// HTML page template containing `{{gui}}`
    pub page: Option<PathBuf>,
    /// Stream command output to connected browsers over `/ws`
    pub live_output: bool,
    /// Report invalid arguments as 500 instead of 400
    pub legacy_status_codes: bool,
    /// Where uploads are stored; a temporary directory when unset
    pub upload_dir: Option<PathBuf>,
    pub max_upload_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "127.0.0.1:8080".to_string(),
            public_address: String::new(),
            allow_cors: false,
            page: None,
            live_output: true,
            legacy_status_codes: false,
            upload_dir: None,
            max_upload_bytes: 32 << 20,
        }
    }
}

impl ServerConfig {
    /// Resolve relative paths against the directory holding the config file
    pub fn resolve_paths(&mut self, cwd: &Path) {
        if let Some(page) = self.page.take() {
            self.page = Some(cwd.join(page));
        }
        if let Some(dir) = self.upload_dir.take() {
            self.upload_dir = Some(cwd.join(dir));
        }
    }

    /// Read the configured page template, if any.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Page` if the template cannot be read.
    pub fn read_page(&self) -> Result<Option<String>, ConfigError> {
        self.page
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path).map_err(|source| ConfigError::Page {
                    path: path.clone(),
                    source,
                })
            })
            .transpose()
    }
}

/// Root configuration structure for treegui
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub treegui_version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(flatten)]
    pub root: ConfigCommand,
}

/// List of supported configuration file names
const FILENAMES: [&str; 3] = [".treegui.json", ".treegui.yaml", ".treegui.yml"];

impl Config {
    /// Loads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if the file cannot be read, or
    /// `ConfigError::Yaml`/`ConfigError::Json` if parsing fails.
    pub fn from_file(file: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(file)
            .map_err(|_| ConfigError::ConfigNotFound(file.to_path_buf()))?;
        let config: Config = if file.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents).map_err(|e| ConfigError::Json {
                source: e,
                path: file.to_path_buf(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Yaml {
                source: e,
                path: file.to_path_buf(),
            })?
        };
        Ok(config)
    }

    /// Searches for a configuration file in the current directory and its parents.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownWorkingDirectory` if the cwd cannot be determined,
    /// or `ConfigError::ConfigNotFound` if no config file is found.
    pub fn find_config() -> Result<PathBuf, ConfigError> {
        let config_path = std::env::current_dir()
            .map_err(|e| ConfigError::UnknownWorkingDirectory(e.to_string()))?;
        let mut path = config_path.clone();
        debug!("Searching for config file in {}", config_path.display());
        loop {
            for file in &FILENAMES {
                let config_path = path.join(file);
                if config_path.exists() {
                    info!("Found config file: {}", config_path.display());
                    return Ok(config_path);
                }
            }
            if !path.pop() {
                return Err(ConfigError::ConfigNotFound(config_path));
            }
        }
    }
}
