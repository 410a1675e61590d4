//! Browser front-end for hierarchical command trees
//!
//! treegui turns a command tree (commands, subcommands and typed flags, usually declared in a
//! configuration file) into an HTML page. The page lets an operator pick a command path, edit
//! flag values and upload files; the server resolves the chosen path, binds the flags for that
//! single request, runs the command and sends back what it printed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use log::{debug, warn};
use regex::Regex;

use crate::commands::command::{Command, HELP};
use crate::commands::flag::FlagType;
use crate::commands::inherit::{Inheritance, effective_flags};
use crate::config_file::{Config, ConfigError, ServerConfig};

pub mod client;
pub mod commands;
pub mod config_file;
pub mod dispatch;
pub mod live;
pub mod logger;
pub mod render;
pub mod server;
pub mod upload;

/// Command names end up as URL path segments
static COMMAND_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.:-]*$").expect("command name pattern is valid")
});

/// Flag names end up as query parameter keys and environment variable names
static FLAG_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9=_][A-Za-z0-9=_.-]*$").expect("flag name pattern is valid")
});

/// Load configuration from a file (or auto-detect), returning the root `Command`, the server
/// settings, and the config file path.
///
/// # Errors
///
/// Returns `ConfigError` if the config file is not found, cannot be parsed,
/// contains invalid values, or references non-existent directories.
pub fn load_config(
    config_file: Option<&str>,
) -> Result<(Command, ServerConfig, PathBuf), ConfigError> {
    let config_path = match config_file {
        Some(file) => {
            let config_path = PathBuf::from(file);
            if !config_path.exists() {
                return Err(ConfigError::ConfigNotFound(config_path));
            }
            config_path
        }
        None => Config::find_config()?,
    };
    let cwd = config_path
        .parent()
        .ok_or_else(|| ConfigError::ConfigNotFound(config_path.clone()))?
        .to_path_buf();
    debug!(
        "Creating command tree from config file: {} (cwd: {})",
        config_path.display(),
        cwd.display()
    );
    let parsed = Config::from_file(&config_path)?;
    validate_version(&parsed.treegui_version);
    let root = parsed.root.build(&Inheritance::from(cwd.clone()))?;
    validate_tree(&root)?;
    let mut server = parsed.server;
    server.resolve_paths(&cwd);
    Ok((root, server, config_path))
}

/// Warn if the config's `treegui_version` doesn't match the binary version
fn validate_version(config_version: &str) {
    let binary_version = env!("CARGO_PKG_VERSION");
    if config_version != binary_version {
        warn!(
            "Config treegui_version '{config_version}' differs from binary version '{binary_version}'"
        );
    }
}

/// Validate a command tree: names usable in URLs, no sibling collisions, no reserved names,
/// and no flag declared twice within any command's scope.
///
/// # Errors
///
/// Returns `ConfigError` describing the first problem found.
pub fn validate_tree(root: &Command) -> Result<(), ConfigError> {
    check_names(root)?;
    check_siblings(root)?;
    check_flag_scopes(&mut vec![root])?;
    check_empty_commands(root);
    Ok(())
}

fn check_names(command: &Command) -> Result<(), ConfigError> {
    if command.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "Command with an empty name".to_string(),
        ));
    }
    if command.name == HELP {
        return Err(ConfigError::Validation(format!(
            "Command name '{HELP}' is reserved"
        )));
    }
    if !COMMAND_NAME.is_match(&command.name) {
        return Err(ConfigError::Validation(format!(
            "Command name '{}' may only contain letters, digits, '_', '.', ':' and '-'",
            command.name
        )));
    }
    for flag in command.display_flags() {
        if flag.name == HELP {
            return Err(ConfigError::Validation(format!(
                "Flag name '--{HELP}' is reserved (command '{}')",
                command.name
            )));
        }
        if !FLAG_NAME.is_match(&flag.name) {
            return Err(ConfigError::Validation(format!(
                "Flag name '--{}' of '{}' may only contain letters, digits, '=', '_', '.' and '-'",
                flag.name, command.name
            )));
        }
        // Uploads arrive as stored file paths
        if flag.uploadable
            && !matches!(flag.flag_type, FlagType::String | FlagType::StringSlice)
        {
            return Err(ConfigError::Validation(format!(
                "Flag '--{}' of '{}' is uploadable but has type {}; only string and stringSlice flags can hold uploaded paths",
                flag.name, command.name, flag.flag_type
            )));
        }
    }
    for child in &command.children {
        check_names(child)?;
    }
    Ok(())
}

fn check_siblings(command: &Command) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for child in &command.children {
        if !seen.insert(child.name.as_str()) {
            return Err(ConfigError::DuplicateCommand {
                parent: command.name.clone(),
                name: child.name.clone(),
            });
        }
        check_siblings(child)?;
    }
    Ok(())
}

fn check_flag_scopes<'a>(chain: &mut Vec<&'a Command>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (flag, _) in effective_flags(chain) {
        if !seen.insert(flag.name.as_str()) {
            return Err(ConfigError::DuplicateFlag {
                command: chain.last().map(|c| c.name.clone()).unwrap_or_default(),
                flag: flag.name.clone(),
            });
        }
    }
    let Some(current) = chain.last().copied() else {
        return Ok(());
    };
    for child in &current.children {
        chain.push(child);
        check_flag_scopes(chain)?;
        chain.pop();
    }
    Ok(())
}

fn check_empty_commands(command: &Command) {
    for child in &command.children {
        if child.children.is_empty() && child.display_flags().next().is_none() {
            debug!("Command '{}' has no flags and no subcommands", child.name);
        }
        check_empty_commands(child);
    }
}
