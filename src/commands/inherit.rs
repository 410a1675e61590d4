use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;

use crate::commands::command::Command;
use crate::commands::flag::{Flag, FlagValue, ParseValueError};
use crate::commands::runner::flag_env_name;

#[must_use]
pub fn inherit_path(parent: &Path, child: PathBuf) -> PathBuf {
    if child.as_os_str().is_empty() {
        parent.to_path_buf()
    } else if child.is_relative() {
        parent.join(child)
    } else {
        child
    }
}

/// Settings that flow from a command to its descendants while the tree is built
#[derive(Debug, Default, Clone)]
pub struct Inheritance {
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub entry_path: Vec<String>,
}

impl Inheritance {
    #[must_use]
    pub fn descend(&self, name: &str, cwd: PathBuf, env: HashMap<String, String>) -> Inheritance {
        let mut merged_env = self.env.clone();
        merged_env.extend(env);
        let mut entry_path = self.entry_path.clone();
        entry_path.push(name.to_string());
        Inheritance {
            cwd: inherit_path(&self.cwd, cwd),
            env: merged_env,
            entry_path,
        }
    }
}

impl From<PathBuf> for Inheritance {
    fn from(cwd: PathBuf) -> Self {
        Inheritance {
            cwd,
            ..Default::default()
        }
    }
}

/// Every flag that applies to the last command of `chain`, paired with the
/// name of the command declaring it. Ancestors contribute their persistent
/// flags, root first; the command itself contributes persistent then local.
#[must_use]
pub fn effective_flags<'a>(chain: &[&'a Command]) -> Vec<(&'a Flag, &'a str)> {
    let Some((target, ancestors)) = chain.split_last() else {
        return Vec::new();
    };
    ancestors
        .iter()
        .flat_map(|a| a.persistent_flags.iter().map(|f| (f, a.name.as_str())))
        .chain(target.display_flags().map(|f| (f, target.name.as_str())))
        .collect()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("unknown flag: --{0}")]
    Unknown(String),
    #[error(transparent)]
    Invalid(#[from] ParseValueError),
}

/// Current value of one flag within a single request
#[derive(Debug, Clone)]
pub struct Binding<'a> {
    pub flag: &'a Flag,
    /// Command that declares the flag
    pub owner: &'a str,
    pub value: FlagValue,
    pub changed: bool,
}

/// Request-scoped flag values. Created from the declared defaults for every
/// request, so assignments never outlive the request that made them.
#[derive(Debug, Clone, Default)]
pub struct FlagBindings<'a> {
    entries: IndexMap<&'a str, Binding<'a>>,
}

impl<'a> FlagBindings<'a> {
    #[must_use]
    pub fn for_chain(chain: &[&'a Command]) -> Self {
        let entries = effective_flags(chain)
            .into_iter()
            .map(|(flag, owner)| {
                (
                    flag.name.as_str(),
                    Binding {
                        flag,
                        owner,
                        value: flag.default.clone(),
                        changed: false,
                    },
                )
            })
            .collect();
        FlagBindings { entries }
    }

    /// Assign a serialized value. The first assignment to a list flag replaces
    /// its default; later ones append.
    ///
    /// # Errors
    ///
    /// Returns `BindError::Unknown` for a flag outside this scope and
    /// `BindError::Invalid` for a value that does not parse as the flag's type.
    pub fn set(&mut self, name: &str, text: &str) -> Result<(), BindError> {
        let binding = self
            .entries
            .get_mut(name)
            .ok_or_else(|| BindError::Unknown(name.to_string()))?;
        let value = FlagValue::parse(binding.flag.flag_type, text)?;
        if binding.changed {
            binding.value.merge(value);
        } else {
            binding.value = value;
            binding.changed = true;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        self.entries.get(name).map(|b| &b.value)
    }

    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&Binding<'a>> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FlagValue::as_str)
    }

    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FlagValue::as_bool)
    }

    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FlagValue::as_int)
    }

    #[must_use]
    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FlagValue::as_float)
    }

    #[must_use]
    pub fn string_list(&self, name: &str) -> Option<&[String]> {
        self.get(name).and_then(FlagValue::as_str_list)
    }

    #[must_use]
    pub fn int_list(&self, name: &str) -> Option<&[i64]> {
        self.get(name).and_then(FlagValue::as_int_list)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding<'a>> {
        self.entries.values()
    }

    /// Flags assigned by the request, in declaration order
    pub fn changed(&self) -> impl Iterator<Item = &Binding<'a>> {
        self.iter().filter(|b| b.changed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `FLAG_<NAME>=<serialized value>` for every flag in scope
    #[must_use]
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|b| (flag_env_name(&b.flag.name), b.value.to_string()))
            .collect()
    }
}
