//! Resolves a command path plus flag assignments against the tree and runs it

use std::borrow::Cow;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use url::Url;

use crate::commands::command::{Command, HELP};
use crate::commands::flag::ParseValueError;
use crate::commands::inherit::{BindError, FlagBindings};
use crate::commands::runner::{RunContext, RunError, Runner, UsageRunner};
use crate::config_file::ConfigError;
use crate::live::{LiveHub, TeeSink};
use crate::validate_tree;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("unknown flag --{flag} for `{command}`")]
    UnknownFlag { command: String, flag: String },
    #[error("invalid value for --{flag}: {source}")]
    InvalidValue {
        flag: String,
        #[source]
        source: ParseValueError,
    },
    #[error("{0}")]
    Execution(#[from] RunError),
}

impl DispatchError {
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownFlag { .. } | DispatchError::InvalidValue { .. }
        )
    }

    /// HTTP status for this error. Invalid arguments are client errors unless
    /// the legacy mapping, which reports them as server errors, is requested.
    #[must_use]
    pub fn status(&self, legacy: bool) -> u16 {
        match self {
            DispatchError::NotFound(_) => 404,
            _ if self.is_invalid_argument() && !legacy => 400,
            _ => 500,
        }
    }
}

/// A command path and its flag assignments, in the order they arrived
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub segments: Vec<String>,
    pub params: Vec<(String, String)>,
}

impl ExecRequest {
    /// Parse a request target such as `/root/add?num1=5`, plus an optional
    /// `application/x-www-form-urlencoded` body whose pairs follow the query's.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` if the target is not a valid path.
    pub fn from_target(target: &str, form_body: Option<&[u8]>) -> Result<Self, DispatchError> {
        let url = Url::parse("http://localhost/")
            .and_then(|base| base.join(target))
            .map_err(|_| DispatchError::NotFound(target.to_string()))?;
        let segments = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        urlencoding::decode(s)
                            .map_or_else(|_| s.to_string(), Cow::into_owned)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        if let Some(body) = form_body {
            params.extend(url::form_urlencoded::parse(body).into_owned());
        }
        Ok(ExecRequest { segments, params })
    }
}

/// Result of resolving a path: the chain of commands from the root down
#[derive(Debug)]
pub struct Resolved<'a> {
    pub chain: Vec<&'a Command>,
    /// The path ended in the `help` pseudo-command
    pub help: bool,
}

impl<'a> Resolved<'a> {
    /// # Panics
    ///
    /// Never: a resolved chain always contains the root.
    #[must_use]
    pub fn command(&self) -> &'a Command {
        self.chain
            .last()
            .expect("a resolved chain always contains the root")
    }

    #[must_use]
    pub fn path(&self) -> Vec<&'a str> {
        self.chain.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Descend from `root` through children matching each segment in turn.
///
/// # Errors
///
/// Returns `DispatchError::NotFound` if the path does not start with the root's
/// name or any later segment has no matching child.
pub fn resolve<'a, S: AsRef<str>>(
    root: &'a Command,
    segments: &[S],
) -> Result<Resolved<'a>, DispatchError> {
    let joined = || {
        segments
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("/")
    };
    let Some((first, rest)) = segments.split_first() else {
        return Err(DispatchError::NotFound("/".to_string()));
    };
    if first.as_ref() != root.name {
        return Err(DispatchError::NotFound(joined()));
    }
    let mut chain = vec![root];
    let mut current = root;
    for (i, segment) in rest.iter().enumerate() {
        let segment = segment.as_ref();
        if let Some(child) = current.find_child(segment) {
            chain.push(child);
            current = child;
        } else if segment == HELP && i == rest.len() - 1 {
            return Ok(Resolved { chain, help: true });
        } else {
            return Err(DispatchError::NotFound(joined()));
        }
    }
    Ok(Resolved { chain, help: false })
}

/// Fresh flag bindings for `chain` with the request's assignments applied.
///
/// # Errors
///
/// Returns `DispatchError::UnknownFlag` or `DispatchError::InvalidValue`.
pub fn bind<'a>(
    chain: &[&'a Command],
    params: &[(String, String)],
) -> Result<FlagBindings<'a>, DispatchError> {
    let mut bindings = FlagBindings::for_chain(chain);
    for (name, value) in params {
        bindings.set(name, value).map_err(|e| match e {
            BindError::Unknown(flag) => DispatchError::UnknownFlag {
                command: chain
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
                flag,
            },
            BindError::Invalid(source) => DispatchError::InvalidValue {
                flag: name.clone(),
                source,
            },
        })?;
    }
    Ok(bindings)
}

/// What a successful dispatch produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub path: Vec<String>,
    pub output: String,
}

/// Executes requests against a shared, read-only command tree
#[derive(Clone)]
pub struct Dispatcher {
    root: Arc<Command>,
    live: Option<LiveHub>,
}

impl Dispatcher {
    /// Serve `root`, which must pass the same checks as a loaded config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the tree is invalid, for example when a flag
    /// name is declared twice within one command's scope.
    pub fn new(root: Arc<Command>) -> Result<Self, ConfigError> {
        validate_tree(&root)?;
        Ok(Dispatcher { root, live: None })
    }

    /// Also forward output to `hub` while commands run
    #[must_use]
    pub fn with_live(mut self, hub: LiveHub) -> Self {
        self.live = Some(hub);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Command {
        &self.root
    }

    #[must_use]
    pub fn live(&self) -> Option<&LiveHub> {
        self.live.as_ref()
    }

    /// Resolve, bind and run one request, returning the captured output.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError` for unknown paths, bad flags, or a failing command.
    pub fn dispatch(&self, request: &ExecRequest) -> Result<Execution, DispatchError> {
        let resolved = resolve(&self.root, &request.segments)?;
        let bindings = bind(&resolved.chain, &request.params)?;
        let path = resolved.path();
        let assigned: Vec<String> = bindings
            .changed()
            .map(|b| format!("--{}={}", b.flag.name, b.value))
            .collect();
        info!("Executing: {} {}", path.join(" "), assigned.join(" "));

        let runner: &dyn Runner = if resolved.help {
            &UsageRunner
        } else {
            resolved.command().runner.as_ref()
        };
        let ctx = RunContext {
            chain: &resolved.chain,
            flags: &bindings,
        };
        let mut sink = TeeSink::new(self.live.as_ref());
        if let Err(e) = runner.run(&ctx, &mut sink) {
            warn!("Command {} failed: {e}", path.join(" "));
            return Err(DispatchError::Execution(e));
        }
        Ok(Execution {
            path: path.into_iter().map(str::to_string).collect(),
            output: sink.into_output(),
        })
    }
}
