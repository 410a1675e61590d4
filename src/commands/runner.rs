use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, ExitStatus, Stdio};

use log::debug;
use thiserror::Error;

use crate::commands::command::Command;
use crate::commands::inherit::FlagBindings;

/// Failure reported by a command's own logic
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to start `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error("command failed ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("writing command output: {0}")]
    Output(#[from] io::Error),
    #[error("{0}")]
    Message(String),
}

impl RunError {
    pub fn msg(message: impl Into<String>) -> Self {
        RunError::Message(message.into())
    }
}

/// Everything a runner gets to see about the invocation
pub struct RunContext<'a> {
    /// Resolved commands, root first
    pub chain: &'a [&'a Command],
    pub flags: &'a FlagBindings<'a>,
}

impl<'a> RunContext<'a> {
    /// The command being executed.
    ///
    /// # Panics
    ///
    /// Panics if the chain is empty, which resolution never produces.
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

/// The executable behavior bound to a command node
pub trait Runner: Send + Sync {
    /// Execute the command, writing its output to `out`.
    ///
    /// # Errors
    ///
    /// Returns `RunError` when the command fails or output cannot be written.
    fn run(&self, ctx: &RunContext<'_>, out: &mut dyn Write) -> Result<(), RunError>;
}

impl<F> Runner for F
where
    F: Fn(&RunContext<'_>, &mut dyn Write) -> Result<(), RunError> + Send + Sync,
{
    fn run(&self, ctx: &RunContext<'_>, out: &mut dyn Write) -> Result<(), RunError> {
        self(ctx, out)
    }
}

/// Prints a usage summary for the command. Bound to every node that has no
/// behavior of its own, and to the `help` pseudo-command.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageRunner;

impl Runner for UsageRunner {
    fn run(&self, ctx: &RunContext<'_>, out: &mut dyn Write) -> Result<(), RunError> {
        let command = ctx.command();
        let path = ctx.path().join(" ");
        if !command.long.is_empty() {
            writeln!(out, "{}\n", command.long)?;
        } else if !command.short.is_empty() {
            writeln!(out, "{}\n", command.short)?;
        }
        writeln!(out, "Usage:")?;
        let mut children = command.visible_children().peekable();
        if children.peek().is_some() {
            writeln!(out, "  {path} [command]")?;
            writeln!(out, "\nAvailable Commands:")?;
            let width = command
                .visible_children()
                .map(|c| c.name.len())
                .max()
                .unwrap_or(0);
            for child in children {
                writeln!(out, "  {:width$}  {}", child.name, child.short)?;
            }
        } else {
            writeln!(out, "  {path} [flags]")?;
        }
        let flags: Vec<_> = ctx.flags.iter().collect();
        if !flags.is_empty() {
            writeln!(out, "\nFlags:")?;
            for binding in flags {
                writeln!(
                    out,
                    "  --{} {}\t{} (current \"{}\")",
                    binding.flag.name, binding.flag.flag_type, binding.flag.usage, binding.value
                )?;
            }
        }
        Ok(())
    }
}

/// Runs a shell command with every bound flag exported as `FLAG_<NAME>`
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    pub cmd: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl ShellRunner {
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        ShellRunner {
            cmd: cmd.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ShellRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sh -c {:?}", self.cmd)
    }
}

impl Runner for ShellRunner {
    fn run(&self, ctx: &RunContext<'_>, out: &mut dyn Write) -> Result<(), RunError> {
        let mut process = ProcessCommand::new("sh");
        process
            .arg("-c")
            .arg(&self.cmd)
            .envs(&self.env)
            .envs(ctx.flags.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.cwd.as_os_str().is_empty() {
            process.current_dir(&self.cwd);
        }
        debug!("Spawning {self}");
        let mut child = process.spawn().map_err(|source| RunError::Spawn {
            cmd: self.cmd.clone(),
            source,
        })?;

        // Drain stderr on its own thread so a chatty command cannot block on a full pipe
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut captured = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut captured);
            }
            captured
        });

        if let Some(stdout) = child.stdout.take()
            && let Err(e) = stream_lines(stdout, out)
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Output(e));
        }

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if status.success() {
            out.write_all(stderr.as_bytes())?;
            Ok(())
        } else {
            Err(RunError::Failed {
                status,
                stderr: stderr.trim_end().to_string(),
            })
        }
    }
}

fn stream_lines(source: impl Read, out: &mut dyn Write) -> io::Result<()> {
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        out.write_all(&line)?;
        out.flush()?;
    }
}

/// Environment variable name a flag is exported under
#[must_use]
pub fn flag_env_name(flag: &str) -> String {
    let mut name = String::from("FLAG_");
    name.extend(flag.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}
