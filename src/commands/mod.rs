//! Hierarchical command model
//!
//! A tree of commands, each with documentation, typed flags and a runner. The tree is built
//! once at startup and shared read-only afterwards. Flag values for a request live in
//! `FlagBindings`, created fresh from the declared defaults for every request.
//!
//! Persistent flags declared on a command also apply to all of its descendants; local flags
//! apply only to the command that declares them.

pub mod command;
pub mod flag;
pub mod inherit;
pub mod runner;
