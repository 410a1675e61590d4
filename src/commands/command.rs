use std::fmt;
use std::io::Write;
use std::sync::Arc;

use serde::Serialize;

use crate::commands::flag::{Flag, FlagType};
use crate::commands::runner::{RunContext, RunError, Runner, UsageRunner};

/// Name of the pseudo-command that prints usage for its parent
pub const HELP: &str = "help";

/// One node of the command tree
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub short: String,
    pub long: String,
    /// Flags that apply to this command only
    pub flags: Vec<Flag>,
    /// Flags that also apply to every descendant
    pub persistent_flags: Vec<Flag>,
    pub children: Vec<Command>,
    pub runner: Arc<dyn Runner>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("short", &self.short)
            .field("long", &self.long)
            .field("flags", &self.flags)
            .field("persistent_flags", &self.persistent_flags)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl Command {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            short: String::new(),
            long: String::new(),
            flags: Vec::new(),
            persistent_flags: Vec::new(),
            children: Vec::new(),
            runner: Arc::new(UsageRunner),
        }
    }

    #[must_use]
    pub fn short(mut self, short: impl Into<String>) -> Self {
        self.short = short.into();
        self
    }

    #[must_use]
    pub fn long(mut self, long: impl Into<String>) -> Self {
        self.long = long.into();
        self
    }

    #[must_use]
    pub fn flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    #[must_use]
    pub fn persistent_flag(mut self, flag: Flag) -> Self {
        self.persistent_flags.push(flag);
        self
    }

    #[must_use]
    pub fn child(mut self, child: Command) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn runner(mut self, runner: impl Runner + 'static) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    /// Bind a closure as this command's behavior
    #[must_use]
    pub fn run_fn<F>(self, f: F) -> Self
    where
        F: Fn(&RunContext<'_>, &mut dyn Write) -> Result<(), RunError> + Send + Sync + 'static,
    {
        self.runner(f)
    }

    #[must_use]
    pub fn find_child(&self, name: &str) -> Option<&Command> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Children offered for selection, which never includes the `help` pseudo-command
    pub fn visible_children(&self) -> impl Iterator<Item = &Command> {
        self.children.iter().filter(|c| c.name != HELP)
    }

    /// Flags declared on this node in display order: persistent first, then local
    pub fn display_flags(&self) -> impl Iterator<Item = &Flag> {
        self.persistent_flags.iter().chain(self.flags.iter())
    }

    /// Number of nodes in this subtree, including this one
    #[must_use]
    pub fn count(&self) -> usize {
        1 + self.visible_children().map(Command::count).sum::<usize>()
    }

    #[must_use]
    pub fn describe(&self) -> CommandDescription {
        CommandDescription {
            name: self.name.clone(),
            doc: self.long.clone(),
            persistent_flags: self.persistent_flags.iter().map(describe_flag).collect(),
            local_flags: self.flags.iter().map(describe_flag).collect(),
            children: self.visible_children().map(Command::describe).collect(),
        }
    }
}

fn describe_flag(flag: &Flag) -> FlagDescription {
    FlagDescription {
        name: flag.name.clone(),
        usage: flag.usage.clone(),
        flag_type: flag.flag_type,
        value: flag.default.to_string(),
        uploadable: flag.uploadable,
    }
}

/// Plain-data view of a command tree, as printed by `treegui describe`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandDescription {
    pub name: String,
    pub doc: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persistent_flags: Vec<FlagDescription>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub local_flags: Vec<FlagDescription>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CommandDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagDescription {
    pub name: String,
    pub usage: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub uploadable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(name: &str, usage: &str, flag_type: FlagType, value: &str) -> FlagDescription {
        FlagDescription {
            name: name.to_string(),
            usage: usage.to_string(),
            flag_type,
            value: value.to_string(),
            uploadable: false,
        }
    }

    #[test]
    fn test_describe() {
        let root = Command::new("Root")
            .long("Documentation for the root command.")
            .flag(Flag::string("abc", "123").usage("you and me"))
            .persistent_flag(Flag::float("=", 42.0).usage("the answer"))
            .child(
                Command::new("sub1")
                    .long("sub1 documentation")
                    .child(
                        Command::new("subsub1")
                            .long("subsub1 documentation")
                            .flag(Flag::string("sub", "sub").usage("1")),
                    ),
            )
            .child(Command::new("sub2").long("sub2 documentation"));

        let want = CommandDescription {
            name: "Root".into(),
            doc: "Documentation for the root command.".into(),
            persistent_flags: vec![fd("=", "the answer", FlagType::Float, "42")],
            local_flags: vec![fd("abc", "you and me", FlagType::String, "123")],
            children: vec![
                CommandDescription {
                    name: "sub1".into(),
                    doc: "sub1 documentation".into(),
                    persistent_flags: vec![],
                    local_flags: vec![],
                    children: vec![CommandDescription {
                        name: "subsub1".into(),
                        doc: "subsub1 documentation".into(),
                        persistent_flags: vec![],
                        local_flags: vec![fd("sub", "1", FlagType::String, "sub")],
                        children: vec![],
                    }],
                },
                CommandDescription {
                    name: "sub2".into(),
                    doc: "sub2 documentation".into(),
                    persistent_flags: vec![],
                    local_flags: vec![],
                    children: vec![],
                },
            ],
        };
        assert_eq!(root.describe(), want);
    }

    #[test]
    fn test_describe_json_omits_empty_sections() {
        let json = serde_json::to_value(Command::new("leaf").long("doc").describe()).unwrap();
        assert_eq!(json, serde_json::json!({"name": "leaf", "doc": "doc"}));
    }

    #[test]
    fn test_display_flags_order() {
        let cmd = Command::new("run")
            .flag(Flag::int("begin", 0))
            .persistent_flag(Flag::bool("inBackground", false));
        let names: Vec<_> = cmd.display_flags().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["inBackground", "begin"]);
    }

    #[test]
    fn test_help_child_is_not_visible() {
        let cmd = Command::new("root")
            .child(Command::new("help"))
            .child(Command::new("add"));
        let names: Vec<_> = cmd.visible_children().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["add"]);
        assert_eq!(cmd.count(), 2);
    }
}
