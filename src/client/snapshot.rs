use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commands::command::Command;
use crate::commands::flag::Flag;
use crate::dispatch::ExecRequest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("no container at `{0}`")]
    NoSuchNode(String),
    #[error("`{parent}` has no child `{child}`")]
    NoSuchChild { parent: String, child: String },
    #[error("`{command}` has no flag --{flag}")]
    NoSuchFlag { command: String, flag: String },
    #[error("container `{0}` is hidden")]
    Hidden(String),
}

/// Editable state of one flag input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFlag {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persistent: bool,
    /// One entry per input; scalar flags always have exactly one
    pub values: Vec<String>,
}

impl ViewFlag {
    fn from_flag(flag: &Flag, persistent: bool) -> Self {
        let list = flag.flag_type.is_list();
        ViewFlag {
            name: flag.name.clone(),
            list,
            persistent,
            values: if list {
                flag.default.elements()
            } else {
                vec![flag.default.to_string()]
            },
        }
    }

    /// Query pairs for this input. Blank list entries are skipped, and an
    /// emptied list is still sent once so it overrides the default.
    fn pairs(&self) -> Vec<(String, String)> {
        if !self.list {
            let value = self.values.first().cloned().unwrap_or_default();
            return vec![(self.name.clone(), value)];
        }
        let values: Vec<&String> = self.values.iter().filter(|v| !v.is_empty()).collect();
        if values.is_empty() {
            return vec![(self.name.clone(), String::new())];
        }
        values
            .into_iter()
            .map(|v| (self.name.clone(), v.clone()))
            .collect()
    }
}

/// Serializable picture of the rendered page: which containers are visible and
/// what every input holds. Mirrors the markup one container per command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewNode {
    pub name: String,
    pub visible: bool,
    pub flags: Vec<ViewFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ViewNode>,
}

impl ViewNode {
    /// State right after page load: only the root visible, inputs at their defaults
    #[must_use]
    pub fn initial(root: &Command) -> Self {
        Self::build(root, true)
    }

    fn build(command: &Command, visible: bool) -> Self {
        let flags = command
            .persistent_flags
            .iter()
            .map(|f| ViewFlag::from_flag(f, true))
            .chain(command.flags.iter().map(|f| ViewFlag::from_flag(f, false)))
            .collect();
        ViewNode {
            name: command.name.clone(),
            visible,
            flags,
            children: command
                .visible_children()
                .map(|c| Self::build(c, false))
                .collect(),
        }
    }

    fn node_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Result<&mut ViewNode, SelectError> {
        let joined = || {
            path.iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join("/")
        };
        let Some((first, rest)) = path.split_first() else {
            return Err(SelectError::NoSuchNode(String::new()));
        };
        if first.as_ref() != self.name {
            return Err(SelectError::NoSuchNode(joined()));
        }
        let mut node = self;
        for segment in rest {
            node = node
                .children
                .iter_mut()
                .find(|c| c.name == segment.as_ref())
                .ok_or_else(|| SelectError::NoSuchNode(joined()))?;
        }
        if !node.visible {
            return Err(SelectError::Hidden(joined()));
        }
        Ok(node)
    }

    fn hide_subtree(&mut self) {
        self.visible = false;
        for child in &mut self.children {
            child.hide_subtree();
        }
    }

    /// Change the dropdown of the container at `path` to `child`: exactly that
    /// child becomes visible and every sibling subtree is hidden.
    ///
    /// # Errors
    ///
    /// Returns `SelectError` if `path` is unknown or hidden, or `child` is not one
    /// of its children.
    pub fn select<S: AsRef<str>>(&mut self, path: &[S], child: &str) -> Result<(), SelectError> {
        let node = self.node_mut(path)?;
        if !node.children.iter().any(|c| c.name == child) {
            return Err(SelectError::NoSuchChild {
                parent: node.name.clone(),
                child: child.to_string(),
            });
        }
        for c in &mut node.children {
            if c.name == child {
                c.visible = true;
            } else {
                c.hide_subtree();
            }
        }
        Ok(())
    }

    /// Replace the inputs of flag `name` in the container at `path`.
    ///
    /// # Errors
    ///
    /// Returns `SelectError` if the container or flag does not exist.
    pub fn set_flag<S: AsRef<str>>(
        &mut self,
        path: &[S],
        name: &str,
        values: Vec<String>,
    ) -> Result<(), SelectError> {
        let node = self.node_mut(path)?;
        let command = node.name.clone();
        let flag = node
            .flags
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| SelectError::NoSuchFlag {
                command,
                flag: name.to_string(),
            })?;
        flag.values = values;
        Ok(())
    }

    /// Visible containers from the root down to the selected command
    #[must_use]
    pub fn visible_chain(&self) -> Vec<&ViewNode> {
        let mut chain = Vec::new();
        let mut current = self.visible.then_some(self);
        while let Some(node) = current {
            chain.push(node);
            current = node.children.iter().find(|c| c.visible);
        }
        chain
    }

    #[must_use]
    pub fn visible_path(&self) -> Vec<&str> {
        self.visible_chain()
            .into_iter()
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Walk the visible containers root to leaf, collecting the command path,
    /// the ancestors' persistent flags and every flag of the selected command.
    #[must_use]
    pub fn collect(&self) -> Invocation {
        let chain = self.visible_chain();
        let last = chain.len().saturating_sub(1);
        let mut flags = Vec::new();
        for (depth, node) in chain.iter().enumerate() {
            for flag in &node.flags {
                if depth == last || flag.persistent {
                    flags.extend(flag.pairs());
                }
            }
        }
        Invocation {
            commands: chain.iter().map(|n| n.name.clone()).collect(),
            flags,
        }
    }
}

/// The execution request assembled by the page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub commands: Vec<String>,
    pub flags: Vec<(String, String)>,
}

impl Invocation {
    /// Request target such as `/root/add?num1=5&num2=7`
    #[must_use]
    pub fn request_target(&self) -> String {
        let path: Vec<_> = self
            .commands
            .iter()
            .map(|c| urlencoding::encode(c))
            .collect();
        let query: Vec<String> = self
            .flags
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect();
        if query.is_empty() {
            format!("/{}", path.join("/"))
        } else {
            format!("/{}?{}", path.join("/"), query.join("&"))
        }
    }

    /// Preview shown in the log, e.g. `root add --num1="5"`
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = self.commands.clone();
        parts.extend(
            self.flags
                .iter()
                .map(|(name, value)| format!("--{name}={}", serde_json::Value::from(value.as_str()))),
        );
        parts.join(" ")
    }

    #[must_use]
    pub fn into_request(self) -> ExecRequest {
        ExecRequest {
            segments: self.commands,
            params: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::commands::flag::Flag;
    use crate::dispatch::Dispatcher;

    fn tree() -> Command {
        Command::new("root")
            .persistent_flag(Flag::int("timeout", 30))
            .flag(Flag::bool("verbose", false))
            .child(
                Command::new("add")
                    .flag(Flag::int("num1", 1))
                    .flag(Flag::int("num2", 1))
                    .run_fn(|ctx, out| {
                        let a = ctx.flags.int("num1").unwrap_or_default();
                        let b = ctx.flags.int("num2").unwrap_or_default();
                        write!(out, "{a} + {b} = {}", a + b)?;
                        Ok(())
                    }),
            )
            .child(
                Command::new("files")
                    .child(Command::new("ls").flag(Flag::string_list("paths", ["."]))),
            )
    }

    fn count_visible(node: &ViewNode) -> usize {
        usize::from(node.visible) + node.children.iter().map(count_visible).sum::<usize>()
    }

    #[test]
    fn test_initial_only_root_visible() {
        let view = ViewNode::initial(&tree());
        assert_eq!(count_visible(&view), 1);
        assert_eq!(view.visible_path(), ["root"]);
    }

    #[test]
    fn test_select_hides_sibling_subtrees() {
        let mut view = ViewNode::initial(&tree());
        view.select(&["root"], "files").unwrap();
        view.select(&["root", "files"], "ls").unwrap();
        assert_eq!(view.visible_path(), ["root", "files", "ls"]);

        view.select(&["root"], "add").unwrap();
        assert_eq!(view.visible_path(), ["root", "add"]);
        assert_eq!(count_visible(&view), 2);
        // Coming back to `files` does not bring back its old selection
        view.select(&["root"], "files").unwrap();
        assert_eq!(view.visible_path(), ["root", "files"]);
    }

    #[test]
    fn test_select_errors() {
        let mut view = ViewNode::initial(&tree());
        assert_eq!(
            view.select(&["root"], "nope"),
            Err(SelectError::NoSuchChild {
                parent: "root".to_string(),
                child: "nope".to_string()
            })
        );
        assert_eq!(
            view.select(&["root", "files"], "ls"),
            Err(SelectError::Hidden("root/files".to_string()))
        );
        assert!(matches!(
            view.set_flag(&["root"], "num1", vec![]),
            Err(SelectError::NoSuchFlag { .. })
        ));
    }

    #[test]
    fn test_collect_skips_ancestor_local_flags() {
        let mut view = ViewNode::initial(&tree());
        view.select(&["root"], "add").unwrap();
        view.set_flag(&["root", "add"], "num1", vec!["5".to_string()])
            .unwrap();
        let invocation = view.collect();
        assert_eq!(invocation.commands, ["root", "add"]);
        let names: Vec<_> = invocation.flags.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["timeout", "num1", "num2"]);
    }

    #[test]
    fn test_collect_root_sends_its_local_flags() {
        let invocation = ViewNode::initial(&tree()).collect();
        assert_eq!(
            invocation.request_target(),
            "/root?timeout=30&verbose=false"
        );
    }

    #[test]
    fn test_list_values() {
        let mut view = ViewNode::initial(&tree());
        view.select(&["root"], "files").unwrap();
        view.select(&["root", "files"], "ls").unwrap();
        let path = ["root", "files", "ls"];

        view.set_flag(&path, "paths", vec!["a b".into(), String::new(), "c".into()])
            .unwrap();
        assert_eq!(
            view.collect().request_target(),
            "/root/files/ls?timeout=30&paths=a%20b&paths=c"
        );

        view.set_flag(&path, "paths", vec![]).unwrap();
        assert_eq!(
            view.collect().request_target(),
            "/root/files/ls?timeout=30&paths="
        );
    }

    #[test]
    fn test_command_line_quotes_values() {
        let invocation = Invocation {
            commands: vec!["root".into(), "echo".into()],
            flags: vec![("text".into(), "say \"hi\"".into())],
        };
        insta::assert_snapshot!(invocation.command_line(), @r#"root echo --text="say \"hi\"""#);
    }

    #[test]
    fn test_collected_request_dispatches() {
        let root = tree();
        let mut view = ViewNode::initial(&root);
        view.select(&["root"], "add").unwrap();
        view.set_flag(&["root", "add"], "num1", vec!["5".into()])
            .unwrap();
        view.set_flag(&["root", "add"], "num2", vec!["7".into()])
            .unwrap();

        let dispatcher = Dispatcher::new(Arc::new(root)).unwrap();
        let execution = dispatcher.dispatch(&view.collect().into_request()).unwrap();
        assert_eq!(execution.output, "5 + 7 = 12");
    }
}
