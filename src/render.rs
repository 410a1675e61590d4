//! Command tree to HTML

use std::fmt::{self, Write};

use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use serde_json::json;

use crate::commands::command::Command;
use crate::commands::flag::Flag;

/// Placeholder in page templates replaced by the rendered GUI
pub const GUI_PLACEHOLDER: &str = "{{gui}}";

/// Minimal page used when no template is configured
pub const DEFAULT_PAGE: &str = include_str!("assets/page.html");

const CLIENT_SCRIPT: &str = include_str!("assets/gui.js");

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// `host:port` the page's script talks to; empty means the page's own origin
    pub server_address: String,
    /// Connect to `/ws` for live output
    pub live_output: bool,
}

/// Render the GUI fragment for `root`: one container per command, the Execute
/// button, the output log, and the client script.
#[must_use]
pub fn render_gui(root: &Command, options: &RenderOptions) -> String {
    let mut out = String::new();
    // fmt::Write for String never fails
    let _ = write_gui(&mut out, root, options);
    out
}

/// Substitute the rendered GUI into a page template
#[must_use]
pub fn render_page(template: &str, gui: &str) -> String {
    template.replace(GUI_PLACEHOLDER, gui)
}

fn write_gui(out: &mut String, root: &Command, options: &RenderOptions) -> fmt::Result {
    writeln!(out, r#"<div class="treegui" id="gui-{}">"#, attr(&root.name))?;
    let mut path = Vec::new();
    write_command(out, root, &mut path)?;
    writeln!(out, "<br/>")?;
    writeln!(out, "<button data-gui-execute>Execute</button>")?;
    writeln!(
        out,
        r#"<pre class="gui-log" style="padding:10px; background:lightgray; height:30em; overflow-y:scroll; white-space:pre-wrap; word-break:break-all;"></pre>"#
    )?;
    let config = json!({
        "root": root.name,
        "server": options.server_address,
        "live": options.live_output,
    });
    writeln!(out, "<script>")?;
    out.push_str(CLIENT_SCRIPT);
    // `</` would end the script element early
    writeln!(out, "\ntreegui({});", config.to_string().replace("</", "<\\/"))?;
    writeln!(out, "</script>")?;
    writeln!(out, "</div>")
}

fn write_command<'a>(out: &mut String, command: &'a Command, path: &mut Vec<&'a str>) -> fmt::Result {
    path.push(&command.name);
    let hidden = if path.len() > 1 {
        r#" style="display:none;""#
    } else {
        ""
    };
    writeln!(
        out,
        r#"<div data-gui-node data-gui-name="{}" data-gui-path="{}"{hidden}>"#,
        attr(&command.name),
        attr(&path.join("/")),
    )?;
    writeln!(
        out,
        r#"<h3 title="{}">{}</h3>"#,
        attr(&command.short),
        text(&command.name)
    )?;
    if !command.long.is_empty() {
        writeln!(out, "<p>{}</p>", text(&command.long))?;
    }

    writeln!(out, r#"<ul class="flags">"#)?;
    for flag in &command.persistent_flags {
        write_flag(out, flag, true)?;
    }
    for flag in &command.flags {
        write_flag(out, flag, false)?;
    }
    writeln!(out, "</ul>")?;

    let mut children = command.visible_children().peekable();
    if children.peek().is_some() {
        writeln!(out, "<select data-gui-select>")?;
        writeln!(out, "<option selected disabled>Select</option>")?;
        for child in children {
            writeln!(
                out,
                r#"<option value="{}">{}</option>"#,
                attr(&child.name),
                text(&child.name)
            )?;
        }
        writeln!(out, "</select>")?;
        for child in command.visible_children() {
            write_command(out, child, path)?;
        }
    }

    writeln!(out, "</div>")?;
    path.pop();
    Ok(())
}

fn write_flag(out: &mut String, flag: &Flag, persistent: bool) -> fmt::Result {
    let list = flag.flag_type.is_list();
    write!(
        out,
        r#"<li><code data-name="{}" data-type="{}"{}{}>--{}="#,
        attr(&flag.name),
        flag.flag_type,
        if list { " data-list" } else { "" },
        if persistent { " data-persistent" } else { "" },
        text(&flag.name)
    )?;
    if list {
        write!(out, "<span data-gui-values>")?;
        for element in flag.default.elements() {
            write!(out, r#"<input type="text" value="{}">"#, attr(&element))?;
        }
        write!(
            out,
            r#"</span><button type="button" data-gui-add title="Add a value">+</button>"#
        )?;
    } else {
        write!(
            out,
            r#"<input type="text" value="{}">"#,
            attr(&flag.default.to_string())
        )?;
    }
    if flag.uploadable {
        write!(
            out,
            r#"<input type="file" name="{}"{}>"#,
            attr(&flag.name),
            if list { " multiple" } else { "" }
        )?;
    }
    writeln!(out, "</code><br>")?;
    writeln!(out, "<blockquote>{}</blockquote></li>", text(&flag.usage))
}
