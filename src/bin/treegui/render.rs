use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;

use treegui::commands::command::Command;
use treegui::config_file::ServerConfig;
use treegui::render::{DEFAULT_PAGE, RenderOptions, render_gui, render_page};

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Only the GUI fragment, without the surrounding page
    #[arg(long)]
    fragment: bool,
}

/// Render the GUI for the loaded tree.
///
/// # Errors
///
/// Returns an error if the page template or output cannot be read or written.
pub fn run(
    args: &RenderArgs,
    root: &Command,
    config: &ServerConfig,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let options = RenderOptions {
        server_address: config.public_address.clone(),
        live_output: config.live_output,
    };
    let gui = render_gui(root, &options);
    let html = if args.fragment {
        gui
    } else {
        let template = config.read_page()?;
        render_page(template.as_deref().unwrap_or(DEFAULT_PAGE), &gui)
    };

    match args.output {
        Some(ref path) => std::fs::write(path, html)?,
        None => std::io::stdout().lock().write_all(html.as_bytes())?,
    }
    Ok(ExitCode::SUCCESS)
}
