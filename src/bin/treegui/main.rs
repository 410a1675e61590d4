mod describe;
mod render;
mod serve;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use treegui::load_config;

#[derive(Parser, Debug)]
#[command(
    name = "treegui",
    version,
    about = "Browser GUI for a command tree, running commands on the server"
)]
struct Cli {
    /// Path to config file (auto-detected if not specified)
    #[arg(short, long)]
    config: Option<String>,

    /// Also write log lines to this file
    #[arg(long)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the GUI and execute commands over HTTP
    Serve(serve::ServeArgs),
    /// Write the rendered page to a file or stdout
    Render(render::RenderArgs),
    /// Print the command tree as JSON
    Describe,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_file = cli.log_file.as_ref().map(std::fs::File::create).transpose()?;
    treegui::logger::init(log_file)?;

    let (root, server, _config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(ref args) => serve::run(args, root, server).await,
        Commands::Render(ref args) => render::run(args, &root, &server),
        Commands::Describe => describe::run(&root),
    }
}
