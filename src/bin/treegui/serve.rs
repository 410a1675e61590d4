use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use log::{info, warn};

use treegui::commands::command::Command;
use treegui::config_file::ServerConfig;
use treegui::render::{DEFAULT_PAGE, RenderOptions};
use treegui::server::{App, GuiServer};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    address: Option<String>,

    /// HTML page template containing `{{gui}}` (overrides the config file)
    #[arg(long, conflicts_with = "default_page")]
    page: Option<PathBuf>,

    /// Serve the built-in page at `/`
    #[arg(long)]
    default_page: bool,

    /// Allow cross-origin requests
    #[arg(long)]
    cors: bool,
}

/// Run the server until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the server cannot be set up or bound.
pub async fn run(
    args: &ServeArgs,
    root: Command,
    mut config: ServerConfig,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if let Some(ref address) = args.address {
        config.address.clone_from(address);
    }
    if let Some(ref page) = args.page {
        config.page = Some(page.clone());
    }
    config.allow_cors |= args.cors;

    info!("Serving {} commands", root.count());
    let mut app = App::from_config(Arc::new(root), &config)?;
    if args.default_page {
        let options = RenderOptions {
            server_address: config.public_address.clone(),
            live_output: config.live_output,
        };
        app = app.with_page(DEFAULT_PAGE, &options);
    } else if config.page.is_none() {
        warn!("No page template configured, `GET /` will answer 404 (use --default-page)");
    }

    let server = GuiServer::bind(&config.address, app)?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });
    server.run().await?;
    Ok(ExitCode::SUCCESS)
}
