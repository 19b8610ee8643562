use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod archive;
mod cli;
mod config;
mod prompt;
mod tunnel;

use api::ApiClient;
use cli::build::{self, progress::TerminalView, StartArgs, TunnelOptions};
use config::ConfigFile;
use prompt::TerminalPrompter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to your Odevio account
    Signin {
        /// Account e-mail (prompted for when omitted)
        #[arg(long, short)]
        email: Option<String>,
        /// Account password (prompted for when omitted)
        #[arg(long, short)]
        password: Option<String>,
    },
    /// Log out of your Odevio account
    Signout,
    /// Show the logged in account
    Profile {
        /// Highlight the configuration file path
        #[arg(long)]
        ini: bool,
    },
    /// Remote build management commands
    #[command(subcommand)]
    #[command(visible_alias = "b")]
    Build(BuildCommands),
}

#[derive(Subcommand, Debug)]
enum BuildCommands {
    /// Upload a Flutter project and start a build
    #[command(visible_alias = "s")]
    Start(StartArgs),
    /// List your builds
    #[command(visible_alias = "list")]
    Ls {
        /// Include finished builds and builds of your teams
        #[arg(long)]
        all: bool,
    },
    /// Show build details
    #[command(visible_alias = "show")]
    Detail {
        /// Build key
        key: Option<String>,
    },
    /// Delete a build
    #[command(visible_alias = "delete")]
    Rm {
        /// Build key
        key: Option<String>,
    },
    /// Stop a running build
    Stop {
        /// Build key
        key: Option<String>,
    },
    /// Print the logs of a build
    Logs {
        /// Build key
        key: Option<String>,
    },
    /// Show remote desktop credentials of a configuration build
    Connect {
        /// Build key
        key: Option<String>,
        #[command(flatten)]
        tunnel: TunnelOptions,
        /// Rebuild with remote desktop without asking when needed
        #[arg(long, short)]
        yes: bool,
    },
    /// Expose a local port inside a running configuration build
    Tunnel {
        /// Build key
        key: Option<String>,
        /// Local port to forward to (prompted for when omitted)
        #[arg(long)]
        port: Option<u16>,
        /// Port to listen on inside the VM
        #[arg(long)]
        remote_port: Option<u16>,
        /// Local host to forward to
        #[arg(long)]
        host: Option<String>,
    },
    /// Show the install link of an ad-hoc build
    Ipa {
        /// Build key
        key: Option<String>,
    },
    /// Download the changes made on a configuration build as a patch
    Patch {
        /// Build key
        key: Option<String>,
        /// Output file
        #[arg(long, short, default_value = "odevio.patch")]
        output: PathBuf,
    },
    /// Download the source code of a configuration build
    Download {
        /// Build key
        key: Option<String>,
        /// Output file
        #[arg(long, short, default_value = "source.zip")]
        output: PathBuf,
    },
    /// List the Flutter versions available for builds
    #[command(visible_alias = "fv")]
    FlutterVersions,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for all commands
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_file = ConfigFile::default_location()?;
    let config = config_file.load()?;
    let api = ApiClient::new(config.get_api_url(), config_file, Arc::new(TerminalPrompter))?;

    let needs_login = !matches!(cli.command, Commands::Signin { .. } | Commands::Signout);
    if needs_login && config.auth.jwt_token.is_none() {
        cli::print_not_logged_in();
    }

    match cli.command {
        Commands::Signin { email, password } => cli::user::signin(&api, email, password).await?,
        Commands::Signout => cli::user::signout(&api)?,
        Commands::Profile { ini } => cli::user::profile(&api, ini).await?,
        Commands::Build(build_cmd) => match build_cmd {
            BuildCommands::Start(args) => {
                let mut view = TerminalView::new();
                build::start(&api, args, &mut view).await?
            }
            BuildCommands::Ls { all } => build::list_builds(&api, all).await?,
            BuildCommands::Detail { key } => build::show_build(&api, key).await?,
            BuildCommands::Rm { key } => build::delete_build(&api, key).await?,
            BuildCommands::Stop { key } => build::stop_build(&api, key).await?,
            BuildCommands::Logs { key } => build::print_logs(&api, key).await?,
            BuildCommands::Connect { key, tunnel, yes } => {
                let mut view = TerminalView::new();
                build::connect(&api, key, &tunnel, yes, &mut view).await?
            }
            BuildCommands::Tunnel {
                key,
                port,
                remote_port,
                host,
            } => {
                let options = TunnelOptions {
                    tunnel_port: port,
                    tunnel_host: host,
                    tunnel_remote_port: remote_port,
                };
                build::tunnel(&api, key, options).await?
            }
            BuildCommands::Ipa { key } => build::ipa(&api, key).await?,
            BuildCommands::Patch { key, output } => build::download_patch(&api, key, &output).await?,
            BuildCommands::Download { key, output } => {
                build::download_sources(&api, key, &output).await?
            }
            BuildCommands::FlutterVersions => build::list_flutter_versions(&api).await?,
        },
    }

    Ok(())
}
