use anyhow::{Context, Result};
use clap::Args;

use super::core::{resolve_key, NO_BUILDS};
use super::progress::{ProgressMode, ProgressView, TerminalOutcome};
use super::start::{announce_and_track, FollowOptions};
use crate::api::builds::{BuildFilter, Connection, ConnectionInfo, VM_USER};
use crate::api::ApiClient;
use crate::cli::handled;
use crate::tunnel::{pick_remote_port, relay, TunnelSession};

const RELAY_SERVER: &str = "odevio.com";

/// Reverse tunnel from the build VM to this machine
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct TunnelOptions {
    /// Local port to expose inside the VM once connected
    #[arg(long)]
    pub tunnel_port: Option<u16>,
    /// Host the tunnel forwards to (defaults to localhost)
    #[arg(long)]
    pub tunnel_host: Option<String>,
    /// Port to listen on inside the VM (defaults to the tunnel port)
    #[arg(long)]
    pub tunnel_remote_port: Option<u16>,
}

/// `build connect`
pub async fn connect(
    api: &ApiClient,
    key: Option<String>,
    tunnel: &TunnelOptions,
    yes: bool,
    view: &mut dyn ProgressView,
) -> Result<()> {
    let Some(key) = resolve_key(api, key, BuildFilter::default(), NO_BUILDS).await? else {
        return Ok(());
    };
    connect_build(api, &key, tunnel, yes, ProgressMode::Events, view).await
}

/// Show the remote desktop credentials of a build, offering to rebuild it
/// with remote access when it has none
pub(super) async fn connect_build(
    api: &ApiClient,
    key: &str,
    tunnel: &TunnelOptions,
    yes: bool,
    mode: ProgressMode,
    view: &mut dyn ProgressView,
) -> Result<()> {
    let mut key = key.to_string();
    loop {
        let Some(connection) = handled(api.resolve_connection(&key).await)? else {
            return Ok(());
        };

        match connection {
            Connection::Ready(info) => {
                print_credentials(&info);
                if let Some(port) = tunnel.tunnel_port {
                    open_tunnel(&info, port, tunnel).await?;
                }
                return Ok(());
            }
            Connection::Preparing => {
                println!(
                    "Your Odevio-Remote is currently prepared for being used as Remote Desktop. Please try again in a few moments."
                );
                return Ok(());
            }
            Connection::NeedsRebuild => {
                println!("This build is either stopped or was not setup for remote desktop.");
                let rebuild = yes
                    || api.prompter().confirm(
                        "Do you want to create a new build with the same parameters setup for Remote Desktop access ?",
                        false,
                    )?;
                if !rebuild {
                    return Ok(());
                }

                let Some(build) = handled(api.rebuild_with_remote_desktop(&key).await)? else {
                    return Ok(());
                };
                let follow = FollowOptions {
                    no_progress: false,
                    mode,
                };
                match announce_and_track(api, &build, &follow, view).await? {
                    Some(result) if result.outcome == TerminalOutcome::Configured => {
                        key = build.key;
                    }
                    _ => return Ok(()),
                }
            }
        }
    }
}

fn print_credentials(info: &ConnectionInfo) {
    println!();
    println!("Connection settings and credentials");
    println!("  RustDesk relay server: {}", RELAY_SERVER);
    println!("  RustDesk ID: {}", info.rustdesk_id_display());
    println!("  RustDesk password: {}", info.rustdesk_password);
    println!();
    println!("  VNC: {}", info.vnc_url());
    println!("  user: {}", VM_USER);
    println!("  password: {}", info.password);
    println!();

    match info.stop_time {
        Some(stop) => println!(
            "Your machine will automatically stop at {}, but remember to stop it as soon as you are finished to free up resources by typing",
            stop.format("%H:%M")
        ),
        None => println!(
            "Remember to stop your machine as soon as you are finished to free up resources by typing"
        ),
    }
    println!("  $ odevio build stop {}", info.key);
    println!();
    println!(
        "Most Remote Desktop applications link the Mac Command key to the Windows key on your keyboard."
    );
}

async fn open_tunnel(info: &ConnectionInfo, forward_port: u16, options: &TunnelOptions) -> Result<()> {
    let remote_port = pick_remote_port(
        forward_port,
        options.tunnel_remote_port,
        &mut rand::thread_rng(),
    );
    let session = TunnelSession {
        vm_host: info.host.clone(),
        vm_ssh_port: info.ssh_port,
        vm_user: VM_USER.to_string(),
        vm_password: info.password.clone(),
        remote_port,
        forward_host: options
            .tunnel_host
            .clone()
            .unwrap_or_else(|| "localhost".to_string()),
        forward_port,
    };
    relay(&session).await
}

/// `build tunnel`: expose a local port inside a running configuration build
pub async fn tunnel(api: &ApiClient, key: Option<String>, options: TunnelOptions) -> Result<()> {
    let port = match options.tunnel_port {
        Some(port) => port,
        None => api
            .prompter()
            .input("Port")?
            .trim()
            .parse::<u16>()
            .context("The port must be a number between 0 and 65535")?,
    };

    let Some(key) = resolve_key(api, key, BuildFilter::default(), NO_BUILDS).await? else {
        return Ok(());
    };
    let Some(connection) = handled(api.resolve_connection(&key).await)? else {
        return Ok(());
    };

    match connection {
        Connection::Ready(info) => open_tunnel(&info, port, &options).await,
        Connection::Preparing => {
            println!(
                "Your Odevio-Remote is currently prepared for being used as Remote Desktop. Please try again in a few moments."
            );
            Ok(())
        }
        Connection::NeedsRebuild => {
            println!("This build was not setup for remote desktop.");
            Ok(())
        }
    }
}
