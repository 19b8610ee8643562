use anyhow::{bail, Context, Result};
use clap::Args;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connect::{connect_build, TunnelOptions};
use super::core::show_ipa;
use super::progress::{
    print_help_link, track, ProgressMode, ProgressView, TerminalOutcome, TrackResult,
    DEFAULT_POLL_INTERVAL,
};
use super::select::{select_application, AppChoice};
use crate::api::models::{BuildMode, BuildRecord, BuildRequest, BuildType};
use crate::api::time::to_local;
use crate::api::ApiClient;
use crate::archive::{zip_directory, Exclusions, IGNORE_FILE};
use crate::cli::{handled, handled_with, APP_NOT_FOUND};

/// File in the working directory providing default start options
pub const DEFAULTS_FILE: &str = ".odevio";

const PLANS_URL: &str = "https://odevio.com/plans";

#[derive(Args, Debug, Clone, Default)]
pub struct StartArgs {
    /// Application key (prompted for when omitted)
    pub app_key: Option<String>,
    /// Home directory of the Flutter project (defaults to the current directory)
    pub directory: Option<PathBuf>,
    /// Build type
    #[arg(long, value_enum)]
    pub build_type: Option<BuildType>,
    /// Flutter version for the build (example "3.10.5"); see `odevio build flutter-versions`
    #[arg(long)]
    pub flutter: Option<String>,
    /// Minimal iOS version of the application (example "12.0")
    #[arg(long)]
    pub minimal_ios_version: Option<String>,
    /// App version for this build; defaults to the version in pubspec.yaml
    #[arg(long)]
    pub app_version: Option<String>,
    /// Build number for this build; defaults to the number after '+' in pubspec.yaml
    #[arg(long)]
    pub build_number: Option<u64>,
    /// Mode to build the app in (defaults to release)
    #[arg(long, value_enum)]
    pub mode: Option<BuildMode>,
    /// Main entry-point file of the application (defaults to lib/main.dart)
    #[arg(long)]
    pub target: Option<String>,
    /// Custom app flavor
    #[arg(long)]
    pub flavor: Option<String>,
    /// Command to run after the build has finished; may be repeated
    #[arg(long = "post-build-command")]
    pub post_build_commands: Vec<String>,
    #[command(flatten)]
    pub tunnel: TunnelOptions,
    /// Exit right after the build has been registered
    #[arg(long)]
    pub no_progress: bool,
    /// Do not compare the local Flutter version with the build version
    #[arg(long)]
    pub no_flutter_warning: bool,
    /// Follow progress by polling instead of the live event stream
    #[arg(long)]
    pub poll: bool,
}

/// Fill options the command line left unset from a `.odevio` file.
///
/// Returns the warnings for malformed lines and unknown keys.
pub fn apply_defaults_file(args: &mut StartArgs, contents: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    let cli_commands_given = !args.post_build_commands.is_empty();

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warnings.push(format!(
                "Error in {} file line {}: should be KEY=VALUE",
                DEFAULTS_FILE,
                index + 1
            ));
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();

        // Name of the value kind when it failed to parse
        let invalid: Option<&str> = match key {
            "app-key" => set(&mut args.app_key, Some(value.clone())),
            "build-type" => set_parsed(&mut args.build_type, BuildType::parse(&value), "build type"),
            "flutter" => set(&mut args.flutter, Some(value.clone())),
            "minimal-ios-version" => set(&mut args.minimal_ios_version, Some(value.clone())),
            "app-version" => set(&mut args.app_version, Some(value.clone())),
            "build-number" => {
                set_parsed(&mut args.build_number, value.parse().ok(), "build number")
            }
            "mode" => set_parsed(
                &mut args.mode,
                <BuildMode as clap::ValueEnum>::from_str(&value, true).ok(),
                "mode",
            ),
            "target" => set(&mut args.target, Some(value.clone())),
            "flavor" => set(&mut args.flavor, Some(value.clone())),
            "post-build-command" => {
                if !cli_commands_given {
                    args.post_build_commands.push(value.clone());
                }
                None
            }
            "tunnel-port" => set_parsed(&mut args.tunnel.tunnel_port, value.parse().ok(), "port"),
            "tunnel-host" => set(&mut args.tunnel.tunnel_host, Some(value.clone())),
            "tunnel-remote-port" => {
                set_parsed(&mut args.tunnel.tunnel_remote_port, value.parse().ok(), "port")
            }
            "no-progress" => {
                args.no_progress |= is_truthy(&value);
                None
            }
            "no-flutter-warning" => {
                args.no_flutter_warning |= is_truthy(&value);
                None
            }
            unknown => {
                warnings.push(format!(
                    "Warning: unknown option '{}' in {}",
                    unknown, DEFAULTS_FILE
                ));
                None
            }
        };

        if let Some(what) = invalid {
            warnings.push(format!(
                "Error in {} file line {}: invalid {} '{}'",
                DEFAULTS_FILE,
                index + 1,
                what,
                value
            ));
        }
    }

    warnings
}

fn fill<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) -> Option<&'static str> {
    if let Some(value) = value {
        fill(slot, value);
    }
    None
}

fn set_parsed<T>(slot: &mut Option<T>, parsed: Option<T>, what: &'static str) -> Option<&'static str> {
    match parsed {
        Some(value) => set(slot, Some(value)),
        None => Some(what),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "True")
}

/// Read `version: <version>+<build>` from pubspec.yaml
pub fn read_pubspec_version(pubspec: &Path) -> Result<(String, u64)> {
    let contents = fs::read_to_string(pubspec)
        .with_context(|| format!("Failed to read {}", pubspec.display()))?;

    let Some(line) = contents.lines().find(|l| l.starts_with("version: ")) else {
        bail!("No line starting with 'version: ' found in pubspec.yaml");
    };
    let Some((version, build)) = line["version: ".len()..].trim().split_once('+') else {
        bail!("The version line in pubspec.yaml should be formatted as version: <version>+<build>");
    };
    let build = build.trim().parse::<u64>().map_err(|_| {
        anyhow::anyhow!(
            "The build number (after '+' in the version line in pubspec.yaml) has to be a number"
        )
    })?;
    Ok((version.trim().to_string(), build))
}

/// Whether two Flutter versions differ in major or minor component
pub fn flutter_versions_differ(local: &str, build: &str) -> bool {
    fn major_minor(version: &str) -> Vec<&str> {
        version
            .split('-')
            .next()
            .unwrap_or(version)
            .split('.')
            .take(2)
            .collect()
    }
    major_minor(local) != major_minor(build)
}

/// Version reported by the local `flutter --version`, if Flutter is installed
fn local_flutter_version() -> Option<String> {
    let output = Command::new("flutter").arg("--version").output().ok()?;
    if !output.status.success() {
        debug!("flutter --version exited with {}", output.status);
        return None;
    }
    parse_flutter_version(&String::from_utf8_lossy(&output.stdout))
}

fn parse_flutter_version(output: &str) -> Option<String> {
    let re = Regex::new(r"^Flutter (\S+) ").ok()?;
    re.captures(output).map(|caps| caps[1].to_string())
}

/// Progress options shared by every command that starts a build
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowOptions {
    pub no_progress: bool,
    pub mode: ProgressMode,
}

/// Print the registration notice of a new build and follow it to the end
pub(super) async fn announce_and_track(
    api: &ApiClient,
    build: &BuildRecord,
    follow: &FollowOptions,
    view: &mut dyn ProgressView,
) -> Result<Option<TrackResult>> {
    println!(
        "{} has been registered. It has key \"{}\" and will be started as soon as possible.",
        build.name, build.key
    );
    if build.kind() == Some(BuildType::Configuration) {
        println!(
            "To access your Odevio-Remote, you can use the following command when it has been started."
        );
        println!("  $ odevio build connect {}", build.key);
    }
    println!("Killing the command will not stop the build.");

    if follow.no_progress {
        return Ok(None);
    }

    let result = track(api, &build.key, follow.mode, view).await?;

    if result.outcome.is_success() {
        println!();
        println!(
            "Your build has succeeded, congrats ! Leave us a star on GitHub, we'd greatly appreciate it:"
        );
        println!("https://github.com/Odevio/Odevio-CLI");
        println!();
        match build.kind() {
            Some(BuildType::Publication) => {
                println!("It will appear on your App Store Connect account shortly")
            }
            Some(BuildType::AdHoc) => show_ipa(api, &build.key).await?,
            _ => {}
        }
    } else {
        if let Some(message) = &result.error_message {
            println!("Error: {}", message);
        }
        print_help_link(api, &build.key).await;
    }

    Ok(Some(result))
}

/// `build start` from the current directory
pub async fn start(api: &ApiClient, args: StartArgs, view: &mut dyn ProgressView) -> Result<()> {
    let workdir = std::env::current_dir().context("Failed to determine current directory")?;
    start_in(api, args, &workdir, DEFAULT_POLL_INTERVAL, view).await
}

pub(super) async fn start_in(
    api: &ApiClient,
    mut args: StartArgs,
    workdir: &Path,
    poll_interval: Duration,
    view: &mut dyn ProgressView,
) -> Result<()> {
    let directory = args.directory.clone().unwrap_or_else(|| workdir.to_path_buf());
    let directory = directory
        .canonicalize()
        .with_context(|| format!("Directory {} does not exist", directory.display()))?;
    if !directory.is_dir() {
        bail!("{} is not a directory", directory.display());
    }

    if !directory.join("lib").exists() || !directory.join("pubspec.yaml").exists() {
        let proceed = api.prompter().confirm(
            "This directory does not look like it contains a flutter project. Are you sure you want to upload it?",
            false,
        )?;
        if !proceed {
            return Ok(());
        }
    }

    let defaults_path = workdir.join(DEFAULTS_FILE);
    if defaults_path.is_file() {
        let contents = fs::read_to_string(&defaults_path)
            .with_context(|| format!("Failed to read {}", defaults_path.display()))?;
        for warning in apply_defaults_file(&mut args, &contents) {
            println!("{}", warning);
        }
    }

    let build_type = match args.build_type {
        Some(build_type) => build_type,
        None => {
            let names: Vec<String> = BuildType::ALL.iter().map(|t| t.to_string()).collect();
            match api.prompter().select("Build type", &names)? {
                Some(index) => BuildType::ALL[index],
                None => return Ok(()),
            }
        }
    };

    let app_key = match args.app_key.clone() {
        Some(key) => Some(key),
        None => {
            match select_application(api, build_type == BuildType::Configuration).await? {
                Some(AppChoice::App(key)) => Some(key),
                Some(AppChoice::NoApplication) => None,
                None => return Ok(()),
            }
        }
    };

    if matches!(build_type, BuildType::Validation | BuildType::Publication) {
        let Some(app) = app_key.as_deref() else {
            bail!("An application is required for {} builds", build_type);
        };
        if !check_publication_permission(api, app).await? {
            return Ok(());
        }
    }

    let pubspec = directory.join("pubspec.yaml");
    if build_type != BuildType::Configuration
        && (args.app_version.is_none() || args.build_number.is_none())
        && pubspec.exists()
    {
        match read_pubspec_version(&pubspec) {
            Ok((version, build)) => {
                fill(&mut args.app_version, version);
                fill(&mut args.build_number, build);
            }
            Err(e) => eprintln!(
                "Error getting version and build number from pubspec.yaml: {}",
                e
            ),
        }
    }

    if build_type == BuildType::Publication {
        if let (Some(app), Some(build_number)) = (app_key.as_deref(), args.build_number) {
            let max = handled_with(api.max_build_number(app).await, APP_NOT_FOUND)?;
            if let Some(Some(max)) = max {
                if build_number <= max {
                    let proceed = api.prompter().confirm(
                        &format!(
                            "You have specified {} as build number but you have already made a publication build with number {}. To change it, either supply the --build-number parameter or modify it in pubspec.yaml. Do you want to continue anyway?",
                            build_number, max
                        ),
                        false,
                    )?;
                    if !proceed {
                        return Ok(());
                    }
                }
            }
        }
    }

    if !args.no_flutter_warning && args.flutter.is_none() {
        match check_local_flutter(api).await? {
            FlutterCheck::Continue => {}
            FlutterCheck::UseLocal(version) => args.flutter = Some(version),
            FlutterCheck::Cancel => return Ok(()),
        }
    }

    let request = BuildRequest {
        application: app_key,
        build_type,
        min_sdk: args.minimal_ios_version.clone(),
        flutter_version: args.flutter.clone(),
        app_version: args.app_version.clone(),
        build_number: args.build_number,
        mode: args.mode,
        target: args.target.clone(),
        flavor: args.flavor.clone(),
        post_build_commands: args.post_build_commands.clone(),
    };

    println!("Zipping {}", directory.display());
    let exclusions = Exclusions::with_ignore_file(&workdir.join(IGNORE_FILE))?;
    let archive_dir = directory.clone();
    let archive = tokio::task::spawn_blocking(move || zip_directory(&archive_dir, &exclusions))
        .await
        .context("Archive task failed")??;

    let Some(build) = handled(api.submit_build(&request, archive).await)? else {
        return Ok(());
    };
    info!("Started {} build {}", build_type, build.key);

    let follow = FollowOptions {
        no_progress: args.no_progress,
        mode: if args.poll {
            ProgressMode::Poll(poll_interval)
        } else {
            ProgressMode::Events
        },
    };
    let Some(result) = announce_and_track(api, &build, &follow, view).await? else {
        return Ok(());
    };

    if result.outcome == TerminalOutcome::Configured {
        connect_build(api, &build.key, &args.tunnel, false, follow.mode, view).await?;
    }
    Ok(())
}

/// Free accounts may only publish once per period. Returns false when the
/// build must not be started.
async fn check_publication_permission(api: &ApiClient, app_key: &str) -> Result<bool> {
    let permission = handled_with(api.publication_permission(app_key).await, APP_NOT_FOUND)?;
    let Some(permission) = permission else {
        return Ok(false);
    };
    if !permission.free {
        return Ok(true);
    }

    let days = permission
        .days_delay
        .map(|d| d.to_string())
        .unwrap_or_else(|| "few".to_string());

    if let Some(next) = permission.next_build_date.as_deref() {
        let next = to_local(next)
            .map(|t| t.format("%Y-%m-%d at %H:%M").to_string())
            .unwrap_or_else(|_| next.to_string());
        println!(
            "Error: as a free Odevio user, you can only make one publication every {} days. You will be able to make a new build on {}",
            days, next
        );
        println!(
            "To upgrade your account and make as many publication as you want, please go to {}",
            PLANS_URL
        );
        return Ok(false);
    }

    println!(
        "Warning: as a free Odevio user, you can only make one publication every {0} days. If this build succeeds, you won't be able to make another publication for {0} days unless you upgrade.",
        days
    );
    println!(
        "To upgrade your account and make as many publication as you want, please go to {}",
        PLANS_URL
    );
    api.prompter()
        .confirm("Do you confirm you want to proceed with the build?", true)
}

enum FlutterCheck {
    Continue,
    UseLocal(String),
    Cancel,
}

/// Warn when the local Flutter differs from the version the build will use
async fn check_local_flutter(api: &ApiClient) -> Result<FlutterCheck> {
    let Ok(Some(local)) = tokio::task::spawn_blocking(local_flutter_version).await else {
        return Ok(FlutterCheck::Continue);
    };
    let latest = match api.latest_flutter_version().await {
        Ok(latest) => latest.version,
        Err(e) => {
            warn!("Could not fetch the latest Flutter version: {}", e);
            return Ok(FlutterCheck::Continue);
        }
    };
    if !flutter_versions_differ(&local, &latest) {
        return Ok(FlutterCheck::Continue);
    }

    println!(
        "Warning: your local flutter version is {0} but the build will be run with the latest flutter version ({1}). This could lead to unexpected errors if you have not tested your code with version {1}. To avoid this, specify the flutter version you want to use with the --flutter parameter or in a .odevio file.",
        local, latest
    );
    let choices = vec![
        "Continue anyway".to_string(),
        format!("Set the build version to {}", local),
        "Cancel and specify the version yourself".to_string(),
    ];
    Ok(
        match api.prompter().select("What do you want to do?", &choices)? {
            Some(0) => FlutterCheck::Continue,
            Some(1) => FlutterCheck::UseLocal(local),
            _ => FlutterCheck::Cancel,
        },
    )
}
