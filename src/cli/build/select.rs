use anyhow::Result;

use crate::api::builds::BuildFilter;
use crate::api::models::{Application, BuildRecord};
use crate::api::time::to_local;
use crate::api::{ApiClient, ApiResultExt};

/// User friendly one-line description of a build
pub fn build_name(build: &BuildRecord) -> String {
    let started = build
        .start_time
        .as_deref()
        .filter(|t| !t.is_empty())
        .and_then(|t| to_local(t).ok())
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Not started".to_string());

    format!(
        "{} - {} - {} - {} ({}) - {}",
        build.application.as_deref().unwrap_or("No application"),
        build.name,
        build.build_type,
        started,
        build.key,
        build.status
    )
}

/// Let the user pick a build.
///
/// A single candidate is selected without asking. Returns `None` when there
/// is nothing to choose from or the user backed out.
pub async fn select_build(
    api: &ApiClient,
    filter: &BuildFilter,
    empty_message: &str,
) -> Result<Option<String>> {
    let Some(builds) = api.list_builds(filter).await.recover()? else {
        return Ok(None);
    };

    match builds.len() {
        0 => {
            println!("{}", empty_message);
            Ok(None)
        }
        1 => Ok(Some(builds[0].key.clone())),
        _ => {
            let names: Vec<String> = builds.iter().map(build_name).collect();
            Ok(api
                .prompter()
                .select("Builds", &names)?
                .map(|i| builds[i].key.clone()))
        }
    }
}

/// Application chosen for a new build
#[derive(Debug, Clone, PartialEq)]
pub enum AppChoice {
    App(String),
    /// Configuration builds may run without an application
    NoApplication,
}

pub async fn select_application(api: &ApiClient, allow_none: bool) -> Result<Option<AppChoice>> {
    let Some(apps) = api.applications().await.recover()? else {
        return Ok(None);
    };

    let mut choices: Vec<AppChoice> = apps
        .iter()
        .map(|app| AppChoice::App(app.key.clone()))
        .collect();
    let mut names: Vec<String> = apps.iter().map(application_name).collect();
    if allow_none {
        choices.push(AppChoice::NoApplication);
        names.push("No application (xcode will not be configured)".to_string());
    }

    match choices.len() {
        0 => {
            println!(
                "You have no app identifiers in your account. Check out `odevio app mk` to create an app identifier."
            );
            Ok(None)
        }
        1 => Ok(choices.pop()),
        _ => Ok(api
            .prompter()
            .select("Application", &names)?
            .map(|i| choices[i].clone())),
    }
}

fn application_name(app: &Application) -> String {
    format!("{} ({})", app.name, app.key)
}
