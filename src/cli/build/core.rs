use anyhow::{Context, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use qrcode::render::unicode;
use qrcode::QrCode;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

use super::select::select_build;
use crate::api::builds::BuildFilter;
use crate::api::models::{BuildRecord, BuildStatus, BuildType};
use crate::api::time::to_local;
use crate::api::ApiClient;
use crate::cli::handled;

pub(super) const NO_BUILDS: &str = "You have not run any builds yet.";

/// Use the given key or let the user pick one of the builds matching `filter`
pub(super) async fn resolve_key(
    api: &ApiClient,
    key: Option<String>,
    filter: BuildFilter,
    empty_message: &str,
) -> Result<Option<String>> {
    match key {
        Some(key) => Ok(Some(key)),
        None => select_build(api, &filter, empty_message).await,
    }
}

fn all_builds() -> BuildFilter {
    BuildFilter {
        all: true,
        ..Default::default()
    }
}

fn format_time(value: Option<&str>) -> String {
    match value {
        Some(raw) if !raw.is_empty() => to_local(raw)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|_| raw.to_string()),
        _ => "-".to_string(),
    }
}

fn status_color(status: BuildStatus) -> Color {
    match status {
        BuildStatus::Succeeded | BuildStatus::Config => Color::Green,
        BuildStatus::Failed => Color::Red,
        BuildStatus::Stopped => Color::DarkGrey,
        BuildStatus::Created | BuildStatus::WaitingInstance | BuildStatus::InProgress => {
            Color::Yellow
        }
    }
}

fn builds_table(builds: &[BuildRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("KEY").add_attribute(Attribute::Bold),
            Cell::new("APP").add_attribute(Attribute::Bold),
            Cell::new("NAME").add_attribute(Attribute::Bold),
            Cell::new("STARTED AT").add_attribute(Attribute::Bold),
            Cell::new("FINISHED AT").add_attribute(Attribute::Bold),
            Cell::new("STATUS").add_attribute(Attribute::Bold),
            Cell::new("BUILD TYPE").add_attribute(Attribute::Bold),
            Cell::new("STARTED BY").add_attribute(Attribute::Bold),
            Cell::new("CERTIFICATE").add_attribute(Attribute::Bold),
            Cell::new("PROFILE").add_attribute(Attribute::Bold),
        ]);

    for build in builds {
        table.add_row(vec![
            Cell::new(&build.key),
            Cell::new(build.application.as_deref().unwrap_or("-")),
            Cell::new(&build.name),
            Cell::new(format_time(build.start_time.as_deref())),
            Cell::new(format_time(build.finish_time.as_deref())),
            Cell::new(&build.status).fg(status_color(build.status_code)),
            Cell::new(&build.build_type),
            Cell::new(build.creator.as_deref().unwrap_or("-")),
            Cell::new(build.certificate.as_deref().unwrap_or("-")),
            Cell::new(build.profile.as_deref().unwrap_or("-")),
        ]);
    }

    table
}

/// List builds
pub async fn list_builds(api: &ApiClient, all: bool) -> Result<()> {
    let filter = BuildFilter {
        all,
        ..Default::default()
    };
    let Some(builds) = handled(api.list_builds(&filter).await)? else {
        return Ok(());
    };

    if builds.is_empty() {
        if all {
            println!("You did not launch any builds. Create one with");
            println!("  $ odevio build start SOURCE_DIRECTORY --app-key APPLICATION_KEY");
        } else {
            println!("You do not have any active builds. See all your builds with");
            println!("  $ odevio build ls --all");
        }
        return Ok(());
    }

    println!("{}", builds_table(&builds));
    Ok(())
}

/// Show build details
pub async fn show_build(api: &ApiClient, key: Option<String>) -> Result<()> {
    let Some(key) = resolve_key(api, key, all_builds(), NO_BUILDS).await? else {
        return Ok(());
    };
    let Some(build) = handled(api.get_build(&key).await)? else {
        return Ok(());
    };

    let status = match build.substatus.as_deref().filter(|s| !s.is_empty()) {
        Some(sub) => format!("{} - {}", build.status, sub),
        None => build.status.clone(),
    };
    let or_dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!("General information");
    println!("  Odevio Key:            {}", build.key);
    println!("  Name:                  {}", build.name);
    println!("  Application:           {}", or_dash(&build.application));
    println!("  Status:                {}", status);
    println!("  Remote Desktop status: {}", or_dash(&build.remote_desktop_status));
    println!("  Creator:               {}", or_dash(&build.creator));
    println!("  Started at:            {}", format_time(build.start_time.as_deref()));
    println!("  Finished at:           {}", format_time(build.finish_time.as_deref()));
    println!();
    println!("Build config");
    println!("  Flutter version:       {}", or_dash(&build.flutter_version));
    println!("  Build type:            {}", build.build_type);
    println!("  Provisioning profile:  {}", or_dash(&build.profile));
    println!("  Certificate:           {}", or_dash(&build.certificate));
    println!("  Minimum iOS SDK:       {}", or_dash(&build.min_sdk));
    println!("  App version:           {}", or_dash(&build.app_version));
    println!("  Build number:          {}", or_dash(&build.build_number));
    println!("  Mode:                  {}", or_dash(&build.mode));
    println!("  Target:                {}", or_dash(&build.target));
    println!("  Flavor:                {}", or_dash(&build.flavor));

    if let Some(error) = build.error_message.as_deref().filter(|e| !e.is_empty()) {
        println!();
        println!("Error details");
        println!("  Error message: {}", error);
    }

    println!();
    println!("To see logs of this build, run");
    println!("  $ odevio build logs {}", key);
    Ok(())
}

/// Delete a build and its VM
pub async fn delete_build(api: &ApiClient, key: Option<String>) -> Result<()> {
    let Some(key) = resolve_key(api, key, all_builds(), NO_BUILDS).await? else {
        return Ok(());
    };
    if handled(api.delete_build(&key).await)?.is_some() {
        info!("Deleted build {}", key);
        println!("Build with KEY {} has been deleted", key);
    }
    Ok(())
}

/// Stop a running build
pub async fn stop_build(api: &ApiClient, key: Option<String>) -> Result<()> {
    let Some(key) = resolve_key(
        api,
        key,
        BuildFilter::default(),
        "You do not have any running builds.",
    )
    .await?
    else {
        return Ok(());
    };
    let Some(build) = handled(api.stop_build(&key).await)? else {
        return Ok(());
    };

    println!("{} has been stopped.", build.name);
    if build.kind() == Some(BuildType::Configuration) {
        println!(
            "Do not forget to run `odevio build patch {0}` or `odevio build download {0}` to get your changes from the build machine!",
            key
        );
    }
    Ok(())
}

/// Print the logs of a build
pub async fn print_logs(api: &ApiClient, key: Option<String>) -> Result<()> {
    let Some(key) = resolve_key(api, key, all_builds(), NO_BUILDS).await? else {
        return Ok(());
    };
    let Some(logs) = handled(api.build_logs(&key).await)? else {
        return Ok(());
    };

    match logs {
        Value::String(text) => println!("{}", text),
        Value::Null => println!("No logs available for this build yet."),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

/// Print the IPA link of a build with a QR code for iOS devices
pub async fn show_ipa(api: &ApiClient, key: &str) -> Result<()> {
    let Some(ipa) = handled(api.ipa_link(key).await)? else {
        return Ok(());
    };

    println!("{}", ipa.url);
    println!(
        "Open this url to download the IPA, or use an iOS device to open the url or scan this QR code to install it."
    );
    match QrCode::new(ipa.url.as_bytes()) {
        Ok(code) => println!("{}", code.render::<unicode::Dense1x2>().quiet_zone(true).build()),
        Err(e) => debug!("Failed to render QR code: {}", e),
    }
    Ok(())
}

/// `build ipa`: pick among succeeded ad-hoc builds when no key is given
pub async fn ipa(api: &ApiClient, key: Option<String>) -> Result<()> {
    let filter = BuildFilter {
        all: true,
        build_type: Some(BuildType::AdHoc.to_string()),
        status: Some(BuildStatus::Succeeded.to_string()),
    };
    let Some(key) = resolve_key(api, key, filter, NO_BUILDS).await? else {
        return Ok(());
    };
    show_ipa(api, &key).await
}

async fn write_output(output: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(output, contents)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))
}

/// Download the patch of the changes made on the build machine
pub async fn download_patch(api: &ApiClient, key: Option<String>, output: &Path) -> Result<()> {
    let Some(key) = resolve_key(api, key, all_builds(), NO_BUILDS).await? else {
        return Ok(());
    };

    println!("Downloading patch file as {}.", output.display());
    let Some(patch) = handled(api.build_patch(&key).await)? else {
        return Ok(());
    };
    write_output(output, &patch).await?;

    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "odevio.patch".to_string());
    println!("To apply a patch, run");
    println!("  $ git apply {}", file_name);
    println!(
        "If the directory you are in is not the top-level git directory (the one where .git is located) you need to add --directory=<this_directory> to the command"
    );
    println!(
        "For example if this directory is named flutter_app and is contained in the top-level git directory you need to run"
    );
    println!("  $ git apply --directory=flutter_app {}", file_name);
    Ok(())
}

/// Download the full source directory of a finished build
pub async fn download_sources(api: &ApiClient, key: Option<String>, output: &Path) -> Result<()> {
    let Some(key) = resolve_key(api, key, all_builds(), NO_BUILDS).await? else {
        return Ok(());
    };

    println!("Downloading modified sources...");
    let Some(sources) = handled(api.build_result(&key).await)? else {
        return Ok(());
    };
    write_output(output, &sources).await?;
    println!(
        "The modified sources have been downloaded and are in {}",
        output.display()
    );
    Ok(())
}

/// List the Flutter versions available on the build machines
pub async fn list_flutter_versions(api: &ApiClient) -> Result<()> {
    let Some(versions) = handled(api.flutter_versions().await)? else {
        return Ok(());
    };

    println!("Stable channel");
    print_columns(&versions.stable);
    println!();
    println!("Beta channel");
    print_columns(&versions.beta);
    println!();
    println!(
        "Note: the builds run on M1 or M2 macs so only versions starting at flutter 3 are available"
    );
    Ok(())
}

fn print_columns(values: &[String]) {
    const PER_ROW: usize = 6;
    let width = values.iter().map(String::len).max().unwrap_or(0) + 3;
    for row in values.chunks(PER_ROW) {
        let line: String = row
            .iter()
            .map(|v| format!("{:<width$}", v, width = width))
            .collect();
        println!("{}", line.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::client;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_builds_table_renders_rows() {
        let builds = vec![BuildRecord {
            key: "K1".to_string(),
            name: "Build #1".to_string(),
            application: Some("Demo".to_string()),
            build_type: "Ad-hoc".to_string(),
            status: "Succeeded".to_string(),
            status_code: BuildStatus::Succeeded,
            start_time: Some("2023-05-02T10:11:12.123+00:00".to_string()),
            ..Default::default()
        }];

        let rendered = builds_table(&builds).to_string();
        assert!(rendered.contains("K1"));
        assert!(rendered.contains("Build #1"));
        assert!(rendered.contains("Ad-hoc"));
        assert!(rendered.contains("2023-05-0"));
    }

    #[test]
    fn test_format_time_falls_back_to_raw_value() {
        assert_eq!(format_time(None), "-");
        assert_eq!(format_time(Some("")), "-");
        assert_eq!(format_time(Some("soon")), "soon");
    }

    #[tokio::test]
    async fn test_stop_and_delete_hit_build_routes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/builds/K1/stop/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": "K1", "name": "Build #1", "build_type": "Configuration"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/builds/K1/"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        stop_build(&api, Some("K1".to_string())).await.unwrap();
        delete_build(&api, Some("K1".to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_build_is_reported_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/builds/GONE/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        show_build(&api, Some("GONE".to_string())).await.unwrap();
        delete_build(&api, Some("GONE".to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_patch_is_written_to_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/builds/K1/patch/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"diff --git a/x b/x\n".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let out_dir = tempfile::tempdir().unwrap();
        let output = out_dir.path().join("odevio.patch");
        let (api, _dir) = client(&server.uri());
        download_patch(&api, Some("K1".to_string()), &output)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"diff --git a/x b/x\n");
    }

    #[tokio::test]
    async fn test_ipa_selection_filters_succeeded_ad_hoc_builds() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/builds/"))
            .and(query_param("all", "1"))
            .and(query_param("type", "ad-hoc"))
            .and(query_param("status", "succeeded"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"key": "IPA1", "name": "Build"}])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/builds/IPA1/ipa/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"url": "https://odevio.com/ipa/IPA1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        ipa(&api, None).await.unwrap();
    }
}
