//! Request and response types of the Odevio API

use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Lifecycle status of a build as reported by the server
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Created,
    WaitingInstance,
    InProgress,
    /// Configuration build ready for remote access
    Config,
    Succeeded,
    Failed,
    Stopped,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Config | BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Stopped
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Created => write!(f, "created"),
            BuildStatus::WaitingInstance => write!(f, "waiting_instance"),
            BuildStatus::InProgress => write!(f, "in_progress"),
            BuildStatus::Config => write!(f, "config"),
            BuildStatus::Succeeded => write!(f, "succeeded"),
            BuildStatus::Failed => write!(f, "failed"),
            BuildStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Finer-grained phase of an `in_progress` build.
///
/// The server may introduce new phases; those are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum SubStatus {
    StartingInstance,
    PreparingBuild,
    Building,
    GettingResult,
    Publishing,
    Other(String),
}

impl From<String> for SubStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "starting_instance" => SubStatus::StartingInstance,
            "preparing_build" => SubStatus::PreparingBuild,
            "building" => SubStatus::Building,
            "getting_result" => SubStatus::GettingResult,
            "publishing" => SubStatus::Publishing,
            _ => SubStatus::Other(value),
        }
    }
}

impl SubStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SubStatus::StartingInstance => "Starting instance...",
            SubStatus::PreparingBuild => "Preparing build...",
            SubStatus::Building => "Building...",
            SubStatus::GettingResult => "Getting result...",
            SubStatus::Publishing => "Publishing...",
            SubStatus::Other(_) => "Building...",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BuildType {
    Configuration,
    Development,
    AdHoc,
    Distribution,
    Validation,
    Publication,
}

impl BuildType {
    pub const ALL: [BuildType; 6] = [
        BuildType::Configuration,
        BuildType::Development,
        BuildType::AdHoc,
        BuildType::Distribution,
        BuildType::Validation,
        BuildType::Publication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Configuration => "configuration",
            BuildType::Development => "development",
            BuildType::AdHoc => "ad-hoc",
            BuildType::Distribution => "distribution",
            BuildType::Validation => "validation",
            BuildType::Publication => "publication",
        }
    }

    /// Parse either the code or the display name sent by the server
    pub fn parse(value: &str) -> Option<Self> {
        <BuildType as ValueEnum>::from_str(value.trim(), true).ok()
    }
}

impl std::fmt::Display for BuildType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Release,
    Profile,
    Debug,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Release => "release",
            BuildMode::Profile => "profile",
            BuildMode::Debug => "debug",
        }
    }
}

/// Server-side build record
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BuildRecord {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub build_type: String,
    /// Human readable status
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub substatus: Option<String>,
    #[serde(default)]
    pub status_code: BuildStatus,
    #[serde(default)]
    pub substatus_code: Option<SubStatus>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub finish_time: Option<String>,
    #[serde(default)]
    pub remote_desktop_status: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub flutter_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub min_sdk: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub app_version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub build_number: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl BuildRecord {
    pub fn kind(&self) -> Option<BuildType> {
        BuildType::parse(&self.build_type)
    }
}

/// Accept strings, numbers or null for fields the server is loose about
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Parameters of a new build. Built once and never modified after submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub application: Option<String>,
    pub build_type: BuildType,
    pub min_sdk: Option<String>,
    pub flutter_version: Option<String>,
    pub app_version: Option<String>,
    pub build_number: Option<u64>,
    pub mode: Option<BuildMode>,
    pub target: Option<String>,
    pub flavor: Option<String>,
    pub post_build_commands: Vec<String>,
}

impl BuildRequest {
    pub fn new(build_type: BuildType) -> Self {
        Self {
            application: None,
            build_type,
            min_sdk: None,
            flutter_version: None,
            app_version: None,
            build_number: None,
            mode: None,
            target: None,
            flavor: None,
            post_build_commands: Vec::new(),
        }
    }

    /// Multipart text fields. Unset values are omitted and each post-build
    /// command is sent as its own `post_build_commands` field.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![("build_type".to_string(), self.build_type.to_string())];

        let optional = [
            ("application", self.application.clone()),
            ("min_sdk", self.min_sdk.clone()),
            ("flutter_version", self.flutter_version.clone()),
            ("app_version", self.app_version.clone()),
            ("build_number", self.build_number.map(|n| n.to_string())),
            ("mode", self.mode.map(|m| m.as_str().to_string())),
            ("target", self.target.clone()),
            ("flavor", self.flavor.clone()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name.to_string(), value));
            }
        }

        for command in &self.post_build_commands {
            fields.push(("post_build_commands".to_string(), command.clone()));
        }

        fields
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDesktopStatus {
    NoRemoteDesktop,
    RemoteDesktopPreparation,
    /// Any other value means credentials are available
    #[serde(other)]
    Ready,
}

/// Response of `/builds/<key>/connect/`
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectResponse {
    #[serde(default)]
    pub key: Option<String>,
    pub remote_desktop_status: RemoteDesktopStatus,
    #[serde(default, deserialize_with = "lenient_string")]
    pub rustdesk_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub rustdesk_password: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub remote_desktop_port: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub stop_time: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HelpLink {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpaLink {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FlutterVersions {
    #[serde(default)]
    pub stable: Vec<String>,
    #[serde(default)]
    pub beta: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LatestFlutterVersion {
    pub version: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublicationPermission {
    pub free: bool,
    #[serde(default)]
    pub next_build_date: Option<String>,
    #[serde(default)]
    pub days_delay: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Account {
    pub username: String,
    pub email: String,
    #[serde(rename = "type", default)]
    pub account_type: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TeamManager {
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Team {
    pub name: String,
    pub manager: TeamManager,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Application {
    pub key: String,
    pub name: String,
}
