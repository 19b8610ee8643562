//! Typed endpoints of the build API

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::events::{parse_build_events, BuildEventStream};
use super::models::{
    Account, Application, BuildRecord, BuildRequest, ConnectResponse, FlutterVersions, HelpLink,
    IpaLink, LatestFlutterVersion, PublicationPermission, RemoteDesktopStatus, Team,
};
use super::time::to_local;
use super::{ApiClient, ApiError, ApiRequest, Auth, MultipartUpload};
use crate::archive::{SourceArchive, MAX_ARCHIVE_SIZE};

/// User account on the build VMs
pub const VM_USER: &str = "odevio";

/// Filters for listing builds
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    /// Include builds of the user's teams and finished builds
    pub all: bool,
    pub build_type: Option<String>,
    pub status: Option<String>,
}

/// Remote desktop credentials of a running configuration build
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub key: String,
    pub host: String,
    pub vnc_port: String,
    pub ssh_port: u16,
    pub password: String,
    pub rustdesk_id: String,
    pub rustdesk_password: String,
    pub stop_time: Option<DateTime<Local>>,
}

impl ConnectionInfo {
    /// RustDesk ids are displayed in groups of three when nine characters long
    pub fn rustdesk_id_display(&self) -> String {
        let chars: Vec<char> = self.rustdesk_id.chars().collect();
        if chars.len() == 9 {
            chars
                .chunks(3)
                .map(|group| group.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            self.rustdesk_id.clone()
        }
    }

    pub fn vnc_url(&self) -> String {
        format!("vnc://{}:{}", self.host, self.vnc_port)
    }
}

/// Outcome of asking for the remote desktop of a build
#[derive(Debug, Clone, PartialEq)]
pub enum Connection {
    Ready(ConnectionInfo),
    /// The VM is being prepared; try again later
    Preparing,
    /// The build has no remote desktop and must be rebuilt with one
    NeedsRebuild,
}

impl ApiClient {
    pub async fn list_builds(&self, filter: &BuildFilter) -> Result<Vec<BuildRecord>, ApiError> {
        let mut request = ApiRequest::get("/builds/");
        if filter.all {
            request = request.query("all", 1);
        }
        if let Some(build_type) = &filter.build_type {
            request = request.query("type", build_type);
        }
        if let Some(status) = &filter.status {
            request = request.query("status", status);
        }
        self.json(&request).await
    }

    pub async fn get_build(&self, key: &str) -> Result<BuildRecord, ApiError> {
        self.json(&ApiRequest::get(format!("/builds/{}/", key))).await
    }

    /// Upload the archive and register a new build.
    ///
    /// The archive is consumed: its temporary file is removed once the
    /// request has resolved, whatever the outcome.
    pub async fn submit_build(
        &self,
        request: &BuildRequest,
        archive: SourceArchive,
    ) -> Result<BuildRecord, ApiError> {
        let size = archive.size()?;
        if size > MAX_ARCHIVE_SIZE {
            return Err(ApiError::ArchiveTooLarge { size });
        }

        println!("Uploading source ({:.2} MB)", size as f64 / 1_000_000.0);
        let upload = MultipartUpload {
            fields: request.form_fields(),
            file_field: "source".to_string(),
            file_name: "source.zip".to_string(),
            mime: "application/zip".to_string(),
            path: archive.path().to_path_buf(),
        };
        let result = self
            .json::<BuildRecord>(&ApiRequest::post("/builds/").multipart(upload))
            .await;
        drop(archive);

        if let Ok(record) = &result {
            info!("Registered build {} ({})", record.key, record.build_type);
        }
        result
    }

    pub async fn delete_build(&self, key: &str) -> Result<(), ApiError> {
        self.send(&ApiRequest::delete(format!("/builds/{}/", key)))
            .await?;
        Ok(())
    }

    pub async fn stop_build(&self, key: &str) -> Result<BuildRecord, ApiError> {
        self.json(&ApiRequest::post(format!("/builds/{}/stop/", key)))
            .await
    }

    /// Request a copy of a build with remote desktop enabled
    pub async fn rebuild_with_remote_desktop(&self, key: &str) -> Result<BuildRecord, ApiError> {
        self.json(
            &ApiRequest::post(format!("/builds/{}/rebuild/", key))
                .json(json!({ "remote_desktop_enabled": true })),
        )
        .await
    }

    pub async fn build_logs(&self, key: &str) -> Result<Value, ApiError> {
        self.json(&ApiRequest::get(format!("/builds/{}/logs/", key)))
            .await
    }

    pub async fn help_link(&self, key: &str) -> Result<HelpLink, ApiError> {
        self.json(&ApiRequest::get(format!("/builds/{}/help/", key)))
            .await
    }

    pub async fn ipa_link(&self, key: &str) -> Result<IpaLink, ApiError> {
        self.json(&ApiRequest::get(format!("/builds/{}/ipa/", key)))
            .await
    }

    pub async fn build_patch(&self, key: &str) -> Result<Bytes, ApiError> {
        self.bytes(&ApiRequest::get(format!("/builds/{}/patch/", key)))
            .await
    }

    pub async fn build_result(&self, key: &str) -> Result<Bytes, ApiError> {
        self.bytes(&ApiRequest::get(format!("/builds/{}/result/", key)))
            .await
    }

    pub async fn connect_info(&self, key: &str) -> Result<ConnectResponse, ApiError> {
        self.json(&ApiRequest::get(format!("/builds/{}/connect/", key)))
            .await
    }

    /// Fetch the remote desktop state of a build once
    pub async fn resolve_connection(&self, key: &str) -> Result<Connection, ApiError> {
        let response = self.connect_info(key).await?;
        debug!(
            "Remote desktop status of {}: {:?}",
            key, response.remote_desktop_status
        );

        match response.remote_desktop_status {
            RemoteDesktopStatus::NoRemoteDesktop => Ok(Connection::NeedsRebuild),
            RemoteDesktopStatus::RemoteDesktopPreparation => Ok(Connection::Preparing),
            RemoteDesktopStatus::Ready => {
                let (Some(host), Some(password)) = (response.host_ip, response.password) else {
                    return Err(anyhow::anyhow!(
                        "The server returned incomplete connection settings for build {}",
                        key
                    )
                    .into());
                };

                let stop_time = match response.stop_time.as_deref().map(to_local) {
                    Some(Ok(time)) => Some(time),
                    Some(Err(e)) => {
                        warn!("Ignoring unreadable stop time: {}", e);
                        None
                    }
                    None => None,
                };

                Ok(Connection::Ready(ConnectionInfo {
                    key: response.key.unwrap_or_else(|| key.to_string()),
                    host,
                    vnc_port: response.remote_desktop_port.unwrap_or_default(),
                    ssh_port: response.ssh_port.unwrap_or(22),
                    password,
                    rustdesk_id: response.rustdesk_id.unwrap_or_default(),
                    rustdesk_password: response.rustdesk_password.unwrap_or_default(),
                    stop_time,
                }))
            }
        }
    }

    /// Open the live event stream of a build
    pub async fn build_events(&self, key: &str) -> Result<BuildEventStream, ApiError> {
        let bytes = self.events(&format!("/builds/{}/logs", key)).await?;
        Ok(parse_build_events(bytes))
    }

    pub async fn flutter_versions(&self) -> Result<FlutterVersions, ApiError> {
        self.json(&ApiRequest::get("/flutter-versions/")).await
    }

    pub async fn latest_flutter_version(&self) -> Result<LatestFlutterVersion, ApiError> {
        self.json(&ApiRequest::get("/flutter-versions/latest"))
            .await
    }

    pub async fn publication_permission(
        &self,
        app_key: &str,
    ) -> Result<PublicationPermission, ApiError> {
        self.json(&ApiRequest::get(format!(
            "/builds/publication-permission/{}",
            app_key
        )))
        .await
    }

    /// Highest build number already published for an application
    pub async fn max_build_number(&self, app_key: &str) -> Result<Option<u64>, ApiError> {
        self.json(&ApiRequest::get(format!(
            "/applications/{}/buildnumber",
            app_key
        )))
        .await
    }

    pub async fn applications(&self) -> Result<Vec<Application>, ApiError> {
        self.json(&ApiRequest::get("/applications/")).await
    }

    pub async fn teams(&self) -> Result<Vec<Team>, ApiError> {
        self.json(&ApiRequest::get("/teams/")).await
    }

    pub async fn account(&self) -> Result<Account, ApiError> {
        self.json(&ApiRequest::get("/my-account/")).await
    }

    /// Fetch the account after exchanging explicit credentials for a token
    pub async fn account_with(&self, email: &str, password: &str) -> Result<Account, ApiError> {
        self.json(&ApiRequest::get("/my-account/").auth(Auth::Credentials {
            email: email.to_string(),
            password: password.to_string(),
        }))
        .await
    }
}
