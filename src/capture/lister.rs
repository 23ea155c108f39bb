//! Enumeration of capture sources through the helper's `list` mode

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::args::list_args;
use super::session::SourceKind;
use crate::error::{AppError, Result};

/// Upper bound on a listing run
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub app_name: String,
    /// Empty strings from older helpers are read as absent
    #[serde(default, deserialize_with = "empty_as_none")]
    pub bundle_id: Option<String>,
}

/// Application; helpers send either a bare name or a full object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ApplicationEntry")]
pub struct ApplicationSource {
    pub id: String,
    pub name: String,
    pub bundle_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApplicationEntry {
    Name(String),
    Full {
        id: String,
        name: String,
        #[serde(default, rename = "bundleId", deserialize_with = "empty_as_none")]
        bundle_id: Option<String>,
    },
}

impl From<ApplicationEntry> for ApplicationSource {
    fn from(entry: ApplicationEntry) -> Self {
        match entry {
            ApplicationEntry::Name(name) => Self {
                id: name.clone(),
                name,
                bundle_id: None,
            },
            ApplicationEntry::Full { id, name, bundle_id } => Self { id, name, bundle_id },
        }
    }
}

/// Camera or microphone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub index: u32,
}

/// Everything the helper can capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceList {
    pub displays: Vec<DisplaySource>,
    pub windows: Vec<WindowSource>,
    pub applications: Vec<ApplicationSource>,
    pub cameras: Vec<DeviceSource>,
    pub microphones: Vec<DeviceSource>,
}

impl SourceList {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_empty(&self) -> bool {
        self.displays.is_empty()
            && self.windows.is_empty()
            && self.applications.is_empty()
            && self.cameras.is_empty()
            && self.microphones.is_empty()
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Run `<helper> list --json [--microphones-only]` and parse the result
pub async fn list_sources(helper_path: &str, microphones_only: bool) -> Result<SourceList> {
    let kind = if microphones_only {
        SourceKind::Microphone
    } else {
        SourceKind::Screen
    };

    debug!("Listing capture sources via {}", helper_path);
    let output = Command::new(helper_path)
        .args(list_args(microphones_only))
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(LIST_TIMEOUT, output)
        .await
        .map_err(|_| AppError::capture_unavailable(kind, "source listing timed out"))?
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                AppError::capture_unavailable(kind, format!("executable not found: {}", helper_path))
            }
            _ => AppError::capture_unavailable(kind, format!("failed to run {}: {}", helper_path, e)),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::capture_unavailable(
            kind,
            format!("source listing failed ({}): {}", output.status, stderr.trim()),
        ));
    }

    let list = SourceList::parse(&String::from_utf8_lossy(&output.stdout))?;
    info!(
        "Found {} displays, {} windows, {} cameras, {} microphones",
        list.displays.len(),
        list.windows.len(),
        list.cameras.len(),
        list.microphones.len()
    );
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_full_listing() {
        let json = r#"{
            "displays": [{"id": "0", "name": "eDP-1", "width": 2560, "height": 1600, "isPrimary": true}],
            "windows": [
                {"id": "0x1", "name": "Terminal", "appName": "kitty", "bundleId": ""},
                {"id": "0x2", "name": "Docs", "appName": "Editor", "bundleId": "org.example.editor"}
            ],
            "applications": [],
            "cameras": [{"id": "/dev/video0", "name": "Integrated Camera", "index": 0}]
        }"#;
        let list = SourceList::parse(json).unwrap();
        assert_eq!(list.displays[0].width, 2560);
        assert!(list.displays[0].is_primary);
        assert_eq!(list.windows[0].bundle_id, None);
        assert_eq!(list.windows[1].bundle_id.as_deref(), Some("org.example.editor"));
        assert_eq!(list.cameras[0].id, "/dev/video0");
        assert!(list.microphones.is_empty());
    }

    #[test]
    fn test_parse_null_bundle_and_missing_arrays() {
        let list = SourceList::parse(
            r#"{"windows": [{"id": "7", "name": "x", "appName": "y", "bundleId": null}]}"#,
        )
        .unwrap();
        assert_eq!(list.windows[0].bundle_id, None);

        let list = SourceList::parse(r#"{"microphones": [{"id": "m", "name": "Mic", "index": 2}]}"#)
            .unwrap();
        assert_eq!(list.microphones[0].index, 2);
        assert!(list.displays.is_empty());
        assert!(SourceList::parse("{}").unwrap().is_empty());
        assert!(SourceList::parse("not json").is_err());
    }

    #[test]
    fn test_parse_application_names_and_objects() {
        let list = SourceList::parse(
            r#"{"applications": ["firefox", {"id": "42", "name": "Editor", "bundleId": ""}]}"#,
        )
        .unwrap();
        assert_eq!(list.applications.len(), 2);
        assert_eq!(list.applications[0].id, "firefox");
        assert_eq!(list.applications[0].name, "firefox");
        assert_eq!(list.applications[1].id, "42");
        assert_eq!(list.applications[1].bundle_id, None);
    }

    #[tokio::test]
    async fn test_list_sources_missing_helper() {
        let err = list_sources("/nonexistent/confab-capture", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CaptureUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_list_sources_runs_helper() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper.sh");
        std::fs::write(
            &helper,
            "#!/bin/sh\n[ \"$1 $2 $3\" = \"list --json --microphones-only\" ] || exit 2\n\
             echo '{\"microphones\":[{\"id\":\"default\",\"name\":\"Default\",\"index\":0}]}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let list = list_sources(helper.to_str().unwrap(), true).await.unwrap();
        assert_eq!(list.microphones.len(), 1);

        let err = list_sources(helper.to_str().unwrap(), false).await.unwrap_err();
        assert!(err.to_string().contains("source listing failed"));
    }
}
