//! Alarm reporting.
//!
//! Every fired class ends up as one JSON alarm POSTed to the configured
//! endpoint. Delivery is best-effort: failures are logged and counted, never
//! retried.

use crate::endpoint::ServerEndpoint;
use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors raised by the alarm transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Request failed: {0}")]
    Request(String),
}

/// An alarm ready to be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub channel: i32,
    pub class_id: i32,
    pub resolved_type: i32,
    pub image_path: PathBuf,
    /// Segment video, absent when the segment could not be recorded
    pub video_path: Option<PathBuf>,
    /// Local time of the fire event (`YYYY-MM-DD HH:MM:SS`)
    pub datetime: String,
}

/// Which payload field carries the video URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VideoUrlField {
    #[default]
    SafetyUrl,
    BrakeUrl,
}

impl VideoUrlField {
    /// Parse the configured field name. Unknown names fall back to `safetyUrl`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "safetyUrl" => Self::SafetyUrl,
            "brakeUrl" => Self::BrakeUrl,
            other => {
                warn!(field = other, "Unknown video URL field, using safetyUrl");
                Self::SafetyUrl
            }
        }
    }
}

/// Fixed identification fields sent with every alarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportFields {
    pub device_id: String,
    pub device_ip: String,
    pub safety_id: String,
    pub safety_name: String,
    pub warning: String,
}

/// Wire format of one alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmPayload {
    pub device_id: String,
    pub device_ip: String,
    pub safety_id: String,
    pub safety_name: String,
    pub warning: String,
    #[serde(rename = "type")]
    pub alarm_type: i32,
    pub safety_url: String,
    pub brake_url: String,
    pub datatime: String,
    pub img_url: String,
}

/// Turns stored file paths into references the alarm consumer can open.
#[derive(Debug, Clone)]
pub struct FileLinker {
    save_dir: PathBuf,
    base_url: Option<String>,
}

impl FileLinker {
    pub fn new(save_dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            save_dir: save_dir.into(),
            base_url: base_url.filter(|u| !u.is_empty()),
        }
    }

    /// Public reference for a file under the storage root.
    ///
    /// Without a base URL the absolute path is returned as is. Otherwise the
    /// path relative to the storage root is joined to the base URL with a
    /// single slash. Files outside the root keep their absolute path.
    pub fn link(&self, path: &Path) -> String {
        let Some(base) = &self.base_url else {
            return path.to_string_lossy().into_owned();
        };

        let Ok(relative) = path.strip_prefix(&self.save_dir) else {
            warn!(
                path = %path.display(),
                save_dir = %self.save_dir.display(),
                "File outside storage root, linking absolute path"
            );
            return path.to_string_lossy().into_owned();
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .filter(|c| c != "/")
            .collect::<Vec<_>>()
            .join("/");

        format!("{}/{}", base.trim_end_matches('/'), relative)
    }
}

/// Outbound channel for alarm payloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlarmTransport: Send + Sync {
    /// Send one payload and return the HTTP status code.
    async fn post_json(
        &self,
        endpoint: &ServerEndpoint,
        payload: &AlarmPayload,
    ) -> Result<u16, TransportError>;
}

/// HTTP transport backed by `reqwest`.
pub struct HttpAlarmTransport {
    client: reqwest::Client,
}

impl HttpAlarmTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlarmTransport for HttpAlarmTransport {
    async fn post_json(
        &self,
        endpoint: &ServerEndpoint,
        payload: &AlarmPayload,
    ) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(endpoint.url())
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(response.status().as_u16())
    }
}

/// Result of one report attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    /// No endpoint configured
    Skipped,
    Rejected(u16),
    Failed,
}

/// Formats alarms and hands them to the transport.
pub struct AlarmReporter {
    endpoint: Option<ServerEndpoint>,
    fields: ReportFields,
    video_field: VideoUrlField,
    linker: FileLinker,
    transport: Arc<dyn AlarmTransport>,
}

impl AlarmReporter {
    pub fn new(
        endpoint: Option<ServerEndpoint>,
        fields: ReportFields,
        video_field: VideoUrlField,
        linker: FileLinker,
        transport: Arc<dyn AlarmTransport>,
    ) -> Self {
        Self {
            endpoint,
            fields,
            video_field,
            linker,
            transport,
        }
    }

    /// Build the wire payload for an alarm.
    pub fn build_payload(&self, alarm: &Alarm) -> AlarmPayload {
        let video_url = alarm
            .video_path
            .as_deref()
            .map(|p| self.linker.link(p))
            .unwrap_or_default();

        let (safety_url, brake_url) = match self.video_field {
            VideoUrlField::SafetyUrl => (video_url, String::new()),
            VideoUrlField::BrakeUrl => (String::new(), video_url),
        };

        AlarmPayload {
            device_id: self.fields.device_id.clone(),
            device_ip: self.fields.device_ip.clone(),
            safety_id: self.fields.safety_id.clone(),
            safety_name: self.fields.safety_name.clone(),
            warning: self.fields.warning.clone(),
            alarm_type: alarm.resolved_type,
            safety_url,
            brake_url,
            datatime: alarm.datetime.clone(),
            img_url: self.linker.link(&alarm.image_path),
        }
    }

    /// Send one alarm. Never fails; the outcome is logged and returned.
    #[instrument(skip(self, alarm), fields(channel = alarm.channel, class_id = alarm.class_id))]
    pub async fn report(&self, alarm: &Alarm) -> ReportOutcome {
        let Some(endpoint) = &self.endpoint else {
            debug!("No alarm endpoint configured, skipping report");
            return ReportOutcome::Skipped;
        };

        let payload = self.build_payload(alarm);

        match self.transport.post_json(endpoint, &payload).await {
            Ok(200) => {
                counter!("recorder_alarms_sent_total").increment(1);
                info!(
                    alarm_type = payload.alarm_type,
                    img = %alarm.image_path.display(),
                    "Alarm posted"
                );
                ReportOutcome::Delivered
            }
            Ok(status) => {
                counter!("recorder_alarms_failed_total").increment(1);
                error!(status, endpoint = %endpoint, "Alarm endpoint returned non-success status");
                ReportOutcome::Rejected(status)
            }
            Err(e) => {
                counter!("recorder_alarms_failed_total").increment(1);
                error!(error = %e, endpoint = %endpoint, "Alarm post failed");
                ReportOutcome::Failed
            }
        }
    }
}
