use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::json;
use tracing::{debug, error};

use crate::error::MirrorError;
use crate::reconcile::DownloadOutput;

/// Channel identifiers, wired in by the binary. A missing channel silently
/// drops the corresponding notifications.
#[derive(Debug, Clone, Default)]
pub struct NotifyChannels {
    /// Receives a JSON message after each definition with a non-empty summary.
    pub download_complete: Option<String>,
    /// Receives one JSON message at process end when anything was downloaded.
    pub all_download_complete: Option<String>,
    /// Receives human-readable disk-full and corrupted-file messages.
    pub administration: Option<String>,
}

/// Fire-and-forget notifications. Delivery failures are logged and never
/// fail a download.
pub trait Notifier {
    fn disk_full(&self, file_uri: &str, file_size_mb: f64, free_space_mb: f64);
    fn corrupted_file(&self, file_uri: &str, error_message: &str);
    fn definition_complete(&self, definition_id: &str, output: &DownloadOutput);
    fn run_complete(&self, outputs: &BTreeMap<String, DownloadOutput>);
}

/// No-channel notifier for tests and unwired runs.
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn disk_full(&self, _file_uri: &str, _file_size_mb: f64, _free_space_mb: f64) {}
    fn corrupted_file(&self, _file_uri: &str, _error_message: &str) {}
    fn definition_complete(&self, _definition_id: &str, _output: &DownloadOutput) {}
    fn run_complete(&self, _outputs: &BTreeMap<String, DownloadOutput>) {}
}

/// Posts each notification to its channel URL.
pub struct WebhookNotifier {
    client: Client,
    channels: NotifyChannels,
}

impl WebhookNotifier {
    pub fn new(channels: NotifyChannels) -> Result<Self, MirrorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| MirrorError::Notify(err.to_string()))?;
        Ok(Self { client, channels })
    }

    fn post_text(&self, channel: Option<&str>, message: &str) {
        let Some(channel) = channel else {
            debug!("notification channel not configured, dropping message");
            return;
        };
        if let Err(err) = self
            .client
            .post(channel)
            .body(message.to_string())
            .send()
            .and_then(|response| response.error_for_status())
        {
            error!(channel, error = %err, "error occurred while sending notification");
        }
    }

    fn post_json(&self, channel: Option<&str>, payload: &serde_json::Value) {
        let Some(channel) = channel else {
            debug!("notification channel not configured, dropping message");
            return;
        };
        if let Err(err) = self
            .client
            .post(channel)
            .json(payload)
            .send()
            .and_then(|response| response.error_for_status())
        {
            error!(channel, error = %err, "error occurred while sending notification");
        }
    }
}

impl Notifier for WebhookNotifier {
    fn disk_full(&self, file_uri: &str, file_size_mb: f64, free_space_mb: f64) {
        let message = format!(
            "ERROR: Disk Full\n\n\
             Not enough disk space left on device to download the file {file_uri}.\n\
             File size: {file_size_mb:.1} MB\n\
             Disk space left: {free_space_mb:.1} MB"
        );
        debug!(%message, "sending disk full notification");
        self.post_text(self.channels.administration.as_deref(), &message);
    }

    fn corrupted_file(&self, file_uri: &str, error_message: &str) {
        let message = format!(
            "ERROR: Corrupted File\n\n\
             The downloaded dataset file {file_uri} is corrupted:\n{error_message}"
        );
        debug!(%message, "sending corrupted file notification");
        self.post_text(self.channels.administration.as_deref(), &message);
    }

    fn definition_complete(&self, definition_id: &str, output: &DownloadOutput) {
        if output.is_empty() {
            return;
        }
        let payload = json!({
            "downloadDefinitionId": definition_id,
            "downloadedFiles": output.success.len(),
            "warningMessages": output.warnings.len(),
            "errorMessages": output.errors.len(),
        });
        debug!(%payload, "sending definition download notification");
        self.post_json(self.channels.download_complete.as_deref(), &payload);
    }

    fn run_complete(&self, outputs: &BTreeMap<String, DownloadOutput>) {
        if outputs.is_empty() {
            return;
        }
        let mut definitions = serde_json::Map::new();
        for (definition_id, output) in outputs {
            definitions.insert(
                definition_id.clone(),
                json!({
                    "downloadedFiles": output.success.len(),
                    "warningMessages": output.warnings.len(),
                    "errorMessages": output.errors.len(),
                }),
            );
        }
        let payload = json!({ "downloadDefinitions": definitions });
        debug!(%payload, "sending final download notification");
        self.post_json(self.channels.all_download_complete.as_deref(), &payload);
    }
}
