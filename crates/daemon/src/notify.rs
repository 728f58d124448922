use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{NotifySettings, ServiceSettings, Settings};
use crate::models::MediaSource;

/// Client for the external movie/series managers. After an encode commits
/// we POST a rescan command and poll its status so the manager picks up the
/// replaced file; everything here is best-effort from the pipeline's view.
pub struct LibraryNotifier {
    client: reqwest::Client,
    services: Vec<ServiceSettings>,
    max_attempts: u32,
    backoff_cap: Duration,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    id: i64,
    status: Option<String>,
}

impl LibraryNotifier {
    pub fn new(services: Vec<ServiceSettings>, notify: &NotifySettings) -> LibraryNotifier {
        LibraryNotifier {
            client: reqwest::Client::new(),
            services,
            max_attempts: notify.max_attempts.max(1),
            backoff_cap: Duration::from_secs(notify.backoff_cap_secs.max(1)),
        }
    }

    pub fn from_settings(settings: &Settings) -> LibraryNotifier {
        LibraryNotifier::new(settings.services.clone(), &settings.notify)
    }

    /// Tell the owning library source to rescan the item backing a video.
    pub async fn notify_rescan(&self, kind: MediaSource, service_id: i64) -> Result<()> {
        let service = self
            .services
            .iter()
            .find(|s| s.kind == kind)
            .with_context(|| format!("no {} service configured", kind.as_str()))?;

        let body = match kind {
            MediaSource::Series => serde_json::json!({
                "name": "RescanSeries",
                "seriesId": service_id,
            }),
            MediaSource::Movies => serde_json::json!({
                "name": "RefreshMovie",
                "movieIds": [service_id],
            }),
        };

        let command = self.post_command(service, &body).await?;
        info!(
            "sent {} command {} to {}",
            body["name"].as_str().unwrap_or("?"),
            command.id,
            service.base_url
        );

        self.poll_command(service, command.id).await
    }

    async fn post_command(
        &self,
        service: &ServiceSettings,
        body: &serde_json::Value,
    ) -> Result<CommandResponse> {
        let url = format!("{}/api/v3/command", service.base_url.trim_end_matches('/'));

        for attempt in 0..self.max_attempts {
            let response = self
                .client
                .post(&url)
                .header("X-Api-Key", &service.api_key)
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<CommandResponse>()
                        .await
                        .context("malformed command response");
                }
                Ok(resp) if resp.status().is_client_error() => {
                    anyhow::bail!(
                        "{} rejected the command: {}",
                        service.base_url,
                        resp.status()
                    );
                }
                Ok(resp) => {
                    warn!(
                        "{} answered {} (attempt {}/{})",
                        url,
                        resp.status(),
                        attempt + 1,
                        self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "request to {} failed: {} (attempt {}/{})",
                        url,
                        e,
                        attempt + 1,
                        self.max_attempts
                    );
                }
            }

            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(backoff_delay(attempt, self.backoff_cap)).await;
            }
        }

        anyhow::bail!(
            "command POST to {} failed after {} attempts",
            url,
            self.max_attempts
        )
    }

    /// Poll the command until it reaches a terminal status. A command that
    /// is still running after the attempt budget is not an error; the
    /// manager will finish on its own.
    async fn poll_command(&self, service: &ServiceSettings, command_id: i64) -> Result<()> {
        let url = format!(
            "{}/api/v3/command/{}",
            service.base_url.trim_end_matches('/'),
            command_id
        );

        for attempt in 0..self.max_attempts {
            tokio::time::sleep(backoff_delay(attempt, self.backoff_cap)).await;

            let response = self
                .client
                .get(&url)
                .header("X-Api-Key", &service.api_key)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let command: CommandResponse =
                        resp.json().await.context("malformed command status")?;
                    match command.status.as_deref() {
                        Some("completed") => {
                            debug!("command {} completed", command_id);
                            return Ok(());
                        }
                        Some("failed") | Some("aborted") => {
                            anyhow::bail!("command {} ended as {:?}", command_id, command.status);
                        }
                        other => {
                            debug!("command {} still {:?}", command_id, other);
                        }
                    }
                }
                Ok(resp) if resp.status().is_client_error() => {
                    anyhow::bail!("status poll rejected: {}", resp.status());
                }
                Ok(resp) => {
                    warn!("status poll answered {}", resp.status());
                }
                Err(e) => {
                    warn!("status poll failed: {}", e);
                }
            }
        }

        warn!(
            "command {} still running after {} polls, leaving it to the manager",
            command_id, self.max_attempts
        );
        Ok(())
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.min(16);
    let secs = 1u64 << exp;
    Duration::from_secs(secs).min(cap)
}
