use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{RemoteReport, ReportDraft};
use crate::remote::traits::{FeedEvent, ReportApi, ReportFeed, Subscription};
use crate::remote::types::{FeedQuery, FeedScope};

/// Report backend reached over a small JSON/HTTP API.
///
/// The feed is implemented by polling the list endpoint and pushing a
/// snapshot whenever the result changes.
#[derive(Clone)]
pub struct HttpReportService {
    client: Client,
    base_url: Arc<str>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    claimant_id: &'a str,
}

impl HttpReportService {
    pub fn new(base_url: &str, timeout: Duration, poll_interval: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("parking-scout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            poll_interval,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch(&self, query: &FeedQuery) -> Result<Vec<RemoteReport>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        match query.scope {
            FeedScope::Region => {
                params.push(("status", "open".to_string()));
                if let Some(b) = query.bounds {
                    params.push(("west", b.west.to_string()));
                    params.push(("south", b.south.to_string()));
                    params.push(("east", b.east.to_string()));
                    params.push(("north", b.north.to_string()));
                }
            }
            FeedScope::Mine => {
                if let Some(owner) = &query.owner_id {
                    params.push(("owner_id", owner.clone()));
                }
            }
        }

        let response = self
            .client
            .get(self.url("/reports"))
            .query(&params)
            .send()
            .await
            .context("Failed to fetch reports")?;

        if !response.status().is_success() {
            anyhow::bail!("Report list returned {}", response.status());
        }

        response
            .json::<Vec<RemoteReport>>()
            .await
            .context("Failed to decode report list")
    }
}

#[async_trait]
impl ReportApi for HttpReportService {
    async fn create(&self, draft: &ReportDraft) -> Result<String> {
        let response = self
            .client
            .post(self.url("/reports"))
            .json(draft)
            .send()
            .await
            .context("Failed to submit report")?;

        if !response.status().is_success() {
            anyhow::bail!("Create returned {}", response.status());
        }

        let created: CreatedResponse = response
            .json()
            .await
            .context("Failed to decode create response")?;
        debug!("Created remote report {}", created.id);
        Ok(created.id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/reports/{id}")))
            .send()
            .await
            .context("Failed to delete report")?;

        if !response.status().is_success() {
            anyhow::bail!("Delete of {} returned {}", id, response.status());
        }
        Ok(())
    }

    async fn claim(&self, id: &str, claimant_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/reports/{id}/claim")))
            .json(&ClaimRequest { claimant_id })
            .send()
            .await
            .context("Failed to claim report")?;

        if !response.status().is_success() {
            anyhow::bail!("Claim of {} returned {}", id, response.status());
        }
        Ok(())
    }

    async fn reopen(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/reports/{id}/reopen")))
            .send()
            .await
            .context("Failed to reopen report")?;

        if !response.status().is_success() {
            anyhow::bail!("Reopen of {} returned {}", id, response.status());
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

impl ReportFeed for HttpReportService {
    fn subscribe(&self, query: FeedQuery, events: mpsc::Sender<FeedEvent>) -> Subscription {
        let service = self.clone();
        let label = format!("http {:?} feed", query.scope);
        info!("Subscribing to {} ({:?})", label, query.bounds);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.poll_interval);
            let mut last: Option<Vec<RemoteReport>> = None;

            loop {
                interval.tick().await;
                let event = match service.fetch(&query).await {
                    Ok(reports) if last.as_ref() == Some(&reports) => continue,
                    Ok(reports) => {
                        last = Some(reports.clone());
                        FeedEvent::Snapshot {
                            scope: query.scope,
                            reports,
                        }
                    }
                    Err(e) => {
                        warn!("Feed poll failed: {:#}", e);
                        last = None;
                        FeedEvent::Error {
                            scope: query.scope,
                            message: format!("{e:#}"),
                        }
                    }
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(label, task)
    }
}
