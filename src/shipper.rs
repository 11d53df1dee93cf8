//! Out-of-band delivery of recorded visits.
//!
//! Handlers push entries onto a bounded queue and move on; a single background
//! worker appends each entry as a JSON line to the visit log and, when a
//! forward URL is configured, POSTs it to the remote ingest endpoint. Delivery
//! is best-effort: a full queue drops the entry with a warning, and sink
//! failures are logged but never reach the request path.

use std::path::PathBuf;
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::{TrackingConfig, SHIPPER_FORWARD_TIMEOUT_SECS, SHIPPER_QUEUE_CAPACITY};
use crate::visits::VisitEntry;

/// Sending side handed to the visit service; clone freely.
#[derive(Clone)]
pub struct ShipperHandle {
    tx: Sender<VisitEntry>,
}

impl ShipperHandle {
    /// Queue an entry for delivery without blocking.
    pub fn enqueue(&self, entry: VisitEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(capacity = SHIPPER_QUEUE_CAPACITY, "Shipper queue full, dropping entry");
            }
            // Shutting down; remaining entries are already being drained
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Stop accepting entries. The worker drains what is already queued and
    /// exits.
    pub fn close(&self) {
        self.tx.close();
    }
}

struct ForwardTarget {
    url: String,
    token: Option<String>,
}

/// Background worker owning the sinks.
pub struct Shipper {
    rx: Receiver<VisitEntry>,
    log_path: PathBuf,
    forward: Option<ForwardTarget>,
    client: reqwest::Client,
}

impl Shipper {
    /// Start the worker task and return the handle to feed it.
    pub fn spawn(config: &TrackingConfig) -> Result<(ShipperHandle, JoinHandle<()>), reqwest::Error> {
        let (tx, rx) = async_channel::bounded(SHIPPER_QUEUE_CAPACITY);
        let shipper = Shipper {
            rx,
            log_path: PathBuf::from(&config.log_path),
            forward: config.forward_url.as_ref().map(|url| ForwardTarget {
                url: url.clone(),
                token: config.forward_token.clone(),
            }),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(SHIPPER_FORWARD_TIMEOUT_SECS))
                .build()?,
        };
        let task = tokio::spawn(shipper.run());
        Ok((ShipperHandle { tx }, task))
    }

    #[instrument(name = "shipper.run", skip_all)]
    async fn run(self) {
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!(path = %parent.display(), error = %e, "Could not create log directory");
                }
            }
        }
        tracing::debug!(
            log_path = %self.log_path.display(),
            forwarding = self.forward.is_some(),
            "Shipper starting"
        );

        while let Ok(entry) = self.rx.recv().await {
            self.ship(&entry).await;
        }
        tracing::debug!("Shipper queue closed and drained, exiting");
    }

    async fn ship(&self, entry: &VisitEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Could not serialize entry, dropping");
                return;
            }
        };
        self.append_line(&line).await;
        if let Some(target) = &self.forward {
            self.forward_line(target, &line).await;
        }
    }

    async fn append_line(&self, line: &str) {
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(path = %self.log_path.display(), error = %e, "Visit log write failed");
        }
    }

    async fn forward_line(&self, target: &ForwardTarget, line: &str) {
        let mut request = self
            .client
            .post(&target.url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(line.to_string());
        if let Some(token) = &target.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "Ingest endpoint rejected entry");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Forward request failed");
            }
        }
    }
}
