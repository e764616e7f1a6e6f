use crate::config::Config;
use crate::message::Message;
use crate::output::Output;
use crate::protocol::Correlation;
use crate::reconstruct::{reconstruct, TEMPORARY_FAILURE};
use crate::session::{pending_verdict, Metadata, PendingVerdict};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use url::Url;

/// `dkim-signature` is a single string, or a list when several signing
/// domains apply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Signature {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Messages {
    pub smtp_message: Option<String>,
}

/// The subset of the `/checkv2` reply the filter needs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Verdict {
    pub score: f32,
    pub required_score: f32,
    pub subject: Option<String>,
    pub action: String,
    #[serde(rename = "dkim-signature")]
    pub dkim_signature: Option<Signature>,
    pub messages: Messages,
}

impl Verdict {
    pub fn signatures(&self) -> Vec<&str> {
        let values: Vec<&str> = match &self.dkim_signature {
            Some(Signature::Single(value)) => vec![value.as_str()],
            Some(Signature::Multiple(values)) => values.iter().map(String::as_str).collect(),
            None => Vec::new(),
        };
        values.into_iter().filter(|value| !value.is_empty()).collect()
    }

    pub fn smtp_message(&self) -> Option<&str> {
        self.messages
            .smtp_message
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

/// Client for the rspamd HTTP endpoint.
pub struct Scanner {
    client: Client,
    url: Url,
    permits: Arc<Semaphore>,
}

impl Scanner {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let url = config.validate()?;

        let mut builder =
            Client::builder().user_agent(concat!("filter-rspamd/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("building HTTP client")?;

        Ok(Scanner {
            client,
            url,
            permits: Arc::new(Semaphore::new(config.max_concurrent_scans)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Post one message and decode the verdict. No retries.
    pub async fn scan(&self, metadata: &Metadata, message: &[u8]) -> anyhow::Result<Verdict> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(request_headers(metadata))
            .body(message.to_vec())
            .send()
            .await
            .with_context(|| format!("posting to {}", self.url))?
            .error_for_status()?;

        let body = response.bytes().await.context("reading rspamd reply")?;
        serde_json::from_slice(&body).context("decoding rspamd reply")
    }

    /// Scan a completed message on its own task.
    ///
    /// The task writes the rewritten message to `output` and then resolves
    /// the returned verdict with the rejection reason, so a decision waiting
    /// on it is always queued after the message lines.
    pub fn dispatch(
        self: &Arc<Self>,
        metadata: Metadata,
        reply: Correlation,
        message: Vec<u8>,
        output: Output,
    ) -> PendingVerdict {
        let (sender, pending) = pending_verdict();
        let scanner = Arc::clone(self);

        tokio::spawn(async move {
            let reason = scanner.process(&metadata, &reply, &message, &output).await;
            sender.resolve(reason);
        });

        pending
    }

    async fn process(
        &self,
        metadata: &Metadata,
        reply: &Correlation,
        message: &[u8],
        output: &Output,
    ) -> String {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                log::error!("session {}: scan slots unavailable: {e}", reply.session);
                return TEMPORARY_FAILURE.to_string();
            }
        };

        let verdict = match self.scan(metadata, message).await {
            Ok(verdict) => verdict,
            Err(e) => {
                log::warn!("session {}: rspamd scan failed: {e:#}", reply.session);
                return TEMPORARY_FAILURE.to_string();
            }
        };
        log::info!(
            "session {}: action={:?} score={} required={}",
            reply.session,
            verdict.action,
            verdict.score,
            verdict.required_score
        );

        let message = match Message::parse(message) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("session {}: cannot rewrite message: {e}", reply.session);
                return TEMPORARY_FAILURE.to_string();
            }
        };

        reconstruct(reply, message, &verdict, output)
    }
}

fn request_headers(metadata: &Metadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in metadata.iter() {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => log::warn!("Skipping metadata {key}={value:?}: not a valid request header"),
        }
    }
    headers
}
