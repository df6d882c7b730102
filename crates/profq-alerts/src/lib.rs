//! Best-effort alert delivery: Slack notifier with retry/backoff and a background dispatch queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use profq_quality::AlertEvent;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "profq-alerts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyOutcome {
    pub delivered: bool,
    pub reference_or_error: String,
}

impl NotifyOutcome {
    pub fn delivered(reference: impl Into<String>) -> Self {
        Self {
            delivered: true,
            reference_or_error: reference.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            reference_or_error: error.into(),
        }
    }
}

/// External notification channel. Failures are reported in the outcome, never raised.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> NotifyOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub token: Option<String>,
    pub channel: String,
    pub api_base: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            token: None,
            channel: String::new(),
            api_base: "https://slack.com/api".to_string(),
            timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SlackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token: std::env::var("SLACK_BOT_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            channel: std::env::var("SLACK_CHANNEL").unwrap_or_default(),
            api_base: std::env::var("SLACK_API_BASE").unwrap_or(defaults.api_base),
            timeout: std::env::var("PROFQ_NOTIFY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff: defaults.backoff,
        }
    }
}

#[derive(Debug, Error)]
enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}")]
    HttpStatus { status: StatusCode },
    #[error("{0}")]
    Api(String),
}

impl NotifyError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            NotifyError::Request(err) => classify_reqwest_error(err),
            NotifyError::HttpStatus { status } => classify_status(*status),
            NotifyError::Api(code) if code == "ratelimited" => RetryDisposition::Retryable,
            NotifyError::Api(_) => RetryDisposition::NonRetryable,
        }
    }

    /// Slack error codes are reported verbatim; transport failures keep their description.
    fn into_reference(self) -> String {
        match self {
            NotifyError::Api(code) => code,
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
pub struct SlackNotifier {
    client: reqwest::Client,
    config: SlackConfig,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(SlackConfig::from_env())
    }

    async fn post_once(&self, token: &str, message: &str) -> Result<String, NotifyError> {
        let url = format!("{}/chat.postMessage", self.config.api_base.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({
                "channel": self.config.channel,
                "text": message,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus { status });
        }
        let body: PostMessageResponse = resp.json().await?;
        if body.ok {
            Ok(body.ts.unwrap_or_else(|| "sent".to_string()))
        } else {
            Err(NotifyError::Api(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ))
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> NotifyOutcome {
        let Some(token) = self.config.token.as_deref() else {
            return NotifyOutcome::failed("Slack token not set");
        };

        let backoff = self.config.backoff;
        let mut attempt = 0;
        loop {
            match self.post_once(token, message).await {
                Ok(ts) => return NotifyOutcome::delivered(ts),
                Err(err) => {
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(attempt, error = %err, "slack delivery failed; retrying");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return NotifyOutcome::failed(err.into_reference());
                }
            }
        }
    }
}

const HISTORY_LIMIT: usize = 1_000;

/// Queues alert events for a background worker so that producers never wait on delivery.
///
/// Must be constructed inside a Tokio runtime.
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    sender: Mutex<Option<mpsc::Sender<AlertEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    history: Arc<Mutex<VecDeque<AlertEvent>>>,
}

impl AlertDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AlertEvent>(capacity.max(1));
        let history = Arc::new(Mutex::new(VecDeque::new()));

        let worker_notifier = notifier.clone();
        let worker_history = history.clone();
        let worker = tokio::spawn(
            async move {
                while let Some(event) = receiver.recv().await {
                    let event = deliver(worker_notifier.as_ref(), event).await;
                    push_history(&worker_history, event);
                }
            }
            .instrument(info_span!("alert_dispatch_worker")),
        );

        Self {
            notifier,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            history,
        }
    }

    /// Enqueues without waiting. Returns whether the event was accepted; rejected
    /// events are recorded as undelivered.
    pub fn submit(&self, mut event: AlertEvent) -> bool {
        let sender = lock(&self.sender).clone();
        let Some(sender) = sender else {
            event.record_outcome(false, "dispatcher closed");
            warn!(metric = %event.metric, "alert dropped: dispatcher closed");
            push_history(&self.history, event);
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(mut event)) => {
                event.record_outcome(false, "dispatch queue full");
                warn!(metric = %event.metric, "alert dropped: dispatch queue full");
                push_history(&self.history, event);
                false
            }
            Err(TrySendError::Closed(mut event)) => {
                event.record_outcome(false, "dispatcher closed");
                warn!(metric = %event.metric, "alert dropped: dispatcher closed");
                push_history(&self.history, event);
                false
            }
        }
    }

    /// Delivers inline and returns the event with its outcome recorded.
    pub async fn dispatch_now(&self, event: AlertEvent) -> AlertEvent {
        let event = deliver(self.notifier.as_ref(), event).await;
        push_history(&self.history, event.clone());
        event
    }

    /// Most recent delivery outcomes, oldest first.
    pub fn history(&self) -> Vec<AlertEvent> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Stops accepting events, drains the queue and waits for the worker.
    pub async fn shutdown(&self) {
        drop(lock(&self.sender).take());
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "alert dispatch worker ended abnormally");
            }
        }
    }
}

async fn deliver(notifier: &dyn Notifier, mut event: AlertEvent) -> AlertEvent {
    let outcome = notifier.notify(&event.message).await;
    if outcome.delivered {
        info!(metric = %event.metric, reference = %outcome.reference_or_error, "alert delivered");
    } else {
        warn!(metric = %event.metric, error = %outcome.reference_or_error, "alert not delivered");
    }
    event.record_outcome(outcome.delivered, outcome.reference_or_error);
    event
}

fn push_history(history: &Mutex<VecDeque<AlertEvent>>, event: AlertEvent) {
    let mut history = lock(history);
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(event);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
