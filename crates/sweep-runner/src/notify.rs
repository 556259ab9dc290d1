use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use sweep_core::OutcomeCounts;
use tracing::{info, warn};

/// Hooks fired once when a batch is dispatched and once when it is joined.
pub trait Notifier: Send + Sync {
    fn batch_started(&self, job_count: usize, hosts: &[String]);
    fn batch_finished(&self, counts: &OutcomeCounts, elapsed: Duration);
}

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn batch_started(&self, job_count: usize, hosts: &[String]) {
        info!(jobs = job_count, hosts = ?hosts, "batch started");
    }

    fn batch_finished(&self, counts: &OutcomeCounts, elapsed: Duration) {
        info!(
            total = counts.total,
            succeeded = counts.succeeded,
            timed_out = counts.timed_out,
            failed = counts.failed,
            elapsed_secs = elapsed.as_secs(),
            "batch finished"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl NotifyConfig {
    pub fn build(&self) -> Box<dyn Notifier> {
        match &self.webhook_url {
            Some(url) => Box::new(WebhookNotifier::new(url.clone(), self.channel.clone())),
            None => Box::new(LogNotifier),
        }
    }
}

/// Posts Slack-style `{"text": ...}` messages. Delivery failures are logged
/// and otherwise ignored.
pub struct WebhookNotifier {
    url: String,
    channel: Option<String>,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, channel: Option<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            url,
            channel,
            client,
        }
    }

    fn post(&self, body: Value) {
        match self.client.post(&self.url).json(&body).send() {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "notification rejected"),
            Err(e) => warn!(error = %e, "notification failed"),
        }
    }
}

pub fn started_message(job_count: usize, hosts: &[String], channel: Option<&str>) -> Value {
    let mut body = json!({
        "text": format!(
            "Experiment batch started: {} jobs on {} hosts ({})",
            job_count,
            hosts.len(),
            hosts.join(", ")
        ),
    });
    if let Some(channel) = channel {
        body["channel"] = json!(channel);
    }
    body
}

pub fn finished_message(counts: &OutcomeCounts, elapsed: Duration, channel: Option<&str>) -> Value {
    let mut body = json!({
        "text": format!(
            "Experiment batch finished in {}s: {} succeeded, {} timed out, {} failed of {}",
            elapsed.as_secs(),
            counts.succeeded,
            counts.timed_out,
            counts.failed,
            counts.total
        ),
    });
    if let Some(channel) = channel {
        body["channel"] = json!(channel);
    }
    body
}

impl Notifier for WebhookNotifier {
    fn batch_started(&self, job_count: usize, hosts: &[String]) {
        self.post(started_message(job_count, hosts, self.channel.as_deref()));
    }

    fn batch_finished(&self, counts: &OutcomeCounts, elapsed: Duration) {
        self.post(finished_message(counts, elapsed, self.channel.as_deref()));
    }
}
