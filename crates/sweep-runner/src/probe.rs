use crate::channel::{ExecutionChannel, ExecutionOutcome, Host};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Load check run on every host before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "ProbeConfig::default_command")]
    pub command: String,
    #[serde(default = "ProbeConfig::default_min_idle")]
    pub min_idle_percent: f64,
    /// Which whitespace-separated field of the last output line holds the
    /// idle percentage, counted from the end (1 = trailing field).
    #[serde(default = "ProbeConfig::default_field")]
    pub idle_field_from_end: usize,
    #[serde(default = "ProbeConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl ProbeConfig {
    fn default_command() -> String {
        "vmstat 3 3 | awk 'END { print $15 }'".to_string()
    }

    fn default_min_idle() -> f64 {
        90.0
    }

    fn default_field() -> usize {
        1
    }

    fn default_timeout() -> u64 {
        10
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            min_idle_percent: Self::default_min_idle(),
            idle_field_from_end: Self::default_field(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

pub fn parse_idle_percent(output: &str, field_from_end: usize) -> Option<f64> {
    if field_from_end == 0 {
        return None;
    }
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let fields = line.split_whitespace().collect::<Vec<_>>();
    let idx = fields.len().checked_sub(field_from_end)?;
    fields[idx].parse::<f64>().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeVerdict {
    Idle(f64),
    Busy(f64),
    Unreadable(String),
    Unreachable(String),
}

impl ProbeVerdict {
    pub fn admitted(&self) -> bool {
        matches!(self, ProbeVerdict::Idle(_))
    }
}

pub fn probe_host<C: ExecutionChannel + ?Sized>(
    channel: &C,
    host: &Host,
    config: &ProbeConfig,
) -> ProbeVerdict {
    let timeout = Duration::from_secs(config.timeout_seconds.max(1));
    match channel.execute(host, &config.command, b"", timeout) {
        ExecutionOutcome::Success { stdout, .. } => {
            match parse_idle_percent(&stdout, config.idle_field_from_end) {
                Some(idle) if idle >= config.min_idle_percent => ProbeVerdict::Idle(idle),
                Some(idle) => ProbeVerdict::Busy(idle),
                None => ProbeVerdict::Unreadable(stdout.trim().to_string()),
            }
        }
        other => ProbeVerdict::Unreachable(other.kind().to_string()),
    }
}

/// Probes every host concurrently and returns the admitted ones in their
/// original order.
pub fn admit_hosts<C: ExecutionChannel + ?Sized>(
    channel: &C,
    hosts: &[Host],
    config: &ProbeConfig,
) -> Vec<Host> {
    let verdicts = thread::scope(|scope| {
        let handles = hosts
            .iter()
            .map(|host| scope.spawn(move || probe_host(channel, host, config)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| ProbeVerdict::Unreachable("probe panicked".to_string()))
            })
            .collect::<Vec<_>>()
    });

    let mut admitted = Vec::new();
    for (host, verdict) in hosts.iter().zip(verdicts) {
        match &verdict {
            ProbeVerdict::Idle(idle) => {
                info!(host = %host, idle = idle, "host is idle");
                admitted.push(host.clone());
            }
            ProbeVerdict::Busy(idle) => {
                warn!(
                    host = %host,
                    idle = idle,
                    min = config.min_idle_percent,
                    "host excluded: busy"
                );
            }
            ProbeVerdict::Unreadable(output) => {
                warn!(host = %host, output = %output, "host excluded: unreadable probe output");
            }
            ProbeVerdict::Unreachable(kind) => {
                warn!(host = %host, outcome = %kind, "host excluded: probe failed");
            }
        }
    }
    admitted
}
