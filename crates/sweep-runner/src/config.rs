use crate::channel::{ExecutionChannel, Host, LocalChannel, SshChannel, SshOptions};
use crate::notify::NotifyConfig;
use crate::probe::ProbeConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_core::{load_configurations, Configuration, ConfigurationSpace, PersistOptions};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ssh,
    Local,
}

/// Everything one sweep run needs, loaded from a YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFile {
    #[serde(default = "SweepFile::default_tag")]
    pub tag: String,
    pub command: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default = "SweepFile::default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub ssh: SshOptions,
    pub hosts: Vec<String>,
    /// `None` disables the pre-flight load check.
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub persist: PersistOptions,
    #[serde(default)]
    pub space: Option<ConfigurationSpace>,
    #[serde(default)]
    pub configurations_path: Option<PathBuf>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl SweepFile {
    fn default_tag() -> String {
        "SWEEP".to_string()
    }

    fn default_output_dir() -> PathBuf {
        PathBuf::from("output")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read sweep file {}", path.display()))?;
        let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        let json_value: Value = serde_json::to_value(yaml_value)?;
        let mut file: SweepFile = serde_json::from_value(json_value)
            .with_context(|| format!("invalid sweep file {}", path.display()))?;
        file.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        file.validate()?;
        Ok(file)
    }

    /// Reports every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.command.trim().is_empty() {
            problems.push("command must not be empty");
        }
        if self.timeout_seconds == 0 {
            problems.push("timeout_seconds must be positive");
        }
        if self.hosts.is_empty() {
            problems.push("hosts must list at least one host");
        }
        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            problems.push("hosts must not contain blank names");
        }
        let mut seen = BTreeSet::new();
        if !self.hosts.iter().all(|h| seen.insert(h.trim())) {
            problems.push("hosts must not repeat a host");
        }
        match (&self.space, &self.configurations_path) {
            (Some(_), Some(_)) => problems.push("set only one of space and configurations_path"),
            (None, None) => problems.push("one of space or configurations_path is required"),
            _ => {}
        }
        if let Some(probe) = &self.probe {
            if probe.idle_field_from_end == 0 {
                problems.push("probe.idle_field_from_end counts from 1");
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid sweep file: {}", problems.join("; ")))
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.hosts.iter().map(|h| Host::new(h.trim())).collect()
    }

    pub fn channel(&self) -> Box<dyn ExecutionChannel> {
        match self.transport {
            Transport::Ssh => Box::new(SshChannel::new(self.ssh.clone())),
            Transport::Local => Box::new(LocalChannel),
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Builds the configuration list, either from `space` or from a JSON file.
    pub fn configurations(&self) -> Result<Vec<Configuration>> {
        if let Some(space) = &self.space {
            return Ok(space.build()?);
        }
        let path = self
            .configurations_path
            .as_ref()
            .ok_or_else(|| anyhow!("no configuration source"))?;
        let configs = load_configurations(&self.resolve(path))?;
        if configs.is_empty() {
            return Err(sweep_core::GenerationError::EmptySpace.into());
        }
        Ok(configs)
    }
}
