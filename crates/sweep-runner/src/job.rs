use std::time::Duration;
use sweep_core::Configuration;

/// One configuration bound to the command that evaluates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub configuration: Configuration,
    pub command: String,
    pub timeout: Duration,
}

impl Job {
    pub fn new(
        configuration: Configuration,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            configuration,
            command: command.into(),
            timeout,
        }
    }

    pub fn input_payload(&self) -> Vec<u8> {
        self.configuration.to_input_payload()
    }
}

pub fn jobs_for(configs: &[Configuration], command: &str, timeout: Duration) -> Vec<Job> {
    configs
        .iter()
        .map(|c| Job::new(c.clone(), command, timeout))
        .collect()
}
