use crate::channel::ExecutionOutcome;
use crate::Job;
use serde_json::Value;
use sweep_core::{ResultRecord, EXECUTION_FAILED_PREFIX, TIMEOUT_MESSAGE, UNKNOWN_ERROR_PREFIX};
use thiserror::Error;
use tracing::warn;

/// A stdout line consisting solely of this marker precedes the JSON payload.
pub const SENTINEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("missing result sentinel '#'")]
    MissingSentinel,
    #[error("no payload line after result sentinel")]
    MissingPayloadLine,
    #[error("malformed result payload: {0}")]
    Malformed(String),
    #[error("result payload is not a JSON array")]
    NotAnArray,
    #[error("result payload is empty")]
    Empty,
    #[error("result entry is not a JSON object")]
    NotAnObject,
}

/// Returns the entries of the JSON array following the last sentinel line.
pub fn extract_payload(stdout: &str) -> Result<Vec<Value>, PayloadError> {
    let lines = stdout.lines().collect::<Vec<_>>();
    let marker = lines
        .iter()
        .rposition(|l| l.trim_end_matches('\r') == SENTINEL)
        .ok_or(PayloadError::MissingSentinel)?;
    let line = lines
        .get(marker + 1)
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .ok_or(PayloadError::MissingPayloadLine)?;
    let value: Value =
        serde_json::from_str(line).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    match value {
        Value::Array(items) if items.is_empty() => Err(PayloadError::Empty),
        Value::Array(items) => Ok(items),
        _ => Err(PayloadError::NotAnArray),
    }
}

fn record_from_payload(job: &Job, entry: Value) -> Result<ResultRecord, PayloadError> {
    let Value::Object(mut fields) = entry else {
        return Err(PayloadError::NotAnObject);
    };
    // The job's configuration is the record identity; the echoed copy may
    // carry defaults filled in by the executable.
    fields.remove("configuration");
    let success = fields
        .remove("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let error_message = fields
        .remove("errorMessage")
        .and_then(|v| v.as_str().map(str::to_string));
    Ok(ResultRecord {
        configuration: job.configuration.clone(),
        success,
        error_message,
        fields,
    })
}

/// Turns one job's outcome into exactly one record.
pub fn parse_outcome(job: &Job, outcome: ExecutionOutcome) -> ResultRecord {
    match outcome {
        ExecutionOutcome::Success { stdout, .. } => {
            let parsed = extract_payload(&stdout).and_then(|mut entries| {
                if entries.len() > 1 {
                    warn!(
                        configuration = %job.configuration,
                        extra = entries.len() - 1,
                        "dropping extra result entries"
                    );
                }
                record_from_payload(job, entries.swap_remove(0))
            });
            parsed.unwrap_or_else(|e| {
                ResultRecord::failure(
                    job.configuration.clone(),
                    format!("{}{}", EXECUTION_FAILED_PREFIX, e),
                )
            })
        }
        ExecutionOutcome::Timeout => {
            ResultRecord::failure(job.configuration.clone(), TIMEOUT_MESSAGE)
        }
        ExecutionOutcome::ProcessFailure { exit_code, stderr } => {
            let detail = if stderr.is_empty() {
                match exit_code {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr
            };
            ResultRecord::failure(
                job.configuration.clone(),
                format!("{}{}", EXECUTION_FAILED_PREFIX, detail),
            )
        }
        ExecutionOutcome::TransportError { message } => ResultRecord::failure(
            job.configuration.clone(),
            format!("{}{}", UNKNOWN_ERROR_PREFIX, message),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use sweep_core::{ConfigValue, Configuration};

    fn job() -> Job {
        let config: Configuration = [
            ("algorithmName", ConfigValue::from("A_STAR")),
            ("actionDuration", ConfigValue::Int(6400)),
        ]
        .into_iter()
        .collect();
        Job::new(config, "searkt -stdinConfiguration", Duration::from_secs(60))
    }

    fn success(stdout: &str) -> ExecutionOutcome {
        ExecutionOutcome::Success {
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn payload_after_sentinel_becomes_record() {
        let stdout = "Loading domain\nPlanning...\n#\n[{\"configuration\":{\"algorithmName\":\"A_STAR\",\"actionDuration\":6400,\"expansionLimit\":1000000},\"success\":true,\"errorMessage\":null,\"expandedNodes\":42}]\n";
        let record = parse_outcome(&job(), success(stdout));
        assert!(record.success);
        assert_eq!(record.error_message, None);
        assert_eq!(record.configuration, job().configuration);
        assert_eq!(record.fields["expandedNodes"], json!(42));
        assert!(!record.fields.contains_key("configuration"));
    }

    #[test]
    fn algorithm_reported_failure_is_kept() {
        let stdout = "#\n[{\"success\":false,\"errorMessage\":\"The planner exceeded the expansion limit: 1000\"}]";
        let record = parse_outcome(&job(), success(stdout));
        assert!(!record.success);
        assert_eq!(
            record.error_message.as_deref(),
            Some("The planner exceeded the expansion limit: 1000")
        );
    }

    #[test]
    fn missing_sentinel_is_execution_failure() {
        let record = parse_outcome(&job(), success("[{\"success\":true}]\n"));
        assert!(!record.success);
        let msg = record.error_message.unwrap_or_default();
        assert!(msg.starts_with(EXECUTION_FAILED_PREFIX), "{}", msg);
        assert!(msg.contains("sentinel"), "{}", msg);
    }

    #[test]
    fn malformed_and_empty_payloads_fail() {
        for stdout in ["#\n{not json", "#\n[]", "#\n{\"success\":true}", "#\n", "#\n[1]"] {
            let record = parse_outcome(&job(), success(stdout));
            assert!(!record.success, "{}", stdout);
            assert!(record
                .error_message
                .as_deref()
                .unwrap_or("")
                .starts_with(EXECUTION_FAILED_PREFIX));
        }
    }

    #[test]
    fn sentinel_line_must_be_exactly_the_marker() {
        assert_eq!(
            extract_payload(" # \n[{\"success\":true}]"),
            Err(PayloadError::MissingSentinel)
        );
        assert_eq!(
            extract_payload("## heading\n[{\"success\":true}]"),
            Err(PayloadError::MissingSentinel)
        );
        let entries =
            extract_payload("log\r\n#\r\n[{\"success\":true}]\r\n").expect("crlf payload");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn last_sentinel_wins() {
        let stdout = "#\nnot the payload\n#\n[{\"success\":true,\"pathLength\":7}]";
        let record = parse_outcome(&job(), success(stdout));
        assert!(record.success);
        assert_eq!(record.fields["pathLength"], json!(7));
    }

    #[test]
    fn failure_outcomes_use_taxonomy_messages() {
        let timeout = parse_outcome(&job(), ExecutionOutcome::Timeout);
        assert_eq!(timeout.error_message.as_deref(), Some("timeout"));
        assert!(!timeout.success);

        let failed = parse_outcome(
            &job(),
            ExecutionOutcome::ProcessFailure {
                exit_code: Some(1),
                stderr: "java.lang.OutOfMemoryError".to_string(),
            },
        );
        assert_eq!(
            failed.error_message.as_deref(),
            Some("execution failed :: java.lang.OutOfMemoryError")
        );

        let silent = parse_outcome(
            &job(),
            ExecutionOutcome::ProcessFailure {
                exit_code: Some(137),
                stderr: String::new(),
            },
        );
        assert_eq!(
            silent.error_message.as_deref(),
            Some("execution failed :: exit status 137")
        );

        let transport = parse_outcome(
            &job(),
            ExecutionOutcome::TransportError {
                message: "Permission denied (publickey)".to_string(),
            },
        );
        assert_eq!(
            transport.error_message.as_deref(),
            Some("unknown error :: Permission denied (publickey)")
        );
        assert_eq!(transport.configuration, job().configuration);
    }
}
