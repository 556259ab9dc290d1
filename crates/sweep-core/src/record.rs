use crate::value::Configuration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const TIMEOUT_MESSAGE: &str = "timeout";
pub const EXECUTION_FAILED_PREFIX: &str = "execution failed :: ";
pub const UNKNOWN_ERROR_PREFIX: &str = "unknown error :: ";

/// One row of experiment output, always tied to the configuration that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub configuration: Configuration,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Algorithm-reported fields, kept verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResultRecord {
    pub fn failure(configuration: Configuration, message: impl Into<String>) -> Self {
        Self {
            configuration,
            success: false,
            error_message: Some(message.into()),
            fields: Map::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_message.as_deref() == Some(TIMEOUT_MESSAGE)
    }
}

/// Tallies of a result set. Timeouts are counted apart from other failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub total: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub failed: usize,
}

/// Ordered collection of records, logically keyed by configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSet {
    records: Vec<ResultRecord>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ResultRecord> {
        self.records
    }

    pub fn push(&mut self, record: ResultRecord) {
        self.records.push(record);
    }

    pub fn find(&self, configuration: &Configuration) -> Option<&ResultRecord> {
        let key = configuration.identity_key();
        self.records
            .iter()
            .find(|r| r.configuration.identity_key() == key)
    }

    /// Configurations whose run did not succeed, in set order.
    pub fn failed_configurations(&self) -> Vec<Configuration> {
        self.records
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.configuration.clone())
            .collect()
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts {
            total: self.records.len(),
            ..OutcomeCounts::default()
        };
        for record in &self.records {
            if record.success {
                counts.succeeded += 1;
            } else if record.is_timeout() {
                counts.timed_out += 1;
            } else {
                counts.failed += 1;
            }
        }
        counts
    }
}

impl From<Vec<ResultRecord>> for ResultSet {
    fn from(records: Vec<ResultRecord>) -> Self {
        Self { records }
    }
}

impl FromIterator<ResultRecord> for ResultSet {
    fn from_iter<I: IntoIterator<Item = ResultRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Folds `new_set` into `old_set` by configuration identity: matching records
/// are replaced in place, unmatched new records are appended, and old records
/// without a counterpart are kept as they are. Repeated configurations inside
/// either set collapse onto their first position, holding the latest record.
pub fn merge(old_set: ResultSet, new_set: ResultSet) -> ResultSet {
    let mut records = Vec::with_capacity(old_set.records.len() + new_set.records.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.capacity());
    for record in old_set.records.into_iter().chain(new_set.records) {
        let key = record.configuration.identity_key();
        match index.get(&key) {
            Some(&pos) => records[pos] = record,
            None => {
                index.insert(key, records.len());
                records.push(record);
            }
        }
    }
    ResultSet { records }
}
