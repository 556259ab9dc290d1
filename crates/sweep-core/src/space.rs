use crate::value::{ConfigValue, Configuration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Problems detected while building a configuration space. These are fatal
/// and surface before any job is dispatched.
#[derive(Debug, Error, PartialEq)]
pub enum GenerationError {
    #[error("axis '{0}' has no values")]
    EmptyAxis(String),
    #[error("axis '{key}' lists value {value} more than once")]
    DuplicateValue { key: String, value: String },
    #[error("filter on axis '{0}' matches no configuration")]
    FilterMatchesNothing(String),
    #[error("configuration space is empty")]
    EmptySpace,
}

/// Equality constraints a configuration must already satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, ConfigValue>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, config: &Configuration) -> bool {
        self.0
            .iter()
            .all(|(key, value)| config.get(key) == Some(value))
    }
}

/// Expands `base` along one axis.
///
/// Without a filter every configuration is copied once per value. With a
/// filter only matching configurations are expanded; the rest pass through
/// unchanged in their original position. An empty `values` list yields an
/// empty result.
pub fn cartesian_expand(
    base: &[Configuration],
    key: &str,
    values: &[ConfigValue],
    filter: Option<&Filter>,
) -> Vec<Configuration> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(base.len() * values.len());
    for config in base {
        let selected = filter.map(|f| f.matches(config)).unwrap_or(true);
        if selected {
            out.extend(values.iter().map(|v| config.with(key, v.clone())));
        } else {
            out.push(config.clone());
        }
    }
    out
}

/// A parameter axis, optionally restricted to configurations matching `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub key: String,
    pub values: Vec<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl Axis {
    pub fn new(key: &str, values: Vec<ConfigValue>) -> Self {
        Self {
            key: key.to_string(),
            values,
            filter: None,
        }
    }

    pub fn filtered(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Declarative description of an experiment's configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpace {
    #[serde(default = "ConfigurationSpace::default_base")]
    pub base: Vec<Configuration>,
    pub axes: Vec<Axis>,
}

impl ConfigurationSpace {
    fn default_base() -> Vec<Configuration> {
        vec![Configuration::new()]
    }

    pub fn new(axes: Vec<Axis>) -> Self {
        Self {
            base: Self::default_base(),
            axes,
        }
    }

    /// Applies every axis in declaration order.
    pub fn build(&self) -> Result<Vec<Configuration>, GenerationError> {
        let mut configs = self.base.clone();
        for axis in &self.axes {
            if axis.values.is_empty() {
                return Err(GenerationError::EmptyAxis(axis.key.clone()));
            }
            for (idx, value) in axis.values.iter().enumerate() {
                if axis.values[..idx].contains(value) {
                    return Err(GenerationError::DuplicateValue {
                        key: axis.key.clone(),
                        value: value.to_string(),
                    });
                }
            }
            let filter = axis.filter.as_ref().filter(|f| !f.is_empty());
            if let Some(filter) = filter {
                if !configs.iter().any(|c| filter.matches(c)) {
                    return Err(GenerationError::FilterMatchesNothing(axis.key.clone()));
                }
            }
            configs = cartesian_expand(&configs, &axis.key, &axis.values, filter);
        }
        if configs.is_empty() {
            return Err(GenerationError::EmptySpace);
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(values: &[&str]) -> Vec<ConfigValue> {
        values.iter().map(|v| ConfigValue::from(*v)).collect()
    }

    #[test]
    fn unfiltered_expand_multiplies_sizes() {
        let base = vec![Configuration::new()];
        let paths = strs(&["uniform.track", "long.track"]);
        let step = cartesian_expand(&base, "domainPath", &paths, None);
        let step = cartesian_expand(
            &step,
            "actionDuration",
            &[1i64.into(), 5i64.into(), 10i64.into()],
            None,
        );
        assert_eq!(step.len(), 6);
        assert_eq!(step[0].get("domainPath"), Some(&"uniform.track".into()));
        assert_eq!(step[0].get("actionDuration"), Some(&ConfigValue::Int(1)));
        assert_eq!(step[5].get("domainPath"), Some(&"long.track".into()));
        assert_eq!(step[5].get("actionDuration"), Some(&ConfigValue::Int(10)));
    }

    #[test]
    fn empty_values_yield_empty_result() {
        let base = vec![Configuration::new(), Configuration::new()];
        assert!(cartesian_expand(&base, "weight", &[], None).is_empty());
    }

    #[test]
    fn filtered_expand_passes_non_matching_through() {
        let names = strs(&["A", "B"]);
        let base = cartesian_expand(&[Configuration::new()], "algorithmName", &names, None);
        let filter = Filter::new().require("algorithmName", "A");
        let out = cartesian_expand(&base, "weight", &[ConfigValue::Float(1.0)], Some(&filter));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("algorithmName"), Some(&"A".into()));
        assert_eq!(out[0].get("weight"), Some(&ConfigValue::Float(1.0)));
        assert_eq!(out[1], base[1]);
        assert!(!out[1].contains_key("weight"));
    }

    #[test]
    fn filter_requires_every_constraint() {
        let config: Configuration = [("algorithmName", "A"), ("domainName", "GRID")]
            .into_iter()
            .collect();
        assert!(Filter::new().require("algorithmName", "A").matches(&config));
        assert!(!Filter::new()
            .require("algorithmName", "A")
            .require("domainName", "RACETRACK")
            .matches(&config));
        assert!(!Filter::new().require("weight", 1.0).matches(&config));
    }

    #[test]
    fn filtered_outputs_either_expand_or_stay_identical() {
        let base = ConfigurationSpace::new(vec![
            Axis::new("algorithmName", strs(&["A", "B", "C"])),
            Axis::new("actionDuration", vec![1i64.into(), 2i64.into()]),
        ])
        .build()
        .expect("base");
        let filter = Filter::new().require("actionDuration", 2i64);
        let out = cartesian_expand(&base, "weight", &[1.5.into(), 2.5.into()], Some(&filter));
        for config in &out {
            if filter.matches(config) {
                assert!(config.contains_key("weight"));
            } else {
                assert!(base.iter().any(|b| b.identity_key() == config.identity_key()));
            }
        }
        assert_eq!(out.len(), 3 + 3 * 2);
    }

    #[test]
    fn build_is_deterministic() {
        let space = ConfigurationSpace::new(vec![
            Axis::new("algorithmName", strs(&["A", "B"])),
            Axis::new("weight", vec![1.0.into(), 3.0.into()])
                .filtered(Filter::new().require("algorithmName", "A")),
        ]);
        let first = space.build().expect("build");
        let second = space.build().expect("build");
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn build_reports_empty_axis() {
        let space = ConfigurationSpace::new(vec![
            Axis::new("algorithmName", strs(&["A"])),
            Axis::new("weight", vec![]),
        ]);
        assert_eq!(
            space.build(),
            Err(GenerationError::EmptyAxis("weight".to_string()))
        );
    }

    #[test]
    fn build_reports_filter_without_matches() {
        let space = ConfigurationSpace::new(vec![
            Axis::new("algorithmName", strs(&["A"])),
            Axis::new("weight", vec![1.0.into()])
                .filtered(Filter::new().require("algorithmName", "WEIGHTED_A_STAR")),
        ]);
        assert_eq!(
            space.build(),
            Err(GenerationError::FilterMatchesNothing("weight".to_string()))
        );
    }

    #[test]
    fn build_rejects_duplicate_axis_values() {
        let space = ConfigurationSpace::new(vec![Axis::new("algorithmName", strs(&["A", "A"]))]);
        assert!(matches!(
            space.build(),
            Err(GenerationError::DuplicateValue { .. })
        ));
    }

    #[test]
    fn space_loads_from_yaml_shape() {
        let space: ConfigurationSpace = serde_json::from_value(serde_json::json!({
            "axes": [
                { "key": "algorithmName", "values": ["A", "B"] },
                { "key": "weight", "values": [1.0], "filter": { "algorithmName": "A" } }
            ]
        }))
        .expect("parse space");
        let configs = space.build().expect("build");
        assert_eq!(configs.len(), 2);
        assert_eq!(
            serde_json::to_value(&configs[0]).expect("json"),
            serde_json::json!({ "algorithmName": "A", "weight": 1.0 })
        );
        assert_eq!(
            serde_json::to_value(&configs[1]).expect("json"),
            serde_json::json!({ "algorithmName": "B" })
        );
    }
}
