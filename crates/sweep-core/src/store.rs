use crate::record::{OutcomeCounts, ResultSet};
use crate::value::Configuration;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistOptions {
    /// Algorithm fields stripped before writing (e.g. full action traces).
    #[serde(default)]
    pub drop_fields: Vec<String>,
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

fn is_gzip_path(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("gz")
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_results(path: &Path) -> Result<ResultSet> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let bytes = if is_gzip_path(path) {
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .with_context(|| format!("failed to decompress {}", path.display()))?;
        decoded
    } else {
        raw
    };
    serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not a JSON array of results", path.display()))
}

pub fn save_results(path: &Path, results: &ResultSet, options: &PersistOptions) -> Result<()> {
    let mut rows = Vec::with_capacity(results.len());
    for record in results.records() {
        let mut row = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut row {
            for field in &options.drop_fields {
                if field != "configuration" {
                    map.remove(field);
                }
            }
        }
        rows.push(row);
    }
    let json = serde_json::to_vec(&rows)?;
    let bytes = if is_gzip_path(path) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?
    } else {
        json
    };
    atomic_write_bytes(path, &bytes)
}

/// `<dir>/data<TAG>-<HH-MM-dd-mm-yy>.json.gz`
pub fn default_output_path(dir: &Path, tag: &str, now: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "data{}-{}.json.gz",
        tag,
        now.format("%H-%M-%d-%m-%y")
    ))
}

pub fn configurations_digest(configs: &[Configuration]) -> String {
    let mut hasher = Sha256::new();
    for config in configs {
        hasher.update(config.identity_key().as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Sidecar written next to a results file describing the run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub tag: String,
    pub job_count: usize,
    pub admitted_hosts: Vec<String>,
    pub configurations_digest: String,
    pub succeeded: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub results_path: String,
}

impl RunManifest {
    pub fn new(
        run_id: &str,
        tag: &str,
        configs: &[Configuration],
        admitted_hosts: Vec<String>,
        counts: OutcomeCounts,
        results_path: &Path,
    ) -> Self {
        Self {
            schema_version: "sweep_manifest_v1".to_string(),
            run_id: run_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            tag: tag.to_string(),
            job_count: configs.len(),
            admitted_hosts,
            configurations_digest: configurations_digest(configs),
            succeeded: counts.succeeded,
            timed_out: counts.timed_out,
            failed: counts.failed,
            results_path: results_path.display().to_string(),
        }
    }
}

pub fn manifest_path(results_path: &Path) -> PathBuf {
    let name = results_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    results_path.with_file_name(format!("{}.manifest.json", name))
}

pub fn write_manifest(results_path: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = manifest_path(results_path);
    let bytes = serde_json::to_vec_pretty(manifest)?;
    atomic_write_bytes(&path, &bytes)?;
    Ok(path)
}

pub fn load_configurations(path: &Path) -> Result<Vec<Configuration>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let configs: Vec<Configuration> = serde_json::from_slice(&raw).map_err(|e| {
        anyhow!(
            "{} is not a JSON array of flat configurations: {}",
            path.display(),
            e
        )
    })?;
    Ok(configs)
}
