//! Data model for experiment sweeps: parameter values and configurations,
//! configuration-space expansion, result records with identity-based merging,
//! and the persisted results format.

pub mod record;
pub mod space;
pub mod store;
pub mod value;

pub use record::{
    merge, OutcomeCounts, ResultRecord, ResultSet, EXECUTION_FAILED_PREFIX, TIMEOUT_MESSAGE,
    UNKNOWN_ERROR_PREFIX,
};
pub use space::{cartesian_expand, Axis, ConfigurationSpace, Filter, GenerationError};
pub use store::{
    atomic_write_bytes, configurations_digest, default_output_path, ensure_dir,
    load_configurations, load_results, manifest_path, save_results, write_manifest,
    PersistOptions, RunManifest,
};
pub use value::{ConfigValue, Configuration};
