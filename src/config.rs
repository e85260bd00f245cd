//! Configuration for a declutter run
//!
//! Every threshold the planning engines use lives in [`DeclutterConfig`], which
//! round-trips through JSON so a user can pin their tuning next to the staging
//! folder. Defaults follow the behaviour documented on each field.

use crate::error::{DeclutterError, Result};
use crate::fingerprint::CombineMode;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Confidence thresholds splitting classification labels into bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBands {
    /// At or above: placed automatically
    pub high: f32,
    /// At or above (and below `high`): review queue. Below: catch-all.
    pub medium: f32,
}

impl Default for ConfidenceBands {
    fn default() -> Self {
        Self {
            high: 0.85,
            medium: 0.50,
        }
    }
}

/// Folder names used inside the staging root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingLayout {
    /// Identical duplicate tier
    pub identical: PathBuf,
    /// Similar duplicate tier
    pub similar: PathBuf,
    /// High confidence classifications, one subfolder per category
    pub classified: PathBuf,
    /// Medium confidence classifications, one subfolder per category
    pub review: PathBuf,
    /// Low confidence classifications
    pub catch_all: PathBuf,
    /// Event folders
    pub events: PathBuf,
    /// Subfolder for photos left out of every visual sub-cluster
    pub unclustered: String,
    /// Photos with no capture time
    pub undated: PathBuf,
    /// Video files
    pub videos: PathBuf,
    /// Journal and reports
    pub reports: PathBuf,
}

impl Default for StagingLayout {
    fn default() -> Self {
        Self {
            identical: PathBuf::from("duplicates/identical"),
            similar: PathBuf::from("duplicates/similar"),
            classified: PathBuf::from("classified"),
            review: PathBuf::from("review"),
            catch_all: PathBuf::from("misc/unsorted"),
            events: PathBuf::from("events"),
            unclustered: "unclustered".to_string(),
            undated: PathBuf::from("undated"),
            videos: PathBuf::from("videos"),
            reports: PathBuf::from("_reports"),
        }
    }
}

/// Tunables for planning and execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclutterConfig {
    /// Largest combined distance still considered identical
    pub near_threshold: u32,
    /// Largest combined distance still considered similar
    pub similar_threshold: u32,
    /// How the two component hash distances combine
    pub combine_mode: CombineMode,
    /// Capture-time gap that closes an event, in seconds
    pub gap_threshold_secs: i64,
    /// Minimum members of a visual sub-cluster
    pub min_cluster_size: usize,
    /// Segments larger than `min_cluster_size * subdivide_multiplier` get sub-clustered
    pub subdivide_multiplier: usize,
    /// Neighbourhood radius (cosine distance) for density clustering; estimated when unset
    pub cluster_epsilon: Option<f32>,
    /// Classification confidence bands
    pub confidence: ConfidenceBands,
    /// Name of the staging folder created under the scanned root
    pub staging_dir_name: String,
    /// Folder layout under the staging root
    pub layout: StagingLayout,
    /// Worker threads for fingerprint extraction
    pub parallel_workers: usize,
    /// Photos decoded per batch; bounds peak memory
    pub batch_size: usize,
    /// Glob patterns excluded from scans
    pub ignore_patterns: Vec<String>,
}

impl Default for DeclutterConfig {
    fn default() -> Self {
        Self {
            near_threshold: 10,
            similar_threshold: 30,
            combine_mode: CombineMode::Sum,
            gap_threshold_secs: 48 * 3600,
            min_cluster_size: 5,
            subdivide_multiplier: 4,
            cluster_epsilon: None,
            confidence: ConfidenceBands::default(),
            staging_dir_name: "_declutter".to_string(),
            layout: StagingLayout::default(),
            parallel_workers: num_cpus::get(),
            batch_size: 64,
            ignore_patterns: Vec::new(),
        }
    }
}

impl DeclutterConfig {
    /// Check that the thresholds are coherent
    pub fn validate(&self) -> Result<()> {
        if self.near_threshold > self.similar_threshold {
            return Err(DeclutterError::InvalidConfiguration(format!(
                "near_threshold ({}) must not exceed similar_threshold ({})",
                self.near_threshold, self.similar_threshold
            )));
        }
        if self.gap_threshold_secs <= 0 {
            return Err(DeclutterError::InvalidConfiguration(
                "gap_threshold_secs must be positive".to_string(),
            ));
        }
        if self.min_cluster_size < 2 {
            return Err(DeclutterError::InvalidConfiguration(
                "min_cluster_size must be at least 2".to_string(),
            ));
        }
        if self.subdivide_multiplier == 0 {
            return Err(DeclutterError::InvalidConfiguration(
                "subdivide_multiplier must be at least 1".to_string(),
            ));
        }
        if let Some(eps) = self.cluster_epsilon {
            if !(eps > 0.0 && eps <= 2.0) {
                return Err(DeclutterError::InvalidConfiguration(format!(
                    "cluster_epsilon {} must be in (0, 2]",
                    eps
                )));
            }
        }
        let bands = self.confidence;
        if !(0.0 <= bands.medium && bands.medium <= bands.high && bands.high <= 1.0) {
            return Err(DeclutterError::InvalidConfiguration(format!(
                "confidence bands must satisfy 0 <= medium ({}) <= high ({}) <= 1",
                bands.medium, bands.high
            )));
        }
        if self.staging_dir_name.is_empty()
            || self.staging_dir_name.contains(std::path::MAIN_SEPARATOR)
            || self.staging_dir_name == ".."
        {
            return Err(DeclutterError::InvalidConfiguration(format!(
                "staging_dir_name {:?} must be a single folder name",
                self.staging_dir_name
            )));
        }
        if self.parallel_workers == 0 || self.batch_size == 0 {
            return Err(DeclutterError::InvalidConfiguration(
                "parallel_workers and batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Gap threshold as a chrono duration
    pub fn gap_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gap_threshold_secs)
    }

    /// Load a configuration file, falling back to defaults for missing fields
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Persist the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        utils::atomic_write(path, &json)
    }
}
