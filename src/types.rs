//! Core data types shared across the declutter engines
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Photos**: `PhotoId`, `PhotoRecord`, `GeoPoint`, `Resolution` - what the
//!   image pipeline hands to the planning engines
//! - **Classification input**: `Category`, `Classification`, `ConfidenceBand` -
//!   labels produced outside the core, consumed read-only by the plan builder
//! - **Reporting**: `PhotoIssue`, `BatchReport` - per-photo failures that are
//!   isolated and summarised instead of aborting a run
//! - **Progress**: `ProgressInfo`, `ProgressCallback` - hooks for long passes
//!
//! ## Examples
//!
//! ```rust
//! use declutter::types::{Category, Classification, ConfidenceBand, PhotoId, PhotoRecord};
//! use declutter::config::ConfidenceBands;
//!
//! let record = PhotoRecord::new(PhotoId::new("/photos/IMG_0001.jpg"));
//! assert!(record.captured_at.is_none());
//!
//! let label = Classification::new(Category::Screenshot, 0.92).unwrap();
//! assert_eq!(label.band(&ConfidenceBands::default()), ConfidenceBand::High);
//! ```

use crate::error::{DeclutterError, Result};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of a photo: its absolute source path at scan time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(PathBuf);

impl PhotoId {
    /// Wrap a path as a photo identity without touching the filesystem
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Resolve a path on disk (symlinks, `..`) into a photo identity
    pub fn resolve(path: &Path) -> Result<Self> {
        Ok(Self(path.canonicalize()?))
    }

    /// Path of the photo
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name component, used when building destinations
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.0.file_name()
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for PhotoId {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// GPS position attached to a photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in decimal degrees, north positive
    pub latitude: f64,
    /// Longitude in decimal degrees, east positive
    pub longitude: f64,
    /// Reverse-geocoded place name, when the pipeline supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
}

impl GeoPoint {
    /// Short human label: the place name if known, otherwise rounded coordinates
    pub fn label(&self) -> String {
        if let Some(name) = &self.place_name {
            return name.clone();
        }
        let ns = if self.latitude >= 0.0 { 'N' } else { 'S' };
        let ew = if self.longitude >= 0.0 { 'E' } else { 'W' };
        format!(
            "{:.2}{} {:.2}{}",
            self.latitude.abs(),
            ns,
            self.longitude.abs(),
            ew
        )
    }
}

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Total pixel count
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Everything the planning engines know about one photo
///
/// Records are immutable once built for a scan session; a re-scan produces
/// new records. Classification labels are deliberately not part of the record:
/// they flow into the plan builder as a separate, read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Absolute source path
    pub id: PhotoId,
    /// Combined perceptual fingerprint, absent when hashing failed
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    /// Capture time from metadata
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    /// GPS position from metadata
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Visual feature vector for clustering
    #[serde(default)]
    pub features: Option<Vec<f32>>,
    /// Pixel dimensions
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// File size in bytes
    #[serde(default)]
    pub size_bytes: u64,
}

impl PhotoRecord {
    /// Bare record with only an identity
    pub fn new(id: PhotoId) -> Self {
        Self {
            id,
            fingerprint: None,
            captured_at: None,
            location: None,
            features: None,
            resolution: None,
            size_bytes: 0,
        }
    }

    /// Attach a fingerprint
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Attach a capture timestamp
    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    /// Attach a feature vector
    pub fn with_features(mut self, features: Vec<f32>) -> Self {
        self.features = Some(features);
        self
    }

    /// Attach a resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution { width, height });
        self
    }

    /// Attach a location
    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }
}

/// Fixed category set produced by the classification pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Regular photograph; left to event placement
    Photo,
    /// Device screenshot
    Screenshot,
    /// Photographed paper document
    Document,
    /// Receipt or invoice
    Receipt,
    /// Anything else that is clearly not a keepsake photo
    Random,
}

impl Category {
    /// Folder name used under the classification buckets
    pub fn folder_name(&self) -> &'static str {
        match self {
            Category::Photo => "photos",
            Category::Screenshot => "screenshots",
            Category::Document => "documents",
            Category::Receipt => "receipts",
            Category::Random => "random",
        }
    }

    /// Whether a label of this category asks for classification placement
    pub fn is_staged(&self) -> bool {
        !matches!(self, Category::Photo)
    }
}

/// Confidence band a classification falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// Placed automatically
    High,
    /// Sent to the review queue
    Medium,
    /// Sent to the catch-all bucket
    Low,
}

/// A label and confidence supplied by the classification pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Predicted category
    pub category: Category,
    /// Confidence in `[0, 1]`
    pub confidence: f32,
}

impl Classification {
    /// Build a classification, rejecting confidences outside `[0, 1]`
    pub fn new(category: Category, confidence: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(DeclutterError::InvalidConfiguration(format!(
                "confidence {} is outside [0, 1]",
                confidence
            )));
        }
        Ok(Self {
            category,
            confidence,
        })
    }

    /// Band this classification falls into under the given thresholds
    pub fn band(&self, bands: &crate::config::ConfidenceBands) -> ConfidenceBand {
        if self.confidence >= bands.high {
            ConfidenceBand::High
        } else if self.confidence >= bands.medium {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }
}

/// Pipeline stage a per-photo issue was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStage {
    /// Discovery and metadata extraction
    Scan,
    /// Fingerprint validation or duplicate indexing
    Dedup,
    /// Temporal segmentation
    Timeline,
    /// Visual sub-clustering
    Clustering,
    /// Plan construction
    Plan,
}

/// A failure isolated to one photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoIssue {
    /// Affected photo
    pub photo: PathBuf,
    /// Where it happened
    pub stage: IssueStage,
    /// Human readable description
    pub message: String,
}

/// Batch summary of per-photo failures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Issues in the order they were raised
    pub issues: Vec<PhotoIssue>,
}

impl BatchReport {
    /// Record an issue
    pub fn push(&mut self, photo: impl Into<PathBuf>, stage: IssueStage, message: impl Into<String>) {
        self.issues.push(PhotoIssue {
            photo: photo.into(),
            stage,
            message: message.into(),
        });
    }

    /// Record an error raised for a photo
    pub fn push_error(&mut self, photo: impl Into<PathBuf>, stage: IssueStage, error: &DeclutterError) {
        self.push(photo, stage, error.to_string());
    }

    /// Merge another report into this one
    pub fn extend(&mut self, other: BatchReport) {
        self.issues.extend(other.issues);
    }

    /// Whether nothing went wrong
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Number of issues in a stage
    pub fn count(&self, stage: IssueStage) -> usize {
        self.issues.iter().filter(|i| i.stage == stage).count()
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}
