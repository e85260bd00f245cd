//! Main Declutter implementation
//!
//! [`Declutter`] ties the engines together for one photo folder:
//!
//! - **Scanner**: finds images and videos
//! - **Analyzer**: fingerprints, EXIF and feature vectors (or a manifest)
//! - **Fingerprint index + grouper**: duplicate groups
//! - **Event segmenter**: events and visual sub-clusters
//! - **Plan builder**: one ordered list of proposed moves
//! - **Move journal**: the only component that touches the filesystem
//!
//! Planning is pure and can be repeated freely. Only [`Declutter::apply`] and
//! the undo methods mutate anything, and all of them go through the journal.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use declutter::Declutter;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let declutter = Declutter::open(PathBuf::from("./Pictures"))?;
//!
//! let outcome = declutter.plan_directory()?;
//! println!("{}", outcome.plan.summary());
//!
//! let report = declutter.apply(&outcome.plan)?;
//! println!("{}", report.summary());
//!
//! // Changed your mind
//! declutter.undo_all()?;
//! # Ok(())
//! # }
//! ```

use crate::clustering::{Clusterer, DensityClusterer};
use crate::config::DeclutterConfig;
use crate::error::{DeclutterError, Result};
use crate::events::{CaptionMap, EventSegmenter, Segmentation};
use crate::executor::{self, CancelToken, ExecutionReport, Executor};
use crate::grouping::{DedupSummary, DuplicateGroup, DuplicateGrouper};
use crate::imaging::{Analyzer, PhotoManifest};
use crate::index::FingerprintIndex;
use crate::journal::{MoveJournal, MoveRecord};
use crate::plan::{ExistingLayout, LabelMap, Plan, PlanBuilder};
use crate::reconcile::ReconcileReport;
use crate::scanner::{ScanResult, Scanner};
use crate::types::{BatchReport, PhotoId, PhotoRecord, ProgressCallback};
use crate::utils;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Everything planning needs, already resolved
#[derive(Debug, Clone, Default)]
pub struct PlanInputs {
    /// Photo records
    pub records: Vec<PhotoRecord>,
    /// Classification labels
    pub labels: LabelMap,
    /// Captions for event labels
    pub captions: CaptionMap,
    /// Video files to stage
    pub videos: Vec<PhotoId>,
    /// Per-photo issues raised while producing the records
    pub report: BatchReport,
}

impl PlanInputs {
    /// Inputs from an externally produced manifest
    pub fn from_manifest(manifest: &PhotoManifest) -> Self {
        Self {
            records: manifest.photos.clone(),
            labels: manifest.label_map(),
            captions: manifest.caption_map(),
            videos: Vec::new(),
            report: manifest.report.clone(),
        }
    }
}

/// Result of a planning pass
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Duplicate groups, by representative path
    pub groups: Vec<DuplicateGroup>,
    /// Dedup statistics
    pub dedup: DedupSummary,
    /// Events and undated photos
    pub segmentation: Segmentation,
    /// The plan
    pub plan: Plan,
    /// Per-photo issues from every stage
    pub report: BatchReport,
}

/// Main entry point for one photo folder
pub struct Declutter {
    root: PathBuf,
    staging_root: PathBuf,
    config: DeclutterConfig,
    journal: MoveJournal,
    clusterer: Arc<dyn Clusterer>,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for Declutter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declutter")
            .field("root", &self.root)
            .field("staging_root", &self.staging_root)
            .field("journal_records", &self.journal.len())
            .finish()
    }
}

impl Declutter {
    /// Open a photo folder with the default configuration
    ///
    /// The staging folder (`<root>/_declutter`) and its journal are created
    /// when missing. Opening reconciles the journal with the filesystem;
    /// see [`Declutter::reconciliation`].
    pub fn open(root: PathBuf) -> Result<Self> {
        DeclutterBuilder::new().build(root)
    }

    /// Scanned folder
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging root every move lands under
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Active configuration
    pub fn config(&self) -> &DeclutterConfig {
        &self.config
    }

    /// The move journal
    pub fn journal(&self) -> &MoveJournal {
        &self.journal
    }

    /// Find images and videos under the root
    pub fn scan(&self) -> Result<ScanResult> {
        let mut scanner = Scanner::new(&self.root, &self.config)?.with_staging_root(&self.staging_root);
        if let Some(progress) = &self.progress {
            scanner = scanner.with_progress(Arc::clone(progress));
        }
        scanner.scan()
    }

    /// Fingerprint and read metadata of every scanned image
    pub fn analyze(&self, scan: &ScanResult) -> Result<(Vec<PhotoRecord>, BatchReport)> {
        let mut analyzer = Analyzer::new(&self.config)?;
        if let Some(progress) = &self.progress {
            analyzer = analyzer.with_progress(Arc::clone(progress));
        }
        let result = analyzer.analyze(&scan.images);
        Ok((result.records, result.report))
    }

    /// Group duplicates, segment events and build the plan
    ///
    /// Pure: nothing on disk changes.
    #[instrument(skip_all, fields(records = inputs.records.len()))]
    pub fn plan(&self, inputs: &PlanInputs) -> Result<PlanOutcome> {
        let mut report = inputs.report.clone();

        let (index, index_report) = FingerprintIndex::build(&inputs.records, self.config.combine_mode);
        report.extend(index_report);
        let groups = DuplicateGrouper::from_config(&self.config)?.group(&index);
        let dedup = DedupSummary::from_groups(index.len(), &groups);
        debug!("{}", dedup.summary());

        let mut segmentation = EventSegmenter::from_config(&self.config)
            .with_clusterer(Arc::clone(&self.clusterer))
            .run(&inputs.records, &inputs.captions);
        report.extend(std::mem::take(&mut segmentation.report));

        let existing = ExistingLayout::scan(&self.staging_root)?;
        let plan = PlanBuilder::from_config(&self.config)
            .with_videos(inputs.videos.clone())
            .build(&groups, &segmentation, &inputs.labels, &existing)?;

        Ok(PlanOutcome {
            groups,
            dedup,
            segmentation,
            plan,
            report,
        })
    }

    /// Scan, analyse and plan the whole folder
    pub fn plan_directory(&self) -> Result<PlanOutcome> {
        self.plan_directory_with(LabelMap::default(), CaptionMap::default())
    }

    /// Like [`Declutter::plan_directory`], with externally supplied labels
    /// and captions
    pub fn plan_directory_with(&self, labels: LabelMap, captions: CaptionMap) -> Result<PlanOutcome> {
        let scan = self.scan()?;
        let (records, analysis_report) = self.analyze(&scan)?;
        let videos = scan.video_ids();
        let mut report = scan.report;
        report.extend(analysis_report);
        self.plan(&PlanInputs {
            records,
            labels,
            captions,
            videos,
            report,
        })
    }

    /// Execute a plan from the start
    pub fn apply(&self, plan: &Plan) -> Result<ExecutionReport> {
        self.apply_with_cancel(plan, CancelToken::new())
    }

    /// Execute a plan, stopping before the next move once `cancel` fires
    pub fn apply_with_cancel(&self, plan: &Plan, cancel: CancelToken) -> Result<ExecutionReport> {
        self.check_plan_root(plan)?;
        self.executor(cancel).execute(plan)
    }

    /// Continue a partly applied plan at its first unapplied move
    pub fn resume(&self, plan: &Plan, cancel: CancelToken) -> Result<ExecutionReport> {
        self.check_plan_root(plan)?;
        let start = executor::first_unapplied(plan, &self.journal);
        info!("Resuming plan at move {} of {}", start + 1, plan.len());
        self.executor(cancel).execute_from(plan, start)
    }

    fn executor(&self, cancel: CancelToken) -> Executor<'_> {
        let mut executor = Executor::new(&self.journal).with_cancel(cancel);
        if let Some(progress) = &self.progress {
            executor = executor.with_progress(Arc::clone(progress));
        }
        executor
    }

    fn check_plan_root(&self, plan: &Plan) -> Result<()> {
        if utils::normalize_lexically(&plan.staging_root) != self.staging_root {
            return Err(DeclutterError::PathEscape {
                path: plan.staging_root.clone(),
                root: self.staging_root.clone(),
            });
        }
        Ok(())
    }

    /// Every journal record, oldest first
    pub fn history(&self) -> Vec<MoveRecord> {
        self.journal.replay_log()
    }

    /// Undo one move by sequence number
    pub fn undo(&self, seq: u64) -> Result<MoveRecord> {
        let inverse = self.journal.undo_seq(seq)?;
        self.tidy_after_undo(std::slice::from_ref(&inverse));
        Ok(inverse)
    }

    /// Undo the most recent move still in effect
    pub fn undo_last(&self) -> Result<Option<MoveRecord>> {
        let inverse = self.journal.undo_last()?;
        if let Some(record) = &inverse {
            self.tidy_after_undo(std::slice::from_ref(record));
        }
        Ok(inverse)
    }

    /// Undo every move still in effect, newest first
    pub fn undo_all(&self) -> Result<Vec<MoveRecord>> {
        let undone = self.journal.undo_all()?;
        self.tidy_after_undo(&undone);
        Ok(undone)
    }

    /// Remove staging folders an undo left empty
    fn tidy_after_undo(&self, undone: &[MoveRecord]) {
        for record in undone {
            if let Some(folder) = record.source.parent() {
                match utils::prune_empty_parents(folder, &self.staging_root) {
                    Ok(n) if n > 0 => debug!("Removed {} empty staging folders", n),
                    Ok(_) => {}
                    Err(e) => warn!("Cannot tidy {:?}: {}", folder, e),
                }
            }
        }
    }

    /// Re-run reconciliation against the filesystem
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.journal.reconcile()
    }

    /// Result of the last reconciliation
    pub fn reconciliation(&self) -> ReconcileReport {
        self.journal.reconciliation()
    }

    /// Accept the current reconciliation findings and unblock execution
    pub fn acknowledge_inconsistencies(&self) -> Result<ReconcileReport> {
        self.journal.acknowledge_inconsistencies()
    }

    /// Drop journal records up to `seq`; those moves can no longer be undone
    pub fn prune_through(&self, seq: u64) -> Result<usize> {
        self.journal.prune_through(seq)
    }
}

/// Builder for configuring Declutter instances
///
/// Starts from [`DeclutterConfig::default`]; every setter overrides one field.
///
/// ```rust,no_run
/// use declutter::DeclutterBuilder;
/// use std::path::PathBuf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let declutter = DeclutterBuilder::new()
///     .thresholds(6, 20)
///     .gap_threshold_secs(12 * 3600)
///     .build(PathBuf::from("./Pictures"))?;
/// # Ok(())
/// # }
/// ```
pub struct DeclutterBuilder {
    config: DeclutterConfig,
    staging_root: Option<PathBuf>,
    clusterer: Option<Arc<dyn Clusterer>>,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for DeclutterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclutterBuilder")
            .field("config", &self.config)
            .field("staging_root", &self.staging_root)
            .finish()
    }
}

impl DeclutterBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: DeclutterConfig::default(),
            staging_root: None,
            clusterer: None,
            progress: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: DeclutterConfig) -> Self {
        self.config = config;
        self
    }

    /// Near and similar thresholds on the combined distance
    pub fn thresholds(mut self, near: u32, similar: u32) -> Self {
        self.config.near_threshold = near;
        self.config.similar_threshold = similar;
        self
    }

    /// Gap that splits two events, in seconds
    pub fn gap_threshold_secs(mut self, secs: i64) -> Self {
        self.config.gap_threshold_secs = secs;
        self
    }

    /// Smallest visual sub-cluster
    pub fn min_cluster_size(mut self, size: usize) -> Self {
        self.config.min_cluster_size = size;
        self
    }

    /// Glob patterns the scanner skips
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore_patterns = patterns;
        self
    }

    /// Number of imaging workers (minimum 1)
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    /// Stage somewhere other than `<root>/<staging_dir_name>`
    ///
    /// The staging root must still be inside the scanned folder.
    pub fn staging_root(mut self, path: PathBuf) -> Self {
        self.staging_root = Some(path);
        self
    }

    /// Use another clustering algorithm
    pub fn clusterer(mut self, clusterer: Arc<dyn Clusterer>) -> Self {
        self.clusterer = Some(clusterer);
        self
    }

    /// Progress callback for scanning, analysis and execution
    pub fn progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Build the instance
    ///
    /// # Errors
    ///
    /// - [`DeclutterError::InvalidConfiguration`] if the configuration does
    ///   not validate
    /// - [`DeclutterError::PathEscape`] if the staging root is outside `root`
    /// - [`DeclutterError::Io`] if `root` does not exist
    #[instrument(skip(self))]
    pub fn build(self, root: PathBuf) -> Result<Declutter> {
        self.config.validate()?;
        let root = root.canonicalize()?;
        let staging_root = match self.staging_root {
            Some(path) => utils::ensure_within(&utils::absolutize(&path)?, &root)?,
            None => utils::ensure_within(&root.join(&self.config.staging_dir_name), &root)?,
        };
        let journal = MoveJournal::open_in(&staging_root, &self.config.layout.reports)?;
        let clusterer: Arc<dyn Clusterer> = match self.clusterer {
            Some(clusterer) => clusterer,
            None => Arc::new(DensityClusterer::from_option(self.config.cluster_epsilon)),
        };

        info!("Opened {:?} (staging at {:?})", root, staging_root);
        Ok(Declutter {
            root,
            staging_root,
            config: self.config,
            journal,
            clusterer,
            progress: self.progress,
        })
    }
}

impl Default for DeclutterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
