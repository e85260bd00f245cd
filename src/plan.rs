//! Plan building: from analysis results to an ordered list of proposed moves
//!
//! The plan builder is the only place where duplicate groups, event segments
//! and classification labels meet. It decides, for every photo, at most one
//! destination under the staging root and emits the moves in a fixed
//! aggregation order:
//!
//! 1. duplicates (every group member except the representative)
//! 2. classifications (high confidence, review queue, catch-all)
//! 3. events (segment folders, sub-cluster subfolders, unclustered bucket)
//! 4. undated photos
//! 5. videos
//!
//! A photo is claimed by the first phase that places it, so duplicate
//! placement wins over classification and both win over events. Building a
//! plan has no side effects; the same inputs always produce the same plan.
//!
//! ## Collisions
//!
//! Two photos named `IMG_0001.jpg` headed for the same folder must not
//! collide, and neither may a planned file and something already present in
//! the staging tree. The second claimant becomes `IMG_0001_1.jpg`, then
//! `_2`, and so on, in plan order. Names are compared case-insensitively, so
//! `IMG.JPG` and `img.jpg` never share a folder.
//!
//! ## Example
//!
//! ```rust,no_run
//! use declutter::plan::{ExistingLayout, PlanBuilder, LabelMap};
//! use declutter::events::Segmentation;
//! use std::path::Path;
//!
//! # fn main() -> declutter::Result<()> {
//! let existing = ExistingLayout::scan(Path::new("/photos/_declutter"))?;
//! let plan = PlanBuilder::default().build(&[], &Segmentation::default(), &LabelMap::default(), &existing)?;
//! println!("{}", plan.summary());
//! # Ok(())
//! # }
//! ```

use crate::collections::HashMap;
use crate::config::{ConfidenceBands, DeclutterConfig, StagingLayout};
use crate::error::{DeclutterError, Result};
use crate::events::{EventSegment, Segmentation, SubClusterKind};
use crate::grouping::{DuplicateGroup, Severity};
use crate::types::{Category, Classification, ConfidenceBand, PhotoId};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, trace};
use walkdir::WalkDir;

/// Classification labels by photo
pub type LabelMap = HashMap<PhotoId, Classification>;

/// Why a photo is being moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", content = "category", rename_all = "snake_case")]
pub enum ReasonTag {
    /// Member of an identical duplicate group
    IdenticalDuplicate,
    /// Member of a similar duplicate group
    SimilarDuplicate,
    /// High-confidence classification
    Classified(Category),
    /// Medium-confidence classification, queued for review
    Review(Category),
    /// Low-confidence classification
    CatchAll,
    /// Member of an event or one of its sub-clusters
    Event,
    /// Outlier of a subdivided event
    Unclustered,
    /// No capture time
    Undated,
    /// Video file
    Video,
}

impl ReasonTag {
    /// Aggregation phase; plans are ordered by it
    pub fn phase(&self) -> u8 {
        match self {
            ReasonTag::IdenticalDuplicate | ReasonTag::SimilarDuplicate => 0,
            ReasonTag::Classified(_) | ReasonTag::Review(_) | ReasonTag::CatchAll => 1,
            ReasonTag::Event | ReasonTag::Unclustered => 2,
            ReasonTag::Undated => 3,
            ReasonTag::Video => 4,
        }
    }
}

impl fmt::Display for ReasonTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonTag::IdenticalDuplicate => write!(f, "identical duplicate"),
            ReasonTag::SimilarDuplicate => write!(f, "similar duplicate"),
            ReasonTag::Classified(c) => write!(f, "classified as {}", c.folder_name()),
            ReasonTag::Review(c) => write!(f, "review ({})", c.folder_name()),
            ReasonTag::CatchAll => write!(f, "low confidence"),
            ReasonTag::Event => write!(f, "event"),
            ReasonTag::Unclustered => write!(f, "unclustered"),
            ReasonTag::Undated => write!(f, "undated"),
            ReasonTag::Video => write!(f, "video"),
        }
    }
}

/// One planned relocation; not yet journaled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedMove {
    /// Photo being moved (its current path)
    pub photo: PhotoId,
    /// Folder the photo goes to, under the staging root
    pub destination_folder: PathBuf,
    /// Full collision-free destination path
    pub destination: PathBuf,
    /// Why
    pub reason: ReasonTag,
}

impl ProposedMove {
    /// Source path of the move
    pub fn source(&self) -> &Path {
        self.photo.path()
    }
}

/// Paths already occupied under the staging root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingLayout {
    root: PathBuf,
    occupied: BTreeSet<PathBuf>,
}

impl ExistingLayout {
    /// Layout of an empty staging root
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            occupied: BTreeSet::new(),
        }
    }

    /// Layout from a known list of occupied paths
    pub fn from_paths(root: impl Into<PathBuf>, occupied: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            root: root.into(),
            occupied: occupied.into_iter().collect(),
        }
    }

    /// Walk the staging root and record every entry in it
    ///
    /// A missing root is an empty layout.
    pub fn scan(root: &Path) -> Result<Self> {
        let root = utils::absolutize(root)?;
        let mut layout = Self::empty(root.clone());
        if !root.exists() {
            return Ok(layout);
        }
        for entry in WalkDir::new(&root).min_depth(1) {
            layout.occupied.insert(entry?.into_path());
        }
        debug!("Staging root holds {} entries", layout.occupied.len());
        Ok(layout)
    }

    /// Staging root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is taken
    pub fn contains(&self, path: &Path) -> bool {
        self.occupied.contains(path)
    }

    /// Number of occupied paths
    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    /// Whether nothing is occupied
    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }
}

/// Ordered list of proposed moves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Staging root every destination lives under
    pub staging_root: PathBuf,
    /// Moves in execution order
    pub moves: Vec<ProposedMove>,
}

impl Plan {
    /// Number of moves
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// Whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Moves in execution order
    pub fn iter(&self) -> impl Iterator<Item = &ProposedMove> {
        self.moves.iter()
    }

    /// Move counts by reason
    pub fn counts(&self) -> BTreeMap<ReasonTag, usize> {
        let mut counts = BTreeMap::new();
        for m in &self.moves {
            *counts.entry(m.reason).or_default() += 1;
        }
        counts
    }

    /// Planned move for a photo, if any
    pub fn move_for(&self, photo: &PhotoId) -> Option<&ProposedMove> {
        self.moves.iter().find(|m| &m.photo == photo)
    }

    /// Get a summary of the plan
    pub fn summary(&self) -> String {
        if self.moves.is_empty() {
            return "Nothing to move".to_string();
        }
        let parts: Vec<String> = self
            .counts()
            .into_iter()
            .map(|(reason, n)| format!("{} {}", n, reason))
            .collect();
        format!("{} moves: {}", self.moves.len(), parts.join(", "))
    }
}

/// Builds plans for one staging layout
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    layout: StagingLayout,
    bands: ConfidenceBands,
    videos: Vec<PhotoId>,
}

impl PlanBuilder {
    /// Builder with explicit layout names and confidence bands
    pub fn new(layout: StagingLayout, bands: ConfidenceBands) -> Self {
        Self {
            layout,
            bands,
            videos: Vec::new(),
        }
    }

    /// Builder using the layout and bands of a configuration
    pub fn from_config(config: &DeclutterConfig) -> Self {
        Self::new(config.layout.clone(), config.confidence)
    }

    /// Also place these video files
    pub fn with_videos(mut self, videos: Vec<PhotoId>) -> Self {
        self.videos = videos;
        self
    }

    /// Build the plan
    ///
    /// # Errors
    ///
    /// - [`DeclutterError::PathEscape`] if a layout folder resolves outside
    ///   the staging root
    #[instrument(skip_all, fields(groups = groups.len(), segments = segmentation.segments.len(), labels = labels.len()))]
    pub fn build(
        &self,
        groups: &[DuplicateGroup],
        segmentation: &Segmentation,
        labels: &LabelMap,
        existing: &ExistingLayout,
    ) -> Result<Plan> {
        let mut state = PlanState::new(existing);
        let root = existing.root().to_path_buf();

        for group in groups {
            let (folder, reason) = match group.severity {
                Severity::Identical => (&self.layout.identical, ReasonTag::IdenticalDuplicate),
                Severity::Similar => (&self.layout.similar, ReasonTag::SimilarDuplicate),
            };
            let folder = self.folder(&root, folder)?;
            for photo in group.duplicates() {
                state.claim(photo, &folder, reason);
            }
        }
        debug!("Planned {} duplicate moves", state.moves.len());

        let mut labelled: Vec<(&PhotoId, &Classification)> = labels.iter().collect();
        labelled.sort_by(|a, b| a.0.cmp(b.0));
        for (photo, label) in labelled {
            let placement = match label.band(&self.bands) {
                ConfidenceBand::High if !label.category.is_staged() => None,
                ConfidenceBand::High => Some((
                    self.layout.classified.join(label.category.folder_name()),
                    ReasonTag::Classified(label.category),
                )),
                ConfidenceBand::Medium => Some((
                    self.layout.review.join(label.category.folder_name()),
                    ReasonTag::Review(label.category),
                )),
                ConfidenceBand::Low => Some((self.layout.catch_all.clone(), ReasonTag::CatchAll)),
            };
            if let Some((folder, reason)) = placement {
                let folder = self.folder(&root, &folder)?;
                state.claim(photo, &folder, reason);
            }
        }

        let events_root = self.folder(&root, &self.layout.events)?;
        let mut event_names = FolderNames::default();
        for segment in &segmentation.segments {
            let folder = events_root.join(event_names.unique(&segment.label));
            self.place_segment(&mut state, segment, &folder);
        }

        let undated = self.folder(&root, &self.layout.undated)?;
        for photo in &segmentation.undated {
            state.claim(photo, &undated, ReasonTag::Undated);
        }

        let videos = self.folder(&root, &self.layout.videos)?;
        let mut sorted_videos: Vec<&PhotoId> = self.videos.iter().collect();
        sorted_videos.sort();
        for video in sorted_videos {
            state.claim(video, &videos, ReasonTag::Video);
        }

        let plan = Plan {
            staging_root: root,
            moves: state.moves,
        };
        info!("{}", plan.summary());
        Ok(plan)
    }

    fn place_segment(&self, state: &mut PlanState, segment: &EventSegment, folder: &Path) {
        if !segment.is_subdivided() {
            for photo in segment.ids() {
                state.claim(photo, folder, ReasonTag::Event);
            }
            return;
        }

        let mut names = FolderNames::default();
        names.reserve(&self.layout.unclustered);
        for sub in &segment.sub_clusters {
            let (subfolder, reason) = match sub.kind {
                SubClusterKind::Cluster => (folder.join(names.unique(&sub.label)), ReasonTag::Event),
                SubClusterKind::Unclustered => (
                    folder.join(utils::sanitize_folder_name(&self.layout.unclustered)),
                    ReasonTag::Unclustered,
                ),
            };
            for photo in &sub.photos {
                state.claim(photo, &subfolder, reason);
            }
        }
    }

    /// Resolve a layout folder and check it stays under the root
    fn folder(&self, root: &Path, relative: &Path) -> Result<PathBuf> {
        utils::ensure_within(&root.join(relative), root)
    }
}

/// Build a plan with the default layout and confidence bands
pub fn build_plan(
    groups: &[DuplicateGroup],
    segmentation: &Segmentation,
    labels: &LabelMap,
    existing: &ExistingLayout,
) -> Result<Plan> {
    PlanBuilder::default().build(groups, segmentation, labels, existing)
}

struct PlanState {
    claimed: BTreeSet<PhotoId>,
    /// Case-folded destinations, existing entries included
    taken: BTreeSet<PathBuf>,
    moves: Vec<ProposedMove>,
}

impl PlanState {
    fn new(existing: &ExistingLayout) -> Self {
        Self {
            claimed: BTreeSet::new(),
            taken: existing.occupied.iter().map(|p| fold_case(p)).collect(),
            moves: Vec::new(),
        }
    }

    /// Place `photo` in `folder` unless an earlier phase already did
    fn claim(&mut self, photo: &PhotoId, folder: &Path, reason: ReasonTag) {
        if self.claimed.contains(photo) {
            trace!("{} already placed; skipping {}", photo, reason);
            return;
        }
        let Some(file_name) = photo.file_name() else {
            trace!("{} has no file name; skipping", photo);
            return;
        };

        let destination = self.free_name(folder, Path::new(file_name));
        self.claimed.insert(photo.clone());
        self.taken.insert(fold_case(&destination));
        self.moves.push(ProposedMove {
            photo: photo.clone(),
            destination_folder: folder.to_path_buf(),
            destination,
            reason,
        });
    }

    fn is_taken(&self, path: &Path) -> bool {
        self.taken.contains(&fold_case(path))
    }

    /// `folder/name`, or `folder/stem_N.ext` for the smallest free `N`
    fn free_name(&self, folder: &Path, name: &Path) -> PathBuf {
        let candidate = folder.join(name);
        if !self.is_taken(&candidate) {
            return candidate;
        }
        let stem = name.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        let extension = name.extension().map(|e| e.to_string_lossy());
        (1u64..)
            .map(|n| {
                let file = match &extension {
                    Some(ext) => format!("{}_{}.{}", stem, n, ext),
                    None => format!("{}_{}", stem, n),
                };
                folder.join(file)
            })
            .find(|p| !self.is_taken(p))
            .unwrap_or(candidate)
    }
}

/// Lowercase form of a path, so names that differ only in case collide the
/// way they do on case-insensitive filesystems
fn fold_case(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

/// Sanitized sibling folder names, made unique with a ` (N)` suffix
#[derive(Default)]
struct FolderNames {
    used: BTreeSet<String>,
}

impl FolderNames {
    fn reserve(&mut self, name: &str) {
        self.used.insert(utils::sanitize_folder_name(name).to_lowercase());
    }

    fn unique(&mut self, label: &str) -> String {
        let base = utils::sanitize_folder_name(label);
        let mut name = base.clone();
        let mut n = 2;
        while self.used.contains(&name.to_lowercase()) {
            name = format!("{} ({})", base, n);
            n += 1;
        }
        self.used.insert(name.to_lowercase());
        name
    }
}

/// Reject a plan whose destinations are not unique or not under its root
///
/// Plans loaded from disk go through this before execution.
pub fn validate_plan(plan: &Plan) -> Result<()> {
    let mut seen = BTreeSet::new();
    let mut photos = BTreeSet::new();
    for m in &plan.moves {
        utils::ensure_within(&m.destination, &plan.staging_root)?;
        if !seen.insert(fold_case(&m.destination)) {
            return Err(DeclutterError::DestinationConflict {
                path: m.destination.clone(),
            });
        }
        if !photos.insert(&m.photo) {
            return Err(DeclutterError::DuplicatePhoto(m.photo.path().to_path_buf()));
        }
    }
    Ok(())
}
