//! Directory discovery
//!
//! Walks the photo folder and sorts every regular file into images, videos or
//! skipped (unsupported extension). Hidden entries, the staging folder and
//! anything matching an ignore pattern are never descended into. Symlinks are
//! not followed, so nothing outside the scanned tree is ever planned.
//!
//! Unreadable entries are reported per file and never abort the scan.
//!
//! ```rust,no_run
//! use declutter::config::DeclutterConfig;
//! use declutter::scanner::Scanner;
//! use std::path::Path;
//!
//! # fn main() -> declutter::Result<()> {
//! let result = Scanner::new(Path::new("/photos"), &DeclutterConfig::default())?.scan()?;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

use crate::config::DeclutterConfig;
use crate::error::Result;
use crate::types::{BatchReport, IssueStage, PhotoId, ProgressCallback, ProgressInfo};
use crate::utils;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Image extensions, lowercase without the dot
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "tiff", "tif", "bmp", "gif", "heic", "heif", "cr2", "cr3", "nef",
    "arw", "dng", "orf", "rw2", "raf", "pef", "srw",
];

/// Camera RAW extensions
pub const RAW_EXTENSIONS: &[&str] = &["cr2", "cr3", "nef", "arw", "dng", "orf", "rw2", "raf", "pef", "srw"];

/// HEIC/HEIF extensions
pub const HEIC_EXTENSIONS: &[&str] = &["heic", "heif"];

/// Video extensions; videos are staged but never analysed
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "wmv", "flv", "webm", "m4v", "3gp", "mts", "m2ts", "mpg", "mpeg",
    "vob",
];

/// Image or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still image
    Image,
    /// Video clip
    Video,
}

/// A supported file found by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    /// Absolute path
    pub id: PhotoId,
    /// Lowercase extension without the dot
    pub extension: String,
    /// File size
    pub size_bytes: u64,
    /// Image or video
    pub kind: MediaKind,
}

impl ScannedFile {
    /// Camera RAW file
    pub fn is_raw(&self) -> bool {
        RAW_EXTENSIONS.contains(&self.extension.as_str())
    }

    /// HEIC/HEIF file
    pub fn is_heic(&self) -> bool {
        HEIC_EXTENSIONS.contains(&self.extension.as_str())
    }
}

/// Outcome of a scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Folder that was scanned
    pub root: PathBuf,
    /// Images, sorted by path
    pub images: Vec<ScannedFile>,
    /// Videos, sorted by path
    pub videos: Vec<ScannedFile>,
    /// Files with an unsupported extension, sorted
    pub skipped: Vec<PathBuf>,
    /// Combined size of images and videos
    pub total_size_bytes: u64,
    /// Entries that could not be read
    pub report: BatchReport,
}

impl ScanResult {
    /// Images and videos found
    pub fn total_files(&self) -> usize {
        self.images.len() + self.videos.len()
    }

    /// Image count per extension
    pub fn format_breakdown(&self) -> BTreeMap<String, usize> {
        let mut breakdown = BTreeMap::new();
        for image in &self.images {
            *breakdown.entry(image.extension.clone()).or_default() += 1;
        }
        breakdown
    }

    /// Video identities, sorted
    pub fn video_ids(&self) -> Vec<PhotoId> {
        self.videos.iter().map(|v| v.id.clone()).collect()
    }

    /// Get a summary of the scan
    pub fn summary(&self) -> String {
        format!(
            "{} images, {} videos ({}), {} skipped",
            self.images.len(),
            self.videos.len(),
            utils::format_bytes(self.total_size_bytes),
            self.skipped.len()
        )
    }
}

/// Classify a path by extension
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Recursive media discovery under one root
pub struct Scanner {
    root: PathBuf,
    staging_root: PathBuf,
    ignore: GlobSet,
    progress: Option<ProgressCallback>,
}

impl Scanner {
    /// Scanner for `root` using the staging folder name and ignore patterns
    /// of `config`
    ///
    /// # Errors
    ///
    /// - [`crate::DeclutterError::Io`] if `root` cannot be resolved
    /// - [`crate::DeclutterError::InvalidPattern`] for a bad ignore pattern
    pub fn new(root: &Path, config: &DeclutterConfig) -> Result<Self> {
        let root = root.canonicalize()?;
        let staging_root = root.join(&config.staging_dir_name);
        Ok(Self {
            root,
            staging_root,
            ignore: build_globset(&config.ignore_patterns)?,
            progress: None,
        })
    }

    /// Skip `staging_root` instead of `<root>/<staging_dir_name>`
    pub fn with_staging_root(mut self, staging_root: &Path) -> Self {
        self.staging_root = staging_root
            .canonicalize()
            .unwrap_or_else(|_| utils::normalize_lexically(staging_root));
        self
    }

    /// Report progress per discovered file
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Resolved root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree
    #[instrument(skip(self), fields(root = ?self.root))]
    pub fn scan(&self) -> Result<ScanResult> {
        let mut result = ScanResult {
            root: self.root.clone(),
            ..Default::default()
        };

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.excluded(e.path()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!("Cannot read {:?}: {}", path, e);
                    result.report.push(path, IssueStage::Scan, e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.into_path();
            let Some(kind) = media_kind(&path) else {
                trace!("Skipping unsupported file {:?}", path);
                result.skipped.push(path);
                continue;
            };
            let size_bytes = match path.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", path, e);
                    result.report.push(&path, IssueStage::Scan, e.to_string());
                    continue;
                }
            };

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            result.total_size_bytes += size_bytes;
            let file = ScannedFile {
                id: PhotoId::new(path),
                extension,
                size_bytes,
                kind,
            };
            match kind {
                MediaKind::Image => result.images.push(file),
                MediaKind::Video => result.videos.push(file),
            }

            if let Some(progress) = &self.progress {
                progress(ProgressInfo {
                    operation: "Scanning".to_string(),
                    current_item: None,
                    processed: result.total_files(),
                    total: None,
                });
            }
        }

        result.images.sort_by(|a, b| a.id.cmp(&b.id));
        result.videos.sort_by(|a, b| a.id.cmp(&b.id));
        result.skipped.sort();

        debug!("Format breakdown: {:?}", result.format_breakdown());
        info!("Scanned {:?}: {}", self.root, result.summary());
        Ok(result)
    }

    fn excluded(&self, path: &Path) -> bool {
        if path == self.staging_root || utils::is_hidden(path) {
            return true;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.ignore.is_match(relative)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
