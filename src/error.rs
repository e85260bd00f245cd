//! Error types for the declutter library
//!
//! This module defines every error that can surface while planning or
//! executing a declutter pass. The variants fall into three groups that the
//! rest of the crate treats differently:
//!
//! - **Per-photo issues** (`CorruptFingerprint`, `MissingTimestamp`): the photo
//!   is excluded from one stage and reported in a batch summary; the run goes on.
//! - **Per-move failures** (`SourceMissing`, `DestinationConflict`, `PathEscape`,
//!   `AtomicRenameUnavailable`): fatal to a single move, never to the plan.
//! - **Execution stoppers** (`LogInconsistency`): the move journal disagrees with
//!   the filesystem and no further mutation is allowed until acknowledged.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the declutter library
pub type Result<T> = std::result::Result<T, DeclutterError>;

/// Main error type for all declutter operations
#[derive(Debug, Error)]
pub enum DeclutterError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Source of a move does not exist or is not a regular file
    #[error("Source missing: {path:?}")]
    SourceMissing {
        /// Path that was expected to hold the file
        path: PathBuf,
    },

    /// Destination of a move is already occupied
    #[error("Destination already exists: {path:?}")]
    DestinationConflict {
        /// Occupied destination path
        path: PathBuf,
    },

    /// Destination resolves outside the staging root
    #[error("Path {path:?} escapes the staging root {root:?}")]
    PathEscape {
        /// Offending destination
        path: PathBuf,
        /// Root all destinations must descend from
        root: PathBuf,
    },

    /// Fingerprint is empty, malformed, or of the wrong width
    #[error("Corrupt fingerprint for {photo:?}: {reason}")]
    CorruptFingerprint {
        /// Photo the fingerprint belongs to
        photo: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Photo has no capture timestamp and cannot be placed on the timeline
    #[error("Missing capture timestamp: {photo:?}")]
    MissingTimestamp {
        /// Photo without a timestamp
        photo: PathBuf,
    },

    /// The durable move log disagrees with the filesystem
    #[error("Move log inconsistency: {0}")]
    LogInconsistency(String),

    /// Source and destination live on different filesystems
    #[error("Atomic rename unavailable from {source_path:?} to {destination:?}")]
    AtomicRenameUnavailable {
        /// File that would have been moved
        source_path: PathBuf,
        /// Where it would have gone
        destination: PathBuf,
    },

    /// An undo request does not match the file's current history
    #[error("Undo rejected: {0}")]
    UndoRejected(String),

    /// No move record with the given sequence number
    #[error("Move record not found: #{0}")]
    RecordNotFound(u64),

    /// The same photo identity was inserted twice
    #[error("Photo already indexed: {0:?}")]
    DuplicatePhoto(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Execution stopped by a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Pattern parsing error
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeclutterError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        DeclutterError::Internal(msg.into())
    }

    /// Create a log inconsistency error with a custom message
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        DeclutterError::LogInconsistency(msg.into())
    }

    /// Create a corrupt fingerprint error
    pub fn corrupt_fingerprint(photo: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DeclutterError::CorruptFingerprint {
            photo: photo.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error only concerns one photo and belongs in a batch report
    pub fn is_per_photo(&self) -> bool {
        matches!(
            self,
            DeclutterError::CorruptFingerprint { .. }
                | DeclutterError::MissingTimestamp { .. }
                | DeclutterError::Image(_)
        )
    }

    /// Whether the error aborts a single move while the plan keeps going
    pub fn is_move_fatal(&self) -> bool {
        matches!(
            self,
            DeclutterError::SourceMissing { .. }
                | DeclutterError::DestinationConflict { .. }
                | DeclutterError::PathEscape { .. }
                | DeclutterError::AtomicRenameUnavailable { .. }
                | DeclutterError::UndoRejected(_)
                | DeclutterError::Io(_)
        )
    }

    /// Whether execution must stop entirely
    pub fn halts_execution(&self) -> bool {
        matches!(
            self,
            DeclutterError::LogInconsistency(_) | DeclutterError::Cancelled
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            DeclutterError::SourceMissing { path } => {
                format!("{:?} is gone. It may have been moved outside declutter; re-scan before planning again.", path)
            }
            DeclutterError::DestinationConflict { path } => {
                format!("{:?} already exists. Nothing was overwritten; re-plan to pick a free name.", path)
            }
            DeclutterError::PathEscape { path, root } => {
                format!("Refusing to place {:?} outside the staging folder {:?}.", path, root)
            }
            DeclutterError::AtomicRenameUnavailable { source_path, destination } => {
                format!(
                    "{:?} and {:?} are on different filesystems. Declutter never copies files; \
                     choose a staging folder on the same disk.",
                    source_path, destination
                )
            }
            DeclutterError::LogInconsistency(msg) => {
                format!(
                    "The move journal does not match the files on disk ({}). \
                     Run 'declutter reconcile', fix the listed paths, then 'declutter acknowledge'.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeclutterError::RecordNotFound(42);
        assert_eq!(err.to_string(), "Move record not found: #42");
    }

    #[test]
    fn test_error_classes_are_disjoint() {
        let per_photo = DeclutterError::MissingTimestamp {
            photo: PathBuf::from("/a.jpg"),
        };
        assert!(per_photo.is_per_photo());
        assert!(!per_photo.is_move_fatal());
        assert!(!per_photo.halts_execution());

        let conflict = DeclutterError::DestinationConflict {
            path: PathBuf::from("/b.jpg"),
        };
        assert!(conflict.is_move_fatal());
        assert!(!conflict.halts_execution());

        let log = DeclutterError::inconsistency("record #3 not applied");
        assert!(log.halts_execution());
        assert!(!log.is_move_fatal());
    }

    #[test]
    fn test_user_message_mentions_reconcile() {
        let err = DeclutterError::inconsistency("x");
        assert!(err.user_message().contains("reconcile"));
    }
}
