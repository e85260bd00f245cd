//! # Declutter - reversible photo library cleanup
//!
//! A planning and execution core that sorts a large photo folder into a
//! staging tree without ever deleting or overwriting anything.
//!
//! ## Overview
//!
//! Declutter looks at a folder of photos and proposes where each one should go:
//! - Near-duplicate copies go to `duplicates/identical` or `duplicates/similar`,
//!   keeping the best copy in place
//! - Screenshots, documents and receipts (labels supplied by an external
//!   classifier) go to `classified/`, `review/` or a catch-all, by confidence
//! - Everything else is grouped into events by capture time, and large events
//!   are split into visual sub-clusters
//!
//! Nothing moves until the plan is applied, and every move is journaled first
//! so it can be undone.
//!
//! ## Architecture
//!
//! - **Fingerprint Index**: a BK-tree over combined gradient + frequency
//!   perceptual hashes; radius queries prune by the triangle inequality
//! - **Duplicate Grouper**: connected components over "within threshold",
//!   graded identical or similar
//! - **Event Segmenter**: temporal gaps first, density clustering second
//! - **Plan Builder**: one ordered, collision-free list of proposed moves
//! - **Move Journal**: append-before-rename transaction log with undo and
//!   startup reconciliation
//!
//! Data flows one way: scan, fingerprint, index, group and segment, plan.
//! Only the journal touches the filesystem.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use declutter::Declutter;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let declutter = Declutter::open(PathBuf::from("./Pictures"))?;
//!
//! let outcome = declutter.plan_directory()?;
//! println!("{}", outcome.dedup.summary());
//! for proposed in outcome.plan.iter().take(10) {
//!     println!("{} -> {:?} ({})", proposed.photo, proposed.destination, proposed.reason);
//! }
//!
//! let report = declutter.apply(&outcome.plan)?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Precomputed Fingerprints
//!
//! ```rust,no_run
//! use declutter::{Declutter, PhotoManifest, PlanInputs};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let declutter = Declutter::open(PathBuf::from("./Pictures"))?;
//! let manifest = PhotoManifest::load(Path::new("manifest.json"))?;
//! let outcome = declutter.plan(&PlanInputs::from_manifest(&manifest))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety Guarantees
//!
//! - Moves are renames within one filesystem; a cross-device move is refused
//! - A move never overwrites; an occupied destination fails that one move
//! - Every destination is inside the staging root
//! - The journal record is durable before the rename happens
//! - On open, the journal is reconciled with the filesystem and any
//!   disagreement blocks further moves until acknowledged
//!
//! ## Error Handling
//!
//! All operations return `Result<T, DeclutterError>`. Per-photo problems
//! (undecodable image, missing timestamp) never abort a pass; they are
//! collected in a [`BatchReport`].
//!
//! ## Module Organization
//!
//! - [`index`], [`grouping`]: duplicate detection
//! - [`events`], [`clustering`]: event segmentation
//! - [`plan`]: plan building
//! - [`journal`], [`reconcile`], [`executor`]: safe execution and undo
//! - [`scanner`], [`imaging`]: inputs from disk
//! - [`config`], [`types`], [`error`]: shared definitions

pub mod clustering;
pub mod config;
pub mod declutter;
pub mod error;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod grouping;
pub mod imaging;
pub mod index;
pub mod journal;
pub mod plan;
pub mod reconcile;
pub mod scanner;
pub mod types;
pub mod utils;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use config::{DeclutterConfig, StagingLayout};
pub use declutter::{Declutter, DeclutterBuilder, PlanInputs, PlanOutcome};
pub use error::{DeclutterError, Result};
pub use events::{EventSegment, EventSegmenter, Segmentation};
pub use executor::{CancelToken, ExecutionReport};
pub use fingerprint::{CombineMode, Fingerprint, PerceptualHash};
pub use grouping::{DuplicateGroup, DuplicateGrouper, Severity};
pub use imaging::PhotoManifest;
pub use index::FingerprintIndex;
pub use journal::{MoveJournal, MoveRecord, OperationKind};
pub use plan::{build_plan, Plan, PlanBuilder, ProposedMove, ReasonTag};
pub use reconcile::ReconcileReport;
pub use types::*;
