//! Safe-move transaction log
//!
//! [`MoveJournal`] is the only code in the crate that changes where a file
//! lives. Every relocation goes through the same sequence:
//!
//! 1. Validate: the source is a regular file, the destination is free, the
//!    destination lies inside the staging root, and both ends share one
//!    filesystem (a cross-device move would need copy + delete, which is
//!    refused outright).
//! 2. Append a [`MoveRecord`] to the journal and `fsync` it.
//! 3. `rename(2)` the file.
//! 4. `fsync` the affected directories.
//!
//! If the rename fails after the append, an [`OperationKind::Abort`] record
//! voiding the move is appended so the log stays truthful without ever being
//! rewritten. A crash between steps 2 and 3 leaves a record the filesystem
//! never saw; [`reconcile`](crate::reconcile) finds it on the next open.
//!
//! ## Format
//!
//! The journal is JSON Lines, one record per line, so it can be read, grepped
//! and diffed by hand:
//!
//! ```text
//! {"seq":1,"kind":"move","source":"/p/IMG_1.jpg","destination":"/p/_declutter/events/2024-06-01/IMG_1.jpg","timestamp":"2024-06-02T10:00:00Z"}
//! {"seq":2,"kind":"undo","source":"/p/_declutter/events/2024-06-01/IMG_1.jpg","destination":"/p/IMG_1.jpg","timestamp":"2024-06-02T10:05:00Z","reverses":1}
//! ```
//!
//! ## Concurrency
//!
//! Operations lock both of their paths (in sorted order, so two operations
//! never deadlock) for the whole check-then-act sequence. The append itself is
//! serialised by the writer mutex. Moves on disjoint paths may therefore run
//! on several threads at once.
//!
//! ## Per-file states
//!
//! ```text
//! Untouched -> Proposed -> Moved -> UndoRequested -> RevertedToOriginal
//! ```
//!
//! `Proposed` and `UndoRequested` only exist while an operation is in flight.
//! Moving an already moved file again needs a fresh move from its *current*
//! location; the original path is gone and fails with `SourceMissing`.

use crate::collections::BuildHasher;
use crate::error::{DeclutterError, Result};
use crate::reconcile::{self, ReconcileReport, UnparsableLine};
use crate::utils;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// File name of the journal inside the reports folder
pub const JOURNAL_FILE: &str = "move_journal.jsonl";

/// File name of persisted reconciliation acknowledgements
pub const ACK_FILE: &str = "move_journal.ack.json";

fn is_cross_device(e: &std::io::Error) -> bool {
    // EXDEV
    cfg!(unix) && e.raw_os_error() == Some(18)
}

/// What a record did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Forward move into the staging root
    Move,
    /// Inverse of an earlier move
    Undo,
    /// Voids the record named in `reverses`; the rename never happened
    Abort,
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// Position in the journal, strictly increasing
    pub seq: u64,
    /// Operation kind
    pub kind: OperationKind,
    /// Where the file was
    pub source: PathBuf,
    /// Where the file went
    pub destination: PathBuf,
    /// When the record was appended
    pub timestamp: DateTime<Utc>,
    /// Record this one undoes or aborts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<u64>,
}

impl MoveRecord {
    /// Whether this is a forward move
    pub fn is_move(&self) -> bool {
        self.kind == OperationKind::Move
    }
}

/// Where a file stands in its move lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Never touched by the journal
    Untouched,
    /// Move validated and journaled, rename in progress
    Proposed,
    /// Relocated by a forward move
    Moved,
    /// Undo journaled, rename in progress
    UndoRequested,
    /// Returned to where it was before its last move
    RevertedToOriginal,
}

struct JournalWriter {
    file: File,
    next_seq: u64,
    needs_newline: bool,
}

/// Durable, append-only log of file moves
pub struct MoveJournal {
    staging_root: PathBuf,
    journal_path: PathBuf,
    ack_path: PathBuf,
    writer: Mutex<JournalWriter>,
    records: RwLock<Vec<MoveRecord>>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>, BuildHasher>,
    in_flight: DashMap<PathBuf, FileState, BuildHasher>,
    reconciliation: RwLock<ReconcileReport>,
}

impl std::fmt::Debug for MoveJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveJournal")
            .field("staging_root", &self.staging_root)
            .field("journal_path", &self.journal_path)
            .field("records", &self.records.read().len())
            .finish()
    }
}

impl MoveJournal {
    /// Open (or create) the journal for a staging root
    ///
    /// The journal lives at `<staging_root>/_reports/move_journal.jsonl`.
    /// Opening reconciles the log against the filesystem; any unacknowledged
    /// discrepancy blocks mutation until
    /// [`acknowledge_inconsistencies`](Self::acknowledge_inconsistencies).
    pub fn open(staging_root: &Path) -> Result<Self> {
        Self::open_in(staging_root, Path::new("_reports"))
    }

    /// Open with a custom reports folder, relative to the staging root
    #[instrument(skip_all, fields(staging = ?staging_root))]
    pub fn open_in(staging_root: &Path, reports_dir: &Path) -> Result<Self> {
        let staging_root = utils::absolutize(staging_root)?;
        let reports = utils::ensure_within(&staging_root.join(reports_dir), &staging_root)?;
        fs::create_dir_all(&reports)?;
        let journal_path = reports.join(JOURNAL_FILE);
        let ack_path = reports.join(ACK_FILE);

        let (records, unparsable, needs_newline) = read_journal(&journal_path)?;
        let next_seq = records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        let mut report = reconcile::reconcile(&journal_path, &records, &unparsable);
        report.apply_acknowledgements(&reconcile::load_acknowledgements(&ack_path)?);
        if report.blocks_mutation() {
            warn!("{}", report.summary());
        }

        info!(
            "Opened move journal with {} records at {:?}",
            records.len(),
            journal_path
        );
        Ok(Self {
            staging_root,
            journal_path,
            ack_path,
            writer: Mutex::new(JournalWriter {
                file,
                next_seq,
                needs_newline,
            }),
            records: RwLock::new(records),
            path_locks: DashMap::with_hasher(BuildHasher::default()),
            in_flight: DashMap::with_hasher(BuildHasher::default()),
            reconciliation: RwLock::new(report),
        })
    }

    /// Root every forward move must land under
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Path of the journal file
    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Move `source` to `destination` inside the staging root
    ///
    /// The record is durable before this returns `Ok`.
    ///
    /// # Errors
    ///
    /// - [`DeclutterError::LogInconsistency`] while reconciliation findings
    ///   are unacknowledged
    /// - [`DeclutterError::PathEscape`] if `destination` is outside the staging root
    /// - [`DeclutterError::SourceMissing`] if `source` is not a regular file
    /// - [`DeclutterError::DestinationConflict`] if `destination` exists
    /// - [`DeclutterError::AtomicRenameUnavailable`] across filesystems
    #[instrument(skip(self), fields(source = ?source, destination = ?destination))]
    pub fn propose_move(&self, source: &Path, destination: &Path) -> Result<MoveRecord> {
        self.ensure_unblocked()?;
        let source = utils::absolutize(source)?;
        let destination = utils::ensure_within(&utils::absolutize(destination)?, &self.staging_root)?;
        if source == self.journal_path {
            return Err(DeclutterError::SourceMissing { path: source });
        }

        self.relocate(OperationKind::Move, &source, &destination, None)
    }

    /// Reverse a forward move, appending an undo record
    ///
    /// The file must still be where `record` put it: a move that was followed
    /// by another move of the same file is rejected until the later one is
    /// undone.
    #[instrument(skip(self, record), fields(seq = record.seq))]
    pub fn undo(&self, record: &MoveRecord) -> Result<MoveRecord> {
        self.ensure_unblocked()?;
        if !record.is_move() {
            return Err(DeclutterError::UndoRejected(format!(
                "record #{} is a {:?} record; only moves can be undone",
                record.seq, record.kind
            )));
        }

        self.with_path_locks(&record.source, &record.destination, || {
            {
                let records = self.records.read();
                let logged = records
                    .iter()
                    .find(|r| r.seq == record.seq)
                    .ok_or(DeclutterError::RecordNotFound(record.seq))?;
                if logged != record {
                    return Err(DeclutterError::UndoRejected(format!(
                        "record #{} does not match the journal",
                        record.seq
                    )));
                }
                if let Some(reason) = undo_blocker(&records, record) {
                    return Err(DeclutterError::UndoRejected(reason));
                }
            }

            self.relocate_locked(
                OperationKind::Undo,
                &record.destination,
                &record.source,
                Some(record.seq),
            )
        })
    }

    /// Undo a forward move by sequence number
    pub fn undo_seq(&self, seq: u64) -> Result<MoveRecord> {
        let record = self
            .records
            .read()
            .iter()
            .find(|r| r.seq == seq)
            .cloned()
            .ok_or(DeclutterError::RecordNotFound(seq))?;
        self.undo(&record)
    }

    /// Undo the most recent forward move that is still in effect
    pub fn undo_last(&self) -> Result<Option<MoveRecord>> {
        let candidate = {
            let records = self.records.read();
            records
                .iter()
                .rev()
                .find(|r| r.is_move() && undo_blocker(&records, r).is_none())
                .cloned()
        };
        match candidate {
            Some(record) => self.undo(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Undo every move still in effect, newest first
    ///
    /// Stops at the first failure; undo records already appended stay.
    pub fn undo_all(&self) -> Result<Vec<MoveRecord>> {
        let mut undone = Vec::new();
        while let Some(inverse) = self.undo_last()? {
            undone.push(inverse);
        }
        info!("Undid {} moves", undone.len());
        Ok(undone)
    }

    /// Every record in journal order
    pub fn replay_log(&self) -> Vec<MoveRecord> {
        self.records.read().clone()
    }

    /// Forward moves neither aborted nor undone, in journal order
    pub fn active_moves(&self) -> Vec<MoveRecord> {
        let records = self.records.read();
        let reversed: BTreeSet<u64> = records
            .iter()
            .filter(|r| !r.is_move())
            .filter_map(|r| r.reverses)
            .collect();
        records
            .iter()
            .filter(|r| r.is_move() && !reversed.contains(&r.seq))
            .cloned()
            .collect()
    }

    /// Number of records in the journal
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the journal has no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Look up a record by sequence number
    pub fn record(&self, seq: u64) -> Option<MoveRecord> {
        self.records.read().iter().find(|r| r.seq == seq).cloned()
    }

    /// Lifecycle state of the file at (or originally at) `path`
    pub fn state_of(&self, path: &Path) -> FileState {
        let path = match utils::absolutize(path) {
            Ok(p) => p,
            Err(_) => return FileState::Untouched,
        };
        if let Some(state) = self.in_flight.get(&path) {
            return *state;
        }

        let records = self.records.read();
        let aborted: BTreeSet<u64> = records
            .iter()
            .filter(|r| r.kind == OperationKind::Abort)
            .filter_map(|r| r.reverses)
            .collect();
        let last = records.iter().rev().find(|r| {
            r.kind != OperationKind::Abort
                && !aborted.contains(&r.seq)
                && (r.source == path || r.destination == path)
        });
        match last.map(|r| r.kind) {
            None => FileState::Untouched,
            Some(OperationKind::Move) => FileState::Moved,
            Some(OperationKind::Undo) => FileState::RevertedToOriginal,
            Some(OperationKind::Abort) => FileState::Untouched,
        }
    }

    /// Re-run reconciliation against the filesystem
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let (records, unparsable, _) = read_journal(&self.journal_path)?;
        let mut report = reconcile::reconcile(&self.journal_path, &records, &unparsable);
        report.apply_acknowledgements(&reconcile::load_acknowledgements(&self.ack_path)?);
        *self.reconciliation.write() = report.clone();
        Ok(report)
    }

    /// Latest reconciliation result
    pub fn reconciliation(&self) -> ReconcileReport {
        self.reconciliation.read().clone()
    }

    /// Accept every current finding and unblock mutation
    ///
    /// The acknowledgement is persisted; the findings themselves are not
    /// repaired.
    pub fn acknowledge_inconsistencies(&self) -> Result<ReconcileReport> {
        let mut report = self.reconciliation.write();
        let mut keys = reconcile::load_acknowledgements(&self.ack_path)?;
        keys.extend(report.keys());
        reconcile::save_acknowledgements(&self.ack_path, &keys)?;
        report.apply_acknowledgements(&keys);
        info!(
            "Acknowledged {} journal discrepancies",
            report.discrepancies.len()
        );
        Ok(report.clone())
    }

    /// Drop every record up to and including `seq`
    ///
    /// Only ever done on explicit request. Pruned moves can no longer be
    /// undone. The journal is rewritten atomically.
    #[instrument(skip(self))]
    pub fn prune_through(&self, seq: u64) -> Result<usize> {
        self.ensure_unblocked()?;
        let mut writer = self.writer.lock();
        let mut records = self.records.write();

        let before = records.len();
        records.retain(|r| r.seq > seq);
        let removed = before - records.len();

        let mut content = Vec::new();
        for record in records.iter() {
            serde_json::to_writer(&mut content, record)?;
            content.push(b'\n');
        }
        utils::atomic_write(&self.journal_path, &content)?;
        writer.file = OpenOptions::new().append(true).open(&self.journal_path)?;
        writer.needs_newline = false;

        info!("Pruned {} journal records through #{}", removed, seq);
        Ok(removed)
    }

    fn ensure_unblocked(&self) -> Result<()> {
        let report = self.reconciliation.read();
        if report.blocks_mutation() {
            return Err(DeclutterError::inconsistency(report.summary()));
        }
        Ok(())
    }

    /// Run `f` holding the locks of both paths, taken in sorted order
    ///
    /// A lock entry is dropped again once no other caller holds or waits on it.
    fn with_path_locks<T>(&self, a: &Path, b: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut paths = vec![a.to_path_buf(), b.to_path_buf()];
        paths.sort();
        paths.dedup();
        let locks: Vec<Arc<Mutex<()>>> = paths
            .iter()
            .map(|p| {
                self.path_locks
                    .entry(p.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            })
            .collect();
        let result = {
            let _guards: Vec<_> = locks.iter().map(|l| l.lock()).collect();
            f()
        };
        drop(locks);
        for path in &paths {
            self.path_locks
                .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }

    fn relocate(
        &self,
        kind: OperationKind,
        source: &Path,
        destination: &Path,
        reverses: Option<u64>,
    ) -> Result<MoveRecord> {
        self.with_path_locks(source, destination, || {
            self.relocate_locked(kind, source, destination, reverses)
        })
    }

    /// Check, journal, rename. Caller holds both path locks.
    fn relocate_locked(
        &self,
        kind: OperationKind,
        source: &Path,
        destination: &Path,
        reverses: Option<u64>,
    ) -> Result<MoveRecord> {
        if kind == OperationKind::Move {
            utils::ensure_no_symlinks(destination, &self.staging_root)?;
        }
        match fs::symlink_metadata(source) {
            Ok(meta) if meta.file_type().is_file() => {}
            _ => {
                return Err(DeclutterError::SourceMissing {
                    path: source.to_path_buf(),
                })
            }
        }
        if fs::symlink_metadata(destination).is_ok() {
            return Err(DeclutterError::DestinationConflict {
                path: destination.to_path_buf(),
            });
        }

        let parent = destination
            .parent()
            .ok_or_else(|| DeclutterError::internal(format!("{:?} has no parent", destination)))?;
        fs::create_dir_all(parent)?;
        if !utils::same_device(source, parent)? {
            return Err(DeclutterError::AtomicRenameUnavailable {
                source_path: source.to_path_buf(),
                destination: destination.to_path_buf(),
            });
        }

        let transient = match kind {
            OperationKind::Undo => FileState::UndoRequested,
            _ => FileState::Proposed,
        };
        self.in_flight.insert(source.to_path_buf(), transient);
        let result = self.journal_and_rename(kind, source, destination, reverses);
        self.in_flight.remove(source);
        result
    }

    fn journal_and_rename(
        &self,
        kind: OperationKind,
        source: &Path,
        destination: &Path,
        reverses: Option<u64>,
    ) -> Result<MoveRecord> {
        let record = self.append(kind, source, destination, reverses)?;

        if let Err(e) = fs::rename(source, destination) {
            warn!("Rename for record #{} failed: {}", record.seq, e);
            self.append(OperationKind::Abort, source, destination, Some(record.seq))?;
            if is_cross_device(&e) {
                return Err(DeclutterError::AtomicRenameUnavailable {
                    source_path: source.to_path_buf(),
                    destination: destination.to_path_buf(),
                });
            }
            return Err(e.into());
        }

        sync_after_rename(record.seq, [destination.parent(), source.parent()].into_iter().flatten());

        info!(
            "{:?} #{}: {:?} -> {:?}",
            record.kind, record.seq, record.source, record.destination
        );
        Ok(record)
    }

    fn append(
        &self,
        kind: OperationKind,
        source: &Path,
        destination: &Path,
        reverses: Option<u64>,
    ) -> Result<MoveRecord> {
        let mut writer = self.writer.lock();
        let record = MoveRecord {
            seq: writer.next_seq,
            kind,
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            timestamp: Utc::now(),
            reverses,
        };

        let mut line = Vec::with_capacity(256);
        if writer.needs_newline {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &record)?;
        line.push(b'\n');
        writer.file.write_all(&line)?;
        writer.file.sync_data()?;

        writer.needs_newline = false;
        writer.next_seq += 1;
        self.records.write().push(record.clone());
        trace!("Appended journal record #{}", record.seq);
        Ok(record)
    }
}

/// Why `record` cannot be undone right now, if it cannot
fn undo_blocker(records: &[MoveRecord], record: &MoveRecord) -> Option<String> {
    let mut aborted = false;
    for later in records.iter().filter(|r| r.seq > record.seq) {
        match later.kind {
            OperationKind::Abort if later.reverses == Some(record.seq) => aborted = true,
            OperationKind::Undo if later.reverses == Some(record.seq) => {
                return Some(format!(
                    "record #{} was already undone by #{}",
                    record.seq, later.seq
                ))
            }
            _ => {}
        }
    }
    if aborted {
        return Some(format!("record #{} was aborted; nothing to undo", record.seq));
    }

    // A later move of the same file must be undone first
    let voided: BTreeSet<u64> = records
        .iter()
        .filter(|r| r.kind == OperationKind::Abort)
        .filter_map(|r| r.reverses)
        .collect();
    let undone: BTreeSet<u64> = records
        .iter()
        .filter(|r| r.kind == OperationKind::Undo)
        .filter_map(|r| r.reverses)
        .collect();
    records
        .iter()
        .find(|r| {
            r.seq > record.seq
                && r.is_move()
                && r.source == record.destination
                && !voided.contains(&r.seq)
                && !undone.contains(&r.seq)
        })
        .map(|r| {
            format!(
                "file was moved again by #{}; undo that record first",
                r.seq
            )
        })
}

/// Parse the journal, collecting unparsable lines instead of failing
fn read_journal(path: &Path) -> Result<(Vec<MoveRecord>, Vec<UnparsableLine>, bool)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), Vec::new(), false))
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut unparsable = Vec::new();
    let mut buf = String::new();
    let mut line_no = 0;
    let mut ends_with_newline = true;
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        ends_with_newline = buf.ends_with('\n');
        let text = buf.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<MoveRecord>(text) {
            Ok(record) => records.push(record),
            Err(e) => unparsable.push(UnparsableLine {
                line: line_no,
                error: e.to_string(),
            }),
        }
    }

    debug!(
        "Read {} journal records ({} unparsable lines)",
        records.len(),
        unparsable.len()
    );
    Ok((records, unparsable, !ends_with_newline))
}

/// Sync the directories touched by a completed rename
///
/// The file has moved and its record is durable by now, so a failed sync is
/// logged rather than turned into an error.
fn sync_after_rename<'p>(seq: u64, dirs: impl IntoIterator<Item = &'p Path>) {
    for dir in dirs {
        if let Err(e) = utils::sync_dir(dir) {
            warn!("Could not sync {:?} after record #{}: {}", dir, seq, e);
        }
    }
}
