//! Reconciling the move journal against the filesystem
//!
//! The journal records every move before the rename happens, so after a crash
//! the log can claim a move the filesystem never saw. Reconciliation replays
//! the log into "where each file should be now" and compares that with what is
//! actually on disk.
//!
//! ## What is detected
//!
//! For every location the log says is occupied:
//!
//! | On disk at expected location | On disk at previous location | Finding |
//! |---|---|---|
//! | missing | present | [`DiscrepancyKind::NotApplied`]: logged, never renamed |
//! | missing | missing | [`DiscrepancyKind::Lost`]: file moved outside declutter |
//! | present | present | [`DiscrepancyKind::BothPresent`]: something reappeared |
//!
//! Lines that do not parse as a record are reported as
//! [`DiscrepancyKind::Unparsable`].
//!
//! Nothing here repairs anything. The report is surfaced and mutation stays
//! blocked until the user acknowledges it; acknowledgements are persisted next
//! to the journal so they survive restarts.

use crate::error::Result;
use crate::journal::{MoveRecord, OperationKind};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Kind of disagreement between the log and the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// The record was appended but the file is still at its source
    NotApplied,
    /// The file is at neither end of the record
    Lost,
    /// Both ends of the record are occupied
    BothPresent,
    /// A journal line could not be parsed
    Unparsable,
}

/// One disagreement found during reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// What went wrong
    pub kind: DiscrepancyKind,
    /// Record the finding refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// 1-based journal line, for unparsable lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Location the log expects the file at (the journal itself for bad lines)
    pub path: PathBuf,
    /// Human readable detail
    pub detail: String,
    /// Whether the user already acknowledged this finding
    #[serde(default)]
    pub acknowledged: bool,
}

impl Discrepancy {
    fn key(&self) -> DiscrepancyKey {
        DiscrepancyKey {
            kind: self.kind,
            seq: self.seq,
            line: self.line,
            path: self.path.clone(),
        }
    }
}

/// Identity of a finding, as persisted in the acknowledgement file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscrepancyKey {
    kind: DiscrepancyKind,
    seq: Option<u64>,
    line: Option<usize>,
    path: PathBuf,
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records replayed
    pub records_checked: usize,
    /// Records excluded because an abort record voids them
    pub aborted_records: usize,
    /// Findings, ordered by record then kind
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconcileReport {
    /// Whether the log and the filesystem agree
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// Whether any finding still blocks mutation
    pub fn blocks_mutation(&self) -> bool {
        self.discrepancies.iter().any(|d| !d.acknowledged)
    }

    /// Findings not yet acknowledged
    pub fn unacknowledged(&self) -> impl Iterator<Item = &Discrepancy> {
        self.discrepancies.iter().filter(|d| !d.acknowledged)
    }

    /// Mark findings listed in `acknowledged` as acknowledged
    pub fn apply_acknowledgements(&mut self, acknowledged: &BTreeSet<DiscrepancyKey>) {
        for d in &mut self.discrepancies {
            d.acknowledged = acknowledged.contains(&d.key());
        }
    }

    /// Keys of every finding, for persisting an acknowledgement
    pub fn keys(&self) -> BTreeSet<DiscrepancyKey> {
        self.discrepancies.iter().map(Discrepancy::key).collect()
    }

    /// Get a summary of the reconciliation
    pub fn summary(&self) -> String {
        if self.is_consistent() {
            return format!("Journal is consistent ({} records checked)", self.records_checked);
        }
        let count = |kind| self.discrepancies.iter().filter(|d| d.kind == kind).count();
        let issues = [
            (DiscrepancyKind::NotApplied, "not applied"),
            (DiscrepancyKind::Lost, "lost"),
            (DiscrepancyKind::BothPresent, "both ends present"),
            (DiscrepancyKind::Unparsable, "unparsable lines"),
        ]
        .into_iter()
        .filter_map(|(kind, name)| {
            let n = count(kind);
            (n > 0).then(|| format!("{} {}", n, name))
        })
        .collect::<Vec<_>>()
        .join(", ");
        let pending = self.unacknowledged().count();
        format!(
            "Journal disagrees with the filesystem: {} ({} records checked, {} unacknowledged)",
            issues, self.records_checked, pending
        )
    }
}

/// A journal line that failed to parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparsableLine {
    /// 1-based line number
    pub line: usize,
    /// Parser error
    pub error: String,
}

/// Replay `records` and compare the expected layout with the filesystem
///
/// Records voided by an abort record are skipped. Abort records themselves
/// never move anything.
pub fn reconcile(journal_path: &Path, records: &[MoveRecord], unparsable: &[UnparsableLine]) -> ReconcileReport {
    let aborted: BTreeSet<u64> = records
        .iter()
        .filter(|r| r.kind == OperationKind::Abort)
        .filter_map(|r| r.reverses)
        .collect();

    // Expected occupant of each path, and paths expected to be empty
    let mut present: BTreeMap<PathBuf, &MoveRecord> = BTreeMap::new();
    let mut vacated: BTreeSet<PathBuf> = BTreeSet::new();
    let mut checked = 0;
    for record in records {
        if record.kind == OperationKind::Abort || aborted.contains(&record.seq) {
            continue;
        }
        checked += 1;
        present.remove(&record.source);
        vacated.insert(record.source.clone());
        vacated.remove(&record.destination);
        present.insert(record.destination.clone(), record);
    }

    let mut discrepancies = Vec::new();
    for (path, record) in &present {
        let here = exists(path);
        let source_vacated = vacated.contains(&record.source);
        let there = source_vacated && exists(&record.source);
        let finding = match (here, there) {
            (false, true) => Some((
                DiscrepancyKind::NotApplied,
                format!(
                    "record #{} moves {:?} here but the file is still at its source",
                    record.seq, record.source
                ),
            )),
            (false, false) => Some((
                DiscrepancyKind::Lost,
                format!("record #{} placed a file here but it is gone", record.seq),
            )),
            (true, true) => Some((
                DiscrepancyKind::BothPresent,
                format!(
                    "record #{} vacated {:?} but that path is occupied again",
                    record.seq, record.source
                ),
            )),
            (true, false) => None,
        };
        if let Some((kind, detail)) = finding {
            warn!("Reconciliation: {:?} at {:?}: {}", kind, path, detail);
            discrepancies.push(Discrepancy {
                kind,
                seq: Some(record.seq),
                line: None,
                path: path.clone(),
                detail,
                acknowledged: false,
            });
        }
    }

    for bad in unparsable {
        warn!("Reconciliation: journal line {} is unparsable: {}", bad.line, bad.error);
        discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::Unparsable,
            seq: None,
            line: Some(bad.line),
            path: journal_path.to_path_buf(),
            detail: bad.error.clone(),
            acknowledged: false,
        });
    }

    discrepancies.sort_by(|a, b| {
        (a.seq, a.line, a.kind, &a.path).cmp(&(b.seq, b.line, b.kind, &b.path))
    });
    debug!(
        "Reconciled {} records ({} aborted): {} discrepancies",
        checked,
        aborted.len(),
        discrepancies.len()
    );

    ReconcileReport {
        records_checked: checked,
        aborted_records: aborted.len(),
        discrepancies,
    }
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Load persisted acknowledgements; a missing file means none
pub fn load_acknowledgements(path: &Path) -> Result<BTreeSet<DiscrepancyKey>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

/// Persist acknowledgements atomically
pub fn save_acknowledgements(path: &Path, keys: &BTreeSet<DiscrepancyKey>) -> Result<()> {
    let json = serde_json::to_vec_pretty(keys)?;
    utils::atomic_write(path, &json)
}
