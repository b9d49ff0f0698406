//! Three-way reconciliation of a session's working document with the
//! document currently on disk.
//!
//! `base` is what the session loaded (or last wrote), `local` is its working
//! copy and `remote` is what another session may have written since. For each
//! record:
//!
//! | base | local    | remote   | result                         |
//! |------|----------|----------|--------------------------------|
//! | -    | x        | -        | x                              |
//! | -    | -        | y        | y                              |
//! | b    | b        | y        | y                              |
//! | b    | x        | b        | x                              |
//! | b    | x        | -        | x (never dropped)              |
//! | *    | x        | y        | last writer wins, loser noted  |

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::document::Document;
use crate::record::{ConflictNote, Record, RecordId};

/// Result of a merge: the reconciled document and the conflicts resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub document: Document,
    pub conflicts: Vec<(RecordId, ConflictNote)>,
}

/// Reconcile `local` and `remote` against their common ancestor `base`.
///
/// The merged document keeps `remote`'s schema version and commit timestamp;
/// the durable writer stamps a new one when it is persisted.
pub fn merge(base: &Document, local: &Document, remote: &Document) -> MergeOutcome {
    let ids: BTreeSet<&RecordId> = local.records.keys().chain(remote.records.keys()).collect();

    let mut document = Document {
        schema_version: remote.schema_version.max(local.schema_version),
        records: Default::default(),
        document_updated_at: remote.document_updated_at,
    };
    let mut conflicts = Vec::new();

    for id in ids {
        let merged = match (base.get(id), local.get(id), remote.get(id)) {
            (_, Some(l), None) => l.clone(),
            (_, None, Some(r)) => r.clone(),
            (Some(b), Some(l), Some(r)) if l == b => r.clone(),
            (Some(b), Some(l), Some(r)) if r == b => l.clone(),
            (_, Some(l), Some(r)) => {
                let (winner, note) = resolve(l, r);
                if let Some(note) = note {
                    conflicts.push((id.clone(), note));
                }
                winner
            }
            (_, None, None) => continue,
        };
        document.records.insert(id.clone(), merged);
    }

    MergeOutcome {
        document,
        conflicts,
    }
}

/// Resolve a record changed on both sides.
fn resolve(local: &Record, remote: &Record) -> (Record, Option<ConflictNote>) {
    if local == remote {
        return (remote.clone(), None);
    }

    if local.same_annotation(remote) {
        // Same value reached independently; keep remote to avoid rewriting it.
        let mut kept = remote.clone();
        union_notes(&mut kept.conflicts, &local.conflicts);
        return (kept, None);
    }

    let local_wins = match local.updated_at.cmp(&remote.updated_at) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => local.annotator > remote.annotator,
    };
    let (winner, loser) = if local_wins {
        (local, remote)
    } else {
        (remote, local)
    };

    let mut merged = winner.clone();
    union_notes(&mut merged.conflicts, &loser.conflicts);
    let note = loser.conflict_note(winner);
    if !merged.conflicts.contains(&note) {
        merged.conflicts.push(note.clone());
    }
    (merged, Some(note))
}

fn union_notes(into: &mut Vec<ConflictNote>, from: &[ConflictNote]) {
    for note in from {
        if !into.contains(note) {
            into.push(note.clone());
        }
    }
    into.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.annotator.cmp(&b.annotator))
    });
}
