//! Broadcast updates: the update callback applied to every row of a table.
//!
//! Rows are visited grouped by the data page holding their committed image,
//! in ascending page order, followed by rows that exist only as uncommitted
//! writes of the calling family. A non-resetting broadcast logs one
//! `UPDATE_BROADCAST` record per group carrying old and new images; a
//! resetting one logs a single record up front, since its outcome can be
//! recomputed from the callback alone.

use serde::Serialize;
use tracing::debug;

use super::config::UpdateCallback;
use super::table::Table;
use super::transaction::Transaction;
use crate::primitives::wal::{BroadcastEntry, RecordBody};
use crate::types::{Lsn, Result};

/// What a broadcast did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastSummary {
    /// Rows handed to the callback.
    pub visited: usize,
    /// Rows the callback deleted.
    pub deleted: usize,
    /// Page groups processed.
    pub groups: usize,
}

pub(crate) fn run(
    txn: &Transaction,
    table: &Table,
    extra: &[u8],
    resetting: bool,
    callback: &UpdateCallback,
) -> Result<BroadcastSummary> {
    let core = &txn.core;
    let ts = core.read_ts().unwrap_or(Lsn::MAX);
    let overlay = core.merged_overlay(table.id);

    let mut groups: Vec<Vec<(Vec<u8>, Vec<u8>)>> = table
        .rows_by_page(ts)
        .into_iter()
        .map(|(_, rows)| {
            rows.into_iter()
                .filter(|(key, _)| !overlay.contains_key(key))
                .collect::<Vec<_>>()
        })
        .filter(|rows| !rows.is_empty())
        .collect();
    let pending: Vec<(Vec<u8>, Vec<u8>)> = overlay
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect();
    if !pending.is_empty() {
        groups.push(pending);
    }

    if resetting {
        txn.log_rows(
            table.id,
            Some(RecordBody::UpdateBroadcast {
                table: table.id,
                extra: extra.to_vec(),
                resetting: true,
                entries: Vec::new(),
            }),
            std::iter::empty(),
        )?;
    }

    let mut summary = BroadcastSummary::default();
    for rows in groups {
        core.check_cancel()?;
        let mut entries = Vec::with_capacity(rows.len());
        for (key, old) in rows {
            core.check_cancel()?;
            let new = callback.call(&key, Some(&old), extra)?;
            if let Some(value) = &new {
                table.check_row(&key, value)?;
            } else {
                summary.deleted += 1;
            }
            entries.push(BroadcastEntry { key, old, new });
        }
        summary.visited += entries.len();
        summary.groups += 1;
        let applied: Vec<(Vec<u8>, Option<Vec<u8>>)> = entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.new.clone()))
            .collect();
        let body = (!resetting).then(|| RecordBody::UpdateBroadcast {
            table: table.id,
            extra: extra.to_vec(),
            resetting: false,
            entries,
        });
        txn.log_rows(table.id, body, applied)?;
    }
    debug!(
        txn = core.id.0,
        table = %table.name,
        visited = summary.visited,
        groups = summary.groups,
        resetting,
        "broadcast.done"
    );
    Ok(summary)
}
