use std::path::Path;

use serde::Serialize;

use crate::primitives::wal::RecordBody;
use crate::types::{Lsn, PageId, TxnId};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::{AdminError, Result};

/// One decoded log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Record position.
    pub lsn: Lsn,
    /// Owning transaction; `t0` for checkpoint records.
    pub txn: TxnId,
    /// Previous record of the same transaction.
    pub prev_lsn: Lsn,
    /// Record kind.
    pub kind: &'static str,
    /// Payload summary; keys and values are hex-encoded.
    pub detail: String,
}

/// Records of the log from a starting LSN.
#[derive(Debug, Clone, Serialize)]
pub struct LogDump {
    /// First LSN requested.
    pub from: Lsn,
    /// Decoded records.
    pub records: Vec<LogEntry>,
    /// More records follow `limit`.
    pub truncated: bool,
}

/// One data page and its live records.
#[derive(Debug, Clone, Serialize)]
pub struct PageEntry {
    /// Page number.
    pub page: u64,
    /// `(slot, commit, key, value)` with hex-encoded key and value.
    pub rows: Vec<(u16, Lsn, String, String)>,
}

/// Data pages of one table.
#[derive(Debug, Clone, Serialize)]
pub struct PageDump {
    /// Table name.
    pub table: String,
    /// Dumped pages.
    pub pages: Vec<PageEntry>,
}

fn opt_hex(value: &Option<Vec<u8>>) -> String {
    value.as_ref().map_or_else(|| "-".to_string(), hex::encode)
}

fn describe(body: &RecordBody) -> String {
    match body {
        RecordBody::Begin { parent, flags } => format!("parent={parent} flags={flags:#04x}"),
        RecordBody::Commit { parent } => format!("parent={parent}"),
        RecordBody::Abort => String::new(),
        RecordBody::Put {
            table,
            key,
            before,
            after,
        } => format!(
            "table={table} key={} before={} after={}",
            hex::encode(key),
            opt_hex(before),
            hex::encode(after)
        ),
        RecordBody::Delete { table, key, before } => {
            format!("table={table} key={} before={}", hex::encode(key), opt_hex(before))
        }
        RecordBody::Update {
            table,
            key,
            extra,
            before,
            after,
        } => format!(
            "table={table} key={} extra={} before={} after={}",
            hex::encode(key),
            hex::encode(extra),
            opt_hex(before),
            opt_hex(after)
        ),
        RecordBody::UpdateBroadcast {
            table,
            extra,
            resetting,
            entries,
        } => format!(
            "table={table} extra={} resetting={resetting} entries={}",
            hex::encode(extra),
            entries.len()
        ),
        RecordBody::CheckpointBegin { prev_end } => format!("prev_end={prev_end}"),
        RecordBody::CheckpointEnd {
            begin,
            prev_end,
            active,
        } => {
            let active: Vec<String> = active
                .iter()
                .map(|a| format!("{}@{}", a.txn, a.first_lsn))
                .collect();
            format!("begin={begin} prev_end={prev_end} active=[{}]", active.join(","))
        }
        RecordBody::Compensate { undone } => format!("undone={undone}"),
    }
}

/// Decodes log records starting at `from`, at most `limit` of them.
///
/// The store is opened read-only so the dump shows the log as found.
pub fn dump_log(path: impl AsRef<Path>, opts: &AdminOpenOptions, from: Lsn, limit: usize) -> Result<LogDump> {
    let store = open_store(path.as_ref(), opts, true)?;
    let mut records = Vec::new();
    let mut truncated = false;
    for item in store.scan_log(from)? {
        let (lsn, record) = item?;
        if records.len() == limit {
            truncated = true;
            break;
        }
        records.push(LogEntry {
            lsn,
            txn: record.txn,
            prev_lsn: record.prev_lsn,
            kind: record.kind().name(),
            detail: describe(&record.body),
        });
    }
    store.close()?;
    Ok(LogDump {
        from,
        records,
        truncated,
    })
}

/// Dumps the live records of `table`'s data pages, or of one page.
pub fn dump_pages(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    table: &str,
    page: Option<u64>,
) -> Result<PageDump> {
    let store = open_store(path.as_ref(), opts, true)?;
    let id = store
        .table_id(table)
        .map_err(|_| AdminError::Message(format!("no table named {table:?}")))?;
    let range = store.data_pages(id)?;
    let pages: Vec<u64> = match page {
        Some(page) if range.contains(&page) => vec![page],
        Some(page) => {
            return Err(AdminError::Message(format!(
                "page {page} is not a data page of {table} ({}..{})",
                range.start, range.end
            )))
        }
        None => range.collect(),
    };
    let mut entries = Vec::with_capacity(pages.len());
    for page in pages {
        let rows = store
            .page_rows(id, PageId(page))?
            .into_iter()
            .map(|row| (row.slot, row.commit, hex::encode(row.key), hex::encode(row.value)))
            .collect();
        entries.push(PageEntry { page, rows });
    }
    store.close()?;
    Ok(PageDump {
        table: table.to_string(),
        pages: entries,
    })
}
