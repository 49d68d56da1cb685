use std::path::Path;

use serde::Serialize;

use crate::types::{ErrorKind, Lsn};

use crate::admin::error::AdminError;
use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Page checksums and fragment bookkeeping of every table.
    Fast,
    /// Everything `Fast` checks, plus a decode of every log record.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Tables examined.
    pub tables: u64,
    /// Data pages examined.
    pub pages: u64,
    /// Live records found on data pages.
    pub records: u64,
    /// Log records decoded (`Full` only).
    pub log_records: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the integrity of a store.
///
/// The store is opened read-only. A store whose files are too damaged to
/// open produces a failing report rather than an error.
///
/// # Errors
///
/// Returns an error if the store does not exist or an I/O operation fails
/// outside the structures being checked.
pub fn verify(path: impl AsRef<Path>, opts: &AdminOpenOptions, level: VerifyLevel) -> Result<VerifyReport> {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let store = match open_store(path.as_ref(), opts, true) {
        Ok(store) => store,
        Err(AdminError::Core(err)) if err.kind() == ErrorKind::Corrupt => {
            push_error(&mut findings, format!("store failed to open: {err}"));
            return Ok(VerifyReport {
                level,
                success: false,
                findings,
                counts,
            });
        }
        Err(err) => return Err(err),
    };

    for (name, table) in store.verify() {
        counts.tables += 1;
        counts.pages += table.pages;
        counts.records += table.records;
        for problem in table.problems {
            push_error(&mut findings, format!("table {name}: {problem}"));
        }
    }

    if matches!(level, VerifyLevel::Full) {
        for item in store.scan_log(Lsn::ZERO)? {
            match item {
                Ok(_) => counts.log_records += 1,
                Err(err) => {
                    push_error(&mut findings, format!("log: {err}"));
                    break;
                }
            }
        }
    }
    store.close()?;

    Ok(VerifyReport {
        level,
        success: findings.is_empty(),
        findings,
        counts,
    })
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::error(message));
    }
}
