use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageResult {
    pub title: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnprocessedPage {
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub dry_run: bool,
    pub discovered: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub attachments: usize,
    pub pages: Vec<PageResult>,
    pub unprocessed: Vec<UnprocessedPage>,
    pub source_requests: usize,
    pub destination_requests: usize,
}

/// Pages that were discovered but never reached the destination, with the
/// reason. Safe to record from any worker.
#[derive(Debug, Default)]
pub struct UnprocessedLog {
    entries: Mutex<BTreeMap<String, String>>,
}

impl UnprocessedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, title: &str, reason: &str) {
        self.lock().insert(title.to_string(), reason.to_string());
    }

    pub fn reason_for(&self, title: &str) -> Option<String> {
        self.lock().get(title).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Entries in title order.
    pub fn entries(&self) -> Vec<UnprocessedPage> {
        self.lock()
            .iter()
            .map(|(title, reason)| UnprocessedPage {
                title: title.clone(),
                reason: reason.clone(),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Renders the line-oriented run report: one canonical title per line,
/// unprocessed titles annotated with their reason, trailing total.
pub fn render_page_inventory(titles: &[String], log: &UnprocessedLog) -> String {
    let mut out = String::new();
    for title in titles {
        out.push_str(title);
        if let Some(reason) = log.reason_for(title) {
            out.push_str("  [unprocessed: ");
            out.push_str(&reason);
            out.push(']');
        }
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&format!("total pages: {}\n", titles.len()));
    out
}

pub fn write_page_inventory(path: &Path, titles: &[String], log: &UnprocessedLog) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create report directory {}", parent.display())
            })?;
        }
    }
    fs::write(path, render_page_inventory(titles, log))
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    info!(path = %path.display(), pages = titles.len(), "wrote page inventory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn log_orders_entries_by_title() {
        let log = UnprocessedLog::new();
        log.record("Zebra", "conversion failed");
        log.record("Apple", "parent failed: Fruit");

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Apple");
        assert_eq!(entries[0].reason, "parent failed: Fruit");
        assert_eq!(entries[1].title, "Zebra");
    }

    #[test]
    fn later_reasons_replace_earlier_ones() {
        let log = UnprocessedLog::new();
        log.record("Home", "first");
        log.record("Home", "second");
        assert_eq!(log.len(), 1);
        assert_eq!(log.reason_for("Home"), Some("second".to_string()));
    }

    #[test]
    fn inventory_annotates_unprocessed_titles_and_counts() {
        let log = UnprocessedLog::new();
        log.record("Home/Setup", "parent failed: Home");
        let titles = vec![
            "About".to_string(),
            "Home".to_string(),
            "Home/Setup".to_string(),
        ];

        let rendered = render_page_inventory(&titles, &log);
        assert_eq!(
            rendered,
            "About\nHome\nHome/Setup  [unprocessed: parent failed: Home]\n\ntotal pages: 3\n"
        );
    }

    #[test]
    fn inventory_writes_through_missing_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reports").join("pages.txt");
        let log = UnprocessedLog::new();

        write_page_inventory(&path, &["Home".to_string()], &log).expect("write");

        let written = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(written, "Home\n\ntotal pages: 1\n");
    }
}
