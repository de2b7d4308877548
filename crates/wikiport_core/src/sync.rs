use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::confluence::{ConfluenceApi, ConfluenceError};
use crate::retry::RetryPolicy;
use crate::titles;
use crate::wiki::WikiApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedPage {
    pub page_id: Option<String>,
    pub action: String,
}

#[derive(Debug, Clone, Default)]
pub struct AttachmentSummary {
    pub transferred: usize,
    pub failures: Vec<String>,
}

/// Creates or updates one destination page under `parent_id`, retrying per
/// policy. The whole lookup-then-write runs inside each attempt, so a
/// duplicate-create race fails once, then the retried lookup finds the
/// winner's page and updates it instead.
pub fn upsert_page<C: ConfluenceApi>(
    api: &mut C,
    retry: &RetryPolicy,
    space: &str,
    canonical_title: &str,
    body: &str,
    parent_id: &str,
    dry_run: bool,
) -> Result<SyncedPage, ConfluenceError> {
    let title = titles::display_title(canonical_title);
    retry.run(
        |_| {
            let existing = api.find_page(space, &title)?;
            if dry_run {
                return Ok(match existing {
                    Some(handle) => SyncedPage {
                        page_id: Some(handle.id),
                        action: "would_update".to_string(),
                    },
                    None => SyncedPage {
                        page_id: None,
                        action: "would_create".to_string(),
                    },
                });
            }
            match existing {
                Some(handle) => {
                    let id = api.update_page(
                        &handle.id,
                        &title,
                        body,
                        Some(parent_id),
                        handle.version + 1,
                    )?;
                    Ok(SyncedPage {
                        page_id: Some(id),
                        action: "updated".to_string(),
                    })
                }
                None => {
                    let id = api.create_page(space, &title, body, Some(parent_id))?;
                    Ok(SyncedPage {
                        page_id: Some(id),
                        action: "created".to_string(),
                    })
                }
            }
        },
        ConfluenceError::class,
    )
}

/// Copies every source attachment of `canonical_title` onto the destination
/// page. Individual failures are recorded and do not undo the page sync. In
/// dry-run mode attachments are listed but never downloaded or uploaded, and
/// the count reflects what a real run would transfer.
pub fn transfer_attachments<W: WikiApi, C: ConfluenceApi>(
    wiki: &mut W,
    api: &mut C,
    retry: &RetryPolicy,
    canonical_title: &str,
    page_id: &str,
    dry_run: bool,
) -> AttachmentSummary {
    let mut summary = AttachmentSummary::default();
    let attachments = match wiki.list_attachments(canonical_title) {
        Ok(attachments) => attachments,
        Err(error) => {
            warn!(title = canonical_title, %error, "failed to list attachments");
            summary
                .failures
                .push(format!("failed to list attachments: {error}"));
            return summary;
        }
    };

    for attachment in attachments {
        if dry_run {
            info!(
                title = canonical_title,
                name = attachment.name,
                "would transfer attachment"
            );
            summary.transferred += 1;
            continue;
        }
        let data = match wiki.download_attachment(&attachment.name) {
            Ok(data) => data,
            Err(error) => {
                warn!(name = attachment.name, %error, "attachment download failed");
                summary
                    .failures
                    .push(format!("{}: download failed: {error}", attachment.name));
                continue;
            }
        };
        let upload = retry.run(
            |_| api.attach_file(page_id, &attachment.name, &data),
            ConfluenceError::class,
        );
        match upload {
            Ok(()) => summary.transferred += 1,
            Err(error) => {
                warn!(name = attachment.name, %error, "attachment upload failed");
                summary
                    .failures
                    .push(format!("{}: {}", attachment.name, failure_reason(&error)));
            }
        }
    }
    summary
}

/// Non-mutating probe of the configured destination root. Runs before any
/// write; a missing root makes the whole run fatal.
pub fn verify_destination_root<C: ConfluenceApi>(
    api: &mut C,
    retry: &RetryPolicy,
    root_page_id: &str,
) -> Result<()> {
    let exists = retry
        .run(|_| api.page_exists(root_page_id), ConfluenceError::class)
        .map_err(anyhow::Error::new)?;
    if !exists {
        bail!("destination root page {root_page_id} does not exist");
    }
    info!(root_page_id, "verified destination root");
    Ok(())
}

/// Recognized reason for a failed destination call, falling back to the raw
/// error text.
pub fn failure_reason(error: &ConfluenceError) -> String {
    match error.permanent_reason() {
        Some(reason) => reason.to_string(),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;

    use anyhow::bail;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::confluence::RemotePageHandle;
    use crate::wiki::WikiAttachment;

    fn status_error(status: u16, message: &str) -> ConfluenceError {
        ConfluenceError::Status {
            status,
            message: message.to_string(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            exponential: false,
        }
    }

    #[derive(Debug, Clone)]
    struct StoredPage {
        id: String,
        version: u32,
        body: String,
        parent: Option<String>,
    }

    #[derive(Default)]
    struct MockConfluence {
        pages: BTreeMap<String, StoredPage>,
        attachments: BTreeMap<String, Vec<String>>,
        create_failures: VecDeque<ConfluenceError>,
        attach_failures: VecDeque<ConfluenceError>,
        race_create_once: bool,
        next_id: usize,
        find_calls: usize,
        create_calls: usize,
        update_calls: usize,
        attach_calls: usize,
        requests: usize,
    }

    impl MockConfluence {
        fn allocate_id(&mut self) -> String {
            self.next_id += 1;
            format!("{}", 100 + self.next_id)
        }
    }

    impl ConfluenceApi for MockConfluence {
        fn find_page(
            &mut self,
            _space: &str,
            title: &str,
        ) -> Result<Option<RemotePageHandle>, ConfluenceError> {
            self.requests += 1;
            self.find_calls += 1;
            Ok(self.pages.get(title).map(|page| RemotePageHandle {
                id: page.id.clone(),
                version: page.version,
            }))
        }

        fn create_page(
            &mut self,
            _space: &str,
            title: &str,
            body: &str,
            parent_id: Option<&str>,
        ) -> Result<String, ConfluenceError> {
            self.requests += 1;
            self.create_calls += 1;
            if let Some(error) = self.create_failures.pop_front() {
                return Err(error);
            }
            if self.race_create_once {
                self.race_create_once = false;
                let id = self.allocate_id();
                self.pages.insert(
                    title.to_string(),
                    StoredPage {
                        id,
                        version: 1,
                        body: "racing writer".to_string(),
                        parent: parent_id.map(str::to_string),
                    },
                );
                return Err(status_error(
                    400,
                    "A page with this title already exists in the space",
                ));
            }
            let id = self.allocate_id();
            self.pages.insert(
                title.to_string(),
                StoredPage {
                    id: id.clone(),
                    version: 1,
                    body: body.to_string(),
                    parent: parent_id.map(str::to_string),
                },
            );
            Ok(id)
        }

        fn update_page(
            &mut self,
            id: &str,
            title: &str,
            body: &str,
            parent_id: Option<&str>,
            version: u32,
        ) -> Result<String, ConfluenceError> {
            self.requests += 1;
            self.update_calls += 1;
            let Some(page) = self.pages.get_mut(title) else {
                return Err(status_error(404, "no content with that title"));
            };
            if page.id != id {
                return Err(status_error(404, "id mismatch"));
            }
            page.version = version;
            page.body = body.to_string();
            page.parent = parent_id.map(str::to_string);
            Ok(page.id.clone())
        }

        fn attach_file(
            &mut self,
            id: &str,
            name: &str,
            _data: &[u8],
        ) -> Result<(), ConfluenceError> {
            self.requests += 1;
            self.attach_calls += 1;
            if let Some(error) = self.attach_failures.pop_front() {
                return Err(error);
            }
            self.attachments
                .entry(id.to_string())
                .or_default()
                .push(name.to_string());
            Ok(())
        }

        fn page_exists(&mut self, id: &str) -> Result<bool, ConfluenceError> {
            self.requests += 1;
            Ok(self.pages.values().any(|page| page.id == id))
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    struct AttachmentWiki {
        attachments: Vec<String>,
        missing_downloads: Vec<String>,
        requests: usize,
    }

    impl WikiApi for AttachmentWiki {
        fn list_all_titles(&mut self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn get_raw_content(&mut self, _title: &str) -> Result<String> {
            Ok(String::new())
        }

        fn render_to_html(&mut self, _raw: &str) -> Result<String> {
            Ok(String::new())
        }

        fn list_links(&mut self, _title: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn list_attachments(&mut self, _title: &str) -> Result<Vec<WikiAttachment>> {
            self.requests += 1;
            Ok(self
                .attachments
                .iter()
                .map(|name| WikiAttachment { name: name.clone() })
                .collect())
        }

        fn download_attachment(&mut self, name: &str) -> Result<Vec<u8>> {
            self.requests += 1;
            if self.missing_downloads.iter().any(|missing| missing == name) {
                bail!("attachment {name} not found");
            }
            Ok(name.as_bytes().to_vec())
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    #[test]
    fn upsert_creates_then_updates_without_duplicating() {
        let mut api = MockConfluence::default();
        let policy = fast_policy(3);

        let first = upsert_page(&mut api, &policy, "DOCS", "Home_Page", "v1", "1", false)
            .expect("create");
        assert_eq!(first.action, "created");
        assert_eq!(api.pages.len(), 1);

        let second = upsert_page(&mut api, &policy, "DOCS", "Home_Page", "v2", "1", false)
            .expect("update");
        assert_eq!(second.action, "updated");
        assert_eq!(second.page_id, first.page_id);
        assert_eq!(api.pages.len(), 1);

        let stored = api.pages.get("Home Page").expect("stored under display title");
        assert_eq!(stored.body, "v2");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.parent.as_deref(), Some("1"));
        assert_eq!(api.create_calls, 1);
        assert_eq!(api.update_calls, 1);
    }

    #[test]
    fn transient_create_failures_retry_within_the_bound() {
        let mut api = MockConfluence::default();
        api.create_failures.push_back(status_error(503, "unavailable"));
        api.create_failures.push_back(status_error(500, "flaky"));
        let policy = fast_policy(3);

        let outcome =
            upsert_page(&mut api, &policy, "DOCS", "Home", "body", "1", false).expect("created");
        assert_eq!(outcome.action, "created");
        assert_eq!(api.create_calls, 3);
        assert_eq!(api.find_calls, 3);
    }

    #[test]
    fn exhausted_retries_propagate_the_last_error() {
        let mut api = MockConfluence::default();
        for _ in 0..5 {
            api.create_failures.push_back(status_error(503, "unavailable"));
        }
        let policy = fast_policy(3);

        let outcome = upsert_page(&mut api, &policy, "DOCS", "Home", "body", "1", false);
        assert!(outcome.is_err());
        assert_eq!(api.create_calls, 3);
        assert!(api.pages.is_empty());
    }

    #[test]
    fn permanent_failures_are_attempted_exactly_once() {
        let mut api = MockConfluence::default();
        api.create_failures
            .push_back(status_error(404, "No space with the key DOCS"));
        let policy = fast_policy(3);

        let error = upsert_page(&mut api, &policy, "DOCS", "Home", "body", "1", false)
            .expect_err("permanent");
        assert_eq!(api.create_calls, 1);
        assert_eq!(failure_reason(&error), "space not found");
    }

    #[test]
    fn duplicate_create_race_resolves_to_an_update() {
        let mut api = MockConfluence::default();
        api.race_create_once = true;
        let policy = fast_policy(3);

        let outcome =
            upsert_page(&mut api, &policy, "DOCS", "Home", "ours", "1", false).expect("resolved");
        assert_eq!(outcome.action, "updated");
        assert_eq!(api.pages.len(), 1);
        assert_eq!(api.create_calls, 1);
        assert_eq!(api.update_calls, 1);
        let stored = api.pages.get("Home").expect("single page");
        assert_eq!(stored.body, "ours");
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn dry_run_never_issues_mutating_calls() {
        let mut api = MockConfluence::default();
        let policy = fast_policy(3);

        let preview =
            upsert_page(&mut api, &policy, "DOCS", "Home", "body", "1", true).expect("preview");
        assert_eq!(preview.action, "would_create");
        assert_eq!(preview.page_id, None);
        assert_eq!(api.create_calls, 0);
        assert_eq!(api.update_calls, 0);
        assert!(api.pages.is_empty());

        upsert_page(&mut api, &policy, "DOCS", "Home", "body", "1", false).expect("create");
        let second =
            upsert_page(&mut api, &policy, "DOCS", "Home", "body", "1", true).expect("preview");
        assert_eq!(second.action, "would_update");
        assert!(second.page_id.is_some());
        assert_eq!(api.update_calls, 0);
    }

    #[test]
    fn attachment_failures_leave_the_page_synced() {
        let mut wiki = AttachmentWiki {
            attachments: vec!["diagram.png".to_string(), "notes.txt".to_string()],
            missing_downloads: vec!["notes.txt".to_string()],
            requests: 0,
        };
        let mut api = MockConfluence::default();
        let policy = fast_policy(2);

        let summary = transfer_attachments(&mut wiki, &mut api, &policy, "Home", "101", false);
        assert_eq!(summary.transferred, 1);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].starts_with("notes.txt"));
        assert_eq!(
            api.attachments.get("101"),
            Some(&vec!["diagram.png".to_string()])
        );
    }

    #[test]
    fn dry_run_attachments_are_listed_but_never_uploaded() {
        let mut wiki = AttachmentWiki {
            attachments: vec!["diagram.png".to_string()],
            missing_downloads: Vec::new(),
            requests: 0,
        };
        let mut api = MockConfluence::default();
        let policy = fast_policy(2);

        let summary = transfer_attachments(&mut wiki, &mut api, &policy, "Home", "101", true);
        assert_eq!(summary.transferred, 1);
        assert!(summary.failures.is_empty());
        assert_eq!(api.attach_calls, 0);
        assert_eq!(wiki.requests, 1);
    }

    #[test]
    fn root_verification_rejects_a_missing_root() {
        let mut api = MockConfluence::default();
        let policy = fast_policy(2);
        assert!(verify_destination_root(&mut api, &policy, "999").is_err());

        api.pages.insert(
            "Root".to_string(),
            StoredPage {
                id: "999".to_string(),
                version: 1,
                body: String::new(),
                parent: None,
            },
        );
        verify_destination_root(&mut api, &policy, "999").expect("root exists");
    }
}
