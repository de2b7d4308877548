use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use crossbeam::channel::unbounded;
use tracing::{debug, info, warn};

use crate::cache::SingleFlightCache;
use crate::confluence::ConfluenceApi;
use crate::convert::{MarkupConverter, placeholder_body};
use crate::report::{MigrationReport, PageResult, UnprocessedLog, write_page_inventory};
use crate::retry::RetryPolicy;
use crate::sync;
use crate::titles;
use crate::tree::{Discoverer, LinkGraphDiscoverer, PageTree, PathDiscoverer};
use crate::wiki::WikiApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Single(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    Paths,
    Links { root: String },
}

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub space_key: String,
    pub root_page_id: String,
    pub workers: usize,
    pub dry_run: bool,
    pub hierarchy: bool,
    pub mode: RunMode,
    pub strategy: DiscoveryStrategy,
    pub retry: RetryPolicy,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct PageJob {
    index: usize,
    title: String,
    parent_id: String,
    placeholder: bool,
}

#[derive(Debug)]
struct ProcessedPage {
    page_id: Option<String>,
    action: String,
    placeholder: bool,
    attachments: usize,
    attachment_failures: Vec<String>,
    preview: Option<String>,
}

#[derive(Debug)]
struct PageOutcome {
    index: usize,
    result: Result<ProcessedPage>,
}

#[derive(Debug, Clone)]
struct WorkerSettings {
    space_key: String,
    dry_run: bool,
    retry: RetryPolicy,
}

const PREVIEW_CHARS: usize = 160;

pub fn discover_tree<W: WikiApi>(wiki: &mut W, strategy: &DiscoveryStrategy) -> Result<PageTree> {
    match strategy {
        DiscoveryStrategy::Paths => PathDiscoverer::new(wiki).discover(),
        DiscoveryStrategy::Links { root } => LinkGraphDiscoverer::new(wiki, root).discover(),
    }
}

/// Fetches and converts one page. Empty source content (and synthesized
/// placeholder ancestors) become a visible placeholder document instead of
/// an error. Returns the body plus whether it is a placeholder.
pub fn convert_page_body<W: WikiApi>(
    wiki: &mut W,
    converter: &MarkupConverter,
    canonical_title: &str,
    placeholder: bool,
) -> Result<(String, bool)> {
    let heading = titles::display_title(titles::leaf(canonical_title));
    if placeholder {
        return Ok((placeholder_body(&heading), true));
    }
    let raw = wiki.get_raw_content(canonical_title)?;
    if raw.trim().is_empty() {
        return Ok((placeholder_body(&heading), true));
    }
    let html = wiki.render_to_html(&raw)?;
    let converted = converter
        .convert(&html)
        .with_context(|| format!("failed to convert {canonical_title}"))?;
    Ok((converted.markdown_body, false))
}

fn process_page<W: WikiApi, C: ConfluenceApi>(
    wiki: &mut W,
    api: &mut C,
    converter: &MarkupConverter,
    cache: &SingleFlightCache<(String, bool)>,
    settings: &WorkerSettings,
    job: &PageJob,
) -> Result<ProcessedPage> {
    let (body, placeholder) = cache.get_or_compute(&job.title, || {
        convert_page_body(wiki, converter, &job.title, job.placeholder)
    })?;

    let synced = sync::upsert_page(
        api,
        &settings.retry,
        &settings.space_key,
        &job.title,
        &body,
        &job.parent_id,
        settings.dry_run,
    )
    .map_err(|error| anyhow!("{}", sync::failure_reason(&error)))?;

    let attachments = match &synced.page_id {
        Some(page_id) => sync::transfer_attachments(
            wiki,
            api,
            &settings.retry,
            &job.title,
            page_id,
            settings.dry_run,
        ),
        None => sync::transfer_attachments(wiki, api, &settings.retry, &job.title, "", true),
    };

    let preview = settings
        .dry_run
        .then(|| body.chars().take(PREVIEW_CHARS).collect::<String>());
    Ok(ProcessedPage {
        page_id: synced.page_id,
        action: synced.action,
        placeholder,
        attachments: attachments.transferred,
        attachment_failures: attachments.failures,
        preview,
    })
}

/// Runs the whole pipeline: discovery (or the single requested page), root
/// verification, then level-by-level parallel processing so every parent is
/// synced before any of its children. Per-page failures are recorded and
/// skip that page's descendants; they never abort the run.
pub fn run_migration<W, C, FW, FC>(
    options: &MigrateOptions,
    wiki_factory: FW,
    confluence_factory: FC,
) -> Result<MigrationReport>
where
    W: WikiApi + Send,
    C: ConfluenceApi + Send,
    FW: Fn() -> Result<W>,
    FC: Fn() -> Result<C>,
{
    let mut source_requests = 0usize;
    let mut destination_requests = 0usize;

    let tree = match &options.mode {
        RunMode::Single(title) => {
            let canonical = titles::normalize(title);
            if canonical.is_empty() {
                bail!("page title {title:?} normalizes to nothing");
            }
            let mut tree = PageTree::new();
            tree.push_root(&canonical);
            tree
        }
        RunMode::Full => {
            let mut discovery_wiki =
                wiki_factory().context("failed to build source client for discovery")?;
            let tree = discover_tree(&mut discovery_wiki, &options.strategy)?;
            source_requests += discovery_wiki.request_count();
            tree
        }
    };

    let mut control_api =
        confluence_factory().context("failed to build destination client")?;
    sync::verify_destination_root(&mut control_api, &options.retry, &options.root_page_id)?;
    destination_requests += control_api.request_count();

    if tree.is_empty() {
        info!("no pages discovered, nothing to migrate");
        return Ok(MigrationReport {
            success: true,
            dry_run: options.dry_run,
            discovered: 0,
            created: 0,
            updated: 0,
            failed: 0,
            attachments: 0,
            pages: Vec::new(),
            unprocessed: Vec::new(),
            source_requests,
            destination_requests,
        });
    }

    let levels = if options.hierarchy {
        tree.levels()
    } else {
        vec![tree.preorder()]
    };

    let worker_count = options.workers.max(1).min(tree.len());
    let mut clients = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let wiki = wiki_factory()
            .with_context(|| format!("failed to build source client for worker {worker}"))?;
        let api = confluence_factory()
            .with_context(|| format!("failed to build destination client for worker {worker}"))?;
        clients.push((wiki, api));
    }

    info!(
        pages = tree.len(),
        workers = worker_count,
        dry_run = options.dry_run,
        "starting migration"
    );

    let cache: SingleFlightCache<(String, bool)> = SingleFlightCache::new();
    let log = UnprocessedLog::new();

    let mut destination_ids: HashMap<usize, String> = HashMap::new();
    let mut failed: HashSet<usize> = HashSet::new();
    let mut page_results: HashMap<usize, PageResult> = HashMap::new();
    let mut created = 0usize;
    let mut updated = 0usize;
    let mut attachments_total = 0usize;

    let scope_result: Result<()> = thread::scope(|scope| {
        let (job_sender, job_receiver) = unbounded::<PageJob>();
        let (outcome_sender, outcome_receiver) = unbounded::<PageOutcome>();

        let mut handles = Vec::new();
        for (mut wiki, mut api) in clients.drain(..) {
            let jobs = job_receiver.clone();
            let outcomes = outcome_sender.clone();
            let cache = &cache;
            let settings = WorkerSettings {
                space_key: options.space_key.clone(),
                dry_run: options.dry_run,
                retry: options.retry,
            };
            handles.push(scope.spawn(move || {
                let converter = MarkupConverter::new();
                for job in jobs.iter() {
                    let result = match &converter {
                        Ok(converter) => {
                            process_page(&mut wiki, &mut api, converter, cache, &settings, &job)
                        }
                        Err(error) => Err(anyhow!("converter unavailable: {error}")),
                    };
                    let outcome = PageOutcome {
                        index: job.index,
                        result,
                    };
                    if outcomes.send(outcome).is_err() {
                        break;
                    }
                }
                (wiki.request_count(), api.request_count())
            }));
        }
        drop(outcome_sender);
        drop(job_receiver);

        for level in &levels {
            let mut pending = 0usize;
            for &index in level {
                let node = tree.node(index);
                if let Some(parent) = node.parent {
                    if options.hierarchy && failed.contains(&parent) {
                        let parent_title = tree.node(parent).title.clone();
                        let reason = format!("parent failed: {parent_title}");
                        failed.insert(index);
                        log.record(&node.title, &reason);
                        page_results.insert(
                            index,
                            PageResult {
                                title: node.title.clone(),
                                action: "skipped".to_string(),
                                detail: Some(reason),
                            },
                        );
                        continue;
                    }
                }
                let parent_id = match node.parent {
                    Some(parent) if options.hierarchy => destination_ids
                        .get(&parent)
                        .cloned()
                        .unwrap_or_default(),
                    _ => options.root_page_id.clone(),
                };
                let job = PageJob {
                    index,
                    title: node.title.clone(),
                    parent_id,
                    placeholder: node.placeholder,
                };
                debug!(title = job.title, "queueing page");
                job_sender
                    .send(job)
                    .map_err(|_| anyhow!("worker pool shut down unexpectedly"))?;
                pending += 1;
            }

            for _ in 0..pending {
                let outcome = outcome_receiver
                    .recv()
                    .map_err(|_| anyhow!("worker pool shut down unexpectedly"))?;
                let title = tree.node(outcome.index).title.clone();
                match outcome.result {
                    Ok(processed) => {
                        if let Some(id) = &processed.page_id {
                            destination_ids.insert(outcome.index, id.clone());
                        }
                        match processed.action.as_str() {
                            "created" => created += 1,
                            "updated" => updated += 1,
                            _ => {}
                        }
                        attachments_total += processed.attachments;
                        for failure in &processed.attachment_failures {
                            warn!(title, failure, "attachment not transferred");
                        }
                        let detail = if let Some(preview) = processed.preview {
                            Some(preview)
                        } else if processed.placeholder {
                            Some("placeholder".to_string())
                        } else if !processed.attachment_failures.is_empty() {
                            Some(format!(
                                "{} attachment failure(s)",
                                processed.attachment_failures.len()
                            ))
                        } else {
                            None
                        };
                        debug!(title, action = processed.action, "page processed");
                        page_results.insert(
                            outcome.index,
                            PageResult {
                                title,
                                action: processed.action,
                                detail,
                            },
                        );
                    }
                    Err(error) => {
                        failed.insert(outcome.index);
                        log.record(&title, &error.to_string());
                        warn!(title, %error, "page migration failed");
                        page_results.insert(
                            outcome.index,
                            PageResult {
                                title,
                                action: "error".to_string(),
                                detail: Some(error.to_string()),
                            },
                        );
                    }
                }
            }
        }

        drop(job_sender);
        for handle in handles {
            let (wiki_requests, api_requests) = handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
            source_requests += wiki_requests;
            destination_requests += api_requests;
        }
        Ok(())
    });
    scope_result?;

    let mut pages = Vec::with_capacity(tree.len());
    let mut ordered_titles: Vec<String> = Vec::with_capacity(tree.len());
    for index in tree.preorder() {
        ordered_titles.push(tree.node(index).title.clone());
        if let Some(result) = page_results.remove(&index) {
            pages.push(result);
        }
    }

    let unprocessed = log.entries();
    let report = MigrationReport {
        success: unprocessed.is_empty(),
        dry_run: options.dry_run,
        discovered: tree.len(),
        created,
        updated,
        failed: unprocessed.len(),
        attachments: attachments_total,
        pages,
        unprocessed,
        source_requests,
        destination_requests,
    };

    if let Some(path) = &options.report_path {
        write_page_inventory(path, &ordered_titles, &log)?;
    }

    info!(
        discovered = report.discovered,
        created = report.created,
        updated = report.updated,
        failed = report.failed,
        attachments = report.attachments,
        "migration finished"
    );
    Ok(report)
}
