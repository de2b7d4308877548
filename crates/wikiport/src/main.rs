use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikiport_core::config::{MigrationConfig, load_config};
use wikiport_core::confluence::ConfluenceClient;
use wikiport_core::convert::MarkupConverter;
use wikiport_core::migrate::{self, MigrateOptions, RunMode};
use wikiport_core::mirror;
use wikiport_core::report::{MigrationReport, UnprocessedLog, write_page_inventory};
use wikiport_core::titles;
use wikiport_core::tree::PageTree;
use wikiport_core::wiki::MediaWikiClient;

#[derive(Debug, Parser)]
#[command(
    name = "wikiport",
    version,
    about = "Migrates MediaWiki content into a Confluence space"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = "config.yaml")]
    config: PathBuf,
    #[arg(long, global = true, help = "Enable debug diagnostics on stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Migrate(MigrateArgs),
    Map(MapArgs),
    List(ListArgs),
    Convert(ConvertArgs),
    Mirror(MirrorArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, help = "Discover and convert without any destination write")]
    dry_run: bool,
    #[arg(
        long,
        value_name = "TITLE",
        help = "Migrate a single page instead of the whole wiki"
    )]
    page: Option<String>,
    #[arg(long, value_name = "N", help = "Override the configured worker count")]
    workers: Option<usize>,
    #[arg(long, value_name = "PATH", help = "Write the page inventory here")]
    report: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MapArgs {
    #[arg(long, value_name = "PATH", help = "Also write the tree as nested JSON")]
    json: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_name = "PATH", default_value = "wiki_pages.txt")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    title: String,
    #[arg(long, value_name = "PATH", help = "Write Markdown here instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MirrorArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "Override the configured mirror directory"
    )]
    dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(&cli.config, args),
        Some(Commands::Map(args)) => run_map(&cli.config, args),
        Some(Commands::List(args)) => run_list(&cli.config, args),
        Some(Commands::Convert(args)) => run_convert(&cli.config, args),
        Some(Commands::Mirror(args)) => run_mirror(&cli.config, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("wikiport=debug,wikiport_core=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_migrate(config_path: &Path, args: MigrateArgs) -> Result<()> {
    let config = load_migration_config(config_path)?;
    let options = MigrateOptions {
        space_key: config.space_key()?,
        root_page_id: config.parent_page_id()?,
        workers: args.workers.unwrap_or_else(|| config.workers()).max(1),
        dry_run: args.dry_run,
        hierarchy: config.hierarchy(),
        mode: match args.page {
            Some(title) => RunMode::Single(title),
            None => RunMode::Full,
        },
        strategy: config.discovery_strategy()?,
        retry: config.retry_policy(),
        report_path: args.report.or_else(|| config.report_path()),
    };
    let wiki_config = config.wiki_client_config()?;
    let confluence_config = config.confluence_client_config()?;

    let report = migrate::run_migration(
        &options,
        || MediaWikiClient::new(wiki_config.clone()),
        || ConfluenceClient::new(confluence_config.clone()),
    )?;

    print_report(&report, options.report_path.as_deref());
    Ok(())
}

fn run_map(config_path: &Path, args: MapArgs) -> Result<()> {
    let config = load_migration_config(config_path)?;
    let mut wiki = MediaWikiClient::new(config.wiki_client_config()?)?;
    let tree = migrate::discover_tree(&mut wiki, &config.discovery_strategy()?)?;

    println!("discovered: {}", tree.len());
    print!("{}", tree.outline());
    if let Some(path) = args.json {
        let rendered = serde_json::to_string_pretty(&tree.outline_json())?;
        fs::write(&path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("json: {}", normalize_path(&path));
    }
    Ok(())
}

fn run_list(config_path: &Path, args: ListArgs) -> Result<()> {
    let config = load_migration_config(config_path)?;
    let mut wiki = MediaWikiClient::new(config.wiki_client_config()?)?;
    let tree = migrate::discover_tree(&mut wiki, &config.discovery_strategy()?)?;

    let ordered = ordered_titles(&tree);
    write_page_inventory(&args.output, &ordered, &UnprocessedLog::new())?;
    println!("discovered: {}", tree.len());
    println!("output: {}", normalize_path(&args.output));
    Ok(())
}

fn run_convert(config_path: &Path, args: ConvertArgs) -> Result<()> {
    let config = load_migration_config(config_path)?;
    let mut wiki = MediaWikiClient::new(config.wiki_client_config()?)?;
    let converter = MarkupConverter::new()?;

    let canonical = titles::normalize(&args.title);
    if canonical.is_empty() {
        bail!("page title {:?} normalizes to nothing", args.title);
    }
    let (body, placeholder) = migrate::convert_page_body(&mut wiki, &converter, &canonical, false)?;
    if placeholder {
        tracing::warn!("{} has no source content", titles::display_title(&canonical));
    }
    match args.output {
        Some(path) => {
            fs::write(&path, &body)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote: {}", normalize_path(&path));
        }
        None => print!("{body}"),
    }
    Ok(())
}

fn run_mirror(config_path: &Path, args: MirrorArgs) -> Result<()> {
    let config = load_migration_config(config_path)?;
    let mut wiki = MediaWikiClient::new(config.wiki_client_config()?)?;
    let converter = MarkupConverter::new()?;
    let tree = migrate::discover_tree(&mut wiki, &config.discovery_strategy()?)?;
    let dir = args.dir.unwrap_or_else(|| config.mirror_dir());

    let mut bodies = HashMap::new();
    for index in tree.preorder() {
        let node = tree.node(index);
        match migrate::convert_page_body(&mut wiki, &converter, &node.title, node.placeholder) {
            Ok((body, _)) => {
                bodies.insert(index, body);
            }
            Err(error) => tracing::warn!("skipping {}: {error:#}", node.title),
        }
    }

    let written = mirror::write_mirror(&dir, &tree, &bodies)?;
    let verified = mirror::verify_mirror(&dir)?;

    println!("mirror");
    println!("dir: {}", normalize_path(&dir));
    println!("pages: {}", tree.len());
    println!("files_written: {written}");
    println!("files_verified: {}", verified.len());
    Ok(())
}

fn load_migration_config(config_path: &Path) -> Result<MigrationConfig> {
    let config = load_config(config_path)?;
    tracing::debug!("loaded config from {}", config_path.display());
    Ok(config)
}

fn ordered_titles(tree: &PageTree) -> Vec<String> {
    tree.preorder()
        .into_iter()
        .map(|index| tree.node(index).title.clone())
        .collect()
}

fn print_report(report: &MigrationReport, report_path: Option<&Path>) {
    println!("migration report");
    println!("dry_run: {}", report.dry_run);
    println!("discovered: {}", report.discovered);
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("failed: {}", report.failed);
    println!("attachments: {}", report.attachments);
    println!("source_requests: {}", report.source_requests);
    println!("destination_requests: {}", report.destination_requests);
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!("page.{}: {} ({detail})", page.action, page.title),
            None => println!("page.{}: {}", page.action, page.title),
        }
    }
    if !report.unprocessed.is_empty() {
        println!("unprocessed:");
        for entry in &report.unprocessed {
            println!("  - {}: {}", entry.title, entry.reason);
        }
    }
    if let Some(path) = report_path {
        println!("report_path: {}", normalize_path(path));
    }
    println!("success: {}", report.success);
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
