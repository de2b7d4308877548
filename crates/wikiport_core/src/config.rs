use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::confluence::ConfluenceClientConfig;
use crate::migrate::DiscoveryStrategy;
use crate::retry::RetryPolicy;
use crate::wiki::WikiClientConfig;

pub const DEFAULT_USER_AGENT: &str = "wikiport/0.1";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_RATE_LIMIT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_LINKS_ROOT: &str = "Main Page";
pub const DEFAULT_MIRROR_DIR: &str = "mirror";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct MigrationConfig {
    #[serde(default)]
    pub mediawiki: MediawikiSection,
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct MediawikiSection {
    pub api_url: Option<String>,
    pub verify_ssl: Option<bool>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ConfluenceSection {
    pub url: Option<String>,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub space_key: Option<String>,
    pub parent_page_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct RunSection {
    pub workers: Option<usize>,
    pub rate_limit: Option<f64>,
    pub retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub hierarchy: Option<bool>,
    pub discovery: Option<String>,
    pub links_root: Option<String>,
    pub report: Option<String>,
    pub mirror_dir: Option<String>,
}

impl MigrationConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config. Required.
    pub fn wiki_api_url(&self) -> Result<String> {
        if let Some(value) = env_override("WIKI_API_URL") {
            return Ok(value);
        }
        match &self.mediawiki.api_url {
            Some(url) => Ok(url.clone()),
            None => bail!("mediawiki.api_url is not configured (or set WIKI_API_URL)"),
        }
    }

    /// TLS certificate verification for the source wiki. Defaults to on.
    pub fn verify_ssl(&self) -> bool {
        self.mediawiki.verify_ssl.unwrap_or(true)
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > default.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_override("WIKI_USER_AGENT") {
            return value;
        }
        self.mediawiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the Confluence base URL: env CONFLUENCE_URL > config. Required.
    pub fn confluence_url(&self) -> Result<String> {
        if let Some(value) = env_override("CONFLUENCE_URL") {
            return Ok(value);
        }
        match &self.confluence.url {
            Some(url) => Ok(url.clone()),
            None => bail!("confluence.url is not configured (or set CONFLUENCE_URL)"),
        }
    }

    /// Resolve the Confluence account: env CONFLUENCE_USER > config. Required.
    pub fn confluence_username(&self) -> Result<String> {
        if let Some(value) = env_override("CONFLUENCE_USER") {
            return Ok(value);
        }
        match &self.confluence.username {
            Some(username) => Ok(username.clone()),
            None => bail!("confluence.username is not configured (or set CONFLUENCE_USER)"),
        }
    }

    /// Resolve the API token: env CONFLUENCE_API_TOKEN > config. Required.
    pub fn confluence_api_token(&self) -> Result<String> {
        if let Some(value) = env_override("CONFLUENCE_API_TOKEN") {
            return Ok(value);
        }
        match &self.confluence.api_token {
            Some(token) => Ok(token.clone()),
            None => bail!("confluence.api_token is not configured (or set CONFLUENCE_API_TOKEN)"),
        }
    }

    /// Resolve the target space: env CONFLUENCE_SPACE_KEY > config. Required.
    pub fn space_key(&self) -> Result<String> {
        if let Some(value) = env_override("CONFLUENCE_SPACE_KEY") {
            return Ok(value);
        }
        match &self.confluence.space_key {
            Some(key) => Ok(key.clone()),
            None => bail!("confluence.space_key is not configured (or set CONFLUENCE_SPACE_KEY)"),
        }
    }

    /// Resolve the destination root page id: env CONFLUENCE_ROOT_PAGE_ID >
    /// config. Required.
    pub fn parent_page_id(&self) -> Result<String> {
        if let Some(value) = env_override("CONFLUENCE_ROOT_PAGE_ID") {
            return Ok(value);
        }
        match &self.confluence.parent_page_id {
            Some(id) => Ok(id.clone()),
            None => bail!(
                "confluence.parent_page_id is not configured (or set CONFLUENCE_ROOT_PAGE_ID)"
            ),
        }
    }

    pub fn workers(&self) -> usize {
        self.run.workers.unwrap_or(DEFAULT_WORKERS).max(1)
    }

    /// Minimum per-worker interval between requests, derived from the
    /// configured rate limit in requests per second.
    pub fn rate_limit_interval_ms(&self) -> u64 {
        match self.run.rate_limit {
            Some(rate) if rate.is_finite() && rate > 0.0 => (1000.0 / rate).round() as u64,
            _ => DEFAULT_RATE_LIMIT_INTERVAL_MS,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.run.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            base_delay: Duration::from_millis(
                self.run
                    .retry_base_delay_ms
                    .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            ),
            exponential: true,
        }
    }

    pub fn hierarchy(&self) -> bool {
        self.run.hierarchy.unwrap_or(true)
    }

    pub fn discovery_strategy(&self) -> Result<DiscoveryStrategy> {
        match self.run.discovery.as_deref() {
            None | Some("paths") => Ok(DiscoveryStrategy::Paths),
            Some("links") => Ok(DiscoveryStrategy::Links {
                root: self
                    .run
                    .links_root
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LINKS_ROOT.to_string()),
            }),
            Some(other) => bail!("run.discovery must be \"paths\" or \"links\", got {other:?}"),
        }
    }

    pub fn report_path(&self) -> Option<PathBuf> {
        self.run.report.as_ref().map(PathBuf::from)
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.run
            .mirror_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MIRROR_DIR))
    }

    pub fn wiki_client_config(&self) -> Result<WikiClientConfig> {
        Ok(WikiClientConfig {
            api_url: self.wiki_api_url()?,
            user_agent: self.user_agent(),
            rate_limit_interval_ms: self.rate_limit_interval_ms(),
            verify_tls: self.verify_ssl(),
            retry: self.retry_policy(),
            ..WikiClientConfig::default()
        })
    }

    pub fn confluence_client_config(&self) -> Result<ConfluenceClientConfig> {
        Ok(ConfluenceClientConfig {
            base_url: self.confluence_url()?,
            username: Some(self.confluence_username()?),
            api_token: Some(self.confluence_api_token()?),
            user_agent: self.user_agent(),
            rate_limit_interval_ms: self.rate_limit_interval_ms(),
            ..ConfluenceClientConfig::default()
        })
    }
}

fn env_override(name: &str) -> Option<String> {
    if let Ok(value) = env::var(name) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    None
}

/// Load and parse the migration config. A missing file is an error: the
/// destination credentials have no workable defaults.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const FULL_CONFIG: &str = r#"
mediawiki:
  api_url: "https://wiki.example.org/api.php"
  verify_ssl: false
confluence:
  url: "https://example.atlassian.net/wiki"
  username: "docs@example.org"
  api_token: "token-123"
  space_key: "DOCS"
  parent_page_id: "123456"
run:
  workers: 2
  rate_limit: 4.0
  retry_attempts: 5
  retry_base_delay_ms: 200
  hierarchy: false
  discovery: "links"
  links_root: "Home"
  report: "out/pages.txt"
  mirror_dir: "out/mirror"
"#;

    #[test]
    fn load_config_parses_every_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.yaml");
        fs::write(&config_path, FULL_CONFIG).expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.mediawiki.api_url.as_deref(),
            Some("https://wiki.example.org/api.php")
        );
        assert!(!config.verify_ssl());
        assert_eq!(config.space_key().expect("space"), "DOCS");
        assert_eq!(config.parent_page_id().expect("root"), "123456");
        assert_eq!(config.workers(), 2);
        assert_eq!(config.rate_limit_interval_ms(), 250);
        assert!(!config.hierarchy());
        assert_eq!(
            config.discovery_strategy().expect("strategy"),
            DiscoveryStrategy::Links {
                root: "Home".to_string()
            }
        );
        assert_eq!(config.report_path(), Some(PathBuf::from("out/pages.txt")));
        assert_eq!(config.mirror_dir(), PathBuf::from("out/mirror"));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }

    #[test]
    fn load_config_fails_for_a_missing_file() {
        let error = load_config(Path::new("/nonexistent/config.yaml")).expect_err("must fail");
        assert!(error.to_string().contains("failed to read"));
    }

    #[test]
    fn load_config_fails_for_invalid_yaml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.yaml");
        fs::write(&config_path, "confluence: [not a map").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn required_keys_name_themselves_when_missing() {
        let config = MigrationConfig::default();
        let error = config.wiki_api_url().expect_err("required");
        assert!(error.to_string().contains("mediawiki.api_url"));
        let error = config.confluence_api_token().expect_err("required");
        assert!(error.to_string().contains("confluence.api_token"));
        let error = config.parent_page_id().expect_err("required");
        assert!(error.to_string().contains("confluence.parent_page_id"));
    }

    #[test]
    fn defaults_cover_the_run_section() {
        let config = MigrationConfig::default();
        assert_eq!(config.workers(), DEFAULT_WORKERS);
        assert_eq!(
            config.rate_limit_interval_ms(),
            DEFAULT_RATE_LIMIT_INTERVAL_MS
        );
        assert!(config.hierarchy());
        assert!(config.verify_ssl());
        assert_eq!(config.user_agent(), DEFAULT_USER_AGENT);
        assert_eq!(
            config.discovery_strategy().expect("strategy"),
            DiscoveryStrategy::Paths
        );
        assert_eq!(config.mirror_dir(), PathBuf::from(DEFAULT_MIRROR_DIR));
        assert_eq!(config.report_path(), None);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(
            policy.base_delay,
            Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS)
        );
        assert!(policy.exponential);
    }

    #[test]
    fn nonsense_rate_limits_fall_back_to_the_default() {
        let mut config = MigrationConfig::default();
        config.run.rate_limit = Some(0.0);
        assert_eq!(
            config.rate_limit_interval_ms(),
            DEFAULT_RATE_LIMIT_INTERVAL_MS
        );
        config.run.rate_limit = Some(-2.0);
        assert_eq!(
            config.rate_limit_interval_ms(),
            DEFAULT_RATE_LIMIT_INTERVAL_MS
        );
    }

    #[test]
    fn unknown_discovery_strategies_are_rejected() {
        let mut config = MigrationConfig::default();
        config.run.discovery = Some("breadth".to_string());
        let error = config.discovery_strategy().expect_err("must fail");
        assert!(error.to_string().contains("run.discovery"));
    }

    #[test]
    fn client_configs_assemble_from_the_file() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.yaml");
        fs::write(&config_path, FULL_CONFIG).expect("write config");
        let config = load_config(&config_path).expect("load config");

        let wiki = config.wiki_client_config().expect("wiki config");
        assert_eq!(wiki.api_url, "https://wiki.example.org/api.php");
        assert!(!wiki.verify_tls);
        assert_eq!(wiki.rate_limit_interval_ms, 250);

        let confluence = config.confluence_client_config().expect("confluence config");
        assert_eq!(confluence.base_url, "https://example.atlassian.net/wiki");
        assert_eq!(confluence.username.as_deref(), Some("docs@example.org"));
        assert_eq!(confluence.api_token.as_deref(), Some("token-123"));
    }

    #[test]
    fn missing_credentials_fail_client_assembly() {
        let mut config = MigrationConfig::default();
        config.confluence.url = Some("https://example.atlassian.net/wiki".to_string());
        config.confluence.username = Some("docs@example.org".to_string());
        let error = config.confluence_client_config().expect_err("no token");
        assert!(error.to_string().contains("confluence.api_token"));
    }
}
