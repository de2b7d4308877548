use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::{ErrorClass, RetryPolicy, is_retryable_status};

pub const NS_MAIN: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiAttachment {
    pub name: String,
}

pub trait WikiApi {
    fn list_all_titles(&mut self) -> Result<Vec<String>>;
    fn get_raw_content(&mut self, title: &str) -> Result<String>;
    fn render_to_html(&mut self, raw: &str) -> Result<String>;
    fn list_links(&mut self, title: &str) -> Result<Vec<String>>;
    fn list_attachments(&mut self, title: &str) -> Result<Vec<WikiAttachment>>;
    fn download_attachment(&mut self, name: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("MediaWiki API request failed with HTTP {status}")]
    Status { status: u16 },
    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },
    #[error("failed to call MediaWiki API: {0}")]
    Transport(#[from] reqwest::Error),
}

impl WikiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WikiError::Status { status } => {
                if is_retryable_status(*status) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            WikiError::Api { code, .. } => {
                if code == "ratelimited" || code == "maxlag" {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            WikiError::Transport(error) => {
                if error.is_timeout() || error.is_connect() || error.is_request() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_interval_ms: u64,
    pub verify_tls: bool,
    pub retry: RetryPolicy,
}

impl Default for WikiClientConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            rate_limit_interval_ms: 500,
            verify_tls: true,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: WikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: WikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", self.config.api_url))?;
        let pairs = build_pairs(params);
        let policy = self.config.retry;
        policy
            .run(|_| self.execute_get(&base_url, &pairs), WikiError::class)
            .map_err(anyhow::Error::new)
    }

    fn request_json_post(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let pairs = build_pairs(params);
        let policy = self.config.retry;
        policy
            .run(|_| self.execute_post(&pairs), WikiError::class)
            .map_err(anyhow::Error::new)
    }

    fn execute_get(
        &mut self,
        url: &Url,
        pairs: &[(String, String)],
    ) -> Result<Value, WikiError> {
        self.apply_rate_limit();
        let response = self
            .client
            .get(url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .query(pairs)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(WikiError::Status {
                status: status.as_u16(),
            });
        }
        let payload: Value = response.json()?;
        check_api_error(payload)
    }

    fn execute_post(&mut self, pairs: &[(String, String)]) -> Result<Value, WikiError> {
        self.apply_rate_limit();
        let response = self
            .client
            .post(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .form(pairs)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(WikiError::Status {
                status: status.as_u16(),
            });
        }
        let payload: Value = response.json()?;
        check_api_error(payload)
    }

    fn execute_download(&mut self, url: &str) -> Result<Vec<u8>, WikiError> {
        self.apply_rate_limit();
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.config.user_agent.clone())
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(WikiError::Status {
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes()?;
        Ok(bytes.to_vec())
    }

    fn apply_rate_limit(&mut self) {
        let interval = Duration::from_millis(self.config.rate_limit_interval_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl WikiApi for MediaWikiClient {
    fn list_all_titles(&mut self) -> Result<Vec<String>> {
        let mut titles = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "allpages".to_string()),
                ("apnamespace", NS_MAIN.to_string()),
                ("aplimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("apcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode allpages API response")?;
            for item in parsed.query.allpages {
                titles.push(item.title);
            }

            continue_token = parsed.continuation.and_then(|cont| cont.apcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        debug!(count = titles.len(), "listed wiki titles");
        Ok(titles)
    }

    fn get_raw_content(&mut self, title: &str) -> Result<String> {
        let params = [
            ("action", "parse".to_string()),
            ("page", title.to_string()),
            ("prop", "wikitext".to_string()),
        ];
        let payload = match self.request_json_get(&params) {
            Ok(payload) => payload,
            Err(error) if is_missing_title(&error) => {
                debug!(title, "page missing on source wiki");
                return Ok(String::new());
            }
            Err(error) => return Err(error),
        };
        let parsed: ParseResponse = serde_json::from_value(payload)
            .context("failed to decode parse wikitext response")?;
        Ok(parsed.parse.wikitext.unwrap_or_default())
    }

    fn render_to_html(&mut self, raw: &str) -> Result<String> {
        let params = [
            ("action", "parse".to_string()),
            ("text", raw.to_string()),
            ("contentmodel", "wikitext".to_string()),
            ("prop", "text".to_string()),
        ];
        let payload = self.request_json_post(&params)?;
        let parsed: ParseResponse =
            serde_json::from_value(payload).context("failed to decode parse render response")?;
        Ok(parsed.parse.text.unwrap_or_default())
    }

    fn list_links(&mut self, title: &str) -> Result<Vec<String>> {
        let mut links = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("prop", "links".to_string()),
                ("plnamespace", NS_MAIN.to_string()),
                ("pllimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("plcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse =
                serde_json::from_value(response).context("failed to decode links API response")?;
            for page in parsed.query.pages {
                for link in page.links {
                    links.push(link.title);
                }
            }

            continue_token = parsed.continuation.and_then(|cont| cont.plcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        debug!(title, count = links.len(), "listed outbound links");
        Ok(links)
    }

    fn list_attachments(&mut self, title: &str) -> Result<Vec<WikiAttachment>> {
        let mut attachments = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("prop", "images".to_string()),
                ("imlimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("imcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode images API response")?;
            for page in parsed.query.pages {
                for image in page.images {
                    attachments.push(WikiAttachment {
                        name: attachment_name(&image.title),
                    });
                }
            }

            continue_token = parsed.continuation.and_then(|cont| cont.imcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(attachments)
    }

    fn download_attachment(&mut self, name: &str) -> Result<Vec<u8>> {
        let file_title = if name.starts_with("File:") {
            name.to_string()
        } else {
            format!("File:{name}")
        };
        let params = [
            ("action", "query".to_string()),
            ("titles", file_title.clone()),
            ("prop", "imageinfo".to_string()),
            ("iiprop", "url".to_string()),
        ];
        let response = self.request_json_get(&params)?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode imageinfo API response")?;
        let url = parsed
            .query
            .pages
            .first()
            .and_then(|page| page.imageinfo.first())
            .and_then(|info| info.url.clone())
            .ok_or_else(|| anyhow!("no download url reported for attachment {name}"))?;

        let policy = self.config.retry;
        let bytes = policy
            .run(|_| self.execute_download(&url), WikiError::class)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to download attachment {name}"))?;
        debug!(name, size = bytes.len(), "downloaded attachment");
        Ok(bytes)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn build_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn check_api_error(payload: Value) -> Result<Value, WikiError> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info")
            .to_string();
        return Err(WikiError::Api { code, info });
    }
    Ok(payload)
}

fn is_missing_title(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<WikiError>()
        .is_some_and(|error| matches!(error, WikiError::Api { code, .. } if code == "missingtitle"))
}

fn attachment_name(file_title: &str) -> String {
    file_title
        .strip_prefix("File:")
        .unwrap_or(file_title)
        .to_string()
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    allpages: Vec<TitleQueryItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    apcontinue: Option<String>,
    plcontinue: Option<String>,
    imcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryItem {
    #[serde(default)]
    links: Vec<TitleQueryItem>,
    #[serde(default)]
    images: Vec<TitleQueryItem>,
    #[serde(default)]
    imageinfo: Vec<ImageInfoItem>,
}

#[derive(Debug, Deserialize)]
struct ImageInfoItem {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    #[serde(default)]
    parse: ParsePayload,
}

#[derive(Debug, Deserialize, Default)]
struct ParsePayload {
    wikitext: Option<String>,
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allpages_response_decodes_titles_and_continuation() {
        let payload = serde_json::json!({
            "continue": { "apcontinue": "Page_C", "continue": "-||" },
            "query": {
                "allpages": [
                    { "pageid": 1, "ns": 0, "title": "Page A" },
                    { "pageid": 2, "ns": 0, "title": "Page B" },
                ]
            }
        });
        let parsed: QueryResponse = serde_json::from_value(payload).expect("decode");
        let titles: Vec<String> = parsed
            .query
            .allpages
            .into_iter()
            .map(|item| item.title)
            .collect();
        assert_eq!(titles, vec!["Page A", "Page B"]);
        assert_eq!(
            parsed.continuation.and_then(|cont| cont.apcontinue),
            Some("Page_C".to_string())
        );
    }

    #[test]
    fn links_response_decodes_without_continuation() {
        let payload = serde_json::json!({
            "query": {
                "pages": [
                    { "pageid": 7, "ns": 0, "title": "Home", "links": [
                        { "ns": 0, "title": "Setup" },
                        { "ns": 0, "title": "FAQ" },
                    ]}
                ]
            }
        });
        let parsed: QueryResponse = serde_json::from_value(payload).expect("decode");
        assert!(parsed.continuation.is_none());
        let links: Vec<String> = parsed
            .query
            .pages
            .into_iter()
            .flat_map(|page| page.links)
            .map(|link| link.title)
            .collect();
        assert_eq!(links, vec!["Setup", "FAQ"]);
    }

    #[test]
    fn api_errors_classify_by_code() {
        let rate_limited = WikiError::Api {
            code: "ratelimited".to_string(),
            info: "slow down".to_string(),
        };
        assert_eq!(rate_limited.class(), ErrorClass::Transient);

        let missing = WikiError::Api {
            code: "missingtitle".to_string(),
            info: "no such page".to_string(),
        };
        assert_eq!(missing.class(), ErrorClass::Permanent);

        assert_eq!(
            WikiError::Status { status: 503 }.class(),
            ErrorClass::Transient
        );
        assert_eq!(
            WikiError::Status { status: 404 }.class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn attachment_names_strip_the_file_prefix() {
        assert_eq!(attachment_name("File:Logo.png"), "Logo.png");
        assert_eq!(attachment_name("Diagram.svg"), "Diagram.svg");
    }
}
