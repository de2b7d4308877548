use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response, multipart};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::retry::{ErrorClass, is_retryable_status};

pub const STORAGE_REPRESENTATION: &str = "storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePageHandle {
    pub id: String,
    pub version: u32,
}

pub trait ConfluenceApi {
    fn find_page(
        &mut self,
        space: &str,
        title: &str,
    ) -> Result<Option<RemotePageHandle>, ConfluenceError>;
    fn create_page(
        &mut self,
        space: &str,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<String, ConfluenceError>;
    fn update_page(
        &mut self,
        id: &str,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
        version: u32,
    ) -> Result<String, ConfluenceError>;
    fn attach_file(&mut self, id: &str, name: &str, data: &[u8]) -> Result<(), ConfluenceError>;
    fn page_exists(&mut self, id: &str) -> Result<bool, ConfluenceError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Error)]
pub enum ConfluenceError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Confluence returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to decode Confluence response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ConfluenceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConfluenceError::Transport(error) => {
                if error.is_timeout() || error.is_connect() || error.is_request() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            ConfluenceError::Status { status, message } => {
                if is_retryable_status(*status) || is_duplicate_title(message) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            ConfluenceError::Decode(_) => ErrorClass::Permanent,
        }
    }

    /// Recognized reason for a permanent rejection, when the response body
    /// matches a known pattern. Callers log the raw error otherwise.
    pub fn permanent_reason(&self) -> Option<&'static str> {
        let ConfluenceError::Status { status, message } = self else {
            return None;
        };
        let lower = message.to_lowercase();
        if lower.contains("no space with the key") || lower.contains("no space with key") {
            return Some("space not found");
        }
        if lower.contains("representation") || lower.contains("content type") {
            return Some("content type rejected");
        }
        match status {
            401 | 403 => Some("authentication rejected"),
            400 => Some("malformed request"),
            _ => None,
        }
    }
}

/// A lookup-then-create race surfaces as a duplicate-title rejection; the
/// retried lookup resolves it to an update.
fn is_duplicate_title(message: &str) -> bool {
    message.to_lowercase().contains("already exists")
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_interval_ms: u64,
}

impl Default for ConfluenceClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: None,
            api_token: None,
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            rate_limit_interval_ms: 500,
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/rest/api", self.config.base_url.trim_end_matches('/'))
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

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        let request = request.header("User-Agent", self.config.user_agent.clone());
        match (&self.config.username, &self.config.api_token) {
            (Some(username), Some(token)) => request.basic_auth(username, Some(token)),
            _ => request,
        }
    }

    fn get_json(
        &mut self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ConfluenceError> {
        self.apply_rate_limit();
        let response = self
            .authorize(self.client.get(url))
            .query(query)
            .send()?;
        read_json(response)
    }

    fn post_json(&mut self, url: &str, body: &Value) -> Result<Value, ConfluenceError> {
        self.apply_rate_limit();
        let response = self.authorize(self.client.post(url)).json(body).send()?;
        read_json(response)
    }

    fn put_json(&mut self, url: &str, body: &Value) -> Result<Value, ConfluenceError> {
        self.apply_rate_limit();
        let response = self.authorize(self.client.put(url)).json(body).send()?;
        read_json(response)
    }

    fn find_attachment_id(
        &mut self,
        page_id: &str,
        name: &str,
    ) -> Result<Option<String>, ConfluenceError> {
        let url = format!("{}/content/{page_id}/child/attachment", self.api_url());
        let payload = self.get_json(&url, &[("filename", name)])?;
        let parsed: AttachmentSearchResponse = serde_json::from_value(payload)?;
        Ok(parsed.results.into_iter().next().map(|item| item.id))
    }
}

impl ConfluenceApi for ConfluenceClient {
    fn find_page(
        &mut self,
        space: &str,
        title: &str,
    ) -> Result<Option<RemotePageHandle>, ConfluenceError> {
        let url = format!("{}/content", self.api_url());
        let payload = self.get_json(
            &url,
            &[
                ("spaceKey", space),
                ("title", title),
                ("expand", "version"),
                ("limit", "1"),
            ],
        )?;
        let parsed: ContentSearchResponse = serde_json::from_value(payload)?;
        let handle = parsed.results.into_iter().next().map(|item| {
            let version = item.version.map(|version| version.number).unwrap_or(1);
            RemotePageHandle {
                id: item.id,
                version,
            }
        });
        debug!(space, title, found = handle.is_some(), "looked up destination page");
        Ok(handle)
    }

    fn create_page(
        &mut self,
        space: &str,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<String, ConfluenceError> {
        let url = format!("{}/content", self.api_url());
        let payload = self.post_json(&url, &create_payload(space, title, body, parent_id))?;
        let created: ContentItem = serde_json::from_value(payload)?;
        info!(title, id = %created.id, "created destination page");
        Ok(created.id)
    }

    fn update_page(
        &mut self,
        id: &str,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
        version: u32,
    ) -> Result<String, ConfluenceError> {
        let url = format!("{}/content/{id}", self.api_url());
        let payload = self.put_json(&url, &update_payload(id, title, body, parent_id, version))?;
        let updated: ContentItem = serde_json::from_value(payload)?;
        info!(title, id = %updated.id, version, "updated destination page");
        Ok(updated.id)
    }

    fn attach_file(&mut self, id: &str, name: &str, data: &[u8]) -> Result<(), ConfluenceError> {
        let existing = self.find_attachment_id(id, name)?;
        let url = match &existing {
            Some(attachment_id) => format!(
                "{}/content/{id}/child/attachment/{attachment_id}/data",
                self.api_url()
            ),
            None => format!("{}/content/{id}/child/attachment", self.api_url()),
        };

        self.apply_rate_limit();
        let part = multipart::Part::bytes(data.to_vec()).file_name(name.to_string());
        let form = multipart::Form::new().part("file", part);
        let response = self
            .authorize(self.client.post(&url))
            .header("X-Atlassian-Token", "nocheck")
            .multipart(form)
            .send()?;
        read_json::<Value>(response)?;
        info!(
            page_id = id,
            name,
            updated = existing.is_some(),
            size = data.len(),
            "uploaded attachment"
        );
        Ok(())
    }

    fn page_exists(&mut self, id: &str) -> Result<bool, ConfluenceError> {
        let url = format!("{}/content/{id}", self.api_url());
        match self.get_json(&url, &[]) {
            Ok(_) => Ok(true),
            Err(ConfluenceError::Status { status: 404, .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ConfluenceError> {
    let status = response.status().as_u16();
    let text = response.text().map_err(ConfluenceError::Transport)?;
    if !(200..300).contains(&status) {
        return Err(ConfluenceError::Status {
            status,
            message: text,
        });
    }
    Ok(serde_json::from_str(&text)?)
}

fn create_payload(space: &str, title: &str, body: &str, parent_id: Option<&str>) -> Value {
    let mut payload = json!({
        "type": "page",
        "title": title,
        "space": { "key": space },
        "body": {
            "storage": {
                "value": body,
                "representation": STORAGE_REPRESENTATION,
            }
        },
    });
    if let Some(parent) = parent_id {
        payload["ancestors"] = json!([{ "id": parent }]);
    }
    payload
}

fn update_payload(
    id: &str,
    title: &str,
    body: &str,
    parent_id: Option<&str>,
    version: u32,
) -> Value {
    let mut payload = json!({
        "id": id,
        "type": "page",
        "title": title,
        "version": { "number": version },
        "body": {
            "storage": {
                "value": body,
                "representation": STORAGE_REPRESENTATION,
            }
        },
    });
    if let Some(parent) = parent_id {
        payload["ancestors"] = json!([{ "id": parent }]);
    }
    payload
}

#[derive(Debug, Deserialize)]
struct ContentSearchResponse {
    #[serde(default)]
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    #[serde(default)]
    version: Option<VersionInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: u32,
}

#[derive(Debug, Deserialize)]
struct AttachmentSearchResponse {
    #[serde(default)]
    results: Vec<AttachmentItem>,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    id: String,
}
