//! # api: HTTPS access to the Cloud Foundry and Ops Manager REST APIs
//!
//! [`HttpApiClient`] is the production [`ApiClient`]: a `reqwest` client that
//! sends a bearer token with every GET. Tokens come either straight from the
//! environment (`CF_TOKEN`, `OM_TOKEN`) or from a UAA password grant.
//!
//! [`paginate`] walks both pagination styles found in the wild:
//! v3 `pagination.next.href` (absolute URL) and v2 `next_url` (path).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::contract::{ApiClient, ApiError};

/// Largest slice of an error body kept in [`ApiError::Status`].
const ERROR_BODY_LIMIT: usize = 512;

/// How to obtain a token for one API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Password { username: String, password: String },
}

/// Everything needed to build an [`HttpApiClient`].
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub credentials: Credentials,
    pub skip_ssl_validation: bool,
    /// OAuth client used for the password grant (`cf` or `opsman`).
    pub oauth_client: String,
    pub request_timeout: Duration,
}

impl ApiSettings {
    /// `CF_API` plus `CF_TOKEN`, or `CF_USERNAME`/`CF_PASSWORD`. `CF_SKIP_SSL_VALIDATION` is optional.
    pub fn cf_from_lookup<F>(lookup: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup(&lookup, "CF", "cf")
    }

    /// `OM_TARGET` plus `OM_TOKEN`, or `OM_USERNAME`/`OM_PASSWORD`. `OM_SKIP_SSL_VALIDATION` is optional.
    pub fn opsman_from_lookup<F>(lookup: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup(&lookup, "OM", "opsman")
    }

    pub fn cf_from_env() -> Result<Self, ApiError> {
        Self::cf_from_lookup(|k| std::env::var(k).ok())
    }

    pub fn opsman_from_env() -> Result<Self, ApiError> {
        Self::opsman_from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup<F>(lookup: &F, prefix: &str, oauth_client: &str) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{prefix}_{suffix}")).filter(|v| !v.trim().is_empty())
        };
        let url_var = if prefix == "OM" { "TARGET" } else { "API" };
        let raw_url = get(url_var)
            .ok_or_else(|| ApiError::Config(format!("{prefix}_{url_var} is not set")))?;
        let base_url = normalize_base_url(&raw_url);

        let credentials = match (get("TOKEN"), get("USERNAME"), get("PASSWORD")) {
            (Some(token), _, _) => Credentials::Token(strip_bearer(&token).to_string()),
            (None, Some(username), Some(password)) => Credentials::Password { username, password },
            _ => {
                return Err(ApiError::Config(format!(
                    "set {prefix}_TOKEN, or {prefix}_USERNAME and {prefix}_PASSWORD"
                )))
            }
        };

        Ok(Self {
            base_url,
            credentials,
            skip_ssl_validation: get("SKIP_SSL_VALIDATION")
                .map(|v| crate::config::parse_flag(&v, false))
                .unwrap_or(false),
            oauth_client: oauth_client.to_string(),
            request_timeout: Duration::from_secs(60),
        })
    }
}

/// `api.example.com` → `https://api.example.com`; trailing slashes dropped.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn strip_bearer(token: &str) -> &str {
    let t = token.trim();
    t.strip_prefix("bearer ")
        .or_else(|| t.strip_prefix("Bearer "))
        .unwrap_or(t)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Bearer-token JSON client for one API root.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpApiClient {
    pub fn with_token(settings: &ApiSettings, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_http(settings)?,
            base_url: settings.base_url.clone(),
            token: token.into(),
        })
    }

    /// Build a client, running the UAA password grant when no token was given.
    pub async fn connect(settings: &ApiSettings) -> Result<Self, ApiError> {
        let http = build_http(settings)?;
        let token = match &settings.credentials {
            Credentials::Token(token) => token.clone(),
            Credentials::Password { username, password } => {
                let token_url = discover_token_url(&http, settings).await?;
                password_grant(&http, &token_url, &settings.oauth_client, username, password).await?
            }
        };
        info!(
            base_url = %settings.base_url,
            skip_ssl_validation = settings.skip_ssl_validation,
            "API client ready"
        );
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

fn build_http(settings: &ApiSettings) -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(settings.skip_ssl_validation)
        .timeout(settings.request_timeout)
        .build()
        .map_err(|e| ApiError::Config(format!("cannot build HTTP client: {e}")))
}

/// UAA token endpoint for this API.
///
/// Cloud Foundry advertises its login server under `links.login.href` of the
/// root document; Ops Manager serves UAA at `/uaa`.
async fn discover_token_url(
    http: &reqwest::Client,
    settings: &ApiSettings,
) -> Result<String, ApiError> {
    if settings.oauth_client == "opsman" {
        return Ok(format!("{}/uaa/oauth/token", settings.base_url));
    }
    let root_url = format!("{}/", settings.base_url);
    let root: Value = http
        .get(&root_url)
        .send()
        .await
        .map_err(|e| transport(&root_url, e))?
        .json()
        .await
        .map_err(|e| ApiError::Auth(format!("unreadable API root document: {e}")))?;
    let login = root
        .pointer("/links/login/href")
        .or_else(|| root.pointer("/links/uaa/href"))
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Auth("API root advertises no login server".to_string()))?;
    Ok(format!("{}/oauth/token", login.trim_end_matches('/')))
}

async fn password_grant(
    http: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    username: &str,
    password: &str,
) -> Result<String, ApiError> {
    info!(token_url, client_id, username, "Requesting UAA token");
    let response = http
        .post(token_url)
        .basic_auth(client_id, Some(""))
        .form(&[
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("response_type", "token"),
        ])
        .send()
        .await
        .map_err(|e| transport(token_url, e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(token_url, status = status.as_u16(), "UAA rejected the password grant");
        return Err(ApiError::Auth(format!(
            "UAA answered HTTP {}: {}",
            status.as_u16(),
            truncate(&body)
        )));
    }
    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| ApiError::Auth(format!("unreadable token response: {e}")))?;
    Ok(token.access_token)
}

fn transport(url: &str, e: reqwest::Error) -> ApiError {
    ApiError::Transport {
        url: url.to_string(),
        detail: e.to_string(),
    }
}

fn truncate(body: &str) -> String {
    let mut end = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].trim().to_string()
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get_json(&self, path: &str) -> Result<Option<Value>, ApiError> {
        let url = self.url_for(path);
        debug!(url = %url, "GET");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport(&url, e))?;
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "API request failed");
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        parse_body(&url, &body)
    }
}

/// Non-JSON bodies (gateway error pages and the like) become `Ok(None)`.
fn parse_body(url: &str, body: &str) -> Result<Option<Value>, ApiError> {
    match serde_json::from_str(body) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(url, error = %e, "Response is not JSON; treating as empty");
            Ok(None)
        }
    }
}

/// Largest page the v3 API hands out.
pub const PAGE_SIZE: u32 = 5000;

/// `path` with the page size set, keeping any existing query.
pub fn list_path(path: &str) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{path}{sep}per_page={PAGE_SIZE}")
}

/// Link to the next page, in either v3 or v2 style.
pub fn next_page(doc: &Value) -> Option<String> {
    doc.pointer("/pagination/next/href")
        .or_else(|| doc.get("next_url"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Fetch every page of a list endpoint and return the concatenated `resources`.
///
/// A page that is not JSON ends the walk with what was gathered so far.
pub async fn paginate<A>(client: &A, path: &str) -> Result<Vec<Value>, ApiError>
where
    A: ApiClient + ?Sized,
{
    let mut resources = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(path.to_string());
    let mut pages = 0usize;

    while let Some(page) = next.take() {
        if !seen.insert(page.clone()) {
            warn!(path, page = %page, "Pagination loops back on itself; stopping");
            break;
        }
        let Some(doc) = client.get_json(&page).await? else {
            break;
        };
        pages += 1;
        if let Some(items) = doc.get("resources").and_then(Value::as_array) {
            resources.extend(items.iter().cloned());
        }
        next = next_page(&doc);
    }

    debug!(path, pages, resources = resources.len(), "Paginated");
    Ok(resources)
}
