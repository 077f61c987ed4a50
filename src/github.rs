use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog::{Account, AccountKind, BranchHeads, Catalog, Credentials, Repository};
use crate::error::{BackupError, BackupResult};

/// Public GitHub REST endpoint
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PER_PAGE: usize = 100;
const MAX_PAGES: u32 = 255;

/// Repository entry as returned by the list endpoints
#[derive(Debug, Deserialize)]
struct ApiRepository {
    name: String,
    clone_url: String,
    default_branch: Option<String>,
    #[serde(default)]
    fork: bool,
}

/// Branch entry as returned by `/repos/{owner}/{repo}/branches`
#[derive(Debug, Deserialize)]
struct ApiBranch {
    name: String,
    commit: ApiCommitRef,
}

#[derive(Debug, Deserialize)]
struct ApiCommitRef {
    sha: String,
}

/// GitHub REST catalog with optional HTTP Basic authentication
#[derive(Clone)]
pub struct GitHubCatalog {
    client: Client,
    api_url: String,
}

impl GitHubCatalog {
    /// Create a catalog client against the public GitHub API
    pub fn new() -> BackupResult<Self> {
        Self::with_api_url(DEFAULT_API_URL)
    }

    /// Create a catalog client against a custom API base URL (GitHub Enterprise, tests)
    pub fn with_api_url(api_url: impl Into<String>) -> BackupResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("github-backup/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Listing endpoint for an account.
    ///
    /// `/users/{name}/repos` never shows private repositories, so when the credentials
    /// belong to the account itself the authenticated-user endpoint is used instead.
    fn repositories_path(account: &Account, credentials: Option<&Credentials>) -> String {
        match account.kind {
            AccountKind::Organization => format!("/orgs/{}/repos?type=all", account.name),
            AccountKind::User => match credentials {
                Some(creds) if creds.username.eq_ignore_ascii_case(&account.name) => {
                    "/user/repos?affiliation=owner".to_string()
                }
                _ => format!("/users/{}/repos?type=owner", account.name),
            },
        }
    }

    /// Issue one GET and turn any API-reported `message` into an error
    async fn get_json(
        &self,
        path_and_query: &str,
        credentials: Option<&Credentials>,
    ) -> BackupResult<serde_json::Value> {
        let url = format!("{}{}", self.api_url, path_and_query);
        debug!("GET {}", url);

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");

        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let value: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) if !status.is_success() => {
                let reason = status.canonical_reason().unwrap_or("unexpected status");
                return Err(api_error(status, reason, path_and_query));
            }
            Err(e) => {
                return Err(BackupError::Api(format!(
                    "Invalid JSON from {}: {}",
                    path_and_query, e
                )))
            }
        };

        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return Err(api_error(status, message, path_and_query));
        }

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unexpected status");
            return Err(api_error(status, reason, path_and_query));
        }

        Ok(value)
    }

    /// Fetch every page of a list endpoint
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> BackupResult<Vec<T>> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let page_path = format!("{}{}per_page={}&page={}", path, separator, PER_PAGE, page);
            let value = self.get_json(&page_path, credentials).await?;
            let page_items: Vec<T> = serde_json::from_value(value).map_err(|e| {
                BackupError::Api(format!("Unexpected payload from {}: {}", page_path, e))
            })?;

            let count = page_items.len();
            items.extend(page_items);

            if count < PER_PAGE {
                break;
            }

            if page >= MAX_PAGES {
                warn!("Reached maximum pagination limit ({} pages) for {}", MAX_PAGES, path);
                break;
            }
            page += 1;
        }

        Ok(items)
    }
}

/// Map an API failure to the error taxonomy
fn api_error(status: StatusCode, message: &str, path: &str) -> BackupError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackupError::Auth(message.to_string()),
        StatusCode::NOT_FOUND => BackupError::NotFound(format!("{} ({})", path, message)),
        _ => BackupError::Api(message.to_string()),
    }
}

#[async_trait]
impl Catalog for GitHubCatalog {
    async fn list_repositories(
        &self,
        account: &Account,
        credentials: Option<&Credentials>,
    ) -> BackupResult<Vec<Repository>> {
        let path = Self::repositories_path(account, credentials);
        debug!("Fetching repositories for {} from {}", account, path);

        let repositories: Vec<ApiRepository> = self.get_paginated(&path, credentials).await?;

        info!("Found {} repositories for {}", repositories.len(), account);

        Ok(repositories
            .into_iter()
            .map(|repo| Repository {
                name: repo.name,
                clone_url: repo.clone_url,
                default_branch: repo.default_branch,
                is_fork: repo.fork,
            })
            .collect())
    }

    async fn branch_heads(
        &self,
        account: &Account,
        repo_name: &str,
        credentials: Option<&Credentials>,
    ) -> BackupResult<BranchHeads> {
        let path = format!("/repos/{}/{}/branches", account.name, repo_name);
        let branches: Vec<ApiBranch> = self.get_paginated(&path, credentials).await?;

        Ok(branches
            .into_iter()
            .map(|branch| (branch.name, branch.commit.sha))
            .collect())
    }

    fn provider_name(&self) -> &'static str {
        "GitHub"
    }
}
