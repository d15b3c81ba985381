use std::time::{Duration, Instant};

use async_trait::async_trait;
use hrsync_storage::{retry_call, FetchError, HttpFetcher};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use crate::locator::Subject;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("token endpoint returned no access token")]
    MissingToken,
}

/// Turns a located subject into a shareable reference.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    /// `Ok(None)` when the remote side has no such item.
    async fn resolve(&self, subject: &Subject) -> Result<Option<String>, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub site_id: String,
    /// Remote folder holding the resume tree, relative to the drive root.
    pub folder_path: String,
    pub login_base_url: String,
    pub graph_base_url: String,
}

impl GraphConfig {
    pub const LOGIN_BASE_URL: &'static str = "https://login.microsoftonline.com";
    pub const GRAPH_BASE_URL: &'static str = "https://graph.microsoft.com/v1.0";
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3_600
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    #[serde(rename = "webUrl")]
    web_url: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_after: Instant,
}

/// Microsoft Graph drive-item lookup by path, using a client-credentials token.
#[derive(Debug)]
pub struct GraphResolver {
    http: HttpFetcher,
    config: GraphConfig,
    token: Mutex<Option<CachedToken>>,
}

impl GraphResolver {
    pub fn new(http: HttpFetcher, config: GraphConfig) -> Self {
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ResolveError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_after {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.login_base_url.trim_end_matches('/'),
            self.config.tenant_id
        );
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let response: TokenResponse = retry_call(
            self.http.retry_policy(),
            FetchError::disposition,
            || {
                let request = self.http.client().post(&url).form(&form);
                async move {
                    let resp = request.send().await?;
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    Ok(resp.json::<TokenResponse>().await?)
                }
            },
        )
        .await?;

        let value = response.access_token.ok_or(ResolveError::MissingToken)?;
        let lifetime = Duration::from_secs(response.expires_in);
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_after: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        debug!(expires_in = response.expires_in, "acquired graph access token");
        Ok(value)
    }

    async fn lookup(&self, subject: &Subject) -> Result<Option<String>, ResolveError> {
        let token = self.access_token().await?;
        let url = self.item_url(&subject.remote_path)?;

        let item = retry_call(self.http.retry_policy(), FetchError::disposition, || {
            let request = self.http.client().get(url.clone()).bearer_auth(&token);
            async move {
                let resp = request.send().await?;
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Ok(Some(resp.json::<DriveItem>().await?))
            }
        })
        .await?;

        Ok(item.and_then(|item| item.web_url))
    }

    /// `{graph}/sites/{site}/drive/root:/{folder}/{remote_path}` with every
    /// segment percent-encoded.
    fn item_url(&self, remote_path: &str) -> Result<Url, FetchError> {
        let base = self.config.graph_base_url.trim_end_matches('/');
        let invalid = |reason: &str| FetchError::InvalidUrl {
            url: base.to_string(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(base).map_err(|err| invalid(&err.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| invalid("cannot be a base url"))?;
            segments
                .pop_if_empty()
                .extend(["sites", self.config.site_id.as_str(), "drive", "root:"]);
            segments.extend(
                self.config
                    .folder_path
                    .split('/')
                    .chain(remote_path.split('/'))
                    .filter(|s| !s.is_empty()),
            );
        }
        Ok(url)
    }
}

#[async_trait]
impl ReferenceResolver for GraphResolver {
    async fn resolve(&self, subject: &Subject) -> Result<Option<String>, ResolveError> {
        let span = info_span!("graph_lookup", candidate_id = subject.candidate_id);
        self.lookup(subject).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrsync_storage::{BackoffPolicy, HttpClientConfig, RetryPolicy};
    use std::path::PathBuf;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver(server: &MockServer) -> GraphResolver {
        let http = HttpFetcher::new(HttpClientConfig {
            retry: RetryPolicy {
                backoff: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    jitter_step: Duration::ZERO,
                    max_delay: Duration::from_millis(2),
                },
                connection_retries: 1,
                connection_delay: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .expect("http");
        GraphResolver::new(
            http,
            GraphConfig {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
                site_id: "site-1".into(),
                folder_path: "Greenhouse/Greenhouse_Resumes".into(),
                login_base_url: server.uri(),
                graph_base_url: format!("{}/v1.0", server.uri()),
            },
        )
    }

    fn subject(remote_path: &str) -> Subject {
        Subject {
            candidate_id: 77,
            local_path: PathBuf::from("/tmp/none"),
            file_name: "77_cv.pdf".into(),
            remote_path: remote_path.into(),
        }
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn resolves_web_url_and_caches_token() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path(
                "/v1.0/sites/site-1/drive/root:/Greenhouse/Greenhouse_Resumes/2024/77_cv%20final.pdf",
            ))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "item",
                "webUrl": "https://tenant.sharepoint.com/77_cv.pdf"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        let subject = subject("2024/77_cv final.pdf");
        for _ in 0..2 {
            let url = resolver.resolve(&subject).await.expect("resolve");
            assert_eq!(url.as_deref(), Some("https://tenant.sharepoint.com/77_cv.pdf"));
        }
    }

    #[tokio::test]
    async fn missing_item_resolves_to_none() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = resolver(&server)
            .resolve(&subject("AI_Access/77_cv.pdf"))
            .await
            .expect("resolve");
        assert_eq!(url, None);
    }

    #[tokio::test]
    async fn throttled_lookup_gives_up_after_retries() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = resolver(&server)
            .resolve(&subject("77_cv.pdf"))
            .await
            .expect_err("throttled");
        assert!(matches!(
            err,
            ResolveError::Fetch(FetchError::RetriesExhausted { attempts: 3, .. })
        ));
    }
}
