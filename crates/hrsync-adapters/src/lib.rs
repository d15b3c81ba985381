//! Source, flattening, and file-lookup adapters for candidate sync.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hrsync_storage::{FetchError, HttpFetcher, Page, PageRequest};

mod attachments;
mod flatten;
mod graph;
mod locator;

pub use attachments::{
    candidate_display_name, choose_resume, dated_subdir, detect_extension, resume_file_name,
    sanitize_file_name, unique_path, AttachmentSource, ResumeAttachment,
};
pub use flatten::{
    flatten_candidate, EmploymentAlignment, FlattenConfig, FlattenError, RawAttachment,
    RawCandidate, Text,
};
pub use graph::{GraphConfig, GraphResolver, ReferenceResolver, ResolveError};
pub use locator::{FileIndex, LocateError, Subject, SubjectKind, SubjectLocator};

pub const CRATE_NAME: &str = "hrsync-adapters";

pub const MAX_PAGE_SIZE: u32 = 500;

/// A paginated feed of raw candidate payloads.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Request for the first page of candidates updated after `since`.
    fn first_page(&self, since: DateTime<Utc>) -> PageRequest;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError>;
}

/// Greenhouse Harvest `GET /candidates`.
#[derive(Debug)]
pub struct HarvestSource {
    fetcher: HttpFetcher,
    base_url: String,
    per_page: u32,
}

impl HarvestSource {
    /// `fetcher` must already carry the API key as its Basic-auth user.
    pub fn new(fetcher: HttpFetcher, base_url: impl Into<String>, per_page: u32) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }
}

#[async_trait]
impl CandidateSource for HarvestSource {
    fn first_page(&self, since: DateTime<Utc>) -> PageRequest {
        PageRequest::Start {
            url: format!("{}/candidates", self.base_url),
            params: vec![
                ("per_page".to_string(), self.per_page.to_string()),
                (
                    "updated_after".to_string(),
                    since.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
            ],
        }
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        self.fetcher.fetch_page(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hrsync_storage::{HttpClientConfig, RetryPolicy};

    fn source(per_page: u32) -> HarvestSource {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            basic_auth_user: Some("key".into()),
            retry: RetryPolicy::default(),
            ..Default::default()
        })
        .expect("fetcher");
        HarvestSource::new(fetcher, "https://harvest.example/v1/", per_page)
    }

    #[test]
    fn first_page_sends_window_and_clamped_page_size() {
        let since = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().expect("ts");
        let request = source(9_000).first_page(since);
        assert_eq!(
            request,
            PageRequest::Start {
                url: "https://harvest.example/v1/candidates".into(),
                params: vec![
                    ("per_page".into(), "500".into()),
                    ("updated_after".into(), "2020-01-01T00:00:00Z".into()),
                ],
            }
        );
        assert_eq!(source(0).per_page(), 1);
    }
}
