use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use hrsync_adapters::{flatten_candidate, CandidateSource, FlattenConfig};
use hrsync_storage::{CandidateStore, PageRequest, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub initial_since: DateTime<Utc>,
    pub overlap: Duration,
    pub page_delay: Duration,
    pub flatten: FlattenConfig,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial_since: config.initial_since,
            overlap: config.sync_overlap,
            page_delay: config.page_delay,
            flatten: config.flatten_config(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: DateTime<Utc>,
    pub force_full: bool,
    pub pages: usize,
    pub fetched: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub elapsed_ms: u128,
}

/// Pulls candidates updated since the high-water mark into the primary store.
pub struct SyncCoordinator<'a> {
    source: &'a dyn CandidateSource,
    store: &'a dyn CandidateStore,
    options: SyncOptions,
}

impl<'a> SyncCoordinator<'a> {
    pub fn new(
        source: &'a dyn CandidateSource,
        store: &'a dyn CandidateStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
        }
    }

    /// Lower bound for `updated_after`: the stored high-water mark minus the
    /// overlap, or the initial epoch when the store is empty or `force_full`.
    pub async fn determine_window(&self, force_full: bool) -> Result<DateTime<Utc>, StoreError> {
        if force_full {
            return Ok(self.options.initial_since);
        }
        let Some(max) = self.store.max_updated_at().await? else {
            return Ok(self.options.initial_since);
        };
        let window = chrono::Duration::from_std(self.options.overlap)
            .ok()
            .and_then(|overlap| max.checked_sub_signed(overlap));
        match window {
            Some(window) => Ok(window),
            None => {
                warn!(
                    overlap_secs = self.options.overlap.as_secs(),
                    high_water = %max,
                    "sync overlap out of range, falling back to the initial window"
                );
                Ok(self.options.initial_since)
            }
        }
    }

    pub async fn run(&self, force_full: bool) -> anyhow::Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = Instant::now();

        let window = self
            .determine_window(force_full)
            .await
            .context("determining sync window")?;
        let span = info_span!("sync_run", %run_id, window = %window, force_full);

        let (pages, fetched, upserted, skipped) = self.drain(window).instrument(span).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window,
            force_full,
            pages,
            fetched,
            upserted,
            skipped,
            elapsed_ms: timer.elapsed().as_millis(),
        };
        info!(
            %run_id,
            pages,
            fetched,
            upserted,
            skipped,
            elapsed_ms = summary.elapsed_ms as u64,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn drain(&self, window: DateTime<Utc>) -> anyhow::Result<(usize, usize, usize, usize)> {
        let (mut pages, mut fetched, mut upserted, mut skipped) = (0usize, 0usize, 0usize, 0usize);
        let mut request = Some(self.source.first_page(window));

        while let Some(current) = request.take() {
            let page = self
                .source
                .fetch_page(&current)
                .await
                .with_context(|| format!("fetching page {} from {}", pages + 1, current.url()))?;
            pages += 1;
            fetched += page.items.len();

            let mut rows = Vec::with_capacity(page.items.len());
            for item in &page.items {
                match flatten_candidate(item, &self.options.flatten) {
                    Ok(record) => rows.push(record),
                    Err(err) => {
                        skipped += 1;
                        warn!(page = pages, id = ?item.get("id"), error = %err, "skipping malformed candidate");
                    }
                }
            }

            if !rows.is_empty() {
                let written = self
                    .store
                    .upsert_batch(&rows)
                    .await
                    .with_context(|| format!("upserting page {pages}"))?;
                upserted += written;
            }
            info!(page = pages, items = page.items.len(), total_upserted = upserted, "page committed");

            request = page.next.map(PageRequest::Next);
            if request.is_some() && !self.options.page_delay.is_zero() {
                tokio::time::sleep(self.options.page_delay).await;
            }
        }

        Ok((pages, fetched, upserted, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use hrsync_adapters::HarvestSource;
    use hrsync_core::CandidateRecord;
    use hrsync_storage::{
        BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, MemoryStore, Page, RetryPolicy,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    fn options() -> SyncOptions {
        SyncOptions {
            initial_since: at(1_577_836_800),
            overlap: Duration::from_secs(120),
            page_delay: Duration::ZERO,
            flatten: FlattenConfig::default(),
        }
    }

    fn record(id: i64, updated: i64) -> CandidateRecord {
        CandidateRecord {
            updated_at: Some(at(updated)),
            ..CandidateRecord::blank(id)
        }
    }

    /// Replays canned pages and remembers the requests it saw.
    struct ScriptedSource {
        pages: Vec<Page>,
        seen: Mutex<Vec<PageRequest>>,
    }

    #[async_trait]
    impl CandidateSource for ScriptedSource {
        fn first_page(&self, since: DateTime<Utc>) -> PageRequest {
            PageRequest::Start {
                url: "page-0".into(),
                params: vec![("updated_after".into(), since.to_rfc3339())],
            }
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
            let mut seen = self.seen.lock().expect("lock");
            seen.push(request.clone());
            let index = seen.len() - 1;
            Ok(self.pages.get(index).cloned().unwrap_or_default())
        }
    }

    fn fast_fetcher(api_key: &str) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            basic_auth_user: Some(api_key.into()),
            retry: RetryPolicy {
                backoff: BackoffPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    jitter_step: Duration::ZERO,
                    max_delay: Duration::from_millis(2),
                },
                connection_retries: 1,
                connection_delay: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn window_uses_high_water_mark_minus_overlap() {
        let store = MemoryStore::new();
        let source = ScriptedSource { pages: vec![], seen: Mutex::new(vec![]) };
        let coordinator = SyncCoordinator::new(&source, &store, options());

        assert_eq!(coordinator.determine_window(false).await.expect("window"), at(1_577_836_800));

        store
            .upsert_batch(&[record(1, 1_700_000_000), record(2, 1_700_000_500)])
            .await
            .expect("upsert");
        assert_eq!(
            coordinator.determine_window(false).await.expect("window"),
            at(1_700_000_380)
        );
        assert_eq!(coordinator.determine_window(true).await.expect("window"), at(1_577_836_800));
    }

    #[tokio::test]
    async fn oversized_overlap_falls_back_to_initial_window() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[record(1, 1_700_000_000)])
            .await
            .expect("upsert");
        let source = ScriptedSource { pages: vec![], seen: Mutex::new(vec![]) };
        let coordinator = SyncCoordinator::new(
            &source,
            &store,
            SyncOptions {
                overlap: Duration::MAX,
                ..options()
            },
        );

        assert_eq!(
            coordinator.determine_window(false).await.expect("window"),
            at(1_577_836_800)
        );
    }

    #[tokio::test]
    async fn window_never_moves_backwards_across_runs() {
        let store = MemoryStore::new();
        let first = ScriptedSource {
            pages: vec![Page {
                items: vec![json!({"id": 1, "updated_at": "2024-03-01T10:00:00Z"})],
                next: None,
            }],
            seen: Mutex::new(vec![]),
        };
        let coordinator = SyncCoordinator::new(&first, &store, options());
        coordinator.run(false).await.expect("first run");
        let after_first = coordinator.determine_window(false).await.expect("window");

        // An older copy of the same candidate arrives late.
        let second = ScriptedSource {
            pages: vec![Page {
                items: vec![json!({"id": 1, "updated_at": "2023-01-01T00:00:00Z"})],
                next: None,
            }],
            seen: Mutex::new(vec![]),
        };
        let coordinator = SyncCoordinator::new(&second, &store, options());
        coordinator.run(false).await.expect("second run");
        let after_second = coordinator.determine_window(false).await.expect("window");

        assert!(after_second >= after_first);
        assert_eq!(after_first.to_rfc3339(), "2024-03-01T09:58:00+00:00");
    }

    #[tokio::test]
    async fn run_follows_continuations_and_counts_skips() {
        let store = MemoryStore::new();
        let source = ScriptedSource {
            pages: vec![
                Page {
                    items: vec![json!({"id": 1}), json!({"id": 2}), json!("garbage")],
                    next: Some("page-1".into()),
                },
                Page {
                    items: vec![json!({"first_name": "no id"}), json!({"id": 2, "first_name": "Ada"})],
                    next: None,
                },
            ],
            seen: Mutex::new(vec![]),
        };
        let summary = SyncCoordinator::new(&source, &store, options())
            .run(false)
            .await
            .expect("run");

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.fetched, 5);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.upserted, 3);
        assert_eq!(store.candidate_count().await.expect("count"), 2);
        assert_eq!(store.candidate(2).await.expect("row").first_name, "Ada");

        let seen = source.seen.lock().expect("lock");
        assert!(matches!(seen[0], PageRequest::Start { .. }));
        assert_eq!(seen[1], PageRequest::Next("page-1".into()));
    }

    #[tokio::test]
    async fn harvest_pages_send_window_only_on_first_request() {
        let server = MockServer::start().await;
        let next = format!("<{}/v1/candidates?page=2&per_page=2>; rel=\"next\"", server.uri());
        Mock::given(method("GET"))
            .and(path("/v1/candidates"))
            .and(query_param("per_page", "2"))
            .and(query_param("updated_after", "2020-01-01T00:00:00Z"))
            .and(query_param_is_missing("page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(json!([{"id": 10}, {"id": 11}])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/candidates"))
            .and(query_param("page", "2"))
            .and(query_param_is_missing("updated_after"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 12}])))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let source = HarvestSource::new(fast_fetcher("key"), format!("{}/v1", server.uri()), 2);
        let summary = SyncCoordinator::new(&source, &store, options())
            .run(false)
            .await
            .expect("run");

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.upserted, 3);
        assert_eq!(store.candidate_count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_committed_pages() {
        let server = MockServer::start().await;
        let next = format!("<{}/v1/candidates?page=2>; rel=\"next\"", server.uri());
        Mock::given(method("GET"))
            .and(path("/v1/candidates"))
            .and(query_param_is_missing("page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(json!([{"id": 20}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/candidates"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let source = HarvestSource::new(fast_fetcher("key"), format!("{}/v1", server.uri()), 500);
        let err = SyncCoordinator::new(&source, &store, options())
            .run(false)
            .await
            .expect_err("unauthorized");

        assert!(format!("{err:#}").contains("fetching page 2"));
        assert!(store.candidate(20).await.is_some());
    }
}
