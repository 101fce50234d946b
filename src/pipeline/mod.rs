//! Run orchestrator: ties catalog source → storage together.
//!
//! One run walks the catalog index page by page and, for every listed
//! product, fetches its detail record and upserts the merged document:
//!
//!   Listing(page) → ProcessingItem(i) … → Listing(page + 1) → … → Done
//!
//! Everything is strictly sequential and every upstream request is
//! preceded by a throttle delay. A failed detail fetch only downgrades
//! that record to partial; a failed list fetch ends the run but keeps
//! whatever was stored. Storage errors abort.
//!
//! Re-running converges: unchanged products count as neither inserted
//! nor updated.

pub mod progress;

use crate::config::{AppConfig, PipelineConfig};
use crate::models::CatalogRecord;
use crate::scraper::cleaner::map_base_fields;
use crate::scraper::throttle::Throttle;
use crate::scraper::{CatalogSource, SenasaClient};
use crate::storage::{Repository, UpsertOutcome};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use self::progress::ProgressReporter;

// ── Summary ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A page came back with no items.
    EmptyPage,
    /// `page.totalPages` was reached.
    LastPage,
    /// The list fetch failed after all retries.
    ListFetchFailed,
    /// Configured `max_pages` cap.
    PageLimit,
    /// No store configured; nothing was fetched.
    NoStore,
}

/// Counters threaded through the run and returned as its result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub detail_failures: usize,
    pub skipped: usize,
    pub pages_fetched: usize,
    pub total_elements: Option<u64>,
    pub stop_reason: Option<StopReason>,
}

impl RunSummary {
    fn record(mut self, outcome: UpsertOutcome, partial: bool) -> Self {
        self.total_processed += 1;
        if outcome.inserted {
            self.inserted += 1;
        } else if outcome.updated {
            self.updated += 1;
        } else {
            self.unchanged += 1;
        }
        if partial {
            self.detail_failures += 1;
        }
        self
    }

    fn skip(mut self) -> Self {
        self.skipped += 1;
        self
    }

    fn stop(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }
}

// ── Harvester ─────────────────────────────────────────────────────────────────

/// Sequential harvest over one catalog source into one repository.
pub struct Harvester<'a, S: CatalogSource> {
    source: S,
    repo: &'a Repository,
    throttle: Throttle,
    page_size: u32,
    max_pages: Option<u32>,
    progress: ProgressReporter,
}

impl<'a, S: CatalogSource> Harvester<'a, S> {
    pub fn new(source: S, repo: &'a Repository, throttle: Throttle, page_size: u32) -> Self {
        Self {
            source,
            repo,
            throttle,
            page_size: page_size.max(1),
            max_pages: None,
            progress: ProgressReporter::hidden(PipelineConfig::default().progress_log_every),
        }
    }

    pub fn max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut page = 0u32;

        let summary = loop {
            if let Some(max) = self.max_pages
                && page >= max
            {
                warn!(max_pages = max, "Reached page limit, stopping");
                break summary.stop(StopReason::PageLimit);
            }

            // A page of id-less items issues no detail request to pace behind.
            if page > 0 {
                self.throttle.pace().await;
            }
            let listing = match self.source.fetch_page(page, self.page_size).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(page, status = e.status(), error = %e, "List fetch exhausted retries, ending run");
                    break summary.stop(StopReason::ListFetchFailed);
                }
            };
            summary.pages_fetched += 1;

            if summary.total_elements.is_none()
                && let Some(total) = listing.meta.as_ref().and_then(|m| m.total_elements)
            {
                summary.total_elements = Some(total);
                self.progress.set_total(total);
            }

            if listing.items.is_empty() {
                debug!(page, "Empty page, stopping pagination");
                break summary.stop(StopReason::EmptyPage);
            }

            info!(page, items = listing.items.len(), "Processing page");
            summary = self.process_page(&listing.items, summary).await?;

            page += 1;
            if let Some(total_pages) = listing.meta.as_ref().and_then(|m| m.total_pages)
                && page >= total_pages
            {
                info!(last_page = page - 1, total_pages, "Last page processed");
                break summary.stop(StopReason::LastPage);
            }
        };

        self.progress.finish(&summary);
        info!(
            total_processed = summary.total_processed,
            inserted = summary.inserted,
            updated = summary.updated,
            detail_failures = summary.detail_failures,
            total_elements = summary.total_elements,
            stop_reason = ?summary.stop_reason,
            "Harvest finished"
        );
        Ok(summary)
    }

    async fn process_page(&mut self, items: &[Value], mut summary: RunSummary) -> Result<RunSummary> {
        for item in items {
            let Some(base) = map_base_fields(item) else {
                debug!(?item, "List item without usable id, skipping");
                summary = summary.skip();
                continue;
            };

            // Base fields are cheap; map them before the rate-limited detail call.
            let record = CatalogRecord::from_base(base);
            let id = record.id;

            self.throttle.pace().await;
            let record = match self.source.fetch_detail(id).await {
                Ok(payload) => record.with_detail(payload),
                Err(e) => {
                    error!(
                        id,
                        status = e.status(),
                        snippet = e.snippet(),
                        headers = ?e.headers(),
                        error = %e,
                        "Detail fetch failed, storing partial record"
                    );
                    record.partial()
                }
            };

            let outcome = self
                .repo
                .upsert_record(&record)
                .with_context(|| format!("Failed to persist record {}", id))?;
            summary = summary.record(outcome, record.is_partial());
            self.progress
                .item_done(&summary, id, record.registration_number.as_deref());

            self.throttle.pace().await;
            self.throttle.batch_pause(summary.total_processed - 1).await;
        }
        Ok(summary)
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Wires config → store + HTTP session → harvester, and logs the run.
pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let Some(db_path) = self.config.storage.db_path.as_ref() else {
            warn!("storage.db_path is not configured; skipping harvest");
            return Ok(RunSummary::default().stop(StopReason::NoStore));
        };

        let repo = Repository::open(db_path).context("Failed to open DuckDB")?;
        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }

        let source = SenasaClient::new(&self.config.scraper).context("Failed to build catalog client")?;
        let progress = ProgressReporter::new(
            self.config.pipeline.progress_bar,
            self.config.pipeline.progress_log_every,
        );

        let run_id = repo.begin_scrape_run()?;
        let result = Harvester::new(
            source,
            &repo,
            Throttle::new(&self.config.throttle),
            self.config.scraper.page_size,
        )
        .max_pages(self.config.pipeline.max_pages)
        .progress(progress)
        .run()
        .await;

        let logged = match &result {
            Ok(s) => repo.finish_scrape_run(run_id, s.total_processed, s.inserted, s.updated, s.detail_failures, None),
            Err(e) => repo.finish_scrape_run(run_id, 0, 0, 0, 0, Some(&format!("{:#}", e))),
        };
        logged.context("Failed to record scrape run")?;

        result
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScraperConfig, ThrottleConfig};
    use crate::models::{CatalogPage, DetailPayload, PageMeta};
    use crate::scraper::FetchError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LIST_PATH: &str = "/api/search/publicSearchProductosFormuladosDTO";
    const DETAIL_PATH: &str = "/api/search/publicSearchProducto";

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn client(server: &MockServer) -> SenasaClient {
        SenasaClient::new(&ScraperConfig {
            base_url: format!("{}/api", server.uri()),
            retry_base_delay_ms: 1,
            ..ScraperConfig::default()
        })
        .unwrap()
    }

    fn list_body(items: Value, total_elements: u64, total_pages: u32) -> Value {
        json!({
            "_embedded": {"productosAgroquimicosFormulados": items},
            "page": {"totalElements": total_elements, "totalPages": total_pages, "size": 100}
        })
    }

    async fn mount_example_scenario(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list_body(
                json!([{"id": 1, "marca": "UREA"}, {"id": 2, "marca": "NPK"}]),
                2,
                1,
            )))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(DETAIL_PATH))
            .and(query_param("producto", format!("{}/api/1", server.uri()).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "estadoProducto": "Vigente",
                "envases": [{"capacidad": 5, "unidad": "L"}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(DETAIL_PATH))
            .and(query_param("producto", format!("{}/api/2", server.uri()).as_str()))
            .respond_with(ResponseTemplate::new(403).set_body_string("<html>Request blocked</html>"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_example_scenario_full_and_partial_records() {
        let server = MockServer::start().await;
        mount_example_scenario(&server).await;
        let repo = repo();

        let summary = Harvester::new(client(&server), &repo, Throttle::disabled(), 100)
            .run()
            .await
            .unwrap();

        assert_eq!(
            (summary.total_processed, summary.inserted, summary.updated),
            (2, 2, 0)
        );
        assert_eq!(summary.detail_failures, 1);
        assert_eq!(summary.stop_reason, Some(StopReason::LastPage));

        let full = repo.get_record(1).unwrap().unwrap();
        assert!(!full.detail_fetch_failed);
        assert_eq!(full.containers.len(), 1);
        assert_eq!(full.containers[0].capacity, Some(5.0));
        assert_eq!(full.containers[0].unit.as_deref(), Some("L"));

        let partial = repo.get_record(2).unwrap().unwrap();
        assert!(partial.detail_fetch_failed);
        assert!(partial.containers.is_empty());
        assert!(partial.detail.is_none());
        assert_eq!(partial.brand.as_deref(), Some("NPK"));

        // 1 attempt for id 1, 3 for id 2
        let detail_calls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == DETAIL_PATH)
            .count();
        assert_eq!(detail_calls, 4);
    }

    #[tokio::test]
    async fn test_second_run_converges_without_writes() {
        let server = MockServer::start().await;
        mount_example_scenario(&server).await;
        let repo = repo();

        Harvester::new(client(&server), &repo, Throttle::disabled(), 100)
            .run()
            .await
            .unwrap();
        let second = Harvester::new(client(&server), &repo, Throttle::disabled(), 100)
            .run()
            .await
            .unwrap();

        assert_eq!((second.inserted, second.updated), (0, 0));
        assert_eq!(second.unchanged, 2);
        assert_eq!(repo.record_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stops_after_total_pages() {
        let server = MockServer::start().await;
        for page in 0..3u32 {
            Mock::given(method("GET"))
                .and(path(LIST_PATH))
                .and(query_param("page", page.to_string().as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_json(list_body(
                    json!([{"id": page + 10, "marca": format!("P{}", page)}]),
                    3,
                    3,
                )))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list_body(json!([]), 3, 3)))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let repo = repo();
        let summary = Harvester::new(client(&server), &repo, Throttle::disabled(), 1)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.total_processed, 3);
        assert_eq!(summary.total_elements, Some(3));
        assert_eq!(summary.stop_reason, Some(StopReason::LastPage));
    }

    #[tokio::test]
    async fn test_list_failure_ends_run_gracefully() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {"productosAgroquimicosFormulados": [{"id": 7, "marca": "KEEP"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(403))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let repo = repo();
        let summary = Harvester::new(client(&server), &repo, Throttle::disabled(), 100)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::ListFetchFailed));
        assert_eq!(summary.inserted, 1);
        assert!(repo.get_record(7).unwrap().is_some());
    }

    // ── In-process source ─────────────────────────────────────────────────────

    struct StaticSource {
        pages: Vec<Vec<Value>>,
        list_calls: Mutex<u32>,
    }

    #[async_trait]
    impl CatalogSource for StaticSource {
        async fn fetch_page(&self, page: u32, _size: u32) -> Result<CatalogPage, FetchError> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(CatalogPage {
                items: self.pages.get(page as usize).cloned().unwrap_or_default(),
                meta: Some(PageMeta::default()),
            })
        }

        async fn fetch_detail(&self, _id: i64) -> Result<DetailPayload, FetchError> {
            Ok(DetailPayload::default())
        }
    }

    fn static_source(pages: Vec<Vec<Value>>) -> StaticSource {
        StaticSource { pages, list_calls: Mutex::new(0) }
    }

    /// Records when each upstream call was issued.
    struct TimedSource {
        pages: Vec<Vec<Value>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl TimedSource {
        fn new(pages: Vec<Vec<Value>>) -> Self {
            Self { pages, calls: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CatalogSource for TimedSource {
        async fn fetch_page(&self, page: u32, _size: u32) -> Result<CatalogPage, FetchError> {
            self.calls.lock().unwrap().push((format!("list{}", page), Instant::now()));
            Ok(CatalogPage {
                items: self.pages.get(page as usize).cloned().unwrap_or_default(),
                meta: Some(PageMeta::default()),
            })
        }

        async fn fetch_detail(&self, id: i64) -> Result<DetailPayload, FetchError> {
            self.calls.lock().unwrap().push((format!("detail{}", id), Instant::now()));
            Ok(DetailPayload::default())
        }
    }

    fn throttle(jitter_ms: (u64, u64), batch_size: usize, batch_pause_ms: u64) -> Throttle {
        Throttle::new(&ThrottleConfig {
            jitter_min_ms: jitter_ms.0,
            jitter_max_ms: jitter_ms.1,
            batch_size,
            batch_pause_ms,
        })
    }

    fn gap(calls: &[(String, Instant)], from: &str, to: &str) -> Duration {
        let at = |name: &str| calls.iter().find(|(n, _)| n == name).map(|(_, t)| *t).unwrap();
        at(to) - at(from)
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_upstream_call_is_paced() {
        let repo = repo();
        let mut harvester = Harvester::new(
            TimedSource::new(vec![vec![json!({"marca": "no id"})], vec![json!({"id": 1})]]),
            &repo,
            throttle((500, 900), 25, 5000),
            100,
        );
        let summary = harvester.run().await.unwrap();
        assert_eq!((summary.skipped, summary.total_processed), (1, 1));

        let calls = harvester.source.calls();
        let names: Vec<&str> = calls.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["list0", "list1", "detail1", "list2"]);
        for pair in calls.windows(2) {
            let waited = pair[1].1 - pair[0].1;
            assert!(
                waited >= Duration::from_millis(500),
                "{} -> {} after {:?}",
                pair[0].0,
                pair[1].0,
                waited
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_pause_after_every_25th_processed_item() {
        let repo = repo();
        // The id-less first item must not count towards the batch.
        let mut items = vec![json!({"marca": "no id"})];
        items.extend((1..=26).map(|id| json!({"id": id})));
        let mut harvester = Harvester::new(
            TimedSource::new(vec![items]),
            &repo,
            throttle((100, 100), 25, 5000),
            100,
        );
        let summary = harvester.run().await.unwrap();
        assert_eq!(summary.total_processed, 26);

        let calls = harvester.source.calls();
        let between = |from: &str, to: &str| gap(&calls, from, to).as_millis();
        // post-item jitter + pre-detail jitter
        assert!((200..250).contains(&between("detail1", "detail2")));
        assert!((200..250).contains(&between("detail24", "detail25")));
        assert!((5200..5250).contains(&between("detail25", "detail26")));
    }

    #[tokio::test]
    async fn test_items_without_id_are_skipped() {
        let repo = repo();
        let source = static_source(vec![vec![
            json!({"marca": "NO ID"}),
            json!({"id": "abc"}),
            json!({"productoId": "31", "marca": "OK"}),
        ]]);

        let summary = Harvester::new(source, &repo, Throttle::disabled(), 100)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.total_processed, 1);
        assert_eq!(summary.stop_reason, Some(StopReason::EmptyPage));
        assert_eq!(repo.record_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_page_without_metadata_stops() {
        let repo = repo();
        let mut harvester = Harvester::new(
            static_source(vec![vec![json!({"id": 1})], vec![json!({"id": 2})]]),
            &repo,
            Throttle::disabled(),
            100,
        );
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.total_processed, 2);
        assert_eq!(*harvester.source.list_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_max_pages_caps_run() {
        let repo = repo();
        let summary = Harvester::new(
            static_source(vec![vec![json!({"id": 1})], vec![json!({"id": 2})]]),
            &repo,
            Throttle::disabled(),
            100,
        )
        .max_pages(Some(1))
        .run()
        .await
        .unwrap();

        assert_eq!(summary.total_processed, 1);
        assert_eq!(summary.stop_reason, Some(StopReason::PageLimit));
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_run() {
        // No migrations: the table does not exist.
        let repo = Repository::open_in_memory().unwrap();
        let result = Harvester::new(
            static_source(vec![vec![json!({"id": 1})]]),
            &repo,
            Throttle::disabled(),
            100,
        )
        .run()
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pipeline_without_store_is_a_no_op() {
        let summary = Pipeline::new(AppConfig::default()).run().await.unwrap();
        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.stop_reason, Some(StopReason::NoStore));
    }

    #[tokio::test]
    async fn test_pipeline_logs_scrape_run() {
        let server = MockServer::start().await;
        mount_example_scenario(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.duckdb");

        let mut config = AppConfig::default();
        config.scraper.base_url = format!("{}/api", server.uri());
        config.scraper.retry_base_delay_ms = 1;
        config.throttle.jitter_min_ms = 0;
        config.throttle.jitter_max_ms = 0;
        config.throttle.batch_pause_ms = 0;
        config.storage.db_path = Some(db_path.clone());
        config.pipeline.progress_bar = false;

        let summary = Pipeline::new(config).run().await.unwrap();
        assert_eq!(summary.inserted, 2);

        let repo = Repository::open(&db_path).unwrap();
        let run = repo.last_scrape_run().unwrap().unwrap();
        assert_eq!(run.status, "success");
        assert_eq!((run.inserted, run.detail_failures), (2, 1));
    }
}
