pub mod cleaner;
pub mod http_client;
pub mod retry;
pub mod throttle;

use crate::config::ScraperConfig;
use crate::models::{CatalogPage, DetailPayload};
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use self::cleaner::{map_detail, map_page};
pub use self::http_client::{FetchError, HttpClient};
use self::retry::{with_retry, RetryPolicy};

const LIST_PROJECTION: &str = "search/publicSearchProductosFormuladosDTO";
const DETAIL_PROJECTION: &str = "search/publicSearchProducto";
const DETAIL_PROJECTION_NAME: &str = "productoFormuladoPublicoProjection";
/// Descending registration number keeps page offsets stable while upstream grows.
const LIST_SORT: &str = "numeroInscripcion,desc";

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable catalog source. Both calls are already retried.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_page(&self, page: u32, size: u32) -> Result<CatalogPage, FetchError>;
    async fn fetch_detail(&self, id: i64) -> Result<DetailPayload, FetchError>;
}

// ── SENASA client ─────────────────────────────────────────────────────────────

pub struct SenasaClient {
    client: HttpClient,
    base_url: String,
    retry: RetryPolicy,
}

impl SenasaClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Ok(Self::with_session(HttpClient::new(config)?, config))
    }

    pub fn with_session(client: HttpClient, config: &ScraperConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(config),
        }
    }

    fn list_url(&self) -> String {
        format!("{}/{}", self.base_url, LIST_PROJECTION)
    }

    fn detail_url(&self) -> String {
        format!("{}/{}", self.base_url, DETAIL_PROJECTION)
    }

    /// The detail endpoint is queried by the product's own resource URL.
    fn self_url(&self, id: i64) -> String {
        format!("{}/{}", self.base_url, id)
    }
}

#[async_trait]
impl CatalogSource for SenasaClient {
    async fn fetch_page(&self, page: u32, size: u32) -> Result<CatalogPage, FetchError> {
        let url = self.list_url();
        let params = [
            ("page", page.to_string()),
            ("size", size.to_string()),
            ("sort", LIST_SORT.to_string()),
        ];
        let body = with_retry(self.retry, "list fetch", || self.client.get_json(&url, &params)).await?;

        let page_data = map_page(&body);
        debug!(page, items = page_data.items.len(), meta = ?page_data.meta, "Fetched list page");
        Ok(page_data)
    }

    async fn fetch_detail(&self, id: i64) -> Result<DetailPayload, FetchError> {
        let url = self.detail_url();
        let params = [
            ("producto", self.self_url(id)),
            ("projection", DETAIL_PROJECTION_NAME.to_string()),
        ];
        let body = with_retry(self.retry, "detail fetch", || self.client.get_json(&url, &params)).await?;

        let payload = map_detail(&body);
        debug!(id, containers = payload.containers.len(), "Fetched detail");
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str) -> ScraperConfig {
        ScraperConfig {
            base_url: format!("{}/api/productos/", base),
            retry_base_delay_ms: 1,
            ..ScraperConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_page_sends_sort_and_maps_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/productos/search/publicSearchProductosFormuladosDTO"))
            .and(query_param("page", "0"))
            .and(query_param("size", "100"))
            .and(query_param("sort", "numeroInscripcion,desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {"productosAgroquimicosFormulados": [{"id": 1, "marca": "UREA"}]},
                "page": {"totalElements": 1, "totalPages": 1, "number": 0, "size": 100}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = SenasaClient::new(&config(&server.uri())).unwrap();
        let page = source.fetch_page(0, 100).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.meta.and_then(|m| m.total_pages), Some(1));
    }

    #[tokio::test]
    async fn test_fetch_detail_uses_self_url_query() {
        let server = MockServer::start().await;
        let self_url = format!("{}/api/productos/42", server.uri());
        Mock::given(method("GET"))
            .and(path("/api/productos/search/publicSearchProducto"))
            .and(query_param("producto", self_url.as_str()))
            .and(query_param("projection", "productoFormuladoPublicoProjection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pais": "ARGENTINA",
                "envases": [{"capacidad": 20, "unidad": "L", "material": "PEAD"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = SenasaClient::new(&config(&server.uri())).unwrap();
        let payload = source.fetch_detail(42).await.unwrap();
        assert_eq!(payload.detail.country.as_deref(), Some("ARGENTINA"));
        assert_eq!(payload.containers[0].material.as_deref(), Some("PEAD"));
    }

    #[tokio::test]
    async fn test_fetch_detail_retries_then_surfaces_403() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/productos/search/publicSearchProducto"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
            .expect(3)
            .mount(&server)
            .await;

        let source = SenasaClient::new(&config(&server.uri())).unwrap();
        let err = source.fetch_detail(2).await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.snippet(), Some("Forbidden"));
    }
}
