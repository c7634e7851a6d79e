//! Shared fixtures for end-to-end tests: a wiremock-backed catalog.

use std::time::Duration;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

/// Matches requests that carry no Range header (so full-body product mocks
/// do not shadow byte-range mocks).
pub struct NoRangeHeader;

impl Match for NoRangeHeader {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("range")
    }
}

/// One product served by the mock catalog
pub struct ProductSpec {
    pub id: String,
    pub body: Vec<u8>,
    /// Digest advertised in search results; defaults to the body's MD5
    pub advertised_md5: String,
    pub sensing_start: String,
    pub sensing_end: String,
}

impl ProductSpec {
    pub fn new(id: &str, body: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            body: body.to_vec(),
            advertised_md5: format!("{:x}", md5::compute(body)),
            sensing_start: "2024-01-01T00:00:00Z".to_string(),
            sensing_end: "2024-01-01T00:15:00Z".to_string(),
        }
    }

    pub fn with_advertised_md5(mut self, md5: &str) -> Self {
        self.advertised_md5 = md5.to_string();
        self
    }
}

pub struct MockCatalog {
    pub server: MockServer,
}

impl MockCatalog {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn product_url(&self, id: &str) -> String {
        format!("{}/products/{id}", self.uri())
    }

    fn item_json(&self, spec: &ProductSpec) -> serde_json::Value {
        serde_json::json!({
            "id": spec.id,
            "size": spec.body.len() as f64 / 1000.0,
            "md5": spec.advertised_md5,
            "url": self.product_url(&spec.id),
            "sensing_start": spec.sensing_start,
            "sensing_end": spec.sensing_end,
        })
    }

    /// Mount count and search endpoints for a collection.
    pub async fn mount_search(&self, collection: &str, specs: &[ProductSpec]) {
        let items: Vec<serde_json::Value> = specs.iter().map(|s| self.item_json(s)).collect();
        let search_path = format!("/collections/{collection}/search");

        Mock::given(method("GET"))
            .and(path(search_path.clone()))
            .and(query_param("limit", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": specs.len(),
                "items": []
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(search_path))
            .and(query_param_is_missing("limit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": specs.len(),
                "items": items
            })))
            .mount(&self.server)
            .await;
    }

    /// Mount the full-body payload endpoint for a product. `expected_hits`
    /// is asserted when the server shuts down.
    pub async fn mount_product(&self, spec: &ProductSpec, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/products/{}", spec.id)))
            .and(NoRangeHeader)
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(spec.body.clone())
                    // A little latency keeps concurrent transfers overlapping
                    .set_delay(Duration::from_millis(5)),
            )
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    /// Mount a byte-range endpoint serving `body[offset..]` with 206.
    pub async fn mount_product_range(&self, spec: &ProductSpec, offset: usize) {
        Mock::given(method("GET"))
            .and(path(format!("/products/{}", spec.id)))
            .and(wiremock::matchers::header("range", format!("bytes={offset}-")))
            .respond_with(
                ResponseTemplate::new(206).set_body_bytes(spec.body[offset..].to_vec()),
            )
            .expect(1)
            .mount(&self.server)
            .await;
    }
}
