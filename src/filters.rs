//! Post-search filter registry and built-in filters
//!
//! A post-search filter thins the product set between search and download.
//! Filters are built from a type name plus a parameter bundle. Names
//! containing `:` address extension filters (`"namespace:factory"`), which
//! must be registered explicitly at startup — nothing is ever loaded from
//! arbitrary code at runtime.

use crate::catalog::CatalogItem;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// The product set a filter operates on
pub type ProductSet = Vec<Arc<dyn CatalogItem>>;

/// A built post-search filter
pub type PostSearchFilter = Arc<dyn Fn(ProductSet) -> ProductSet + Send + Sync>;

/// Factory producing a filter from its parameter bundle
pub type FilterFactory =
    Arc<dyn Fn(&BTreeMap<String, serde_json::Value>) -> Result<PostSearchFilter> + Send + Sync>;

/// Registry of post-search filter factories.
///
/// `Default` carries the built-ins; extensions are added with
/// [`FilterRegistry::register`] before the pipeline is constructed.
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("sample_interval", Arc::new(sample_interval_factory));
        registry
    }
}

impl FilterRegistry {
    /// Register a filter factory under a name.
    ///
    /// Extension filters use `"namespace:factory"` names so config files
    /// can distinguish them from built-ins.
    pub fn register(&mut self, name: impl Into<String>, factory: FilterFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Build a filter from a type name and parameter bundle
    pub fn build(
        &self,
        kind: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<PostSearchFilter> {
        if let Some(factory) = self.factories.get(kind) {
            return factory(params);
        }

        if kind.contains(':') {
            return Err(Error::InvalidInput(format!(
                "extension filter '{kind}' is not registered; \
                 register it with FilterRegistry::register before building the pipeline"
            )));
        }

        let mut available: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        available.sort_unstable();
        Err(Error::InvalidInput(format!(
            "unknown post-search filter type '{kind}'; available built-ins: {}; \
             custom filters use a registered 'namespace:factory' name",
            available.join(", ")
        )))
    }
}

/// Built-in temporal subsampling: keep the earliest item per fixed-width
/// time bucket of `interval_hours`.
///
/// Items without a sensing-start timestamp cannot be bucketed and are
/// dropped with a warning.
fn sample_interval_factory(
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<PostSearchFilter> {
    let hours = params
        .get("interval_hours")
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| {
            Error::InvalidInput(
                "sample_interval requires a numeric 'interval_hours' parameter".to_string(),
            )
        })?;
    if hours <= 0.0 {
        return Err(Error::InvalidInput(
            "sample_interval 'interval_hours' must be positive".to_string(),
        ));
    }

    let interval_secs = hours * 3600.0;

    Ok(Arc::new(move |products: ProductSet| {
        let mut dated: Vec<(i64, Arc<dyn CatalogItem>)> = Vec::with_capacity(products.len());
        for product in products {
            match product.sensing_start() {
                Some(dt) => dated.push((dt.timestamp_millis(), product)),
                None => {
                    tracing::warn!(
                        item = product.id(),
                        "Item has no sensing-start timestamp, dropped by sample_interval"
                    );
                }
            }
        }
        dated.sort_by_key(|(millis, _)| *millis);

        let mut seen_buckets: HashSet<i64> = HashSet::new();
        let mut result = Vec::new();
        for (millis, product) in dated {
            let bucket = ((millis as f64 / 1000.0) / interval_secs).floor() as i64;
            if seen_buckets.insert(bucket) {
                result.push(product);
            }
        }
        result
    }))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockItem;
    use chrono::{TimeZone, Utc};

    fn params(json: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(json).unwrap()
    }

    fn item_at(id: &str, hour: u32, minute: u32) -> Arc<dyn CatalogItem> {
        Arc::new(
            MockItem::new(id, b"x")
                .with_sensing_start(Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()),
        )
    }

    fn ids(products: &ProductSet) -> Vec<&str> {
        products.iter().map(|p| p.id()).collect()
    }

    #[test]
    fn unknown_type_lists_builtins() {
        let registry = FilterRegistry::default();
        let err = registry.build("no_such_filter", &BTreeMap::new()).err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("no_such_filter"));
        assert!(msg.contains("sample_interval"));
    }

    #[test]
    fn unregistered_extension_names_get_a_registration_hint() {
        let registry = FilterRegistry::default();
        let err = registry.build("mymod:my_factory", &BTreeMap::new()).err().unwrap();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn registered_extension_resolves() {
        let mut registry = FilterRegistry::default();
        registry.register(
            "mymod:keep_none",
            Arc::new(|_params| Ok(Arc::new(|_products: ProductSet| Vec::new()) as PostSearchFilter)),
        );

        let filter = registry.build("mymod:keep_none", &BTreeMap::new()).unwrap();
        let out = filter(vec![item_at("P1", 0, 0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn sample_interval_requires_interval_hours() {
        let registry = FilterRegistry::default();
        assert!(registry.build("sample_interval", &BTreeMap::new()).is_err());
        assert!(
            registry
                .build("sample_interval", &params(serde_json::json!({"interval_hours": 0})))
                .is_err()
        );
        assert!(
            registry
                .build(
                    "sample_interval",
                    &params(serde_json::json!({"interval_hours": "three"}))
                )
                .is_err()
        );
    }

    #[test]
    fn sample_interval_keeps_earliest_per_bucket() {
        let registry = FilterRegistry::default();
        let filter = registry
            .build("sample_interval", &params(serde_json::json!({"interval_hours": 3})))
            .unwrap();

        // Buckets at 3h resolution: [00:00-03:00), [03:00-06:00), [06:00-09:00)
        let products: ProductSet = vec![
            item_at("A2", 1, 30),
            item_at("A1", 0, 15),
            item_at("B1", 3, 0),
            item_at("B2", 5, 59),
            item_at("C1", 6, 1),
        ];

        let out = filter(products);
        assert_eq!(ids(&out), vec!["A1", "B1", "C1"]);
    }

    #[test]
    fn sample_interval_output_is_subset_of_input() {
        let registry = FilterRegistry::default();
        let filter = registry
            .build("sample_interval", &params(serde_json::json!({"interval_hours": 1.0})))
            .unwrap();

        let products: ProductSet = vec![
            item_at("P1", 0, 0),
            item_at("P2", 0, 30),
            item_at("P3", 1, 0),
        ];
        let input_ids: Vec<String> = products.iter().map(|p| p.id().to_string()).collect();

        let out = filter(products);
        assert!(out.len() <= input_ids.len());
        for p in &out {
            assert!(input_ids.contains(&p.id().to_string()));
        }
    }

    #[test]
    fn sample_interval_bucket_starts_differ_by_at_least_one_boundary() {
        let registry = FilterRegistry::default();
        let hours = 2.0;
        let filter = registry
            .build("sample_interval", &params(serde_json::json!({"interval_hours": hours})))
            .unwrap();

        let products: ProductSet = vec![
            item_at("P1", 0, 0),
            item_at("P2", 0, 1),
            item_at("P3", 2, 0),
            item_at("P4", 2, 30),
            item_at("P5", 7, 45),
        ];
        let out = filter(products);

        let interval_secs = (hours * 3600.0) as i64;
        let starts: Vec<i64> = out
            .iter()
            .map(|p| p.sensing_start().unwrap().timestamp())
            .collect();
        for pair in starts.windows(2) {
            let bucket_a = pair[0].div_euclid(interval_secs);
            let bucket_b = pair[1].div_euclid(interval_secs);
            assert!(bucket_b > bucket_a, "kept items must land in distinct buckets");
        }
    }

    #[test]
    fn sample_interval_drops_items_without_sensing_start() {
        let registry = FilterRegistry::default();
        let filter = registry
            .build("sample_interval", &params(serde_json::json!({"interval_hours": 1})))
            .unwrap();

        let products: ProductSet = vec![
            Arc::new(MockItem::new("undated", b"x")),
            item_at("dated", 0, 0),
        ];
        let out = filter(products);
        assert_eq!(ids(&out), vec!["dated"]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let registry = FilterRegistry::default();
        let filter = registry
            .build("sample_interval", &params(serde_json::json!({"interval_hours": 1})))
            .unwrap();
        assert!(filter(Vec::new()).is_empty());
    }
}
