use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::QueryPlan;
use super::QueryPlanner;
use crate::error::QueryPlannerError;
use crate::spec::Operation;

/// Cache key: the document text and the selected operation.
///
/// Plans only depend on the document and on the unified schema, a cache never outlives the
/// schema it was built for.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) struct CachingQueryKey {
    pub(crate) query: String,
    pub(crate) operation_name: Option<String>,
}

/// A query planner wrapper that caches results.
///
/// The query planner performs LRU caching. Failures are cached too: planning is deterministic.
pub(crate) struct CachingQueryPlanner {
    delegate: QueryPlanner,
    cache: Mutex<LruCache<CachingQueryKey, Result<Arc<QueryPlan>, QueryPlannerError>>>,
}

impl CachingQueryPlanner {
    /// Creates a new query planner that caches the results of another [`QueryPlanner`].
    pub(crate) fn new(delegate: QueryPlanner, limit: NonZeroUsize) -> Self {
        Self {
            delegate,
            cache: Mutex::new(LruCache::new(limit)),
        }
    }

    pub(crate) fn get(
        &self,
        query: &str,
        operation_name: Option<&str>,
    ) -> Result<Arc<QueryPlan>, QueryPlannerError> {
        let key = CachingQueryKey {
            query: query.to_string(),
            operation_name: operation_name.map(str::to_string),
        };

        if let Some(entry) = self.cache.lock().get(&key) {
            tracing::info!(
                monotonic_counter.apollo.stitching.query_planning.cache.hit = 1u64,
                "query plan cache hit"
            );
            return entry.clone();
        }
        tracing::info!(
            monotonic_counter.apollo.stitching.query_planning.cache.miss = 1u64,
            "query plan cache miss"
        );

        // planning happens outside of the lock, two concurrent misses both plan
        let entry = Operation::from_document(query, operation_name)
            .map_err(QueryPlannerError::from)
            .and_then(|operation| self.delegate.plan(Arc::new(operation)))
            .map(Arc::new);
        self.cache.lock().put(key, entry.clone());
        entry
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Supergraph;
    use crate::spec::UnifiedSchema;

    fn planner(limit: usize) -> CachingQueryPlanner {
        let schema: Arc<dyn UnifiedSchema> = Arc::new(
            Supergraph::builder()
                .subgraph("products", "type Query { topProducts: [Product] } type Product { upc: String name: String }")
                .subgraph("inventory", "type Query { _inventory: Int } type Product { upc: String inStock: Boolean }")
                .build()
                .unwrap(),
        );
        CachingQueryPlanner::new(
            QueryPlanner::new(schema),
            NonZeroUsize::new(limit).unwrap(),
        )
    }

    #[test]
    fn test_cache_hit_returns_the_same_plan() {
        let planner = planner(8);
        let first = planner
            .get("{ topProducts { name inStock } }", None)
            .unwrap();
        let second = planner
            .get("{ topProducts { name inStock } }", None)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(planner.len(), 1);

        let named = planner
            .get("query Top { topProducts { name inStock } }", Some("Top"))
            .unwrap();
        assert_eq!(named.root, first.root);
        assert_eq!(planner.len(), 2);
    }

    #[test]
    fn test_errors_are_cached() {
        let planner = planner(8);
        let error = planner.get("{ missing }", None).unwrap_err();
        assert!(matches!(error, QueryPlannerError::Routing { .. }));
        assert_eq!(planner.get("{ missing }", None).unwrap_err(), error);
        assert_eq!(planner.len(), 1);

        assert!(matches!(
            planner.get("{ topProducts ", None),
            Err(QueryPlannerError::SpecError(_))
        ));
    }

    #[test]
    fn test_least_recently_used_plan_is_evicted() {
        let planner = planner(1);
        let first = planner.get("{ topProducts { upc } }", None).unwrap();
        planner.get("{ topProducts { name } }", None).unwrap();
        assert_eq!(planner.len(), 1);
        let again = planner.get("{ topProducts { upc } }", None).unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(first, again);
    }
}
