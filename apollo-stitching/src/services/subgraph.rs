//! Subgraph calls.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tower::BoxError;

use crate::graphql::Request;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::spec::SubgraphName;

/// The answer of a subgraph to a query or a mutation.
pub enum SubgraphResponse {
    /// A single response.
    Complete(Response),
    /// A response split by `@defer` or `@stream`: the initial payload, then the subsequent ones.
    Incremental {
        initial: Response,
        subsequent: ResponseStream,
    },
}

impl From<Response> for SubgraphResponse {
    fn from(response: Response) -> Self {
        SubgraphResponse::Complete(response)
    }
}

impl fmt::Debug for SubgraphResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubgraphResponse::Complete(response) => {
                f.debug_tuple("Complete").field(response).finish()
            }
            SubgraphResponse::Incremental { initial, .. } => f
                .debug_struct("Incremental")
                .field("initial", initial)
                .finish_non_exhaustive(),
        }
    }
}

/// The answer of a subgraph to a subscription.
pub enum SubscriptionResponse {
    /// The subscription could not start, the response carries the errors.
    Single(Response),
    /// One response per event.
    Stream(ResponseStream),
}

impl fmt::Debug for SubscriptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionResponse::Single(response) => {
                f.debug_tuple("Single").field(response).finish()
            }
            SubscriptionResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A subgraph, as seen by the stitching engine.
///
/// Transport, retries and timeouts are the implementor's concern: a call that never settles
/// stalls the execution that issued it.
#[async_trait]
pub trait Subgraph: Send + Sync {
    /// Executes a query or a mutation.
    ///
    /// An `Err` is a transport failure and is reported as a `SUBREQUEST_HTTP_ERROR`.
    async fn execute(&self, request: Request) -> Result<SubgraphResponse, BoxError>;

    /// Whether [`Subgraph::subscribe`] is implemented.
    fn supports_subscriptions(&self) -> bool {
        false
    }

    /// Starts a subscription.
    ///
    /// Only called on subgraphs returning true from [`Subgraph::supports_subscriptions`].
    async fn subscribe(&self, _request: Request) -> Result<SubscriptionResponse, BoxError> {
        Err("subscriptions are not supported".into())
    }
}

/// The subgraphs available to an execution, by name, in registration order.
#[derive(Clone, Default)]
pub struct SubgraphRegistry {
    subgraphs: IndexMap<SubgraphName, Arc<dyn Subgraph>>,
}

impl SubgraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `subgraph` under `name`.
    pub fn with(mut self, name: impl Into<SubgraphName>, subgraph: Arc<dyn Subgraph>) -> Self {
        self.insert(name, subgraph);
        self
    }

    /// Registers `subgraph` under `name`, replacing any previous registration.
    pub fn insert(&mut self, name: impl Into<SubgraphName>, subgraph: Arc<dyn Subgraph>) {
        self.subgraphs.insert(name.into(), subgraph);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Subgraph>> {
        self.subgraphs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subgraphs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subgraphs.is_empty()
    }
}

impl fmt::Debug for SubgraphRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.subgraphs.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    struct Static;

    #[async_trait]
    impl Subgraph for Static {
        async fn execute(&self, _request: Request) -> Result<SubgraphResponse, BoxError> {
            Ok(Response::builder().data(json!({ "ok": true })).build().into())
        }
    }

    #[tokio::test]
    async fn test_subscriptions_are_unsupported_by_default() {
        let subgraph = Static;
        assert!(!subgraph.supports_subscriptions());
        let error = subgraph
            .subscribe(Request::builder().query("subscription { s }").build())
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "subscriptions are not supported");
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let mut registry = SubgraphRegistry::new().with("b", Arc::new(Static));
        registry.insert("a", Arc::new(Static));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(format!("{registry:?}"), r#"["b", "a"]"#);
    }
}
