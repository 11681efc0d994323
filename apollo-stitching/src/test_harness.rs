//! Test utilities: canned subgraphs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tower::BoxError;

use crate::graphql::Error;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::json_ext::Value;
use crate::services::Subgraph;
use crate::services::SubgraphResponse;
use crate::services::SubscriptionResponse;

#[derive(Clone)]
enum MockResponse {
    Complete(Value),
    Incremental {
        initial: Value,
        subsequent: Vec<Response>,
    },
    Events(Vec<Value>),
}

/// A subgraph answering with canned responses, keyed by query text.
///
/// Queries without a canned response get a response carrying a single error.
#[derive(Default)]
pub struct MockSubgraph {
    mocks: HashMap<String, MockResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<Request>>,
    // using an arc so that the count survives the drop of a call in flight
    pending: Arc<AtomicUsize>,
}

impl MockSubgraph {
    pub fn builder() -> MockSubgraphBuilder {
        MockSubgraphBuilder::default()
    }

    /// The requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Calls started and neither answered nor cancelled yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn answer(&self, request: Request) -> Option<MockResponse> {
        let _pending = Pending::new(&self.pending);
        let query = request.query.clone().unwrap_or_default();
        self.requests.lock().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.mocks.get(&query).cloned()
    }
}

/// Builder of [`MockSubgraph`].
#[derive(Default)]
pub struct MockSubgraphBuilder {
    mocks: HashMap<String, MockResponse>,
    delay: Option<Duration>,
}

impl MockSubgraphBuilder {
    /// Answers `query` with `response`, a JSON GraphQL response.
    pub fn response(mut self, query: impl Into<String>, response: Value) -> Self {
        self.mocks
            .insert(query.into(), MockResponse::Complete(response));
        self
    }

    /// Answers `query` with `initial`, then streams `subsequent`.
    pub fn incremental_response(
        mut self,
        query: impl Into<String>,
        initial: Value,
        subsequent: Vec<Response>,
    ) -> Self {
        self.mocks.insert(
            query.into(),
            MockResponse::Incremental {
                initial,
                subsequent,
            },
        );
        self
    }

    /// Answers the subscription `query` with `events`.
    pub fn subscription(mut self, query: impl Into<String>, events: Vec<Value>) -> Self {
        self.mocks.insert(query.into(), MockResponse::Events(events));
        self
    }

    /// Delays every answer and every subscription event.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn build(self) -> MockSubgraph {
        MockSubgraph {
            mocks: self.mocks,
            delay: self.delay,
            requests: Default::default(),
            pending: Default::default(),
        }
    }
}

struct Pending(Arc<AtomicUsize>);

impl Pending {
    fn new(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self(pending.clone())
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn to_response(value: Value) -> Result<Response, BoxError> {
    Ok(serde_json_bytes::from_value(value)?)
}

fn missing_mock(query: Option<&str>) -> Response {
    Response::builder()
        .data(Value::Null)
        .error(
            Error::builder()
                .message(format!(
                    "couldn't find mock for query {}",
                    query.unwrap_or_default()
                ))
                .build(),
        )
        .build()
}

#[async_trait]
impl Subgraph for MockSubgraph {
    async fn execute(&self, request: Request) -> Result<SubgraphResponse, BoxError> {
        let query = request.query.clone();
        match self.answer(request).await {
            Some(MockResponse::Complete(response)) => Ok(to_response(response)?.into()),
            Some(MockResponse::Incremental {
                initial,
                subsequent,
            }) => Ok(SubgraphResponse::Incremental {
                initial: to_response(initial)?,
                subsequent: stream::iter(subsequent).boxed(),
            }),
            Some(MockResponse::Events(_)) | None => Ok(missing_mock(query.as_deref()).into()),
        }
    }

    fn supports_subscriptions(&self) -> bool {
        self.mocks
            .values()
            .any(|mock| matches!(mock, MockResponse::Events(_)))
    }

    async fn subscribe(&self, request: Request) -> Result<SubscriptionResponse, BoxError> {
        let query = request.query.clone();
        let Some(MockResponse::Events(events)) = self.answer(request).await else {
            return Ok(SubscriptionResponse::Single(missing_mock(query.as_deref())));
        };
        let delay = self.delay;
        let events = stream::iter(events).then(move |event| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            to_response(event).unwrap_or_else(|err| {
                Response::builder()
                    .error(Error::builder().message(err.to_string()).build())
                    .build()
            })
        });
        Ok(SubscriptionResponse::Stream(events.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[tokio::test]
    async fn test_canned_responses_are_keyed_by_query() {
        let subgraph = MockSubgraph::builder()
            .response("query { a }", json!({ "data": { "a": 1 } }))
            .build();

        let SubgraphResponse::Complete(response) = subgraph
            .execute(Request::builder().query("query { a }").build())
            .await
            .unwrap()
        else {
            panic!("expected a complete response");
        };
        assert_eq!(response.data, Some(json!({ "a": 1 })));

        let SubgraphResponse::Complete(response) = subgraph
            .execute(Request::builder().query("query { b }").build())
            .await
            .unwrap()
        else {
            panic!("expected a complete response");
        };
        assert_eq!(response.data, Some(Value::Null));
        assert_eq!(
            response.errors[0].message,
            "couldn't find mock for query query { b }"
        );
        assert_eq!(subgraph.requests().len(), 2);
        assert_eq!(subgraph.pending(), 0);
        assert!(!subgraph.supports_subscriptions());
    }

    #[tokio::test]
    async fn test_subscription_events() {
        let subgraph = MockSubgraph::builder()
            .subscription(
                "subscription { ticks }",
                vec![json!({ "data": { "ticks": 1 } }), json!({ "data": { "ticks": 2 } })],
            )
            .build();
        assert!(subgraph.supports_subscriptions());

        let SubscriptionResponse::Stream(events) = subgraph
            .subscribe(Request::builder().query("subscription { ticks }").build())
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };
        let events: Vec<_> = events.map(|event| event.data).collect().await;
        assert_eq!(
            events,
            vec![Some(json!({ "ticks": 1 })), Some(json!({ "ticks": 2 }))]
        );
    }
}
