//! Entry points: plan an operation, run it against the subgraphs, stitch the results.

use std::fmt;
use std::sync::Arc;

use derivative::Derivative;

use crate::Configuration;
use crate::error::ExecutionError;
use crate::error::QueryPlannerError;
use crate::graphql::Error;
use crate::graphql::IntoGraphQLErrors;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::query_planner::CachingQueryPlanner;
use crate::query_planner::ExecutionParameters;
use crate::query_planner::QueryPlan;
use crate::query_planner::QueryPlanner;
use crate::services::SubgraphRegistry;
use crate::spec::OperationKind;
use crate::spec::UnifiedSchema;

/// The result of a query or a mutation.
pub enum ExecutionResult {
    /// A single response.
    Complete(Response),
    /// A response split because subgraphs deliver parts of it later.
    ///
    /// `initial` has `hasNext: true`; `subsequent` ends with a `{ "hasNext": false }` payload.
    Incremental {
        initial: Response,
        subsequent: ResponseStream,
    },
}

impl fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::Complete(response) => {
                f.debug_tuple("Complete").field(response).finish()
            }
            ExecutionResult::Incremental { initial, .. } => f
                .debug_struct("Incremental")
                .field("initial", initial)
                .finish_non_exhaustive(),
        }
    }
}

/// The result of a subscription.
pub enum SubscriptionResult {
    /// The subscription did not start, the response carries the errors.
    Single(Response),
    /// One stitched response per event.
    Stream(ResponseStream),
}

impl fmt::Debug for SubscriptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionResult::Single(response) => {
                f.debug_tuple("Single").field(response).finish()
            }
            SubscriptionResult::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Runs GraphQL operations over a set of subgraphs sharing a unified schema.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stitcher {
    subgraphs: Arc<SubgraphRegistry>,
    configuration: Arc<Configuration>,
    #[derivative(Debug = "ignore")]
    query_planner: CachingQueryPlanner,
}

impl Stitcher {
    pub fn new(
        schema: Arc<dyn UnifiedSchema>,
        subgraphs: SubgraphRegistry,
        configuration: Configuration,
    ) -> Self {
        let query_planner = CachingQueryPlanner::new(
            QueryPlanner::new(schema),
            configuration.query_planning.cache.limit,
        );
        Self {
            subgraphs: Arc::new(subgraphs),
            configuration: Arc::new(configuration),
            query_planner,
        }
    }

    /// Executes a query or a mutation.
    ///
    /// Invalid documents and operations no subgraph can resolve produce a response with
    /// errors. Only violations of the plan invariants are returned as `Err`.
    pub async fn execute(&self, request: Request) -> Result<ExecutionResult, ExecutionError> {
        let plan = match self.plan(&request)? {
            Ok(plan) => plan,
            Err(response) => return Ok(ExecutionResult::Complete(response)),
        };
        if plan.kind == OperationKind::Subscription {
            return Ok(ExecutionResult::Complete(wrong_entry_point(
                "subscriptions must be started with `subscribe`",
            )));
        }
        plan.execute(self.parameters(request)).await
    }

    /// Starts a subscription.
    pub async fn subscribe(&self, request: Request) -> Result<SubscriptionResult, ExecutionError> {
        let plan = match self.plan(&request)? {
            Ok(plan) => plan,
            Err(response) => return Ok(SubscriptionResult::Single(response)),
        };
        if plan.kind != OperationKind::Subscription {
            return Ok(SubscriptionResult::Single(wrong_entry_point(
                "queries and mutations must be run with `execute`",
            )));
        }
        plan.subscribe(self.parameters(request)).await
    }

    /// The plan of the requested operation, or the response reporting why there is none.
    fn plan(&self, request: &Request) -> Result<Result<Arc<QueryPlan>, Response>, ExecutionError> {
        let query = request.query.as_deref().unwrap_or_default();
        match self
            .query_planner
            .get(query, request.operation_name.as_deref())
        {
            Ok(plan) => Ok(Ok(plan)),
            Err(err) => match err.into_graphql_errors() {
                Ok(errors) => Ok(Err(Response::builder().errors(errors).build())),
                Err(QueryPlannerError::Planning(err)) => Err(err.into()),
                Err(err) => Err(ExecutionError::TaskFailed(err.to_string())),
            },
        }
    }

    fn parameters(&self, request: Request) -> ExecutionParameters {
        ExecutionParameters {
            subgraphs: self.subgraphs.clone(),
            variables: request.variables,
            incremental_delivery: self.configuration.incremental_delivery.enabled,
        }
    }
}

fn wrong_entry_point(message: &str) -> Response {
    Response::builder()
        .error(
            Error::builder()
                .message(message)
                .extension_code("GRAPHQL_VALIDATION_FAILED")
                .build(),
        )
        .build()
}
