//! Stitching errors.
use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

pub(crate) use crate::graphql::Error;
use crate::graphql::ErrorExtension;
use crate::graphql::IntoGraphQLErrors;
use crate::graphql::Response;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::spec::SpecError;

/// Error types for subgraph fetches.
///
/// Note that these are not actually returned to the client, but are instead converted to JSON for
/// [`struct@Error`].
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// HTTP fetch failed from '{service}': {reason}
    ///
    /// note that this relates to a transport error and not a GraphQL error
    SubrequestHttpError {
        /// The service failed.
        service: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// service '{service}' response was malformed: {reason}
    SubrequestMalformedResponse {
        /// The service that responded with the malformed response.
        service: String,

        /// The reason the response is invalid.
        reason: String,
    },

    /// no subgraph named '{service}' is registered
    UnknownSubgraph {
        /// The service the plan refers to.
        service: String,
    },

    /// subgraph '{service}' does not support subscriptions
    SubscriptionNotSupported {
        /// The service that was asked to subscribe.
        service: String,
    },
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub(crate) fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut extensions = match serde_json_bytes::to_value(self) {
            Ok(Value::Object(object)) => object,
            _ => Default::default(),
        };
        extensions
            .entry("code")
            .or_insert_with(|| self.extension_code().into());
        // the reason is already part of the message
        extensions.remove("reason");

        Error {
            message: self.to_string(),
            locations: Default::default(),
            path,
            extensions,
        }
    }

    /// Convert the error to an appropriate response.
    pub(crate) fn to_response(&self) -> Response {
        Response {
            errors: vec![self.to_graphql_error(None)],
            ..Response::default()
        }
    }
}

impl ErrorExtension for FetchError {
    fn extension_code(&self) -> String {
        match self {
            FetchError::SubrequestHttpError { .. } => "SUBREQUEST_HTTP_ERROR",
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
            FetchError::UnknownSubgraph { .. } => "UNKNOWN_SUBGRAPH",
            FetchError::SubscriptionNotSupported { .. } => "SUBSCRIPTION_NOT_SUPPORTED",
        }
        .to_string()
    }
}

/// Errors raised while building a query plan.
#[derive(Error, Debug, Display, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum QueryPlannerError {
    /// spec error: {0}
    SpecError(SpecError),

    /// {reason}
    Routing {
        /// Why the operation cannot be routed.
        reason: String,
    },

    /// query planning failed: {0}
    Planning(PlanningError),
}

impl From<SpecError> for QueryPlannerError {
    fn from(err: SpecError) -> Self {
        QueryPlannerError::SpecError(err)
    }
}

impl From<PlanningError> for QueryPlannerError {
    fn from(err: PlanningError) -> Self {
        QueryPlannerError::Planning(err)
    }
}

impl ErrorExtension for QueryPlannerError {
    fn extension_code(&self) -> String {
        match self {
            QueryPlannerError::SpecError(err) => err.extension_code(),
            QueryPlannerError::Routing { .. } => "ROUTING_ERROR".to_string(),
            QueryPlannerError::Planning(_) => "QUERY_PLANNING_FAILED".to_string(),
        }
    }
}

impl IntoGraphQLErrors for QueryPlannerError {
    fn into_graphql_errors(self) -> Result<Vec<Error>, Self> {
        match self {
            QueryPlannerError::SpecError(err) => Ok(vec![
                Error::builder()
                    .message(err.to_string())
                    .extension_code(err.extension_code())
                    .build(),
            ]),
            QueryPlannerError::Routing { ref reason } => Ok(vec![
                Error::builder()
                    .message(reason.clone())
                    .extension_code(self.extension_code())
                    .build(),
            ]),
            QueryPlannerError::Planning(_) => Err(self),
        }
    }
}

/// Invariant violations detected while planning or stitching.
///
/// These are defects of the unified schema or of the planner and abort the whole execution.
#[derive(Error, Debug, Display, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum PlanningError {
    /// type condition '{type_condition}' does not name a composite type
    InvalidTypeCondition {
        /// The offending type condition.
        type_condition: String,
    },

    /// unknown type '{0}'
    UnknownType(String),

    /// unknown fragment '{0}'
    UnknownFragment(String),

    /// no field plan at '{path}'
    MissingFieldPlan {
        /// Where in the response the plan was expected.
        path: Path,
    },

    /// cannot resolve the concrete type at '{path}' among {candidates} possible types: the type marker is missing
    MissingTypeMarker {
        /// Where in the response the marker was expected.
        path: Path,
        /// How many concrete types have a plan at this position.
        candidates: usize,
    },
}

/// Fatal execution errors.
///
/// No partial response is produced when one of those is returned.
#[derive(Error, Debug, Display, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExecutionError {
    /// query planning failed: {0}
    Planning(PlanningError),

    /// stitching task failed: {0}
    TaskFailed(String),
}

impl From<PlanningError> for ExecutionError {
    fn from(err: PlanningError) -> Self {
        ExecutionError::Planning(err)
    }
}

impl From<JoinError> for ExecutionError {
    fn from(err: JoinError) -> Self {
        ExecutionError::TaskFailed(err.to_string())
    }
}
