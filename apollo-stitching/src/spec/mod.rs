//! GraphQL documents and the unified schema they run against.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub(crate) mod operation;
pub(crate) mod schema;

use displaydoc::Display;
pub use operation::Argument;
pub use operation::Directive;
pub use operation::Field;
pub use operation::FragmentDefinition;
pub use operation::FragmentSpread;
pub use operation::Fragments;
pub use operation::InlineFragment;
pub use operation::InputValue;
pub use operation::Operation;
pub use operation::OperationKind;
pub use operation::Selection;
pub use operation::SelectionSet;
pub use operation::VariableDefinition;
pub use schema::FieldDefinition;
pub use schema::SchemaError;
pub use schema::SubgraphName;
pub use schema::Supergraph;
pub use schema::SupergraphBuilder;
pub use schema::TypeDefinition;
pub use schema::TypeKind;
pub use schema::UnifiedSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::graphql::ErrorExtension;

pub(crate) const TYPENAME: &str = "__typename";

/// GraphQL parsing errors.
#[derive(Error, Debug, Display, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum SpecError {
    /// parsing error: {0}
    ParsingError(String),
    /// Unknown operation named "{0}"
    UnknownOperation(String),
    /// Must provide operation name if query contains multiple operations.
    MultipleOperationWithoutOperationName,
    /// no operation found in the document
    NoOperation,
}

impl ErrorExtension for SpecError {
    fn extension_code(&self) -> String {
        match self {
            SpecError::ParsingError(_) => "PARSING_ERROR",
            SpecError::UnknownOperation(_)
            | SpecError::MultipleOperationWithoutOperationName
            | SpecError::NoOperation => "GRAPHQL_VALIDATION_FAILED",
        }
        .to_string()
    }
}
