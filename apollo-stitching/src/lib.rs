//! Plans GraphQL operations over independent subgraphs and stitches their responses together.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]
#![warn(unreachable_pub)]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

pub mod configuration;
pub mod error;
pub mod graphql;
pub mod json_ext;
pub mod logging;
pub mod query_planner;
pub mod services;
pub mod spec;
mod stitcher;
pub mod stream;
mod sync;
pub mod test_harness;

pub use configuration::Configuration;
pub use query_planner::QueryPlan;
pub use query_planner::TYPENAME_MARKER;
pub use stitcher::ExecutionResult;
pub use stitcher::Stitcher;
pub use stitcher::SubscriptionResult;
