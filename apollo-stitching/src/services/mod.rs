//! The interfaces the stitching engine uses to reach its subgraphs.

pub use self::subgraph::Subgraph;
pub use self::subgraph::SubgraphRegistry;
pub use self::subgraph::SubgraphResponse;
pub use self::subgraph::SubscriptionResponse;

pub mod subgraph;
