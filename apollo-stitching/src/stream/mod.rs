//! Stream combinators used for incremental delivery and subscriptions.

mod consolidator;
mod map;

use std::pin::Pin;

pub use consolidator::ConsolidatorHandle;
pub use consolidator::StreamConsolidator;
use futures::Stream;
pub use map::MapStream;
pub use map::map_stream;
use tower::BoxError;

/// A source of a [`StreamConsolidator`].
pub type BoxedSource<T> = Pin<Box<dyn Stream<Item = Result<T, BoxError>> + Send>>;
