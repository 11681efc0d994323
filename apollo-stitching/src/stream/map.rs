use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use futures::Stream;
use futures::stream::FusedStream;
use pin_project_lite::pin_project;

pin_project! {
    /// Maps every item of a stream through an asynchronous function, preserving order.
    ///
    /// The source is only pulled once the previous mapping has completed, so at most one
    /// mapping runs at a time. Dropping the stream drops the source and the mapping in flight.
    #[must_use = "streams do nothing unless polled"]
    pub struct MapStream<S, F, Fut> {
        #[pin]
        stream: S,
        f: F,
        #[pin]
        pending: Option<Fut>,
        done: bool,
    }
}

/// Wraps `stream` so that every item goes through `f`.
pub fn map_stream<S, F, Fut>(stream: S, f: F) -> MapStream<S, F, Fut>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future,
{
    MapStream {
        stream,
        f,
        pending: None,
        done: false,
    }
}

impl<S, F, Fut> Stream for MapStream<S, F, Fut>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future,
{
    type Item = Fut::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(pending) = this.pending.as_mut().as_pin_mut() {
                let mapped = ready!(pending.poll(cx));
                this.pending.set(None);
                return Poll::Ready(Some(mapped));
            }
            if *this.done {
                return Poll::Ready(None);
            }
            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(item) => this.pending.set(Some((this.f)(item))),
                None => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pending = usize::from(self.pending.is_some());
        if self.done {
            return (pending, Some(pending));
        }
        let (lower, upper) = self.stream.size_hint();
        (
            lower.saturating_add(pending),
            upper.and_then(|upper| upper.checked_add(pending)),
        )
    }
}

impl<S, F, Fut> FusedStream for MapStream<S, F, Fut>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future,
{
    fn is_terminated(&self) -> bool {
        self.done && self.pending.is_none()
    }
}
