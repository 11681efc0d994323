use std::marker::PhantomData;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::FusedStream;
use futures::stream::SelectAll;
use tower::BoxError;

use super::BoxedSource;

/// Merges a dynamic set of sources into a single stream.
///
/// Items are yielded in the order they become available. Sources can be added while the
/// stream is being consumed, through a [`ConsolidatorHandle`]. The stream only ends once
/// the handle is closed and every source has ended.
///
/// The first failing source terminates the whole stream: its error is yielded, then every
/// other source is dropped.
pub struct StreamConsolidator<T, U, P> {
    sources: SelectAll<BoxedSource<T>>,
    incoming: mpsc::UnboundedReceiver<BoxedSource<T>>,
    closed: bool,
    terminated: bool,
    processor: P,
    _output: PhantomData<fn() -> U>,
}

/// Adds sources to a [`StreamConsolidator`] and closes it.
pub struct ConsolidatorHandle<T> {
    sender: mpsc::UnboundedSender<BoxedSource<T>>,
}

impl<T> Clone for ConsolidatorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> ConsolidatorHandle<T> {
    /// Registers a new source, returns false if the consolidator is closed or gone.
    pub fn add(&self, source: BoxedSource<T>) -> bool {
        self.sender.unbounded_send(source).is_ok()
    }

    /// No more sources will be added. Sources already registered keep running.
    pub fn close(&self) {
        self.sender.close_channel();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<T, U, P> StreamConsolidator<T, U, P>
where
    P: FnMut(T) -> Option<U>,
{
    /// Creates a consolidator over `initial`.
    ///
    /// Every item goes through `processor`, items mapped to `None` are skipped.
    pub fn new(
        initial: impl IntoIterator<Item = BoxedSource<T>>,
        processor: P,
    ) -> (Self, ConsolidatorHandle<T>) {
        let (sender, incoming) = mpsc::unbounded();
        let mut sources = SelectAll::new();
        for source in initial {
            sources.push(source);
        }
        (
            Self {
                sources,
                incoming,
                closed: false,
                terminated: false,
                processor,
                _output: PhantomData,
            },
            ConsolidatorHandle { sender },
        )
    }

    fn drain_incoming(&mut self, cx: &mut Context<'_>) {
        while !self.closed {
            match self.incoming.poll_next_unpin(cx) {
                Poll::Ready(Some(source)) => self.sources.push(source),
                Poll::Ready(None) => self.closed = true,
                Poll::Pending => break,
            }
        }
    }
}

impl<T, U, P> Stream for StreamConsolidator<T, U, P>
where
    P: FnMut(T) -> Option<U> + Unpin,
{
    type Item = Result<U, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.terminated {
            return Poll::Ready(None);
        }
        loop {
            this.drain_incoming(cx);
            match this.sources.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(item))) => {
                    if let Some(item) = (this.processor)(item) {
                        return Poll::Ready(Some(Ok(item)));
                    }
                }
                Poll::Ready(Some(Err(error))) => {
                    this.terminated = true;
                    let remaining = std::mem::take(&mut this.sources);
                    tracing::debug!(
                        remaining = remaining.len(),
                        "source failed, dropping the remaining sources"
                    );
                    drop(remaining);
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) if this.closed => {
                    this.terminated = true;
                    return Poll::Ready(None);
                }
                // every source has ended, waiting on the handle
                Poll::Ready(None) => return Poll::Pending,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T, U, P> FusedStream for StreamConsolidator<T, U, P>
where
    P: FnMut(T) -> Option<U> + Unpin,
{
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<T, U, P> Drop for StreamConsolidator<T, U, P> {
    fn drop(&mut self) {
        if !self.sources.is_empty() {
            tracing::debug!(
                remaining = self.sources.len(),
                "consolidator dropped with active sources"
            );
        }
    }
}
