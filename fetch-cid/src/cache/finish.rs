//! Streams that run a cleanup callback exactly once
//!
//! [`OnFinish`] couples "the stream is over" with "release what backs it".
//! The callback fires on whichever comes first: the inner stream reporting
//! end-of-data, or the wrapper being dropped (the Rust form of cancelling
//! a stream). The inner stream is dropped before the callback runs, so a
//! file handle owned by it is already closed when the callback observes
//! the finish.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Stream wrapper that invokes `on_finish` exactly once
pub struct OnFinish<S, F>
where
    F: FnOnce(),
{
    inner: Option<S>,
    on_finish: Option<F>,
}

impl<S, F> OnFinish<S, F>
where
    S: Stream + Unpin,
    F: FnOnce() + Unpin,
{
    /// Wrap `inner`, running `on_finish` when it completes or is cancelled
    pub fn new(inner: S, on_finish: F) -> Self {
        Self {
            inner: Some(inner),
            on_finish: Some(on_finish),
        }
    }

    /// Whether the callback has already run
    pub fn is_finished(&self) -> bool {
        self.on_finish.is_none()
    }

    /// Stop reading and release the inner stream now
    pub fn cancel(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.inner = None;
        if let Some(callback) = self.on_finish.take() {
            callback();
        }
    }
}

impl<S, F> Stream for OnFinish<S, F>
where
    S: Stream + Unpin,
    F: FnOnce() + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(inner) => inner.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl<S, F> Drop for OnFinish<S, F>
where
    F: FnOnce(),
{
    fn drop(&mut self) {
        self.inner = None;
        if let Some(callback) = self.on_finish.take() {
            callback();
        }
    }
}

/// Extension trait adding [`OnFinish`] to any stream
pub trait OnFinishExt: Stream + Unpin + Sized {
    /// Run `on_finish` once this stream completes or is dropped
    fn on_finish<F>(self, on_finish: F) -> OnFinish<Self, F>
    where
        F: FnOnce() + Unpin,
    {
        OnFinish::new(self, on_finish)
    }
}

impl<S> OnFinishExt for S where S: Stream + Unpin + Sized {}
