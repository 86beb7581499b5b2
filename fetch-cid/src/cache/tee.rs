//! Splitting one single-read stream into two independent readers
//!
//! [`tee`] hands back two [`TeeBranch`]es over the same source. Whichever
//! branch is polled pulls the next item from the source, keeps it, and
//! queues a clone for its sibling. Each branch has its own bounded queue:
//! a branch whose sibling's queue is full waits until the sibling catches
//! up, so memory stays bounded by the slower reader.
//!
//! Dropping a branch detaches it; the remaining branch keeps reading the
//! source alone. The source itself is dropped once both branches are gone.

use crate::cache::config::DEFAULT_TEE_CAPACITY;
use futures::task::{waker_ref, ArcWake};
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

/// Which of the two readers a [`TeeBranch`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

struct Lane<T> {
    queue: VecDeque<T>,
    waker: Option<Waker>,
    attached: bool,
}

impl<T> Lane<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            waker: None,
            attached: true,
        }
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Waker handed to the source; wakes whichever branches are waiting on it
///
/// A source only remembers the most recent waker it was polled with, so
/// without this a branch that polled first would never hear about new data
/// if its sibling polled later and then stopped reading.
#[derive(Default)]
struct SourceWaker {
    waiting: Mutex<[Option<Waker>; 2]>,
}

impl SourceWaker {
    fn register(&self, side: Side, waker: &Waker) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        waiting[side.index()] = Some(waker.clone());
    }
}

impl ArcWake for SourceWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let woken = {
            let mut waiting = arc_self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
            [waiting[0].take(), waiting[1].take()]
        };
        for waker in woken.into_iter().flatten() {
            waker.wake();
        }
    }
}

struct TeeState<S: Stream> {
    source: S,
    source_waker: Arc<SourceWaker>,
    lanes: [Lane<S::Item>; 2],
    capacity: usize,
    exhausted: bool,
}

impl<S: Stream> TeeState<S> {
    /// Mutable access to (this lane, sibling lane) plus the source
    fn split(&mut self, side: Side) -> (&mut S, &mut Lane<S::Item>, &mut Lane<S::Item>) {
        let [left, right] = &mut self.lanes;
        match side {
            Side::Left => (&mut self.source, left, right),
            Side::Right => (&mut self.source, right, left),
        }
    }
}

/// One of the two readers produced by [`tee`]
pub struct TeeBranch<S: Stream> {
    state: Arc<Mutex<TeeState<S>>>,
    side: Side,
}

/// Split `source` into two streams yielding the same items in the same order
pub fn tee<S>(source: S) -> (TeeBranch<S>, TeeBranch<S>)
where
    S: Stream + Unpin,
    S::Item: Clone,
{
    tee_with_capacity(source, DEFAULT_TEE_CAPACITY)
}

/// [`tee`] with an explicit per-branch queue size (at least 1)
pub fn tee_with_capacity<S>(source: S, capacity: usize) -> (TeeBranch<S>, TeeBranch<S>)
where
    S: Stream + Unpin,
    S::Item: Clone,
{
    let state = Arc::new(Mutex::new(TeeState {
        source,
        source_waker: Arc::new(SourceWaker::default()),
        lanes: [Lane::new(), Lane::new()],
        capacity: capacity.max(1),
        exhausted: false,
    }));

    (
        TeeBranch {
            state: Arc::clone(&state),
            side: Side::Left,
        },
        TeeBranch {
            state,
            side: Side::Right,
        },
    )
}

fn lock<S: Stream>(state: &Mutex<TeeState<S>>) -> MutexGuard<'_, TeeState<S>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: Stream> TeeBranch<S> {
    /// Which reader this branch is
    pub fn side(&self) -> Side {
        self.side
    }

    /// Items queued for this branch and not yet read
    pub fn buffered(&self) -> usize {
        lock(&self.state).lanes[self.side.index()].queue.len()
    }
}

impl<S> Stream for TeeBranch<S>
where
    S: Stream + Unpin,
    S::Item: Clone,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let side = self.side;
        let mut guard = lock(&self.state);
        let capacity = guard.capacity;
        let exhausted = guard.exhausted;
        let source_waker = Arc::clone(&guard.source_waker);
        let (source, lane, sibling) = guard.split(side);

        if let Some(item) = lane.queue.pop_front() {
            // Room freed: a sibling held back by our full queue may go on
            sibling.wake();
            return Poll::Ready(Some(item));
        }

        if exhausted {
            return Poll::Ready(None);
        }

        if sibling.attached && sibling.queue.len() >= capacity {
            lane.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        source_waker.register(side, cx.waker());
        let waker = waker_ref(&source_waker);
        let mut source_cx = Context::from_waker(&waker);

        match Pin::new(source).poll_next(&mut source_cx) {
            Poll::Ready(Some(item)) => {
                if sibling.attached {
                    sibling.queue.push_back(item.clone());
                    sibling.wake();
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                sibling.wake();
                guard.exhausted = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                lane.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<S: Stream> Drop for TeeBranch<S> {
    fn drop(&mut self) {
        let side = self.side;
        let mut guard = lock(&self.state);
        let (_, lane, sibling) = guard.split(side);
        lane.attached = false;
        lane.queue.clear();
        lane.waker = None;
        sibling.wake();
    }
}
