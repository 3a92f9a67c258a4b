//! A multi-consumer, late-joining buffered stream.
//!
//! An [`AsyncStreamSource`] retains a bounded buffer of recent items and lets any number of
//! [`BufferedAsyncStream`] consumers attach at any time: each new consumer snapshots the
//! current buffer and then receives every item produced afterward, so nothing produced before
//! it attached (but still in the buffer) or after is lost. [`FilteredSource`] composes a
//! predicate over another source without eagerly subscribing until it has its own subscribers.
use fnv::FnvHashMap;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Errors a stream consumer can observe.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// `next(timeout)` elapsed before an item arrived.
    #[error("timed out waiting for the next item")]
    Timeout,
    /// The source closed and the consumer has drained every buffered item.
    #[error("stream has ended")]
    End,
}

type SubscriberId = u64;

struct Inner<T> {
    buffer: VecDeque<T>,
    max_buffer_size: usize,
    ended: bool,
    new_item_subscribers: FnvHashMap<SubscriberId, Box<dyn Fn(&T) + Send + Sync>>,
    end_subscribers: FnvHashMap<SubscriberId, Box<dyn Fn() + Send + Sync>>,
}

/// A bounded, multi-consumer event source. Cloning an `AsyncStreamSource` handle shares the
/// same underlying buffer and subscriber tables.
#[derive(Clone)]
pub struct AsyncStreamSource<T: Clone + Send + Sync + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl<T: Clone + Send + Sync + 'static> AsyncStreamSource<T> {
    /// Creates a source retaining at most `max_buffer_size` items.
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::with_capacity(max_buffer_size.min(64)),
                max_buffer_size,
                ended: false,
                new_item_subscribers: FnvHashMap::default(),
                end_subscribers: FnvHashMap::default(),
            })),
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pushes a new item, dropping the oldest buffered item if the buffer is at capacity, and
    /// notifies every new-item subscriber.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.ended {
            return;
        }
        if inner.buffer.len() >= inner.max_buffer_size && inner.max_buffer_size > 0 {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(item.clone());
        let subscribers: Vec<_> = inner.new_item_subscribers.values().collect();
        for cb in subscribers {
            cb(&item);
        }
        tracing::debug!(buffered = inner.buffer.len(), "pushed item to stream source");
    }

    /// Marks the source as ended: no further items can be pushed, and every end subscriber is
    /// notified once.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.ended {
            return;
        }
        inner.ended = true;
        let subscribers: Vec<_> = inner.end_subscribers.values().collect();
        for cb in subscribers {
            cb();
        }
        tracing::debug!("stream source closed");
    }

    /// Snapshot of the currently buffered items, oldest first.
    pub fn current(&self) -> Vec<T> {
        self.inner.lock().buffer.iter().cloned().collect()
    }

    /// Whether the source has been closed.
    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Registers a callback fired with each item pushed after this call, returning a handle to
    /// unsubscribe.
    pub fn subscribe_new_item(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().new_item_subscribers.insert(id, Box::new(cb));
        id
    }

    /// Removes a new-item subscription.
    pub fn unsubscribe_new_item(&self, id: SubscriberId) {
        self.inner.lock().new_item_subscribers.remove(&id);
    }

    /// Registers a callback fired once, when the source is closed (immediately, if it already
    /// is).
    pub fn subscribe_end(&self, cb: impl Fn() + Send + Sync + 'static) -> SubscriberId {
        let mut inner = self.inner.lock();
        if inner.ended {
            cb();
            return self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        }
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        inner.end_subscribers.insert(id, Box::new(cb));
        id
    }

    /// Removes an end subscription.
    pub fn unsubscribe_end(&self, id: SubscriberId) {
        self.inner.lock().end_subscribers.remove(&id);
    }

    /// Number of currently attached new-item subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().new_item_subscribers.len()
    }
}

struct ConsumerState<T> {
    queue: VecDeque<T>,
    ended: bool,
    waker: Option<Waker>,
}

/// A consumer attached to an [`AsyncStreamSource`]. Snapshots the source's current buffer at
/// construction, then receives every item pushed afterward until the source closes or the
/// consumer is closed locally.
pub struct BufferedAsyncStream<T: Clone + Send + Sync + 'static> {
    state: Arc<Mutex<ConsumerState<T>>>,
    notify: Arc<async_notify::Notify>,
    source_new_item_id: SubscriberId,
    source_end_id: SubscriberId,
    source: AsyncStreamSource<T>,
    closed_locally: Arc<std::sync::atomic::AtomicBool>,
}

mod async_notify {
    //! A minimal single-permit notifier: exactly what `BufferedAsyncStream::next` needs to wake
    //! a waiting consumer without pulling in a full async runtime's notification primitive.
    use parking_lot::{Condvar, Mutex};

    #[derive(Default)]
    pub struct Notify {
        signalled: Mutex<bool>,
        condvar: Condvar,
    }

    impl Notify {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn notify(&self) {
            let mut signalled = self.signalled.lock();
            *signalled = true;
            self.condvar.notify_all();
        }

        /// Blocks until notified or `timeout` elapses. Returns whether it was notified.
        pub fn wait_timeout(&self, timeout: Option<std::time::Duration>) -> bool {
            let mut signalled = self.signalled.lock();
            if *signalled {
                *signalled = false;
                return true;
            }
            match timeout {
                Some(d) => {
                    let result = self.condvar.wait_for(&mut signalled, d);
                    let was_signalled = *signalled;
                    *signalled = false;
                    !result.timed_out() || was_signalled
                }
                None => {
                    self.condvar.wait(&mut signalled);
                    *signalled = false;
                    true
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BufferedAsyncStream<T> {
    /// Attaches a new consumer to `source`.
    pub fn new(source: &AsyncStreamSource<T>) -> Self {
        let state = Arc::new(Mutex::new(ConsumerState {
            queue: source.current().into_iter().collect(),
            ended: source.is_ended(),
            waker: None,
        }));
        let notify = Arc::new(async_notify::Notify::new());

        let state_for_item = state.clone();
        let notify_for_item = notify.clone();
        let source_new_item_id = source.subscribe_new_item(move |item: &T| {
            let mut state = state_for_item.lock();
            state.queue.push_back(item.clone());
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
            drop(state);
            notify_for_item.notify();
        });

        let state_for_end = state.clone();
        let notify_for_end = notify.clone();
        let source_end_id = source.subscribe_end(move || {
            let mut state = state_for_end.lock();
            state.ended = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
            drop(state);
            notify_for_end.notify();
        });

        Self {
            state,
            notify,
            source_new_item_id,
            source_end_id,
            source: source.clone(),
            closed_locally: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Synchronous, non-blocking take: pops the next buffered item if one is already available.
    pub fn next_if_available(&self) -> Option<T> {
        self.state.lock().queue.pop_front()
    }

    /// Number of items available to take without blocking.
    pub fn count_available_items(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether the source has ended and every buffered item has been drained.
    pub fn at_end(&self) -> bool {
        let state = self.state.lock();
        state.ended && state.queue.is_empty()
    }

    /// Blocks (cooperatively, via a condvar) for the next item, waking as soon as one is
    /// available, the source ends, or `timeout` elapses.
    ///
    /// This is intentionally synchronous rather than `async fn`: the underlying wait is a
    /// condvar, so callers on an async runtime should wrap it in `spawn_blocking` or an
    /// executor-specific equivalent; single-threaded cooperative callers (the `Store` and
    /// `PeerGroupAgent` event relays) call it directly between await points. Named `recv`
    /// rather than `next` so it doesn't shadow the `futures::Stream` impl below.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, StreamError> {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            if let Some(item) = self.next_if_available() {
                return Ok(item);
            }
            if self.at_end() {
                return Err(StreamError::End);
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return Err(StreamError::Timeout);
                    }
                    Some(d - now)
                }
                None => None,
            };
            if !self.notify.wait_timeout(remaining) && deadline.is_some() {
                if self.next_if_available().is_none() && !self.at_end() {
                    return Err(StreamError::Timeout);
                }
            }
        }
    }

    /// Detaches from the source; no further items will be queued.
    pub fn close(&self) {
        if self
            .closed_locally
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.source.unsubscribe_new_item(self.source_new_item_id);
        self.source.unsubscribe_end(self.source_end_id);
        let mut state = self.state.lock();
        state.ended = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        drop(state);
        self.notify.notify();
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for BufferedAsyncStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Clone + Send + Sync + 'static> Stream for BufferedAsyncStream<T> {
    type Item = T;

    /// Async-poll counterpart to `next`/`next_if_available`, for callers driven by an
    /// executor rather than a blocking condvar wait.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if let Some(item) = self.next_if_available() {
            return Poll::Ready(Some(item));
        }
        if self.at_end() {
            return Poll::Ready(None);
        }
        self.state.lock().waker = Some(cx.waker().clone());
        // Re-check after registering the waker to avoid a lost wakeup between the check above
        // and the registration.
        if let Some(item) = self.next_if_available() {
            return Poll::Ready(Some(item));
        }
        Poll::Pending
    }
}

/// A source that forwards only items matching a predicate from an upstream source, subscribing
/// upstream only while it has at least one downstream subscriber of its own.
pub struct FilteredSource<T: Clone + Send + Sync + 'static> {
    upstream: AsyncStreamSource<T>,
    downstream: AsyncStreamSource<T>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    upstream_subscription: Mutex<Option<SubscriberId>>,
}

impl<T: Clone + Send + Sync + 'static> FilteredSource<T> {
    /// Wraps `upstream`, forwarding only items for which `predicate` returns `true`.
    pub fn new(
        upstream: AsyncStreamSource<T>,
        max_buffer_size: usize,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            downstream: AsyncStreamSource::new(max_buffer_size),
            predicate: Arc::new(predicate),
            upstream_subscription: Mutex::new(None),
        })
    }

    /// The downstream source consumers attach to.
    pub fn source(&self) -> &AsyncStreamSource<T> {
        &self.downstream
    }

    fn ensure_subscribed(self: &Arc<Self>) {
        let mut sub = self.upstream_subscription.lock();
        if sub.is_some() {
            return;
        }
        let downstream = self.downstream.clone();
        let predicate = self.predicate.clone();
        let id = self.upstream.subscribe_new_item(move |item: &T| {
            if predicate(item) {
                downstream.push(item.clone());
            }
        });
        *sub = Some(id);
    }

    fn maybe_unsubscribe(self: &Arc<Self>) {
        if self.downstream.subscriber_count() > 0 {
            return;
        }
        let mut sub = self.upstream_subscription.lock();
        if let Some(id) = sub.take() {
            self.upstream.unsubscribe_new_item(id);
        }
    }

    /// Attaches a new consumer to the filtered downstream, subscribing upstream on demand.
    pub fn subscribe(self: &Arc<Self>) -> BufferedAsyncStream<T> {
        self.ensure_subscribed();
        BufferedAsyncStream::new(&self.downstream)
    }

    /// Call after a consumer detaches to potentially unsubscribe from upstream.
    pub fn on_consumer_detached(self: &Arc<Self>) {
        self.maybe_unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn late_joining_consumer_sees_the_buffer_snapshot_then_new_items() {
        let source = AsyncStreamSource::new(2);
        source.push(1);
        source.push(2);
        source.push(3); // buffer now holds [2, 3]; 1 was dropped

        let consumer = BufferedAsyncStream::new(&source);
        assert_eq!(consumer.count_available_items(), 2);
        assert_eq!(consumer.next_if_available(), Some(2));
        assert_eq!(consumer.next_if_available(), Some(3));
        assert_eq!(consumer.next_if_available(), None);

        source.push(4);
        assert_eq!(consumer.next_if_available(), Some(4));
    }

    #[test]
    fn next_times_out_when_nothing_arrives() {
        let source: AsyncStreamSource<i32> = AsyncStreamSource::new(4);
        let consumer = BufferedAsyncStream::new(&source);
        let result = consumer.recv(Some(Duration::from_millis(20)));
        assert_eq!(result, Err(StreamError::Timeout));
    }

    #[test]
    fn next_returns_end_after_close_and_drain() {
        let source = AsyncStreamSource::new(4);
        source.push(1);
        source.close();
        let consumer = BufferedAsyncStream::new(&source);
        assert_eq!(consumer.recv(None), Ok(1));
        assert_eq!(consumer.recv(None), Err(StreamError::End));
    }

    #[test]
    fn filtered_source_only_forwards_matching_items_and_subscribes_lazily() {
        let upstream = AsyncStreamSource::new(8);
        let filtered = FilteredSource::new(upstream.clone(), 8, |n: &i32| n % 2 == 0);
        assert_eq!(upstream.subscriber_count(), 0);

        let consumer = filtered.subscribe();
        assert_eq!(upstream.subscriber_count(), 1);

        upstream.push(1);
        upstream.push(2);
        upstream.push(3);
        upstream.push(4);

        assert_eq!(consumer.next_if_available(), Some(2));
        assert_eq!(consumer.next_if_available(), Some(4));
        assert_eq!(consumer.next_if_available(), None);
    }

    #[async_std::test]
    async fn consumer_is_pollable_as_a_futures_stream() {
        let source = AsyncStreamSource::new(4);
        source.push(1);
        source.close();
        let mut consumer = BufferedAsyncStream::new(&source);
        assert_eq!(consumer.next().await, Some(1));
        assert_eq!(consumer.next().await, None);
    }
}
