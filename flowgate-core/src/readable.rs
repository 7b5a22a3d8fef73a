//! Readable endpoint: the side consumers read chunks from
//!
//! A [`ReadableStream`] buffers chunks enqueued through its
//! [`ReadableStreamController`] and asks its [`UnderlyingSource`] for more
//! whenever the buffer is below the high-water mark or a reader is waiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{self, FutureExt};
use futures::stream::{self, Stream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::strategy::{QueuingStrategy, SizedQueue};
use crate::StreamFuture;

/// Callbacks a readable endpoint invokes on the producer behind it
///
/// Every callback returns a boxed future; an `Err` from `start` or `pull`
/// errors the stream with that reason.
pub trait UnderlyingSource<T>: Send + Sync + 'static {
    /// Called once, synchronously, when the stream is constructed
    fn start(&self, _controller: ReadableStreamController<T>) -> StreamFuture {
        future::ok(()).boxed()
    }

    /// Called when the stream wants more chunks. Never overlaps itself.
    fn pull(&self, _controller: ReadableStreamController<T>) -> StreamFuture {
        future::ok(()).boxed()
    }

    /// Called when the consumer cancels the stream
    fn cancel(&self, _reason: StreamError) -> StreamFuture {
        future::ok(()).boxed()
    }
}

#[derive(Debug, Clone)]
enum ReadableState {
    Readable,
    Closed,
    Errored(StreamError),
}

struct ReadableInner<T> {
    state: ReadableState,
    queue: SizedQueue<T>,
    strategy: QueuingStrategy<T>,
    close_requested: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
    locked: bool,
    read_requests: VecDeque<oneshot::Sender<T>>,
    source: Option<Arc<dyn UnderlyingSource<T>>>,
}

impl<T> ReadableInner<T> {
    fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && matches!(self.state, ReadableState::Readable)
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            ReadableState::Errored(_) => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => {
                Some(self.strategy.high_water_mark() - self.queue.total_size())
            }
        }
    }

    fn should_call_pull(&mut self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        self.read_requests.retain(|request| !request.is_closed());
        if self.locked && !self.read_requests.is_empty() {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    /// Enter the closed state, handing back the source so callers can cancel it
    fn finish_close(&mut self) -> Option<Arc<dyn UnderlyingSource<T>>> {
        self.state = ReadableState::Closed;
        // Dropped senders wake pending reads, which then observe end of stream
        self.read_requests.clear();
        self.source.take()
    }

    fn fail(&mut self, reason: StreamError) {
        self.queue.clear();
        self.state = ReadableState::Errored(reason);
        self.read_requests.clear();
        self.source = None;
    }
}

struct ReadableShared<T> {
    inner: Mutex<ReadableInner<T>>,
}

/// Handle through which a producer feeds a readable stream
pub struct ReadableStreamController<T> {
    shared: Arc<ReadableShared<T>>,
}

/// Non-owning handle to a [`ReadableStreamController`]
pub struct WeakReadableStreamController<T> {
    shared: Weak<ReadableShared<T>>,
}

impl<T> Clone for ReadableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for WeakReadableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> WeakReadableStreamController<T> {
    /// Recover the controller if its stream is still alive
    pub fn upgrade(&self) -> Option<ReadableStreamController<T>> {
        self.shared
            .upgrade()
            .map(|shared| ReadableStreamController { shared })
    }
}

impl<T: Send + 'static> ReadableStreamController<T> {
    /// Create a controller for a stream that is not built yet
    ///
    /// Pair it with a source through [`ReadableStream::with_controller`].
    pub fn new(strategy: QueuingStrategy<T>) -> Result<Self> {
        strategy.validate()?;
        Ok(Self {
            shared: Arc::new(ReadableShared {
                inner: Mutex::new(ReadableInner {
                    state: ReadableState::Readable,
                    queue: SizedQueue::new(),
                    strategy,
                    close_requested: false,
                    started: false,
                    pulling: false,
                    pull_again: false,
                    locked: false,
                    read_requests: VecDeque::new(),
                    source: None,
                }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReadableInner<T>> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle that does not keep the stream alive
    pub fn downgrade(&self) -> WeakReadableStreamController<T> {
        WeakReadableStreamController {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// How much more the stream wants buffered; `None` once errored
    pub fn desired_size(&self) -> Option<f64> {
        self.lock().desired_size()
    }

    /// Whether `enqueue` and `close` are still permitted
    pub fn can_close_or_enqueue(&self) -> bool {
        self.lock().can_close_or_enqueue()
    }

    /// Whether the stream does not currently want more chunks
    pub fn has_backpressure(&self) -> bool {
        !self.lock().should_call_pull()
    }

    /// The reason the stream errored with, if it did
    pub fn stored_error(&self) -> Option<StreamError> {
        match &self.lock().state {
            ReadableState::Errored(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Hand a chunk to a waiting reader, or buffer it
    ///
    /// A chunk whose size the strategy rejects errors the stream with the
    /// same error that is returned.
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        {
            let mut inner = self.lock();
            if !inner.can_close_or_enqueue() {
                return Err(StreamError::InvalidState(
                    "readable stream is closed or errored".into(),
                ));
            }

            let mut chunk = chunk;
            while inner.locked {
                let Some(request) = inner.read_requests.pop_front() else {
                    break;
                };
                match request.send(chunk) {
                    Ok(()) => {
                        drop(inner);
                        self.call_pull_if_needed();
                        return Ok(());
                    }
                    // The read was dropped before it completed
                    Err(returned) => chunk = returned,
                }
            }

            let size = match inner.strategy.size_of(&chunk) {
                Ok(size) => size,
                Err(err) => {
                    warn!(error = %err, "rejecting chunk with invalid size");
                    inner.fail(err.clone());
                    return Err(err);
                }
            };
            inner.queue.push(chunk, size);
        }
        self.call_pull_if_needed();
        Ok(())
    }

    /// Signal end of stream once buffered chunks are read
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.can_close_or_enqueue() {
            return Err(StreamError::InvalidState(
                "readable stream is already closing, closed or errored".into(),
            ));
        }
        inner.close_requested = true;
        if inner.queue.is_empty() {
            inner.finish_close();
        }
        debug!("readable stream close requested");
        Ok(())
    }

    /// Error the stream; a no-op unless it is still readable
    pub fn error(&self, reason: StreamError) {
        let mut inner = self.lock();
        if !matches!(inner.state, ReadableState::Readable) {
            return;
        }
        debug!(error = %reason, "readable stream errored");
        inner.fail(reason);
    }

    fn call_pull_if_needed(&self) {
        let source = {
            let mut inner = self.lock();
            if !inner.should_call_pull() {
                return;
            }
            if inner.pulling {
                inner.pull_again = true;
                return;
            }
            let Some(source) = inner.source.clone() else {
                return;
            };
            inner.pulling = true;
            source
        };

        let pull = source.pull(self.clone());
        let weak = self.downgrade();
        tokio::spawn(async move {
            let outcome = pull.await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(()) => {
                    let again = {
                        let mut inner = controller.lock();
                        inner.pulling = false;
                        std::mem::take(&mut inner.pull_again)
                    };
                    if again {
                        controller.call_pull_if_needed();
                    }
                }
                Err(err) => {
                    warn!(error = %err, "pull failed");
                    controller.error(err);
                }
            }
        });
    }

    async fn cancel_stream(&self, reason: StreamError) -> Result<()> {
        let source = {
            let mut inner = self.lock();
            match &inner.state {
                ReadableState::Closed => return Ok(()),
                ReadableState::Errored(stored) => return Err(stored.clone()),
                ReadableState::Readable => {}
            }
            inner.queue.clear();
            inner.finish_close()
        };
        debug!(reason = %reason, "readable stream canceled");
        match source {
            Some(source) => source.cancel(reason).await,
            None => Ok(()),
        }
    }

    fn settled_read(&self) -> Result<Option<T>> {
        match &self.lock().state {
            ReadableState::Errored(reason) => Err(reason.clone()),
            ReadableState::Closed => Ok(None),
            ReadableState::Readable => Err(StreamError::InvalidState(
                "read request was dropped".into(),
            )),
        }
    }
}

/// The readable endpoint handle
pub struct ReadableStream<T> {
    controller: ReadableStreamController<T>,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Create a stream fed by `source`
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime, which drives `start` and `pull`.
    pub fn new<S>(source: S, strategy: QueuingStrategy<T>) -> Result<Self>
    where
        S: UnderlyingSource<T>,
    {
        let controller = ReadableStreamController::new(strategy)?;
        Ok(Self::with_controller(controller, source))
    }

    /// Create a stream from a controller built ahead of time
    ///
    /// `source.start` is invoked before this returns.
    pub fn with_controller<S>(controller: ReadableStreamController<T>, source: S) -> Self
    where
        S: UnderlyingSource<T>,
    {
        let source: Arc<dyn UnderlyingSource<T>> = Arc::new(source);
        controller.lock().source = Some(Arc::clone(&source));

        let start = source.start(controller.clone());
        let weak = controller.downgrade();
        tokio::spawn(async move {
            let outcome = start.await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(()) => {
                    controller.lock().started = true;
                    controller.call_pull_if_needed();
                }
                Err(err) => {
                    warn!(error = %err, "readable source failed to start");
                    controller.error(err);
                }
            }
        });

        Self { controller }
    }

    /// A stream yielding every item of `items`, one per pull
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let source = IterSource {
            items: Mutex::new(items.into_iter()),
        };
        Self::new(source, QueuingStrategy::count(0.0))
    }

    /// Acquire the exclusive reader
    pub fn get_reader(&self) -> Result<ReadableStreamReader<T>> {
        let mut inner = self.controller.lock();
        if inner.locked {
            return Err(StreamError::Locked);
        }
        inner.locked = true;
        Ok(ReadableStreamReader {
            controller: self.controller.clone(),
        })
    }

    /// Whether a reader is active
    pub fn is_locked(&self) -> bool {
        self.controller.lock().locked
    }

    /// Cancel an unlocked stream
    pub async fn cancel(&self, reason: StreamError) -> Result<()> {
        if self.is_locked() {
            return Err(StreamError::Locked);
        }
        self.controller.cancel_stream(reason).await
    }
}

/// Exclusive reader of a [`ReadableStream`]
///
/// Dropping the reader releases the lock.
pub struct ReadableStreamReader<T: Send + 'static> {
    controller: ReadableStreamController<T>,
}

impl<T: Send + 'static> ReadableStreamReader<T> {
    /// Read the next chunk; `Ok(None)` is end of stream
    pub async fn read(&self) -> Result<Option<T>> {
        let receiver = {
            let mut inner = self.controller.lock();
            match &inner.state {
                ReadableState::Errored(reason) => return Err(reason.clone()),
                ReadableState::Closed => return Ok(None),
                ReadableState::Readable => {}
            }

            if let Some(chunk) = inner.queue.pop() {
                if inner.close_requested && inner.queue.is_empty() {
                    inner.finish_close();
                }
                drop(inner);
                self.controller.call_pull_if_needed();
                return Ok(Some(chunk));
            }

            let (sender, receiver) = oneshot::channel();
            inner.read_requests.push_back(sender);
            receiver
        };

        self.controller.call_pull_if_needed();
        match receiver.await {
            Ok(chunk) => Ok(Some(chunk)),
            Err(_) => self.controller.settled_read(),
        }
    }

    /// Cancel the stream through this reader
    pub async fn cancel(&self, reason: StreamError) -> Result<()> {
        self.controller.cancel_stream(reason).await
    }

    /// Release the lock so another reader can be acquired
    pub fn release_lock(self) {
        drop(self);
    }

    /// Adapt this reader into a [`Stream`] of chunks
    ///
    /// The stream ends after end of stream or after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl<T: Send + 'static> Drop for ReadableStreamReader<T> {
    fn drop(&mut self) {
        let mut inner = self.controller.lock();
        inner.locked = false;
        inner.read_requests.clear();
    }
}

struct IterSource<I> {
    items: Mutex<I>,
}

impl<T, I> UnderlyingSource<T> for IterSource<I>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    fn pull(&self, controller: ReadableStreamController<T>) -> StreamFuture {
        let next = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next();
        let outcome = match next {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        };
        future::ready(outcome).boxed()
    }
}
