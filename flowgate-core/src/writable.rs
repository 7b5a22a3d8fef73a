//! Writable endpoint: the side producers write chunks into
//!
//! Writes are queued synchronously and handed to the [`UnderlyingSink`] by a
//! per-stream driver task, one at a time and in call order. The sink never
//! sees two overlapping `write` calls.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{self, FutureExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::strategy::QueuingStrategy;
use crate::StreamFuture;

/// Callbacks a writable endpoint invokes on the consumer behind it
pub trait UnderlyingSink<T>: Send + Sync + 'static {
    /// Called once, synchronously, when the stream is constructed.
    /// No write is delivered before the returned future settles.
    fn start(&self, _controller: WritableStreamController<T>) -> StreamFuture {
        future::ok(()).boxed()
    }

    /// Consume one chunk
    fn write(&self, chunk: T) -> StreamFuture;

    /// Called after every queued write completed, when the producer closes
    fn close(&self) -> StreamFuture {
        future::ok(()).boxed()
    }

    /// Called immediately when the producer aborts, even with a write in flight
    fn abort(&self, _reason: StreamError) -> StreamFuture {
        future::ok(()).boxed()
    }
}

#[derive(Debug, Clone)]
enum WritableState {
    Writable,
    Closed,
    Errored(StreamError),
}

struct WritableInner {
    state: WritableState,
    queued_size: f64,
    close_queued: bool,
    locked: bool,
}

struct WritableShared<T> {
    inner: Mutex<WritableInner>,
    strategy: QueuingStrategy<T>,
    changed: Notify,
}

/// Handle through which a sink can inspect or error its writable stream
pub struct WritableStreamController<T> {
    shared: Arc<WritableShared<T>>,
}

/// Non-owning handle to a [`WritableStreamController`]
pub struct WeakWritableStreamController<T> {
    shared: Weak<WritableShared<T>>,
}

impl<T> Clone for WritableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for WeakWritableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> WeakWritableStreamController<T> {
    /// Recover the controller if its stream is still alive
    pub fn upgrade(&self) -> Option<WritableStreamController<T>> {
        self.shared
            .upgrade()
            .map(|shared| WritableStreamController { shared })
    }
}

impl<T> WritableStreamController<T> {
    /// Create a controller for a stream that is not built yet
    pub fn new(strategy: QueuingStrategy<T>) -> Result<Self> {
        strategy.validate()?;
        Ok(Self {
            shared: Arc::new(WritableShared {
                inner: Mutex::new(WritableInner {
                    state: WritableState::Writable,
                    queued_size: 0.0,
                    close_queued: false,
                    locked: false,
                }),
                strategy,
                changed: Notify::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WritableInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle that does not keep the stream alive
    pub fn downgrade(&self) -> WeakWritableStreamController<T> {
        WeakWritableStreamController {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Error the stream unless it already closed or errored
    ///
    /// Returns whether this call errored the stream.
    pub fn error_if_needed(&self, reason: StreamError) -> bool {
        let mut inner = self.lock();
        if !matches!(inner.state, WritableState::Writable) {
            return false;
        }
        debug!(error = %reason, "writable stream errored");
        inner.state = WritableState::Errored(reason);
        drop(inner);
        self.shared.changed.notify_waiters();
        true
    }

    /// The reason the stream errored with, if it did
    pub fn stored_error(&self) -> Option<StreamError> {
        match &self.lock().state {
            WritableState::Errored(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// How much more the stream is willing to queue; `None` once errored
    pub fn desired_size(&self) -> Option<f64> {
        let inner = self.lock();
        match inner.state {
            WritableState::Errored(_) => None,
            WritableState::Closed => Some(0.0),
            WritableState::Writable => {
                Some(self.shared.strategy.high_water_mark() - inner.queued_size)
            }
        }
    }

    fn write_completed(&self, size: f64) {
        let mut inner = self.lock();
        inner.queued_size = (inner.queued_size - size).max(0.0);
        drop(inner);
        self.shared.changed.notify_waiters();
    }

    fn finish_close(&self) -> Result<()> {
        let mut inner = self.lock();
        let outcome = match &inner.state {
            WritableState::Errored(reason) => Err(reason.clone()),
            _ => {
                inner.state = WritableState::Closed;
                Ok(())
            }
        };
        drop(inner);
        self.shared.changed.notify_waiters();
        outcome
    }

    /// Wait until `check` yields a value, re-evaluating after every state change
    async fn wait_for<R>(&self, check: impl Fn(&WritableInner, f64) -> Option<R>) -> R {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                let high_water_mark = self.shared.strategy.high_water_mark();
                if let Some(outcome) = check(&inner, high_water_mark) {
                    return outcome;
                }
            }
            notified.await;
        }
    }
}

enum Request<T> {
    Write {
        chunk: T,
        size: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

struct WritableHandle<T> {
    controller: WritableStreamController<T>,
    sink: Arc<dyn UnderlyingSink<T>>,
    requests: mpsc::UnboundedSender<Request<T>>,
}

impl<T: Send + 'static> WritableHandle<T> {
    fn enqueue_write(&self, chunk: T) -> Result<oneshot::Receiver<Result<()>>> {
        let size = match self.controller.shared.strategy.size_of(&chunk) {
            Ok(size) => size,
            Err(err) => {
                self.controller.error_if_needed(err.clone());
                return Err(err);
            }
        };

        let mut inner = self.controller.lock();
        match &inner.state {
            WritableState::Errored(reason) => return Err(reason.clone()),
            WritableState::Closed => return Err(StreamError::Closed),
            WritableState::Writable if inner.close_queued => {
                return Err(StreamError::InvalidState("stream is closing".into()));
            }
            WritableState::Writable => {}
        }

        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request::Write { chunk, size, reply })
            .map_err(|_| StreamError::Closed)?;
        inner.queued_size += size;
        Ok(receiver)
    }

    fn enqueue_close(&self) -> Result<oneshot::Receiver<Result<()>>> {
        let mut inner = self.controller.lock();
        match &inner.state {
            WritableState::Errored(reason) => return Err(reason.clone()),
            WritableState::Closed => return Err(StreamError::Closed),
            WritableState::Writable if inner.close_queued => {
                return Err(StreamError::InvalidState(
                    "stream is already closing".into(),
                ));
            }
            WritableState::Writable => {}
        }

        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request::Close { reply })
            .map_err(|_| StreamError::Closed)?;
        inner.close_queued = true;
        debug!("writable stream close queued");
        Ok(receiver)
    }

    async fn abort(&self, reason: StreamError) -> Result<()> {
        {
            let mut inner = self.controller.lock();
            if !matches!(inner.state, WritableState::Writable) {
                return Ok(());
            }
            inner.state = WritableState::Errored(reason.clone());
        }
        self.controller.shared.changed.notify_waiters();
        debug!(reason = %reason, "writable stream aborted");
        self.sink.abort(reason).await
    }
}

async fn settle(receiver: Result<oneshot::Receiver<Result<()>>>) -> Result<()> {
    match receiver?.await {
        Ok(outcome) => outcome,
        Err(_) => Err(StreamError::InvalidState(
            "writable stream driver stopped".into(),
        )),
    }
}

async fn drive<T: Send + 'static>(
    controller: WritableStreamController<T>,
    sink: Arc<dyn UnderlyingSink<T>>,
    start: StreamFuture,
    mut requests: mpsc::UnboundedReceiver<Request<T>>,
) {
    if let Err(err) = start.await {
        warn!(error = %err, "writable sink failed to start");
        controller.error_if_needed(err);
    }

    while let Some(request) = requests.recv().await {
        match request {
            Request::Write { chunk, size, reply } => {
                let outcome = match controller.stored_error() {
                    Some(reason) => Err(reason),
                    None => {
                        let outcome = sink.write(chunk).await;
                        if let Err(err) = &outcome {
                            controller.error_if_needed(err.clone());
                        }
                        outcome
                    }
                };
                controller.write_completed(size);
                let _ = reply.send(outcome);
            }
            Request::Close { reply } => {
                let outcome = match controller.stored_error() {
                    Some(reason) => Err(reason),
                    None => match sink.close().await {
                        Ok(()) => controller.finish_close(),
                        Err(err) => {
                            controller.error_if_needed(err.clone());
                            Err(err)
                        }
                    },
                };
                let _ = reply.send(outcome);
                break;
            }
        }
    }
}

/// The writable endpoint handle
pub struct WritableStream<T> {
    handle: Arc<WritableHandle<T>>,
}

impl<T: Send + 'static> WritableStream<T> {
    /// Create a stream draining into `sink`
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime, which drives the sink.
    pub fn new<S>(sink: S, strategy: QueuingStrategy<T>) -> Result<Self>
    where
        S: UnderlyingSink<T>,
    {
        let controller = WritableStreamController::new(strategy)?;
        Ok(Self::with_controller(controller, sink))
    }

    /// Create a stream from a controller built ahead of time
    ///
    /// `sink.start` is invoked before this returns.
    pub fn with_controller<S>(controller: WritableStreamController<T>, sink: S) -> Self
    where
        S: UnderlyingSink<T>,
    {
        let sink: Arc<dyn UnderlyingSink<T>> = Arc::new(sink);
        let start = sink.start(controller.clone());
        let (requests, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drive(controller.clone(), Arc::clone(&sink), start, receiver));

        Self {
            handle: Arc::new(WritableHandle {
                controller,
                sink,
                requests,
            }),
        }
    }

    /// Acquire the exclusive writer
    pub fn get_writer(&self) -> Result<WritableStreamWriter<T>> {
        let mut inner = self.handle.controller.lock();
        if inner.locked {
            return Err(StreamError::Locked);
        }
        inner.locked = true;
        Ok(WritableStreamWriter {
            handle: Arc::clone(&self.handle),
        })
    }

    /// Whether a writer is active
    pub fn is_locked(&self) -> bool {
        self.handle.controller.lock().locked
    }

    /// Abort an unlocked stream
    pub async fn abort(&self, reason: StreamError) -> Result<()> {
        if self.is_locked() {
            return Err(StreamError::Locked);
        }
        self.handle.abort(reason).await
    }
}

/// Exclusive writer of a [`WritableStream`]
///
/// Dropping the writer releases the lock; queued writes still complete.
pub struct WritableStreamWriter<T> {
    handle: Arc<WritableHandle<T>>,
}

impl<T: Send + 'static> WritableStreamWriter<T> {
    /// Queue `chunk` and return a future for the outcome of writing it
    ///
    /// The chunk is queued before this returns, so writes issued one after
    /// another reach the sink in that order even if their futures are
    /// awaited later or concurrently.
    pub fn write(&self, chunk: T) -> impl Future<Output = Result<()>> + Send + 'static {
        settle(self.handle.enqueue_write(chunk))
    }

    /// Queue a close behind pending writes
    pub fn close(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        settle(self.handle.enqueue_close())
    }

    /// Error the stream immediately and abort the sink
    pub async fn abort(&self, reason: StreamError) -> Result<()> {
        self.handle.abort(reason).await
    }

    /// How much more the stream is willing to queue; `None` once errored
    pub fn desired_size(&self) -> Option<f64> {
        self.handle.controller.desired_size()
    }

    /// Settles once the stream wants more chunks, or with the stored error
    pub async fn ready(&self) -> Result<()> {
        self.handle
            .controller
            .wait_for(|inner, high_water_mark| match &inner.state {
                WritableState::Errored(reason) => Some(Err(reason.clone())),
                WritableState::Closed => Some(Ok(())),
                WritableState::Writable if inner.close_queued => Some(Ok(())),
                WritableState::Writable => {
                    (high_water_mark - inner.queued_size > 0.0).then_some(Ok(()))
                }
            })
            .await
    }

    /// Settles when the stream closes, or with the stored error
    pub async fn closed(&self) -> Result<()> {
        self.handle
            .controller
            .wait_for(|inner, _| match &inner.state {
                WritableState::Errored(reason) => Some(Err(reason.clone())),
                WritableState::Closed => Some(Ok(())),
                WritableState::Writable => None,
            })
            .await
    }

    /// Release the lock so another writer can be acquired
    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T> Drop for WritableStreamWriter<T> {
    fn drop(&mut self) {
        self.handle.controller.lock().locked = false;
    }
}
