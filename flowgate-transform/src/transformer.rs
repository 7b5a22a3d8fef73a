//! Caller-supplied transformation callbacks

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use flowgate_core::{Result, StreamError, StreamFuture};
use futures::future::{self, FutureExt};

use crate::controller::TransformController;

/// Callback receiving only the controller (`start` and `flush`)
pub type ControllerFn<O> = Arc<dyn Fn(TransformController<O>) -> StreamFuture + Send + Sync>;

/// Callback transforming one input item
pub type TransformFn<I, O> = Arc<dyn Fn(I, TransformController<O>) -> StreamFuture + Send + Sync>;

/// What happens to each item written into the pipeline
pub enum TransformStep<I, O> {
    /// Forward the item unchanged
    PassThrough(fn(I) -> O),

    /// Hand the item to a caller-supplied callback
    Apply(TransformFn<I, O>),
}

/// The set of callbacks driving a transform pipeline
///
/// Every callback is optional. Without a transform step items pass through
/// unchanged, which is only expressible when input and output types match.
pub struct Transformer<I, O> {
    /// Runs once before any item is transformed
    start: Option<ControllerFn<O>>,

    /// Per-item step
    step: TransformStep<I, O>,

    /// Runs once after the last item, before the output side closes
    flush: Option<ControllerFn<O>>,
}

impl<T: Send + 'static> Transformer<T, T> {
    /// A transformer that forwards every item unchanged
    pub fn identity() -> Self {
        Self {
            start: None,
            step: TransformStep::PassThrough(std::convert::identity),
            flush: None,
        }
    }
}

impl<T: Send + 'static> Default for Transformer<T, T> {
    fn default() -> Self {
        Self::identity()
    }
}

impl<I: Send + 'static, O: Send + 'static> Transformer<I, O> {
    /// A transformer that hands every item to `transform`
    ///
    /// The callback pushes output through the controller, so it may emit
    /// zero, one or many items per input.
    pub fn from_fn<F, Fut>(transform: F) -> Self
    where
        F: Fn(I, TransformController<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            start: None,
            step: TransformStep::Apply(Arc::new(move |item: I, controller: TransformController<O>| {
                transform(item, controller).boxed()
            })),
            flush: None,
        }
    }

    /// Run `start` before the first item
    #[must_use]
    pub fn on_start<F, Fut>(mut self, start: F) -> Self
    where
        F: Fn(TransformController<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.start = Some(Arc::new(move |controller: TransformController<O>| {
            start(controller).boxed()
        }));
        self
    }

    /// Run `flush` once the input side closes
    #[must_use]
    pub fn on_flush<F, Fut>(mut self, flush: F) -> Self
    where
        F: Fn(TransformController<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.flush = Some(Arc::new(move |controller: TransformController<O>| {
            flush(controller).boxed()
        }));
        self
    }

    /// Whether items pass through unchanged
    pub fn is_pass_through(&self) -> bool {
        matches!(self.step, TransformStep::PassThrough(_))
    }

    pub(crate) fn start(&self, controller: TransformController<O>) -> StreamFuture {
        match &self.start {
            Some(start) => guarded("start", || start(controller)),
            None => future::ok(()).boxed(),
        }
    }

    pub(crate) fn transform(&self, item: I, controller: TransformController<O>) -> StreamFuture {
        match &self.step {
            TransformStep::PassThrough(forward) => guarded("transform", || {
                future::ready(controller.enqueue(forward(item))).boxed()
            }),
            TransformStep::Apply(transform) => guarded("transform", || transform(item, controller)),
        }
    }

    pub(crate) fn flush(&self, controller: TransformController<O>) -> StreamFuture {
        match &self.flush {
            Some(flush) => guarded("flush", || flush(controller)),
            None => future::ok(()).boxed(),
        }
    }
}

/// Run a callback so that a panic, whether raised while building its future
/// or while polling it, comes back as a [`StreamError::TransformFailure`]
fn guarded(callback: &'static str, call: impl FnOnce() -> StreamFuture) -> StreamFuture {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(running) => AssertUnwindSafe(running)
            .catch_unwind()
            .map(move |outcome| {
                outcome.unwrap_or_else(|payload| Err(panic_failure(callback, payload.as_ref())))
            })
            .boxed(),
        Err(payload) => future::err(panic_failure(callback, payload.as_ref())).boxed(),
    }
}

fn panic_failure(callback: &str, payload: &(dyn Any + Send)) -> StreamError {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    StreamError::transform(format!("{callback} callback panicked: {message}"))
}

impl<I, O> fmt::Debug for Transformer<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("start", &self.start.is_some())
            .field("pass_through", &matches!(self.step, TransformStep::PassThrough(_)))
            .field("flush", &self.flush.is_some())
            .finish()
    }
}
