//! The transform controller and the state both pipeline sides share

use std::sync::Arc;

use flowgate_core::{
    ReadableStreamController, Result, StreamError, WeakReadableStreamController,
    WeakWritableStreamController,
};
use tracing::debug;
use uuid::Uuid;

use crate::backpressure::BackpressureSignal;

/// The input side as seen by code that only knows the output item type
pub(crate) trait InputSide: Send + Sync {
    fn error_if_needed(&self, reason: StreamError) -> bool;

    fn stored_error(&self) -> Option<StreamError>;
}

impl<I: Send + 'static> InputSide for WeakWritableStreamController<I> {
    fn error_if_needed(&self, reason: StreamError) -> bool {
        self.upgrade()
            .is_some_and(|controller| controller.error_if_needed(reason))
    }

    fn stored_error(&self) -> Option<StreamError> {
        self.upgrade()?.stored_error()
    }
}

/// State shared by the controller and both adapters of one pipeline
///
/// The pipeline only holds weak links to its endpoints; the endpoint
/// handles own them.
pub(crate) struct PipelineState<O> {
    pub(crate) id: Uuid,
    pub(crate) backpressure: BackpressureSignal,
    readable: WeakReadableStreamController<O>,
    writable: Box<dyn InputSide>,
}

impl<O: Send + 'static> PipelineState<O> {
    pub(crate) fn new<I: Send + 'static>(
        id: Uuid,
        readable: WeakReadableStreamController<O>,
        writable: WeakWritableStreamController<I>,
    ) -> Self {
        Self {
            id,
            // The output side is not ready until its first pull
            backpressure: BackpressureSignal::new(true),
            readable,
            writable: Box::new(writable),
        }
    }

    pub(crate) fn readable(&self) -> Option<ReadableStreamController<O>> {
        self.readable.upgrade()
    }

    /// Fail both sides with `reason` and wake any blocked write
    pub(crate) fn error(&self, reason: StreamError) {
        debug!(pipeline = %self.id, error = %reason, "pipeline errored");
        if let Some(readable) = self.readable() {
            readable.error(reason.clone());
        }
        self.error_writable_and_unblock(reason);
    }

    /// Fail only the input side with `reason` and wake any blocked write
    pub(crate) fn error_writable_and_unblock(&self, reason: StreamError) {
        self.writable.error_if_needed(reason);
        self.backpressure.update(false);
    }

    /// The first terminal reason recorded on either side
    pub(crate) fn failure(&self) -> Option<StreamError> {
        self.writable
            .stored_error()
            .or_else(|| self.readable()?.stored_error())
    }
}

/// Handle through which transformer callbacks drive the output side
///
/// Cloning is cheap; every clone controls the same pipeline.
pub struct TransformController<O> {
    state: Arc<PipelineState<O>>,
}

impl<O> Clone for TransformController<O> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<O: Send + 'static> TransformController<O> {
    pub(crate) fn new(state: Arc<PipelineState<O>>) -> Self {
        Self { state }
    }

    /// How much more the output side wants buffered; `None` once it errored
    /// or was dropped
    pub fn desired_size(&self) -> Option<f64> {
        self.state.readable()?.desired_size()
    }

    /// Push an item to the output side
    ///
    /// Fails with [`StreamError::OutputClosed`] once the output side closed
    /// or errored. Any failure is fatal to the whole pipeline.
    pub fn enqueue(&self, item: O) -> Result<()> {
        let Some(readable) = self.state.readable() else {
            let err = StreamError::output_closed(None);
            self.state.error_writable_and_unblock(err.clone());
            return Err(err);
        };

        if !readable.can_close_or_enqueue() {
            let err = StreamError::output_closed(readable.stored_error());
            self.state.error(err.clone());
            return Err(err);
        }

        if let Err(err) = readable.enqueue(item) {
            self.state.error(err.clone());
            return Err(readable.stored_error().unwrap_or(err));
        }

        // Only a pull may clear backpressure
        if readable.has_backpressure() {
            self.state.backpressure.update(true);
        }
        Ok(())
    }

    /// Fail both sides of the pipeline with `reason`
    pub fn error(&self, reason: StreamError) {
        self.state.error(reason);
    }

    /// Close the output side cleanly and tell the input side to stop
    ///
    /// Readers see a normal end of stream; writers see
    /// [`StreamError::Terminated`].
    pub fn terminate(&self) {
        debug!(pipeline = %self.state.id, "pipeline terminated");
        if let Some(readable) = self.state.readable() {
            if readable.can_close_or_enqueue() {
                // Cannot fail: closability was just checked
                let _ = readable.close();
            }
        }
        self.state
            .error_writable_and_unblock(StreamError::Terminated);
    }
}
