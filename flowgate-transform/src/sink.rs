//! Input adapter: the sink behind the pipeline's writable side

use std::sync::Arc;

use flowgate_core::{StreamError, StreamFuture, UnderlyingSink, WritableStreamController};
use futures::future::{self, FutureExt};
use tracing::{debug, trace, warn, Instrument};

use crate::controller::{PipelineState, TransformController};
use crate::transformer::Transformer;
use crate::StartFuture;

/// Runs every written item through the transformer, honoring backpressure
pub(crate) struct InputAdapter<I, O> {
    state: Arc<PipelineState<O>>,
    transformer: Arc<Transformer<I, O>>,
    start: StartFuture,
}

impl<I, O> InputAdapter<I, O> {
    pub(crate) fn new(
        state: Arc<PipelineState<O>>,
        transformer: Arc<Transformer<I, O>>,
        start: StartFuture,
    ) -> Self {
        Self {
            state,
            transformer,
            start,
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> UnderlyingSink<I> for InputAdapter<I, O> {
    fn start(&self, _controller: WritableStreamController<I>) -> StreamFuture {
        self.start.clone().boxed()
    }

    fn write(&self, chunk: I) -> StreamFuture {
        let state = Arc::clone(&self.state);
        let transformer = Arc::clone(&self.transformer);
        let span = tracing::trace_span!("write", pipeline = %state.id);

        async move {
            loop {
                let (backpressure, change) = state.backpressure.snapshot();
                if !backpressure {
                    break;
                }
                trace!("write waiting for backpressure to clear");
                let _ = change.await;
                // Whatever woke us may have been a failure rather than a pull
                if let Some(reason) = state.failure() {
                    return Err(reason);
                }
            }

            let controller = TransformController::new(Arc::clone(&state));
            match transformer.transform(chunk, controller).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(error = %err, "transform failed");
                    state.error(err.clone());
                    Err(err)
                }
            }
        }
        .instrument(span)
        .boxed()
    }

    fn close(&self) -> StreamFuture {
        let state = Arc::clone(&self.state);
        let transformer = Arc::clone(&self.transformer);
        let span = tracing::debug_span!("flush", pipeline = %state.id);

        async move {
            let controller = TransformController::new(Arc::clone(&state));
            if let Err(err) = transformer.flush(controller).await {
                warn!(error = %err, "flush failed");
                state.error(err.clone());
                let stored = state.readable().and_then(|readable| readable.stored_error());
                return Err(stored.unwrap_or(err));
            }

            let Some(readable) = state.readable() else {
                return Ok(());
            };
            if let Some(reason) = readable.stored_error() {
                return Err(reason);
            }
            if readable.can_close_or_enqueue() {
                readable.close()?;
            }
            debug!("pipeline flushed and closed");
            Ok(())
        }
        .instrument(span)
        .boxed()
    }

    fn abort(&self, reason: StreamError) -> StreamFuture {
        debug!(pipeline = %self.state.id, reason = %reason, "input side aborted");
        self.state.error(reason);
        future::ok(()).boxed()
    }
}
