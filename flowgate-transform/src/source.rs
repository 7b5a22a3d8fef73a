//! Output adapter: the source behind the pipeline's readable side

use std::sync::Arc;

use flowgate_core::{ReadableStreamController, StreamError, StreamFuture, UnderlyingSource};
use futures::future::{self, FutureExt};
use tracing::{debug, Instrument};

use crate::controller::PipelineState;
use crate::StartFuture;

/// Releases the input side whenever the readable side asks for more
pub(crate) struct OutputAdapter<O> {
    state: Arc<PipelineState<O>>,
    start: StartFuture,
}

impl<O> OutputAdapter<O> {
    pub(crate) fn new(state: Arc<PipelineState<O>>, start: StartFuture) -> Self {
        Self { state, start }
    }
}

impl<O: Send + 'static> UnderlyingSource<O> for OutputAdapter<O> {
    fn start(&self, _controller: ReadableStreamController<O>) -> StreamFuture {
        self.start.clone().boxed()
    }

    fn pull(&self, _controller: ReadableStreamController<O>) -> StreamFuture {
        // A pull only follows a change back to backpressure, so the flag is
        // always set here
        let change = self.state.backpressure.release();
        let span = tracing::trace_span!("pull", pipeline = %self.state.id);
        async move {
            // The pull stays pending until the input side produced enough to
            // push the readable side back above its high-water mark
            let _ = change.await;
            Ok(())
        }
        .instrument(span)
        .boxed()
    }

    fn cancel(&self, reason: StreamError) -> StreamFuture {
        debug!(pipeline = %self.state.id, reason = %reason, "output side canceled");
        self.state.error_writable_and_unblock(reason);
        future::ok(()).boxed()
    }
}
