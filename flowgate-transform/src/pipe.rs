//! Piping a readable stream through a transform pipeline

use flowgate_core::{PipeOptions, ReadableStream, Result, StreamError};
use tracing::debug;

use crate::pipeline::TransformStream;

/// Route a readable stream through a [`TransformStream`]
pub trait PipeThrough<I> {
    /// Pipe into the pipeline's input side on a background task and return
    /// its output side
    ///
    /// Fails with [`StreamError::Locked`] if either stream is locked.
    fn pipe_through<O: Send + 'static>(
        self,
        transform: TransformStream<I, O>,
        options: PipeOptions,
    ) -> Result<ReadableStream<O>>;
}

impl<I: Send + 'static> PipeThrough<I> for ReadableStream<I> {
    fn pipe_through<O: Send + 'static>(
        self,
        transform: TransformStream<I, O>,
        options: PipeOptions,
    ) -> Result<ReadableStream<O>> {
        if self.is_locked() || transform.writable().is_locked() {
            return Err(StreamError::Locked);
        }

        let id = transform.id();
        let (writable, readable) = transform.into_parts();
        tokio::spawn(async move {
            if let Err(err) = self.pipe_to(&writable, options).await {
                debug!(pipeline = %id, error = %err, "pipe through ended with error");
            }
        });
        Ok(readable)
    }
}
