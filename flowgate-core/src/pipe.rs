//! Piping a readable stream into a writable stream

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::readable::{ReadableStream, ReadableStreamReader};
use crate::writable::WritableStream;

/// How a pipe treats the two ends when the other one finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    /// Leave the destination open when the source ends
    pub prevent_close: bool,

    /// Leave the destination usable when the source errors
    pub prevent_abort: bool,

    /// Leave the source readable when the destination errors
    pub prevent_cancel: bool,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Read every chunk from this stream and write it into `dest`
    ///
    /// Both streams stay locked until the pipe finishes. Each chunk is
    /// written before the next one is read, so a destination that applies
    /// backpressure slows the source down. Returns the first error observed
    /// on either side.
    pub async fn pipe_to(&self, dest: &WritableStream<T>, options: PipeOptions) -> Result<()> {
        let reader = self.get_reader()?;
        let writer = dest.get_writer()?;

        loop {
            let next = tokio::select! {
                biased;
                next = reader.read() => next,
                closed = writer.closed() => {
                    let err = closed.err().unwrap_or(StreamError::Closed);
                    return cancel_source(&reader, err, options).await;
                }
            };

            match next {
                Ok(Some(chunk)) => {
                    if let Err(err) = writer.write(chunk).await {
                        return cancel_source(&reader, err, options).await;
                    }
                }
                Ok(None) => {
                    debug!("pipe source ended");
                    if !options.prevent_close {
                        writer.close().await?;
                    }
                    return Ok(());
                }
                Err(err) => {
                    debug!(error = %err, "pipe source errored");
                    if !options.prevent_abort {
                        writer.abort(err.clone()).await?;
                    }
                    return Err(err);
                }
            }
        }
    }
}

async fn cancel_source<T: Send + 'static>(
    reader: &ReadableStreamReader<T>,
    err: StreamError,
    options: PipeOptions,
) -> Result<()> {
    debug!(error = %err, "pipe destination errored");
    if !options.prevent_cancel {
        if let Err(cancel_err) = reader.cancel(err.clone()).await {
            debug!(error = %cancel_err, "canceling pipe source failed");
        }
    }
    Err(err)
}
