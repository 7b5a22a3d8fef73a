//! Transform pipelines with coordinated backpressure
//!
//! A [`TransformStream`] joins a writable input side to a readable output
//! side through a caller-supplied [`Transformer`]. Both sides share a single
//! backpressure signal: the input side only hands an item to the
//! transformer while the output side wants more, so a slow consumer slows
//! every producer upstream of it.
//!
//! ```no_run
//! use flowgate_transform::{TransformController, TransformStream, Transformer};
//! use futures::future;
//!
//! # async fn demo() -> flowgate_core::Result<()> {
//! let doubler = Transformer::from_fn(|x: u32, c: TransformController<u32>| {
//!     future::ready(c.enqueue(x * 2))
//! });
//! let pipeline = TransformStream::new(doubler)?;
//! let writer = pipeline.writable().get_writer()?;
//! let reader = pipeline.readable().get_reader()?;
//!
//! let write = writer.write(21);
//! assert_eq!(reader.read().await?, Some(42));
//! write.await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backpressure;
pub mod config;
pub mod controller;
pub mod pipe;
pub mod pipeline;
mod sink;
mod source;
pub mod transformer;

// Re-export key types for convenience
pub use backpressure::{BackpressureChange, BackpressureSignal};
pub use config::TransformConfig;
pub use controller::TransformController;
pub use pipe::PipeThrough;
pub use pipeline::TransformStream;
pub use transformer::{ControllerFn, TransformFn, TransformStep, Transformer};

pub use flowgate_core::{
    PipeOptions, QueuingStrategy, ReadableStream, ReadableStreamReader, Result, StreamError,
    StreamFuture, WritableStream, WritableStreamWriter,
};

/// The transformer's start future, awaited by both sides before they act
pub(crate) type StartFuture = futures::future::Shared<StreamFuture>;
