//! Stream endpoints for backpressure-aware pipelines
//!
//! This crate provides the building blocks the transform pipeline sits
//! between: a readable endpoint consumers pull chunks from, a writable
//! endpoint producers push chunks into, the queuing strategies that decide
//! when each endpoint reports backpressure, and the error taxonomy shared by
//! everything built on top.

#![warn(missing_docs)]

pub mod error;
pub mod pipe;
pub mod readable;
pub mod strategy;
pub mod writable;

// Re-export key types for convenience
pub use error::{Result, StreamError};
pub use pipe::PipeOptions;
pub use readable::{
    ReadableStream, ReadableStreamController, ReadableStreamReader, UnderlyingSource,
    WeakReadableStreamController,
};
pub use strategy::{QueuingStrategy, SizeFn, SizedQueue};
pub use writable::{
    UnderlyingSink, WeakWritableStreamController, WritableStream, WritableStreamController,
    WritableStreamWriter,
};

/// Boxed future returned by every source, sink and transformer callback
pub type StreamFuture = futures::future::BoxFuture<'static, Result<()>>;
