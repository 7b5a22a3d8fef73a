//! Queuing strategies and size-accounted queues

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StreamError};

/// Function computing the size of a single chunk
pub type SizeFn<T> = Arc<dyn Fn(&T) -> f64 + Send + Sync>;

/// How an endpoint accounts for buffered chunks
///
/// The high-water mark is the total size an endpoint is willing to buffer
/// before it reports backpressure. Without a size function every chunk
/// counts as `1`.
pub struct QueuingStrategy<T> {
    /// Total buffered size at which backpressure starts
    high_water_mark: f64,

    /// Per-chunk size function
    size: Option<SizeFn<T>>,
}

impl<T> QueuingStrategy<T> {
    /// Count chunks, buffering up to `high_water_mark` of them
    pub fn count(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: None,
        }
    }

    /// Measure chunks with `size`, buffering up to `high_water_mark` in total
    pub fn with_size<F>(high_water_mark: f64, size: F) -> Self
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        Self {
            high_water_mark,
            size: Some(Arc::new(size)),
        }
    }

    /// The configured high-water mark
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Reject a negative or NaN high-water mark
    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark.is_nan() || self.high_water_mark < 0.0 {
            return Err(StreamError::InvalidHighWaterMark(self.high_water_mark));
        }
        Ok(())
    }

    /// Size of a single chunk, rejecting negative, NaN and infinite sizes
    pub fn size_of(&self, chunk: &T) -> Result<f64> {
        let size = match &self.size {
            Some(size) => size(chunk),
            None => 1.0,
        };
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::InvalidChunkSize(size));
        }
        Ok(size)
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("sized", &self.size.is_some())
            .finish()
    }
}

/// A FIFO queue that tracks the total size of its contents
#[derive(Debug)]
pub struct SizedQueue<T> {
    /// Chunks paired with their sizes
    items: VecDeque<(T, f64)>,

    /// Sum of all chunk sizes
    total_size: f64,
}

impl<T> SizedQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Push a chunk of the given (already validated) size
    pub fn push(&mut self, chunk: T, size: f64) {
        self.items.push_back((chunk, size));
        self.total_size += size;
    }

    /// Pop the oldest chunk
    pub fn pop(&mut self) -> Option<T> {
        let (chunk, size) = self.items.pop_front()?;
        self.total_size -= size;
        // Rounding can leave a tiny negative remainder
        if self.total_size < 0.0 || self.items.is_empty() {
            self.total_size = 0.0;
        }
        Some(chunk)
    }

    /// Sum of all chunk sizes
    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every chunk
    pub fn clear(&mut self) {
        self.items.clear();
        self.total_size = 0.0;
    }
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
