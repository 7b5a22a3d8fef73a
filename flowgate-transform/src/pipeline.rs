//! The transform pipeline facade

use std::sync::Arc;

use flowgate_core::{
    QueuingStrategy, ReadableStream, ReadableStreamController, Result, WritableStream,
    WritableStreamController,
};
use futures::future::FutureExt;
use tracing::debug;
use uuid::Uuid;

use crate::config::TransformConfig;
use crate::controller::{PipelineState, TransformController};
use crate::sink::InputAdapter;
use crate::source::OutputAdapter;
use crate::transformer::Transformer;

/// A writable input and a readable output joined by a transformer
///
/// Items written into [`writable`](Self::writable) are handed to the
/// transformer one at a time, in order. Whatever the transformer enqueues
/// appears on [`readable`](Self::readable). The input side never runs ahead
/// of the output side: once the output buffer reaches its high-water mark,
/// the next write waits until a reader pulls.
pub struct TransformStream<I, O> {
    /// Identifier recorded on every tracing event of this pipeline
    id: Uuid,

    /// The side callers write into
    writable: WritableStream<I>,

    /// The side callers read from
    readable: ReadableStream<O>,
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    /// Create a pipeline with the default high-water marks
    /// (one queued input item, no buffered output)
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime.
    pub fn new(transformer: Transformer<I, O>) -> Result<Self> {
        Self::from_config(transformer, &TransformConfig::default())
    }

    /// Create a pipeline with item-counting strategies from `config`
    pub fn from_config(transformer: Transformer<I, O>, config: &TransformConfig) -> Result<Self> {
        Self::with_strategies(
            transformer,
            config.writable_strategy(),
            config.readable_strategy(),
        )
    }

    /// Create a pipeline with explicit strategies for each side
    ///
    /// The strategies are handed to the endpoints untouched.
    pub fn with_strategies(
        transformer: Transformer<I, O>,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let readable_controller = ReadableStreamController::new(readable_strategy)?;
        let writable_controller = WritableStreamController::new(writable_strategy)?;

        let state = Arc::new(PipelineState::new(
            id,
            readable_controller.downgrade(),
            writable_controller.downgrade(),
        ));
        let controller = TransformController::new(Arc::clone(&state));
        let transformer = Arc::new(transformer);
        let start = transformer.start(controller).shared();

        // The output side must exist before anything can be written
        let readable = ReadableStream::with_controller(
            readable_controller,
            OutputAdapter::new(Arc::clone(&state), start.clone()),
        );
        let writable = WritableStream::with_controller(
            writable_controller,
            InputAdapter::new(state, Arc::clone(&transformer), start),
        );

        debug!(pipeline = %id, ?transformer, "transform stream created");
        Ok(Self {
            id,
            writable,
            readable,
        })
    }

    /// Identifier of this pipeline in tracing output
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The input side
    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    /// The output side
    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    /// Split into the input and output sides
    pub fn into_parts(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipeThrough;
    use flowgate_core::{PipeOptions, StreamError};
    use futures::future::{self, poll_immediate};
    use futures::StreamExt;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use test_case::test_case;

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn doubling(calls: &Arc<AtomicUsize>) -> Transformer<i32, i32> {
        let calls = Arc::clone(calls);
        Transformer::from_fn(move |x: i32, c: TransformController<i32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            future::ready(c.enqueue(x * 2))
        })
    }

    #[tokio::test]
    async fn test_identity_preserves_items() {
        let pipeline = TransformStream::new(Transformer::identity()).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let a = writer.write("a");
        let b = writer.write("b");

        assert_eq!(reader.read().await.unwrap(), Some("a"));
        assert_eq!(reader.read().await.unwrap(), Some("b"));
        a.await.unwrap();
        b.await.unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_with_output_mark_of_one() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = TransformStream::with_strategies(
            doubling(&calls),
            QueuingStrategy::count(1.0),
            QueuingStrategy::count(1.0),
        )
        .unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let first = writer.write(1);
        let mut second = Box::pin(writer.write(2));
        let mut third = Box::pin(writer.write(3));

        first.await.unwrap();
        settle().await;
        // 2 sits in the output buffer, so the second write waits for a pull
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(poll_immediate(&mut second).await.is_none());
        assert!(poll_immediate(&mut third).await.is_none());
        assert!(pipeline.readable().is_locked());

        assert_eq!(reader.read().await.unwrap(), Some(2));
        second.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        settle().await;
        // 4 is now buffered, so the third write is parked in turn
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(poll_immediate(&mut third).await.is_none());

        assert_eq!(reader.read().await.unwrap(), Some(4));
        third.await.unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_second_transform_waits_for_pull() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = TransformStream::new(doubling(&calls)).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        // Default output mark is zero: nothing runs until someone reads
        let mut first = Box::pin(writer.write(10));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(poll_immediate(&mut first).await.is_none());

        assert_eq!(reader.read().await.unwrap(), Some(20));
        first.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut second = Box::pin(writer.write(11));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(poll_immediate(&mut second).await.is_none());

        assert_eq!(reader.read().await.unwrap(), Some(22));
        second.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_fans_out_to_both_sides() {
        let saved = Arc::new(Mutex::new(None));
        let transformer = {
            let saved = Arc::clone(&saved);
            Transformer::<u8, u8>::identity().on_start(move |c| {
                *saved.lock().unwrap() = Some(c);
                future::ok(())
            })
        };
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let mut pending = Box::pin(writer.write(1));
        settle().await;
        assert!(poll_immediate(&mut pending).await.is_none());

        let reason = StreamError::transform("upstream corrupt");
        let controller = saved.lock().unwrap().clone().unwrap();
        controller.error(reason.clone());

        assert_eq!(pending.await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason.clone()));
        assert_eq!(writer.write(2).await, Err(reason.clone()));
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio::test]
    async fn test_terminate_closes_output_and_stops_input() {
        let transformer = Transformer::from_fn(|x: u32, c: TransformController<u32>| async move {
            c.enqueue(x)?;
            if x == 2 {
                c.terminate();
            }
            Ok(())
        });
        let pipeline = TransformStream::with_strategies(
            transformer,
            QueuingStrategy::count(4.0),
            QueuingStrategy::count(4.0),
        )
        .unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        writer.write(1).await.unwrap();
        writer.write(2).await.unwrap();
        assert_eq!(writer.write(3).await, Err(StreamError::Terminated));
        assert_eq!(writer.closed().await, Err(StreamError::Terminated));

        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminate_unblocks_waiting_writer() {
        let saved = Arc::new(Mutex::new(None));
        let transformer = {
            let saved = Arc::clone(&saved);
            Transformer::<u8, u8>::identity().on_start(move |c| {
                *saved.lock().unwrap() = Some(c);
                future::ok(())
            })
        };
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let pending = writer.write(1);
        settle().await;
        saved.lock().unwrap().clone().unwrap().terminate();

        assert_eq!(pending.await, Err(StreamError::Terminated));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flush_runs_once_after_writes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let transformer = {
            let write_log = Arc::clone(&log);
            let flush_log = Arc::clone(&log);
            Transformer::from_fn(move |x: u32, c: TransformController<String>| {
                write_log.lock().unwrap().push(format!("transform {x}"));
                future::ready(c.enqueue(x.to_string()))
            })
            .on_flush(move |c| {
                flush_log.lock().unwrap().push("flush".to_string());
                future::ready(c.enqueue("end".to_string()))
            })
        };
        let pipeline = TransformStream::from_config(
            transformer,
            &TransformConfig {
                writable_high_water_mark: 4.0,
                readable_high_water_mark: 8.0,
            },
        )
        .unwrap();
        let writer = pipeline.writable().get_writer().unwrap();

        let first = writer.write(1);
        let second = writer.write(2);
        let close = writer.close();
        assert!(matches!(
            writer.close().await,
            Err(StreamError::InvalidState(_))
        ));
        first.await.unwrap();
        second.await.unwrap();
        close.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["transform 1", "transform 2", "flush"]
        );
        let items: Vec<String> = pipeline
            .readable()
            .get_reader()
            .unwrap()
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["1", "2", "end"]);
    }

    #[tokio::test]
    async fn test_flush_failure_errors_both_sides() {
        let reason = StreamError::transform("trailer missing");
        let transformer = {
            let reason = reason.clone();
            Transformer::<u8, u8>::identity().on_flush(move |_| future::err(reason.clone()))
        };
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        assert_eq!(writer.close().await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason));
    }

    #[tokio::test]
    async fn test_transform_failure_rejects_write_and_read() {
        let transformer = Transformer::from_fn(|x: i32, c: TransformController<i32>| async move {
            if x < 0 {
                return Err(StreamError::transform(format!("negative input {x}")));
            }
            c.enqueue(x)
        });
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let read = tokio::spawn(async move { reader.read().await });
        let reason = StreamError::transform("negative input -1");
        assert_eq!(writer.write(-1).await, Err(reason.clone()));
        assert_eq!(read.await.unwrap(), Err(reason));
    }

    #[tokio::test]
    async fn test_abort_reason_reaches_reader_unchanged() {
        let pipeline = TransformStream::<u8, u8>::new(Transformer::identity()).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let reason = StreamError::aborted("operator stop");
        let pending = writer.write(1);
        writer.abort(reason.clone()).await.unwrap();

        assert_eq!(pending.await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason));
    }

    #[tokio::test]
    async fn test_cancel_reason_reaches_writer_unchanged() {
        let pipeline = TransformStream::<u8, u8>::new(Transformer::identity()).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let pending = writer.write(1);
        settle().await;
        let reason = StreamError::canceled("consumer gone");
        reader.cancel(reason.clone()).await.unwrap();

        assert_eq!(pending.await, Err(reason.clone()));
        assert_eq!(writer.closed().await, Err(reason));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_reports_output_closed() {
        let transformer = Transformer::from_fn(|x: u8, c: TransformController<u8>| async move {
            c.terminate();
            c.enqueue(x)
        });
        let pipeline = TransformStream::from_config(
            transformer,
            &TransformConfig {
                readable_high_water_mark: 1.0,
                ..TransformConfig::default()
            },
        )
        .unwrap();
        let writer = pipeline.writable().get_writer().unwrap();

        // The output side was closed, not errored, so no reason is attached
        assert_eq!(
            writer.write(1).await,
            Err(StreamError::output_closed(None))
        );
        assert_eq!(writer.closed().await, Err(StreamError::Terminated));
        let reader = pipeline.readable().get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_output_size_is_fatal() {
        let pipeline = TransformStream::with_strategies(
            Transformer::<i32, i32>::identity(),
            QueuingStrategy::count(1.0),
            QueuingStrategy::with_size(4.0, |x: &i32| f64::from(*x)),
        )
        .unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        writer.write(1).await.unwrap();
        let reason = StreamError::InvalidChunkSize(-2.0);
        assert_eq!(writer.write(-2).await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason));
    }

    #[tokio::test]
    async fn test_start_runs_before_first_transform() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let transformer = {
            let start_log = Arc::clone(&log);
            let write_log = Arc::clone(&log);
            Transformer::from_fn(move |x: u8, c: TransformController<u8>| {
                write_log.lock().unwrap().push("transform");
                future::ready(c.enqueue(x))
            })
            .on_start(move |c| {
                let start_log = Arc::clone(&start_log);
                async move {
                    tokio::task::yield_now().await;
                    start_log.lock().unwrap().push("start");
                    c.enqueue(0)
                }
            })
        };
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let write = writer.write(7);
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), Some(7));
        write.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["start", "transform"]);
    }

    #[tokio::test]
    async fn test_start_failure_errors_both_sides() {
        let reason = StreamError::transform("no schema");
        let transformer = {
            let reason = reason.clone();
            Transformer::<u8, u8>::identity().on_start(move |_| future::err(reason.clone()))
        };
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        assert_eq!(writer.write(1).await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason));
    }

    #[tokio::test]
    async fn test_panicking_transform_fails_pipeline() {
        let transformer = Transformer::from_fn(|x: u8, c: TransformController<u8>| async move {
            assert_ne!(x, 1, "cannot handle 1");
            c.enqueue(x)
        });
        let pipeline = TransformStream::from_config(
            transformer,
            &TransformConfig {
                readable_high_water_mark: 1.0,
                ..TransformConfig::default()
            },
        )
        .unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let read = tokio::spawn(async move { reader.read().await });
        let outcome = writer.write(1).await;
        let Err(StreamError::TransformFailure(message)) = &outcome else {
            panic!("expected a transform failure, got {outcome:?}");
        };
        assert!(message.starts_with("transform callback panicked"));

        let reason = outcome.unwrap_err();
        assert_eq!(read.await.unwrap(), Err(reason.clone()));
        assert_eq!(writer.closed().await, Err(reason.clone()));
        assert_eq!(writer.write(2).await, Err(reason));
    }

    fn explode(_: TransformController<u8>) -> future::Ready<Result<()>> {
        panic!("no schema")
    }

    #[tokio::test]
    async fn test_panicking_start_fails_both_sides() {
        let pipeline =
            TransformStream::new(Transformer::<u8, u8>::identity().on_start(explode)).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let reason = StreamError::transform("start callback panicked: no schema");
        assert_eq!(writer.write(1).await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason));
    }

    async fn missing_trailer(_: TransformController<u8>) -> Result<()> {
        panic!("trailer {}", 7)
    }

    #[tokio::test]
    async fn test_panicking_flush_rejects_close() {
        let transformer = Transformer::<u8, u8>::identity().on_flush(missing_trailer);
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        let reason = StreamError::transform("flush callback panicked: trailer 7");
        assert_eq!(writer.close().await, Err(reason.clone()));
        assert_eq!(reader.read().await, Err(reason));
    }

    /// A terminate issued while flush is still running does not cut the
    /// flush short: the flush finishes, the reader sees a clean end, and
    /// the writer's close reports the termination.
    #[tokio::test]
    async fn test_terminate_during_flush_lets_flush_finish() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let transformer = {
            let flushed = Arc::clone(&flushed);
            Transformer::<u8, u8>::identity().on_flush(move |c| {
                let flushed = Arc::clone(&flushed);
                async move {
                    c.terminate();
                    tokio::task::yield_now().await;
                    flushed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let pipeline = TransformStream::new(transformer).unwrap();
        let writer = pipeline.writable().get_writer().unwrap();
        let reader = pipeline.readable().get_reader().unwrap();

        assert_eq!(writer.close().await, Err(StreamError::Terminated));
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_desired_size_reports_output_capacity() {
        let saved = Arc::new(Mutex::new(None));
        let transformer = {
            let saved = Arc::clone(&saved);
            Transformer::<u8, u8>::identity().on_start(move |c| {
                *saved.lock().unwrap() = Some(c);
                future::ok(())
            })
        };
        let pipeline = TransformStream::from_config(
            transformer,
            &TransformConfig {
                writable_high_water_mark: 1.0,
                readable_high_water_mark: 3.0,
            },
        )
        .unwrap();
        let controller = saved.lock().unwrap().clone().unwrap();
        assert_eq!(controller.desired_size(), Some(3.0));

        controller.enqueue(1).unwrap();
        assert_eq!(controller.desired_size(), Some(2.0));
        drop(pipeline);
        assert_eq!(controller.desired_size(), None);
    }

    #[test_case(0.0 ; "unbuffered output")]
    #[test_case(1.0 ; "single slot output")]
    #[test_case(16.0 ; "deep output")]
    fn test_pipe_through_doubles_everything(readable_high_water_mark: f64) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let pipeline = TransformStream::from_config(
                doubling(&calls),
                &TransformConfig {
                    readable_high_water_mark,
                    ..TransformConfig::default()
                },
            )
            .unwrap();
            let source = ReadableStream::from_iter(1..=10).unwrap();
            let output = source.pipe_through(pipeline, PipeOptions::default()).unwrap();

            let items: Vec<i32> = output
                .get_reader()
                .unwrap()
                .into_stream()
                .map(|item| item.unwrap())
                .collect()
                .await;
            assert_eq!(items, (1..=10).map(|x| x * 2).collect::<Vec<_>>());
            assert_eq!(calls.load(Ordering::SeqCst), 10);
        });
    }

    #[tokio::test]
    async fn test_pipe_through_rejects_locked_source() {
        let source = ReadableStream::from_iter(vec![1u8]).unwrap();
        let _reader = source.get_reader().unwrap();
        let pipeline = TransformStream::new(Transformer::identity()).unwrap();
        assert!(matches!(
            source.pipe_through(pipeline, PipeOptions::default()),
            Err(StreamError::Locked)
        ));
    }

    proptest! {
        #[test]
        fn prop_identity_preserves_order(items in proptest::collection::vec(any::<u16>(), 0..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let observed = runtime.block_on(async {
                let pipeline = TransformStream::new(Transformer::identity()).unwrap();
                let (writable, readable) = pipeline.into_parts();

                let expected = items.len();
                let producer = {
                    let items = items.clone();
                    tokio::spawn(async move {
                        let writer = writable.get_writer().unwrap();
                        for item in items {
                            writer.write(item).await.unwrap();
                        }
                        writer.close().await.unwrap();
                    })
                };

                let reader = readable.get_reader().unwrap();
                let mut observed = Vec::with_capacity(expected);
                while let Some(item) = reader.read().await.unwrap() {
                    observed.push(item);
                }
                producer.await.unwrap();
                observed
            });
            prop_assert_eq!(observed, items);
        }
    }
}
