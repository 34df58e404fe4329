use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Future, FutureExt, Stream, ready};
use pin_project_lite::pin_project;
use tracing::info;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};

/// Limits of the batches emitted by [`BatchStream`].
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_size: usize,
    pub max_fill: Duration,
}

// Adapted from tokio-stream's `chunks_timeout` adapter.
pin_project! {
    /// A stream adapter that batches items by size and time.
    ///
    /// A batch is emitted when it reaches `max_size` items or when `max_fill` elapsed since its
    /// first poll. A stop request ends the stream, returning the pending items as
    /// [`ShutdownResult::Shutdown`].
    #[must_use = "streams do nothing unless polled"]
    pub struct BatchStream<B, S: Stream<Item = B>> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        stopped: BoxFuture<'static, ()>,
        items: Vec<S::Item>,
        limits: BatchLimits,
        reset_timer: bool,
        inner_stream_ended: bool,
        stream_stopped: bool,
    }
}

impl<B, S: Stream<Item = B>> BatchStream<B, S> {
    pub fn wrap(stream: S, limits: BatchLimits, shutdown_rx: &ShutdownRx) -> Self {
        BatchStream {
            stream,
            deadline: None,
            stopped: shutdown_rx.stopped().boxed(),
            items: Vec::with_capacity(limits.max_size),
            limits,
            reset_timer: true,
            inner_stream_ended: false,
            stream_stopped: false,
        }
    }
}

impl<B, S: Stream<Item = B>> Stream for BatchStream<B, S> {
    type Item = ShutdownResult<Vec<S::Item>, Vec<S::Item>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.as_mut().project();

        if *this.inner_stream_ended || *this.stream_stopped {
            return Poll::Ready(None);
        }

        loop {
            // A stop wins over everything else. Buffered items are handed back unapplied.
            if this.stopped.as_mut().poll(cx).is_ready() {
                info!("batch stream stopped");
                *this.stream_stopped = true;

                return Poll::Ready(Some(ShutdownResult::Shutdown(std::mem::take(this.items))));
            }

            if *this.reset_timer {
                this.deadline
                    .set(Some(tokio::time::sleep(this.limits.max_fill)));
                *this.reset_timer = false;
            }

            if this.items.is_empty() {
                this.items.reserve_exact(this.limits.max_size);
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(item)) => {
                    this.items.push(item);

                    if this.items.len() >= this.limits.max_size {
                        *this.reset_timer = true;
                        return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                    }
                }
                Poll::Ready(None) => {
                    let last = if this.items.is_empty() {
                        None
                    } else {
                        *this.reset_timer = true;
                        Some(ShutdownResult::Ok(std::mem::take(this.items)))
                    };

                    *this.inner_stream_ended = true;

                    return Poll::Ready(last);
                }
            }
        }

        if !this.items.is_empty()
            && let Some(deadline) = this.deadline.as_pin_mut()
        {
            ready!(deadline.poll(cx));
            *this.reset_timer = true;

            return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use futures::StreamExt;

    fn limits(max_size: usize, max_fill_ms: u64) -> BatchLimits {
        BatchLimits {
            max_size,
            max_fill: Duration::from_millis(max_fill_ms),
        }
    }

    #[tokio::test]
    async fn emits_full_batches_then_the_remainder() {
        let (_tx, rx) = create_shutdown_channel();
        let stream = BatchStream::wrap(futures::stream::iter(1..=5), limits(2, 10_000), &rx);

        let batches: Vec<_> = stream.collect().await;

        assert_eq!(
            batches,
            vec![
                ShutdownResult::Ok(vec![1, 2]),
                ShutdownResult::Ok(vec![3, 4]),
                ShutdownResult::Ok(vec![5]),
            ]
        );
    }

    #[tokio::test]
    async fn emits_partial_batch_when_the_deadline_passes() {
        let (_tx, rx) = create_shutdown_channel();
        let source = futures::stream::iter(vec![1]).chain(futures::stream::pending());
        let mut stream = Box::pin(BatchStream::wrap(source, limits(10, 20), &rx));

        let batch = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();

        assert_eq!(batch, Some(ShutdownResult::Ok(vec![1])));
    }

    #[tokio::test]
    async fn stop_hands_back_buffered_items_and_ends_the_stream() {
        let (tx, rx) = create_shutdown_channel();
        let source = futures::stream::iter(vec![1, 2]).chain(futures::stream::pending());
        let mut stream = Box::pin(BatchStream::wrap(source, limits(10, 60_000), &rx));

        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err());

        tx.shutdown();
        let batch = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();

        assert_eq!(batch, Some(ShutdownResult::Shutdown(vec![1, 2])));
        assert_eq!(stream.next().await, None);
    }
}
