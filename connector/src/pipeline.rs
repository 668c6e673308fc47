use std::future::Future;

use async_stream::stream;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};

/// A single-subscriber, single-upstream mediator enforcing a demand cap on
/// in-flight writes. `max_inflight` of `None` means unbounded: every item seen from
/// upstream is dispatched to `write` immediately, relying on the broker
/// client's own buffer and `delivery.timeout.ms` for admission control.
///
/// Downstream emission order is completion order, not submission order;
/// callers that need strict ordering configure `max_inflight = Some(1)`.
#[derive(Clone, Copy, Debug)]
pub struct SenderPipeline {
    max_inflight: Option<usize>,
}

impl SenderPipeline {
    pub fn new(max_inflight: Option<usize>) -> Self {
        Self { max_inflight }
    }

    /// Drives `upstream` through `write`, yielding each write's result as
    /// soon as it completes. Dropping the returned stream cancels the
    /// upstream subscription; any sends still in flight at that point are
    /// simply never polled to completion again, matching "outstanding sends
    /// may still complete and are quietly discarded".
    pub fn run<S, T, O, F, Fut>(&self, upstream: S, write: F) -> impl Stream<Item = O>
    where
        S: Stream<Item = T> + Send + 'static,
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = O> + Send + 'static,
        T: Send + 'static,
        O: Send + 'static,
    {
        let demand = self.max_inflight.unwrap_or(usize::MAX);
        stream! {
            let mut upstream = Box::pin(upstream);
            let mut pending = FuturesUnordered::new();
            let mut upstream_done = false;

            loop {
                if upstream_done && pending.is_empty() {
                    break;
                }

                let want_more = !upstream_done && pending.len() < demand;

                tokio::select! {
                    item = upstream.next(), if want_more => {
                        match item {
                            Some(item) => pending.push(write(item)),
                            None => upstream_done = true,
                        }
                    }
                    Some(output) = pending.next(), if !pending.is_empty() => {
                        yield output;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::stream;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn every_item_is_written_exactly_once() {
        let pipeline = SenderPipeline::new(Some(2));
        let upstream = stream::iter(0..10);

        let results: Vec<_> = pipeline.run(upstream, |i| async move { i * 2 }).collect().await;

        let mut sorted = results;
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn bounded_inflight_never_exceeds_the_cap() {
        let max_inflight = 3usize;
        let pipeline = SenderPipeline::new(Some(max_inflight));
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let upstream = stream::iter(0..30);
        let inflight_clone = inflight.clone();
        let peak_clone = peak.clone();

        let results: Vec<_> = pipeline
            .run(upstream, move |i| {
                let inflight = inflight_clone.clone();
                let peak = peak_clone.clone();
                async move {
                    let current = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inflight.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .collect()
            .await;

        assert_eq!(results.len(), 30);
        assert!(peak.load(Ordering::SeqCst) <= max_inflight);
    }

    #[tokio::test]
    async fn max_inflight_one_preserves_submission_order() {
        let pipeline = SenderPipeline::new(Some(1));
        let upstream = stream::iter(0..5);

        let results: Vec<_> = pipeline.run(upstream, |i| async move { i }).collect().await;

        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unbounded_mode_drains_everything() {
        let pipeline = SenderPipeline::new(None);
        let upstream = stream::iter(0..50);

        let results: Vec<_> = pipeline.run(upstream, |i| async move { i }).collect().await;
        assert_eq!(results.len(), 50);
    }

    #[tokio::test]
    async fn cancelling_downstream_stops_new_dispatch() {
        let pipeline = SenderPipeline::new(Some(4));
        let dispatched = Arc::new(Mutex::new(0usize));
        let dispatched_clone = dispatched.clone();

        let upstream = stream::iter(0..1000);
        let mut stream = Box::pin(pipeline.run(upstream, move |i| {
            let dispatched = dispatched_clone.clone();
            async move {
                *dispatched.lock().await += 1;
                i
            }
        }));

        let _ = stream.next().await;
        drop(stream);

        let count = *dispatched.lock().await;
        assert!(count < 1000);
    }
}
