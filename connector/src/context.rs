use std::future::Future;

/// Captures the runtime handle a caller is on so later continuations that
/// fire from broker client callback threads can jump back to it. There is no
/// distinct "event-loop" vs "worker" path to model on tokio the way the
/// broker client's own native runtime does: a tokio runtime handle is already
/// the unit of affinity, so `emit_on` either runs in place (already on the
/// right handle) or hands the future to that handle's pool and awaits it.
#[derive(Clone)]
pub struct ContextExecutor {
    handle: tokio::runtime::Handle,
}

impl ContextExecutor {
    /// Captures the current Tokio runtime. Must be called from within a
    /// runtime (panics otherwise); callers are always expected to have one.
    pub fn capture() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub async fn emit_on<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let on_this_handle = tokio::runtime::Handle::try_current()
            .map(|current| current.id() == self.handle.id())
            .unwrap_or(false);

        if on_this_handle {
            fut.await
        } else {
            self.handle
                .spawn(fut)
                .await
                .expect("context executor task panicked")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_on_runs_in_place_when_already_on_the_captured_context() {
        let executor = ContextExecutor::capture();
        let result = executor.emit_on(async { 1 + 1 }).await;
        assert_eq!(result, 2);
    }
}
