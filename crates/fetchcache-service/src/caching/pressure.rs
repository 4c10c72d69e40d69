use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::EntryRegistry;

/// A process-wide "memory is running low" signal.
///
/// The host platform (or the application) calls [`signal`](Self::signal) when it wants caches to
/// shed memory. Any number of [`MemoryPressureListener`]s can subscribe.
#[derive(Debug, Clone)]
pub struct MemoryPressure {
    sender: broadcast::Sender<()>,
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPressure {
    pub fn new() -> Self {
        // Signals carry no data, and a lagging listener only needs to know that it lagged.
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Raises the signal, returning the number of listeners notified.
    pub fn signal(&self) -> usize {
        tracing::debug!("Memory pressure signaled");
        self.sender.send(()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

/// Evicts an [`EntryRegistry`] whenever [`MemoryPressure`] is signaled.
///
/// The listener runs as a background task until it is dropped or the signal goes away.
#[derive(Debug)]
pub struct MemoryPressureListener {
    handle: JoinHandle<()>,
}

impl MemoryPressureListener {
    /// Starts listening. Must be called from within a tokio runtime.
    pub fn spawn(registry: Arc<EntryRegistry>, pressure: &MemoryPressure) -> Self {
        Self::spawn_on(registry, pressure, &Handle::current())
    }

    /// Starts listening on `runtime`, from any thread.
    pub fn spawn_on(
        registry: Arc<EntryRegistry>,
        pressure: &MemoryPressure,
        runtime: &Handle,
    ) -> Self {
        let mut signals = pressure.subscribe();
        let handle = runtime.spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let evicted = registry.evict_all();
                        tracing::info!(evicted, "Evicted memory cache under memory pressure");
                        metric!(counter("caches.evict") += 1);
                        metric!(gauge("caches.memory.evicted") = evicted as u64);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { handle }
    }

    /// Whether the listener has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for MemoryPressureListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::caching::ResourceKey;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_signal_evicts() {
        let registry = Arc::new(EntryRegistry::default());
        let pressure = MemoryPressure::new();
        let _listener = MemoryPressureListener::spawn(registry.clone(), &pressure);

        let key = ResourceKey::parse("https://example.com/a.png").unwrap();
        registry.store_payload(&key, Bytes::from_static(b"a"));
        assert_eq!(registry.len(), 1);

        assert_eq!(pressure.signal(), 1);
        wait_until(|| registry.is_empty()).await;

        // listening continues after the first signal
        registry.store_payload(&key, Bytes::from_static(b"a"));
        pressure.signal();
        wait_until(|| registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_listener_stops_with_signal() {
        let registry = Arc::new(EntryRegistry::default());
        let pressure = MemoryPressure::new();
        let listener = MemoryPressureListener::spawn(registry, &pressure);

        drop(pressure);
        wait_until(|| listener.is_finished()).await;
    }

    #[test]
    fn test_signal_without_listeners() {
        let pressure = MemoryPressure::default();
        assert_eq!(pressure.signal(), 0);
    }
}
