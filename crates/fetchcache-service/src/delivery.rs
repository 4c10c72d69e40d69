//! Result sinks and the in-order delivery of download outcomes.
//!
//! Every caller of [`FetchCoordinator::request`](crate::coordinator::FetchCoordinator::request)
//! supplies a [`ResultSink`] together with an [`ObserverId`] and an [`IdentityToken`]. Once the
//! outcome for its resource is known, the sink receives exactly one [`Delivery`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::caching::{CacheContents, CacheError, ErrorKind};

/// Identifies a waiting caller, as opposed to the resource it waits for.
///
/// Registering a second request under the same id for the same resource replaces the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Issues a process-wide unique id from a monotonic counter.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Captures which logical slot a display was bound to when it asked for a resource.
///
/// A list cell that gets reassigned to another item while a download is outstanding reports a
/// different token by the time the download finishes, and then receives
/// [`Delivery::Superseded`] instead of the stale payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IdentityToken(pub u64);

/// The outcome handed to a [`ResultSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The resource is available.
    Loaded(Bytes),
    /// The resource is available, but the sink has moved on to another identity in the
    /// meantime. Carries no payload and no error.
    Superseded,
    /// The resource could not be produced.
    Failed(CacheError),
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Loaded(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed(err) => Some(err.kind()),
            _ => None,
        }
    }
}

/// The receiving end of a resource request.
///
/// The cache calls [`on_result`](Self::on_result) on the task that completed the lookup or
/// download. Moving the result to another thread (e.g. a UI thread) is up to the implementor.
/// A sink that panics only loses its own result, the other waiters of the download are still
/// served.
pub trait ResultSink: Send + Sync {
    /// The identity this sink is bound to right now.
    ///
    /// Sinks that do not track identity return `None` and always receive the outcome.
    fn current_token(&self) -> Option<IdentityToken> {
        None
    }

    fn on_result(&self, delivery: Delivery);
}

/// A [`ResultSink`] backed by a closure.
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(Delivery) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> ResultSink for FnSink<F>
where
    F: Fn(Delivery) + Send + Sync,
{
    fn on_result(&self, delivery: Delivery) {
        (self.0)(delivery)
    }
}

impl<F> fmt::Debug for FnSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

/// Validates downloaded payloads before they are cached.
///
/// The cache does not interpret payloads. A binding layer that decodes them (e.g. into images)
/// can reject bytes it will never be able to display, so they are neither kept in memory nor
/// persisted.
pub trait PayloadCheck: Send + Sync {
    /// Returns a description of the problem if `payload` is unusable.
    fn check(&self, payload: &Bytes) -> Result<(), String>;
}

impl<F> PayloadCheck for F
where
    F: Fn(&Bytes) -> Result<(), String> + Send + Sync,
{
    fn check(&self, payload: &Bytes) -> Result<(), String> {
        self(payload)
    }
}

/// A caller waiting for a resource.
#[derive(Clone)]
pub struct PendingRequest {
    pub observer: ObserverId,
    pub token: IdentityToken,
    pub sink: Arc<dyn ResultSink>,
}

impl PendingRequest {
    pub fn new(observer: ObserverId, token: IdentityToken, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            observer,
            token,
            sink,
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("observer", &self.observer)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Hands outcomes to waiting callers.
///
/// Delivery never happens while the registry lock is held. All waiters of one download cycle are
/// served sequentially, in the order they registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultDelivery;

impl ResultDelivery {
    /// Delivers `outcome` to a single waiter, honoring its identity token.
    pub fn deliver(&self, pending: &PendingRequest, outcome: &CacheContents<Bytes>) {
        let delivery = match outcome {
            Ok(payload) => match pending.sink.current_token() {
                Some(current) if current != pending.token => {
                    tracing::trace!(
                        observer = %pending.observer,
                        "Observer was rebound while waiting, superseding result"
                    );
                    Delivery::Superseded
                }
                _ => Delivery::Loaded(payload.clone()),
            },
            Err(err) => Delivery::Failed(err.clone()),
        };
        pending.sink.on_result(delivery);
    }

    /// Delivers `outcome` to all `waiters`, in iteration order.
    ///
    /// A panicking sink is logged and skipped.
    pub fn deliver_all<'a, I>(&self, waiters: I, outcome: &CacheContents<Bytes>)
    where
        I: IntoIterator<Item = &'a PendingRequest>,
    {
        for pending in waiters {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| self.deliver(pending, outcome)));
            if delivered.is_err() {
                tracing::error!(observer = %pending.observer, "Result sink panicked");
                metric!(counter("caches.delivery.panicked") += 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// A sink that records everything and can be rebound to another identity.
    #[derive(Default)]
    struct Slot {
        token: Mutex<Option<IdentityToken>>,
        received: Mutex<Vec<Delivery>>,
    }

    impl ResultSink for Slot {
        fn current_token(&self) -> Option<IdentityToken> {
            *self.token.lock().unwrap()
        }

        fn on_result(&self, delivery: Delivery) {
            self.received.lock().unwrap().push(delivery);
        }
    }

    #[test]
    fn test_observer_ids_are_unique() {
        let a = ObserverId::next();
        let b = ObserverId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_deliver_matching_token() {
        let slot = Arc::new(Slot::default());
        *slot.token.lock().unwrap() = Some(IdentityToken(7));

        let pending = PendingRequest::new(ObserverId::new(1), IdentityToken(7), slot.clone());
        ResultDelivery.deliver(&pending, &Ok(Bytes::from_static(b"abc")));

        let received = slot.received.lock().unwrap();
        assert_eq!(*received, [Delivery::Loaded(Bytes::from_static(b"abc"))]);
    }

    #[test]
    fn test_deliver_rebound_token() {
        let slot = Arc::new(Slot::default());
        let pending = PendingRequest::new(ObserverId::new(1), IdentityToken(7), slot.clone());

        // the cell now displays another item
        *slot.token.lock().unwrap() = Some(IdentityToken(8));
        ResultDelivery.deliver(&pending, &Ok(Bytes::from_static(b"abc")));

        let received = slot.received.lock().unwrap();
        assert_eq!(*received, [Delivery::Superseded]);
        assert!(!received[0].is_success());
        assert_eq!(received[0].payload(), None);
        assert_eq!(received[0].error_kind(), None);
    }

    #[test]
    fn test_failures_ignore_tokens() {
        let slot = Arc::new(Slot::default());
        *slot.token.lock().unwrap() = Some(IdentityToken(8));
        let pending = PendingRequest::new(ObserverId::new(1), IdentityToken(7), slot.clone());

        let err = CacheError::DownloadError("503 Service Unavailable".into());
        ResultDelivery.deliver(&pending, &Err(err.clone()));

        let received = slot.received.lock().unwrap();
        assert_eq!(*received, [Delivery::Failed(err)]);
        assert_eq!(received[0].error_kind(), Some(ErrorKind::TransportFailure));
    }

    #[test]
    fn test_deliver_all_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let waiters: Vec<_> = (1..=4)
            .map(|id| {
                let order = order.clone();
                let sink = FnSink::new(move |delivery: Delivery| {
                    assert!(delivery.is_success());
                    order.lock().unwrap().push(id);
                });
                PendingRequest::new(ObserverId::new(id), IdentityToken::default(), sink)
            })
            .collect();

        ResultDelivery.deliver_all(&waiters, &Ok(Bytes::from_static(&[1, 2, 3])));

        assert_eq!(*order.lock().unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_sink_does_not_starve_others() {
        let panicking = FnSink::new(|_: Delivery| panic!("sink bug"));
        let slot = Arc::new(Slot::default());
        let waiters = [
            PendingRequest::new(ObserverId::new(1), IdentityToken::default(), panicking),
            PendingRequest::new(ObserverId::new(2), IdentityToken::default(), slot.clone()),
        ];

        ResultDelivery.deliver_all(&waiters, &Ok(Bytes::from_static(b"abc")));

        let received = slot.received.lock().unwrap();
        assert_eq!(*received, [Delivery::Loaded(Bytes::from_static(b"abc"))]);
    }
}
