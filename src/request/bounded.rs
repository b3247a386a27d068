//! Single in-flight request with a bounded wait for its response

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devseq_shared::{timing, SequencerError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Configuration for a bounded request channel
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Longest time a requester waits, covering both handoff and answer
    pub timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(timing::BOUNDED_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Create a requester and the responder-side receiver
pub fn bounded_request<Q, R>(config: RequestConfig) -> (BoundedRequest<Q, R>, RequestReceiver<Q, R>) {
    let (tx, rx) = mpsc::channel(1);
    (
        BoundedRequest {
            config,
            outbound: tx,
            in_flight: Arc::new(AtomicBool::new(false)),
        },
        RequestReceiver { inbound: rx },
    )
}

/// Issues one request at a time and waits at most `timeout` for the answer
pub struct BoundedRequest<Q, R> {
    config: RequestConfig,
    outbound: mpsc::Sender<PendingRequest<Q, R>>,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag however the request ends
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<Q, R> BoundedRequest<Q, R> {
    /// Send a request and wait for its response
    pub async fn request(&self, query: Q) -> Result<R, SequencerError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SequencerError::RequestInFlight);
        }
        let _guard = InFlightGuard(self.in_flight.clone());

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.outbound
                .send(PendingRequest {
                    query,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| SequencerError::ResponderGone)?;
            reply_rx.await.map_err(|_| SequencerError::ResponderGone)
        };

        // A responder that stopped reading leaves the channel full, so the
        // handoff is bounded by the same timeout as the answer
        match timeout(self.config.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                let ms = self.config.timeout.as_millis() as u64;
                warn!("Request timed out after {}ms", ms);
                Err(SequencerError::Timeout(ms))
            }
        }
    }

    /// Whether a request is awaiting its response
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Responder side of a bounded request channel
pub struct RequestReceiver<Q, R> {
    inbound: mpsc::Receiver<PendingRequest<Q, R>>,
}

impl<Q, R> RequestReceiver<Q, R> {
    /// Receive the next request, None once the requester is gone
    pub async fn recv(&mut self) -> Option<PendingRequest<Q, R>> {
        self.inbound.recv().await
    }
}

/// A request awaiting its response
pub struct PendingRequest<Q, R> {
    query: Q,
    reply: oneshot::Sender<R>,
}

impl<Q, R> PendingRequest<Q, R> {
    /// The request payload
    pub fn query(&self) -> &Q {
        &self.query
    }

    /// Answer the request. Returns the response back if the requester
    /// already gave up.
    pub fn respond(self, response: R) -> Result<(), R> {
        let result = self.reply.send(response);
        if result.is_err() {
            debug!("Late response discarded");
        }
        result
    }
}
