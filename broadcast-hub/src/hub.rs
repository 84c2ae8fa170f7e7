//! The serialized membership and fan-out core.
//!
//! A single task owns the membership set. Every join, leave and broadcast is
//! sent to that task over a bounded queue and processed to completion before
//! the next request is looked at, so iteration and mutation of the set can
//! never interleave and no lock is needed around it.
//!
//! - [`Hub`] is the task itself; [`Hub::spawn`] starts it on the runtime.
//! - [`HubHandle`] is the cloneable API that connection adapters hold.
//! - [`Participant`] / [`Mailbox`] are the two ends of one member's bounded
//!   outbound queue: the hub writes into the former, the adapter drains the
//!   latter.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of one participant handle. Two connections from the same peer
/// get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// How long the hub may wait on a single member's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Enqueue without waiting; a full queue counts as a failed delivery.
    #[default]
    Immediate,
    /// Wait up to the given duration for queue space before giving up.
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each participant's outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of the request queue feeding the hub task.
    pub request_capacity: usize,
    pub delivery: DeliveryPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            request_capacity: 256,
            delivery: DeliveryPolicy::Immediate,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is closed")]
    Closed,
}

/// Outcome of one fan-out step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: usize,
}

/// The hub's end of a member's outbound queue.
#[derive(Debug)]
pub struct Participant {
    id: ParticipantId,
    outbound: mpsc::Sender<Bytes>,
    released: CancellationToken,
}

impl Participant {
    pub fn id(&self) -> ParticipantId {
        self.id
    }
}

impl Drop for Participant {
    // Every removal path (leave, eviction, rejected join, hub stop) drops the
    // participant, so this is the single place the release signal fires.
    fn drop(&mut self) {
        self.released.cancel();
    }
}

/// The adapter's end of a member's outbound queue.
///
/// `recv` yields payloads in broadcast order and returns `None` once the hub
/// has released the participant (leave, eviction or shutdown) and every
/// queued payload has been drained.
#[derive(Debug)]
pub struct Mailbox {
    id: ParticipantId,
    inbound: mpsc::Receiver<Bytes>,
    released: CancellationToken,
}

impl Mailbox {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Fires as soon as the hub drops this participant, even while payloads
    /// are still queued or a write to the peer is blocked. Cancelling the
    /// returned token does not affect the hub.
    pub fn release_signal(&self) -> CancellationToken {
        self.released.child_token()
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }
}

enum Request {
    Join {
        participant: Participant,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },
    Leave {
        id: ParticipantId,
        respond_to: oneshot::Sender<bool>,
    },
    Broadcast {
        payload: Bytes,
        respond_to: oneshot::Sender<Delivery>,
    },
    MemberCount {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    requests: mpsc::Sender<Request>,
    next_id: Arc<AtomicU64>,
    outbound_capacity: usize,
}

impl HubHandle {
    /// Allocates a fresh participant and its mailbox. The participant is not
    /// a member until it is passed to [`HubHandle::join`].
    pub fn open_participant(&self) -> (Participant, Mailbox) {
        let id = ParticipantId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, inbound) = mpsc::channel(self.outbound_capacity);
        let released = CancellationToken::new();
        (
            Participant {
                id,
                outbound,
                released: released.clone(),
            },
            Mailbox {
                id,
                inbound,
                released,
            },
        )
    }

    /// Adds `participant` to the membership set. Once this resolves the
    /// participant receives every later broadcast until it leaves or is
    /// evicted.
    pub async fn join(&self, participant: Participant) -> Result<(), HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Join {
            participant,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| HubError::Closed)?
    }

    /// Removes `id` from the membership set. Returns `false` when it was
    /// already absent, which is not an error.
    pub async fn leave(&self, id: ParticipantId) -> Result<bool, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Leave { id, respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Fans `payload` out to every current member. Members whose delivery
    /// fails are evicted before this resolves; their failure is only visible
    /// in the returned counts.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<Delivery, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Broadcast {
            payload: payload.into(),
            respond_to,
        })
        .await?;
        response.await.map_err(|_| HubError::Closed)
    }

    pub async fn member_count(&self) -> Result<usize, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::MemberCount { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Closes the hub. Requests queued before the shutdown are drained
    /// (joins rejected, leaves and broadcasts honored), then every remaining
    /// member is released. Resolves once the hub task has stopped.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Shutdown { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, request: Request) -> Result<(), HubError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// The serialization point. Owns the membership set exclusively.
pub struct Hub {
    requests: mpsc::Receiver<Request>,
    members: HashMap<ParticipantId, Participant>,
    delivery: DeliveryPolicy,
    closing: Vec<oneshot::Sender<()>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.request_capacity.max(1));
        let hub = Self {
            requests: rx,
            members: HashMap::new(),
            delivery: config.delivery,
            closing: Vec::new(),
        };
        let handle = HubHandle {
            requests: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            outbound_capacity: config.outbound_capacity.max(1),
        };
        (hub, handle)
    }

    /// Starts the hub task and returns a handle to it.
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Processes requests one at a time until shut down or until every
    /// handle has been dropped.
    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.handle(request).await;
        }

        let released = self.members.len();
        self.members.clear();
        info!(released, "hub stopped");
        for respond_to in self.closing.drain(..) {
            let _ = respond_to.send(());
        }
    }

    fn is_closing(&self) -> bool {
        !self.closing.is_empty()
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Join {
                participant,
                respond_to,
            } => {
                let _ = respond_to.send(self.join(participant));
            }
            Request::Leave { id, respond_to } => {
                let _ = respond_to.send(self.leave(id));
            }
            Request::Broadcast {
                payload,
                respond_to,
            } => {
                let delivery = self.broadcast(payload).await;
                let _ = respond_to.send(delivery);
            }
            Request::MemberCount { respond_to } => {
                let _ = respond_to.send(self.members.len());
            }
            Request::Shutdown { respond_to } => {
                if !self.is_closing() {
                    info!(members = self.members.len(), "hub draining");
                    // Buffered requests are still drained; new sends fail.
                    self.requests.close();
                }
                self.closing.push(respond_to);
            }
        }
    }

    fn join(&mut self, participant: Participant) -> Result<(), HubError> {
        if self.is_closing() {
            debug!(participant = %participant.id, "join rejected, hub closing");
            return Err(HubError::Closed);
        }
        let id = participant.id;
        self.members.entry(id).or_insert(participant);
        debug!(participant = %id, members = self.members.len(), "participant joined");
        Ok(())
    }

    fn leave(&mut self, id: ParticipantId) -> bool {
        let removed = self.members.remove(&id).is_some();
        if removed {
            debug!(participant = %id, members = self.members.len(), "participant left");
        }
        removed
    }

    async fn broadcast(&mut self, payload: Bytes) -> Delivery {
        let mut delivery = Delivery::default();
        let mut failed = Vec::new();

        for (id, participant) in &self.members {
            match deliver(self.delivery, participant, payload.clone()).await {
                Ok(()) => delivery.delivered += 1,
                Err(reason) => {
                    debug!(participant = %id, %reason, "delivery failed");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.members.remove(&id);
            delivery.evicted += 1;
            warn!(participant = %id, "participant evicted");
        }

        delivery
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryFailure {
    Closed,
    Full,
    TimedOut,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DeliveryFailure::Closed => "mailbox closed",
            DeliveryFailure::Full => "outbound queue full",
            DeliveryFailure::TimedOut => "send timed out",
        };
        f.write_str(reason)
    }
}

async fn deliver(
    policy: DeliveryPolicy,
    participant: &Participant,
    payload: Bytes,
) -> Result<(), DeliveryFailure> {
    match policy {
        DeliveryPolicy::Immediate => {
            participant
                .outbound
                .try_send(payload)
                .map_err(|err| match err {
                    mpsc::error::TrySendError::Full(_) => DeliveryFailure::Full,
                    mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
                })
        }
        DeliveryPolicy::Timeout(limit) => {
            match timeout(limit, participant.outbound.send(payload)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(DeliveryFailure::Closed),
                Err(_) => Err(DeliveryFailure::TimedOut),
            }
        }
    }
}
