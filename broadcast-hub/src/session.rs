//! Connection adapter shared by every transport.
//!
//! A session joins the hub once, relays inbound payloads to `broadcast`,
//! writes mailbox payloads to the outbound sink, and leaves exactly once when
//! either direction ends.

use std::{fmt, io, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{select, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::{HubError, HubHandle, Mailbox, ParticipantId};

/// Upper bound on flushing the sink during teardown; a peer that stopped
/// reading must not hold the session open.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed its side of the connection.
    PeerClosed,
    /// Reading from the peer failed.
    ReadFailed,
    /// Writing to the peer failed.
    WriteFailed,
    /// The hub released this participant (eviction or shutdown).
    Released,
}

/// Drives one connection until it ends. Fails only when the hub refuses the
/// join; every later failure is reported through [`SessionEnd`].
pub async fn run_session<S, K>(
    hub: &HubHandle,
    mut inbound: S,
    mut outbound: K,
) -> Result<SessionEnd>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    K: Sink<Bytes> + Unpin,
    K::Error: fmt::Display,
{
    let (participant, mut mailbox) = hub.open_participant();
    let id = participant.id();
    hub.join(participant)
        .await
        .context("hub refused participant")?;
    debug!(participant = %id, "session started");

    let end = relay(hub, id, &mut inbound, &mut outbound, &mut mailbox).await;

    // Already evicted or hub gone: nothing left to undo.
    if let Err(HubError::Closed) = hub.leave(id).await {
        debug!(participant = %id, "hub closed before leave");
    }
    match timeout(CLOSE_TIMEOUT, outbound.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(participant = %id, %error, "outbound already closed"),
        Err(_) => debug!(participant = %id, "outbound close timed out"),
    }
    debug!(participant = %id, ?end, "session finished");

    Ok(end)
}

async fn relay<S, K>(
    hub: &HubHandle,
    id: ParticipantId,
    inbound: &mut S,
    outbound: &mut K,
    mailbox: &mut Mailbox,
) -> SessionEnd
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    K: Sink<Bytes> + Unpin,
    K::Error: fmt::Display,
{
    let released = mailbox.release_signal();

    loop {
        select! {
            biased;

            _ = released.cancelled() => return SessionEnd::Released,
            frame = inbound.next() => {
                match frame {
                    Some(Ok(payload)) => {
                        if hub.broadcast(payload).await.is_err() {
                            return SessionEnd::Released;
                        }
                    }
                    Some(Err(error)) => {
                        warn!(participant = %id, ?error, "read failed");
                        return SessionEnd::ReadFailed;
                    }
                    None => return SessionEnd::PeerClosed,
                }
            }
            payload = mailbox.recv() => {
                let Some(payload) = payload else {
                    return SessionEnd::Released;
                };
                if let Some(end) = write_payload(id, outbound, payload, &released).await {
                    return end;
                }
            }
        }
    }
}

/// Writes one payload unless the hub releases the participant first.
async fn write_payload<K>(
    id: ParticipantId,
    outbound: &mut K,
    payload: Bytes,
    released: &CancellationToken,
) -> Option<SessionEnd>
where
    K: Sink<Bytes> + Unpin,
    K::Error: fmt::Display,
{
    select! {
        biased;

        _ = released.cancelled() => {
            debug!(participant = %id, "released while writing");
            Some(SessionEnd::Released)
        }
        result = outbound.send(payload) => match result {
            Ok(()) => None,
            Err(error) => {
                debug!(participant = %id, %error, "write failed");
                Some(SessionEnd::WriteFailed)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context as TaskContext, Poll},
    };

    use futures::{channel::mpsc, stream};

    use super::*;
    use crate::hub::{Hub, HubConfig};

    /// A peer that never reads: every write and close stays pending.
    struct StalledSink;

    impl Sink<Bytes> for StalledSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Bytes) -> io::Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn inbound_payloads_reach_other_members() {
        let (hub, _) = Hub::spawn(HubConfig::default());
        let (observer, mut observer_mailbox) = hub.open_participant();
        hub.join(observer).await.unwrap();

        let inbound = stream::iter(vec![Ok(Bytes::from("one")), Ok(Bytes::from("two"))]);
        let (sink, _sent) = mpsc::unbounded::<Bytes>();

        let end = run_session(&hub, inbound, sink).await.unwrap();

        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(observer_mailbox.recv().await, Some(Bytes::from("one")));
        assert_eq!(observer_mailbox.recv().await, Some(Bytes::from("two")));
        assert_eq!(hub.member_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_error_leaves_the_hub() {
        let (hub, _) = Hub::spawn(HubConfig::default());
        let inbound = stream::iter(vec![Err(io::Error::from(io::ErrorKind::ConnectionReset))]);
        let (sink, _sent) = mpsc::unbounded::<Bytes>();

        let end = run_session(&hub, inbound, sink).await.unwrap();

        assert_eq!(end, SessionEnd::ReadFailed);
        assert_eq!(hub.member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_session() {
        let (hub, _) = Hub::spawn(HubConfig::default());
        let inbound = stream::pending::<io::Result<Bytes>>();
        let (sink, _sent) = mpsc::unbounded::<Bytes>();

        let session = tokio::spawn({
            let hub = hub.clone();
            async move { run_session(&hub, inbound, sink).await }
        });
        while hub.member_count().await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        hub.shutdown().await.unwrap();

        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Released);
    }

    #[tokio::test]
    async fn refused_when_hub_closed() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        hub.shutdown().await.unwrap();
        task.await.unwrap();

        let (sink, _sent) = mpsc::unbounded::<Bytes>();
        let result = run_session(&hub, stream::empty(), sink).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_ends_session_blocked_on_stalled_peer() {
        let (hub, _) = Hub::spawn(HubConfig {
            outbound_capacity: 1,
            ..HubConfig::default()
        });
        let session = tokio::spawn({
            let hub = hub.clone();
            let inbound = stream::pending::<io::Result<Bytes>>();
            async move { run_session(&hub, inbound, StalledSink).await }
        });
        while hub.member_count().await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }

        let mut evicted = false;
        for i in 0..5 {
            if hub.broadcast(format!("msg-{i}")).await.unwrap().evicted == 1 {
                evicted = true;
                break;
            }
        }
        assert!(evicted, "stalled participant should be evicted");
        assert_eq!(hub.member_count().await.unwrap(), 0);

        let end = timeout(Duration::from_secs(5), session)
            .await
            .expect("session should end after eviction")
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Released);
    }
}
