use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    frame::LineFrameCodec,
    hub::HubHandle,
    session::{SessionEnd, run_session},
};

/// Raw TCP transport: one newline-delimited frame is one payload.
pub struct TcpFrontend {
    listener: TcpListener,
    hub: HubHandle,
    max_frame_bytes: usize,
}

impl TcpFrontend {
    pub fn new(listener: TcpListener, hub: HubHandle, max_frame_bytes: usize) -> Self {
        Self {
            listener,
            hub,
            max_frame_bytes,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Sessions already
    /// running are left to end on their own when the hub releases them.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let TcpFrontend {
            listener,
            hub,
            max_frame_bytes,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("tcp frontend shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => spawn_connection(stream, peer, &hub, max_frame_bytes),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &HubHandle,
    max_frame_bytes: usize,
) {
    let hub = hub.clone();
    tokio::spawn(async move {
        match handle_connection(stream, peer, &hub, max_frame_bytes).await {
            Ok(end) => debug!(%peer, ?end, "connection closed"),
            Err(err) => warn!(%peer, error = ?err, "connection closed with error"),
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &HubHandle,
    max_frame_bytes: usize,
) -> Result<SessionEnd> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let inbound = FramedRead::new(reader, LineFrameCodec::new(max_frame_bytes));
    let outbound = FramedWrite::new(writer, LineFrameCodec::new(max_frame_bytes));

    run_session(hub, inbound, outbound).await
}
