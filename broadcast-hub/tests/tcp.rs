use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use broadcast_hub::{
    frame::LineFrameCodec,
    hub::{Hub, HubConfig, HubHandle},
    tcp::TcpFrontend,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct Peer {
    reader: FramedRead<OwnedReadHalf, LineFrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, LineFrameCodec>,
}

impl Peer {
    /// Connects and waits until the hub echoes `hello` back, which proves
    /// this peer's session has joined.
    async fn connect(addr: SocketAddr, hello: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut peer = Peer {
            reader: FramedRead::new(reader, LineFrameCodec::default()),
            writer: FramedWrite::new(writer, LineFrameCodec::default()),
        };
        peer.send(hello).await?;
        assert_eq!(peer.recv().await?, Some(Bytes::from(hello.to_string())));
        Ok(peer)
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        self.writer
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        let frame = timeout(READ_TIMEOUT, self.reader.next())
            .await
            .context("timed out waiting for frame")?;
        Ok(frame.transpose()?)
    }

    /// The hub side may reset rather than close cleanly; both count.
    async fn expect_closed(&mut self) -> Result<()> {
        let frame = timeout(READ_TIMEOUT, self.reader.next())
            .await
            .context("connection stayed open")?;
        match frame {
            None | Some(Err(_)) => Ok(()),
            Some(Ok(payload)) => anyhow::bail!("unexpected frame {payload:?}"),
        }
    }
}

struct Running {
    addr: SocketAddr,
    hub: HubHandle,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

async fn start() -> Result<Running> {
    let (hub, _) = Hub::spawn(HubConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let frontend = TcpFrontend::new(listener, hub.clone(), 1024);
    let addr = frontend.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = frontend.run_until(shutdown).await;
    });

    Ok(Running {
        addr,
        hub,
        shutdown_tx,
        server,
    })
}

#[tokio::test]
async fn peers_receive_each_others_frames() -> Result<()> {
    let running = start().await?;
    let mut alice = Peer::connect(running.addr, "alice here").await?;
    let mut bob = Peer::connect(running.addr, "bob here").await?;

    assert_eq!(alice.recv().await?, Some(Bytes::from("bob here")));

    alice.send("hello bob").await?;
    assert_eq!(bob.recv().await?, Some(Bytes::from("hello bob")));
    assert_eq!(alice.recv().await?, Some(Bytes::from("hello bob")));
    assert_eq!(running.hub.member_count().await?, 2);

    let _ = running.shutdown_tx.send(());
    let _ = running.server.await;
    Ok(())
}

#[tokio::test]
async fn disconnect_leaves_the_hub() -> Result<()> {
    let running = start().await?;
    let alice = Peer::connect(running.addr, "alice here").await?;
    let mut bob = Peer::connect(running.addr, "bob here").await?;
    drop(alice);

    timeout(READ_TIMEOUT, async {
        while running.hub.member_count().await? != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::Ok(())
    })
    .await??;

    bob.send("anyone?").await?;
    assert_eq!(bob.recv().await?, Some(Bytes::from("anyone?")));

    let _ = running.shutdown_tx.send(());
    let _ = running.server.await;
    Ok(())
}

#[tokio::test]
async fn oversized_frame_drops_only_that_connection() -> Result<()> {
    let running = start().await?;
    let mut noisy = Peer::connect(running.addr, "noisy here").await?;
    let mut quiet = Peer::connect(running.addr, "quiet here").await?;
    assert_eq!(noisy.recv().await?, Some(Bytes::from("quiet here")));

    noisy.send(&"x".repeat(4096)).await?;
    noisy.expect_closed().await?;

    quiet.send("still fine").await?;
    assert_eq!(quiet.recv().await?, Some(Bytes::from("still fine")));

    let _ = running.shutdown_tx.send(());
    let _ = running.server.await;
    Ok(())
}

#[tokio::test]
async fn hub_shutdown_closes_connections() -> Result<()> {
    let running = start().await?;
    let mut alice = Peer::connect(running.addr, "alice here").await?;

    running.hub.shutdown().await?;
    alice.expect_closed().await?;

    let _ = running.shutdown_tx.send(());
    let _ = running.server.await;
    Ok(())
}
