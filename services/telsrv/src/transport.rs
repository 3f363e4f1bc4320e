//! TCP link transport
//!
//! One listener or dialer task per configured link. Reader halves push raw
//! chunks into a single event channel consumed by the gateway; writer
//! halves drain a per-peer outbound queue so sends never block the
//! ingestion path. Framing is not handled here, the protocol engines
//! reassemble frames from the chunk stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TelSrvError};
use crate::model::{LinkId, LinkMode, LinkSnapshot, PeerAddr};

const READ_BUF_SIZE: usize = 4096;
const PEER_QUEUE_DEPTH: usize = 64;
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Raw transport event delivered to the gateway
#[derive(Debug)]
pub enum LinkEvent {
    /// A peer connected (accepted or dialed)
    Connected { link_id: LinkId, peer: PeerAddr },
    /// Raw bytes received from a peer; chunk boundaries are arbitrary
    Data {
        link_id: LinkId,
        peer: PeerAddr,
        bytes: Bytes,
    },
    /// A peer connection closed or failed
    Disconnected { link_id: LinkId, peer: PeerAddr },
}

/// Outbound side of the transport, as seen by the protocol engines
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Send to one specific peer on a link
    async fn send_to_peer(&self, link_id: LinkId, peer: PeerAddr, data: &[u8]) -> Result<()>;

    /// Send to every connected peer on a link. Used when the target
    /// device's peer is not yet known on a listen link.
    async fn send_to_link(&self, link_id: LinkId, data: &[u8]) -> Result<()>;

    /// Whether the link's listener/dialer task is alive
    fn is_link_running(&self, link_id: LinkId) -> bool;
}

struct PeerHandle {
    tx: mpsc::Sender<Bytes>,
}

/// TCP implementation: one task per link plus one reader/writer pair per
/// peer connection
pub struct TcpTransport {
    event_tx: mpsc::Sender<LinkEvent>,
    links: DashMap<LinkId, JoinHandle<()>>,
    peers: Arc<DashMap<(LinkId, PeerAddr), PeerHandle>>,
}

impl TcpTransport {
    pub fn new(event_tx: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            event_tx,
            links: DashMap::new(),
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Start the link's listener or dialer task. Restarting an already
    /// running link tears the old task down first.
    pub fn start_link(&self, link: &LinkSnapshot) {
        self.stop_link(link.id);

        let event_tx = self.event_tx.clone();
        let peers = self.peers.clone();
        let link_id = link.id;
        let link = link.clone();
        let handle = match link.mode {
            LinkMode::Listen => tokio::spawn(run_listener(link, event_tx, peers)),
            LinkMode::Dial => tokio::spawn(run_dialer(link, event_tx, peers)),
        };
        self.links.insert(link_id, handle);
    }

    /// Stop a link task and drop all of its peer connections
    pub fn stop_link(&self, link_id: LinkId) {
        if let Some((_, handle)) = self.links.remove(&link_id) {
            handle.abort();
            info!(link_id, "link stopped");
        }
        self.peers.retain(|(lid, _), _| *lid != link_id);
    }

    /// Stop every link
    pub fn shutdown(&self) {
        let ids: Vec<LinkId> = self.links.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.stop_link(id);
        }
    }
}

#[async_trait]
impl LinkTransport for TcpTransport {
    async fn send_to_peer(&self, link_id: LinkId, peer: PeerAddr, data: &[u8]) -> Result<()> {
        let tx = self
            .peers
            .get(&(link_id, peer))
            .map(|h| h.tx.clone())
            .ok_or_else(|| {
                TelSrvError::LinkNotFound(format!("no connection to {peer} on link {link_id}"))
            })?;
        tx.send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TelSrvError::LinkNotFound(format!("peer {peer} write queue closed")))
    }

    async fn send_to_link(&self, link_id: LinkId, data: &[u8]) -> Result<()> {
        let targets: Vec<mpsc::Sender<Bytes>> = self
            .peers
            .iter()
            .filter(|e| e.key().0 == link_id)
            .map(|e| e.value().tx.clone())
            .collect();
        if targets.is_empty() {
            return Err(TelSrvError::LinkNotFound(format!(
                "no peers connected on link {link_id}"
            )));
        }
        let payload = Bytes::copy_from_slice(data);
        for tx in targets {
            // A single dead peer must not fail the broadcast
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    fn is_link_running(&self, link_id: LinkId) -> bool {
        self.links
            .get(&link_id)
            .is_some_and(|h| !h.is_finished())
    }
}

async fn run_listener(
    link: LinkSnapshot,
    event_tx: mpsc::Sender<LinkEvent>,
    peers: Arc<DashMap<(LinkId, PeerAddr), PeerHandle>>,
) {
    let listener = match TcpListener::bind(&link.endpoint).await {
        Ok(l) => l,
        Err(e) => {
            warn!(link_id = link.id, endpoint = %link.endpoint, "bind failed: {e}");
            return;
        }
    };
    info!(link_id = link.id, endpoint = %link.endpoint, "link listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(link_id = link.id, %peer, "peer accepted");
                tokio::spawn(run_connection(
                    link.id,
                    peer,
                    stream,
                    event_tx.clone(),
                    peers.clone(),
                ));
            }
            Err(e) => {
                warn!(link_id = link.id, "accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn run_dialer(
    link: LinkSnapshot,
    event_tx: mpsc::Sender<LinkEvent>,
    peers: Arc<DashMap<(LinkId, PeerAddr), PeerHandle>>,
) {
    loop {
        match TcpStream::connect(&link.endpoint).await {
            Ok(stream) => {
                let peer = match stream.peer_addr() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(link_id = link.id, "peer_addr failed: {e}");
                        tokio::time::sleep(DIAL_RETRY_DELAY).await;
                        continue;
                    }
                };
                info!(link_id = link.id, %peer, "link dialed");
                run_connection(link.id, peer, stream, event_tx.clone(), peers.clone()).await;
            }
            Err(e) => {
                debug!(link_id = link.id, endpoint = %link.endpoint, "dial failed: {e}");
            }
        }
        tokio::time::sleep(DIAL_RETRY_DELAY).await;
    }
}

/// Drive one peer connection until EOF or error
async fn run_connection(
    link_id: LinkId,
    peer: PeerAddr,
    stream: TcpStream,
    event_tx: mpsc::Sender<LinkEvent>,
    peers: Arc<DashMap<(LinkId, PeerAddr), PeerHandle>>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(PEER_QUEUE_DEPTH);
    peers.insert((link_id, peer), PeerHandle { tx: out_tx });

    if event_tx
        .send(LinkEvent::Connected { link_id, peer })
        .await
        .is_err()
    {
        peers.remove(&(link_id, peer));
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(link_id, %peer, "write failed: {e}");
                break;
            }
        }
    });

    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(link_id, %peer, "peer closed");
                break;
            }
            Ok(n) => {
                let event = LinkEvent::Data {
                    link_id,
                    peer,
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(link_id, %peer, "read failed: {e}");
                break;
            }
        }
    }

    write_task.abort();
    peers.remove(&(link_id, peer));
    let _ = event_tx
        .send(LinkEvent::Disconnected { link_id, peer })
        .await;
}
