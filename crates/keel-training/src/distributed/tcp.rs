//! TCP rendezvous process group.
//!
//! Rank 0 listens on the master endpoint and every other rank connects to
//! it, giving a star topology. Join completes once rank 0 has heard from
//! every peer and acknowledged each one. A broadcast from a non-zero source
//! travels to rank 0 first, which relays it to the remaining peers.

use crate::config::DistParams;
use crate::distributed::{Launcher, ProcessGroup, ProcessGroupConnector, Rendezvous};
use crate::error::{LaunchError, LaunchResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const HELLO_MAGIC: &[u8; 4] = b"KEEL";
const ACK: u8 = 0x06;
const CONNECT_RETRY: Duration = Duration::from_millis(200);
const MAX_FRAME: usize = 1 << 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl ProcessGroupConnector for TcpConnector {
    async fn join(
        &self,
        _launcher: Launcher,
        rendezvous: &Rendezvous,
        params: &DistParams,
    ) -> LaunchResult<Box<dyn ProcessGroup>> {
        let group = TcpProcessGroup::join(rendezvous, Duration::from_secs(params.timeout_secs)).await?;
        Ok(Box::new(group))
    }
}

#[derive(Debug)]
enum Links {
    /// Held by rank 0: one stream per peer, index `rank - 1`.
    Root(Vec<Mutex<TcpStream>>),
    /// Held by every other rank: the stream to rank 0.
    Peer(Mutex<TcpStream>),
}

#[derive(Debug)]
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    links: Links,
}

impl TcpProcessGroup {
    /// Join the group described by `rendezvous`. `timeout` bounds how long
    /// rank 0 waits for peers and how long peers keep trying to connect.
    pub async fn join(rendezvous: &Rendezvous, timeout: Duration) -> LaunchResult<Self> {
        let Rendezvous { rank, world_size, .. } = *rendezvous;
        let links = if rank == 0 {
            Links::Root(accept_peers(rendezvous, timeout).await?)
        } else {
            Links::Peer(Mutex::new(connect_to_root(rendezvous, timeout).await?))
        };
        Ok(Self { rank, world_size, links })
    }
}

async fn accept_peers(rendezvous: &Rendezvous, timeout: Duration) -> LaunchResult<Vec<Mutex<TcpStream>>> {
    let endpoint = format!("{}:{}", rendezvous.master_addr, rendezvous.port);
    let listener = TcpListener::bind(&endpoint)
        .await
        .map_err(|e| LaunchError::dist(format!("rank 0 cannot listen on {endpoint}: {e}")))?;

    let deadline = Instant::now() + timeout;
    let mut peers: Vec<Option<TcpStream>> = (1..rendezvous.world_size).map(|_| None).collect();
    let mut pending = peers.len();

    while pending > 0 {
        let (mut stream, addr) = tokio::time::timeout_at(deadline, listener.accept())
            .await
            .map_err(|_| {
                LaunchError::dist(format!("timed out waiting for {pending} peer(s) to join on {endpoint}"))
            })?
            .map_err(|e| LaunchError::dist(format!("accept failed on {endpoint}: {e}")))?;

        let (peer_rank, peer_world) = read_hello(&mut stream).await?;
        if peer_world != rendezvous.world_size {
            return Err(LaunchError::dist(format!(
                "peer {addr} reports world size {peer_world}, expected {}",
                rendezvous.world_size
            )));
        }
        let slot = peer_rank
            .checked_sub(1)
            .and_then(|idx| peers.get_mut(idx))
            .ok_or_else(|| LaunchError::dist(format!("peer {addr} announced invalid rank {peer_rank}")))?;
        if slot.is_some() {
            return Err(LaunchError::dist(format!("rank {peer_rank} joined twice")));
        }
        debug!(peer_rank, %addr, "peer joined");
        *slot = Some(stream);
        pending -= 1;
    }

    let mut links = Vec::with_capacity(peers.len());
    for stream in peers.into_iter().flatten() {
        let mut stream = stream;
        stream.write_u8(ACK).await.map_err(io_err)?;
        links.push(Mutex::new(stream));
    }
    Ok(links)
}

async fn connect_to_root(rendezvous: &Rendezvous, timeout: Duration) -> LaunchResult<TcpStream> {
    let endpoint = format!("{}:{}", rendezvous.master_addr, rendezvous.port);
    let deadline = Instant::now() + timeout;
    let mut stream = loop {
        match TcpStream::connect(&endpoint).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + CONNECT_RETRY < deadline => {
                debug!(rank = rendezvous.rank, error = %e, "master not reachable yet");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(LaunchError::dist(format!(
                    "rank {} could not reach master {endpoint}: {e}",
                    rendezvous.rank
                )));
            }
        }
    };

    stream.write_all(HELLO_MAGIC).await.map_err(io_err)?;
    stream.write_u32_le(to_u32(rendezvous.rank)?).await.map_err(io_err)?;
    stream.write_u32_le(to_u32(rendezvous.world_size)?).await.map_err(io_err)?;

    let ack = tokio::time::timeout_at(deadline, stream.read_u8())
        .await
        .map_err(|_| LaunchError::dist("timed out waiting for the master to acknowledge join"))?
        .map_err(io_err)?;
    if ack != ACK {
        return Err(LaunchError::dist(format!("unexpected join acknowledgement byte {ack:#04x}")));
    }
    Ok(stream)
}

async fn read_hello(stream: &mut TcpStream) -> LaunchResult<(usize, usize)> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await.map_err(io_err)?;
    if &magic != HELLO_MAGIC {
        return Err(LaunchError::dist("peer sent an invalid join greeting"));
    }
    let rank = stream.read_u32_le().await.map_err(io_err)? as usize;
    let world = stream.read_u32_le().await.map_err(io_err)? as usize;
    Ok((rank, world))
}

async fn write_frame(stream: &mut TcpStream, src: usize, payload: &[u8]) -> LaunchResult<()> {
    stream.write_u32_le(to_u32(src)?).await.map_err(io_err)?;
    stream.write_u32_le(to_u32(payload.len())?).await.map_err(io_err)?;
    stream.write_all(payload).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)
}

async fn read_frame(stream: &mut TcpStream, src: usize, buf: &mut [u8]) -> LaunchResult<()> {
    let from = stream.read_u32_le().await.map_err(io_err)? as usize;
    let len = stream.read_u32_le().await.map_err(io_err)? as usize;
    if from != src || len != buf.len() || len > MAX_FRAME {
        return Err(LaunchError::dist(format!(
            "expected {} bytes from rank {src}, got {len} bytes from rank {from}",
            buf.len()
        )));
    }
    stream.read_exact(buf).await.map_err(io_err)?;
    Ok(())
}

fn to_u32(value: usize) -> LaunchResult<u32> {
    u32::try_from(value).map_err(|_| LaunchError::dist(format!("{value} does not fit the wire format")))
}

fn io_err(e: std::io::Error) -> LaunchError {
    LaunchError::dist(format!("process group connection failed: {e}"))
}

#[async_trait]
impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, buf: &mut [u8], src: usize) -> LaunchResult<()> {
        if src >= self.world_size {
            return Err(LaunchError::dist(format!(
                "broadcast source {src} is out of range for world size {}",
                self.world_size
            )));
        }
        if buf.len() > MAX_FRAME {
            return Err(LaunchError::dist(format!("broadcast of {} bytes exceeds the frame limit", buf.len())));
        }

        match &self.links {
            Links::Root(peers) => {
                if src != 0 {
                    let mut stream = peers[src - 1].lock().await;
                    read_frame(&mut stream, src, buf).await?;
                }
                for (idx, peer) in peers.iter().enumerate() {
                    if idx + 1 == src {
                        continue;
                    }
                    write_frame(&mut *peer.lock().await, src, buf).await?;
                }
                Ok(())
            }
            Links::Peer(root) => {
                let mut stream = root.lock().await;
                if self.rank == src {
                    write_frame(&mut stream, src, buf).await
                } else {
                    read_frame(&mut stream, src, buf).await
                }
            }
        }
    }
}
