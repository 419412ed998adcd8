use crate::error::BackendError;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const CONNECT_RETRY: Duration = Duration::from_millis(100);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Star-topology process group over TCP.
///
/// Rank 0 listens on the rendezvous port and holds one stream per peer
/// (indexed by `rank - 1`); every other rank holds a single stream to rank 0.
/// Frames are a `u32` little-endian byte length followed by `f32`
/// little-endian values.
#[derive(Debug)]
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    peers: Vec<TcpStream>,
}

impl TcpProcessGroup {
    pub fn connect(
        rank: usize,
        world_size: usize,
        master_addr: &str,
        master_port: u16,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        if world_size == 0 || rank >= world_size {
            return Err(BackendError::Transport(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        if world_size == 1 {
            return Ok(Self {
                rank,
                world_size,
                peers: Vec::new(),
            });
        }
        if rank == 0 {
            let listener = TcpListener::bind(("0.0.0.0", master_port))
                .map_err(|e| transport(format!("bind port {}: {}", master_port, e)))?;
            return Self::accept_peers(listener, world_size);
        }
        let stream = connect_with_retry(master_addr, master_port, timeout)?;
        Self::join(stream, rank, world_size)
    }

    pub fn accept_peers(listener: TcpListener, world_size: usize) -> Result<Self, BackendError> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < world_size - 1 {
            let (mut stream, peer_addr) = listener
                .accept()
                .map_err(|e| transport(format!("accept: {}", e)))?;
            let _ = stream.set_nodelay(true);
            let mut hello = [0u8; 8];
            stream
                .read_exact(&mut hello)
                .map_err(|e| transport(format!("handshake from {}: {}", peer_addr, e)))?;
            let peer_rank = u32::from_le_bytes([hello[0], hello[1], hello[2], hello[3]]) as usize;
            let peer_world = u32::from_le_bytes([hello[4], hello[5], hello[6], hello[7]]) as usize;
            if peer_world != world_size {
                return Err(transport(format!(
                    "rank {} reports world size {}, expected {}",
                    peer_rank, peer_world, world_size
                )));
            }
            if peer_rank == 0 || peer_rank >= world_size {
                return Err(transport(format!("invalid peer rank {}", peer_rank)));
            }
            let slot = &mut slots[peer_rank - 1];
            if slot.is_some() {
                return Err(transport(format!("duplicate peer rank {}", peer_rank)));
            }
            debug!(peer_rank, %peer_addr, "peer joined process group");
            *slot = Some(stream);
            joined += 1;
        }
        Ok(Self {
            rank: 0,
            world_size,
            peers: slots.into_iter().flatten().collect(),
        })
    }

    fn join(mut stream: TcpStream, rank: usize, world_size: usize) -> Result<Self, BackendError> {
        let _ = stream.set_nodelay(true);
        let mut hello = Vec::with_capacity(8);
        hello.extend_from_slice(&(rank as u32).to_le_bytes());
        hello.extend_from_slice(&(world_size as u32).to_le_bytes());
        stream
            .write_all(&hello)
            .map_err(|e| transport(format!("handshake: {}", e)))?;
        Ok(Self {
            rank,
            world_size,
            peers: vec![stream],
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// In-place elementwise sum across all ranks; every rank ends with the
    /// same values.
    pub fn all_reduce_sum(&mut self, data: &mut [f32]) -> Result<(), BackendError> {
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank != 0 {
            let root = &mut self.peers[0];
            send_frame(root, data)?;
            let reduced = recv_frame(root, data.len())?;
            data.copy_from_slice(&reduced);
            return Ok(());
        }
        for peer in self.peers.iter_mut() {
            let contribution = recv_frame(peer, data.len())?;
            for (acc, v) in data.iter_mut().zip(contribution) {
                *acc += v;
            }
        }
        for peer in self.peers.iter_mut() {
            send_frame(peer, data)?;
        }
        Ok(())
    }
}

fn transport(msg: String) -> BackendError {
    BackendError::Transport(msg)
}

fn connect_with_retry(addr: &str, port: u16, timeout: Duration) -> Result<TcpStream, BackendError> {
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = (addr, port)
            .to_socket_addrs()
            .map_err(|e| e.to_string())
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| format!("no address for {}", addr))
            })
            .and_then(|sock| TcpStream::connect(sock).map_err(|e| e.to_string()));
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(transport(format!("connect {}:{}: {}", addr, port, e)));
            }
            Err(_) => thread::sleep(CONNECT_RETRY),
        }
    }
}

fn send_frame(stream: &mut TcpStream, data: &[f32]) -> Result<(), BackendError> {
    let mut buf = Vec::with_capacity(4 + data.len() * 4);
    buf.extend_from_slice(&((data.len() * 4) as u32).to_le_bytes());
    for v in data {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    stream
        .write_all(&buf)
        .map_err(|e| transport(format!("send: {}", e)))?;
    stream
        .flush()
        .map_err(|e| transport(format!("flush: {}", e)))
}

fn recv_frame(stream: &mut TcpStream, expected_len: usize) -> Result<Vec<f32>, BackendError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(|e| transport(format!("recv len: {}", e)))?;
    let byte_len = u32::from_le_bytes(len_buf) as usize;
    if byte_len != expected_len * 4 {
        return Err(BackendError::Shape(format!(
            "peer sent {} bytes, expected {}",
            byte_len,
            expected_len * 4
        )));
    }
    let mut buf = vec![0u8; byte_len];
    stream
        .read_exact(&mut buf)
        .map_err(|e| transport(format!("recv data: {}", e)))?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
