//! Per-peer session state machine: `Idle -> Connecting -> Handshaking ->
//! Active -> Closed`, looping back to a fresh `Idle` with a new address
//! rather than ever reconnecting the address that just closed.
use super::handshake::{Handshake, HandshakeError};
use super::message::{decode_frame, Decoded, Message, MessageError};
use crate::scheduler::{BitField, BitFieldError, PeerId, Scheduler};
use bytes::{Buf, BytesMut};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum PeerSessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("malformed message: {0}")]
    Message(#[from] MessageError),

    #[error("bitfield message malformed: {0}")]
    BitField(#[from] BitFieldError),

    #[error("peer closed the connection")]
    ConnectionClosed,
}

type PeerSessionResult<T> = std::result::Result<T, PeerSessionError>;

/// Our own flow-control/interest state toward a peer. "stalled" is this
/// crate's name for the protocol's choked state (see GLOSSARY).
#[derive(Debug, Clone, Copy)]
struct LocalFlags {
    stalled: bool,
    interested: bool,
    pending_request: bool,
    stopped: bool,
}

impl LocalFlags {
    fn initial() -> Self {
        Self {
            stalled: true,
            interested: true,
            pending_request: false,
            stopped: false,
        }
    }
}

/// What the peer has told us about its own interest in our pieces. We
/// never seed, so this is tracked only for completeness/logging.
#[derive(Debug, Clone, Copy, Default)]
struct RemoteFlags {
    interested: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Runs the fixed-size peer session pool: `pool_size` tasks, each looping
/// forever, pulling one address at a time from `peer_rx` and driving it
/// through a full session lifecycle before looping back for the next
/// address. Meant to be spawned under a `LocalSet` via `spawn_local`.
pub async fn run_pool(
    pool_size: usize,
    peer_rx: mpsc::UnboundedReceiver<SocketAddr>,
    scheduler: Rc<RefCell<Scheduler>>,
    info_hash: [u8; 20],
    my_peer_id: [u8; 20],
) {
    let peer_rx = Rc::new(RefCell::new(peer_rx));
    let mut tasks = Vec::with_capacity(pool_size);
    for worker in 0..pool_size {
        let peer_rx = Rc::clone(&peer_rx);
        let scheduler = Rc::clone(&scheduler);
        tasks.push(tokio::task::spawn_local(async move {
            loop {
                let addr = { peer_rx.borrow_mut().recv().await };
                let Some(addr) = addr else {
                    return;
                };
                debug!(worker, %addr, "session picked up address");
                if let Err(err) =
                    run_one(addr, Rc::clone(&scheduler), info_hash, my_peer_id).await
                {
                    warn!(worker, %addr, error = %err, "peer session closed with error");
                }
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Drives a single address through `Connecting -> Handshaking -> Active`,
/// returning when the session closes for any reason (the caller treats
/// every return, `Ok` or `Err`, as a transition back to `Idle`).
#[instrument(skip(scheduler), fields(%addr))]
async fn run_one(
    addr: SocketAddr,
    scheduler: Rc<RefCell<Scheduler>>,
    info_hash: [u8; 20],
    my_peer_id: [u8; 20],
) -> PeerSessionResult<()> {
    let mut stream = TcpStream::connect(addr).await?;

    let handshake = Handshake::new(info_hash, my_peer_id);
    handshake.write(&mut stream).await?;
    let peer_handshake = Handshake::read(&mut stream).await?;
    peer_handshake.validate(info_hash)?;
    let remote_id: PeerId = peer_handshake.peer_id;
    info!(peer = ?hex::encode(remote_id), "handshake complete");

    // Closed drops the peer's bitfield regardless of how Active was left,
    // so a dead peer never keeps influencing rarest-first counts.
    let result = active_loop(&mut stream, remote_id, &scheduler).await;
    scheduler.borrow_mut().remove_peer(remote_id);
    result
}

async fn active_loop(
    stream: &mut TcpStream,
    remote_id: PeerId,
    scheduler: &Rc<RefCell<Scheduler>>,
) -> PeerSessionResult<()> {
    let mut local = LocalFlags::initial();
    let mut remote = RemoteFlags::default();
    send(stream, &Message::Interested).await?;

    let mut buf = BytesMut::with_capacity(32 * 1024);
    let mut read_buf = [0u8; 16 * 1024];

    loop {
        if local.stopped {
            return Ok(());
        }

        let message = loop {
            match decode_frame(&buf)? {
                Decoded::Frame { message, consumed } => {
                    buf.advance(consumed);
                    if let Some(message) = message {
                        break message;
                    }
                    debug!("discarded frame with unrecognized message id");
                }
                Decoded::Incomplete => {
                    let n = stream.read(&mut read_buf).await?;
                    if n == 0 {
                        return Err(PeerSessionError::ConnectionClosed);
                    }
                    buf.extend_from_slice(&read_buf[..n]);
                }
            }
        };

        handle_message(message, remote_id, scheduler, &mut local, &mut remote).await?;

        if local.interested && !local.stalled && !local.pending_request {
            request_next(remote_id, scheduler, &mut local, stream).await?;
        }
    }
}

async fn handle_message(
    message: Message,
    remote_id: PeerId,
    scheduler: &Rc<RefCell<Scheduler>>,
    local: &mut LocalFlags,
    remote: &mut RemoteFlags,
) -> PeerSessionResult<()> {
    match message {
        Message::Bitfield(bits) => {
            let num_pieces = scheduler.borrow().total_pieces();
            let bitfield = BitField::from_bytes(&bits, num_pieces)?;
            scheduler.borrow_mut().add_peer(remote_id, bitfield);
        }
        Message::Have { index } => {
            scheduler.borrow_mut().update_peer(remote_id, index as usize);
        }
        Message::Choke => local.stalled = true,
        Message::Unchoke => local.stalled = false,
        Message::Interested => remote.interested = true,
        Message::NotInterested => remote.interested = false,
        Message::Piece { index, begin, block } => {
            local.pending_request = false;
            if let Err(err) =
                scheduler
                    .borrow_mut()
                    .block_received(remote_id, index as usize, begin, block)
            {
                warn!(error = %err, "scheduler rejected a received block");
            }
        }
        Message::KeepAlive => {}
        // no seeding: we never serve requests and never cancel what we
        // didn't ask for.
        Message::Request { .. } | Message::Cancel { .. } => {}
    }
    Ok(())
}

async fn request_next(
    remote_id: PeerId,
    scheduler: &Rc<RefCell<Scheduler>>,
    local: &mut LocalFlags,
    stream: &mut TcpStream,
) -> PeerSessionResult<()> {
    let request = scheduler.borrow_mut().next_request(remote_id, now_ms());
    if let Some(request) = request {
        send(
            stream,
            &Message::Request {
                index: request.piece as u32,
                begin: request.offset,
                length: request.length,
            },
        )
        .await?;
        local.pending_request = true;
    }
    Ok(())
}

async fn send(stream: &mut TcpStream, message: &Message) -> PeerSessionResult<()> {
    stream.write_all(&message.encode()).await?;
    Ok(())
}
