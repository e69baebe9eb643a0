//! The client core task: owns all connection, channel and operation state.
//!
//! One instance of [`Core`] lives on a spawned task per context. Reader
//! tasks decode frames and forward them here; builders and handles post
//! closures. Nothing else touches this state, which is what makes the
//! operation state machines race-free without locking.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::client::context::{Config, IoHandle};
use crate::client::operation::OpState;
use crate::error::Error;
use crate::messages::{
    CreateChannelRequest, CreateChannelResponse, DestroyChannel, Frame, PvaCodec, Status,
    ValidationRequest, ValidationResponse, cmd,
};
use crate::utils::wrapping_inplace_add;
use crate::wire::{TxBuf, TypeCache, TypeStore};

pub(crate) enum CoreCmd {
    Call(Box<dyn FnOnce(&mut Core) + Send>),
    Conn(SocketAddr, ConnEvent),
}

pub(crate) enum ConnEvent {
    /// TCP established; frames may now be written.
    Established(mpsc::UnboundedSender<Frame>),
    Frame(Frame),
    Closed,
}

/// Idle keep-alive interval once a connection is validated.
const ECHO_PERIOD: std::time::Duration = std::time::Duration::from_secs(15);

/// Per-peer TCP connection state.
pub(crate) struct Connection {
    pub(crate) ready: bool,
    pub(crate) writer: Option<mpsc::UnboundedSender<Frame>>,
    pub(crate) rx_types: TypeStore,
    pub(crate) tx_types: TypeCache,
    pub(crate) chan_by_sid: HashMap<u32, u32>,
    pub(crate) op_by_ioid: HashMap<u32, u64>,
    next_ioid: u32,
    echo_stop: CancellationToken,
}

impl Connection {
    fn new() -> Connection {
        Connection {
            ready: false,
            writer: None,
            rx_types: TypeStore::default(),
            tx_types: TypeCache::default(),
            chan_by_sid: HashMap::new(),
            op_by_ioid: HashMap::new(),
            next_ioid: 0,
            echo_stop: CancellationToken::new(),
        }
    }

    /// Monotonic, wrapping allocation. An id is reused only once its
    /// previous owner has left `op_by_ioid`.
    pub(crate) fn alloc_ioid(&mut self) -> u32 {
        loop {
            let id = wrapping_inplace_add(&mut self.next_ioid);
            if !self.op_by_ioid.contains_key(&id) {
                return id;
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ChanState {
    /// Waiting for a server address (none configured yet).
    Searching,
    /// Waiting for the connection and the CREATE_CHANNEL reply.
    Connecting,
    Active,
}

/// A per-name, per-peer logical endpoint.
pub(crate) struct Channel {
    pub(crate) cid: u32,
    pub(crate) name: String,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) state: ChanState,
    pub(crate) sid: u32,
    /// Operations waiting for the channel to become Active, in order.
    pub(crate) pending: VecDeque<u64>,
}

pub(crate) struct Core {
    pub(crate) config: Config,
    pub(crate) handle: IoHandle,
    pub(crate) conns: HashMap<SocketAddr, Connection>,
    pub(crate) chans: HashMap<u32, Channel>,
    pub(crate) chan_by_name: HashMap<String, u32>,
    pub(crate) ops: HashMap<u64, OpState>,
    next_cid: u32,
}

pub(crate) async fn core_loop(
    mut core: Core,
    mut rx: mpsc::UnboundedReceiver<CoreCmd>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                None => break,
                Some(CoreCmd::Call(f)) => f(&mut core),
                Some(CoreCmd::Conn(peer, ev)) => core.conn_event(peer, ev),
            }
        }
    }
    debug!("Client core shutting down");
}

impl Core {
    pub(crate) fn new(config: Config, handle: IoHandle) -> Core {
        Core {
            config,
            handle,
            conns: HashMap::new(),
            chans: HashMap::new(),
            chan_by_name: HashMap::new(),
            ops: HashMap::new(),
            next_cid: 0,
        }
    }

    /// Find or create the channel for `name`. The address list stands in
    /// for the search phase: without one the channel stays Searching.
    pub(crate) fn channel_for(&mut self, name: &str) -> u32 {
        if let Some(cid) = self.chan_by_name.get(name)
            && self.chans.contains_key(cid)
        {
            return *cid;
        }
        let cid = wrapping_inplace_add(&mut self.next_cid);
        let peer = self.config.addr_list.first().copied();
        let state = if peer.is_some() {
            ChanState::Connecting
        } else {
            ChanState::Searching
        };
        debug!("Creating channel {cid} for '{name}' -> {peer:?}");
        self.chans.insert(
            cid,
            Channel {
                cid,
                name: name.to_string(),
                peer,
                state,
                sid: 0,
                pending: VecDeque::new(),
            },
        );
        self.chan_by_name.insert(name.to_string(), cid);
        if let Some(peer) = peer {
            self.ensure_connection(peer);
            self.create_channel(cid);
        }
        cid
    }

    /// Send CREATE_CHANNEL if the channel's connection is validated.
    fn create_channel(&mut self, cid: u32) {
        let Some(chan) = self.chans.get(&cid) else {
            return;
        };
        if chan.state != ChanState::Connecting {
            return;
        }
        let Some(peer) = chan.peer else { return };
        if !self.conns.get(&peer).is_some_and(|c| c.ready) {
            return;
        }
        let req = CreateChannelRequest {
            cid,
            name: chan.name.clone(),
        };
        debug!("Requesting channel '{}' (cid {cid})", req.name);
        self.send_frame(peer, cmd::CREATE_CHANNEL, |tx, _| {
            req.to_wire(tx);
            Ok(())
        });
    }

    /// Launch all pending operations of an Active channel, in order.
    pub(crate) fn create_operations(&mut self, cid: u32) {
        loop {
            let token = {
                let Some(chan) = self.chans.get_mut(&cid) else {
                    return;
                };
                if chan.state != ChanState::Active {
                    return;
                }
                match chan.pending.pop_front() {
                    None => return,
                    Some(token) => token,
                }
            };
            self.create_op(token);
        }
    }

    pub(crate) fn ensure_connection(&mut self, peer: SocketAddr) {
        if self.conns.contains_key(&peer) {
            return;
        }
        self.conns.insert(peer, Connection::new());
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match TcpStream::connect(peer).await {
                Ok(stream) => {
                    let (read, write) = stream.into_split();
                    let (wtx, wrx) = mpsc::unbounded_channel();
                    tokio::spawn(writer_task(write, wrx));
                    handle.conn_event(peer, ConnEvent::Established(wtx));
                    reader_loop(read, peer, &handle).await;
                }
                Err(e) => {
                    debug!("Connection to {peer} failed: {e}");
                }
            }
            handle.conn_event(peer, ConnEvent::Closed);
        });
    }

    fn conn_event(&mut self, peer: SocketAddr, ev: ConnEvent) {
        match ev {
            ConnEvent::Established(writer) => {
                debug!("Connected to {peer}, awaiting validation");
                if let Some(conn) = self.conns.get_mut(&peer) {
                    conn.writer = Some(writer);
                }
            }
            ConnEvent::Frame(frame) => {
                if let Err(e) = self.dispatch(peer, &frame) {
                    error!("Fatal protocol error from {peer}: {e}");
                    self.drop_connection(peer);
                }
            }
            ConnEvent::Closed => {
                debug!("Connection to {peer} closed");
                self.drop_connection(peer);
            }
        }
    }

    fn dispatch(&mut self, peer: SocketAddr, frame: &Frame) -> Result<(), Error> {
        trace!(
            "{peer}: command {:#04x}, {} byte body",
            frame.header.command,
            frame.body.len()
        );
        match frame.header.command {
            // every message carries its own endian flag; the explicit
            // announcement needs no action
            cmd::SET_BYTE_ORDER => Ok(()),
            cmd::ECHO => Ok(()),
            cmd::CONNECTION_VALIDATION => {
                let req = ValidationRequest::from_wire(&mut frame.rx())?;
                debug!("{peer} offers auth methods {:?}", req.auth_methods);
                let resp = ValidationResponse {
                    client_buffer_size: 0x4000,
                    client_registry_size: 0x7fff,
                    auth_method: "anonymous".to_string(),
                };
                self.send_frame(peer, cmd::CONNECTION_VALIDATION, |tx, _| {
                    resp.to_wire(tx);
                    Ok(())
                });
                Ok(())
            }
            cmd::CONNECTION_VALIDATED => {
                let status = Status::from_wire(&mut frame.rx())?;
                if !status.is_success() {
                    return Err(Error::Protocol("connection validation rejected"));
                }
                if let Some(conn) = self.conns.get_mut(&peer) {
                    conn.ready = true;
                }
                self.start_echo(peer);
                debug!("{peer} validated");
                let cids: Vec<u32> = self
                    .chans
                    .values()
                    .filter(|c| c.peer == Some(peer) && c.state == ChanState::Connecting)
                    .map(|c| c.cid)
                    .collect();
                for cid in cids {
                    self.create_channel(cid);
                }
                Ok(())
            }
            cmd::CREATE_CHANNEL => self.handle_create_channel_reply(peer, frame),
            cmd::DESTROY_CHANNEL => {
                let msg = DestroyChannel::from_wire(&mut frame.rx())?;
                debug!("{peer} destroyed channel sid {}", msg.sid);
                // trust our own sid mapping over the peer's cid echo
                let cid = self
                    .conns
                    .get(&peer)
                    .and_then(|c| c.chan_by_sid.get(&msg.sid).copied())
                    .unwrap_or(msg.cid);
                self.channel_lost(peer, cid);
                Ok(())
            }
            cmd::GET | cmd::PUT => self.handle_gpr_reply(peer, frame),
            cmd::GET_FIELD => self.handle_info_reply(peer, frame),
            cmd::MONITOR => self.handle_monitor_reply(peer, frame),
            cmd::MESSAGE => {
                let mut rx = frame.rx();
                let ioid = rx.get_u32()?;
                let level = rx.get_u8()?;
                let text = rx.get_string()?;
                match level {
                    0 => debug!("{peer} ioid {ioid}: {text}"),
                    1 => warn!("{peer} ioid {ioid}: {text}"),
                    _ => error!("{peer} ioid {ioid}: {text}"),
                }
                Ok(())
            }
            other => {
                warn!("{peer}: ignoring unknown command {other:#04x}");
                Ok(())
            }
        }
    }

    fn handle_create_channel_reply(&mut self, peer: SocketAddr, frame: &Frame) -> Result<(), Error> {
        let resp = CreateChannelResponse::from_wire(&mut frame.rx())?;
        let Some(chan) = self.chans.get_mut(&resp.cid) else {
            debug!("{peer}: reply for unknown channel cid {}", resp.cid);
            return Ok(());
        };
        if !resp.status.is_success() {
            warn!(
                "{peer} refused channel '{}': {}",
                chan.name,
                resp.status.message()
            );
            let tokens: Vec<u64> = chan.pending.drain(..).collect();
            let err = resp.status.message().to_string();
            for token in tokens {
                self.finish_op(token, Err(Error::Remote(err.clone())));
            }
            // keep trying; the server may learn the name later
            let handle = self.handle.clone();
            let delay = self.config.reconnect_delay;
            let cid = resp.cid;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                handle.call(move |core| core.create_channel(cid));
            });
            return Ok(());
        }
        debug!("{peer} opened channel '{}' sid {}", chan.name, resp.sid);
        chan.state = ChanState::Active;
        chan.sid = resp.sid;
        if let Some(conn) = self.conns.get_mut(&peer) {
            conn.chan_by_sid.insert(resp.sid, resp.cid);
        }
        self.create_operations(resp.cid);
        Ok(())
    }

    /// The server dropped one channel; its operations re-enter Connecting
    /// and the channel is re-created after the reconnect delay.
    fn channel_lost(&mut self, peer: SocketAddr, cid: u32) {
        let mut tokens = Vec::new();
        if let Some(conn) = self.conns.get_mut(&peer) {
            if let Some(chan) = self.chans.get(&cid) {
                conn.chan_by_sid.remove(&chan.sid);
            }
            let ops = &self.ops;
            conn.op_by_ioid.retain(|_, token| {
                if ops.get(token).is_some_and(|op| op.cid == cid) {
                    tokens.push(*token);
                    false
                } else {
                    true
                }
            });
        }
        match self.chans.get_mut(&cid) {
            Some(chan) if chan.state != ChanState::Searching => {
                chan.state = ChanState::Connecting;
                chan.sid = 0;
            }
            _ => return,
        }
        for token in tokens {
            self.op_disconnected(token);
        }
        let handle = self.handle.clone();
        let delay = self.config.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.call(move |core| core.create_channel(cid));
        });
    }

    /// Tear down a connection: every channel on it leaves Active and every
    /// in-flight operation re-enters Connecting (or completes with
    /// Disconnected, per its rules). A reconnect is scheduled.
    pub(crate) fn drop_connection(&mut self, peer: SocketAddr) {
        let Some(conn) = self.conns.remove(&peer) else {
            return;
        };
        conn.echo_stop.cancel();
        let tokens: Vec<u64> = conn.op_by_ioid.values().copied().collect();

        let cids: Vec<u32> = self
            .chans
            .values()
            .filter(|c| c.peer == Some(peer))
            .map(|c| c.cid)
            .collect();
        for cid in &cids {
            if let Some(chan) = self.chans.get_mut(cid)
                && chan.state != ChanState::Searching
            {
                chan.state = ChanState::Connecting;
                chan.sid = 0;
            }
        }

        for token in tokens {
            self.op_disconnected(token);
        }

        if !cids.is_empty() {
            let handle = self.handle.clone();
            let delay = self.config.reconnect_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                handle.call(move |core| core.reconnect(peer));
            });
        }
    }

    /// Periodic ECHO keep-alive while the connection is up.
    fn start_echo(&mut self, peer: SocketAddr) {
        let Some(conn) = self.conns.get(&peer) else {
            return;
        };
        let stop = conn.echo_stop.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(ECHO_PERIOD) => {
                        if handle.is_closed() {
                            break;
                        }
                        handle.call(move |core| {
                            core.send_frame(peer, cmd::ECHO, |_, _| Ok(()));
                        });
                    }
                }
            }
        });
    }

    fn reconnect(&mut self, peer: SocketAddr) {
        let wanted = self
            .chans
            .values()
            .any(|c| c.peer == Some(peer) && c.state != ChanState::Active);
        if wanted {
            debug!("Re-dialling {peer}");
            self.ensure_connection(peer);
        }
    }

    /// Build a message body big-endian and hand it to the connection's
    /// writer task. A missing connection or writer silently drops the
    /// message; the disconnect path will deal with the fallout.
    pub(crate) fn send_frame(
        &mut self,
        peer: SocketAddr,
        command: u8,
        build: impl FnOnce(&mut TxBuf, &mut TypeCache) -> Result<(), Error>,
    ) {
        let Some(conn) = self.conns.get_mut(&peer) else {
            return;
        };
        let mut body = BytesMut::new();
        {
            let mut tx = TxBuf::new(&mut body, true);
            if let Err(e) = build(&mut tx, &mut conn.tx_types) {
                error!("Failed to build outgoing message {command:#04x}: {e}");
                return;
            }
        }
        if let Some(writer) = &conn.writer {
            let _ = writer.send(Frame::new(command, true, body.freeze()));
        }
    }

    pub(crate) fn send_destroy_request(&mut self, peer: SocketAddr, sid: u32, ioid: u32) {
        self.send_frame(peer, cmd::DESTROY_REQUEST, |tx, _| {
            tx.put_u32(sid);
            tx.put_u32(ioid);
            Ok(())
        });
    }

    /// Channel data needed to talk about an operation on the wire.
    pub(crate) fn op_route(&self, token: u64) -> Option<(SocketAddr, u32, u32)> {
        let op = self.ops.get(&token)?;
        let chan = self.chans.get(&op.cid)?;
        let peer = chan.peer?;
        Some((peer, chan.sid, op.ioid?))
    }

    /// Resolve an incoming ioid to an operation token.
    pub(crate) fn token_for_ioid(&self, peer: SocketAddr, ioid: u32) -> Option<u64> {
        self.conns.get(&peer)?.op_by_ioid.get(&ioid).copied()
    }
}

async fn writer_task(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    let mut codec = PvaCodec::default();
    let mut buf = BytesMut::new();
    while let Some(frame) = rx.recv().await {
        buf.clear();
        if codec.encode(frame, &mut buf).is_err() {
            break;
        }
        if let Err(e) = write.write_all(&buf).await {
            debug!("Write failed: {e}");
            break;
        }
    }
}

async fn reader_loop(mut read: OwnedReadHalf, peer: SocketAddr, handle: &IoHandle) {
    let mut codec = PvaCodec::default();
    let mut buf = BytesMut::with_capacity(0x4000);
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                handle.conn_event(peer, ConnEvent::Frame(frame));
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Unparseable data from {peer}: {e}");
                break;
            }
        }
        match read.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {peer} failed: {e}");
                break;
            }
        }
    }
}
