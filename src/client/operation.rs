//! Operation state machines: Info (GET_FIELD), Get and Put.
//!
//! All three share the shape `Connecting -> Executing -> done`, with Get
//! and Put inserting an INIT round (and optionally a fetch round for Put)
//! in between. A finished operation leaves the maps immediately; there is
//! no lingering Done state to reason about. Cancellation and replies race
//! only through the core task's queue, so the callback fires at most once.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error};

use crate::client::context::OpResult;
use crate::client::core::{ChanState, Core};
use crate::client::monitor::MonitorOp;
use crate::error::Error;
use crate::messages::{Frame, Status, cmd, subcmd};
use crate::pvrequest::Request;
use crate::value::{IValue, MValue};
use crate::wire::{from_wire_type, from_wire_valid, to_wire_full, to_wire_type, to_wire_valid};

pub(crate) type ResultFn = Box<dyn FnOnce(Result<OpResult, Error>) + Send>;
pub(crate) type PutBuildFn = Box<dyn FnOnce(&IValue) -> Result<IValue, Error> + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum OpPhase {
    /// Waiting for an Active channel.
    Connecting,
    /// INIT sent, waiting for the type exchange.
    Creating,
    /// PUT only: waiting for the present value (subcommand GET_PUT).
    GetPut,
    /// Request sent, waiting for the reply (or events, for monitors).
    Executing,
}

pub(crate) enum OpKind {
    Info,
    Get {
        request: Request,
        prototype: Option<IValue>,
    },
    Put {
        request: Request,
        builder: Option<PutBuildFn>,
        fetch_present: bool,
        prototype: Option<IValue>,
    },
    Monitor(MonitorOp),
}

pub(crate) struct OpState {
    pub cid: u32,
    pub ioid: Option<u32>,
    pub state: OpPhase,
    pub kind: OpKind,
    pub result: Option<ResultFn>,
}

/// Run a user result callback, suppressing panics.
pub(crate) fn invoke_result(cb: ResultFn, result: Result<OpResult, Error>) {
    if catch_unwind(AssertUnwindSafe(move || cb(result))).is_err() {
        error!("User result callback panicked; continuing");
    }
}

impl Core {
    pub(crate) fn start_op(
        &mut self,
        token: u64,
        name: String,
        kind: OpKind,
        result: Option<ResultFn>,
    ) {
        let cid = self.channel_for(&name);
        self.ops.insert(
            token,
            OpState {
                cid,
                ioid: None,
                state: OpPhase::Connecting,
                kind,
                result,
            },
        );
        if let Some(chan) = self.chans.get_mut(&cid) {
            chan.pending.push_back(token);
        }
        self.create_operations(cid);
    }

    /// Issue the first request of an operation on its (now Active)
    /// channel: GET_FIELD directly, or INIT with the pvRequest.
    pub(crate) fn create_op(&mut self, token: u64) {
        enum Sel {
            Info,
            Gpr(u8),
        }

        let (cid, request, sel) = {
            let Some(op) = self.ops.get(&token) else {
                return;
            };
            if op.state != OpPhase::Connecting {
                return;
            }
            let (request, sel) = match &op.kind {
                OpKind::Info => (None, Sel::Info),
                OpKind::Get { request, .. } => (Some(request.build()), Sel::Gpr(cmd::GET)),
                OpKind::Put { request, .. } => (Some(request.build()), Sel::Gpr(cmd::PUT)),
                OpKind::Monitor(m) => (Some(m.request.build()), Sel::Gpr(cmd::MONITOR)),
            };
            (op.cid, request, sel)
        };

        let route = {
            let Some(chan) = self.chans.get(&cid) else {
                return;
            };
            match (chan.state, chan.peer) {
                (ChanState::Active, Some(peer)) => Some((peer, chan.sid)),
                _ => None,
            }
        };
        let Some((peer, sid)) = route else {
            // lost Active between queueing and launch: wait for the next
            // create_operations pass
            if let Some(chan) = self.chans.get_mut(&cid) {
                chan.pending.push_back(token);
            }
            return;
        };

        let request = match request {
            None => None,
            Some(Ok(v)) => Some(v),
            Some(Err(e)) => {
                self.finish_op(token, Err(e));
                return;
            }
        };

        let ioid = {
            let Some(conn) = self.conns.get_mut(&peer) else {
                // the connection is gone but the channel has not heard yet;
                // park the operation and let the disconnect path requeue it
                if let Some(chan) = self.chans.get_mut(&cid) {
                    chan.state = ChanState::Connecting;
                    chan.pending.push_back(token);
                }
                return;
            };
            let ioid = conn.alloc_ioid();
            conn.op_by_ioid.insert(ioid, token);
            ioid
        };

        let next = match sel {
            Sel::Info => {
                debug!("ioid {ioid}: GET_FIELD");
                self.send_frame(peer, cmd::GET_FIELD, |tx, _| {
                    tx.put_u32(sid);
                    tx.put_u32(ioid);
                    // reserved sub-field name, always empty
                    tx.put_string("");
                    Ok(())
                });
                OpPhase::Executing
            }
            Sel::Gpr(command) => {
                debug!("ioid {ioid}: op {command:#04x} INIT");
                match request {
                    Some(req) => {
                        self.send_frame(peer, command, move |tx, cache| {
                            tx.put_u32(sid);
                            tx.put_u32(ioid);
                            tx.put_u8(subcmd::INIT);
                            let dtype = req
                                .type_desc()
                                .ok_or(Error::Protocol("pvRequest without storage"))?;
                            to_wire_type(tx, &dtype, Some(cache));
                            to_wire_full(tx, &req)
                        });
                        OpPhase::Creating
                    }
                    None => return,
                }
            }
        };

        if let Some(op) = self.ops.get_mut(&token) {
            op.ioid = Some(ioid);
            op.state = next;
        }
    }

    /// Complete an operation: detach it from every map and deliver the
    /// result exactly once (monitors surface it through their queue).
    pub(crate) fn finish_op(&mut self, token: u64, result: Result<OpResult, Error>) {
        let Some(mut op) = self.ops.remove(&token) else {
            return;
        };
        if let Some(ioid) = op.ioid
            && let Some(chan) = self.chans.get(&op.cid)
            && let Some(peer) = chan.peer
            && let Some(conn) = self.conns.get_mut(&peer)
        {
            conn.op_by_ioid.remove(&ioid);
        }
        if let Some(chan) = self.chans.get_mut(&op.cid) {
            chan.pending.retain(|t| *t != token);
        }
        match op.kind {
            OpKind::Monitor(m) => self.monitor_terminated(&m, result.err()),
            _ => {
                if let Some(cb) = op.result.take() {
                    invoke_result(cb, result);
                }
            }
        }
    }

    /// Idempotent cancellation: detach the operation and discard its
    /// callback. If a request is in flight, tell the server to forget it.
    /// A reply racing with this either already won (it was handled before
    /// this closure ran) or loses (the ioid is gone from the maps).
    pub(crate) fn cancel_op(&mut self, token: u64) {
        let Some(op) = self.ops.remove(&token) else {
            return;
        };
        debug!("Cancelling operation {token}");
        if let Some(ioid) = op.ioid
            && op.state != OpPhase::Connecting
            && let Some(route) = self
                .chans
                .get(&op.cid)
                .and_then(|c| c.peer.map(|p| (p, c.sid)))
        {
            let (peer, sid) = route;
            if let Some(conn) = self.conns.get_mut(&peer) {
                conn.op_by_ioid.remove(&ioid);
            }
            self.send_destroy_request(peer, sid, ioid);
        }
        if let Some(chan) = self.chans.get_mut(&op.cid) {
            chan.pending.retain(|t| *t != token);
        }
        // op (with its callback and any monitor queue) drops here
    }

    /// The peer went away while this operation was in flight.
    pub(crate) fn op_disconnected(&mut self, token: u64) {
        let Some(op) = self.ops.get_mut(&token) else {
            return;
        };
        op.ioid = None;
        let cid = op.cid;
        let mut put_in_flight = false;
        let repend = match (&op.kind, op.state) {
            // still queued on the channel's pending list
            (_, OpPhase::Connecting) => false,
            // an executed PUT cannot be replayed: server side effects may
            // already have happened
            (OpKind::Put { .. }, OpPhase::Executing) => {
                put_in_flight = true;
                false
            }
            _ => true,
        };
        let is_monitor = matches!(op.kind, OpKind::Monitor(_));
        if repend {
            op.state = OpPhase::Connecting;
        }

        if put_in_flight {
            self.finish_op(token, Err(Error::Disconnected));
            return;
        }
        if is_monitor {
            self.monitor_dropped(token);
        }
        if repend && let Some(chan) = self.chans.get_mut(&cid) {
            chan.pending.push_back(token);
        }
    }

    pub(crate) fn handle_info_reply(
        &mut self,
        peer: SocketAddr,
        frame: &Frame,
    ) -> Result<(), Error> {
        let mut rx = frame.rx();
        let ioid = rx.get_u32()?;
        let status = Status::from_wire(&mut rx)?;

        let dtype = if status.is_success() {
            let Some(conn) = self.conns.get_mut(&peer) else {
                return Ok(());
            };
            from_wire_type(&mut rx, &mut conn.rx_types)?
        } else {
            None
        };

        let Some(token) = self.token_for_ioid(peer, ioid) else {
            debug!("{peer}: stale GET_FIELD ioid {ioid}");
            return Ok(());
        };
        let expected = self
            .ops
            .get(&token)
            .is_some_and(|op| matches!(op.kind, OpKind::Info) && op.state == OpPhase::Executing);
        if !expected {
            debug!("{peer}: GET_FIELD reply does not match operation; ignoring");
            return Ok(());
        }

        let result = if status.is_success() {
            let dtype = dtype.ok_or(Error::Protocol("GET_FIELD success without type"))?;
            Ok(OpResult {
                value: MValue::instantiate(dtype).freeze()?,
                peer,
            })
        } else {
            Err(Error::Remote(status.message().to_string()))
        };
        self.finish_op(token, result);
        Ok(())
    }

    pub(crate) fn handle_gpr_reply(
        &mut self,
        peer: SocketAddr,
        frame: &Frame,
    ) -> Result<(), Error> {
        let command = frame.header.command;
        let mut rx = frame.rx();
        let ioid = rx.get_u32()?;
        let sub = rx.get_u8()?;
        let status = Status::from_wire(&mut rx)?;
        let init = sub & subcmd::INIT != 0;
        let fetched = sub & subcmd::DESTROY != 0;

        // decode the type declaration immediately, before deciding whether
        // anyone wants it: it may update the receive cache
        let prototype = if init && status.is_success() {
            let Some(conn) = self.conns.get_mut(&peer) else {
                return Ok(());
            };
            match from_wire_type(&mut rx, &mut conn.rx_types)? {
                Some(dtype) => Some(MValue::instantiate(dtype).freeze()?),
                None => return Err(Error::Protocol("INIT reply without type description")),
            }
        } else {
            None
        };

        let Some(token) = self.token_for_ioid(peer, ioid) else {
            debug!("{peer}: reply for stale ioid {ioid}");
            return Ok(());
        };

        let phase = {
            let Some(op) = self.ops.get(&token) else {
                return Ok(());
            };
            let cmd_matches = matches!(
                (&op.kind, command),
                (OpKind::Get { .. }, cmd::GET) | (OpKind::Put { .. }, cmd::PUT)
            );
            if !cmd_matches {
                return Err(Error::Protocol("ioid does not match operation type"));
            }
            let state_matches = matches!(
                (op.state, init, fetched),
                (OpPhase::Creating, true, _)
                    | (OpPhase::GetPut, false, true)
                    | (OpPhase::Executing, false, false)
            );
            if !state_matches {
                return Err(Error::Protocol("unexpected subcommand for operation state"));
            }
            op.state
        };

        let Some((_, sid, _)) = self.op_route(token) else {
            return Ok(());
        };

        if !status.is_success() {
            self.send_destroy_request(peer, sid, ioid);
            self.finish_op(token, Err(Error::Remote(status.message().to_string())));
            return Ok(());
        }

        match phase {
            OpPhase::Creating => {
                let proto =
                    prototype.ok_or(Error::Protocol("INIT reply without type description"))?;
                enum Next {
                    Exec,
                    Fetch,
                    Build,
                }
                let next = {
                    let Some(op) = self.ops.get_mut(&token) else {
                        return Ok(());
                    };
                    match &mut op.kind {
                        OpKind::Get { prototype, .. } => {
                            *prototype = Some(proto);
                            Next::Exec
                        }
                        OpKind::Put {
                            prototype,
                            fetch_present,
                            ..
                        } => {
                            *prototype = Some(proto);
                            if *fetch_present { Next::Fetch } else { Next::Build }
                        }
                        _ => return Err(Error::Protocol("ioid does not match operation type")),
                    }
                };
                match next {
                    Next::Exec => {
                        self.set_phase(token, OpPhase::Executing);
                        self.send_frame(peer, command, |tx, _| {
                            tx.put_u32(sid);
                            tx.put_u32(ioid);
                            tx.put_u8(subcmd::EXEC);
                            Ok(())
                        });
                    }
                    Next::Fetch => {
                        self.set_phase(token, OpPhase::GetPut);
                        self.send_frame(peer, command, |tx, _| {
                            tx.put_u32(sid);
                            tx.put_u32(ioid);
                            tx.put_u8(subcmd::GET_PUT);
                            Ok(())
                        });
                    }
                    Next::Build => self.run_put_builder(token, peer, sid, ioid),
                }
            }
            OpPhase::GetPut => {
                // the fetched value becomes the prototype the builder sees
                let proto = match self.ops.get(&token) {
                    Some(OpState {
                        kind: OpKind::Put { prototype, .. },
                        ..
                    }) => prototype.clone(),
                    _ => None,
                };
                let proto = proto.ok_or(Error::Protocol("GET_PUT reply without prototype"))?;
                let merged = {
                    let mut data = proto.clone_empty();
                    let Some(conn) = self.conns.get_mut(&peer) else {
                        return Ok(());
                    };
                    from_wire_valid(&mut rx, &mut conn.rx_types, &mut data)?;
                    data.freeze()?
                };
                if let Some(op) = self.ops.get_mut(&token)
                    && let OpKind::Put { prototype, .. } = &mut op.kind
                {
                    *prototype = Some(merged);
                }
                self.run_put_builder(token, peer, sid, ioid);
            }
            OpPhase::Executing => {
                let result = if command == cmd::GET {
                    let proto = match self.ops.get(&token) {
                        Some(OpState {
                            kind: OpKind::Get { prototype, .. },
                            ..
                        }) => prototype.clone(),
                        _ => None,
                    };
                    let proto = proto.ok_or(Error::Protocol("GET reply without prototype"))?;
                    let mut data = proto.clone_empty();
                    {
                        let Some(conn) = self.conns.get_mut(&peer) else {
                            return Ok(());
                        };
                        from_wire_valid(&mut rx, &mut conn.rx_types, &mut data)?;
                    }
                    Ok(OpResult {
                        value: data.freeze()?,
                        peer,
                    })
                } else {
                    // PUT replies carry status only
                    Ok(OpResult {
                        value: IValue::default(),
                        peer,
                    })
                };
                self.send_destroy_request(peer, sid, ioid);
                self.finish_op(token, result);
            }
            OpPhase::Connecting => {}
        }
        Ok(())
    }

    fn set_phase(&mut self, token: u64, phase: OpPhase) {
        if let Some(op) = self.ops.get_mut(&token) {
            op.state = phase;
        }
    }

    /// Invoke the user's put builder against the prototype and send the
    /// resulting masked value. A builder failure (or panic) is logged and
    /// cancels the operation server-side.
    fn run_put_builder(&mut self, token: u64, peer: SocketAddr, sid: u32, ioid: u32) {
        let (builder, proto) = {
            let Some(op) = self.ops.get_mut(&token) else {
                return;
            };
            let OpKind::Put {
                builder, prototype, ..
            } = &mut op.kind
            else {
                return;
            };
            (builder.take(), prototype.clone())
        };
        let Some(builder) = builder else {
            self.send_destroy_request(peer, sid, ioid);
            self.finish_op(token, Err(Error::Protocol("put requires a build callback")));
            return;
        };
        let Some(proto) = proto else {
            self.send_destroy_request(peer, sid, ioid);
            self.finish_op(token, Err(Error::Protocol("put prototype missing")));
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| builder(&proto))) {
            Ok(Ok(value)) => {
                self.set_phase(token, OpPhase::Executing);
                self.send_frame(peer, cmd::PUT, move |tx, _| {
                    tx.put_u32(sid);
                    tx.put_u32(ioid);
                    tx.put_u8(subcmd::EXEC);
                    to_wire_valid(tx, &value)
                });
            }
            Ok(Err(e)) => {
                self.send_destroy_request(peer, sid, ioid);
                self.finish_op(token, Err(e));
            }
            Err(_) => {
                error!("Put build callback panicked; cancelling operation");
                self.send_destroy_request(peer, sid, ioid);
                self.finish_op(token, Err(Error::Cancelled));
            }
        }
    }
}
