//! Monitor subscriptions: the client-side event FIFO and flow control.
//!
//! Event records decoded on the core task land in a bounded queue shared
//! with the user's [`Subscription`] handle. When the queue is full, a new
//! update is squashed into the newest entry by OR-ing its marked fields in
//! (so the freshest state of every field survives, at the cost of
//! intermediate values). Lifecycle transitions ride the same queue as
//! sentinels, so `pop()` observes `Connected`, data, `Disconnected` in
//! order without a side channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, trace};

use crate::client::context::IoHandle;
use crate::client::core::Core;
use crate::client::operation::{OpKind, OpPhase, OpState};
use crate::error::Error;
use crate::messages::{Frame, Status, cmd, subcmd};
use crate::pvrequest::Request;
use crate::value::{IValue, MValue};
use crate::wire::{BitMask, from_wire_type, from_wire_valid};

pub(crate) type WatermarkFn = Arc<dyn Fn(bool) + Send + Sync>;
pub(crate) type EventFn = Arc<dyn Fn(&Subscription) + Send + Sync>;

/// Options accumulated by the monitor builder.
#[derive(Clone)]
pub(crate) struct MonitorConfig {
    pub mask_connected: bool,
    pub mask_disconnected: bool,
    pub queue_size: usize,
    pub pipeline: bool,
    pub watermark: Option<(usize, usize, WatermarkFn)>,
    pub event: Option<EventFn>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            mask_connected: true,
            mask_disconnected: false,
            queue_size: 4,
            pipeline: false,
            watermark: None,
            event: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum QueueEntry {
    Value(IValue),
    Connected(SocketAddr),
    Disconnected,
    Finished,
    Error(String),
}

/// Effects to apply after releasing the queue lock.
#[derive(Default)]
pub(crate) struct PostOutcome {
    fire_event: bool,
    watermark: Option<(bool, WatermarkFn)>,
}

pub(crate) struct MonitorQueue {
    entries: VecDeque<QueueEntry>,
    limit: usize,
    mask_connected: bool,
    mask_disconnected: bool,
    pipeline: bool,
    finished: bool,
    /// Values popped since the last credit message.
    unacked: usize,
    watermark: Option<(usize, usize, WatermarkFn)>,
    /// Which side of the watermark band we last reported.
    side_above: Option<bool>,
}

impl MonitorQueue {
    fn value_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, QueueEntry::Value(_)))
            .count()
    }

    fn take_credit(&mut self) -> Option<u32> {
        let block = (self.limit / 2).max(1);
        if self.pipeline && self.unacked >= block {
            let n = self.unacked as u32;
            self.unacked = 0;
            Some(n)
        } else {
            None
        }
    }

    /// Edge-triggered watermark check; never re-fires on the same side.
    fn watermark_edge(&mut self) -> Option<(bool, WatermarkFn)> {
        let (low, high, cb) = self.watermark.as_ref()?;
        let free = self.limit.saturating_sub(self.value_count());
        if free > *high && self.side_above != Some(true) {
            self.side_above = Some(true);
            return Some((true, cb.clone()));
        }
        if free <= *low && self.side_above != Some(false) {
            self.side_above = Some(false);
            return Some((false, cb.clone()));
        }
        None
    }
}

/// Queue state shared between the core task and subscription handles.
pub(crate) struct MonitorShared {
    queue: Mutex<MonitorQueue>,
}

impl MonitorShared {
    pub(crate) fn new(config: &MonitorConfig) -> Arc<MonitorShared> {
        Arc::new(MonitorShared {
            queue: Mutex::new(MonitorQueue {
                entries: VecDeque::new(),
                limit: config.queue_size,
                mask_connected: config.mask_connected,
                mask_disconnected: config.mask_disconnected,
                pipeline: config.pipeline,
                finished: false,
                unacked: 0,
                watermark: config.watermark.clone(),
                side_above: None,
            }),
        })
    }

    /// Append an event. When the queue is full, `squash` merges the update
    /// into the newest entry via marked-field assignment; otherwise the
    /// update is dropped. Returns whether it was accepted.
    pub(crate) fn post(&self, value: IValue, squash: bool) -> (bool, PostOutcome) {
        let mut q = self.queue.lock().unwrap();
        let was_empty = q.entries.is_empty();
        let mut accepted = true;

        if q.value_count() >= q.limit {
            if !squash {
                trace!("Monitor queue full; dropping update");
                accepted = false;
            } else if let Some(QueueEntry::Value(last)) = q.entries.back_mut() {
                let mut merged = std::mem::take(last).thaw();
                if merged.assign(&value).is_err() {
                    trace!("Monitor squash across differing types; dropping update");
                }
                match merged.freeze() {
                    Ok(v) => *last = v,
                    Err(_) => accepted = false,
                }
            } else {
                q.entries.push_back(QueueEntry::Value(value));
            }
        } else {
            q.entries.push_back(QueueEntry::Value(value));
        }

        let watermark = q.watermark_edge();
        (
            accepted,
            PostOutcome {
                fire_event: was_empty && accepted,
                watermark,
            },
        )
    }

    fn push_state(&self, entry: QueueEntry) -> PostOutcome {
        let mut q = self.queue.lock().unwrap();
        match &entry {
            QueueEntry::Connected(_) if q.mask_connected => return PostOutcome::default(),
            QueueEntry::Disconnected if q.mask_disconnected => return PostOutcome::default(),
            _ => {}
        }
        let was_empty = q.entries.is_empty();
        q.entries.push_back(entry);
        PostOutcome {
            fire_event: was_empty,
            watermark: None,
        }
    }

    pub(crate) fn push_connected(&self, peer: SocketAddr) -> PostOutcome {
        self.push_state(QueueEntry::Connected(peer))
    }

    pub(crate) fn push_disconnected(&self) -> PostOutcome {
        self.push_state(QueueEntry::Disconnected)
    }

    pub(crate) fn push_finished(&self) -> PostOutcome {
        self.push_state(QueueEntry::Finished)
    }

    pub(crate) fn push_error(&self, message: String) -> PostOutcome {
        self.push_state(QueueEntry::Error(message))
    }

    /// Take the next observable event. Also returns any pipeline credit to
    /// report and watermark edge to fire, both handled outside the lock.
    #[allow(clippy::type_complexity)]
    pub(crate) fn pop_entry(
        &self,
    ) -> (
        Result<Option<IValue>, Error>,
        Option<u32>,
        Option<(bool, WatermarkFn)>,
    ) {
        let mut credit = None;
        let mut watermark = None;
        let mut q = self.queue.lock().unwrap();
        let result = loop {
            match q.entries.pop_front() {
                None => {
                    break if q.finished {
                        Err(Error::Finished)
                    } else {
                        Ok(None)
                    };
                }
                Some(QueueEntry::Connected(peer)) => {
                    if q.mask_connected {
                        continue;
                    }
                    break Err(Error::Connected(peer));
                }
                Some(QueueEntry::Disconnected) => {
                    if q.mask_disconnected {
                        continue;
                    }
                    break Err(Error::Disconnected);
                }
                Some(QueueEntry::Finished) => {
                    q.finished = true;
                    break Err(Error::Finished);
                }
                Some(QueueEntry::Error(msg)) => {
                    q.finished = true;
                    break Err(Error::Remote(msg));
                }
                Some(QueueEntry::Value(v)) => {
                    q.unacked += 1;
                    credit = q.take_credit();
                    watermark = q.watermark_edge();
                    break Ok(Some(v));
                }
            }
        };
        (result, credit, watermark)
    }
}

/// Per-subscription state kept by the core inside the operation.
pub(crate) struct MonitorOp {
    pub request: Request,
    pub prototype: Option<IValue>,
    pub port: MonitorPort,
}

/// The core's side of a subscription.
pub(crate) struct MonitorPort {
    pub shared: Arc<MonitorShared>,
    pub weak: Weak<SubscriptionInner>,
    pub event: Option<EventFn>,
}

pub(crate) struct SubscriptionInner {
    pub(crate) shared: Arc<MonitorShared>,
    handle: IoHandle,
    token: u64,
}

impl SubscriptionInner {
    pub(crate) fn new(
        handle: IoHandle,
        token: u64,
        config: &MonitorConfig,
    ) -> (Subscription, MonitorPort) {
        let shared = MonitorShared::new(config);
        let inner = Arc::new(SubscriptionInner {
            shared: shared.clone(),
            handle,
            token,
        });
        let port = MonitorPort {
            shared,
            weak: Arc::downgrade(&inner),
            event: config.event.clone(),
        };
        (Subscription { inner }, port)
    }
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        let token = self.token;
        debug!("Cancelling subscription {token} on drop");
        self.handle.call(move |core| core.cancel_op(token));
    }
}

/// Handle for a monitor subscription. Clones share the queue; dropping the
/// last clone cancels the subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Take the next queued event.
    ///
    /// * `Ok(Some(_))`: a data update
    /// * `Ok(None)`: the queue is empty
    /// * `Err(Connected)`: the subscription (re)connected (unless masked)
    /// * `Err(Disconnected)`: the channel left Active (unless masked)
    /// * `Err(Finished)`: the server completed the subscription
    /// * `Err(Remote)`: the server rejected the subscription
    pub fn pop(&self) -> Result<Option<IValue>, Error> {
        let (result, credit, watermark) = self.inner.shared.pop_entry();
        if let Some((rising, cb)) = watermark {
            run_watermark(&cb, rising);
        }
        if let Some(free) = credit {
            let token = self.inner.token;
            self.inner
                .handle
                .call(move |core| core.monitor_ack(token, free));
        }
        result
    }

    /// Cancel the subscription. No further events will be queued.
    pub fn cancel(&self) {
        let token = self.inner.token;
        self.inner.handle.call(move |core| core.cancel_op(token));
    }
}

fn run_watermark(cb: &WatermarkFn, rising: bool) {
    if catch_unwind(AssertUnwindSafe(|| cb(rising))).is_err() {
        error!("Watermark callback panicked; continuing");
    }
}

fn dispatch_outcome(weak: &Weak<SubscriptionInner>, event: &Option<EventFn>, out: PostOutcome) {
    if let Some((rising, cb)) = out.watermark {
        run_watermark(&cb, rising);
    }
    if out.fire_event
        && let Some(cb) = event
        && let Some(inner) = weak.upgrade()
    {
        let sub = Subscription { inner };
        if catch_unwind(AssertUnwindSafe(|| cb(&sub))).is_err() {
            error!("Subscription event callback panicked; continuing");
        }
    }
}

impl Core {
    pub(crate) fn start_monitor(
        &mut self,
        token: u64,
        name: String,
        mut request: Request,
        config: MonitorConfig,
        port: MonitorPort,
    ) {
        if config.pipeline {
            request.record("pipeline", "true");
            request.record("queueSize", &config.queue_size.to_string());
        }
        let kind = OpKind::Monitor(MonitorOp {
            request,
            prototype: None,
            port,
        });
        self.start_op(token, name, kind, None);
    }

    pub(crate) fn handle_monitor_reply(
        &mut self,
        peer: SocketAddr,
        frame: &Frame,
    ) -> Result<(), Error> {
        let mut rx = frame.rx();
        let ioid = rx.get_u32()?;
        let sub = rx.get_u8()?;

        if sub & subcmd::INIT != 0 {
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
                debug!("{peer}: stale MONITOR ioid {ioid}");
                return Ok(());
            };
            let expected = self.ops.get(&token).is_some_and(|op| {
                matches!(op.kind, OpKind::Monitor(_)) && op.state == OpPhase::Creating
            });
            if !expected {
                return Err(Error::Protocol("unexpected MONITOR INIT reply"));
            }
            if !status.is_success() {
                self.finish_op(token, Err(Error::Remote(status.message().to_string())));
                return Ok(());
            }
            let dtype = dtype.ok_or(Error::Protocol("INIT reply without type description"))?;
            let proto = MValue::instantiate(dtype).freeze()?;

            let outcome = {
                let Some(op) = self.ops.get_mut(&token) else {
                    return Ok(());
                };
                op.state = OpPhase::Executing;
                let OpKind::Monitor(m) = &mut op.kind else {
                    return Ok(());
                };
                m.prototype = Some(proto);
                m.port.shared.push_connected(peer)
            };

            let Some((_, sid, _)) = self.op_route(token) else {
                return Ok(());
            };
            self.send_frame(peer, cmd::MONITOR, |tx, _| {
                tx.put_u32(sid);
                tx.put_u32(ioid);
                tx.put_u8(subcmd::EXEC);
                Ok(())
            });
            self.monitor_outcome(token, outcome);
            return Ok(());
        }

        // event record: (maskedValue, overrun, finished)
        let finished = sub & subcmd::FINISHED != 0;
        let Some(token) = self.token_for_ioid(peer, ioid) else {
            debug!("{peer}: event for stale MONITOR ioid {ioid}");
            return Ok(());
        };
        let expected = self.ops.get(&token).is_some_and(|op| {
            matches!(op.kind, OpKind::Monitor(_)) && op.state == OpPhase::Executing
        });
        if !expected {
            debug!("{peer}: MONITOR event in unexpected state; ignoring");
            return Ok(());
        }

        if !rx.is_empty() {
            let proto = match self.ops.get(&token) {
                Some(OpState {
                    kind: OpKind::Monitor(m),
                    ..
                }) => m.prototype.clone(),
                _ => None,
            };
            let proto = proto.ok_or(Error::Protocol("MONITOR event before type exchange"))?;
            let mut data = proto.clone_empty();
            {
                let Some(conn) = self.conns.get_mut(&peer) else {
                    return Ok(());
                };
                from_wire_valid(&mut rx, &mut conn.rx_types, &mut data)?;
            }
            let overrun = if !rx.is_empty() {
                BitMask::from_wire(&mut rx)?
            } else {
                BitMask::default()
            };
            if overrun.highest_set().is_some() {
                trace!("{peer}: server-side overrun on ioid {ioid}");
            }
            let value = data.freeze()?;

            let outcome = match self.ops.get(&token) {
                Some(OpState {
                    kind: OpKind::Monitor(m),
                    ..
                }) => m.port.shared.post(value, true).1,
                _ => return Ok(()),
            };
            self.monitor_outcome(token, outcome);
        }

        if finished {
            debug!("{peer}: subscription ioid {ioid} finished");
            let outcome = match self.ops.get(&token) {
                Some(OpState {
                    kind: OpKind::Monitor(m),
                    ..
                }) => m.port.shared.push_finished(),
                _ => return Ok(()),
            };
            self.monitor_outcome(token, outcome);
            // terminal: the server will send nothing further for this ioid
            if let Some(op) = self.ops.remove(&token)
                && let Some(ioid) = op.ioid
                && let Some(conn) = self.conns.get_mut(&peer)
            {
                conn.op_by_ioid.remove(&ioid);
            }
        }
        Ok(())
    }

    /// Report freed queue slots back to the server (pipeline mode).
    pub(crate) fn monitor_ack(&mut self, token: u64, free: u32) {
        let Some((peer, sid, ioid)) = self.op_route(token) else {
            return;
        };
        trace!("ioid {ioid}: granting {free} slots");
        self.send_frame(peer, cmd::MONITOR, move |tx, _| {
            tx.put_u32(sid);
            tx.put_u32(ioid);
            tx.put_u8(subcmd::ACK);
            tx.put_u32(free);
            Ok(())
        });
    }

    /// The subscription's connection went away: queue the sentinel and
    /// forget the prototype so the replayed INIT re-exchanges types.
    pub(crate) fn monitor_dropped(&mut self, token: u64) {
        let outcome = match self.ops.get_mut(&token) {
            Some(OpState {
                kind: OpKind::Monitor(m),
                ..
            }) => {
                m.prototype = None;
                m.port.shared.push_disconnected()
            }
            _ => return,
        };
        self.monitor_outcome(token, outcome);
    }

    /// A monitor operation ended; surface the reason through the queue.
    pub(crate) fn monitor_terminated(&mut self, m: &MonitorOp, err: Option<Error>) {
        let outcome = match err {
            None => m.port.shared.push_finished(),
            Some(Error::Disconnected) => m.port.shared.push_disconnected(),
            Some(Error::Remote(msg)) => m.port.shared.push_error(msg),
            Some(e) => m.port.shared.push_error(e.to_string()),
        };
        dispatch_outcome(&m.port.weak, &m.port.event, outcome);
    }

    fn monitor_outcome(&mut self, token: u64, outcome: PostOutcome) {
        match self.ops.get(&token) {
            Some(OpState {
                kind: OpKind::Monitor(m),
                ..
            }) => dispatch_outcome(&m.port.weak, &m.port.event, outcome),
            _ => dispatch_outcome(&Weak::new(), &None, outcome),
        }
    }
}
