// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One transport association within a session.
//!
//! Exactly one sender task exists per connection for its whole lifetime;
//! only that task writes to the socket. Producers enqueue PDUs under the
//! connection lock and signal `sender_wake`; the sender drains the queue,
//! stamping ExpStatSN and the header digest per transmission, and takes
//! over cleanup when the connection terminates.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    events::EventKind,
    session::{
        pdu::{PduDisp, PduFlags, PduId, PduPool},
        recovery,
        session::Session,
        timer::Timer,
    },
    status::{LogoutKind, Status},
    transport::WireSocket,
};

/// Connection state machine. Sideways transition to `Terminating` is
/// allowed from anywhere via `handle_connection_error`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    Free = 0,
    SecurityNegotiation = 1,
    OperationalNegotiation = 2,
    FullFeature = 3,
    /// Still drains its send queue but accepts no new commands.
    LogoutSent = 4,
    Terminating = 5,
    Destroy = 6,
}

impl ConnPhase {
    fn from_u8(v: u8) -> ConnPhase {
        match v {
            1 => ConnPhase::SecurityNegotiation,
            2 => ConnPhase::OperationalNegotiation,
            3 => ConnPhase::FullFeature,
            4 => ConnPhase::LogoutSent,
            5 => ConnPhase::Terminating,
            6 => ConnPhase::Destroy,
            _ => ConnPhase::Free,
        }
    }
}

/// Logout progression used by recovery to decide whether task
/// reassignment is allowed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogoutProgress {
    #[default]
    Not,
    Sent,
    Failed,
    Success,
}

/// Parameters committed when negotiation reaches full-feature phase.
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub header_digest: bool,
    pub data_digest: bool,
    /// Largest data segment per outgoing PDU.
    pub max_transfer: u32,
    /// Immediate data allowed inside the command PDU.
    pub max_firstimmed: u32,
    /// Total unsolicited data allowed before the first R2T.
    pub max_firstdata: u32,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            header_digest: false,
            data_digest: false,
            max_transfer: 8192,
            max_firstimmed: 0,
            max_firstdata: 0,
        }
    }
}

pub(crate) struct ConnState {
    pub queue: VecDeque<PduId>,
    pub pdus: PduPool,
    /// FIFO of outstanding CCBs (by ITT) attached to this connection.
    pub waiting: VecDeque<u32>,
    /// Non-`None` once shutdown is requested, holding the status.
    pub terminating: Option<Status>,
    pub destroy: bool,
    pub loggedout: LogoutProgress,
    pub num_timeouts: u32,
    pub params: ConnParams,
}

pub struct Connection {
    pub id: u16,
    pub(crate) session: Weak<Session>,
    pub(crate) sock: Arc<dyn WireSocket>,
    pub(crate) state: Mutex<ConnState>,
    /// Sender wakeup (`conn_cv`).
    pub(crate) sender_wake: Notify,
    /// Broadcast to CCB waiters (`ccb_cv`); each re-checks its own
    /// disposition.
    pub(crate) ccb_wake: Notify,
    /// Recovery-login wakeup during the post-cleanup idle window.
    pub(crate) idle_wake: Notify,
    /// Waiters for a free PDU slot.
    pub(crate) pool_wake: Notify,
    /// CCBs currently attached to this connection.
    pub usecount: AtomicU32,
    /// Mirror of the target's StatSN, stamped into every outgoing PDU.
    pub(crate) exp_stat_sn: AtomicU32,
    phase: AtomicU8,
    pub(crate) idle_timer: Timer,
    pub(crate) config: Arc<Config>,
}

impl Connection {
    pub(crate) fn new(
        id: u16,
        session: Weak<Session>,
        sock: Arc<dyn WireSocket>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            sock,
            state: Mutex::new(ConnState {
                queue: VecDeque::new(),
                pdus: PduPool::new(config.runtime.pdus_per_connection),
                waiting: VecDeque::new(),
                terminating: None,
                destroy: false,
                loggedout: LogoutProgress::Not,
                num_timeouts: 0,
                params: ConnParams::default(),
            }),
            sender_wake: Notify::new(),
            ccb_wake: Notify::new(),
            idle_wake: Notify::new(),
            pool_wake: Notify::new(),
            usecount: AtomicU32::new(0),
            exp_stat_sn: AtomicU32::new(0),
            phase: AtomicU8::new(ConnPhase::Free as u8),
            idle_timer: Timer::new(),
            config,
        })
    }

    #[inline]
    pub fn phase(&self) -> ConnPhase {
        ConnPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: ConnPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Snapshot of the negotiated parameters.
    pub async fn params(&self) -> ConnParams {
        self.state.lock().await.params.clone()
    }

    pub(crate) async fn terminating_status(&self) -> Status {
        self.state
            .lock()
            .await
            .terminating
            .unwrap_or(Status::ConnectionFailed)
    }

    /// The receive path mirrors the target's StatSN here.
    pub fn update_exp_stat_sn(&self, sn: u32) {
        self.exp_stat_sn.store(sn, Ordering::Release);
    }

    /// Any inbound traffic proves the connection alive; resets the
    /// keepalive escalation counter.
    pub async fn mark_alive(&self) {
        self.state.lock().await.num_timeouts = 0;
    }

    /// Allocate an outgoing PDU, optionally parking until the pool has
    /// room. `None` means the connection is going away or the pool is
    /// exhausted in no-wait mode.
    pub(crate) async fn get_pdu(self: &Arc<Self>, waitok: bool) -> Option<PduId> {
        loop {
            let notified = self.pool_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut cst = self.state.lock().await;
                if cst.terminating.is_some() {
                    return None;
                }
                if let Some(id) = cst.pdus.alloc() {
                    return Some(id);
                }
                if !waitok {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn free_pdu(&self, id: PduId) {
        let mut cst = self.state.lock().await;
        if cst.pdus.free(id) {
            drop(cst);
            self.pool_wake.notify_waiters();
        }
    }

    /// Commit negotiated parameters and enter full-feature phase. Wakes
    /// `assign_connection` waiters and starts the keepalive timer.
    pub async fn commit_negotiated_parameters(self: &Arc<Self>, params: ConnParams) {
        {
            let mut cst = self.state.lock().await;
            cst.params = params;
            cst.num_timeouts = 0;
        }
        self.set_phase(ConnPhase::FullFeature);
        self.arm_idle_timer();
        if let Some(sess) = self.session.upgrade() {
            sess.wake.notify_waiters();
        }
        debug!(conn = self.id, "entering full feature phase");
    }

    pub(crate) fn arm_idle_timer(self: &Arc<Self>) {
        let conn = self.clone();
        self.idle_timer
            .arm(self.config.runtime.connection_timeout, async move {
                connection_timeout(conn).await;
            });
    }

    /// Management decision that this connection cannot recover: the
    /// sender finishes cleanup and exits.
    pub async fn mark_destroy(&self) {
        {
            let mut cst = self.state.lock().await;
            cst.destroy = true;
            if cst.terminating.is_none() {
                cst.terminating = Some(Status::ConnectionFailed);
            }
        }
        self.set_phase(ConnPhase::Terminating);
        self.sender_wake.notify_one();
        self.idle_wake.notify_waiters();
    }

    /// Reclaim a terminated-but-not-destroyed connection slot for a
    /// recovery login. Returns false once destruction has begun.
    pub async fn prepare_relogin(&self) -> bool {
        {
            let mut cst = self.state.lock().await;
            if cst.destroy {
                return false;
            }
            cst.terminating = None;
            cst.loggedout = LogoutProgress::Not;
            cst.num_timeouts = 0;
        }
        self.set_phase(ConnPhase::Free);
        self.idle_wake.notify_waiters();
        true
    }

    /// The per-connection sender: drains the queue while healthy, then
    /// owns the cleanup of the terminating connection, then either waits
    /// for a recovery login or exits for good.
    pub(crate) async fn sender_loop(self: Arc<Self>) {
        loop {
            self.drain_queue().await;

            self.cleanup().await;

            if self.state.lock().await.destroy {
                break;
            }
        }
        self.teardown().await;
    }

    async fn drain_queue(self: &Arc<Self>) {
        loop {
            let notified = self.sender_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut cst = self.state.lock().await;
                if cst.terminating.is_some() {
                    return;
                }
                match cst.queue.pop_front() {
                    Some(id) => {
                        let exp_stat_sn = self.exp_stat_sn.load(Ordering::Acquire);
                        match cst.pdus.get_mut(id) {
                            Some(pdu) => {
                                pdu.flags.remove(PduFlags::INQUEUE);
                                pdu.stamp_exp_stat_sn(exp_stat_sn);
                                Some((id, pdu.frame()))
                            },
                            None => continue,
                        }
                    },
                    None => None,
                }
            };

            match next {
                Some((id, frame)) => {
                    debug!(
                        conn = self.id,
                        bytes = frame.wire_len(),
                        "transmitting PDU"
                    );
                    if let Err(err) = self.sock.send_frame(&frame).await {
                        warn!(conn = self.id, %err, "socket write failed");
                        recovery::handle_connection_error(
                            self,
                            Status::SocketError,
                            LogoutKind::NoLogout,
                        )
                        .await;
                        // fall through: dispose of the PDU, do not requeue
                    }
                    let freed = {
                        let mut cst = self.state.lock().await;
                        match cst.pdus.get_mut(id) {
                            Some(pdu) => {
                                if pdu.disp == PduDisp::Free {
                                    cst.pdus.free(id);
                                    true
                                } else {
                                    pdu.flags.remove(PduFlags::BUSY);
                                    false
                                }
                            },
                            None => false,
                        }
                    };
                    if freed {
                        self.pool_wake.notify_waiters();
                    }
                },
                None => notified.await,
            }
        }
    }

    /// Cleanup phase of the terminating connection, run by the sender.
    async fn cleanup(self: &Arc<Self>) {
        let sess = self.session.upgrade();
        let status = self.terminating_status().await;

        self.idle_timer.stop();
        self.sock.shutdown();

        // Wake non-reassignable CCBs; survivors keep their PDU and get
        // their timers stopped for the move.
        if let Some(sess) = &sess {
            let mut to_wake = Vec::new();
            {
                let mut sst = sess.state.lock().await;
                let cst = self.state.lock().await;
                for &itt in &cst.waiting {
                    if let Some(ccb) = sst.ccbs.get_mut(itt) {
                        if !ccb.flags.contains(crate::session::ccb::CcbFlags::REASSIGN)
                            || ccb.pdu_waiting.is_none()
                        {
                            to_wake.push(itt);
                        } else {
                            ccb.timer.stop();
                            ccb.num_timeouts = 0;
                        }
                    }
                }
            }
            for itt in to_wake {
                sess.wake_ccb(itt, status).await;
            }

            // Drain the send queue; PDUs retained by surviving CCBs stay
            // with them for reassignment.
            {
                let mut sst = sess.state.lock().await;
                let mut cst = self.state.lock().await;
                while let Some(id) = cst.queue.pop_front() {
                    let owner = match cst.pdus.get_mut(id) {
                        Some(pdu) => {
                            pdu.flags.remove(PduFlags::INQUEUE | PduFlags::BUSY);
                            pdu.owner
                        },
                        None => continue,
                    };
                    let retained = owner
                        .and_then(|itt| sst.ccbs.get(itt))
                        .is_some_and(|ccb| ccb.pdu_waiting == Some(id));
                    if !retained {
                        cst.pdus.free(id);
                    }
                }
            }

            let survivors = self.state.lock().await.waiting.len();
            let siblings = sess.active_connections().await;
            if siblings > 0 && survivors > 0 {
                recovery::reassign_tasks(self).await;
            } else {
                let (destroy, time2wait) = {
                    let sst = sess.state.lock().await;
                    let cst = self.state.lock().await;
                    (cst.destroy, sst.time2wait)
                };
                if !destroy && !time2wait.is_zero() {
                    debug!(conn = self.id, ?time2wait, "waiting Time2Wait");
                    tokio::time::sleep(time2wait).await;
                }
            }

            let destroy = self.state.lock().await.destroy;
            sess.events.post(
                if destroy {
                    EventKind::ConnectionTerminated
                } else {
                    EventKind::RecoverConnection
                },
                sess.id,
                self.id,
                status,
            );
        }

        // Leave the slot available for a recovery login for a bounded
        // window, then give up on it.
        let destroy = self.state.lock().await.destroy;
        if !destroy {
            let notified = self.idle_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(
                self.config.runtime.connection_idle_timeout,
                notified,
            )
            .await;

            let mut cst = self.state.lock().await;
            if cst.terminating.is_some() {
                cst.destroy = true;
            }
        }
    }

    async fn teardown(self: &Arc<Self>) {
        self.set_phase(ConnPhase::Destroy);
        let status = self.terminating_status().await;

        if let Some(sess) = self.session.upgrade() {
            // wake anything still parked on this connection
            let remaining: Vec<u32> = {
                let cst = self.state.lock().await;
                cst.waiting.iter().copied().collect()
            };
            for itt in remaining {
                sess.wake_ccb(itt, status).await;
            }
            sess.remove_connection(self.id).await;
        }
        self.sender_wake.notify_waiters();
        self.pool_wake.notify_waiters();
        self.ccb_wake.notify_waiters();
        debug!(conn = self.id, "sender exits");
    }
}

/// Idle timer expiry: escalate after too many silent intervals, else
/// probe the target with a NOP-Out and rearm.
pub(crate) async fn connection_timeout(conn: Arc<Connection>) {
    let timeouts = {
        let mut cst = conn.state.lock().await;
        cst.num_timeouts += 1;
        cst.num_timeouts
    };
    if timeouts > conn.config.runtime.max_conn_timeouts {
        recovery::handle_connection_error(&conn, Status::Timeout, LogoutKind::NoLogout)
            .await;
    } else {
        if conn.phase() == ConnPhase::FullFeature {
            let _ = crate::session::send::send_nop_out(&conn, None).await;
        }
        conn.arm_idle_timer();
    }
}
