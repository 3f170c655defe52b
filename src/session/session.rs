// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A session is the logical binding to one target: the CmdSN window, the
//! ordered connection list with its most-recently-used pointer, and the
//! CCB arena shared by all connections of the session.
//!
//! Lock order is session state before connection state, never the other
//! way around.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU16, AtomicUsize, Ordering},
};

use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::{
    cfg::config::Config,
    events::EventSink,
    session::{
        ccb::{CcbDisp, CcbTable, XferResult},
        connection::{ConnPhase, Connection},
        pdu::{PduDisp, PduFlags},
    },
    status::Status,
    transport::WireSocket,
    utils::generate_isid,
};

/// `a < b` in RFC 1982 serial arithmetic over 32 bits.
#[inline]
pub(crate) fn sna_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}

/// Session sequence numbers: the next CmdSN to assign and the advisory
/// window bounds mirrored from the target.
#[derive(Debug, Clone, Copy)]
pub struct SnWindow {
    pub cmd_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl SnWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            cmd_sn: initial,
            exp_cmd_sn: initial,
            max_cmd_sn: initial.wrapping_add(1),
        }
    }

    /// CmdSN <= MaxCmdSN: new commands may be issued.
    #[inline]
    pub fn in_window(&self) -> bool {
        !sna_lt(self.max_cmd_sn, self.cmd_sn)
    }

    /// Hand out the next CmdSN. Immediate PDUs observe the number
    /// without consuming it.
    pub fn get_sernum(&mut self, immediate: bool) -> u32 {
        let sn = self.cmd_sn;
        if !immediate {
            self.cmd_sn = self.cmd_sn.wrapping_add(1);
        }
        sn
    }

    /// Absorb ExpCmdSN/MaxCmdSN from a received PDU; the window only
    /// moves forward.
    pub fn update(&mut self, exp_cmd_sn: u32, max_cmd_sn: u32) {
        if sna_lt(self.exp_cmd_sn, exp_cmd_sn) {
            self.exp_cmd_sn = exp_cmd_sn;
        }
        if sna_lt(self.max_cmd_sn, max_cmd_sn) {
            self.max_cmd_sn = max_cmd_sn;
        }
    }
}

pub struct SessionState {
    pub tsih: u16,
    pub window: SnWindow,
    pub ccbs: CcbTable,
    pub conns: Vec<Arc<Connection>>,
    /// Index of the most-recently-used connection for round-robin.
    pub mru: usize,
    pub terminating: bool,
    pub recovery_level: u8,
    pub time2wait: std::time::Duration,
    pub time2retain: std::time::Duration,
}

pub struct Session {
    pub id: u16,
    pub isid: [u8; 6],
    pub(crate) config: Arc<Config>,
    pub(crate) state: Mutex<SessionState>,
    /// Waiters for a usable connection or a window change.
    pub(crate) wake: Notify,
    /// Waiters for a free CCB slot.
    pub(crate) ccb_free_wake: Notify,
    pub(crate) events: EventSink,
    pub(crate) send_tasks: Arc<AtomicUsize>,
    self_weak: OnceCell<Weak<Session>>,
    next_cid: AtomicU16,
}

impl Session {
    pub fn new(
        id: u16,
        config: Arc<Config>,
        events: EventSink,
        send_tasks: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let state = SessionState {
            tsih: 0,
            window: SnWindow::new(1),
            ccbs: CcbTable::new(config.runtime.ccbs_per_session),
            conns: Vec::new(),
            mru: 0,
            terminating: false,
            recovery_level: config.login.recovery.error_recovery_level,
            time2wait: config.login.timers.default_time2wait,
            time2retain: config.login.timers.default_time2retain,
        };
        let sess = Arc::new(Self {
            id,
            isid: generate_isid(),
            config,
            state: Mutex::new(state),
            wake: Notify::new(),
            ccb_free_wake: Notify::new(),
            events,
            send_tasks,
            self_weak: OnceCell::new(),
            next_cid: AtomicU16::new(0),
        });
        let _ = sess.self_weak.set(Arc::downgrade(&sess));
        sess
    }

    pub(crate) fn weak(&self) -> Weak<Session> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    /// Create a connection on `sock` and start its sender task. The
    /// connection is in the free phase until a login drives it forward.
    pub async fn add_connection(
        self: &Arc<Self>,
        sock: Arc<dyn WireSocket>,
    ) -> Arc<Connection> {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(cid, self.weak(), sock, self.config.clone());
        {
            let mut sst = self.state.lock().await;
            sst.conns.push(conn.clone());
        }
        let task_conn = conn.clone();
        let counter = self.send_tasks.clone();
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            task_conn.sender_loop().await;
            counter.fetch_sub(1, Ordering::SeqCst);
        });
        conn
    }

    /// Pick the connection for the next transaction: a circular walk
    /// from the most-recently-used entry, first full-feature connection
    /// wins, ties broken by list order. With `waitok` the caller parks
    /// until one becomes usable or the session terminates.
    pub async fn assign_connection(
        self: &Arc<Self>,
        waitok: bool,
    ) -> Option<Arc<Connection>> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut sst = self.state.lock().await;
                if sst.terminating || sst.conns.is_empty() {
                    return None;
                }
                let n = sst.conns.len();
                let start = sst.mru.min(n - 1);
                let mut found = None;
                for step in 1..=n {
                    let idx = (start + step) % n;
                    if sst.conns[idx].phase() == ConnPhase::FullFeature {
                        found = Some(idx);
                        break;
                    }
                }
                match found {
                    Some(idx) => {
                        sst.mru = idx;
                        return Some(sst.conns[idx].clone());
                    },
                    None if !waitok => return None,
                    None => {},
                }
            }
            notified.await;
        }
    }

    /// Target-assigned session handle; zero until the first login
    /// completes.
    pub async fn tsih(&self) -> u16 {
        self.state.lock().await.tsih
    }

    /// Snapshot of the CmdSN window.
    pub async fn sn_window(&self) -> SnWindow {
        self.state.lock().await.window
    }

    pub async fn find_connection(&self, cid: u16) -> Option<Arc<Connection>> {
        let sst = self.state.lock().await;
        sst.conns.iter().find(|c| c.id == cid).cloned()
    }

    /// Count of connections currently in full-feature phase.
    pub async fn active_connections(&self) -> usize {
        let sst = self.state.lock().await;
        sst.conns
            .iter()
            .filter(|c| c.phase() == ConnPhase::FullFeature)
            .count()
    }

    /// Mirror the window fields of a received PDU. The receive path
    /// calls this for every response carrying ExpCmdSN/MaxCmdSN.
    pub async fn update_sn_window(&self, exp_cmd_sn: u32, max_cmd_sn: u32) {
        {
            let mut sst = self.state.lock().await;
            sst.window.update(exp_cmd_sn, max_cmd_sn);
        }
        self.wake.notify_waiters();
    }

    /// Absorb Time2Wait/Time2Retain from a logout response.
    pub async fn update_retain_timers(
        &self,
        time2wait: std::time::Duration,
        time2retain: std::time::Duration,
    ) {
        let mut sst = self.state.lock().await;
        sst.time2wait = time2wait;
        sst.time2retain = time2retain;
    }

    /// Allocate a CCB bound to `conn`, optionally parking until a slot
    /// frees up. Returns `None` when the session or connection is going
    /// away, or the table is exhausted in no-wait mode.
    pub(crate) async fn get_ccb(
        &self,
        conn: &Arc<Connection>,
        waitok: bool,
    ) -> Option<u32> {
        loop {
            let notified = self.ccb_free_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut sst = self.state.lock().await;
                if sst.terminating {
                    return None;
                }
                if conn.state.lock().await.terminating.is_some() {
                    return None;
                }
                if let Some(itt) = sst.ccbs.alloc(conn.id) {
                    conn.usecount.fetch_add(1, Ordering::Relaxed);
                    return Some(itt);
                }
                if !waitok {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Deliver the terminal status for a CCB, exactly once.
    ///
    /// Stops the command timer, detaches the CCB from its connection,
    /// releases the retransmit PDU (or marks it for the sender to free),
    /// then resolves per disposition: waiters are notified, upper-stack
    /// transfers complete through their channel, everything else frees
    /// the CCB outright.
    pub async fn wake_ccb(&self, itt: u32, status: Status) {
        let mut fire: Option<(tokio::sync::oneshot::Sender<XferResult>, XferResult)> =
            None;
        let mut wake_conn: Option<Arc<Connection>> = None;
        let mut freed = false;
        {
            let mut sst = self.state.lock().await;
            let conn = sst
                .ccbs
                .get(itt)
                .map(|c| c.conn_id)
                .and_then(|cid| sst.conns.iter().find(|c| c.id == cid).cloned());
            let Some(ccb) = sst.ccbs.get_mut(itt) else {
                return;
            };
            let disp = ccb.disp;
            if disp <= CcbDisp::Nowait || disp == CcbDisp::Defer {
                debug!(itt, ?disp, "wake_ccb: nothing to wake");
                return;
            }
            ccb.timer.stop();
            ccb.status = status;
            ccb.disp = CcbDisp::Busy;
            let pdu_wait = ccb.pdu_waiting.take();
            if disp != CcbDisp::Wait {
                let result = XferResult {
                    status,
                    residual: ccb.residual,
                    sense: ccb.sense.take(),
                };
                fire = ccb.done.take().map(|tx| (tx, result));
            }

            if let Some(conn) = conn.clone() {
                let mut cst = conn.state.lock().await;
                cst.waiting.retain(|&t| t != itt);
                if let Some(pid) = pdu_wait {
                    if let Some(pdu) = cst.pdus.get_mut(pid) {
                        if pdu.flags.intersects(PduFlags::INQUEUE | PduFlags::BUSY) {
                            // still owned by the queue or the sender
                            pdu.disp = PduDisp::Free;
                            pdu.owner = None;
                        } else {
                            cst.pdus.free(pid);
                        }
                    }
                }
            }

            if disp != CcbDisp::Wait {
                sst.ccbs.free(itt);
                freed = true;
                if let Some(conn) = &conn {
                    conn.usecount.fetch_sub(1, Ordering::Relaxed);
                }
            }
            wake_conn = conn;
        }
        if let Some(conn) = &wake_conn {
            conn.ccb_wake.notify_waiters();
            conn.pool_wake.notify_waiters();
        }
        if freed {
            self.ccb_free_wake.notify_waiters();
        }
        if let Some((tx, result)) = fire {
            let _ = tx.send(result);
        }
    }

    /// Per-read DataSN bookkeeping, called by the receive path for each
    /// Data-In PDU. Keeps the window the command timer and DataAck
    /// SNACKs consult.
    pub async fn note_data_in(&self, itt: u32, data_sn: u32, nbytes: u32) {
        let mut sst = self.state.lock().await;
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            if ccb.exp_data_sn == data_sn {
                ccb.exp_data_sn = data_sn.wrapping_add(1);
            }
            ccb.xfer_len = ccb.xfer_len.saturating_add(nbytes);
        }
    }

    /// Terminal status of a woken CCB, for `Wait`-disposition callers.
    pub async fn ccb_status(&self, itt: u32) -> Status {
        let sst = self.state.lock().await;
        sst.ccbs
            .get(itt)
            .map(|c| c.status)
            .unwrap_or(Status::ConnectionFailed)
    }

    pub async fn free_ccb(&self, itt: u32) {
        let conn = {
            let mut sst = self.state.lock().await;
            let conn = sst
                .ccbs
                .get(itt)
                .map(|c| c.conn_id)
                .and_then(|cid| sst.conns.iter().find(|c| c.id == cid).cloned());
            if !sst.ccbs.free(itt) {
                return;
            }
            conn
        };
        if let Some(conn) = conn {
            conn.usecount.fetch_sub(1, Ordering::Relaxed);
        }
        self.ccb_free_wake.notify_waiters();
    }

    /// Drop a destroyed connection from the session list.
    pub(crate) async fn remove_connection(&self, cid: u16) {
        {
            let mut sst = self.state.lock().await;
            sst.conns.retain(|c| c.id != cid);
            sst.mru = 0;
        }
        self.wake.notify_waiters();
    }

    /// Begin session teardown: refuse new work and kill every
    /// connection. CCBs surface `ConnectionFailed` through the usual
    /// cleanup path.
    pub async fn terminate(self: &Arc<Self>) {
        let conns = {
            let mut sst = self.state.lock().await;
            sst.terminating = true;
            sst.conns.clone()
        };
        self.wake.notify_waiters();
        for conn in conns {
            crate::session::recovery::handle_connection_error(
                &conn,
                Status::ConnectionFailed,
                crate::status::LogoutKind::NoLogout,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_compare_wraps() {
        assert!(sna_lt(1, 2));
        assert!(!sna_lt(2, 1));
        assert!(!sna_lt(5, 5));
        assert!(sna_lt(u32::MAX, 0), "wraparound must order correctly");
        assert!(!sna_lt(0, u32::MAX));
    }

    #[test]
    fn window_gates_and_advances() {
        let mut w = SnWindow::new(10);
        assert!(w.in_window());
        assert_eq!(w.get_sernum(false), 10);
        assert_eq!(w.cmd_sn, 11);
        // immediate traffic observes without consuming
        assert_eq!(w.get_sernum(true), 11);
        assert_eq!(w.cmd_sn, 11);
        // close the window: MaxCmdSN = CmdSN - 1
        w.max_cmd_sn = 10;
        assert!(!w.in_window());
        w.update(11, 20);
        assert!(w.in_window());
    }

    #[test]
    fn window_never_moves_backwards() {
        let mut w = SnWindow::new(100);
        w.update(90, 95);
        assert_eq!(w.exp_cmd_sn, 100);
        assert_eq!(w.max_cmd_sn, 101);
    }
}
