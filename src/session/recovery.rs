// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error escalation and task recovery.
//!
//! Transient errors retry locally (SNACK, resend); fatal errors write a
//! status into `terminating` and hand the connection to its sender for
//! cleanup, which either destroys it or moves surviving commands to a
//! sibling connection.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, warn};

use crate::{
    models::{logout::LogoutReason, snack::SnackKind, task::TaskMgmtFunction},
    session::{
        ccb::CcbDisp,
        connection::{ConnPhase, Connection, LogoutProgress},
        pdu::PduFlags,
        send::{resend_pdu, send_logout, send_task_management, snack_missing},
        session::{Session, sna_lt},
    },
    status::{LogoutKind, Status},
};

/// Put a connection on the terminating path, idempotently.
///
/// With `LogoutKind::LogoutConnection` on a healthy full-feature
/// connection, a logout is sent first and the connection parks in
/// `LogoutSent`; the logout CCB's command timer bounds that state. Every
/// other case records the status, flips the phase and kicks every waiter
/// so the sender can take over cleanup.
pub async fn handle_connection_error(
    conn: &Arc<Connection>,
    status: Status,
    logout: LogoutKind,
) {
    {
        let mut cst = conn.state.lock().await;
        if cst.terminating.is_some() {
            debug!(conn = conn.id, ?status, "already terminating");
            return;
        }
        if logout == LogoutKind::LogoutConnection
            && conn.phase() == ConnPhase::FullFeature
            && cst.loggedout == LogoutProgress::Not
        {
            drop(cst);
            warn!(conn = conn.id, ?status, "logging connection out");
            let _ = send_logout(conn, None, LogoutReason::CloseConnection, false).await;
            return;
        }
        cst.terminating = Some(status);
    }
    warn!(conn = conn.id, ?status, "connection terminating");
    conn.set_phase(ConnPhase::Terminating);
    conn.sender_wake.notify_one();
    conn.pool_wake.notify_waiters();
    conn.ccb_wake.notify_waiters();
    if let Some(sess) = conn.session.upgrade() {
        sess.wake.notify_waiters();
        sess.ccb_free_wake.notify_waiters();
    }
}

/// (Re)arm the command timer of a CCB.
pub(crate) fn arm_command_timer<'a>(
    sess: &'a Arc<Session>,
    conn: &'a Arc<Connection>,
    itt: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let delay = conn.config.runtime.command_timeout;
        let mut sst = sess.state.lock().await;
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            let conn = conn.clone();
            ccb.timer.arm(delay, async move {
                ccb_timeout(conn, itt).await;
            });
        }
    })
}

/// Command timer expiry. Within the retry budget and with recovery
/// enabled, ask the target to retransmit via SNACK; otherwise surface
/// `Timeout` and terminate the connection for recovery.
pub(crate) fn ccb_timeout(
    conn: Arc<Connection>,
    itt: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let Some(sess) = conn.session.upgrade() else {
            return;
        };
        let cfg = &conn.config.runtime;
        let verdict = {
            let mut sst = sess.state.lock().await;
            let level = sst.recovery_level;
            let Some(ccb) = sst.ccbs.get_mut(itt) else {
                return;
            };
            ccb.total_tries += 1;
            ccb.num_timeouts += 1;
            debug!(
                conn = conn.id,
                itt,
                num = ccb.num_timeouts,
                total = ccb.total_tries,
                disp = ?ccb.disp,
                "command timeout"
            );
            let escalate = ccb.num_timeouts > cfg.max_ccb_timeouts
                || ccb.total_tries > cfg.max_ccb_tries
                || ccb.disp <= CcbDisp::Free
                || level == 0;
            (escalate, ccb.data_in && ccb.xfer_len < ccb.data_len)
        };

        match verdict {
            (true, _) => {
                sess.wake_ccb(itt, Status::Timeout).await;
                handle_connection_error(
                    &conn,
                    Status::Timeout,
                    LogoutKind::RecoverConnection,
                )
                .await;
            },
            (false, true) => {
                // request resend of all missing data
                let _ = snack_missing(&conn, Some(itt), SnackKind::DataNak, 0, 0).await;
                arm_command_timer(&sess, &conn, itt).await;
            },
            (false, false) => {
                // request resend of all missing status
                let _ = snack_missing(&conn, None, SnackKind::StatusNak, 0, 0).await;
                arm_command_timer(&sess, &conn, itt).await;
            },
        }
    })
}

async fn wake_all_waiting(sess: &Arc<Session>, conn: &Arc<Connection>, status: Status) {
    let remaining: Vec<u32> = {
        let cst = conn.state.lock().await;
        cst.waiting.iter().copied().collect()
    };
    for itt in remaining {
        sess.wake_ccb(itt, status).await;
    }
}

/// Move surviving commands of a dead connection to a sibling.
///
/// With recovery level 2 the old connection is first logged out for
/// recovery through the sibling; then each surviving CCB's retained PDU
/// is cloned into the sibling's pool, the CCB rehomed, and either a
/// TASK_REASSIGN issued or the original command resent (with a fresh
/// CmdSN when the target has already consumed the old one).
pub async fn reassign_tasks(oldconn: &Arc<Connection>) {
    let Some(sess) = oldconn.session.upgrade() else {
        return;
    };
    let old_status = oldconn.terminating_status().await;

    let Some(newconn) = sess.assign_connection(false).await else {
        debug!(
            conn = oldconn.id,
            "reassign failed, no active connection"
        );
        wake_all_waiting(&sess, oldconn, old_status).await;
        return;
    };

    let (level, time2wait, time2retain) = {
        let sst = sess.state.lock().await;
        (sst.recovery_level, sst.time2wait, sst.time2retain)
    };

    let mut no_tm = true;
    if level >= 2 {
        let loggedout = oldconn.state.lock().await.loggedout;
        match loggedout {
            LogoutProgress::Not => {
                oldconn.state.lock().await.loggedout = LogoutProgress::Sent;
                let rc =
                    send_logout(&newconn, Some(oldconn), LogoutReason::RecoverConnection, true)
                        .await;
                no_tm = rc.is_err();
                oldconn.state.lock().await.loggedout = if rc.is_ok() {
                    LogoutProgress::Success
                } else {
                    LogoutProgress::Failed
                };
                if time2retain.is_zero() {
                    debug!(conn = oldconn.id, "Time2Retain is zero, skipping reassign");
                    no_tm = true;
                }
            },
            LogoutProgress::Success => no_tm = false,
            _ => {},
        }
        if !no_tm && !time2wait.is_zero() {
            debug!(conn = oldconn.id, ?time2wait, "waiting before reassignment");
            tokio::time::sleep(time2wait).await;
        }
    }

    debug!(
        old = oldconn.id,
        new = newconn.id,
        no_tm,
        "reassigning tasks"
    );

    // Move CCBs one at a time: clone the retained PDU into the new
    // connection's pool, rewrite the back-references, rehome the CCB.
    let mut moved = Vec::new();
    let mut starved = false;
    loop {
        let has_next = {
            let cst = oldconn.state.lock().await;
            !cst.waiting.is_empty()
        };
        if !has_next {
            break;
        }
        let Some(new_pid) = newconn.get_pdu(true).await else {
            starved = true;
            break;
        };

        let mut sst = sess.state.lock().await;
        let mut ost = oldconn.state.lock().await;
        let Some(itt) = ost.waiting.pop_front() else {
            drop(ost);
            newconn.free_pdu(new_pid).await;
            break;
        };
        let Some(ccb) = sst.ccbs.get_mut(itt) else {
            drop(ost);
            newconn.free_pdu(new_pid).await;
            continue;
        };
        let Some(old_pid) = ccb.pdu_waiting else {
            drop(ost);
            newconn.free_pdu(new_pid).await;
            continue;
        };
        let Some(opdu) = ost.pdus.take(old_pid) else {
            drop(ost);
            newconn.free_pdu(new_pid).await;
            continue;
        };
        debug_assert!(!opdu.flags.contains(PduFlags::INQUEUE));
        drop(ost);

        {
            let mut nst = newconn.state.lock().await;
            let new_params = nst.params.clone();
            if let Some(npdu) = nst.pdus.get_mut(new_pid) {
                npdu.hdr = opdu.hdr;
                npdu.data = opdu.data;
                npdu.pad = opdu.pad;
                npdu.disp = opdu.disp;
                npdu.flags = opdu.flags & PduFlags::PRIORITY;
                npdu.owner = Some(itt);
                // digest slots follow the new connection's negotiation
                npdu.header_digest_slot = new_params.header_digest;
                npdu.data_digest = (new_params.data_digest && !npdu.data.is_empty())
                    .then(|| crate::models::digest::data_digest(&npdu.data));
            }
            nst.waiting.push_back(itt);
        }

        ccb.pdu_waiting = Some(new_pid);
        ccb.conn_id = newconn.id;
        ccb.num_timeouts = 0;
        oldconn.usecount.fetch_sub(1, Ordering::Relaxed);
        newconn.usecount.fetch_add(1, Ordering::Relaxed);
        moved.push(itt);
        debug!(itt, old = oldconn.id, new = newconn.id, "CCB moved");
    }

    if starved {
        // give up recovering the rest; the ones already moved proceed
        warn!(conn = oldconn.id, "PDU pool exhausted during reassignment");
        wake_all_waiting(&sess, oldconn, old_status).await;
    }

    for itt in moved {
        let mut rc: Result<(), Status> = Ok(());
        if !no_tm {
            rc = send_task_management(&newconn, Some(itt), None, TaskMgmtFunction::TaskReassign)
                .await;
        }
        // on reassign error, restart the original request
        if no_tm || rc.is_err() {
            {
                let mut sst = sess.state.lock().await;
                let exp = sst.window.exp_cmd_sn;
                let stale = sst
                    .ccbs
                    .get(itt)
                    .is_some_and(|c| sna_lt(c.cmd_sn, exp));
                if stale {
                    // the target has already consumed the old number
                    let sn = sst.window.get_sernum(false);
                    let pid = {
                        let Some(ccb) = sst.ccbs.get_mut(itt) else {
                            continue;
                        };
                        debug!(itt, old_sn = ccb.cmd_sn, new_sn = sn, "rewriting CmdSN");
                        ccb.cmd_sn = sn;
                        ccb.pdu_waiting
                    };
                    if let Some(pid) = pid {
                        let mut nst = newconn.state.lock().await;
                        if let Some(pdu) = nst.pdus.get_mut(pid) {
                            pdu.hdr[24..28].copy_from_slice(&sn.to_be_bytes());
                        }
                    }
                }
            }
            resend_pdu(&newconn, itt).await;
        } else {
            arm_command_timer(&sess, &newconn, itt).await;
        }
        debug!(itt, no_tm, ?rc, "reassigned");
    }
}
