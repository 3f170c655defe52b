// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command and PDU submission: the enqueue contract, the SCSI command
//! path with immediate and unsolicited data, and the small control PDUs
//! (NOP, SNACK, logout, task management).

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    models::{
        command::{CmdFlags, ScsiCommandRequest},
        data_out::{DATA_OUT_FINAL, ScsiDataOut},
        nop::{NOP_FINAL, NopInResponse, NopOutRequest},
        opcode::Opcode,
        r2t::ReadyToTransfer,
        rx::RxPdu,
        snack::{SNACK_FINAL, SnackKind, SnackRequest},
        task::{TASK_FINAL, TaskMgmtFunction, TaskMgmtRequest},
        logout::{LOGOUT_FINAL, LogoutReason, LogoutRequest},
    },
    session::{
        ccb::{CcbDisp, CcbFlags, ScsiXfer, XferResult},
        connection::{ConnPhase, Connection, LogoutProgress},
        pdu::{PduDisp, PduFlags, PduId},
        recovery::{arm_command_timer, handle_connection_error},
        session::Session,
    },
    status::{LogoutKind, Status},
};

/// Synchronous passthrough request, completed in place.
#[derive(Debug, Clone)]
pub struct IoCommand {
    pub lun: u64,
    pub cdb: Vec<u8>,
    pub data_in: bool,
    pub data_len: u32,
    /// Write payload; empty for reads.
    pub data: Bytes,
}

#[derive(Debug)]
pub struct IoResult {
    pub status: Status,
    pub datalen_used: u32,
    pub sense: Option<Bytes>,
}

pub(crate) fn fail_xfer(xfer: ScsiXfer, status: Status) {
    let _ = xfer.done.send(XferResult {
        status,
        residual: xfer.data_len,
        sense: None,
    });
}

/// Queue-insertion half of `send_pdu`, run with both locks held so CmdSN
/// assignment and enqueue stay atomic for callers that need it.
pub(crate) fn send_pdu_locked(
    sst: &mut crate::session::session::SessionState,
    cst: &mut crate::session::connection::ConnState,
    itt: Option<u32>,
    pdu_id: PduId,
    cdisp: CcbDisp,
    pdisp: PduDisp,
) {
    let mut prev = CcbDisp::Unused;
    let priority = {
        let Some(pdu) = cst.pdus.get_mut(pdu_id) else {
            return;
        };
        if let Some(itt) = itt
            && let Some(ccb) = sst.ccbs.get_mut(itt)
        {
            prev = ccb.disp;
            pdu.hdr[16..20].copy_from_slice(&ccb.itt.to_ne_bytes());
            pdu.owner = Some(itt);
            if cdisp != CcbDisp::Nowait {
                ccb.disp = cdisp;
            }
            if pdisp == PduDisp::Wait {
                ccb.pdu_waiting = Some(pdu_id);
            }
        }
        pdu.disp = pdisp;
        if pdisp == PduDisp::Wait {
            pdu.flags.insert(PduFlags::BUSY);
        }
        pdu.flags.insert(PduFlags::INQUEUE);
        pdu.flags.contains(PduFlags::PRIORITY)
    };
    if priority {
        cst.queue.push_front(pdu_id);
    } else {
        cst.queue.push_back(pdu_id);
    }
    if cdisp != CcbDisp::Nowait
        && prev <= CcbDisp::Nowait
        && let Some(itt) = itt
    {
        cst.waiting.push_back(itt);
    }
}

/// After-enqueue half: wake the sender, arm the command timer, and park
/// `Wait`-disposition callers until `wake_ccb` resolves the CCB.
pub(crate) async fn send_pdu_post(
    sess: &Arc<Session>,
    conn: &Arc<Connection>,
    itt: Option<u32>,
    cdisp: CcbDisp,
) {
    conn.sender_wake.notify_one();

    let Some(itt) = itt else {
        return;
    };
    if cdisp == CcbDisp::Nowait {
        return;
    }
    arm_command_timer(sess, conn, itt).await;

    if cdisp == CcbDisp::Wait {
        loop {
            let notified = conn.ccb_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let sst = sess.state.lock().await;
                match sst.ccbs.get(itt) {
                    Some(ccb) if ccb.disp == CcbDisp::Wait => {},
                    _ => break,
                }
            }
            notified.await;
        }
    }
}

/// Enqueue a PDU and handle its disposition and the disposition of its
/// associated CCB.
///
/// With `CcbDisp::Wait` the call parks until `wake_ccb` resolves the
/// CCB, bounded by the command timer. `PduDisp::Wait` retains the PDU on
/// the CCB for retransmission and marks it busy until sent.
pub(crate) async fn send_pdu(
    conn: &Arc<Connection>,
    itt: Option<u32>,
    pdu_id: PduId,
    cdisp: CcbDisp,
    pdisp: PduDisp,
) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };
    {
        let mut sst = sess.state.lock().await;
        let mut cst = conn.state.lock().await;
        send_pdu_locked(&mut sst, &mut cst, itt, pdu_id, cdisp, pdisp);
    }
    send_pdu_post(&sess, conn, itt, cdisp).await;
}

/// Re-enqueue the retained PDU of a CCB after an apparent loss.
/// Idempotent: a PDU that is busy (queued or in the sender's hands) is
/// left alone.
pub async fn resend_pdu(conn: &Arc<Connection>, itt: u32) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };
    {
        let mut sst = sess.state.lock().await;
        let mut cst = conn.state.lock().await;
        let Some(ccb) = sst.ccbs.get_mut(itt) else {
            return;
        };
        let Some(pid) = ccb.pdu_waiting else {
            return;
        };
        let priority = {
            let Some(pdu) = cst.pdus.get_mut(pid) else {
                return;
            };
            if pdu.flags.contains(PduFlags::BUSY) {
                return;
            }
            pdu.flags.insert(PduFlags::BUSY | PduFlags::INQUEUE);
            pdu.flags.contains(PduFlags::PRIORITY)
        };
        debug!(conn = conn.id, itt, "re-enqueueing PDU");
        if priority {
            cst.queue.push_front(pid);
        } else {
            cst.queue.push_back(pid);
        }
    }
    arm_command_timer(&sess, conn, itt).await;
    conn.sender_wake.notify_one();
}

/// Send a SCSI command request for an already populated CCB.
///
/// Fails fast with `QueueFull` when the CmdSN window is closed and with
/// `TargetBusy` outside full-feature phase. Immediate data rides in the
/// command PDU up to `max_firstimmed`; the remaining unsolicited bytes
/// follow as a Data-Out chain.
pub async fn send_command(
    conn: &Arc<Connection>,
    itt: u32,
    disp: CcbDisp,
    waitok: bool,
    immed: bool,
) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };

    {
        let mut sst = sess.state.lock().await;
        if !sst.window.in_window() {
            if let Some(ccb) = sst.ccbs.get_mut(itt) {
                ccb.disp = disp;
            }
            drop(sst);
            debug!(conn = conn.id, itt, "CmdSN window closed");
            sess.wake_ccb(itt, Status::QueueFull).await;
            return;
        }
    }

    // Don't confuse targets during (re-)negotiation.
    if conn.phase() != ConnPhase::FullFeature {
        let mut sst = sess.state.lock().await;
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            ccb.disp = disp;
        }
        drop(sst);
        sess.wake_ccb(itt, Status::TargetBusy).await;
        return;
    }

    let Some(pdu_id) = conn.get_pdu(waitok).await else {
        let mut sst = sess.state.lock().await;
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            ccb.disp = disp;
        }
        drop(sst);
        sess.wake_ccb(itt, Status::NoResources).await;
        return;
    };

    let built = {
        let mut sst = sess.state.lock().await;
        let mut cst = conn.state.lock().await;
        build_command_pdu(&mut sst, &mut cst, conn.id, itt, pdu_id, disp, immed)
    };
    let totlen = match built {
        Ok(totlen) => totlen,
        Err(rc) => {
            conn.free_pdu(pdu_id).await;
            {
                let mut sst = sess.state.lock().await;
                if let Some(ccb) = sst.ccbs.get_mut(itt) {
                    ccb.disp = disp;
                }
            }
            sess.wake_ccb(itt, rc).await;
            return;
        },
    };
    send_pdu_post(
        &sess,
        conn,
        Some(itt),
        if totlen > 0 { CcbDisp::Defer } else { disp },
    )
    .await;

    if totlen > 0 {
        let _ = send_data_out(conn, None, itt, disp, waitok).await;
    }
}

/// Fill the command BHS, stamp the CmdSN and enqueue, all under both
/// locks: CmdSN assignment and enqueue must not be separated, or a
/// concurrent submitter could put a later number on the wire first.
/// Returns the unsolicited byte count still to be sent.
fn build_command_pdu(
    sst: &mut crate::session::session::SessionState,
    cst: &mut crate::session::connection::ConnState,
    conn_id: u16,
    itt: u32,
    pdu_id: PduId,
    disp: CcbDisp,
    immed: bool,
) -> Result<u32, Status> {
    let params = cst.params.clone();
    if cst.pdus.get(pdu_id).is_none() {
        return Err(Status::NoResources);
    }
    if sst.ccbs.get(itt).is_none() {
        return Err(Status::ConnectionFailed);
    }
    let cmd_sn = sst.window.get_sernum(immed);
    let Some(pdu) = cst.pdus.get_mut(pdu_id) else {
        return Err(Status::NoResources);
    };
    let Some(ccb) = sst.ccbs.get_mut(itt) else {
        return Err(Status::ConnectionFailed);
    };

    let datalen = ccb.data_len;
    let mut len = datalen;
    let mut tot = datalen;
    {
        let hdr: &mut ScsiCommandRequest = pdu.hdr_view_mut()?;
        hdr.opcode.set_opcode(Opcode::ScsiCommandReq);
        if immed {
            hdr.opcode.set_immediate();
        }
        hdr.lun.set(ccb.lun);
        hdr.cdb[..ccb.cdb_len].copy_from_slice(&ccb.cdb[..ccb.cdb_len]);
        hdr.expected_data_transfer_length.set(datalen);
        if datalen > 0 {
            if ccb.data_in {
                hdr.flags.set(CmdFlags::READ);
                tot = 0;
            } else {
                hdr.flags.set(CmdFlags::WRITE);
                // immediate data we can send inline
                len = datalen.min(params.max_firstimmed);
                // can we send more unsolicited data?
                tot = if params.max_firstdata > 0 { datalen - len } else { 0 };
            }
        }
        if tot == 0 {
            hdr.flags.set(CmdFlags::FINAL);
        }
        hdr.flags.set_attr(ccb.attr);
        hdr.cmd_sn.set(cmd_sn);
    }

    if ccb.data_in {
        ccb.exp_data_sn = 0;
    }
    ccb.xfer_len = 0;
    ccb.residual = 0;
    ccb.sense = None;
    ccb.flags.insert(CcbFlags::REASSIGN);
    ccb.cmd_sn = cmd_sn;

    debug!(
        conn = conn_id,
        itt,
        cmd_sn,
        data_in = ccb.data_in,
        immediate_len = len,
        unsolicited = tot,
        "sending SCSI command"
    );

    let payload = if !ccb.data_in && len > 0 {
        ccb.data.slice(0..len as usize)
    } else {
        Bytes::new()
    };
    let dsl = if ccb.data_in { 0 } else { len };
    pdu.setup_tx(dsl, payload, &params);

    send_pdu_locked(
        sst,
        cst,
        Some(itt),
        pdu_id,
        if tot > 0 { CcbDisp::Defer } else { disp },
        PduDisp::Wait,
    );
    Ok(tot)
}

/// Emit a Data-Out chain, either R2T-solicited or the unsolicited burst
/// that follows a write command. Each PDU carries at most
/// `max_transfer` bytes; DataSN counts from 0 and FINAL marks the last.
/// Data-Out PDUs are never retained: the target's R2T model drives any
/// replay.
pub async fn send_data_out(
    conn: &Arc<Connection>,
    r2t: Option<&RxPdu>,
    itt: u32,
    disp: CcbDisp,
    waitok: bool,
) -> Result<(), Status> {
    let Some(sess) = conn.session.upgrade() else {
        return Err(Status::ConnectionFailed);
    };

    let (mut offs, mut totlen, ttt, lun, data, params) = {
        let sst = sess.state.lock().await;
        let cst = conn.state.lock().await;
        let Some(ccb) = sst.ccbs.get(itt) else {
            return Err(Status::ConnectionFailed);
        };
        let params = cst.params.clone();
        debug_assert!(params.max_transfer != 0);
        match r2t.and_then(|rx| rx.view::<ReadyToTransfer>()) {
            Some(hdr) => (
                hdr.buffer_offset.get(),
                hdr.desired_data_transfer_length.get(),
                hdr.target_transfer_tag.get(),
                ccb.lun,
                ccb.data.clone(),
                params,
            ),
            None => {
                let offs = params.max_firstimmed;
                let tot = (params.max_firstdata.saturating_sub(offs))
                    .min(ccb.data_len.saturating_sub(offs));
                (
                    offs,
                    tot,
                    ScsiDataOut::DEFAULT_TTT,
                    ccb.lun,
                    ccb.data.clone(),
                    params,
                )
            },
        }
    };

    if offs as usize + totlen as usize > data.len() {
        // target solicited bytes outside the command buffer
        warn!(conn = conn.id, itt, offs, totlen, "R2T outside transfer bounds");
        handle_connection_error(conn, Status::ProtocolError, LogoutKind::LogoutConnection)
            .await;
        return Err(Status::ProtocolError);
    }

    let mut sn = 0u32;
    while totlen > 0 {
        let len = totlen.min(params.max_transfer);

        let Some(pid) = conn.get_pdu(waitok).await else {
            debug!(conn = conn.id, itt, "no PDU for data-out");
            {
                let mut sst = sess.state.lock().await;
                if let Some(ccb) = sst.ccbs.get_mut(itt) {
                    ccb.disp = disp;
                    ccb.status = Status::NoResources;
                }
            }
            handle_connection_error(conn, Status::NoResources, LogoutKind::NoLogout)
                .await;
            return Err(Status::NoResources);
        };

        totlen -= len;
        {
            let mut cst = conn.state.lock().await;
            let Some(pdu) = cst.pdus.get_mut(pid) else {
                return Err(Status::ConnectionFailed);
            };
            {
                let hdr: &mut ScsiDataOut = pdu.hdr_view_mut()?;
                hdr.opcode.set_opcode(Opcode::ScsiDataOut);
                if totlen == 0 {
                    hdr.flags |= DATA_OUT_FINAL;
                }
                hdr.lun.set(lun);
                hdr.target_transfer_tag.set(ttt);
                hdr.buffer_offset.set(offs);
                hdr.data_sn.set(sn);
            }
            debug!(
                conn = conn.id,
                itt, sn, len, offs, remaining = totlen, "sending data-out"
            );
            let chunk = data.slice(offs as usize..(offs + len) as usize);
            pdu.setup_tx(len, chunk, &params);
        }

        send_pdu(
            conn,
            Some(itt),
            pid,
            if totlen > 0 { CcbDisp::Nowait } else { disp },
            PduDisp::Free,
        )
        .await;

        sn += 1;
        offs += len;
    }
    Ok(())
}

/// Upper-stack entry point: pick a connection, bind the transfer to a
/// CCB, and push it through `send_command`. Completion arrives on the
/// transfer's channel, exactly once.
pub async fn send_run_xfer(sess: &Arc<Session>, xfer: ScsiXfer) {
    let waitok = !xfer.no_wait;

    let conn = sess.assign_connection(waitok).await;
    let Some(conn) = conn else {
        fail_xfer(xfer, Status::ConnectionFailed);
        return;
    };
    if conn.state.lock().await.terminating.is_some()
        || conn.phase() != ConnPhase::FullFeature
    {
        debug!(conn = conn.id, "run_xfer on dead connection");
        fail_xfer(xfer, Status::ConnectionFailed);
        return;
    }

    if xfer.reset {
        // completion travels through the transfer channel either way
        let _ = send_task_management(
            &conn,
            None,
            Some(xfer),
            TaskMgmtFunction::TargetWarmReset,
        )
        .await;
        return;
    }

    let Some(base_itt) = sess.get_ccb(&conn, waitok).await else {
        debug!(conn = conn.id, "no CCB for run_xfer");
        fail_xfer(xfer, Status::TargetBusy);
        return;
    };

    let itt = base_itt | ((xfer.tag_id as u32) << 24);
    {
        let mut sst = sess.state.lock().await;
        let Some(ccb) = sst.ccbs.get_mut(base_itt) else {
            drop(sst);
            fail_xfer(xfer, Status::NoResources);
            return;
        };
        ccb.itt = itt;
        ccb.lun = xfer.lun;
        let n = xfer.cdb.len().min(16);
        ccb.cdb[..n].copy_from_slice(&xfer.cdb[..n]);
        ccb.cdb_len = n;
        ccb.data_in = xfer.data_in;
        ccb.data_len = xfer.data_len;
        ccb.data = xfer.data;
        ccb.attr = xfer.attr;
        ccb.done = Some(xfer.done);
    }

    send_command(&conn, itt, CcbDisp::Scsi, waitok, false).await;
}

/// Synchronous passthrough command, optionally pinned to a connection
/// id. Waits for completion and returns the terminal status along with
/// residual accounting.
pub async fn send_io_command(
    sess: &Arc<Session>,
    cmd: IoCommand,
    immed: bool,
    conn_id: Option<u16>,
) -> IoResult {
    let conn = match conn_id {
        Some(cid) => sess.find_connection(cid).await,
        None => sess.assign_connection(true).await,
    };
    let Some(conn) = conn else {
        return IoResult {
            status: Status::InvalidConnectionId,
            datalen_used: 0,
            sense: None,
        };
    };
    if conn.state.lock().await.terminating.is_some()
        || conn.phase() != ConnPhase::FullFeature
    {
        return IoResult {
            status: Status::InvalidConnectionId,
            datalen_used: 0,
            sense: None,
        };
    }

    let Some(itt) = sess.get_ccb(&conn, true).await else {
        return IoResult {
            status: Status::NoResources,
            datalen_used: 0,
            sense: None,
        };
    };

    {
        let mut sst = sess.state.lock().await;
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            ccb.lun = cmd.lun;
            let n = cmd.cdb.len().min(16);
            ccb.cdb[..n].copy_from_slice(&cmd.cdb[..n]);
            ccb.cdb_len = n;
            ccb.data_in = cmd.data_in;
            ccb.data_len = cmd.data_len;
            ccb.data = cmd.data;
        }
    }

    send_command(&conn, itt, CcbDisp::Wait, true, immed).await;

    let (status, residual, sense) = {
        let mut sst = sess.state.lock().await;
        match sst.ccbs.get_mut(itt) {
            Some(ccb) => (ccb.status, ccb.residual, ccb.sense.take()),
            None => (Status::ConnectionFailed, 0, None),
        }
    };
    sess.free_ccb(itt).await;

    IoResult {
        status,
        datalen_used: cmd.data_len.saturating_sub(residual),
        sense,
    }
}

/// Send a NOP-Out: an initiator ping when `rx` is `None`, otherwise the
/// reply to a target NOP-In (echoing its ITT, TTT and LUN).
pub async fn send_nop_out(conn: &Arc<Connection>, rx: Option<&RxPdu>) -> Result<(), Status> {
    let Some(sess) = conn.session.upgrade() else {
        return Err(Status::ConnectionFailed);
    };

    let (ccb_itt, pid) = match rx {
        Some(_) => {
            let Some(pid) = conn.get_pdu(true).await else {
                return Err(Status::NoResources);
            };
            (None, pid)
        },
        None => {
            let Some(itt) = sess.get_ccb(conn, false).await else {
                warn!(conn = conn.id, "can't get CCB for NOP-Out");
                return Err(Status::NoResources);
            };
            let Some(pid) = conn.get_pdu(false).await else {
                warn!(conn = conn.id, "can't get PDU for NOP-Out");
                sess.free_ccb(itt).await;
                return Err(Status::NoResources);
            };
            (Some(itt), pid)
        },
    };

    let sn = {
        let mut sst = sess.state.lock().await;
        let sn = sst.window.get_sernum(true);
        if let Some(itt) = ccb_itt
            && let Some(ccb) = sst.ccbs.get_mut(itt)
        {
            ccb.cmd_sn = sn;
        }
        sn
    };

    {
        let mut cst = conn.state.lock().await;
        let params = cst.params.clone();
        let Some(pdu) = cst.pdus.get_mut(pid) else {
            return Err(Status::ConnectionFailed);
        };
        {
            let hdr: &mut NopOutRequest = pdu.hdr_view_mut()?;
            hdr.opcode.set_opcode(Opcode::NopOut);
            hdr.opcode.set_immediate();
            hdr.flags = NOP_FINAL;
            hdr.cmd_sn.set(sn);
            match rx {
                Some(rx_pdu) => {
                    if let Some(nop_in) = rx_pdu.view::<NopInResponse>() {
                        hdr.target_transfer_tag
                            .set(nop_in.target_transfer_tag.get());
                        hdr.initiator_task_tag = nop_in.initiator_task_tag;
                        hdr.lun.set(nop_in.lun.get());
                    }
                },
                None => {
                    hdr.target_transfer_tag.set(NopOutRequest::DEFAULT_TTT);
                },
            }
        }
        pdu.setup_tx(0, Bytes::new(), &params);
    }

    debug!(conn = conn.id, sn, reply = rx.is_some(), "sending NOP-Out");
    send_pdu(
        conn,
        ccb_itt,
        pid,
        if rx.is_some() {
            CcbDisp::Nowait
        } else {
            CcbDisp::Free
        },
        PduDisp::Free,
    )
    .await;
    Ok(())
}

/// Timeout-driven SNACK covering a whole gap (BegRun/RunLength zero
/// means "everything missing").
pub(crate) async fn snack_missing(
    conn: &Arc<Connection>,
    itt: Option<u32>,
    kind: SnackKind,
    beg_run: u32,
    run_length: u32,
) -> Result<(), Status> {
    let Some(pid) = conn.get_pdu(true).await else {
        return Err(Status::NoResources);
    };
    {
        let mut cst = conn.state.lock().await;
        let params = cst.params.clone();
        let Some(pdu) = cst.pdus.get_mut(pid) else {
            return Err(Status::ConnectionFailed);
        };
        {
            let hdr: &mut SnackRequest = pdu.hdr_view_mut()?;
            hdr.opcode.set_opcode(Opcode::SnackReq);
            hdr.flags = SNACK_FINAL | kind as u8;
            hdr.initiator_task_tag.set(match (kind, itt) {
                (SnackKind::DataNak, Some(itt)) => itt,
                _ => SnackRequest::DEFAULT_TAG,
            });
            hdr.target_transfer_tag.set(SnackRequest::DEFAULT_TAG);
            hdr.beg_run.set(beg_run);
            hdr.run_length.set(run_length);
        }
        pdu.flags.insert(PduFlags::PRIORITY);
        pdu.setup_tx(0, Bytes::new(), &params);
    }
    debug!(conn = conn.id, ?kind, beg_run, run_length, "sending SNACK");
    send_pdu(conn, None, pid, CcbDisp::Nowait, PduDisp::Free).await;
    Ok(())
}

/// Receive-path-driven SNACK built from the PDU that exposed the gap.
pub async fn send_snack(
    conn: &Arc<Connection>,
    rx: &RxPdu,
    tx_itt: Option<u32>,
    kind: SnackKind,
) -> Result<(), Status> {
    let Some(sess) = conn.session.upgrade() else {
        return Err(Status::ConnectionFailed);
    };
    let Some(pid) = conn.get_pdu(true).await else {
        return Err(Status::NoResources);
    };

    // DataAck acknowledges everything below the CCB's DataSN window.
    let exp_data_sn = match (kind, tx_itt) {
        (SnackKind::DataAck, Some(itt)) => {
            let sst = sess.state.lock().await;
            sst.ccbs.get(itt).map(|c| c.exp_data_sn).unwrap_or(0)
        },
        _ => 0,
    };

    {
        let mut cst = conn.state.lock().await;
        let params = cst.params.clone();
        let Some(pdu) = cst.pdus.get_mut(pid) else {
            return Err(Status::ConnectionFailed);
        };
        {
            let hdr: &mut SnackRequest = pdu.hdr_view_mut()?;
            hdr.opcode.set_opcode(Opcode::SnackReq);
            hdr.flags = SNACK_FINAL | kind as u8;
            hdr.lun.set(u64::from_be_bytes([
                rx.hdr[8], rx.hdr[9], rx.hdr[10], rx.hdr[11], rx.hdr[12], rx.hdr[13],
                rx.hdr[14], rx.hdr[15],
            ]));
            match kind {
                SnackKind::DataNak => {
                    hdr.initiator_task_tag.set(rx.initiator_task_tag());
                    hdr.target_transfer_tag.set(SnackRequest::DEFAULT_TAG);
                    // DataSN of the PDU that revealed the gap
                    hdr.beg_run.set(u32::from_be_bytes([
                        rx.hdr[36], rx.hdr[37], rx.hdr[38], rx.hdr[39],
                    ]));
                    hdr.run_length.set(1);
                },
                SnackKind::StatusNak => {
                    hdr.initiator_task_tag.set(SnackRequest::DEFAULT_TAG);
                    hdr.target_transfer_tag.set(SnackRequest::DEFAULT_TAG);
                    // StatSN of the missing response
                    hdr.beg_run.set(u32::from_be_bytes([
                        rx.hdr[24], rx.hdr[25], rx.hdr[26], rx.hdr[27],
                    ]));
                    hdr.run_length.set(1);
                },
                SnackKind::DataAck => {
                    hdr.initiator_task_tag.set(SnackRequest::DEFAULT_TAG);
                    hdr.target_transfer_tag.set(u32::from_be_bytes([
                        rx.hdr[20], rx.hdr[21], rx.hdr[22], rx.hdr[23],
                    ]));
                    hdr.beg_run.set(exp_data_sn);
                    hdr.run_length.set(0);
                },
            }
        }
        pdu.flags.insert(PduFlags::PRIORITY);
        pdu.setup_tx(0, Bytes::new(), &params);
    }
    send_pdu(conn, None, pid, CcbDisp::Nowait, PduDisp::Free).await;
    Ok(())
}

/// Send a logout request on `conn`. `refconn` names the connection being
/// logged out when it is not `conn` itself (cross-connection recovery).
pub async fn send_logout(
    conn: &Arc<Connection>,
    refconn: Option<&Arc<Connection>>,
    reason: LogoutReason,
    wait: bool,
) -> Result<(), Status> {
    let Some(sess) = conn.session.upgrade() else {
        return Err(Status::ConnectionFailed);
    };
    debug!(conn = conn.id, ?reason, "sending logout");

    let Some(itt) = sess.get_ccb(conn, true).await else {
        return Err(conn.terminating_status().await);
    };
    let Some(pid) = conn.get_pdu(true).await else {
        sess.free_ccb(itt).await;
        return Err(conn.terminating_status().await);
    };

    let other = refconn.is_some_and(|rc| rc.id != conn.id);
    {
        let mut sst = sess.state.lock().await;
        let mut cst = conn.state.lock().await;
        let sn = sst.window.get_sernum(true);
        let ref_cid = refconn.map(|rc| rc.id).unwrap_or(conn.id);
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            ccb.cmd_sn = sn;
            if other {
                ccb.flags.insert(CcbFlags::OTHERCONN);
            }
        }
        let params = cst.params.clone();
        let Some(pdu) = cst.pdus.get_mut(pid) else {
            return Err(Status::ConnectionFailed);
        };
        {
            let hdr: &mut LogoutRequest = pdu.hdr_view_mut()?;
            hdr.opcode.set_opcode(Opcode::LogoutReq);
            hdr.opcode.set_immediate();
            hdr.flags = LOGOUT_FINAL | reason as u8;
            hdr.cmd_sn.set(sn);
            if reason.references_cid() {
                hdr.cid.set(ref_cid);
            }
        }
        pdu.setup_tx(0, Bytes::new(), &params);
        if !other {
            cst.loggedout = LogoutProgress::Sent;
        }
    }
    if !other {
        conn.set_phase(ConnPhase::LogoutSent);
    }

    send_pdu(
        conn,
        Some(itt),
        pid,
        if wait { CcbDisp::Wait } else { CcbDisp::Free },
        PduDisp::Free,
    )
    .await;

    if wait {
        let rc = sess.ccb_status(itt).await;
        sess.free_ccb(itt).await;
        if rc.is_ok() { Ok(()) } else { Err(rc) }
    } else {
        Ok(())
    }
}

/// Send a task management request. `ref_itt` names the referenced task
/// for task-scoped functions; `xfer` carries an upper-stack reset whose
/// completion travels through the transfer channel.
pub async fn send_task_management(
    conn: &Arc<Connection>,
    ref_itt: Option<u32>,
    xfer: Option<ScsiXfer>,
    function: TaskMgmtFunction,
) -> Result<(), Status> {
    let Some(sess) = conn.session.upgrade() else {
        if let Some(xfer) = xfer {
            fail_xfer(xfer, Status::ConnectionFailed);
        }
        return Err(Status::ConnectionFailed);
    };

    if function == TaskMgmtFunction::TaskReassign {
        let level = sess.state.lock().await.recovery_level;
        if level < 2 {
            if let Some(xfer) = xfer {
                fail_xfer(xfer, Status::CantReassign);
            }
            return Err(Status::CantReassign);
        }
    }

    let have_xfer = xfer.is_some();
    let Some(itt) = sess.get_ccb(conn, !have_xfer).await else {
        let rc = conn.terminating_status().await;
        if let Some(xfer) = xfer {
            fail_xfer(xfer, rc);
        }
        return Err(rc);
    };
    let Some(pid) = conn.get_pdu(!have_xfer).await else {
        let rc = conn.terminating_status().await;
        sess.free_ccb(itt).await;
        if let Some(xfer) = xfer {
            fail_xfer(xfer, rc);
        }
        return Err(rc);
    };

    {
        let mut sst = sess.state.lock().await;
        let mut cst = conn.state.lock().await;
        let sn = sst.window.get_sernum(true);
        let referenced = ref_itt.and_then(|r| {
            sst.ccbs
                .get(r)
                .map(|c| (c.itt, c.cmd_sn, c.exp_data_sn, c.lun))
        });
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            ccb.cmd_sn = sn;
            if let Some(x) = xfer {
                ccb.lun = x.lun;
                ccb.done = Some(x.done);
            }
        }
        let params = cst.params.clone();
        let Some(pdu) = cst.pdus.get_mut(pid) else {
            return Err(Status::ConnectionFailed);
        };
        {
            let hdr: &mut TaskMgmtRequest = pdu.hdr_view_mut()?;
            hdr.opcode.set_opcode(Opcode::ScsiTaskMgmtReq);
            hdr.opcode.set_immediate();
            hdr.flags = TASK_FINAL | function as u8;
            hdr.cmd_sn.set(sn);
            match referenced {
                Some((ref_tag, ref_sn, exp_data_sn, lun)) => {
                    hdr.referenced_task_tag.set(ref_tag);
                    hdr.ref_cmd_sn.set(ref_sn);
                    hdr.exp_data_sn.set(exp_data_sn);
                    hdr.lun.set(lun);
                },
                None => {
                    hdr.referenced_task_tag.set(TaskMgmtRequest::DEFAULT_REF_TAG);
                },
            }
        }
        pdu.flags.insert(PduFlags::PRIORITY);
        pdu.setup_tx(0, Bytes::new(), &params);
    }

    debug!(conn = conn.id, ?function, ?ref_itt, "sending task management");
    send_pdu(
        conn,
        Some(itt),
        pid,
        if have_xfer { CcbDisp::Scsi } else { CcbDisp::Wait },
        PduDisp::Free,
    )
    .await;

    if have_xfer {
        Ok(())
    } else {
        let rc = sess.ccb_status(itt).await;
        sess.free_ccb(itt).await;
        if rc.is_ok() { Ok(()) } else { Err(rc) }
    }
}
