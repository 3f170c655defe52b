// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Login and text negotiation.
//!
//! The multi-round key=value exchange is driven from the receive path:
//! every login/text response lands in `negotiate_login`/`negotiate_text`
//! against the CCB of the original request, until the target transits
//! the connection into full-feature phase or fails it.
//!
//! The key=value payloads themselves come from a `ParamAssembler`; the
//! built-in `ConfigAssembler` offers the configuration's values and
//! commits them on success. Richer schemes (CHAP, target-driven
//! renegotiation) plug in through the same trait.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    cfg::config::{Config, login_keys_operational, login_keys_security},
    models::{
        login::{LoginRequest, LoginResponse, RawLoginFlags, Stage},
        opcode::Opcode,
        rx::RxPdu,
        text::{TEXT_FINAL, TextRequest, TextResponse},
    },
    session::{
        ccb::{CcbDisp, CcbFlags},
        connection::{ConnParams, ConnPhase, Connection},
        pdu::{PduDisp, PduId},
        recovery::handle_connection_error,
        send::send_pdu,
        session::Session,
    },
    status::{LogoutKind, Status},
};

/// Outcome of a key=value assembly step.
///
/// `Stay` sends the payload without requesting a stage transition,
/// `Transit` requests the transition, `Fail` resolves the login CCB with
/// the given status.
pub enum Assembled {
    Stay(Vec<u8>),
    Transit(Vec<u8>),
    Fail(Status),
}

/// Builds the key=value payloads of the login/text exchange and decides
/// the parameters to commit. The parser for the target's answers lives
/// outside this crate; implementations get the raw response PDU.
pub trait ParamAssembler: Send + Sync + 'static {
    /// Payload of the very first login request.
    fn first_login(&self, cfg: &Config) -> Assembled;

    /// A response arrived while still in the security phase.
    fn security_step(&self, cfg: &Config, rx: &RxPdu) -> Assembled;

    /// A response arrived in the operational phase.
    fn operational_step(&self, cfg: &Config, rx: &RxPdu) -> Assembled;

    /// Payload of a SendTargets text request.
    fn send_targets(&self, key: &str) -> Assembled;

    /// Payload opening an initiator-prompted text negotiation.
    fn text_init(&self, cfg: &Config) -> Assembled;

    /// Parameters in effect once the target transits us to full-feature
    /// phase.
    fn negotiated_params(&self, cfg: &Config, rx: Option<&RxPdu>) -> ConnParams;
}

/// Assembler that offers the configuration's values and assumes the
/// target accepts them. No authentication: the security phase carries
/// identity keys plus `AuthMethod=None` and transits immediately.
#[derive(Debug, Default)]
pub struct ConfigAssembler;

impl ParamAssembler for ConfigAssembler {
    fn first_login(&self, cfg: &Config) -> Assembled {
        Assembled::Transit(login_keys_security(cfg))
    }

    fn security_step(&self, _cfg: &Config, _rx: &RxPdu) -> Assembled {
        // nothing further to offer without an auth scheme
        Assembled::Transit(Vec::new())
    }

    fn operational_step(&self, cfg: &Config, _rx: &RxPdu) -> Assembled {
        Assembled::Transit(login_keys_operational(cfg))
    }

    fn send_targets(&self, key: &str) -> Assembled {
        let mut kv = Vec::with_capacity(key.len() + 13);
        kv.extend_from_slice(b"SendTargets=");
        kv.extend_from_slice(key.as_bytes());
        kv.push(0);
        Assembled::Transit(kv)
    }

    fn text_init(&self, _cfg: &Config) -> Assembled {
        Assembled::Transit(Vec::new())
    }

    fn negotiated_params(&self, cfg: &Config, _rx: Option<&RxPdu>) -> ConnParams {
        let n = &cfg.login;
        let max_transfer = n.flow.max_recv_data_segment_length;
        let first_burst = n.flow.first_burst_length;
        ConnParams {
            header_digest: n.integrity.header_digest.is_crc32c(),
            data_digest: n.integrity.data_digest.is_crc32c(),
            max_transfer,
            max_firstimmed: if n.write_flow.immediate_data.as_bool() {
                first_burst.min(max_transfer)
            } else {
                0
            },
            max_firstdata: if n.write_flow.initial_r2t.as_bool() {
                0
            } else {
                first_burst
            },
        }
    }
}

/// Fill the login BHS: immediate opcode, stage flags, ISID/TSIH, CID,
/// CmdSN, and the key=value payload.
async fn init_login_pdu(
    conn: &Arc<Connection>,
    sess: &Arc<Session>,
    itt: u32,
    pid: PduId,
    csg: Stage,
    next: bool,
    payload: Vec<u8>,
) -> Result<(), Status> {
    let mut sst = sess.state.lock().await;
    let mut cst = conn.state.lock().await;
    let sn = sst.window.get_sernum(true);
    let tsih = sst.tsih;
    if let Some(ccb) = sst.ccbs.get_mut(itt) {
        ccb.cmd_sn = sn;
    }
    let params = cst.params.clone();
    let Some(pdu) = cst.pdus.get_mut(pid) else {
        return Err(Status::ConnectionFailed);
    };
    {
        let hdr: &mut LoginRequest = pdu.hdr_view_mut()?;
        hdr.opcode.set_opcode(Opcode::LoginReq);
        hdr.opcode.set_immediate();
        hdr.flags = RawLoginFlags::compose(csg, next);
        hdr.isid = sess.isid;
        hdr.tsih.set(tsih);
        hdr.cid.set(conn.id);
        hdr.cmd_sn.set(sn);
    }
    let len = payload.len() as u32;
    pdu.setup_tx(len, Bytes::from(payload), &params);
    Ok(())
}

/// Compose and send the initial login request, then block until the
/// negotiation resolves the CCB.
pub async fn send_login(conn: &Arc<Connection>, asm: &dyn ParamAssembler) -> Status {
    let Some(sess) = conn.session.upgrade() else {
        return Status::ConnectionFailed;
    };
    debug!(conn = conn.id, "sending login");

    let Some(itt) = sess.get_ccb(conn, true).await else {
        return conn.terminating_status().await;
    };
    let Some(pid) = conn.get_pdu(true).await else {
        sess.free_ccb(itt).await;
        return conn.terminating_status().await;
    };

    let (payload, next) = match asm.first_login(&conn.config) {
        Assembled::Transit(p) => (p, true),
        Assembled::Stay(p) => (p, false),
        Assembled::Fail(rc) => {
            conn.free_pdu(pid).await;
            sess.free_ccb(itt).await;
            return rc;
        },
    };

    conn.set_phase(ConnPhase::SecurityNegotiation);
    if let Err(rc) = init_login_pdu(conn, &sess, itt, pid, Stage::Security, next, payload).await
    {
        conn.free_pdu(pid).await;
        sess.free_ccb(itt).await;
        return rc;
    }
    send_pdu(conn, Some(itt), pid, CcbDisp::Wait, PduDisp::Free).await;

    let rc = sess.ccb_status(itt).await;
    sess.free_ccb(itt).await;
    rc
}

/// Drive one round of login negotiation from a received login response.
///
/// The stage the exchange is in comes from the response flags: NSG when
/// the target set TRANSIT, CSG otherwise. Reaching full-feature phase
/// adopts the target-assigned TSIH, commits negotiated parameters and
/// wakes the login CCB with success.
pub async fn negotiate_login(
    conn: &Arc<Connection>,
    rx: &RxPdu,
    tx_itt: u32,
    asm: &dyn ParamAssembler,
) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };
    let flags = RawLoginFlags::from_raw(rx.hdr[1]);
    let phase = flags.effective_stage();
    debug!(conn = conn.id, ?flags, ?phase, "login response");

    match phase {
        Some(Stage::FullFeature) => {
            if let Some(resp) = rx.view::<LoginResponse>() {
                let mut sst = sess.state.lock().await;
                if sst.tsih == 0 {
                    sst.tsih = resp.tsih.get();
                }
            }
            let params = asm.negotiated_params(&conn.config, Some(rx));
            conn.commit_negotiated_parameters(params).await;
            debug!(conn = conn.id, "login successful");
            sess.wake_ccb(tx_itt, Status::Success).await;
        },
        Some(stage @ (Stage::Security | Stage::Operational)) => {
            conn.set_phase(match stage {
                Stage::Security => ConnPhase::SecurityNegotiation,
                _ => ConnPhase::OperationalNegotiation,
            });
            let Some(pid) = conn.get_pdu(true).await else {
                return;
            };
            let step = match stage {
                Stage::Security => asm.security_step(&conn.config, rx),
                _ => asm.operational_step(&conn.config, rx),
            };
            match step {
                Assembled::Fail(rc) => {
                    conn.free_pdu(pid).await;
                    sess.wake_ccb(tx_itt, rc).await;
                },
                Assembled::Transit(payload) => {
                    if let Err(rc) =
                        init_login_pdu(conn, &sess, tx_itt, pid, stage, true, payload)
                            .await
                    {
                        conn.free_pdu(pid).await;
                        sess.wake_ccb(tx_itt, rc).await;
                        return;
                    }
                    send_pdu(conn, Some(tx_itt), pid, CcbDisp::Nowait, PduDisp::Free)
                        .await;
                },
                Assembled::Stay(payload) => {
                    if let Err(rc) =
                        init_login_pdu(conn, &sess, tx_itt, pid, stage, false, payload)
                            .await
                    {
                        conn.free_pdu(pid).await;
                        sess.wake_ccb(tx_itt, rc).await;
                        return;
                    }
                    send_pdu(conn, Some(tx_itt), pid, CcbDisp::Nowait, PduDisp::Free)
                        .await;
                },
            }
        },
        None => {
            warn!(conn = conn.id, raw = flags.raw(), "invalid login stage");
            sess.wake_ccb(tx_itt, Status::TargetError).await;
        },
    }
}

/// Fill a text request BHS. When answering an unsolicited/continued
/// exchange, TTT and LUN are echoed from the received response.
async fn init_text_pdu(
    conn: &Arc<Connection>,
    sess: &Arc<Session>,
    itt: u32,
    pid: PduId,
    rx: Option<&RxPdu>,
    payload: Vec<u8>,
) -> Result<(), Status> {
    let mut sst = sess.state.lock().await;
    let mut cst = conn.state.lock().await;
    let sn = sst.window.get_sernum(true);
    if let Some(ccb) = sst.ccbs.get_mut(itt) {
        ccb.cmd_sn = sn;
    }
    let params = cst.params.clone();
    let Some(pdu) = cst.pdus.get_mut(pid) else {
        return Err(Status::ConnectionFailed);
    };
    {
        let hdr: &mut TextRequest = pdu.hdr_view_mut()?;
        hdr.opcode.set_opcode(Opcode::TextReq);
        hdr.opcode.set_immediate();
        hdr.flags = TEXT_FINAL;
        hdr.cmd_sn.set(sn);
        match rx.and_then(|r| r.view::<TextResponse>()) {
            Some(resp) => {
                hdr.target_transfer_tag.set(resp.target_transfer_tag.get());
                hdr.lun.set(resp.lun.get());
            },
            None => {
                hdr.target_transfer_tag.set(0xFFFF_FFFF);
            },
        }
    }
    let len = payload.len() as u32;
    pdu.setup_tx(len, Bytes::from(payload), &params);
    Ok(())
}

/// Handle a received text response against its request CCB.
pub async fn negotiate_text(
    conn: &Arc<Connection>,
    rx: &RxPdu,
    tx_itt: u32,
    asm: &dyn ParamAssembler,
) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };
    let sendtargets = {
        let sst = sess.state.lock().await;
        sst.ccbs
            .get(tx_itt)
            .is_some_and(|c| c.flags.contains(CcbFlags::SENDTARGET))
    };

    if sendtargets {
        if !rx.final_bit() {
            handle_connection_error(conn, Status::ProtocolError, LogoutKind::LogoutConnection)
                .await;
            return;
        }
        // transfer ownership of the accumulated text to the CCB
        {
            let mut sst = sess.state.lock().await;
            if let Some(ccb) = sst.ccbs.get_mut(tx_itt) {
                ccb.text = Some(rx.data.clone());
            }
        }
        sess.wake_ccb(tx_itt, Status::Success).await;
        return;
    }

    let pid = if rx.final_bit() {
        None
    } else {
        conn.get_pdu(true).await
    };
    match asm.operational_step(&conn.config, rx) {
        Assembled::Fail(rc) => {
            if let Some(pid) = pid {
                conn.free_pdu(pid).await;
            }
            handle_connection_error(conn, rc, LogoutKind::LogoutConnection).await;
        },
        Assembled::Transit(payload) | Assembled::Stay(payload) => match pid {
            Some(pid) => {
                if let Err(rc) =
                    init_text_pdu(conn, &sess, tx_itt, pid, Some(rx), payload).await
                {
                    conn.free_pdu(pid).await;
                    handle_connection_error(conn, rc, LogoutKind::LogoutConnection)
                        .await;
                    return;
                }
                send_pdu(conn, Some(tx_itt), pid, CcbDisp::Nowait, PduDisp::Free).await;
            },
            None => {
                let params = asm.negotiated_params(&conn.config, Some(rx));
                conn.commit_negotiated_parameters(params).await;
                sess.wake_ccb(tx_itt, Status::Success).await;
            },
        },
    }
}

/// Acknowledge a CONTINUE-flagged login or text response without
/// advancing the negotiation.
pub async fn acknowledge_text(conn: &Arc<Connection>, rx: &RxPdu, tx_itt: u32) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };
    let Some(pid) = conn.get_pdu(true).await else {
        return;
    };
    let filled = if rx.opcode() == Some(Opcode::LoginResp) {
        let csg = RawLoginFlags::from_raw(rx.hdr[1])
            .csg()
            .unwrap_or(Stage::Security);
        init_login_pdu(conn, &sess, tx_itt, pid, csg, false, Vec::new()).await
    } else {
        init_text_pdu(conn, &sess, tx_itt, pid, Some(rx), Vec::new()).await
    };
    if filled.is_err() {
        conn.free_pdu(pid).await;
        return;
    }
    send_pdu(conn, Some(tx_itt), pid, CcbDisp::Nowait, PduDisp::Free).await;
}

/// Open a text negotiation prompted by the target (async event).
pub async fn start_text_negotiation(conn: &Arc<Connection>, asm: &dyn ParamAssembler) {
    let Some(sess) = conn.session.upgrade() else {
        return;
    };
    let Some(itt) = sess.get_ccb(conn, true).await else {
        return;
    };
    let Some(pid) = conn.get_pdu(true).await else {
        sess.free_ccb(itt).await;
        return;
    };
    match asm.text_init(&conn.config) {
        Assembled::Fail(_) => {
            conn.free_pdu(pid).await;
            sess.free_ccb(itt).await;
        },
        Assembled::Transit(payload) | Assembled::Stay(payload) => {
            if init_text_pdu(conn, &sess, itt, pid, None, payload).await.is_err() {
                conn.free_pdu(pid).await;
                sess.free_ccb(itt).await;
                return;
            }
            send_pdu(conn, Some(itt), pid, CcbDisp::Free, PduDisp::Wait).await;
        },
    }
}

/// Issue a SendTargets text request and hand back the target list text.
pub async fn send_send_targets(
    sess: &Arc<Session>,
    asm: &dyn ParamAssembler,
    key: &str,
) -> (Status, Option<Bytes>) {
    debug!(session = sess.id, key, "send_targets");
    let Some(conn) = sess.assign_connection(true).await else {
        return (Status::ConnectionFailed, None);
    };
    if conn.state.lock().await.terminating.is_some()
        || conn.phase() != ConnPhase::FullFeature
    {
        return (Status::ConnectionFailed, None);
    }

    let Some(itt) = sess.get_ccb(&conn, true).await else {
        return (conn.terminating_status().await, None);
    };
    let Some(pid) = conn.get_pdu(true).await else {
        let rc = conn.terminating_status().await;
        sess.free_ccb(itt).await;
        return (rc, None);
    };

    {
        let mut sst = sess.state.lock().await;
        if let Some(ccb) = sst.ccbs.get_mut(itt) {
            ccb.flags.insert(CcbFlags::SENDTARGET);
        }
    }

    let payload = match asm.send_targets(key) {
        Assembled::Transit(p) | Assembled::Stay(p) => p,
        Assembled::Fail(rc) => {
            conn.free_pdu(pid).await;
            sess.free_ccb(itt).await;
            return (rc, None);
        },
    };

    if let Err(rc) = init_text_pdu(&conn, sess, itt, pid, None, payload).await {
        conn.free_pdu(pid).await;
        sess.free_ccb(itt).await;
        return (rc, None);
    }
    send_pdu(&conn, Some(itt), pid, CcbDisp::Wait, PduDisp::Wait).await;

    let rc = sess.ccb_status(itt).await;
    let text = if rc.is_ok() {
        let mut sst = sess.state.lock().await;
        sst.ccbs.get_mut(itt).and_then(|c| c.text.take())
    } else {
        None
    };
    sess.free_ccb(itt).await;
    (rc, text)
}
