mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use iscsi_initiator_core::{
    ConfigAssembler, ConnPhase, Core, Status,
    models::{common::HEADER_LEN, login::LoginRequest, rx::RxPdu},
    negotiate_login, send_login,
};

fn login_response(flags: u8, tsih: u16, itt: u32) -> RxPdu {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = 0x23;
    hdr[1] = flags;
    hdr[14..16].copy_from_slice(&tsih.to_be_bytes());
    hdr[16..20].copy_from_slice(&itt.to_ne_bytes());
    RxPdu::new(hdr, Bytes::new())
}

#[tokio::test]
async fn login_negotiates_through_both_phases() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = sess.add_connection(sock.clone()).await;

    let login_conn = conn.clone();
    let login = tokio::spawn(async move {
        send_login(&login_conn, &ConfigAssembler).await
    });

    // round 1: security keys, transit requested
    let frames = sock.wait_frames(1).await;
    let first = &frames[0];
    assert_eq!(opcode_of(first), 0x03);
    assert!(first[0] & 0x40 != 0, "login is immediate");
    let hdr: &LoginRequest = view(first);
    assert!(hdr.flags.transit());
    assert_eq!(hdr.flags.raw() & 0x0F, 0x01, "CSG security, NSG operational");
    assert_eq!(hdr.tsih.get(), 0, "no TSIH before the target assigns one");
    assert_eq!(hdr.isid, sess.isid);
    let payload = String::from_utf8_lossy(&first[48..]).to_string();
    assert!(payload.contains("InitiatorName=iqn.2004-01.org.example:initiator"));
    assert!(payload.contains("AuthMethod=None"));
    assert_eq!(conn.phase(), ConnPhase::SecurityNegotiation);

    let itt = itt_of(first);
    let cmd_sn = be32(first, 24);

    // target transits us into the operational phase
    negotiate_login(&conn, &login_response(0x81, 0, itt), itt, &ConfigAssembler).await;

    let frames = sock.wait_frames(2).await;
    let second = &frames[1];
    let hdr: &LoginRequest = view(second);
    assert!(hdr.flags.transit());
    assert_eq!(hdr.flags.raw(), 0x87, "CSG operational, NSG full-feature");
    assert_eq!(be32(second, 24), cmd_sn, "immediate login never advances CmdSN");
    let payload = String::from_utf8_lossy(&second[48..]).to_string();
    assert!(payload.contains("MaxRecvDataSegmentLength=8192"));
    assert_eq!(conn.phase(), ConnPhase::OperationalNegotiation);

    // target transits to full feature and assigns the TSIH
    negotiate_login(&conn, &login_response(0x87, 42, itt), itt, &ConfigAssembler).await;

    assert_eq!(login.await.expect("join"), Status::Success);
    assert_eq!(conn.phase(), ConnPhase::FullFeature);
    assert_eq!(sess.tsih().await, 42);
    let committed = conn.params().await;
    assert_eq!(committed.max_transfer, 8192);
    assert!(!committed.header_digest);
}

#[tokio::test]
async fn invalid_stage_fails_the_login() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = sess.add_connection(sock.clone()).await;

    let login_conn = conn.clone();
    let login = tokio::spawn(async move {
        send_login(&login_conn, &ConfigAssembler).await
    });

    let frames = sock.wait_frames(1).await;
    let itt = itt_of(&frames[0]);

    // stage bits 2 are reserved
    negotiate_login(&conn, &login_response(0x82, 0, itt), itt, &ConfigAssembler).await;

    assert_eq!(login.await.expect("join"), Status::TargetError);
    assert_ne!(conn.phase(), ConnPhase::FullFeature);
}
