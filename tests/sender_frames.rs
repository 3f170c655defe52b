mod common;

use std::sync::Arc;

use common::*;
use iscsi_initiator_core::{
    Core, ScsiXfer, Status,
    models::digest::header_digest,
    models::nop::NopOutRequest,
    resend_pdu, send_nop_out, send_run_xfer,
};

#[tokio::test]
async fn header_digest_adds_exactly_four_bytes() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = full_feature_conn(&sess, sock.clone(), params(true, false, 8192, 0, 0)).await;

    send_nop_out(&conn, None).await.expect("nop-out");

    let frames = sock.wait_frames(1).await;
    let frame = &frames[0];
    assert_eq!(frame.len(), 52, "BHS + header digest, nothing else");
    assert_eq!(opcode_of(frame), 0x00);
    assert!(frame[0] & 0x40 != 0, "NOP-Out ping is immediate");

    let mut bhs = [0u8; 48];
    bhs.copy_from_slice(&frame[..48]);
    let wire_digest = be32(frame, 48);
    assert_eq!(wire_digest, header_digest(&bhs));

    let hdr: &NopOutRequest = view(frame);
    assert_eq!(hdr.target_transfer_tag.get(), NopOutRequest::DEFAULT_TTT);
}

#[tokio::test]
async fn exp_stat_sn_is_stamped_at_transmission() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    conn.update_exp_stat_sn(77);
    let (xfer, _rx) = ScsiXfer::read(0, vec![0x28; 16], 512);
    send_run_xfer(&sess, xfer).await;

    let frames = sock.wait_frames(1).await;
    assert_eq!(be32(&frames[0], 28), 77, "ExpStatSN mirrors the target's StatSN");
}

#[tokio::test]
async fn resend_is_idempotent_while_busy() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    let (xfer, _rx) = ScsiXfer::read(0, vec![0x28; 16], 512);
    send_run_xfer(&sess, xfer).await;
    let frames = sock.wait_frames(1).await;
    let itt = itt_of(&frames[0]);

    // hold the sender inside the socket write, then ask twice
    sock.close_gate();
    resend_pdu(&conn, itt).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    resend_pdu(&conn, itt).await;
    sock.open_gate();

    let frames = sock.wait_frames(2).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(
        sock.frames().len(),
        2,
        "second resend must be a no-op while the PDU is busy"
    );

    // retransmission reproduces the original bytes
    assert_eq!(frames[0], frames[1]);

    sess.wake_ccb(itt, Status::Success).await;
}

#[tokio::test]
async fn frames_preserve_fifo_order_per_connection() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let _conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    for lba in 0..8u64 {
        let mut cdb = vec![0u8; 16];
        cdb[0] = 0x88;
        cdb[2..10].copy_from_slice(&lba.to_be_bytes());
        let (xfer, _rx) = ScsiXfer::read(0, cdb, 512);
        send_run_xfer(&sess, xfer).await;
    }

    let frames = sock.wait_frames(8).await;
    let lbas: Vec<u64> = frames
        .iter()
        .map(|f| u64::from_be_bytes([f[34], f[35], f[36], f[37], f[38], f[39], f[40], f[41]]))
        .collect();
    assert_eq!(lbas, (0..8).collect::<Vec<u64>>());
}
