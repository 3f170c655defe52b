mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use iscsi_initiator_core::{
    Core, ScsiXfer, Status,
    models::command::ScsiCommandRequest,
    models::data_out::ScsiDataOut,
    send_run_xfer,
};

const FLAG_FINAL: u8 = 0x80;
const FLAG_READ: u8 = 0x40;
const FLAG_WRITE: u8 = 0x20;

fn read16_cdb(lba: u64, blocks: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; 16];
    cdb[0] = 0x88;
    cdb[2..10].copy_from_slice(&lba.to_be_bytes());
    cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

#[tokio::test]
async fn read_command_is_single_final_pdu() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    // digests off, no immediate data
    let _conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    let (xfer, rx) = ScsiXfer::read(0, read16_cdb(0x1234, 8), 4096);
    send_run_xfer(&sess, xfer).await;

    let frames = sock.wait_frames(1).await;
    assert_eq!(frames.len(), 1, "a read emits exactly one PDU");
    let frame = &frames[0];
    assert_eq!(frame.len(), 48, "no data segment, no digests");
    assert_eq!(opcode_of(frame), 0x01);
    assert_eq!(flags_of(frame) & (FLAG_FINAL | FLAG_READ), FLAG_FINAL | FLAG_READ);
    let hdr: &ScsiCommandRequest = view(frame);
    assert_eq!(hdr.expected_data_transfer_length.get(), 4096);
    assert_eq!(hdr.data_segment_length, [0, 0, 0]);
    assert_eq!(hdr.cdb[0], 0x88);

    // fake receive path: status arrives, CCB resolves exactly once
    sess.wake_ccb(itt_of(frame), Status::Success).await;
    let result = rx.await.expect("completion");
    assert_eq!(result.status, Status::Success);

    // a second wake for the same tag must be a no-op
    sess.wake_ccb(itt_of(frame), Status::Timeout).await;
}

#[tokio::test]
async fn write_emits_immediate_then_unsolicited_chain() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    // 1 KiB inline, 8 KiB unsolicited total, 4 KiB per data-out
    let _conn =
        full_feature_conn(&sess, sock.clone(), params(false, false, 4096, 1024, 8192)).await;

    let payload: Bytes = (0..10240u32).map(|i| i as u8).collect::<Vec<u8>>().into();
    let (xfer, rx) = ScsiXfer::write(0, vec![0x8A; 16], payload.clone());
    send_run_xfer(&sess, xfer).await;

    let frames = sock.wait_frames(3).await;
    assert_eq!(frames.len(), 3);

    let cmd = &frames[0];
    assert_eq!(opcode_of(cmd), 0x01);
    assert_eq!(flags_of(cmd) & FLAG_WRITE, FLAG_WRITE);
    assert_eq!(flags_of(cmd) & FLAG_FINAL, 0, "unsolicited data follows");
    assert_eq!(dsl_of(cmd), 1024, "immediate data rides in the command");
    assert_eq!(&cmd[48..48 + 1024], &payload[..1024]);

    let d0: &ScsiDataOut = view(&frames[1]);
    assert_eq!(opcode_of(&frames[1]), 0x05);
    assert_eq!(d0.data_sn.get(), 0);
    assert_eq!(d0.buffer_offset.get(), 1024);
    assert_eq!(dsl_of(&frames[1]), 4096);
    assert_eq!(flags_of(&frames[1]) & FLAG_FINAL, 0);
    assert_eq!(&frames[1][48..48 + 4096], &payload[1024..5120]);

    let d1: &ScsiDataOut = view(&frames[2]);
    assert_eq!(d1.data_sn.get(), 1);
    assert_eq!(d1.buffer_offset.get(), 5120);
    assert_eq!(dsl_of(&frames[2]), 3072, "unsolicited burst stops at FirstBurstLength");
    assert_eq!(flags_of(&frames[2]) & FLAG_FINAL, FLAG_FINAL);
    assert_eq!(&frames[2][48..48 + 3072], &payload[5120..8192]);

    sess.wake_ccb(itt_of(cmd), Status::Success).await;
    assert_eq!(rx.await.expect("completion").status, Status::Success);
}

#[tokio::test]
async fn exact_first_burst_write_emits_one_data_out() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let _conn =
        full_feature_conn(&sess, sock.clone(), params(false, false, 4096, 1024, 4096)).await;

    let payload: Bytes = vec![0xA5u8; 5120].into();
    let (xfer, _rx) = ScsiXfer::write(0, vec![0x8A; 16], payload);
    send_run_xfer(&sess, xfer).await;

    let frames = sock.wait_frames(2).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(dsl_of(&frames[0]), 1024);
    let d0: &ScsiDataOut = view(&frames[1]);
    assert_eq!(dsl_of(&frames[1]), 3072);
    assert_eq!(d0.buffer_offset.get(), 1024);
    assert_eq!(flags_of(&frames[1]) & FLAG_FINAL, FLAG_FINAL);
}

#[tokio::test]
async fn data_out_chunks_split_at_max_transfer() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    // no immediate data: the whole burst goes out as data-out PDUs
    let n = 1000u32;
    let _conn =
        full_feature_conn(&sess, sock.clone(), params(false, false, n, 0, 16384)).await;

    let payload: Bytes = vec![0x5Au8; (2 * n + 1) as usize].into();
    let (xfer, _rx) = ScsiXfer::write(0, vec![0x8A; 16], payload);
    send_run_xfer(&sess, xfer).await;

    let frames = sock.wait_frames(4).await;
    assert_eq!(frames.len(), 4, "command + three data-out PDUs");
    let sizes: Vec<usize> = frames[1..].iter().map(|f| dsl_of(f)).collect();
    assert_eq!(sizes, vec![n as usize, n as usize, 1]);
    for (i, frame) in frames[1..].iter().enumerate() {
        let hdr: &ScsiDataOut = view(frame);
        assert_eq!(hdr.data_sn.get(), i as u32);
    }
    assert_eq!(flags_of(&frames[1]) & FLAG_FINAL, 0);
    assert_eq!(flags_of(&frames[2]) & FLAG_FINAL, 0);
    assert_eq!(flags_of(&frames[3]) & FLAG_FINAL, FLAG_FINAL);
}

#[tokio::test]
async fn closed_window_fails_fast_with_queue_full() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = sess.add_connection(sock.clone()).await;
    conn.commit_negotiated_parameters(params(false, false, 8192, 0, 0)).await;
    // window untouched: CmdSN=1, MaxCmdSN=2 → room for exactly two

    let (x1, _rx1) = ScsiXfer::read(0, read16_cdb(0, 1), 0);
    let (x2, _rx2) = ScsiXfer::read(0, read16_cdb(1, 1), 0);
    let (x3, rx3) = ScsiXfer::read(0, read16_cdb(2, 1), 0);
    send_run_xfer(&sess, x1).await;
    send_run_xfer(&sess, x2).await;
    send_run_xfer(&sess, x3).await;

    let result = rx3.await.expect("completion");
    assert_eq!(result.status, Status::QueueFull);

    let frames = sock.wait_frames(2).await;
    assert_eq!(frames.len(), 2, "the rejected command must not reach the wire");
}

#[tokio::test]
async fn zero_length_command_is_final_without_data_out() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let _conn =
        full_feature_conn(&sess, sock.clone(), params(false, false, 4096, 1024, 8192)).await;

    let (xfer, _rx) = ScsiXfer::write(0, vec![0x00; 6], Bytes::new());
    send_run_xfer(&sess, xfer).await;

    let frames = sock.wait_frames(1).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let frames_after = sock.frames();
    assert_eq!(frames_after.len(), frames.len(), "no data-out follow-up");
    assert_eq!(flags_of(&frames[0]) & FLAG_FINAL, FLAG_FINAL);
    assert_eq!(dsl_of(&frames[0]), 0);
}
