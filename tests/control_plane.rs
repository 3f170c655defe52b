mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use iscsi_initiator_core::{
    ConfigAssembler, Core, IoCommand, Status,
    cfg::{config::Config, enums::Digest, logger},
    models::{common::HEADER_LEN, nop::NopOutRequest, rx::RxPdu, text::TextRequest},
    negotiate_text, send_io_command, send_nop_out, send_send_targets,
};
use serial_test::serial;

#[test]
fn config_loads_from_yaml() {
    let cfg = Config::load_from_file("tests/config.yaml").expect("load config");
    assert_eq!(cfg.login.integrity.header_digest, Digest::CRC32C);
    assert_eq!(cfg.login.flow.max_recv_data_segment_length, 8192);
    assert_eq!(cfg.login.limits.max_connections, 2);
    assert_eq!(cfg.runtime.command_timeout.as_secs(), 30);
    assert!(cfg.login.write_flow.immediate_data.as_bool());
}

#[test]
#[serial]
fn logger_initializes_once() {
    let cfg = logger::LoggerConfig {
        level: "info".into(),
        output: logger::Output::Stderr,
        file: None,
    };
    let guard = logger::init_logger(&cfg).expect("logger");
    tracing::info!(check = true, "logger smoke test");
    drop(guard);
}

#[tokio::test]
async fn io_command_waits_for_completion() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let _conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    let io_sess = sess.clone();
    let io = tokio::spawn(async move {
        send_io_command(
            &io_sess,
            IoCommand {
                lun: 1 << 48,
                cdb: vec![0x12, 0, 0, 0, 96, 0],
                data_in: true,
                data_len: 96,
                data: Bytes::new(),
            },
            false,
            None,
        )
        .await
    });

    let frames = sock.wait_frames(1).await;
    assert_eq!(opcode_of(&frames[0]), 0x01);
    sess.wake_ccb(itt_of(&frames[0]), Status::Success).await;

    let result = io.await.expect("join");
    assert_eq!(result.status, Status::Success);
    assert_eq!(result.datalen_used, 96, "no residual reported");
}

#[tokio::test]
async fn io_command_rejects_unknown_connection_id() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let _conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    let result = send_io_command(
        &sess,
        IoCommand {
            lun: 0,
            cdb: vec![0x00; 6],
            data_in: false,
            data_len: 0,
            data: Bytes::new(),
        },
        false,
        Some(99),
    )
    .await;
    assert_eq!(result.status, Status::InvalidConnectionId);
}

#[tokio::test]
async fn send_targets_hands_back_the_target_list() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    let st_sess = sess.clone();
    let request = tokio::spawn(async move {
        send_send_targets(&st_sess, &ConfigAssembler, "All").await
    });

    let frames = sock.wait_frames(1).await;
    let frame = &frames[0];
    assert_eq!(opcode_of(frame), 0x04);
    let hdr: &TextRequest = view(frame);
    assert_eq!(hdr.target_transfer_tag.get(), 0xFFFF_FFFF);
    assert_eq!(&frame[48..], b"SendTargets=All\0");

    let answer = b"TargetName=iqn.2004-01.org.example:target0\0TargetAddress=10.0.0.9:3260,1\0";
    let mut hdr_bytes = [0u8; HEADER_LEN];
    hdr_bytes[0] = 0x24;
    hdr_bytes[1] = 0x80; // final
    hdr_bytes[16..20].copy_from_slice(&itt_of(frame).to_ne_bytes());
    let rx = RxPdu::new(hdr_bytes, Bytes::from_static(answer));
    negotiate_text(&conn, &rx, itt_of(frame), &ConfigAssembler).await;

    let (status, text) = request.await.expect("join");
    assert_eq!(status, Status::Success);
    assert_eq!(text.as_deref(), Some(&answer[..]));
}

#[tokio::test]
async fn nop_in_reply_echoes_tags_and_lun() {
    let (core, _events) = Core::new();
    let sess = core.create_session(Arc::new(test_config()));
    let sock = LoopbackSocket::new();
    let conn = full_feature_conn(&sess, sock.clone(), params(false, false, 8192, 0, 0)).await;

    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = 0x20; // NOP-In
    hdr[1] = 0x80;
    hdr[8] = 0x00;
    hdr[9] = 0x01; // LUN
    hdr[16..20].copy_from_slice(&0x99u32.to_ne_bytes());
    hdr[20..24].copy_from_slice(&5u32.to_be_bytes()); // TTT demands a reply
    let rx = RxPdu::new(hdr, Bytes::new());

    send_nop_out(&conn, Some(&rx)).await.expect("nop reply");

    let frames = sock.wait_frames(1).await;
    let out: &NopOutRequest = view(&frames[0]);
    assert_eq!(opcode_of(&frames[0]), 0x00);
    assert_eq!(out.target_transfer_tag.get(), 5);
    assert_eq!(out.initiator_task_tag.get(), 0x99);
    assert_eq!(out.lun.get(), 0x0001_0000_0000_0000);
    assert_eq!(
        sess.sn_window().await.cmd_sn,
        1,
        "the reply is immediate and consumes no CmdSN"
    );
}
