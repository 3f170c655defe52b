#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use iscsi_initiator_core::{
    ConnParams, Connection, Session,
    cfg::{
        config::{
            Config, Flow, Identity, Limits, LoginConfig, Integrity, Recovery,
            RuntimeConfig, Timers, WriteFlow,
        },
        enums::{Digest, SessionType, YesNo},
    },
    models::common::{Bhs, HEADER_LEN},
    transport::{SendFuture, WireFrame, WireSocket},
};
use tokio::time::{Instant, sleep};
use zerocopy::FromBytes;

/// In-memory `WireSocket` capturing every transmitted frame. Writes can
/// be gated (to hold the sender mid-transmission) or failed outright.
pub struct LoopbackSocket {
    frames: Mutex<Vec<Vec<u8>>>,
    gate_closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl LoopbackSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            gate_closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().expect("frames lock").clone()
    }

    /// Hold the sender inside `send_frame` until the gate reopens.
    pub fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Wait until at least `n` frames were captured, panicking after two
    /// seconds.
    pub async fn wait_frames(&self, n: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let frames = self.frames();
            if frames.len() >= n {
                return frames;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {n} frames, have {}",
                frames.len()
            );
            sleep(Duration::from_millis(5)).await;
        }
    }
}

impl WireSocket for LoopbackSocket {
    fn send_frame<'a>(&'a self, frame: &'a WireFrame) -> SendFuture<'a> {
        Box::pin(async move {
            while self.gate_closed.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(2)).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "loopback failure",
                ));
            }
            self.frames
                .lock()
                .expect("frames lock")
                .push(frame.to_bytes());
            Ok(())
        })
    }

    fn shutdown(&self) {}
}

/// Baseline configuration with timers long enough not to interfere;
/// tests override what they exercise.
pub fn test_config() -> Config {
    Config {
        login: LoginConfig {
            identity: Identity {
                session_type: SessionType::Normal,
                initiator_name: "iqn.2004-01.org.example:initiator".into(),
                initiator_alias: String::new(),
                target_name: "iqn.2004-01.org.example:target0".into(),
            },
            integrity: Integrity {
                header_digest: Digest::None,
                data_digest: Digest::None,
            },
            flow: Flow {
                max_recv_data_segment_length: 8192,
                max_burst_length: 262_144,
                first_burst_length: 65_536,
            },
            write_flow: WriteFlow {
                initial_r2t: YesNo::No,
                immediate_data: YesNo::Yes,
            },
            recovery: Recovery {
                error_recovery_level: 1,
            },
            timers: Timers {
                default_time2wait: Duration::ZERO,
                default_time2retain: Duration::from_secs(20),
            },
            limits: Limits { max_connections: 2 },
        },
        runtime: RuntimeConfig {
            command_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
            connection_idle_timeout: Duration::from_millis(200),
            max_conn_timeouts: 4,
            max_ccb_timeouts: 10,
            max_ccb_tries: 4,
            ccbs_per_session: 64,
            pdus_per_connection: 64,
        },
    }
}

pub fn params(
    header_digest: bool,
    data_digest: bool,
    max_transfer: u32,
    max_firstimmed: u32,
    max_firstdata: u32,
) -> ConnParams {
    ConnParams {
        header_digest,
        data_digest,
        max_transfer,
        max_firstimmed,
        max_firstdata,
    }
}

/// Attach a connection, drive it straight to full-feature phase and
/// open the CmdSN window wide.
pub async fn full_feature_conn(
    sess: &Arc<Session>,
    sock: Arc<LoopbackSocket>,
    p: ConnParams,
) -> Arc<Connection> {
    let conn = sess.add_connection(sock).await;
    conn.commit_negotiated_parameters(p).await;
    sess.update_sn_window(1, 1000).await;
    conn
}

// ── frame inspection ─────────────────────────────────────────────────

pub fn opcode_of(frame: &[u8]) -> u8 {
    frame[0] & 0x3F
}

pub fn flags_of(frame: &[u8]) -> u8 {
    frame[1]
}

pub fn itt_of(frame: &[u8]) -> u32 {
    u32::from_ne_bytes([frame[16], frame[17], frame[18], frame[19]])
}

pub fn be32(frame: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]])
}

pub fn dsl_of(frame: &[u8]) -> usize {
    u32::from_be_bytes([0, frame[5], frame[6], frame[7]]) as usize
}

/// Typed view over a captured frame's BHS.
pub fn view<T: Bhs>(frame: &[u8]) -> &T {
    T::ref_from_bytes(&frame[..HEADER_LEN]).expect("48-byte header view")
}
