// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The byte-stream seam between the send engine and the transport.
//!
//! The core only ever needs one thing from a socket: a blocking
//! scatter-gather write of a fully assembled PDU frame. Everything else
//! (connect, read loop, framing of inbound PDUs) belongs to the receive
//! path and stays outside this crate's core.

use std::{future::Future, io, pin::Pin, sync::Arc};

use bytes::Bytes;
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, sync::Mutex};
use tokio_util::sync::CancellationToken;

use crate::models::common::HEADER_LEN;

/// Shared all-zero pad source, at most 3 bytes of it are ever sent.
pub(crate) const PAD_BYTES: [u8; 4] = [0u8; 4];

/// One fully assembled PDU transmission: header, optional header digest,
/// borrowed data, pad to 4-byte alignment, optional data digest.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub hdr: [u8; HEADER_LEN],
    pub header_digest: Option<u32>,
    pub data: Bytes,
    pub pad: usize,
    pub data_digest: Option<u32>,
}

impl WireFrame {
    /// Total number of bytes this frame puts on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN
            + self.header_digest.map_or(0, |_| 4)
            + self.data.len()
            + self.pad
            + self.data_digest.map_or(0, |_| 4)
    }

    /// Flatten into a single buffer. Used by in-memory sockets and tests;
    /// real transports should prefer `segments`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.hdr);
        if let Some(hd) = self.header_digest {
            out.extend_from_slice(&hd.to_be_bytes());
        }
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&PAD_BYTES[..self.pad]);
        if let Some(dd) = self.data_digest {
            out.extend_from_slice(&dd.to_be_bytes());
        }
        out
    }
}

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// An ordered reliable byte stream the sender writes PDU frames to.
///
/// Exactly one sender task calls `send_frame` at a time (per connection);
/// implementations do not need to tolerate interleaved frames.
pub trait WireSocket: Send + Sync + 'static {
    /// Write the whole frame or fail. A short write is an error.
    fn send_frame<'a>(&'a self, frame: &'a WireFrame) -> SendFuture<'a>;

    /// Tear the transport down so the external receive loop unblocks.
    /// Idempotent and best-effort.
    fn shutdown(&self);
}

/// `WireSocket` over the write half of a `tokio::net::TcpStream`.
///
/// The cancellation token is shared with the external read loop; cancelling
/// it is this crate's equivalent of shutting the socket down for read and
/// write.
pub struct TcpWireSocket {
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl TcpWireSocket {
    pub fn new(writer: OwnedWriteHalf, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
            cancel,
        })
    }
}

impl WireSocket for TcpWireSocket {
    fn send_frame<'a>(&'a self, frame: &'a WireFrame) -> SendFuture<'a> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "cancelled"));
            }
            let mut w = self.writer.lock().await;
            w.write_all(&frame.hdr).await?;
            if let Some(hd) = frame.header_digest {
                w.write_all(&hd.to_be_bytes()).await?;
            }
            if !frame.data.is_empty() {
                w.write_all(&frame.data).await?;
                if frame.pad != 0 {
                    w.write_all(&PAD_BYTES[..frame.pad]).await?;
                }
                if let Some(dd) = frame.data_digest {
                    w.write_all(&dd.to_be_bytes()).await?;
                }
            }
            w.flush().await
        })
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
