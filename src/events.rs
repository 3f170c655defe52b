// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Out-of-band notifications for the management layer.
//!
//! The core never blocks on the consumer: events go through an unbounded
//! channel and are dropped once the receiver is gone.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The connection is gone for good.
    ConnectionTerminated,
    /// The connection died but the session may recover it.
    RecoverConnection,
}

#[derive(Debug, Clone, Copy)]
pub struct CoreEvent {
    pub kind: EventKind,
    pub session: u16,
    pub connection: u16,
    pub status: Status,
}

/// Cloneable producer half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<CoreEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, kind: EventKind, session: u16, connection: u16, status: Status) {
        let ev = CoreEvent {
            kind,
            session,
            connection,
            status,
        };
        debug!(?ev, "core event");
        let _ = self.tx.send(ev);
    }
}
