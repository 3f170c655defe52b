// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Terminal status codes carried by CCBs and connections.
//!
//! These travel as values, never as panics: a command ends its life with
//! exactly one `Status` delivered through `wake_ccb`, and a dying
//! connection records the status that killed it in `terminating`.

use thiserror::Error;

/// Outcome of a command, login, text or task-management operation, and
/// the reason recorded when a connection terminates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    /// Normal completion.
    #[default]
    #[error("success")]
    Success,
    /// Transport write failed; the connection is terminating.
    #[error("socket error")]
    SocketError,
    /// Malformed or unexpected PDU from the target.
    #[error("protocol error")]
    ProtocolError,
    /// Target reported a fatal login/text status.
    #[error("target error")]
    TargetError,
    /// Submission on a dead connection.
    #[error("connection failed")]
    ConnectionFailed,
    /// Submission pinned to an unknown or unusable connection id.
    #[error("invalid connection id")]
    InvalidConnectionId,
    /// Per-CCB or per-connection time budget exceeded.
    #[error("timeout")]
    Timeout,
    /// The session CmdSN window is closed.
    #[error("queue full")]
    QueueFull,
    /// The chosen connection is not in full-feature phase.
    #[error("target busy")]
    TargetBusy,
    /// PDU or CCB allocation refused in no-wait mode.
    #[error("out of resources")]
    NoResources,
    /// Task reassignment requested with ErrorRecoveryLevel < 2.
    #[error("cannot reassign task")]
    CantReassign,
}

impl Status {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Success
    }
}

/// Logout behavior requested alongside a connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutKind {
    /// Terminate without attempting a logout.
    NoLogout,
    /// Try to log the connection out before terminating.
    LogoutConnection,
    /// Terminate, keeping the connection eligible for recovery.
    RecoverConnection,
}
