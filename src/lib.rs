// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Initiator-side iSCSI transport core.
//!
//! The crate owns the send half of an initiator: per-connection sender
//! tasks with a priority-aware send queue, multi-connection sessions
//! with CmdSN windowing and round-robin connection selection, command
//! control blocks with retransmission and cross-connection task
//! reassignment, and the login/text negotiation engine. The receive
//! path, the SCSI upper stack and the key=value parser are external
//! collaborators reached through the seams in [`models::rx`],
//! [`session::ccb`] and [`session::login`].

pub mod cfg;
pub mod core;
pub mod events;
pub mod models;
pub mod session;
pub mod status;
pub mod transport;
pub mod utils;

pub use crate::{
    core::Core,
    events::{CoreEvent, EventKind},
    session::{
        ccb::{CcbDisp, ScsiXfer, XferResult},
        connection::{ConnParams, ConnPhase, Connection},
        login::{
            Assembled, ConfigAssembler, ParamAssembler, acknowledge_text,
            negotiate_login, negotiate_text, send_login, send_send_targets,
            start_text_negotiation,
        },
        recovery::{handle_connection_error, reassign_tasks},
        send::{
            IoCommand, IoResult, resend_pdu, send_data_out, send_io_command,
            send_logout, send_nop_out, send_run_xfer, send_snack,
            send_task_management,
        },
        session::Session,
    },
    status::{LogoutKind, Status},
    transport::{TcpWireSocket, WireFrame, WireSocket},
};
