// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide state: the session registry, the event channel and the
//! send-task counter. Created once at startup and torn down at
//! shutdown.

use std::sync::{
    Arc,
    atomic::{AtomicU16, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    cfg::config::Config,
    events::{CoreEvent, EventSink},
    session::session::Session,
};

pub struct Core {
    sessions: DashMap<u16, Arc<Session>>,
    events: EventSink,
    next_session_id: AtomicU16,
    /// Live sender tasks across all sessions; drains to zero at
    /// shutdown.
    send_tasks: Arc<AtomicUsize>,
}

impl Core {
    /// Build the core and hand back the event stream.
    pub fn new() -> (Arc<Self>, UnboundedReceiver<CoreEvent>) {
        let (events, rx) = EventSink::channel();
        let core = Arc::new(Self {
            sessions: DashMap::new(),
            events,
            next_session_id: AtomicU16::new(1),
            send_tasks: Arc::new(AtomicUsize::new(0)),
        });
        (core, rx)
    }

    /// Create a session; connections are added and logged in separately.
    pub fn create_session(&self, config: Arc<Config>) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let sess = Session::new(id, config, self.events.clone(), self.send_tasks.clone());
        self.sessions.insert(id, sess.clone());
        sess
    }

    pub fn session(&self, id: u16) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Drop a session from the registry once its last connection is
    /// destroyed and no CCBs remain.
    pub fn remove_session(&self, id: u16) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn num_send_tasks(&self) -> usize {
        self.send_tasks.load(Ordering::SeqCst)
    }

    /// Terminate every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for sess in sessions {
            sess.terminate().await;
        }
    }
}
