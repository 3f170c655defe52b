// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One-shot timers that are armed and disarmed explicitly.
//!
//! Each arm spawns a task that sleeps and then runs the callback; arming
//! again or stopping aborts the previous task. The callback must tolerate
//! firing against state that moved on while it was queued (it re-checks
//! everything under the proper locks).

use std::{future::Future, sync::Mutex, time::Duration};

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct Timer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending expiry.
    pub fn arm<F>(&self, delay: Duration, on_fire: F)
    where F: Future<Output = ()> + Send + 'static {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire.await;
        });
        let Ok(mut guard) = self.handle.lock() else {
            task.abort();
            return;
        };
        if let Some(prev) = guard.replace(task) {
            prev.abort();
        }
    }

    /// Disarm; a callback that already started running is not interrupted.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.handle.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn stop_prevents_fire() {
        let hits = Arc::new(AtomicU32::new(0));
        let timer = Timer::new();
        let h = hits.clone();
        timer.arm(Duration::from_millis(20), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rearm_replaces_pending_expiry() {
        let hits = Arc::new(AtomicU32::new(0));
        let timer = Timer::new();
        for _ in 0..3 {
            let h = hits.clone();
            timer.arm(Duration::from_millis(10), async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
