//! Idle session reclamation
//!
//! A node that stops answering keeps its slot busy forever. The reclaimer
//! polls the proxy's occupied slots and force-releases every session that has
//! been idle for at least the configured threshold, then asks for its
//! artifacts to be captured.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReclaimerConfig;
use crate::grid::{ArtifactCapture, GridProxy, SlotSession, TerminationReason};
use crate::metrics;

/// Reclaimer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimerState {
    Polling,
    Reclaiming,
    Stopped,
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    proxy: Arc<dyn GridProxy>,
    capture: Arc<dyn ArtifactCapture>,
    idle_threshold: Duration,
    poll_interval: Duration,
    state: RwLock<ReclaimerState>,

    /// Sessions already reclaimed or completed, pruned each poll
    terminal_sessions: Mutex<HashSet<String>>,
}

/// Background poller reclaiming idle sessions of one proxy
pub struct IdleSessionReclaimer {
    inner: Arc<Inner>,
    task: Mutex<Option<PollTask>>,
}

impl IdleSessionReclaimer {
    pub fn new(
        proxy: Arc<dyn GridProxy>,
        capture: Arc<dyn ArtifactCapture>,
        idle_threshold: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                proxy,
                capture,
                idle_threshold,
                poll_interval,
                state: RwLock::new(ReclaimerState::Stopped),
                terminal_sessions: Mutex::new(HashSet::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Build a reclaimer with the configured threshold and poll interval
    pub fn from_config(
        proxy: Arc<dyn GridProxy>,
        capture: Arc<dyn ArtifactCapture>,
        config: &ReclaimerConfig,
    ) -> Self {
        Self::new(proxy, capture, config.idle_threshold(), config.poll_interval())
    }

    pub async fn state(&self) -> ReclaimerState {
        *self.inner.state.read().await
    }

    /// Start polling in the background; a no-op while already polling
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        *self.inner.state.write().await = ReclaimerState::Polling;

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();

        info!(
            proxy = %inner.proxy.proxy_name(),
            idle_threshold_secs = inner.idle_threshold.as_secs_f64(),
            poll_interval_ms = inner.poll_interval.as_millis() as u64,
            "Idle session reclaimer started"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval(inner.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.reclaim_idle_sessions().await;
                    }
                }
            }

            *inner.state.write().await = ReclaimerState::Stopped;
            debug!(proxy = %inner.proxy.proxy_name(), "Idle session reclaimer stopped");
        });

        *task = Some(PollTask { cancel, handle });
    }

    /// Stop polling and wait for the poll task to exit
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Idle session reclaimer task failed");
            }
        }
        *self.inner.state.write().await = ReclaimerState::Stopped;
    }

    /// Run one reclamation pass, returning how many sessions were released
    pub async fn reclaim_idle_sessions(&self) -> usize {
        self.inner.reclaim_idle_sessions().await
    }

    /// Handle a session the client ended itself.
    ///
    /// Its artifacts are captured as complete and it will not be reclaimed
    /// even if the slot stays listed for a while.
    pub async fn complete_session(&self, slot: &SlotSession) {
        let inner = &self.inner;
        if !inner
            .terminal_sessions
            .lock()
            .await
            .insert(slot.session_id.clone())
        {
            return;
        }

        let proxy_name = inner.proxy.proxy_name();
        let duration = slot.elapsed(Utc::now());
        info!(
            proxy = %proxy_name,
            session_id = %slot.session_id,
            duration_secs = duration.as_secs_f64(),
            capabilities = ?slot.requested_capabilities,
            "Session completed"
        );
        metrics::record_session_completed(&proxy_name, duration.as_secs_f64());

        inner.dispatch_capture(&slot.session_id, true);
    }
}

impl Inner {
    async fn reclaim_idle_sessions(&self) -> usize {
        let slots = self.proxy.occupied_slots().await;

        // Claim the idle sessions, then release the lock before calling out
        let idle: Vec<&SlotSession> = {
            let mut terminal = self.terminal_sessions.lock().await;
            terminal.retain(|session_id| slots.iter().any(|slot| &slot.session_id == session_id));

            slots
                .iter()
                .filter(|slot| slot.inactivity >= self.idle_threshold)
                .filter(|slot| terminal.insert(slot.session_id.clone()))
                .collect()
        };

        if idle.is_empty() {
            return 0;
        }

        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ReclaimerState::Reclaiming)
        };

        let proxy_name = self.proxy.proxy_name();
        let now = Utc::now();

        for slot in &idle {
            let duration = slot.elapsed(now);
            info!(
                proxy = %proxy_name,
                slot_id = %slot.slot_id,
                session_id = %slot.session_id,
                inactivity_secs = slot.inactivity.as_secs_f64(),
                duration_secs = duration.as_secs_f64(),
                capabilities = ?slot.requested_capabilities,
                "Releasing idle session"
            );
            metrics::record_session_reclaimed(&proxy_name, duration.as_secs_f64());

            self.proxy
                .force_release(&slot.slot_id, TerminationReason::Orphan)
                .await;

            self.dispatch_capture(&slot.session_id, false);
        }

        {
            let mut state = self.state.write().await;
            // stop() may have run meanwhile
            if *state == ReclaimerState::Reclaiming {
                *state = previous;
            }
        }

        idle.len()
    }

    fn dispatch_capture(&self, session_id: &str, completed: bool) {
        let capture = self.capture.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            if let Err(e) = capture.capture(&session_id, completed).await {
                warn!(
                    session_id = %session_id,
                    completed = completed,
                    error = %e,
                    "Error while capturing session artifacts"
                );
            }
        });
    }
}
