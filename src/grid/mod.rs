//! Contracts with the grid the nodes serve
//!
//! The grid hub owns slots, sessions and dashboards. The reclaimer only sees
//! it through [`GridProxy`] and [`ArtifactCapture`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a session was ended by the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    Timeout,
    BrowserTimeout,
    /// The node stopped answering while the session was still held
    Orphan,
    ClientGone,
    ClientStoppedSession,
    CreationFailed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TerminationReason::Timeout => "TIMEOUT",
            TerminationReason::BrowserTimeout => "BROWSER_TIMEOUT",
            TerminationReason::Orphan => "ORPHAN",
            TerminationReason::ClientGone => "CLIENT_GONE",
            TerminationReason::ClientStoppedSession => "CLIENT_STOPPED_SESSION",
            TerminationReason::CreationFailed => "CREATIONFAILED",
        };
        f.write_str(reason)
    }
}

/// A slot currently holding a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSession {
    pub slot_id: String,
    pub session_id: String,

    /// Time since the session last saw a command
    pub inactivity: Duration,

    pub last_session_start: DateTime<Utc>,

    pub requested_capabilities: HashMap<String, serde_json::Value>,
}

impl SlotSession {
    /// Wall-clock duration of the session so far
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_session_start).to_std().unwrap_or_default()
    }
}

/// A remote proxy whose slots the reclaimer watches
#[async_trait]
pub trait GridProxy: Send + Sync {
    /// Name used in logs and metric labels
    fn proxy_name(&self) -> String;

    /// Slots that currently hold a session
    async fn occupied_slots(&self) -> Vec<SlotSession>;

    /// End the session held by `slot_id`
    async fn force_release(&self, slot_id: &str, reason: TerminationReason);
}

/// Sink that collects videos and logs of a finished session
#[async_trait]
pub trait ArtifactCapture: Send + Sync {
    /// `completed` is false when the session was reclaimed rather than ended
    async fn capture(&self, session_id: &str, completed: bool) -> anyhow::Result<()>;
}
