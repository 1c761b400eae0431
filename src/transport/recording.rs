//! In-memory transport that records every outbound line
//!
//! Used by the relay engine tests and the integration tests to observe
//! exactly which cells a relay emits, and to script exit-hop replies.

use super::CellTransport;
use crate::error::{OnionError, Result};
use crate::protocol::{Cell, Route};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Recorded {
    sent: Vec<(Route, String)>,
    replies: HashMap<Route, VecDeque<String>>,
    unreachable: HashSet<Route>,
}

/// Transport test double
#[derive(Default)]
pub struct RecordingTransport {
    state: Mutex<Recorded>,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        // Poisoning is ignored
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a reply for the next `request` to `dest`
    pub fn push_reply(&self, dest: Route, line: impl Into<String>) {
        self.state()
            .replies
            .entry(dest)
            .or_default()
            .push_back(line.into());
    }

    /// Make every delivery to `dest` fail as a refused connection
    pub fn set_unreachable(&self, dest: Route) {
        self.state().unreachable.insert(dest);
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<(Route, String)> {
        self.state().sent.clone()
    }

    /// Sent lines parsed back into cells (lines that are not cells are skipped)
    pub fn sent_cells(&self) -> Vec<(Route, Cell)> {
        self.sent()
            .into_iter()
            .filter_map(|(route, line)| Cell::from_line(&line).ok().map(|cell| (route, cell)))
            .collect()
    }

    /// Drain the record
    pub fn take_sent(&self) -> Vec<(Route, String)> {
        std::mem::take(&mut self.state().sent)
    }

    /// Wait until at least `count` lines were sent, or `limit` elapses
    pub async fn wait_for_sent(&self, count: usize, limit: Duration) -> Vec<(Route, String)> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state();
                if state.sent.len() >= count {
                    return state.sent.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent();
            }
        }
    }

    fn record(&self, dest: &Route, line: &str) -> Result<()> {
        let mut state = self.state();
        if state.unreachable.contains(dest) {
            return Err(OnionError::ConnectionFailed {
                addr: dest.to_string(),
                reason: "connection refused".into(),
            });
        }
        state.sent.push((dest.clone(), line.to_string()));
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl CellTransport for RecordingTransport {
    async fn send(&self, dest: &Route, line: &str) -> Result<()> {
        self.record(dest, line)
    }

    async fn request(&self, dest: &Route, line: &str) -> Result<String> {
        self.record(dest, line)?;
        self.state()
            .replies
            .get_mut(dest)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| OnionError::Io(format!("{} closed the connection without replying", dest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_replies() {
        let transport = RecordingTransport::new();
        let server = Route::new("127.0.0.1", 8080);
        transport.push_reply(server.clone(), "{\"ok\":true}");

        transport.send(&Route::new("127.0.0.1", 7000), "a").await.unwrap();
        let reply = transport.request(&server, "b").await.unwrap();
        assert_eq!(reply, "{\"ok\":true}");
        assert!(transport.request(&server, "c").await.is_err());

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1], (server, "b".to_string()));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_route() {
        let transport = RecordingTransport::new();
        let dead = Route::new("127.0.0.1", 1);
        transport.set_unreachable(dead.clone());
        assert!(transport.send(&dead, "x").await.unwrap_err().is_retryable());
        assert!(transport.sent().is_empty());
    }
}
