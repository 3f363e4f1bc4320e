//! Command/response correlation
//!
//! An outbound write parks its caller on a oneshot and resumes it from
//! whichever path fires first: the matching response frame or the timeout
//! task. No polling anywhere. Resolution is exactly-once, guarded by an
//! atomic flag, so a response racing the timeout cannot complete a waiter
//! twice. One command may be outstanding per device at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, TelSrvError};
use crate::model::DeviceKey;

/// Terminal state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Device acknowledged the write
    Success,
    /// Device answered with a failure (e.g. a Modbus exception)
    Failed,
    /// No matching response before the deadline
    Timeout,
}

/// Shared wait state for one in-flight command
pub struct CommandWaitState {
    /// Correlation id carried into [`crate::model::ParsedFrameResult`]
    pub response_id: u64,
    deadline: Instant,
    resolved: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<CommandOutcome>>>,
}

impl CommandWaitState {
    /// Complete the waiter. Returns `false` when another path already
    /// resolved it; the atomic swap makes resolution exactly-once.
    pub fn resolve(&self, outcome: CommandOutcome) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(tx) = self.tx.lock().take() {
            // Receiver may have been dropped; the flag is already set
            let _ = tx.send(outcome);
        }
        true
    }

    fn expired(&self) -> bool {
        self.resolved.load(Ordering::Acquire) || Instant::now() >= self.deadline
    }
}

/// Handle returned to the command issuer
pub struct CommandTicket {
    pub response_id: u64,
    rx: oneshot::Receiver<CommandOutcome>,
}

impl CommandTicket {
    /// Wait for the outcome. The timeout task guarantees completion, so
    /// this never hangs; a dropped wait state reads as a timeout.
    pub async fn wait(self) -> CommandOutcome {
        self.rx.await.unwrap_or(CommandOutcome::Timeout)
    }
}

/// Registry of in-flight commands, keyed by device
#[derive(Default)]
pub struct CommandRegistry {
    next_id: AtomicU64,
    waiting: DashMap<DeviceKey, Arc<CommandWaitState>>,
}

impl CommandRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Begin a command for `key`. Fails with `DeviceBusy` while an
    /// unresolved, unexpired command is outstanding for the same device.
    pub fn begin(self: &Arc<Self>, key: DeviceKey, timeout: Duration) -> Result<CommandTicket> {
        let response_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CommandWaitState {
            response_id,
            deadline: Instant::now() + timeout,
            resolved: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });

        {
            // Entry API keeps check-and-insert atomic per key
            let mut slot = self.waiting.entry(key.clone()).or_insert_with(|| state.clone());
            if !Arc::ptr_eq(&slot, &state) {
                if !slot.expired() {
                    return Err(TelSrvError::DeviceBusy(format!(
                        "command {} still in flight for {key}",
                        slot.response_id
                    )));
                }
                // Stale entry from a waiter that already finished
                *slot = state.clone();
            }
        }

        let registry = self.clone();
        let timer_key = key.clone();
        let timer_state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer_state.resolve(CommandOutcome::Timeout) {
                debug!(%timer_key, response_id, "command timed out");
            }
            registry.finish(&timer_key, response_id);
        });

        Ok(CommandTicket { response_id, rx })
    }

    /// Resolve the in-flight command for `key` from a response frame.
    /// Returns the correlation id when this call won the resolution race.
    pub fn resolve(&self, key: &DeviceKey, outcome: CommandOutcome) -> Option<u64> {
        let state = self.waiting.get(key).map(|s| s.clone())?;
        if state.resolve(outcome) {
            self.finish(key, state.response_id);
            Some(state.response_id)
        } else {
            None
        }
    }

    /// Like [`resolve`](Self::resolve), but only when the outstanding
    /// command carries `response_id`. `None` resolves whatever is
    /// pending, for protocols whose acknowledgements echo no id.
    pub fn resolve_matching(
        &self,
        key: &DeviceKey,
        response_id: Option<u64>,
        outcome: CommandOutcome,
    ) -> Option<u64> {
        let state = self.waiting.get(key).map(|s| s.clone())?;
        if response_id.is_some_and(|id| id != state.response_id) {
            return None;
        }
        if state.resolve(outcome) {
            self.finish(key, state.response_id);
            Some(state.response_id)
        } else {
            None
        }
    }

    /// Whether a command is currently outstanding for `key`
    pub fn is_pending(&self, key: &DeviceKey) -> bool {
        self.waiting.get(key).is_some_and(|s| !s.expired())
    }

    /// Remove the entry, but only if it still belongs to `response_id`
    fn finish(&self, key: &DeviceKey, response_id: u64) {
        self.waiting
            .remove_if(key, |_, state| state.response_id == response_id);
    }
}
