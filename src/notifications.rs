//! State-change notification machinery.
//!
//! The store keeps a list of pending notifier records, one per outstanding
//! `get_state_change_notification` call. A notifier resolves exactly once:
//! with the first state at or beyond the requested one, with `Superseded`
//! when its set is overtaken, or with an error when its set enters the
//! `Error` state or the store broadcasts a cancellation.
//!
//! The list is guarded by a single mutex which is never held across
//! resolution: callers may re-enter the store from a callback.

use crate::error::{Result, StoreError};
use crate::types::State;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::time::Duration;

/// Value a notifier resolves with.
pub(crate) type StateResult = Result<State>;

pub(crate) enum Notifier {
    Channel(Sender<StateResult>),
    Callback(Box<dyn FnOnce(StateResult) + Send>),
}

impl Notifier {
    fn resolve(self, result: StateResult) {
        match self {
            // The receiver may already be gone; that is fine.
            Notifier::Channel(sender) => {
                let _ = sender.send(result);
            }
            Notifier::Callback(callback) => callback(result),
        }
    }
}

pub(crate) struct NotificationRequest {
    pub version: i64,
    pub notify_when: State,
    notifier: Notifier,
}

/// How a notifier waiting for `notify_when` resolves when its set is
/// observed in `state`, or `None` if it keeps waiting.
pub(crate) fn resolution_for(state: State, error_str: &str, notify_when: State) -> Option<StateResult> {
    if state == State::Error {
        return Some(Err(StoreError::SetError(error_str.to_string())));
    }
    if state.notification_order() >= notify_when.notification_order() {
        return Some(Ok(state));
    }
    None
}

/// The store's registry of outstanding notifiers.
#[derive(Default)]
pub(crate) struct PendingNotifications {
    requests: Mutex<Vec<NotificationRequest>>,
}

impl PendingNotifications {
    /// Register a notifier, or resolve it immediately if `current` already
    /// satisfies the request. `current` is evaluated under the registry
    /// lock, so a transition committed between the caller's snapshot and
    /// registration cannot strand the notifier.
    pub fn register<F>(&self, version: i64, notify_when: State, current: F, notifier: Notifier)
    where
        F: FnOnce() -> Result<(State, String)>,
    {
        let immediate = {
            let mut requests = self.requests.lock();
            match current() {
                Ok((state, error_str)) => match resolution_for(state, &error_str, notify_when) {
                    Some(result) => Some(result),
                    None => {
                        requests.push(NotificationRequest {
                            version,
                            notify_when,
                            notifier,
                        });
                        return;
                    }
                },
                Err(e) => Some(Err(e)),
            }
        };

        if let Some(result) = immediate {
            notifier.resolve(result);
        }
    }

    /// Resolve every notifier whose target version has reached (or passed
    /// through) its requested state. `state_of` maps a version to its
    /// current state and error string.
    pub fn fulfill<F>(&self, state_of: F)
    where
        F: Fn(i64) -> Result<(State, String)>,
    {
        let mut due = Vec::new();
        {
            let mut requests = self.requests.lock();
            let mut kept = Vec::with_capacity(requests.len());
            for request in requests.drain(..) {
                let resolution = match state_of(request.version) {
                    Ok((state, error_str)) => {
                        resolution_for(state, &error_str, request.notify_when)
                    }
                    Err(e) => Some(Err(e)),
                };
                match resolution {
                    Some(result) => due.push((request, result)),
                    None => kept.push(request),
                }
            }
            *requests = kept;
        }

        for (request, result) in due {
            request.notifier.resolve(result);
        }
    }

    /// Resolve every outstanding notifier with the given result. Rows are
    /// not touched.
    pub fn resolve_all(&self, result: StateResult) {
        let drained: Vec<NotificationRequest> = {
            let mut requests = self.requests.lock();
            requests.drain(..).collect()
        };
        for request in drained {
            request.notifier.resolve(result.clone());
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }
}

/// One-shot handle to a pending state-change notification.
///
/// The resolution arrives on whichever thread performs the transition that
/// satisfies it; callers must not assume a specific thread.
pub struct StateChangeHandle {
    receiver: Receiver<StateResult>,
}

impl StateChangeHandle {
    pub(crate) fn one_shot() -> (Sender<StateResult>, StateChangeHandle) {
        let (sender, receiver) = bounded(1);
        (sender, StateChangeHandle { receiver })
    }

    /// An already-resolved handle.
    pub(crate) fn resolved(result: StateResult) -> StateChangeHandle {
        let (sender, handle) = Self::one_shot();
        let _ = sender.send(result);
        handle
    }

    /// Wait for the resolution (blocking).
    pub fn recv(&self) -> Result<State> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(StoreError::Cancelled("notification dropped".to_string())),
        }
    }

    /// Check for the resolution without blocking. `None` if not resolved
    /// yet.
    pub fn try_recv(&self) -> Option<Result<State>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(StoreError::Cancelled(
                "notification dropped".to_string(),
            ))),
        }
    }

    /// Wait for the resolution with a timeout. `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<State>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Some(Err(
                StoreError::Cancelled("notification dropped".to_string()),
            )),
        }
    }
}
