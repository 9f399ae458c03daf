use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::conversation::TurnStatus;
use crate::host::{HostAdapter, HostEvent};

use super::lock_unpoisoned;

/// Ordered queue of host notifications.
///
/// Notifications are queued while the session state lock is held and
/// delivered afterwards, by one thread at a time, in queue order. A thread
/// that finds another one already delivering leaves its notifications to it,
/// which also makes re-entrant calls from inside a host callback safe.
#[derive(Default)]
pub(super) struct Outbox {
    queue: Mutex<VecDeque<HostEvent>>,
    draining: Mutex<bool>,
}

impl Outbox {
    pub(super) fn push(&self, event: HostEvent) {
        lock_unpoisoned(&self.queue).push_back(event);
    }

    pub(super) fn drain(&self, host: &dyn HostAdapter) {
        {
            let mut draining = lock_unpoisoned(&self.draining);
            if *draining {
                return;
            }
            *draining = true;
        }

        loop {
            let next = lock_unpoisoned(&self.queue).pop_front();
            match next {
                Some(event) => deliver(host, &event),
                None => {
                    let mut draining = lock_unpoisoned(&self.draining);
                    if lock_unpoisoned(&self.queue).is_empty() {
                        *draining = false;
                        return;
                    }
                }
            }
        }
    }
}

fn deliver(host: &dyn HostAdapter, event: &HostEvent) {
    match event {
        HostEvent::Patch(turn_id, patch) => host.on_render_patch(turn_id, patch),
        HostEvent::Status(turn_id, status) => host.on_status_change(turn_id, *status),
        HostEvent::Error(turn_id, error) => host.on_error(turn_id, error),
        HostEvent::ToolCall(turn_id, record) => host.on_tool_call(turn_id, record),
        HostEvent::Diagnostic(turn_id, message) => host.on_diagnostic(turn_id, message),
    }
}

/// Final status of a turn, published once its worker has exited.
#[derive(Debug, Default)]
pub(super) struct Completion {
    status: Mutex<Option<TurnStatus>>,
    ready: Condvar,
}

impl Completion {
    pub(super) fn complete(&self, status: TurnStatus) {
        *lock_unpoisoned(&self.status) = Some(status);
        self.ready.notify_all();
    }

    pub(super) fn status(&self) -> Option<TurnStatus> {
        *lock_unpoisoned(&self.status)
    }

    pub(super) fn wait(&self) -> TurnStatus {
        let guard = lock_unpoisoned(&self.status);
        let guard = self
            .ready
            .wait_while(guard, |status| status.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.unwrap_or(TurnStatus::Cancelled)
    }

    pub(super) fn wait_timeout(&self, timeout: Duration) -> Option<TurnStatus> {
        let guard = lock_unpoisoned(&self.status);
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |status| status.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}
