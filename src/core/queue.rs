//! The correlation machinery between the network handlers and the worker
//! loop: a FIFO inbound queue and an id-keyed outbound registry.
//!
//! Both structures pair a mutex with a condition-style wake signal. They are
//! the only shared mutable state in the server; everything else is owned by
//! a single task.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};

use crate::core::task::{CompletedTask, RequestPayload, ResponsePayload, Task, TaskId};
use crate::error::EngineError;

#[derive(Default)]
struct InboundState {
    tasks: VecDeque<Task>,
    next_id: u64,
}

/// FIFO handoff from the network handlers to the worker loop.
///
/// Any number of producers call [`InboundQueue::submit`]; the single worker
/// calls [`InboundQueue::take`]. Service order is submission order.
#[derive(Default)]
pub struct InboundQueue {
    state: Mutex<InboundState>,
    wake: Notify,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request and returns the id its result will be published
    /// under. Returns as soon as the task is appended; the completion is
    /// delivered through the [`OutboundRegistry`].
    pub async fn submit(&self, payload: RequestPayload) -> TaskId {
        let id = {
            let mut state = self.state.lock().await;
            let id = TaskId(state.next_id);
            state.next_id = state.next_id.wrapping_add(1);
            state.tasks.push_back(Task { id, payload });
            id
        };
        self.wake.notify_one();
        id
    }

    /// Removes and returns the oldest queued task, suspending while the
    /// queue is empty. The emptiness check is repeated after every wake-up;
    /// a wake that finds nothing queued goes back to waiting.
    ///
    /// Intended for a single consumer.
    pub async fn take(&self) -> Task {
        loop {
            if let Some(task) = self.state.lock().await.tasks.pop_front() {
                return task;
            }
            self.wake.notified().await;
        }
    }

    /// Number of tasks waiting to be taken.
    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Id-keyed store delivering each completed task to the one handler waiting
/// for it.
///
/// The worker publishes under the id the request was submitted with; the
/// matching handler removes the entry. Publication wakes every waiter
/// because concurrent retrievers wait on different ids and only the wake's
/// recipient knows whether its own entry arrived.
#[derive(Default)]
pub struct OutboundRegistry {
    completed: Mutex<HashMap<TaskId, CompletedTask>>,
    wake: Notify,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a completed task and wakes all waiting retrievers. The entry
    /// is in the map before any waiter runs, so a retriever already parked
    /// on this id finds it on its next check.
    pub async fn publish(&self, task: CompletedTask) {
        self.completed.lock().await.insert(task.id, task);
        self.wake.notify_waiters();
    }

    /// Suspends until the task with this id has been published, then
    /// removes and returns its result. Unrelated publications and removals
    /// by other retrievers are ignored.
    ///
    /// Each id is retrievable exactly once; a second retrieve of an already
    /// delivered id waits forever. There is no timeout: a caller that gives
    /// up on its own leaks this waiter and, later, the registry entry. A
    /// timed wait plus eviction of the abandoned entry is the extension
    /// point if a deployment needs bounded waits.
    pub async fn retrieve(&self, id: TaskId) -> Result<ResponsePayload, EngineError> {
        loop {
            // Register for the wake before checking the map: a publication
            // landing between the check and the await is not missed.
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if let Some(task) = self.completed.lock().await.remove(&id) {
                return task.result;
            }
            wake.await;
        }
    }
}
