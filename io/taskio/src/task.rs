use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::Event;
use crate::worker::PoolShared;

/// Run state of a task. A task is `Ready` while it sits on the pool's ready
/// queue and `Running` while a worker drains it; transitions happen under the
/// task lock so an event is never enqueued to the ready queue twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Idle,
    Ready,
    Running,
}

pub(crate) struct TaskCore {
    pool: Arc<PoolShared>,
    pub(crate) state: Mutex<TaskState>,
}

pub(crate) struct TaskState {
    pub(crate) queue: VecDeque<Event>,
    pub(crate) run: RunState,
}

/// Handle to a task. Cloning attaches another reference; dropping the last
/// handle while events are queued lets them drain and then retires the task.
#[derive(Clone)]
pub struct Task {
    core: Arc<TaskCore>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish()
    }
}

impl Task {
    pub(crate) fn new(pool: Arc<PoolShared>) -> Self {
        Task {
            core: Arc::new(TaskCore {
                pool,
                state: Mutex::new(TaskState {
                    queue: VecDeque::new(),
                    run: RunState::Idle,
                }),
            }),
        }
    }

    /// Queue an event on this task.
    ///
    /// Events on one task execute in FIFO order, one at a time. If the
    /// dispatcher has shut down the event is dropped.
    pub fn send(&self, ev: Event) {
        let mut st = self.core.state.lock();
        st.queue.push_back(ev);
        if st.run == RunState::Idle {
            st.run = RunState::Ready;
            self.core.pool.enqueue(self.core.clone());
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Task {}

impl TaskCore {
    /// Drain up to `quantum` events. Returns true if work remains and the
    /// task should be requeued.
    pub(crate) fn run(self: &Arc<Self>, quantum: usize) -> bool {
        for _ in 0..quantum {
            let ev = {
                let mut st = self.state.lock();
                match st.queue.pop_front() {
                    Some(ev) => {
                        st.run = RunState::Running;
                        ev
                    }
                    None => {
                        st.run = RunState::Idle;
                        return false;
                    }
                }
            };
            ev.run();
        }

        // Quantum exhausted; hand the task back if anything is left.
        let mut st = self.state.lock();
        if st.queue.is_empty() {
            st.run = RunState::Idle;
            false
        } else {
            st.run = RunState::Ready;
            true
        }
    }
}
