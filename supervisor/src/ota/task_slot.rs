// Single-flight task slot
// One long-lived runner executes requests handed over through `spawn`; callers can cancel it
// and wait until the body has been dropped before treating the slot as free again.

use core::cell::Cell;
use core::future::Future;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use log::{debug, info};

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Failed,
}

pub struct TaskSlot<T> {
    state: Mutex<CriticalSectionRawMutex, Cell<TaskState>>,
    start: Signal<CriticalSectionRawMutex, T>,
    cancel: Signal<CriticalSectionRawMutex, ()>,
    joined: Signal<CriticalSectionRawMutex, TaskState>,
}

impl<T: Send> TaskSlot<T> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(TaskState::Idle)),
            start: Signal::new(),
            cancel: Signal::new(),
            joined: Signal::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.lock(|state| state.get())
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Hand a request to the runner. Rejects with `AlreadyInProgress` while a task is running.
    pub fn spawn(&self, request: T) -> Result<(), SupervisorError> {
        self.state.lock(|state| {
            if state.get() == TaskState::Running {
                return Err(SupervisorError::AlreadyInProgress);
            }
            state.set(TaskState::Running);
            // drop leftovers from an earlier cancel that raced with completion
            self.cancel.reset();
            self.joined.reset();
            self.start.signal(request);
            Ok(())
        })
    }

    /// Cancel the running task and wait until it has fully terminated.
    /// Returns false when nothing was running.
    pub async fn cancel_and_join(&self) -> bool {
        let running = self.state.lock(|state| {
            if state.get() == TaskState::Running {
                self.cancel.signal(());
                true
            } else {
                false
            }
        });
        if !running {
            return false;
        }

        info!("🛑 Cancelling running task");
        let state = self.joined.wait().await;
        info!("🛑 Task terminated ({:?})", state);
        true
    }

    /// Runner side: wait for the next accepted request
    pub async fn next_request(&self) -> T {
        self.start.wait().await
    }

    /// Runner side: drive `body` until it finishes or is cancelled.
    /// `body` resolves to true on success. The body future is dropped before the
    /// final state is published and the joiner is woken.
    pub async fn run<F: Future<Output = bool>>(&self, body: F) -> TaskState {
        let outcome = match select(body, self.cancel.wait()).await {
            Either::First(true) => TaskState::Completed,
            Either::First(false) => TaskState::Failed,
            Either::Second(()) => {
                debug!("Task body dropped on cancel");
                TaskState::Idle
            }
        };

        self.state.lock(|state| {
            state.set(outcome);
            self.cancel.reset();
        });
        self.joined.signal(outcome);
        outcome
    }
}

impl<T: Send> Default for TaskSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use embassy_futures::join::join;
    use embassy_time::{Duration, Timer};

    struct DropFlag<'a>(&'a RefCell<Vec<&'static str>>);

    impl Drop for DropFlag<'_> {
        fn drop(&mut self) {
            self.0.borrow_mut().push("body dropped");
        }
    }

    #[test]
    fn second_spawn_while_running_is_rejected() {
        let slot: TaskSlot<u32> = TaskSlot::new();
        slot.spawn(1).unwrap();
        assert_eq!(slot.spawn(2), Err(SupervisorError::AlreadyInProgress));
        assert_eq!(embassy_futures::block_on(slot.next_request()), 1);
        assert!(!slot.start.signaled());
    }

    #[test]
    fn finished_task_frees_the_slot() {
        let slot: TaskSlot<u32> = TaskSlot::new();
        slot.spawn(1).unwrap();

        let state = embassy_futures::block_on(async {
            slot.next_request().await;
            slot.run(async { false }).await
        });
        assert_eq!(state, TaskState::Failed);
        assert!(slot.spawn(2).is_ok());
    }

    #[test]
    fn cancel_with_nothing_running_returns_immediately() {
        let slot: TaskSlot<u32> = TaskSlot::new();
        assert!(!embassy_futures::block_on(slot.cancel_and_join()));
    }

    #[test]
    fn cancel_drops_body_before_join_returns() {
        let slot: TaskSlot<u32> = TaskSlot::new();
        let log = RefCell::new(Vec::new());
        slot.spawn(7).unwrap();

        embassy_futures::block_on(join(
            async {
                slot.next_request().await;
                let state = slot
                    .run(async {
                        let _flag = DropFlag(&log);
                        Timer::after(Duration::from_secs(60)).await;
                        true
                    })
                    .await;
                assert_eq!(state, TaskState::Idle);
            },
            async {
                Timer::after(Duration::from_millis(10)).await;
                assert!(slot.cancel_and_join().await);
                log.borrow_mut().push("joined");
                assert_eq!(slot.state(), TaskState::Idle);
            },
        ));

        assert_eq!(*log.borrow(), vec!["body dropped", "joined"]);
        assert!(slot.spawn(8).is_ok());
    }
}
