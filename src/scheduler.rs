//! Cooperative task scheduler
//!
//! Every deferrable unit of work (serialization, hashing, batch sends,
//! snapshot capture) funnels through this queue so it never runs on the
//! host's input-handling path. The host services the queue during idle
//! slices via [`Scheduler::drive_idle`], which honors a frame budget; hosts
//! without an idle primitive fall back to [`Scheduler::drive_deferred`],
//! which preserves ordering but loses true idle-yielding.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::capability::Clock;
use crate::error::CollectorError;

/// Frame budget for one idle slice, in milliseconds
pub const DEFAULT_FRAME_BUDGET_MS: i64 = 16;

/// Task priority. High-priority tasks jump to the front of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Idle,
}

/// Settlement state of a scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Done,
    Failed(String),
}

/// Promise-like handle returned to callers. Callers never hold a reference
/// into the queue itself.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Rc<RefCell<TaskState>>,
}

impl TaskHandle {
    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.state.borrow(), TaskState::Pending)
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.state.borrow(), TaskState::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.borrow(), TaskState::Failed(_))
    }
}

type TaskFn = Box<dyn FnOnce() -> Result<(), CollectorError>>;

struct QueueEntry {
    task: TaskFn,
    state: Rc<RefCell<TaskState>>,
    #[allow(dead_code)]
    enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Execute the task and settle its handle. A failing task rejects only
    /// its own handle; the queue continues.
    fn run(self) {
        match (self.task)() {
            Ok(()) => *self.state.borrow_mut() = TaskState::Done,
            Err(err) => {
                log::debug!("scheduled task failed: {err}");
                *self.state.borrow_mut() = TaskState::Failed(err.to_string());
            }
        }
    }
}

/// Single-queue cooperative scheduler
pub struct Scheduler {
    queue: VecDeque<QueueEntry>,
    clock: Rc<dyn Clock>,
    frame_budget_ms: i64,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self::with_budget(clock, DEFAULT_FRAME_BUDGET_MS)
    }

    pub fn with_budget(clock: Rc<dyn Clock>, frame_budget_ms: i64) -> Self {
        Self {
            queue: VecDeque::new(),
            clock,
            frame_budget_ms,
        }
    }

    /// Enqueue a task and return its handle
    pub fn schedule<F>(&mut self, priority: Priority, task: F) -> TaskHandle
    where
        F: FnOnce() -> Result<(), CollectorError> + 'static,
    {
        let state = Rc::new(RefCell::new(TaskState::Pending));
        let entry = QueueEntry {
            task: Box::new(task),
            state: state.clone(),
            enqueued_at: self.clock.now(),
        };
        match priority {
            Priority::High => self.queue.push_front(entry),
            Priority::Normal | Priority::Idle => self.queue.push_back(entry),
        }
        TaskHandle { state }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn pop_next(&mut self) -> Option<QueueEntry> {
        self.queue.pop_front()
    }

    /// Service the queue for one idle slice. Tasks may schedule follow-up
    /// work onto the same scheduler, so the borrow is released around each
    /// task execution. Returns the number of tasks run.
    pub fn drive_idle(scheduler: &Rc<RefCell<Self>>) -> usize {
        let (clock, budget) = {
            let s = scheduler.borrow();
            (s.clock.clone(), s.frame_budget_ms)
        };
        let slice_start = clock.now();
        let mut executed = 0;

        loop {
            let entry = match scheduler.borrow_mut().pop_next() {
                Some(entry) => entry,
                None => break,
            };
            entry.run();
            executed += 1;

            let elapsed = (clock.now() - slice_start).num_milliseconds();
            if elapsed >= budget {
                break;
            }
        }
        executed
    }

    /// Degraded mode: drain the whole queue with zero-delay execution,
    /// preserving order. Returns the number of tasks run.
    pub fn drive_deferred(scheduler: &Rc<RefCell<Self>>) -> usize {
        let mut executed = 0;
        loop {
            let entry = match scheduler.borrow_mut().pop_next() {
                Some(entry) => entry,
                None => break,
            };
            entry.run();
            executed += 1;
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ManualClock;
    use chrono::TimeZone;

    fn make_scheduler() -> (Rc<RefCell<Scheduler>>, Rc<ManualClock>) {
        let clock = Rc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let scheduler = Rc::new(RefCell::new(Scheduler::new(clock.clone())));
        (scheduler, clock)
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let (scheduler, _) = make_scheduler();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scheduler.borrow_mut().schedule(Priority::Normal, move || {
                order.borrow_mut().push(i);
                Ok(())
            });
        }

        Scheduler::drive_idle(&scheduler);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_high_priority_jumps_queue() {
        let (scheduler, _) = make_scheduler();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (priority, label) in [
            (Priority::Normal, "first"),
            (Priority::Idle, "second"),
            (Priority::High, "urgent"),
        ] {
            let order = order.clone();
            scheduler.borrow_mut().schedule(priority, move || {
                order.borrow_mut().push(label);
                Ok(())
            });
        }

        Scheduler::drive_idle(&scheduler);
        assert_eq!(*order.borrow(), vec!["urgent", "first", "second"]);
    }

    #[test]
    fn test_frame_budget_yields_mid_queue() {
        let (scheduler, clock) = make_scheduler();

        // Each task consumes 10ms of simulated time; the 16ms budget allows
        // two tasks per slice.
        for _ in 0..5 {
            let clock = clock.clone();
            scheduler.borrow_mut().schedule(Priority::Normal, move || {
                clock.advance_ms(10);
                Ok(())
            });
        }

        assert_eq!(Scheduler::drive_idle(&scheduler), 2);
        assert_eq!(scheduler.borrow().len(), 3);
        assert_eq!(Scheduler::drive_idle(&scheduler), 2);
        assert_eq!(Scheduler::drive_idle(&scheduler), 1);
        assert!(scheduler.borrow().is_empty());
    }

    #[test]
    fn test_failing_task_rejects_only_its_handle() {
        let (scheduler, _) = make_scheduler();

        let failing = scheduler.borrow_mut().schedule(Priority::Normal, || {
            Err(CollectorError::TaskFailed("boom".to_string()))
        });
        let ran = Rc::new(RefCell::new(false));
        let ran_clone = ran.clone();
        let ok = scheduler.borrow_mut().schedule(Priority::Normal, move || {
            *ran_clone.borrow_mut() = true;
            Ok(())
        });

        Scheduler::drive_idle(&scheduler);

        assert!(failing.is_failed());
        assert!(ok.is_done());
        assert!(*ran.borrow());
    }

    #[test]
    fn test_task_can_schedule_follow_up() {
        let (scheduler, _) = make_scheduler();
        let hits = Rc::new(RefCell::new(0));

        let hits_outer = hits.clone();
        let scheduler_inner = scheduler.clone();
        scheduler.borrow_mut().schedule(Priority::Normal, move || {
            *hits_outer.borrow_mut() += 1;
            let hits_inner = hits_outer.clone();
            scheduler_inner.borrow_mut().schedule(Priority::Normal, move || {
                *hits_inner.borrow_mut() += 1;
                Ok(())
            });
            Ok(())
        });

        Scheduler::drive_idle(&scheduler);
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn test_drive_deferred_drains_everything() {
        let (scheduler, clock) = make_scheduler();
        for _ in 0..10 {
            let clock = clock.clone();
            scheduler.borrow_mut().schedule(Priority::Idle, move || {
                clock.advance_ms(10);
                Ok(())
            });
        }
        assert_eq!(Scheduler::drive_deferred(&scheduler), 10);
        assert!(scheduler.borrow().is_empty());
    }

    #[test]
    fn test_handle_pending_until_run() {
        let (scheduler, _) = make_scheduler();
        let handle = scheduler
            .borrow_mut()
            .schedule(Priority::Normal, || Ok(()));
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(!handle.is_settled());

        Scheduler::drive_idle(&scheduler);
        assert!(handle.is_done());
    }
}
