//! FIFO event scheduler.
//!
//! Events are queued while a lock is held and dispatched after it is
//! released. Only one thread dispatches at a time; a thread calling
//! `dispatch_tasks` while another dispatches simply returns, because the
//! active dispatcher drains everything queued before it stops.

use crate::error::{ArbiterResult, ErrorCollector};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::thread::{self, ThreadId};

pub type ScheduledTask = Box<dyn FnOnce() -> ArbiterResult<()> + Send>;

#[derive(Default)]
pub struct TaskScheduler {
    queue: Mutex<VecDeque<ScheduledTask>>,
    dispatcher: Mutex<Option<ThreadId>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_task(&self, task: ScheduledTask) {
        self.queue.lock().push_back(task);
    }

    pub fn schedule_tasks(&self, tasks: impl IntoIterator<Item = ScheduledTask>) {
        self.queue.lock().extend(tasks);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_current_thread_dispatching(&self) -> bool {
        *self.dispatcher.lock() == Some(thread::current().id())
    }

    /// Runs queued tasks in FIFO order.
    ///
    /// Returns immediately when called from inside a dispatched task or
    /// while another thread is dispatching. Every task runs even if an
    /// earlier one failed or panicked; failures are aggregated.
    pub fn dispatch_tasks(&self) -> ArbiterResult<()> {
        let me = thread::current().id();
        let mut errors = ErrorCollector::new();

        while self.pending() > 0 {
            {
                let mut dispatcher = self.dispatcher.lock();
                if dispatcher.is_some() {
                    break;
                }
                *dispatcher = Some(me);
            }

            let task = self.queue.lock().pop_front();
            if let Some(task) = task {
                // A panicking task must not leave the dispatcher slot taken.
                errors.run(task);
            }

            *self.dispatcher.lock() = None;
        }

        errors.finish()
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArbiterError;
    use std::sync::Arc;

    fn push(log: &Arc<Mutex<Vec<u32>>>, v: u32) -> ScheduledTask {
        let log = log.clone();
        Box::new(move || {
            log.lock().push(v);
            Ok(())
        })
    }

    #[test]
    fn dispatches_in_fifo_order() {
        let s = TaskScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        s.schedule_tasks([push(&log, 1), push(&log, 2)]);
        s.schedule_task(push(&log, 3));
        s.dispatch_tasks().unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn reentrant_dispatch_defers_to_outer_loop() {
        let s = Arc::new(TaskScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner = {
            let s = s.clone();
            let log = log.clone();
            Box::new(move || {
                assert!(s.is_current_thread_dispatching());
                s.schedule_task(push(&log, 2));
                // Must not run task 2 before task 1 finished.
                s.dispatch_tasks()?;
                log.lock().push(1);
                Ok(())
            }) as ScheduledTask
        };
        s.schedule_task(inner);
        s.dispatch_tasks().unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);
        assert!(!s.is_current_thread_dispatching());
    }

    #[test]
    fn failures_do_not_stop_later_tasks() {
        let s = TaskScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        s.schedule_task(Box::new(|| Err(ArbiterError::Task("first".into()))));
        s.schedule_task(push(&log, 7));
        s.schedule_task(Box::new(|| Err(ArbiterError::Task("second".into()))));

        let err = s.dispatch_tasks().unwrap_err();
        assert_eq!(*log.lock(), vec![7]);
        assert_eq!(err.suppressed().len(), 1);
    }

    #[test]
    fn panicking_task_does_not_stall_later_dispatches() {
        let s = TaskScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        s.schedule_task(Box::new(|| -> ArbiterResult<()> { panic!("listener blew up") }));
        s.schedule_task(push(&log, 1));

        let err = s.dispatch_tasks().unwrap_err();
        assert!(err.to_string().contains("listener blew up"));
        assert_eq!(*log.lock(), vec![1]);
        assert!(!s.is_current_thread_dispatching());

        s.schedule_task(push(&log, 2));
        s.dispatch_tasks().unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);
    }
}
