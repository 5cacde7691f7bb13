// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A single-consumer deferred work queue, modelled on `taskq(9F)`.
//!
//! Callers which must not block (such as the datapath) dispatch work
//! onto the queue and return immediately. A dedicated worker thread
//! runs tasks in dispatch order.

use super::sync::KCondvar;
use super::sync::KMutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TaskQState {
    queue: VecDeque<Task>,
    dispatched: u64,
    completed: u64,
    panicked: u64,
    shutdown: bool,
}

struct TaskQInner {
    name: String,
    state: KMutex<TaskQState>,
    work_cv: KCondvar,
    done_cv: KCondvar,
    worker: OnceLock<ThreadId>,
}

impl TaskQInner {
    fn on_worker(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    fn run(&self) {
        let _ = self.worker.set(thread::current().id());
        let mut state = self.state.lock();

        loop {
            if let Some(task) = state.queue.pop_front() {
                drop(state);
                let res = std::panic::catch_unwind(AssertUnwindSafe(task));
                state = self.state.lock();
                state.completed += 1;
                if res.is_err() {
                    state.panicked += 1;
                }
                self.done_cv.notify_all();
                continue;
            }

            if state.shutdown {
                break;
            }

            state = self.work_cv.wait(state);
        }
    }
}

/// A cloneable handle used to dispatch onto, and flush, a [`TaskQ`].
#[derive(Clone)]
pub struct TaskQHandle {
    inner: Arc<TaskQInner>,
}

impl TaskQHandle {
    /// Queue `task` for execution on the worker thread.
    ///
    /// Once the queue has begun shutting down the task is handed
    /// back to the caller.
    pub fn dispatch(&self, task: Task) -> Result<(), Task> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(task);
        }
        state.queue.push_back(task);
        state.dispatched += 1;
        self.inner.work_cv.notify_one();
        Ok(())
    }

    /// Wait for every task dispatched before this call to finish.
    ///
    /// A flush issued from a task running on the queue itself returns
    /// immediately rather than waiting on itself.
    pub fn flush(&self) {
        if self.inner.on_worker() {
            return;
        }

        let mut state = self.inner.state.lock();
        let target = state.dispatched;
        while state.completed < target {
            state = self.inner.done_cv.wait(state);
        }
    }

    /// The number of dispatched tasks which have not yet completed.
    pub fn pending(&self) -> u64 {
        let state = self.inner.state.lock();
        state.dispatched - state.completed
    }

    /// The number of tasks which panicked while running.
    pub fn panicked(&self) -> u64 {
        self.inner.state.lock().panicked
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// The owner of the worker thread. Dropping the queue runs every task
/// already dispatched and then joins the worker.
pub struct TaskQ {
    handle: TaskQHandle,
    thread: Option<JoinHandle<()>>,
}

impl TaskQ {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let inner = Arc::new(TaskQInner {
            name: name.to_string(),
            state: KMutex::new(TaskQState::default()),
            work_cv: KCondvar::new(),
            done_cv: KCondvar::new(),
            worker: OnceLock::new(),
        });

        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run())?;

        Ok(Self { handle: TaskQHandle { inner }, thread: Some(thread) })
    }

    pub fn handle(&self) -> TaskQHandle {
        self.handle.clone()
    }

    pub fn flush(&self) {
        self.handle.flush()
    }
}

impl Drop for TaskQ {
    fn drop(&mut self) {
        {
            let mut state = self.handle.inner.state.lock();
            state.shutdown = true;
            self.handle.inner.work_cv.notify_all();
        }

        // The worker cannot join itself; it exits on its own once the
        // queue is empty.
        if self.handle.inner.on_worker() {
            return;
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    #[test]
    fn flush_waits_for_prior_tasks() {
        let tq = TaskQ::new("tq-flush").unwrap();
        let h = tq.handle();
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..16 {
            let count = count.clone();
            let task: Task = Box::new(move || {
                thread::sleep(std::time::Duration::from_millis(1));
                count.fetch_add(1, Ordering::SeqCst);
            });
            assert!(h.dispatch(task).is_ok());
        }

        h.flush();
        assert_eq!(count.load(Ordering::SeqCst), 16);
        assert_eq!(h.pending(), 0);
    }

    #[test]
    fn flush_from_worker_does_not_deadlock() {
        let tq = TaskQ::new("tq-self").unwrap();
        let h = tq.handle();
        let (tx, rx) = mpsc::channel();
        let h2 = h.clone();
        let task: Task = Box::new(move || {
            h2.flush();
            tx.send(()).unwrap();
        });
        assert!(h.dispatch(task).is_ok());
        rx.recv().unwrap();
    }

    #[test]
    fn drop_drains_and_rejects() {
        let count = Arc::new(AtomicU64::new(0));
        let tq = TaskQ::new("tq-drop").unwrap();
        let h = tq.handle();

        for _ in 0..4 {
            let count = count.clone();
            let _ = h.dispatch(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        drop(tq);
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(h.dispatch(Box::new(|| {})).is_err());
    }

    #[test]
    fn panicking_task_is_contained() {
        let tq = TaskQ::new("tq-panic").unwrap();
        let h = tq.handle();
        let _ = h.dispatch(Box::new(|| panic!("task failure")));
        let ran = Arc::new(AtomicU64::new(0));
        let ran2 = ran.clone();
        let _ = h.dispatch(Box::new(move || {
            ran2.store(1, Ordering::SeqCst);
        }));
        h.flush();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(h.panicked(), 1);
    }
}
