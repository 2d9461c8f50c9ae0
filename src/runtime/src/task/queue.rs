// Copyright 2025 NebulaStream
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The shared MPMC task queue.
//!
//! Producers (sources and pipelines emitting to successors) push at the back;
//! workers pop from the front, parking on a condvar when empty. There is no
//! per-origin affinity and no work stealing; ordering across origins is
//! recovered downstream by the watermark processor.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::task::Task;

pub(crate) enum Pop {
    Task(Task),
    /// The pool is shutting down; the caller must drain via `try_pop`.
    ShuttingDown,
}

struct QueueInner {
    tasks: VecDeque<Task>,
    running: bool,
}

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    nonempty: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                running: true,
            }),
            nonempty: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub(crate) fn push(&self, task: Task) {
        let mut inner = self.inner.lock();
        inner.tasks.push_back(task);
        drop(inner);
        self.nonempty.notify_one();
    }

    pub(crate) fn push_all(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut inner = self.inner.lock();
        inner.tasks.extend(tasks);
        drop(inner);
        self.nonempty.notify_all();
    }

    /// Blocking pop; parks while the queue is empty and the pool is running.
    pub(crate) fn pop(&self) -> Pop {
        let mut inner = self.inner.lock();
        loop {
            if !inner.running {
                return Pop::ShuttingDown;
            }
            if let Some(task) = inner.tasks.pop_front() {
                return Pop::Task(task);
            }
            self.nonempty.wait(&mut inner);
        }
    }

    pub(crate) fn try_pop(&self) -> Option<Task> {
        self.inner.lock().tasks.pop_front()
    }

    /// Stops the pool: parked workers wake up and switch to draining.
    pub fn stop(&self) {
        self.inner.lock().running = false;
        self.nonempty.notify_all();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
