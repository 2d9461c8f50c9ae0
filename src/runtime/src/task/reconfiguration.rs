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

//! In-band reconfiguration.
//!
//! A reconfiguration message is enqueued once per worker thread. Every worker
//! arrives at the message's barrier before the per-thread callback runs, so
//! all P workers observe the change; the last worker to finish runs the
//! post-callback and wakes a blocking issuer. Because the copies ride the
//! shared task queue, a reconfiguration observes the task order at the time
//! it was issued.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use nebulastream_common::types::QuerySubPlanId;

use crate::error::Result;
use crate::executor::stage::WorkerContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconfigurationType {
    /// Run per-thread stage setup when a plan starts.
    Initialize,
    /// Propagate updated operator configuration.
    Update,
    /// Tear down a stopped plan once all in-flight tasks completed.
    Destroy,
    /// Release the resources of a failed plan.
    Fail,
}

/// Callbacks invoked while a reconfiguration message passes the worker pool.
pub trait Reconfigurable: Send + Sync {
    /// Runs on every worker thread after the barrier opens.
    fn reconfigure(
        &self,
        _message: &ReconfigurationMessage,
        _worker: &mut WorkerContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs exactly once, on the last worker finishing the per-thread phase.
    fn post_reconfiguration(&self, _message: &ReconfigurationMessage) -> Result<()> {
        Ok(())
    }
}

struct BarrierState {
    arrived: usize,
    departed: usize,
    done: bool,
}

pub struct ReconfigurationMessage {
    plan_id: QuerySubPlanId,
    kind: ReconfigurationType,
    instance: Arc<dyn Reconfigurable>,
    threads: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl ReconfigurationMessage {
    pub fn new(
        plan_id: QuerySubPlanId,
        kind: ReconfigurationType,
        instance: Arc<dyn Reconfigurable>,
        threads: usize,
    ) -> Arc<Self> {
        assert!(threads > 0, "reconfiguration needs at least one worker");
        Arc::new(Self {
            plan_id,
            kind,
            instance,
            threads,
            state: Mutex::new(BarrierState {
                arrived: 0,
                departed: 0,
                done: false,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn plan_id(&self) -> QuerySubPlanId {
        self.plan_id
    }

    pub fn kind(&self) -> ReconfigurationType {
        self.kind
    }

    /// Arrive phase: parks until all worker threads hold a copy.
    fn await_all_workers(&self) {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived == self.threads {
            self.cv.notify_all();
        } else {
            while state.arrived < self.threads {
                self.cv.wait(&mut state);
            }
        }
    }

    /// Depart phase: returns true for the last worker out.
    fn depart(&self) -> bool {
        let mut state = self.state.lock();
        state.departed += 1;
        state.departed == self.threads
    }

    fn mark_done(&self) {
        let mut state = self.state.lock();
        state.done = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Full per-worker protocol: barrier, per-thread callback, and on the
    /// last worker the post-callback. Callback failures are logged; they must
    /// not wedge the barrier.
    pub(crate) fn execute(self: &Arc<Self>, worker: &mut WorkerContext) {
        self.await_all_workers();
        if let Err(error) = self.instance.reconfigure(self, worker) {
            tracing::error!(
                plan_id = %self.plan_id,
                worker_id = worker.worker_id(),
                %error,
                "reconfiguration callback failed",
            );
        }
        if self.depart() {
            if let Err(error) = self.instance.post_reconfiguration(self) {
                tracing::error!(plan_id = %self.plan_id, %error, "post-reconfiguration failed");
            }
            self.mark_done();
        }
    }

    /// Blocks the issuer until the post-callback has run.
    pub fn wait_for_completion(&self) {
        let mut state = self.state.lock();
        while !state.done {
            self.cv.wait(&mut state);
        }
    }
}
