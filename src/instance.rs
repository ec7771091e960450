//! The scheduler state shared by every connection handler.
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::message::RunPayload;
use crate::{Error, Result};

/// Identifies one submitted run for its trip through the queues.
pub(crate) type TaskId = u64;

#[derive(Debug)]
/// A completed run and how it ended.
struct FinishedTask {
    /// What was executed.
    run: RunPayload,
    /// Exit state of the child, or `None` if it never launched.
    status: Option<ExitStatus>,
}

#[derive(Debug)]
/// The internal state of the scheduler.
struct State {
    /// Configured concurrency bound.
    parallel: i64,
    /// Currently available admission tokens. Goes negative when `shutdown`
    /// subtracts the whole bound, or when a reconfigure shrinks it below
    /// the number of tasks already running.
    slots: i64,
    /// Source of task ids.
    next_id: TaskId,
    /// Submitted but not yet admitted, in submission order.
    pending: Vec<TaskId>,
    /// Admitted and not yet finished.
    running: Vec<TaskId>,
    /// Completion log, in completion order. Never drained: every `wait`
    /// reports over the full history.
    finished: Vec<FinishedTask>,
    /// Whether any launch has ever failed.
    error_occurred: bool,
    /// Whether a shutdown request has been seen.
    shutting_down: bool,
    /// Whether the shutdown drain has finished.
    shutdown_complete: bool,
}

#[derive(Debug)]
/// State behind the lock plus the wakeups that coordinate waiters.
struct Shared {
    /// The scheduler state is guarded by a `std::sync::Mutex`.
    ///
    /// There is no need for `tokio::sync::Mutex` here, as no async
    /// operations are performed while the lock is held and the critical
    /// sections are very small.
    state: Mutex<State>,
    /// Woken when a slot is released or the bound changes; admission
    /// waiters block on this.
    slot_available: Notify,
    /// Woken on every completion; `wait` and `shutdown` block on this.
    task_finished: Notify,
    /// Woken once the shutdown drain finishes; the accept loop blocks on
    /// this.
    drained: Notify,
}

#[derive(Debug, Clone)]
/// Scheduler state shared across all connections.
///
/// An `Instance` is a handle to shared state. Cloning it is shallow and
/// only incurs an atomic ref count increment.
///
/// All waiting follows the same shape: register interest in the relevant
/// wakeup while the lock is held, release the lock, await, and recheck the
/// predicate in a loop. Waking is always allowed to be spurious.
pub struct Instance {
    shared: Arc<Shared>,
}

impl Instance {
    /// Create a scheduler with `parallel` admission slots.
    pub fn new(parallel: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    parallel: i64::from(parallel),
                    slots: i64::from(parallel),
                    next_id: 0,
                    pending: Vec::new(),
                    running: Vec::new(),
                    finished: Vec::new(),
                    error_occurred: false,
                    shutting_down: false,
                    shutdown_complete: false,
                }),
                slot_available: Notify::new(),
                task_finished: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// Append a run to the pending queue.
    ///
    /// The returned id is handed to the background task that will admit,
    /// launch and complete the run. Rejected once shutdown has begun.
    pub(crate) fn submit(&self) -> Result<TaskId> {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutting_down {
            return Err(Error::ShuttingDown);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push(id);
        debug!(id, pending = state.pending.len(), "task queued");
        Ok(id)
    }

    /// Consume one admission slot, moving the task from `pending` to
    /// `running`. Blocks until a slot is available.
    ///
    /// Admission is not FIFO across tasks: a later submission may win the
    /// race for a freed slot. Submission order never determines completion
    /// order.
    pub(crate) async fn acquire_slot(&self, id: TaskId) {
        loop {
            let notified = self.shared.slot_available.notified();
            tokio::pin!(notified);
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.slots > 0 {
                    state.slots -= 1;
                    state.pending.retain(|task| *task != id);
                    state.running.push(id);
                    debug!(id, slots = state.slots, "task admitted");
                    return;
                }
                // Register before the lock drops so a release between
                // unlock and await still wakes us.
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Record a completion and release the task's slot.
    ///
    /// `status` is `None` when the child never launched; that marks the
    /// whole instance as having seen an error. Wakes one admission waiter
    /// and every `wait`/`shutdown` waiter.
    pub(crate) fn release_slot(&self, id: TaskId, run: RunPayload, status: Option<ExitStatus>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running.retain(|task| *task != id);
            if status.is_none() {
                state.error_occurred = true;
            }
            let task = FinishedTask { run, status };
            debug!(id, exe = %task.run.exe, slots = state.slots + 1, ?status, "task finished");
            state.finished.push(task);
            state.slots += 1;
        }
        self.shared.slot_available.notify_one();
        self.shared.task_finished.notify_waiters();
    }

    /// Block until nothing is pending or running, then report the
    /// aggregate exit status over the full completion history: 0 if every
    /// task succeeded, 1 if any exited non-zero, 2 if any failed to launch
    /// (launch failures dominate).
    pub async fn wait_drained(&self) -> i32 {
        loop {
            let notified = self.shared.task_finished.notified();
            tokio::pin!(notified);
            {
                let state = self.shared.state.lock().unwrap();
                if state.running.is_empty() && state.pending.is_empty() {
                    return aggregate_exit_status(&state);
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Change the parallelism bound.
    ///
    /// Growing frees slots immediately; shrinking withdraws them, which
    /// can push `slots` negative while more tasks than the new bound are
    /// still running. Admission then stays blocked until enough
    /// completions have paid the debt back.
    pub fn reconfigure(&self, parallel: Option<i64>) {
        if let Some(parallel) = parallel {
            {
                let mut state = self.shared.state.lock().unwrap();
                let diff = state.parallel - parallel;
                state.slots -= diff;
                state.parallel = parallel;
                debug!(parallel, slots = state.slots, "reconfigured");
            }
            self.shared.slot_available.notify_waiters();
        }
    }

    /// Stop admitting work, wait for every running task to finish, and
    /// mark the instance drained.
    ///
    /// Subtracting the whole bound up front makes admission impossible for
    /// the rest of the instance's life: completions only raise `slots`
    /// back to zero, exactly when the last running task ends.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.shutting_down {
                state.shutting_down = true;
                state.slots -= state.parallel;
                debug!(slots = state.slots, "shutdown begun");
            }
        }
        loop {
            let notified = self.shared.task_finished.notified();
            tokio::pin!(notified);
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.slots >= 0 {
                    state.shutdown_complete = true;
                    break;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
        debug!("shutdown drain complete");
        self.shared.drained.notify_waiters();
    }

    /// Block until the shutdown drain has finished.
    pub(crate) async fn shutdown_complete(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            {
                let state = self.shared.state.lock().unwrap();
                if state.shutdown_complete {
                    return;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    pub(crate) fn is_shutdown_complete(&self) -> bool {
        self.shared.state.lock().unwrap().shutdown_complete
    }
}

/// 2 if any launch failed, else 1 if any child reported non-success, else 0.
fn aggregate_exit_status(state: &State) -> i32 {
    if state.error_occurred {
        2
    } else if state
        .finished
        .iter()
        .any(|task| task.status.is_some_and(|status| !status.success()))
    {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const SOON: Duration = Duration::from_millis(50);

    fn exit(code: i32) -> ExitStatus {
        // Raw wait status: exit code in the high byte.
        ExitStatus::from_raw(code << 8)
    }

    fn payload(tag: &str) -> RunPayload {
        RunPayload {
            exe: format!("/bin/{tag}"),
            args: vec![tag.to_string()],
            env: Vec::new(),
            cwd: "/".to_string(),
        }
    }

    impl Instance {
        fn running_len(&self) -> usize {
            self.shared.state.lock().unwrap().running.len()
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_bound() {
        let instance = Instance::new(2);
        let observed_max = Arc::new(AtomicI64::new(0));
        let in_flight = Arc::new(AtomicI64::new(0));

        let mut workers = Vec::new();
        for _ in 0..5 {
            let instance = instance.clone();
            let observed_max = Arc::clone(&observed_max);
            let in_flight = Arc::clone(&in_flight);
            workers.push(tokio::spawn(async move {
                let id = instance.submit().unwrap();
                instance.acquire_slot(id).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                assert!(instance.running_len() <= 2);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                instance.release_slot(id, payload("sleep"), Some(exit(0)));
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert!(observed_max.load(Ordering::SeqCst) <= 2);
        assert_eq!(instance.wait_drained().await, 0);
    }

    #[tokio::test]
    async fn aggregate_status_prefers_launch_failures() {
        let instance = Instance::new(4);

        let id = instance.submit().unwrap();
        instance.acquire_slot(id).await;
        instance.release_slot(id, payload("true"), Some(exit(0)));
        assert_eq!(instance.wait_drained().await, 0);

        let id = instance.submit().unwrap();
        instance.acquire_slot(id).await;
        instance.release_slot(id, payload("false"), Some(exit(1)));
        assert_eq!(instance.wait_drained().await, 1);

        // A launch failure dominates every child exit code.
        let id = instance.submit().unwrap();
        instance.acquire_slot(id).await;
        instance.release_slot(id, payload("missing"), None);
        assert_eq!(instance.wait_drained().await, 2);

        let id = instance.submit().unwrap();
        instance.acquire_slot(id).await;
        instance.release_slot(id, payload("true"), Some(exit(0)));
        assert_eq!(instance.wait_drained().await, 2);
    }

    #[tokio::test]
    async fn wait_is_idempotent_on_a_steady_instance() {
        let instance = Instance::new(1);
        let id = instance.submit().unwrap();
        instance.acquire_slot(id).await;
        instance.release_slot(id, payload("false"), Some(exit(7)));

        assert_eq!(instance.wait_drained().await, 1);
        assert_eq!(instance.wait_drained().await, 1);
    }

    #[tokio::test]
    async fn wait_blocks_until_pending_work_is_admitted_and_finished() {
        let instance = Instance::new(1);
        let id = instance.submit().unwrap();

        // Not admitted yet, so wait must not return.
        assert!(timeout(SOON, instance.wait_drained()).await.is_err());

        instance.acquire_slot(id).await;
        assert!(timeout(SOON, instance.wait_drained()).await.is_err());

        instance.release_slot(id, payload("true"), Some(exit(0)));
        assert_eq!(timeout(SOON, instance.wait_drained()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn growing_the_bound_unblocks_admission() {
        let instance = Instance::new(1);

        let first = instance.submit().unwrap();
        instance.acquire_slot(first).await;

        let second = instance.submit().unwrap();
        let blocked = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.acquire_slot(second).await })
        };
        tokio::time::sleep(SOON).await;
        assert!(!blocked.is_finished());

        instance.reconfigure(Some(3));
        timeout(SOON, blocked).await.unwrap().unwrap();
        assert_eq!(instance.running_len(), 2);
    }

    #[tokio::test]
    async fn shrinking_the_bound_withdraws_slots_until_completions_repay() {
        let instance = Instance::new(2);
        let first = instance.submit().unwrap();
        let second = instance.submit().unwrap();
        instance.acquire_slot(first).await;
        instance.acquire_slot(second).await;

        instance.reconfigure(Some(1));

        let third = instance.submit().unwrap();
        let blocked = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.acquire_slot(third).await })
        };

        // One completion only brings the debt back to zero.
        instance.release_slot(first, payload("a"), Some(exit(0)));
        tokio::time::sleep(SOON).await;
        assert!(!blocked.is_finished());

        // The next completion frees a real slot.
        instance.release_slot(second, payload("b"), Some(exit(0)));
        timeout(SOON, blocked).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_tasks_and_blocks_new_ones() {
        let instance = Instance::new(3);
        let id = instance.submit().unwrap();
        instance.acquire_slot(id).await;

        let drain = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.shutdown().await })
        };
        tokio::time::sleep(SOON).await;
        assert!(!drain.is_finished());

        // New work is rejected the moment shutdown begins.
        assert!(matches!(instance.submit(), Err(Error::ShuttingDown)));

        instance.release_slot(id, payload("sleep"), Some(exit(0)));
        timeout(SOON, drain).await.unwrap().unwrap();
        assert!(instance.is_shutdown_complete());
        assert_eq!(instance.running_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_with_nothing_running_completes_at_once() {
        let instance = Instance::new(2);
        timeout(SOON, instance.shutdown()).await.unwrap();
        timeout(SOON, instance.shutdown_complete()).await.unwrap();
    }
}
