use crate::core::config::WorkerTimings;
use crate::core::error::StoreResult;
use crate::core::events::WorkerEvent;
use crate::core::model::{Task, TaskId, TaskPatch, TaskStatus};
use crate::core::store::TaskStore;
use crate::plugins::registry::DriverRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What `GET /api/worker_state` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_paused: bool,
    pub current_task_id: Option<TaskId>,
    pub restart_in_progress: bool,
    pub running: bool,
}

/// Single background scheduler. Takes PENDING tasks in id order and runs
/// each one to completion through the driver registry; never more than one
/// at a time.
///
/// Cheap to clone: every clone drives the same loop.
#[derive(Clone)]
pub struct Worker {
    store: TaskStore,
    registry: Arc<DriverRegistry>,
    timings: WorkerTimings,
    paused: Arc<AtomicBool>,
    restart_in_progress: Arc<AtomicBool>,
    current: Arc<Mutex<Option<(TaskId, CancellationToken)>>>,
    /// Held across claim plus `current` publication, and across healing.
    claim_gate: Arc<AsyncMutex<()>>,
    wake: Arc<Notify>,
    stop: Arc<Mutex<CancellationToken>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Worker {
    pub fn new(store: TaskStore, registry: Arc<DriverRegistry>, timings: WorkerTimings) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            store,
            registry,
            timings,
            paused: Arc::new(AtomicBool::new(false)),
            restart_in_progress: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
            claim_gate: Arc::new(AsyncMutex::new(())),
            wake: Arc::new(Notify::new()),
            stop: Arc::new(Mutex::new(CancellationToken::new())),
            handle: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Heals rows left DOWNLOADING by a previous process, then spawns the loop.
    /// A second call while running is a no-op.
    pub async fn start(&self) -> StoreResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.store.recover_stuck().await?;

        let mut slot = lock(&self.handle);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let stop = CancellationToken::new();
        *lock(&self.stop) = stop.clone();
        let me = self.clone();
        *slot = Some(tokio::spawn(async move { me.run_loop(stop).await }));
        Ok(())
    }

    /// Asks the loop to exit, cancels the in-flight task and waits for both.
    pub async fn stop(&self) {
        lock(&self.stop).cancel();
        self.cancel_current();
        let handle = lock(&self.handle).take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                error!(error = %e, "worker loop ended abnormally");
            }
        }
    }

    /// Blocks intake of new tasks. The in-flight task keeps running.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("worker paused");
            self.emit(WorkerEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("worker resumed");
            self.emit(WorkerEvent::Resumed);
        }
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        lock(&self.current).as_ref().map(|(id, _)| *id)
    }

    /// Signals the running driver to stop. Returns the task it was running,
    /// or `None` if the worker is idle.
    pub fn cancel_current(&self) -> Option<TaskId> {
        let current = lock(&self.current);
        let (id, token) = current.as_ref()?;
        token.cancel();
        info!(task_id = *id, "cancellation requested");
        Some(*id)
    }

    /// Heals orphaned DOWNLOADING rows. Queued and finished tasks are untouched.
    pub async fn restart(&self) -> StoreResult<u64> {
        let healed = {
            let _gate = self.claim_gate.lock().await;
            self.store.recover_stuck_except(self.current_task_id()).await?
        };
        info!(healed, "worker restart");
        self.wake.notify_one();
        Ok(healed)
    }

    /// Wipes every task and counter. The worker is paused for the duration so
    /// nothing is claimed mid-wipe; it stays paused if the wipe fails.
    pub async fn restart_all(&self) -> StoreResult<()> {
        self.restart_in_progress.store(true, Ordering::SeqCst);
        warn!("restart_all requested");
        self.pause();
        self.cancel_current();

        let wiped = self.store.reset_everything().await;
        self.restart_in_progress.store(false, Ordering::SeqCst);

        match &wiped {
            Ok(()) => {
                self.emit(WorkerEvent::QueueWiped);
                self.resume();
                info!("restart_all finished");
            }
            Err(e) => {
                error!(error = %e, "restart_all failed, worker left paused");
                self.emit(WorkerEvent::Error { scope: "restart_all".to_string(), message: e.to_string() });
            }
        }
        wiped
    }

    /// Wakes an idle loop right away instead of waiting for the next poll.
    pub fn notify_enqueued(&self) {
        self.wake.notify_one();
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_paused: self.is_paused(),
            current_task_id: self.current_task_id(),
            restart_in_progress: self.restart_in_progress.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }

    async fn nap(&self, stop: &CancellationToken, d: Duration) {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(d) => {}
        }
    }

    async fn backoff(&self, stop: &CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(self.timings.error_backoff) => {}
        }
    }

    async fn run_loop(&self, stop: CancellationToken) {
        info!(drivers = ?self.registry.names(), "worker started");
        self.emit(WorkerEvent::Started);

        while !stop.is_cancelled() {
            if self.is_paused() {
                self.nap(&stop, self.timings.paused_poll).await;
                continue;
            }

            let task = match self.store.next_pending().await {
                Ok(Some(t)) => t,
                Ok(None) => {
                    self.nap(&stop, self.timings.idle_poll).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "could not fetch next task");
                    self.emit(WorkerEvent::Error { scope: "next_pending".to_string(), message: e.to_string() });
                    self.backoff(&stop).await;
                    continue;
                }
            };

            // pause may have landed while we were reading
            if self.is_paused() || stop.is_cancelled() {
                continue;
            }

            let cancel = CancellationToken::new();
            let claimed = {
                let _gate = self.claim_gate.lock().await;
                let claimed = self.store.claim(task.id).await;
                if matches!(claimed, Ok(true)) {
                    *lock(&self.current) = Some((task.id, cancel.clone()));
                }
                claimed
            };

            match claimed {
                Ok(true) => self.run_task(task, cancel, &stop).await,
                Ok(false) => continue,
                Err(e) => {
                    error!(task_id = task.id, error = %e, "could not claim task");
                    self.backoff(&stop).await;
                }
            }
        }

        info!("worker stopped");
        self.emit(WorkerEvent::Stopped);
    }

    /// Expects `current` to already hold `task`; clears it once the row is settled.
    async fn run_task(&self, task: Task, cancel: CancellationToken, stop: &CancellationToken) {
        info!(task_id = task.id, url = %task.url, source = task.source.as_str(), "task started");
        self.emit(WorkerEvent::TaskStarted { task_id: task.id, url: task.url.clone() });

        // a separate tokio task so a panicking driver cannot take the loop down
        let joined = {
            let registry = self.registry.clone();
            let store = self.store.clone();
            let task = task.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.dispatch(&task, &cancel, &store).await }).await
        };

        match joined {
            Ok(Ok(())) => {
                *lock(&self.current) = None;
                let status = self.store.get(task.id).await.ok().flatten().map(|t| t.status);
                info!(task_id = task.id, status = ?status, "task finished");
                self.emit(WorkerEvent::TaskFinished { task_id: task.id, status });
            }
            Ok(Err(e)) => {
                error!(task_id = task.id, error = %e, "store error during dispatch");
                self.mark_failed(task.id, &format!("store error: {e}")).await;
                *lock(&self.current) = None;
                self.emit(WorkerEvent::Error { scope: "dispatch".to_string(), message: e.to_string() });
                self.backoff(stop).await;
            }
            Err(join) => {
                let msg = panic_message(join);
                error!(task_id = task.id, error = %msg, "driver crashed");
                self.mark_failed(task.id, &format!("driver crashed: {msg}")).await;
                *lock(&self.current) = None;
                self.emit(WorkerEvent::TaskCrashed { task_id: task.id, message: msg });
                self.backoff(stop).await;
            }
        }
    }

    async fn mark_failed(&self, id: TaskId, msg: &str) {
        let patch = TaskPatch::status(TaskStatus::Error).with_error(msg);
        if let Err(e) = self.store.update_if(id, TaskStatus::Downloading, &patch).await {
            error!(task_id = id, error = %e, "could not mark task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{EnqueueOutcome, Mode, Source};
    use crate::core::store::tests::temp_store;
    use crate::plugins::registry::tests::{fake, FakeOutcome};
    use crate::plugins::registry::{MediaDriver, CANCELLED_MSG};
    use std::collections::HashMap;

    fn fast() -> WorkerTimings {
        WorkerTimings {
            idle_poll: Duration::from_millis(20),
            paused_poll: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        }
    }

    fn worker(store: &TaskStore, drivers: Vec<Arc<dyn MediaDriver>>) -> Worker {
        Worker::new(store.clone(), Arc::new(DriverRegistry::new(drivers)), fast())
    }

    async fn add(store: &TaskStore, url: &str) -> TaskId {
        match store.enqueue(url, Source::Api, Mode::Video).await.unwrap() {
            EnqueueOutcome::Queued(id) => id,
            EnqueueOutcome::Duplicate => panic!("duplicate {url}"),
        }
    }

    async fn wait_for_status(store: &TaskStore, id: TaskId, want: TaskStatus) {
        for _ in 0..300 {
            if store.get(id).await.unwrap().map(|t| t.status) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {want:?}");
    }

    async fn wait_for_current(w: &Worker) -> TaskId {
        for _ in 0..300 {
            if let Some(id) = w.current_task_id() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never picked up a task");
    }

    #[tokio::test]
    async fn processes_pending_in_fifo_order() {
        let (_dir, store) = temp_store().await;
        let a = add(&store, "https://ok.test/a").await;
        let b = add(&store, "https://ok.test/b").await;
        let c = add(&store, "https://bad.test/c").await;

        let w = worker(
            &store,
            vec![fake("ok", "ok.test", FakeOutcome::Complete), fake("bad", "bad.test", FakeOutcome::Fail)],
        );
        let mut events = w.subscribe();
        w.start().await.unwrap();

        let mut order = vec![];
        while order.len() < 3 {
            if let Ok(WorkerEvent::TaskStarted { task_id, .. }) = events.recv().await {
                order.push(task_id);
            }
        }
        assert_eq!(order, vec![a, b, c]);

        wait_for_status(&store, c, TaskStatus::Error).await;
        w.stop().await;
        assert_eq!(store.get(a).await.unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(store.get(b).await.unwrap().unwrap().status, TaskStatus::Completed);
        assert!(!w.is_running());
    }

    #[tokio::test]
    async fn start_heals_stuck_rows() {
        let (_dir, store) = temp_store().await;
        let id = add(&store, "https://ok.test/stuck").await;
        store.claim(id).await.unwrap();

        let w = worker(&store, vec![fake("ok", "", FakeOutcome::Complete)]);
        w.start().await.unwrap();
        wait_for_status(&store, id, TaskStatus::Completed).await;
        w.stop().await;
    }

    #[tokio::test]
    async fn pause_holds_new_tasks_until_resume() {
        let (_dir, store) = temp_store().await;
        let w = worker(&store, vec![fake("ok", "", FakeOutcome::Complete)]);
        w.pause();
        w.start().await.unwrap();

        let id = add(&store, "https://ok.test/held").await;
        w.notify_enqueued();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert!(w.snapshot().worker_paused);

        w.resume();
        wait_for_status(&store, id, TaskStatus::Completed).await;
        w.stop().await;
    }

    #[tokio::test]
    async fn cancel_current_ends_cancelled() {
        let (_dir, store) = temp_store().await;
        let w = worker(&store, vec![fake("slow", "", FakeOutcome::WaitForCancel)]);
        assert_eq!(w.cancel_current(), None);

        let id = add(&store, "https://slow.test/1").await;
        w.start().await.unwrap();
        assert_eq!(wait_for_current(&w).await, id);
        assert_eq!(w.snapshot().current_task_id, Some(id));

        assert_eq!(w.cancel_current(), Some(id));
        wait_for_status(&store, id, TaskStatus::Cancelled).await;
        let t = store.get(id).await.unwrap().unwrap();
        assert_eq!(t.error_msg.as_deref(), Some(CANCELLED_MSG));
        w.stop().await;
    }

    #[tokio::test]
    async fn panicking_driver_does_not_stop_the_queue() {
        let (_dir, store) = temp_store().await;
        let boom = add(&store, "https://boom.test/1").await;
        let next = add(&store, "https://ok.test/2").await;

        let w = worker(
            &store,
            vec![fake("boom", "boom.test", FakeOutcome::Panic), fake("ok", "", FakeOutcome::Complete)],
        );
        w.start().await.unwrap();
        wait_for_status(&store, next, TaskStatus::Completed).await;

        let t = store.get(boom).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Error);
        assert_eq!(t.error_msg.as_deref(), Some("driver crashed: driver bug"));
        assert!(w.is_running());
        w.stop().await;
    }

    #[tokio::test]
    async fn restart_all_wipes_queue_and_resumes() {
        let (_dir, store) = temp_store().await;
        let w = worker(&store, vec![fake("slow", "", FakeOutcome::WaitForCancel)]);
        add(&store, "https://slow.test/1").await;
        add(&store, "https://slow.test/2").await;
        w.start().await.unwrap();
        wait_for_current(&w).await;

        w.restart_all().await.unwrap();
        let snap = w.snapshot();
        assert!(!snap.worker_paused);
        assert!(!snap.restart_in_progress);
        assert!(store.counters().await.unwrap().is_empty());

        w.stop().await;
        assert!(store.list_tasks(10, 0).await.unwrap().is_empty());
        assert_eq!(add(&store, "https://slow.test/3").await, 1);
        assert_eq!(store.get(1).await.unwrap().unwrap().local_id, 1);
    }

    #[tokio::test]
    async fn restart_spares_the_running_task() {
        let (_dir, store) = temp_store().await;
        let w = worker(&store, vec![fake("slow", "", FakeOutcome::WaitForCancel)]);
        let id = add(&store, "https://slow.test/1").await;
        w.start().await.unwrap();
        wait_for_current(&w).await;

        assert_eq!(w.restart().await.unwrap(), 0);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Downloading);
        w.stop().await;
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn restart_racing_the_loop_never_redispatches() {
        let (_dir, store) = temp_store().await;
        for i in 0..20 {
            add(&store, &format!("https://ok.test/{i}")).await;
        }
        let w = worker(&store, vec![fake("ok", "", FakeOutcome::CompleteAfter(30))]);
        let mut events = w.subscribe();
        w.start().await.unwrap();

        let hammer = {
            let w = w.clone();
            tokio::spawn(async move {
                loop {
                    w.restart().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut started: HashMap<TaskId, usize> = HashMap::new();
        let mut finished = 0;
        while finished < 20 {
            match events.recv().await.unwrap() {
                WorkerEvent::TaskStarted { task_id, .. } => *started.entry(task_id).or_default() += 1,
                WorkerEvent::TaskFinished { task_id, status } => {
                    assert_eq!(status, Some(TaskStatus::Completed), "task {task_id}");
                    finished += 1;
                }
                _ => {}
            }
        }
        hammer.abort();
        w.stop().await;

        assert_eq!(started.len(), 20);
        assert!(started.values().all(|n| *n == 1), "dispatch counts: {started:?}");
    }
}
