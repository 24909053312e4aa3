use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::store::{self, DocumentStore, keys};

/// One unit of scheduled work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns a short human summary for the task log.
    async fn run(&self) -> Result<String>;
}

/// Static task registration: name, cadence, default gate.
pub struct TaskDef {
    pub name: &'static str,
    pub period: Duration,
    pub default_enabled: bool,
    pub handler: Arc<dyn TaskHandler>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<TaskRun>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(TaskRun),
    /// Another execution of the same task is in flight; this call was
    /// rejected in its favor rather than queued.
    AlreadyRunning,
}

#[derive(Default)]
struct TaskState {
    last_run_at: Option<DateTime<Utc>>,
    last_result: Option<TaskRun>,
    next_run_at: Option<DateTime<Utc>>,
}

struct TaskEntry {
    def: TaskDef,
    enabled: AtomicBool,
    state: Mutex<TaskState>,
    flight: tokio::sync::Mutex<()>,
}

/// Owns the background task registry and its timers.
///
/// Constructed once at process start and shared by handle; there is no
/// process-global state. Each task ticks on its own timer, failures are
/// recorded per task and never escape, and executions of the same task
/// never overlap.
pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    tasks: Vec<Arc<TaskEntry>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Build the scheduler from the static registry, applying persisted
    /// enable/disable overrides so the flag survives restarts.
    pub async fn new(store: Arc<dyn DocumentStore>, defs: Vec<TaskDef>) -> Result<Self> {
        let overrides: BTreeMap<String, bool> =
            store::get_doc(store.as_ref(), keys::SCHEDULER_TASKS)
                .await?
                .unwrap_or_default();

        let tasks = defs
            .into_iter()
            .map(|def| {
                let enabled = overrides.get(def.name).copied().unwrap_or(def.default_enabled);
                Arc::new(TaskEntry {
                    enabled: AtomicBool::new(enabled),
                    state: Mutex::new(TaskState::default()),
                    flight: tokio::sync::Mutex::new(()),
                    def,
                })
            })
            .collect();

        Ok(Self {
            store,
            tasks,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn one timer loop per task. Tasks first fire a full period after
    /// start, with a little jitter so they do not tick in lockstep.
    pub fn start(&self) {
        for entry in &self.tasks {
            let entry = entry.clone();
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                let period = entry.def.period;
                let jitter_cap = (period.as_millis() / 10).max(1) as u64;
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
                info!(task = entry.def.name, period = ?period, "task timer started");

                loop {
                    let delay = period + jitter;
                    if let Ok(mut state) = entry.state.lock() {
                        state.next_run_at = Some(
                            Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero()),
                        );
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    if !entry.enabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    Self::execute(&entry).await;
                }
                info!(task = entry.def.name, "task timer stopped");
            });
        }
    }

    /// Execute a task immediately, out of band from its timer. Works even
    /// while the task is disabled. Single-flight per task: a call that
    /// finds an execution in flight is rejected in its favor.
    pub async fn run_now(&self, name: &str) -> Result<RunOutcome> {
        let entry = self.entry(name)?;
        Ok(Self::execute(&entry).await)
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    /// Stops the timer from firing; does not cancel a running execution.
    pub async fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        self.tasks
            .iter()
            .map(|entry| {
                let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                TaskStatus {
                    name: entry.def.name,
                    enabled: entry.enabled.load(Ordering::SeqCst),
                    last_run_at: state.last_run_at,
                    last_result: state.last_result.clone(),
                    next_run_at: state.next_run_at,
                }
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn execute(entry: &Arc<TaskEntry>) -> RunOutcome {
        let Ok(_guard) = entry.flight.try_lock() else {
            warn!(task = entry.def.name, "execution already in flight, rejecting");
            return RunOutcome::AlreadyRunning;
        };

        let started = Utc::now();
        let handler = entry.def.handler.clone();
        // The handler runs in its own task so even a panic is contained
        // and recorded instead of taking the timer loop down.
        let run = match tokio::spawn(async move { handler.run().await }).await {
            Ok(Ok(detail)) => {
                info!(task = entry.def.name, detail = %detail, "task succeeded");
                TaskRun {
                    success: true,
                    detail,
                }
            }
            Ok(Err(e)) => {
                error!(task = entry.def.name, error = %e, "task failed");
                TaskRun {
                    success: false,
                    detail: e.to_string(),
                }
            }
            Err(join_error) => {
                error!(task = entry.def.name, error = %join_error, "task panicked");
                TaskRun {
                    success: false,
                    detail: format!("task panicked: {join_error}"),
                }
            }
        };

        if let Ok(mut state) = entry.state.lock() {
            state.last_run_at = Some(started);
            state.last_result = Some(run.clone());
        }
        RunOutcome::Completed(run)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let entry = self.entry(name)?;
        entry.enabled.store(enabled, Ordering::SeqCst);

        let task_name = name.to_string();
        store::merge_doc(
            self.store.as_ref(),
            keys::SCHEDULER_TASKS,
            move |mut overrides: BTreeMap<String, bool>| {
                overrides.insert(task_name.clone(), enabled);
                overrides
            },
        )
        .await
        .map(|_: BTreeMap<String, bool>| ())
    }

    fn entry(&self, name: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .iter()
            .find(|entry| entry.def.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("task {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        runs: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl TaskHandler for CountingTask {
        async fn run(&self) -> Result<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("run #{n}"))
        }
    }

    struct FailingTask;

    #[async_trait]
    impl TaskHandler for FailingTask {
        async fn run(&self) -> Result<String> {
            Err(Error::external("upstream", "boom"))
        }
    }

    struct PanickingTask;

    #[async_trait]
    impl TaskHandler for PanickingTask {
        async fn run(&self) -> Result<String> {
            panic!("handler bug");
        }
    }

    fn counting_def(
        name: &'static str,
        period: Duration,
        enabled: bool,
        delay: Option<Duration>,
    ) -> (TaskDef, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let def = TaskDef {
            name,
            period,
            default_enabled: enabled,
            handler: Arc::new(CountingTask {
                runs: runs.clone(),
                delay,
            }),
        };
        (def, runs)
    }

    async fn scheduler_with(defs: Vec<TaskDef>) -> Scheduler {
        Scheduler::new(Arc::new(MemoryStore::new()), defs)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_enabled_task() {
        let (def, runs) = counting_def("tick", Duration::from_secs(60), true, None);
        let scheduler = scheduler_with(vec![def]).await;
        scheduler.start();
        // let the timer loop register its sleep before moving the clock
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(Duration::from_secs(150)).await;
        tokio::task::yield_now().await;
        assert!(runs.load(Ordering::SeqCst) >= 1);

        let status = &scheduler.status()[0];
        assert!(status.last_run_at.is_some());
        assert!(status.last_result.as_ref().unwrap().success);
        assert!(status.next_run_at.is_some());
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_stops_timer_but_run_now_still_works() {
        let (def, runs) = counting_def("tick", Duration::from_secs(60), true, None);
        let scheduler = scheduler_with(vec![def]).await;
        scheduler.disable("tick").await.unwrap();
        // status reflects the flag immediately
        assert!(!scheduler.status()[0].enabled);

        scheduler.start();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // on-demand execution ignores the gate
        let outcome = scheduler.run_now("tick").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(TaskRun { success: true, .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_does_not_starve_others() {
        let (good_def, good_runs) = counting_def("healthy", Duration::from_secs(60), true, None);
        let bad_def = TaskDef {
            name: "broken",
            period: Duration::from_secs(60),
            default_enabled: true,
            handler: Arc::new(FailingTask),
        };
        let scheduler = scheduler_with(vec![bad_def, good_def]).await;
        scheduler.start();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(Duration::from_secs(150)).await;
        tokio::task::yield_now().await;

        assert!(good_runs.load(Ordering::SeqCst) >= 1);
        let status = scheduler.status();
        let broken = status.iter().find(|s| s.name == "broken").unwrap();
        let result = broken.last_result.as_ref().unwrap();
        assert!(!result.success);
        assert!(result.detail.contains("boom"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let def = TaskDef {
            name: "panics",
            period: Duration::from_secs(60),
            default_enabled: true,
            handler: Arc::new(PanickingTask),
        };
        let scheduler = scheduler_with(vec![def]).await;

        let outcome = scheduler.run_now("panics").await.unwrap();
        let RunOutcome::Completed(run) = outcome else {
            panic!("expected completion");
        };
        assert!(!run.success);
        assert!(run.detail.contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_is_single_flight() {
        let (def, runs) = counting_def(
            "slow",
            Duration::from_secs(3600),
            true,
            Some(Duration::from_secs(10)),
        );
        let scheduler = Arc::new(scheduler_with(vec![def]).await);

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_now("slow").await })
        };
        // let the first call claim the flight lock
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let second = scheduler.run_now("slow").await.unwrap();
        assert!(matches!(second, RunOutcome::AlreadyRunning));

        tokio::time::advance(Duration::from_secs(11)).await;
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RunOutcome::Completed(_)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_now_unknown_task_is_not_found() {
        let scheduler = scheduler_with(vec![]).await;
        let err = scheduler.run_now("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_enabled_flag_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let (def, _) = counting_def("tick", Duration::from_secs(60), true, None);
        let scheduler = Scheduler::new(store.clone(), vec![def]).await.unwrap();
        scheduler.disable("tick").await.unwrap();
        drop(scheduler);

        let (def, _) = counting_def("tick", Duration::from_secs(60), true, None);
        let restarted = Scheduler::new(store, vec![def]).await.unwrap();
        assert!(!restarted.status()[0].enabled);
    }
}
