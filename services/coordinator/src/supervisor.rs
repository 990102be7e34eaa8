//! Supervision for the long-running loops.
//!
//! Each loop is created from a factory so it can be rebuilt after a crash.
//! A loop that returns an error or panics is restarted with exponential
//! backoff; one that crashes more than the policy allows inside the restart
//! window is marked degraded and left stopped.

use std::future::Future;
use std::time::Instant;

use stack_reconcile::RestartPolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Lifecycle of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Restarting,
    /// Exited cleanly, usually on shutdown.
    Stopped,
    /// Crashed too often and will not be restarted.
    Degraded,
}

struct SupervisedTask {
    name: String,
    state: watch::Receiver<TaskState>,
    handle: JoinHandle<TaskState>,
}

/// Supervisor for the coordinator's loops.
pub struct TaskSupervisor {
    tasks: Vec<SupervisedTask>,
    restart_policy: RestartPolicy,
    shutdown: watch::Receiver<bool>,
}

impl TaskSupervisor {
    pub fn new(restart_policy: RestartPolicy, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            tasks: Vec::new(),
            restart_policy,
            shutdown,
        }
    }

    /// Spawn and supervise a task.
    ///
    /// `factory` is called once per attempt with a fresh shutdown receiver.
    pub fn spawn<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(TaskState::Running);
        let handle = tokio::spawn(supervise(
            name.to_string(),
            factory,
            self.restart_policy.clone(),
            self.shutdown.clone(),
            state_tx,
        ));

        info!(task = name, "Spawned supervised task");
        self.tasks.push(SupervisedTask {
            name: name.to_string(),
            state: state_rx,
            handle,
        });
    }

    /// Current state of every task.
    pub fn states(&self) -> Vec<(String, TaskState)> {
        self.tasks
            .iter()
            .map(|t| (t.name.clone(), *t.state.borrow()))
            .collect()
    }

    pub fn degraded_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| *t.state.borrow() == TaskState::Degraded)
            .count()
    }

    /// Wait for every task to finish and return their final states.
    pub async fn join(self) -> Vec<(String, TaskState)> {
        let mut finished = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            let state = match task.handle.await {
                Ok(state) => state,
                Err(e) => {
                    error!(task = %task.name, error = %e, "Supervisor task aborted");
                    TaskState::Degraded
                }
            };
            finished.push((task.name, state));
        }
        finished
    }
}

async fn supervise<F, Fut>(
    name: String,
    factory: F,
    policy: RestartPolicy,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<TaskState>,
) -> TaskState
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut restart_timestamps: Vec<Instant> = Vec::new();

    loop {
        state.send_replace(TaskState::Running);

        // Spawned separately so a panic surfaces as a join error.
        let attempt = tokio::spawn(factory(shutdown.clone())).await;

        let failure = match attempt {
            Ok(Ok(())) => {
                info!(task = %name, "Task stopped");
                state.send_replace(TaskState::Stopped);
                return TaskState::Stopped;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("task panicked: {e}"),
        };

        if *shutdown.borrow() {
            state.send_replace(TaskState::Stopped);
            return TaskState::Stopped;
        }

        let now = Instant::now();
        restart_timestamps.retain(|t| now.duration_since(*t) < policy.window);

        if restart_timestamps.len() >= policy.max_restarts as usize {
            error!(
                task = %name,
                error = %failure,
                restarts = restart_timestamps.len(),
                "Task exceeded max restarts, marking as degraded"
            );
            state.send_replace(TaskState::Degraded);
            return TaskState::Degraded;
        }

        let delay = policy.backoff.delay(restart_timestamps.len() as u32);
        warn!(
            task = %name,
            error = %failure,
            delay_ms = delay.as_millis() as u64,
            "Task failed, scheduling restart"
        );
        state.send_replace(TaskState::Restarting);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                state.send_replace(TaskState::Stopped);
                return TaskState::Stopped;
            }
        }

        restart_timestamps.push(Instant::now());
    }
}
