use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jervis_core::staging::StagingStore;
use jervis_core::types::{ProcessingMode, Task, TaskState};
use tracing::{info, warn};
use uuid::Uuid;

/// Summary of a single stale-recovery sweep.
#[derive(Debug, Clone, Default)]
pub struct PatrolReport {
    pub rewound_qualifying: u32,
    pub rewound_dispatched_gpu: u32,
    pub rewound_python_orchestrating: u32,
    pub rewound_task_ids: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// Rewinds tasks stuck in a non-terminal, in-flight state past the stale
/// threshold back to the state a fresh worker can pick up from.
///
/// - `QUALIFYING` tasks that have sat longer than the threshold are assumed
///   to belong to a qualifier worker that died mid-call; they go back to
///   `READY_FOR_QUALIFICATION` so `next_for_qualification` picks them up again
///   (subject to the qualification backoff already recorded on the task).
/// - `DISPATCHED_GPU` background tasks are assumed abandoned by a crashed
///   execution loop and rewind to `READY_FOR_GPU`. Foreground tasks are left
///   alone: a foreground dispatch means a human is actively waiting on it,
///   and silently re-queuing it would duplicate work already in flight.
/// - `PYTHON_ORCHESTRATING` tasks rewind to `READY_FOR_GPU` and drop their
///   `orchestrator_thread_id`, since the orchestrator thread that owned them
///   is gone.
pub struct PatrolRunner {
    stale_threshold: ChronoDuration,
}

impl PatrolRunner {
    pub fn new(stale_threshold_secs: u64) -> Self {
        Self {
            stale_threshold: ChronoDuration::seconds(stale_threshold_secs as i64),
        }
    }

    pub fn with_stale_threshold(mut self, threshold: ChronoDuration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub async fn run_patrol(&self, store: &StagingStore) -> Result<PatrolReport> {
        let now = Utc::now();
        let mut report = PatrolReport {
            timestamp: now,
            ..Default::default()
        };

        report.rewound_qualifying = self
            .rewind_stale(
                store,
                TaskState::Qualifying,
                TaskState::ReadyForQualification,
                now,
                &mut report.rewound_task_ids,
                |_| true,
            )
            .await?;

        report.rewound_dispatched_gpu = self
            .rewind_stale(
                store,
                TaskState::DispatchedGpu,
                TaskState::ReadyForGpu,
                now,
                &mut report.rewound_task_ids,
                |t| t.processing_mode == ProcessingMode::Background,
            )
            .await?;

        report.rewound_python_orchestrating = self
            .rewind_python_orchestrating(store, now, &mut report.rewound_task_ids)
            .await?;

        Ok(report)
    }

    async fn rewind_stale(
        &self,
        store: &StagingStore,
        from: TaskState,
        to: TaskState,
        now: DateTime<Utc>,
        rewound_ids: &mut Vec<Uuid>,
        eligible: impl Fn(&Task) -> bool,
    ) -> Result<u32> {
        let candidates = store
            .tasks_in_state(from)
            .await
            .map_err(|e| anyhow::anyhow!("failed to list tasks in state {:?}: {}", from, e))?;

        let mut rewound = 0u32;
        for task in candidates {
            if !eligible(&task) {
                continue;
            }
            if now - task.created_at < self.stale_threshold {
                continue;
            }
            let ok = store
                .cas_task_state(task.id, from, to)
                .await
                .map_err(|e| anyhow::anyhow!("failed to rewind task {}: {}", task.id, e))?;
            if ok {
                warn!(task_id = %task.id, from = ?from, to = ?to, "stale task rewound");
                rewound_ids.push(task.id);
                rewound += 1;
            }
        }
        Ok(rewound)
    }

    async fn rewind_python_orchestrating(
        &self,
        store: &StagingStore,
        now: DateTime<Utc>,
        rewound_ids: &mut Vec<Uuid>,
    ) -> Result<u32> {
        let candidates = store
            .tasks_in_state(TaskState::PythonOrchestrating)
            .await
            .map_err(|e| anyhow::anyhow!("failed to list orchestrating tasks: {}", e))?;

        let mut rewound = 0u32;
        for mut task in candidates {
            if now - task.created_at < self.stale_threshold {
                continue;
            }
            let ok = store
                .cas_task_state(task.id, TaskState::PythonOrchestrating, TaskState::ReadyForGpu)
                .await
                .map_err(|e| anyhow::anyhow!("failed to rewind task {}: {}", task.id, e))?;
            if ok {
                task.state = TaskState::ReadyForGpu;
                task.orchestrator_thread_id = None;
                store
                    .upsert_task(&task)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to clear orchestrator thread id: {}", e))?;
                warn!(task_id = %task.id, "orchestrator-abandoned task rewound to READY_FOR_GPU");
                rewound_ids.push(task.id);
                rewound += 1;
            }
        }
        Ok(rewound)
    }
}

pub fn log_report(report: &PatrolReport) {
    info!(
        rewound_qualifying = report.rewound_qualifying,
        rewound_dispatched_gpu = report.rewound_dispatched_gpu,
        rewound_python_orchestrating = report.rewound_python_orchestrating,
        "patrol completed"
    );
}
