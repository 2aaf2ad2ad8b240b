//! The per-butler scheduler.

use async_trait::async_trait;
use butlers_config::{DispatchMode, ScheduleConfig};
use butlers_core::{ButlerName, TriggerSource};
use butlers_storage::{SessionStore, TaskRecord, TaskStore, TriggerAuditRecord};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cron::CronSchedule;
use crate::error::SchedulerResult;
use crate::jobs::JobRegistry;
use crate::stagger::stagger_offset;

/// Seam through which prompt-mode tasks reach the spawner.
#[async_trait]
pub trait PromptDispatcher: Send + Sync {
    /// Dispatch one prompt turn; errors propagate as session errors and do
    /// not block the scheduler.
    async fn dispatch_prompt(&self, prompt: &str) -> Result<(), String>;
}

/// What one `tick()` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TickReport {
    /// Tasks fired this tick.
    pub fired: Vec<String>,
    /// Tasks that were due but lost the firing CAS (another ticker won).
    pub lost_race: Vec<String>,
    /// Tasks whose handler or dispatch failed (still rescheduled).
    pub failed: Vec<String>,
}

/// Cron-driven task scheduling for one butler.
pub struct Scheduler {
    butler: ButlerName,
    store: Arc<dyn TaskStore>,
    jobs: JobRegistry,
    dispatcher: Arc<dyn PromptDispatcher>,
    /// Audit sink; every firing writes a trigger-log row.
    audit: Arc<dyn SessionStore>,
}

impl Scheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        butler: ButlerName,
        store: Arc<dyn TaskStore>,
        jobs: JobRegistry,
        dispatcher: Arc<dyn PromptDispatcher>,
        audit: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            butler,
            store,
            jobs,
            dispatcher,
            audit,
        }
    }

    /// Load declared schedules, validating cron lines and initializing
    /// `next_run_at` (staggered) where unset.
    ///
    /// # Errors
    ///
    /// Rejects invalid cron expressions; propagates storage failures.
    pub async fn load_schedules(
        &self,
        schedules: &[ScheduleConfig],
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        for schedule in schedules {
            let cron = CronSchedule::parse(&schedule.cron)?;
            let dispatch_mode = match schedule.dispatch_mode {
                DispatchMode::Prompt => "prompt",
                DispatchMode::Job => "job",
            };
            self.store
                .upsert(TaskRecord {
                    name: schedule.name.clone(),
                    cron: schedule.cron.clone(),
                    dispatch_mode: dispatch_mode.to_string(),
                    enabled: schedule.enabled,
                    prompt: schedule.prompt.clone(),
                    job_name: schedule.job_name.clone(),
                    job_args: schedule.job_args.clone(),
                    last_run_at: None,
                    next_run_at: None,
                })
                .await?;

            let current = self.store.get(&schedule.name).await?;
            if current.is_some_and(|t| t.next_run_at.is_none()) {
                let due = self.staggered_next(&cron, now);
                self.store.set_next_due(&schedule.name, due).await?;
                debug!(butler = %self.butler, task = %schedule.name, %due, "schedule initialized");
            }
        }
        Ok(())
    }

    /// The next staggered due time strictly after `after`.
    fn staggered_next(&self, cron: &CronSchedule, after: DateTime<Utc>) -> DateTime<Utc> {
        let base = cron.next_after(after).unwrap_or(after);
        base + stagger_offset(self.butler.as_str(), cron.interval_seconds(after))
    }

    /// Fire every due task at most once.
    ///
    /// Idempotent within a scheduling cycle: firing is a CAS on
    /// `next_run_at`, so a second `tick()` in the same cycle is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates storage failures. Handler and dispatch failures are
    /// absorbed into the report.
    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();

        for task in self.store.list_enabled().await? {
            let Some(due) = task.next_run_at else {
                continue;
            };
            if due > now {
                continue;
            }
            let Ok(cron) = CronSchedule::parse(&task.cron) else {
                warn!(butler = %self.butler, task = %task.name, cron = %task.cron,
                    "stored cron no longer parses; skipping");
                continue;
            };

            let next_due = self.staggered_next(&cron, now);
            if !self.store.cas_fire(&task.name, due, now, next_due).await? {
                report.lost_race.push(task.name.clone());
                continue;
            }

            let outcome = self.dispatch(&task).await;
            let (outcome_str, failed) = match &outcome {
                Ok(()) => (format!("{}:{} ok", task.dispatch_mode, task.name), false),
                Err(reason) => {
                    warn!(butler = %self.butler, task = %task.name, %reason, "task dispatch failed");
                    (format!("{}:{} error: {reason}", task.dispatch_mode, task.name), true)
                },
            };
            self.audit_firing(&outcome_str, now).await;
            if failed {
                report.failed.push(task.name.clone());
            } else {
                report.fired.push(task.name.clone());
            }
            info!(butler = %self.butler, task = %task.name, %next_due, "task fired");
        }

        Ok(report)
    }

    async fn dispatch(&self, task: &TaskRecord) -> Result<(), String> {
        match task.dispatch_mode.as_str() {
            "job" => {
                let name = task
                    .job_name
                    .as_deref()
                    .ok_or_else(|| "job task without job_name".to_string())?;
                let job = self
                    .jobs
                    .get(name)
                    .ok_or_else(|| format!("unknown job handler '{name}'"))?;
                let args = task.job_args.clone().unwrap_or(Value::Null);
                // No spawner, no session row: deterministic work only.
                job.run(args).await.map(|_| ())
            },
            _ => {
                let prompt = task
                    .prompt
                    .as_deref()
                    .ok_or_else(|| "prompt task without prompt".to_string())?;
                self.dispatcher.dispatch_prompt(prompt).await
            },
        }
    }

    async fn audit_firing(&self, outcome: &str, now: DateTime<Utc>) {
        let record = TriggerAuditRecord {
            butler_name: self.butler.clone(),
            trigger_source: TriggerSource::Schedule,
            session_id: None,
            outcome: outcome.to_string(),
            at: now,
        };
        if let Err(e) = self.audit.record_trigger(record).await {
            warn!(butler = %self.butler, error = %e, "scheduler audit write failed");
        }
    }

    /// Look up a task (ops surface).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn task(&self, name: &str) -> SchedulerResult<Option<TaskRecord>> {
        Ok(self.store.get(name).await?)
    }

    /// All enabled tasks (ops surface).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn tasks(&self) -> SchedulerResult<Vec<TaskRecord>> {
        Ok(self.store.list_enabled().await?)
    }

    /// Enable or disable a task.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> SchedulerResult<()> {
        self.store.set_enabled(name, enabled).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("butler", &self.butler)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}
