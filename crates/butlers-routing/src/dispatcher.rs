//! Fanout plan execution.

use async_trait::async_trait;
use butlers_core::route::RouteContext;
use butlers_core::RequestId;
use butlers_storage::{FanoutLogRecord, InboxStatus, InboxStore, RoutingLogStore};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{RouteFailure, RoutingResult};
use crate::plan::{AbortPolicy, FanoutMode, FanoutPlan, JoinPolicy, RunIf, Subrequest};

/// Terminal state of one subrequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubrequestOutcome {
    /// The target returned a result.
    Success(Value),
    /// The target (or the router) failed the call.
    Failed(RouteFailure),
    /// The per-subrequest deadline expired.
    TimedOut,
    /// The `run_if` gate kept the subrequest from running.
    Skipped,
    /// A join or abort decision cancelled the subrequest.
    Cancelled,
}

impl SubrequestOutcome {
    /// Stable outcome string for logs and `routing_results`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timeout",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether this counts as a failure for abort policies.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut)
    }

    /// Whether the subrequest actually terminated (ran to an end).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failed(_) | Self::TimedOut)
    }

    fn detail(&self) -> Option<Value> {
        match self {
            Self::Success(value) => Some(value.clone()),
            Self::Failed(failure) => serde_json::to_value(failure.body()).ok(),
            _ => None,
        }
    }
}

/// Seam through which the dispatcher reaches the router.
#[async_trait]
pub trait SubrequestRunner: Send + Sync {
    /// Execute one subrequest against its target butler.
    async fn run(&self, subrequest: &Subrequest, context: &RouteContext)
    -> Result<Value, RouteFailure>;
}

/// The result of executing one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    /// Aggregate status written to the inbox record.
    pub status: InboxStatus,
    /// Per-subrequest outcomes, in plan order.
    pub outcomes: Vec<(String, SubrequestOutcome)>,
}

impl PlanOutcome {
    /// The `routing_results` JSON for the inbox record.
    #[must_use]
    pub fn to_results(&self, plan: &FanoutPlan) -> Value {
        let subrequests: Vec<Value> = self
            .outcomes
            .iter()
            .zip(&plan.subrequests)
            .map(|((id, outcome), sub)| {
                serde_json::json!({
                    "subrequest_id": id,
                    "butler": sub.butler.as_str(),
                    "outcome": outcome.as_str(),
                    "detail": outcome.detail(),
                })
            })
            .collect();
        serde_json::json!({
            "status": self.status.as_str(),
            "subrequests": subrequests,
        })
    }
}

/// Executes fanout plans under join/abort policies.
pub struct Dispatcher {
    runner: Arc<dyn SubrequestRunner>,
    log: Arc<dyn RoutingLogStore>,
    inbox: Arc<dyn InboxStore>,
    subrequest_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        runner: Arc<dyn SubrequestRunner>,
        log: Arc<dyn RoutingLogStore>,
        inbox: Arc<dyn InboxStore>,
        subrequest_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            log,
            inbox,
            subrequest_timeout,
        }
    }

    /// Execute one plan, record every outcome, and write the aggregate to
    /// the inbox record.
    ///
    /// # Errors
    ///
    /// Only storage failures propagate; subrequest failures are absorbed
    /// into the outcome per the join/abort policies.
    pub async fn execute(
        &self,
        request_id: RequestId,
        plan: &FanoutPlan,
        context: &RouteContext,
    ) -> RoutingResult<PlanOutcome> {
        let outcomes = match plan.mode {
            FanoutMode::Parallel => self.run_parallel(plan, context).await,
            FanoutMode::Ordered | FanoutMode::Conditional => {
                self.run_sequential(plan, context).await
            },
        };

        let outcome = PlanOutcome {
            status: Self::aggregate(plan, &outcomes),
            outcomes: plan
                .subrequests
                .iter()
                .map(|s| s.subrequest_id.clone())
                .zip(outcomes)
                .collect(),
        };

        for ((id, sub_outcome), sub) in outcome.outcomes.iter().zip(&plan.subrequests) {
            self.log
                .record_fanout(FanoutLogRecord {
                    request_id,
                    subrequest_id: id.clone(),
                    butler: sub.butler.clone(),
                    outcome: sub_outcome.as_str().to_string(),
                    detail: sub_outcome.detail(),
                    at: Utc::now(),
                })
                .await?;
        }

        self.inbox
            .set_routing_results(request_id, outcome.to_results(plan), outcome.status)
            .await?;
        info!(%request_id, status = outcome.status.as_str(), "fanout plan finished");
        Ok(outcome)
    }

    async fn run_one(&self, sub: &Subrequest, context: &RouteContext) -> SubrequestOutcome {
        match tokio::time::timeout(self.subrequest_timeout, self.runner.run(sub, context)).await {
            Ok(Ok(value)) => SubrequestOutcome::Success(value),
            Ok(Err(failure)) => {
                warn!(subrequest = %sub.subrequest_id, butler = %sub.butler, %failure,
                    "subrequest failed");
                SubrequestOutcome::Failed(failure)
            },
            Err(_) => {
                warn!(subrequest = %sub.subrequest_id, butler = %sub.butler, "subrequest timed out");
                SubrequestOutcome::TimedOut
            },
        }
    }

    /// Whether this outcome ends the whole plan early.
    fn stops_plan(plan: &FanoutPlan, sub: &Subrequest, outcome: &SubrequestOutcome) -> bool {
        if plan.join_policy == JoinPolicy::FirstSuccess && outcome.is_success() {
            return true;
        }
        if outcome.is_failure() {
            return match plan.abort_policy {
                AbortPolicy::Continue => false,
                AbortPolicy::OnRequiredFailure => sub.required,
                AbortPolicy::OnAnyFailure => true,
            };
        }
        false
    }

    async fn run_parallel(
        &self,
        plan: &FanoutPlan,
        context: &RouteContext,
    ) -> Vec<SubrequestOutcome> {
        let count = plan.subrequests.len();
        let mut slots: Vec<Option<SubrequestOutcome>> = vec![None; count];
        let mut join_set = JoinSet::new();

        for (idx, sub) in plan.subrequests.iter().cloned().enumerate() {
            let runner = Arc::clone(&self.runner);
            let context = context.clone();
            let timeout = self.subrequest_timeout;
            join_set.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, runner.run(&sub, &context)).await
                {
                    Ok(Ok(value)) => SubrequestOutcome::Success(value),
                    Ok(Err(failure)) => SubrequestOutcome::Failed(failure),
                    Err(_) => SubrequestOutcome::TimedOut,
                };
                (idx, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((idx, outcome)) = joined else {
                // Aborted sibling tasks surface as join errors; their slots
                // become `Cancelled` below.
                continue;
            };
            let stop = Self::stops_plan(plan, &plan.subrequests[idx], &outcome);
            slots[idx] = Some(outcome);
            if stop {
                debug!(subrequest = %plan.subrequests[idx].subrequest_id, "plan stopping early");
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                break;
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(SubrequestOutcome::Cancelled))
            .collect()
    }

    async fn run_sequential(
        &self,
        plan: &FanoutPlan,
        context: &RouteContext,
    ) -> Vec<SubrequestOutcome> {
        let mut by_id: HashMap<&str, SubrequestOutcome> = HashMap::new();
        let mut outcomes = Vec::with_capacity(plan.subrequests.len());
        let mut stopped = false;

        for sub in &plan.subrequests {
            let outcome = if stopped {
                SubrequestOutcome::Cancelled
            } else if Self::gate_open(sub, &by_id) {
                let outcome = self.run_one(sub, context).await;
                stopped = Self::stops_plan(plan, sub, &outcome);
                outcome
            } else {
                debug!(subrequest = %sub.subrequest_id, "gate closed; skipping");
                SubrequestOutcome::Skipped
            };
            by_id.insert(sub.subrequest_id.as_str(), outcome.clone());
            outcomes.push(outcome);
        }
        outcomes
    }

    fn gate_open(sub: &Subrequest, by_id: &HashMap<&str, SubrequestOutcome>) -> bool {
        match sub.run_if {
            RunIf::Always => true,
            RunIf::Completed => sub
                .depends_on
                .iter()
                .all(|dep| by_id.get(dep.as_str()).is_some_and(SubrequestOutcome::is_terminal)),
            RunIf::Success => sub
                .depends_on
                .iter()
                .all(|dep| by_id.get(dep.as_str()).is_some_and(SubrequestOutcome::is_success)),
        }
    }

    fn aggregate(plan: &FanoutPlan, outcomes: &[SubrequestOutcome]) -> InboxStatus {
        let successes = outcomes.iter().filter(|o| o.is_success()).count();
        match plan.join_policy {
            JoinPolicy::FirstSuccess => {
                if successes > 0 {
                    InboxStatus::Completed
                } else {
                    InboxStatus::Failed
                }
            },
            JoinPolicy::WaitForAll => {
                let required_failure = plan
                    .subrequests
                    .iter()
                    .zip(outcomes)
                    .any(|(sub, outcome)| sub.required && outcome.is_failure());
                let any_failure = outcomes.iter().any(SubrequestOutcome::is_failure);
                if required_failure || (successes == 0 && any_failure) {
                    InboxStatus::Failed
                } else {
                    InboxStatus::Completed
                }
            },
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subrequest_timeout", &self.subrequest_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassificationEntry;
    use butlers_core::envelope::PolicyTier;
    use butlers_core::ErrorClass;
    use butlers_storage::memory::{MemoryInboxStore, MemoryRoutingLogStore};
    use butlers_storage::NewInboxRecord;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted per-butler behavior.
    #[derive(Clone)]
    enum Behavior {
        Ok,
        Fail(ErrorClass),
        Slow(Duration),
    }

    struct ScriptedRunner {
        behaviors: StdHashMap<String, Behavior>,
        calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: behaviors
                    .iter()
                    .map(|(name, b)| ((*name).to_string(), b.clone()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubrequestRunner for ScriptedRunner {
        async fn run(
            &self,
            subrequest: &Subrequest,
            _context: &RouteContext,
        ) -> Result<Value, RouteFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviors.get(subrequest.butler.as_str()) {
                Some(Behavior::Ok) | None => Ok(serde_json::json!({"ok": true})),
                Some(Behavior::Fail(class)) => {
                    Err(RouteFailure::new(*class, "scripted failure"))
                },
                Some(Behavior::Slow(delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(serde_json::json!({"ok": "slow"}))
                },
            }
        }
    }

    fn entries(butlers: &[&str]) -> Vec<ClassificationEntry> {
        butlers
            .iter()
            .map(|b| ClassificationEntry {
                butler: (*b).into(),
                prompt: format!("do {b} things"),
                segment: serde_json::json!({"rationale": "r"}),
            })
            .collect()
    }

    struct Fixture {
        dispatcher: Dispatcher,
        inbox: Arc<MemoryInboxStore>,
        log: Arc<MemoryRoutingLogStore>,
        request_id: RequestId,
    }

    async fn fixture(runner: Arc<ScriptedRunner>, timeout: Duration) -> Fixture {
        let inbox = Arc::new(MemoryInboxStore::new());
        let log = Arc::new(MemoryRoutingLogStore::new());
        let (request_id, _) = inbox
            .upsert(NewInboxRecord {
                request_id: RequestId::new(),
                dedupe_key: "k".to_string(),
                channel: "api".to_string(),
                provider: "internal".to_string(),
                endpoint_identity: "test".to_string(),
                sender_identity: "tester".to_string(),
                payload: serde_json::json!({}),
                normalized_text: "text".to_string(),
                policy_tier: PolicyTier::Default,
                observed_at: Utc::now(),
            })
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(runner, log.clone(), inbox.clone(), timeout);
        Fixture {
            dispatcher,
            inbox,
            log,
            request_id,
        }
    }

    #[tokio::test]
    async fn test_parallel_wait_for_all_success() {
        let runner = ScriptedRunner::new(&[("health", Behavior::Ok), ("relationship", Behavior::Ok)]);
        let fx = fixture(runner.clone(), Duration::from_secs(5)).await;
        let plan = FanoutPlan::build(&entries(&["health", "relationship"]), None).unwrap();

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, InboxStatus::Completed);
        assert!(outcome.outcomes.iter().all(|(_, o)| o.is_success()));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);

        // Outcomes are persisted.
        let record = fx.inbox.get(fx.request_id).await.unwrap().unwrap();
        assert_eq!(record.status, InboxStatus::Completed);
        let results = record.routing_results.unwrap();
        assert_eq!(results["subrequests"].as_array().unwrap().len(), 2);
        assert_eq!(fx.log.fanout_for_request(fx.request_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_continue_policy_absorbs_optional_failure() {
        let runner = ScriptedRunner::new(&[
            ("health", Behavior::Ok),
            ("errand", Behavior::Fail(ErrorClass::TargetUnavailable)),
        ]);
        let fx = fixture(runner, Duration::from_secs(5)).await;
        let mut plan = FanoutPlan::build(&entries(&["health", "errand"]), None).unwrap();
        plan.subrequests[1].required = false;

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, InboxStatus::Completed);
        assert_eq!(outcome.outcomes[1].1.as_str(), "failed");
    }

    #[tokio::test]
    async fn test_required_failure_fails_aggregate() {
        let runner = ScriptedRunner::new(&[
            ("health", Behavior::Ok),
            ("errand", Behavior::Fail(ErrorClass::InternalError)),
        ]);
        let fx = fixture(runner, Duration::from_secs(5)).await;
        let plan = FanoutPlan::build(&entries(&["health", "errand"]), None).unwrap();

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, InboxStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_cancels_slow_sibling() {
        let runner = ScriptedRunner::new(&[
            ("health", Behavior::Ok),
            ("errand", Behavior::Slow(Duration::from_secs(60))),
        ]);
        let hints = serde_json::json!({"join_policy": "first_success"});
        let fx = fixture(runner, Duration::from_secs(120)).await;
        let plan = FanoutPlan::build(&entries(&["health", "errand"]), Some(&hints)).unwrap();

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, InboxStatus::Completed);
        let by_id: StdHashMap<&str, &SubrequestOutcome> = outcome
            .outcomes
            .iter()
            .map(|(id, o)| (id.as_str(), o))
            .collect();
        assert!(by_id["sub-0"].is_success());
        assert_eq!(by_id["sub-1"].as_str(), "cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_subrequest_timeout() {
        let runner = ScriptedRunner::new(&[("errand", Behavior::Slow(Duration::from_secs(60)))]);
        let fx = fixture(runner, Duration::from_secs(1)).await;
        let plan = FanoutPlan::build(&entries(&["errand"]), None).unwrap();

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.outcomes[0].1.as_str(), "timeout");
        assert_eq!(outcome.status, InboxStatus::Failed);
    }

    #[tokio::test]
    async fn test_ordered_gate_skips_after_failure() {
        let runner = ScriptedRunner::new(&[
            ("first", Behavior::Fail(ErrorClass::InternalError)),
            ("second", Behavior::Ok),
        ]);
        let hints = serde_json::json!({"fanout_mode": "conditional"});
        let fx = fixture(runner.clone(), Duration::from_secs(5)).await;
        let mut plan = FanoutPlan::build(&entries(&["first", "second"]), Some(&hints)).unwrap();
        plan.subrequests[0].required = false;

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        // Conditional chains gate on success: the second never runs.
        assert_eq!(outcome.outcomes[0].1.as_str(), "failed");
        assert_eq!(outcome.outcomes[1].1.as_str(), "skipped");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ordered_completed_gate_runs_after_failure() {
        let runner = ScriptedRunner::new(&[
            ("first", Behavior::Fail(ErrorClass::InternalError)),
            ("second", Behavior::Ok),
        ]);
        let hints = serde_json::json!({"fanout_mode": "ordered"});
        let fx = fixture(runner.clone(), Duration::from_secs(5)).await;
        let mut plan = FanoutPlan::build(&entries(&["first", "second"]), Some(&hints)).unwrap();
        plan.subrequests[0].required = false;

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        // Ordered chains gate on completion: the failure still counts.
        assert_eq!(outcome.outcomes[1].1.as_str(), "success");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_any_failure_aborts_sequential_remainder() {
        let runner = ScriptedRunner::new(&[
            ("first", Behavior::Fail(ErrorClass::InternalError)),
            ("second", Behavior::Ok),
            ("third", Behavior::Ok),
        ]);
        let hints =
            serde_json::json!({"fanout_mode": "ordered", "abort_policy": "on_any_failure"});
        let fx = fixture(runner.clone(), Duration::from_secs(5)).await;
        let plan = FanoutPlan::build(&entries(&["first", "second", "third"]), Some(&hints)).unwrap();

        let outcome = fx
            .dispatcher
            .execute(fx.request_id, &plan, &RouteContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.outcomes[0].1.as_str(), "failed");
        assert_eq!(outcome.outcomes[1].1.as_str(), "cancelled");
        assert_eq!(outcome.outcomes[2].1.as_str(), "cancelled");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.status, InboxStatus::Failed);
    }
}
