//! The approvals engine.
//!
//! Decision writes are compare-and-set: the SQL (and the in-memory mirror)
//! carries `WHERE status='pending'`, so concurrent decisions cannot
//! overwrite one another; the losing writer observes 0 rows affected and
//! reports the current state. Execution holds a process-local per-action
//! lock and replays the stored result once a terminal write has landed.

use butlers_core::{ActionId, ButlerName};
use butlers_storage::{
    ActionStatus, ActionStore, ApprovalEvent, PendingActionRecord, RiskTier,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ApprovalError, ApprovalResult};
use crate::rules::{RuleId, RuleSet, StandingRule};

/// Outcome of intercepting a gated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// A standing rule pre-approved the call; proceed.
    AutoApproved {
        /// The action row recording the auto-approval.
        action_id: ActionId,
        /// The rule that matched.
        rule_id: RuleId,
    },
    /// The call is parked pending an operator decision.
    Pending {
        /// The pending action.
        action_id: ActionId,
    },
}

/// Outcome of a decision write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// This writer won the CAS.
    Applied,
    /// Another decision landed first; here is what the row says now.
    Superseded(ActionStatus),
}

/// The approvals engine for one butler.
pub struct ApprovalsEngine {
    butler: ButlerName,
    store: Arc<dyn ActionStore>,
    rules: Mutex<RuleSet>,
    /// Process-local per-action execution locks.
    locks: Mutex<HashMap<ActionId, Arc<Mutex<()>>>>,
    /// How long an undecided action stays pending.
    pending_ttl: Duration,
}

impl ApprovalsEngine {
    /// Create an engine over a store.
    #[must_use]
    pub fn new(butler: ButlerName, store: Arc<dyn ActionStore>, pending_ttl_s: u64) -> Self {
        Self {
            butler,
            store,
            rules: Mutex::new(RuleSet::new()),
            locks: Mutex::new(HashMap::new()),
            pending_ttl: Duration::seconds(i64::try_from(pending_ttl_s).unwrap_or(3600)),
        }
    }

    /// Install a standing rule.
    ///
    /// # Errors
    ///
    /// Rejects under-constrained rules for high and critical tiers.
    pub async fn add_rule(&self, rule: StandingRule, tier: RiskTier) -> ApprovalResult<RuleId> {
        self.rules.lock().await.add(rule, tier)
    }

    /// Remove a standing rule. Returns whether it existed.
    pub async fn remove_rule(&self, rule_id: RuleId) -> bool {
        self.rules.lock().await.remove(rule_id)
    }

    /// Intercept a gated tool call before execution.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn intercept(
        &self,
        tool_name: &str,
        tool_args: Value,
        risk_tier: RiskTier,
        now: DateTime<Utc>,
    ) -> ApprovalResult<GateOutcome> {
        let matched = self
            .rules
            .lock()
            .await
            .find_match_and_consume(tool_name, &tool_args, now);

        let action_id = ActionId::new();
        let status = if matched.is_some() {
            ActionStatus::Approved
        } else {
            ActionStatus::Pending
        };
        let record = PendingActionRecord {
            action_id,
            butler: self.butler.clone(),
            tool_name: tool_name.to_string(),
            tool_args,
            status,
            risk_tier,
            created_at: now,
            decided_at: matched.is_some().then_some(now),
            expires_at: matched.is_none().then(|| now + self.pending_ttl),
            execution_result: None,
        };
        self.store.insert(record).await?;

        if let Some(rule_id) = matched {
            self.store
                .append_event(ApprovalEvent {
                    action_id,
                    kind: "rule_auto_approved".to_string(),
                    detail: Some(serde_json::json!({ "rule_id": rule_id.to_string() })),
                    at: now,
                })
                .await?;
            info!(butler = %self.butler, tool = tool_name, %action_id, "standing rule pre-approved call");
            return Ok(GateOutcome::AutoApproved { action_id, rule_id });
        }

        info!(butler = %self.butler, tool = tool_name, %action_id, "gated call parked for approval");
        Ok(GateOutcome::Pending { action_id })
    }

    async fn decide(
        &self,
        action_id: ActionId,
        to: ActionStatus,
        event_kind: &str,
        now: DateTime<Utc>,
    ) -> ApprovalResult<DecisionOutcome> {
        let won = self.store.cas_decide(action_id, to, now).await?;
        if won {
            self.store
                .append_event(ApprovalEvent {
                    action_id,
                    kind: event_kind.to_string(),
                    detail: None,
                    at: now,
                })
                .await?;
            return Ok(DecisionOutcome::Applied);
        }
        let current = self
            .store
            .get(action_id)
            .await?
            .ok_or(ApprovalError::UnknownAction(action_id))?;
        Ok(DecisionOutcome::Superseded(current.status))
    }

    /// Approve a pending action.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; unknown actions error.
    pub async fn approve(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> ApprovalResult<DecisionOutcome> {
        self.decide(action_id, ActionStatus::Approved, "action_approved", now).await
    }

    /// Reject a pending action.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; unknown actions error.
    pub async fn reject(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> ApprovalResult<DecisionOutcome> {
        self.decide(action_id, ActionStatus::Rejected, "action_rejected", now).await
    }

    /// Expire every pending action whose deadline has passed.
    ///
    /// Registered as the `approvals_expire` native scheduler job. Returns
    /// the expired ids.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> ApprovalResult<Vec<ActionId>> {
        let due = self.store.expired_pending(now).await?;
        let mut expired = Vec::with_capacity(due.len());
        for action_id in due {
            if matches!(
                self.decide(action_id, ActionStatus::Expired, "action_expired", now).await?,
                DecisionOutcome::Applied
            ) {
                expired.push(action_id);
            }
        }
        Ok(expired)
    }

    async fn action_lock(&self, action_id: ActionId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().await.entry(action_id).or_default())
    }

    /// Execute an approved action exactly once.
    ///
    /// When the action is already `executed`, the stored result is replayed
    /// without invoking the executor. The terminal write happens only when
    /// the status is still `approved`.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotApproved`] for pending/rejected/expired actions;
    /// executor failures surface as [`ApprovalError::ExecutionFailed`] and
    /// leave the action `approved` for retry.
    pub async fn execute_approved_action<F, Fut>(
        &self,
        action_id: ActionId,
        executor: F,
        now: DateTime<Utc>,
    ) -> ApprovalResult<Value>
    where
        F: FnOnce(PendingActionRecord) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let lock = self.action_lock(action_id).await;
        let _guard = lock.lock().await;

        let record = self
            .store
            .get(action_id)
            .await?
            .ok_or(ApprovalError::UnknownAction(action_id))?;

        match record.status {
            ActionStatus::Executed => {
                // Replay: the first execution's result is the result.
                return Ok(record.execution_result.unwrap_or(Value::Null));
            },
            ActionStatus::Approved => {},
            status => {
                return Err(ApprovalError::NotApproved { action_id, status });
            },
        }

        let result = executor(record).await.map_err(|reason| {
            warn!(%action_id, %reason, "approved action execution failed");
            ApprovalError::ExecutionFailed(reason)
        })?;

        let won = self.store.cas_mark_executed(action_id, result.clone(), now).await?;
        if won {
            self.store
                .append_event(ApprovalEvent {
                    action_id,
                    kind: "action_executed".to_string(),
                    detail: None,
                    at: now,
                })
                .await?;
            Ok(result)
        } else {
            // Raced with another executor despite the local lock (e.g. a
            // second process); surface whatever landed.
            let current = self
                .store
                .get(action_id)
                .await?
                .ok_or(ApprovalError::UnknownAction(action_id))?;
            Ok(current.execution_result.unwrap_or(Value::Null))
        }
    }

    /// All pending actions, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list_pending(&self) -> ApprovalResult<Vec<PendingActionRecord>> {
        Ok(self.store.list_pending().await?)
    }

    /// The event log for one action, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn events(&self, action_id: ActionId) -> ApprovalResult<Vec<ApprovalEvent>> {
        Ok(self.store.events(action_id).await?)
    }
}

impl std::fmt::Debug for ApprovalsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalsEngine")
            .field("butler", &self.butler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleConstraint;
    use butlers_storage::memory::MemoryActionStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> ApprovalsEngine {
        ApprovalsEngine::new("health".into(), Arc::new(MemoryActionStore::new()), 3600)
    }

    #[tokio::test]
    async fn test_gate_parks_unmatched_call() {
        let engine = engine();
        let outcome = engine
            .intercept("send_email", serde_json::json!({"to": "bob@x.com"}), RiskTier::High, Utc::now())
            .await
            .unwrap();
        let GateOutcome::Pending { action_id } = outcome else {
            panic!("expected pending");
        };
        let pending = engine.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_id, action_id);
        assert!(pending[0].expires_at.is_some());
    }

    #[tokio::test]
    async fn test_standing_rule_auto_approves() {
        let engine = engine();
        let rule = StandingRule {
            rule_id: RuleId::new(),
            tool_name: "send_email".to_string(),
            constraints: vec![RuleConstraint::Exact {
                arg: "to".to_string(),
                value: "sarah@example.com".to_string(),
            }],
            expires_at: None,
            max_uses: Some(10),
            uses: 0,
            created_at: Utc::now(),
        };
        engine.add_rule(rule, RiskTier::High).await.unwrap();

        let outcome = engine
            .intercept(
                "send_email",
                serde_json::json!({"to": "sarah@example.com"}),
                RiskTier::High,
                Utc::now(),
            )
            .await
            .unwrap();
        let GateOutcome::AutoApproved { action_id, .. } = outcome else {
            panic!("expected auto-approval");
        };
        let events = engine.events(action_id).await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["action_created", "rule_auto_approved"]);
    }

    #[tokio::test]
    async fn test_concurrent_decisions_single_winner() {
        let engine = Arc::new(engine());
        let outcome = engine
            .intercept("delete_event", serde_json::json!({}), RiskTier::Medium, Utc::now())
            .await
            .unwrap();
        let GateOutcome::Pending { action_id } = outcome else {
            panic!("expected pending");
        };

        let now = Utc::now();
        let (a, b) = tokio::join!(engine.approve(action_id, now), engine.reject(action_id, now));
        let a = a.unwrap();
        let b = b.unwrap();
        let applied =
            usize::from(a == DecisionOutcome::Applied) + usize::from(b == DecisionOutcome::Applied);
        assert_eq!(applied, 1, "exactly one decision wins");

        // Exactly one decision event beyond action_created.
        let events = engine.events(action_id).await.unwrap();
        let decisions = events
            .iter()
            .filter(|e| e.kind == "action_approved" || e.kind == "action_rejected")
            .count();
        assert_eq!(decisions, 1);
    }

    #[tokio::test]
    async fn test_second_approve_reports_current_state() {
        let engine = engine();
        let GateOutcome::Pending { action_id } = engine
            .intercept("delete_event", serde_json::json!({}), RiskTier::Medium, Utc::now())
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };

        let now = Utc::now();
        assert_eq!(engine.approve(action_id, now).await.unwrap(), DecisionOutcome::Applied);
        assert_eq!(
            engine.approve(action_id, now).await.unwrap(),
            DecisionOutcome::Superseded(ActionStatus::Approved)
        );
    }

    #[tokio::test]
    async fn test_execute_is_idempotent() {
        let engine = engine();
        let GateOutcome::Pending { action_id } = engine
            .intercept("send_email", serde_json::json!({}), RiskTier::High, Utc::now())
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };
        engine.approve(action_id, Utc::now()).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result = engine
                .execute_approved_action(
                    action_id,
                    move |_record| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::json!({"sent": true}))
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            assert_eq!(result, serde_json::json!({"sent": true}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "executor ran exactly once");

        let events = engine.events(action_id).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == "action_executed").count(), 1);
    }

    #[tokio::test]
    async fn test_execute_rejected_action_fails() {
        let engine = engine();
        let GateOutcome::Pending { action_id } = engine
            .intercept("send_email", serde_json::json!({}), RiskTier::High, Utc::now())
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };
        engine.reject(action_id, Utc::now()).await.unwrap();

        let err = engine
            .execute_approved_action(action_id, |_r| async { Ok(Value::Null) }, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotApproved { status: ActionStatus::Rejected, .. }));
    }

    #[tokio::test]
    async fn test_executor_failure_leaves_action_approved() {
        let engine = engine();
        let GateOutcome::Pending { action_id } = engine
            .intercept("send_email", serde_json::json!({}), RiskTier::High, Utc::now())
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };
        engine.approve(action_id, Utc::now()).await.unwrap();

        let err = engine
            .execute_approved_action(
                action_id,
                |_r| async { Err("smtp unavailable".to_string()) },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ExecutionFailed(_)));

        // Retry succeeds.
        let result = engine
            .execute_approved_action(
                action_id,
                |_r| async { Ok(serde_json::json!("ok")) },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn test_expire_due() {
        let engine = ApprovalsEngine::new(
            "health".into(),
            Arc::new(MemoryActionStore::new()),
            60,
        );
        let created = Utc::now();
        let GateOutcome::Pending { action_id } = engine
            .intercept("send_email", serde_json::json!({}), RiskTier::High, created)
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };

        // Not yet due.
        assert!(engine.expire_due(created + Duration::seconds(30)).await.unwrap().is_empty());
        let expired = engine.expire_due(created + Duration::seconds(61)).await.unwrap();
        assert_eq!(expired, vec![action_id]);
        // Idempotent.
        assert!(engine.expire_due(created + Duration::seconds(120)).await.unwrap().is_empty());
    }
}
