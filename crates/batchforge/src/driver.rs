// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration driver.
//!
//! Runs plans step by step. Each step moves through
//! `Pending → Skipped | Running → Succeeded | Failed`; the first failure
//! aborts the rest of the plan and nothing already created is rolled back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::log::{ExecutionLog, Level};
use crate::plan::{Precondition, ProvisioningPlan, ProvisioningStep, RunState, StepContext};
use crate::probe::ResourceProbe;
use crate::waiter::PollingWaiter;

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Not started
    Pending,
    /// Target already existed
    Skipped,
    /// In progress
    Running,
    /// Action and verification completed
    Succeeded,
    /// Terminal failure
    Failed,
}

impl StepState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Plan the step belongs to
    pub plan: &'static str,
    /// Step name
    pub name: &'static str,
    /// Final state
    pub state: StepState,
    /// Attempts made (0 for steps never started)
    pub attempts: u32,
    /// Wall-clock time spent
    pub duration: Duration,
    /// Skip reason or failure message
    pub detail: Option<String>,
}

/// Per-step records of an invocation, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Step records
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    /// Record of the named step (last occurrence when plans share names).
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().rev().find(|s| s.name == name)
    }

    /// Final state of the named step.
    pub fn state_of(&self, name: &str) -> Option<StepState> {
        self.step(name).map(|s| s.state)
    }

    /// Names of steps in the given state.
    pub fn names_in(&self, state: StepState) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.name)
            .collect()
    }

    /// The failed step, if any.
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.state == StepState::Failed)
    }

    /// One line per step, for the console summary.
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|s| {
                let mut line = format!(
                    "{:<10} {:<8} {:<24} {:>6.1}s",
                    s.state.as_str(),
                    s.plan,
                    s.name,
                    s.duration.as_secs_f64()
                );
                if let Some(detail) = &s.detail {
                    line.push_str("  ");
                    line.push_str(detail);
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A plan stopped at a failed step.
#[derive(Debug, thiserror::Error)]
#[error("step '{step}' of the {plan} plan failed: {error}")]
pub struct PlanFailure {
    /// Plan name
    pub plan: &'static str,
    /// Name of the failed step
    pub step: &'static str,
    /// Underlying error
    #[source]
    pub error: Error,
    /// Records up to and including the failure; remaining steps are Pending
    pub report: RunReport,
}

impl PlanFailure {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

enum StepOutcome {
    Skipped(String),
    Completed,
}

/// Sequential, fail-fast plan runner.
pub struct OrchestrationDriver {
    config: Arc<Config>,
    executor: Arc<dyn CommandExecutor>,
    probe: ResourceProbe,
    waiter: PollingWaiter,
    log: ExecutionLog,
}

impl OrchestrationDriver {
    /// Create a driver that runs commands through `executor`.
    pub fn new(config: Arc<Config>, executor: Arc<dyn CommandExecutor>, log: ExecutionLog) -> Self {
        let probe = ResourceProbe::new(executor.clone());
        let waiter = PollingWaiter::new(config.timeouts.poll_interval);
        Self {
            config,
            executor,
            probe,
            waiter,
            log,
        }
    }

    /// Resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execution log.
    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Run one plan.
    pub async fn run(
        &self,
        plan: &ProvisioningPlan,
        state: &mut RunState,
    ) -> std::result::Result<RunReport, PlanFailure> {
        self.run_all(std::slice::from_ref(plan), state).await
    }

    /// Run plans in order, sharing `state`. Stops at the first failure.
    pub async fn run_all(
        &self,
        plans: &[ProvisioningPlan],
        state: &mut RunState,
    ) -> std::result::Result<RunReport, PlanFailure> {
        let mut report = RunReport::default();
        for (plan_index, plan) in plans.iter().enumerate() {
            info!(
                plan = plan.name(),
                executor = self.executor.executor_type(),
                steps = plan.len(),
                "Starting plan"
            );
            self.log.event(
                Level::Info,
                &format!("Plan {}: {}", plan.name(), plan.step_names().join(" → ")),
            );

            for (index, step) in plan.steps().iter().enumerate() {
                let (record, error) = self.run_step(plan.name(), step, state).await;
                report.steps.push(record);
                if let Some(error) = error {
                    let remaining = plan.steps()[index + 1..]
                        .iter()
                        .map(|s| (plan.name(), s))
                        .chain(
                            plans[plan_index + 1..]
                                .iter()
                                .flat_map(|p| p.steps().iter().map(move |s| (p.name(), s))),
                        );
                    for (plan_name, pending) in remaining {
                        report.steps.push(StepRecord {
                            plan: plan_name,
                            name: pending.name(),
                            state: StepState::Pending,
                            attempts: 0,
                            duration: Duration::ZERO,
                            detail: None,
                        });
                    }
                    self.log.event(
                        Level::Error,
                        &format!(
                            "Plan {} aborted at step '{}'; created resources are left in place",
                            plan.name(),
                            step.name()
                        ),
                    );
                    return Err(PlanFailure {
                        plan: plan.name(),
                        step: step.name(),
                        error,
                        report,
                    });
                }
            }
            info!(plan = plan.name(), "Plan completed");
        }
        Ok(report)
    }

    async fn run_step(
        &self,
        plan: &'static str,
        step: &ProvisioningStep,
        state: &mut RunState,
    ) -> (StepRecord, Option<Error>) {
        let started = Instant::now();
        let max_attempts = if step.is_retryable() {
            self.config.max_attempts
        } else {
            1
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            self.log.event(
                Level::Info,
                &format!(
                    "[{}] {} → {} (attempt {}/{})",
                    plan,
                    step.name(),
                    StepState::Running,
                    attempts,
                    max_attempts
                ),
            );

            let result = match tokio::time::timeout(step.timeout(), self.attempt(step, state)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    what: format!("step '{}'", step.name()),
                    waited: step.timeout(),
                }),
            };

            let (final_state, detail, error) = match result {
                Ok(StepOutcome::Skipped(reason)) => {
                    self.log.event(
                        Level::Info,
                        &format!("[{}] {} → skipped: {}", plan, step.name(), reason),
                    );
                    (StepState::Skipped, Some(reason), None)
                }
                Ok(StepOutcome::Completed) => {
                    self.log.event(
                        Level::Info,
                        &format!(
                            "[{}] {} → succeeded in {:.1}s",
                            plan,
                            step.name(),
                            started.elapsed().as_secs_f64()
                        ),
                    );
                    (StepState::Succeeded, None, None)
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    warn!(step = step.name(), attempt = attempts, error = %e, "Step failed, retrying");
                    self.log.event(
                        Level::Warn,
                        &format!(
                            "[{}] {} attempt {} failed, retrying in {}s: {}",
                            plan,
                            step.name(),
                            attempts,
                            self.waiter.interval().as_secs(),
                            e
                        ),
                    );
                    tokio::time::sleep(self.waiter.interval()).await;
                    continue;
                }
                Err(e) => {
                    self.log.event(
                        Level::Error,
                        &format!("[{}] {} → failed: {}", plan, step.name(), e),
                    );
                    (StepState::Failed, Some(e.to_string()), Some(e))
                }
            };

            let record = StepRecord {
                plan,
                name: step.name(),
                state: final_state,
                attempts,
                duration: started.elapsed(),
                detail,
            };
            return (record, error);
        }
    }

    async fn attempt(&self, step: &ProvisioningStep, state: &mut RunState) -> Result<StepOutcome> {
        let mut cx = StepContext {
            config: &self.config,
            executor: self.executor.as_ref(),
            probe: &self.probe,
            waiter: &self.waiter,
            log: &self.log,
            state,
            deadline: step.timeout(),
        };
        let action = step.action();

        match action.precondition(&mut cx).await? {
            Precondition::Skip(reason) => return Ok(StepOutcome::Skipped(reason)),
            Precondition::InProgress(reason) => {
                cx.note(Level::Info, format!("{}; waiting", reason));
            }
            Precondition::Run => {
                debug!(step = step.name(), "Precondition requires action");
                action.run(&mut cx).await?;
            }
        }
        action.verify(&mut cx).await?;
        Ok(StepOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::plan::StepAction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Succeeds;

    #[async_trait]
    impl StepAction for Succeeds {
        async fn run(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    struct AlreadyThere;

    #[async_trait]
    impl StepAction for AlreadyThere {
        async fn precondition(&self, _cx: &mut StepContext<'_>) -> Result<Precondition> {
            Ok(Precondition::skip("exists"))
        }

        async fn run(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            panic!("skipped steps must not run");
        }
    }

    /// Found mid-provisioning; counts verifications.
    struct Provisioning {
        verified: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StepAction for Provisioning {
        async fn precondition(&self, _cx: &mut StepContext<'_>) -> Result<Precondition> {
            Ok(Precondition::in_progress("gallery rg/g is Creating"))
        }

        async fn run(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            panic!("in-progress steps must not repeat the action");
        }

        async fn verify(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            self.verified.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails with a command error until the given attempt.
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait]
    impl StepAction for Flaky {
        async fn run(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(())
            } else {
                Err(Error::command("Create thing", "InternalServerError"))
            }
        }
    }

    struct Fatal;

    #[async_trait]
    impl StepAction for Fatal {
        async fn run(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            Err(Error::FailedState {
                resource: "VM extension rg/vm/NvidiaGpuDriverLinux".into(),
                state: "Failed".into(),
            })
        }
    }

    struct Hangs;

    #[async_trait]
    impl StepAction for Hangs {
        async fn run(&self, _cx: &mut StepContext<'_>) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn driver(max_attempts: u32) -> OrchestrationDriver {
        let config = Config::builder()
            .poll_interval(Duration::from_secs(5))
            .max_attempts(max_attempts)
            .build()
            .unwrap();
        OrchestrationDriver::new(
            Arc::new(config),
            Arc::new(MockExecutor::new()),
            ExecutionLog::console_only(),
        )
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_plan() {
        let plan = ProvisioningPlan::new("image")
            .step(ProvisioningStep::new("one", secs(10), Succeeds))
            .step(ProvisioningStep::new("two", secs(10), AlreadyThere))
            .step(ProvisioningStep::new("three", secs(10), Fatal))
            .step(ProvisioningStep::new("four", secs(10), Succeeds));
        let later = ProvisioningPlan::new("pool").step(ProvisioningStep::new("five", secs(10), Succeeds));

        let failure = driver(1)
            .run_all(&[plan, later], &mut RunState::new())
            .await
            .unwrap_err();

        assert_eq!(failure.step, "three");
        assert_eq!(failure.plan, "image");
        assert_eq!(failure.exit_code(), crate::error::EXIT_STEP_FAILURE);
        let report = &failure.report;
        assert_eq!(report.state_of("one"), Some(StepState::Succeeded));
        assert_eq!(report.state_of("two"), Some(StepState::Skipped));
        assert_eq!(report.state_of("three"), Some(StepState::Failed));
        assert_eq!(report.names_in(StepState::Pending), ["four", "five"]);
        assert_eq!(report.failed_step().unwrap().name, "three");
        assert!(failure.to_string().contains("step 'three'"));
    }

    #[tokio::test]
    async fn test_in_progress_step_is_verified_without_acting() {
        let verified = Arc::new(AtomicU32::new(0));
        let plan = ProvisioningPlan::new("image").step(ProvisioningStep::new(
            "gallery",
            secs(10),
            Provisioning {
                verified: verified.clone(),
            },
        ));

        let report = driver(1).run(&plan, &mut RunState::new()).await.unwrap();

        assert_eq!(report.state_of("gallery"), Some(StepState::Succeeded));
        assert_eq!(verified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_step_is_reattempted_at_poll_interval() {
        let calls = Arc::new(AtomicU32::new(0));
        let plan = ProvisioningPlan::new("image").step(
            ProvisioningStep::new(
                "gallery",
                secs(60),
                Flaky {
                    calls: calls.clone(),
                    succeed_on: 3,
                },
            )
            .retryable(),
        );
        let start = Instant::now();

        let report = driver(3).run(&plan, &mut RunState::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.step("gallery").unwrap().attempts, 3);
        assert_eq!(report.state_of("gallery"), Some(StepState::Succeeded));
        assert_eq!(start.elapsed(), secs(10));
    }

    #[tokio::test]
    async fn test_default_budget_means_no_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let plan = ProvisioningPlan::new("image").step(
            ProvisioningStep::new(
                "gallery",
                secs(60),
                Flaky {
                    calls: calls.clone(),
                    succeed_on: 2,
                },
            )
            .retryable(),
        );

        let failure = driver(1).run(&plan, &mut RunState::new()).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(failure.error, Error::Command { .. }));
    }

    #[tokio::test]
    async fn test_terminal_state_is_never_retried() {
        let plan = ProvisioningPlan::new("image")
            .step(ProvisioningStep::new("gpu-driver", secs(60), Fatal).retryable());

        let failure = driver(5).run(&plan, &mut RunState::new()).await.unwrap_err();

        assert_eq!(failure.report.step("gpu-driver").unwrap().attempts, 1);
        assert!(matches!(failure.error, Error::FailedState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let plan = ProvisioningPlan::new("pool").step(ProvisioningStep::new("pool", secs(90), Hangs));

        let failure = driver(1).run(&plan, &mut RunState::new()).await.unwrap_err();

        assert!(matches!(failure.error, Error::Timeout { .. }));
        assert_eq!(failure.exit_code(), crate::error::EXIT_STEP_FAILURE);
    }
}
