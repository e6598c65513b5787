//! Local execution of fence agents.
//!
//! A [`FenceAction`] describes one agent invocation. [`FenceAction::execute`]
//! runs it to completion, retrying failed attempts within the action's time
//! budget. [`FenceAction::execute_async`] returns as soon as the first attempt
//! is running and reports the final outcome to a callback.

pub mod args;
pub mod invoker;
pub mod retry;
pub mod state;
pub mod tracker;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AgentSettings;
use crate::error::{result_code, FenceError, Result};

pub use args::{make_args, Victim};
pub use invoker::{AgentExit, AgentProcess, AttemptReport};
pub use retry::RetryBudget;
pub use state::{transition, ActionEvent, ActionState};
pub use tracker::DoneCallback;

/// Final result of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Pid of the last attempt, if one was started.
    pub pid: Option<u32>,
    pub result: Result<()>,
    /// Stdout of the last attempt.
    pub output: String,
    /// Stderr of the last attempt.
    pub error_output: String,
    pub attempts: u32,
}

impl ActionOutcome {
    /// Wire result code: 0 on success, a negative errno-like code otherwise.
    pub fn rc(&self) -> i32 {
        result_code(&self.result)
    }
}

/// One fence agent invocation.
#[derive(Debug)]
pub struct FenceAction {
    agent: String,
    action: String,
    victim: Option<Victim>,
    device_args: BTreeMap<String, String>,
    port_map: HashMap<String, String>,
    timeout: Duration,
    settings: AgentSettings,
    args: String,
    budget: RetryBudget,
    state: ActionState,
    last_report: Option<AttemptReport>,
}

impl FenceAction {
    /// New action with no victim, no device parameters and default settings.
    pub fn new(agent: impl Into<String>, action: impl Into<String>, timeout: Duration) -> Self {
        let settings = AgentSettings::default();
        let mut action = Self {
            agent: agent.into(),
            action: action.into(),
            victim: None,
            device_args: BTreeMap::new(),
            port_map: HashMap::new(),
            timeout,
            settings,
            args: String::new(),
            budget: RetryBudget::new(timeout, settings.max_retries),
            state: ActionState::Created,
            last_report: None,
        };
        action.prepare();
        action
    }

    #[must_use]
    pub fn with_victim(mut self, victim: Victim) -> Self {
        self.victim = Some(victim);
        self.prepare();
        self
    }

    #[must_use]
    pub fn with_device_args(mut self, device_args: BTreeMap<String, String>) -> Self {
        self.device_args = device_args;
        self.prepare();
        self
    }

    #[must_use]
    pub fn with_port_map(mut self, port_map: HashMap<String, String>) -> Self {
        self.port_map = port_map;
        self.prepare();
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self.prepare();
        self
    }

    /// Rebuild the derived argument blob and retry budget.
    fn prepare(&mut self) {
        self.args = make_args(
            &self.agent,
            &self.action,
            self.victim.as_ref(),
            &self.device_args,
            &self.port_map,
        );
        let max_tries =
            args::max_retries_for(&self.action, &self.device_args, self.settings.max_retries);
        self.budget = RetryBudget::new(self.timeout, max_tries);
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn victim(&self) -> Option<&Victim> {
        self.victim.as_ref()
    }

    /// Argument blob the agent receives on stdin.
    pub fn args(&self) -> &str {
        &self.args
    }

    pub const fn state(&self) -> &ActionState {
        &self.state
    }

    pub const fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    pub const fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Time allowed for the next attempt, `None` when the action has no timeout.
    pub(crate) fn attempt_timeout(&self) -> Option<Duration> {
        let remaining = self.budget.remaining();
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Run the action to completion.
    ///
    /// Each attempt is killed once its share of the budget runs out. Failed
    /// attempts are retried until one succeeds, the attempts are used up or
    /// the remaining time reaches zero.
    pub async fn execute(&mut self) -> ActionOutcome {
        if self.state != ActionState::Created {
            warn!(agent = %self.agent, action = %self.action, "Fence action executed twice");
            return self.outcome();
        }
        loop {
            let timeout = self.attempt_timeout();
            let result = match self.launch().await {
                Ok(mut process) => match process.wait_or_kill(timeout).await {
                    Ok(exit) => {
                        let report = process.finish(exit).await;
                        self.record_report(report)
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if !self.complete_attempt(result) {
                break;
            }
        }
        self.outcome()
    }

    /// Launch the action and return the pid of the first attempt.
    ///
    /// `on_done` runs exactly once, after the last attempt, with the final
    /// outcome. A failure to start the first attempt is returned here instead
    /// and `on_done` is never called.
    pub async fn execute_async<F>(mut self, on_done: F) -> Result<u32>
    where
        F: FnOnce(ActionOutcome) + Send + 'static,
    {
        if self.state != ActionState::Created {
            return Err(FenceError::InvalidArgument(
                "fence action already executed".to_string(),
            ));
        }
        let process = match self.launch().await {
            Ok(process) => process,
            Err(e) => {
                self.fail_launch(e.clone());
                return Err(e);
            }
        };
        let pid = process.pid();
        debug!(
            agent = %self.agent,
            action = %self.action,
            pid,
            timeout = ?self.attempt_timeout(),
            "Fence agent launched"
        );
        tokio::spawn(tracker::track(self, process, Box::new(on_done)));
        Ok(pid)
    }

    /// Start the next attempt.
    pub(crate) async fn launch(&mut self) -> Result<AgentProcess> {
        let retry = self.budget.is_retry();
        let attempt = self.budget.begin_attempt(Instant::now());
        self.state = transition(&self.state, ActionEvent::Launched);
        if retry && !self.settings.retry_delay.is_zero() {
            tokio::time::sleep(self.settings.retry_delay).await;
        }
        debug!(
            agent = %self.agent,
            action = %self.action,
            attempt,
            max = self.budget.max_tries(),
            "Launching fence agent"
        );
        AgentProcess::spawn(&self.agent, &self.args).await
    }

    pub(crate) fn record_report(&mut self, report: AttemptReport) -> Result<()> {
        let result = report.result();
        match (&result, report.exit.timeout_signal) {
            (Err(_), Some(signal)) => info!(
                pid = report.pid,
                action = %self.action,
                signal,
                "Child process timed out"
            ),
            (Err(FenceError::Aborted(signal)), None) => info!(
                pid = report.pid,
                action = %self.action,
                signal,
                "Child process terminated by signal"
            ),
            _ => debug!(
                pid = report.pid,
                action = %self.action,
                status = ?report.exit.status,
                "Child process exited"
            ),
        }
        self.last_report = Some(report);
        result
    }

    /// Feed an attempt's result to the budget and state machine.
    ///
    /// Returns `true` when another attempt should be launched.
    pub(crate) fn complete_attempt(&mut self, result: Result<()>) -> bool {
        let may_retry = match &result {
            Ok(()) => false,
            Err(e) => self.budget.update_after_failure(Instant::now(), e),
        };
        if let Err(e) = &result {
            if may_retry {
                info!(
                    agent = %self.agent,
                    action = %self.action,
                    error = %e,
                    remaining = ?self.budget.remaining(),
                    "Fence agent failed, retrying"
                );
            }
        }
        self.state = transition(&self.state, ActionEvent::Completed { result, may_retry });
        matches!(self.state, ActionState::Retrying { .. })
    }

    pub(crate) fn fail_launch(&mut self, error: FenceError) {
        warn!(agent = %self.agent, action = %self.action, error = %error, "Could not launch fence agent");
        self.state = transition(&self.state, ActionEvent::LaunchFailed(error));
    }

    /// Outcome as of now. Non-terminal actions report a generic failure.
    pub fn outcome(&self) -> ActionOutcome {
        let result = self.state.result().unwrap_or_else(|| {
            Err(FenceError::Generic("fence action did not finish".to_string()))
        });
        let (pid, output, error_output) = match &self.last_report {
            Some(report) => (Some(report.pid), report.stdout.clone(), report.stderr.clone()),
            None => (None, String::new(), String::new()),
        };
        ActionOutcome {
            pid,
            result,
            output,
            error_output,
            attempts: self.budget.tries(),
        }
    }
}

/// Family an agent belongs to, used when registering devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AgentNamespace {
    /// Let the fencer work it out.
    #[default]
    Any,
    /// Red Hat style agents (`fence_*`).
    Rhcs,
    /// Agents built into the fencer.
    Internal,
    /// Linux-HA agents run through a wrapper.
    Heartbeat,
}

impl AgentNamespace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Rhcs => "stonith-ng",
            Self::Internal => "internal",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for AgentNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentNamespace {
    type Err = FenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "any" => Ok(Self::Any),
            "redhat" | "stonith-ng" => Ok(Self::Rhcs),
            "internal" => Ok(Self::Internal),
            "heartbeat" => Ok(Self::Heartbeat),
            other => Err(FenceError::InvalidArgument(format!(
                "unsupported agent namespace '{other}'"
            ))),
        }
    }
}

impl From<AgentNamespace> for String {
    fn from(namespace: AgentNamespace) -> Self {
        namespace.as_str().to_string()
    }
}

impl TryFrom<String> for AgentNamespace {
    type Error = FenceError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}
