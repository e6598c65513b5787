//! Background supervision of asynchronously launched agents.

use tracing::{debug, info};

use super::invoker::AgentProcess;
use super::{ActionOutcome, FenceAction};

/// Called exactly once with the final outcome of an asynchronous action.
pub type DoneCallback = Box<dyn FnOnce(ActionOutcome) + Send + 'static>;

/// Watch `process` until the action reaches a terminal state.
///
/// Failed attempts are relaunched in place while the retry budget allows it;
/// nothing reaches `done` until the action is finished.
pub(crate) async fn track(mut action: FenceAction, mut process: AgentProcess, done: DoneCallback) {
    loop {
        let timeout = action.attempt_timeout();
        let grace = action.settings().kill_grace;
        debug!(
            agent = %action.agent(),
            action = %action.action(),
            pid = process.pid(),
            timeout = ?timeout,
            "Tracking fence agent"
        );

        let result = match process.wait_with_escalation(timeout, grace).await {
            Ok(exit) => {
                let report = process.finish(exit).await;
                action.record_report(report)
            }
            Err(e) => Err(e),
        };

        if !action.complete_attempt(result) {
            break;
        }

        match action.launch().await {
            Ok(next) => process = next,
            Err(e) => {
                action.fail_launch(e);
                break;
            }
        }
    }

    let outcome = action.outcome();
    info!(
        agent = %action.agent(),
        action = %action.action(),
        rc = outcome.rc(),
        attempts = outcome.attempts,
        "Asynchronous fence action finished"
    );
    done(outcome);
}
