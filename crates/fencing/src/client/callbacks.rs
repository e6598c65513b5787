//! Pending-call callbacks and their fallback timers.
//!
//! Each asynchronous call can have one callback registered under its call
//! id. The entry is removed before the callback runs, so whichever of the
//! reply or the timer gets there first is the only one to fire. A separate
//! catch-all callback, registered under call id 0, sees every result after
//! the per-call callback has run.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::options::CallOptions;
use crate::error::{FenceError, Result};

/// What a callback learns about a finished call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackData {
    pub call_id: i32,
    pub result: Result<()>,
    /// Reply body, if the fencer sent one.
    pub payload: Option<Value>,
}

/// Handler for call results. Any user context lives in the closure.
pub type CallCallback = Arc<dyn Fn(&CallbackData) + Send + Sync>;

struct PendingCall {
    name: String,
    callback: CallCallback,
    only_success: bool,
    allow_timeout_updates: bool,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    calls: HashMap<i32, PendingCall>,
    catch_all: Option<CallCallback>,
}

/// Table of pending calls owned by one connection.
#[derive(Clone)]
pub struct CallbackRegistry {
    inner: Arc<Mutex<Registry>>,
    grace: Duration,
}

impl CallbackRegistry {
    /// New registry whose timers fire `grace` after the deadline they are given.
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            grace,
        }
    }

    /// Register `callback` for `call_id`.
    ///
    /// - `0` installs the catch-all callback.
    /// - A negative id is a call that failed before it was sent; the callback
    ///   runs right away with that error unless `report_only_success` is set.
    /// - Otherwise the callback waits for the reply. With a `timeout` it also
    ///   fires with [`FenceError::TimedOut`] if no reply arrives within
    ///   `timeout` plus the registry's grace.
    ///
    /// Returns whether a callback is now pending.
    pub fn register(
        &self,
        call_id: i32,
        timeout: Option<Duration>,
        options: CallOptions,
        name: &str,
        callback: CallCallback,
    ) -> bool {
        if call_id == 0 {
            debug!(callback = name, "Installing catch-all callback");
            self.inner.lock().catch_all = Some(callback);
            return true;
        }

        if call_id < 0 {
            let err = FenceError::from_code(call_id).unwrap_or(FenceError::Remote(call_id));
            if options.report_only_success {
                warn!(call_id, error = %err, "Fencer call failed");
            } else {
                trace!(callback = name, error = %err, "Call failed, invoking callback");
                callback(&CallbackData {
                    call_id,
                    result: Err(err),
                    payload: None,
                });
            }
            return false;
        }

        let mut entry = PendingCall {
            name: name.to_string(),
            callback,
            only_success: options.report_only_success,
            allow_timeout_updates: options.timeout_updates,
            timer: None,
        };
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            entry.timer = self.arm_timer(call_id, timeout);
        }

        let previous = self.inner.lock().calls.insert(call_id, entry);
        if let Some(mut previous) = previous {
            warn!(call_id, callback = %previous.name, "Replacing pending callback");
            previous.cancel_timer();
        }
        trace!(call_id, callback = name, "Added callback");
        true
    }

    fn arm_timer(&self, call_id: i32, timeout: Duration) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(call_id, "No runtime available, callback timer not armed");
            return None;
        };
        let deadline = timeout + self.grace;
        let registry = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            tokio::time::sleep(deadline).await;
            error!(call_id, timeout = ?deadline, "Async call timed out");
            fire_timer(&registry, call_id);
        }))
    }

    /// Re-arm the timer of `call_id` with a new deadline.
    ///
    /// Only calls registered with `timeout_updates` accept this; for anything
    /// else the update is ignored.
    pub fn update_timeout(&self, call_id: i32, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let mut registry = self.inner.lock();
        let Some(entry) = registry.calls.get_mut(&call_id) else {
            trace!(call_id, "Timeout update for unknown call");
            return;
        };
        if !entry.allow_timeout_updates {
            trace!(call_id, "Call does not accept timeout updates");
            return;
        }
        entry.cancel_timer();
        entry.timer = self.arm_timer(call_id, timeout);
        debug!(call_id, timeout = ?timeout, "Callback timeout updated");
    }

    /// Deliver the result of `call_id`.
    pub fn complete(&self, call_id: i32, result: Result<()>, payload: Option<Value>) {
        if call_id <= 0 {
            error!(call_id, "Bad result: invalid call id");
        }
        let (entry, catch_all) = {
            let mut registry = self.inner.lock();
            (registry.calls.remove(&call_id), registry.catch_all.clone())
        };
        deliver(call_id, result, payload, entry, catch_all);
    }

    /// Remove the callback for `call_id`; `0` removes the catch-all.
    pub fn remove(&self, call_id: i32) -> Result<()> {
        let mut registry = self.inner.lock();
        if call_id == 0 {
            return registry
                .catch_all
                .take()
                .map(|_| ())
                .ok_or_else(|| FenceError::NotFound("no catch-all callback".to_string()));
        }
        match registry.calls.remove(&call_id) {
            Some(mut entry) => {
                entry.cancel_timer();
                Ok(())
            }
            None => Err(FenceError::NotFound(format!("no callback for call {call_id}"))),
        }
    }

    /// Drop every callback, including the catch-all, and stop all timers.
    pub fn clear(&self) {
        let mut registry = self.inner.lock();
        for (_, mut entry) in registry.calls.drain() {
            entry.cancel_timer();
        }
        registry.catch_all = None;
    }

    /// Pending call ids and their callback names, ordered by call id.
    pub fn pending(&self) -> Vec<(i32, String)> {
        let registry = self.inner.lock();
        let mut pending: Vec<_> = registry
            .calls
            .iter()
            .map(|(id, entry)| (*id, entry.name.clone()))
            .collect();
        pending.sort_unstable_by_key(|(id, _)| *id);
        pending
    }

    pub fn dump_pending(&self) {
        for (call_id, name) in self.pending() {
            debug!(call_id, callback = %name, "Call pending");
        }
    }

    pub fn is_pending(&self, call_id: i32) -> bool {
        self.inner.lock().calls.contains_key(&call_id)
    }

    pub fn has_catch_all(&self) -> bool {
        self.inner.lock().catch_all.is_some()
    }
}

fn fire_timer(registry: &Weak<Mutex<Registry>>, call_id: i32) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let (entry, catch_all) = {
        let mut registry = registry.lock();
        let Some(mut entry) = registry.calls.remove(&call_id) else {
            return;
        };
        // We are the timer; nothing left to cancel.
        entry.timer = None;
        (Some(entry), registry.catch_all.clone())
    };
    deliver(call_id, Err(FenceError::TimedOut), None, entry, catch_all);
}

fn deliver(
    call_id: i32,
    result: Result<()>,
    payload: Option<Value>,
    entry: Option<PendingCall>,
    catch_all: Option<CallCallback>,
) {
    let data = CallbackData {
        call_id,
        result,
        payload,
    };
    let mut handled = false;
    match entry {
        Some(mut entry) => {
            entry.cancel_timer();
            if data.result.is_ok() || !entry.only_success {
                trace!(call_id, callback = %entry.name, "Invoking callback");
                (entry.callback)(&data);
                handled = true;
            }
        }
        None => trace!(call_id, "No callback found"),
    }

    if let Some(catch_all) = catch_all {
        trace!(call_id, "Invoking catch-all callback");
        catch_all(&data);
    } else if !handled {
        if let Err(e) = &data.result {
            warn!(call_id, error = %e, "Fencing command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (CallCallback, Arc<Mutex<Vec<CallbackData>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: CallCallback = Arc::new(move |data: &CallbackData| sink.lock().push(data.clone()));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_reply_fires_once() {
        let registry = CallbackRegistry::new(Duration::from_secs(60));
        let (callback, seen) = recorder();
        assert!(registry.register(5, None, CallOptions::default(), "cb", callback));

        registry.complete(5, Ok(()), None);
        registry.complete(5, Ok(()), None);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].call_id, 5);
        assert!(registry.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_grace() {
        let registry = CallbackRegistry::new(Duration::from_secs(60));
        let (callback, seen) = recorder();
        registry.register(3, Some(Duration::from_secs(10)), CallOptions::default(), "cb", callback);

        tokio::time::sleep(Duration::from_secs(69)).await;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].result, Err(FenceError::TimedOut));
        }

        // A late reply finds nothing to fire.
        registry.complete(3, Ok(()), None);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_cancels_timer() {
        let registry = CallbackRegistry::new(Duration::ZERO);
        let (callback, seen) = recorder();
        registry.register(4, Some(Duration::from_secs(5)), CallOptions::default(), "cb", callback);

        registry.complete(4, Ok(()), None);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_update_requires_opt_in() {
        let registry = CallbackRegistry::new(Duration::ZERO);
        let (opted_in, seen_in) = recorder();
        let (opted_out, seen_out) = recorder();
        registry.register(
            1,
            Some(Duration::from_secs(5)),
            CallOptions::default().with_timeout_updates(true),
            "in",
            opted_in,
        );
        registry.register(2, Some(Duration::from_secs(5)), CallOptions::default(), "out", opted_out);

        registry.update_timeout(1, Duration::from_secs(30));
        registry.update_timeout(2, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(seen_in.lock().is_empty());
        assert_eq!(seen_out.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(seen_in.lock().len(), 1);
    }

    #[test]
    fn test_negative_call_id_fires_immediately() {
        let registry = CallbackRegistry::new(Duration::ZERO);
        let (callback, seen) = recorder();
        assert!(!registry.register(-libc::ENOTCONN, None, CallOptions::default(), "cb", callback));
        assert_eq!(seen.lock()[0].result, Err(FenceError::NotConnected));

        let (quiet, quiet_seen) = recorder();
        registry.register(
            -libc::ENOTCONN,
            None,
            CallOptions::default().with_report_only_success(true),
            "quiet",
            quiet,
        );
        assert!(quiet_seen.lock().is_empty());
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn test_only_success_suppresses_failures() {
        let registry = CallbackRegistry::new(Duration::ZERO);
        let (callback, seen) = recorder();
        registry.register(
            9,
            None,
            CallOptions::default().with_report_only_success(true),
            "cb",
            callback,
        );
        registry.complete(9, Err(FenceError::NoData), None);
        assert!(seen.lock().is_empty());
        // Still single-fire: the entry is gone.
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn test_catch_all_runs_after_specific_callback() {
        let registry = CallbackRegistry::new(Duration::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));
        let specific_order = Arc::clone(&order);
        let global_order = Arc::clone(&order);
        registry.register(
            0,
            None,
            CallOptions::default(),
            "global",
            Arc::new(move |_: &CallbackData| global_order.lock().push("global")),
        );
        registry.register(
            6,
            None,
            CallOptions::default(),
            "specific",
            Arc::new(move |_: &CallbackData| specific_order.lock().push("specific")),
        );

        registry.complete(6, Ok(()), None);
        registry.complete(77, Ok(()), None);
        assert_eq!(*order.lock(), vec!["specific", "global", "global"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = CallbackRegistry::new(Duration::ZERO);
        let (callback, seen) = recorder();
        registry.register(0, None, CallOptions::default(), "global", Arc::clone(&callback));
        registry.register(2, None, CallOptions::default(), "two", Arc::clone(&callback));
        registry.register(1, None, CallOptions::default(), "one", callback);
        assert_eq!(
            registry.pending(),
            vec![(1, "one".to_string()), (2, "two".to_string())]
        );

        assert!(registry.remove(2).is_ok());
        assert!(matches!(registry.remove(2), Err(FenceError::NotFound(_))));
        assert!(registry.remove(0).is_ok());
        assert!(!registry.has_catch_all());

        registry.clear();
        registry.complete(1, Ok(()), None);
        assert!(seen.lock().is_empty());
    }
}
