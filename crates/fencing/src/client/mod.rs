//! Client for the fencing coordinator ("fencer").
//!
//! A [`FencerClient`] owns one connection: it registers with the fencer,
//! numbers and sends commands, matches synchronous responses by call id, and
//! routes asynchronous replies, timeout updates and pushed events to the
//! callbacks and subscribers registered on it.
//!
//! In [`ConnectionMode::EventLoop`] the client runs its own dispatch task. In
//! [`ConnectionMode::Command`] nothing is read until the caller drives
//! [`FencerClient::dispatch`] or [`FencerClient::wait_and_dispatch`].

pub mod callbacks;
pub mod history;
pub mod message;
pub mod notify;
pub mod options;
pub mod transport;

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::action::AgentNamespace;
use crate::config::FencingConfig;
use crate::error::{check_code, FenceError, Result};

pub use callbacks::{CallCallback, CallbackData, CallbackRegistry};
pub use history::{kick, last_fenced, last_fenced_time, NodeRef};
pub use message::{
    events, ops, DeviceRegistration, ExecRequest, ExecResult, FenceEvent, FenceRequest, Frame,
    HistoryEntry, HistoryList, HistoryRequest, HistoryState, LevelRegistration, LevelTarget,
    Notification, NotifyToggle, QueryRequest, QueryResult, Reply, Request, Response,
    TimeoutUpdate,
};
pub use notify::{NotificationHub, NotifyCallback};
pub use options::CallOptions;
pub use transport::{Incoming, Transport, UnixTransport};

/// How events reach the client once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// The caller polls with [`FencerClient::dispatch`].
    Command,
    /// A background task dispatches events as they arrive.
    EventLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(ConnectionMode),
}

/// Result of a successfully sent command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// Id assigned to the call. For asynchronous calls, the id the reply will carry.
    pub call_id: i32,
    /// Body of a synchronous response, unless discarded.
    pub payload: Option<Value>,
}

/// Callback to install under the call id of a request about to be sent.
struct PendingCallback {
    name: String,
    callback: CallCallback,
}

struct ClientInner {
    config: FencingConfig,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    token: Mutex<Option<String>>,
    last_call_id: Mutex<i32>,
    /// One request/response exchange at a time.
    call_lock: tokio::sync::Mutex<()>,
    callbacks: CallbackRegistry,
    notifications: NotificationHub,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Connection to the fencer.
#[derive(Clone)]
pub struct FencerClient {
    inner: Arc<ClientInner>,
}

impl FencerClient {
    pub fn new(config: FencingConfig) -> Self {
        let callbacks = CallbackRegistry::new(config.callback_grace());
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                transport: Mutex::new(None),
                token: Mutex::new(None),
                last_call_id: Mutex::new(0),
                call_lock: tokio::sync::Mutex::new(()),
                callbacks,
                notifications: NotificationHub::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &FencingConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected(_))
    }

    /// Connect to the fencer socket from the configuration and register.
    pub async fn connect(&self, mode: ConnectionMode) -> Result<()> {
        self.begin_connect()?;
        let transport = match UnixTransport::connect(&self.inner.config.socket_path).await {
            Ok(transport) => transport,
            Err(e) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        self.finish_connect(Arc::new(transport), mode).await
    }

    /// Register over an already established transport.
    pub async fn connect_with(
        &self,
        transport: Arc<dyn Transport>,
        mode: ConnectionMode,
    ) -> Result<()> {
        self.begin_connect()?;
        self.finish_connect(transport, mode).await
    }

    fn begin_connect(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != ConnectionState::Disconnected {
            return Err(FenceError::InvalidArgument(
                "connection already established".to_string(),
            ));
        }
        trace!("Connecting command channel");
        *state = ConnectionState::Connecting;
        Ok(())
    }

    async fn finish_connect(&self, transport: Arc<dyn Transport>, mode: ConnectionMode) -> Result<()> {
        *self.inner.transport.lock() = Some(Arc::clone(&transport));

        let token = match self.register(transport.as_ref()).await {
            Ok(token) => token,
            Err(e) => {
                debug!(error = %e, "Connection to fencer failed");
                self.inner.teardown(false, true);
                return Err(e);
            }
        };

        trace!(token = %token, "Obtained registration token");
        *self.inner.token.lock() = Some(token);
        *self.inner.state.lock() = ConnectionState::Connected(mode);
        if mode == ConnectionMode::EventLoop {
            let handle = spawn_dispatcher(&self.inner, Arc::clone(&transport));
            *self.inner.dispatcher.lock() = Some(handle);
        }

        for event in self.inner.notifications.events() {
            if let Err(e) = self.set_notification(&event, true).await {
                warn!(event = %event, error = %e, "Could not activate notifications");
            }
        }
        if !self.is_connected() {
            return Err(FenceError::Communication(
                "connection lost while activating notifications".to_string(),
            ));
        }

        debug!(mode = ?mode, "Connection to fencer successful");
        Ok(())
    }

    async fn register(&self, transport: &dyn Transport) -> Result<String> {
        let hello = Frame::Command(Request {
            operation: ops::REGISTER.to_string(),
            call_id: 0,
            call_options: CallOptions::default(),
            client_token: None,
            client_name: Some(self.inner.config.client_name.clone()),
            timeout: 0,
            payload: None,
        });
        let response = transport
            .send(&hello, true, Some(self.inner.config.default_timeout()))
            .await
            .map_err(|e| {
                debug!(error = %e, "Couldn't complete registration with the fencer");
                match e {
                    FenceError::Protocol(_) => e,
                    other => FenceError::Communication(other.to_string()),
                }
            })?;

        let Some(response) = response else {
            error!("Did not receive registration reply");
            return Err(FenceError::Protocol("no registration reply".to_string()));
        };
        if response.operation.as_deref() != Some(ops::REGISTER) {
            error!(operation = ?response.operation, "Invalid registration message");
            return Err(FenceError::Protocol(format!(
                "invalid registration reply: {:?}",
                response.operation
            )));
        }
        response.client_id.ok_or_else(|| {
            error!("No registration token provided");
            FenceError::Protocol("no registration token provided".to_string())
        })
    }

    /// Drop the connection.
    ///
    /// Subscribers of [`events::DISCONNECT`] are told, then every pending
    /// callback and subscription is discarded. Calling this on a
    /// disconnected client does nothing.
    pub fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        debug!("Disconnecting from the fencer");
        self.inner.teardown(true, true);
    }

    /// Send a command.
    ///
    /// With `options.sync_call` this waits for the fencer's response, which
    /// must carry our call id; its result code becomes the result. Otherwise
    /// the assigned call id is returned straight away and the outcome arrives
    /// later through the callback registered for that id.
    pub async fn send_command(
        &self,
        operation: &str,
        payload: Option<Value>,
        options: CallOptions,
        timeout: Duration,
    ) -> Result<CommandReply> {
        self.send_request(operation, payload, options, timeout, None)
            .await
    }

    /// Send an asynchronous command with its reply callback already in place.
    ///
    /// The callback is registered under the new call id before the request
    /// is written, so a reply dispatched straight away still finds it. Its
    /// timer uses `timeout`. If sending fails the callback is removed again
    /// and the error is returned here instead.
    pub async fn send_command_with_callback<F>(
        &self,
        operation: &str,
        payload: Option<Value>,
        options: CallOptions,
        timeout: Duration,
        name: &str,
        callback: F,
    ) -> Result<CommandReply>
    where
        F: Fn(&CallbackData) + Send + Sync + 'static,
    {
        let pending = PendingCallback {
            name: name.to_string(),
            callback: Arc::new(callback),
        };
        self.send_request(
            operation,
            payload,
            options.with_sync_call(false),
            timeout,
            Some(pending),
        )
        .await
    }

    async fn send_request(
        &self,
        operation: &str,
        payload: Option<Value>,
        options: CallOptions,
        timeout: Duration,
        pending: Option<PendingCallback>,
    ) -> Result<CommandReply> {
        if !self.is_connected() {
            return Err(FenceError::NotConnected);
        }
        if operation.is_empty() {
            error!("No operation specified");
            return Err(FenceError::InvalidArgument("no operation specified".to_string()));
        }
        let transport = self.inner.current_transport().ok_or(FenceError::NotConnected)?;
        let token = self.inner.token.lock().clone().ok_or(FenceError::NotConnected)?;

        let _exchange = self.inner.call_lock.lock().await;
        let call_id = self.inner.next_call_id();
        let request = Frame::Command(Request {
            operation: operation.to_string(),
            call_id,
            call_options: options,
            client_token: Some(token),
            client_name: None,
            timeout: timeout.as_secs(),
            payload,
        });
        let registered = pending.is_some_and(|pending| {
            self.inner.callbacks.register(
                call_id,
                Some(timeout),
                options,
                &pending.name,
                pending.callback,
            )
        });
        trace!(operation, call_id, timeout = ?timeout, "Sending message to fencer");

        let wait = timeout + self.inner.config.callback_grace();
        let sent = self
            .exchange(transport.as_ref(), &request, call_id, options.sync_call, wait)
            .await;

        if !transport.is_connected() {
            error!("Fencer disconnected");
            self.inner.connection_lost(&transport, true);
        }

        let response = sent.map_err(|e| {
            error!(operation, timeout = ?timeout, error = %e, "Couldn't perform operation");
            if registered {
                // Teardown may have cleared it already.
                let _ = self.inner.callbacks.remove(call_id);
            }
            match e {
                FenceError::Protocol(_) => e,
                other => FenceError::Communication(other.to_string()),
            }
        })?;

        if !options.sync_call {
            trace!(call_id, "Async call, returning");
            return Ok(CommandReply {
                call_id,
                payload: None,
            });
        }

        let Some(response) = response else {
            return Err(FenceError::Protocol(
                "no response to synchronous call".to_string(),
            ));
        };
        match response.call_id {
            Some(id) if id == call_id => trace!(call_id, "Synchronous reply received"),
            Some(id) if id > 0 => {
                error!(got = id, wanted = call_id, "Received bad reply: mismatched call id");
                return Err(FenceError::Protocol(format!(
                    "mismatched reply {id}, wanted {call_id}"
                )));
            }
            _ => {
                error!(wanted = call_id, "Received bad reply: no id set");
                return Err(FenceError::Protocol("reply carries no call id".to_string()));
            }
        }
        let code = response
            .result_code
            .ok_or_else(|| FenceError::Protocol("reply carries no result code".to_string()))?;
        check_code(code)?;

        let payload = if options.discard_reply {
            trace!(call_id, "Discarding reply");
            None
        } else {
            response.payload
        };
        Ok(CommandReply { call_id, payload })
    }

    /// Write `request` and, when `expect_response`, read its response.
    ///
    /// Responses to earlier calls that arrive after their caller gave up are
    /// dropped. All reads share one deadline of `wait` from now.
    async fn exchange(
        &self,
        transport: &dyn Transport,
        request: &Frame,
        call_id: i32,
        expect_response: bool,
        wait: Duration,
    ) -> Result<Option<Response>> {
        let deadline = Instant::now() + wait;
        let Some(mut response) = transport.send(request, expect_response, Some(wait)).await? else {
            return Ok(None);
        };
        while let Some(id) = response.call_id.filter(|id| *id > 0 && *id < call_id) {
            warn!(got = id, wanted = call_id, "Discarding old reply");
            let remaining = deadline.saturating_duration_since(Instant::now());
            response = transport.next_response(Some(remaining)).await?;
        }
        Ok(Some(response))
    }

    /// Handle everything the fencer has pushed so far.
    ///
    /// Returns `false` once the connection is gone.
    pub async fn dispatch(&self) -> bool {
        let Some(transport) = self.inner.current_transport() else {
            return false;
        };
        loop {
            match transport.try_next_event() {
                Incoming::Empty => return true,
                incoming => {
                    if !self.inner.handle_incoming(&transport, incoming, false) {
                        return false;
                    }
                }
            }
        }
    }

    /// Wait until the fencer pushes something, then dispatch it and anything queued behind it.
    pub async fn wait_and_dispatch(&self) -> bool {
        let Some(transport) = self.inner.current_transport() else {
            return false;
        };
        let incoming = transport.next_event().await;
        if !self.inner.handle_incoming(&transport, incoming, false) {
            return false;
        }
        self.dispatch().await
    }

    // Callbacks

    /// Register a callback for the reply to `call_id`. See [`CallbackRegistry::register`].
    ///
    /// In event-loop mode a reply can be dispatched before this returns. Use
    /// [`FencerClient::send_command_with_callback`] for calls made in that mode.
    pub fn register_callback<F>(
        &self,
        call_id: i32,
        timeout: Option<Duration>,
        options: CallOptions,
        name: &str,
        callback: F,
    ) -> bool
    where
        F: Fn(&CallbackData) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .register(call_id, timeout, options, name, Arc::new(callback))
    }

    /// Remove the callback for `call_id`; `0` removes the catch-all.
    pub fn remove_callback(&self, call_id: i32) -> Result<()> {
        self.inner.callbacks.remove(call_id)
    }

    pub fn remove_all_callbacks(&self) {
        self.inner.callbacks.clear();
    }

    pub fn pending_calls(&self) -> Vec<(i32, String)> {
        self.inner.callbacks.pending()
    }

    pub fn dump_pending_calls(&self) {
        self.inner.callbacks.dump_pending();
    }

    // Notifications

    /// Subscribe `handler` to `event` under the identity `id`.
    ///
    /// When connected, the fencer is asked to start sending the event.
    pub async fn subscribe<F>(&self, event: &str, id: &str, handler: F) -> Result<()>
    where
        F: Fn(&FenceEvent) + Send + Sync + 'static,
    {
        trace!(event, total = self.inner.notifications.len(), "Adding callback for events");
        self.inner
            .notifications
            .subscribe(event, id, Arc::new(handler))?;
        if self.is_connected() {
            if let Err(e) = self.set_notification(event, true).await {
                warn!(event, error = %e, "Couldn't register for fencing notifications");
            }
        }
        Ok(())
    }

    /// Remove the oldest subscription to `event`.
    pub async fn unsubscribe(&self, event: &str) -> Result<()> {
        debug!(event, "Removing callback for events");
        if self.is_connected() {
            if let Err(e) = self.set_notification(event, false).await {
                warn!(event, error = %e, "Couldn't unregister fencing notifications");
            }
        }
        self.inner.notifications.unsubscribe(event)
    }

    async fn set_notification(&self, event: &str, enabled: bool) -> Result<()> {
        let transport = self.inner.current_transport().ok_or(FenceError::NotConnected)?;
        let toggle = if enabled {
            NotifyToggle::Activate(event.to_string())
        } else {
            NotifyToggle::Deactivate(event.to_string())
        };
        let frame = Frame::Command(Request {
            operation: ops::NOTIFY.to_string(),
            call_id: 0,
            call_options: CallOptions::default(),
            client_token: self.inner.token.lock().clone(),
            client_name: None,
            timeout: 0,
            payload: Some(message::to_payload(&toggle)?),
        });
        let _exchange = self.inner.call_lock.lock().await;
        let sent = transport
            .send(&frame, true, Some(self.inner.config.default_timeout()))
            .await;
        if !transport.is_connected() {
            self.inner.connection_lost(&transport, true);
        }
        let response = sent.map_err(|e| FenceError::Communication(e.to_string()))?;
        match response.and_then(|r| r.result_code) {
            Some(code) => check_code(code),
            None => Ok(()),
        }
    }

    // Operations

    pub async fn register_device(
        &self,
        options: CallOptions,
        id: &str,
        namespace: AgentNamespace,
        agent: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<CommandReply> {
        require("device id", id)?;
        require("agent", agent)?;
        let registration = DeviceRegistration::new(id, namespace, agent, params);
        self.send_command(
            ops::DEVICE_ADD,
            Some(message::to_payload(&registration)?),
            options,
            Duration::ZERO,
        )
        .await
    }

    pub async fn remove_device(&self, options: CallOptions, id: &str) -> Result<CommandReply> {
        require("device id", id)?;
        self.send_command(ops::DEVICE_DEL, Some(json!({ "id": id })), options, Duration::ZERO)
            .await
    }

    /// Register topology level `level` for `target`, made of `devices` in order.
    pub async fn register_level(
        &self,
        options: CallOptions,
        target: LevelTarget,
        level: u32,
        devices: &[String],
    ) -> Result<CommandReply> {
        let registration = LevelRegistration::new(target, level, devices)?;
        self.send_command(
            ops::LEVEL_ADD,
            Some(message::to_payload(&registration)?),
            options,
            Duration::ZERO,
        )
        .await
    }

    pub async fn remove_level(
        &self,
        options: CallOptions,
        target: LevelTarget,
        level: u32,
    ) -> Result<CommandReply> {
        let registration = LevelRegistration::new(target, level, &[])?;
        self.send_command(
            ops::LEVEL_DEL,
            Some(message::to_payload(&registration)?),
            options,
            Duration::ZERO,
        )
        .await
    }

    /// Ids of the devices able to fence `target`. Always waits for the answer.
    pub async fn query(
        &self,
        options: CallOptions,
        target: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        require("target", target)?;
        let request = QueryRequest {
            target: target.to_string(),
            action: "off".to_string(),
        };
        let reply = self
            .send_command(
                ops::QUERY,
                Some(message::to_payload(&request)?),
                options.with_sync_call(true).with_discard_reply(false),
                timeout,
            )
            .await?;
        let result: QueryResult = message::from_payload(reply.payload)?;
        for (index, device) in result.devices.iter().enumerate() {
            info!(index, device = %device.id, agent = ?device.agent, "Device able to fence target");
        }
        Ok(result.devices.into_iter().map(|d| d.id).collect())
    }

    /// Ask the fencer to run `action` on `device`, optionally for `target`.
    pub async fn call(
        &self,
        options: CallOptions,
        device: &str,
        action: &str,
        target: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandReply> {
        require("device id", device)?;
        require("action", action)?;
        let request = ExecRequest {
            device: device.to_string(),
            action: action.to_string(),
            target: target.map(str::to_string),
        };
        self.send_command(ops::EXEC, Some(message::to_payload(&request)?), options, timeout)
            .await
    }

    /// Port list reported by `device`, when the call is synchronous.
    pub async fn list(
        &self,
        options: CallOptions,
        device: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let reply = self.call(options, device, "list", None, timeout).await?;
        let result: ExecResult = message::from_payload(reply.payload)?;
        Ok(result.output)
    }

    pub async fn monitor(
        &self,
        options: CallOptions,
        device: &str,
        timeout: Duration,
    ) -> Result<CommandReply> {
        self.call(options, device, "monitor", None, timeout).await
    }

    pub async fn status(
        &self,
        options: CallOptions,
        device: &str,
        port: &str,
        timeout: Duration,
    ) -> Result<CommandReply> {
        self.call(options, device, "status", Some(port), timeout).await
    }

    /// Ask the fencer to fence `target`.
    ///
    /// `tolerance` lets a fencing of the same target that finished within
    /// that window count as this one.
    pub async fn fence(
        &self,
        options: CallOptions,
        target: &str,
        action: &str,
        timeout: Duration,
        tolerance: Duration,
    ) -> Result<CommandReply> {
        require("target", target)?;
        require("action", action)?;
        let request = FenceRequest {
            target: target.to_string(),
            action: action.to_string(),
            timeout: timeout.as_secs(),
            tolerance: tolerance.as_secs(),
        };
        self.send_command(ops::FENCE, Some(message::to_payload(&request)?), options, timeout)
            .await
    }

    /// Tell the fencer an operator has made sure `target` is down.
    pub async fn confirm(&self, options: CallOptions, target: &str) -> Result<CommandReply> {
        self.fence(
            options.with_manual_ack(true),
            target,
            "off",
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
    }

    /// Fencing history, for one node or all of them. Always waits for the answer.
    pub async fn history(
        &self,
        options: CallOptions,
        node: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<HistoryEntry>> {
        let request = HistoryRequest {
            target: node.map(str::to_string),
        };
        let reply = self
            .send_command(
                ops::FENCE_HISTORY,
                Some(message::to_payload(&request)?),
                options.with_sync_call(true).with_discard_reply(false),
                timeout,
            )
            .await?;
        let list: HistoryList = message::from_payload(reply.payload)?;
        Ok(list.history)
    }
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(FenceError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

impl ClientInner {
    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    /// Next call id: positive, increasing, and not held by a pending callback.
    fn next_call_id(&self) -> i32 {
        let mut last = self.last_call_id.lock();
        loop {
            *last = last.wrapping_add(1);
            if *last < 1 {
                *last = 1;
            }
            if !self.callbacks.is_pending(*last) {
                return *last;
            }
        }
    }

    /// Returns `false` once the connection is gone.
    fn handle_incoming(
        &self,
        transport: &Arc<dyn Transport>,
        incoming: Incoming,
        from_dispatcher: bool,
    ) -> bool {
        match incoming {
            Incoming::Frame(frame) => {
                self.handle_frame(frame);
                true
            }
            Incoming::Malformed(e) => {
                warn!(error = %e, "Received malformed message from fencer");
                true
            }
            Incoming::Empty => true,
            Incoming::Closed => {
                error!("Connection to fencer closed");
                self.connection_lost(transport, !from_dispatcher);
                false
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Reply(reply) => {
                trace!(call_id = reply.call_id, "Activating reply callbacks");
                self.callbacks
                    .complete(reply.call_id, check_code(reply.result_code), reply.payload);
            }
            Frame::Notify(notification) => self.notifications.dispatch(&notification),
            Frame::Timeout(update) => self
                .callbacks
                .update_timeout(update.call_id, Duration::from_secs(update.timeout)),
            Frame::Response(response) => {
                warn!(call_id = ?response.call_id, "Discarding unexpected response");
            }
            Frame::Command(request) => {
                error!(operation = %request.operation, "Unknown message type");
            }
        }
    }

    /// Tear down if `transport` is still the live one.
    fn connection_lost(&self, transport: &Arc<dyn Transport>, abort_dispatcher: bool) {
        let current = self
            .transport
            .lock()
            .as_ref()
            .is_some_and(|t| std::ptr::addr_eq(Arc::as_ptr(t), Arc::as_ptr(transport)));
        if current {
            self.teardown(true, abort_dispatcher);
        }
    }

    fn teardown(&self, notify: bool, abort_dispatcher: bool) {
        *self.state.lock() = ConnectionState::Disconnected;
        if let Some(handle) = self.dispatcher.lock().take() {
            if abort_dispatcher {
                handle.abort();
            }
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        *self.token.lock() = None;
        self.callbacks.clear();
        if notify {
            trace!("Sending destroyed notification");
            self.notifications.broadcast(&FenceEvent::disconnected());
            self.notifications.clear();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
        if let Some(transport) = self.transport.get_mut().take() {
            transport.close();
        }
    }
}

fn spawn_dispatcher(inner: &Arc<ClientInner>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
    let client: Weak<ClientInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let incoming = transport.next_event().await;
            let Some(inner) = client.upgrade() else {
                break;
            };
            if !inner.handle_incoming(&transport, incoming, true) {
                break;
            }
        }
        trace!("Dispatcher stopped");
    })
}
