//! Engine implementation: identifier allocation, dispatch, cancellation.

use crate::driver;
use crate::error::{Completion, EngineError, HandlerError, Result};
use crate::options::{CallOptions, SubscriptionOptions};
use crate::queue::CallbackQueue;
use crate::registry::{
    ActiveSubscription, Canceled, Entry, EntryKind, PendingCall, RawCompletion, Registry,
};
use crate::subscription::{
    CallbackSubscription, ChannelSubscription, SubscriptionEvent, SubscriptionHandler,
    SubscriptionState,
};
use crate::transport::{connector_for, Connector};
use chainrpc_config::EngineConfig;
use chainrpc_protocol::{
    parse_frame, Inbound, ProtocolError, RemoteId, Request, RequestId, SubscriptionPush,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Connection status as seen by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// JSON-RPC call and subscription contract
///
/// Implemented by [`RpcEngine`]; code that talks to a node can be generic
/// over this trait and be exercised against a fake engine.
pub trait JsonRpcEngine: Send + Sync {
    /// Issue a call and return its identifier.
    ///
    /// The completion, if any, fires exactly once with the decoded result or
    /// an error, unless the identifier is canceled first. `params` that
    /// serialize to `null` (e.g. `()`) are sent as an empty list.
    fn call_method<P, T>(
        &self,
        method: &str,
        params: P,
        options: CallOptions,
        completion: Option<Completion<T>>,
    ) -> Result<RequestId>
    where
        P: Serialize,
        T: DeserializeOwned + Send + 'static;

    /// Register a subscription driven by an arbitrary handler
    fn subscribe_with_handler<P>(
        &self,
        method: &str,
        params: P,
        options: SubscriptionOptions,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<RequestId>
    where
        P: Serialize;

    /// Drop whatever owns `id`. Unknown identifiers are ignored.
    fn cancel_for_identifier(&self, id: RequestId);

    /// Subscribe with closures: `update` per decoded push, `failure` with
    /// the error and whether the subscription was torn down by it.
    fn subscribe<P, T, U, F>(
        &self,
        method: &str,
        params: P,
        options: SubscriptionOptions,
        update: U,
        failure: F,
    ) -> Result<RequestId>
    where
        P: Serialize,
        T: DeserializeOwned + Send + 'static,
        U: FnMut(T) + Send + 'static,
        F: FnMut(EngineError, bool) + Send + 'static,
    {
        let handler = CallbackSubscription::new(update, failure);
        self.subscribe_with_handler(method, params, options, Arc::new(handler))
    }

    /// Issue a call and await its result.
    ///
    /// Dropping the future does not cancel the call; the result is discarded.
    fn call<P, T>(&self, method: &str, params: P) -> impl Future<Output = Result<T>> + Send
    where
        P: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let issued = self.call_method::<P, T>(
            method,
            params,
            CallOptions::default(),
            Some(Box::new(move |result: Result<T>| {
                let _ = tx.send(result);
            })),
        );
        async move {
            issued?;
            rx.await.map_err(|_| EngineError::Closed)?
        }
    }

    /// Subscribe and receive events through a channel.
    ///
    /// Dropping the receiver tears the subscription down on the next push.
    fn subscribe_stream<P, T>(
        &self,
        method: &str,
        params: P,
        options: SubscriptionOptions,
    ) -> Result<(RequestId, mpsc::UnboundedReceiver<SubscriptionEvent<T>>)>
    where
        P: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        let (handler, rx) = ChannelSubscription::new();
        let id = self.subscribe_with_handler(method, params, options, Arc::new(handler))?;
        Ok((id, rx))
    }
}

/// Frame queued for the connection driver
pub(crate) struct Outbound {
    pub id: RequestId,
    pub seq: u64,
}

pub(crate) struct Inner {
    registry: Mutex<Registry>,
    outbound: mpsc::UnboundedSender<Outbound>,
    queue: CallbackQueue,
    runtime: Handle,
    pub(crate) config: EngineConfig,
    state: watch::Sender<ConnectionState>,
    pub(crate) shutdown: CancellationToken,
}

/// What a response resolves against
enum Slot {
    Unknown,
    Call,
    PendingSubscription,
    ActiveSubscription,
}

enum Delivery {
    Update {
        id: RequestId,
        seq: u64,
        handler: Arc<dyn SubscriptionHandler>,
        live: Arc<AtomicBool>,
        data: Value,
    },
    Terminate(Entry, EngineError),
}

fn encode_params<P: Serialize>(params: &P) -> Result<Option<Value>> {
    match serde_json::to_value(params).map_err(|e| EngineError::Encoding(e.to_string()))? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

impl Inner {
    fn register(
        &self,
        method: &str,
        params: Option<Value>,
        kind: EntryKind,
    ) -> Result<(RequestId, u64)> {
        let mut registry = self.registry.lock();
        let id = registry.allocate()?;
        let frame = Request::new(id, method, params)
            .to_frame()
            .map_err(|e| EngineError::Encoding(e.to_string()))?;
        let seq = registry.insert(id, frame, kind);
        Ok((id, seq))
    }

    fn enqueue(&self, id: RequestId, seq: u64) {
        if self.outbound.send(Outbound { id, seq }).is_err() {
            debug!(id, "Connection driver stopped; request not queued");
        }
    }

    fn call_method<P, T>(
        self: &Arc<Self>,
        method: &str,
        params: P,
        options: CallOptions,
        completion: Option<Completion<T>>,
    ) -> Result<RequestId>
    where
        P: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        let params = encode_params(&params)?;
        let completion = completion.map(|completion| -> RawCompletion {
            Box::new(move |result: Result<Value>| {
                completion(result.and_then(|value| {
                    serde_json::from_value(value).map_err(EngineError::decode)
                }))
            })
        });
        let timeout = options
            .timeout
            .or_else(|| self.config.requests.default_timeout());

        let (id, seq) = self.register(
            method,
            params,
            EntryKind::Call(PendingCall {
                method: method.to_string(),
                options,
                completion,
            }),
        )?;
        debug!(id, method, "Call registered");

        self.enqueue(id, seq);
        if let Some(timeout) = timeout {
            self.arm_timeout(id, seq, timeout);
        }
        Ok(id)
    }

    fn subscribe_with_handler<P: Serialize>(
        &self,
        method: &str,
        params: P,
        options: SubscriptionOptions,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<RequestId> {
        let params = encode_params(&params)?;
        let resend_on_reconnect = options
            .resend_on_reconnect
            .unwrap_or(self.config.requests.resend_subscriptions);

        let (id, seq) = self.register(
            method,
            params,
            EntryKind::Subscription(ActiveSubscription {
                method: method.to_string(),
                unsubscribe_method: options.unsubscribe_method,
                resend_on_reconnect,
                state: SubscriptionState::Pending,
                handler,
                live: Arc::new(AtomicBool::new(true)),
            }),
        )?;
        debug!(id, method, "Subscription registered");

        self.enqueue(id, seq);
        Ok(id)
    }

    fn cancel_for_identifier(self: &Arc<Self>, id: RequestId) {
        let canceled = self.registry.lock().cancel(id);
        match canceled {
            Canceled::Owner(entry) => {
                debug!(id, method = entry.method(), "Canceled");
                if let EntryKind::Subscription(sub) = entry.kind {
                    self.release_subscription(sub);
                }
            }
            Canceled::QueuedCompletion => debug!(id, "Canceled with completion pending"),
            Canceled::Unknown => debug!(id, "Cancel for unknown identifier"),
        }
    }

    /// Tell the node to stop pushing for a subscription we dropped locally
    fn release_subscription(self: &Arc<Self>, sub: ActiveSubscription) {
        let SubscriptionState::Acknowledged(remote) = sub.state else {
            return;
        };
        if let Some(method) = sub.unsubscribe_method {
            self.send_unsubscribe(&method, remote);
        }
    }

    fn send_unsubscribe(self: &Arc<Self>, method: &str, remote: RemoteId) {
        let issued = self.call_method::<_, Value>(
            method,
            [remote.to_value()],
            CallOptions::default(),
            None,
        );
        if let Err(err) = issued {
            debug!(%method, remote_id = %remote, error = %err, "Unsubscribe not sent");
        }
    }

    fn arm_timeout(self: &Arc<Self>, id: RequestId, seq: u64, timeout: Duration) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_call(id, seq, timeout);
            }
        });
    }

    fn expire_call(self: &Arc<Self>, id: RequestId, seq: u64, timeout: Duration) {
        let expired = self.registry.lock().remove_if_seq(id, seq);
        if let Some(Entry {
            kind: EntryKind::Call(call),
            ..
        }) = expired
        {
            warn!(id, method = %call.method, ?timeout, "Call timed out");
            self.complete(id, seq, call, Err(EngineError::Timeout(timeout)));
        }
    }

    /// Queue the completion of a call the registry already removed
    fn complete(
        self: &Arc<Self>,
        id: RequestId,
        seq: u64,
        call: PendingCall,
        result: Result<Value>,
    ) {
        let Some(completion) = call.completion else {
            return;
        };
        let weak = Arc::downgrade(self);
        self.queue.push(move || {
            // Skipped if canceled after the outcome was queued
            let run = match weak.upgrade() {
                Some(inner) => {
                    let run = inner.registry.lock().finish_completion(id, seq);
                    run
                }
                None => true,
            };
            if run {
                completion(result);
            }
        });
    }

    /// Report a terminal failure for a subscription already removed
    fn fail_subscription(&self, entry: Entry, error: EngineError) {
        if let EntryKind::Subscription(sub) = entry.kind {
            let handler = sub.handler;
            self.queue.push(move || handler.handle_error(error, true));
        }
    }

    fn fail_entry(self: &Arc<Self>, id: RequestId, entry: Entry, error: EngineError) {
        match entry.kind {
            EntryKind::Call(call) => self.complete(id, entry.seq, call, Err(error)),
            EntryKind::Subscription(_) => self.fail_subscription(entry, error),
        }
    }

    /// False if the subscription was already gone, e.g. canceled meanwhile
    fn terminate_subscription(self: &Arc<Self>, id: RequestId, seq: u64) -> bool {
        let removed = self.registry.lock().remove_if_seq(id, seq);
        let Some(Entry {
            kind: EntryKind::Subscription(sub),
            ..
        }) = removed
        else {
            return false;
        };
        debug!(id, method = %sub.method, "Subscription terminated by handler");
        self.release_subscription(sub);
        true
    }

    /// Route one inbound frame
    pub(crate) fn dispatch(self: &Arc<Self>, text: &str) {
        match parse_frame(text) {
            Ok(Inbound::Response(frame)) => {
                self.on_response(frame.id, frame.outcome.map_err(EngineError::Remote))
            }
            Ok(Inbound::Notification(push)) => self.on_push(push),
            Err(ProtocolError::MissingOutcome(id)) => {
                warn!(id, "Response carries neither result nor error");
                self.on_response(
                    id,
                    Err(EngineError::Decode(
                        "response carries neither result nor error".into(),
                    )),
                );
            }
            Err(ProtocolError::NotASubscription(method)) => {
                debug!(%method, "Ignoring notification without subscription");
            }
            Err(err) => warn!(error = %err, "Dropping malformed frame"),
        }
    }

    fn on_response(self: &Arc<Self>, id: RequestId, outcome: Result<Value>) {
        let mut registry = self.registry.lock();
        let slot = match registry.get(id).map(|entry| &entry.kind) {
            None => Slot::Unknown,
            Some(EntryKind::Call(_)) => Slot::Call,
            Some(EntryKind::Subscription(sub)) if sub.state == SubscriptionState::Pending => {
                Slot::PendingSubscription
            }
            Some(EntryKind::Subscription(_)) => Slot::ActiveSubscription,
        };

        match slot {
            Slot::Unknown => {
                let orphan = registry.take_orphan(id);
                drop(registry);
                match orphan {
                    Some(method) => self.on_orphan_ack(id, &method, outcome),
                    None => debug!(id, "Response for unknown request"),
                }
            }
            Slot::ActiveSubscription => {
                drop(registry);
                debug!(id, "Duplicate subscribe response ignored");
            }
            Slot::Call => {
                let removed = registry.remove(id);
                drop(registry);
                if let Some(Entry {
                    seq,
                    kind: EntryKind::Call(call),
                    ..
                }) = removed
                {
                    debug!(id, method = %call.method, ok = outcome.is_ok(), "Call completed");
                    self.complete(id, seq, call, outcome);
                }
            }
            Slot::PendingSubscription => {
                let error = match outcome {
                    Ok(value) => match RemoteId::from_value(&value) {
                        Some(remote) => {
                            debug!(id, remote_id = %remote, "Subscription acknowledged");
                            registry.acknowledge(id, remote);
                            return;
                        }
                        None => EngineError::Decode(format!("invalid subscription id: {}", value)),
                    },
                    Err(err) => err,
                };
                let removed = registry.remove(id);
                drop(registry);
                if let Some(entry) = removed {
                    warn!(id, method = entry.method(), error = %error, "Subscribe rejected");
                    self.fail_subscription(entry, error);
                }
            }
        }
    }

    /// Ack for a subscribe canceled while in flight; release it on the node
    fn on_orphan_ack(self: &Arc<Self>, id: RequestId, method: &str, outcome: Result<Value>) {
        match outcome.ok().as_ref().and_then(RemoteId::from_value) {
            Some(remote) => {
                debug!(id, remote_id = %remote, "Late ack for canceled subscription");
                self.send_unsubscribe(method, remote);
            }
            None => debug!(id, "Canceled subscribe was not acknowledged"),
        }
    }

    fn on_push(self: &Arc<Self>, push: SubscriptionPush) {
        let delivery = {
            let mut registry = self.registry.lock();
            let Some(id) = registry.lookup_remote(&push.subscription) else {
                debug!(
                    remote_id = %push.subscription,
                    method = %push.method,
                    "Push for unknown subscription"
                );
                return;
            };
            match push.payload {
                Ok(data) => match registry.get(id).map(|entry| (entry.seq, &entry.kind)) {
                    Some((seq, EntryKind::Subscription(sub))) => Delivery::Update {
                        id,
                        seq,
                        handler: Arc::clone(&sub.handler),
                        live: Arc::clone(&sub.live),
                        data,
                    },
                    _ => return,
                },
                Err(err) => match registry.remove(id) {
                    Some(entry) => Delivery::Terminate(entry, EngineError::Remote(err)),
                    None => return,
                },
            }
        };

        match delivery {
            Delivery::Update {
                id,
                seq,
                handler,
                live,
                data,
            } => {
                let weak = Arc::downgrade(self);
                self.queue
                    .push(move || deliver_update(weak, id, seq, handler, live, data));
            }
            Delivery::Terminate(entry, error) => {
                warn!(method = entry.method(), error = %error, "Subscription failed remotely");
                self.fail_subscription(entry, error);
            }
        }
    }

    pub(crate) fn frame_for_write(&self, outbound: &Outbound) -> Option<String> {
        self.registry
            .lock()
            .take_for_write(outbound.id, outbound.seq)
    }

    pub(crate) fn take_resend_frames(&self) -> Vec<(RequestId, String)> {
        self.registry.lock().take_resend_frames()
    }

    pub(crate) fn on_connection_lost(self: &Arc<Self>, reason: &str) {
        let loss = self.registry.lock().on_connection_lost();

        for (id, entry) in loss.dropped {
            debug!(id, method = entry.method(), "Failing request after connection loss");
            self.fail_entry(id, entry, EngineError::Transport(reason.to_string()));
        }
        for (handler, live) in loss.interrupted {
            let error = EngineError::Transport(reason.to_string());
            self.queue.push(move || {
                if live.load(Ordering::Acquire) {
                    handler.handle_error(error, false);
                }
            });
        }
    }

    /// Refuse new work and fail everything still registered
    pub(crate) fn close(self: &Arc<Self>) {
        let drained = self.registry.lock().close();
        for (id, entry) in drained {
            self.fail_entry(id, entry, EngineError::Closed);
        }
        self.set_state(ConnectionState::Closed);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

fn deliver_update(
    inner: Weak<Inner>,
    id: RequestId,
    seq: u64,
    handler: Arc<dyn SubscriptionHandler>,
    live: Arc<AtomicBool>,
    data: Value,
) {
    if !live.load(Ordering::Acquire) {
        return;
    }
    match handler.handle_data(data) {
        Ok(()) => {}
        Err(HandlerError {
            error,
            terminate: false,
        }) => handler.handle_error(error, false),
        Err(HandlerError {
            error,
            terminate: true,
        }) => {
            let removed = match inner.upgrade() {
                Some(inner) => inner.terminate_subscription(id, seq),
                None => live.swap(false, Ordering::AcqRel),
            };
            // Whoever removed it first reports the teardown
            if removed {
                handler.handle_error(error, true);
            }
        }
    }
}

/// JSON-RPC engine over one reconnecting connection
///
/// Cheap to clone; the connection driver stops when the last clone is
/// dropped or [`RpcEngine::shutdown`] is called.
///
/// # Example
///
/// ```ignore
/// let engine = RpcEngine::connect(config)?;
/// let header: Header = engine.call("chain_getHeader", ()).await?;
///
/// let (id, mut heads) = engine.subscribe_stream::<_, Header>(
///     "chain_subscribeNewHeads",
///     (),
///     SubscriptionOptions::with_unsubscribe("chain_unsubscribeNewHeads"),
/// )?;
/// while let Some(event) = heads.recv().await {
///     println!("{:?}", event);
/// }
/// ```
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<Inner>,
    _shutdown: Arc<DropGuard>,
}

impl RpcEngine {
    /// Start an engine for the configured endpoint on the current runtime
    pub fn connect(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let endpoint = config
            .endpoint()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let connector = connector_for(&endpoint, &config.connection);
        Ok(Self::start(config, connector))
    }

    /// Start an engine on the current runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        let handle = Handle::current();
        let queue = CallbackQueue::new(&handle);
        Self::start_on(&handle, config, connector, queue)
    }

    /// Start an engine whose driver and timers run on `handle` and whose
    /// callbacks run on `queue`
    pub fn start_on(
        handle: &Handle,
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        queue: CallbackQueue,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry::new()),
            outbound: outbound_tx,
            queue,
            runtime: handle.clone(),
            config,
            state: state_tx,
            shutdown: shutdown.clone(),
        });

        handle.spawn(driver::run(Arc::clone(&inner), connector, outbound_rx));

        Self {
            inner,
            _shutdown: Arc::new(shutdown.drop_guard()),
        }
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the driver reports a live connection
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.connection_state();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(EngineError::Closed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::Closed);
            }
        }
    }

    /// Stop the driver; every outstanding operation fails with `Closed`.
    ///
    /// Frames already queued are written before the connection is closed.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait until the engine has closed
    pub async fn closed(&self) {
        let mut rx = self.connection_state();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.registry.lock().is_closed()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.registry.lock().pending_calls()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.lock().active_subscriptions()
    }

    /// Current state of a subscription; identifiers that no longer own a
    /// subscription report `Terminated`
    pub fn subscription_state(&self, id: RequestId) -> SubscriptionState {
        self.inner
            .registry
            .lock()
            .subscription_state(id)
            .unwrap_or(SubscriptionState::Terminated)
    }

    pub fn callback_queue(&self) -> &CallbackQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Feed a frame as if it had arrived on the connection
    pub fn handle_inbound(&self, frame: &str) {
        self.inner.dispatch(frame);
    }
}

impl JsonRpcEngine for RpcEngine {
    fn call_method<P, T>(
        &self,
        method: &str,
        params: P,
        options: CallOptions,
        completion: Option<Completion<T>>,
    ) -> Result<RequestId>
    where
        P: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        self.inner.call_method(method, params, options, completion)
    }

    fn subscribe_with_handler<P>(
        &self,
        method: &str,
        params: P,
        options: SubscriptionOptions,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<RequestId>
    where
        P: Serialize,
    {
        self.inner
            .subscribe_with_handler(method, params, options, handler)
    }

    fn cancel_for_identifier(&self, id: RequestId) {
        self.inner.cancel_for_identifier(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fast_config, FakeNode};
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_unit_params_encode_as_absent() {
        assert_eq!(encode_params(&()).unwrap(), None);
        assert_eq!(encode_params(&Value::Null).unwrap(), None);
        assert_eq!(encode_params(&["0x01"]).unwrap(), Some(json!(["0x01"])));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dropped_frames_are_logged() {
        let node = FakeNode::new();
        let engine = RpcEngine::start(fast_config(), node.connector());

        engine.handle_inbound("{not json");
        engine.handle_inbound(r#"{"jsonrpc":"2.0","id":99,"result":true}"#);
        engine.handle_inbound(
            r#"{"jsonrpc":"2.0","method":"chain_newHead","params":{"subscription":"Z9","result":1}}"#,
        );

        assert!(logs_contain("Dropping malformed frame"));
        assert!(logs_contain("Response for unknown request"));
        assert!(logs_contain("Push for unknown subscription"));
    }

    #[tokio::test]
    async fn test_subscription_state_of_unknown_id() {
        let node = FakeNode::new();
        let engine = RpcEngine::start(fast_config(), node.connector());
        assert_eq!(engine.subscription_state(12), SubscriptionState::Terminated);

        let id = engine
            .call_method::<_, Value>("system_chain", (), CallOptions::default(), None)
            .unwrap();
        // Calls are not subscriptions
        assert_eq!(engine.subscription_state(id), SubscriptionState::Terminated);
    }
}
