//! Subscription handler contract and stock handlers

use crate::error::{EngineError, HandlerError};
use chainrpc_protocol::RemoteId;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use tokio::sync::mpsc;

/// Lifecycle of an active subscription
///
/// `Pending` until the node answers the subscribe request with its own id,
/// `Acknowledged` while pushes flow, `Terminated` once canceled or torn down
/// by a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Acknowledged(RemoteId),
    Terminated,
}

/// Receives pushes and failures for one subscription.
///
/// Both entry points run on the engine's callback queue.
pub trait SubscriptionHandler: Send + Sync {
    /// Handle one push payload.
    ///
    /// A returned error is reported back through `handle_error`; it tears
    /// the subscription down only if [`HandlerError::terminate`] is set.
    fn handle_data(&self, data: Value) -> Result<(), HandlerError>;

    /// Handle a failure. When `unsubscribed` is true the subscription has
    /// already been torn down and no more data will arrive.
    fn handle_error(&self, error: EngineError, unsubscribed: bool);
}

/// Handler that decodes each push into `T` and forwards it to closures
pub struct CallbackSubscription<T, U, F> {
    update: Mutex<U>,
    failure: Mutex<F>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, U, F> CallbackSubscription<T, U, F>
where
    T: DeserializeOwned,
    U: FnMut(T) + Send + 'static,
    F: FnMut(EngineError, bool) + Send + 'static,
{
    pub fn new(update: U, failure: F) -> Self {
        Self {
            update: Mutex::new(update),
            failure: Mutex::new(failure),
            _marker: PhantomData,
        }
    }
}

impl<T, U, F> SubscriptionHandler for CallbackSubscription<T, U, F>
where
    T: DeserializeOwned,
    U: FnMut(T) + Send + 'static,
    F: FnMut(EngineError, bool) + Send + 'static,
{
    fn handle_data(&self, data: Value) -> Result<(), HandlerError> {
        let item: T = serde_json::from_value(data).map_err(EngineError::decode)?;
        let mut update = self.update.lock();
        (*update)(item);
        Ok(())
    }

    fn handle_error(&self, error: EngineError, unsubscribed: bool) {
        let mut failure = self.failure.lock();
        (*failure)(error, unsubscribed);
    }
}

/// Event delivered by a channel-backed subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent<T> {
    Update(T),
    Error {
        error: EngineError,
        unsubscribed: bool,
    },
}

/// Forwards decoded pushes into an unbounded channel
pub(crate) struct ChannelSubscription<T> {
    tx: mpsc::UnboundedSender<SubscriptionEvent<T>>,
}

impl<T> ChannelSubscription<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SubscriptionEvent<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<T> SubscriptionHandler for ChannelSubscription<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn handle_data(&self, data: Value) -> Result<(), HandlerError> {
        let item: T = serde_json::from_value(data).map_err(EngineError::decode)?;
        // A dropped receiver means nobody is listening; ask for teardown
        self.tx
            .send(SubscriptionEvent::Update(item))
            .map_err(|_| HandlerError::terminal(EngineError::Unsubscribed))
    }

    fn handle_error(&self, error: EngineError, unsubscribed: bool) {
        let _ = self.tx.send(SubscriptionEvent::Error {
            error,
            unsubscribed,
        });
    }
}
