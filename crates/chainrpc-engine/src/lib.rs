//! JSON-RPC engine for node connectivity
//!
//! One connection multiplexes single-shot calls and long-lived
//! subscriptions. Every in-flight operation owns a 16-bit request
//! identifier until it completes, fails terminally, or is canceled.
//!
//! - `RpcEngine::start()` - spawn the connection driver for a connector
//! - `JsonRpcEngine::call_method()` - one completion, exactly once
//! - `JsonRpcEngine::subscribe()` - zero or more updates, failures carry an
//!   `unsubscribed` flag
//! - `JsonRpcEngine::cancel_for_identifier()` - idempotent teardown
//!
//! Callbacks run on a [`CallbackQueue`], never on the connection task and
//! never while the identifier table is locked.

mod chain;
mod driver;
mod engine;
mod error;
mod options;
mod queue;
mod registry;
mod subscription;
mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use chain::{ChainClient, EventStream, Header, Health, RuntimeVersion, StorageChangeSet};
pub use engine::{ConnectionState, JsonRpcEngine, RpcEngine};
pub use error::{Completion, EngineError, HandlerError, Result};
pub use options::{CallOptions, SubscriptionOptions};
pub use queue::CallbackQueue;
pub use subscription::{
    CallbackSubscription, SubscriptionEvent, SubscriptionHandler, SubscriptionState,
};
pub use transport::{
    connector_for, Connection, Connector, FrameSink, FrameStream, TcpConnector, TransportError,
    WsConnector,
};

#[cfg(unix)]
pub use transport::UnixConnector;

pub use chainrpc_protocol::{RemoteId, RequestId, RpcError};
