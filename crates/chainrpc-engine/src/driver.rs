//! Connection driver task.
//!
//! Owns the live connection: writes queued frames in order, hands inbound
//! frames to dispatch, and reconnects with exponential backoff until the
//! engine shuts down or the retry budget runs out.

use crate::engine::{ConnectionState, Inner, Outbound};
use crate::transport::{Connection, Connector};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

enum Served {
    Shutdown,
    Lost(String),
}

pub(crate) async fn run(
    inner: Arc<Inner>,
    connector: Arc<dyn Connector>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let target = connector.describe();
    let connect_timeout = inner.config.connection.connect_timeout();
    let mut failures: u32 = 0;

    loop {
        inner.set_state(ConnectionState::Connecting);
        debug!(%target, "Connecting");

        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = tokio::time::timeout(connect_timeout, connector.connect()) => result,
        };
        let attempt = match attempt {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("timed out after {:?}", connect_timeout)),
        };

        let connection = match attempt {
            Ok(connection) => connection,
            Err(reason) => {
                failures += 1;
                warn!(%target, attempt = failures, %reason, "Connection attempt failed");
                if !retry_after(&inner, failures).await {
                    break;
                }
                continue;
            }
        };

        failures = 0;
        info!(%target, "Connected");
        inner.set_state(ConnectionState::Connected);

        let reason = match serve(&inner, connection, &mut outbound).await {
            Served::Shutdown => break,
            Served::Lost(reason) => reason,
        };

        warn!(%target, %reason, "Connection lost");
        inner.on_connection_lost(&reason);
        inner.set_state(ConnectionState::Disconnected);

        if !inner.config.reconnect.enabled {
            break;
        }
    }

    inner.close();
    info!(%target, "Engine closed");
}

/// Sleep out the backoff for the next attempt; false when giving up
async fn retry_after(inner: &Inner, failures: u32) -> bool {
    let policy = &inner.config.reconnect;
    if !policy.allows_attempt(failures) {
        warn!(failures, "Giving up on reconnecting");
        return false;
    }

    inner.set_state(ConnectionState::Disconnected);
    let delay = policy.delay_for_attempt(failures - 1);
    debug!(?delay, failures, "Waiting before reconnect");

    tokio::select! {
        _ = inner.shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn serve(
    inner: &Arc<Inner>,
    connection: Connection,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Served {
    let Connection {
        mut sink,
        mut stream,
    } = connection;

    // Replayed frames go out before anything queued since the drop
    for (id, frame) in inner.take_resend_frames() {
        debug!(id, "Resending after reconnect");
        if let Err(err) = sink.send(frame).await {
            return Served::Lost(err.to_string());
        }
    }

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                // Frames queued before shutdown still go out, e.g. unsubscribes
                while let Ok(item) = outbound.try_recv() {
                    if let Some(frame) = inner.frame_for_write(&item) {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
                let _ = sink.close().await;
                return Served::Shutdown;
            }
            next = outbound.recv() => {
                let Some(item) = next else {
                    return Served::Shutdown;
                };
                // None when the owner was canceled before transmission
                if let Some(frame) = inner.frame_for_write(&item) {
                    trace!(id = item.id, %frame, "Writing frame");
                    if let Err(err) = sink.send(frame).await {
                        return Served::Lost(err.to_string());
                    }
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => {
                    trace!(%frame, "Received frame");
                    inner.dispatch(&frame);
                }
                Some(Err(err)) => return Served::Lost(err.to_string()),
                None => return Served::Lost("connection closed by peer".into()),
            },
        }
    }
}
