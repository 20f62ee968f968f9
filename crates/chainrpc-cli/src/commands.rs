//! Subcommand implementations, generic over the engine and output sink

use anyhow::{anyhow, bail, Context, Result};
use chainrpc_engine::{JsonRpcEngine, SubscriptionEvent, SubscriptionOptions};
use serde_json::Value;
use std::io::Write;
use tracing::{info, warn};

/// Parse command-line params; absent params send an empty list
pub fn parse_params(params: Option<&str>) -> Result<Value> {
    let Some(raw) = params else {
        return Ok(Value::Null);
    };
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid params JSON: {}", raw))?;
    match value {
        Value::Array(_) | Value::Object(_) => Ok(value),
        other => bail!("Params must be a JSON array or object, got {}", other),
    }
}

pub async fn call<E, W>(engine: &E, method: &str, params: Value, out: &mut W) -> Result<()>
where
    E: JsonRpcEngine,
    W: Write,
{
    let result: Value = engine
        .call(method, params)
        .await
        .with_context(|| format!("{} failed", method))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
    Ok(())
}

/// Print pushes until `count` arrive, the subscription ends, or Ctrl-C.
///
/// Returns the number of pushes printed.
pub async fn subscribe<E, W>(
    engine: &E,
    method: &str,
    params: Value,
    unsubscribe: Option<String>,
    count: Option<usize>,
    out: &mut W,
) -> Result<usize>
where
    E: JsonRpcEngine,
    W: Write,
{
    let options = match unsubscribe {
        Some(unsubscribe) => SubscriptionOptions::with_unsubscribe(unsubscribe),
        None => SubscriptionOptions::default(),
    };
    let (id, mut events) = engine
        .subscribe_stream::<_, Value>(method, params, options)
        .with_context(|| format!("Failed to subscribe with {}", method))?;
    info!(id, method, "Subscribed");

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let mut received = 0;
    let outcome = loop {
        if count.is_some_and(|limit| received >= limit) {
            break Ok(());
        }
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupted");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(SubscriptionEvent::Update(value)) => {
                    received += 1;
                    writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
                }
                Some(SubscriptionEvent::Error { error, unsubscribed: false }) => {
                    warn!(%error, "Subscription interrupted");
                }
                Some(SubscriptionEvent::Error { error, unsubscribed: true }) => {
                    break Err(anyhow::Error::new(error).context(format!("{} ended", method)));
                }
                None => break Err(anyhow!("{} ended", method)),
            }
        }
    };

    engine.cancel_for_identifier(id);
    outcome.map(|()| received)
}
