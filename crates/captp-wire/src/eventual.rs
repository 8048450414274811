//! Eventual send: invoke a method on any value without blocking.
//!
//! Remote references route the call over their own connection; local objects
//! are invoked directly; promises chain the call onto their resolution.

use crate::promise::RemotePromise;
use crate::value::{invoke_guarded, Value};
use captp_types::{CapTpError, CapTpResult};
use futures::FutureExt;
use tracing::debug;

/// Eventually invoke `method(args)` on `target`.
pub fn eventual_send(target: &Value, method: &str, args: Vec<Value>) -> RemotePromise {
    match target {
        Value::Remote(r) => r.call(method, args),
        Value::Object(obj) => {
            let reply = invoke_guarded(obj, method, args);
            RemotePromise::from_future(reply.map(|outcome| outcome.map_err(rejection_error)))
        }
        Value::Promise(promise) => {
            let promise = promise.clone();
            let method = method.to_string();
            RemotePromise::from_future(async move {
                match promise.await {
                    Ok(resolved) => eventual_send(&resolved, &method, args).await,
                    Err(reason) => Err(rejection_error(reason)),
                }
            })
        }
        other => RemotePromise::rejected(non_object_error(method, other)),
    }
}

/// Eventually invoke `method(args)` on `target`, discarding the result.
pub fn eventual_send_only(target: &Value, method: &str, args: Vec<Value>) -> CapTpResult<()> {
    match target {
        Value::Remote(r) => r.call_only(method, args),
        Value::Object(_) | Value::Promise(_) => {
            let pending = eventual_send(target, method, args);
            let method = method.to_string();
            tokio::spawn(async move {
                if let Err(e) = pending.await {
                    debug!(method = %method, error = %e, "CapTP: one-way local send rejected");
                }
            });
            Ok(())
        }
        other => Err(non_object_error(method, other)),
    }
}

/// The error raised when a method is sent to plain data.
pub(crate) fn non_object_error(method: &str, target: &Value) -> CapTpError {
    CapTpError::ProtocolViolation(format!(
        "cannot deliver {method}() to non-object {}",
        target.type_name()
    ))
}

/// A rejection reason as seen by the caller.
pub(crate) fn rejection_error(reason: Value) -> CapTpError {
    CapTpError::RemoteRejection(reason.describe())
}

/// The rejection reason to forward for an error, keeping the original
/// message of a remote rejection intact.
pub(crate) fn error_reason(err: &CapTpError) -> Value {
    match err {
        CapTpError::RemoteRejection(message) => Value::error(message.clone()),
        other => Value::error(other.to_string()),
    }
}
