//! Promise types handed to application code.
//!
//! [`LocalPromise`] is a promise this side will resolve; it can be passed to a
//! peer, which imports it as a remote promise. [`RemotePromise`] is the result
//! of an eventual send: awaiting it yields the answer, and calling methods on
//! it pipelines those calls without waiting for the answer.

use crate::eventual::{error_reason, eventual_send, eventual_send_only};
use crate::link::{Resolution, RemoteRef};
use crate::value::{Reply, Value};
use captp_types::{CapTpError, CapTpResult, Slot};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

/// A cloneable promise resolved on this side of the connection.
#[derive(Clone)]
pub struct LocalPromise {
    id: u64,
    inner: Shared<Reply>,
}

impl LocalPromise {
    /// A promise that settles with the outcome of `fut`.
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self {
            id: NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed),
            inner: fut.boxed().shared(),
        }
    }

    pub fn resolved(value: Value) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    pub fn rejected(reason: Value) -> Self {
        Self::new(futures::future::ready(Err(reason)))
    }

    /// An unresolved promise and the resolver that settles it. Dropping the
    /// resolver rejects the promise.
    pub fn pending() -> (Self, PromiseResolver) {
        let (tx, rx) = oneshot::channel();
        let promise = Self::new(async move {
            rx.await
                .unwrap_or_else(|_| Err(Value::error("promise abandoned by its resolver")))
        });
        (promise, PromiseResolver { tx })
    }

    /// Stable identity, shared by all clones.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn same_promise(&self, other: &LocalPromise) -> bool {
        self.id == other.id
    }
}

impl Future for LocalPromise {
    type Output = Result<Value, Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(cx)
    }
}

impl fmt::Debug for LocalPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalPromise(#{})", self.id)
    }
}

/// Settles a [`LocalPromise`] created with [`LocalPromise::pending`].
pub struct PromiseResolver {
    tx: oneshot::Sender<Result<Value, Value>>,
}

impl PromiseResolver {
    pub fn resolve(self, value: Value) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn reject(self, reason: Value) {
        let _ = self.tx.send(Err(reason));
    }

    pub fn settle(self, outcome: Result<Value, Value>) {
        let _ = self.tx.send(outcome);
    }
}

/// The eventual result of a send.
#[derive(Clone)]
pub struct RemotePromise {
    inner: PromiseInner,
}

#[derive(Clone)]
enum PromiseInner {
    /// A question on a connection; keeps the question alive at the peer.
    Question {
        question: RemoteRef,
        resolution: Resolution,
    },
    /// Settled without a question of its own (local target, chained result,
    /// or an immediate failure).
    Detached(Shared<BoxFuture<'static, CapTpResult<Value>>>),
}

impl RemotePromise {
    pub(crate) fn from_question(question: RemoteRef, resolution: Resolution) -> Self {
        Self {
            inner: PromiseInner::Question {
                question,
                resolution,
            },
        }
    }

    pub(crate) fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = CapTpResult<Value>> + Send + 'static,
    {
        Self {
            inner: PromiseInner::Detached(fut.boxed().shared()),
        }
    }

    /// A promise that is already rejected with `err`.
    pub fn rejected(err: CapTpError) -> Self {
        Self::from_future(futures::future::ready(Err(err)))
    }

    /// The question slot this promise answers, if it was sent over a connection.
    pub fn question(&self) -> Option<Slot> {
        match &self.inner {
            PromiseInner::Question { question, .. } => Some(question.slot()),
            PromiseInner::Detached(_) => None,
        }
    }

    /// Pipeline a call onto the eventual result of this promise.
    ///
    /// For a pending question the call is sent to the peer immediately,
    /// targeting the question itself; the peer applies it once the answer is
    /// known, in the order such calls were issued.
    pub fn call(&self, method: &str, args: Vec<Value>) -> RemotePromise {
        match &self.inner {
            PromiseInner::Question { question, .. } => question.call(method, args),
            PromiseInner::Detached(_) => {
                let this = self.clone();
                let method = method.to_string();
                RemotePromise::from_future(async move {
                    let target = this.await?;
                    eventual_send(&target, &method, args).await
                })
            }
        }
    }

    /// Pipeline a call whose result nobody needs.
    pub fn call_only(&self, method: &str, args: Vec<Value>) -> CapTpResult<()> {
        match &self.inner {
            PromiseInner::Question { question, .. } => question.call_only(method, args),
            PromiseInner::Detached(_) => {
                let this = self.clone();
                let method = method.to_string();
                tokio::spawn(async move {
                    if let Ok(target) = this.await {
                        if let Err(e) = eventual_send_only(&target, &method, args) {
                            debug!(method = %method, error = %e, "CapTP: one-way send to resolved promise failed");
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// This promise as a passable value.
    ///
    /// A question is passed by reference, so a peer that receives its own
    /// answer back sees the original promise.
    pub fn to_value(&self) -> Value {
        match &self.inner {
            PromiseInner::Question { question, .. } => Value::Remote(question.clone()),
            PromiseInner::Detached(_) => {
                let this = self.clone();
                Value::Promise(LocalPromise::new(async move {
                    this.await.map_err(|e| error_reason(&e))
                }))
            }
        }
    }
}

impl Future for RemotePromise {
    type Output = CapTpResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PromiseInner::Question { resolution, .. } => Pin::new(resolution).poll(cx),
            PromiseInner::Detached(fut) => Pin::new(fut).poll(cx),
        }
    }
}

impl fmt::Debug for RemotePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            PromiseInner::Question { question, .. } => write!(f, "RemotePromise({question:?})"),
            PromiseInner::Detached(_) => write!(f, "RemotePromise(detached)"),
        }
    }
}
