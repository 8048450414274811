//! Handles onto a running connection.
//!
//! A [`ConnectionLink`] is the sending half of a connection's command queue.
//! Every imported reference ([`RemoteRef`]) holds one, so a presence can be
//! invoked without going through the session, and dropping the last clone of
//! a reference tells the connection that the import became unreachable.

use crate::connection::SessionStats;
use crate::promise::RemotePromise;
use crate::value::Value;
use captp_types::{CapTpError, CapTpResult, Slot, SlotKind};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Shared settlement of a question or imported promise.
pub(crate) type Resolution = Shared<BoxFuture<'static, CapTpResult<Value>>>;

/// The single-use sending side of a [`Resolution`].
pub(crate) type Settler = oneshot::Sender<CapTpResult<Value>>;

pub(crate) fn resolution_pair() -> (Settler, Resolution) {
    let (tx, rx) = oneshot::channel();
    let resolution = async move {
        rx.await
            .unwrap_or_else(|_| Err(CapTpError::ConnectionClosed("connection closed".into())))
    }
    .boxed()
    .shared();
    (tx, resolution)
}

/// A resolution that is already settled.
pub(crate) fn settled_resolution(result: CapTpResult<Value>) -> Resolution {
    futures::future::ready(result).boxed().shared()
}

/// A question allocated by a handle, on its way to the connection task.
pub(crate) struct QuestionTicket {
    pub(crate) slot: Slot,
    pub(crate) handle: Weak<ImportHandle>,
    pub(crate) resolution: Resolution,
    pub(crate) settler: Settler,
}

/// Requests from handles to the task that owns a connection.
pub(crate) enum Command {
    /// Send `method(args)` to `target`; `question` is `None` for deliver-only.
    Call {
        target: Slot,
        method: String,
        args: Vec<Value>,
        question: Option<QuestionTicket>,
    },
    Bootstrap {
        question: QuestionTicket,
    },
    /// The last handle for an import generation was dropped.
    Release {
        slot: Slot,
        generation: u64,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Close {
        reason: String,
    },
}

pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Command queue plus the bits of connection state handles need directly.
pub(crate) struct ConnectionLink {
    pub(crate) id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    /// Last question id issued. Held while the matching command is queued so
    /// question ids reach the connection in allocation order.
    next_question: Mutex<u64>,
    close_reason: RwLock<Option<String>>,
}

impl ConnectionLink {
    pub(crate) fn new() -> (Arc<Self>, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id: ConnectionId::next(),
            commands: tx,
            next_question: Mutex::new(0),
            close_reason: RwLock::new(None),
        });
        (link, rx)
    }

    pub(crate) fn submit(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub(crate) fn mark_closed(&self, reason: &str) {
        let mut slot = self.close_reason.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.close_reason
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn closed_error(&self) -> CapTpError {
        CapTpError::ConnectionClosed(
            self.close_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }

    fn make_question(self: &Arc<Self>, id: u64) -> (RemoteRef, QuestionTicket) {
        let slot = Slot::remote(SlotKind::Question, id);
        let (settler, resolution) = resolution_pair();
        let handle = Arc::new(ImportHandle {
            link: Arc::clone(self),
            slot,
            generation: 0,
            resolution: Some(resolution.clone()),
        });
        let ticket = QuestionTicket {
            slot,
            handle: Arc::downgrade(&handle),
            resolution,
            settler,
        };
        (RemoteRef { handle }, ticket)
    }

    fn promise_for(question: RemoteRef) -> RemotePromise {
        let resolution = question
            .handle
            .resolution
            .clone()
            .unwrap_or_else(|| settled_resolution(Err(CapTpError::ProtocolViolation(
                "question without resolution".into(),
            ))));
        RemotePromise::from_question(question, resolution)
    }

    /// Queue `method(args)` for `target`, returning the promise for its answer.
    pub(crate) fn call(self: &Arc<Self>, target: Slot, method: &str, args: Vec<Value>) -> RemotePromise {
        if self.close_reason().is_some() {
            return RemotePromise::rejected(self.closed_error());
        }
        let mut next = self.next_question.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        let (question, ticket) = self.make_question(*next);
        let queued = self.submit(Command::Call {
            target,
            method: method.to_string(),
            args,
            question: Some(ticket),
        });
        drop(next);
        if !queued {
            return RemotePromise::rejected(self.closed_error());
        }
        Self::promise_for(question)
    }

    /// Queue `method(args)` for `target` without asking for an answer.
    pub(crate) fn call_only(&self, target: Slot, method: &str, args: Vec<Value>) -> CapTpResult<()> {
        if self.close_reason().is_some() {
            return Err(self.closed_error());
        }
        let queued = self.submit(Command::Call {
            target,
            method: method.to_string(),
            args,
            question: None,
        });
        if queued {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    pub(crate) fn bootstrap(self: &Arc<Self>) -> RemotePromise {
        if self.close_reason().is_some() {
            return RemotePromise::rejected(self.closed_error());
        }
        let mut next = self.next_question.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        let (question, ticket) = self.make_question(*next);
        let queued = self.submit(Command::Bootstrap { question: ticket });
        drop(next);
        if !queued {
            return RemotePromise::rejected(self.closed_error());
        }
        Self::promise_for(question)
    }

    fn release(&self, slot: Slot, generation: u64) {
        // The task may already be gone; nothing left to release then.
        let _ = self.commands.send(Command::Release { slot, generation });
    }
}

/// One generation of an imported slot. Dropping it releases the import.
pub(crate) struct ImportHandle {
    pub(crate) link: Arc<ConnectionLink>,
    pub(crate) slot: Slot,
    pub(crate) generation: u64,
    pub(crate) resolution: Option<Resolution>,
}

impl Drop for ImportHandle {
    fn drop(&mut self) {
        self.link.release(self.slot, self.generation);
    }
}

/// A reference to an object or promise that lives on a peer.
///
/// Clones share one handle; the connection is told the reference became
/// unreachable when the last clone is dropped.
#[derive(Clone)]
pub struct RemoteRef {
    pub(crate) handle: Arc<ImportHandle>,
}

impl RemoteRef {
    /// The slot as seen from this side of the connection.
    pub fn slot(&self) -> Slot {
        self.handle.slot
    }

    pub fn connection(&self) -> ConnectionId {
        self.handle.link.id
    }

    /// True for a confirmed non-promise remote object.
    pub fn is_presence(&self) -> bool {
        self.handle.slot.kind == SlotKind::Object
    }

    /// Eventually invoke `method` on the referenced value.
    pub fn call(&self, method: &str, args: Vec<Value>) -> RemotePromise {
        self.handle.link.call(self.slot(), method, args)
    }

    pub fn call_only(&self, method: &str, args: Vec<Value>) -> CapTpResult<()> {
        self.handle.link.call_only(self.slot(), method, args)
    }

    /// For promise references, a promise for the value they resolve to.
    pub fn when(&self) -> Option<RemotePromise> {
        self.handle
            .resolution
            .clone()
            .map(|resolution| RemotePromise::from_question(self.clone(), resolution))
    }

    pub(crate) fn same_reference(&self, other: &RemoteRef) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteRef({} {})", self.connection(), self.slot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_ids_are_monotonic() {
        let (link, mut rx) = ConnectionLink::new();
        let first = link.call(Slot::remote(SlotKind::Object, 1), "a", vec![]);
        let second = link.call(Slot::remote(SlotKind::Object, 1), "b", vec![]);
        assert_eq!(first.question().unwrap().to_string(), "q-1");
        assert_eq!(second.question().unwrap().to_string(), "q-2");

        let mut seen = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let Command::Call {
                method, question, ..
            } = cmd
            {
                seen.push((method, question.map(|q| q.slot.id)));
            }
        }
        assert_eq!(
            seen,
            vec![("a".to_string(), Some(1)), ("b".to_string(), Some(2))]
        );
    }

    #[test]
    fn test_dropping_last_clone_releases() {
        let (link, mut rx) = ConnectionLink::new();
        let handle = Arc::new(ImportHandle {
            link: Arc::clone(&link),
            slot: Slot::remote(SlotKind::Object, 4),
            generation: 2,
            resolution: None,
        });
        let a = RemoteRef { handle };
        let b = a.clone();
        drop(a);
        assert!(rx.try_recv().is_err());
        drop(b);
        match rx.try_recv() {
            Ok(Command::Release { slot, generation }) => {
                assert_eq!(slot.to_string(), "o-4");
                assert_eq!(generation, 2);
            }
            _ => panic!("expected a release command"),
        }
    }

    #[tokio::test]
    async fn test_call_after_close_rejects() {
        let (link, _rx) = ConnectionLink::new();
        link.mark_closed("shutting down");
        let err = link
            .call(Slot::remote(SlotKind::Object, 1), "a", vec![])
            .await
            .unwrap_err();
        assert_eq!(err, CapTpError::ConnectionClosed("shutting down".into()));
        assert!(link.call_only(Slot::remote(SlotKind::Object, 1), "a", vec![]).is_err());
    }
}
