//! Session: the public face of one CapTP connection.
//!
//! [`Session::start`] spawns the task that owns the connection state and a
//! reader task that feeds it inbound messages. The returned [`Session`] is a
//! cheap, cloneable handle for bootstrapping, sending and closing.

use crate::connection::{CloseReport, Connection, SessionStats, Work};
use crate::eventual::{eventual_send, eventual_send_only};
use crate::link::{Command, CommandReceiver, ConnectionId, ConnectionLink};
use crate::marshal::{JsonMarshal, Marshal};
use crate::promise::RemotePromise;
use crate::message::WireMessage;
use crate::observer::SessionObserver;
use crate::transport::{MessageSink, MessageSource, WireError};
use crate::value::Value;
use captp_types::{CapTpConfig, CapTpResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// How long a failed write waits for the peer's last messages.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// What the reader task hands to the connection task.
enum Inbound {
    Message(WireMessage),
    /// A frame that could not be decoded; the stream is still usable.
    Malformed(String),
    Closed(String),
}

/// Handle to a running connection.
#[derive(Clone)]
pub struct Session {
    link: Arc<ConnectionLink>,
    closed: watch::Receiver<Option<CloseReport>>,
}

impl Session {
    /// Start a connection over `sink`/`source` that offers `bootstrap` to the
    /// peer, using the default JSON marshaller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S, R>(config: CapTpConfig, bootstrap: Value, sink: S, source: R) -> Session
    where
        S: MessageSink + 'static,
        R: MessageSource + 'static,
    {
        Self::start_with_marshal(config, bootstrap, Arc::new(JsonMarshal), sink, source)
    }

    /// Like [`start`](Self::start) with a custom payload marshaller.
    pub fn start_with_marshal<S, R>(
        config: CapTpConfig,
        bootstrap: Value,
        marshal: Arc<dyn Marshal>,
        sink: S,
        source: R,
    ) -> Session
    where
        S: MessageSink + 'static,
        R: MessageSource + 'static,
    {
        Self::launch(config, bootstrap, marshal, None, sink, source)
    }

    /// Like [`start`](Self::start), reporting exports, imports and swallowed
    /// errors to `observer`.
    pub fn start_observed<S, R>(
        config: CapTpConfig,
        bootstrap: Value,
        observer: Arc<dyn SessionObserver>,
        sink: S,
        source: R,
    ) -> Session
    where
        S: MessageSink + 'static,
        R: MessageSource + 'static,
    {
        Self::launch(config, bootstrap, Arc::new(JsonMarshal), Some(observer), sink, source)
    }

    fn launch<S, R>(
        config: CapTpConfig,
        bootstrap: Value,
        marshal: Arc<dyn Marshal>,
        observer: Option<Arc<dyn SessionObserver>>,
        sink: S,
        source: R,
    ) -> Session
    where
        S: MessageSink + 'static,
        R: MessageSource + 'static,
    {
        let (mut conn, commands) = Connection::new(config, bootstrap, marshal);
        if let Some(observer) = observer {
            conn.set_observer(observer);
        }
        let link = conn.link();
        let (closed_tx, closed_rx) = watch::channel(None);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(conn.id(), source, inbound_tx));
        tokio::spawn(async move {
            let report = connection_loop(conn, commands, sink, inbound_rx).await;
            reader.abort();
            let _ = closed_tx.send(Some(report));
        });

        Session {
            link,
            closed: closed_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id
    }

    /// A promise for the peer's bootstrap object.
    pub fn bootstrap(&self) -> RemotePromise {
        self.link.bootstrap()
    }

    /// Eventually invoke `method(args)` on `target`.
    pub fn send(&self, target: &Value, method: &str, args: Vec<Value>) -> RemotePromise {
        eventual_send(target, method, args)
    }

    /// Invoke `method(args)` on `target` without waiting for a result.
    pub fn send_only(&self, target: &Value, method: &str, args: Vec<Value>) -> CapTpResult<()> {
        eventual_send_only(target, method, args)
    }

    /// Invoke `method(args)` on whatever `target` resolves to, without
    /// waiting for it to resolve.
    pub fn pipeline_call(&self, target: &RemotePromise, method: &str, args: Vec<Value>) -> RemotePromise {
        target.call(method, args)
    }

    /// True when `value` holds no reference imported from any peer.
    pub fn is_only_local(value: &Value) -> bool {
        value.is_only_local()
    }

    /// Abort the connection. Closing an already closed session does nothing.
    pub fn close(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.link.submit(Command::Close {
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.link.close_reason().is_some() || self.closed.borrow().is_some()
    }

    /// Wait for the connection to close.
    pub async fn closed(&self) -> CloseReport {
        let mut closed = self.closed.clone();
        loop {
            if let Some(report) = closed.borrow_and_update().clone() {
                return report;
            }
            if closed.changed().await.is_err() {
                return CloseReport {
                    reason: self
                        .link
                        .close_reason()
                        .unwrap_or_else(|| "connection task ended".to_string()),
                    rejected_questions: 0,
                    released_entries: 0,
                };
            }
        }
    }

    /// Current counters for this connection.
    pub async fn stats(&self) -> CapTpResult<SessionStats> {
        let (reply, rx) = oneshot::channel();
        if !self.link.submit(Command::Stats { reply }) {
            return Err(self.link.closed_error());
        }
        rx.await.map_err(|_| self.link.closed_error())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.link.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Forward decoded messages until the peer hangs up or the stream breaks.
async fn read_loop<R: MessageSource>(
    conn: ConnectionId,
    mut source: R,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        let event = match source.recv().await {
            Ok(Some(msg)) => Inbound::Message(msg),
            Ok(None) => Inbound::Closed("peer closed the connection".to_string()),
            Err(WireError::Json(e)) => Inbound::Malformed(e.to_string()),
            Err(e) => {
                error!(conn = %conn, error = %e, "CapTP: transport read failed");
                Inbound::Closed(e.to_string())
            }
        };
        let last = matches!(event, Inbound::Closed(_));
        if inbound.send(event).is_err() || last {
            break;
        }
    }
}

/// Own the connection state until it closes.
async fn connection_loop<S: MessageSink>(
    mut conn: Connection,
    mut commands: CommandReceiver,
    mut sink: S,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) -> CloseReport {
    let mut work: FuturesUnordered<Work> = FuturesUnordered::new();

    loop {
        for msg in conn.take_outbox() {
            if let Err(e) = sink.send(&msg).await {
                warn!(conn = %conn.id(), kind = msg.kind.name(), error = %e, "CapTP: transport write failed");
                drain_inbound(&mut conn, &mut inbound).await;
                conn.close(&format!("transport write failed: {e}"), false);
                break;
            }
        }
        work.extend(conn.take_work());
        if let Some(report) = conn.close_report() {
            info!(conn = %conn.id(), reason = %report.reason, "CapTP: session finished");
            debug!(conn = %conn.id(), stats = ?conn.stats(), "CapTP: final counters");
            return report;
        }

        tokio::select! {
            Some(command) = commands.recv() => conn.handle_command(command),
            event = inbound.recv() => match event {
                Some(Inbound::Message(msg)) => conn.dispatch(msg),
                Some(Inbound::Malformed(detail)) => conn.report_malformed(&detail),
                Some(Inbound::Closed(reason)) => {
                    conn.close(&reason, false);
                }
                None => {
                    conn.close("reader stopped", false);
                }
            },
            Some(done) = work.next(), if !work.is_empty() => conn.complete(done),
        }
    }
}

/// Apply what the peer sent before its end went away, so a queued ABORT
/// decides the close reason.
async fn drain_inbound(conn: &mut Connection, inbound: &mut mpsc::UnboundedReceiver<Inbound>) {
    while !conn.is_closed() {
        match tokio::time::timeout(DRAIN_GRACE, inbound.recv()).await {
            Ok(Some(Inbound::Message(msg))) => conn.dispatch(msg),
            Ok(Some(Inbound::Malformed(detail))) => conn.report_malformed(&detail),
            Ok(Some(Inbound::Closed(_)) | None) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::transport::memory_channel;
    use async_trait::async_trait;

    struct BrokenSink;

    #[async_trait]
    impl MessageSink for BrokenSink {
        async fn send(&mut self, _msg: &WireMessage) -> Result<(), WireError> {
            Err(WireError::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn test_failed_write_still_applies_queued_abort() {
        let ((mut peer_sink, _peer_source), (_sink, source)) = memory_channel();
        let session = Session::start(CapTpConfig::named("test"), Value::Null, BrokenSink, source);
        let root = session.bootstrap();
        peer_sink
            .send(&WireMessage::new(0, MessageKind::Abort { reason: "done".into() }))
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(report.reason, "done");
        assert!(matches!(root.await, Err(captp_types::CapTpError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_failed_write_without_peer_message_reports_transport() {
        let ((_peer_sink, _peer_source), (_sink, source)) = memory_channel();
        let session = Session::start(CapTpConfig::named("test"), Value::Null, BrokenSink, source);
        let _root = session.bootstrap();

        let report = tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(report.reason, "transport write failed: Connection closed");
    }
}
