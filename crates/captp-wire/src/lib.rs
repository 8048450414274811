//! CapTP: asynchronous remote-object capability protocol.
//!
//! Two vats exchange references to objects and promises over an ordered,
//! reliable message channel. Calls on remote references are asynchronous,
//! may be pipelined onto promises that have not resolved yet, and references
//! a peer no longer holds are released through drop/retire notices.
//!
//! ## Architecture
//!
//! - **Session**: handle to one connection; bootstrap, send, close
//! - **Connection**: per-connection state machine driven by the session task
//! - **ReferenceTables / QuestionLedger**: slot bookkeeping for both directions
//! - **Marshal**: payload encoding, with [`JsonMarshal`] as the default
//! - **MessageSink / MessageSource**: transports (in-memory or framed TCP)
//! - **ConnectionRegistry**: tracks the sessions a vat has open
//! - **SessionObserver**: optional hooks on exports, imports and swallowed errors

pub mod eventual;
pub mod link;
pub mod marshal;
pub mod message;
pub mod observer;
pub mod promise;
pub mod registry;
pub mod session;
pub mod transport;
pub mod value;

mod connection;
mod dispatch;
mod gc;
mod ledger;
mod pipeline;
mod tables;

pub use connection::{CloseReport, SessionStats};
pub use eventual::{eventual_send, eventual_send_only};
pub use link::{ConnectionId, RemoteRef};
pub use marshal::{JsonMarshal, Marshal};
pub use message::{MessageKind, Outcome, WireMessage};
pub use observer::SessionObserver;
pub use promise::{LocalPromise, PromiseResolver, RemotePromise};
pub use registry::{ConnectionEntry, ConnectionRegistry, ConnectionState};
pub use session::Session;
pub use transport::{
    framed, memory_channel, FramedSink, FramedSource, MemorySink, MemorySource, MessageSink,
    MessageSource, WireError,
};
pub use value::{reply, Remotable, Reply, Value};

pub use captp_types::{CapData, CapTpConfig, CapTpError, CapTpResult, Slot, SlotKind};
