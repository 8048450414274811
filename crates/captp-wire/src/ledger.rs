//! Outstanding questions this side has asked.
//!
//! Answers the peer asked of us live in the reference tables under `q+N`;
//! the ledger only holds our own `q-N` questions, so the two numberings
//! never collide.

use crate::link::Settler;
use crate::value::Value;
use captp_types::{CapTpError, CapTpResult, Slot, SlotKind};
use std::collections::HashMap;

#[derive(Default)]
pub(crate) struct QuestionLedger {
    pending: HashMap<Slot, Settler>,
}

impl QuestionLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a question waiting for its answer.
    pub(crate) fn ask(&mut self, question: Slot, settler: Settler) {
        debug_assert!(question.kind == SlotKind::Question && question.is_remote());
        self.pending.insert(question, settler);
    }

    pub(crate) fn is_pending(&self, question: Slot) -> bool {
        self.pending.contains_key(&question)
    }

    /// Settle a question. Unknown and already-settled questions are protocol
    /// violations.
    pub(crate) fn resolve(&mut self, question: Slot, result: CapTpResult<Value>) -> CapTpResult<()> {
        let settler = self.pending.remove(&question).ok_or_else(|| {
            CapTpError::ProtocolViolation(format!("resolve for unknown or settled question {question}"))
        })?;
        // The asker may have stopped listening; that is not our problem.
        let _ = settler.send(result);
        Ok(())
    }

    /// Stop tracking a question without settling it.
    pub(crate) fn forget(&mut self, question: Slot) -> bool {
        self.pending.remove(&question).is_some()
    }

    /// Reject every outstanding question with `err`, returning how many there were.
    pub(crate) fn reject_all(&mut self, err: &CapTpError) -> usize {
        let count = self.pending.len();
        for (_, settler) in self.pending.drain() {
            let _ = settler.send(Err(err.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::resolution_pair;

    fn question(id: u64) -> Slot {
        Slot::remote(SlotKind::Question, id)
    }

    #[tokio::test]
    async fn test_resolve_settles_exactly_once() {
        let mut ledger = QuestionLedger::new();
        let (settler, resolution) = resolution_pair();
        ledger.ask(question(1), settler);
        assert!(ledger.is_pending(question(1)));

        ledger.resolve(question(1), Ok(Value::Int(9))).unwrap();
        let second = ledger.resolve(question(1), Ok(Value::Int(10)));
        assert!(matches!(second, Err(CapTpError::ProtocolViolation(_))));
        assert_eq!(resolution.await, Ok(Value::Int(9)));
    }

    #[test]
    fn test_unknown_question_is_violation() {
        let mut ledger = QuestionLedger::new();
        assert!(ledger.resolve(question(7), Ok(Value::Null)).is_err());
    }

    #[tokio::test]
    async fn test_reject_all() {
        let mut ledger = QuestionLedger::new();
        let mut resolutions = Vec::new();
        for id in 1..=3 {
            let (settler, resolution) = resolution_pair();
            ledger.ask(question(id), settler);
            resolutions.push(resolution);
        }
        let closed = CapTpError::ConnectionClosed("peer went away".into());
        assert_eq!(ledger.reject_all(&closed), 3);
        assert_eq!(ledger.len(), 0);
        for resolution in resolutions {
            assert_eq!(resolution.await, Err(closed.clone()));
        }
    }

    #[tokio::test]
    async fn test_forget_drops_settler() {
        let mut ledger = QuestionLedger::new();
        let (settler, resolution) = resolution_pair();
        ledger.ask(question(2), settler);
        assert!(ledger.forget(question(2)));
        assert!(!ledger.forget(question(2)));
        assert!(resolution.await.unwrap_err().is_connection_closed());
    }
}
