use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strand_core::types::{ExecutorIdentity, MessageEnvelope};

/// Accumulator for one super-step's outbound traffic, keyed by sender.
///
/// Messages produced while processing step N are appended here and become
/// visible only when the runner advances to step N+1. The map is ordered
/// (`External` first, then executor ids) so draining — and therefore replay
/// after a checkpoint restore — is deterministic.
#[derive(Debug, Default)]
pub struct StepContext {
    queues: BTreeMap<ExecutorIdentity, Vec<MessageEnvelope>>,
}

/// Portable form of one sender's queue, for checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessages {
    pub sender: ExecutorIdentity,
    pub messages: Vec<MessageEnvelope>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sender: ExecutorIdentity, envelope: MessageEnvelope) {
        self.queues.entry(sender).or_default().push(envelope);
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.is_empty())
    }

    pub fn message_count(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Consume the accumulated queues in deterministic sender order.
    pub fn drain(self) -> impl Iterator<Item = (ExecutorIdentity, Vec<MessageEnvelope>)> {
        self.queues.into_iter()
    }

    pub fn export(&self) -> Vec<QueuedMessages> {
        self.queues
            .iter()
            .map(|(sender, messages)| QueuedMessages {
                sender: sender.clone(),
                messages: messages.clone(),
            })
            .collect()
    }

    pub fn import(queues: Vec<QueuedMessages>) -> Self {
        let mut ctx = Self::new();
        for queue in queues {
            for envelope in queue.messages {
                ctx.push(queue.sender.clone(), envelope);
            }
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::types::PortableValue;

    fn envelope(from: ExecutorIdentity, s: &str) -> MessageEnvelope {
        MessageEnvelope::new(
            PortableValue::from_typed("text", &s.to_string()).unwrap(),
            from,
        )
    }

    #[test]
    fn test_empty_and_count() {
        let mut ctx = StepContext::new();
        assert!(ctx.is_empty());

        ctx.push(
            ExecutorIdentity::External,
            envelope(ExecutorIdentity::External, "in"),
        );
        assert!(!ctx.is_empty());
        assert_eq!(ctx.message_count(), 1);
    }

    #[test]
    fn test_drain_order_external_first_then_lexicographic() {
        let mut ctx = StepContext::new();
        let zed = ExecutorIdentity::executor("zed");
        let abe = ExecutorIdentity::executor("abe");

        ctx.push(zed.clone(), envelope(zed.clone(), "z"));
        ctx.push(abe.clone(), envelope(abe.clone(), "a"));
        ctx.push(
            ExecutorIdentity::External,
            envelope(ExecutorIdentity::External, "x"),
        );

        let senders: Vec<ExecutorIdentity> = ctx.drain().map(|(s, _)| s).collect();
        assert_eq!(senders, vec![ExecutorIdentity::External, abe, zed]);
    }

    #[test]
    fn test_per_sender_order_preserved() {
        let mut ctx = StepContext::new();
        let sender = ExecutorIdentity::executor("a");
        ctx.push(sender.clone(), envelope(sender.clone(), "first"));
        ctx.push(sender.clone(), envelope(sender.clone(), "second"));

        let (_, messages) = ctx.drain().next().unwrap();
        let texts: Vec<String> = messages
            .iter()
            .map(|m| m.message.materialize().unwrap())
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut ctx = StepContext::new();
        let sender = ExecutorIdentity::executor("a");
        ctx.push(sender.clone(), envelope(sender.clone(), "one"));
        ctx.push(
            ExecutorIdentity::External,
            envelope(ExecutorIdentity::External, "two"),
        );

        let exported = ctx.export();
        let restored = StepContext::import(exported);
        assert_eq!(restored.message_count(), 2);

        let senders: Vec<ExecutorIdentity> = restored.drain().map(|(s, _)| s).collect();
        assert_eq!(senders[0], ExecutorIdentity::External);
    }
}
