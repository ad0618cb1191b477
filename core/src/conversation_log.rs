//! Append-only conversation log with monotonically increasing sequence
//! numbers.
//!
//! Only the orchestrator writes; observers read copies of the tail so a
//! poll never races an append. Items are never mutated or removed: the
//! compactor only ever appends a `compaction` marker and rebuilds the
//! separate model transcript.

use tether_protocol::ConversationItem;
use tether_protocol::ItemPayload;

#[derive(Debug, Default)]
pub struct ConversationLog {
    items: Vec<ConversationItem>,
    next_seq: u64,
    byte_size: usize,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from previously persisted items, continuing the
    /// sequence where it left off.
    pub fn from_items(items: Vec<ConversationItem>) -> Self {
        let next_seq = items.last().map(|item| item.seq + 1).unwrap_or(0);
        let byte_size = items.iter().map(|item| item.payload.content_len()).sum();
        Self {
            items,
            next_seq,
            byte_size,
        }
    }

    /// Append a payload, assigning the next sequence number.
    pub fn append(&mut self, payload: ItemPayload) -> ConversationItem {
        let item = ConversationItem {
            seq: self.next_seq,
            payload,
        };
        self.next_seq += 1;
        self.byte_size += item.payload.content_len();
        self.items.push(item.clone());
        item
    }

    /// The tail strictly after `since_seq`; `None` returns everything.
    pub fn items_since(&self, since_seq: Option<u64>) -> Vec<ConversationItem> {
        match since_seq {
            None => self.items.clone(),
            Some(seq) => {
                let start = self.items.partition_point(|item| item.seq <= seq);
                self.items[start..].to_vec()
            }
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.items.last().map(|item| item.seq)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Model-visible content bytes across the whole log (markers excluded).
    pub fn content_bytes(&self) -> usize {
        self.byte_size
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }
}
