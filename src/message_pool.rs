use rustc_hash::FxHashMap;
use tracing::trace;
use crate::message::Message;
use crate::seq_num::SeqNum;

/// The messages that are in flight, keyed by the acknowledgment number that confirms them.
///
/// Acknowledgments are cumulative: acknowledging N confirms every message with an expected ack
///  up to and including N. Since sequence numbers wrap around, 'up to' is evaluated with
///  wrap-aware comparison, which is why this is a hash map rather than an ordered map.
#[derive(Default)]
pub struct MessagePool {
    messages: FxHashMap<SeqNum, Message>,
}

impl MessagePool {
    pub fn new() -> MessagePool {
        Default::default()
    }

    /// adds a message, replacing (and thereby cancelling) a previous message with the same key
    pub fn add(&mut self, message: Message) {
        if let Some(mut prev) = self.messages.insert(message.expected_ack(), message) {
            trace!("replacing in-flight message for ack {}", prev.expected_ack());
            prev.acknowledge();
        }
    }

    pub fn get(&self, ack_num: SeqNum) -> Option<&Message> {
        self.messages.get(&ack_num)
    }

    /// Marks all messages with an expected ack up to `ack_num` as acknowledged and removes them,
    ///  returning the number of removed messages
    pub fn ack_to_num(&mut self, ack_num: SeqNum) -> usize {
        let len_before = self.messages.len();
        self.messages.retain(|key, msg| {
            if key.is_before_or_at(ack_num) {
                msg.acknowledge();
                false
            }
            else {
                true
            }
        });
        len_before - self.messages.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// drops all messages, cancelling their timers
    pub fn clear(&mut self) {
        for msg in self.messages.values_mut() {
            msg.acknowledge();
        }
        self.messages.clear();
    }
}
