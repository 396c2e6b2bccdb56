/// Per-connection outbound buffering with backpressure
///
/// Reliable messages (edits, conflicts, comments) are never dropped, only
/// delayed. Droppable presence messages are coalesced per key so a slow
/// reader only ever sees the newest cursor of each participant, and the
/// oldest are shed once `capacity` of them are waiting.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::{ParticipantId, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    /// Superseded by a newer message with the same key
    Droppable { key: String },
}

impl Delivery {
    pub fn cursor(participant: ParticipantId) -> Self {
        Self::Droppable {
            key: format!("cursor:{participant}"),
        }
    }

    pub fn for_message(message: &ServerMessage) -> Self {
        match message {
            ServerMessage::CursorMoved { participant_id, .. } => Self::cursor(*participant_id),
            ServerMessage::Pong => Self::Droppable { key: "pong".into() },
            _ => Self::Reliable,
        }
    }
}

#[derive(Debug)]
struct Slot {
    message: ServerMessage,
    key: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: VecDeque<Slot>,
    droppable: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Outbound queue of one connection; clones share the queue.
///
/// Any number of producers, one consumer.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a message; returns false once the queue is closed
    pub fn push(&self, message: ServerMessage, delivery: Delivery) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            match delivery {
                Delivery::Reliable => state.slots.push_back(Slot { message, key: None }),
                Delivery::Droppable { key } => {
                    if let Some(slot) = state
                        .slots
                        .iter_mut()
                        .find(|s| s.key.as_deref() == Some(key.as_str()))
                    {
                        slot.message = message;
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        if state.droppable >= self.shared.capacity {
                            if let Some(idx) = state.slots.iter().position(|s| s.key.is_some()) {
                                state.slots.remove(idx);
                                state.droppable -= 1;
                                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        state.slots.push_back(Slot {
                            message,
                            key: Some(key),
                        });
                        state.droppable += 1;
                    }
                }
            }
        }
        self.shared.notify.notify_one();
        true
    }

    /// Queue with the delivery class the message type calls for
    pub fn send(&self, message: ServerMessage) -> bool {
        let delivery = Delivery::for_message(&message);
        self.push(message, delivery)
    }

    pub fn try_pop(&self) -> Option<ServerMessage> {
        let mut state = self.shared.state.lock();
        let slot = state.slots.pop_front()?;
        if slot.key.is_some() {
            state.droppable -= 1;
        }
        Some(slot.message)
    }

    /// Wait for the next message; `None` once closed and drained
    pub async fn recv(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(slot) = state.slots.pop_front() {
                    if slot.key.is_some() {
                        state.droppable -= 1;
                    }
                    return Some(slot.message);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one keeps a permit when nobody waits, so a push between
            // the check above and this await is not lost
            self.shared.notify.notified().await;
        }
    }

    /// Stop accepting messages; already queued ones can still be drained
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }

    /// Both handles feed the same connection
    pub fn same_queue(&self, other: &OutboundQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Presence messages shed or superseded so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CursorPosition, FieldKey, SessionId};

    fn cursor(participant: ParticipantId, caret: usize) -> ServerMessage {
        ServerMessage::CursorMoved {
            participant_id: participant,
            position: CursorPosition::new(FieldKey::new("findings", "text"), caret),
        }
    }

    fn reliable() -> ServerMessage {
        ServerMessage::SessionEnded {
            session_id: SessionId::new(),
        }
    }

    fn caret(message: &ServerMessage) -> usize {
        match message {
            ServerMessage::CursorMoved { position, .. } => position.caret,
            other => panic!("expected cursor, got {other:?}"),
        }
    }

    #[test]
    fn cursor_updates_coalesce_per_participant() {
        let queue = OutboundQueue::new(8);
        let a = ParticipantId::new();
        for caret in 0..5 {
            queue.send(cursor(a, caret));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(caret(&queue.try_pop().unwrap()), 4);
        assert_eq!(queue.dropped(), 4);
    }

    #[test]
    fn reliable_messages_survive_backpressure() {
        let queue = OutboundQueue::new(2);
        for _ in 0..100 {
            queue.send(reliable());
        }
        let participants: Vec<_> = (0..5).map(|_| ParticipantId::new()).collect();
        for (i, p) in participants.iter().enumerate() {
            queue.send(cursor(*p, i));
        }

        // all reliable kept, only the two newest cursors left
        assert_eq!(queue.len(), 102);
        assert_eq!(queue.dropped(), 3);
        let cursors: Vec<usize> = std::iter::from_fn(|| queue.try_pop())
            .filter(|m| matches!(m, ServerMessage::CursorMoved { .. }))
            .map(|m| caret(&m))
            .collect();
        assert_eq!(cursors, vec![3, 4]);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let queue = OutboundQueue::new(4);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut got = 0;
                while queue.recv().await.is_some() {
                    got += 1;
                }
                got
            })
        };
        tokio::task::yield_now().await;
        queue.send(reliable());
        queue.send(reliable());
        queue.close();
        assert!(!queue.send(reliable()));
        assert_eq!(consumer.await.unwrap(), 2);
    }
}
