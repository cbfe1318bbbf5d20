//! Bounded per-connection outbound queue. The room actor is the single
//! producer, the connection's writer task the single consumer. Overflow
//! drops the oldest non-critical frame; a queue full of critical frames
//! closes the connection instead.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::{CloseReason, ServerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Enqueued after evicting the oldest non-critical frame.
    DroppedOldest,
    /// The new frame was non-critical and nothing could be evicted.
    DroppedNew,
    /// Critical frame with no room: the queue closed with BackpressureFatal.
    Overflow,
}

#[derive(Debug)]
pub enum DrainItem {
    Frame(ServerFrame),
    Closed(Option<CloseReason>),
}

struct QueueState {
    frames: VecDeque<ServerFrame>,
    capacity: usize,
    closed: bool,
    close_reason: Option<CloseReason>,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct OutboundSender {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for OutboundSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSender").finish()
    }
}

pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

pub fn channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            close_reason: None,
        }),
        notify: Notify::new(),
    });
    (
        OutboundSender {
            shared: Arc::clone(&shared),
        },
        OutboundReceiver { shared },
    )
}

impl OutboundSender {
    pub fn push(&self, frame: ServerFrame) -> PushOutcome {
        let outcome = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return PushOutcome::DroppedNew;
            }
            if state.frames.len() < state.capacity {
                state.frames.push_back(frame);
                PushOutcome::Enqueued
            } else if let Some(pos) = state
                .frames
                .iter()
                .position(|queued| !queued.event.is_critical())
            {
                state.frames.remove(pos);
                state.frames.push_back(frame);
                PushOutcome::DroppedOldest
            } else if frame.event.is_critical() {
                // Every queued frame is critical and so is this one; the
                // connection cannot keep up without losing causal frames.
                state.frames.clear();
                state.closed = true;
                state.close_reason = Some(CloseReason::BackpressureFatal);
                PushOutcome::Overflow
            } else {
                return PushOutcome::DroppedNew;
            }
        };
        self.shared.notify.notify_waiters();
        outcome
    }

    /// Marks the queue closed; the writer drains what is already queued and
    /// then terminates the connection with the given reason.
    pub fn close(&self, reason: Option<CloseReason>) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_reason = reason;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl OutboundReceiver {
    /// Returns queued frames in order; once the queue is closed and empty,
    /// yields `Closed` exactly once per call thereafter.
    pub async fn next(&mut self) -> DrainItem {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return DrainItem::Frame(frame);
                }
                if state.closed {
                    return DrainItem::Closed(state.close_reason);
                }
            }
            notified.await;
        }
    }
}
