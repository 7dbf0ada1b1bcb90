//! Ordered per-session fan-out to live viewers.
//!
//! The [`TransportHub`] keeps one channel per session. Each channel holds its
//! subscribers and a replay buffer for the turn currently being streamed.
//!
//! ```text
//! TurnController ──publish──► Channel(session) ──try_send──► Subscriber A (bounded mpsc)
//!                              │  in-flight buffer        └──► Subscriber B (bounded mpsc)
//!                              │  [TurnStarted, Chunk, Chunk]
//!                              └─► late subscribe: replay buffer, then live frames
//! ```
//!
//! Publishing never blocks: each subscriber has a bounded queue and a
//! subscriber whose queue is full is dropped and later observes
//! [`NegotiationError::Overflow`]. Subscribing and publishing take the same
//! per-channel lock, so a late subscriber sees the replay followed by exactly
//! the frames published after it, with no gap and no duplicate.

use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::model::{AgreementDetails, Message, Role, TerminationReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One unit of delivery to a session's subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    TurnStarted {
        participant_id: String,
        role: Role,
        turn: u32,
        streaming: bool,
    },
    Chunk {
        text: String,
    },
    TurnCompleted {
        message: Message,
    },
    AgreementReached {
        details: AgreementDetails,
    },
    SessionCompleted {
        reason: TerminationReason,
    },
    Error {
        detail: String,
    },
}

/// Which subscribers a frame is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every subscriber of the session.
    All,
    /// Subscribers bound to this role plus unscoped viewers.
    Role(Role),
}

impl Audience {
    fn admits(&self, subscriber_role: Option<Role>) -> bool {
        match (self, subscriber_role) {
            (Audience::All, _) => true,
            (Audience::Role(_), None) => true,
            (Audience::Role(target), Some(role)) => *target == role,
        }
    }
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the frame was queued for.
    pub delivered: usize,
    /// Subscribers disconnected by this publish because their buffer was full.
    pub overflowed: Vec<String>,
}

struct SubscriberSlot {
    id: String,
    role: Option<Role>,
    tx: mpsc::Sender<Frame>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<SubscriberSlot>,
    in_flight: Vec<(Audience, Frame)>,
    /// `Error` or `AgreementReached` frames explaining how the session ended.
    closing: Vec<Frame>,
    /// Final `SessionCompleted` frame once the session has ended.
    terminal: Option<Frame>,
    published: u64,
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    session_id: String,
    rx: mpsc::Receiver<Frame>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next frame.
    ///
    /// `Ok(None)` means the stream ended normally (session over or
    /// unsubscribed). Frames queued before an overflow are still delivered;
    /// after them the subscription yields [`NegotiationError::Overflow`].
    pub async fn recv(&mut self) -> NegotiationResult<Option<Frame>> {
        match self.rx.recv().await {
            Some(frame) => Ok(Some(frame)),
            None if self.overflowed.load(Ordering::SeqCst) => {
                Err(NegotiationError::Overflow(self.id.clone()))
            }
            None => Ok(None),
        }
    }

    /// Non-blocking variant of [`recv`](Subscription::recv); `Ok(None)` when
    /// nothing is queued right now or the stream ended.
    pub fn try_recv(&mut self) -> NegotiationResult<Option<Frame>> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if self.overflowed.load(Ordering::SeqCst) {
                    Err(NegotiationError::Overflow(self.id.clone()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Drain every frame until the stream ends or overflows.
    pub async fn collect(mut self) -> (Vec<Frame>, Option<NegotiationError>) {
        let mut frames = Vec::new();
        loop {
            match self.recv().await {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return (frames, None),
                Err(e) => return (frames, Some(e)),
            }
        }
    }
}

/// Per-session fan-out with bounded, non-blocking delivery.
pub struct TransportHub {
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelState>>>>,
    buffer: usize,
}

impl TransportHub {
    /// Hub whose subscribers may fall `buffer` frames behind.
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    /// Create the channel for a session. Idempotent.
    pub fn open_channel(&self, session_id: &str) {
        if let Ok(mut channels) = self.channels.write() {
            channels
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ChannelState::default())));
        }
    }

    pub fn has_channel(&self, session_id: &str) -> bool {
        self.channels
            .read()
            .map(|c| c.contains_key(session_id))
            .unwrap_or(false)
    }

    fn channel(&self, session_id: &str) -> NegotiationResult<Arc<Mutex<ChannelState>>> {
        let channels = self
            .channels
            .read()
            .map_err(|_| NegotiationError::Storage("transport map poisoned".into()))?;
        channels
            .get(session_id)
            .cloned()
            .ok_or_else(|| NegotiationError::NotFound(format!("channel {}", session_id)))
    }

    /// Attach an unscoped viewer.
    pub fn subscribe(&self, session_id: &str) -> NegotiationResult<Subscription> {
        self.subscribe_as(session_id, None)
    }

    /// Attach a viewer, optionally scoped to one role's frames.
    ///
    /// If a turn is mid-stream the subscriber first receives the buffered
    /// frames of that turn. On an ended session it receives the frames that
    /// explained the ending (`Error`, `AgreementReached`), then the final
    /// `SessionCompleted` frame, and then the stream closes.
    pub fn subscribe_as(
        &self,
        session_id: &str,
        role: Option<Role>,
    ) -> NegotiationResult<Subscription> {
        let channel = self.channel(session_id)?;
        let mut state = channel
            .lock()
            .map_err(|_| NegotiationError::Storage("transport channel poisoned".into()))?;

        let id = Uuid::new_v4().to_string();
        let overflowed = Arc::new(AtomicBool::new(false));

        if let Some(terminal) = state.terminal.clone() {
            let (tx, rx) = mpsc::channel(state.closing.len() + 1);
            for frame in state.closing.iter().cloned() {
                let _ = tx.try_send(frame);
            }
            let _ = tx.try_send(terminal);
            return Ok(Subscription {
                id,
                session_id: session_id.to_string(),
                rx,
                overflowed,
            });
        }

        let replay: Vec<Frame> = state
            .in_flight
            .iter()
            .filter(|(audience, _)| audience.admits(role))
            .map(|(_, frame)| frame.clone())
            .collect();
        let (tx, rx) = mpsc::channel(self.buffer + replay.len());
        for frame in replay {
            let _ = tx.try_send(frame);
        }
        state.subscribers.push(SubscriberSlot {
            id: id.clone(),
            role,
            tx,
            overflowed: overflowed.clone(),
        });
        log::debug!(
            "Subscriber {} attached to session {} ({} total)",
            id,
            session_id,
            state.subscribers.len()
        );

        Ok(Subscription {
            id,
            session_id: session_id.to_string(),
            rx,
            overflowed,
        })
    }

    /// Detach a subscriber. Unknown or already detached ids are a no-op.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.unsubscribe_id(&subscription.session_id, &subscription.id);
    }

    pub fn unsubscribe_id(&self, session_id: &str, subscriber_id: &str) {
        if let Ok(channel) = self.channel(session_id) {
            if let Ok(mut state) = channel.lock() {
                state.subscribers.retain(|s| s.id != subscriber_id);
            }
        }
    }

    /// Publish to every subscriber of the session.
    pub fn publish(&self, session_id: &str, frame: Frame) -> NegotiationResult<PublishReport> {
        self.publish_to(session_id, Audience::All, frame)
    }

    /// Publish to the subscribers admitted by `audience`, in call order.
    pub fn publish_to(
        &self,
        session_id: &str,
        audience: Audience,
        frame: Frame,
    ) -> NegotiationResult<PublishReport> {
        let channel = self.channel(session_id)?;
        let mut state = channel
            .lock()
            .map_err(|_| NegotiationError::Storage("transport channel poisoned".into()))?;

        if state.terminal.is_some() {
            return Err(NegotiationError::SessionClosed(session_id.to_string()));
        }

        match &frame {
            Frame::TurnStarted { .. } => {
                state.closing.clear();
                state.in_flight.clear();
                state.in_flight.push((audience, frame.clone()));
            }
            Frame::Chunk { .. } => state.in_flight.push((audience, frame.clone())),
            Frame::TurnCompleted { .. } => state.in_flight.clear(),
            Frame::Error { .. } | Frame::AgreementReached { .. } if audience == Audience::All => {
                state.closing.push(frame.clone())
            }
            _ => {}
        }

        let mut report = PublishReport::default();
        state.subscribers.retain(|slot| {
            if !audience.admits(slot.role) {
                return true;
            }
            match slot.tx.try_send(frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.overflowed.store(true, Ordering::SeqCst);
                    report.overflowed.push(slot.id.clone());
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        state.published += 1;

        for id in &report.overflowed {
            log::warn!(
                "Subscriber {} on session {} exceeded its buffer of {} frames and was disconnected",
                id,
                session_id,
                self.buffer
            );
        }

        if let Frame::SessionCompleted { .. } = frame {
            state.in_flight.clear();
            state.terminal = Some(frame);
            // Dropping the senders ends every stream after its queued frames.
            state.subscribers.clear();
        }

        Ok(report)
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channel(session_id)
            .ok()
            .and_then(|c| c.lock().ok().map(|s| s.subscribers.len()))
            .unwrap_or(0)
    }

    /// Frames published on the session so far.
    pub fn published_count(&self, session_id: &str) -> u64 {
        self.channel(session_id)
            .ok()
            .and_then(|c| c.lock().ok().map(|s| s.published))
            .unwrap_or(0)
    }

    /// Whether the session's channel has seen its final frame.
    pub fn is_closed(&self, session_id: &str) -> bool {
        self.channel(session_id)
            .ok()
            .and_then(|c| c.lock().ok().map(|s| s.terminal.is_some()))
            .unwrap_or(false)
    }
}

impl Default for TransportHub {
    fn default() -> Self {
        Self::new(crate::negotiation::config::DEFAULT_SUBSCRIBER_BUFFER)
    }
}
