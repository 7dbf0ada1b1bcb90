//! The agent responder boundary.
//!
//! Natural-language generation is an external capability. The core only needs
//! something that, given an [`AgentContext`], produces a reply either all at
//! once ([`AgentResponder::respond`]) or as a stream of text chunks pushed into
//! a bounded [`ChunkSink`] ([`AgentResponder::respond_stream`]).
//!
//! Cancellation is signalled by closing the chunk channel: once the controller
//! drops its receiver, [`ChunkSink::send`] fails and a well-behaved producer
//! stops.
//!
//! [`ScriptedResponder`] replays canned replies and is what the demos and
//! tests drive negotiations with.

use crate::negotiation::model::Role;
use crate::negotiation::router::AgentContext;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Error type at the responder boundary.
pub type ResponderError = Box<dyn Error + Send + Sync>;

/// Producer half of the bounded chunk channel handed to streaming responders.
#[derive(Clone, Debug)]
pub struct ChunkSink {
    tx: mpsc::Sender<String>,
}

impl ChunkSink {
    pub(crate) fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Push one chunk, waiting if the channel is full.
    ///
    /// Fails once the consumer is gone (turn cancelled or timed out).
    pub async fn send(&self, chunk: impl Into<String>) -> Result<(), ResponderError> {
        self.tx
            .send(chunk.into())
            .await
            .map_err(|_| "chunk channel closed".into())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Produces a participant's reply given its view of the negotiation.
#[async_trait]
pub trait AgentResponder: Send + Sync {
    /// Produce the full reply at once.
    async fn respond(&self, ctx: &AgentContext) -> Result<String, ResponderError>;

    /// Whether [`respond_stream`](AgentResponder::respond_stream) yields
    /// incremental chunks. The controller uses the streaming path only when
    /// this returns `true`.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream the reply into `sink`. The concatenation of all chunks is the
    /// message appended to the history.
    ///
    /// The default forwards the atomic reply as a single chunk.
    async fn respond_stream(&self, ctx: &AgentContext, sink: ChunkSink) -> Result<(), ResponderError> {
        let reply = self.respond(ctx).await?;
        sink.send(reply).await
    }
}

/// One step of a [`ScriptedResponder`] script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    Fail(String),
    /// Never completes; exercises timeouts and cancellation.
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<ScriptStep>,
    calls: Vec<AgentContext>,
}

/// Deterministic responder that replays a script, regardless of role.
///
/// ```
/// use rentnego::ScriptedResponder;
///
/// let responder = ScriptedResponder::new(["I'd like £1200", "I can do £1400"])
///     .streaming()
///     .with_fallback("Let me think about it.");
/// assert_eq!(responder.remaining(), 2);
/// ```
#[derive(Debug)]
pub struct ScriptedResponder {
    state: Mutex<ScriptState>,
    fallback: Option<ScriptStep>,
    streaming: bool,
    chunk_delay: Option<Duration>,
}

impl ScriptedResponder {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_steps(replies.into_iter().map(|r| ScriptStep::Reply(r.into())))
    }

    pub fn from_steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                steps: steps.into_iter().collect(),
                calls: Vec::new(),
            }),
            fallback: None,
            streaming: false,
            chunk_delay: None,
        }
    }

    /// A responder that answers every call with `reply`.
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self::from_steps(Vec::new()).with_fallback(reply)
    }

    /// A responder whose every call fails.
    pub fn failing(error: impl Into<String>) -> Self {
        let mut responder = Self::from_steps(Vec::new());
        responder.fallback = Some(ScriptStep::Fail(error.into()));
        responder
    }

    /// A responder whose every call hangs until timed out or cancelled.
    pub fn hanging() -> Self {
        let mut responder = Self::from_steps(Vec::new());
        responder.fallback = Some(ScriptStep::Hang);
        responder
    }

    /// Reply used once the script is exhausted.
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(ScriptStep::Reply(reply.into()));
        self
    }

    /// Stream replies word by word instead of returning them whole.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Sleep between streamed chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Script steps not yet consumed.
    pub fn remaining(&self) -> usize {
        self.state.lock().map(|s| s.steps.len()).unwrap_or(0)
    }

    /// Every context the responder was called with, in call order.
    pub fn calls(&self) -> Vec<AgentContext> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Roles the responder was asked to speak for, in call order.
    pub fn roles(&self) -> Vec<Role> {
        self.calls().iter().map(|c| c.role).collect()
    }

    fn next_step(&self, ctx: &AgentContext) -> Result<ScriptStep, ResponderError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| "scripted responder poisoned")?;
        state.calls.push(ctx.clone());
        match state.steps.pop_front().or_else(|| self.fallback.clone()) {
            Some(step) => Ok(step),
            None => Err("script exhausted".into()),
        }
    }

    async fn resolve(&self, ctx: &AgentContext) -> Result<String, ResponderError> {
        match self.next_step(ctx)? {
            ScriptStep::Reply(text) => Ok(text),
            ScriptStep::Fail(err) => Err(err.into()),
            ScriptStep::Hang => {
                std::future::pending::<()>().await;
                Err("unreachable".into())
            }
        }
    }
}

#[async_trait]
impl AgentResponder for ScriptedResponder {
    async fn respond(&self, ctx: &AgentContext) -> Result<String, ResponderError> {
        self.resolve(ctx).await
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn respond_stream(&self, ctx: &AgentContext, sink: ChunkSink) -> Result<(), ResponderError> {
        let reply = self.resolve(ctx).await?;
        for chunk in split_chunks(&reply) {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            sink.send(chunk).await?;
        }
        Ok(())
    }
}

/// Split text into word-sized chunks whose concatenation is the input.
pub fn split_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_round_trips_text() {
        let text = "Deal,  £1300 works";
        let chunks = split_chunks(text);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.concat(), text);
    }
}
