//! Interception pipeline for outgoing and incoming chat messages.
//!
//! Plugins register transforms into two ordered chains at load time. A
//! transform may rewrite a message, drop it by returning `None`, or inject
//! extra frames to a peer through the [`PipelineContext`]. Injected frames
//! go straight to the wire and never run through the outgoing chain.
//!
//! A transform that returns an error or panics is skipped: the chain
//! continues with the message it was given.
//!
//! Whoever sends injected frames reports the ones that did not reach their
//! recipient through [`Pipeline::report_undelivered`], so a plugin can undo
//! state that assumed the frame arrived.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use protocol::{ChatMessage, UserId};

/// Per-run state shared with every transform in a chain.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    local_user: UserId,
    injected: Vec<ChatMessage>,
}

impl PipelineContext {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            injected: Vec::new(),
        }
    }

    /// The logged-in user running the chain.
    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Queue a frame to be sent as-is after the chain completes.
    pub fn inject(&mut self, message: ChatMessage) {
        self.injected.push(message);
    }

    pub fn injected(&self) -> &[ChatMessage] {
        &self.injected
    }

    pub fn take_injected(&mut self) -> Vec<ChatMessage> {
        std::mem::take(&mut self.injected)
    }
}

/// A single message transform.
pub trait Transform: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Rewrite `message`, or return `Ok(None)` to stop the chain.
    fn apply(
        &self,
        message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> anyhow::Result<Option<ChatMessage>>;

    /// An injected `frame` did not reach its recipient.
    fn undelivered(&self, _frame: &ChatMessage) {}
}

/// Adapts a closure into a [`Transform`].
pub struct FnTransform<F> {
    name: String,
    func: F,
}

impl<F> FnTransform<F>
where
    F: Fn(ChatMessage, &mut PipelineContext) -> anyhow::Result<Option<ChatMessage>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(ChatMessage, &mut PipelineContext) -> anyhow::Result<Option<ChatMessage>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(
        &self,
        message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> anyhow::Result<Option<ChatMessage>> {
        (self.func)(message, ctx)
    }
}

/// Something that installs transforms into a pipeline.
pub trait Plugin {
    fn name(&self) -> &str;

    fn install(&self, pipeline: &Pipeline);
}

type Chain = RwLock<Vec<Arc<dyn Transform>>>;

/// Ordered outgoing and incoming transform chains.
///
/// Built once at startup and shared by reference with everything that
/// sends or receives messages.
#[derive(Default)]
pub struct Pipeline {
    outgoing: Chain,
    incoming: Chain,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_outgoing(&self, transform: Arc<dyn Transform>) {
        tracing::debug!(transform = transform.name(), "Registered outgoing transform");
        self.outgoing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transform);
    }

    pub fn register_incoming(&self, transform: Arc<dyn Transform>) {
        tracing::debug!(transform = transform.name(), "Registered incoming transform");
        self.incoming
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transform);
    }

    /// Install a plugin's transforms.
    pub fn load(&self, plugin: &dyn Plugin) {
        tracing::info!(plugin = plugin.name(), "Loading plugin");
        plugin.install(self);
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run a user-authored message through the outgoing chain.
    pub fn run_outgoing(
        &self,
        message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> Option<ChatMessage> {
        run_chain(&self.outgoing, "outgoing", message, ctx)
    }

    /// Run a relayed message through the incoming chain.
    pub fn run_incoming(
        &self,
        message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> Option<ChatMessage> {
        run_chain(&self.incoming, "incoming", message, ctx)
    }

    /// Notify every transform in both chains that an injected frame was lost.
    pub fn report_undelivered(&self, frame: &ChatMessage) {
        for transform in snapshot(&self.outgoing)
            .into_iter()
            .chain(snapshot(&self.incoming))
        {
            if catch_unwind(AssertUnwindSafe(|| transform.undelivered(frame))).is_err() {
                tracing::warn!(
                    transform = transform.name(),
                    "Transform panicked handling an undelivered frame"
                );
            }
        }
    }
}

// Snapshot so a transform may register more transforms without deadlocking.
fn snapshot(chain: &Chain) -> Vec<Arc<dyn Transform>> {
    chain.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn run_chain(
    chain: &Chain,
    direction: &str,
    message: ChatMessage,
    ctx: &mut PipelineContext,
) -> Option<ChatMessage> {
    let transforms = snapshot(chain);

    let mut current = message;
    for transform in transforms {
        let input = current.clone();
        let result = catch_unwind(AssertUnwindSafe(|| transform.apply(input, ctx)));
        match result {
            Ok(Ok(Some(next))) => current = next,
            Ok(Ok(None)) => {
                tracing::debug!(
                    transform = transform.name(),
                    direction,
                    "Message dropped by transform"
                );
                return None;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    transform = transform.name(),
                    direction,
                    error = %e,
                    "Transform failed, passing message through unchanged"
                );
            }
            Err(_) => {
                tracing::warn!(
                    transform = transform.name(),
                    direction,
                    "Transform panicked, passing message through unchanged"
                );
            }
        }
    }
    Some(current)
}
