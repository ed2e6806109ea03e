use dashmap::DashMap;
use globset::{GlobBuilder, GlobMatcher};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// A message delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

struct Subscriber {
    matcher: GlobMatcher,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct HubInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

/// In-process topic router
///
/// Patterns follow `PSUBSCRIBE`: `*` matches any run of characters, `?`
/// exactly one, `[...]` a class (`[^...]` negated) and `\` escapes the next
/// character. Braces are literal.
#[derive(Clone, Default)]
pub struct PubSubHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for PubSubHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubHub")
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

impl PubSubHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when the pattern does not compile, e.g. an unclosed class
    pub fn subscribe(&self, pattern: impl Into<String>) -> Result<Subscription> {
        let pattern = pattern.into();
        let matcher = compile_pattern(&pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, Subscriber { matcher, sender: tx });
        debug!(pattern = %pattern, subscription_id = id, "Subscribed");
        Ok(Subscription {
            id,
            pattern,
            receiver: rx,
            hub: Arc::clone(&self.inner),
            active: true,
        })
    }

    /// Deliver to every matching subscriber; returns how many received it
    pub fn broadcast(&self, topic: &str, payload: &Value) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !entry.matcher.is_match(topic) {
                continue;
            }
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if entry.sender.send(message).is_ok() {
                sent += 1;
            } else {
                warn!(topic = %topic, subscription_id = *entry.key(), "Subscriber gone, removing");
                closed.push(*entry.key());
            }
        }

        for id in closed {
            self.inner.subscribers.remove(&id);
        }
        sent
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// Receiving end of a pattern subscription; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    hub: Arc<HubInner>,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message, `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.active {
            self.active = false;
            self.hub.subscribers.remove(&self.id);
            debug!(pattern = %self.pattern, subscription_id = self.id, "Unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Compile a topic pattern. `/` is an ordinary character in topics.
pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(&to_globset_syntax(pattern))
        .literal_separator(false)
        .backslash_escape(true)
        .build()?;
    Ok(glob.compile_matcher())
}

/// Map Redis-only syntax onto globset: `[^` negation and literal braces
fn to_globset_syntax(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '[' => {
                out.push('[');
                if chars.next_if_eq(&'^').is_some() {
                    out.push('!');
                }
            }
            '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
