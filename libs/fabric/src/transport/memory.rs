use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{Broker, Delivery, DeliveryTag, Properties, Session};

type SessionId = u64;

/// Record of a broker operation, in the order the broker observed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Connect,
    Declare { queue: String, durable: bool },
    Publish { queue: String, correlation_id: Option<String> },
    Ack { queue: String, tag: DeliveryTag },
    Close,
}

/// In-process broker
///
/// Queues live in shared memory; every `connect` returns a session with its
/// own delivery stream. Semantics follow an AMQP default exchange: publishing
/// to a missing queue silently drops the message, unacknowledged deliveries
/// return to their queue when the session closes, and reply queues vanish
/// with the session that opened them.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    sessions: HashMap<SessionId, SessionState>,
    next_session: SessionId,
    offline: bool,
    journal: Vec<JournalEntry>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    owner: Option<SessionId>,
    ready: VecDeque<Message>,
    consumers: Vec<SessionId>,
    cursor: usize,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    properties: Properties,
}

struct SessionState {
    sender: Option<mpsc::UnboundedSender<Delivery>>,
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: HashMap<DeliveryTag, (String, Message)>,
    auto_ack: HashSet<String>,
}

impl SessionState {
    fn has_capacity(&self, queue: &str) -> bool {
        self.sender.is_some()
            && (self.auto_ack.contains(queue)
                || self.prefetch == 0
                || self.unacked.len() < usize::from(self.prefetch))
    }

    fn deliver(&mut self, queue: &str, message: Message) {
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            tag,
            queue: queue.to_owned(),
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        if !self.auto_ack.contains(queue) {
            self.unacked.insert(tag, (queue.to_owned(), message));
        }
        if let Some(sender) = &self.sender {
            // A dropped receiver means the session is being torn down; the
            // unacked copy is requeued by `release`.
            let _ = sender.send(delivery);
        }
    }
}

impl BrokerState {
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues, sessions, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    sessions
                        .get(&queue.consumers[idx])
                        .is_some_and(|session| session.has_capacity(name))
                });
            let Some(idx) = chosen else {
                break;
            };
            let Some(session) = sessions.get_mut(&queue.consumers[idx]) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            queue.cursor = (idx + 1) % count;
            session.deliver(name, message);
        }
    }

    /// Drop a session: requeue its unacked deliveries and delete its reply queues
    fn release(&mut self, id: SessionId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };

        let mut unacked: Vec<_> = session.unacked.into_iter().collect();
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched = HashSet::new();
        for (_, (queue, message)) in unacked {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_front(message);
                touched.insert(queue);
            }
        }

        self.queues.retain(|_, queue| queue.owner != Some(id));
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| *consumer != id);
            queue.cursor = 0;
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut SessionState> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.sender.is_some() => Ok(session),
            _ => Err(Error::ConnectionClosed),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every `connect` fails; open sessions are unaffected
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Take the broker down: new connects fail and every open session's
    /// delivery stream ends
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.offline = true;
        for session in state.sessions.values_mut() {
            session.sender = None;
        }
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `name` that have not been handed to a consumer
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Number of connection attempts, including refused ones
    pub fn connect_count(&self) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Connect))
            .count()
    }

    pub fn publish_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Publish { queue: q, .. } if q == queue))
            .count()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Session>> {
        let mut state = self.state.lock();
        state.journal.push(JournalEntry::Connect);
        if state.offline {
            return Err(Error::ConnectionClosed);
        }

        state.next_session += 1;
        let id = state.next_session;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SessionState {
                sender: Some(sender),
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
                auto_ack: HashSet::new(),
            },
        );

        Ok(Box::new(MemorySession {
            id,
            broker: self.clone(),
            receiver,
            closed: false,
        }))
    }
}

/// Session on a [`MemoryBroker`]
///
/// Dropping an unclosed session releases it the same way `close` does.
pub struct MemorySession {
    id: SessionId,
    broker: MemoryBroker,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

impl MemorySession {
    fn with_state<R>(&self, op: impl FnOnce(&mut BrokerState, SessionId) -> Result<R>) -> Result<R> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let mut state = self.broker.state.lock();
        state.session_mut(self.id)?;
        op(&mut *state, self.id)
    }
}

#[async_trait::async_trait]
impl Session for MemorySession {
    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<()> {
        self.with_state(|state, _| {
            if let Some(existing) = state.queues.get(name) {
                if existing.durable != durable {
                    return Err(Error::Broker(format!(
                        "queue '{name}' already declared with durable={}",
                        existing.durable
                    )));
                }
            } else {
                state.queues.insert(
                    name.to_owned(),
                    QueueState {
                        durable,
                        ..QueueState::default()
                    },
                );
            }
            state.journal.push(JournalEntry::Declare {
                queue: name.to_owned(),
                durable,
            });
            Ok(())
        })
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.with_state(|state, id| {
            state.session_mut(id)?.prefetch = count;
            let queues: Vec<String> = state.queues.keys().cloned().collect();
            for queue in queues {
                state.dispatch(&queue);
            }
            Ok(())
        })
    }

    async fn publish(&mut self, queue: &str, body: &[u8], properties: &Properties) -> Result<()> {
        self.with_state(|state, _| {
            state.journal.push(JournalEntry::Publish {
                queue: queue.to_owned(),
                correlation_id: properties.correlation_id.clone(),
            });
            match state.queues.get_mut(queue) {
                Some(target) => {
                    target.ready.push_back(Message {
                        body: body.to_vec(),
                        properties: properties.clone(),
                    });
                    state.dispatch(queue);
                }
                None => trace!(queue, "no such queue; message dropped"),
            }
            Ok(())
        })
    }

    async fn consume(&mut self, queue: &str) -> Result<()> {
        self.with_state(|state, id| {
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::Broker(format!("no queue '{queue}'")))?;
            if !target.consumers.contains(&id) {
                target.consumers.push(id);
            }
            state.dispatch(queue);
            Ok(())
        })
    }

    async fn reply_queue(&mut self) -> Result<String> {
        self.with_state(|state, id| {
            let name = format!("amq.gen-{}", Uuid::new_v4().simple());
            state.queues.insert(
                name.clone(),
                QueueState {
                    owner: Some(id),
                    consumers: vec![id],
                    ..QueueState::default()
                },
            );
            state.session_mut(id)?.auto_ack.insert(name.clone());
            Ok(name)
        })
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.receiver.recv().await)
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.with_state(|state, id| {
            let (queue, _) = state
                .session_mut(id)?
                .unacked
                .remove(&tag)
                .ok_or_else(|| Error::Broker(format!("unknown delivery tag {tag}")))?;
            state.journal.push(JournalEntry::Ack {
                queue: queue.clone(),
                tag,
            });
            state.dispatch(&queue);
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.broker.state.lock();
        state.journal.push(JournalEntry::Close);
        state.release(self.id);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.broker.state.lock().release(self.id);
        }
    }
}
