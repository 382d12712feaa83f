//! Per-agent mailboxes with leasing and dead letters
//!
//! Each recipient owns an inbox with three parts: a queue of messages waiting
//! to be received, the in-flight set leased to the recipient, and the terminal
//! dead-letter list. Delivery is at-least-once. A received message must be
//! acked before its lease expires or it is handed out again.
//!
//! Expired leases are requeued lazily on the next `receive` for that agent.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use troupe_core::{
    Clock, EventKind, MailboxConfig, Message, MessageStatus, NackOutcome, Result, RuntimeEvent,
    TroupeError,
};
use troupe_metrics::{KernelMetrics, MetricEvent};
use uuid::Uuid;

use crate::events::EventBus;

/// Longest delay or lease the mailbox honors; larger values are clamped to it
pub const MAX_DELAY_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// `now` plus `delay_ms`, clamped to [`MAX_DELAY_MS`]
fn after(now: DateTime<Utc>, delay_ms: u64) -> DateTime<Utc> {
    let millis = i64::try_from(delay_ms.min(MAX_DELAY_MS)).unwrap_or(i64::MAX);
    Duration::try_milliseconds(millis)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parameters for [`Mailbox::send`]
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub payload: serde_json::Value,
    pub topic: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub run_id: Option<String>,
    /// Falls back to the configured default
    pub max_attempts: Option<u32>,
    /// Hide the message for this long after sending
    pub delay_ms: Option<u64>,
    /// Explicit visibility time; wins over `delay_ms`
    pub visible_at: Option<DateTime<Utc>>,
}

impl SendRequest {
    pub fn new(
        from_agent_id: impl Into<String>,
        to_agent_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            from_agent_id: from_agent_id.into(),
            to_agent_id: to_agent_id.into(),
            payload,
            topic: None,
            correlation_id: None,
            idempotency_key: None,
            run_id: None,
            max_attempts: None,
            delay_ms: None,
            visible_at: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = Some(visible_at);
        self
    }
}

/// A message plus its enqueue sequence, used to keep FIFO order on requeue
#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct Inbox {
    queue: VecDeque<Entry>,
    in_flight: Vec<Entry>,
    dead_letters: Vec<Message>,
    /// idempotency key -> message id, for live messages only
    idempotency: HashMap<String, String>,
}

impl Inbox {
    /// Insert keeping the queue ordered by original enqueue sequence
    fn enqueue(&mut self, entry: Entry) {
        let pos = self
            .queue
            .iter()
            .position(|e| e.seq > entry.seq)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
    }

    fn find_live(&self, message_id: &str) -> Option<&Message> {
        self.queue
            .iter()
            .chain(self.in_flight.iter())
            .map(|e| &e.message)
            .find(|m| m.message_id == message_id)
    }

    fn take_in_flight(&mut self, message_id: &str) -> Option<Entry> {
        let pos = self
            .in_flight
            .iter()
            .position(|e| e.message.message_id == message_id)?;
        Some(self.in_flight.remove(pos))
    }

    fn forget_key(&mut self, message: &Message) {
        if let Some(key) = &message.idempotency_key {
            if self.idempotency.get(key) == Some(&message.message_id) {
                self.idempotency.remove(key);
            }
        }
    }

    /// Move every in-flight message whose lease has passed back to the queue
    fn requeue_expired(&mut self, now: DateTime<Utc>) -> usize {
        let (expired, live): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|e| e.message.lease_until.map(|t| t <= now).unwrap_or(true));
        self.in_flight = live;

        let count = expired.len();
        for mut entry in expired {
            entry.message.status = MessageStatus::Queued;
            entry.message.lease_until = None;
            self.enqueue(entry);
        }
        count
    }
}

/// In-process messaging port shared by every registered worker
pub struct Mailbox {
    config: MailboxConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    metrics: Arc<KernelMetrics>,
    agents: RwLock<HashSet<String>>,
    inboxes: Mutex<HashMap<String, Inbox>>,
    next_seq: AtomicU64,
}

impl Mailbox {
    pub fn new(
        config: MailboxConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        metrics: Arc<KernelMetrics>,
    ) -> Self {
        Self {
            config,
            clock,
            events,
            metrics,
            agents: RwLock::new(HashSet::new()),
            inboxes: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Allow an agent to send and receive
    pub async fn register_agent(&self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        debug!("Mailbox registered agent {}", agent_id);
        self.agents.write().await.insert(agent_id);
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains(agent_id)
    }

    async fn ensure_known(&self, agent_id: &str) -> Result<()> {
        if self.is_registered(agent_id).await {
            Ok(())
        } else {
            Err(TroupeError::UnknownAgent(agent_id.to_string()))
        }
    }

    /// Enqueue a message for its recipient
    ///
    /// With an idempotency key, a live message for the same recipient and key
    /// is returned unchanged instead of enqueueing a duplicate.
    pub async fn send(&self, request: SendRequest) -> Result<Message> {
        self.ensure_known(&request.from_agent_id).await?;
        self.ensure_known(&request.to_agent_id).await?;

        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(TroupeError::Other(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let message = {
            let mut inboxes = self.inboxes.lock().await;
            let inbox = inboxes.entry(request.to_agent_id.clone()).or_default();

            if let Some(key) = &request.idempotency_key {
                if let Some(existing_id) = inbox.idempotency.get(key).cloned() {
                    if let Some(existing) = inbox.find_live(&existing_id) {
                        debug!(
                            "Idempotent send to {} with key {} reuses {}",
                            request.to_agent_id, key, existing_id
                        );
                        return Ok(existing.clone());
                    }
                    inbox.idempotency.remove(key);
                }
            }

            let visible_at = request
                .visible_at
                .unwrap_or_else(|| after(now, request.delay_ms.unwrap_or(0)));
            let message = Message {
                message_id: format!("msg-{}", Uuid::new_v4().simple()),
                from_agent_id: request.from_agent_id,
                to_agent_id: request.to_agent_id,
                topic: request.topic,
                payload: request.payload,
                correlation_id: request.correlation_id,
                idempotency_key: request.idempotency_key,
                run_id: request.run_id,
                status: MessageStatus::Queued,
                attempt: 0,
                max_attempts,
                created_at: now,
                visible_at,
                lease_until: None,
                last_error: None,
            };

            if let Some(key) = &message.idempotency_key {
                inbox
                    .idempotency
                    .insert(key.clone(), message.message_id.clone());
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            inbox.enqueue(Entry {
                seq,
                message: message.clone(),
            });
            message
        };

        debug!(
            "Message {} queued {} -> {}",
            message.message_id, message.from_agent_id, message.to_agent_id
        );
        self.metrics.record(MetricEvent::MessageSent).await;
        self.emit(EventKind::MessageSent, &message, &message.from_agent_id)
            .await;
        Ok(message)
    }

    /// Lease up to `limit` visible messages to the recipient
    pub async fn receive(
        &self,
        agent_id: &str,
        limit: Option<usize>,
        lease_ms: Option<u64>,
    ) -> Vec<Message> {
        let limit = limit.unwrap_or(self.config.default_receive_limit);
        let lease_ms = lease_ms.unwrap_or(self.config.default_lease_ms);
        let now = self.clock.now();

        let mut inboxes = self.inboxes.lock().await;
        let Some(inbox) = inboxes.get_mut(agent_id) else {
            return Vec::new();
        };

        let requeued = inbox.requeue_expired(now);
        if requeued > 0 {
            info!("Requeued {} expired leases for {}", requeued, agent_id);
        }

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(inbox.queue.len());
        for mut entry in inbox.queue.drain(..) {
            if taken.len() < limit && entry.message.visible_at <= now {
                entry.message.attempt += 1;
                entry.message.status = MessageStatus::InFlight;
                entry.message.lease_until = Some(after(now, lease_ms));
                taken.push(entry);
            } else {
                remaining.push_back(entry);
            }
        }
        inbox.queue = remaining;

        let messages: Vec<Message> = taken.iter().map(|e| e.message.clone()).collect();
        inbox.in_flight.extend(taken);
        messages
    }

    /// Acknowledge an in-flight message; false when it is not leased to the agent
    pub async fn ack(&self, agent_id: &str, message_id: &str) -> bool {
        let acked = {
            let mut inboxes = self.inboxes.lock().await;
            let Some(inbox) = inboxes.get_mut(agent_id) else {
                return false;
            };
            let Some(entry) = inbox.take_in_flight(message_id) else {
                return false;
            };
            inbox.forget_key(&entry.message);
            entry.message
        };

        debug!("Message {} acked by {}", message_id, agent_id);
        self.metrics.record(MetricEvent::MessageAcked).await;
        self.emit(EventKind::MessageAcked, &acked, agent_id).await;
        true
    }

    /// Reject an in-flight message
    ///
    /// Requeues it after `requeue_delay_ms`, or dead-letters it once its
    /// attempts are used up.
    pub async fn nack(
        &self,
        agent_id: &str,
        message_id: &str,
        error: Option<String>,
        requeue_delay_ms: Option<u64>,
    ) -> NackOutcome {
        let now = self.clock.now();
        let (message, outcome) = {
            let mut inboxes = self.inboxes.lock().await;
            let Some(inbox) = inboxes.get_mut(agent_id) else {
                return NackOutcome::not_found();
            };
            let Some(mut entry) = inbox.take_in_flight(message_id) else {
                return NackOutcome::not_found();
            };

            entry.message.lease_until = None;
            if error.is_some() {
                entry.message.last_error = error;
            }

            if entry.message.is_exhausted() {
                entry.message.status = MessageStatus::DeadLetter;
                inbox.forget_key(&entry.message);
                inbox.dead_letters.push(entry.message.clone());
                (entry.message, NackOutcome::dead_lettered())
            } else {
                entry.message.status = MessageStatus::Queued;
                entry.message.visible_at = after(now, requeue_delay_ms.unwrap_or(0));
                let message = entry.message.clone();
                inbox.enqueue(entry);
                (message, NackOutcome::requeued())
            }
        };

        if outcome.dead_lettered {
            warn!(
                "Message {} dead-lettered after {} attempts",
                message.message_id, message.attempt
            );
            self.metrics.record(MetricEvent::MessageDeadLettered).await;
            self.emit(EventKind::MessageDeadLettered, &message, agent_id)
                .await;
        } else {
            debug!("Message {} nacked by {}", message.message_id, agent_id);
            self.metrics.record(MetricEvent::MessageNacked).await;
            self.emit(EventKind::MessageNacked, &message, agent_id).await;
        }
        outcome
    }

    /// Oldest-first dead letters for an agent
    pub async fn list_dead_letters(&self, agent_id: &str, limit: Option<usize>) -> Vec<Message> {
        let limit = limit.unwrap_or(self.config.dead_letter_list_limit);
        self.inboxes
            .lock()
            .await
            .get(agent_id)
            .map(|inbox| inbox.dead_letters.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Messages waiting to be received, visible or not
    pub async fn pending_count(&self, agent_id: &str) -> usize {
        self.inboxes
            .lock()
            .await
            .get(agent_id)
            .map(|inbox| inbox.queue.len())
            .unwrap_or(0)
    }

    pub async fn in_flight_count(&self, agent_id: &str) -> usize {
        self.inboxes
            .lock()
            .await
            .get(agent_id)
            .map(|inbox| inbox.in_flight.len())
            .unwrap_or(0)
    }

    async fn emit(&self, kind: EventKind, message: &Message, agent_id: &str) {
        let mut event = RuntimeEvent::new(
            kind,
            json!({
                "messageId": message.message_id,
                "fromAgentId": message.from_agent_id,
                "toAgentId": message.to_agent_id,
                "topic": message.topic,
                "correlationId": message.correlation_id,
                "attempt": message.attempt,
                "maxAttempts": message.max_attempts,
                "lastError": message.last_error,
            }),
        )
        .with_agent_id(agent_id);
        if let Some(run_id) = &message.run_id {
            event = event.with_run_id(run_id.clone());
        }
        self.events.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use troupe_core::ManualClock;

    struct Fixture {
        mailbox: Mailbox,
        clock: Arc<ManualClock>,
        events: Arc<EventBus>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let events = Arc::new(EventBus::new());
        let mailbox = Mailbox::new(
            MailboxConfig::default(),
            clock.clone(),
            events.clone(),
            Arc::new(KernelMetrics::new()),
        );
        mailbox.register_agent("alice").await;
        mailbox.register_agent("bob").await;
        Fixture {
            mailbox,
            clock,
            events,
        }
    }

    fn hello() -> SendRequest {
        SendRequest::new("alice", "bob", json!({"text": "hello"}))
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let f = fixture().await;
        let err = f
            .mailbox
            .send(SendRequest::new("alice", "carol", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::UnknownAgent(id) if id == "carol"));

        let err = f
            .mailbox
            .send(SendRequest::new("mallory", "bob", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_send_defaults() {
        let f = fixture().await;
        let msg = f.mailbox.send(hello().with_topic("greeting")).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.attempt, 0);
        assert_eq!(msg.max_attempts, 3);
        assert_eq!(msg.visible_at, msg.created_at);
        assert_eq!(msg.topic.as_deref(), Some("greeting"));
        assert_eq!(f.mailbox.pending_count("bob").await, 1);
    }

    #[tokio::test]
    async fn test_idempotent_send_returns_live_message() {
        let f = fixture().await;
        let first = f
            .mailbox
            .send(hello().with_idempotency_key("k1"))
            .await
            .unwrap();
        let second = f
            .mailbox
            .send(hello().with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(f.mailbox.pending_count("bob").await, 1);

        // still live while in flight
        f.mailbox.receive("bob", None, None).await;
        let third = f
            .mailbox
            .send(hello().with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_eq!(third.message_id, first.message_id);
        assert_eq!(third.status, MessageStatus::InFlight);

        // after ack the key is free again
        assert!(f.mailbox.ack("bob", &first.message_id).await);
        let fourth = f
            .mailbox
            .send(hello().with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_ne!(fourth.message_id, first.message_id);
    }

    #[tokio::test]
    async fn test_idempotency_is_scoped_per_recipient() {
        let f = fixture().await;
        let to_bob = f
            .mailbox
            .send(hello().with_idempotency_key("k"))
            .await
            .unwrap();
        let to_alice = f
            .mailbox
            .send(SendRequest::new("bob", "alice", json!({})).with_idempotency_key("k"))
            .await
            .unwrap();
        assert_ne!(to_bob.message_id, to_alice.message_id);
    }

    #[tokio::test]
    async fn test_receive_skips_invisible_messages() {
        let f = fixture().await;
        let later = f
            .mailbox
            .send(hello().with_delay_ms(5_000))
            .await
            .unwrap();
        let now = f.mailbox.send(hello()).await.unwrap();

        let got = f.mailbox.receive("bob", None, None).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_id, now.message_id);
        assert_eq!(f.mailbox.pending_count("bob").await, 1);

        f.clock.advance_ms(5_000);
        let got = f.mailbox.receive("bob", None, None).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_id, later.message_id);
    }

    #[tokio::test]
    async fn test_receive_is_fifo_and_respects_limit() {
        let f = fixture().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                f.mailbox
                    .send(SendRequest::new("alice", "bob", json!({ "n": i })))
                    .await
                    .unwrap()
                    .message_id,
            );
        }

        let first = f.mailbox.receive("bob", Some(2), None).await;
        assert_eq!(
            first.iter().map(|m| m.message_id.clone()).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
        assert!(first.iter().all(|m| m.attempt == 1));
        assert!(first.iter().all(|m| m.status == MessageStatus::InFlight));
        assert_eq!(f.mailbox.in_flight_count("bob").await, 2);

        let rest = f.mailbox.receive("bob", Some(2), None).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message_id, ids[2]);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered_in_order() {
        let f = fixture().await;
        let a = f.mailbox.send(hello()).await.unwrap();
        f.mailbox.receive("bob", Some(1), Some(1_000)).await;
        let b = f.mailbox.send(hello()).await.unwrap();

        f.clock.advance_ms(1_000);
        let got = f.mailbox.receive("bob", None, None).await;
        assert_eq!(
            got.iter().map(|m| m.message_id.clone()).collect::<Vec<_>>(),
            vec![a.message_id.clone(), b.message_id]
        );
        assert_eq!(got[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_ack_twice_returns_false() {
        let f = fixture().await;
        let msg = f.mailbox.send(hello()).await.unwrap();
        f.mailbox.receive("bob", None, None).await;

        assert!(f.mailbox.ack("bob", &msg.message_id).await);
        assert!(!f.mailbox.ack("bob", &msg.message_id).await);
        assert!(!f.mailbox.ack("alice", "msg-unknown").await);
        assert_eq!(f.mailbox.in_flight_count("bob").await, 0);
    }

    #[tokio::test]
    async fn test_ack_of_queued_message_is_rejected() {
        let f = fixture().await;
        let msg = f.mailbox.send(hello()).await.unwrap();
        assert!(!f.mailbox.ack("bob", &msg.message_id).await);
        assert_eq!(f.mailbox.pending_count("bob").await, 1);
    }

    #[tokio::test]
    async fn test_nack_requeues_with_delay() {
        let f = fixture().await;
        let msg = f.mailbox.send(hello()).await.unwrap();
        f.mailbox.receive("bob", None, None).await;

        let outcome = f
            .mailbox
            .nack("bob", &msg.message_id, Some("busy".to_string()), Some(2_000))
            .await;
        assert_eq!(outcome, NackOutcome::requeued());
        assert!(f.mailbox.receive("bob", None, None).await.is_empty());

        f.clock.advance_ms(2_000);
        let got = f.mailbox.receive("bob", None, None).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].attempt, 2);
        assert_eq!(got[0].last_error.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn test_nack_at_max_attempts_dead_letters() {
        let f = fixture().await;
        let msg = f
            .mailbox
            .send(hello().with_max_attempts(1))
            .await
            .unwrap();
        f.mailbox.receive("bob", None, None).await;

        let outcome = f
            .mailbox
            .nack("bob", &msg.message_id, Some("bad payload".to_string()), None)
            .await;
        assert_eq!(outcome, NackOutcome::dead_lettered());

        let dead = f.mailbox.list_dead_letters("bob", None).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, msg.message_id);
        assert_eq!(dead[0].status, MessageStatus::DeadLetter);

        f.clock.advance_ms(60_000);
        assert!(f.mailbox.receive("bob", None, None).await.is_empty());
        assert_eq!(
            f.mailbox.nack("bob", &msg.message_id, None, None).await,
            NackOutcome::not_found()
        );
    }

    #[tokio::test]
    async fn test_dead_letter_listing_is_oldest_first_and_limited() {
        let f = fixture().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let msg = f
                .mailbox
                .send(hello().with_max_attempts(1))
                .await
                .unwrap();
            ids.push(msg.message_id);
        }
        for msg in f.mailbox.receive("bob", None, None).await {
            f.mailbox.nack("bob", &msg.message_id, None, None).await;
        }

        let dead = f.mailbox.list_dead_letters("bob", Some(2)).await;
        assert_eq!(
            dead.iter().map(|m| m.message_id.clone()).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
    }

    #[tokio::test]
    async fn test_events_emitted_for_lifecycle() {
        let f = fixture().await;
        let kinds = Arc::new(StdMutex::new(Vec::new()));
        let sink = kinds.clone();
        let _sub = f
            .events
            .subscribe(move |e| sink.lock().unwrap().push(e.kind))
            .await;

        let a = f.mailbox.send(hello()).await.unwrap();
        let b = f
            .mailbox
            .send(hello().with_max_attempts(1))
            .await
            .unwrap();
        f.mailbox.receive("bob", None, None).await;
        f.mailbox.ack("bob", &a.message_id).await;
        f.mailbox.nack("bob", &b.message_id, None, None).await;

        assert_eq!(
            *kinds.lock().unwrap(),
            vec![
                EventKind::MessageSent,
                EventKind::MessageSent,
                EventKind::MessageAcked,
                EventKind::MessageDeadLettered,
            ]
        );
    }

    #[tokio::test]
    async fn test_huge_delays_are_clamped() {
        let f = fixture().await;
        let now = f.clock.now();
        let cap = Duration::milliseconds(MAX_DELAY_MS as i64);

        let delayed = f
            .mailbox
            .send(hello().with_delay_ms(u64::MAX))
            .await
            .unwrap();
        assert_eq!(delayed.visible_at, now + cap);
        assert!(f.mailbox.receive("bob", None, None).await.is_empty());

        let plain = f.mailbox.send(hello()).await.unwrap();
        let leased = f.mailbox.receive("bob", None, Some(9_000_000_000_000_000)).await;
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].message_id, plain.message_id);
        assert_eq!(leased[0].lease_until, Some(now + cap));

        let outcome = f
            .mailbox
            .nack("bob", &plain.message_id, None, Some(u64::MAX))
            .await;
        assert!(outcome.requeued);
        f.clock.advance_ms(60_000);
        assert!(f.mailbox.receive("bob", None, None).await.is_empty());
        assert_eq!(f.mailbox.pending_count("bob").await, 2);
    }

    #[tokio::test]
    async fn test_explicit_visible_at_wins_over_delay() {
        let f = fixture().await;
        let at = f.clock.now() + Duration::milliseconds(500);
        let msg = f
            .mailbox
            .send(
                hello()
                    .with_correlation_id("thread-1")
                    .with_delay_ms(10_000)
                    .with_visible_at(at),
            )
            .await
            .unwrap();
        assert_eq!(msg.visible_at, at);
        assert_eq!(msg.correlation_id.as_deref(), Some("thread-1"));

        assert!(f.mailbox.receive("bob", None, None).await.is_empty());
        f.clock.advance_ms(500);
        assert_eq!(f.mailbox.receive("bob", None, None).await.len(), 1);
    }
}
