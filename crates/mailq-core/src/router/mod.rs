//! Priority message router
//!
//! The router resolves addressing through per-type [`RoutingRule`]s, keeps
//! pending messages ordered by effective priority, and dispatches each to the
//! delivery callback registered for its type. A failed dispatch lowers the
//! message's effective priority by `retry_demotion` and holds it back for the
//! rule's retry delay, so a message that keeps failing falls behind its
//! equal-priority peers instead of starving them.
//!
//! [`Router::with_queue`] backs the router with a [`PersistentQueue`]: sends
//! are enqueued durably and every routing step is a dequeue, dispatch, mark
//! cycle.

mod state;

pub use state::{MessageRecord, MessageStatus, RoutingStats};

use crate::config::{ConfigError, DeliveryStrategy, RouterConfig, RoutingRule};
use crate::delivery::{Deliver, deliver_catching};
use crate::queue::{PersistentQueue, QueueError};
use crate::schema::{Message, MessageType, Priority, QueueEntry};
use chrono::Utc;
use state::RouterState;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Recipient that addresses every known agent (broadcast rules) or the next
/// agent in rotation (round-robin rules)
pub const ANY_RECIPIENT: &str = "*";

/// Router error
#[derive(Debug, Error)]
pub enum RouterError {
    /// The backing queue failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Routing rules could not be resolved
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A broadcast or rotation had no agent to address
    #[error("no target agents for {0} message")]
    NoTargets(MessageType),

    /// A specific-recipient message named no usable recipient
    #[error("{0} message requires a specific recipient")]
    NoRecipient(MessageType),
}

/// Outcome of one routing step
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    pub message_id: String,
    pub status: MessageStatus,
}

struct RouterInner {
    config: RouterConfig,
    rules: BTreeMap<MessageType, RoutingRule>,
    queue: Option<Arc<PersistentQueue>>,
    state: Mutex<RouterState>,
    callbacks: RwLock<HashMap<MessageType, Arc<dyn Deliver>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Routes messages between agents; cheap to clone
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// In-memory router
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        Self::build(config, None)
    }

    /// Router backed by a persistent queue
    pub fn with_queue(
        config: RouterConfig,
        queue: Arc<PersistentQueue>,
    ) -> Result<Self, RouterError> {
        Self::build(config, Some(queue))
    }

    fn build(config: RouterConfig, queue: Option<Arc<PersistentQueue>>) -> Result<Self, RouterError> {
        let rules = config.resolved_rules()?;
        let router = Self {
            inner: Arc::new(RouterInner {
                config,
                rules,
                queue,
                state: Mutex::new(RouterState::default()),
                callbacks: RwLock::new(HashMap::new()),
                cancel: Mutex::new(None),
            }),
        };
        for agent in &router.inner.config.agents {
            router.register_agent(agent.as_str());
        }
        Ok(router)
    }

    /// Rule in effect for `message_type`
    pub fn rule(&self, message_type: MessageType) -> RoutingRule {
        self.inner
            .rules
            .get(&message_type)
            .copied()
            .unwrap_or_else(|| RoutingRule::builtin(message_type))
    }

    /// Add `name` to the known agents; duplicates are ignored
    pub fn register_agent(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.state();
        if !state.agents.contains(&name) {
            state.agents.push(name);
        }
    }

    /// Known agents in registration order
    pub fn agents(&self) -> Vec<String> {
        self.state().agents.clone()
    }

    /// Set the delivery callback for `message_type`, replacing any previous one
    ///
    /// Types without a callback are delivered by a no-op that always
    /// succeeds.
    pub fn register_delivery_callback(&self, message_type: MessageType, callback: impl Deliver + 'static) {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type, Arc::new(callback));
    }

    /// Send one message and return its id
    ///
    /// `priority: None` uses the rule's default. Recipient `"*"` resolves to
    /// the next agent in rotation under a round-robin rule and fans out to
    /// every agent but the sender under a broadcast rule; for a fan-out the
    /// returned id names the group and its status aggregates the members.
    ///
    /// # Errors
    ///
    /// `NoRecipient` when a specific-recipient rule gets `"*"` or an empty
    /// name, `NoTargets` when `"*"` resolves to nobody, `Queue` when the
    /// backing queue rejects the message.
    pub fn send_message(
        &self,
        sender: &str,
        recipient: &str,
        message_type: MessageType,
        content: &str,
        priority: Option<Priority>,
        expires_in: Option<Duration>,
    ) -> Result<String, RouterError> {
        let rule = self.rule(message_type);
        let priority = priority.unwrap_or(rule.priority);
        let recipient = recipient.trim();

        if recipient.is_empty() {
            return Err(RouterError::NoRecipient(message_type));
        }

        let recipient = if recipient == ANY_RECIPIENT {
            match rule.strategy {
                DeliveryStrategy::Specific => return Err(RouterError::NoRecipient(message_type)),
                DeliveryStrategy::RoundRobin => self
                    .state()
                    .next_agent()
                    .ok_or(RouterError::NoTargets(message_type))?,
                DeliveryStrategy::Broadcast => {
                    let template = Message::new(sender, ANY_RECIPIENT, message_type, content, priority);
                    let template = apply_ttl(template, expires_in);
                    let group_id = template.id.clone();
                    let targets = self.agents();
                    let ids = self.fan_out(&template, &targets, rule)?;
                    self.state().groups.insert(group_id.clone(), ids);
                    return Ok(group_id);
                }
            }
        } else {
            recipient.to_string()
        };

        let message = apply_ttl(
            Message::new(sender, recipient, message_type, content, priority),
            expires_in,
        );
        self.submit(message, rule)
    }

    /// Send one independent copy of a message to each target
    ///
    /// `targets: None` addresses every registered agent. The sender never
    /// receives its own broadcast.
    pub fn broadcast_message(
        &self,
        sender: &str,
        message_type: MessageType,
        content: &str,
        priority: Option<Priority>,
        targets: Option<&[String]>,
    ) -> Result<Vec<String>, RouterError> {
        let rule = self.rule(message_type);
        let priority = priority.unwrap_or(rule.priority);
        let targets = match targets {
            Some(targets) => targets.to_vec(),
            None => self.agents(),
        };
        let template = Message::new(sender, ANY_RECIPIENT, message_type, content, priority);
        self.fan_out(&template, &targets, rule)
    }

    /// Status of a message or fan-out group
    pub fn get_message_status(&self, message_id: &str) -> Option<MessageStatus> {
        if let Some(record) = self.get_message_record(message_id) {
            return Some(record.status);
        }

        let members = self.state().groups.get(message_id).cloned()?;
        let statuses: Vec<MessageStatus> = members
            .iter()
            .filter_map(|id| self.get_message_record(id).map(|r| r.status))
            .collect();
        Some(aggregate_status(&statuses))
    }

    /// Full history record of a message
    ///
    /// For a queue-backed router a pending record is refreshed from the
    /// queue, which may have expired or failed it in the meantime.
    pub fn get_message_record(&self, message_id: &str) -> Option<MessageRecord> {
        let record = self.state().history.get(message_id).cloned()?;
        if record.status.is_terminal() {
            return Some(record);
        }

        let (Some(queue), Some(queue_id)) = (&self.inner.queue, &record.queue_id) else {
            return Some(record);
        };
        match queue.get_entry(queue_id) {
            Ok(Some(entry)) => Some(self.sync_from_entry(&entry)),
            Ok(None) => Some(record),
            Err(e) => {
                warn!(message_id, error = %e, "could not refresh message status from queue");
                Some(record)
            }
        }
    }

    /// Pending messages for `recipient`, highest priority first, then oldest first
    pub fn get_pending_messages(&self, recipient: &str) -> Result<Vec<Message>, RouterError> {
        let mut messages: Vec<Message> = match &self.inner.queue {
            Some(queue) => queue
                .pending_entries()?
                .into_iter()
                .map(|e| e.message)
                .filter(|m| m.recipient == recipient)
                .collect(),
            None => self
                .state()
                .queued()
                .filter(|q| q.message.recipient == recipient)
                .map(|q| q.message.clone())
                .collect(),
        };
        messages.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(messages)
    }

    /// Counters and pending totals
    pub fn get_routing_stats(&self) -> Result<RoutingStats, RouterError> {
        let pending_by_target = match &self.inner.queue {
            Some(queue) => {
                let mut counts = BTreeMap::new();
                for entry in queue.pending_entries()? {
                    *counts.entry(entry.message.recipient).or_default() += 1;
                }
                counts
            }
            None => self.state().pending_by_target(),
        };

        let state = self.state();
        Ok(RoutingStats {
            sent: state.counters.sent,
            delivered: state.counters.delivered,
            failed: state.counters.failed,
            expired: state.counters.expired,
            retried: state.counters.retried,
            pending: pending_by_target.values().sum(),
            pending_by_target,
        })
    }

    /// Dispatch the highest-priority ready message, if any
    pub fn route_next(&self) -> Result<Option<RouteOutcome>, RouterError> {
        match &self.inner.queue {
            Some(queue) => self.route_next_durable(queue),
            None => Ok(self.route_next_in_memory()),
        }
    }

    /// Dispatch until no ready message is left; returns the number of steps
    pub fn route_pending(&self) -> Result<usize, RouterError> {
        let mut steps = 0;
        while self.route_next()?.is_some() {
            steps += 1;
        }
        Ok(steps)
    }

    /// Spawn the routing loop on the current tokio runtime
    pub fn start(&self) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.cancel_slot().replace(token.clone()) {
            previous.cancel();
        }
        let this = self.clone();
        tokio::spawn(async move { this.run(token).await })
    }

    /// Signal the loop started by [`start`](Self::start) to exit
    pub fn stop(&self) {
        if let Some(token) = self.cancel_slot().take() {
            token.cancel();
        }
    }

    /// Routing loop body; runs until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Starting router (interval: {:?})",
            self.inner.config.routing_interval()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let this = self.clone();
            match tokio::task::spawn_blocking(move || this.route_pending()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Routing failed: {}", e),
                Err(e) => warn!("Routing task aborted: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.routing_interval()) => {}
                _ = cancel.cancelled() => {}
            }
        }

        info!("Router stopped");
    }

    fn submit(&self, message: Message, rule: RoutingRule) -> Result<String, RouterError> {
        let message_id = message.id.clone();
        let queue_id = match &self.inner.queue {
            Some(queue) => Some(queue.enqueue_with_attempts(
                message.clone(),
                None,
                rule.retry.max_attempts,
            )?),
            None => None,
        };

        let mut state = self.state();
        state
            .history
            .insert(message_id.clone(), MessageRecord::pending(&message, queue_id));
        state.counters.sent += 1;
        debug!(
            message_id = %message.id,
            recipient = %message.recipient,
            message_type = %message.message_type,
            priority = %message.priority,
            "message routed"
        );
        if self.inner.queue.is_none() {
            let score = message.priority.base_score() + message.message_type.type_weight();
            state.push(message, score);
        }
        Ok(message_id)
    }

    fn fan_out(
        &self,
        template: &Message,
        targets: &[String],
        rule: RoutingRule,
    ) -> Result<Vec<String>, RouterError> {
        let mut recipients: Vec<&str> = Vec::new();
        for target in targets {
            let target = target.trim();
            if !target.is_empty() && target != template.sender && !recipients.contains(&target) {
                recipients.push(target);
            }
        }
        if recipients.is_empty() {
            return Err(RouterError::NoTargets(template.message_type));
        }

        recipients
            .into_iter()
            .map(|recipient| self.submit(template.readdressed(recipient), rule))
            .collect()
    }

    fn callback(&self, message_type: MessageType) -> Option<Arc<dyn Deliver>> {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .cloned()
    }

    fn dispatch(&self, message: &Message) -> Result<(), String> {
        match self.callback(message.message_type) {
            Some(callback) => deliver_catching(callback.as_ref(), message).map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }

    fn route_next_in_memory(&self) -> Option<RouteOutcome> {
        let now = Utc::now();
        let mut queued = self.state().pop_ready(now)?;
        let message_id = queued.message.id.clone();

        if queued.message.is_expired(now) {
            let mut state = self.state();
            state.counters.expired += 1;
            if let Some(record) = state.record(&message_id) {
                record.status = MessageStatus::Expired;
                record.updated_at = now;
            }
            debug!(message_id = %message_id, "message expired before delivery");
            return Some(RouteOutcome {
                message_id,
                status: MessageStatus::Expired,
            });
        }

        // Dispatch runs outside the state lock so callbacks may use the router.
        let result = self.dispatch(&queued.message);

        let now = Utc::now();
        let rule = self.rule(queued.message.message_type);
        queued.attempts += 1;
        let attempts = queued.attempts;

        let mut state = self.state();
        let status = match result {
            Ok(()) => {
                state.counters.delivered += 1;
                MessageStatus::Delivered
            }
            Err(ref e) if attempts < rule.retry.max_attempts => {
                state.counters.retried += 1;
                queued.score -= self.inner.config.retry_demotion as f64;
                queued.not_before = Some(now + to_chrono(rule.retry.delay()));
                debug!(message_id = %message_id, attempts, error = %e, "delivery failed, requeued");
                state.requeue(queued);
                MessageStatus::Pending
            }
            Err(ref e) => {
                state.counters.failed += 1;
                warn!(message_id = %message_id, attempts, error = %e, "message failed permanently");
                MessageStatus::Failed
            }
        };

        if let Some(record) = state.record(&message_id) {
            record.status = status;
            record.attempts = attempts;
            record.last_error = result.err();
            record.updated_at = now;
        }

        Some(RouteOutcome { message_id, status })
    }

    fn route_next_durable(&self, queue: &PersistentQueue) -> Result<Option<RouteOutcome>, RouterError> {
        let Some(entry) = queue.dequeue()? else {
            return Ok(None);
        };

        let result = self.dispatch(&entry.message);
        let status = match &result {
            Ok(()) => {
                queue.mark_delivered(&entry.queue_id)?;
                self.state().counters.delivered += 1;
                MessageStatus::Delivered
            }
            Err(e) => {
                if queue.mark_failed(&entry.queue_id, e, true)? {
                    self.state().counters.retried += 1;
                    MessageStatus::Pending
                } else {
                    self.state().counters.failed += 1;
                    MessageStatus::Failed
                }
            }
        };

        let mut state = self.state();
        let record = state
            .history
            .entry(entry.message.id.clone())
            .or_insert_with(|| MessageRecord::pending(&entry.message, Some(entry.queue_id.clone())));
        record.status = status;
        record.attempts = entry.attempts + 1;
        record.last_error = result.err();
        record.updated_at = Utc::now();

        Ok(Some(RouteOutcome {
            message_id: entry.message.id,
            status,
        }))
    }

    /// Copy a queue entry's state into the history record
    fn sync_from_entry(&self, entry: &QueueEntry) -> MessageRecord {
        let status = MessageStatus::from(entry.status);
        let mut state = self.state();
        let newly_expired = status == MessageStatus::Expired
            && state
                .history
                .get(&entry.message.id)
                .is_some_and(|r| r.status != MessageStatus::Expired);
        if newly_expired {
            state.counters.expired += 1;
        }

        let record = state
            .history
            .entry(entry.message.id.clone())
            .or_insert_with(|| MessageRecord::pending(&entry.message, Some(entry.queue_id.clone())));
        record.status = status;
        record.attempts = entry.attempts;
        record.last_error = entry.last_error.clone();
        record.updated_at = entry.updated_at;
        record.clone()
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("durable", &self.inner.queue.is_some())
            .field("agents", &self.agents())
            .finish_non_exhaustive()
    }
}

fn apply_ttl(message: Message, expires_in: Option<Duration>) -> Message {
    match expires_in {
        Some(ttl) => message.with_expires_in(ttl),
        None => message,
    }
}

fn aggregate_status(statuses: &[MessageStatus]) -> MessageStatus {
    if statuses.iter().any(|s| *s == MessageStatus::Pending) {
        MessageStatus::Pending
    } else if statuses.iter().all(|s| *s == MessageStatus::Delivered) {
        MessageStatus::Delivered
    } else if statuses.iter().all(|s| *s == MessageStatus::Expired) {
        MessageStatus::Expired
    } else {
        MessageStatus::Failed
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
