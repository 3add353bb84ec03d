// service/queue_service.rs
//
// Waiting list and agent pool per business. Every mutation of a business's
// queue or pool happens under that business's mutex, which is what makes the
// pop-entry / pop-agent pair in `match_next` atomic.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::presencemodel::*;

#[derive(Debug, Default)]
struct BusinessQueue {
    entries: Vec<QueueEntry>,
    agents: HashMap<Uuid, AgentPresence>,
}

impl BusinessQueue {
    /// Retried entries first, then FIFO by enqueue time, then arrival order.
    fn ordered(&self) -> Vec<&QueueEntry> {
        let mut entries: Vec<&QueueEntry> = self.entries.iter().collect();
        entries.sort_by_key(|e| (e.retry_count == 0, e.enqueued_at, e.seq));
        entries
    }

    fn position_of(&self, escalation_id: Uuid) -> Option<usize> {
        self.ordered()
            .iter()
            .position(|e| e.escalation_id == escalation_id)
            .map(|idx| idx + 1)
    }

    /// Least recently assigned available agent; never-assigned agents first.
    fn next_agent(&self) -> Option<Uuid> {
        self.agents
            .values()
            .filter(|a| a.availability == Availability::Available)
            .min_by_key(|a| (a.last_assigned_at, a.available_since, a.agent_id))
            .map(|a| a.agent_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub position: usize,
    pub retry_count: u32,
    /// False when the escalation was already waiting.
    pub newly_queued: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub entry: QueueEntry,
    pub agent_id: Uuid,
}

#[derive(Debug, Default)]
pub struct QueueService {
    businesses: DashMap<Uuid, Arc<Mutex<BusinessQueue>>>,
    queued: DashMap<Uuid, Uuid>,
    agent_business: DashMap<Uuid, Uuid>,
    retries: DashMap<Uuid, u32>,
    seq: AtomicU64,
}

impl QueueService {
    pub fn new() -> Self {
        Self::default()
    }

    fn business(&self, business_id: Uuid) -> Arc<Mutex<BusinessQueue>> {
        self.businesses
            .entry(business_id)
            .or_insert_with(|| Arc::new(Mutex::new(BusinessQueue::default())))
            .clone()
    }

    fn existing_business(&self, business_id: Uuid) -> Option<Arc<Mutex<BusinessQueue>>> {
        self.businesses.get(&business_id).map(|b| b.clone())
    }

    /// Idempotent: a second call for an escalation that is already waiting
    /// only reports its current position.
    pub fn enqueue(&self, escalation_id: Uuid, business_id: Uuid) -> EnqueueOutcome {
        let queue = self.business(business_id);
        let mut guard = queue.lock();
        if let Some(outcome) = self.existing_entry(&guard, escalation_id, business_id) {
            return outcome;
        }
        let retry_count = self.retries.get(&escalation_id).map(|r| *r).unwrap_or(0);
        self.push_locked(&mut guard, escalation_id, business_id, retry_count)
    }

    /// Re-queue after an agent dropped mid-chat. The retry counter is bumped
    /// only when a new entry is actually created.
    pub fn requeue_after_disconnect(&self, escalation_id: Uuid, business_id: Uuid) -> EnqueueOutcome {
        let queue = self.business(business_id);
        let mut guard = queue.lock();
        if let Some(outcome) = self.existing_entry(&guard, escalation_id, business_id) {
            return outcome;
        }
        let retry_count = {
            let mut retries = self.retries.entry(escalation_id).or_insert(0);
            *retries += 1;
            *retries
        };
        self.push_locked(&mut guard, escalation_id, business_id, retry_count)
    }

    fn existing_entry(
        &self,
        queue: &BusinessQueue,
        escalation_id: Uuid,
        business_id: Uuid,
    ) -> Option<EnqueueOutcome> {
        if let Some(position) = queue.position_of(escalation_id) {
            tracing::debug!("escalation {} already queued at {}", escalation_id, position);
            let retry_count = queue
                .entries
                .iter()
                .find(|e| e.escalation_id == escalation_id)
                .map(|e| e.retry_count)
                .unwrap_or(0);
            return Some(EnqueueOutcome {
                position,
                retry_count,
                newly_queued: false,
            });
        }

        let other = self.queued.get(&escalation_id).map(|b| *b)?;
        if other == business_id {
            return None;
        }
        // An escalation belongs to one business; a mismatched request is a
        // duplicate from a confused client and is absorbed.
        tracing::warn!(
            "escalation {} is already waiting for business {}, ignoring enqueue for {}",
            escalation_id,
            other,
            business_id
        );
        Some(EnqueueOutcome {
            position: 0,
            retry_count: self.retry_count(escalation_id),
            newly_queued: false,
        })
    }

    fn push_locked(
        &self,
        queue: &mut BusinessQueue,
        escalation_id: Uuid,
        business_id: Uuid,
        retry_count: u32,
    ) -> EnqueueOutcome {
        queue.entries.push(QueueEntry {
            escalation_id,
            business_id,
            enqueued_at: Utc::now(),
            retry_count,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        });
        self.queued.insert(escalation_id, business_id);

        let position = queue.position_of(escalation_id).unwrap_or(queue.entries.len());
        tracing::info!(
            "escalation {} queued for business {} at position {} (retry {})",
            escalation_id,
            business_id,
            position,
            retry_count
        );

        EnqueueOutcome {
            position,
            retry_count,
            newly_queued: true,
        }
    }

    /// Puts back an entry popped by a match that could not start. Keeps its
    /// original enqueue time, retry count and arrival order.
    pub fn restore(&self, entry: QueueEntry) -> EnqueueOutcome {
        let queue = self.business(entry.business_id);
        let mut guard = queue.lock();
        if let Some(outcome) = self.existing_entry(&guard, entry.escalation_id, entry.business_id) {
            return outcome;
        }
        let (escalation_id, retry_count) = (entry.escalation_id, entry.retry_count);
        self.queued.insert(escalation_id, entry.business_id);
        guard.entries.push(entry);
        let position = guard.position_of(escalation_id).unwrap_or(guard.entries.len());
        tracing::info!("escalation {} restored to the queue at position {}", escalation_id, position);

        EnqueueOutcome {
            position,
            retry_count,
            newly_queued: true,
        }
    }

    /// Explicit leave. Safe when the escalation is not queued.
    pub fn dequeue(&self, escalation_id: Uuid) -> Option<QueueEntry> {
        let business_id = self.queued.get(&escalation_id).map(|b| *b)?;
        let queue = self.existing_business(business_id)?;
        let mut guard = queue.lock();

        let idx = guard
            .entries
            .iter()
            .position(|e| e.escalation_id == escalation_id)?;
        let entry = guard.entries.remove(idx);
        self.queued.remove(&escalation_id);
        tracing::info!("escalation {} left the queue", escalation_id);
        Some(entry)
    }

    pub fn position(&self, escalation_id: Uuid) -> Option<usize> {
        let business_id = self.queued.get(&escalation_id).map(|b| *b)?;
        let queue = self.existing_business(business_id)?;
        let guard = queue.lock();
        guard.position_of(escalation_id)
    }

    pub fn is_queued(&self, escalation_id: Uuid) -> bool {
        self.queued.contains_key(&escalation_id)
    }

    /// Pops the highest priority entry and the next available agent as one
    /// step. Leaves the queue untouched when either side is empty.
    pub fn match_next(&self, business_id: Uuid) -> Option<Assignment> {
        let queue = self.existing_business(business_id)?;
        let mut guard = queue.lock();

        let agent_id = guard.next_agent()?;
        let escalation_id = guard.ordered().first().map(|e| e.escalation_id)?;

        let idx = guard
            .entries
            .iter()
            .position(|e| e.escalation_id == escalation_id)?;
        let entry = guard.entries.remove(idx);
        self.queued.remove(&escalation_id);

        let now = Utc::now();
        if let Some(agent) = guard.agents.get_mut(&agent_id) {
            agent.availability = Availability::Busy;
            agent.active_escalation = Some(escalation_id);
            agent.last_assigned_at = Some(now);
            agent.available_since = None;
        }

        tracing::info!(
            "matched escalation {} with agent {} (retry {})",
            escalation_id,
            agent_id,
            entry.retry_count
        );

        Some(Assignment { entry, agent_id })
    }

    /// Drains as many matches as the pool allows.
    pub fn match_all(&self, business_id: Uuid) -> Vec<Assignment> {
        let mut assignments = Vec::new();
        while let Some(assignment) = self.match_next(business_id) {
            assignments.push(assignment);
        }
        assignments
    }

    /// Marks the agent eligible for matching. An agent that still holds an
    /// escalation stays busy and only has its connection refreshed.
    pub fn set_agent_available(
        &self,
        agent_id: Uuid,
        business_id: Uuid,
        connection_id: Option<Uuid>,
    ) -> AgentPresence {
        if let Some(previous) = self.agent_business.get(&agent_id).map(|b| *b) {
            if previous != business_id {
                if let Some(queue) = self.existing_business(previous) {
                    queue.lock().agents.remove(&agent_id);
                }
            }
        }

        let queue = self.business(business_id);
        let mut guard = queue.lock();
        let now = Utc::now();

        let agent = guard.agents.entry(agent_id).or_insert_with(|| AgentPresence {
            agent_id,
            business_id,
            connection_id: None,
            availability: Availability::Offline,
            active_escalation: None,
            available_since: None,
            last_assigned_at: None,
        });

        if connection_id.is_some() {
            agent.connection_id = connection_id;
        }
        if agent.active_escalation.is_some() {
            agent.availability = Availability::Busy;
        } else if agent.availability != Availability::Busy {
            agent.availability = Availability::Available;
            agent.available_since = Some(now);
        }
        self.agent_business.insert(agent_id, business_id);

        tracing::info!("agent {} is {:?} for business {}", agent_id, agent.availability, business_id);
        agent.clone()
    }

    /// Takes the agent out of matching. Any escalation they hold stays
    /// attached until the chat ends or the agent drops.
    pub fn set_agent_offline(&self, agent_id: Uuid) -> Option<AgentPresence> {
        self.update_agent(agent_id, |agent| {
            agent.availability = Availability::Offline;
            agent.available_since = None;
        })
    }

    /// Detaches the agent's live connection without touching availability.
    pub fn clear_agent_connection(&self, agent_id: Uuid, connection_id: Uuid) -> Option<AgentPresence> {
        self.update_agent(agent_id, |agent| {
            if agent.connection_id == Some(connection_id) {
                agent.connection_id = None;
            }
        })
    }

    /// Session over: a busy agent goes back to the pool. Agents that went
    /// offline meanwhile stay offline.
    pub fn release_agent(&self, agent_id: Uuid) -> Option<AgentPresence> {
        self.update_agent(agent_id, |agent| {
            agent.active_escalation = None;
            if agent.availability == Availability::Busy {
                agent.availability = Availability::Available;
                agent.available_since = Some(Utc::now());
            }
        })
    }

    fn update_agent<F>(&self, agent_id: Uuid, apply: F) -> Option<AgentPresence>
    where
        F: FnOnce(&mut AgentPresence),
    {
        let business_id = self.agent_business.get(&agent_id).map(|b| *b)?;
        let queue = self.existing_business(business_id)?;
        let mut guard = queue.lock();
        let agent = guard.agents.get_mut(&agent_id)?;
        apply(agent);
        Some(agent.clone())
    }

    pub fn agent(&self, agent_id: Uuid) -> Option<AgentPresence> {
        let business_id = self.agent_business.get(&agent_id).map(|b| *b)?;
        let queue = self.existing_business(business_id)?;
        let guard = queue.lock();
        guard.agents.get(&agent_id).cloned()
    }

    pub fn retry_count(&self, escalation_id: Uuid) -> u32 {
        self.retries.get(&escalation_id).map(|r| *r).unwrap_or(0)
    }

    /// Forget retry history once the escalation's live chat is over for good.
    pub fn forget(&self, escalation_id: Uuid) {
        self.retries.remove(&escalation_id);
    }

    pub fn snapshot(&self, business_id: Uuid) -> QueueSnapshot {
        let Some(queue) = self.existing_business(business_id) else {
            return QueueSnapshot {
                business_id,
                waiting: Vec::new(),
                agents: Vec::new(),
            };
        };
        let guard = queue.lock();

        let waiting = guard
            .ordered()
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| QueuedPosition {
                position: idx + 1,
                entry: entry.clone(),
            })
            .collect();

        let mut agents: Vec<AgentPresence> = guard.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.agent_id);

        QueueSnapshot {
            business_id,
            waiting,
            agents,
        }
    }

    /// Removes every entry that has been waiting longer than `max_wait`.
    pub fn expire_waiting(&self, max_wait: Duration, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let queues: Vec<Arc<Mutex<BusinessQueue>>> =
            self.businesses.iter().map(|b| b.value().clone()).collect();

        let mut expired = Vec::new();
        for queue in queues {
            let mut guard = queue.lock();
            let (stale, keep): (Vec<QueueEntry>, Vec<QueueEntry>) = guard
                .entries
                .drain(..)
                .partition(|e| now - e.enqueued_at > max_wait);
            guard.entries = keep;
            for entry in &stale {
                self.queued.remove(&entry.escalation_id);
            }
            expired.extend(stale);
        }

        if !expired.is_empty() {
            tracing::info!("expired {} queue entries", expired.len());
        }
        expired
    }

    pub fn businesses_with_waiting(&self) -> Vec<Uuid> {
        self.businesses
            .iter()
            .filter(|b| !b.value().lock().entries.is_empty())
            .map(|b| *b.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn repeated_enqueue_keeps_one_entry() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let escalation = Uuid::new_v4();

        let first = queue.enqueue(escalation, business);
        assert!(first.newly_queued);
        for _ in 0..10 {
            let again = queue.enqueue(escalation, business);
            assert!(!again.newly_queued);
            assert_eq!(again.position, 1);
        }
        assert_eq!(queue.snapshot(business).waiting.len(), 1);
    }

    #[test]
    fn fifo_then_position_updates_after_match() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let agent = Uuid::new_v4();

        assert_eq!(queue.enqueue(first, business).position, 1);
        assert_eq!(queue.enqueue(second, business).position, 2);
        queue.set_agent_available(agent, business, None);

        let assignment = queue.match_next(business).unwrap();
        assert_eq!(assignment.entry.escalation_id, first);
        assert_eq!(assignment.agent_id, agent);
        assert_eq!(queue.position(second), Some(1));
        assert!(queue.match_next(business).is_none());
        assert_eq!(queue.agent(agent).unwrap().availability, Availability::Busy);
    }

    #[test]
    fn no_agent_leaves_entry_queued() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let escalation = Uuid::new_v4();
        queue.enqueue(escalation, business);

        assert!(queue.match_next(business).is_none());
        assert!(queue.is_queued(escalation));
    }

    #[test]
    fn requeued_entries_jump_ahead_of_new_ones() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let (waiting, dropped) = (Uuid::new_v4(), Uuid::new_v4());

        queue.enqueue(waiting, business);
        let outcome = queue.requeue_after_disconnect(dropped, business);
        assert_eq!(outcome.retry_count, 1);
        assert_eq!(outcome.position, 1);
        assert_eq!(queue.position(waiting), Some(2));

        // a duplicate requeue does not bump the counter again
        let again = queue.requeue_after_disconnect(dropped, business);
        assert!(!again.newly_queued);
        assert_eq!(again.retry_count, 1);
    }

    #[test]
    fn dequeue_is_safe_when_absent() {
        let queue = QueueService::new();
        assert!(queue.dequeue(Uuid::new_v4()).is_none());

        let business = Uuid::new_v4();
        let escalation = Uuid::new_v4();
        queue.enqueue(escalation, business);
        assert!(queue.dequeue(escalation).is_some());
        assert!(queue.dequeue(escalation).is_none());
        assert!(!queue.is_queued(escalation));
    }

    #[test]
    fn round_robin_prefers_least_recently_assigned() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.set_agent_available(a, business, None);
        queue.set_agent_available(b, business, None);

        queue.enqueue(Uuid::new_v4(), business);
        let first = queue.match_next(business).unwrap().agent_id;
        queue.release_agent(first);

        queue.enqueue(Uuid::new_v4(), business);
        let second = queue.match_next(business).unwrap().agent_id;
        assert_ne!(first, second);
    }

    #[test]
    fn released_agent_can_be_matched_again() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let agent = Uuid::new_v4();
        queue.set_agent_available(agent, business, None);

        queue.enqueue(Uuid::new_v4(), business);
        queue.match_next(business).unwrap();
        queue.enqueue(Uuid::new_v4(), business);
        assert!(queue.match_next(business).is_none());

        queue.release_agent(agent);
        assert_eq!(queue.match_next(business).unwrap().agent_id, agent);
    }

    #[test]
    fn offline_agent_is_not_released_to_pool() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let agent = Uuid::new_v4();
        queue.set_agent_available(agent, business, None);
        queue.enqueue(Uuid::new_v4(), business);
        queue.match_next(business).unwrap();

        queue.set_agent_offline(agent);
        queue.release_agent(agent);
        assert_eq!(queue.agent(agent).unwrap().availability, Availability::Offline);
    }

    #[test]
    fn going_offline_keeps_the_active_escalation() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let escalation = Uuid::new_v4();
        queue.set_agent_available(agent, business, None);
        queue.enqueue(escalation, business);
        queue.match_next(business).unwrap();

        let presence = queue.set_agent_offline(agent).unwrap();
        assert_eq!(presence.availability, Availability::Offline);
        assert_eq!(presence.active_escalation, Some(escalation));

        // back online mid-chat: still busy, not offered a second customer
        queue.set_agent_available(agent, business, None);
        assert_eq!(queue.agent(agent).unwrap().availability, Availability::Busy);
        queue.enqueue(Uuid::new_v4(), business);
        assert!(queue.match_next(business).is_none());

        let released = queue.release_agent(agent).unwrap();
        assert_eq!(released.active_escalation, None);
        assert_eq!(released.availability, Availability::Available);
    }

    #[test]
    fn restored_entry_keeps_its_place() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let (dropped, fresh) = (Uuid::new_v4(), Uuid::new_v4());

        queue.requeue_after_disconnect(dropped, business);
        queue.enqueue(fresh, business);
        queue.set_agent_available(agent, business, None);

        let assignment = queue.match_next(business).unwrap();
        assert_eq!(assignment.entry.escalation_id, dropped);
        queue.release_agent(agent);

        let outcome = queue.restore(assignment.entry);
        assert!(outcome.newly_queued);
        assert_eq!(outcome.position, 1);
        assert_eq!(outcome.retry_count, 1);
        assert_eq!(queue.position(fresh), Some(2));

        // restoring twice is absorbed
        assert!(!queue.restore(queue.snapshot(business).waiting[0].entry.clone()).newly_queued);
        assert_eq!(queue.snapshot(business).waiting.len(), 2);
    }

    #[test]
    fn expire_waiting_drops_stale_entries() {
        let queue = QueueService::new();
        let business = Uuid::new_v4();
        let escalation = Uuid::new_v4();
        queue.enqueue(escalation, business);

        let later = Utc::now() + Duration::seconds(120);
        let expired = queue.expire_waiting(Duration::seconds(60), later);
        assert_eq!(expired.len(), 1);
        assert!(!queue.is_queued(escalation));
        assert!(queue.expire_waiting(Duration::seconds(60), later).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_matching_never_double_assigns() {
        let queue = Arc::new(QueueService::new());
        let business = Uuid::new_v4();

        for _ in 0..40 {
            queue.enqueue(Uuid::new_v4(), business);
        }
        for _ in 0..25 {
            queue.set_agent_available(Uuid::new_v4(), business, None);
        }

        let mut handles = Vec::new();
        for _ in 0..64 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.match_next(business) }));
        }

        let mut assignments = Vec::new();
        for handle in handles {
            if let Some(assignment) = handle.await.unwrap() {
                assignments.push(assignment);
            }
        }

        let entries: HashSet<_> = assignments.iter().map(|a| a.entry.escalation_id).collect();
        let agents: HashSet<_> = assignments.iter().map(|a| a.agent_id).collect();
        assert_eq!(assignments.len(), 25);
        assert_eq!(entries.len(), 25);
        assert_eq!(agents.len(), 25);
        assert_eq!(queue.snapshot(business).waiting.len(), 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_enqueue_of_same_escalation_creates_one_entry() {
        let queue = Arc::new(QueueService::new());
        let business = Uuid::new_v4();
        let escalation = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.enqueue(escalation, business) }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().newly_queued {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(queue.snapshot(business).waiting.len(), 1);
    }
}
