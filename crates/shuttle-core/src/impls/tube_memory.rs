//! InMemoryTube - beanstalk 風の tube ブローカー（開発・テスト用）
//!
//! # 特徴
//! - 優先度付き配送（数値が小さいほど先、同じ優先度は push 順）
//! - ジョブごとの遅延（staging topology 不要）
//! - job id の採番、status / remove によるイントロスペクション
//! - TTR を過ぎても ack されない予約は ready に戻る（visibility timeout）
//! - nack(requeue=false) されたジョブは bury され、`kick` で ready に戻すまで残る
//!
//! # 実装詳細
//! - ready は BinaryHeap（min-heap として使う）、delayed も BinaryHeap
//! - heap のエントリは遅延削除: pop 時にジョブの状態と seq を照合する
//! - Notify + sleep_until で「次の push」か「次の期限」まで待つ

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{JobId, JobStatus, QueueIdentity};
use crate::ports::{
    Broker, BrokerError, Capabilities, Consumer, Delivery, DeliveryTag, IdGenerator, Message,
    Route, SystemClock, UlidGenerator,
};

/// Priority assigned when a push does not name one.
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Reservations never expire faster than this, even with a zero TTR.
const MIN_TTR: Duration = Duration::from_secs(1);

/// TTR is a 32-bit second count on the wire; longer values are clamped.
const MAX_TTR: Duration = Duration::from_secs(u32::MAX as u64);

/// Per-tube counters, the `stats-tube` view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeStats {
    pub ready: usize,
    pub delayed: usize,
    pub reserved: usize,
    pub buried: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Ready,
    Delayed(Instant),
    Reserved {
        tag: u64,
        connection: u64,
        consumer: u64,
        deadline: Instant,
    },
}

#[derive(Debug, Clone)]
struct TubeJob {
    body: Vec<u8>,
    priority: u32,
    seq: u64,
    ttr: Duration,
    attempt: u32,
    redelivered: bool,
    state: JobState,
}

/// Ready heap entry: lowest priority value first, then push order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u32,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering: BinaryHeap is a max-heap
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed heap entry: earliest wake-up first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    until: Instant,
    id: JobId,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.until.cmp(&self.until)
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Tube {
    jobs: HashMap<JobId, TubeJob>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    /// delivery tag -> job
    reserved: HashMap<u64, JobId>,
    /// Oldest first. Only `kick` takes jobs out again.
    buried: VecDeque<(JobId, TubeJob)>,
    next_seq: u64,
}

impl Tube {
    fn make_ready(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Ready;
            self.ready.push(ReadyEntry {
                priority: job.priority,
                seq: job.seq,
                id,
            });
        }
    }

    /// Put a reserved job back, counting another attempt.
    fn release(&mut self, tag: u64) -> Option<JobId> {
        let id = self.reserved.remove(&tag)?;
        if let Some(job) = self.jobs.get_mut(&id) {
            job.attempt += 1;
            job.redelivered = true;
        }
        self.make_ready(id);
        Some(id)
    }

    /// Promote due delayed jobs and expire overdue reservations.
    /// Returns the next instant something changes on its own.
    fn sweep(&mut self, now: Instant) -> Option<Instant> {
        while self.delayed.peek().is_some_and(|e| e.until <= now) {
            if let Some(entry) = self.delayed.pop()
                && self
                    .jobs
                    .get(&entry.id)
                    .is_some_and(|j| j.state == JobState::Delayed(entry.until))
            {
                self.make_ready(entry.id);
            }
        }

        let overdue: Vec<u64> = self
            .reserved
            .iter()
            .filter(|&(_, id)| {
                self.jobs.get(id).is_some_and(
                    |j| matches!(j.state, JobState::Reserved { deadline, .. } if deadline <= now),
                )
            })
            .map(|(tag, _)| *tag)
            .collect();
        for tag in overdue {
            if let Some(id) = self.release(tag) {
                debug!(job_id = %id, "reservation exceeded ttr, job released");
            }
        }

        let next_delayed = self.delayed.peek().map(|e| e.until);
        let next_deadline = self
            .jobs
            .values()
            .filter_map(|j| match j.state {
                JobState::Reserved { deadline, .. } => Some(deadline),
                _ => None,
            })
            .min();
        match (next_delayed, next_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Move up to `bound` buried jobs back to ready, oldest first.
    fn kick(&mut self, bound: usize) -> usize {
        let mut kicked = 0;
        while kicked < bound {
            let Some((id, mut job)) = self.buried.pop_front() else {
                break;
            };
            job.seq = self.next_seq;
            self.next_seq += 1;
            self.jobs.insert(id, job);
            self.make_ready(id);
            kicked += 1;
        }
        kicked
    }

    fn pop_ready(&mut self) -> Option<JobId> {
        while let Some(entry) = self.ready.pop() {
            let live = self
                .jobs
                .get(&entry.id)
                .is_some_and(|j| j.state == JobState::Ready && j.seq == entry.seq);
            if live {
                return Some(entry.id);
            }
        }
        None
    }

    fn in_flight(&self, consumer: u64) -> usize {
        self.jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Reserved { consumer: c, .. } if c == consumer))
            .count()
    }

    fn reserved_tag(&self, connection: u64, tag: DeliveryTag) -> Result<JobId, BrokerError> {
        let id = self
            .reserved
            .get(&tag.raw())
            .copied()
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        match self.jobs.get(&id).map(|j| j.state) {
            Some(JobState::Reserved { connection: c, .. }) if c == connection => Ok(id),
            _ => Err(BrokerError::UnknownDelivery(tag)),
        }
    }

    fn stats(&self) -> TubeStats {
        let mut stats = TubeStats {
            buried: self.buried.len(),
            ..TubeStats::default()
        };
        for job in self.jobs.values() {
            match job.state {
                JobState::Ready => stats.ready += 1,
                JobState::Delayed(_) => stats.delayed += 1,
                JobState::Reserved { .. } => stats.reserved += 1,
            }
        }
        stats
    }
}

struct ConsumerSlot {
    connection: u64,
    tube: String,
    prefetch: u16,
}

struct TubeServerState {
    online: bool,
    tubes: HashMap<String, Tube>,
    consumers: HashMap<u64, ConsumerSlot>,
    next_id: u64,
}

impl TubeServerState {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("tube server is down".into()))
        }
    }

    fn tube(&mut self, name: &str) -> &mut Tube {
        self.tubes.entry(name.to_string()).or_default()
    }
}

/// In-memory tube server shared by any number of connections.
#[derive(Clone)]
pub struct InMemoryTubeServer {
    state: Arc<Mutex<TubeServerState>>,
    notify: Arc<Notify>,
    ids: Arc<dyn IdGenerator>,
    connections: Arc<AtomicU64>,
}

impl Default for InMemoryTubeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTubeServer {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TubeServerState {
                online: true,
                tubes: HashMap::new(),
                consumers: HashMap::new(),
                next_id: 1,
            })),
            notify: Arc::new(Notify::new()),
            ids,
            connections: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Client bound to `tube`. Connection ids are never reused.
    pub fn connect(&self, tube: impl Into<String>) -> InMemoryTubeBroker {
        let connection = self.connections.fetch_add(1, AtomicOrdering::Relaxed);
        InMemoryTubeBroker {
            server: self.clone(),
            identity: QueueIdentity::tube(tube),
            connection,
        }
    }

    pub async fn stats(&self, tube: &str) -> TubeStats {
        let mut state = self.state.lock().await;
        let tube = state.tube(tube);
        tube.sweep(Instant::now());
        tube.stats()
    }

    /// Peek by id: is the job still held by the server (ready, delayed or reserved)?
    pub async fn contains(&self, tube: &str, id: &JobId) -> bool {
        let state = self.state.lock().await;
        state
            .tubes
            .get(tube)
            .is_some_and(|t| t.jobs.contains_key(id))
    }

    /// Buried job ids with their bodies, oldest first.
    pub async fn buried(&self, tube: &str) -> Vec<(JobId, Vec<u8>)> {
        let state = self.state.lock().await;
        state
            .tubes
            .get(tube)
            .map(|t| {
                t.buried
                    .iter()
                    .map(|(id, job)| (*id, job.body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Return up to `bound` buried jobs to the ready set, oldest first, with
    /// their id, priority and attempt count. Returns how many were kicked.
    pub async fn kick(&self, tube: &str, bound: usize) -> usize {
        let kicked = {
            let mut state = self.state.lock().await;
            state.tubes.get_mut(tube).map_or(0, |t| t.kick(bound))
        };
        if kicked > 0 {
            debug!(tube, kicked, "buried jobs kicked");
            self.notify.notify_waiters();
        }
        kicked
    }

    pub async fn stop(&self) {
        self.state.lock().await.online = false;
        self.notify.notify_waiters();
    }

    pub async fn start(&self) {
        self.state.lock().await.online = true;
        self.notify.notify_waiters();
    }
}

/// One connection to an [`InMemoryTubeServer`], bound to a single tube.
pub struct InMemoryTubeBroker {
    server: InMemoryTubeServer,
    identity: QueueIdentity,
    connection: u64,
}

impl InMemoryTubeBroker {
    pub fn tube(&self) -> &str {
        &self.identity.queue
    }

    fn tube_for<'a>(&'a self, route: &'a Route) -> &'a str {
        if route.routing_key.is_empty() {
            self.tube()
        } else {
            &route.routing_key
        }
    }
}

#[async_trait]
impl Broker for InMemoryTubeBroker {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            priority: true,
            status: true,
            remove: true,
            native_delay: true,
            job_ids: true,
        }
    }

    fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    async fn ensure_topology(&self) -> Result<Route, BrokerError> {
        let mut state = self.server.state.lock().await;
        state.ensure_online()?;
        state.tube(self.tube());
        Ok(Route::new("", self.tube()))
    }

    async fn publish(
        &self,
        route: &Route,
        message: Message,
    ) -> Result<Option<JobId>, BrokerError> {
        let now = Instant::now();
        let until = match message.delay.filter(|d| !d.is_zero()) {
            Some(delay) => Some(now.checked_add(delay).ok_or_else(|| {
                BrokerError::Transport(format!("delay of {}s is out of range", delay.as_secs()))
            })?),
            None => None,
        };
        let ttr = message.ttr.clamp(MIN_TTR, MAX_TTR);

        let id = self.server.ids.generate_job_id();
        {
            let mut state = self.server.state.lock().await;
            state.ensure_online()?;
            let tube = state.tube(self.tube_for(route));
            let seq = tube.next_seq;
            tube.next_seq += 1;

            let job = TubeJob {
                body: message.body,
                priority: message.priority.unwrap_or(DEFAULT_PRIORITY),
                seq,
                ttr,
                attempt: message.attempt,
                redelivered: false,
                state: until.map_or(JobState::Ready, JobState::Delayed),
            };
            tube.jobs.insert(id, job);
            match until {
                Some(until) => tube.delayed.push(DelayedEntry { until, id }),
                None => tube.make_ready(id),
            }
        }
        self.server.notify.notify_waiters();
        Ok(Some(id))
    }

    async fn consume(&self, prefetch: u16) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut state = self.server.state.lock().await;
        state.ensure_online()?;
        let consumer = state.allocate_id();
        state.consumers.insert(
            consumer,
            ConsumerSlot {
                connection: self.connection,
                tube: self.tube().to_string(),
                prefetch,
            },
        );
        debug!(consumer, tube = %self.tube(), prefetch, "watching tube");
        Ok(Box::new(InMemoryTubeConsumer {
            server: self.server.clone(),
            consumer,
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        {
            let mut state = self.server.state.lock().await;
            state.ensure_online()?;
            let tube = state.tube(self.tube());
            tube.sweep(Instant::now());
            let id = tube.reserved_tag(self.connection, tag)?;
            tube.reserved.remove(&tag.raw());
            tube.jobs.remove(&id);
        }
        self.server.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.server.state.lock().await;
            state.ensure_online()?;
            let tube = state.tube(self.tube());
            tube.sweep(Instant::now());
            let id = tube.reserved_tag(self.connection, tag)?;
            if requeue {
                tube.release(tag.raw());
            } else {
                tube.reserved.remove(&tag.raw());
                if let Some(job) = tube.jobs.remove(&id) {
                    debug!(job_id = %id, "job buried");
                    tube.buried.push_back((id, job));
                }
            }
        }
        self.server.notify.notify_waiters();
        Ok(())
    }

    async fn status(&self, id: &JobId) -> Result<JobStatus, BrokerError> {
        let mut state = self.server.state.lock().await;
        state.ensure_online()?;
        let tube = state.tube(self.tube());
        tube.sweep(Instant::now());
        Ok(match tube.jobs.get(id).map(|j| j.state) {
            Some(JobState::Ready | JobState::Delayed(_)) => JobStatus::Waiting,
            Some(JobState::Reserved { .. }) => JobStatus::Reserved,
            None => JobStatus::Done,
        })
    }

    async fn remove(&self, id: &JobId) -> Result<bool, BrokerError> {
        let removed = {
            let mut state = self.server.state.lock().await;
            state.ensure_online()?;
            let tube = state.tube(self.tube());
            match tube.jobs.remove(id) {
                Some(job) => {
                    if let JobState::Reserved { tag, .. } = job.state {
                        tube.reserved.remove(&tag);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.server.notify.notify_waiters();
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.server.state.lock().await;
            let connection = self.connection;
            state.consumers.retain(|_, c| c.connection != connection);
            for tube in state.tubes.values_mut() {
                let held: Vec<u64> = tube
                    .jobs
                    .values()
                    .filter_map(|j| match j.state {
                        JobState::Reserved { tag, connection: c, .. } if c == connection => {
                            Some(tag)
                        }
                        _ => None,
                    })
                    .collect();
                for tag in held {
                    tube.release(tag);
                }
            }
        }
        self.server.notify.notify_waiters();
        Ok(())
    }
}

pub struct InMemoryTubeConsumer {
    server: InMemoryTubeServer,
    consumer: u64,
}

enum Reserve {
    Job(Delivery),
    Wait(Option<Instant>),
    Cancelled,
}

impl InMemoryTubeConsumer {
    fn try_reserve(
        state: &mut TubeServerState,
        consumer: u64,
        now: Instant,
    ) -> Result<Reserve, BrokerError> {
        state.ensure_online()?;
        let Some(slot) = state.consumers.get(&consumer) else {
            return Ok(Reserve::Cancelled);
        };
        let (connection, tube_name, prefetch) = (slot.connection, slot.tube.clone(), slot.prefetch);
        let tag = state.allocate_id();

        let tube = state.tube(&tube_name);
        let wake_at = tube.sweep(now);
        if prefetch != 0 && tube.in_flight(consumer) >= usize::from(prefetch) {
            return Ok(Reserve::Wait(wake_at));
        }
        let Some(id) = tube.pop_ready() else {
            return Ok(Reserve::Wait(wake_at));
        };
        let Some(job) = tube.jobs.get_mut(&id) else {
            return Ok(Reserve::Wait(wake_at));
        };
        // ttr is clamped to MAX_TTR on publish
        job.state = JobState::Reserved {
            tag,
            connection,
            consumer,
            deadline: now + job.ttr,
        };
        let delivery = Delivery {
            tag: DeliveryTag::new(tag),
            body: job.body.clone(),
            job_id: Some(id),
            attempt: job.attempt,
            redelivered: job.redelivered,
        };
        tube.reserved.insert(tag, id);
        Ok(Reserve::Job(delivery))
    }
}

#[async_trait]
impl Consumer for InMemoryTubeConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notified = self.server.notify.notified();
            tokio::pin!(notified);

            let wake_at = {
                let mut state = self.server.state.lock().await;
                notified.as_mut().enable();
                match Self::try_reserve(&mut state, self.consumer, Instant::now())? {
                    Reserve::Job(delivery) => return Ok(Some(delivery)),
                    Reserve::Cancelled => return Ok(None),
                    Reserve::Wait(wake_at) => wake_at,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        if self.server.state.lock().await.consumers.remove(&self.consumer).is_some() {
            debug!(consumer = self.consumer, "stopped watching tube");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str, priority: Option<u32>) -> Message {
        let mut msg = Message::persistent(body.as_bytes().to_vec(), Duration::from_secs(60));
        msg.priority = priority;
        msg
    }

    async fn broker() -> (InMemoryTubeServer, InMemoryTubeBroker, Route) {
        let server = InMemoryTubeServer::new();
        let broker = server.connect("default");
        let route = broker.ensure_topology().await.unwrap();
        (server, broker, route)
    }

    #[tokio::test]
    async fn publish_assigns_ids_and_reports_waiting() {
        let (server, broker, route) = broker().await;
        let id = broker.publish(&route, message("1;a", None)).await.unwrap().unwrap();

        assert!(server.contains("default", &id).await);
        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Waiting);
        assert_eq!(server.stats("default").await.ready, 1);
    }

    #[tokio::test]
    async fn lower_priority_value_is_reserved_first() {
        let (_server, broker, route) = broker().await;
        for (body, pri) in [("a", 100), ("e", 300), ("c", 200), ("d", 200), ("b", 100)] {
            broker.publish(&route, message(body, Some(pri))).await.unwrap();
        }

        let mut consumer = broker.consume(1).await.unwrap();
        let mut order = String::new();
        for _ in 0..5 {
            let delivery = consumer.next().await.unwrap().unwrap();
            order.push_str(std::str::from_utf8(&delivery.body).unwrap());
            broker.ack(delivery.tag).await.unwrap();
        }
        assert_eq!(order, "abcde");
    }

    #[tokio::test]
    async fn reserved_then_done_after_ack() {
        let (_server, broker, route) = broker().await;
        let id = broker.publish(&route, message("1;a", None)).await.unwrap().unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.job_id, Some(id));
        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Reserved);

        broker.ack(delivery.tag).await.unwrap();
        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Done);
    }

    #[tokio::test]
    async fn remove_deletes_waiting_job() {
        let (server, broker, route) = broker().await;
        let id = broker.publish(&route, message("1;a", None)).await.unwrap().unwrap();

        assert!(broker.remove(&id).await.unwrap());
        assert!(!server.contains("default", &id).await);
        assert!(!broker.remove(&id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_becomes_ready_after_delay() {
        let (server, broker, route) = broker().await;
        let mut msg = message("1;a", None);
        msg.delay = Some(Duration::from_secs(10));
        let id = broker.publish(&route, msg).await.unwrap().unwrap();

        assert_eq!(server.stats("default").await.delayed, 1);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(server.stats("default").await.ready, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(server.stats("default").await.ready, 1);
        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_reservation_is_released() {
        let (_server, broker, route) = broker().await;
        let mut msg = message("1;a", None);
        msg.ttr = Duration::from_secs(3);
        broker.publish(&route, msg).await.unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);

        // do not ack; the next reserve waits for the ttr to lapse
        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert!(second.redelivered);
        assert_eq!(second.job_id, first.job_id);

        assert!(matches!(
            broker.ack(first.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
        broker.ack(second.tag).await.unwrap();
    }

    #[tokio::test]
    async fn nack_without_requeue_buries() {
        let (server, broker, route) = broker().await;
        let id = broker.publish(&route, message("1;a", None)).await.unwrap().unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        broker.nack(delivery.tag, false).await.unwrap();

        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Done);
        let buried = server.buried("default").await;
        assert_eq!(buried, vec![(id, b"1;a".to_vec())]);
    }

    #[tokio::test]
    async fn kick_returns_buried_jobs_to_ready() {
        let (server, broker, route) = broker().await;
        let first = broker.publish(&route, message("1;a", Some(7))).await.unwrap().unwrap();
        let second = broker.publish(&route, message("1;b", None)).await.unwrap().unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        for _ in 0..2 {
            let delivery = consumer.next().await.unwrap().unwrap();
            broker.nack(delivery.tag, false).await.unwrap();
        }
        assert_eq!(server.stats("default").await.buried, 2);

        assert_eq!(server.kick("default", 1).await, 1);
        assert_eq!(server.buried("default").await.len(), 1);
        assert_eq!(broker.status(&first).await.unwrap(), JobStatus::Waiting);
        assert_eq!(broker.status(&second).await.unwrap(), JobStatus::Done);

        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.job_id, Some(first));
        assert_eq!(delivery.body, b"1;a");
        broker.ack(delivery.tag).await.unwrap();

        assert_eq!(server.kick("default", 10).await, 1);
        assert_eq!(server.kick("default", 10).await, 0);
        assert_eq!(server.stats("default").await.buried, 0);
        assert_eq!(server.kick("missing", 10).await, 0);
    }

    #[tokio::test]
    async fn out_of_range_delay_is_refused_and_the_tube_keeps_working() {
        let (server, broker, route) = broker().await;
        let mut msg = message("1;a", None);
        msg.delay = Some(Duration::from_secs(u64::MAX / 2));
        assert!(matches!(
            broker.publish(&route, msg).await,
            Err(BrokerError::Transport(_))
        ));
        assert_eq!(server.stats("default").await, TubeStats::default());

        let mut msg = message("1;b", None);
        msg.ttr = Duration::from_secs(u64::MAX / 2);
        broker.publish(&route, msg).await.unwrap();
        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(server.stats("default").await.reserved, 1);
        broker.ack(delivery.tag).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_consumer_gets_nothing_more() {
        let (server, broker, route) = broker().await;
        let mut consumer = broker.consume(1).await.unwrap();
        consumer.cancel().await.unwrap();
        consumer.cancel().await.unwrap();

        broker.publish(&route, message("1;a", None)).await.unwrap();
        assert!(consumer.next().await.unwrap().is_none());
        assert_eq!(server.stats("default").await.ready, 1);
    }

    #[tokio::test]
    async fn close_releases_reservations_and_cancels_consumers() {
        let (server, broker, route) = broker().await;
        let id = broker.publish(&route, message("1;a", None)).await.unwrap().unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let _delivery = consumer.next().await.unwrap().unwrap();
        broker.close().await.unwrap();

        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Waiting);
        assert!(consumer.next().await.unwrap().is_none());
        assert_eq!(server.stats("default").await.reserved, 0);
    }
}
