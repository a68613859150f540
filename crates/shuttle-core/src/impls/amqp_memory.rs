//! InMemoryAmqp - AMQP 0-9-1 のセマンティクスを模した開発用ブローカー
//!
//! # 学習ポイント
//! - durable queue / direct exchange / binding の冪等な宣言と、不一致時の衝突検出
//! - `x-message-ttl` + dead-letter exchange による遅延配送（プロセス側タイマーなし）
//! - prefetch による未 ack 数の制限、接続切断時の未 ack メッセージの再配送
//! - persistent フラグ: ブローカー再起動で non-persistent は消える
//!
//! `InMemoryAmqpServer` がブローカー本体、`InMemoryAmqpBroker` がエンジンごとの接続です。
//! 接続は最初の操作で遅延オープンされ、`close()` で冪等に閉じます。
//!
//! # 使用例
//! ```ignore
//! let server = InMemoryAmqpServer::new();
//! let broker = server.connect(QueueIdentity::default());
//! let queue = Queue::builder(broker).build()?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{JobId, QueueIdentity};
use crate::ports::{
    Broker, BrokerError, Capabilities, Consumer, Delivery, DeliveryTag, Message, Route,
};

/// `x-message-ttl` is an unsigned 32-bit millisecond count.
const MAX_MESSAGE_TTL: Duration = Duration::from_millis(u32::MAX as u64);

/// Optional queue arguments (`x-message-ttl`, `x-dead-letter-*`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArgs {
    pub message_ttl: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueDecl {
    durable: bool,
    args: QueueArgs,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    persistent: bool,
    attempt: u32,
    redelivered: bool,
    enqueued_at: Instant,
}

struct QueueState {
    decl: QueueDecl,
    ready: VecDeque<Stored>,
}

impl QueueState {
    /// Time at which the head message dead-letters, for TTL queues.
    fn head_expiry(&self) -> Option<Instant> {
        let ttl = self.decl.args.message_ttl?;
        self.ready
            .front()
            .and_then(|m| m.enqueued_at.checked_add(ttl))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct Vhost {
    /// exchange name -> durable
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<Binding>,
}

impl Vhost {
    /// Direct routing: every queue bound with exactly `routing_key`.
    fn route(&mut self, exchange: &str, routing_key: &str, message: Stored) -> usize {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
        targets.len()
    }

    /// Move expired messages out of TTL queues through their dead-letter exchange.
    fn expire(&mut self, now: Instant) {
        let mut dead = Vec::new();
        for queue in self.queues.values_mut() {
            let Some(ttl) = queue.decl.args.message_ttl else {
                continue;
            };
            while queue
                .ready
                .front()
                .is_some_and(|m| m.enqueued_at.checked_add(ttl).is_some_and(|at| at <= now))
            {
                if let Some(mut message) = queue.ready.pop_front()
                    && let Some(exchange) = &queue.decl.args.dead_letter_exchange
                {
                    message.enqueued_at = now;
                    let key = queue
                        .decl
                        .args
                        .dead_letter_routing_key
                        .clone()
                        .unwrap_or_default();
                    dead.push((exchange.clone(), key, message));
                }
            }
        }
        for (exchange, key, message) in dead {
            let routed = self.route(&exchange, &key, message);
            if routed == 0 {
                debug!(%exchange, routing_key = %key, "dead-lettered message was unroutable");
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues.values().filter_map(QueueState::head_expiry).min()
    }
}

struct Unacked {
    vhost: String,
    queue: String,
    connection: u64,
    consumer: u64,
    message: Stored,
}

struct ConsumerState {
    connection: u64,
    vhost: String,
    queue: String,
    prefetch: u16,
    broken: bool,
}

enum Poll {
    Ready(Delivery),
    Pending(Option<Instant>),
    Cancelled,
}

struct ServerState {
    online: bool,
    vhosts: HashMap<String, Vhost>,
    /// connection id -> vhost
    connections: HashMap<u64, String>,
    consumers: HashMap<u64, ConsumerState>,
    /// delivery tag -> in-flight message
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
}

impl ServerState {
    fn new() -> Self {
        Self {
            online: true,
            vhosts: HashMap::new(),
            connections: HashMap::new(),
            consumers: HashMap::new(),
            unacked: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker is down".into()))
        }
    }

    /// Resolve a live connection to its vhost.
    fn vhost_of(&mut self, connection: u64) -> Result<&mut Vhost, BrokerError> {
        self.ensure_online()?;
        let name = self
            .connections
            .get(&connection)
            .cloned()
            .ok_or_else(|| BrokerError::Unavailable("connection reset by broker".into()))?;
        Ok(self.vhosts.entry(name).or_default())
    }

    fn declare_exchange(
        &mut self,
        connection: u64,
        exchange: &str,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let vhost = self.vhost_of(connection)?;
        match vhost.exchanges.get(exchange) {
            Some(existing) if *existing != durable => Err(BrokerError::ConfigurationConflict(
                format!("exchange '{exchange}' already declared with durable={existing}"),
            )),
            Some(_) => Ok(()),
            None => {
                vhost.exchanges.insert(exchange.to_string(), durable);
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        connection: u64,
        queue: &str,
        decl: QueueDecl,
    ) -> Result<(), BrokerError> {
        if let Some(ttl) = decl.args.message_ttl
            && ttl > MAX_MESSAGE_TTL
        {
            return Err(BrokerError::Transport(format!(
                "x-message-ttl of {}ms for queue '{queue}' is out of range",
                ttl.as_millis()
            )));
        }
        let vhost = self.vhost_of(connection)?;
        match vhost.queues.get(queue) {
            Some(existing) if existing.decl != decl => {
                Err(BrokerError::ConfigurationConflict(format!(
                    "queue '{queue}' already declared with {:?}, requested {:?}",
                    existing.decl, decl
                )))
            }
            Some(_) => Ok(()),
            None => {
                vhost.queues.insert(
                    queue.to_string(),
                    QueueState {
                        decl,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(
        &mut self,
        connection: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let vhost = self.vhost_of(connection)?;
        if !vhost.exchanges.contains_key(exchange) {
            return Err(BrokerError::Transport(format!("no exchange '{exchange}'")));
        }
        if !vhost.queues.contains_key(queue) {
            return Err(BrokerError::Transport(format!("no queue '{queue}'")));
        }
        vhost.bindings.insert(Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    fn publish(
        &mut self,
        connection: u64,
        route: &Route,
        message: Message,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let vhost = self.vhost_of(connection)?;
        if !vhost.exchanges.contains_key(&route.exchange) {
            return Err(BrokerError::Transport(format!(
                "no exchange '{}'",
                route.exchange
            )));
        }
        let stored = Stored {
            body: message.body,
            persistent: message.persistent,
            attempt: message.attempt,
            redelivered: false,
            enqueued_at: now,
        };
        if vhost.route(&route.exchange, &route.routing_key, stored) == 0 {
            debug!(%route, "published message was unroutable");
        }
        Ok(())
    }

    fn poll_consumer(&mut self, consumer: u64, now: Instant) -> Result<Poll, BrokerError> {
        self.ensure_online()?;
        let Some(state) = self.consumers.get(&consumer) else {
            return Ok(Poll::Cancelled);
        };
        if state.broken {
            return Err(BrokerError::Unavailable("connection reset by broker".into()));
        }
        let (connection, vhost_name, queue_name, prefetch) = (
            state.connection,
            state.vhost.clone(),
            state.queue.clone(),
            state.prefetch,
        );

        let in_flight = self
            .unacked
            .values()
            .filter(|u| u.consumer == consumer)
            .count();

        let vhost = self.vhosts.entry(vhost_name.clone()).or_default();
        vhost.expire(now);
        let wake_at = vhost.next_expiry();

        if prefetch != 0 && in_flight >= usize::from(prefetch) {
            return Ok(Poll::Pending(wake_at));
        }

        let Some(message) = vhost
            .queues
            .get_mut(&queue_name)
            .and_then(|q| q.ready.pop_front())
        else {
            return Ok(Poll::Pending(wake_at));
        };

        let tag = self.allocate_id();
        let delivery = Delivery {
            tag: DeliveryTag::new(tag),
            body: message.body.clone(),
            job_id: None,
            attempt: message.attempt,
            redelivered: message.redelivered,
        };
        self.unacked.insert(
            tag,
            Unacked {
                vhost: vhost_name,
                queue: queue_name,
                connection,
                consumer,
                message,
            },
        );
        Ok(Poll::Ready(delivery))
    }

    fn take_unacked(&mut self, connection: u64, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        self.ensure_online()?;
        match self.unacked.get(&tag.raw()) {
            Some(u) if u.connection == connection => {}
            _ => return Err(BrokerError::UnknownDelivery(tag)),
        }
        self.unacked
            .remove(&tag.raw())
            .ok_or(BrokerError::UnknownDelivery(tag))
    }

    fn requeue_front(&mut self, unacked: Unacked) {
        let Unacked {
            vhost,
            queue,
            mut message,
            ..
        } = unacked;
        message.redelivered = true;
        if let Some(q) = self
            .vhosts
            .get_mut(&vhost)
            .and_then(|v| v.queues.get_mut(&queue))
        {
            q.ready.push_front(message);
        }
    }

    /// Return in-flight messages matching `pred` to the head of their queues.
    fn requeue_where(&mut self, pred: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|&(_, u)| pred(u))
            .map(|(tag, _)| *tag)
            .collect();
        // newest first so the oldest ends up at the very front
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue_front(unacked);
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        self.requeue_where(|u| u.connection == connection);
        self.consumers.retain(|_, c| c.connection != connection);
        self.connections.remove(&connection);
    }

    /// Drop every client connection; consumers see a transport failure.
    fn reset_connections(&mut self) {
        self.requeue_where(|_| true);
        for consumer in self.consumers.values_mut() {
            consumer.broken = true;
        }
        self.connections.clear();
    }
}

/// In-memory AMQP-style broker shared by any number of connections.
#[derive(Clone)]
pub struct InMemoryAmqpServer {
    state: Arc<Mutex<ServerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryAmqpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAmqpServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a lazily-connecting client for `identity`. No I/O happens here.
    pub fn connect(&self, identity: QueueIdentity) -> InMemoryAmqpBroker {
        InMemoryAmqpBroker {
            server: self.clone(),
            identity,
            session: Mutex::new(Session::default()),
        }
    }

    /// Simulate an outage: connections drop, in-flight messages are requeued.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.reset_connections();
        state.online = false;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn start(&self) {
        self.state.lock().await.online = true;
        self.notify.notify_waiters();
    }

    /// Simulate a broker restart. Only durable entities and persistent
    /// messages survive.
    pub async fn restart(&self) {
        let mut state = self.state.lock().await;
        state.reset_connections();
        for vhost in state.vhosts.values_mut() {
            vhost.exchanges.retain(|_, durable| *durable);
            vhost.queues.retain(|_, q| q.decl.durable);
            for queue in vhost.queues.values_mut() {
                queue.ready.retain(|m| m.persistent);
            }
            let Vhost {
                exchanges,
                queues,
                bindings,
            } = vhost;
            bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
        }
        state.online = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Declare a queue out of band, the way an operator would.
    pub async fn declare_queue(
        &self,
        vhost: &str,
        queue: &str,
        durable: bool,
        args: QueueArgs,
    ) -> Result<(), BrokerError> {
        let connection = self.open_connection(vhost).await?;
        let mut state = self.state.lock().await;
        let result = state.declare_queue(connection, queue, QueueDecl { durable, args });
        state.close_connection(connection);
        result
    }

    /// Messages ready for delivery in `queue`, `None` if it is not declared.
    pub async fn queue_depth(&self, vhost: &str, queue: &str) -> Option<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let vhost = state.vhosts.get_mut(vhost)?;
        vhost.expire(now);
        vhost.queues.get(queue).map(|q| q.ready.len())
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Registered consumers, broken ones included.
    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    async fn open_connection(&self, vhost: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_online()?;
        let id = state.allocate_id();
        state.connections.insert(id, vhost.to_string());
        state.vhosts.entry(vhost.to_string()).or_default();
        Ok(id)
    }

    async fn is_connected(&self, connection: u64) -> bool {
        let state = self.state.lock().await;
        state.online && state.connections.contains_key(&connection)
    }
}

#[derive(Default)]
struct Session {
    connection: Option<u64>,
    main_route: Option<Route>,
    delay_routes: HashMap<u64, Route>,
}

/// One connection + channel to an [`InMemoryAmqpServer`].
pub struct InMemoryAmqpBroker {
    server: InMemoryAmqpServer,
    identity: QueueIdentity,
    session: Mutex<Session>,
}

impl InMemoryAmqpBroker {
    /// Reuse the open connection or open a new one.
    async fn open(&self, session: &mut Session) -> Result<u64, BrokerError> {
        if let Some(id) = session.connection {
            if self.server.is_connected(id).await {
                return Ok(id);
            }
            debug!(connection = id, "connection lost, reopening");
            *session = Session::default();
        }
        let id = self.server.open_connection(&self.identity.vhost).await?;
        debug!(connection = id, vhost = %self.identity.vhost, "connection opened");
        session.connection = Some(id);
        Ok(id)
    }

    async fn declare_main(&self, session: &mut Session) -> Result<Route, BrokerError> {
        let connection = self.open(session).await?;
        if let Some(route) = &session.main_route {
            return Ok(route.clone());
        }

        let id = &self.identity;
        let mut state = self.server.state.lock().await;
        state.declare_queue(
            connection,
            &id.queue,
            QueueDecl {
                durable: true,
                args: QueueArgs::default(),
            },
        )?;
        state.declare_exchange(connection, &id.exchange, true)?;
        state.bind(connection, &id.queue, &id.exchange, "")?;
        drop(state);

        let route = Route::new(&id.exchange, "");
        session.main_route = Some(route.clone());
        Ok(route)
    }
}

#[async_trait]
impl Broker for InMemoryAmqpBroker {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    async fn ensure_topology(&self) -> Result<Route, BrokerError> {
        let mut session = self.session.lock().await;
        self.declare_main(&mut session).await
    }

    async fn ensure_delay_topology(&self, delay: Duration) -> Result<Route, BrokerError> {
        let mut session = self.session.lock().await;
        let main = self.declare_main(&mut session).await?;
        let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
        if secs == 0 {
            return Ok(main);
        }
        if let Some(route) = session.delay_routes.get(&secs) {
            return Ok(route.clone());
        }

        let connection = self.open(&mut session).await?;
        let id = &self.identity;
        let staging = id.delay_queue(secs);
        let mut state = self.server.state.lock().await;
        state.declare_queue(
            connection,
            &staging,
            QueueDecl {
                durable: true,
                args: QueueArgs {
                    message_ttl: Some(Duration::from_secs(secs)),
                    dead_letter_exchange: Some(id.exchange.clone()),
                    dead_letter_routing_key: Some(String::new()),
                },
            },
        )?;
        state.bind(connection, &staging, &id.exchange, &staging)?;
        drop(state);

        let route = Route::new(&id.exchange, staging);
        session.delay_routes.insert(secs, route.clone());
        Ok(route)
    }

    async fn publish(
        &self,
        route: &Route,
        message: Message,
    ) -> Result<Option<JobId>, BrokerError> {
        if message.priority.is_some() {
            return Err(BrokerError::Unsupported("job priority"));
        }
        let mut session = self.session.lock().await;
        let connection = self.open(&mut session).await?;
        self.server
            .state
            .lock()
            .await
            .publish(connection, route, message)?;
        drop(session);
        self.server.notify.notify_waiters();
        Ok(None)
    }

    async fn consume(&self, prefetch: u16) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut session = self.session.lock().await;
        let connection = self.open(&mut session).await?;
        let mut state = self.server.state.lock().await;
        let vhost = state.vhost_of(connection)?;
        if !vhost.queues.contains_key(&self.identity.queue) {
            return Err(BrokerError::Transport(format!(
                "no queue '{}'",
                self.identity.queue
            )));
        }
        let consumer = state.allocate_id();
        state.consumers.insert(
            consumer,
            ConsumerState {
                connection,
                vhost: self.identity.vhost.clone(),
                queue: self.identity.queue.clone(),
                prefetch,
                broken: false,
            },
        );
        debug!(consumer, queue = %self.identity.queue, prefetch, "consumer registered");
        Ok(Box::new(InMemoryAmqpConsumer {
            server: self.server.clone(),
            consumer,
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let session = self.session.lock().await;
        let connection = session.connection.ok_or(BrokerError::UnknownDelivery(tag))?;
        self.server
            .state
            .lock()
            .await
            .take_unacked(connection, tag)?;
        drop(session);
        self.server.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let session = self.session.lock().await;
        let connection = session.connection.ok_or(BrokerError::UnknownDelivery(tag))?;
        let now = Instant::now();
        {
            let mut state = self.server.state.lock().await;
            let unacked = state.take_unacked(connection, tag)?;
            if requeue {
                state.requeue_front(unacked);
            } else if let Some(vhost) = state.vhosts.get_mut(&unacked.vhost) {
                let dlx = vhost
                    .queues
                    .get(&unacked.queue)
                    .map(|q| q.decl.args.clone())
                    .unwrap_or_default();
                match dlx.dead_letter_exchange {
                    Some(exchange) => {
                        let mut message = unacked.message;
                        message.enqueued_at = now;
                        let key = dlx.dead_letter_routing_key.unwrap_or_default();
                        vhost.route(&exchange, &key, message);
                    }
                    None => debug!(%tag, queue = %unacked.queue, "rejected message dropped"),
                }
            }
        }
        drop(session);
        self.server.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut session = self.session.lock().await;
        if let Some(connection) = session.connection.take() {
            self.server.state.lock().await.close_connection(connection);
            debug!(connection, "connection closed");
            self.server.notify.notify_waiters();
        }
        *session = Session::default();
        Ok(())
    }
}

/// Consumer handle; cancelled when its connection is closed.
pub struct InMemoryAmqpConsumer {
    server: InMemoryAmqpServer,
    consumer: u64,
}

#[async_trait]
impl Consumer for InMemoryAmqpConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notified = self.server.notify.notified();
            tokio::pin!(notified);

            let wake_at = {
                let mut state = self.server.state.lock().await;
                // register before releasing the lock so no wakeup is missed
                notified.as_mut().enable();
                match state.poll_consumer(self.consumer, Instant::now())? {
                    Poll::Ready(delivery) => return Ok(Some(delivery)),
                    Poll::Cancelled => return Ok(None),
                    Poll::Pending(wake_at) => wake_at,
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

    /// `basic.cancel`: unacked deliveries stay with the connection.
    async fn cancel(&mut self) -> Result<(), BrokerError> {
        if self.server.state.lock().await.consumers.remove(&self.consumer).is_some() {
            debug!(consumer = self.consumer, "consumer cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> QueueIdentity {
        QueueIdentity::new("jobs", "jobs-ex", "/")
    }

    fn message(body: &str) -> Message {
        Message::persistent(body.as_bytes().to_vec(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn topology_is_idempotent() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());

        let r1 = broker.ensure_topology().await.unwrap();
        let r2 = broker.ensure_topology().await.unwrap();
        assert_eq!(r1, r2);

        // a second connection re-declares with matching properties
        let other = server.connect(identity());
        assert_eq!(other.ensure_topology().await.unwrap(), r1);
        assert_eq!(server.queue_depth("/", "jobs").await, Some(0));
    }

    #[tokio::test]
    async fn conflicting_declaration_is_reported() {
        let server = InMemoryAmqpServer::new();
        server
            .declare_queue(
                "/",
                "jobs",
                true,
                QueueArgs {
                    message_ttl: Some(Duration::from_secs(1)),
                    ..QueueArgs::default()
                },
            )
            .await
            .unwrap();

        let broker = server.connect(identity());
        let err = broker.ensure_topology().await.unwrap_err();
        assert!(matches!(err, BrokerError::ConfigurationConflict(_)));
    }

    #[tokio::test]
    async fn staging_queue_with_another_ttl_is_a_conflict() {
        let server = InMemoryAmqpServer::new();
        server
            .declare_queue(
                "/",
                "jobs.delay.5s",
                true,
                QueueArgs {
                    message_ttl: Some(Duration::from_secs(7)),
                    dead_letter_exchange: Some("jobs-ex".into()),
                    dead_letter_routing_key: Some(String::new()),
                },
            )
            .await
            .unwrap();

        let broker = server.connect(identity());
        let err = broker
            .ensure_delay_topology(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConfigurationConflict(_)));

        // other delays are unaffected
        let route = broker
            .ensure_delay_topology(Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(route.routing_key, "jobs.delay.6s");
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_refused_and_the_vhost_keeps_working() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();

        let err = broker
            .ensure_delay_topology(Duration::from_secs(u64::MAX / 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));

        let err = server
            .declare_queue(
                "/",
                "parked",
                true,
                QueueArgs {
                    message_ttl: Some(MAX_MESSAGE_TTL + Duration::from_millis(1)),
                    ..QueueArgs::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
        assert_eq!(server.queue_depth("/", "parked").await, None);

        broker.publish(&route, message("1;x")).await.unwrap();
        assert_eq!(server.queue_depth("/", "jobs").await, Some(1));
    }

    #[tokio::test]
    async fn longest_ttl_never_overflows_expiry() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let staging = broker
            .ensure_delay_topology(Duration::from_secs(u64::from(u32::MAX) / 1_000))
            .await
            .unwrap();
        broker.publish(&staging, message("1;x")).await.unwrap();
        assert_eq!(server.queue_depth("/", &staging.routing_key).await, Some(1));
        assert_eq!(server.queue_depth("/", "jobs").await, Some(0));
    }

    #[tokio::test]
    async fn cancelled_consumer_is_unregistered() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        broker.publish(&route, message("1;x")).await.unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(server.consumer_count().await, 1);

        consumer.cancel().await.unwrap();
        consumer.cancel().await.unwrap();
        assert_eq!(server.consumer_count().await, 0);
        assert!(consumer.next().await.unwrap().is_none());

        // the delivery is still held by the connection
        broker.ack(delivery.tag).await.unwrap();
        assert_eq!(server.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn publish_consume_ack() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();

        let id = broker.publish(&route, message("5;a")).await.unwrap();
        assert_eq!(id, None);

        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"5;a");
        assert_eq!(delivery.attempt, 1);
        assert!(!delivery.redelivered);
        assert_eq!(server.unacked_count().await, 1);

        broker.ack(delivery.tag).await.unwrap();
        assert_eq!(server.unacked_count().await, 0);
        assert_eq!(server.queue_depth("/", "jobs").await, Some(0));
    }

    #[tokio::test]
    async fn ack_of_unknown_tag_fails() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        broker.ensure_topology().await.unwrap();

        let err = broker.ack(DeliveryTag::new(9999)).await.unwrap_err();
        assert_eq!(err, BrokerError::UnknownDelivery(DeliveryTag::new(9999)));
    }

    #[tokio::test]
    async fn tags_are_scoped_to_their_connection() {
        let server = InMemoryAmqpServer::new();
        let worker = server.connect(identity());
        let intruder = server.connect(identity());
        let route = worker.ensure_topology().await.unwrap();
        intruder.ensure_topology().await.unwrap();

        worker.publish(&route, message("1;x")).await.unwrap();
        let mut consumer = worker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();

        assert!(matches!(
            intruder.ack(delivery.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
        worker.ack(delivery.tag).await.unwrap();
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        broker.publish(&route, message("1;x")).await.unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        broker.nack(first.tag, true).await.unwrap();

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.body, first.body);
        assert!(second.redelivered);
        assert_ne!(second.tag, first.tag);
    }

    #[tokio::test]
    async fn nack_without_requeue_drops() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        broker.publish(&route, message("1;x")).await.unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        broker.nack(delivery.tag, false).await.unwrap();

        assert_eq!(server.unacked_count().await, 0);
        assert_eq!(server.queue_depth("/", "jobs").await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_blocks_second_delivery_until_ack() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        broker.publish(&route, message("1;a")).await.unwrap();
        broker.publish(&route, message("1;b")).await.unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_secs(5), consumer.next()).await;
        assert!(blocked.is_err(), "second delivery arrived before ack");

        broker.ack(first.tag).await.unwrap();
        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"1;b");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_dead_letters_into_main_queue() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        broker.ensure_topology().await.unwrap();
        let staging = broker
            .ensure_delay_topology(Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(staging.routing_key, "jobs.delay.3s");

        broker.publish(&staging, message("1;later")).await.unwrap();
        assert_eq!(server.queue_depth("/", "jobs.delay.3s").await, Some(1));
        assert_eq!(server.queue_depth("/", "jobs").await, Some(0));

        tokio::time::advance(Duration::from_millis(2_900)).await;
        assert_eq!(server.queue_depth("/", "jobs").await, Some(0));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(server.queue_depth("/", "jobs.delay.3s").await, Some(0));
        assert_eq!(server.queue_depth("/", "jobs").await, Some(1));
    }

    #[tokio::test]
    async fn sub_second_delay_rounds_up() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker
            .ensure_delay_topology(Duration::from_millis(1_500))
            .await
            .unwrap();
        assert_eq!(route.routing_key, "jobs.delay.2s");
    }

    #[tokio::test]
    async fn close_requeues_in_flight_and_cancels_consumer() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        broker.publish(&route, message("1;x")).await.unwrap();

        let mut consumer = broker.consume(1).await.unwrap();
        let _delivery = consumer.next().await.unwrap().unwrap();

        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.queue_depth("/", "jobs").await, Some(1));
        assert!(consumer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_without_open_is_fine() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        broker.close().await.unwrap();
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        let mut consumer = broker.consume(1).await.unwrap();

        server.stop().await;
        assert!(matches!(
            broker.publish(&route, message("1;x")).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(matches!(
            consumer.next().await,
            Err(BrokerError::Unavailable(_))
        ));

        // after recovery the client reconnects lazily
        server.start().await;
        broker.publish(&route, message("1;x")).await.unwrap();
        assert_eq!(server.queue_depth("/", "jobs").await, Some(1));
    }

    #[tokio::test]
    async fn restart_keeps_only_persistent_messages() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();

        broker.publish(&route, message("1;durable")).await.unwrap();
        let mut transient = message("1;transient");
        transient.persistent = false;
        broker.publish(&route, transient).await.unwrap();
        assert_eq!(server.queue_depth("/", "jobs").await, Some(2));

        server.restart().await;
        assert_eq!(server.queue_depth("/", "jobs").await, Some(1));

        let mut consumer = broker.consume(1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"1;durable");
    }

    #[tokio::test]
    async fn priority_is_rejected() {
        let server = InMemoryAmqpServer::new();
        let broker = server.connect(identity());
        let route = broker.ensure_topology().await.unwrap();
        let mut msg = message("1;x");
        msg.priority = Some(10);
        assert_eq!(
            broker.publish(&route, msg).await,
            Err(BrokerError::Unsupported("job priority"))
        );
    }
}
