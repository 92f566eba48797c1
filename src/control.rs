use crate::config::AgentConfig;
use crate::counters::CounterSnapshot;
use crate::debug;
use crate::error::{ReduceError, Result};
use crate::protocol::{
    subjects, ClientRole, ClientTypeUpdate, GetSchemaReply, GetSchemaRequest,
    RegisterClientRequest, RegisterClientReply, SchemaAssignment, SessionId, SDK_VERSION,
};
use ahash::AHashMap;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(feature = "async")]
use async_trait::async_trait;

pub type SubscriptionId = u64;
pub type SubscriptionHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// The pub/sub control-plane link. Implementations must tolerate calls from
/// arbitrary threads; `request` blocks at most for the given timeout.
pub trait ControlTransport: Send + Sync {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()>;
    fn request(&self, subject: &str, payload: &[u8], timeout: Duration) -> Result<Bytes>;
    fn subscribe(&self, subject: &str, handler: SubscriptionHandler) -> Result<SubscriptionId>;
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn close(&self) -> Result<()>;
}

#[cfg(feature = "async")]
#[async_trait]
pub trait AsyncControlTransport: Send + Sync {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()>;
    async fn request(&self, subject: &str, payload: &[u8], timeout: Duration) -> Result<Bytes>;
    async fn subscribe(&self, subject: &str, handler: SubscriptionHandler) -> Result<SubscriptionId>;
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

type RequestResponder = Box<dyn Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// In-process control plane with scriptable request responders and captured
/// publishes. A responder pattern is either an exact subject or a prefix
/// ending in `*`; a request with no responder (or a responder returning
/// `None`) times out, which is how tests model an unreachable coordinator.
pub struct MemoryControlPlane {
    connected: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    requests: Mutex<Vec<(String, Vec<u8>)>>,
    responders: Mutex<Vec<(String, RequestResponder)>>,
    subscriptions: Mutex<AHashMap<SubscriptionId, (String, SubscriptionHandler)>>,
    next_subscription: AtomicU64,
}

impl MemoryControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            responders: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(AHashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Register a canned responder for request/reply subjects.
    pub fn respond<F>(&self, pattern: impl Into<String>, responder: F)
    where
        F: Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .push((pattern.into(), Box::new(responder)));
    }

    /// Simulate a broker disconnect: publishes and requests start failing.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Push a message to every subscription on `subject`.
    pub fn deliver(&self, subject: &str, payload: &[u8]) {
        let subscriptions = self.subscriptions.lock().unwrap();
        for (registered, handler) in subscriptions.values() {
            if registered == subject {
                handler(payload);
            }
        }
    }

    /// Payloads published to subjects starting with `prefix`.
    pub fn published_to(&self, prefix: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(subject, _)| subject.starts_with(prefix))
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of requests issued to subjects starting with `prefix`,
    /// including ones that timed out.
    pub fn requests_to(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(subject, _)| subject.starts_with(prefix))
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    fn matches(pattern: &str, subject: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => subject.starts_with(prefix),
            None => pattern == subject,
        }
    }
}

impl ControlTransport for MemoryControlPlane {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ReduceError::ConnectionClosed);
        }

        debug::trace_control_send(subject, payload.len());
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), payload.to_vec()));
        Ok(())
    }

    fn request(&self, subject: &str, payload: &[u8], _timeout: Duration) -> Result<Bytes> {
        if !self.is_connected() {
            return Err(ReduceError::ConnectionClosed);
        }

        self.requests
            .lock()
            .unwrap()
            .push((subject.to_string(), payload.to_vec()));

        let responders = self.responders.lock().unwrap();
        for (pattern, responder) in responders.iter() {
            if Self::matches(pattern, subject) {
                return match responder(subject, payload) {
                    Some(reply) => {
                        debug::trace_control_receive(subject, reply.len());
                        Ok(Bytes::from(reply))
                    }
                    None => Err(ReduceError::Timeout),
                };
            }
        }

        Err(ReduceError::Timeout)
    }

    fn subscribe(&self, subject: &str, handler: SubscriptionHandler) -> Result<SubscriptionId> {
        if !self.is_connected() {
            return Err(ReduceError::ConnectionClosed);
        }

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, (subject.to_string(), handler));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subscriptions.lock().unwrap().remove(&id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().clear();
        Ok(())
    }
}

struct ConnectionInner {
    transport: Arc<dyn ControlTransport>,
    session_id: SessionId,
    token: String,
    role: Mutex<ClientRole>,
    request_timeout: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    reduction_allowed: AtomicBool,
    learning_factor_override: Mutex<Option<u32>>,
    disabled: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Owns the control-plane link for one session: registration, the standing
/// subscriptions, background re-registration with bounded backoff, and the
/// two request/reply operations. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    /// Register the client role with the coordination service and install
    /// the reconnection-update and client-type-update subscriptions.
    ///
    /// Fails fast when the coordinator is unreachable; the caller degrades
    /// the session to passthrough in that case.
    pub fn connect(
        transport: Arc<dyn ControlTransport>,
        config: &AgentConfig,
        role: ClientRole,
    ) -> Result<Self> {
        let request = RegisterClientRequest {
            token: config.token.clone(),
            role,
            sdk_version: SDK_VERSION.to_string(),
            session_id: None,
        };

        let reply = register(transport.as_ref(), &request, config.request_timeout)?;

        let inner = Arc::new(ConnectionInner {
            transport,
            session_id: reply.session_id,
            token: config.token.clone(),
            role: Mutex::new(role),
            request_timeout: config.request_timeout,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reduction_allowed: AtomicBool::new(reply.reduction_enabled),
            learning_factor_override: Mutex::new(reply.learning_factor),
            disabled: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });

        let manager = Self { inner };
        manager.install_control_subscriptions()?;
        Ok(manager)
    }

    fn install_control_subscriptions(&self) -> Result<()> {
        let reconnect_inner = Arc::clone(&self.inner);
        self.subscribe(subjects::RECONNECTION_UPDATE, move |_| {
            spawn_reregister(Arc::clone(&reconnect_inner));
        })?;

        let role_inner = Arc::clone(&self.inner);
        self.subscribe(subjects::CLIENT_TYPE_UPDATE, move |payload| {
            if let Ok(update) = serde_json::from_slice::<ClientTypeUpdate>(payload) {
                if update.session_id == role_inner.session_id {
                    if let Ok(mut role) = role_inner.role.lock() {
                        *role = update.role;
                    }
                }
            }
        })?;

        Ok(())
    }

    /// Subscribe on behalf of this session; the subscription is torn down
    /// on close.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let id = self
            .inner
            .transport
            .subscribe(subject, Box::new(handler))?;
        self.inner
            .subscriptions
            .lock()
            .map_err(|e| ReduceError::Unknown(format!("Lock poisoned: {}", e)))?
            .push(id);
        Ok(())
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn role(&self) -> ClientRole {
        self.inner
            .role
            .lock()
            .map(|role| *role)
            .unwrap_or(ClientRole::Producer)
    }

    /// Whether the coordinator allows reduction for this session.
    pub fn reduction_allowed(&self) -> bool {
        self.inner.reduction_allowed.load(Ordering::SeqCst)
    }

    /// Server-side learning factor override, if the coordinator sent one.
    pub fn learning_factor_override(&self) -> Option<u32> {
        self.inner
            .learning_factor_override
            .lock()
            .map(|factor| *factor)
            .unwrap_or(None)
    }

    /// True once background re-registration has exhausted its attempts and
    /// the session fell back to passthrough.
    pub fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Forward one pre-reduction payload for schema learning.
    /// Fire-and-forget.
    pub fn learn_sample(&self, payload: &[u8]) -> Result<()> {
        self.inner
            .transport
            .publish(&subjects::learn_schema(self.inner.session_id), payload)
    }

    /// Request canonical schema id + shape for this session's sampled
    /// payloads. Synchronous request/reply under the configured timeout.
    pub fn register_schema(&self) -> Result<SchemaAssignment> {
        let reply = self.inner.transport.request(
            &subjects::register_schema(self.inner.session_id),
            &[],
            self.inner.request_timeout,
        )?;

        serde_json::from_slice(&reply)
            .map_err(|e| ReduceError::Registration(e.to_string()))
    }

    /// Resolve a schema id to its shape. Synchronous request/reply under
    /// the configured timeout.
    pub fn get_schema(&self, schema_id: &str) -> Result<GetSchemaReply> {
        let request = GetSchemaRequest {
            schema_id: schema_id.to_string(),
        };

        let reply = self.inner.transport.request(
            &subjects::get_schema(self.inner.session_id),
            &serde_json::to_vec(&request)?,
            self.inner.request_timeout,
        )?;

        Ok(serde_json::from_slice(&reply)?)
    }

    /// Publish a counters snapshot to the bookkeeping subject.
    /// Fire-and-forget.
    pub fn publish_counters(&self, snapshot: &CounterSnapshot) -> Result<()> {
        let update = CountersUpdate {
            session_id: self.inner.session_id,
            role: self.role(),
            counters: snapshot,
        };

        self.inner.transport.publish(
            &subjects::clients_update(self.role(), self.inner.session_id),
            &serde_json::to_vec(&update)?,
        )
    }

    /// Tear down subscriptions and the transport. Exactly one effective
    /// close; later or concurrent calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Ok(mut subscriptions) = self.inner.subscriptions.lock() {
            for id in std::mem::take(&mut *subscriptions) {
                let _ = self.inner.transport.unsubscribe(id);
            }
        }

        self.inner.transport.close()
    }
}

#[derive(Serialize)]
struct CountersUpdate<'a> {
    session_id: SessionId,
    role: ClientRole,
    counters: &'a CounterSnapshot,
}

fn register(
    transport: &dyn ControlTransport,
    request: &RegisterClientRequest,
    timeout: Duration,
) -> Result<RegisterClientReply> {
    let payload = serde_json::to_vec(request)?;
    let reply = transport.request(subjects::CLIENT_REGISTER, &payload, timeout)?;

    serde_json::from_slice(&reply).map_err(|e| ReduceError::Connection(e.to_string()))
}

/// Background re-registration with bounded backoff. At most one attempt
/// loop per session; after exhaustion the session degrades to passthrough
/// instead of failing the data path.
fn spawn_reregister(inner: Arc<ConnectionInner>) {
    if inner.closed.load(Ordering::SeqCst) || inner.disabled.load(Ordering::SeqCst) {
        return;
    }

    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }

    thread::spawn(move || {
        let mut registered = false;

        for attempt in 1..=inner.max_reconnect_attempts {
            thread::sleep(inner.reconnect_delay * attempt);

            if inner.closed.load(Ordering::SeqCst) {
                break;
            }

            let role = inner
                .role
                .lock()
                .map(|role| *role)
                .unwrap_or(ClientRole::Producer);
            let request = RegisterClientRequest {
                token: inner.token.clone(),
                role,
                sdk_version: SDK_VERSION.to_string(),
                session_id: Some(inner.session_id),
            };

            match register(inner.transport.as_ref(), &request, inner.request_timeout) {
                Ok(reply) if reply.session_id == inner.session_id => {
                    inner
                        .reduction_allowed
                        .store(reply.reduction_enabled, Ordering::SeqCst);
                    registered = true;
                    break;
                }
                Ok(_) | Err(_) => continue,
            }
        }

        if !registered && !inner.closed.load(Ordering::SeqCst) {
            debug::trace_state("disabled (re-registration exhausted)");
            inner.disabled.store(true, Ordering::SeqCst);
        }

        inner.reconnecting.store(false, Ordering::SeqCst);
    });
}
