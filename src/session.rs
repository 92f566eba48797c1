use crate::cache::SchemaCache;
use crate::codec;
use crate::config::AgentConfig;
use crate::control::{ConnectionManager, ControlTransport};
use crate::counters::{ClientCounters, CounterSnapshot};
use crate::debug;
use crate::descriptor::SchemaDescriptor;
use crate::error::{ReduceError, Result};
use crate::protocol::{subjects, ClientRole, SchemaAssignment, SessionId};
use crate::report::{ClientIdentity, ErrorReporter};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Producer-side learning state. One tagged value, transitioned under a
/// single lock, so no caller observes a partially updated session.
/// `Reducing` and `Disabled` are terminal; learning never resumes.
#[derive(Debug)]
pub enum ProducerState {
    Learning { sampled: u32 },
    AwaitingRegistration,
    Reducing { descriptor: Arc<SchemaDescriptor> },
    Disabled,
}

#[derive(Debug)]
pub struct ProduceOutcome {
    pub payload: Bytes,
    /// Set when the payload was reduced; the adapter writes it into the
    /// transport header.
    pub schema_id: Option<String>,
}

#[derive(Debug)]
pub enum ConsumeOutcome {
    /// Not reduced, or no safe way to expand: bytes surface unmodified.
    Passthrough(Bytes),
    /// Expanded back to the textual intermediate encoding.
    Decoded(Bytes),
    /// Reduced payload whose schema cannot be resolved at all.
    Undeliverable,
}

impl ConsumeOutcome {
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            ConsumeOutcome::Passthrough(bytes) | ConsumeOutcome::Decoded(bytes) => Some(bytes),
            ConsumeOutcome::Undeliverable => None,
        }
    }
}

enum ProduceAction {
    Off,
    Passthrough,
    Sample { sampled: u32 },
    SampleAndRegister { sampled: u32 },
    RegisterOnly,
    Reduce(Arc<SchemaDescriptor>),
}

/// The schema learning & reduction engine for one adapter instance.
///
/// Runs synchronously on the caller's data-path thread; only the two
/// request/reply control calls (get-schema, register-schema) block, each
/// under the configured timeout. Every failure path falls back to
/// passthrough so no internal error reaches the host's serialize or
/// deserialize invocation.
pub struct ClientSession {
    role: ClientRole,
    learning_factor: u32,
    connection: Option<ConnectionManager>,
    cache: SchemaCache,
    counters: Arc<ClientCounters>,
    reporter: Option<Arc<ErrorReporter>>,
    state: Arc<Mutex<ProducerState>>,
    closed: AtomicBool,
    bookkeeper: Option<Bookkeeper>,
}

impl ClientSession {
    /// Connect with a private schema cache.
    pub fn connect(
        config: AgentConfig,
        role: ClientRole,
        transport: Arc<dyn ControlTransport>,
    ) -> Result<Self> {
        Self::connect_with_cache(config, role, transport, SchemaCache::new())
    }

    /// Connect using a cache shared with other sessions in this process.
    ///
    /// Fails when the coordinator is unreachable; callers degrade to a
    /// [`ClientSession::disabled`] session in that case.
    pub fn connect_with_cache(
        config: AgentConfig,
        role: ClientRole,
        transport: Arc<dyn ControlTransport>,
        cache: SchemaCache,
    ) -> Result<Self> {
        let connection = ConnectionManager::connect(Arc::clone(&transport), &config, role)?;

        let reporter = Arc::new(ErrorReporter::spawn(
            transport,
            ClientIdentity {
                token: config.token.clone(),
                role,
                session_id: Some(connection.session_id()),
            },
        ));

        let learning_factor = connection
            .learning_factor_override()
            .unwrap_or(config.learning_factor);
        let reduction = config.reduction_enabled && connection.reduction_allowed();

        let initial = if role == ClientRole::Producer && reduction {
            ProducerState::Learning { sampled: 0 }
        } else {
            ProducerState::Disabled
        };
        let state = Arc::new(Mutex::new(initial));

        if role == ClientRole::Producer {
            let update_state = Arc::clone(&state);
            let update_cache = cache.clone();
            let update_reporter = Arc::clone(&reporter);
            let subscribed = connection.subscribe(
                &subjects::schema_update(connection.session_id()),
                move |payload| match serde_json::from_slice::<SchemaAssignment>(payload) {
                    Ok(assignment) => {
                        if let Err(e) =
                            apply_assignment(&update_state, &update_cache, assignment)
                        {
                            update_reporter
                                .report(format!("failed to apply schema update: {}", e));
                        }
                    }
                    Err(e) => {
                        update_reporter.report(format!("malformed schema update: {}", e));
                    }
                },
            );

            if let Err(e) = subscribed {
                reporter.close();
                let _ = connection.close();
                return Err(e);
            }
        }

        let counters = Arc::new(ClientCounters::new());
        let bookkeeper = config
            .bookkeeping_interval
            .map(|interval| spawn_bookkeeper(connection.clone(), Arc::clone(&counters), interval));

        Ok(Self {
            role,
            learning_factor,
            connection: Some(connection),
            cache,
            counters,
            reporter: Some(reporter),
            state,
            closed: AtomicBool::new(false),
            bookkeeper,
        })
    }

    /// A session that never touches the control plane: every call is
    /// passthrough. Used when engine initialization fails so the host's
    /// serialization path continues unaffected.
    pub fn disabled(role: ClientRole) -> Self {
        Self {
            role,
            learning_factor: 0,
            connection: None,
            cache: SchemaCache::new(),
            counters: Arc::new(ClientCounters::new()),
            reporter: None,
            state: Arc::new(Mutex::new(ProducerState::Disabled)),
            closed: AtomicBool::new(false),
            bookkeeper: None,
        }
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.connection.as_ref().map(|c| c.session_id())
    }

    pub fn stats(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    fn is_active(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        match &self.connection {
            Some(conn) => !conn.is_disabled() && !conn.is_closed(),
            None => false,
        }
    }

    fn report(&self, message: String) {
        if let Some(reporter) = &self.reporter {
            reporter.report(message);
        }
    }

    /// Producer data path: decide per message whether to sample for
    /// learning, await registration, or reduce. Never fails; the worst
    /// outcome is the input surfacing unmodified.
    pub fn handle_produce(&self, data: &[u8]) -> ProduceOutcome {
        if self.role != ClientRole::Producer || !self.is_active() {
            return passthrough(data);
        }

        match self.next_action() {
            ProduceAction::Off => passthrough(data),
            ProduceAction::Passthrough => {
                self.count_passthrough(data.len());
                passthrough(data)
            }
            ProduceAction::Sample { sampled } => {
                self.count_passthrough(data.len());
                self.send_sample(data, sampled);
                passthrough(data)
            }
            ProduceAction::SampleAndRegister { sampled } => {
                self.count_passthrough(data.len());
                self.send_sample(data, sampled);
                self.request_registration();
                passthrough(data)
            }
            ProduceAction::RegisterOnly => {
                self.count_passthrough(data.len());
                self.request_registration();
                passthrough(data)
            }
            ProduceAction::Reduce(descriptor) => self.reduce(data, &descriptor),
        }
    }

    /// Consumer data path: resolve the schema tag (if any) and expand the
    /// payload back to the textual intermediate encoding. Returns
    /// `Undeliverable` only when a tagged payload's schema cannot be
    /// resolved at all.
    pub fn handle_consume(&self, data: &[u8], schema_id: Option<&str>) -> ConsumeOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return ConsumeOutcome::Passthrough(Bytes::copy_from_slice(data));
        }

        self.counters.add_bytes_after_reduction(data.len() as u64);

        let Some(schema_id) = schema_id else {
            self.counters.add_bytes_before_reduction(data.len() as u64);
            return ConsumeOutcome::Passthrough(Bytes::copy_from_slice(data));
        };

        let descriptor = match self.cache.get(schema_id) {
            Some(descriptor) => Some(descriptor),
            None => match &self.connection {
                Some(conn) if !conn.is_disabled() && !conn.is_closed() => {
                    self.cache.fetch(schema_id, conn).ok()
                }
                _ => None,
            },
        };

        let Some(descriptor) = descriptor else {
            self.report(format!("unable to resolve schema '{}'", schema_id));
            self.counters.incr_consumed_failed();
            return ConsumeOutcome::Undeliverable;
        };

        match codec::decode(data, &descriptor) {
            Ok(text) => {
                self.counters.add_bytes_before_reduction(text.len() as u64);
                self.counters.incr_consumed_ok();
                debug::log_payload("consume", &text);
                ConsumeOutcome::Decoded(text)
            }
            Err(e) => {
                self.report(format!("failed to expand payload: {}", e));
                self.counters.add_bytes_before_reduction(data.len() as u64);
                self.counters.incr_consumed_failed();
                ConsumeOutcome::Passthrough(Bytes::copy_from_slice(data))
            }
        }
    }

    /// Close the session: stop background work, tear down subscriptions,
    /// release the control-plane handle. Exactly one effective close;
    /// later or concurrent calls are no-ops, including while data-path
    /// calls are in flight.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(bookkeeper) = &self.bookkeeper {
            bookkeeper.stop();
        }

        if let Some(reporter) = &self.reporter {
            reporter.close();
        }

        if let Some(connection) = &self.connection {
            let _ = connection.close();
        }
    }

    fn next_action(&self) -> ProduceAction {
        let Ok(mut state) = self.state.lock() else {
            return ProduceAction::Off;
        };

        let action = match &*state {
            ProducerState::Disabled => ProduceAction::Off,
            ProducerState::Reducing { descriptor } => {
                ProduceAction::Reduce(Arc::clone(descriptor))
            }
            ProducerState::AwaitingRegistration => ProduceAction::Passthrough,
            ProducerState::Learning { sampled } => {
                let sampled = *sampled;
                if sampled >= self.learning_factor {
                    ProduceAction::RegisterOnly
                } else if sampled + 1 == self.learning_factor {
                    ProduceAction::SampleAndRegister { sampled: sampled + 1 }
                } else {
                    ProduceAction::Sample { sampled: sampled + 1 }
                }
            }
        };

        match &action {
            ProduceAction::Sample { sampled } => {
                *state = ProducerState::Learning { sampled: *sampled };
            }
            ProduceAction::SampleAndRegister { .. } | ProduceAction::RegisterOnly => {
                debug::trace_state("awaiting registration");
                *state = ProducerState::AwaitingRegistration;
            }
            _ => {}
        }

        action
    }

    fn count_passthrough(&self, len: usize) {
        self.counters.add_bytes_before_reduction(len as u64);
        self.counters.add_bytes_after_reduction(len as u64);
    }

    fn send_sample(&self, data: &[u8], sampled: u32) {
        debug::trace_learning(sampled, self.learning_factor);

        if let Some(connection) = &self.connection {
            if let Err(e) = connection.learn_sample(data) {
                self.report(format!("failed to publish learning sample: {}", e));
            }
        }
    }

    fn reduce(&self, data: &[u8], descriptor: &SchemaDescriptor) -> ProduceOutcome {
        match codec::encode(data, descriptor) {
            Ok(binary) => {
                self.counters.add_bytes_before_reduction(data.len() as u64);
                self.counters.add_bytes_after_reduction(binary.len() as u64);
                self.counters.incr_produced_ok();
                debug::trace_reduction(data.len(), binary.len());
                ProduceOutcome {
                    payload: binary,
                    schema_id: Some(descriptor.schema_id().to_string()),
                }
            }
            Err(e) => {
                self.report(format!("failed to reduce payload: {}", e));
                self.count_passthrough(data.len());
                self.counters.incr_produced_failed();
                passthrough(data)
            }
        }
    }

    /// Issue the single register-schema request for this session. Only the
    /// caller that performed the Learning -> AwaitingRegistration
    /// transition gets here, so at most one request is ever outstanding.
    /// On failure the state stays `AwaitingRegistration` until a
    /// schema-update push arrives; there is no automatic re-request.
    fn request_registration(&self) {
        let Some(connection) = &self.connection else {
            return;
        };

        match connection.register_schema() {
            Ok(assignment) => {
                if let Err(e) = apply_assignment(&self.state, &self.cache, assignment) {
                    self.report(format!("failed to apply registered schema: {}", e));
                }
            }
            Err(e) => {
                self.report(format!("schema registration failed: {}", e));
            }
        }
    }
}

fn passthrough(data: &[u8]) -> ProduceOutcome {
    ProduceOutcome {
        payload: Bytes::copy_from_slice(data),
        schema_id: None,
    }
}

/// Compile and install a schema assignment, transitioning the producer to
/// `Reducing`. A `Disabled` session stays disabled; an already-`Reducing`
/// session adopts the new descriptor.
fn apply_assignment(
    state: &Mutex<ProducerState>,
    cache: &SchemaCache,
    assignment: SchemaAssignment,
) -> Result<()> {
    let descriptor = Arc::new(SchemaDescriptor::compile(
        assignment.schema_id,
        &assignment.shape,
    )?);
    cache.put(Arc::clone(&descriptor))?;

    let mut state = state
        .lock()
        .map_err(|e| ReduceError::Unknown(format!("Lock poisoned: {}", e)))?;

    if !matches!(*state, ProducerState::Disabled) {
        debug::trace_state("reducing");
        *state = ProducerState::Reducing { descriptor };
    }

    Ok(())
}

struct Bookkeeper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Bookkeeper {
    fn stop(&self) {
        let (lock, cvar) = &*self.stop;
        if let Ok(mut stopped) = lock.lock() {
            *stopped = true;
            cvar.notify_all();
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

/// Periodically publish a counters snapshot to the bookkeeping subject.
fn spawn_bookkeeper(
    connection: ConnectionManager,
    counters: Arc<ClientCounters>,
    interval: Duration,
) -> Bookkeeper {
    let stop = Arc::new((Mutex::new(false), Condvar::new()));
    let thread_stop = Arc::clone(&stop);

    let worker = thread::spawn(move || {
        let (lock, cvar) = &*thread_stop;
        let Ok(mut stopped) = lock.lock() else {
            return;
        };

        while !*stopped {
            let Ok((guard, timeout)) = cvar.wait_timeout(stopped, interval) else {
                return;
            };
            stopped = guard;

            if !*stopped && timeout.timed_out() {
                let _ = connection.publish_counters(&counters.snapshot());
            }
        }
    });

    Bookkeeper {
        stop,
        worker: Mutex::new(Some(worker)),
    }
}
