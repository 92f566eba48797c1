pub mod protocol;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod cache;
pub mod codec;
pub mod counters;
pub mod report;
pub mod session;
pub mod adapter;
pub mod error;
pub mod debug;

pub use protocol::{
    subjects, ClientRole, FieldDef, FieldKind, SchemaAssignment, SessionId, ShapeDef,
    SCHEMA_HEADER,
};

pub use config::{
    AgentConfig, DEFAULT_HOST, DEFAULT_LEARNING_FACTOR,
};

pub use control::{
    ConnectionManager, ControlTransport, MemoryControlPlane, SubscriptionHandler, SubscriptionId,
};

#[cfg(feature = "async")]
pub use control::AsyncControlTransport;

pub use descriptor::SchemaDescriptor;

pub use cache::SchemaCache;

pub use counters::{ClientCounters, CounterSnapshot};

pub use report::{ClientIdentity, ErrorReporter};

pub use session::{
    ClientSession, ConsumeOutcome, ProduceOutcome, ProducerState,
};

pub use adapter::{
    DecodeDelegate, EncodeDelegate, RecordHeaders, ReducingDeserializer, ReducingSerializer,
};

pub use error::{
    ReduceError, Result,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_payload, trace_reduction, trace_learning, trace_state,
    trace_control_send, trace_control_receive,
    format_bytes,
};
