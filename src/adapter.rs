//! Thin wrappers that plug the engine into a host serialization framework.
//! The host's own serializer/deserializer is held as a byte-level delegate
//! resolved once at configuration time; the engine only ever transforms the
//! bytes around it.

use crate::config::AgentConfig;
use crate::control::ControlTransport;
use crate::debug;
use crate::error::Result;
use crate::protocol::{ClientRole, SCHEMA_HEADER};
use crate::session::{ClientSession, ConsumeOutcome};
use ahash::AHashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// The host's original value-to-bytes serializer.
pub trait EncodeDelegate<T> {
    fn configure(&mut self, _configs: &AHashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn encode(&mut self, topic: &str, value: &T) -> Result<Vec<u8>>;

    fn close(&mut self) {}
}

/// The host's original bytes-to-value deserializer.
pub trait DecodeDelegate<T> {
    fn configure(&mut self, _configs: &AHashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self, topic: &str, data: &[u8]) -> Result<T>;

    fn close(&mut self) {}
}

/// Message header access, as exposed by the host framework.
pub trait RecordHeaders {
    fn get(&self, key: &str) -> Option<&[u8]>;
    fn insert(&mut self, key: &str, value: Vec<u8>);
}

impl RecordHeaders for AHashMap<String, Vec<u8>> {
    fn get(&self, key: &str) -> Option<&[u8]> {
        AHashMap::get(self, key).map(|v| v.as_slice())
    }

    fn insert(&mut self, key: &str, value: Vec<u8>) {
        AHashMap::insert(self, key.to_string(), value);
    }
}

/// Producer-side wrapper: delegate first, then the engine's produce path.
/// Engine initialization failure leaves the wrapper in delegate-only
/// passthrough mode; the host's serialize calls are never affected.
pub struct ReducingSerializer<T, D: EncodeDelegate<T>> {
    delegate: D,
    session: Option<ClientSession>,
    _marker: PhantomData<fn(&T)>,
}

impl<T, D: EncodeDelegate<T>> ReducingSerializer<T, D> {
    pub fn new(delegate: D) -> Self {
        Self {
            delegate,
            session: None,
            _marker: PhantomData,
        }
    }

    /// Resolve configuration and connect the engine. Delegate configuration
    /// errors propagate (the host cannot run without its serializer);
    /// engine errors do not.
    pub fn configure(
        &mut self,
        configs: &AHashMap<String, String>,
        transport: Arc<dyn ControlTransport>,
    ) -> Result<()> {
        self.delegate.configure(configs)?;
        self.session = build_session(configs, ClientRole::Producer, transport);
        Ok(())
    }

    pub fn serialize(
        &mut self,
        topic: &str,
        headers: &mut dyn RecordHeaders,
        value: &T,
    ) -> Result<Vec<u8>> {
        let raw = self.delegate.encode(topic, value)?;

        let Some(session) = &self.session else {
            return Ok(raw);
        };

        let outcome = session.handle_produce(&raw);
        if let Some(schema_id) = outcome.schema_id {
            headers.insert(SCHEMA_HEADER, schema_id.into_bytes());
        }

        Ok(outcome.payload.to_vec())
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    pub fn close(&mut self) {
        self.delegate.close();
        if let Some(session) = &self.session {
            session.close();
        }
    }
}

/// Consumer-side wrapper: the engine expands tagged payloads before the
/// delegate runs; untagged payloads pass straight through.
pub struct ReducingDeserializer<T, D: DecodeDelegate<T>> {
    delegate: D,
    session: Option<ClientSession>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D: DecodeDelegate<T>> ReducingDeserializer<T, D> {
    pub fn new(delegate: D) -> Self {
        Self {
            delegate,
            session: None,
            _marker: PhantomData,
        }
    }

    pub fn configure(
        &mut self,
        configs: &AHashMap<String, String>,
        transport: Arc<dyn ControlTransport>,
    ) -> Result<()> {
        self.delegate.configure(configs)?;
        self.session = build_session(configs, ClientRole::Consumer, transport);
        Ok(())
    }

    /// Returns `Ok(None)` for the one undeliverable case: a tagged payload
    /// whose schema cannot be resolved at all.
    pub fn deserialize(
        &mut self,
        topic: &str,
        headers: &dyn RecordHeaders,
        data: &[u8],
    ) -> Result<Option<T>> {
        let schema_id = headers
            .get(SCHEMA_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .map(|s| s.to_string());

        let Some(session) = &self.session else {
            return self.delegate.decode(topic, data).map(Some);
        };

        match session.handle_consume(data, schema_id.as_deref()) {
            ConsumeOutcome::Decoded(bytes) | ConsumeOutcome::Passthrough(bytes) => {
                self.delegate.decode(topic, &bytes).map(Some)
            }
            ConsumeOutcome::Undeliverable => Ok(None),
        }
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    pub fn close(&mut self) {
        self.delegate.close();
        if let Some(session) = &self.session {
            session.close();
        }
    }
}

/// Build a session from the host's config map. Any failure (missing token,
/// unreachable coordinator) yields a disabled passthrough session instead
/// of surfacing an error to the host.
fn build_session(
    configs: &AHashMap<String, String>,
    role: ClientRole,
    transport: Arc<dyn ControlTransport>,
) -> Option<ClientSession> {
    let config = match AgentConfig::from_map(configs, role) {
        Ok(config) => config,
        Err(e) => {
            debug::trace_state(&format!("disabled ({})", e));
            return Some(ClientSession::disabled(role));
        }
    };

    match ClientSession::connect(config, role, transport) {
        Ok(session) => Some(session),
        Err(e) => {
            debug::trace_state(&format!("disabled ({})", e));
            Some(ClientSession::disabled(role))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::TOKEN_KEY;
    use crate::control::MemoryControlPlane;
    use crate::descriptor::SchemaDescriptor;
    use crate::error::ReduceError;
    use crate::protocol::{
        subjects, FieldDef, FieldKind, RegisterClientReply, SchemaAssignment, SessionId,
        ShapeDef,
    };

    const PAYLOAD: &[u8] = br#"{"id": 7, "name": "probe"}"#;

    /// Delegate that hands bytes through unchanged.
    struct RawDelegate;

    impl EncodeDelegate<Vec<u8>> for RawDelegate {
        fn encode(&mut self, _topic: &str, value: &Vec<u8>) -> Result<Vec<u8>> {
            Ok(value.clone())
        }
    }

    impl DecodeDelegate<Vec<u8>> for RawDelegate {
        fn decode(&mut self, _topic: &str, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    struct FailingDelegate;

    impl EncodeDelegate<Vec<u8>> for FailingDelegate {
        fn configure(&mut self, _configs: &AHashMap<String, String>) -> Result<()> {
            Err(ReduceError::Delegate("bad delegate config".to_string()))
        }

        fn encode(&mut self, _topic: &str, value: &Vec<u8>) -> Result<Vec<u8>> {
            Ok(value.clone())
        }
    }

    fn shape() -> ShapeDef {
        ShapeDef {
            fields: vec![
                FieldDef::new("id", FieldKind::Int),
                FieldDef::new("name", FieldKind::String),
            ],
        }
    }

    fn scripted_plane(session: u64) -> Arc<MemoryControlPlane> {
        let plane = MemoryControlPlane::new();
        plane.respond(subjects::CLIENT_REGISTER, move |_, _| {
            serde_json::to_vec(&RegisterClientReply {
                session_id: SessionId(session),
                reduction_enabled: true,
                learning_factor: None,
            })
            .ok()
        });
        plane.respond("schema.register.*", |_, _| {
            serde_json::to_vec(&SchemaAssignment {
                schema_id: "s1".to_string(),
                shape: shape(),
            })
            .ok()
        });
        plane
    }

    fn producer_configs(factor: u32) -> AHashMap<String, String> {
        let mut configs = AHashMap::new();
        configs.insert(TOKEN_KEY.to_string(), "tok".to_string());
        configs.insert(
            crate::config::LEARNING_FACTOR_KEY.to_string(),
            factor.to_string(),
        );
        configs
    }

    #[test]
    fn test_serializer_tags_reduced_messages() {
        let plane = scripted_plane(7);
        let mut serializer = ReducingSerializer::new(RawDelegate);
        serializer
            .configure(&producer_configs(1), plane.clone())
            .unwrap();

        let mut headers = AHashMap::new();
        let first = serializer
            .serialize("t", &mut headers, &PAYLOAD.to_vec())
            .unwrap();
        assert_eq!(first, PAYLOAD);
        assert!(RecordHeaders::get(&headers, SCHEMA_HEADER).is_none());

        let mut headers = AHashMap::new();
        let second = serializer
            .serialize("t", &mut headers, &PAYLOAD.to_vec())
            .unwrap();
        assert!(second.len() < PAYLOAD.len());
        assert_eq!(
            RecordHeaders::get(&headers, SCHEMA_HEADER),
            Some(b"s1".as_slice())
        );

        serializer.close();
    }

    #[test]
    fn test_serializer_without_token_is_passthrough() {
        let plane = scripted_plane(7);
        let mut serializer = ReducingSerializer::new(RawDelegate);
        serializer
            .configure(&AHashMap::new(), plane.clone())
            .unwrap();

        let mut headers = AHashMap::new();
        for _ in 0..5 {
            let out = serializer
                .serialize("t", &mut headers, &PAYLOAD.to_vec())
                .unwrap();
            assert_eq!(out, PAYLOAD);
        }

        assert!(RecordHeaders::get(&headers, SCHEMA_HEADER).is_none());
        assert_eq!(plane.requests_to(subjects::CLIENT_REGISTER), 0);
    }

    #[test]
    fn test_serializer_with_unreachable_coordinator_is_passthrough() {
        let plane = MemoryControlPlane::new();
        let mut serializer = ReducingSerializer::new(RawDelegate);
        serializer
            .configure(&producer_configs(1), plane)
            .unwrap();

        let mut headers = AHashMap::new();
        let out = serializer
            .serialize("t", &mut headers, &PAYLOAD.to_vec())
            .unwrap();

        assert_eq!(out, PAYLOAD);
        assert!(RecordHeaders::get(&headers, SCHEMA_HEADER).is_none());
    }

    #[test]
    fn test_delegate_configure_errors_propagate() {
        let plane = scripted_plane(7);
        let mut serializer = ReducingSerializer::new(FailingDelegate);

        assert!(serializer.configure(&producer_configs(1), plane).is_err());
    }

    #[test]
    fn test_deserializer_expands_tagged_messages() {
        let plane = scripted_plane(9);
        plane.respond("schema.get.*", |_, payload| {
            let request: crate::protocol::GetSchemaRequest =
                serde_json::from_slice(payload).ok()?;
            serde_json::to_vec(&crate::protocol::GetSchemaReply::Found {
                schema_id: request.schema_id,
                shape: shape(),
            })
            .ok()
        });

        let mut deserializer = ReducingDeserializer::new(RawDelegate);
        deserializer
            .configure(&AHashMap::new(), plane)
            .unwrap();

        let descriptor = SchemaDescriptor::compile("s1", &shape()).unwrap();
        let reduced = codec::encode(PAYLOAD, &descriptor).unwrap();

        let mut headers = AHashMap::new();
        RecordHeaders::insert(&mut headers, SCHEMA_HEADER, b"s1".to_vec());

        let value = deserializer
            .deserialize("t", &headers, &reduced)
            .unwrap()
            .unwrap();

        let output: serde_json::Value = serde_json::from_slice(&value).unwrap();
        let input: serde_json::Value = serde_json::from_slice(PAYLOAD).unwrap();
        assert_eq!(input, output);

        deserializer.close();
    }

    #[test]
    fn test_deserializer_passes_untagged_through() {
        let plane = scripted_plane(9);
        let mut deserializer = ReducingDeserializer::new(RawDelegate);
        deserializer
            .configure(&AHashMap::new(), plane)
            .unwrap();

        let headers = AHashMap::new();
        let value = deserializer
            .deserialize("t", &headers, PAYLOAD)
            .unwrap()
            .unwrap();

        assert_eq!(value, PAYLOAD);
    }

    #[test]
    fn test_deserializer_returns_none_for_unresolvable_schema() {
        let plane = scripted_plane(9);
        plane.respond("schema.get.*", |_, payload| {
            let request: crate::protocol::GetSchemaRequest =
                serde_json::from_slice(payload).ok()?;
            serde_json::to_vec(&crate::protocol::GetSchemaReply::NotFound {
                schema_id: request.schema_id,
            })
            .ok()
        });

        let mut deserializer = ReducingDeserializer::new(RawDelegate);
        deserializer
            .configure(&AHashMap::new(), plane)
            .unwrap();

        let mut headers = AHashMap::new();
        RecordHeaders::insert(&mut headers, SCHEMA_HEADER, b"abc".to_vec());

        let value = deserializer
            .deserialize("t", &headers, b"\x93\x01\x02\x03")
            .unwrap();

        assert!(value.is_none());
        let stats = deserializer.session().unwrap().stats();
        assert_eq!(stats.messages_consumed_failed, 1);
    }

    #[test]
    fn test_unconfigured_adapters_are_delegate_only() {
        let mut serializer = ReducingSerializer::new(RawDelegate);
        let mut headers = AHashMap::new();
        let out = serializer
            .serialize("t", &mut headers, &PAYLOAD.to_vec())
            .unwrap();
        assert_eq!(out, PAYLOAD);

        let mut deserializer = ReducingDeserializer::new(RawDelegate);
        let value = deserializer
            .deserialize("t", &headers, PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(value, PAYLOAD);
    }
}
