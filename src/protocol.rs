use serde::{Deserialize, Serialize};
use std::fmt;

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transport header carrying the schema id of a reduced message.
/// Absence of the header means the payload was not reduced.
pub const SCHEMA_HEADER: &str = "leanwire_schema";

/// Numeric session identifier assigned by the coordination service at
/// registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Producer,
    Consumer,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Producer => "producer",
            ClientRole::Consumer => "consumer",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control-plane subject construction. Session identity is threaded as an
/// explicit value and formatted in exactly one place.
pub mod subjects {
    use super::{ClientRole, SessionId};

    pub const RECONNECTION_UPDATE: &str = "control.reconnectionUpdate";
    pub const CLIENT_TYPE_UPDATE: &str = "control.clientTypeUpdate";
    pub const CLIENT_REGISTER: &str = "control.registerClient";
    pub const CLIENT_ERRORS: &str = "control.clientErrors";

    pub fn schema_update(session: SessionId) -> String {
        format!("schema.updates.{}", session)
    }

    pub fn learn_schema(session: SessionId) -> String {
        format!("schema.learn.{}", session)
    }

    pub fn register_schema(session: SessionId) -> String {
        format!("schema.register.{}", session)
    }

    pub fn get_schema(session: SessionId) -> String {
        format!("schema.get.{}", session)
    }

    pub fn clients_update(role: ClientRole, session: SessionId) -> String {
        format!("tasks.clientsUpdate.{}.{}", role.as_str(), session)
    }
}

/// Field kind of a schema shape as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    String,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldDef>>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            fields: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// Uncompiled schema shape delivered by the coordination service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeDef {
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClientRequest {
    pub token: String,
    pub role: ClientRole,
    pub sdk_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClientReply {
    pub session_id: SessionId,
    #[serde(default = "default_true")]
    pub reduction_enabled: bool,
    #[serde(default)]
    pub learning_factor: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Canonical schema id plus its shape, delivered either as the
/// register-schema reply or as a schema-update push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAssignment {
    pub schema_id: String,
    pub shape: ShapeDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSchemaRequest {
    pub schema_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GetSchemaReply {
    Found { schema_id: String, shape: ShapeDef },
    NotFound { schema_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTypeUpdate {
    pub session_id: SessionId,
    pub role: ClientRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub token: String,
    pub role: ClientRole,
    pub session_id: Option<SessionId>,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_formatting() {
        let session = SessionId(42);

        assert_eq!(subjects::schema_update(session), "schema.updates.42");
        assert_eq!(subjects::learn_schema(session), "schema.learn.42");
        assert_eq!(subjects::register_schema(session), "schema.register.42");
        assert_eq!(subjects::get_schema(session), "schema.get.42");
        assert_eq!(
            subjects::clients_update(ClientRole::Producer, session),
            "tasks.clientsUpdate.producer.42"
        );
    }

    #[test]
    fn test_register_reply_defaults() {
        let reply: RegisterClientReply =
            serde_json::from_str(r#"{"session_id": 7}"#).unwrap();

        assert_eq!(reply.session_id, SessionId(7));
        assert!(reply.reduction_enabled);
        assert!(reply.learning_factor.is_none());
    }

    #[test]
    fn test_get_schema_reply_roundtrip() {
        let reply = GetSchemaReply::NotFound {
            schema_id: "abc".to_string(),
        };

        let json = serde_json::to_vec(&reply).unwrap();
        let parsed: GetSchemaReply = serde_json::from_slice(&json).unwrap();

        match parsed {
            GetSchemaReply::NotFound { schema_id } => assert_eq!(schema_id, "abc"),
            _ => panic!("expected not_found"),
        }
    }

    #[test]
    fn test_shape_def_builder() {
        let shape = ShapeDef {
            fields: vec![
                FieldDef::new("id", FieldKind::Int),
                FieldDef::new("name", FieldKind::String).optional(),
                FieldDef::new("pos", FieldKind::Object).with_fields(vec![
                    FieldDef::new("x", FieldKind::Float),
                    FieldDef::new("y", FieldKind::Float),
                ]),
            ],
        };

        assert_eq!(shape.fields.len(), 3);
        assert!(shape.fields[1].optional);
        assert!(shape.fields[2].fields.is_some());
    }
}
