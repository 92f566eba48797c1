use crate::error::{ReduceError, Result};
use crate::protocol::{FieldKind, ShapeDef};

/// A compiled schema: the canonical schema id plus the validated field
/// layout the codec encodes against. Immutable once compiled; shared
/// read-only across concurrent encode/decode calls via `Arc`.
#[derive(Debug)]
pub struct SchemaDescriptor {
    schema_id: String,
    root: Shape,
}

#[derive(Debug)]
pub(crate) struct Shape {
    pub(crate) fields: Vec<CompiledField>,
}

#[derive(Debug)]
pub(crate) struct CompiledField {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) optional: bool,
    pub(crate) nested: Option<Shape>,
}

impl SchemaDescriptor {
    /// Compile a wire shape definition into a descriptor.
    ///
    /// Rejects empty shapes, duplicate field names, object fields without a
    /// nested shape, and nested shapes on non-object fields.
    pub fn compile(schema_id: impl Into<String>, def: &ShapeDef) -> Result<Self> {
        let schema_id = schema_id.into();
        if schema_id.is_empty() {
            return Err(ReduceError::InvalidSchema("schema id is empty".to_string()));
        }

        Ok(Self {
            schema_id,
            root: compile_shape(&def.fields)?,
        })
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn field_count(&self) -> usize {
        self.root.fields.len()
    }

    pub(crate) fn root(&self) -> &Shape {
        &self.root
    }
}

fn compile_shape(defs: &[crate::protocol::FieldDef]) -> Result<Shape> {
    if defs.is_empty() {
        return Err(ReduceError::InvalidSchema("shape has no fields".to_string()));
    }

    let mut fields = Vec::with_capacity(defs.len());

    for def in defs {
        if def.name.is_empty() {
            return Err(ReduceError::InvalidSchema("field name is empty".to_string()));
        }

        if fields.iter().any(|f: &CompiledField| f.name == def.name) {
            return Err(ReduceError::InvalidSchema(
                format!("duplicate field '{}'", def.name)
            ));
        }

        let nested = match (def.kind, &def.fields) {
            (FieldKind::Object, Some(children)) => Some(compile_shape(children)?),
            (FieldKind::Object, None) => {
                return Err(ReduceError::InvalidSchema(
                    format!("object field '{}' has no nested shape", def.name)
                ));
            }
            (_, Some(_)) => {
                return Err(ReduceError::InvalidSchema(
                    format!("field '{}' is not an object but has a nested shape", def.name)
                ));
            }
            (_, None) => None,
        };

        fields.push(CompiledField {
            name: def.name.clone(),
            kind: def.kind,
            optional: def.optional,
            nested,
        });
    }

    Ok(Shape { fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldDef;

    #[test]
    fn test_compile_flat_shape() {
        let def = ShapeDef {
            fields: vec![
                FieldDef::new("id", FieldKind::Int),
                FieldDef::new("name", FieldKind::String).optional(),
            ],
        };

        let descriptor = SchemaDescriptor::compile("s1", &def).unwrap();

        assert_eq!(descriptor.schema_id(), "s1");
        assert_eq!(descriptor.field_count(), 2);
        assert!(descriptor.root().fields[1].optional);
    }

    #[test]
    fn test_compile_nested_shape() {
        let def = ShapeDef {
            fields: vec![FieldDef::new("pos", FieldKind::Object).with_fields(vec![
                FieldDef::new("x", FieldKind::Float),
                FieldDef::new("y", FieldKind::Float),
            ])],
        };

        let descriptor = SchemaDescriptor::compile("s1", &def).unwrap();
        let nested = descriptor.root().fields[0].nested.as_ref().unwrap();

        assert_eq!(nested.fields.len(), 2);
    }

    #[test]
    fn test_compile_rejects_duplicate_fields() {
        let def = ShapeDef {
            fields: vec![
                FieldDef::new("id", FieldKind::Int),
                FieldDef::new("id", FieldKind::String),
            ],
        };

        assert!(SchemaDescriptor::compile("s1", &def).is_err());
    }

    #[test]
    fn test_compile_rejects_object_without_shape() {
        let def = ShapeDef {
            fields: vec![FieldDef::new("pos", FieldKind::Object)],
        };

        assert!(SchemaDescriptor::compile("s1", &def).is_err());
    }

    #[test]
    fn test_compile_rejects_nested_shape_on_scalar() {
        let def = ShapeDef {
            fields: vec![FieldDef::new("id", FieldKind::Int)
                .with_fields(vec![FieldDef::new("x", FieldKind::Int)])],
        };

        assert!(SchemaDescriptor::compile("s1", &def).is_err());
    }

    #[test]
    fn test_compile_rejects_empty_shape() {
        let def = ShapeDef { fields: vec![] };

        assert!(SchemaDescriptor::compile("s1", &def).is_err());
    }

    #[test]
    fn test_compile_rejects_empty_schema_id() {
        let def = ShapeDef {
            fields: vec![FieldDef::new("id", FieldKind::Int)],
        };

        assert!(SchemaDescriptor::compile("", &def).is_err());
    }
}
