//! Service definitions: the immutable blueprints instances are created from.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::descriptors::Descriptor;
use crate::error::{ServiceError, ServiceResult};
use crate::method::{Method, Value};

/// Field names claimed by the instance surface itself.
///
/// A blueprint using any of these is rejected when the definition is built.
pub const RESERVED_FIELDS: [&str; 5] = ["container", "reset", "destroy", "dispatch", "subscribe"];

/// Identity and ordering metadata passed to [`Registry::declare`](crate::Registry::declare).
///
/// # Examples
///
/// ```
/// use ferrous_services::Declaration;
///
/// let decl = Declaration::new("session").order(-1000).version(3);
/// assert_eq!(decl.identifier(), "session");
/// ```
#[derive(Debug, Clone)]
pub struct Declaration {
    identifier: String,
    order: i64,
    version: Option<u32>,
}

impl Declaration {
    /// Starts a declaration with the default order `0` and no version.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            order: 0,
            version: None,
        }
    }

    /// Position used by [`Container::invoke_linear`](crate::Container::invoke_linear); lower runs first.
    pub fn order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    /// Version used in persistence keys.
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// The service identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// One blueprint entry.
#[derive(Debug, Clone)]
pub enum Field {
    /// Data field with its default value
    Value(Value),
    /// Callable method
    Method(Method),
}

/// Per-field options recorded by a descriptor decorator.
///
/// Each plugin stores its own `FieldOptions<T>` in the definition so it can
/// find the fields it must instrument when an instance is created.
#[derive(Debug, Clone)]
pub struct FieldOptions<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for FieldOptions<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> FieldOptions<T> {
    /// Records options for `field`, replacing earlier options for the same field.
    pub fn insert(&mut self, field: &str, options: T) {
        match self.entries.iter_mut().find(|(name, _)| name == field) {
            Some(entry) => entry.1 = options,
            None => self.entries.push((field.to_string(), options)),
        }
    }

    /// Options for `field`, if recorded.
    pub fn get(&self, field: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, options)| options)
    }

    /// Recorded fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, options)| (name.as_str(), options))
    }

    /// Names of the recorded fields.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    fn get<T: Any>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }

    fn get_or_default<T: Any + Default + Send + Sync>(&mut self) -> &mut T {
        self.map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()))
            .downcast_mut::<T>()
            .expect("extension stored under its own TypeId")
    }
}

/// Mutable state while a blueprint is being assembled.
///
/// Descriptors receive the builder together with the field name they
/// describe; decorators use [`DefinitionBuilder::options_mut`] to record
/// per-field metadata for their plugin.
pub struct DefinitionBuilder {
    identifier: String,
    fields: Vec<(String, Field)>,
    extensions: Extensions,
    error: Option<ServiceError>,
}

impl DefinitionBuilder {
    pub(crate) fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            fields: Vec::new(),
            extensions: Extensions::default(),
            error: None,
        }
    }

    /// Identifier of the service being declared.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Adds a field produced by `descriptor`.
    ///
    /// Reserved names are rejected; the error surfaces from `declare`.
    pub fn field(&mut self, name: &str, descriptor: impl Descriptor) -> &mut Self {
        if RESERVED_FIELDS.contains(&name) {
            if self.error.is_none() {
                self.error = Some(ServiceError::ReservedField {
                    service: self.identifier.clone(),
                    field: name.to_string(),
                });
            }
            return self;
        }

        let field = descriptor.describe(self, name);
        match self.fields.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = field,
            None => self.fields.push((name.to_string(), field)),
        }
        self
    }

    /// Per-field options of type `T`, created on first use.
    pub fn options_mut<T: Any + Send + Sync>(&mut self) -> &mut FieldOptions<T> {
        self.extensions.get_or_default::<FieldOptions<T>>()
    }

    pub(crate) fn build(self, declaration: Declaration, sequence: u64) -> ServiceResult<ServiceDefinition> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(ServiceDefinition {
            inner: Arc::new(DefinitionInner {
                identifier: declaration.identifier,
                order: declaration.order,
                version: declaration.version,
                sequence,
                fields: self.fields,
                extensions: self.extensions,
            }),
        })
    }
}

struct DefinitionInner {
    identifier: String,
    order: i64,
    version: Option<u32>,
    sequence: u64,
    fields: Vec<(String, Field)>,
    extensions: Extensions,
}

/// Immutable service blueprint.
///
/// Cheap to clone; two handles are equal only if they refer to the same
/// declaration. Definitions are used as keys by the container.
#[derive(Clone)]
pub struct ServiceDefinition {
    inner: Arc<DefinitionInner>,
}

impl ServiceDefinition {
    /// Unique service identifier.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// Linear invocation order.
    pub fn order(&self) -> i64 {
        self.inner.order
    }

    /// Optional persistence version.
    pub fn version(&self) -> Option<u32> {
        self.inner.version
    }

    /// Position in declaration order within its registry.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// Blueprint fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.inner.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Looks up one blueprint field.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.inner
            .fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, field)| field)
    }

    /// A fresh copy of a data field's default value.
    pub fn default_value(&self, name: &str) -> Option<Value> {
        match self.field(name)? {
            Field::Value(value) => Some(value.clone()),
            Field::Method(_) => None,
        }
    }

    /// Per-field options of type `T` recorded at declaration time.
    pub fn options<T: Any + Send + Sync>(&self) -> Option<&FieldOptions<T>> {
        self.inner.extensions.get::<FieldOptions<T>>()
    }

    /// Key under which snapshots of an instance are persisted.
    ///
    /// `"{identifier}_{version}"`, with `":{scope}"` appended to the
    /// identifier for scoped instances. A missing version counts as `0`.
    pub fn persistence_key(&self, scope: Option<&str>) -> String {
        let version = self.inner.version.unwrap_or(0);
        match scope {
            Some(scope) => format!("{}:{}_{}", self.inner.identifier, scope, version),
            None => format!("{}_{}", self.inner.identifier, version),
        }
    }

    /// True if both handles refer to the same declaration.
    pub fn ptr_eq(&self, other: &ServiceDefinition) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ServiceDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ServiceDefinition {}

impl Hash for ServiceDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("identifier", &self.inner.identifier)
            .field("order", &self.inner.order)
            .field("version", &self.inner.version)
            .field("fields", &self.inner.fields.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{method, value};
    use serde_json::json;

    #[test]
    fn builder_keeps_declaration_order_and_replaces_duplicates() {
        let mut builder = DefinitionBuilder::new("svc");
        builder.field("a", value(1));
        builder.field("b", value(2));
        builder.field("a", value(3));

        let def = builder.build(Declaration::new("svc"), 0).unwrap();
        let names: Vec<&str> = def.fields().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(def.default_value("a"), Some(json!(3)));
    }

    #[test]
    fn reserved_names_are_rejected() {
        for reserved in RESERVED_FIELDS {
            let mut builder = DefinitionBuilder::new("svc");
            builder.field(reserved, value(1));
            let err = builder.build(Declaration::new("svc"), 0).unwrap_err();
            assert_eq!(
                err,
                ServiceError::ReservedField {
                    service: "svc".to_string(),
                    field: reserved.to_string(),
                }
            );
        }
    }

    #[test]
    fn methods_have_no_default_value() {
        let mut builder = DefinitionBuilder::new("svc");
        builder.field("run", method(|_, _| async { Ok(json!(null)) }));
        let def = builder.build(Declaration::new("svc"), 0).unwrap();
        assert!(matches!(def.field("run"), Some(Field::Method(_))));
        assert_eq!(def.default_value("run"), None);
    }

    #[test]
    fn persistence_key_includes_version_and_scope() {
        let def = DefinitionBuilder::new("prefs")
            .build(Declaration::new("prefs").version(2), 0)
            .unwrap();
        assert_eq!(def.persistence_key(None), "prefs_2");
        assert_eq!(def.persistence_key(Some("tab-1")), "prefs:tab-1_2");

        let unversioned = DefinitionBuilder::new("x").build(Declaration::new("x"), 1).unwrap();
        assert_eq!(unversioned.persistence_key(None), "x_0");
    }
}
