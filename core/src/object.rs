//! The hashed object abstraction: literal representation, dependency tracking, and the
//! process-wide class registry that lets deliteralization reconstruct concrete types from a
//! `_class` tag.
use crate::error::{Error, Result};
use crate::hash::{Hash, Value};
use crate::identity::Identity;
use crate::relay::MutationEventRelay;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a dependency is an embedded child (its literal travels with the parent) or a
/// `HashReference` (a pointer by hash only).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DependencyKind {
    /// The dependency's literal is embedded and must be saved alongside the parent.
    Literal,
    /// The dependency is a non-owning reference; its literal may or may not already exist.
    Reference,
}

/// One entry of a literal's dependency list.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// Field path from the literalized root to this dependency, dot-separated.
    pub path: String,
    /// Hash of the dependency.
    pub hash: Hash,
    /// Declared class name of the dependency.
    pub class_name: String,
    /// Literal vs. reference.
    pub kind: DependencyKind,
    /// `true` if this dependency is a direct field of the object being literalized, `false` if
    /// it was copied up from a nested hashed object's own dependency set.
    pub direct: bool,
}

/// A non-owning pointer to another hashed object, identified by hash and declared class.
///
/// Literalizes as a `hashed_object_reference` and contributes a direct `Reference` dependency,
/// never an embedded literal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashReference {
    /// Hash of the referenced object.
    pub hash: Hash,
    /// Declared class name of the referenced object.
    pub class_name: String,
}

impl HashReference {
    /// Builds a reference to the given hash and class.
    pub fn new(hash: Hash, class_name: impl Into<String>) -> Self {
        Self {
            hash,
            class_name: class_name.into(),
        }
    }
}

impl crate::collections::Hashable for HashReference {
    fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("_hash".to_string(), Value::from(self.hash));
        map.insert("_class".to_string(), Value::from(self.class_name.clone()));
        Value::Object(map)
    }
}

/// A field's contribution during literalization: either a plain value, an embedded child
/// object, a reference, or a nested array of any of these.
pub enum FieldValue {
    /// A value already in the canonical domain (primitives, pre-hashed strings, etc).
    Value(Value),
    /// An embedded hashed object: its full literal travels with the parent.
    Child(Box<dyn HashedObject>),
    /// A non-owning reference to another hashed object.
    Reference(HashReference),
    /// An ordered array of field values (used for plain `Vec` fields, not hashed collections).
    Array(Vec<FieldValue>),
    /// A canonically-ordered collection of field values (`HashedSet`/`HashedMap` contents,
    /// already reduced to their member representations).
    Collection(Vec<FieldValue>),
}

/// The reconstructed counterpart of `FieldValue`, produced by deliteralization.
///
/// Children come back as `Arc` because, once deliteralized, an object is shared through the
/// `Context`'s object table rather than uniquely owned the way it was during literalization.
pub enum DeliteralizedField {
    /// A plain canonical value.
    Value(Value),
    /// An embedded child, already deliteralized and resolved to a shared instance.
    Child(Arc<dyn HashedObject>),
    /// A non-owning reference, left unresolved as a hash/class pair.
    Reference(HashReference),
    /// An ordered array.
    Array(Vec<DeliteralizedField>),
    /// A canonically-ordered collection.
    Collection(Vec<DeliteralizedField>),
}

/// The normalized, hashable, persistable representation of a hashed object.
#[derive(Clone, Debug)]
pub struct Literal {
    /// This literal's own content hash.
    pub hash: Hash,
    /// The canonical value: `{_type, _class, _fields, _flags}`.
    pub value: Value,
    /// Flattened dependency list, direct and transitive.
    pub dependencies: Vec<Dependency>,
    /// Hash of the authoring Identity, if any.
    pub author: Option<Hash>,
    /// Signature over `hash` by the author's private key, hex-encoded, if any.
    pub signature: Option<String>,
}

/// Shared state a hashed object may carry: a live store/mesh handle and a context-local
/// aliasing table. Setting resources on a parent propagates to its direct subobjects.
#[derive(Clone, Default)]
pub struct Resources {
    /// Hash-to-object aliases consulted during deliteralization so that shared subgraphs
    /// resolve to the same live instance instead of being reconstructed twice.
    pub aliasing: HashMap<Hash, Arc<dyn HashedObject>>,
}

impl Resources {
    /// An empty resources record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `obj` as the live instance to reuse whenever `hash` is deliteralized.
    pub fn alias(&mut self, hash: Hash, obj: Arc<dyn HashedObject>) {
        self.aliasing.insert(hash, obj);
    }
}

/// The abstract base every content-addressed object implements.
///
/// Field literalization is generic (see `context::literalize`); concrete types only need to
/// describe their own fields, class name, and any custom hashing/validation behavior.
pub trait HashedObject: Any + Send + Sync {
    /// The `_class` tag written into this object's literal.
    fn class_name(&self) -> &str;

    /// This object's id, if one has been assigned (random or derived).
    fn id(&self) -> Option<&str>;

    /// Assigns an id. Does not itself cascade to derived fields; pair with
    /// `cascade_derived_ids`, or call `set_id_cascading`, when `derived_fields` is non-empty.
    fn set_id(&mut self, id: String);

    /// Field names whose current child's id is derived from this object's id.
    fn derived_fields(&self) -> &[&'static str] {
        &[]
    }

    /// Sets the current child named by each `derived_fields` entry to
    /// `derived_id(id, field_name)`. The default matches the empty `derived_fields` default
    /// and does nothing; concrete types that override `derived_fields` must override this too,
    /// since trait objects have no generic named-field access.
    fn cascade_derived_ids(&mut self, _id: &str) {}

    /// The spec-level `setId` operation (§4.2 "Derived fields"): assigns `id`, then cascades
    /// it into every `derived_fields` child.
    fn set_id_cascading(&mut self, id: String) {
        self.set_id(id.clone());
        self.cascade_derived_ids(&id);
    }

    /// Hash of the authoring Identity, if this object is authored.
    fn author(&self) -> Option<Hash> {
        None
    }

    /// The live Identity to literalize and sign with, if this object is authored. Distinct
    /// from `author` (a hash only): literalization needs the object itself, to embed into the
    /// context's dependency set and sign with, not just its hash.
    fn author_identity(&self) -> Option<Arc<Identity>> {
        None
    }

    /// Whether the store should sign this object's hash on save. Authored objects default to
    /// `true`; override to opt an authored-but-unsigned object out.
    fn should_sign_on_save(&self) -> bool {
        self.author().is_some()
    }

    /// Overrides `H(literal.value)` for objects whose hash must be independent of mutable
    /// fields (Identity hashes its public key only).
    fn custom_hash(&self) -> Option<Hash> {
        None
    }

    /// This object's fields, in any order (canonical ordering is applied during
    /// literalization). Field names starting with `_` must not appear here.
    fn fields(&self) -> Vec<(String, FieldValue)>;

    /// Assigns fields reconstructed from a literal back onto a freshly-constructed instance.
    /// Called once per deliteralized object, before `init`.
    ///
    /// The default rejects every assignment; concrete types that are ever deliteralized (as
    /// opposed to only ever literalized, e.g. throwaway test fixtures) must override this.
    fn set_fields(&mut self, _fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
        Err(Error::InvalidLiteral(format!(
            "{} does not support deliteralization",
            self.class_name()
        )))
    }

    /// Runs after construction from a literal, before validation.
    fn init(&mut self) {}

    /// Class-specific invariant check, run by `fromContextWithValidation` after hash and
    /// signature checks pass.
    fn validate(&self, _dependencies: &BTreeMap<Hash, Arc<dyn HashedObject>>) -> bool {
        true
    }

    /// Flags written into the literal's `_flags` array. Empty by default.
    fn flags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Upcast for downcasting concrete types back out of `Box<dyn HashedObject>`.
    fn as_any(&self) -> &dyn Any;

    /// Deep-copies this object into a freshly owned, unhashed instance. `Clone` itself isn't
    /// object-safe, so every concrete type provides this the same way: `Box::new(self.clone())`.
    /// Used by `context::clone_object` (§4.2 "Clone") to re-literalize into a fresh context.
    fn clone_box(&self) -> Box<dyn HashedObject>;

    /// This object's own lazily-subscribed mutation event relay (§4.3), if it maintains one.
    /// Types with no live-mutation observers to notify (most content-addressed values) leave
    /// this `None`.
    fn event_relay(&self) -> Option<Arc<MutationEventRelay>> {
        None
    }
}

/// The id a `derived_fields` child is assigned when its parent's id is set to `parent_id`:
/// `H("#" + parent_id + "." + field_name)` (§4.2 "Derived fields").
pub fn derived_id(parent_id: &str, field_name: &str) -> String {
    Hash::of_bytes(format!("#{}.{}", parent_id, field_name).as_bytes()).to_hex()
}

/// Testable property 3: `child`'s id is the one `derived_id` assigns for `parent_id` and
/// `field_name`.
pub fn check_derived_field(parent_id: &str, field_name: &str, child: &dyn HashedObject) -> bool {
    let expected = derived_id(parent_id, field_name);
    child.id() == Some(expected.as_str())
}

type ConstructFn = dyn Fn() -> Box<dyn HashedObject> + Send + Sync;

/// A process-wide registry mapping `_class` names to constructors, consulted by
/// `deliteralize` to instantiate the right concrete type for a literal.
#[derive(Default)]
pub struct ClassRegistry {
    constructors: RwLock<HashMap<String, Arc<ConstructFn>>>,
}

impl ClassRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a default-constructible class under `class_name`. `literalize`'s companion
    /// field-assignment step fills in the fields after construction.
    pub fn register(
        &self,
        class_name: impl Into<String>,
        ctor: impl Fn() -> Box<dyn HashedObject> + Send + Sync + 'static,
    ) {
        self.constructors
            .write()
            .insert(class_name.into(), Arc::new(ctor));
    }

    /// Looks up and invokes the constructor for `class_name`.
    pub fn construct(&self, class_name: &str) -> Result<Box<dyn HashedObject>> {
        let guard = self.constructors.read();
        match guard.get(class_name) {
            Some(ctor) => Ok(ctor()),
            None => Err(Error::UnknownClass(class_name.to_owned())),
        }
    }

    /// Whether a constructor is registered for `class_name`.
    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.read().contains_key(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Dummy {
        id: Option<String>,
        value: i64,
    }

    impl HashedObject for Dummy {
        fn class_name(&self) -> &str {
            "Dummy"
        }

        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }

        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }

        fn fields(&self) -> Vec<(String, FieldValue)> {
            vec![("value".to_string(), FieldValue::Value(Value::from(self.value)))]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn clone_box(&self) -> Box<dyn HashedObject> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn registry_round_trips_a_constructor() {
        let registry = ClassRegistry::new();
        registry.register("Dummy", || {
            Box::new(Dummy {
                id: None,
                value: 0,
            })
        });
        assert!(registry.contains("Dummy"));
        let obj = registry.construct("Dummy").unwrap();
        assert_eq!(obj.class_name(), "Dummy");
    }

    #[test]
    fn unknown_class_is_rejected() {
        let registry = ClassRegistry::new();
        assert!(matches!(
            registry.construct("Nope"),
            Err(Error::UnknownClass(_))
        ));
    }

    #[derive(Clone)]
    struct Leaf {
        id: Option<String>,
    }

    impl HashedObject for Leaf {
        fn class_name(&self) -> &str {
            "Leaf"
        }

        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }

        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }

        fn fields(&self) -> Vec<(String, FieldValue)> {
            Vec::new()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn clone_box(&self) -> Box<dyn HashedObject> {
            Box::new(self.clone())
        }
    }

    #[derive(Clone)]
    struct Parent {
        id: Option<String>,
        leaf: Leaf,
    }

    impl HashedObject for Parent {
        fn class_name(&self) -> &str {
            "Parent"
        }

        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }

        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }

        fn derived_fields(&self) -> &[&'static str] {
            &["leaf"]
        }

        fn cascade_derived_ids(&mut self, id: &str) {
            self.leaf.set_id(derived_id(id, "leaf"));
        }

        fn fields(&self) -> Vec<(String, FieldValue)> {
            Vec::new()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn clone_box(&self) -> Box<dyn HashedObject> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn set_id_cascading_derives_child_ids() {
        let mut parent = Parent {
            id: None,
            leaf: Leaf { id: None },
        };
        parent.set_id_cascading("root".to_string());
        assert_eq!(parent.id(), Some("root"));
        assert!(check_derived_field("root", "leaf", &parent.leaf));
    }

    struct Relayed {
        id: Option<String>,
        relay: Arc<MutationEventRelay>,
    }

    impl Relayed {
        fn new() -> Self {
            Self {
                id: None,
                relay: MutationEventRelay::new(8, true),
            }
        }
    }

    impl HashedObject for Relayed {
        fn class_name(&self) -> &str {
            "Relayed"
        }
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
        fn fields(&self) -> Vec<(String, FieldValue)> {
            Vec::new()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn clone_box(&self) -> Box<dyn HashedObject> {
            Box::new(Self {
                id: self.id.clone(),
                relay: self.relay.clone(),
            })
        }
        fn event_relay(&self) -> Option<Arc<MutationEventRelay>> {
            Some(self.relay.clone())
        }
    }

    #[test]
    fn event_relay_chains_a_childs_events_to_the_parent() {
        let child = Relayed::new();
        let parent = Relayed::new();
        parent
            .event_relay()
            .unwrap()
            .attach_child("child", child.event_relay().unwrap());

        let consumer = parent.event_relay().unwrap().subscribe();
        child.event_relay().unwrap().emit("child mutated");

        let event = consumer.next_if_available().unwrap();
        assert_eq!(event.path, "child");
        assert_eq!(event.description, "child mutated");
    }
}
