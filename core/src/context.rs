//! Literalization and deliteralization: converting a live object graph into hashable,
//! persistable `Literal`s and back, reentrant-idempotently, through a shared `Context`.
use crate::error::{Error, Result};
use crate::hash::{hash_value, Hash, Value};
use crate::object::{
    ClassRegistry, DeliteralizedField, Dependency, DependencyKind, FieldValue, HashReference,
    HashedObject, Literal, Resources,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const TYPE_OBJECT: &str = "hashed_object";
const TYPE_DEPENDENCY: &str = "hashed_object_dependency";
const TYPE_REFERENCE: &str = "hashed_object_reference";

/// The working set shared across one literalize/deliteralize pass: discovered literals, the
/// live objects they were built from or reconstructed into, the roots literalized so far, and
/// an optional aliasing table for reusing already-live instances.
#[derive(Default)]
pub struct Context {
    /// Literals discovered so far, keyed by hash.
    pub literals: HashMap<Hash, Literal>,
    /// Live objects, keyed by hash. Populated by both literalize (the object literalized) and
    /// deliteralize (the object reconstructed), so a context can be used for either direction.
    pub objects: HashMap<Hash, Arc<dyn HashedObject>>,
    /// Hashes literalized or deliteralized directly by the caller (as opposed to discovered as
    /// a dependency).
    pub root_hashes: Vec<Hash>,
    /// Optional aliasing table consulted before constructing a new instance.
    pub resources: Option<Resources>,
    /// Hashes in the order their literals were completed: every dependency appears before the
    /// object that embeds it. A `Store` walks this order to persist in dependency order.
    pub literalize_order: Vec<Hash>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context seeded with a `Resources` aliasing table.
    pub fn with_resources(resources: Resources) -> Self {
        Self {
            resources: Some(resources),
            ..Self::default()
        }
    }

    fn aliased(&self, hash: &Hash) -> Option<Arc<dyn HashedObject>> {
        self.resources
            .as_ref()
            .and_then(|r| r.aliasing.get(hash).cloned())
    }

    /// Literalizes `obj` as a root of this context: walks its fields, computes its hash,
    /// records its literal and dependencies, and returns the hash. `obj` is moved into the
    /// context's object table (or replaced by an aliased instance of the same hash).
    pub fn literalize_root(&mut self, obj: Box<dyn HashedObject>) -> Result<Hash> {
        let hash = self.literalize(obj, "")?;
        self.root_hashes.push(hash);
        Ok(hash)
    }

    /// Literalizes `obj` at `path` (empty string for a root), recursing into embedded children
    /// and collecting their transitive dependencies into the returned literal's dependency set.
    pub fn literalize(&mut self, obj: Box<dyn HashedObject>, path: &str) -> Result<Hash> {
        let mut dependencies = Vec::new();
        let mut field_values = BTreeMap::new();
        for (name, field) in obj.fields() {
            if name.starts_with('_') {
                continue;
            }
            let field_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", path, name)
            };
            let value = self.literalize_field(field, &field_path, &mut dependencies)?;
            field_values.insert(name, value);
        }

        // An authored object's Identity is literalized into this same context (not just
        // referenced by hash) so that `Store::persist_one` can find it in `ctx.objects` and
        // actually sign with it. A type that only overrides `author()` (not `author_identity`)
        // still gets a correct dependency and `literal.author`, just without live-signing.
        let author_hash = if let Some(identity) = obj.author_identity() {
            let identity_box: Box<dyn HashedObject> = Box::new((*identity).clone());
            let identity_hash = self.literalize(identity_box, "_author")?;
            if let Some(identity_literal) = self.literals.get(&identity_hash).cloned() {
                for d in identity_literal.dependencies {
                    dependencies.push(Dependency {
                        path: format!("_author.{}", d.path),
                        hash: d.hash,
                        class_name: d.class_name,
                        kind: d.kind,
                        direct: false,
                    });
                }
            }
            dependencies.push(Dependency {
                path: "_author".to_string(),
                hash: identity_hash,
                class_name: "Identity".to_string(),
                kind: DependencyKind::Reference,
                direct: true,
            });
            Some(identity_hash)
        } else if let Some(author_hash) = obj.author() {
            dependencies.push(Dependency {
                path: "_author".to_string(),
                hash: author_hash,
                class_name: "Identity".to_string(),
                kind: DependencyKind::Reference,
                direct: true,
            });
            Some(author_hash)
        } else {
            None
        };

        let mut object_value = BTreeMap::new();
        object_value.insert("_type".to_string(), Value::from(TYPE_OBJECT));
        object_value.insert("_class".to_string(), Value::from(obj.class_name()));
        object_value.insert("_fields".to_string(), Value::Object(field_values));
        object_value.insert(
            "_flags".to_string(),
            Value::from(obj.flags().into_iter().map(Value::from).collect::<Vec<_>>()),
        );
        let value = Value::Object(object_value);

        let hash = match obj.custom_hash() {
            Some(h) => h,
            None => hash_value(&value)?,
        };

        let literal = Literal {
            hash,
            value,
            dependencies,
            author: author_hash,
            signature: None,
        };

        let live = self.aliased(&hash).unwrap_or_else(|| Arc::from(obj));
        let already_known = self.literals.contains_key(&hash);
        self.literals.insert(hash, literal);
        self.objects.insert(hash, live);
        if !already_known {
            self.literalize_order.push(hash);
        }
        Ok(hash)
    }

    fn literalize_field(
        &mut self,
        field: FieldValue,
        path: &str,
        dependencies: &mut Vec<Dependency>,
    ) -> Result<Value> {
        match field {
            FieldValue::Value(v) => Ok(v),
            FieldValue::Child(child) => {
                let class_name = child.class_name().to_string();
                let child_hash = self.literalize(child, path)?;
                if let Some(child_literal) = self.literals.get(&child_hash).cloned() {
                    for d in child_literal.dependencies {
                        dependencies.push(Dependency {
                            path: format!("{}.{}", path, d.path),
                            hash: d.hash,
                            class_name: d.class_name,
                            kind: d.kind,
                            direct: false,
                        });
                    }
                }
                dependencies.push(Dependency {
                    path: path.to_string(),
                    hash: child_hash,
                    class_name,
                    kind: DependencyKind::Literal,
                    direct: true,
                });
                let mut placeholder = BTreeMap::new();
                placeholder.insert("_type".to_string(), Value::from(TYPE_DEPENDENCY));
                placeholder.insert("_hash".to_string(), Value::from(child_hash));
                Ok(Value::Object(placeholder))
            }
            FieldValue::Reference(r) => {
                dependencies.push(Dependency {
                    path: path.to_string(),
                    hash: r.hash,
                    class_name: r.class_name.clone(),
                    kind: DependencyKind::Reference,
                    direct: true,
                });
                let mut placeholder = BTreeMap::new();
                placeholder.insert("_type".to_string(), Value::from(TYPE_REFERENCE));
                placeholder.insert("_hash".to_string(), Value::from(r.hash));
                placeholder.insert("_class".to_string(), Value::from(r.class_name));
                Ok(Value::Object(placeholder))
            }
            FieldValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let item_path = format!("{}.{}", path, i);
                    out.push(self.literalize_field(item, &item_path, dependencies)?);
                }
                Ok(Value::Array(out))
            }
            FieldValue::Collection(items) => {
                // Members are canonically ordered by hash, not by position, so unlike `Array`
                // each member's dependency is recorded at the bare collection path rather than
                // an indexed one. This is what lets the store's backend-index searches (e.g.
                // `search_by_reference("causalOps", hash, ...)`) find a specific member by hash.
                let mut out = Vec::with_capacity(items.len());
                for item in items.into_iter() {
                    out.push(self.literalize_field(item, path, dependencies)?);
                }
                Ok(Value::Array(out))
            }
        }
    }

    /// Reconstructs the object at `hash`, recursing into its embedded (non-reference)
    /// dependencies first. Idempotent: a hash already present in `objects` is returned as-is.
    pub fn deliteralize(&mut self, hash: Hash, registry: &ClassRegistry) -> Result<Arc<dyn HashedObject>> {
        if let Some(existing) = self.objects.get(&hash) {
            return Ok(existing.clone());
        }
        if let Some(aliased) = self.aliased(&hash) {
            self.objects.insert(hash, aliased.clone());
            return Ok(aliased);
        }

        let literal = self
            .literals
            .get(&hash)
            .cloned()
            .ok_or_else(|| Error::InvalidLiteral(format!("no literal available for {}", hash)))?;

        for dep in literal
            .dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Literal)
        {
            if !self.objects.contains_key(&dep.hash) {
                self.deliteralize(dep.hash, registry)?;
            }
        }

        let object_map = match &literal.value {
            Value::Object(m) => m,
            _ => return Err(Error::InvalidLiteral(format!("{} is not an object literal", hash))),
        };
        let class_name = match object_map.get("_class") {
            Some(Value::Str(s)) => s.clone(),
            _ => return Err(Error::InvalidLiteral(format!("{} has no _class", hash))),
        };
        let fields_value = match object_map.get("_fields") {
            Some(Value::Object(m)) => m.clone(),
            _ => return Err(Error::InvalidLiteral(format!("{} has no _fields", hash))),
        };

        let mut boxed = registry.construct(&class_name)?;
        let mut assigned = Vec::with_capacity(fields_value.len());
        for (name, value) in fields_value {
            let field = self.value_to_field(&value, registry)?;
            assigned.push((name, field));
        }
        boxed.set_fields(assigned)?;
        boxed.init();

        let live: Arc<dyn HashedObject> = Arc::from(boxed);
        self.objects.insert(hash, live.clone());
        Ok(live)
    }

    fn value_to_field(&mut self, value: &Value, registry: &ClassRegistry) -> Result<DeliteralizedField> {
        match value {
            Value::Object(map) if is_tagged(map, TYPE_DEPENDENCY) => {
                let hash = tagged_hash(map)?;
                let obj = self.deliteralize(hash, registry)?;
                Ok(DeliteralizedField::Child(obj))
            }
            Value::Object(map) if is_tagged(map, TYPE_REFERENCE) => {
                let hash = tagged_hash(map)?;
                let class_name = match map.get("_class") {
                    Some(Value::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                Ok(DeliteralizedField::Reference(HashReference::new(hash, class_name)))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.value_to_field(item, registry)?);
                }
                Ok(DeliteralizedField::Array(out))
            }
            other => Ok(DeliteralizedField::Value(other.clone())),
        }
    }

    /// The spec-level Clone operation (§4.2): literalizes `obj.clone_box()` into a fresh
    /// context of its own and deliteralizes it back out, so the result is a structurally
    /// identical but independently owned object graph, sharing no live state with `obj`.
    pub fn clone_object(
        obj: &dyn HashedObject,
        registry: &ClassRegistry,
    ) -> Result<Arc<dyn HashedObject>> {
        let mut ctx = Context::new();
        let hash = ctx.literalize_root(obj.clone_box())?;
        ctx.deliteralize(hash, registry)
    }
}

fn is_tagged(map: &BTreeMap<String, Value>, expected_type: &str) -> bool {
    matches!(map.get("_type"), Some(Value::Str(t)) if t == expected_type)
}

fn tagged_hash(map: &BTreeMap<String, Value>) -> Result<Hash> {
    match map.get("_hash") {
        Some(Value::Str(s)) => s
            .parse()
            .map_err(|_| Error::InvalidLiteral(format!("malformed hash {}", s))),
        _ => Err(Error::InvalidLiteral("dependency placeholder has no _hash".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::FieldValue;
    use std::any::Any;

    #[derive(Clone)]
    struct Leaf {
        id: Option<String>,
        tag: String,
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
            vec![("tag".to_string(), FieldValue::Value(Value::from(self.tag.as_str())))]
        }
        fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
            for (name, field) in fields {
                if name == "tag" {
                    if let DeliteralizedField::Value(Value::Str(s)) = field {
                        self.tag = s;
                    }
                }
            }
            Ok(())
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
        leaf: Option<Leaf>,
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
        fn fields(&self) -> Vec<(String, FieldValue)> {
            vec![(
                "leaf".to_string(),
                FieldValue::Child(Box::new(self.leaf.clone().expect("leaf present"))),
            )]
        }
        fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
            for (name, field) in fields {
                if name == "leaf" {
                    if let DeliteralizedField::Child(obj) = field {
                        let leaf = obj.as_any().downcast_ref::<Leaf>().expect("is Leaf");
                        self.leaf = Some(leaf.clone());
                    }
                }
            }
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn clone_box(&self) -> Box<dyn HashedObject> {
            Box::new(self.clone())
        }
    }

    fn registry() -> ClassRegistry {
        let r = ClassRegistry::new();
        r.register("Leaf", || {
            Box::new(Leaf {
                id: None,
                tag: String::new(),
            })
        });
        r.register("Parent", || Box::new(Parent { id: None, leaf: None }));
        r
    }

    #[test]
    fn round_trips_a_nested_object_through_literal_and_back() {
        let registry = registry();
        let parent = Box::new(Parent {
            id: None,
            leaf: Some(Leaf {
                id: None,
                tag: "hello".to_string(),
            }),
        });
        let mut ctx = Context::new();
        let hash = ctx.literalize_root(parent).unwrap();

        let mut ctx2 = Context::new();
        ctx2.literals.insert(hash, ctx.literals.get(&hash).unwrap().clone());
        for dep in &ctx.literals.get(&hash).unwrap().dependencies {
            ctx2.literals.insert(dep.hash, ctx.literals.get(&dep.hash).unwrap().clone());
        }
        let rebuilt = ctx2.deliteralize(hash, &registry).unwrap();
        let parent = rebuilt.as_any().downcast_ref::<Parent>().unwrap();
        assert_eq!(parent.leaf.as_ref().unwrap().tag, "hello");
    }

    #[test]
    fn literalizing_twice_is_a_hash_stable_no_op() {
        let leaf_a = Box::new(Leaf {
            id: None,
            tag: "x".to_string(),
        });
        let leaf_b = Box::new(Leaf {
            id: None,
            tag: "x".to_string(),
        });
        let mut ctx = Context::new();
        let ha = ctx.literalize_root(leaf_a).unwrap();
        let hb = ctx.literalize_root(leaf_b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ctx.objects.len(), 1);
    }

    #[test]
    fn deliteralize_is_idempotent_given_a_populated_context() {
        let registry = registry();
        let leaf = Box::new(Leaf {
            id: None,
            tag: "once".to_string(),
        });
        let mut ctx = Context::new();
        let hash = ctx.literalize_root(leaf).unwrap();
        let first = ctx.deliteralize(hash, &registry).unwrap();
        let second = ctx.deliteralize(hash, &registry).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn clone_object_produces_a_structurally_identical_independent_graph() {
        let registry = registry();
        let parent = Parent {
            id: None,
            leaf: Some(Leaf {
                id: None,
                tag: "hello".to_string(),
            }),
        };
        let cloned = Context::clone_object(&parent, &registry).unwrap();
        let cloned = cloned.as_any().downcast_ref::<Parent>().unwrap();
        assert_eq!(cloned.leaf.as_ref().unwrap().tag, "hello");

        // The clone's hash matches literalizing the original directly: same content, a fresh
        // independently-owned instance.
        let mut ctx = Context::new();
        let original_hash = ctx.literalize_root(Box::new(parent)).unwrap();
        let mut clone_ctx = Context::new();
        let clone_hash = clone_ctx.literalize_root(Box::new(cloned.clone())).unwrap();
        assert_eq!(original_hash, clone_hash);
    }
}
