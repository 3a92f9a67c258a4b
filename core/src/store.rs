//! The `Store`: orchestrates save/load over a `Backend`, enforces dependency completeness,
//! signs authored objects, computes `OpHeader`s, maintains causal invalidation, and fans out
//! watch callbacks.
use crate::context::Context;
use crate::error::{Error, Result};
use crate::hash::{hash_value, Hash, Value};
use crate::identity::Identity;
use crate::mutation::{CascadedInvalidateOp, InvalidateAfterOp, MutationOp, OpHeader, StoredOp};
use crate::object::{ClassRegistry, HashReference, HashedObject, Literal};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Ascending or descending order for an index scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Order {
    /// Ascending by hash.
    Asc,
    /// Descending by hash.
    Desc,
}

/// Parameters for a backend index scan.
#[derive(Clone, Debug)]
pub struct SearchParams {
    /// Sort order.
    pub order: Order,
    /// Maximum number of results; `None` for unbounded (the `Store` still paginates internally
    /// using `StoreConfig::scan_batch_size`).
    pub limit: Option<usize>,
    /// Exclusive cursor: only hashes strictly after (or before, for `Desc`) this one.
    pub start: Option<Hash>,
}

impl SearchParams {
    /// No ordering preference beyond ascending, no limit, no cursor.
    pub fn all() -> Self {
        Self {
            order: Order::Asc,
            limit: None,
            start: None,
        }
    }

    /// A single page of up to `limit` results starting after `start`.
    pub fn page(order: Order, limit: usize, start: Option<Hash>) -> Self {
        Self {
            order,
            limit: Some(limit),
            start,
        }
    }
}

/// The terminal-ops bookkeeping a backend tracks per mutable object.
#[derive(Clone, Debug, Default)]
pub struct TerminalOps {
    /// The most recently saved op for this mutable, if any.
    pub last_op: Option<Hash>,
    /// Ops with no known successor.
    pub terminal_ops: Vec<Hash>,
}

type StoredObjectCallback = Arc<dyn Fn(&Literal) + Send + Sync>;

/// The backend contract a `Store` persists through. Implementations must make `store` atomic
/// and idempotent per `literal.hash`.
pub trait Backend: Send + Sync {
    /// Persists a literal (and, for ops, its header) atomically. Calling this twice with the
    /// same `literal.hash` must be a no-op the second time.
    fn store(&self, literal: &Literal, header: Option<&OpHeader>) -> Result<()>;

    /// Loads a literal by hash.
    fn load(&self, hash: Hash) -> Result<Option<Literal>>;

    /// Loads the causal header for an op by its op hash.
    fn load_op_header(&self, op_hash: Hash) -> Result<Option<OpHeader>>;

    /// Loads the causal header for an op by its header hash.
    fn load_op_header_by_header_hash(&self, header_hash: Hash) -> Result<Option<OpHeader>>;

    /// Loads the terminal-ops bookkeeping for a mutable object.
    fn load_terminal_ops_for_mutable(&self, mutable_hash: Hash) -> Result<Option<TerminalOps>>;

    /// Index scan by `_class`.
    fn search_by_class(&self, class_name: &str, params: SearchParams) -> Result<Vec<Literal>>;

    /// Index scan by `(path, hash)` dependency.
    fn search_by_reference(&self, path: &str, hash: Hash, params: SearchParams) -> Result<Vec<Literal>>;

    /// Index scan by `(referencing class, path, hash)`.
    fn search_by_referencing_class(
        &self,
        class_name: &str,
        path: &str,
        hash: Hash,
        params: SearchParams,
    ) -> Result<Vec<Literal>>;

    /// Registers the callback the backend invokes after every successful `store`.
    fn set_stored_object_callback(&self, callback: StoredObjectCallback);

    /// Releases any resources held by the backend.
    fn close(&self) -> Result<()>;

    /// A human-readable name for this backend instance (e.g. a replica id).
    fn name(&self) -> &str;

    /// The backend implementation's name (e.g. `"memory"`).
    fn backend_name(&self) -> &str;
}

/// Tunable, named constants the save/load algorithm otherwise hard-codes.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Page size used when walking `loadAllInvalidations`/`loadAllConsequences`/`loadAllOps`
    /// style backend scans.
    pub scan_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { scan_batch_size: 256 }
    }
}

/// Cumulative counters, mirroring the kind of stats the peer group agent keeps.
#[derive(Default)]
pub struct StoreStats {
    objects_saved: AtomicU64,
    ops_invalidated: AtomicU64,
    cascades_generated: AtomicU64,
}

/// Point-in-time snapshot of `StoreStats`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStatsSnapshot {
    /// Total literals persisted (dedup no-ops included).
    pub objects_saved: u64,
    /// Total ops found to be direct invalidation subjects.
    pub ops_invalidated: u64,
    /// Total `CascadedInvalidateOp`s synthesized.
    pub cascades_generated: u64,
}

impl StoreStats {
    fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            objects_saved: self.objects_saved.load(Ordering::Relaxed),
            ops_invalidated: self.ops_invalidated.load(Ordering::Relaxed),
            cascades_generated: self.cascades_generated.load(Ordering::Relaxed),
        }
    }
}

type Callback = Arc<dyn Fn(&Literal) + Send + Sync>;

#[derive(Default)]
struct WatchTables {
    by_class: HashMap<String, Vec<Callback>>,
    by_path_hash: HashMap<(String, Hash), Vec<Callback>>,
    by_class_path_hash: HashMap<(String, String, Hash), Vec<Callback>>,
}

/// Orchestrates literalization, persistence, and causal invalidation over a `Backend`.
pub struct Store {
    backend: Arc<dyn Backend>,
    registry: Arc<ClassRegistry>,
    config: StoreConfig,
    watches: RwLock<WatchTables>,
    stats: StoreStats,
}

impl Store {
    /// Builds a store over `backend`, wiring the backend's stored-object callback to fan out
    /// watches. Returned as an `Arc` because the backend holds a weak reference back to it.
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<ClassRegistry>, config: StoreConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            backend: backend.clone(),
            registry,
            config,
            watches: RwLock::new(WatchTables::default()),
            stats: StoreStats::default(),
        });
        let weak: Weak<Store> = Arc::downgrade(&store);
        backend.set_stored_object_callback(Arc::new(move |literal: &Literal| {
            if let Some(store) = weak.upgrade() {
                store.fire_watches(literal);
            }
        }));
        store
    }

    /// The class registry this store deliteralizes through.
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Cumulative save/invalidation counters.
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    // ---- watch ----------------------------------------------------------------------------

    /// Fires `cb` for every literal of class `class_name` persisted from now on.
    pub fn watch_class(&self, class_name: impl Into<String>, cb: Callback) {
        self.watches
            .write()
            .by_class
            .entry(class_name.into())
            .or_default()
            .push(cb);
    }

    /// Fires `cb` for every literal with a dependency at `(path, hash)` persisted from now on.
    pub fn watch_reference(&self, path: impl Into<String>, hash: Hash, cb: Callback) {
        self.watches
            .write()
            .by_path_hash
            .entry((path.into(), hash))
            .or_default()
            .push(cb);
    }

    /// Fires `cb` for every literal of class `referring_class` with a dependency whose path is
    /// `path`, persisted from now on.
    ///
    /// Preserves an observed quirk: matching ignores the registered `hash` entirely (every
    /// dependency at the registered path satisfies the comparison, not only the one with the
    /// registered hash), so this fires more often than the name suggests. Callers that need the
    /// hash to actually match should additionally filter in their callback.
    pub fn watch_referencing_class(
        &self,
        referring_class: impl Into<String>,
        path: impl Into<String>,
        hash: Hash,
        cb: Callback,
    ) {
        self.watches
            .write()
            .by_class_path_hash
            .entry((referring_class.into(), path.into(), hash))
            .or_default()
            .push(cb);
    }

    fn fire_watches(&self, literal: &Literal) {
        let class_name = match literal_class_name(literal) {
            Some(c) => c,
            None => return,
        };
        let tables = self.watches.read();

        if let Some(cbs) = tables.by_class.get(&class_name) {
            for cb in cbs {
                cb(literal);
            }
        }

        for dep in &literal.dependencies {
            if let Some(cbs) = tables.by_path_hash.get(&(dep.path.clone(), dep.hash)) {
                for cb in cbs {
                    cb(literal);
                }
            }
        }

        for ((registered_class, registered_path, _registered_hash), cbs) in &tables.by_class_path_hash {
            if *registered_class != class_name {
                continue;
            }
            let path_matches = literal.dependencies.iter().any(|d| &d.path == registered_path);
            if path_matches {
                for cb in cbs {
                    cb(literal);
                }
            }
        }
    }

    // ---- save -----------------------------------------------------------------------------

    /// Literalizes and saves a plain (non-op) hashed object, enforcing dependency completeness
    /// and persisting in dependency order.
    pub fn save(&self, obj: Box<dyn HashedObject>) -> Result<Hash> {
        let mut ctx = Context::new();
        let hash = ctx.literalize_root(obj)?;
        self.check_dependency_completeness(&ctx, hash)?;
        for literal_hash in ctx.literalize_order.clone() {
            self.persist_one(&ctx, literal_hash, None)?;
        }
        Ok(hash)
    }

    /// Saves a mutation op: in addition to the plain-object path, computes this op's
    /// `OpHeader` from its `prevOps`' already-stored headers and runs causal-invalidation
    /// maintenance.
    pub fn save_op(&self, op: StoredOp) -> Result<Hash> {
        let mut ctx = Context::new();
        let hash = self.literalize_op(&mut ctx, &op)?;
        self.check_dependency_completeness(&ctx, hash)?;
        for literal_hash in ctx.literalize_order.clone() {
            if literal_hash == hash {
                self.persist_op(&mut ctx, &op, hash)?;
            } else {
                self.persist_one(&ctx, literal_hash, None)?;
            }
        }
        Ok(hash)
    }

    fn literalize_op(&self, ctx: &mut Context, op: &StoredOp) -> Result<Hash> {
        let boxed: Box<dyn HashedObject> = match op.clone() {
            StoredOp::Mutation(op) => Box::new(op),
            StoredOp::InvalidateAfter(op) => Box::new(op),
            StoredOp::CascadedInvalidate(op) => Box::new(op),
        };
        ctx.literalize_root(boxed)
    }

    fn check_dependency_completeness(&self, ctx: &Context, root_hash: Hash) -> Result<()> {
        let literal = ctx
            .literals
            .get(&root_hash)
            .expect("root hash was just literalized into this context");
        let mut missing = Vec::new();
        for dep in &literal.dependencies {
            if ctx.literals.contains_key(&dep.hash) {
                continue;
            }
            match self.backend.load(dep.hash)? {
                Some(stored) => {
                    let stored_class = literal_class_name(&stored).unwrap_or_default();
                    if stored_class != dep.class_name {
                        return Err(Error::ClassMismatch {
                            hash: dep.hash,
                            declared: dep.class_name.clone(),
                            stored: stored_class,
                        });
                    }
                }
                None => missing.push(dep.hash),
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingDependencies { hashes: missing });
        }
        Ok(())
    }

    fn persist_one(&self, ctx: &Context, hash: Hash, header: Option<&OpHeader>) -> Result<()> {
        let mut literal = ctx.literals.get(&hash).cloned().expect("hash from this context");
        let should_sign = ctx
            .objects
            .get(&hash)
            .map(|subject| subject.should_sign_on_save())
            .unwrap_or(false);
        if should_sign {
            if let Some(author_hash) = literal.author {
                if let Some(author_obj) = ctx.objects.get(&author_hash) {
                    if let Some(identity) = author_obj.as_any().downcast_ref::<Identity>() {
                        literal.signature = Some(identity.sign(hash)?);
                    }
                }
            }
        }
        self.backend.store(&literal, header)?;
        self.stats.objects_saved.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn persist_op(&self, ctx: &mut Context, op: &StoredOp, hash: Hash) -> Result<()> {
        let mut prev_headers = BTreeMap::new();
        for prev in op.base().prev_ops.iter() {
            let header = self
                .backend
                .load_op_header(prev.hash)?
                .ok_or(Error::MissingPrevOpHeader(prev.hash))?;
            prev_headers.insert(prev.hash, header);
        }
        let header = OpHeader::compute(hash, prev_headers);
        self.persist_one(ctx, hash, Some(&header))?;
        self.maintain_causal_invalidation(ctx, op, hash)?;
        Ok(())
    }

    fn maintain_causal_invalidation(&self, ctx: &mut Context, op: &StoredOp, op_hash: Hash) -> Result<()> {
        // Direction A: a newly saved op with `causalOps` may need a cascade synthesized against
        // each causal precondition that already has an invalidator in the backend.
        if let Some(causal_ops) = &op.base().causal_ops {
            for causal in causal_ops.iter() {
                let invalidators = self.backend.search_by_reference(
                    "targetOp",
                    causal.hash,
                    SearchParams::all(),
                )?;
                for inv_literal in invalidators {
                    let class = literal_class_name(&inv_literal).unwrap_or_default();
                    let applies = match class.as_str() {
                        "InvalidateAfterOp" => {
                            target_object_ref(&inv_literal)
                                .map(|r| r.hash == op.base().target_object.hash)
                                .unwrap_or(false)
                        }
                        "CascadedInvalidateOp" => true,
                        _ => false,
                    };
                    if !applies {
                        continue;
                    }
                    self.stats.ops_invalidated.fetch_add(1, Ordering::Relaxed);
                    let reason = HashReference::new(inv_literal.hash, class);
                    let op_class = op_class_name(op);
                    let cascade = CascadedInvalidateOp::create(
                        op.base().target_object.clone(),
                        HashReference::new(op_hash, op_class),
                        reason,
                    );
                    let cascade_hash = ctx.literalize(Box::new(cascade.clone()), "")?;
                    self.check_dependency_completeness(ctx, cascade_hash)?;
                    self.persist_op(ctx, &StoredOp::CascadedInvalidate(cascade), cascade_hash)?;
                    self.stats.cascades_generated.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Direction B: a newly saved InvalidateAfterOp/CascadedInvalidateOp cascades to its own
        // existing consequences.
        if let Some(target) = op.invalidation_target().cloned() {
            let consequences =
                self.backend
                    .search_by_reference("causalOps", target.hash, SearchParams::all())?;

            let valid_consequences = match op {
                StoredOp::InvalidateAfter(inv) => Some(self.prev_ops_closure(&inv.terminal_ops)?),
                StoredOp::CascadedInvalidate(_) => None,
                StoredOp::Mutation(_) => return Ok(()),
            };

            let reason_class = op_class_name(op);
            for cons_literal in consequences {
                if let Some(valid) = &valid_consequences {
                    if valid.contains(&cons_literal.hash) {
                        continue;
                    }
                }
                let cons_class = literal_class_name(&cons_literal).unwrap_or_default();
                let cons_target = target_object_ref(&cons_literal)?;
                self.stats.ops_invalidated.fetch_add(1, Ordering::Relaxed);
                let cascade = CascadedInvalidateOp::create(
                    cons_target,
                    HashReference::new(cons_literal.hash, cons_class),
                    HashReference::new(op_hash, reason_class.clone()),
                );
                let cascade_hash = ctx.literalize(Box::new(cascade.clone()), "")?;
                self.check_dependency_completeness(ctx, cascade_hash)?;
                self.persist_op(ctx, &StoredOp::CascadedInvalidate(cascade), cascade_hash)?;
                self.stats.cascades_generated.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn prev_ops_closure(&self, terminal_ops: &crate::collections::HashedSet<HashReference>) -> Result<HashSet<Hash>> {
        let mut closure = HashSet::new();
        let mut frontier: Vec<Hash> = terminal_ops.iter().map(|r| r.hash).collect();
        while let Some(h) = frontier.pop() {
            if !closure.insert(h) {
                continue;
            }
            if let Some(literal) = self.backend.load(h)? {
                frontier.extend(prev_ops_hashes(&literal));
            }
        }
        Ok(closure)
    }

    // ---- load -----------------------------------------------------------------------------

    /// Returns the raw literal for `hash`, if present.
    pub fn load_literal(&self, hash: Hash) -> Result<Option<Literal>> {
        self.backend.load(hash)
    }

    /// Loads and reconstructs the object at `hash`, recursively resolving embedded
    /// dependencies through the backend.
    pub fn load(&self, hash: Hash) -> Result<Option<Arc<dyn HashedObject>>> {
        let mut ctx = Context::new();
        self.hydrate_literal_tree(&mut ctx, hash)?;
        if !ctx.literals.contains_key(&hash) {
            return Ok(None);
        }
        Ok(Some(ctx.deliteralize(hash, &self.registry)?))
    }

    /// `fromContextWithValidation` (§4.2): loads and reconstructs the object at `hash`, then
    /// (1) recomputes its hash and rejects with `WrongHash` on mismatch, (2) if authored,
    /// verifies `signature` against the author's public key (`MissingSignature`/
    /// `BadSignature`), and (3) runs `HashedObject::validate` against the resolved dependency
    /// set (`ValidationFailed`).
    pub fn load_with_validation(&self, hash: Hash) -> Result<Option<Arc<dyn HashedObject>>> {
        let mut ctx = Context::new();
        self.hydrate_literal_tree(&mut ctx, hash)?;
        let literal = match ctx.literals.get(&hash).cloned() {
            Some(l) => l,
            None => return Ok(None),
        };

        // `author` is a `Reference`-kind dependency, so the generic literal/object tree walk
        // (which only follows `Literal`-kind dependencies) never pulls it in; hydrate it
        // explicitly so the signature check below has something to verify against.
        if let Some(author_hash) = literal.author {
            self.hydrate_literal_tree(&mut ctx, author_hash)?;
        }

        let obj = ctx.deliteralize(hash, &self.registry)?;

        let recomputed = match obj.custom_hash() {
            Some(h) => h,
            None => hash_value(&literal.value)?,
        };
        if recomputed != hash {
            return Err(Error::WrongHash(hash));
        }

        if let Some(author_hash) = literal.author {
            if !ctx.literals.contains_key(&author_hash) {
                return Err(Error::MissingDependencies { hashes: vec![author_hash] });
            }
            let signature = literal.signature.clone().ok_or(Error::MissingSignature(hash))?;
            let author_obj = ctx.deliteralize(author_hash, &self.registry)?;
            let identity = author_obj
                .as_any()
                .downcast_ref::<Identity>()
                .ok_or(Error::BadSignature(hash))?;
            identity.verify(hash, &signature)?;
        }

        let dependencies: BTreeMap<Hash, Arc<dyn HashedObject>> = ctx.objects.clone().into_iter().collect();
        if !obj.validate(&dependencies) {
            return Err(Error::ValidationFailed(hash));
        }

        Ok(Some(obj))
    }

    fn hydrate_literal_tree(&self, ctx: &mut Context, hash: Hash) -> Result<()> {
        if ctx.literals.contains_key(&hash) {
            return Ok(());
        }
        let literal = match self.backend.load(hash)? {
            Some(l) => l,
            None => return Ok(()),
        };
        let deps: Vec<Hash> = literal
            .dependencies
            .iter()
            .filter(|d| d.kind == crate::object::DependencyKind::Literal)
            .map(|d| d.hash)
            .collect();
        ctx.literals.insert(hash, literal);
        for dep_hash in deps {
            self.hydrate_literal_tree(ctx, dep_hash)?;
        }
        Ok(())
    }

    /// Reconstructs every object with `_class == class_name`.
    pub fn load_by_class(&self, class_name: &str, params: SearchParams) -> Result<Vec<Arc<dyn HashedObject>>> {
        let literals = self.backend.search_by_class(class_name, params)?;
        self.deliteralize_all(literals)
    }

    /// Reconstructs every object with a dependency at `(path, hash)`.
    pub fn load_by_reference(
        &self,
        path: &str,
        hash: Hash,
        params: SearchParams,
    ) -> Result<Vec<Arc<dyn HashedObject>>> {
        let literals = self.backend.search_by_reference(path, hash, params)?;
        self.deliteralize_all(literals)
    }

    /// Reconstructs every object of `class_name` with a dependency at `(path, hash)`.
    pub fn load_by_referencing_class(
        &self,
        class_name: &str,
        path: &str,
        hash: Hash,
        params: SearchParams,
    ) -> Result<Vec<Arc<dyn HashedObject>>> {
        let literals = self.backend.search_by_referencing_class(class_name, path, hash, params)?;
        self.deliteralize_all(literals)
    }

    fn deliteralize_all(&self, literals: Vec<Literal>) -> Result<Vec<Arc<dyn HashedObject>>> {
        let mut ctx = Context::new();
        let mut out = Vec::with_capacity(literals.len());
        for literal in literals {
            let hash = literal.hash;
            self.hydrate_literal_tree(&mut ctx, hash)?;
            out.push(ctx.deliteralize(hash, &self.registry)?);
        }
        Ok(out)
    }

    /// Walks the backend's `targetOp → op` index for `target_op`, in pages of
    /// `StoreConfig::scan_batch_size`, returning every invalidator literal.
    pub fn load_all_invalidations(&self, target_op: Hash) -> Result<Vec<Literal>> {
        self.scan_all(|params| self.backend.search_by_reference("targetOp", target_op, params))
    }

    /// Walks the backend's `causalOps → op` index for `op`, in pages of
    /// `StoreConfig::scan_batch_size`, returning every consequence literal.
    pub fn load_all_consequences(&self, op: Hash) -> Result<Vec<Literal>> {
        self.scan_all(|params| self.backend.search_by_reference("causalOps", op, params))
    }

    /// Walks the backend's `targetObject → op` index for `target_object`, in pages of
    /// `StoreConfig::scan_batch_size`.
    pub fn load_all_ops(&self, target_object: Hash) -> Result<Vec<Literal>> {
        self.scan_all(|params| self.backend.search_by_reference("targetObject", target_object, params))
    }

    fn scan_all(&self, query: impl Fn(SearchParams) -> Result<Vec<Literal>>) -> Result<Vec<Literal>> {
        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let page = query(SearchParams::page(Order::Asc, self.config.scan_batch_size, cursor))?;
            let page_len = page.len();
            if let Some(last) = page.last() {
                cursor = Some(last.hash);
            }
            out.extend(page);
            if page_len < self.config.scan_batch_size {
                break;
            }
        }
        Ok(out)
    }

    /// Closes the underlying backend.
    pub fn close(&self) -> Result<()> {
        self.backend.close()
    }
}

fn op_class_name(op: &StoredOp) -> String {
    match op {
        StoredOp::Mutation(_) => "MutationOp".to_string(),
        StoredOp::InvalidateAfter(_) => "InvalidateAfterOp".to_string(),
        StoredOp::CascadedInvalidate(_) => "CascadedInvalidateOp".to_string(),
    }
}

fn literal_class_name(literal: &Literal) -> Option<String> {
    if let Value::Object(map) = &literal.value {
        if let Some(Value::Str(class)) = map.get("_class") {
            return Some(class.clone());
        }
    }
    None
}

fn literal_field<'a>(literal: &'a Literal, name: &str) -> Option<&'a Value> {
    if let Value::Object(map) = &literal.value {
        if let Some(Value::Object(fields)) = map.get("_fields") {
            return fields.get(name);
        }
    }
    None
}

fn reference_hash_and_class(value: &Value) -> Option<(Hash, String)> {
    if let Value::Object(map) = value {
        if let Some(Value::Str(hex_hash)) = map.get("_hash") {
            let hash: Hash = hex_hash.parse().ok()?;
            let class_name = match map.get("_class") {
                Some(Value::Str(s)) => s.clone(),
                _ => String::new(),
            };
            return Some((hash, class_name));
        }
    }
    None
}

fn target_object_ref(literal: &Literal) -> Result<HashReference> {
    let value = literal_field(literal, "targetObject")
        .ok_or_else(|| Error::InvalidLiteral(format!("{} has no targetObject", literal.hash)))?;
    let (hash, class_name) = reference_hash_and_class(value)
        .ok_or_else(|| Error::InvalidLiteral(format!("{} has a malformed targetObject", literal.hash)))?;
    Ok(HashReference::new(hash, class_name))
}

fn prev_ops_hashes(literal: &Literal) -> Vec<Hash> {
    match literal_field(literal, "prevOps") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| reference_hash_and_class(v).map(|(h, _)| h))
            .collect(),
        _ => Vec::new(),
    }
}

/// An in-memory `Backend`, used by tests and demos. Not persistent across process restarts.
pub mod memory {
    use super::*;
    use std::collections::BTreeMap as Sorted;

    #[derive(Default)]
    struct State {
        literals: HashMap<Hash, Literal>,
        headers_by_op: HashMap<Hash, OpHeader>,
        headers_by_header_hash: HashMap<Hash, OpHeader>,
        terminal_ops: HashMap<Hash, TerminalOps>,
        by_class: HashMap<String, Sorted<Hash, ()>>,
    }

    /// A simple, fully in-memory backend suitable for unit and scenario tests.
    pub struct MemoryBackend {
        name: String,
        state: RwLock<State>,
        callback: RwLock<Option<StoredObjectCallback>>,
    }

    impl MemoryBackend {
        /// Creates a fresh, empty backend named `name` (used only for diagnostics/logging).
        pub fn new(name: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                state: RwLock::new(State::default()),
                callback: RwLock::new(None),
            })
        }

        fn matches_scan(hash: &Hash, params: &SearchParams) -> bool {
            match (params.start, params.order) {
                (Some(start), Order::Asc) => *hash > start,
                (Some(start), Order::Desc) => *hash < start,
                (None, _) => true,
            }
        }
    }

    impl Backend for MemoryBackend {
        fn store(&self, literal: &Literal, header: Option<&OpHeader>) -> Result<()> {
            let mut state = self.state.write();
            if state.literals.contains_key(&literal.hash) {
                return Ok(());
            }
            let class_name = literal_class_name(literal).unwrap_or_default();
            state.by_class.entry(class_name).or_default().insert(literal.hash, ());
            state.literals.insert(literal.hash, literal.clone());
            if let Some(header) = header {
                state.headers_by_op.insert(header.op_hash, header.clone());
                state
                    .headers_by_header_hash
                    .insert(header.header_hash, header.clone());
                if let Ok(target) = target_object_ref(literal) {
                    let entry = state.terminal_ops.entry(target.hash).or_default();
                    entry.last_op = Some(literal.hash);
                    entry.terminal_ops.retain(|h| !prev_ops_hashes(literal).contains(h));
                    entry.terminal_ops.push(literal.hash);
                }
            }
            drop(state);
            tracing::debug!(hash = %literal.hash, "memory backend stored literal");
            if let Some(cb) = self.callback.read().as_ref() {
                cb(literal);
            }
            Ok(())
        }

        fn load(&self, hash: Hash) -> Result<Option<Literal>> {
            Ok(self.state.read().literals.get(&hash).cloned())
        }

        fn load_op_header(&self, op_hash: Hash) -> Result<Option<OpHeader>> {
            Ok(self.state.read().headers_by_op.get(&op_hash).cloned())
        }

        fn load_op_header_by_header_hash(&self, header_hash: Hash) -> Result<Option<OpHeader>> {
            Ok(self.state.read().headers_by_header_hash.get(&header_hash).cloned())
        }

        fn load_terminal_ops_for_mutable(&self, mutable_hash: Hash) -> Result<Option<TerminalOps>> {
            Ok(self.state.read().terminal_ops.get(&mutable_hash).cloned())
        }

        fn search_by_class(&self, class_name: &str, params: SearchParams) -> Result<Vec<Literal>> {
            let state = self.state.read();
            let mut hashes: Vec<Hash> = state
                .by_class
                .get(class_name)
                .map(|m| m.keys().copied().collect())
                .unwrap_or_default();
            if params.order == Order::Desc {
                hashes.reverse();
            }
            hashes.retain(|h| Self::matches_scan(h, &params));
            if let Some(limit) = params.limit {
                hashes.truncate(limit);
            }
            Ok(hashes.into_iter().filter_map(|h| state.literals.get(&h).cloned()).collect())
        }

        fn search_by_reference(&self, path: &str, hash: Hash, params: SearchParams) -> Result<Vec<Literal>> {
            let state = self.state.read();
            let mut matches: Vec<Literal> = state
                .literals
                .values()
                .filter(|l| l.dependencies.iter().any(|d| d.path == path && d.hash == hash))
                .cloned()
                .collect();
            matches.sort_by_key(|l| l.hash);
            if params.order == Order::Desc {
                matches.reverse();
            }
            matches.retain(|l| Self::matches_scan(&l.hash, &params));
            if let Some(limit) = params.limit {
                matches.truncate(limit);
            }
            Ok(matches)
        }

        fn search_by_referencing_class(
            &self,
            class_name: &str,
            path: &str,
            hash: Hash,
            params: SearchParams,
        ) -> Result<Vec<Literal>> {
            let state = self.state.read();
            let mut matches: Vec<Literal> = state
                .literals
                .values()
                .filter(|l| {
                    literal_class_name(l).as_deref() == Some(class_name)
                        && l.dependencies.iter().any(|d| d.path == path && d.hash == hash)
                })
                .cloned()
                .collect();
            matches.sort_by_key(|l| l.hash);
            if params.order == Order::Desc {
                matches.reverse();
            }
            matches.retain(|l| Self::matches_scan(&l.hash, &params));
            if let Some(limit) = params.limit {
                matches.truncate(limit);
            }
            Ok(matches)
        }

        fn set_stored_object_callback(&self, callback: StoredObjectCallback) {
            *self.callback.write() = Some(callback);
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn backend_name(&self) -> &str {
            "memory"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBackend;
    use super::*;
    use crate::collections::HashedSet;
    use crate::object::{DeliteralizedField, FieldValue};
    use std::any::Any;

    #[derive(Clone)]
    struct Note {
        id: Option<String>,
        text: String,
    }

    impl HashedObject for Note {
        fn class_name(&self) -> &str {
            "Note"
        }
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
        fn fields(&self) -> Vec<(String, FieldValue)> {
            vec![("text".to_string(), FieldValue::Value(Value::from(self.text.as_str())))]
        }
        fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
            for (name, field) in fields {
                if name == "text" {
                    if let DeliteralizedField::Value(Value::Str(s)) = field {
                        self.text = s;
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

    fn store() -> Arc<Store> {
        let registry = Arc::new(ClassRegistry::new());
        registry.register("Note", || {
            Box::new(Note {
                id: None,
                text: String::new(),
            })
        });
        let backend = MemoryBackend::new("test");
        Store::new(backend, registry, StoreConfig::default())
    }

    #[derive(Clone)]
    struct AuthoredNote {
        id: Option<String>,
        text: String,
        author: Arc<Identity>,
    }

    impl HashedObject for AuthoredNote {
        fn class_name(&self) -> &str {
            "AuthoredNote"
        }
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
        fn author(&self) -> Option<Hash> {
            self.author.hash().ok()
        }
        fn author_identity(&self) -> Option<Arc<Identity>> {
            Some(self.author.clone())
        }
        fn fields(&self) -> Vec<(String, FieldValue)> {
            vec![("text".to_string(), FieldValue::Value(Value::from(self.text.as_str())))]
        }
        fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
            for (name, field) in fields {
                if name == "text" {
                    if let DeliteralizedField::Value(Value::Str(s)) = field {
                        self.text = s;
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

    fn authored_registry() -> Arc<ClassRegistry> {
        let registry = Arc::new(ClassRegistry::new());
        registry.register("Identity", || Box::new(Identity::generate("")));
        registry.register("AuthoredNote", || {
            Box::new(AuthoredNote {
                id: None,
                text: String::new(),
                author: Arc::new(Identity::generate("")),
            })
        });
        registry
    }

    #[test]
    fn authored_save_then_load_with_validation_verifies_signature() {
        let backend = MemoryBackend::new("authored-test");
        let store = Store::new(backend, authored_registry(), StoreConfig::default());

        let author = Arc::new(Identity::generate("alice"));
        let note = Box::new(AuthoredNote {
            id: None,
            text: "signed".to_string(),
            author,
        });
        let hash = store.save(note).unwrap();

        let loaded = store.load_with_validation(hash).unwrap().unwrap();
        let loaded = loaded.as_any().downcast_ref::<AuthoredNote>().unwrap();
        assert_eq!(loaded.text, "signed");
    }

    #[test]
    fn load_with_validation_rejects_a_forged_signature() {
        let backend = MemoryBackend::new("forged-signature-test");
        let store = Store::new(backend.clone(), authored_registry(), StoreConfig::default());

        let genuine_author = Arc::new(Identity::generate("alice"));
        let forger = Identity::generate("mallory");

        let mut ctx = Context::new();
        let note_hash = ctx
            .literalize_root(Box::new(AuthoredNote {
                id: None,
                text: "forged".to_string(),
                author: genuine_author.clone(),
            }))
            .unwrap();

        for literal_hash in ctx.literalize_order.clone() {
            let mut literal = ctx.literals.get(&literal_hash).cloned().unwrap();
            if literal_hash == note_hash {
                literal.signature = Some(forger.sign(note_hash).unwrap());
            }
            backend.store(&literal, None).unwrap();
        }

        let err = store.load_with_validation(note_hash).unwrap_err();
        assert!(matches!(err, Error::BadSignature(_)));
    }

    fn mutation_reference(class_name: &str, hash: Hash) -> HashReference {
        HashReference::new(hash, class_name)
    }

    #[test]
    fn save_is_idempotent_by_hash() {
        let store = store();
        let a = Box::new(Note {
            id: None,
            text: "hello".to_string(),
        });
        let b = Box::new(Note {
            id: None,
            text: "hello".to_string(),
        });
        let h1 = store.save(a).unwrap();
        let h2 = store.save(b).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.stats().objects_saved, 2);
    }

    #[test]
    fn save_refuses_missing_dependencies() {
        let store = store();
        let target = mutation_reference("Note", Hash::of_bytes(b"nonexistent"));
        let op = MutationOp::new(target.clone()).with_base(
            crate::mutation::MutationOpBase::new(target.clone()).with_causal_ops(
                [mutation_reference("MutationOp", Hash::of_bytes(b"missing-causal"))]
                    .into_iter()
                    .collect::<HashedSet<_>>(),
            ),
        );
        let err = store.save_op(StoredOp::Mutation(op)).unwrap_err();
        assert!(matches!(err, Error::MissingDependencies { .. }));
    }

    #[test]
    fn load_reconstructs_a_saved_object() {
        let store = store();
        let note = Box::new(Note {
            id: None,
            text: "round trip".to_string(),
        });
        let hash = store.save(note).unwrap();
        let loaded = store.load(hash).unwrap().unwrap();
        let loaded = loaded.as_any().downcast_ref::<Note>().unwrap();
        assert_eq!(loaded.text, "round trip");
    }

    #[test]
    fn causal_invalidation_produces_exactly_one_cascade() {
        let store = store();
        let mutable = mutation_reference("Note", Hash::of_bytes(b"mutable"));

        let c = MutationOp::new(mutable.clone());
        let c_hash = store.save_op(StoredOp::Mutation(c)).unwrap();
        let c_ref = mutation_reference("MutationOp", c_hash);

        let a = MutationOp::new(mutable.clone()).with_base(
            crate::mutation::MutationOpBase::new(mutable.clone())
                .with_causal_ops([c_ref.clone()].into_iter().collect()),
        );
        let a_hash = store.save_op(StoredOp::Mutation(a)).unwrap();

        let inv = InvalidateAfterOp::new(mutable.clone(), c_ref.clone(), HashedSet::new());
        store.save_op(StoredOp::InvalidateAfter(inv)).unwrap();

        let results = store
            .load_by_reference("targetOp", c_hash, SearchParams::all())
            .unwrap();
        let classes: Vec<String> = results
            .iter()
            .map(|o| o.class_name().to_string())
            .collect();
        assert!(classes.contains(&"InvalidateAfterOp".to_string()));

        let cascades = store
            .load_by_reference("causalOps", c_hash, SearchParams::all())
            .unwrap();
        assert!(cascades.iter().any(|o| o.class_name() == "MutationOp"));

        let consequences = store.load_all_consequences(c_hash).unwrap();
        let cascade_count = consequences
            .iter()
            .filter(|l| literal_class_name(l).as_deref() == Some("CascadedInvalidateOp"))
            .count();
        assert_eq!(cascade_count, 0, "CascadedInvalidateOp is indexed by its own targetOp, not causalOps");

        let invalidations_of_a = store.load_all_invalidations(a_hash).unwrap();
        assert_eq!(invalidations_of_a.len(), 1);
        assert_eq!(
            literal_class_name(&invalidations_of_a[0]).as_deref(),
            Some("CascadedInvalidateOp")
        );
    }

    #[test]
    fn watch_class_fires_on_every_persisted_literal_of_that_class() {
        let store = store();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        store.watch_class(
            "Note",
            Arc::new(move |literal: &Literal| {
                seen_clone.write().push(literal.hash);
            }),
        );
        let hash = store
            .save(Box::new(Note {
                id: None,
                text: "watched".to_string(),
            }))
            .unwrap();
        assert_eq!(seen.read().as_slice(), &[hash]);
    }
}
