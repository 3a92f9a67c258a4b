//! Mutation ops and causal invalidation: `MutationOp`, the bounded retroactive
//! `InvalidateAfterOp`, and the store-synthesized `CascadedInvalidateOp`, plus the per-op
//! `OpHeader` causal digest consumed by sync protocols outside this crate.
use crate::collections::HashedSet;
use crate::hash::Hash;
use crate::identity::Identity;
use crate::object::{DeliteralizedField, FieldValue, HashReference, HashedObject};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fields shared by every mutation op. Rust has no class inheritance, so every op kind embeds
/// this as a plain field rather than subtyping it.
#[derive(Clone)]
pub struct MutationOpBase {
    id: Option<String>,
    /// The mutable object this op changes.
    pub target_object: HashReference,
    /// Direct causal predecessors within `target_object`'s own history.
    pub prev_ops: HashedSet<HashReference>,
    /// Cross-object preconditions: if any of these is (or becomes) invalidated, this op must
    /// cascade-invalidate too.
    pub causal_ops: Option<HashedSet<HashReference>>,
    /// The authoring Identity, if this op is authored. Kept live (not just its hash) so that
    /// literalization can embed it into the context and the store can sign with it.
    pub author: Option<Arc<Identity>>,
}

impl MutationOpBase {
    /// A fresh, unauthored op base targeting `target_object` with no predecessors.
    pub fn new(target_object: HashReference) -> Self {
        Self {
            id: None,
            target_object,
            prev_ops: HashedSet::new(),
            causal_ops: None,
            author: None,
        }
    }

    /// Sets the direct causal predecessors.
    pub fn with_prev_ops(mut self, prev_ops: HashedSet<HashReference>) -> Self {
        self.prev_ops = prev_ops;
        self
    }

    /// Sets the cross-object causal preconditions.
    pub fn with_causal_ops(mut self, causal_ops: HashedSet<HashReference>) -> Self {
        self.causal_ops = Some(causal_ops);
        self
    }

    /// Sets the authoring identity.
    pub fn with_author(mut self, author: Arc<Identity>) -> Self {
        self.author = Some(author);
        self
    }

    fn base_field_entries(&self) -> Vec<(String, FieldValue)> {
        let mut fields = vec![
            (
                "targetObject".to_string(),
                FieldValue::Reference(self.target_object.clone()),
            ),
            (
                "prevOps".to_string(),
                FieldValue::Collection(
                    self.prev_ops
                        .iter()
                        .cloned()
                        .map(FieldValue::Reference)
                        .collect(),
                ),
            ),
        ];
        if let Some(causal) = &self.causal_ops {
            fields.push((
                "causalOps".to_string(),
                FieldValue::Collection(causal.iter().cloned().map(FieldValue::Reference).collect()),
            ));
        }
        fields
    }

    fn assign_from(&mut self, name: &str, field: DeliteralizedField) -> bool {
        match name {
            "targetObject" => {
                if let DeliteralizedField::Reference(r) = field {
                    self.target_object = r;
                    true
                } else {
                    false
                }
            }
            "prevOps" => {
                if let DeliteralizedField::Collection(items) = field {
                    let mut set = HashedSet::new();
                    for item in items {
                        if let DeliteralizedField::Reference(r) = item {
                            let _ = set.insert(r);
                        }
                    }
                    self.prev_ops = set;
                    true
                } else {
                    false
                }
            }
            "causalOps" => {
                if let DeliteralizedField::Collection(items) = field {
                    let mut set = HashedSet::new();
                    for item in items {
                        if let DeliteralizedField::Reference(r) = item {
                            let _ = set.insert(r);
                        }
                    }
                    self.causal_ops = Some(set);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// A single change to a mutable object.
#[derive(Clone)]
pub struct MutationOp {
    base: MutationOpBase,
}

impl MutationOp {
    /// Creates an op targeting `target_object` with no predecessors; use the builder methods on
    /// the returned base (via `with_base`) to add `prevOps`/`causalOps`/an author.
    pub fn new(target_object: HashReference) -> Self {
        Self {
            base: MutationOpBase::new(target_object),
        }
    }

    /// Replaces this op's base (predecessors, causal preconditions, author).
    pub fn with_base(mut self, base: MutationOpBase) -> Self {
        self.base = base;
        self
    }

    /// Read access to the shared op fields.
    pub fn base(&self) -> &MutationOpBase {
        &self.base
    }
}

impl HashedObject for MutationOp {
    fn class_name(&self) -> &str {
        "MutationOp"
    }
    fn id(&self) -> Option<&str> {
        self.base.id.as_deref()
    }
    fn set_id(&mut self, id: String) {
        self.base.id = Some(id);
    }
    fn author(&self) -> Option<Hash> {
        self.base.author.as_ref().and_then(|id| id.hash().ok())
    }
    fn author_identity(&self) -> Option<Arc<Identity>> {
        self.base.author.clone()
    }
    fn fields(&self) -> Vec<(String, FieldValue)> {
        self.base.base_field_entries()
    }
    fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> crate::error::Result<()> {
        for (name, field) in fields {
            self.base.assign_from(&name, field);
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

/// Marks that every descendant of `target_op` which is not an ancestor of `terminal_ops` must
/// be invalidated.
#[derive(Clone)]
pub struct InvalidateAfterOp {
    base: MutationOpBase,
    /// The op whose non-terminal descendants are invalidated.
    pub target_op: HashReference,
    /// Descendants that are ancestors of any op in this set survive invalidation.
    pub terminal_ops: HashedSet<HashReference>,
}

impl InvalidateAfterOp {
    /// Creates an invalidate-after op against `target_op`, bounded by `terminal_ops`.
    pub fn new(
        mutable: HashReference,
        target_op: HashReference,
        terminal_ops: HashedSet<HashReference>,
    ) -> Self {
        Self {
            base: MutationOpBase::new(mutable),
            target_op,
            terminal_ops,
        }
    }

    /// Replaces this op's shared base.
    pub fn with_base(mut self, base: MutationOpBase) -> Self {
        self.base = base;
        self
    }

    /// Read access to the shared op fields.
    pub fn base(&self) -> &MutationOpBase {
        &self.base
    }
}

impl HashedObject for InvalidateAfterOp {
    fn class_name(&self) -> &str {
        "InvalidateAfterOp"
    }
    fn id(&self) -> Option<&str> {
        self.base.id.as_deref()
    }
    fn set_id(&mut self, id: String) {
        self.base.id = Some(id);
    }
    fn author(&self) -> Option<Hash> {
        self.base.author.as_ref().and_then(|id| id.hash().ok())
    }
    fn author_identity(&self) -> Option<Arc<Identity>> {
        self.base.author.clone()
    }
    fn fields(&self) -> Vec<(String, FieldValue)> {
        let mut fields = self.base.base_field_entries();
        fields.push((
            "targetOp".to_string(),
            FieldValue::Reference(self.target_op.clone()),
        ));
        fields.push((
            "terminalOps".to_string(),
            FieldValue::Collection(
                self.terminal_ops
                    .iter()
                    .cloned()
                    .map(FieldValue::Reference)
                    .collect(),
            ),
        ));
        fields
    }
    fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> crate::error::Result<()> {
        for (name, field) in fields {
            match name.as_str() {
                "targetOp" => {
                    if let DeliteralizedField::Reference(r) = field {
                        self.target_op = r;
                    }
                }
                "terminalOps" => {
                    if let DeliteralizedField::Collection(items) = field {
                        let mut set = HashedSet::new();
                        for item in items {
                            if let DeliteralizedField::Reference(r) = item {
                                let _ = set.insert(r);
                            }
                        }
                        self.terminal_ops = set;
                    }
                }
                other => {
                    self.base.assign_from(other, field);
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

/// Store-synthesized op recording that `target_op` is invalidated as a consequence of `reason`
/// (an `InvalidateAfterOp` or an earlier `CascadedInvalidateOp`).
#[derive(Clone)]
pub struct CascadedInvalidateOp {
    base: MutationOpBase,
    /// The op being invalidated.
    pub target_op: HashReference,
    /// The invalidator this cascade traces back to.
    pub reason: HashReference,
}

impl CascadedInvalidateOp {
    /// Synthesizes a cascade recording that `target_op` is invalidated because of `reason`.
    pub fn create(mutable: HashReference, target_op: HashReference, reason: HashReference) -> Self {
        Self {
            base: MutationOpBase::new(mutable),
            target_op,
            reason,
        }
    }

    /// Read access to the shared op fields.
    pub fn base(&self) -> &MutationOpBase {
        &self.base
    }
}

impl HashedObject for CascadedInvalidateOp {
    fn class_name(&self) -> &str {
        "CascadedInvalidateOp"
    }
    fn id(&self) -> Option<&str> {
        self.base.id.as_deref()
    }
    fn set_id(&mut self, id: String) {
        self.base.id = Some(id);
    }
    fn author(&self) -> Option<Hash> {
        self.base.author.as_ref().and_then(|id| id.hash().ok())
    }
    fn author_identity(&self) -> Option<Arc<Identity>> {
        self.base.author.clone()
    }
    fn fields(&self) -> Vec<(String, FieldValue)> {
        let mut fields = self.base.base_field_entries();
        fields.push((
            "targetOp".to_string(),
            FieldValue::Reference(self.target_op.clone()),
        ));
        fields.push(("reason".to_string(), FieldValue::Reference(self.reason.clone())));
        fields
    }
    fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> crate::error::Result<()> {
        for (name, field) in fields {
            match name.as_str() {
                "targetOp" => {
                    if let DeliteralizedField::Reference(r) = field {
                        self.target_op = r;
                    }
                }
                "reason" => {
                    if let DeliteralizedField::Reference(r) = field {
                        self.reason = r;
                    }
                }
                other => {
                    self.base.assign_from(other, field);
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

/// A uniform view over any of the three op kinds a `Store` needs to dispatch on when
/// maintaining causal invalidation.
#[derive(Clone)]
pub enum StoredOp {
    /// An ordinary mutation.
    Mutation(MutationOp),
    /// A bounded retroactive invalidation.
    InvalidateAfter(InvalidateAfterOp),
    /// A store-synthesized cascade.
    CascadedInvalidate(CascadedInvalidateOp),
}

impl StoredOp {
    /// The shared op fields common to every kind.
    pub fn base(&self) -> &MutationOpBase {
        match self {
            StoredOp::Mutation(op) => op.base(),
            StoredOp::InvalidateAfter(op) => op.base(),
            StoredOp::CascadedInvalidate(op) => op.base(),
        }
    }

    /// The op this invalidator targets, for `InvalidateAfter`/`CascadedInvalidate`; `None` for a
    /// plain mutation, which is never itself an invalidator.
    pub fn invalidation_target(&self) -> Option<&HashReference> {
        match self {
            StoredOp::Mutation(_) => None,
            StoredOp::InvalidateAfter(op) => Some(&op.target_op),
            StoredOp::CascadedInvalidate(op) => Some(&op.target_op),
        }
    }
}

/// Per-op causal digest: the op's own hash plus the ordered digests of its direct
/// predecessors' headers, used by sync protocols outside this crate to compare causal state
/// without exchanging full op bodies.
#[derive(Clone, Debug)]
pub struct OpHeader {
    /// Hash of the op this header describes.
    pub op_hash: Hash,
    /// Headers of this op's direct predecessors, keyed by their op hash.
    pub prev_op_headers: BTreeMap<Hash, OpHeader>,
    /// Deterministic digest over `op_hash` and the sorted predecessor header hashes.
    pub header_hash: Hash,
}

impl OpHeader {
    /// Computes a header for `op_hash` given its direct predecessors' already-computed headers.
    pub fn compute(op_hash: Hash, prev_op_headers: BTreeMap<Hash, OpHeader>) -> Self {
        let mut prev_header_hashes: Vec<Hash> =
            prev_op_headers.values().map(|h| h.header_hash).collect();
        prev_header_hashes.sort();

        let mut preimage = Vec::with_capacity(32 + 32 * prev_header_hashes.len());
        preimage.extend_from_slice(op_hash.as_bytes());
        for h in &prev_header_hashes {
            preimage.extend_from_slice(h.as_bytes());
        }
        let header_hash = Hash::of_bytes(&preimage);

        Self {
            op_hash,
            prev_op_headers,
            header_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(tag: &str) -> HashReference {
        HashReference::new(Hash::of_bytes(tag.as_bytes()), "MutationOp")
    }

    #[test]
    fn header_hash_is_order_independent_over_predecessors() {
        let a = OpHeader::compute(Hash::of_bytes(b"a"), BTreeMap::new());
        let b = OpHeader::compute(Hash::of_bytes(b"b"), BTreeMap::new());

        let mut prevs_ab = BTreeMap::new();
        prevs_ab.insert(a.op_hash, a.clone());
        prevs_ab.insert(b.op_hash, b.clone());

        let mut prevs_ba = BTreeMap::new();
        prevs_ba.insert(b.op_hash, b.clone());
        prevs_ba.insert(a.op_hash, a.clone());

        let h1 = OpHeader::compute(Hash::of_bytes(b"c"), prevs_ab);
        let h2 = OpHeader::compute(Hash::of_bytes(b"c"), prevs_ba);
        assert_eq!(h1.header_hash, h2.header_hash);
    }

    #[test]
    fn distinct_predecessor_sets_yield_distinct_headers() {
        let a = OpHeader::compute(Hash::of_bytes(b"a"), BTreeMap::new());
        let mut prevs = BTreeMap::new();
        prevs.insert(a.op_hash, a);
        let with_prev = OpHeader::compute(Hash::of_bytes(b"c"), prevs);
        let without_prev = OpHeader::compute(Hash::of_bytes(b"c"), BTreeMap::new());
        assert_ne!(with_prev.header_hash, without_prev.header_hash);
    }

    #[test]
    fn stored_op_exposes_invalidation_target_only_for_invalidators() {
        let mutation = StoredOp::Mutation(MutationOp::new(reference("m")));
        assert!(mutation.invalidation_target().is_none());

        let inv = StoredOp::InvalidateAfter(InvalidateAfterOp::new(
            reference("m"),
            reference("target"),
            HashedSet::new(),
        ));
        assert!(inv.invalidation_target().is_some());
    }
}
