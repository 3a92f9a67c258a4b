//! Identities: hashed objects whose hash is derived from their public key alone, so it is
//! stable whether or not the private key is present, plus the signing/verification operations
//! authored objects and ops rely on.
use crate::error::{Error, Result};
use crate::hash::{hash_value, Hash, Value};
use crate::object::{DeliteralizedField, FieldValue, HashedObject};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

/// A public identity: a name plus an ed25519 public key. `hash(Identity)` is a `customHash`
/// over the public key alone, independent of every other field, so it never changes even if
/// display metadata does.
#[derive(Clone)]
pub struct Identity {
    id: Option<String>,
    /// Display name; not covered by the identity's hash.
    pub name: String,
    public_key: PublicKey,
    /// The local private key, if this replica owns this identity. Never literalized.
    key_pair: Option<Keypair>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .field("has_key_pair", &self.key_pair.is_some())
            .finish()
    }
}

fn public_key_value(public_key: &PublicKey) -> Value {
    Value::from(hex::encode(public_key.as_bytes()))
}

fn public_key_hash(public_key: &PublicKey) -> Result<Hash> {
    hash_value(&public_key_value(public_key))
}

impl Identity {
    /// Wraps a public key, with no local signing capability. Used for peers whose identity we
    /// only ever verify, never sign as.
    pub fn from_public_key(name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id: None,
            name: name.into(),
            public_key,
            key_pair: None,
        }
    }

    /// Wraps a full key pair, usable for both verification and local signing.
    pub fn from_key_pair(name: impl Into<String>, key_pair: Keypair) -> Self {
        Self {
            id: None,
            name: name.into(),
            public_key: key_pair.public,
            key_pair: Some(key_pair),
        }
    }

    /// Generates a fresh key pair locally, for replicas minting their own identity rather than
    /// wrapping one they received.
    pub fn generate(name: impl Into<String>) -> Self {
        let key_pair = Keypair::generate(&mut rand::rngs::OsRng);
        Self::from_key_pair(name, key_pair)
    }

    /// This identity's content hash (the hash of its public key alone).
    pub fn hash(&self) -> Result<Hash> {
        public_key_hash(&self.public_key)
    }

    /// The embedded public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Whether this replica holds the private key for this identity.
    pub fn has_key_pair(&self) -> bool {
        self.key_pair.is_some()
    }

    /// Attaches a private key pair to an identity that was constructed (or deliteralized) from
    /// a public key alone, matching it against the loaded store's key pair for this identity.
    ///
    /// Fails if the supplied key pair's public half does not match this identity's.
    pub fn attach_key_pair(&mut self, key_pair: Keypair) -> Result<()> {
        if key_pair.public != self.public_key {
            return Err(Error::BadSignature(public_key_hash(&self.public_key)?));
        }
        self.key_pair = Some(key_pair);
        Ok(())
    }

    /// Signs `hash` (the object or op's content hash) with the local private key.
    pub fn sign(&self, hash: Hash) -> Result<String> {
        let key_pair = self
            .key_pair
            .as_ref()
            .ok_or_else(|| Error::MissingSignature(hash))?;
        let signature = key_pair.sign(hash.as_bytes());
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Verifies that `signature` (hex-encoded) is a valid signature over `hash` under this
    /// identity's public key.
    pub fn verify(&self, hash: Hash, signature: &str) -> Result<()> {
        let bytes = hex::decode(signature).map_err(|_| Error::BadSignature(hash))?;
        let sig = Signature::from_bytes(&bytes).map_err(|_| Error::BadSignature(hash))?;
        self.public_key
            .verify(hash.as_bytes(), &sig)
            .map_err(|_| Error::BadSignature(hash))
    }
}

impl HashedObject for Identity {
    fn class_name(&self) -> &str {
        "Identity"
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn custom_hash(&self) -> Option<Hash> {
        public_key_hash(&self.public_key).ok()
    }

    fn fields(&self) -> Vec<(String, FieldValue)> {
        vec![
            ("name".to_string(), FieldValue::Value(Value::from(self.name.as_str()))),
            (
                "publicKey".to_string(),
                FieldValue::Value(public_key_value(&self.public_key)),
            ),
        ]
    }

    fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
        let mut by_name: BTreeMap<String, DeliteralizedField> = fields.into_iter().collect();
        if let Some(DeliteralizedField::Value(Value::Str(name))) = by_name.remove("name") {
            self.name = name;
        }
        if let Some(DeliteralizedField::Value(Value::Str(hex_key))) = by_name.remove("publicKey") {
            let bytes = hex::decode(&hex_key)
                .map_err(|_| Error::InvalidLiteral("publicKey is not valid hex".into()))?;
            self.public_key = PublicKey::from_bytes(&bytes)
                .map_err(|_| Error::InvalidLiteral("publicKey is not a valid ed25519 key".into()))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::object::ClassRegistry;
    use rand::rngs::OsRng;

    fn fresh_identity(name: &str) -> Identity {
        let key_pair = Keypair::generate(&mut OsRng);
        Identity::from_key_pair(name, key_pair)
    }

    #[test]
    fn hash_depends_only_on_the_public_key() {
        let identity = fresh_identity("alice");
        let hash_a = identity.custom_hash().unwrap();

        let public_only = Identity::from_public_key("alice-as-seen-by-bob", identity.public_key);
        let hash_b = public_only.custom_hash().unwrap();

        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let identity = fresh_identity("alice");
        let hash = Hash::of_bytes(b"some object");
        let signature = identity.sign(hash).unwrap();
        assert!(identity.verify(hash, &signature).is_ok());
    }

    #[test]
    fn verify_rejects_a_signature_from_a_different_key() {
        let a = fresh_identity("alice");
        let b = fresh_identity("bob");
        let hash = Hash::of_bytes(b"some object");
        let signature = a.sign(hash).unwrap();
        assert!(b.verify(hash, &signature).is_err());
    }

    #[test]
    fn public_key_only_identity_cannot_sign() {
        let identity = fresh_identity("alice");
        let public_only = Identity::from_public_key("alice", identity.public_key);
        assert!(public_only.sign(Hash::of_bytes(b"x")).is_err());
    }

    #[test]
    fn literalizes_and_deliteralizes_preserving_hash() {
        let registry = ClassRegistry::new();
        registry.register("Identity", || {
            Box::new(Identity::from_public_key(
                "",
                PublicKey::from_bytes(&[0u8; 32]).unwrap_or_else(|_| {
                    Keypair::generate(&mut rand::rngs::OsRng {}).public
                }),
            ))
        });
        let identity = fresh_identity("alice");
        let expected_hash = identity.custom_hash().unwrap();

        let mut ctx = Context::new();
        let hash = ctx.literalize_root(Box::new(identity)).unwrap();
        assert_eq!(hash, expected_hash);

        let rebuilt = ctx.deliteralize(hash, &registry).unwrap();
        let rebuilt = rebuilt.as_any().downcast_ref::<Identity>().unwrap();
        assert_eq!(rebuilt.custom_hash().unwrap(), expected_hash);
        assert_eq!(rebuilt.name, "alice");
    }
}
