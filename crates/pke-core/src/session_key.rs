//! Session key manager.
//!
//! A session key is a non-exportable P-256 key held by the [`SecureKeyStore`]
//! and addressed by alias. The root passkey signs a key authorization for it
//! once; afterwards ordinary transactions are signed by alias with no user
//! prompt, wrapped in a keychain (`0x03`) signature naming the owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::Address;
use bytes::Bytes;
use tracing::{debug, info, warn};

use pke_crypto::der::{normalize_low_s, parse_der_signature};
use pke_crypto::hash::keccak256;
use pke_crypto::rlp::{encode_list, Item};
use pke_crypto::signature::{P256PublicKey, P256Signature, SchemeSignature};
use pke_crypto::utils::addresses_match;

use crate::errors::EngineError;
use crate::keystore::{generate_with_fallback, new_alias, KeyTier, SecureKeyStore};
use crate::passkey::Assertion;
use crate::store::{SessionKeyRecord, SessionKeyStore, StoreError};

/// Seven days.
pub const DEFAULT_SESSION_VALIDITY_SECS: u64 = 7 * 24 * 60 * 60;

const ALIAS_PREFIX: &str = "pke-session";

// ============================================================================
// Clock
// ============================================================================

pub trait Clock: Send + Sync {
    /// Unix seconds.
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Key Authorization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    Secp256k1 = 0,
    P256 = 1,
    WebAuthn = 2,
}

/// `[chain_id, key_type, key_id, expiry?]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAuthorization {
    pub chain_id: u64,
    pub key_type: KeyType,
    pub key_id: Address,
    pub expiry: Option<u64>,
}

impl KeyAuthorization {
    pub fn to_item(&self) -> Item {
        let mut items = vec![
            Item::uint(self.chain_id),
            Item::uint(self.key_type as u64),
            Item::address(&self.key_id),
        ];
        if let Some(expiry) = self.expiry {
            items.push(Item::uint(expiry));
        }
        Item::List(items)
    }

    pub fn digest(&self) -> [u8; 32] {
        keccak256(&pke_crypto::rlp::encode(&self.to_item()))
    }
}

// ============================================================================
// Session Key
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub alias: String,
    pub public_key: P256PublicKey,
    pub address: Address,
    pub owner: Address,
    /// Root-signed delegation payload, set once delegation succeeded.
    pub key_authorization: Option<Bytes>,
    pub expires_at: u64,
    pub created_at: u64,
    pub pre_hash: bool,
}

impl SessionKey {
    pub fn to_record(&self) -> SessionKeyRecord {
        SessionKeyRecord {
            alias: self.alias.clone(),
            public_key_x: hex::encode(self.public_key.x),
            public_key_y: hex::encode(self.public_key.y),
            address: format!("{:#x}", self.address),
            owner: format!("{:#x}", self.owner),
            key_authorization: self
                .key_authorization
                .as_ref()
                .map(|b| format!("0x{}", hex::encode(b))),
            expires_at: self.expires_at,
            created_at: self.created_at,
            pre_hash: self.pre_hash,
        }
    }

    /// Rejects records whose fields do not parse or do not agree with each other.
    pub fn from_record(record: &SessionKeyRecord) -> Result<Self, StoreError> {
        if record.alias.is_empty() {
            return Err(StoreError::DataCorruption("empty key alias".into()));
        }
        let public_key = P256PublicKey::new(
            fixed_hex::<32>("public_key_x", &record.public_key_x)?,
            fixed_hex::<32>("public_key_y", &record.public_key_y)?,
        );
        let address = Address::from(fixed_hex::<20>("address", &record.address)?);
        if public_key.address() != address {
            return Err(StoreError::DataCorruption(
                "address does not match public key".into(),
            ));
        }
        let owner = Address::from(fixed_hex::<20>("owner", &record.owner)?);
        let key_authorization = match &record.key_authorization {
            Some(h) => Some(Bytes::from(
                hex::decode(h.trim_start_matches("0x"))
                    .map_err(|e| StoreError::DataCorruption(format!("key_authorization: {e}")))?,
            )),
            None => None,
        };

        Ok(Self {
            alias: record.alias.clone(),
            public_key,
            address,
            owner,
            key_authorization,
            expires_at: record.expires_at,
            created_at: record.created_at,
            pre_hash: record.pre_hash,
        })
    }
}

fn fixed_hex<const N: usize>(field: &str, s: &str) -> Result<[u8; N], StoreError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| StoreError::DataCorruption(format!("{field}: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        StoreError::DataCorruption(format!("{field}: expected {N} bytes, got {}", b.len()))
    })
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Clone)]
pub struct SessionKeyManager {
    keystore: Arc<dyn SecureKeyStore>,
    store: Arc<dyn SessionKeyStore>,
    clock: Arc<dyn Clock>,
    chain_id: u64,
    validity_secs: u64,
    preferred_tier: KeyTier,
}

impl SessionKeyManager {
    pub fn new(
        keystore: Arc<dyn SecureKeyStore>,
        store: Arc<dyn SessionKeyStore>,
        clock: Arc<dyn Clock>,
        chain_id: u64,
    ) -> Self {
        Self {
            keystore,
            store,
            clock,
            chain_id,
            validity_secs: DEFAULT_SESSION_VALIDITY_SECS,
            preferred_tier: KeyTier::StrongBox,
        }
    }

    pub fn with_validity(mut self, secs: u64) -> Self {
        self.validity_secs = secs;
        self
    }

    pub fn with_preferred_tier(mut self, tier: KeyTier) -> Self {
        self.preferred_tier = tier;
        self
    }

    pub fn keystore(&self) -> Arc<dyn SecureKeyStore> {
        self.keystore.clone()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Mint a fresh, not yet delegated key for `owner`.
    pub async fn generate(&self, owner: &Address) -> Result<SessionKey, EngineError> {
        let alias = new_alias(ALIAS_PREFIX)?;
        let (public_key, tier) =
            generate_with_fallback(self.keystore.as_ref(), &alias, self.preferred_tier).await?;
        let created_at = self.clock.now();
        let key = SessionKey {
            alias,
            address: public_key.address(),
            public_key,
            owner: *owner,
            key_authorization: None,
            expires_at: created_at.saturating_add(self.validity_secs),
            created_at,
            pre_hash: true,
        };
        info!(
            owner = %owner,
            session = %key.address,
            tier = %tier,
            expires_at = key.expires_at,
            "generated session key"
        );
        Ok(key)
    }

    pub fn key_authorization(&self, key: &SessionKey) -> KeyAuthorization {
        KeyAuthorization {
            chain_id: self.chain_id,
            key_type: KeyType::P256,
            key_id: key.address,
            expiry: Some(key.expires_at),
        }
    }

    /// Challenge the root passkey signs to delegate to `key`.
    pub fn build_authorization_digest(&self, key: &SessionKey) -> [u8; 32] {
        self.key_authorization(key).digest()
    }

    /// `[tuple, webauthn signature]`
    pub fn build_delegation_payload(&self, key: &SessionKey, assertion: &Assertion) -> Bytes {
        let tuple = self.key_authorization(key).to_item();
        let signature = Item::bytes(assertion.to_scheme_signature().encode());
        Bytes::from(encode_list(&[tuple, signature]))
    }

    /// Keychain signature over `digest`, signed in the key store by alias.
    pub async fn sign_transaction(&self, key: &SessionKey, digest: &[u8; 32]) -> Result<SchemeSignature, EngineError> {
        if !key.pre_hash {
            return Err(EngineError::InvalidSessionKey(
                "only pre-hashed session key signing is supported".into(),
            ));
        }
        if !self.keystore.alias_exists(&key.alias).await {
            return Err(EngineError::InvalidSessionKey(format!(
                "key alias {} no longer exists",
                key.alias
            )));
        }
        let der = self.keystore.sign_digest(&key.alias, digest).await?;
        let (r, s) = parse_der_signature(&der)?;
        let inner = SchemeSignature::P256(P256Signature {
            r,
            s: normalize_low_s(&s),
            public_key: key.public_key,
            pre_hash: true,
        });
        Ok(SchemeSignature::keychain(key.owner, inner))
    }

    /// Owner matches, alias exists, not expired. Evaluated fresh on every call.
    pub async fn is_valid(&self, key: &SessionKey, owner: &str) -> bool {
        if !addresses_match(&format!("{:#x}", key.owner), owner) {
            debug!(session = %key.address, "session key owner mismatch");
            return false;
        }
        if self.clock.now() >= key.expires_at {
            debug!(session = %key.address, expires_at = key.expires_at, "session key expired");
            return false;
        }
        if !self.keystore.alias_exists(&key.alias).await {
            debug!(session = %key.address, "session key alias missing");
            return false;
        }
        true
    }

    pub async fn persist(&self, key: &SessionKey) -> Result<(), EngineError> {
        self.store.save(key.to_record()).await?;
        debug!(owner = %key.owner, session = %key.address, "persisted session key");
        Ok(())
    }

    /// Saved key for `owner`. Unreadable records and records whose alias is
    /// gone are removed and reported as absent.
    pub async fn load(&self, owner: &Address) -> Result<Option<SessionKey>, EngineError> {
        let owner_hex = format!("{owner:#x}");
        let record = match self.store.load(&owner_hex).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(StoreError::DataCorruption(reason)) => {
                warn!(owner = %owner, reason = %reason, "clearing corrupt session key record");
                self.store.delete(&owner_hex).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let key = match SessionKey::from_record(&record) {
            Ok(key) => key,
            Err(e) => {
                warn!(owner = %owner, error = %e, "clearing malformed session key record");
                self.store.delete(&owner_hex).await?;
                // The alias may still exist even though the record is unusable.
                if let Err(e) = self.keystore.delete_alias(&record.alias).await {
                    warn!(alias = %record.alias, error = %e, "failed to delete alias of malformed record");
                }
                return Ok(None);
            }
        };

        if !self.keystore.alias_exists(&key.alias).await {
            warn!(owner = %owner, alias = %key.alias, "session key record has no backing key");
            self.store.delete(&owner_hex).await?;
            return Ok(None);
        }
        Ok(Some(key))
    }

    /// Remove both the record and the key store entry.
    pub async fn delete(&self, key: &SessionKey) -> Result<(), EngineError> {
        self.store.delete(&format!("{:#x}", key.owner)).await?;
        self.keystore.delete_alias(&key.alias).await?;
        info!(owner = %key.owner, session = %key.address, "deleted session key");
        Ok(())
    }

    /// Drop the key store entry of a key that was never persisted.
    pub async fn discard(&self, key: &SessionKey) {
        if let Err(e) = self.keystore.delete_alias(&key.alias).await {
            warn!(alias = %key.alias, error = %e, "failed to delete session key alias");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyStoreError, SoftwareKeyStore};
    use crate::store::InMemorySessionStore;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::Signature;
    use pke_crypto::rlp::decode;

    const T0: u64 = 1_700_000_000;

    struct Fixture {
        keystore: Arc<SoftwareKeyStore>,
        store: Arc<InMemorySessionStore>,
        clock: Arc<ManualClock>,
        manager: SessionKeyManager,
    }

    fn fixture() -> Fixture {
        let keystore = Arc::new(SoftwareKeyStore::new());
        let store = Arc::new(InMemorySessionStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let manager = SessionKeyManager::new(keystore.clone(), store.clone(), clock.clone(), 42431);
        Fixture {
            keystore,
            store,
            clock,
            manager,
        }
    }

    fn owner() -> Address {
        Address::repeat_byte(0xaa)
    }

    #[tokio::test]
    async fn test_generate_sets_policy_fields() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        assert!(key.pre_hash);
        assert_eq!(key.created_at, T0);
        assert_eq!(key.expires_at, T0 + DEFAULT_SESSION_VALIDITY_SECS);
        assert_eq!(key.address, key.public_key.address());
        assert!(f.keystore.alias_exists(&key.alias).await);
    }

    #[tokio::test]
    async fn test_valid_for_seven_days() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        let owner_hex = format!("{:#x}", owner());
        assert!(f.manager.is_valid(&key, &owner_hex).await);

        f.clock.advance(DEFAULT_SESSION_VALIDITY_SECS - 1);
        assert!(f.manager.is_valid(&key, &owner_hex).await);
        f.clock.advance(2);
        assert!(!f.manager.is_valid(&key, &owner_hex).await);
    }

    #[tokio::test]
    async fn test_invalid_conditions_independently() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        let owner_hex = format!("{:#x}", owner());

        // Case differences alone do not matter.
        assert!(f.manager.is_valid(&key, &owner_hex.to_uppercase().replace("0X", "0x")).await);

        // Owner differs.
        assert!(!f.manager.is_valid(&key, &format!("{:#x}", Address::repeat_byte(0xab))).await);

        // Expired, everything else fine.
        let mut expired = key.clone();
        expired.expires_at = T0;
        assert!(!f.manager.is_valid(&expired, &owner_hex).await);

        // Alias gone, everything else fine.
        assert!(f.manager.is_valid(&key, &owner_hex).await);
        f.keystore.delete_alias(&key.alias).await.unwrap();
        assert!(!f.manager.is_valid(&key, &owner_hex).await);
    }

    #[tokio::test]
    async fn test_authorization_tuple_layout() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        let auth = f.manager.key_authorization(&key);
        let item = decode(&pke_crypto::rlp::encode(&auth.to_item())).unwrap();
        let fields = item.as_list().unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].as_u64().unwrap(), 42431);
        assert_eq!(fields[1].as_u64().unwrap(), 1);
        assert_eq!(fields[2].as_bytes().unwrap(), key.address.as_slice());
        assert_eq!(fields[3].as_u64().unwrap(), key.expires_at);

        let mut no_expiry = auth.clone();
        no_expiry.expiry = None;
        assert_ne!(no_expiry.digest(), auth.digest());
        assert_eq!(f.manager.build_authorization_digest(&key), auth.digest());
    }

    #[tokio::test]
    async fn test_delegation_payload_wraps_tuple_and_signature() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        let assertion = Assertion {
            context_bytes: vec![0xde, 0xad],
            r: [1; 32],
            s: [2; 32],
            public_key: P256PublicKey::new([3; 32], [4; 32]),
        };
        let payload = f.manager.build_delegation_payload(&key, &assertion);
        let item = decode(&payload).unwrap();
        let parts = item.as_list().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], f.manager.key_authorization(&key).to_item());
        assert_eq!(parts[1].as_bytes().unwrap(), assertion.to_scheme_signature().encode().as_slice());
    }

    #[tokio::test]
    async fn test_sign_transaction_keychain_wrapper() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        let digest = [0x11u8; 32];
        let sig = f.manager.sign_transaction(&key, &digest).await.unwrap();

        let SchemeSignature::Keychain { owner: o, inner } = &sig else {
            panic!("expected keychain signature");
        };
        assert_eq!(*o, owner());
        let SchemeSignature::P256(p) = inner.as_ref() else {
            panic!("expected p256 inner signature");
        };
        assert!(p.pre_hash);
        assert!(pke_crypto::der::is_low_s(&p.s));

        let vk = key.public_key.to_verifying_key().unwrap();
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&p.r);
        rs[32..].copy_from_slice(&p.s);
        let s = Signature::from_slice(&rs).unwrap();
        vk.verify(&digest, &s).unwrap();

        let encoded = sig.encode();
        assert_eq!(encoded[0], 0x03);
        assert_eq!(&encoded[1..21], owner().as_slice());
        assert_eq!(encoded[21], 0x01);
    }

    #[tokio::test]
    async fn test_sign_transaction_refuses_unusable_keys() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();

        let mut raw = key.clone();
        raw.pre_hash = false;
        assert!(matches!(
            f.manager.sign_transaction(&raw, &[0; 32]).await,
            Err(EngineError::InvalidSessionKey(_))
        ));

        f.manager.discard(&key).await;
        assert!(matches!(
            f.manager.sign_transaction(&key, &[0; 32]).await,
            Err(EngineError::InvalidSessionKey(_))
        ));
    }

    #[tokio::test]
    async fn test_persist_load_delete() {
        let f = fixture();
        let mut key = f.manager.generate(&owner()).await.unwrap();
        key.key_authorization = Some(Bytes::from_static(&[0xc2, 0x01, 0x02]));
        f.manager.persist(&key).await.unwrap();

        assert_eq!(f.manager.load(&owner()).await.unwrap(), Some(key.clone()));

        f.manager.delete(&key).await.unwrap();
        assert_eq!(f.manager.load(&owner()).await.unwrap(), None);
        assert!(!f.keystore.alias_exists(&key.alias).await);
    }

    #[tokio::test]
    async fn test_load_clears_record_without_alias() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        f.manager.persist(&key).await.unwrap();
        f.keystore.delete_alias(&key.alias).await.unwrap();

        assert_eq!(f.manager.load(&owner()).await.unwrap(), None);
        assert!(f.store.load(&format!("{:#x}", owner())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_clears_inconsistent_record() {
        let f = fixture();
        let key = f.manager.generate(&owner()).await.unwrap();
        let mut record = key.to_record();
        record.address = format!("{:#x}", Address::repeat_byte(0x01));
        f.store.save(record).await.unwrap();

        assert_eq!(f.manager.load(&owner()).await.unwrap(), None);
        assert!(f.store.load(&format!("{:#x}", owner())).await.unwrap().is_none());
        assert!(!f.keystore.alias_exists(&key.alias).await);
    }

    /// Key store whose deletions always fail.
    struct StuckKeyStore(Arc<SoftwareKeyStore>);

    #[async_trait::async_trait]
    impl SecureKeyStore for StuckKeyStore {
        async fn generate_key_pair(&self, alias: &str, tier: KeyTier) -> Result<P256PublicKey, KeyStoreError> {
            self.0.generate_key_pair(alias, tier).await
        }

        async fn sign_digest(&self, alias: &str, digest: &[u8; 32]) -> Result<Vec<u8>, KeyStoreError> {
            self.0.sign_digest(alias, digest).await
        }

        async fn alias_exists(&self, alias: &str) -> bool {
            self.0.alias_exists(alias).await
        }

        async fn delete_alias(&self, _alias: &str) -> Result<(), KeyStoreError> {
            Err(KeyStoreError::Backend("keystore locked".into()))
        }
    }

    #[tokio::test]
    async fn test_load_clears_inconsistent_record_when_alias_delete_fails() {
        let f = fixture();
        let stuck = SessionKeyManager::new(
            Arc::new(StuckKeyStore(f.keystore.clone())),
            f.store.clone(),
            f.clock.clone(),
            42431,
        );
        let key = stuck.generate(&owner()).await.unwrap();
        let mut record = key.to_record();
        record.address = format!("{:#x}", Address::repeat_byte(0x01));
        f.store.save(record).await.unwrap();

        assert_eq!(stuck.load(&owner()).await.unwrap(), None);
        assert!(f.store.load(&format!("{:#x}", owner())).await.unwrap().is_none());
        assert!(f.keystore.alias_exists(&key.alias).await);
    }
}
