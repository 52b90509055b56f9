// session_keys.rs - Session key registry
//
// Tracks every session key a wallet has authorized: scope, per-asset
// lifetime caps, cumulative usage, expiry, revocation. Debits are
// linearized behind the registry write lock; `used` never exceeds the cap
// and never decreases for a committed operation.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::db::Store;
use crate::error::RpcError;
use crate::model::{address_key, now_ms, SessionKey, SCOPE_CLEARNODE};

pub struct SessionKeyRegistry {
    keys: Arc<RwLock<HashMap<Address, SessionKey>>>,
    store: Arc<dyn Store>,
}

impl SessionKeyRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            store,
        }
    }

    pub async fn load(&self, keys: Vec<SessionKey>) {
        let mut map = self.keys.write().await;
        for key in keys {
            map.insert(key.address, key);
        }
    }

    /// Register a key issued by auth_verify. Idempotent for the same wallet:
    /// allowance caps, scope, and expiry refresh, but cumulative usage
    /// carries over so a refresh can never mint spending headroom.
    pub async fn register(&self, key: SessionKey) -> Result<(), RpcError> {
        let mut map = self.keys.write().await;
        let stored = match map.get(&key.address) {
            Some(existing) if existing.wallet != key.wallet => {
                return Err(RpcError::SessionKeyConflict);
            }
            Some(existing) => {
                let mut refreshed = key;
                refreshed.used = existing.used.clone();
                refreshed.created_at = existing.created_at;
                refreshed
            }
            None => key,
        };
        self.store.save_session_key(&stored).await?;
        map.insert(stored.address, stored);
        Ok(())
    }

    pub async fn get(&self, address: Address) -> Option<SessionKey> {
        self.keys.read().await.get(&address).cloned()
    }

    pub async fn list_for_wallet(&self, wallet: Address) -> Vec<SessionKey> {
        let map = self.keys.read().await;
        let mut keys: Vec<SessionKey> =
            map.values().filter(|k| k.wallet == wallet).cloned().collect();
        keys.sort_by_key(|k| k.created_at);
        keys
    }

    /// If `candidate` is an active session key, return its owner wallet.
    /// Revoked and expired keys resolve to nothing, which surfaces upstream
    /// as an unknown-signer signature failure.
    pub async fn resolve_signer(&self, candidate: Address) -> Option<Address> {
        let map = self.keys.read().await;
        let key = map.get(&candidate)?;
        key.is_active(now_ms()).then_some(key.wallet)
    }

    pub async fn is_active_key_of(&self, wallet: Address, address: Address) -> bool {
        let map = self.keys.read().await;
        map.get(&address)
            .map(|k| k.wallet == wallet && k.is_active(now_ms()))
            .unwrap_or(false)
    }

    /// Atomically increase `used[asset]`. Fails without applying anything if
    /// the post-condition would exceed the lifetime cap.
    pub async fn debit(
        &self,
        address: Address,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), RpcError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        let mut map = self.keys.write().await;
        let key = map
            .get_mut(&address)
            .ok_or_else(|| RpcError::UnknownSessionKey(address_key(address)))?;
        if !key.is_active(now_ms()) {
            return Err(RpcError::InvalidSignature(
                "signature from unknown participant wallet".to_string(),
            ));
        }

        let spent = key.used_for(asset);
        if spent + amount > key.cap_for(asset) {
            return Err(RpcError::InsufficientAllowance);
        }
        key.used.insert(asset.to_string(), spent + amount);
        let snapshot = key.clone();
        // Persist before releasing the lock so store writes cannot reorder.
        self.store.save_session_key(&snapshot).await
    }

    /// Compensation for a ledger commit that failed after its allowance
    /// reservation. Only invoked on abort paths; committed usage never
    /// decreases.
    pub async fn undo_debit(&self, address: Address, asset: &str, amount: Decimal) {
        let mut map = self.keys.write().await;
        if let Some(key) = map.get_mut(&address) {
            let spent = key.used_for(asset);
            key.used.insert(asset.to_string(), (spent - amount).max(Decimal::ZERO));
        }
    }

    /// Revoke a key. Allowed for the owner wallet, the key itself, or any
    /// key carrying the clearnode scope.
    pub async fn revoke(&self, caller: Address, target: Address) -> Result<(), RpcError> {
        let mut map = self.keys.write().await;

        let caller_is_privileged = map
            .get(&caller)
            .map(|k| k.scope == SCOPE_CLEARNODE && k.is_active(now_ms()))
            .unwrap_or(false);

        let owner = map
            .get(&target)
            .map(|k| k.wallet)
            .ok_or_else(|| RpcError::UnknownSessionKey(address_key(target)))?;

        let permitted = caller == owner || caller == target || caller_is_privileged;
        if !permitted {
            if map.contains_key(&caller) {
                return Err(RpcError::InsufficientPermission);
            }
            return Err(RpcError::NotActiveSessionKey);
        }

        let snapshot = match map.get_mut(&target) {
            Some(key) => {
                key.revoked = true;
                key.clone()
            }
            None => return Err(RpcError::UnknownSessionKey(address_key(target))),
        };
        self.store.save_session_key(&snapshot).await
    }

    /// Background reaper: mark expired keys revoked.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut swept = Vec::new();
        {
            let mut map = self.keys.write().await;
            for key in map.values_mut() {
                if !key.revoked && key.is_expired(now) {
                    key.revoked = true;
                    swept.push(key.clone());
                }
            }
        }
        for key in &swept {
            if let Err(err) = self.store.save_session_key(key).await {
                tracing::warn!(error = %err, "failed to persist expired session key");
            }
        }
        swept.len()
    }

    /// Drop revoked and expired keys from the in-memory cache. Exposed only
    /// through the test-only cleanup RPC.
    pub async fn cleanup_cache(&self) -> usize {
        let now = now_ms();
        let mut map = self.keys.write().await;
        let before = map.len();
        map.retain(|_, key| key.is_active(now));
        before - map.len()
    }
}
