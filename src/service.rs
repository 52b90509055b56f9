// service.rs - Shared broker state and cross-engine operations
//
// AppState is the explicit handle every handler receives: engines, stores,
// the connection table, and per-wallet write locks. Nothing here is a
// process-wide singleton, so tests instantiate parallel brokers freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, Address};
use alloy::signers::local::PrivateKeySigner;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::app_sessions::AppSessions;
use crate::auth::AuthManager;
use crate::channels::{Channels, SettlementOracle};
use crate::config::Config;
use crate::crypto::SigVerifier;
use crate::db::Store;
use crate::envelope;
use crate::error::RpcError;
use crate::ledger::{Ledger, Leg};
use crate::logger::RpcLogger;
use crate::model::{
    address_key, now_ms, Asset, LedgerTxType, NotificationEvent, TransferParams,
    TransferResponse, NOTIFY_BALANCE_UPDATE, NOTIFY_TRANSFER,
};
use crate::session_keys::SessionKeyRegistry;

// =============================================================================
// CONNECTION TABLE
// =============================================================================

/// Sharded registry of live connections and their outboxes. Senders are
/// unbounded so a slow subscriber never blocks a commit; the per-connection
/// writer task drains them in commit order.
pub struct ConnectionTable {
    connections: DashMap<u64, ConnectionHandle>,
    by_wallet: DashMap<Address, Vec<u64>>,
    next_id: AtomicU64,
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<String>,
    wallet: Option<Address>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_wallet: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, sender: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(id, ConnectionHandle { sender, wallet: None });
        id
    }

    pub fn bind_wallet(&self, connection_id: u64, wallet: Address) {
        if let Some(mut handle) = self.connections.get_mut(&connection_id) {
            handle.wallet = Some(wallet);
        }
        self.by_wallet.entry(wallet).or_default().push(connection_id);
    }

    pub fn remove(&self, connection_id: u64) {
        if let Some((_, handle)) = self.connections.remove(&connection_id) {
            if let Some(wallet) = handle.wallet {
                if let Some(mut ids) = self.by_wallet.get_mut(&wallet) {
                    ids.retain(|id| *id != connection_id);
                }
            }
        }
    }

    /// Best-effort delivery to every connection of the given wallets. A
    /// closed connection is simply skipped.
    pub fn send_to_wallets(&self, wallets: &[Address], frame: &str) {
        for wallet in wallets {
            if let Some(ids) = self.by_wallet.get(wallet) {
                for id in ids.iter() {
                    if let Some(handle) = self.connections.get(id) {
                        let _ = handle.sender.send(frame.to_string());
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub assets: Arc<Vec<Asset>>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<SessionKeyRegistry>,
    pub auth: Arc<AuthManager>,
    pub channels: Arc<Channels>,
    pub app_sessions: Arc<AppSessions>,
    pub verifier: SigVerifier,
    pub broker_signer: PrivateKeySigner,
    pub connections: Arc<ConnectionTable>,
    wallet_locks: Arc<DashMap<Address, Arc<Mutex<()>>>>,
    user_tags: Arc<RwLock<TagMaps>>,
    oracle: Option<Arc<dyn SettlementOracle>>,
    pub logger: RpcLogger,
}

#[derive(Default)]
struct TagMaps {
    by_wallet: HashMap<String, String>,
    by_tag: HashMap<String, String>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        assets: Vec<Asset>,
        broker_signer: PrivateKeySigner,
        verifier: SigVerifier,
        oracle: Option<Arc<dyn SettlementOracle>>,
    ) -> Self {
        let assets = Arc::new(assets);
        let ledger = Arc::new(Ledger::new(store.clone()));
        let registry = Arc::new(SessionKeyRegistry::new(store.clone()));
        let channels = Arc::new(Channels::new(
            store.clone(),
            ledger.clone(),
            assets.clone(),
            broker_signer.address(),
            config.chain_id,
            config.custody_address,
        ));
        let app_sessions = Arc::new(AppSessions::new(
            ledger.clone(),
            registry.clone(),
            channels.clone(),
            store.clone(),
        ));
        let auth = Arc::new(AuthManager::new(
            config.jwt_secret.clone(),
            config.challenge_ttl_secs,
            config.chain_id,
            config.custody_address,
        ));

        Self {
            config,
            store,
            assets,
            ledger,
            registry,
            auth,
            channels,
            app_sessions,
            verifier,
            broker_signer,
            connections: Arc::new(ConnectionTable::new()),
            wallet_locks: Arc::new(DashMap::new()),
            user_tags: Arc::new(RwLock::new(TagMaps::default())),
            oracle,
            logger: RpcLogger::named("clearnode"),
        }
    }

    /// Load persisted state into the engines. Called once at startup.
    pub async fn load(&self) -> Result<(), RpcError> {
        let state = self.store.load_state().await?;
        self.ledger.load(&state).await;
        self.registry.load(state.session_keys.clone()).await;
        self.channels.load(state.channels.clone()).await;
        self.app_sessions.load(state.app_sessions.clone()).await;

        let mut tags = self.user_tags.write().await;
        for (wallet, tag) in state.user_tags {
            tags.by_tag.insert(tag.clone(), wallet.clone());
            tags.by_wallet.insert(wallet, tag);
        }
        Ok(())
    }

    /// Single-writer lock for one wallet's mutating requests.
    pub fn wallet_lock(&self, wallet: Address) -> Arc<Mutex<()>> {
        self.wallet_locks
            .entry(wallet)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // User tags
    // =========================================================================

    /// Short transfer tag for a wallet, created on first use.
    pub async fn user_tag(&self, wallet: Address) -> Result<String, RpcError> {
        let wallet_key = address_key(wallet);
        {
            let tags = self.user_tags.read().await;
            if let Some(tag) = tags.by_wallet.get(&wallet_key) {
                return Ok(tag.clone());
            }
        }

        let digest = keccak256(wallet.as_slice());
        let tag = hex::encode(&digest[..4]);
        self.store.save_user_tag(&wallet_key, &tag).await?;

        let mut tags = self.user_tags.write().await;
        tags.by_tag.insert(tag.clone(), wallet_key.clone());
        tags.by_wallet.insert(wallet_key, tag.clone());
        Ok(tag)
    }

    pub async fn wallet_by_tag(&self, tag: &str) -> Option<String> {
        self.user_tags.read().await.by_tag.get(tag).cloned()
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Wallet-to-wallet ledger transfer, addressed by wallet or user tag.
    pub async fn transfer(
        &self,
        wallet: Address,
        params: TransferParams,
    ) -> Result<(TransferResponse, Vec<NotificationEvent>), RpcError> {
        let destination = match (&params.destination, &params.destination_user_tag) {
            (Some(address), _) => address_key(*address),
            (None, Some(tag)) => self
                .wallet_by_tag(tag)
                .await
                .ok_or_else(|| RpcError::invalid(format!("unknown user tag: {}", tag)))?,
            (None, None) => {
                return Err(RpcError::invalid("destination is required".to_string()))
            }
        };
        let from = address_key(wallet);
        if destination == from {
            return Err(RpcError::invalid("transfer to self".to_string()));
        }
        if params.allocations.is_empty() {
            return Err(RpcError::invalid("allocations must not be empty".to_string()));
        }

        let holders = self.channel_holders(wallet).await;
        let mut legs = Vec::with_capacity(params.allocations.len());
        for allocation in &params.allocations {
            if allocation.amount <= Decimal::ZERO {
                return Err(RpcError::invalid("non-positive transfer amount".to_string()));
            }
            if self
                .channels
                .has_non_zero_allocation(&holders, &allocation.asset)
                .await
            {
                return Err(RpcError::denied("non-zero allocation detected"));
            }
            legs.push(Leg {
                tx_type: LedgerTxType::Transfer,
                from: from.clone(),
                to: destination.clone(),
                asset: allocation.asset.clone(),
                amount: allocation.amount,
            });
        }

        let transactions = self.ledger.commit(legs).await?;

        let destination_address = crate::crypto::parse_address(&destination)?;
        let events = vec![
            NotificationEvent {
                method: NOTIFY_TRANSFER,
                wallets: vec![wallet, destination_address],
                payload: serde_json::to_value(&transactions).unwrap_or_default(),
            },
            NotificationEvent {
                method: NOTIFY_BALANCE_UPDATE,
                wallets: vec![wallet],
                payload: serde_json::json!({ "wallet": from }),
            },
            NotificationEvent {
                method: NOTIFY_BALANCE_UPDATE,
                wallets: vec![destination_address],
                payload: serde_json::json!({ "wallet": destination }),
            },
        ];

        Ok((
            TransferResponse { from, to: destination, transactions },
            events,
        ))
    }

    /// Every address a wallet is known by on channels (legacy channels may
    /// record a session key).
    pub async fn channel_holders(&self, wallet: Address) -> Vec<Address> {
        let mut holders = vec![wallet];
        for key in self.registry.list_for_wallet(wallet).await {
            if key.is_active(now_ms()) {
                holders.push(key.address);
            }
        }
        holders
    }

    // =========================================================================
    // Notification fan-out
    // =========================================================================

    /// Sign and enqueue notifications. Best-effort: delivery failures are
    /// logged and never unwind the commit that produced the events.
    pub async fn broadcast(&self, events: Vec<NotificationEvent>) {
        for event in events {
            let message = envelope::create_response(
                0,
                event.method,
                serde_json::json!([event.payload]),
                now_ms(),
                None,
                None,
            );
            match envelope::sign_message(message, &self.broker_signer).await {
                Ok(signed) => {
                    self.connections.send_to_wallets(&event.wallets, &signed.to_wire());
                }
                Err(err) => {
                    self.logger.warn(
                        "failed to sign notification",
                        &[("method", event.method.to_string()), ("error", err.to_string())],
                    );
                }
            }
        }
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Reapers: expired challenge pruning, session key expiry sweep, and the
    /// settlement oracle poll. Runs until the process exits.
    pub fn spawn_background_tasks(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                state.auth.prune_expired();
                state.registry.sweep_expired().await;
                if let Some(oracle) = &state.oracle {
                    if let Err(err) = state.channels.refresh_from_oracle(oracle.as_ref()).await {
                        state
                            .logger
                            .warn("oracle refresh failed", &[("error", err.to_string())]);
                    }
                }
            }
        });
    }
}
