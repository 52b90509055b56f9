// app_sessions.rs - App session engine
//
// Owns every mutation of app sessions and their allocations: create,
// submit (operate / deposit / withdraw), close. Versions are strictly
// monotonic, updates are quorum-gated by weighted signatures, deposits
// debit session key allowances, and every balance move goes through the
// ledger in one atomic batch.
//
// Mutations on one session are linearized behind a per-session mutex;
// the caller additionally serializes per wallet.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alloy::primitives::{keccak256, Address};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use crate::channels::Channels;
use crate::crypto;
use crate::db::Store;
use crate::error::RpcError;
use crate::ledger::{Ledger, Leg};
use crate::model::{
    address_key, now_ms, AppAllocation, AppSession, AppSessionView, CloseAppSessionParams,
    CreateAppSessionParams, GetAppSessionsParams, Intent, LedgerTxType, NotificationEvent,
    Protocol, SessionStatus, SubmitAppStateParams, NOTIFY_APP_SESSION_UPDATE,
    NOTIFY_BALANCE_UPDATE,
};
use crate::session_keys::SessionKeyRegistry;

/// Minimum on-chain challenge period accepted at create, in seconds.
pub const MIN_CHALLENGE_PERIOD: u64 = 3600;

/// Wallets that signed a request, resolved from the recovered signature
/// candidates. The value is the session key that signed on the wallet's
/// behalf, or None when the wallet key signed directly.
type ResolvedSigners = HashMap<Address, Option<Address>>;

pub struct AppSessions {
    sessions: Arc<RwLock<HashMap<String, AppSession>>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    ledger: Arc<Ledger>,
    registry: Arc<SessionKeyRegistry>,
    channels: Arc<Channels>,
    store: Arc<dyn Store>,
}

impl AppSessions {
    pub fn new(
        ledger: Arc<Ledger>,
        registry: Arc<SessionKeyRegistry>,
        channels: Arc<Channels>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            locks: DashMap::new(),
            ledger,
            registry,
            channels,
            store,
        }
    }

    pub async fn load(&self, sessions: Vec<AppSession>) {
        let mut map = self.sessions.write().await;
        for session in sessions {
            map.insert(session.id.clone(), session);
        }
    }

    fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Signature resolution
    // =========================================================================

    /// Map each signature to a participant wallet: either the recovered
    /// address is a participant itself (wallet-signed, or a legacy channel
    /// that recorded a session key as participant), or it is an active
    /// session key owned by a participant.
    async fn resolve_signers(
        &self,
        payload: &[u8],
        signatures: &[String],
        participants: &[Address],
    ) -> ResolvedSigners {
        let mut signers: ResolvedSigners = HashMap::new();
        for signature in signatures {
            for candidate in crypto::recover_candidates(payload, signature) {
                if participants.contains(&candidate) {
                    signers.insert(candidate, None);
                } else if let Some(owner) = self.registry.resolve_signer(candidate).await {
                    if participants.contains(&owner) {
                        signers.entry(owner).or_insert(Some(candidate));
                    }
                }
            }
        }
        signers
    }

    fn signed_weight(session_participants: &[Address], weights: &[u64], signers: &ResolvedSigners) -> u64 {
        session_participants
            .iter()
            .zip(weights)
            .filter(|(participant, _)| signers.contains_key(*participant))
            .map(|(_, weight)| *weight)
            .sum()
    }

    fn require_quorum(
        participants: &[Address],
        weights: &[u64],
        quorum: u64,
        signers: &ResolvedSigners,
    ) -> Result<(), RpcError> {
        let have = Self::signed_weight(participants, weights, signers);
        if have < quorum {
            return Err(RpcError::QuorumNotReached { have, need: quorum });
        }
        Ok(())
    }

    // =========================================================================
    // Funding helpers
    // =========================================================================

    /// All addresses a wallet is known by on channels: itself plus its
    /// active session keys (historical channels recorded those).
    async fn channel_holders(&self, wallet: Address) -> Vec<Address> {
        let mut holders = vec![wallet];
        for key in self.registry.list_for_wallet(wallet).await {
            if key.is_active(now_ms()) {
                holders.push(key.address);
            }
        }
        holders
    }

    /// Debit each funding session key; on any failure undo what was taken
    /// and surface the error, so a rejected request leaves no trace.
    async fn debit_allowances(
        &self,
        debits: &[(Address, String, Decimal)],
    ) -> Result<(), RpcError> {
        for (index, (key, asset, amount)) in debits.iter().enumerate() {
            if let Err(err) = self.registry.debit(*key, asset, *amount).await {
                for (key, asset, amount) in &debits[..index] {
                    self.registry.undo_debit(*key, asset, *amount).await;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn undo_allowances(&self, debits: &[(Address, String, Decimal)]) {
        for (key, asset, amount) in debits {
            self.registry.undo_debit(*key, asset, *amount).await;
        }
    }

    fn notifications(&self, session: &AppSession, touched_wallets: &[Address]) -> Vec<NotificationEvent> {
        let view = AppSessionView::from_session(session);
        let mut events = vec![NotificationEvent {
            method: NOTIFY_APP_SESSION_UPDATE,
            wallets: session.definition.participants.clone(),
            payload: serde_json::to_value(&view).unwrap_or_default(),
        }];
        for wallet in touched_wallets {
            events.push(NotificationEvent {
                method: NOTIFY_BALANCE_UPDATE,
                wallets: vec![*wallet],
                payload: serde_json::json!({ "wallet": address_key(*wallet) }),
            });
        }
        events
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create(
        &self,
        params: CreateAppSessionParams,
        payload: &[u8],
        signatures: &[String],
    ) -> Result<(AppSessionView, Vec<NotificationEvent>), RpcError> {
        let definition = &params.definition;

        if definition.participants.is_empty() {
            return Err(RpcError::invalid("participants must not be empty".to_string()));
        }
        if definition.weights.len() != definition.participants.len() {
            return Err(RpcError::invalid(
                "weights and participants must have the same length".to_string(),
            ));
        }
        let total_weight: u64 = definition.weights.iter().sum();
        if definition.quorum == 0 || definition.quorum > total_weight {
            return Err(RpcError::invalid(format!(
                "quorum {} outside (0, {}]",
                definition.quorum, total_weight
            )));
        }
        if definition.challenge < MIN_CHALLENGE_PERIOD {
            return Err(RpcError::invalid(format!(
                "challenge period below minimum of {} seconds",
                MIN_CHALLENGE_PERIOD
            )));
        }

        let mut requested: HashMap<String, HashMap<Address, Decimal>> = HashMap::new();
        for allocation in &params.allocations {
            if !definition.participants.contains(&allocation.participant) {
                return Err(RpcError::invalid(format!(
                    "allocation for unknown participant {}",
                    address_key(allocation.participant)
                )));
            }
            if allocation.amount < Decimal::ZERO {
                return Err(RpcError::invalid("negative allocation amount".to_string()));
            }
            let slot = requested
                .entry(allocation.asset.clone())
                .or_default()
                .insert(allocation.participant, allocation.amount);
            if slot.is_some() {
                return Err(RpcError::invalid(format!(
                    "duplicate allocation for participant {}",
                    address_key(allocation.participant)
                )));
            }
        }

        let signers = self
            .resolve_signers(payload, signatures, &definition.participants)
            .await;
        Self::require_quorum(
            &definition.participants,
            &definition.weights,
            definition.quorum,
            &signers,
        )?;

        // Funding checks per contributor.
        let mut debits: Vec<(Address, String, Decimal)> = Vec::new();
        let mut legs: Vec<Leg> = Vec::new();
        let mut touched: Vec<Address> = Vec::new();

        let participant_set: BTreeSet<Address> = definition.participants.iter().copied().collect();
        let mut id_preimage = Vec::new();
        id_preimage.extend_from_slice(definition.application.as_slice());
        for participant in &participant_set {
            id_preimage.extend_from_slice(participant.as_slice());
        }
        id_preimage.extend_from_slice(&definition.nonce.to_be_bytes());
        let session_id = format!("0x{:x}", keccak256(&id_preimage));

        for (asset, per_participant) in &requested {
            for (participant, amount) in per_participant {
                if amount.is_zero() {
                    continue;
                }
                let holders = self.channel_holders(*participant).await;
                if self.channels.has_non_zero_allocation(&holders, asset).await {
                    return Err(RpcError::denied("non-zero allocation detected"));
                }
                match signers.get(participant) {
                    None => return Err(RpcError::denied("depositor signature is required")),
                    Some(Some(session_key)) => {
                        debits.push((*session_key, asset.clone(), *amount));
                    }
                    Some(None) => {}
                }
                legs.push(Leg {
                    tx_type: LedgerTxType::AppDeposit,
                    from: address_key(*participant),
                    to: session_id.clone(),
                    asset: asset.clone(),
                    amount: *amount,
                });
                touched.push(*participant);
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions.values().any(|s| {
            s.definition.nonce == definition.nonce
                && s.definition.application == definition.application
                && s.definition.participants.iter().copied().collect::<BTreeSet<_>>()
                    == participant_set
        }) {
            return Err(RpcError::denied("nonce already used for this application"));
        }
        if sessions.contains_key(&session_id) {
            return Err(RpcError::denied("app session already exists"));
        }

        self.debit_allowances(&debits).await?;
        if let Err(err) = self.ledger.commit(legs).await {
            self.undo_allowances(&debits).await;
            return Err(err);
        }

        let now = now_ms();
        let session = AppSession {
            id: session_id.clone(),
            definition: params.definition,
            version: 1,
            status: SessionStatus::Open,
            session_data: params.session_data,
            allocations: requested,
            created_at: now,
            updated_at: now,
        };
        self.store.save_app_session(&session).await?;

        let view = AppSessionView::from_session(&session);
        let events = self.notifications(&session, &touched);
        sessions.insert(session_id, session);
        Ok((view, events))
    }

    // =========================================================================
    // Submit
    // =========================================================================

    pub async fn submit(
        &self,
        params: SubmitAppStateParams,
        payload: &[u8],
        signatures: &[String],
    ) -> Result<(AppSessionView, Vec<NotificationEvent>), RpcError> {
        let lock = self.session_lock(&params.app_session_id);
        let _guard = lock.lock().await;

        let current = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&params.app_session_id)
                .cloned()
                .ok_or_else(|| RpcError::AppSessionNotFound(params.app_session_id.clone()))?
        };

        if current.status != SessionStatus::Open {
            return Err(RpcError::denied("app session is not open"));
        }

        let definition = &current.definition;
        let intent = match definition.protocol {
            Protocol::V02 => match params.intent {
                None | Some(Intent::Operate) => Intent::Operate,
                Some(_) => return Err(RpcError::denied("unsupported in protocol")),
            },
            Protocol::V04 => params.intent.unwrap_or(Intent::Operate),
        };

        let next_version = match definition.protocol {
            Protocol::V02 => current.version + 1,
            Protocol::V04 => {
                let requested = params
                    .version
                    .ok_or_else(|| RpcError::invalid("version is required".to_string()))?;
                if requested != current.version + 1 {
                    return Err(RpcError::IncorrectVersion {
                        expected: current.version + 1,
                        got: requested,
                    });
                }
                requested
            }
        };

        let proposed = Self::build_allocation_matrix(&current, &params.allocations)?;

        let signers = self
            .resolve_signers(payload, signatures, &definition.participants)
            .await;
        Self::require_quorum(
            &definition.participants,
            &definition.weights,
            definition.quorum,
            &signers,
        )?;

        // Per-asset delta rules.
        let mut debits: Vec<(Address, String, Decimal)> = Vec::new();
        let mut legs: Vec<Leg> = Vec::new();
        let mut touched: Vec<Address> = Vec::new();

        for (asset, per_participant) in &proposed {
            let old_total = current.total(asset);
            let new_total: Decimal = per_participant.values().copied().sum();
            let delta = new_total - old_total;

            match intent {
                Intent::Operate => {
                    if !delta.is_zero() {
                        return Err(RpcError::denied("non-zero allocations sum delta"));
                    }
                }
                Intent::Deposit => {
                    if delta < Decimal::ZERO {
                        return Err(RpcError::denied("non-positive allocations sum delta"));
                    }
                    for (participant, amount) in per_participant {
                        let previous = current.allocation_of(asset, *participant);
                        let increase = *amount - previous;
                        if increase < Decimal::ZERO {
                            return Err(RpcError::denied(format!(
                                "decreased allocation for participant {}",
                                address_key(*participant)
                            )));
                        }
                        if increase.is_zero() {
                            continue;
                        }
                        match signers.get(participant) {
                            None => {
                                return Err(RpcError::denied("depositor signature is required"))
                            }
                            Some(Some(session_key)) => {
                                debits.push((*session_key, asset.clone(), increase));
                            }
                            Some(None) => {}
                        }

                        let holders = self.channel_holders(*participant).await;
                        if self.channels.has_non_zero_allocation(&holders, asset).await {
                            return Err(RpcError::denied("non-zero allocation detected"));
                        }
                        let wallet_key = address_key(*participant);
                        if self.ledger.unified_balance(&wallet_key, asset).await < increase {
                            return Err(RpcError::denied("insufficient unified balance"));
                        }

                        legs.push(Leg {
                            tx_type: LedgerTxType::AppDeposit,
                            from: wallet_key,
                            to: current.id.clone(),
                            asset: asset.clone(),
                            amount: increase,
                        });
                        touched.push(*participant);
                    }
                }
                Intent::Withdraw => {
                    if delta > Decimal::ZERO {
                        return Err(RpcError::denied("non-negative allocations sum delta"));
                    }
                    for (participant, amount) in per_participant {
                        let previous = current.allocation_of(asset, *participant);
                        let decrease = previous - *amount;
                        if decrease < Decimal::ZERO {
                            return Err(RpcError::denied(format!(
                                "increased allocation for participant {}",
                                address_key(*participant)
                            )));
                        }
                        if decrease.is_zero() {
                            continue;
                        }
                        legs.push(Leg {
                            tx_type: LedgerTxType::AppWithdraw,
                            from: current.id.clone(),
                            to: address_key(*participant),
                            asset: asset.clone(),
                            amount: decrease,
                        });
                        touched.push(*participant);
                    }
                }
            }
        }

        // The declared intent must actually move funds in its direction.
        if intent == Intent::Deposit && legs.is_empty() {
            return Err(RpcError::denied("non-positive allocations sum delta"));
        }
        if intent == Intent::Withdraw && legs.is_empty() {
            return Err(RpcError::denied("non-negative allocations sum delta"));
        }

        self.debit_allowances(&debits).await?;
        if let Err(err) = self.ledger.commit(legs).await {
            self.undo_allowances(&debits).await;
            return Err(err);
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&current.id)
            .ok_or_else(|| RpcError::AppSessionNotFound(current.id.clone()))?;
        session.version = next_version;
        session.allocations = proposed;
        if params.session_data.is_some() {
            session.session_data = params.session_data;
        }
        session.updated_at = now_ms();
        self.store.save_app_session(session).await?;

        let view = AppSessionView::from_session(session);
        let events = self.notifications(session, &touched);
        Ok((view, events))
    }

    /// Validate the proposed allocation list against the session: no unknown
    /// participants, no duplicates, no negative amounts, and for every asset
    /// already in the session a complete participant matrix.
    fn build_allocation_matrix(
        session: &AppSession,
        allocations: &[AppAllocation],
    ) -> Result<HashMap<String, HashMap<Address, Decimal>>, RpcError> {
        let mut proposed: HashMap<String, HashMap<Address, Decimal>> = HashMap::new();
        for allocation in allocations {
            if !session.definition.participants.contains(&allocation.participant) {
                return Err(RpcError::invalid(format!(
                    "allocation for unknown participant {}",
                    address_key(allocation.participant)
                )));
            }
            if allocation.amount < Decimal::ZERO {
                return Err(RpcError::invalid("negative allocation amount".to_string()));
            }
            let slot = proposed
                .entry(allocation.asset.clone())
                .or_default()
                .insert(allocation.participant, allocation.amount);
            if slot.is_some() {
                return Err(RpcError::invalid(format!(
                    "duplicate allocation for participant {}",
                    address_key(allocation.participant)
                )));
            }
        }

        for (asset, existing) in &session.allocations {
            let submitted = proposed.get(asset).ok_or_else(|| {
                RpcError::invalid(format!("allocations missing for asset {}", asset))
            })?;
            for participant in existing.keys() {
                if !submitted.contains_key(participant) {
                    return Err(RpcError::invalid(format!(
                        "allocations missing participant {} for asset {}",
                        address_key(*participant),
                        asset
                    )));
                }
            }
        }

        Ok(proposed)
    }

    // =========================================================================
    // Close
    // =========================================================================

    pub async fn close(
        &self,
        params: CloseAppSessionParams,
        payload: &[u8],
        signatures: &[String],
    ) -> Result<(AppSessionView, Vec<NotificationEvent>), RpcError> {
        let lock = self.session_lock(&params.app_session_id);
        let _guard = lock.lock().await;

        let current = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&params.app_session_id)
                .cloned()
                .ok_or_else(|| RpcError::AppSessionNotFound(params.app_session_id.clone()))?
        };
        if current.status != SessionStatus::Open {
            return Err(RpcError::denied("app session is not open"));
        }

        let final_allocations = Self::build_allocation_matrix(&current, &params.allocations)?;

        // Close is balance-preserving per asset.
        for (asset, per_participant) in &final_allocations {
            let final_total: Decimal = per_participant.values().copied().sum();
            if final_total != current.total(asset) {
                return Err(RpcError::denied("non-zero allocations sum delta"));
            }
        }

        let definition = &current.definition;
        let signers = self
            .resolve_signers(payload, signatures, &definition.participants)
            .await;
        Self::require_quorum(
            &definition.participants,
            &definition.weights,
            definition.quorum,
            &signers,
        )?;

        let mut legs: Vec<Leg> = Vec::new();
        let mut touched: Vec<Address> = Vec::new();
        for (asset, per_participant) in &final_allocations {
            for (participant, amount) in per_participant {
                if amount.is_zero() {
                    continue;
                }
                legs.push(Leg {
                    tx_type: LedgerTxType::AppWithdraw,
                    from: current.id.clone(),
                    to: address_key(*participant),
                    asset: asset.clone(),
                    amount: *amount,
                });
                touched.push(*participant);
            }
        }
        self.ledger.commit(legs).await?;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&current.id)
            .ok_or_else(|| RpcError::AppSessionNotFound(current.id.clone()))?;
        session.status = SessionStatus::Closed;
        session.version += 1;
        session.allocations = final_allocations;
        if params.session_data.is_some() {
            session.session_data = params.session_data;
        }
        session.updated_at = now_ms();
        self.store.save_app_session(session).await?;

        let view = AppSessionView::from_session(session);
        let events = self.notifications(session, &touched);
        Ok((view, events))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: &str) -> Option<AppSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self, params: &GetAppSessionsParams) -> Vec<AppSessionView> {
        let sessions = self.sessions.read().await;
        let mut views: Vec<AppSessionView> = sessions
            .values()
            .filter(|s| {
                params
                    .participant
                    .map(|p| s.definition.participants.contains(&p))
                    .unwrap_or(true)
            })
            .filter(|s| params.status.map(|status| s.status == status).unwrap_or(true))
            .map(AppSessionView::from_session)
            .collect();
        views.sort_by(|a, b| a.app_session_id.cmp(&b.app_session_id));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use crate::model::{Allowance, AppDefinition, Asset, ChannelRecord, ChannelStatus, SessionKey};
    use alloy::signers::local::PrivateKeySigner;
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: Arc<Ledger>,
        registry: Arc<SessionKeyRegistry>,
        channels: Arc<Channels>,
        engine: AppSessions,
        alice: PrivateKeySigner,
        bob: PrivateKeySigner,
        alice_key: PrivateKeySigner,
        bob_key: PrivateKeySigner,
    }

    async fn harness(alice_cap: Decimal) -> Harness {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let registry = Arc::new(SessionKeyRegistry::new(store.clone()));
        let assets = Arc::new(vec![Asset {
            symbol: "usdc".into(),
            chain_id: 31337,
            token: Address::repeat_byte(0x55),
            decimals: 6,
        }]);
        let channels = Arc::new(Channels::new(
            store.clone(),
            ledger.clone(),
            assets,
            Address::repeat_byte(0xBB),
            31337,
            Address::repeat_byte(0x99),
        ));
        let engine = AppSessions::new(ledger.clone(), registry.clone(), channels.clone(), store);

        let alice = PrivateKeySigner::random();
        let bob = PrivateKeySigner::random();
        let alice_key = PrivateKeySigner::random();
        let bob_key = PrivateKeySigner::random();

        for (wallet, key, cap) in [
            (&alice, &alice_key, alice_cap),
            (&bob, &bob_key, dec!(10000)),
        ] {
            registry
                .register(SessionKey {
                    address: key.address(),
                    wallet: wallet.address(),
                    application: Address::repeat_byte(0x42),
                    scope: "app.test".into(),
                    allowances: vec![Allowance { asset: "usdc".into(), amount: cap }],
                    used: HashMap::new(),
                    expires_at: now_ms() + 3_600_000,
                    created_at: now_ms(),
                    revoked: false,
                })
                .await
                .unwrap();
        }

        Harness { ledger, registry, channels, engine, alice, bob, alice_key, bob_key }
    }

    fn definition(h: &Harness, weights: [u64; 2], quorum: u64, nonce: u64) -> AppDefinition {
        AppDefinition {
            application: Address::repeat_byte(0x42),
            protocol: Protocol::V04,
            participants: vec![h.alice.address(), h.bob.address()],
            weights: weights.to_vec(),
            quorum,
            challenge: 3600,
            nonce,
        }
    }

    fn alloc(participant: Address, amount: Decimal) -> AppAllocation {
        AppAllocation { participant, asset: "usdc".into(), amount }
    }

    async fn sign_all(payload: &[u8], signers: &[&PrivateKeySigner]) -> Vec<String> {
        let mut signatures = Vec::new();
        for signer in signers {
            signatures.push(crypto::sign_payload(signer, payload).await.unwrap());
        }
        signatures
    }

    async fn create_session(h: &Harness, allocations: Vec<AppAllocation>) -> String {
        let payload = b"create-payload";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: definition(h, [100, 100], 100, 1),
                    allocations,
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .expect("create failed");
        view.app_session_id
    }

    #[tokio::test]
    async fn v04_happy_lifecycle() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();
        h.ledger.credit_on_chain(&address_key(bob), "usdc", dec!(1000)).await.unwrap();

        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))]).await;
        assert_eq!(h.ledger.unified_balance(&address_key(alice), "usdc").await, dec!(900));
        assert_eq!(h.ledger.balance(&id, "usdc").await, dec!(100));

        // operate: shuffle 50 to Bob.
        let payload = b"state-v2";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, events) = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: Some(Intent::Operate),
                    version: Some(2),
                    allocations: vec![alloc(alice, dec!(50)), alloc(bob, dec!(50))],
                    session_data: Some("round-1".into()),
                },
                payload,
                &sigs,
            )
            .await
            .expect("operate failed");
        assert_eq!(view.version, 2);
        assert!(events.iter().any(|e| e.method == NOTIFY_APP_SESSION_UPDATE));

        // deposit: Alice contributes another 150.
        let payload = b"state-v3";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: Some(Intent::Deposit),
                    version: Some(3),
                    allocations: vec![alloc(alice, dec!(200)), alloc(bob, dec!(50))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .expect("deposit failed");
        assert_eq!(view.version, 3);
        assert_eq!(h.ledger.unified_balance(&address_key(alice), "usdc").await, dec!(750));
        assert_eq!(h.ledger.balance(&id, "usdc").await, dec!(250));

        // close to [0, 250].
        let payload = b"close";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .close(
                CloseAppSessionParams {
                    app_session_id: id.clone(),
                    allocations: vec![alloc(alice, dec!(0)), alloc(bob, dec!(250))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .expect("close failed");
        assert_eq!(view.version, 4);
        assert_eq!(view.status, SessionStatus::Closed);

        assert_eq!(h.ledger.unified_balance(&address_key(alice), "usdc").await, dec!(750));
        assert_eq!(h.ledger.unified_balance(&address_key(bob), "usdc").await, dec!(1250));
        assert_eq!(h.ledger.balance(&id, "usdc").await, dec!(0));

        // Alice's lifetime usage: 100 on create + 150 on deposit.
        let key = h.registry.get(h.alice_key.address()).await.unwrap();
        assert_eq!(key.used_for("usdc"), dec!(250));

        // Terminal: no further submits.
        let payload = b"state-v5";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id,
                    intent: Some(Intent::Operate),
                    version: Some(5),
                    allocations: vec![alloc(alice, dec!(0)), alloc(bob, dec!(250))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not open"));
    }

    #[tokio::test]
    async fn allowance_cap_rejects_excess_deposit() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();

        let id = create_session(&h, vec![alloc(alice, dec!(300)), alloc(bob, dec!(0))]).await;

        // Cap 500, already used 300: a 450 deposit must fail.
        let payload = b"over-cap";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: Some(Intent::Deposit),
                    version: Some(2),
                    allocations: vec![alloc(alice, dec!(750)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("session key spending validation failed: insufficient session key allowance"));

        // Nothing moved.
        let session = h.engine.get(&id).await.unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(session.allocation_of("usdc", alice), dec!(300));
        assert_eq!(h.ledger.unified_balance(&address_key(alice), "usdc").await, dec!(700));
        assert_eq!(h.registry.get(h.alice_key.address()).await.unwrap().used_for("usdc"), dec!(300));
    }

    #[tokio::test]
    async fn version_skip_is_rejected_and_state_kept() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();

        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))]).await;

        let payload = b"skip";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: Some(Intent::Operate),
                    version: Some(42),
                    allocations: vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))],
                    session_data: Some("should not stick".into()),
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "incorrect version: expected 2, got 42");

        let session = h.engine.get(&id).await.unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(session.session_data, None);
    }

    #[tokio::test]
    async fn non_zero_channel_allocation_gates_funding() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();

        // A resize allocated 1 usdc back to Alice's side of the channel.
        h.channels
            .sync_channel(ChannelRecord {
                channel_id: "0xc1".into(),
                chain_id: 31337,
                token: Address::repeat_byte(0x55),
                wallet: alice,
                broker: Address::repeat_byte(0xBB),
                status: ChannelStatus::Resizing,
                version: 2,
                wallet_allocation: dec!(1),
                broker_allocation: dec!(0),
                updated_at: 0,
            })
            .await
            .unwrap();

        let payload = b"gated-create";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: definition(&h, [100, 100], 100, 7),
                    allocations: vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "operation denied: non-zero allocation detected");
    }

    #[tokio::test]
    async fn quorum_and_depositor_rules() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();

        // Alice weight 30, Bob weight 100, quorum 100.
        let payload = b"create";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: AppDefinition {
                        weights: vec![30, 100],
                        ..definition(&h, [0, 0], 100, 2)
                    },
                    allocations: vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap();
        let id = view.app_session_id;

        let deposit = |version: u64| SubmitAppStateParams {
            app_session_id: id.clone(),
            intent: Some(Intent::Deposit),
            version: Some(version),
            allocations: vec![alloc(alice, dec!(150)), alloc(bob, dec!(0))],
            session_data: None,
        };

        // Quorum reached by the non-depositor alone: depositor must sign.
        let payload = b"bob-only";
        let sigs = sign_all(payload, &[&h.bob_key]).await;
        let err = h.engine.submit(deposit(2), payload, &sigs).await.unwrap_err();
        assert_eq!(err.to_string(), "operation denied: depositor signature is required");

        // Depositor signed but below quorum.
        let payload = b"alice-only";
        let sigs = sign_all(payload, &[&h.alice_key]).await;
        let err = h.engine.submit(deposit(2), payload, &sigs).await.unwrap_err();
        assert_eq!(err.to_string(), "operation denied: quorum not reached");

        // Both signed: accepted.
        let payload = b"both";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        h.engine.submit(deposit(2), payload, &sigs).await.expect("deposit failed");
    }

    #[tokio::test]
    async fn operate_rejects_balance_drift() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();
        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))]).await;

        let payload = b"drift";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id,
                    intent: Some(Intent::Operate),
                    version: Some(2),
                    allocations: vec![alloc(alice, dec!(100)), alloc(bob, dec!(1))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "operation denied: non-zero allocations sum delta");
    }

    #[tokio::test]
    async fn deposit_and_withdraw_direction_checks() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();
        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(50))]).await;

        // Deposit that decreases Bob.
        let payload = b"bad-deposit";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: Some(Intent::Deposit),
                    version: Some(2),
                    allocations: vec![alloc(alice, dec!(200)), alloc(bob, dec!(40))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("decreased allocation for participant"));

        // Withdraw that increases Alice.
        let payload = b"bad-withdraw";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: Some(Intent::Withdraw),
                    version: Some(2),
                    allocations: vec![alloc(alice, dec!(120)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("increased allocation for participant"));

        // Valid withdraw pays Bob out and does not restore allowances.
        let used_before = h.registry.get(h.alice_key.address()).await.unwrap().used_for("usdc");
        let payload = b"withdraw";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id,
                    intent: Some(Intent::Withdraw),
                    version: Some(2),
                    allocations: vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap();
        assert_eq!(view.version, 2);
        assert_eq!(h.ledger.unified_balance(&address_key(bob), "usdc").await, dec!(50));
        let used_after = h.registry.get(h.alice_key.address()).await.unwrap().used_for("usdc");
        assert_eq!(used_before, used_after);
    }

    #[tokio::test]
    async fn v02_sessions_use_implicit_operate() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();

        let payload = b"create-v02";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: AppDefinition {
                        protocol: Protocol::V02,
                        ..definition(&h, [100, 100], 100, 3)
                    },
                    allocations: vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap();
        let id = view.app_session_id;

        // No version, no intent: broker assigns stored + 1.
        let payload = b"v02-submit";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let (view, _) = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id.clone(),
                    intent: None,
                    version: None,
                    allocations: vec![alloc(alice, dec!(40)), alloc(bob, dec!(60))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .expect("v0.2 submit failed");
        assert_eq!(view.version, 2);

        // Explicit non-operate intent is not part of v0.2.
        let payload = b"v02-deposit";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id,
                    intent: Some(Intent::Deposit),
                    version: None,
                    allocations: vec![alloc(alice, dec!(140)), alloc(bob, dec!(60))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "operation denied: unsupported in protocol");
    }

    #[tokio::test]
    async fn create_validates_definition_and_nonce() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();

        let payload = b"create";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;

        // Mismatched weights.
        let err = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: AppDefinition {
                        weights: vec![100],
                        ..definition(&h, [0, 0], 100, 4)
                    },
                    allocations: vec![],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same length"));

        // Quorum above total weight.
        let err = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: definition(&h, [50, 40], 100, 4),
                    allocations: vec![],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quorum"));

        // Challenge below the floor.
        let err = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: AppDefinition {
                        challenge: 60,
                        ..definition(&h, [100, 100], 100, 4)
                    },
                    allocations: vec![],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("challenge period"));

        // Nonce reuse for the same application and participant set.
        h.engine
            .create(
                CreateAppSessionParams {
                    definition: definition(&h, [100, 100], 100, 5),
                    allocations: vec![alloc(alice, dec!(10)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap();
        let err = h
            .engine
            .create(
                CreateAppSessionParams {
                    definition: definition(&h, [100, 100], 100, 5),
                    allocations: vec![],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nonce already used"));
    }

    #[tokio::test]
    async fn close_must_preserve_balances_and_cover_participants() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();
        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))]).await;

        let payload = b"bad-close";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;
        let err = h
            .engine
            .close(
                CloseAppSessionParams {
                    app_session_id: id.clone(),
                    allocations: vec![alloc(alice, dec!(90)), alloc(bob, dec!(0))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "operation denied: non-zero allocations sum delta");

        let err = h
            .engine
            .close(
                CloseAppSessionParams {
                    app_session_id: id,
                    allocations: vec![alloc(alice, dec!(100))],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing participant"));
    }

    #[tokio::test]
    async fn submit_rejects_unknown_session_and_participants() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();
        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))]).await;

        let payload = b"unknown";
        let sigs = sign_all(payload, &[&h.alice_key, &h.bob_key]).await;

        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: "0xdoesnotexist".into(),
                    intent: Some(Intent::Operate),
                    version: Some(2),
                    allocations: vec![],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("app session not found:"));

        let outsider = Address::repeat_byte(0x77);
        let err = h
            .engine
            .submit(
                SubmitAppStateParams {
                    app_session_id: id,
                    intent: Some(Intent::Operate),
                    version: Some(2),
                    allocations: vec![
                        alloc(alice, dec!(50)),
                        alloc(bob, dec!(0)),
                        alloc(outsider, dec!(50)),
                    ],
                    session_data: None,
                },
                payload,
                &sigs,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown participant"));
    }

    #[tokio::test]
    async fn ledger_session_balance_matches_allocations() {
        let h = harness(dec!(500)).await;
        let alice = h.alice.address();
        let bob = h.bob.address();
        h.ledger.credit_on_chain(&address_key(alice), "usdc", dec!(1000)).await.unwrap();
        let id = create_session(&h, vec![alloc(alice, dec!(100)), alloc(bob, dec!(0))]).await;

        let session = h.engine.get(&id).await.unwrap();
        assert_eq!(h.ledger.balance(&id, "usdc").await, session.total("usdc"));
    }
}
