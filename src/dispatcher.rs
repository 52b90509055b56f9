// dispatcher.rs - Per-connection request loop and method routing
//
// One task per connection reads frames, one writer task drains the outbox
// (responses and fan-out notifications share it, so a subscriber sees
// commits in order). Routing is an exhaustive match over the method enum;
// unknown methods are invalid requests.
//
// Mutating methods additionally pass: signature verification against the
// connection's wallet or its active session key, a per-connection
// idempotency ring, and the per-wallet single-writer lock.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::crypto;
use crate::envelope::{self, Direction, RpcMessage};
use crate::error::RpcError;
use crate::model::{
    address_key, now_ms, AuthVerifyParams, ChannelStatus,
    CloseAppSessionParams, CloseChannelParams, CreateAppSessionParams, CreateChannelParams,
    GetAppDefinitionParams, GetAppSessionsParams, GetChannelsParams, GetConfigResponse,
    GetLedgerBalancesParams, GetLedgerEntriesParams, GetLedgerTransactionsParams,
    GetRpcHistoryParams, GetUserTagResponse, NetworkInfo, NotificationEvent,
    ResizeChannelParams, RevokeSessionKeyParams, RpcHistoryRecord, SessionKeyView,
    SubmitAppStateParams, TransferParams, NOTIFY_CHANNEL_UPDATE,
};
use crate::service::AppState;

/// How many processed request ids the duplicate check remembers, per
/// connection.
const IDEMPOTENCY_WINDOW: usize = 256;

// =============================================================================
// METHODS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Ping,
    GetConfig,
    GetAssets,
    AuthRequest,
    AuthVerify,
    GetUserTag,
    GetSessionKeys,
    RevokeSessionKey,
    GetLedgerBalances,
    GetLedgerEntries,
    GetLedgerTransactions,
    GetChannels,
    CreateChannel,
    ResizeChannel,
    CloseChannel,
    Transfer,
    GetAppDefinition,
    GetAppSessions,
    CreateAppSession,
    SubmitAppState,
    CloseAppSession,
    GetRpcHistory,
    CleanupSessionKeyCache,
}

impl FromStr for Method {
    type Err = ();

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input {
            "ping" => Method::Ping,
            "get_config" => Method::GetConfig,
            "get_assets" => Method::GetAssets,
            "auth_request" => Method::AuthRequest,
            "auth_verify" => Method::AuthVerify,
            "get_user_tag" => Method::GetUserTag,
            "get_session_keys" => Method::GetSessionKeys,
            "revoke_session_key" => Method::RevokeSessionKey,
            "get_ledger_balances" => Method::GetLedgerBalances,
            "get_ledger_entries" => Method::GetLedgerEntries,
            "get_ledger_transactions" => Method::GetLedgerTransactions,
            "get_channels" => Method::GetChannels,
            "create_channel" => Method::CreateChannel,
            "resize_channel" => Method::ResizeChannel,
            "close_channel" => Method::CloseChannel,
            "transfer" => Method::Transfer,
            "get_app_definition" => Method::GetAppDefinition,
            "get_app_sessions" => Method::GetAppSessions,
            "create_app_session" => Method::CreateAppSession,
            "submit_app_state" => Method::SubmitAppState,
            "close_app_session" => Method::CloseAppSession,
            "get_rpc_history" => Method::GetRpcHistory,
            "cleanup_session_key_cache" => Method::CleanupSessionKeyCache,
            _ => return Err(()),
        })
    }
}

impl Method {
    /// Methods allowed before authentication.
    fn is_public(&self) -> bool {
        matches!(
            self,
            Method::Ping
                | Method::GetConfig
                | Method::GetAssets
                | Method::AuthRequest
                | Method::AuthVerify
                | Method::GetAppSessions
                | Method::GetAppDefinition
                | Method::GetChannels
        )
    }

    /// Methods that mutate state: signature-checked, idempotency-guarded,
    /// serialized per wallet, and appended to rpc history.
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Method::RevokeSessionKey
                | Method::CreateChannel
                | Method::ResizeChannel
                | Method::CloseChannel
                | Method::Transfer
                | Method::CreateAppSession
                | Method::SubmitAppState
                | Method::CloseAppSession
        )
    }
}

// =============================================================================
// CONNECTION STATE
// =============================================================================

enum ConnAuth {
    Unauthenticated,
    AwaitingVerify,
    Authenticated { wallet: Address, session_key: Address },
}

/// Who produced a verified request signature.
enum SignerIdentity {
    Wallet,
    SessionKey(Address),
}

pub struct ConnState {
    id: u64,
    auth: ConnAuth,
    seen_ids: VecDeque<u64>,
    seen_set: HashSet<u64>,
}

impl ConnState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            auth: ConnAuth::Unauthenticated,
            seen_ids: VecDeque::with_capacity(IDEMPOTENCY_WINDOW),
            seen_set: HashSet::with_capacity(IDEMPOTENCY_WINDOW),
        }
    }

    fn wallet(&self) -> Option<Address> {
        match self.auth {
            ConnAuth::Authenticated { wallet, .. } => Some(wallet),
            _ => None,
        }
    }

    fn remember_id(&mut self, id: u64) {
        if self.seen_ids.len() == IDEMPOTENCY_WINDOW {
            if let Some(evicted) = self.seen_ids.pop_front() {
                self.seen_set.remove(&evicted);
            }
        }
        self.seen_ids.push_back(id);
        self.seen_set.insert(id);
    }
}

// =============================================================================
// SOCKET LOOP
// =============================================================================

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (sender, mut outbox) = mpsc::unbounded_channel::<String>();

    let connection_id = state.connections.register(sender.clone());
    let mut conn = ConnState::new(connection_id);
    let logger = state.logger.with_name("dispatcher").with_kv("conn", connection_id);
    logger.debug("connection opened", &[]);

    // Writer task: responses and notifications drain in enqueue order.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let raw = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let response = process_frame(&state, &mut conn, &raw).await;
        if sender.send(response).is_err() {
            break;
        }
    }

    state.connections.remove(connection_id);
    state.auth.forget_connection(connection_id);
    writer.abort();
    logger.debug("connection closed", &[]);
}

/// Handle one inbound frame and produce the signed wire response. Split out
/// of the socket loop so tests can drive a connection without a socket.
pub async fn process_frame(state: &AppState, conn: &mut ConnState, raw: &str) -> String {
    let message = match envelope::parse_message(raw) {
        Ok(message) if message.direction == Direction::Request => message,
        Ok(_) => {
            return signed_error(state, 0, &RpcError::invalid("expected a request payload"), None)
                .await
        }
        Err(err) => return signed_error(state, 0, &err, None).await,
    };

    let id = message.id;
    let acc = message.acc.clone();
    let deadline = Duration::from_secs(state.config.request_timeout_secs);

    let outcome = match tokio::time::timeout(deadline, route(state, conn, &message)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RpcError::Internal("request timed out".to_string())),
    };

    match outcome {
        Ok(routed) => {
            let response = envelope::create_response(
                id,
                &routed.method,
                json!([routed.data]),
                now_ms(),
                acc.as_deref(),
                None,
            );
            match envelope::sign_message(response, &state.broker_signer).await {
                Ok(signed) => signed.to_wire(),
                Err(err) => signed_error(state, id, &err, acc.as_deref()).await,
            }
        }
        Err(err) => {
            if err.is_fatal() {
                state
                    .logger
                    .fatal("unrecoverable storage error", &[("error", err.to_string())]);
            }
            signed_error(state, id, &err, acc.as_deref()).await
        }
    }
}

async fn signed_error(state: &AppState, id: u64, error: &RpcError, acc: Option<&str>) -> String {
    let response = envelope::create_error_response(id, error, now_ms(), acc);
    match envelope::sign_message(response, &state.broker_signer).await {
        Ok(signed) => signed.to_wire(),
        Err(_) => response_fallback(id, error),
    }
}

fn response_fallback(id: u64, error: &RpcError) -> String {
    envelope::create_error_response(id, error, now_ms(), None).to_wire()
}

// =============================================================================
// ROUTING
// =============================================================================

struct Routed {
    method: String,
    data: Value,
}

fn parse_params<T: serde::de::DeserializeOwned>(message: &RpcMessage) -> Result<T, RpcError> {
    serde_json::from_value(message.params_object())
        .map_err(|e| RpcError::invalid(format!("bad params: {}", e)))
}

async fn route(
    state: &AppState,
    conn: &mut ConnState,
    message: &RpcMessage,
) -> Result<Routed, RpcError> {
    let method = Method::from_str(&message.method)
        .map_err(|_| RpcError::invalid(format!("unknown method {}", message.method)))?;

    let ctx = crate::logger::RequestContext::new(
        state
            .logger
            .with_name("rpc")
            .with_kv("conn", conn.id)
            .with_kv("method", &message.method),
    );
    let logger = ctx.logger();

    if !method.is_public() && conn.wallet().is_none() {
        return Err(RpcError::Unauthorized("authentication required".to_string()));
    }

    // Private methods: every signature must verify against the wallet or
    // one of its active session keys.
    let mut caller_identity = SignerIdentity::Wallet;
    if !method.is_public() {
        let wallet = conn.wallet().ok_or_else(|| {
            RpcError::Unauthorized("authentication required".to_string())
        })?;
        caller_identity = verify_request_signatures(state, wallet, message).await?;
    }

    // Idempotency ring for mutating methods.
    if method.is_mutating() && conn.seen_set.contains(&message.id) {
        return Err(RpcError::denied("the request has already been processed"));
    }

    let routed = match method {
        // =====================================================================
        // Public reads
        // =====================================================================
        Method::Ping => Routed { method: "pong".into(), data: json!({}) },

        Method::GetConfig => Routed {
            method: message.method.clone(),
            data: serde_json::to_value(GetConfigResponse {
                broker_address: address_key(state.broker_signer.address()),
                networks: vec![NetworkInfo {
                    chain_id: state.config.chain_id,
                    custody_address: address_key(state.config.custody_address),
                }],
            })
            .unwrap_or_default(),
        },

        Method::GetAssets => {
            #[derive(serde::Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct GetAssetsParams {
                chain_id: Option<u64>,
            }
            let params: GetAssetsParams = parse_params(message)?;
            let assets: Vec<_> = state
                .assets
                .iter()
                .filter(|a| params.chain_id.map(|c| a.chain_id == c).unwrap_or(true))
                .cloned()
                .collect();
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(assets).unwrap_or_default(),
            }
        }

        Method::GetAppSessions => {
            let params: GetAppSessionsParams = parse_params(message)?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(state.app_sessions.list(&params).await)
                    .unwrap_or_default(),
            }
        }

        Method::GetAppDefinition => {
            let params: GetAppDefinitionParams = parse_params(message)?;
            let session = state
                .app_sessions
                .get(&params.app_session_id)
                .await
                .ok_or_else(|| RpcError::AppSessionNotFound(params.app_session_id.clone()))?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(&session.definition).unwrap_or_default(),
            }
        }

        Method::GetChannels => {
            let params: GetChannelsParams = parse_params(message)?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(state.channels.list(params.wallet, params.status).await)
                    .unwrap_or_default(),
            }
        }

        // =====================================================================
        // Auth
        // =====================================================================
        Method::AuthRequest => {
            let params = parse_params(message)?;
            let challenge = state.auth.auth_request(conn.id, params);
            conn.auth = ConnAuth::AwaitingVerify;
            logger.debug("auth challenge issued", &[]);
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(challenge).unwrap_or_default(),
            }
        }

        Method::AuthVerify => {
            let params: AuthVerifyParams = parse_params(message)?;
            let (wallet, session_key, response) = match (&params.challenge, &params.jwt) {
                (Some(challenge), _) => {
                    state
                        .auth
                        .verify_challenge(
                            conn.id,
                            challenge,
                            &message.sig,
                            &state.verifier,
                            &state.registry,
                        )
                        .await?
                }
                (None, Some(jwt)) => state.auth.verify_jwt(jwt, &state.registry).await?,
                (None, None) => {
                    return Err(RpcError::invalid("challenge or jwt is required".to_string()))
                }
            };
            conn.auth = ConnAuth::Authenticated { wallet, session_key };
            state.connections.bind_wallet(conn.id, wallet);
            logger.info("connection authenticated", &[("wallet", address_key(wallet))]);
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(response).unwrap_or_default(),
            }
        }

        // =====================================================================
        // Wallet reads
        // =====================================================================
        Method::GetUserTag => {
            let wallet = require_wallet(conn)?;
            let tag = state.user_tag(wallet).await?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(GetUserTagResponse { tag }).unwrap_or_default(),
            }
        }

        Method::GetSessionKeys => {
            let wallet = require_wallet(conn)?;
            let keys: Vec<SessionKeyView> = state
                .registry
                .list_for_wallet(wallet)
                .await
                .iter()
                .map(SessionKeyView::from_key)
                .collect();
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(keys).unwrap_or_default(),
            }
        }

        Method::GetLedgerBalances => {
            let wallet = require_wallet(conn)?;
            let params: GetLedgerBalancesParams = parse_params(message)?;
            let account = resolve_account(state, wallet, params.account_id).await?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(state.ledger.snapshot_balances(&account, None).await)
                    .unwrap_or_default(),
            }
        }

        Method::GetLedgerEntries => {
            let wallet = require_wallet(conn)?;
            let params: GetLedgerEntriesParams = parse_params(message)?;
            let account = resolve_account(state, wallet, params.account_id).await?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(
                    state
                        .ledger
                        .list_entries(Some(&account), params.asset.as_deref())
                        .await,
                )
                .unwrap_or_default(),
            }
        }

        Method::GetLedgerTransactions => {
            let wallet = require_wallet(conn)?;
            let params: GetLedgerTransactionsParams = parse_params(message)?;
            let account = resolve_account(state, wallet, params.account_id).await?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(
                    state
                        .ledger
                        .list_transactions(Some(&account), params.asset.as_deref(), params.tx_type)
                        .await,
                )
                .unwrap_or_default(),
            }
        }

        Method::GetRpcHistory => {
            let wallet = require_wallet(conn)?;
            let params: GetRpcHistoryParams = parse_params(message)?;
            let records = state
                .store
                .load_rpc_history(&address_key(wallet), params.limit.unwrap_or(50))
                .await?;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(records).unwrap_or_default(),
            }
        }

        // =====================================================================
        // Mutations
        // =====================================================================
        Method::RevokeSessionKey => {
            let wallet = require_wallet(conn)?;
            let params: RevokeSessionKeyParams = parse_params(message)?;
            let caller = match caller_identity {
                SignerIdentity::Wallet => wallet,
                SignerIdentity::SessionKey(key) => key,
            };
            let lock = state.wallet_lock(wallet);
            let _guard = lock.lock().await;
            state.registry.revoke(caller, params.session_key).await?;
            Routed {
                method: message.method.clone(),
                data: json!({ "sessionKey": address_key(params.session_key), "revoked": true }),
            }
        }

        Method::Transfer => {
            let wallet = require_wallet(conn)?;
            let params: TransferParams = parse_params(message)?;
            let lock = state.wallet_lock(wallet);
            let (response, events) = {
                let _guard = lock.lock().await;
                state.transfer(wallet, params).await?
            };
            state.broadcast(events).await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(response).unwrap_or_default(),
            }
        }

        Method::CreateChannel => {
            let wallet = require_wallet(conn)?;
            let params: CreateChannelParams = parse_params(message)?;
            let lock = state.wallet_lock(wallet);
            let response = {
                let _guard = lock.lock().await;
                state
                    .channels
                    .create_channel(wallet, params, &state.broker_signer)
                    .await?
            };
            state
                .broadcast(vec![channel_notification(wallet, &response.channel.channel_id, response.channel.status)])
                .await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(response).unwrap_or_default(),
            }
        }

        Method::ResizeChannel => {
            let wallet = require_wallet(conn)?;
            let params: ResizeChannelParams = parse_params(message)?;
            let lock = state.wallet_lock(wallet);
            let response = {
                let _guard = lock.lock().await;
                state
                    .channels
                    .resize_channel(wallet, params, &state.broker_signer)
                    .await?
            };
            state
                .broadcast(vec![channel_notification(wallet, &response.channel.channel_id, response.channel.status)])
                .await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(response).unwrap_or_default(),
            }
        }

        Method::CloseChannel => {
            let wallet = require_wallet(conn)?;
            let params: CloseChannelParams = parse_params(message)?;
            let lock = state.wallet_lock(wallet);
            let response = {
                let _guard = lock.lock().await;
                state
                    .channels
                    .close_channel(wallet, params, &state.broker_signer)
                    .await?
            };
            state
                .broadcast(vec![channel_notification(wallet, &response.channel.channel_id, response.channel.status)])
                .await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(response).unwrap_or_default(),
            }
        }

        Method::CreateAppSession => {
            let wallet = require_wallet(conn)?;
            let params: CreateAppSessionParams = parse_params(message)?;
            let payload = message.canonical_payload();
            let lock = state.wallet_lock(wallet);
            let (view, events) = {
                let _guard = lock.lock().await;
                state.app_sessions.create(params, &payload, &message.sig).await?
            };
            state.broadcast(events).await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(view).unwrap_or_default(),
            }
        }

        Method::SubmitAppState => {
            let wallet = require_wallet(conn)?;
            let params: SubmitAppStateParams = parse_params(message)?;
            let payload = message.canonical_payload();
            let lock = state.wallet_lock(wallet);
            let (view, events) = {
                let _guard = lock.lock().await;
                state.app_sessions.submit(params, &payload, &message.sig).await?
            };
            state.broadcast(events).await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(view).unwrap_or_default(),
            }
        }

        Method::CloseAppSession => {
            let wallet = require_wallet(conn)?;
            let params: CloseAppSessionParams = parse_params(message)?;
            let payload = message.canonical_payload();
            let lock = state.wallet_lock(wallet);
            let (view, events) = {
                let _guard = lock.lock().await;
                state.app_sessions.close(params, &payload, &message.sig).await?
            };
            state.broadcast(events).await;
            Routed {
                method: message.method.clone(),
                data: serde_json::to_value(view).unwrap_or_default(),
            }
        }

        Method::CleanupSessionKeyCache => {
            require_wallet(conn)?;
            let dropped = state.registry.cleanup_cache().await;
            Routed { method: message.method.clone(), data: json!({ "dropped": dropped }) }
        }
    };

    // Successful mutations: remember the id and append to rpc history.
    if method.is_mutating() {
        conn.remember_id(message.id);
        if let Some(wallet) = conn.wallet() {
            let record = RpcHistoryRecord {
                ts: now_ms(),
                wallet: address_key(wallet),
                method: message.method.clone(),
                params: message.params.to_string(),
                signatures: message.sig.clone(),
                response: routed.data.to_string(),
            };
            if let Err(err) = state.store.append_rpc_history(&record).await {
                logger.error("failed to append rpc history", &[("error", err.to_string())]);
            }
        }
    }

    Ok(routed)
}

fn require_wallet(conn: &ConnState) -> Result<Address, RpcError> {
    conn.wallet()
        .ok_or_else(|| RpcError::Unauthorized("authentication required".to_string()))
}

fn channel_notification(wallet: Address, channel_id: &str, status: ChannelStatus) -> NotificationEvent {
    NotificationEvent {
        method: NOTIFY_CHANNEL_UPDATE,
        wallets: vec![wallet],
        payload: json!({
            "channelId": channel_id,
            "status": status,
        }),
    }
}

/// Account scoping for ledger reads: the caller's own wallet, or an app
/// session the caller participates in.
async fn resolve_account(
    state: &AppState,
    wallet: Address,
    requested: Option<String>,
) -> Result<String, RpcError> {
    let wallet_key = address_key(wallet);
    match requested {
        None => Ok(wallet_key),
        Some(account) if account == wallet_key => Ok(account),
        Some(account) => {
            if let Some(session) = state.app_sessions.get(&account).await {
                if session.definition.participants.contains(&wallet) {
                    return Ok(account);
                }
            }
            Err(RpcError::Unauthorized(
                "account is not visible to this wallet".to_string(),
            ))
        }
    }
}

/// Step 3 of the loop: every signature on a private request must verify
/// against the connection wallet or one of its active session keys.
async fn verify_request_signatures(
    state: &AppState,
    wallet: Address,
    message: &RpcMessage,
) -> Result<SignerIdentity, RpcError> {
    if message.sig.is_empty() {
        return Err(RpcError::InvalidSignature("missing signature".to_string()));
    }
    let payload = message.canonical_payload();
    let mut identity = None;

    for signature in &message.sig {
        let mut matched = None;
        for candidate in crypto::recover_candidates(&payload, signature) {
            if candidate == wallet {
                matched = Some(SignerIdentity::Wallet);
                break;
            }
            if state.registry.is_active_key_of(wallet, candidate).await {
                matched = Some(SignerIdentity::SessionKey(candidate));
                break;
            }
        }
        if matched.is_none() {
            // Contract wallets verify against the wallet address itself.
            if state.verifier.verify_payload(&payload, signature, wallet).await? {
                matched = Some(SignerIdentity::Wallet);
            }
        }
        match matched {
            Some(found) => {
                if identity.is_none() {
                    identity = Some(found);
                }
            }
            None => {
                return Err(RpcError::InvalidSignature(
                    "signature from unknown participant wallet".to_string(),
                ))
            }
        }
    }

    Ok(identity.unwrap_or(SignerIdentity::Wallet))
}
