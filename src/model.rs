// model.rs - Domain state and wire types
//
// Internal state uses alloy primitives and rust_decimal amounts. Wire types
// are camelCase with bigints carried as decimal strings and hex fields
// 0x-prefixed lowercase.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lowercase 0x-prefixed rendering of an address, the canonical account id
/// form used in ledger keys and wire payloads.
pub fn address_key(address: Address) -> String {
    format!("0x{:x}", address)
}

// =============================================================================
// ASSETS
// =============================================================================

/// An asset the broker clears. `symbol` is the ledger key;
/// (`token`, `chain_id`) is the settlement key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub symbol: String,
    pub chain_id: u64,
    pub token: Address,
    pub decimals: u8,
}

// =============================================================================
// SESSION KEYS
// =============================================================================

/// Per-asset lifetime spending cap granted to a session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowance {
    pub asset: String,
    pub amount: Decimal,
}

/// Session keys with this scope may act on any wallet's keys.
pub const SCOPE_CLEARNODE: &str = "clearnode";

/// An ephemeral key authorized by a wallet. `used` counts cumulative
/// deposits per asset and never decreases while the key lives;
/// `used[asset] <= cap[asset]` holds at all times.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub address: Address,
    pub wallet: Address,
    pub application: Address,
    pub scope: String,
    pub allowances: Vec<Allowance>,
    pub used: HashMap<String, Decimal>,
    pub expires_at: u64,
    pub created_at: u64,
    pub revoked: bool,
}

impl SessionKey {
    pub fn cap_for(&self, asset: &str) -> Decimal {
        self.allowances
            .iter()
            .find(|a| a.asset == asset)
            .map(|a| a.amount)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn used_for(&self, asset: &str) -> Decimal {
        self.used.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }

    pub fn is_active(&self, now: u64) -> bool {
        !self.revoked && !self.is_expired(now)
    }
}

// =============================================================================
// CHANNELS (mirrored view)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Initial,
    Active,
    Resizing,
    Challenged,
    Closed,
}

/// Read-mostly mirror of an on-chain custody channel between a wallet and
/// the broker. The broker never mutates on-chain state; it mirrors what the
/// settlement oracle reports.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub chain_id: u64,
    pub token: Address,
    pub wallet: Address,
    pub broker: Address,
    pub status: ChannelStatus,
    pub version: u64,
    /// Off-chain allocation currently assigned to the wallet side.
    pub wallet_allocation: Decimal,
    /// Off-chain allocation currently assigned to the broker side.
    pub broker_allocation: Decimal,
    pub updated_at: u64,
}

// =============================================================================
// APP SESSIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "v0.2")]
    V02,
    #[serde(rename = "v0.4")]
    V04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// Declared purpose of a state update; selects the per-asset balance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Operate,
    Deposit,
    Withdraw,
}

/// Immutable parameters fixed when an app session is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinition {
    pub application: Address,
    pub protocol: Protocol,
    pub participants: Vec<Address>,
    pub weights: Vec<u64>,
    pub quorum: u64,
    /// On-chain challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
}

/// One participant's holding of one asset inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAllocation {
    pub participant: Address,
    pub asset: String,
    pub amount: Decimal,
}

/// A multi-party off-chain virtual account. `version` is strictly monotonic
/// per successful update; `allocations` is asset -> participant -> amount.
#[derive(Debug, Clone)]
pub struct AppSession {
    pub id: String,
    pub definition: AppDefinition,
    pub version: u64,
    pub status: SessionStatus,
    pub session_data: Option<String>,
    pub allocations: HashMap<String, HashMap<Address, Decimal>>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl AppSession {
    pub fn total(&self, asset: &str) -> Decimal {
        self.allocations
            .get(asset)
            .map(|per| per.values().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn allocation_of(&self, asset: &str, participant: Address) -> Decimal {
        self.allocations
            .get(asset)
            .and_then(|per| per.get(&participant))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Flat allocation list, sorted for stable wire output.
    pub fn allocation_list(&self) -> Vec<AppAllocation> {
        let mut list: Vec<AppAllocation> = self
            .allocations
            .iter()
            .flat_map(|(asset, per)| {
                per.iter().map(move |(participant, amount)| AppAllocation {
                    participant: *participant,
                    asset: asset.clone(),
                    amount: *amount,
                })
            })
            .collect();
        list.sort_by(|a, b| (&a.asset, a.participant).cmp(&(&b.asset, b.participant)));
        list
    }
}

// =============================================================================
// LEDGER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerTxType {
    Transfer,
    AppDeposit,
    AppWithdraw,
    ChannelIn,
    ChannelOut,
}

impl LedgerTxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerTxType::Transfer => "transfer",
            LedgerTxType::AppDeposit => "app_deposit",
            LedgerTxType::AppWithdraw => "app_withdraw",
            LedgerTxType::ChannelIn => "channel_in",
            LedgerTxType::ChannelOut => "channel_out",
        }
    }
}

/// A committed balance move. Every transaction is recorded with two legs
/// that sum to zero per asset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: u64,
    pub tx_type: LedgerTxType,
    pub from_account: String,
    pub to_account: String,
    pub asset: String,
    pub amount: Decimal,
    pub created_at: u64,
}

/// One signed leg of a committed transaction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub tx_id: u64,
    pub account: String,
    pub asset: String,
    pub amount: Decimal,
    pub created_at: u64,
}

// =============================================================================
// RPC HISTORY
// =============================================================================

/// Audit record of a mutating RPC, appended with its signatures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHistoryRecord {
    pub ts: u64,
    pub wallet: String,
    pub method: String,
    pub params: String,
    pub signatures: Vec<String>,
    pub response: String,
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

pub const NOTIFY_BALANCE_UPDATE: &str = "bu";
pub const NOTIFY_CHANNEL_UPDATE: &str = "cu";
pub const NOTIFY_TRANSFER: &str = "tr";
pub const NOTIFY_APP_SESSION_UPDATE: &str = "asu";

/// A server-initiated notification produced by an engine commit. Fan-out is
/// best-effort and never blocks or rolls back the commit that produced it.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub method: &'static str,
    /// Wallets whose connections should receive it.
    pub wallets: Vec<Address>,
    pub payload: serde_json::Value,
}

// =============================================================================
// WIRE: auth
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequestParams {
    pub address: Address,
    pub session_key: Address,
    pub application: Address,
    #[serde(default)]
    pub allowances: Vec<Allowance>,
    pub expires_at: u64,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthVerifyParams {
    pub challenge: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallengeResponse {
    pub challenge_message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthVerifyResponse {
    pub address: String,
    pub session_key: String,
    pub jwt_token: String,
}

// =============================================================================
// WIRE: session keys
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceView {
    pub asset: String,
    pub cap: Decimal,
    pub used: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeyView {
    pub session_key: String,
    pub application: String,
    pub scope: String,
    pub allowances: Vec<AllowanceView>,
    pub expires_at: u64,
    pub created_at: u64,
    pub revoked: bool,
}

impl SessionKeyView {
    pub fn from_key(key: &SessionKey) -> Self {
        Self {
            session_key: address_key(key.address),
            application: address_key(key.application),
            scope: key.scope.clone(),
            allowances: key
                .allowances
                .iter()
                .map(|a| AllowanceView {
                    asset: a.asset.clone(),
                    cap: a.amount,
                    used: key.used_for(&a.asset),
                })
                .collect(),
            expires_at: key.expires_at,
            created_at: key.created_at,
            revoked: key.revoked,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionKeyParams {
    pub session_key: Address,
}

// =============================================================================
// WIRE: ledger
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLedgerBalancesParams {
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLedgerEntriesParams {
    pub account_id: Option<String>,
    pub asset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLedgerTransactionsParams {
    pub account_id: Option<String>,
    pub asset: Option<String>,
    pub tx_type: Option<LedgerTxType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferParams {
    pub destination: Option<Address>,
    pub destination_user_tag: Option<String>,
    pub allocations: Vec<BalanceEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub from: String,
    pub to: String,
    pub transactions: Vec<LedgerTransaction>,
}

// =============================================================================
// WIRE: channels
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChannelsParams {
    pub wallet: Option<Address>,
    pub status: Option<ChannelStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAllocationView {
    pub participant: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub channel_id: String,
    pub chain_id: u64,
    pub token: String,
    pub participants: Vec<String>,
    pub status: ChannelStatus,
    pub version: u64,
    pub allocations: Vec<ChannelAllocationView>,
}

impl ChannelView {
    pub fn from_record(record: &ChannelRecord) -> Self {
        Self {
            channel_id: record.channel_id.clone(),
            chain_id: record.chain_id,
            token: address_key(record.token),
            participants: vec![address_key(record.wallet), address_key(record.broker)],
            status: record.status,
            version: record.version,
            allocations: vec![
                ChannelAllocationView {
                    participant: address_key(record.wallet),
                    amount: record.wallet_allocation,
                },
                ChannelAllocationView {
                    participant: address_key(record.broker),
                    amount: record.broker_allocation,
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelParams {
    pub chain_id: u64,
    pub token: Address,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeChannelParams {
    pub channel_id: String,
    pub new_amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChannelParams {
    pub channel_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStateResponse {
    pub channel: ChannelView,
    /// Broker countersignature over the EIP-712 State digest.
    pub state_signature: String,
}

// =============================================================================
// WIRE: app sessions
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppSessionParams {
    pub definition: AppDefinition,
    pub allocations: Vec<AppAllocation>,
    pub session_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAppStateParams {
    pub app_session_id: String,
    pub intent: Option<Intent>,
    pub version: Option<u64>,
    pub allocations: Vec<AppAllocation>,
    pub session_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAppSessionParams {
    pub app_session_id: String,
    pub allocations: Vec<AppAllocation>,
    pub session_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAppSessionsParams {
    pub participant: Option<Address>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAppDefinitionParams {
    pub app_session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSessionView {
    pub app_session_id: String,
    pub application: String,
    pub protocol: Protocol,
    pub participants: Vec<String>,
    pub weights: Vec<u64>,
    pub quorum: u64,
    pub challenge: u64,
    pub nonce: u64,
    pub version: u64,
    pub status: SessionStatus,
    pub allocations: Vec<AppAllocation>,
    pub session_data: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl AppSessionView {
    pub fn from_session(session: &AppSession) -> Self {
        Self {
            app_session_id: session.id.clone(),
            application: address_key(session.definition.application),
            protocol: session.definition.protocol,
            participants: session
                .definition
                .participants
                .iter()
                .copied()
                .map(address_key)
                .collect(),
            weights: session.definition.weights.clone(),
            quorum: session.definition.quorum,
            challenge: session.definition.challenge,
            nonce: session.definition.nonce,
            version: session.version,
            status: session.status,
            allocations: session.allocation_list(),
            session_data: session.session_data.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

// =============================================================================
// WIRE: misc
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigResponse {
    pub broker_address: String,
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub chain_id: u64,
    pub custody_address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserTagResponse {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRpcHistoryParams {
    pub limit: Option<u32>,
}
