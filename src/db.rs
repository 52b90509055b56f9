// db.rs - Persistence
//
// Authoritative state lives in memory and is written through on commit.
// The Store trait keeps the engines off sqlx directly: PgStore is the
// production implementation, MemStore backs tests and local development.
//
// Ledger commits are the one multi-statement write and run inside a
// database transaction; everything else is single-row upserts.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

use crate::crypto::parse_address;
use crate::error::RpcError;
use crate::model::{
    Allowance, AppDefinition, AppSession, Asset, ChannelRecord, ChannelStatus, LedgerEntry,
    LedgerTransaction, LedgerTxType, Protocol, RpcHistoryRecord, SessionKey, SessionStatus,
};

/// Everything loaded into memory at startup.
#[derive(Debug, Default)]
pub struct PersistedState {
    pub assets: Vec<Asset>,
    pub session_keys: Vec<SessionKey>,
    pub channels: Vec<ChannelRecord>,
    pub app_sessions: Vec<AppSession>,
    pub balances: HashMap<(String, String), Decimal>,
    pub transactions: Vec<LedgerTransaction>,
    pub entries: Vec<LedgerEntry>,
    pub user_tags: HashMap<String, String>,
}

/// One committed ledger write: transactions, their legs, and the post
/// balances they leave behind. Persisted atomically.
#[derive(Debug)]
pub struct LedgerCommit {
    pub transactions: Vec<LedgerTransaction>,
    pub entries: Vec<LedgerEntry>,
    pub balances: Vec<(String, String, Decimal)>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn init(&self) -> Result<(), RpcError>;
    async fn seed_assets(&self, assets: &[Asset]) -> Result<(), RpcError>;
    async fn load_state(&self) -> Result<PersistedState, RpcError>;

    async fn save_session_key(&self, key: &SessionKey) -> Result<(), RpcError>;
    async fn save_channel(&self, channel: &ChannelRecord) -> Result<(), RpcError>;
    async fn save_app_session(&self, session: &AppSession) -> Result<(), RpcError>;
    async fn commit_ledger(&self, commit: &LedgerCommit) -> Result<(), RpcError>;
    async fn save_user_tag(&self, wallet: &str, tag: &str) -> Result<(), RpcError>;

    async fn append_rpc_history(&self, record: &RpcHistoryRecord) -> Result<(), RpcError>;
    async fn load_rpc_history(
        &self,
        wallet: &str,
        limit: u32,
    ) -> Result<Vec<RpcHistoryRecord>, RpcError>;
}

// =============================================================================
// ENUM <-> TEXT
// =============================================================================

fn channel_status_str(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Initial => "initial",
        ChannelStatus::Active => "active",
        ChannelStatus::Resizing => "resizing",
        ChannelStatus::Challenged => "challenged",
        ChannelStatus::Closed => "closed",
    }
}

fn parse_channel_status(raw: &str) -> ChannelStatus {
    match raw {
        "active" => ChannelStatus::Active,
        "resizing" => ChannelStatus::Resizing,
        "challenged" => ChannelStatus::Challenged,
        "closed" => ChannelStatus::Closed,
        _ => ChannelStatus::Initial,
    }
}

fn protocol_str(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::V02 => "v0.2",
        Protocol::V04 => "v0.4",
    }
}

fn parse_protocol(raw: &str) -> Protocol {
    match raw {
        "v0.2" => Protocol::V02,
        _ => Protocol::V04,
    }
}

fn parse_tx_type(raw: &str) -> LedgerTxType {
    match raw {
        "app_deposit" => LedgerTxType::AppDeposit,
        "app_withdraw" => LedgerTxType::AppWithdraw,
        "channel_in" => LedgerTxType::ChannelIn,
        "channel_out" => LedgerTxType::ChannelOut,
        _ => LedgerTxType::Transfer,
    }
}

fn parse_decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_default()
}

// =============================================================================
// POSTGRES STORE
// =============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn init(&self) -> Result<(), RpcError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS assets (\
                symbol TEXT PRIMARY KEY,\
                chain_id BIGINT NOT NULL,\
                token TEXT NOT NULL,\
                decimals INT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wallets (\
                wallet TEXT PRIMARY KEY,\
                tag TEXT NOT NULL UNIQUE\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_keys (\
                address TEXT PRIMARY KEY,\
                wallet TEXT NOT NULL,\
                application TEXT NOT NULL,\
                scope TEXT NOT NULL,\
                expires_at BIGINT NOT NULL,\
                created_at BIGINT NOT NULL,\
                revoked BOOLEAN NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_key_allowances (\
                session_key TEXT NOT NULL,\
                asset TEXT NOT NULL,\
                cap TEXT NOT NULL,\
                used TEXT NOT NULL,\
                PRIMARY KEY (session_key, asset),\
                FOREIGN KEY (session_key) REFERENCES session_keys(address) ON DELETE CASCADE\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS channels (\
                channel_id TEXT PRIMARY KEY,\
                chain_id BIGINT NOT NULL,\
                token TEXT NOT NULL,\
                wallet TEXT NOT NULL,\
                broker TEXT NOT NULL,\
                status TEXT NOT NULL,\
                version BIGINT NOT NULL,\
                wallet_allocation TEXT NOT NULL,\
                broker_allocation TEXT NOT NULL,\
                updated_at BIGINT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS app_sessions (\
                id TEXT PRIMARY KEY,\
                application TEXT NOT NULL,\
                protocol TEXT NOT NULL,\
                participants TEXT NOT NULL,\
                weights TEXT NOT NULL,\
                quorum BIGINT NOT NULL,\
                challenge BIGINT NOT NULL,\
                nonce BIGINT NOT NULL,\
                version BIGINT NOT NULL,\
                status TEXT NOT NULL,\
                session_data TEXT,\
                created_at BIGINT NOT NULL,\
                updated_at BIGINT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS app_allocations (\
                session_id TEXT NOT NULL,\
                participant TEXT NOT NULL,\
                asset TEXT NOT NULL,\
                amount TEXT NOT NULL,\
                PRIMARY KEY (session_id, participant, asset),\
                FOREIGN KEY (session_id) REFERENCES app_sessions(id) ON DELETE CASCADE\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ledger_accounts (\
                account_id TEXT NOT NULL,\
                asset TEXT NOT NULL,\
                balance TEXT NOT NULL,\
                PRIMARY KEY (account_id, asset)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ledger_transactions (\
                id BIGINT PRIMARY KEY,\
                tx_type TEXT NOT NULL,\
                from_account TEXT NOT NULL,\
                to_account TEXT NOT NULL,\
                asset TEXT NOT NULL,\
                amount TEXT NOT NULL,\
                created_at BIGINT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ledger_entries (\
                tx_id BIGINT NOT NULL,\
                account_id TEXT NOT NULL,\
                asset TEXT NOT NULL,\
                amount TEXT NOT NULL,\
                created_at BIGINT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rpc_history (\
                id BIGSERIAL PRIMARY KEY,\
                ts BIGINT NOT NULL,\
                wallet TEXT NOT NULL,\
                method TEXT NOT NULL,\
                params TEXT NOT NULL,\
                signatures TEXT NOT NULL,\
                response TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn seed_assets(&self, assets: &[Asset]) -> Result<(), RpcError> {
        for asset in assets {
            sqlx::query(
                "INSERT INTO assets (symbol, chain_id, token, decimals) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (symbol) DO UPDATE SET \
                    chain_id = EXCLUDED.chain_id, \
                    token = EXCLUDED.token, \
                    decimals = EXCLUDED.decimals",
            )
            .bind(&asset.symbol)
            .bind(asset.chain_id as i64)
            .bind(format!("0x{:x}", asset.token))
            .bind(asset.decimals as i32)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn load_state(&self) -> Result<PersistedState, RpcError> {
        let mut state = PersistedState::default();

        for row in sqlx::query("SELECT symbol, chain_id, token, decimals FROM assets")
            .fetch_all(&self.pool)
            .await?
        {
            let token: String = row.try_get("token")?;
            state.assets.push(Asset {
                symbol: row.try_get("symbol")?,
                chain_id: row.try_get::<i64, _>("chain_id")? as u64,
                token: parse_address(&token).unwrap_or_default(),
                decimals: row.try_get::<i32, _>("decimals")? as u8,
            });
        }

        for row in sqlx::query("SELECT wallet, tag FROM wallets")
            .fetch_all(&self.pool)
            .await?
        {
            state
                .user_tags
                .insert(row.try_get("wallet")?, row.try_get("tag")?);
        }

        for row in sqlx::query(
            "SELECT address, wallet, application, scope, expires_at, created_at, revoked \
             FROM session_keys",
        )
        .fetch_all(&self.pool)
        .await?
        {
            let address: String = row.try_get("address")?;
            let wallet: String = row.try_get("wallet")?;
            let application: String = row.try_get("application")?;

            let mut allowances = Vec::new();
            let mut used = HashMap::new();
            for allowance_row in sqlx::query(
                "SELECT asset, cap, used FROM session_key_allowances WHERE session_key = $1",
            )
            .bind(&address)
            .fetch_all(&self.pool)
            .await?
            {
                let asset: String = allowance_row.try_get("asset")?;
                let cap: String = allowance_row.try_get("cap")?;
                let spent: String = allowance_row.try_get("used")?;
                allowances.push(Allowance {
                    asset: asset.clone(),
                    amount: parse_decimal(&cap),
                });
                used.insert(asset, parse_decimal(&spent));
            }

            state.session_keys.push(SessionKey {
                address: parse_address(&address).unwrap_or_default(),
                wallet: parse_address(&wallet).unwrap_or_default(),
                application: parse_address(&application).unwrap_or_default(),
                scope: row.try_get("scope")?,
                allowances,
                used,
                expires_at: row.try_get::<i64, _>("expires_at")? as u64,
                created_at: row.try_get::<i64, _>("created_at")? as u64,
                revoked: row.try_get("revoked")?,
            });
        }

        for row in sqlx::query(
            "SELECT channel_id, chain_id, token, wallet, broker, status, version, \
             wallet_allocation, broker_allocation, updated_at FROM channels",
        )
        .fetch_all(&self.pool)
        .await?
        {
            let token: String = row.try_get("token")?;
            let wallet: String = row.try_get("wallet")?;
            let broker: String = row.try_get("broker")?;
            let status: String = row.try_get("status")?;
            let wallet_allocation: String = row.try_get("wallet_allocation")?;
            let broker_allocation: String = row.try_get("broker_allocation")?;
            state.channels.push(ChannelRecord {
                channel_id: row.try_get("channel_id")?,
                chain_id: row.try_get::<i64, _>("chain_id")? as u64,
                token: parse_address(&token).unwrap_or_default(),
                wallet: parse_address(&wallet).unwrap_or_default(),
                broker: parse_address(&broker).unwrap_or_default(),
                status: parse_channel_status(&status),
                version: row.try_get::<i64, _>("version")? as u64,
                wallet_allocation: parse_decimal(&wallet_allocation),
                broker_allocation: parse_decimal(&broker_allocation),
                updated_at: row.try_get::<i64, _>("updated_at")? as u64,
            });
        }

        for row in sqlx::query(
            "SELECT id, application, protocol, participants, weights, quorum, challenge, \
             nonce, version, status, session_data, created_at, updated_at FROM app_sessions",
        )
        .fetch_all(&self.pool)
        .await?
        {
            let id: String = row.try_get("id")?;
            let application: String = row.try_get("application")?;
            let protocol: String = row.try_get("protocol")?;
            let participants_json: String = row.try_get("participants")?;
            let weights_json: String = row.try_get("weights")?;
            let status: String = row.try_get("status")?;

            let participants: Vec<String> =
                serde_json::from_str(&participants_json).unwrap_or_default();
            let weights: Vec<u64> = serde_json::from_str(&weights_json).unwrap_or_default();

            let mut allocations: HashMap<String, HashMap<_, _>> = HashMap::new();
            for allocation_row in sqlx::query(
                "SELECT participant, asset, amount FROM app_allocations WHERE session_id = $1",
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await?
            {
                let participant: String = allocation_row.try_get("participant")?;
                let asset: String = allocation_row.try_get("asset")?;
                let amount: String = allocation_row.try_get("amount")?;
                allocations
                    .entry(asset)
                    .or_default()
                    .insert(parse_address(&participant).unwrap_or_default(), parse_decimal(&amount));
            }

            state.app_sessions.push(AppSession {
                id,
                definition: AppDefinition {
                    application: parse_address(&application).unwrap_or_default(),
                    protocol: parse_protocol(&protocol),
                    participants: participants
                        .iter()
                        .map(|p| parse_address(p).unwrap_or_default())
                        .collect(),
                    weights,
                    quorum: row.try_get::<i64, _>("quorum")? as u64,
                    challenge: row.try_get::<i64, _>("challenge")? as u64,
                    nonce: row.try_get::<i64, _>("nonce")? as u64,
                },
                version: row.try_get::<i64, _>("version")? as u64,
                status: if status == "closed" { SessionStatus::Closed } else { SessionStatus::Open },
                session_data: row.try_get("session_data")?,
                allocations,
                created_at: row.try_get::<i64, _>("created_at")? as u64,
                updated_at: row.try_get::<i64, _>("updated_at")? as u64,
            });
        }

        for row in sqlx::query("SELECT account_id, asset, balance FROM ledger_accounts")
            .fetch_all(&self.pool)
            .await?
        {
            let account: String = row.try_get("account_id")?;
            let asset: String = row.try_get("asset")?;
            let balance: String = row.try_get("balance")?;
            state.balances.insert((account, asset), parse_decimal(&balance));
        }

        for row in sqlx::query(
            "SELECT id, tx_type, from_account, to_account, asset, amount, created_at \
             FROM ledger_transactions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        {
            let tx_type: String = row.try_get("tx_type")?;
            let amount: String = row.try_get("amount")?;
            state.transactions.push(LedgerTransaction {
                id: row.try_get::<i64, _>("id")? as u64,
                tx_type: parse_tx_type(&tx_type),
                from_account: row.try_get("from_account")?,
                to_account: row.try_get("to_account")?,
                asset: row.try_get("asset")?,
                amount: parse_decimal(&amount),
                created_at: row.try_get::<i64, _>("created_at")? as u64,
            });
        }

        for row in sqlx::query(
            "SELECT tx_id, account_id, asset, amount, created_at FROM ledger_entries ORDER BY tx_id",
        )
        .fetch_all(&self.pool)
        .await?
        {
            let amount: String = row.try_get("amount")?;
            state.entries.push(LedgerEntry {
                tx_id: row.try_get::<i64, _>("tx_id")? as u64,
                account: row.try_get("account_id")?,
                asset: row.try_get("asset")?,
                amount: parse_decimal(&amount),
                created_at: row.try_get::<i64, _>("created_at")? as u64,
            });
        }

        Ok(state)
    }

    async fn save_session_key(&self, key: &SessionKey) -> Result<(), RpcError> {
        sqlx::query(
            "INSERT INTO session_keys \
                (address, wallet, application, scope, expires_at, created_at, revoked) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (address) DO UPDATE SET \
                scope = EXCLUDED.scope, \
                expires_at = EXCLUDED.expires_at, \
                revoked = EXCLUDED.revoked",
        )
        .bind(format!("0x{:x}", key.address))
        .bind(format!("0x{:x}", key.wallet))
        .bind(format!("0x{:x}", key.application))
        .bind(&key.scope)
        .bind(key.expires_at as i64)
        .bind(key.created_at as i64)
        .bind(key.revoked)
        .execute(&self.pool)
        .await?;

        for allowance in &key.allowances {
            sqlx::query(
                "INSERT INTO session_key_allowances (session_key, asset, cap, used) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (session_key, asset) DO UPDATE SET \
                    cap = EXCLUDED.cap, \
                    used = EXCLUDED.used",
            )
            .bind(format!("0x{:x}", key.address))
            .bind(&allowance.asset)
            .bind(allowance.amount.to_string())
            .bind(key.used_for(&allowance.asset).to_string())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn save_channel(&self, channel: &ChannelRecord) -> Result<(), RpcError> {
        sqlx::query(
            "INSERT INTO channels \
                (channel_id, chain_id, token, wallet, broker, status, version, \
                 wallet_allocation, broker_allocation, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (channel_id) DO UPDATE SET \
                status = EXCLUDED.status, \
                version = EXCLUDED.version, \
                wallet_allocation = EXCLUDED.wallet_allocation, \
                broker_allocation = EXCLUDED.broker_allocation, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&channel.channel_id)
        .bind(channel.chain_id as i64)
        .bind(format!("0x{:x}", channel.token))
        .bind(format!("0x{:x}", channel.wallet))
        .bind(format!("0x{:x}", channel.broker))
        .bind(channel_status_str(channel.status))
        .bind(channel.version as i64)
        .bind(channel.wallet_allocation.to_string())
        .bind(channel.broker_allocation.to_string())
        .bind(channel.updated_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_app_session(&self, session: &AppSession) -> Result<(), RpcError> {
        let participants: Vec<String> = session
            .definition
            .participants
            .iter()
            .map(|p| format!("0x{:x}", p))
            .collect();

        sqlx::query(
            "INSERT INTO app_sessions \
                (id, application, protocol, participants, weights, quorum, challenge, \
                 nonce, version, status, session_data, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET \
                version = EXCLUDED.version, \
                status = EXCLUDED.status, \
                session_data = EXCLUDED.session_data, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&session.id)
        .bind(format!("0x{:x}", session.definition.application))
        .bind(protocol_str(session.definition.protocol))
        .bind(serde_json::to_string(&participants).unwrap_or_default())
        .bind(serde_json::to_string(&session.definition.weights).unwrap_or_default())
        .bind(session.definition.quorum as i64)
        .bind(session.definition.challenge as i64)
        .bind(session.definition.nonce as i64)
        .bind(session.version as i64)
        .bind(if session.status == SessionStatus::Closed { "closed" } else { "open" })
        .bind(&session.session_data)
        .bind(session.created_at as i64)
        .bind(session.updated_at as i64)
        .execute(&self.pool)
        .await?;

        for (asset, per_participant) in &session.allocations {
            for (participant, amount) in per_participant {
                sqlx::query(
                    "INSERT INTO app_allocations (session_id, participant, asset, amount) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (session_id, participant, asset) DO UPDATE SET \
                        amount = EXCLUDED.amount",
                )
                .bind(&session.id)
                .bind(format!("0x{:x}", participant))
                .bind(asset)
                .bind(amount.to_string())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn commit_ledger(&self, commit: &LedgerCommit) -> Result<(), RpcError> {
        let mut tx = self.pool.begin().await?;

        for transaction in &commit.transactions {
            sqlx::query(
                "INSERT INTO ledger_transactions \
                    (id, tx_type, from_account, to_account, asset, amount, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(transaction.id as i64)
            .bind(transaction.tx_type.as_str())
            .bind(&transaction.from_account)
            .bind(&transaction.to_account)
            .bind(&transaction.asset)
            .bind(transaction.amount.to_string())
            .bind(transaction.created_at as i64)
            .execute(&mut *tx)
            .await?;
        }

        for entry in &commit.entries {
            sqlx::query(
                "INSERT INTO ledger_entries (tx_id, account_id, asset, amount, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(entry.tx_id as i64)
            .bind(&entry.account)
            .bind(&entry.asset)
            .bind(entry.amount.to_string())
            .bind(entry.created_at as i64)
            .execute(&mut *tx)
            .await?;
        }

        for (account, asset, balance) in &commit.balances {
            sqlx::query(
                "INSERT INTO ledger_accounts (account_id, asset, balance) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (account_id, asset) DO UPDATE SET \
                    balance = EXCLUDED.balance",
            )
            .bind(account)
            .bind(asset)
            .bind(balance.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_user_tag(&self, wallet: &str, tag: &str) -> Result<(), RpcError> {
        sqlx::query(
            "INSERT INTO wallets (wallet, tag) VALUES ($1, $2) \
             ON CONFLICT (wallet) DO NOTHING",
        )
        .bind(wallet)
        .bind(tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_rpc_history(&self, record: &RpcHistoryRecord) -> Result<(), RpcError> {
        sqlx::query(
            "INSERT INTO rpc_history (ts, wallet, method, params, signatures, response) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.ts as i64)
        .bind(&record.wallet)
        .bind(&record.method)
        .bind(&record.params)
        .bind(serde_json::to_string(&record.signatures).unwrap_or_default())
        .bind(&record.response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_rpc_history(
        &self,
        wallet: &str,
        limit: u32,
    ) -> Result<Vec<RpcHistoryRecord>, RpcError> {
        let rows = sqlx::query(
            "SELECT ts, wallet, method, params, signatures, response FROM rpc_history \
             WHERE wallet = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(wallet)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let signatures: String = row.try_get("signatures")?;
            records.push(RpcHistoryRecord {
                ts: row.try_get::<i64, _>("ts")? as u64,
                wallet: row.try_get("wallet")?,
                method: row.try_get("method")?,
                params: row.try_get("params")?,
                signatures: serde_json::from_str(&signatures).unwrap_or_default(),
                response: row.try_get("response")?,
            });
        }
        Ok(records)
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Non-durable store for tests and local development.
#[derive(Default)]
pub struct MemStore {
    history: Mutex<Vec<RpcHistoryRecord>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn init(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn seed_assets(&self, _assets: &[Asset]) -> Result<(), RpcError> {
        Ok(())
    }

    async fn load_state(&self) -> Result<PersistedState, RpcError> {
        Ok(PersistedState::default())
    }

    async fn save_session_key(&self, _key: &SessionKey) -> Result<(), RpcError> {
        Ok(())
    }

    async fn save_channel(&self, _channel: &ChannelRecord) -> Result<(), RpcError> {
        Ok(())
    }

    async fn save_app_session(&self, _session: &AppSession) -> Result<(), RpcError> {
        Ok(())
    }

    async fn commit_ledger(&self, _commit: &LedgerCommit) -> Result<(), RpcError> {
        Ok(())
    }

    async fn save_user_tag(&self, _wallet: &str, _tag: &str) -> Result<(), RpcError> {
        Ok(())
    }

    async fn append_rpc_history(&self, record: &RpcHistoryRecord) -> Result<(), RpcError> {
        self.history.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn load_rpc_history(
        &self,
        wallet: &str,
        limit: u32,
    ) -> Result<Vec<RpcHistoryRecord>, RpcError> {
        let history = self.history.lock().unwrap();
        Ok(history
            .iter()
            .rev()
            .filter(|r| r.wallet == wallet)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_text_round_trips() {
        for status in [
            ChannelStatus::Initial,
            ChannelStatus::Active,
            ChannelStatus::Resizing,
            ChannelStatus::Challenged,
            ChannelStatus::Closed,
        ] {
            assert_eq!(parse_channel_status(channel_status_str(status)), status);
        }
        assert_eq!(parse_protocol(protocol_str(Protocol::V02)), Protocol::V02);
        assert_eq!(parse_tx_type("app_deposit"), LedgerTxType::AppDeposit);
        assert_eq!(parse_tx_type("channel_out"), LedgerTxType::ChannelOut);
    }

    #[tokio::test]
    async fn mem_store_filters_history_by_wallet() {
        let store = MemStore::new();
        for (wallet, method) in [("0xaa", "transfer"), ("0xbb", "transfer"), ("0xaa", "close_app_session")] {
            store
                .append_rpc_history(&RpcHistoryRecord {
                    ts: 1,
                    wallet: wallet.into(),
                    method: method.into(),
                    params: "[{}]".into(),
                    signatures: vec!["0xsig".into()],
                    response: "{}".into(),
                })
                .await
                .unwrap();
        }

        let records = store.load_rpc_history("0xaa", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        // Newest first.
        assert_eq!(records[0].method, "close_app_session");
    }
}
