// channels.rs - Custody channel mirror and settlement oracle
//
// The broker never mutates on-chain state. It mirrors what the settlement
// oracle reports, keeps the ledger consistent with custody through
// channel_in / channel_out moves, and countersigns channel states so the
// custody contract can verify them during settlement.
//
// Allocation convention: `broker_allocation` is the custody backing the
// wallet's unified off-chain balance; `wallet_allocation` is what currently
// sits in-channel on the wallet's side. A non-zero wallet allocation gates
// every off-chain debit of that wallet and asset.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{keccak256, Address};
use alloy::providers::RootProvider;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::crypto::{self, parse_b256};
use crate::db::Store;
use crate::error::RpcError;
use crate::ledger::Ledger;
use crate::model::{
    now_ms, Asset, ChannelRecord, ChannelStateResponse, ChannelStatus, ChannelView,
    CloseChannelParams, CreateChannelParams, ResizeChannelParams,
};

/// Source of authoritative on-chain channel state.
#[async_trait]
pub trait SettlementOracle: Send + Sync {
    async fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelRecord>, RpcError>;
}

sol! {
    #[sol(rpc)]
    contract ICustody {
        function getChannel(bytes32 channelId) external view returns (
            address wallet,
            address broker,
            address token,
            uint8 status,
            uint256 version,
            uint256 walletAllocation,
            uint256 brokerAllocation
        );
    }
}

/// Oracle backed by the custody contract.
pub struct ContractOracle {
    provider: Arc<RootProvider>,
    custody: Address,
    chain_id: u64,
    assets: Arc<Vec<Asset>>,
}

impl ContractOracle {
    pub fn new(
        provider: Arc<RootProvider>,
        custody: Address,
        chain_id: u64,
        assets: Arc<Vec<Asset>>,
    ) -> Self {
        Self { provider, custody, chain_id, assets }
    }
}

#[async_trait]
impl SettlementOracle for ContractOracle {
    async fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelRecord>, RpcError> {
        let id = parse_b256(channel_id)?;
        let contract = ICustody::new(self.custody, self.provider.clone());
        let state = contract
            .getChannel(id)
            .call()
            .await
            .map_err(|e| RpcError::Internal(format!("custody contract call failed: {}", e)))?;

        if state.wallet == Address::ZERO {
            return Ok(None);
        }

        let decimals = self
            .assets
            .iter()
            .find(|a| a.token == state.token && a.chain_id == self.chain_id)
            .map(|a| a.decimals)
            .ok_or_else(|| RpcError::Internal(format!("unknown token 0x{:x}", state.token)))?;

        Ok(Some(ChannelRecord {
            channel_id: channel_id.to_string(),
            chain_id: self.chain_id,
            token: state.token,
            wallet: state.wallet,
            broker: state.broker,
            status: match state.status {
                1 => ChannelStatus::Active,
                2 => ChannelStatus::Resizing,
                3 => ChannelStatus::Challenged,
                4 => ChannelStatus::Closed,
                _ => ChannelStatus::Initial,
            },
            version: state.version.to::<u64>(),
            wallet_allocation: crypto::from_token_units(state.walletAllocation, decimals)?,
            broker_allocation: crypto::from_token_units(state.brokerAllocation, decimals)?,
            updated_at: now_ms(),
        }))
    }
}

// =============================================================================
// CHANNEL ENGINE
// =============================================================================

pub struct Channels {
    channels: Arc<RwLock<HashMap<String, ChannelRecord>>>,
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    assets: Arc<Vec<Asset>>,
    broker: Address,
    chain_id: u64,
    custody: Address,
}

impl Channels {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        assets: Arc<Vec<Asset>>,
        broker: Address,
        chain_id: u64,
        custody: Address,
    ) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            store,
            ledger,
            assets,
            broker,
            chain_id,
            custody,
        }
    }

    pub async fn load(&self, channels: Vec<ChannelRecord>) {
        let mut map = self.channels.write().await;
        for channel in channels {
            map.insert(channel.channel_id.clone(), channel);
        }
    }

    pub fn asset_symbol(&self, token: Address, chain_id: u64) -> Option<String> {
        self.assets
            .iter()
            .find(|a| a.token == token && a.chain_id == chain_id)
            .map(|a| a.symbol.clone())
    }

    fn symbol_to_token(&self, symbol: &str) -> Option<(Address, u64, u8)> {
        self.assets
            .iter()
            .find(|a| a.symbol == symbol)
            .map(|a| (a.token, a.chain_id, a.decimals))
    }

    /// Gate rule: true if any open channel held by one of `holders` still
    /// carries a non-zero wallet-side allocation in `asset`. Historical
    /// channels may record a session key where a wallet is expected, so
    /// callers pass every address the wallet is known by.
    pub async fn has_non_zero_allocation(&self, holders: &[Address], asset: &str) -> bool {
        let map = self.channels.read().await;
        map.values().any(|channel| {
            channel.status != ChannelStatus::Closed
                && !channel.wallet_allocation.is_zero()
                && holders.contains(&channel.wallet)
                && self
                    .asset_symbol(channel.token, channel.chain_id)
                    .as_deref()
                    == Some(asset)
        })
    }

    pub async fn status(&self, channel_id: &str) -> Option<ChannelStatus> {
        let map = self.channels.read().await;
        map.get(channel_id).map(|c| c.status)
    }

    pub async fn list(
        &self,
        wallet: Option<Address>,
        status: Option<ChannelStatus>,
    ) -> Vec<ChannelView> {
        let map = self.channels.read().await;
        let mut channels: Vec<&ChannelRecord> = map
            .values()
            .filter(|c| wallet.map(|w| c.wallet == w).unwrap_or(true))
            .filter(|c| status.map(|s| c.status == s).unwrap_or(true))
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels.iter().map(|c| ChannelView::from_record(c)).collect()
    }

    /// Ingest an oracle-reported state. The ledger mirrors the
    /// broker-allocation delta: growth is a custody deposit (channel_in),
    /// shrinkage is funds leaving custody (channel_out).
    pub async fn sync_channel(&self, reported: ChannelRecord) -> Result<(), RpcError> {
        let symbol = self
            .asset_symbol(reported.token, reported.chain_id)
            .ok_or_else(|| RpcError::Internal(format!("unknown token 0x{:x}", reported.token)))?;
        let wallet_key = crate::model::address_key(reported.wallet);

        let previous_backing = {
            let map = self.channels.read().await;
            map.get(&reported.channel_id)
                .map(|c| c.broker_allocation)
                .unwrap_or(Decimal::ZERO)
        };

        let delta = reported.broker_allocation - previous_backing;
        if delta > Decimal::ZERO {
            self.ledger.credit_on_chain(&wallet_key, &symbol, delta).await?;
        } else if delta < Decimal::ZERO {
            self.ledger.debit_on_withdraw(&wallet_key, &symbol, -delta).await?;
        }

        self.store.save_channel(&reported).await?;
        let mut map = self.channels.write().await;
        map.insert(reported.channel_id.clone(), reported);
        Ok(())
    }

    /// Re-pull every non-terminal channel from the oracle.
    pub async fn refresh_from_oracle(&self, oracle: &dyn SettlementOracle) -> Result<(), RpcError> {
        let ids: Vec<String> = {
            let map = self.channels.read().await;
            map.values()
                .filter(|c| c.status != ChannelStatus::Closed)
                .map(|c| c.channel_id.clone())
                .collect()
        };
        for id in ids {
            if let Some(reported) = oracle.channel_state(&id).await? {
                self.sync_channel(reported).await?;
            }
        }
        Ok(())
    }

    async fn countersign(
        &self,
        signer: &PrivateKeySigner,
        channel: &ChannelRecord,
        decimals: u8,
    ) -> Result<String, RpcError> {
        let digest = crypto::channel_state_digest(
            parse_b256(&channel.channel_id)?,
            channel.version,
            &[channel.wallet, channel.broker],
            &[
                crypto::to_token_units(channel.wallet_allocation, decimals)?,
                crypto::to_token_units(channel.broker_allocation, decimals)?,
            ],
            self.chain_id,
            self.custody,
        );
        crypto::sign_digest(signer, digest).await
    }

    /// Register a channel intent and countersign its initial state. Funds
    /// only reach the ledger once the oracle reports the deposit.
    pub async fn create_channel(
        &self,
        wallet: Address,
        params: CreateChannelParams,
        signer: &PrivateKeySigner,
    ) -> Result<ChannelStateResponse, RpcError> {
        let symbol = self
            .asset_symbol(params.token, params.chain_id)
            .ok_or_else(|| RpcError::invalid(format!("unknown token 0x{:x}", params.token)))?;
        let (_, _, decimals) = self
            .symbol_to_token(&symbol)
            .ok_or_else(|| RpcError::invalid(format!("unknown asset {}", symbol)))?;
        if params.amount <= Decimal::ZERO {
            return Err(RpcError::invalid("channel amount must be positive".to_string()));
        }

        let mut preimage = Vec::with_capacity(20 + 20 + 8 + 8);
        preimage.extend_from_slice(wallet.as_slice());
        preimage.extend_from_slice(params.token.as_slice());
        preimage.extend_from_slice(&params.chain_id.to_be_bytes());
        preimage.extend_from_slice(&now_ms().to_be_bytes());
        let channel_id = format!("0x{:x}", keccak256(&preimage));

        let channel = ChannelRecord {
            channel_id,
            chain_id: params.chain_id,
            token: params.token,
            wallet,
            broker: self.broker,
            status: ChannelStatus::Initial,
            version: 1,
            wallet_allocation: params.amount,
            broker_allocation: Decimal::ZERO,
            updated_at: now_ms(),
        };

        let state_signature = self.countersign(signer, &channel, decimals).await?;
        self.store.save_channel(&channel).await?;
        let view = ChannelView::from_record(&channel);
        self.channels
            .write()
            .await
            .insert(channel.channel_id.clone(), channel);

        Ok(ChannelStateResponse { channel: view, state_signature })
    }

    /// Countersign a resize intent. Only an active channel may resize, and
    /// only one resize may be in flight.
    pub async fn resize_channel(
        &self,
        wallet: Address,
        params: ResizeChannelParams,
        signer: &PrivateKeySigner,
    ) -> Result<ChannelStateResponse, RpcError> {
        let mut map = self.channels.write().await;
        let channel = map
            .get_mut(&params.channel_id)
            .ok_or_else(|| RpcError::ChannelNotFound(params.channel_id.clone()))?;
        if channel.wallet != wallet {
            return Err(RpcError::denied("channel belongs to another wallet"));
        }
        match channel.status {
            ChannelStatus::Resizing => return Err(RpcError::denied("resize already ongoing")),
            ChannelStatus::Active => {}
            _ => return Err(RpcError::denied("channel is not active")),
        }
        if params.new_amount < Decimal::ZERO {
            return Err(RpcError::invalid("resize amount must be non-negative".to_string()));
        }

        let decimals = self
            .assets
            .iter()
            .find(|a| a.token == channel.token && a.chain_id == channel.chain_id)
            .map(|a| a.decimals)
            .ok_or_else(|| RpcError::Internal(format!("unknown token 0x{:x}", channel.token)))?;

        channel.status = ChannelStatus::Resizing;
        channel.version += 1;
        channel.wallet_allocation = params.new_amount;
        channel.updated_at = now_ms();

        let snapshot = channel.clone();
        drop(map);

        let state_signature = self.countersign(signer, &snapshot, decimals).await?;
        self.store.save_channel(&snapshot).await?;
        Ok(ChannelStateResponse {
            channel: ChannelView::from_record(&snapshot),
            state_signature,
        })
    }

    /// Countersign the final state and settle the channel's unified backing
    /// out of the ledger.
    pub async fn close_channel(
        &self,
        wallet: Address,
        params: CloseChannelParams,
        signer: &PrivateKeySigner,
    ) -> Result<ChannelStateResponse, RpcError> {
        let mut map = self.channels.write().await;
        let channel = map
            .get_mut(&params.channel_id)
            .ok_or_else(|| RpcError::ChannelNotFound(params.channel_id.clone()))?;
        if channel.wallet != wallet {
            return Err(RpcError::denied("channel belongs to another wallet"));
        }
        if channel.status == ChannelStatus::Closed {
            return Err(RpcError::denied("channel already closed"));
        }

        let symbol = self
            .asset_symbol(channel.token, channel.chain_id)
            .ok_or_else(|| RpcError::Internal(format!("unknown token 0x{:x}", channel.token)))?;
        let decimals = self
            .symbol_to_token(&symbol)
            .map(|(_, _, d)| d)
            .unwrap_or_default();

        // The final state pays the wallet its unified balance; custody
        // backing beyond that stays with the broker side of the pool.
        let wallet_key = crate::model::address_key(wallet);
        let payout = self.ledger.unified_balance(&wallet_key, &symbol).await;

        channel.status = ChannelStatus::Closed;
        channel.version += 1;
        channel.wallet_allocation += payout;
        channel.broker_allocation = (channel.broker_allocation - payout).max(Decimal::ZERO);
        channel.updated_at = now_ms();

        let snapshot = channel.clone();
        drop(map);

        if payout > Decimal::ZERO {
            self.ledger.debit_on_withdraw(&wallet_key, &symbol, payout).await?;
        }

        let state_signature = self.countersign(signer, &snapshot, decimals).await?;
        self.store.save_channel(&snapshot).await?;
        Ok(ChannelStateResponse {
            channel: ChannelView::from_record(&snapshot),
            state_signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use crate::model::address_key;
    use rust_decimal_macros::dec;

    fn asset_fixture() -> Asset {
        Asset {
            symbol: "usdc".into(),
            chain_id: 31337,
            token: Address::repeat_byte(0x55),
            decimals: 6,
        }
    }

    fn engine() -> (Channels, Arc<Ledger>, Address) {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let broker = Address::repeat_byte(0xBB);
        let channels = Channels::new(
            store,
            ledger.clone(),
            Arc::new(vec![asset_fixture()]),
            broker,
            31337,
            Address::repeat_byte(0x99),
        );
        (channels, ledger, broker)
    }

    fn record(id: &str, wallet: Address, status: ChannelStatus, in_channel: Decimal, backing: Decimal) -> ChannelRecord {
        ChannelRecord {
            channel_id: id.into(),
            chain_id: 31337,
            token: Address::repeat_byte(0x55),
            wallet,
            broker: Address::repeat_byte(0xBB),
            status,
            version: 1,
            wallet_allocation: in_channel,
            broker_allocation: backing,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn sync_credits_ledger_on_deposit_and_debits_on_exit() {
        let (channels, ledger, _) = engine();
        let wallet = Address::repeat_byte(0x11);

        // Deposit confirmed: 1000 usdc of backing appears.
        channels
            .sync_channel(record("0xc1", wallet, ChannelStatus::Active, dec!(0), dec!(1000)))
            .await
            .unwrap();
        assert_eq!(ledger.unified_balance(&address_key(wallet), "usdc").await, dec!(1000));

        // Resize allocates 1 usdc back into the channel.
        channels
            .sync_channel(record("0xc1", wallet, ChannelStatus::Resizing, dec!(1), dec!(999)))
            .await
            .unwrap();
        assert_eq!(ledger.unified_balance(&address_key(wallet), "usdc").await, dec!(999));
    }

    #[tokio::test]
    async fn gate_detects_non_zero_allocation_including_legacy_holders() {
        let (channels, _, _) = engine();
        let wallet = Address::repeat_byte(0x11);
        let legacy_key = Address::repeat_byte(0x12);

        channels
            .sync_channel(record("0xc1", legacy_key, ChannelStatus::Resizing, dec!(1), dec!(0)))
            .await
            .unwrap();

        assert!(!channels.has_non_zero_allocation(&[wallet], "usdc").await);
        // Historical channel recorded the session key as participant.
        assert!(channels.has_non_zero_allocation(&[wallet, legacy_key], "usdc").await);
        assert!(!channels.has_non_zero_allocation(&[wallet, legacy_key], "weth").await);
    }

    #[tokio::test]
    async fn closed_channels_do_not_gate() {
        let (channels, _, _) = engine();
        let wallet = Address::repeat_byte(0x11);
        channels
            .sync_channel(record("0xc1", wallet, ChannelStatus::Closed, dec!(5), dec!(0)))
            .await
            .unwrap();
        assert!(!channels.has_non_zero_allocation(&[wallet], "usdc").await);
    }

    #[tokio::test]
    async fn create_resize_close_lifecycle() {
        let (channels, ledger, _) = engine();
        let wallet = Address::repeat_byte(0x11);
        let signer = PrivateKeySigner::random();

        let created = channels
            .create_channel(
                wallet,
                CreateChannelParams {
                    chain_id: 31337,
                    token: Address::repeat_byte(0x55),
                    amount: dec!(1000),
                },
                &signer,
            )
            .await
            .unwrap();
        assert!(created.state_signature.starts_with("0x"));
        let id = created.channel.channel_id.clone();
        assert_eq!(channels.status(&id).await, Some(ChannelStatus::Initial));

        // Oracle confirms the deposit was absorbed into the unified balance.
        channels
            .sync_channel(record(&id, wallet, ChannelStatus::Active, dec!(0), dec!(1000)))
            .await
            .unwrap();

        let resized = channels
            .resize_channel(
                wallet,
                ResizeChannelParams { channel_id: id.clone(), new_amount: dec!(1) },
                &signer,
            )
            .await
            .unwrap();
        assert_eq!(resized.channel.status, ChannelStatus::Resizing);

        // Second resize while one is in flight.
        let err = channels
            .resize_channel(
                wallet,
                ResizeChannelParams { channel_id: id.clone(), new_amount: dec!(2) },
                &signer,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "operation denied: resize already ongoing");

        // Oracle completes the resize.
        channels
            .sync_channel(record(&id, wallet, ChannelStatus::Active, dec!(1), dec!(999)))
            .await
            .unwrap();

        let closed = channels
            .close_channel(wallet, CloseChannelParams { channel_id: id.clone() }, &signer)
            .await
            .unwrap();
        assert_eq!(closed.channel.status, ChannelStatus::Closed);
        assert_eq!(ledger.unified_balance(&address_key(wallet), "usdc").await, dec!(0));
    }

    #[tokio::test]
    async fn foreign_wallet_cannot_touch_channel() {
        let (channels, _, _) = engine();
        let wallet = Address::repeat_byte(0x11);
        let other = Address::repeat_byte(0x22);
        let signer = PrivateKeySigner::random();

        channels
            .sync_channel(record("0xc1", wallet, ChannelStatus::Active, dec!(0), dec!(10)))
            .await
            .unwrap();

        let err = channels
            .close_channel(other, CloseChannelParams { channel_id: "0xc1".into() }, &signer)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("another wallet"));
    }
}
