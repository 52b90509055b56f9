// ledger.rs - Double-entry ledger engine
//
// Every balance move commits as one or more legs; per asset the legs of a
// transaction sum to zero. Balances live in memory behind one write lock
// and are written through the store atomically. A failed commit applies
// nothing, in memory or in the store.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::db::{LedgerCommit, PersistedState, Store};
use crate::error::RpcError;
use crate::model::{now_ms, BalanceEntry, LedgerEntry, LedgerTransaction, LedgerTxType};

/// Synthetic account mirroring funds held by the custody contract. The one
/// account allowed to go negative: it is the counter-side of every
/// channel_in / channel_out move.
pub const EXTERNAL_ACCOUNT: &str = "custody";

/// One requested balance move inside a commit.
#[derive(Debug, Clone)]
pub struct Leg {
    pub tx_type: LedgerTxType,
    pub from: String,
    pub to: String,
    pub asset: String,
    pub amount: Decimal,
}

struct LedgerInner {
    balances: HashMap<(String, String), Decimal>,
    transactions: Vec<LedgerTransaction>,
    entries: Vec<LedgerEntry>,
    next_tx_id: u64,
}

pub struct Ledger {
    inner: Arc<RwLock<LedgerInner>>,
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LedgerInner {
                balances: HashMap::new(),
                transactions: Vec::new(),
                entries: Vec::new(),
                next_tx_id: 1,
            })),
            store,
        }
    }

    pub async fn load(&self, state: &PersistedState) {
        let mut inner = self.inner.write().await;
        inner.balances = state.balances.clone();
        inner.transactions = state.transactions.clone();
        inner.entries = state.entries.clone();
        inner.next_tx_id = state
            .transactions
            .iter()
            .map(|t| t.id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(1);
    }

    /// Commit a batch of legs atomically: all of them or none. Fails with
    /// `InsufficientBalance` if any non-synthetic account would go negative
    /// at any point of the batch, applied in order.
    pub async fn commit(&self, legs: Vec<Leg>) -> Result<Vec<LedgerTransaction>, RpcError> {
        if legs.is_empty() {
            return Ok(Vec::new());
        }
        for leg in &legs {
            if leg.amount <= Decimal::ZERO {
                return Err(RpcError::invalid(format!(
                    "non-positive transfer amount: {}",
                    leg.amount
                )));
            }
            if leg.from == leg.to {
                return Err(RpcError::invalid("transfer to self".to_string()));
            }
        }

        let mut inner = self.inner.write().await;
        let now = now_ms();

        // Stage the whole batch against scratch balances first.
        let mut scratch: HashMap<(String, String), Decimal> = HashMap::new();
        fn balance_of(
            inner: &LedgerInner,
            scratch: &HashMap<(String, String), Decimal>,
            account: &str,
            asset: &str,
        ) -> Decimal {
            let key = (account.to_string(), asset.to_string());
            scratch
                .get(&key)
                .or_else(|| inner.balances.get(&key))
                .copied()
                .unwrap_or(Decimal::ZERO)
        }

        let mut transactions = Vec::with_capacity(legs.len());
        let mut entries = Vec::with_capacity(legs.len() * 2);
        let mut tx_id = inner.next_tx_id;

        for leg in &legs {
            let from_balance = balance_of(&inner, &scratch, &leg.from, &leg.asset);
            let after = from_balance - leg.amount;
            if after < Decimal::ZERO && leg.from != EXTERNAL_ACCOUNT {
                return Err(RpcError::InsufficientBalance {
                    account: leg.from.clone(),
                    asset: leg.asset.clone(),
                    available: from_balance,
                    required: leg.amount,
                });
            }
            let to_balance = balance_of(&inner, &scratch, &leg.to, &leg.asset);

            scratch.insert((leg.from.clone(), leg.asset.clone()), after);
            scratch.insert((leg.to.clone(), leg.asset.clone()), to_balance + leg.amount);

            transactions.push(LedgerTransaction {
                id: tx_id,
                tx_type: leg.tx_type,
                from_account: leg.from.clone(),
                to_account: leg.to.clone(),
                asset: leg.asset.clone(),
                amount: leg.amount,
                created_at: now,
            });
            entries.push(LedgerEntry {
                tx_id,
                account: leg.from.clone(),
                asset: leg.asset.clone(),
                amount: -leg.amount,
                created_at: now,
            });
            entries.push(LedgerEntry {
                tx_id,
                account: leg.to.clone(),
                asset: leg.asset.clone(),
                amount: leg.amount,
                created_at: now,
            });
            tx_id += 1;
        }

        let commit = LedgerCommit {
            transactions: transactions.clone(),
            entries: entries.clone(),
            balances: scratch
                .iter()
                .map(|((account, asset), balance)| (account.clone(), asset.clone(), *balance))
                .collect(),
        };
        self.store.commit_ledger(&commit).await?;

        // Store committed; apply to memory.
        for (key, balance) in scratch {
            inner.balances.insert(key, balance);
        }
        inner.transactions.extend(transactions.iter().cloned());
        inner.entries.extend(entries);
        inner.next_tx_id = tx_id;

        Ok(transactions)
    }

    // =========================================================================
    // Named operations
    // =========================================================================

    /// Mirror of an on-chain custody deposit.
    pub async fn credit_on_chain(
        &self,
        wallet: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<Vec<LedgerTransaction>, RpcError> {
        self.commit(vec![Leg {
            tx_type: LedgerTxType::ChannelIn,
            from: EXTERNAL_ACCOUNT.to_string(),
            to: wallet.to_string(),
            asset: asset.to_string(),
            amount,
        }])
        .await
    }

    /// Mirror of a custody withdraw.
    pub async fn debit_on_withdraw(
        &self,
        wallet: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<Vec<LedgerTransaction>, RpcError> {
        self.commit(vec![Leg {
            tx_type: LedgerTxType::ChannelOut,
            from: wallet.to_string(),
            to: EXTERNAL_ACCOUNT.to_string(),
            asset: asset.to_string(),
            amount,
        }])
        .await
    }

    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<Vec<LedgerTransaction>, RpcError> {
        self.commit(vec![Leg {
            tx_type: LedgerTxType::Transfer,
            from: from.to_string(),
            to: to.to_string(),
            asset: asset.to_string(),
            amount,
        }])
        .await
    }

    /// Move funds from a wallet into an app session account.
    pub async fn app_deposit(
        &self,
        wallet: &str,
        app_session_id: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<Vec<LedgerTransaction>, RpcError> {
        self.commit(vec![Leg {
            tx_type: LedgerTxType::AppDeposit,
            from: wallet.to_string(),
            to: app_session_id.to_string(),
            asset: asset.to_string(),
            amount,
        }])
        .await
    }

    /// Reverse of `app_deposit`.
    pub async fn app_withdraw(
        &self,
        app_session_id: &str,
        wallet: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<Vec<LedgerTransaction>, RpcError> {
        self.commit(vec![Leg {
            tx_type: LedgerTxType::AppWithdraw,
            from: app_session_id.to_string(),
            to: wallet.to_string(),
            asset: asset.to_string(),
            amount,
        }])
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn balance(&self, account: &str, asset: &str) -> Decimal {
        let inner = self.inner.read().await;
        inner
            .balances
            .get(&(account.to_string(), asset.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// A wallet's unified off-chain balance in an asset.
    pub async fn unified_balance(&self, wallet: &str, asset: &str) -> Decimal {
        self.balance(wallet, asset).await
    }

    pub async fn snapshot_balances(
        &self,
        account: &str,
        assets: Option<&[String]>,
    ) -> Vec<BalanceEntry> {
        let inner = self.inner.read().await;
        let mut snapshot: Vec<BalanceEntry> = inner
            .balances
            .iter()
            .filter(|((owner, asset), balance)| {
                owner == account
                    && !balance.is_zero()
                    && assets.map(|list| list.contains(asset)).unwrap_or(true)
            })
            .map(|((_, asset), balance)| BalanceEntry {
                asset: asset.clone(),
                amount: *balance,
            })
            .collect();
        snapshot.sort_by(|a, b| a.asset.cmp(&b.asset));
        snapshot
    }

    pub async fn list_entries(
        &self,
        account: Option<&str>,
        asset: Option<&str>,
    ) -> Vec<LedgerEntry> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .filter(|e| account.map(|a| e.account == a).unwrap_or(true))
            .filter(|e| asset.map(|a| e.asset == a).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn list_transactions(
        &self,
        account: Option<&str>,
        asset: Option<&str>,
        tx_type: Option<LedgerTxType>,
    ) -> Vec<LedgerTransaction> {
        let inner = self.inner.read().await;
        inner
            .transactions
            .iter()
            .filter(|t| {
                account
                    .map(|a| t.from_account == a || t.to_account == a)
                    .unwrap_or(true)
            })
            .filter(|t| asset.map(|a| t.asset == a).unwrap_or(true))
            .filter(|t| tx_type.map(|ty| t.tx_type == ty).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use rust_decimal_macros::dec;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemStore::new()))
    }

    #[tokio::test]
    async fn entries_sum_to_zero_per_transaction() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(1000)).await.unwrap();
        ledger.transfer("0xalice", "0xbob", "usdc", dec!(250)).await.unwrap();

        let entries = ledger.list_entries(None, Some("usdc")).await;
        let mut per_tx: HashMap<u64, Decimal> = HashMap::new();
        for entry in entries {
            *per_tx.entry(entry.tx_id).or_default() += entry.amount;
        }
        assert!(!per_tx.is_empty());
        assert!(per_tx.values().all(|sum| sum.is_zero()));
    }

    #[tokio::test]
    async fn transfer_rejects_overdraft() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(100)).await.unwrap();

        let err = ledger
            .transfer("0xalice", "0xbob", "usdc", dec!(150))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("insufficient balance:"));
        assert_eq!(ledger.balance("0xalice", "usdc").await, dec!(100));
        assert_eq!(ledger.balance("0xbob", "usdc").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn batch_commit_is_all_or_nothing() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(100)).await.unwrap();

        // Second leg overdraws; the first must not survive.
        let err = ledger
            .commit(vec![
                Leg {
                    tx_type: LedgerTxType::AppDeposit,
                    from: "0xalice".into(),
                    to: "0xsession".into(),
                    asset: "usdc".into(),
                    amount: dec!(60),
                },
                Leg {
                    tx_type: LedgerTxType::AppDeposit,
                    from: "0xalice".into(),
                    to: "0xsession".into(),
                    asset: "usdc".into(),
                    amount: dec!(60),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance("0xalice", "usdc").await, dec!(100));
        assert_eq!(ledger.balance("0xsession", "usdc").await, Decimal::ZERO);
        assert!(ledger.list_transactions(Some("0xsession"), None, None).await.is_empty());
    }

    #[tokio::test]
    async fn transaction_ids_are_monotonic() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(10)).await.unwrap();
        let batch = ledger
            .commit(vec![
                Leg {
                    tx_type: LedgerTxType::Transfer,
                    from: "0xalice".into(),
                    to: "0xbob".into(),
                    asset: "usdc".into(),
                    amount: dec!(1),
                },
                Leg {
                    tx_type: LedgerTxType::Transfer,
                    from: "0xalice".into(),
                    to: "0xcarol".into(),
                    asset: "usdc".into(),
                    amount: dec!(2),
                },
            ])
            .await
            .unwrap();

        let ids: Vec<u64> = ledger
            .list_transactions(None, None, None)
            .await
            .iter()
            .map(|t| t.id)
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].id, batch[0].id + 1);
    }

    #[tokio::test]
    async fn custody_account_mirrors_external_funds() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(500)).await.unwrap();
        assert_eq!(ledger.balance(EXTERNAL_ACCOUNT, "usdc").await, dec!(-500));

        ledger.debit_on_withdraw("0xalice", "usdc", dec!(200)).await.unwrap();
        assert_eq!(ledger.balance(EXTERNAL_ACCOUNT, "usdc").await, dec!(-300));
        assert_eq!(ledger.unified_balance("0xalice", "usdc").await, dec!(300));
    }

    #[tokio::test]
    async fn snapshot_filters_assets_and_zero_balances() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(5)).await.unwrap();
        ledger.credit_on_chain("0xalice", "weth", dec!(1)).await.unwrap();
        ledger.debit_on_withdraw("0xalice", "weth", dec!(1)).await.unwrap();

        let all = ledger.snapshot_balances("0xalice", None).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].asset, "usdc");

        let filtered = ledger
            .snapshot_balances("0xalice", Some(&["weth".to_string()]))
            .await;
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn app_deposit_and_withdraw_round_trip() {
        let ledger = ledger();
        ledger.credit_on_chain("0xalice", "usdc", dec!(100)).await.unwrap();

        ledger.app_deposit("0xalice", "0xsession", "usdc", dec!(75)).await.unwrap();
        assert_eq!(ledger.balance("0xsession", "usdc").await, dec!(75));
        assert_eq!(ledger.unified_balance("0xalice", "usdc").await, dec!(25));

        ledger.app_withdraw("0xsession", "0xalice", "usdc", dec!(30)).await.unwrap();
        assert_eq!(ledger.balance("0xsession", "usdc").await, dec!(45));
        assert_eq!(ledger.unified_balance("0xalice", "usdc").await, dec!(55));

        // The session account cannot go negative either.
        let err = ledger
            .app_withdraw("0xsession", "0xalice", "usdc", dec!(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn zero_and_negative_amounts_are_rejected() {
        let ledger = ledger();
        assert!(ledger.credit_on_chain("0xalice", "usdc", dec!(0)).await.is_err());
        assert!(ledger.transfer("0xa", "0xb", "usdc", dec!(-5)).await.is_err());
    }
}
