//! Account manager: the sole authority over user balances.
//!
//! Balances move only through this API (deposit, withdraw, reserve, release,
//! settle). Each user has their own lock; a fill touches buyer and seller and
//! takes both locks in canonical (lexicographic user-id) order so concurrent
//! settlements cannot deadlock.
//!
//! Commission is credited to an internal fee account, which keeps the
//! conservation invariant checkable: per asset, deposits − withdrawals equals
//! the sum of free + locked over all accounts including fees.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::Balance;

/// Internal account that collects commissions.
pub const FEE_ACCOUNT: &str = "@fees";

#[derive(Debug, Default)]
struct UserAccount {
    balances: HashMap<String, Balance>,
}

impl UserAccount {
    fn balance_mut(&mut self, asset: &str) -> &mut Balance {
        self.balances.entry(asset.to_string()).or_default()
    }

    /// Debit `amount` from the locked bucket. A shortfall here means a
    /// reservation was never taken or was double-spent — that is a bug, not
    /// an input error, so it aborts.
    fn debit_locked(&mut self, user_id: &str, asset: &str, amount: Decimal) {
        let balance = self.balance_mut(asset);
        if balance.locked < amount {
            error!(
                user_id,
                asset,
                locked = %balance.locked,
                amount = %amount,
                "locked balance underflow"
            );
            panic!("invariant violation: locked balance underflow for {user_id}/{asset}");
        }
        balance.locked -= amount;
    }
}

/// Point-in-time view of one account, shaped for the `/account` endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub user_id: String,
    pub balances: Vec<AssetBalance>,
    pub maker_commission: Decimal,
    pub taker_commission: Decimal,
    pub can_trade: bool,
    pub can_withdraw: bool,
    pub can_deposit: bool,
    pub update_time: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

pub struct AccountManager {
    accounts: RwLock<HashMap<String, Arc<Mutex<UserAccount>>>>,
    /// api key -> user id.
    api_keys: RwLock<HashMap<String, String>>,
    maker_commission: Decimal,
    taker_commission: Decimal,
}

impl AccountManager {
    pub fn new(maker_commission: Decimal, taker_commission: Decimal) -> Self {
        let manager = Self {
            accounts: RwLock::new(HashMap::new()),
            api_keys: RwLock::new(HashMap::new()),
            maker_commission,
            taker_commission,
        };
        manager
            .accounts
            .write()
            .expect("accounts lock")
            .insert(FEE_ACCOUNT.to_string(), Default::default());
        manager
    }

    pub fn maker_commission(&self) -> Decimal {
        self.maker_commission
    }

    pub fn taker_commission(&self) -> Decimal {
        self.taker_commission
    }

    /// Create a user and return their api key. Registering an existing user
    /// id is rejected.
    pub fn register_user(&self, user_id: &str) -> ExchangeResult<String> {
        let mut accounts = self.accounts.write().expect("accounts lock");
        if accounts.contains_key(user_id) {
            return Err(ExchangeError::InvalidParam(format!(
                "user {user_id} already registered"
            )));
        }
        accounts.insert(user_id.to_string(), Default::default());
        drop(accounts);

        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let api_key = hex::encode(key_bytes);
        self.api_keys
            .write()
            .expect("api keys lock")
            .insert(api_key.clone(), user_id.to_string());
        debug!(user_id, "user registered");
        Ok(api_key)
    }

    pub fn resolve_api_key(&self, api_key: &str) -> Option<String> {
        self.api_keys
            .read()
            .expect("api keys lock")
            .get(api_key)
            .cloned()
    }

    fn account(&self, user_id: &str) -> ExchangeResult<Arc<Mutex<UserAccount>>> {
        self.accounts
            .read()
            .expect("accounts lock")
            .get(user_id)
            .cloned()
            .ok_or(ExchangeError::UnknownAccount)
    }

    pub fn deposit(&self, user_id: &str, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParam(
                "deposit amount must be positive".into(),
            ));
        }
        let account = self.account(user_id)?;
        let mut guard = account.lock().expect("account lock");
        guard.balance_mut(asset).free += amount;
        debug!(user_id, asset, amount = %amount, "deposit");
        Ok(())
    }

    pub fn withdraw(&self, user_id: &str, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParam(
                "withdraw amount must be positive".into(),
            ));
        }
        let account = self.account(user_id)?;
        let mut guard = account.lock().expect("account lock");
        let balance = guard.balance_mut(asset);
        if balance.free < amount {
            return Err(ExchangeError::InsufficientBalance);
        }
        balance.free -= amount;
        debug!(user_id, asset, amount = %amount, "withdraw");
        Ok(())
    }

    /// Move `amount` from free to locked. Returns false (and changes nothing)
    /// when free funds are short.
    pub fn reserve(&self, user_id: &str, asset: &str, amount: Decimal) -> ExchangeResult<bool> {
        if amount < Decimal::ZERO {
            return Err(ExchangeError::InvalidParam(
                "reserve amount must be non-negative".into(),
            ));
        }
        let account = self.account(user_id)?;
        let mut guard = account.lock().expect("account lock");
        let balance = guard.balance_mut(asset);
        if balance.free < amount {
            return Ok(false);
        }
        balance.free -= amount;
        balance.locked += amount;
        Ok(true)
    }

    /// Move `amount` from locked back to free. The caller passes the exact
    /// residual of an earlier reservation.
    pub fn release(&self, user_id: &str, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        if amount < Decimal::ZERO {
            return Err(ExchangeError::InvalidParam(
                "release amount must be non-negative".into(),
            ));
        }
        if amount.is_zero() {
            return Ok(());
        }
        let account = self.account(user_id)?;
        let mut guard = account.lock().expect("account lock");
        guard.debit_locked(user_id, asset, amount);
        guard.balance_mut(asset).free += amount;
        Ok(())
    }

    /// Settle one fill atomically across buyer, seller, and the fee account.
    ///
    /// The buyer's reserved quote decreases by `price × qty` and they receive
    /// `qty` base less their commission; the seller's reserved base decreases
    /// by `qty` and they receive `price × qty` quote less their commission.
    /// Returns `(buyer_commission_base, seller_commission_quote)`.
    #[allow(clippy::too_many_arguments)]
    pub fn settle_fill(
        &self,
        buy_user: &str,
        sell_user: &str,
        base_asset: &str,
        quote_asset: &str,
        price: Decimal,
        quantity: Decimal,
        buyer_rate: Decimal,
        seller_rate: Decimal,
    ) -> ExchangeResult<(Decimal, Decimal)> {
        let quote_amount = price * quantity;
        let buyer_commission = quantity * buyer_rate;
        let seller_commission = quote_amount * seller_rate;

        let buyer_account = self.account(buy_user)?;
        let seller_account = self.account(sell_user)?;
        let fee_account = self.account(FEE_ACCOUNT)?;

        // Canonical lock order by user id; a user self-trading holds one lock.
        if buy_user == sell_user {
            let mut account = buyer_account.lock().expect("account lock");
            account.debit_locked(buy_user, quote_asset, quote_amount);
            account.balance_mut(base_asset).free += quantity - buyer_commission;
            account.debit_locked(buy_user, base_asset, quantity);
            account.balance_mut(quote_asset).free += quote_amount - seller_commission;
        } else {
            let (first, second) = if buy_user < sell_user {
                (&buyer_account, &seller_account)
            } else {
                (&seller_account, &buyer_account)
            };
            let mut first_guard = first.lock().expect("account lock");
            let mut second_guard = second.lock().expect("account lock");
            let (buyer, seller) = if buy_user < sell_user {
                (&mut first_guard, &mut second_guard)
            } else {
                (&mut second_guard, &mut first_guard)
            };
            buyer.debit_locked(buy_user, quote_asset, quote_amount);
            buyer.balance_mut(base_asset).free += quantity - buyer_commission;
            seller.debit_locked(sell_user, base_asset, quantity);
            seller.balance_mut(quote_asset).free += quote_amount - seller_commission;
        }

        let mut fees = fee_account.lock().expect("account lock");
        fees.balance_mut(base_asset).free += buyer_commission;
        fees.balance_mut(quote_asset).free += seller_commission;

        Ok((buyer_commission, seller_commission))
    }

    pub fn balance(&self, user_id: &str, asset: &str) -> ExchangeResult<Balance> {
        let account = self.account(user_id)?;
        let guard = account.lock().expect("account lock");
        Ok(guard.balances.get(asset).copied().unwrap_or_default())
    }

    pub fn snapshot(&self, user_id: &str, now_ms: i64) -> ExchangeResult<AccountSnapshot> {
        let account = self.account(user_id)?;
        let guard = account.lock().expect("account lock");
        let mut balances: Vec<AssetBalance> = guard
            .balances
            .iter()
            .map(|(asset, b)| AssetBalance {
                asset: asset.clone(),
                free: b.free,
                locked: b.locked,
            })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(AccountSnapshot {
            user_id: user_id.to_string(),
            balances,
            maker_commission: self.maker_commission,
            taker_commission: self.taker_commission,
            can_trade: true,
            can_withdraw: true,
            can_deposit: true,
            update_time: now_ms,
        })
    }

    /// Sum of `free + locked` per asset over every account, fee account
    /// included. Used by conservation checks.
    pub fn total_balances(&self) -> HashMap<String, Decimal> {
        let accounts = self.accounts.read().expect("accounts lock");
        let mut totals: HashMap<String, Decimal> = HashMap::new();
        for account in accounts.values() {
            let guard = account.lock().expect("account lock");
            for (asset, balance) in &guard.balances {
                *totals.entry(asset.clone()).or_default() += balance.total();
            }
        }
        totals
    }

    /// All user ids with their balances (snapshot support).
    pub fn all_balances(&self) -> HashMap<String, Vec<AssetBalance>> {
        let accounts = self.accounts.read().expect("accounts lock");
        accounts
            .iter()
            .map(|(user_id, account)| {
                let guard = account.lock().expect("account lock");
                let balances = guard
                    .balances
                    .iter()
                    .map(|(asset, b)| AssetBalance {
                        asset: asset.clone(),
                        free: b.free,
                        locked: b.locked,
                    })
                    .collect();
                (user_id.clone(), balances)
            })
            .collect()
    }

    /// Restore balances from a snapshot (replaces any existing account state).
    pub fn restore_balances(&self, entries: &HashMap<String, Vec<AssetBalance>>) {
        let mut accounts = self.accounts.write().expect("accounts lock");
        for (user_id, balances) in entries {
            let account = accounts.entry(user_id.clone()).or_default();
            let mut guard = account.lock().expect("account lock");
            guard.balances = balances
                .iter()
                .map(|b| {
                    (
                        b.asset.clone(),
                        Balance {
                            free: b.free,
                            locked: b.locked,
                        },
                    )
                })
                .collect();
        }
    }
}
