use async_trait::async_trait;
use dashmap::DashMap;

use super::{CreditStore, StoreError};
use crate::types::UserId;

/// Process-local [`CreditStore`]. Balances are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCreditStore {
    balances: DashMap<UserId, i64>,
}

impl InMemoryCreditStore {
    pub fn with_balances(balances: impl IntoIterator<Item = (UserId, i64)>) -> Self {
        Self {
            balances: balances.into_iter().collect(),
        }
    }

    pub fn set_balance(&self, user_id: UserId, balance: i64) {
        self.balances.insert(user_id, balance);
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn open_account(&self, user_id: UserId, initial: i64) -> Result<i64, StoreError> {
        Ok(*self.balances.entry(user_id).or_insert(initial))
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        Ok(self.balances.get(&user_id).map(|b| *b))
    }

    async fn compare_and_swap(&self, user_id: UserId, expected: i64, new: i64) -> Result<bool, StoreError> {
        // The shard write lock makes check-and-set atomic
        match self.balances.get_mut(&user_id) {
            Some(mut balance) if *balance == expected => {
                *balance = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
