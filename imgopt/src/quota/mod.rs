//! Per-user credit accounting.
//!
//! The ledger never performs a plain read-modify-write on a balance. Every mutation goes through
//! [`CreditStore::compare_and_swap`], conditioned on the balance the ledger last observed; a
//! conflict means another request got there first, so the ledger re-reads and tries again up to
//! `max_retries` times.
//!
//! ## Charge policies
//!
//! - [`ChargePolicy::OnEntry`]: [`QuotaLedger::reserve`] takes the credit immediately. A failed
//!   request hands it back through [`QuotaLedger::release`]. Two concurrent requests can never both
//!   spend the last credit.
//! - [`ChargePolicy::OnCompletion`]: `reserve` only checks the balance and remembers it;
//!   [`QuotaLedger::commit`] takes the credit once the work succeeded. `release` is a no-op.
//!
//! A [`Reservation`] that is dropped without being committed or released (client went away,
//! request timed out) gives back a credit it already took, on a background task.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::types::{RequestId, UserId, abbrev_uuid};

mod memory;
mod postgres;
mod reconcile;

pub use memory::InMemoryCreditStore;
pub use postgres::PostgresCreditStore;
pub use reconcile::{ReconciliationEvent, ReconciliationKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("credit store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("balance kept changing after {attempts} attempts")]
    ConcurrentModification { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External key-value store holding one integer balance per user.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Create the account with `initial` credits if it does not exist; return the current balance.
    async fn open_account(&self, user_id: UserId, initial: i64) -> Result<i64, StoreError>;

    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError>;

    /// Set the balance to `new` only if it is currently `expected`. Returns whether it was set.
    async fn compare_and_swap(&self, user_id: UserId, expected: i64, new: i64) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePolicy {
    #[default]
    OnEntry,
    OnCompletion,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn CreditStore>,
    policy: ChargePolicy,
    max_retries: u32,
    initial_credits: i64,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("policy", &self.policy)
            .field("max_retries", &self.max_retries)
            .field("initial_credits", &self.initial_credits)
            .finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CreditStore>, policy: ChargePolicy, max_retries: u32, initial_credits: i64) -> Self {
        Self {
            store,
            policy,
            max_retries,
            initial_credits,
        }
    }

    pub fn policy(&self) -> ChargePolicy {
        self.policy
    }

    /// Current balance, opening the account with the initial allowance on first sight.
    pub async fn balance(&self, user_id: UserId) -> Result<i64, QuotaError> {
        Ok(self.store.open_account(user_id, self.initial_credits).await?)
    }

    /// Fail with [`QuotaError::InsufficientCredits`] if the user cannot pay for one optimisation.
    /// Under [`ChargePolicy::OnEntry`] the credit is taken here.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id), policy = ?self.policy))]
    pub async fn reserve(&self, user_id: UserId, request_id: RequestId) -> Result<Reservation, QuotaError> {
        let mut balance = self.balance(user_id).await?;

        match self.policy {
            ChargePolicy::OnCompletion => {
                if balance <= 0 {
                    return Err(QuotaError::InsufficientCredits);
                }
                debug!(balance, "credit reserved, charge deferred to completion");
                Ok(Reservation::new(self.clone(), user_id, request_id, balance, false))
            }
            ChargePolicy::OnEntry => {
                for attempt in 0..=self.max_retries {
                    if balance <= 0 {
                        return Err(QuotaError::InsufficientCredits);
                    }
                    if self.store.compare_and_swap(user_id, balance, balance - 1).await? {
                        debug!(balance_before = balance, attempt, "credit taken on entry");
                        metrics::record_credit_charged();
                        return Ok(Reservation::new(self.clone(), user_id, request_id, balance, true));
                    }
                    balance = self.store.balance(user_id).await?.unwrap_or(0);
                }
                Err(QuotaError::ConcurrentModification {
                    attempts: self.max_retries + 1,
                })
            }
        }
    }

    /// Finalise a reservation after the work succeeded. Returns the remaining balance.
    #[instrument(skip_all, fields(user_id = %abbrev_uuid(&reservation.user_id)))]
    pub async fn commit(&self, mut reservation: Reservation) -> Result<i64, QuotaError> {
        reservation.settled = true;

        if reservation.charged {
            let fallback = reservation.snapshot - 1;
            return Ok(match self.store.balance(reservation.user_id).await {
                Ok(Some(balance)) => balance,
                Ok(None) => fallback,
                Err(e) => {
                    warn!(error = %e, "could not read balance after commit, reporting snapshot");
                    fallback
                }
            });
        }

        let mut expected = reservation.snapshot;
        for attempt in 0..=self.max_retries {
            if expected <= 0 {
                return Err(QuotaError::InsufficientCredits);
            }
            if self.store.compare_and_swap(reservation.user_id, expected, expected - 1).await? {
                debug!(balance_before = expected, attempt, "credit charged on completion");
                metrics::record_credit_charged();
                return Ok(expected - 1);
            }
            expected = self.store.balance(reservation.user_id).await?.unwrap_or(0);
        }
        Err(QuotaError::ConcurrentModification {
            attempts: self.max_retries + 1,
        })
    }

    /// Give back a reservation whose work failed. No-op when nothing was charged yet.
    #[instrument(skip_all, fields(user_id = %abbrev_uuid(&reservation.user_id)))]
    pub async fn release(&self, mut reservation: Reservation) -> Result<(), QuotaError> {
        reservation.settled = true;
        if !reservation.charged {
            return Ok(());
        }
        self.refund(reservation.user_id).await
    }

    async fn refund(&self, user_id: UserId) -> Result<(), QuotaError> {
        for attempt in 0..=self.max_retries {
            let current = self.store.balance(user_id).await?.unwrap_or(0);
            if self.store.compare_and_swap(user_id, current, current + 1).await? {
                debug!(balance_after = current + 1, attempt, "credit refunded");
                metrics::record_credit_refunded();
                return Ok(());
            }
        }
        Err(QuotaError::ConcurrentModification {
            attempts: self.max_retries + 1,
        })
    }
}

/// Proof that a user passed the credit check for one request.
///
/// Must be handed back to [`QuotaLedger::commit`] or [`QuotaLedger::release`].
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    ledger: QuotaLedger,
    user_id: UserId,
    request_id: RequestId,
    /// Balance observed when the reservation was made, before any decrement.
    snapshot: i64,
    /// Whether the credit has already been taken from the store.
    charged: bool,
    settled: bool,
}

impl Reservation {
    fn new(ledger: QuotaLedger, user_id: UserId, request_id: RequestId, snapshot: i64, charged: bool) -> Self {
        Self {
            ledger,
            user_id,
            request_id,
            snapshot,
            charged,
            settled: false,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn snapshot(&self) -> i64 {
        self.snapshot
    }

    pub fn is_charged(&self) -> bool {
        self.charged
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("user_id", &self.user_id)
            .field("request_id", &self.request_id)
            .field("snapshot", &self.snapshot)
            .field("charged", &self.charged)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled || !self.charged {
            return;
        }

        let ledger = self.ledger.clone();
        let (user_id, request_id) = (self.user_id, self.request_id);
        info!(user_id = %abbrev_uuid(&user_id), request_id = %request_id, "request abandoned, refunding credit");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ledger.refund(user_id).await {
                        ReconciliationEvent::new(ReconciliationKind::RefundFailed, user_id, Some(request_id), e.to_string()).emit();
                    }
                });
            }
            Err(_) => {
                ReconciliationEvent::new(
                    ReconciliationKind::RefundFailed,
                    user_id,
                    Some(request_id),
                    "no async runtime available to refund abandoned reservation".to_string(),
                )
                .emit();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn ledger(store: Arc<InMemoryCreditStore>, policy: ChargePolicy) -> QuotaLedger {
        QuotaLedger::new(store, policy, 16, 0)
    }

    /// Store wrapper whose first `conflicts` CAS calls report a lost race.
    struct ContendedStore {
        inner: InMemoryCreditStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl CreditStore for ContendedStore {
        async fn open_account(&self, user_id: UserId, initial: i64) -> Result<i64, StoreError> {
            self.inner.open_account(user_id, initial).await
        }

        async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
            self.inner.balance(user_id).await
        }

        async fn compare_and_swap(&self, user_id: UserId, expected: i64, new: i64) -> Result<bool, StoreError> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }
            self.inner.compare_and_swap(user_id, expected, new).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn zero_balance_is_rejected_without_decrement() {
        let user = Uuid::new_v4();
        for policy in [ChargePolicy::OnEntry, ChargePolicy::OnCompletion] {
            let store = Arc::new(InMemoryCreditStore::with_balances([(user, 0)]));
            let ledger = ledger(store.clone(), policy);

            let err = ledger.reserve(user, Uuid::new_v4()).await.unwrap_err();
            assert!(matches!(err, QuotaError::InsufficientCredits));
            assert_eq!(store.balance(user).await.unwrap(), Some(0));
        }
    }

    #[test_log::test(tokio::test)]
    async fn on_entry_charges_at_reserve_and_commit_confirms() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryCreditStore::with_balances([(user, 3)]));
        let ledger = ledger(store.clone(), ChargePolicy::OnEntry);

        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        assert!(reservation.is_charged());
        assert_eq!(reservation.snapshot(), 3);
        assert_eq!(store.balance(user).await.unwrap(), Some(2));

        assert_eq!(ledger.commit(reservation).await.unwrap(), 2);
        assert_eq!(store.balance(user).await.unwrap(), Some(2));
    }

    #[test_log::test(tokio::test)]
    async fn on_entry_release_refunds_exactly_once() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryCreditStore::with_balances([(user, 1)]));
        let ledger = ledger(store.clone(), ChargePolicy::OnEntry);

        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        assert_eq!(store.balance(user).await.unwrap(), Some(0));
        ledger.release(reservation).await.unwrap();

        // Give any stray drop-refund a chance to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.balance(user).await.unwrap(), Some(1));
    }

    #[test_log::test(tokio::test)]
    async fn on_completion_charges_only_at_commit() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryCreditStore::with_balances([(user, 2)]));
        let ledger = ledger(store.clone(), ChargePolicy::OnCompletion);

        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        assert!(!reservation.is_charged());
        assert_eq!(store.balance(user).await.unwrap(), Some(2));

        assert_eq!(ledger.commit(reservation).await.unwrap(), 1);
        assert_eq!(store.balance(user).await.unwrap(), Some(1));

        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        ledger.release(reservation).await.unwrap();
        assert_eq!(store.balance(user).await.unwrap(), Some(1));
    }

    #[test_log::test(tokio::test)]
    async fn on_completion_commit_fails_when_balance_drained_meanwhile() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryCreditStore::with_balances([(user, 1)]));
        let ledger = ledger(store.clone(), ChargePolicy::OnCompletion);

        let first = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        let second = ledger.reserve(user, Uuid::new_v4()).await.unwrap();

        assert_eq!(ledger.commit(first).await.unwrap(), 0);
        assert!(matches!(ledger.commit(second).await.unwrap_err(), QuotaError::InsufficientCredits));
        assert_eq!(store.balance(user).await.unwrap(), Some(0));
    }

    #[test_log::test(tokio::test)]
    async fn lost_races_are_retried() {
        let user = Uuid::new_v4();
        let store = Arc::new(ContendedStore {
            inner: InMemoryCreditStore::with_balances([(user, 5)]),
            conflicts: AtomicU32::new(3),
        });
        let ledger = QuotaLedger::new(store.clone(), ChargePolicy::OnEntry, 5, 0);

        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        assert_eq!(ledger.commit(reservation).await.unwrap(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn retries_are_bounded() {
        let user = Uuid::new_v4();
        let store = Arc::new(ContendedStore {
            inner: InMemoryCreditStore::with_balances([(user, 5)]),
            conflicts: AtomicU32::new(u32::MAX),
        });
        let ledger = QuotaLedger::new(store.clone(), ChargePolicy::OnEntry, 2, 0);

        let err = ledger.reserve(user, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QuotaError::ConcurrentModification { attempts: 3 }));
        assert_eq!(store.balance(user).await.unwrap(), Some(5));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_reservations_never_overspend() {
        for (start, requests) in [(10_i64, 10_usize), (3, 12), (0, 5)] {
            let user = Uuid::new_v4();
            let store = Arc::new(InMemoryCreditStore::with_balances([(user, start)]));
            let ledger = QuotaLedger::new(store.clone(), ChargePolicy::OnEntry, 64, 0);

            let handles: Vec<_> = (0..requests)
                .map(|_| {
                    let ledger = ledger.clone();
                    tokio::spawn(async move {
                        match ledger.reserve(user, Uuid::new_v4()).await {
                            Ok(reservation) => ledger.commit(reservation).await.is_ok(),
                            Err(_) => false,
                        }
                    })
                })
                .collect();

            let mut succeeded = 0_i64;
            for handle in handles {
                if handle.await.unwrap() {
                    succeeded += 1;
                }
            }

            let expected = (start - requests as i64).max(0);
            assert_eq!(store.balance(user).await.unwrap(), Some(expected));
            assert_eq!(succeeded, start.min(requests as i64));
        }
    }

    #[test_log::test(tokio::test)]
    async fn dropped_reservation_is_refunded() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryCreditStore::with_balances([(user, 2)]));
        let ledger = ledger(store.clone(), ChargePolicy::OnEntry);

        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        assert_eq!(store.balance(user).await.unwrap(), Some(1));
        drop(reservation);

        for _ in 0..50 {
            if store.balance(user).await.unwrap() == Some(2) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("abandoned reservation was not refunded");
    }

    #[test_log::test(tokio::test)]
    async fn unknown_user_gets_initial_allowance() {
        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryCreditStore::default());
        let ledger = QuotaLedger::new(store.clone(), ChargePolicy::OnEntry, 4, 3);

        assert_eq!(ledger.balance(user).await.unwrap(), 3);
        let reservation = ledger.reserve(user, Uuid::new_v4()).await.unwrap();
        assert_eq!(ledger.commit(reservation).await.unwrap(), 2);
    }
}
