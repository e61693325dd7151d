//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! All state sits behind one mutex so `create_voucher_order` is a real
//! all-or-nothing transaction.

use crate::error::StoreError;
use crate::repository::{CreateOrderOutcome, OrderRepository, Store, VoucherRepository};
use async_trait::async_trait;
use seckill_domain::{OrderId, SeckillVoucher, UserId, VoucherId, VoucherOrder};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// In-memory store for testing
pub struct MemoryStore {
    state: Mutex<State>,
    /// Fail the next call with a transient error before touching state
    fail_next: AtomicBool,
    /// Abort the next order transaction after its stock decrement
    crash_after_decrement: AtomicBool,
    /// Committed stock decrements (for double-decrement assertions)
    decrements: AtomicU64,
}

#[derive(Default, Clone)]
struct State {
    vouchers: HashMap<VoucherId, SeckillVoucher>,
    orders: HashMap<OrderId, VoucherOrder>,
    buyers: HashSet<(UserId, VoucherId)>,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_next: AtomicBool::new(false),
            crash_after_decrement: AtomicBool::new(false),
            decrements: AtomicU64::new(0),
        }
    }

    /// Make the next store call fail with `StoreError::Unavailable`.
    pub fn set_fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }

    /// Make the next order transaction abort between decrement and insert.
    pub fn set_crash_after_decrement(&self, crash: bool) {
        self.crash_after_decrement.store(crash, Ordering::SeqCst);
    }

    /// Get the number of orders
    pub fn order_count(&self) -> usize {
        self.lock().map(|s| s.orders.len()).unwrap_or(0)
    }

    /// Get the number of committed stock decrements
    pub fn decrement_count(&self) -> u64 {
        self.decrements.load(Ordering::SeqCst)
    }

    /// Current durable stock for a voucher
    pub fn stock_of(&self, voucher_id: VoucherId) -> Option<i64> {
        self.lock().ok()?.vouchers.get(&voucher_id).map(|v| v.stock)
    }

    /// Clear all data (useful for test setup)
    pub fn clear(&self) {
        if let Ok(mut state) = self.lock() {
            *state = State::default();
        }
        self.decrements.store(0, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Database(format!("Failed to acquire store lock: {}", e)))
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("Simulated store failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Voucher Repository Implementation
// =============================================================================

#[async_trait]
impl VoucherRepository for MemoryStore {
    async fn save(&self, voucher: &SeckillVoucher) -> Result<(), StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;
        state.vouchers.insert(voucher.voucher_id, voucher.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: VoucherId) -> Result<Option<SeckillVoucher>, StoreError> {
        self.check_injected_failure()?;
        let state = self.lock()?;
        Ok(state.vouchers.get(&id).cloned())
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn find_by_id(&self, id: OrderId) -> Result<Option<VoucherOrder>, StoreError> {
        self.check_injected_failure()?;
        let state = self.lock()?;
        Ok(state.orders.get(&id).cloned())
    }

    async fn count_by_user_and_voucher(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<u64, StoreError> {
        self.check_injected_failure()?;
        let state = self.lock()?;
        Ok(u64::from(state.buyers.contains(&(user_id, voucher_id))))
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl Store for MemoryStore {
    fn vouchers(&self) -> &dyn VoucherRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    async fn create_voucher_order(
        &self,
        order: &VoucherOrder,
    ) -> Result<CreateOrderOutcome, StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;

        // Work on a copy; only a fully successful transaction is committed.
        let mut tx = state.clone();

        if tx.buyers.contains(&(order.user_id, order.voucher_id)) {
            return Ok(CreateOrderOutcome::AlreadyExists);
        }

        match tx.vouchers.get_mut(&order.voucher_id) {
            Some(voucher) if voucher.stock > 0 => {
                voucher.stock -= 1;
                voucher.updated_at = chrono::Utc::now();
            },
            _ => return Ok(CreateOrderOutcome::StockExhausted),
        }

        if self.crash_after_decrement.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "Simulated crash between stock decrement and order insert".to_string(),
            ));
        }

        if tx.orders.contains_key(&order.id) {
            return Err(StoreError::duplicate("voucher_order", order.id.to_string()));
        }
        tx.orders.insert(order.id, order.clone());
        tx.buyers.insert((order.user_id, order.voucher_id));

        *state = tx;
        self.decrements.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOrderOutcome::Created)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use seckill_domain::OrderIntent;

    fn create_test_voucher(voucher_id: VoucherId, stock: i64) -> SeckillVoucher {
        let begin = Utc::now();
        SeckillVoucher::new(voucher_id, stock, begin, begin + Duration::hours(2)).unwrap()
    }

    fn create_test_order(order_id: OrderId, user_id: UserId, voucher_id: VoucherId) -> VoucherOrder {
        VoucherOrder::from_intent(&OrderIntent::new(order_id, user_id, voucher_id))
    }

    #[tokio::test]
    async fn test_voucher_save_and_find() {
        let store = MemoryStore::new();
        let voucher = create_test_voucher(10, 5);

        VoucherRepository::save(&store, &voucher).await.unwrap();

        let found = VoucherRepository::find_by_id(&store, 10).await.unwrap();
        assert_eq!(found.unwrap().stock, 5);
        assert!(VoucherRepository::find_by_id(&store, 11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_order_decrements_and_inserts() {
        let store = MemoryStore::new();
        VoucherRepository::save(&store, &create_test_voucher(10, 2)).await.unwrap();

        let outcome = store.create_voucher_order(&create_test_order(1, 100, 10)).await.unwrap();

        assert_eq!(outcome, CreateOrderOutcome::Created);
        assert_eq!(store.stock_of(10), Some(1));
        assert_eq!(store.order_count(), 1);
        assert!(store.orders().exists(100, 10).await.unwrap());
        assert_eq!(OrderRepository::find_by_id(&store, 1).await.unwrap().unwrap().user_id, 100);
    }

    #[tokio::test]
    async fn test_create_order_same_user_twice() {
        let store = MemoryStore::new();
        VoucherRepository::save(&store, &create_test_voucher(10, 5)).await.unwrap();

        store.create_voucher_order(&create_test_order(1, 100, 10)).await.unwrap();
        let second = store.create_voucher_order(&create_test_order(2, 100, 10)).await.unwrap();

        assert_eq!(second, CreateOrderOutcome::AlreadyExists);
        assert_eq!(store.stock_of(10), Some(4));
        assert_eq!(store.decrement_count(), 1);
    }

    #[tokio::test]
    async fn test_create_order_stock_exhausted() {
        let store = MemoryStore::new();
        VoucherRepository::save(&store, &create_test_voucher(10, 1)).await.unwrap();

        store.create_voucher_order(&create_test_order(1, 100, 10)).await.unwrap();
        let outcome = store.create_voucher_order(&create_test_order(2, 101, 10)).await.unwrap();

        assert_eq!(outcome, CreateOrderOutcome::StockExhausted);
        assert_eq!(store.stock_of(10), Some(0));
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_voucher_is_exhausted() {
        let store = MemoryStore::new();
        let outcome = store.create_voucher_order(&create_test_order(1, 100, 99)).await.unwrap();
        assert_eq!(outcome, CreateOrderOutcome::StockExhausted);
    }

    #[tokio::test]
    async fn test_crash_mid_transaction_rolls_back() {
        let store = MemoryStore::new();
        VoucherRepository::save(&store, &create_test_voucher(10, 3)).await.unwrap();
        let order = create_test_order(1, 100, 10);

        store.set_crash_after_decrement(true);
        let result = store.create_voucher_order(&order).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.stock_of(10), Some(3));
        assert_eq!(store.order_count(), 0);

        // Retry commits exactly one decrement
        let outcome = store.create_voucher_order(&order).await.unwrap();
        assert_eq!(outcome, CreateOrderOutcome::Created);
        assert_eq!(store.stock_of(10), Some(2));
        assert_eq!(store.decrement_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.set_fail_next(true);

        let err = store.orders().exists(1, 1).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!store.orders().exists(1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_clear() {
        let store = MemoryStore::new();
        VoucherRepository::save(&store, &create_test_voucher(10, 3)).await.unwrap();
        store.create_voucher_order(&create_test_order(1, 100, 10)).await.unwrap();

        store.clear();

        assert_eq!(store.order_count(), 0);
        assert_eq!(store.decrement_count(), 0);
        assert_eq!(store.stock_of(10), None);
    }
}
