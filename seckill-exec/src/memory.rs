//! In-memory fast store and lock service.
//!
//! Single-process adapters used for tests and development. Each admission
//! script runs inside one critical section, which gives the same atomicity
//! a single-threaded scripted store would.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use seckill_domain::{AdmissionOutcome, OrderId, UserId, VoucherId};

use crate::error::ExecError;
use crate::ports::{order_set_key, stock_key, FastStore, LockService};

// =============================================================================
// Memory Fast Store
// =============================================================================

#[derive(Default)]
struct FastState {
    counters: HashMap<String, i64>,
    sets: HashMap<String, HashSet<UserId>>,
}

/// In-memory fast store.
pub struct MemoryFastStore {
    state: Mutex<FastState>,
    /// Whether to simulate the store being unreachable
    fail_next: AtomicBool,
}

impl MemoryFastStore {
    /// Create an empty fast store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FastState::default()),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Configure the next call to fail.
    pub fn set_fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }

    /// Number of users in a voucher's purchase set.
    pub fn purchase_count(&self, voucher_id: VoucherId) -> usize {
        self.lock()
            .map(|s| s.sets.get(&order_set_key(voucher_id)).map_or(0, HashSet::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, FastState>, ExecError> {
        self.state
            .lock()
            .map_err(|e| ExecError::FastStore(format!("Failed to acquire fast store lock: {}", e)))
    }

    fn check_injected_failure(&self) -> Result<(), ExecError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ExecError::FastStore("Simulated fast store failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<AdmissionOutcome, ExecError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;

        let stock_key = stock_key(voucher_id);
        let stock = state.counters.get(&stock_key).copied().unwrap_or(0);
        if stock <= 0 {
            return Ok(AdmissionOutcome::SoldOut);
        }

        let set_key = order_set_key(voucher_id);
        if state.sets.get(&set_key).is_some_and(|s| s.contains(&user_id)) {
            return Ok(AdmissionOutcome::DuplicateUser);
        }

        state.counters.insert(stock_key, stock - 1);
        state.sets.entry(set_key).or_default().insert(user_id);
        debug!(voucher_id, user_id, order_id, remaining = stock - 1, "Admission reserved");

        Ok(AdmissionOutcome::Admitted)
    }

    async fn load_stock(&self, voucher_id: VoucherId, stock: i64) -> Result<(), ExecError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;
        state.counters.insert(stock_key(voucher_id), stock);
        Ok(())
    }

    async fn stock(&self, voucher_id: VoucherId) -> Result<Option<i64>, ExecError> {
        self.check_injected_failure()?;
        let state = self.lock()?;
        Ok(state.counters.get(&stock_key(voucher_id)).copied())
    }

    async fn is_member(&self, voucher_id: VoucherId, user_id: UserId) -> Result<bool, ExecError> {
        self.check_injected_failure()?;
        let state = self.lock()?;
        Ok(state
            .sets
            .get(&order_set_key(voucher_id))
            .is_some_and(|s| s.contains(&user_id)))
    }

    async fn increment(&self, key: &str) -> Result<u64, ExecError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        u64::try_from(*counter)
            .map_err(|_| ExecError::FastStore(format!("counter {} is negative", key)))
    }
}

// =============================================================================
// Memory Lock Service
// =============================================================================

struct Lease {
    owner: Uuid,
    expires_at: Instant,
}

/// In-memory lease lock.
///
/// Uses `tokio::time::Instant`, so paused-clock tests can expire leases.
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockService {
    /// Create a lock service with no held locks.
    pub fn new() -> Self {
        Self { leases: Mutex::new(HashMap::new()) }
    }

    /// Whether `key` is currently held by a live lease.
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .lock()
            .map(|l| l.get(key).is_some_and(|lease| lease.expires_at > Instant::now()))
            .unwrap_or(false)
    }

    fn leases(&self) -> Result<MutexGuard<'_, HashMap<String, Lease>>, ExecError> {
        self.leases
            .lock()
            .map_err(|e| ExecError::Lock(format!("Failed to acquire lease table: {}", e)))
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_lock(&self, key: &str, owner: Uuid, ttl: Duration) -> Result<bool, ExecError> {
        let mut leases = self.leases()?;
        let now = Instant::now();

        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(false);
            }
            debug!(key, previous_owner = %lease.owner, "Taking over expired lease");
        }

        leases.insert(key.to_string(), Lease { owner, expires_at: now + ttl });
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: Uuid) -> Result<bool, ExecError> {
        let mut leases = self.leases()?;
        match leases.get(key) {
            Some(lease) if lease.owner == owner => {
                leases.remove(key);
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
