//! Backend pool management and selection.
//!
//! Each service gets a [`BackendPool`] holding the instances currently
//! registered for it. Connections pick a backend uniformly at random from
//! the ready set; backends that fail are demoted onto an exponential retry
//! schedule and promoted back by a per-pool driver task once their deadline
//! passes. A success at any point resets the backend's record.
//!
//! Membership comes from the store via [`BackendPool::update_backends`];
//! failure signal comes from real connection outcomes reported through
//! [`BackendPool::succeeded`] / [`BackendPool::failed`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::time::{self, Instant};
use tracing::debug;

mod retry;

use retry::RetryQueue;

/// Base of the exponential retry backoff; a backend's n-th consecutive
/// failure delays its next retry by `base << n`.
pub const RETRY_INTERVAL_BASE: Duration = Duration::from_secs(1);

/// Where the driver parks while no retries are pending. The underlying
/// timer cannot be paused, so an idle pool sleeps far in the future and is
/// re-armed on demand.
const PARK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cap on the backoff shift; anything past this is already beyond the park
/// horizon and shifting further would overflow the duration arithmetic.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// A backend endpoint as the store reports it: the instance name (container
/// ID) plus the address it serves on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub name: String,
    pub addr: SocketAddr,
}

impl Backend {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

type SlotId = u64;
type Slots = HashMap<SlotId, BackendState>;

/// Pool-internal record for one backend.
///
/// `retry_at` doubles as the membership marker: `None` means the slot lives
/// in the ready vector, `Some` means it sits in the retry heap with that
/// deadline. `index` is the slot's position in whichever of the two owns
/// it, maintained by every mutation.
#[derive(Debug)]
struct BackendState {
    backend: Backend,
    failures: u32,
    retry_at: Option<Instant>,
    index: usize,
}

/// Handle returned by [`BackendPool::pick`].
///
/// Stays valid for a follow-up [`BackendPool::succeeded`] or
/// [`BackendPool::failed`]; if the backend has been removed by a
/// reconfiguration in the meantime, those calls degrade to no-ops.
#[derive(Debug, Clone)]
pub struct PickedBackend {
    id: SlotId,
    backend: Backend,
}

impl PickedBackend {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn name(&self) -> &str {
        &self.backend.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.backend.addr
    }
}

struct PoolState {
    slots: Slots,
    next_id: SlotId,
    /// Slots eligible for selection, unordered.
    ready: Vec<SlotId>,
    /// Slots cooling down, min-heap by deadline.
    retry: RetryQueue,
    rng: SmallRng,
}

impl PoolState {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 0,
            ready: Vec::new(),
            retry: RetryQueue::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Demote a ready slot onto the retry schedule.
    ///
    /// Callers must only pass slots currently in `ready`; both call sites
    /// check `retry_at.is_none()` under the pool lock.
    fn fail(&mut self, id: SlotId, now: Instant) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let pos = slot.index;
        let shift = slot.failures.min(MAX_BACKOFF_SHIFT);
        slot.retry_at = Some(now + RETRY_INTERVAL_BASE * (1u32 << shift));
        slot.failures += 1;

        self.ready.swap_remove(pos);
        if let Some(&moved) = self.ready.get(pos) {
            if let Some(neighbor) = self.slots.get_mut(&moved) {
                neighbor.index = pos;
            }
        }
        self.retry.push(&mut self.slots, id);
    }

    /// Reset a slot after a successful connection, promoting it out of the
    /// retry heap if needed. Returns true when the retry schedule changed.
    fn succeed(&mut self, id: SlotId) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        slot.failures = 0;
        if slot.retry_at.is_none() {
            return false;
        }
        let pos = slot.index;
        self.retry.remove(&mut self.slots, pos);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.retry_at = None;
            slot.index = self.ready.len();
        }
        self.ready.push(id);
        true
    }

    /// Move every slot whose deadline has passed back to the ready set.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(top) = self.retry.peek() {
            let due = self
                .slots
                .get(&top)
                .and_then(|s| s.retry_at)
                .map_or(true, |at| at <= now);
            if !due {
                break;
            }
            self.retry.pop(&mut self.slots);
            if let Some(slot) = self.slots.get_mut(&top) {
                slot.retry_at = None;
                slot.index = self.ready.len();
            }
            self.ready.push(top);
            promoted += 1;
        }
        promoted
    }

    /// Reconcile membership against the desired backend set.
    ///
    /// Retained slots keep their failure count and retry deadline and have
    /// their address rewritten in place; unknown names become fresh ready
    /// slots; vanished names are dropped.
    fn update(&mut self, desired: &[Backend]) {
        let mut want: HashMap<String, Backend> = desired
            .iter()
            .map(|b| (b.name.clone(), b.clone()))
            .collect();

        let old_ready = std::mem::take(&mut self.ready);
        let old_retry = self.retry.take_ids();

        let mut new_ready = Vec::new();
        let mut new_retry = Vec::new();
        let mut dropped = Vec::new();

        for id in old_ready.into_iter().chain(old_retry) {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            match want.remove(&slot.backend.name) {
                Some(fresh) => {
                    slot.backend = fresh;
                    if slot.retry_at.is_none() {
                        slot.index = new_ready.len();
                        new_ready.push(id);
                    } else {
                        new_retry.push(id);
                    }
                }
                None => dropped.push(id),
            }
        }
        for id in dropped {
            self.slots.remove(&id);
        }

        for (_, backend) in want {
            let id = self.next_id;
            self.next_id += 1;
            self.slots.insert(
                id,
                BackendState {
                    backend,
                    failures: 0,
                    retry_at: None,
                    index: new_ready.len(),
                },
            );
            new_ready.push(id);
        }

        self.ready = new_ready;
        self.retry.replace(&mut self.slots, new_retry);
    }

    /// Deadline the driver should sleep until.
    fn next_deadline(&self) -> Instant {
        match self.retry.peek() {
            Some(top) => self
                .slots
                .get(&top)
                .and_then(|s| s.retry_at)
                .unwrap_or_else(Instant::now),
            None => Instant::now() + PARK_INTERVAL,
        }
    }
}

/// A pool of backends for a single service.
pub struct BackendPool {
    service: String,
    state: Arc<Mutex<PoolState>>,
    rearm: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
}

impl BackendPool {
    /// Create an empty pool and spawn its retry driver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        let state = Arc::new(Mutex::new(PoolState::new()));
        let rearm = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(run_retry_driver(
            service.clone(),
            Arc::clone(&state),
            Arc::clone(&rearm),
            stop_rx,
        ));

        Self {
            service,
            state,
            rearm,
            stop_tx,
        }
    }

    /// Service this pool serves.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Signal the retry driver to exit. Idempotent; dropping the pool has
    /// the same effect.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Reconcile pool membership against the store's instance set.
    pub async fn update_backends(&self, desired: &[Backend]) {
        let mut state = self.state.lock().await;
        state.update(desired);
        let (ready, retry) = (state.ready.len(), state.retry.len());
        drop(state);
        self.rearm.notify_one();
        debug!(
            service = %self.service,
            ready,
            retry,
            "updated backend pool"
        );
    }

    /// Pick a backend: ideally a random ready one, failing that a random
    /// cooling-down one, else nothing.
    pub async fn pick(&self) -> Option<PickedBackend> {
        let mut state = self.state.lock().await;

        if !state.ready.is_empty() {
            let len = state.ready.len();
            let pos = state.rng.gen_range(0..len);
            let id = state.ready[pos];
            let suspect = state.slots.get(&id).map_or(false, |s| s.failures > 0);
            if suspect {
                // Retrying a suspect backend: presume the failure so
                // concurrent pickers don't pile onto it. A later failed()
                // is idempotent; a succeeded() resets the record.
                state.fail(id, Instant::now());
                self.rearm.notify_one();
            }
            let backend = state.slots.get(&id)?.backend.clone();
            return Some(PickedBackend { id, backend });
        }

        // Nothing ready; hand out a cooling-down backend at random without
        // disturbing its schedule, for fairness among the failed.
        if !state.retry.is_empty() {
            let len = state.retry.len();
            let pos = state.rng.gen_range(0..len);
            let id = state.retry.get(pos)?;
            let backend = state.slots.get(&id)?.backend.clone();
            return Some(PickedBackend { id, backend });
        }

        None
    }

    /// Report a successful connection through this pick.
    pub async fn succeeded(&self, picked: &PickedBackend) {
        let mut state = self.state.lock().await;
        let changed = state.succeed(picked.id);
        drop(state);
        if changed {
            self.rearm.notify_one();
            debug!(service = %self.service, backend = %picked.name(), "backend rehabilitated");
        }
    }

    /// Report a failed connection through this pick. Idempotent while the
    /// backend is already cooling down.
    pub async fn failed(&self, picked: &PickedBackend) {
        let mut state = self.state.lock().await;
        let in_ready = state
            .slots
            .get(&picked.id)
            .map_or(false, |s| s.retry_at.is_none());
        if in_ready {
            state.fail(picked.id, Instant::now());
            drop(state);
            self.rearm.notify_one();
            debug!(service = %self.service, backend = %picked.name(), "backend demoted");
        }
    }

    /// Total number of backends in the pool.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Backends currently eligible for selection.
    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Backends waiting out their retry delay.
    pub async fn retry_count(&self) -> usize {
        self.state.lock().await.retry.len()
    }
}

impl Drop for BackendPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Long-lived driver task: promotes due backends when their deadline
/// passes, re-computing its sleep whenever the pool re-arms it.
async fn run_retry_driver(
    service: String,
    state: Arc<Mutex<PoolState>>,
    rearm: Arc<Notify>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let deadline = { state.lock().await.next_deadline() };
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let now = Instant::now();
                let promoted = state.lock().await.promote_due(now);
                if promoted > 0 {
                    debug!(service = %service, promoted, "promoted backends due for retry");
                }
            }
            _ = rearm.notified() => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!(service = %service, "retry driver stopped");
                    break;
                }
            }
        }
    }
}

/// Directory of per-service pools for the balancer process.
pub struct PoolDirectory {
    pools: RwLock<HashMap<String, Arc<BackendPool>>>,
}

impl PoolDirectory {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the pool for a service.
    pub async fn get_or_create(&self, service: &str) -> Arc<BackendPool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(service) {
                return Arc::clone(pool);
            }
        }
        let mut pools = self.pools.write().await;
        Arc::clone(
            pools
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(BackendPool::new(service))),
        )
    }

    /// Pool for a service, if one exists.
    pub async fn get(&self, service: &str) -> Option<Arc<BackendPool>> {
        self.pools.read().await.get(service).cloned()
    }

    /// Replace the backend set of a service's pool.
    pub async fn update_service(&self, service: &str, backends: Vec<Backend>) {
        let pool = self.get_or_create(service).await;
        pool.update_backends(&backends).await;
    }

    /// Drop a service's pool, stopping its driver.
    pub async fn remove(&self, service: &str) {
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.remove(service) {
            pool.stop();
        }
    }

    /// Names of all services with a pool.
    pub async fn service_names(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Stop every pool's driver.
    pub async fn stop_all(&self) {
        let pools = self.pools.read().await;
        for pool in pools.values() {
            pool.stop();
        }
    }
}

impl Default for PoolDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::collections::HashSet;

    fn backend(name: &str, port: u16) -> Backend {
        Backend::new(name, format!("10.1.0.1:{port}").parse().unwrap())
    }

    impl PoolState {
        /// Check every structural invariant the pool promises.
        fn assert_invariants(&self) {
            let mut seen = HashSet::new();
            for (pos, id) in self.ready.iter().enumerate() {
                assert!(seen.insert(*id), "slot {id} appears twice");
                let slot = self.slots.get(id).expect("ready id has a slot");
                assert_eq!(slot.index, pos, "ready index out of sync");
                assert!(slot.retry_at.is_none(), "ready slot has a deadline");
            }
            for pos in 0..self.retry.len() {
                let id = self.retry.get(pos).unwrap();
                assert!(seen.insert(id), "slot {id} appears twice");
                let slot = self.slots.get(&id).expect("retry id has a slot");
                assert_eq!(slot.index, pos, "retry index out of sync");
                assert!(slot.retry_at.is_some(), "retry slot has no deadline");
                for child in [2 * pos + 1, 2 * pos + 2] {
                    if let Some(child_id) = self.retry.get(child) {
                        assert!(
                            slot.retry_at <= self.slots[&child_id].retry_at,
                            "heap order violated at {pos}"
                        );
                    }
                }
            }
            assert_eq!(seen.len(), self.slots.len(), "orphaned slots");
        }

        fn names_in(&self, ids: &[SlotId]) -> Vec<String> {
            let mut names: Vec<_> = ids
                .iter()
                .map(|id| self.slots[id].backend.name.clone())
                .collect();
            names.sort();
            names
        }

        fn ready_names(&self) -> Vec<String> {
            let ids = self.ready.clone();
            self.names_in(&ids)
        }

        fn retry_names(&self) -> Vec<String> {
            let ids: Vec<_> = (0..self.retry.len())
                .filter_map(|pos| self.retry.get(pos))
                .collect();
            self.names_in(&ids)
        }
    }

    #[tokio::test]
    async fn pick_on_empty_pool_returns_none() {
        let pool = BackendPool::new("svc");
        assert!(pool.pick().await.is_none());
        pool.stop();
    }

    #[tokio::test]
    async fn update_sets_membership_to_desired_names() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1), backend("b", 2)])
            .await;

        let state = pool.state.lock().await;
        state.assert_invariants();
        assert_eq!(state.ready_names(), vec!["a", "b"]);
        assert!(state.retry.is_empty());
    }

    #[tokio::test]
    async fn update_preserves_failure_state_and_rewrites_address() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1), backend("b", 2)])
            .await;

        // Demote a.
        {
            let mut state = pool.state.lock().await;
            let id = state.ready[0];
            let id = if state.slots[&id].backend.name == "a" {
                id
            } else {
                state.ready[1]
            };
            state.fail(id, Instant::now());
            state.assert_invariants();
        }

        // Reconfigure with a new address for a and a fresh c; b vanishes.
        pool.update_backends(&[backend("a", 99), backend("c", 3)])
            .await;

        let state = pool.state.lock().await;
        state.assert_invariants();
        assert_eq!(state.ready_names(), vec!["c"]);
        assert_eq!(state.retry_names(), vec!["a"]);

        let a = (0..state.retry.len())
            .filter_map(|pos| state.retry.get(pos))
            .find(|id| state.slots[id].backend.name == "a")
            .unwrap();
        let slot = &state.slots[&a];
        assert_eq!(slot.backend.addr.port(), 99, "address not rewritten");
        assert_eq!(slot.failures, 1, "failure count not preserved");
        assert!(slot.retry_at.is_some(), "retry deadline not preserved");
    }

    #[tokio::test]
    async fn pick_from_retry_does_not_touch_schedule() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;

        let deadline = {
            let mut state = pool.state.lock().await;
            let id = state.ready[0];
            state.fail(id, Instant::now());
            state.slots[&id].retry_at
        };

        let picked = pool.pick().await.expect("retry backend handed out");
        assert_eq!(picked.name(), "a");

        let state = pool.state.lock().await;
        state.assert_invariants();
        assert_eq!(state.retry.len(), 1);
        let id = state.retry.peek().unwrap();
        assert_eq!(state.slots[&id].retry_at, deadline, "schedule disturbed");
    }

    #[tokio::test]
    async fn failed_is_idempotent_while_cooling_down() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;

        let picked = pool.pick().await.unwrap();
        pool.failed(&picked).await;

        let (failures, deadline) = {
            let state = pool.state.lock().await;
            let id = state.retry.peek().unwrap();
            (state.slots[&id].failures, state.slots[&id].retry_at)
        };

        pool.failed(&picked).await;

        let state = pool.state.lock().await;
        state.assert_invariants();
        assert_eq!(state.retry.len(), 1);
        let id = state.retry.peek().unwrap();
        assert_eq!(state.slots[&id].failures, failures);
        assert_eq!(state.slots[&id].retry_at, deadline);
    }

    #[tokio::test]
    async fn succeeded_resets_and_promotes() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;

        let picked = pool.pick().await.unwrap();
        pool.failed(&picked).await;
        pool.failed(&picked).await;
        assert_eq!(pool.retry_count().await, 1);

        pool.succeeded(&picked).await;

        let state = pool.state.lock().await;
        state.assert_invariants();
        assert_eq!(state.ready_names(), vec!["a"]);
        let id = state.ready[0];
        assert_eq!(state.slots[&id].failures, 0);
    }

    #[tokio::test]
    async fn pick_speculatively_fails_a_suspect_backend() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;

        // Leave a in ready with a failure on record.
        {
            let mut state = pool.state.lock().await;
            let id = state.ready[0];
            state.fail(id, Instant::now());
            state.promote_due(Instant::now() + Duration::from_secs(5));
            state.assert_invariants();
            assert_eq!(state.slots[&id].failures, 1);
        }

        let picked = pool.pick().await.expect("suspect still handed out");
        assert_eq!(picked.name(), "a");

        {
            let state = pool.state.lock().await;
            state.assert_invariants();
            assert_eq!(state.retry_names(), vec!["a"], "suspect not demoted");
            let id = state.retry.peek().unwrap();
            assert_eq!(state.slots[&id].failures, 2);
        }

        // The handle survives the demotion: failed() is a no-op now, and
        // succeeded() brings the backend all the way back.
        pool.failed(&picked).await;
        assert_eq!(pool.retry_count().await, 1);
        pool.succeeded(&picked).await;
        assert_eq!(pool.ready_count().await, 1);
        assert_eq!(pool.retry_count().await, 0);
    }

    #[tokio::test]
    async fn stale_handles_are_noops_after_reconfiguration() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;
        let picked = pool.pick().await.unwrap();

        pool.update_backends(&[backend("b", 2)]).await;

        pool.failed(&picked).await;
        pool.succeeded(&picked).await;

        let state = pool.state.lock().await;
        state.assert_invariants();
        assert_eq!(state.ready_names(), vec!["b"]);
    }

    #[tokio::test]
    async fn backoff_doubles_per_consecutive_failure() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;

        let t0 = Instant::now();
        let mut state = pool.state.lock().await;
        let id = state.ready[0];

        // Three consecutive demotions: delays 1s, 2s, 4s; the last wins.
        for _ in 0..2 {
            state.fail(id, t0);
            let deadline = state.slots[&id].retry_at;
            state.promote_due(deadline.unwrap());
        }
        state.fail(id, t0);

        assert_eq!(state.slots[&id].failures, 3);
        assert_eq!(
            state.slots[&id].retry_at,
            Some(t0 + Duration::from_secs(4))
        );
        state.assert_invariants();
    }

    #[tokio::test]
    async fn backoff_shift_is_capped() {
        let pool = BackendPool::new("svc");
        pool.update_backends(&[backend("a", 1)]).await;

        let t0 = Instant::now();
        let mut state = pool.state.lock().await;
        let id = state.ready[0];
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.failures = 1000;
        }
        state.fail(id, t0);
        assert_eq!(
            state.slots[&id].retry_at,
            Some(t0 + RETRY_INTERVAL_BASE * (1u32 << MAX_BACKOFF_SHIFT))
        );
    }

    #[tokio::test]
    async fn random_operation_sequences_hold_invariants() {
        let mut rng = SmallRng::seed_from_u64(0x7e7e);
        let names = ["a", "b", "c", "d", "e"];

        let pool = BackendPool::new("svc");
        let mut handles: Vec<PickedBackend> = Vec::new();

        for step in 0..400 {
            match rng.gen_range(0..10) {
                // Reconfigure with a random subset.
                0 => {
                    let mut subset: Vec<Backend> = names
                        .iter()
                        .enumerate()
                        .filter(|_| rng.gen_bool(0.6))
                        .map(|(i, name)| backend(name, 1000 + i as u16))
                        .collect();
                    subset.shuffle(&mut rng);
                    pool.update_backends(&subset).await;
                }
                1..=4 => {
                    if let Some(picked) = pool.pick().await {
                        handles.push(picked);
                    }
                }
                5..=6 => {
                    if let Some(picked) = handles.as_slice().choose(&mut rng) {
                        pool.failed(picked).await;
                    }
                }
                7..=8 => {
                    if let Some(picked) = handles.as_slice().choose(&mut rng) {
                        pool.succeeded(picked).await;
                    }
                }
                _ => {
                    let mut state = pool.state.lock().await;
                    let horizon = Instant::now() + Duration::from_secs(1u64 << (step % 8));
                    state.promote_due(horizon);
                }
            }

            let state = pool.state.lock().await;
            state.assert_invariants();
        }
    }
}
