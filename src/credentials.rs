//! Search-credential pool.
//!
//! Rotates API credentials across a shared daily quota. Leasing increments
//! the counters inside the same critical section that selects the
//! credential, so callers never need a separate commit step and the quota
//! invariant holds under concurrency. An exhausted pool is backpressure,
//! not an error: `lease` returns `None` and the caller surrenders budget.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::SearchCredential;
use crate::storage::Store;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// What a caller gets from a successful lease. The key material is copied
/// out so the pool lock is never held across a network call.
#[derive(Debug, Clone)]
pub struct LeasedCredential {
    pub id: String,
    pub api_key: String,
    pub engine_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub enabled: usize,
    pub with_quota: usize,
    pub used_today: u32,
    pub quota_today: u32,
}

pub struct CredentialPool {
    credentials: Mutex<Vec<SearchCredential>>,
    store: Store,
}

impl CredentialPool {
    /// Build the pool from persisted state, merging in any credentials
    /// from configuration that the store has not seen yet.
    pub fn load(store: Store, configured: Vec<SearchCredential>) -> anyhow::Result<Self> {
        let mut credentials = store.load_credentials()?;
        for cred in configured {
            if !credentials.iter().any(|c| c.id == cred.id) {
                store.save_credential(&cred)?;
                credentials.push(cred);
            }
        }
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        info!(count = credentials.len(), "credential pool loaded");
        Ok(Self {
            credentials: Mutex::new(credentials),
            store,
        })
    }

    /// Lease the enabled credential with the lowest used-today counter
    /// (ties broken by id). Performs the lazy UTC-day reset and increments
    /// both counters before returning.
    pub fn lease(&self) -> Option<LeasedCredential> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut credentials = self.credentials.lock();

        for cred in credentials.iter_mut() {
            if cred.last_reset_date != today {
                cred.last_reset_date = today.clone();
                cred.queries_used_today = 0;
                cred.consecutive_failures = 0;
                cred.failure_day = None;
                cred.updated_at = Utc::now();
                let _ = self.store.save_credential(cred);
            }
        }

        let best = credentials
            .iter_mut()
            .filter(|c| c.has_quota())
            .min_by(|a, b| {
                a.queries_used_today
                    .cmp(&b.queries_used_today)
                    .then_with(|| a.id.cmp(&b.id))
            })?;

        best.queries_used_today += 1;
        best.total_queries_all_time += 1;
        best.updated_at = Utc::now();
        let leased = LeasedCredential {
            id: best.id.clone(),
            api_key: best.api_key.clone(),
            engine_id: best.engine_id.clone(),
        };
        let _ = self.store.save_credential(best);
        Some(leased)
    }

    /// Record the outcome of a leased query. `quota_exhausted` forces the
    /// counter to the quota: the provider's view of the limit wins over
    /// ours.
    pub fn report(&self, credential_id: &str, success: bool, quota_exhausted: bool) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut credentials = self.credentials.lock();
        let Some(cred) = credentials.iter_mut().find(|c| c.id == credential_id) else {
            warn!(credential_id, "report for unknown credential");
            return;
        };

        if quota_exhausted {
            warn!(credential_id, "provider reported quota exhausted");
            cred.queries_used_today = cred.daily_quota;
        }

        if success {
            cred.consecutive_failures = 0;
            cred.failure_day = None;
        } else {
            if cred.failure_day.as_deref() != Some(today.as_str()) {
                cred.failure_day = Some(today.clone());
                cred.consecutive_failures = 0;
            }
            cred.consecutive_failures += 1;
            if cred.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && !cred.disabled {
                warn!(
                    credential_id,
                    failures = cred.consecutive_failures,
                    "disabling credential"
                );
                cred.disabled = true;
                cred.disabled_reason = Some("auth-failure".to_string());
            }
        }
        cred.updated_at = Utc::now();
        let _ = self.store.save_credential(cred);
    }

    pub fn stats(&self) -> PoolStats {
        let credentials = self.credentials.lock();
        PoolStats {
            total: credentials.len(),
            enabled: credentials.iter().filter(|c| !c.disabled).count(),
            with_quota: credentials.iter().filter(|c| c.has_quota()).count(),
            used_today: credentials.iter().map(|c| c.queries_used_today).sum(),
            quota_today: credentials
                .iter()
                .filter(|c| !c.disabled)
                .map(|c| c.daily_quota)
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(quotas: &[(&str, u32)]) -> CredentialPool {
        let store = Store::open_in_memory().unwrap();
        let configured = quotas
            .iter()
            .map(|(id, quota)| {
                SearchCredential::new(
                    id.to_string(),
                    format!("key-{id}"),
                    format!("engine-{id}"),
                    *quota,
                )
            })
            .collect();
        CredentialPool::load(store, configured).unwrap()
    }

    #[test]
    fn lease_picks_least_used_with_id_tiebreak() {
        let pool = pool_with(&[("b", 10), ("a", 10)]);
        // Equal usage: lowest id wins.
        assert_eq!(pool.lease().unwrap().id, "a");
        // Now "a" has one use, so "b" is picked.
        assert_eq!(pool.lease().unwrap().id, "b");
    }

    #[test]
    fn boundary_one_query_left() {
        let pool = pool_with(&[("only", 2)]);
        assert!(pool.lease().is_some());
        assert!(pool.lease().is_some());
        // Quota spent: soft backpressure, not an error.
        assert!(pool.lease().is_none());
    }

    #[test]
    fn quota_exhausted_report_retires_credential() {
        let pool = pool_with(&[("only", 100)]);
        let lease = pool.lease().unwrap();
        pool.report(&lease.id, false, true);
        assert!(pool.lease().is_none());
        let stats = pool.stats();
        assert_eq!(stats.with_quota, 0);
        assert_eq!(stats.enabled, 1);
    }

    #[test]
    fn three_hard_failures_disable() {
        let pool = pool_with(&[("only", 100)]);
        for _ in 0..3 {
            let lease = pool.lease().unwrap();
            pool.report(&lease.id, false, false);
        }
        assert!(pool.lease().is_none());
        assert_eq!(pool.stats().enabled, 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let pool = pool_with(&[("only", 100)]);
        for _ in 0..2 {
            let lease = pool.lease().unwrap();
            pool.report(&lease.id, false, false);
        }
        let lease = pool.lease().unwrap();
        pool.report(&lease.id, true, false);
        for _ in 0..2 {
            let lease = pool.lease().unwrap();
            pool.report(&lease.id, false, false);
        }
        // Still enabled: the streak restarted after the success.
        assert_eq!(pool.stats().enabled, 1);
    }

    #[test]
    fn counters_survive_reload() {
        let store = Store::open_in_memory().unwrap();
        let configured = vec![SearchCredential::new(
            "c1".into(),
            "key".into(),
            "engine".into(),
            10,
        )];
        let pool = CredentialPool::load(store.clone(), configured.clone()).unwrap();
        pool.lease().unwrap();
        drop(pool);

        let pool = CredentialPool::load(store, configured).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.used_today, 1);
    }
}
