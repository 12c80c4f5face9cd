//! Run-feedback records.
//!
//! When a run finishes with learning enabled, a compact summary of what
//! worked (per-platform success rates, per-strategy hits, the failure
//! modes that kept coming up) is persisted so the next planner invocation
//! starts from evidence instead of guesses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::Store;

/// One slot per run kind so a discovery record never clobbers the last
/// extraction record.
pub fn learning_key(run_kind: &str) -> String {
    format!("learning:last:{run_kind}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformOutcome {
    pub platform: String,
    pub attempts: u32,
    pub successes: u32,
}

impl PlatformOutcome {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (self.successes as f64 / self.attempts as f64) * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub recorded_at: DateTime<Utc>,
    pub run_kind: String,
    pub platform_outcomes: Vec<PlatformOutcome>,
    /// (strategy id, staged candidates) for the run.
    pub strategy_hits: Vec<(String, u32)>,
    /// Failure message → occurrences, most frequent first.
    pub common_failures: Vec<(String, u32)>,
}

impl LearningRecord {
    pub fn new(run_kind: &str) -> Self {
        Self {
            recorded_at: Utc::now(),
            run_kind: run_kind.to_string(),
            platform_outcomes: Vec::new(),
            strategy_hits: Vec::new(),
            common_failures: Vec::new(),
        }
    }

    pub fn note_platform(&mut self, platform: &str, success: bool) {
        let outcome = match self
            .platform_outcomes
            .iter_mut()
            .find(|o| o.platform == platform)
        {
            Some(outcome) => outcome,
            None => {
                self.platform_outcomes.push(PlatformOutcome {
                    platform: platform.to_string(),
                    attempts: 0,
                    successes: 0,
                });
                self.platform_outcomes.last_mut().unwrap()
            }
        };
        outcome.attempts += 1;
        outcome.successes += u32::from(success);
    }

    pub fn note_failure(&mut self, message: &str) {
        // Group by the error class, not the full message.
        let key: String = message.split(':').next().unwrap_or(message).to_string();
        match self.common_failures.iter_mut().find(|(k, _)| *k == key) {
            Some((_, n)) => *n += 1,
            None => self.common_failures.push((key, 1)),
        }
    }

    /// Credit a strategy with candidates it staged (discovery) or dishes
    /// it led to (extraction).
    pub fn note_strategy(&mut self, strategy_id: &str, hits: u32) {
        if hits == 0 {
            return;
        }
        match self
            .strategy_hits
            .iter_mut()
            .find(|(id, _)| id == strategy_id)
        {
            Some((_, n)) => *n += hits,
            None => self.strategy_hits.push((strategy_id.to_string(), hits)),
        }
    }

    pub fn persist(mut self, store: &Store) -> anyhow::Result<()> {
        self.common_failures.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.strategy_hits.sort();
        let json = serde_json::to_string(&self)?;
        store.set_metadata(&learning_key(&self.run_kind), &json)?;
        info!(
            run_kind = %self.run_kind,
            platforms = self.platform_outcomes.len(),
            strategies = self.strategy_hits.len(),
            failures = self.common_failures.len(),
            "learning record persisted"
        );
        Ok(())
    }

    pub fn load_last(store: &Store, run_kind: &str) -> anyhow::Result<Option<LearningRecord>> {
        Ok(store
            .get_metadata(&learning_key(run_kind))?
            .and_then(|json| serde_json::from_str(&json).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut record = LearningRecord::new("extraction");
        record.note_platform("wolt", true);
        record.note_platform("wolt", false);
        record.note_platform("uber-eats", true);
        record.note_failure("transport: timeout");
        record.note_failure("transport: refused");
        record.note_failure("content: selector missing");
        record.note_strategy("strat-1", 2);
        record.note_strategy("strat-1", 1);
        record.note_strategy("strat-2", 0);
        record.persist(&store).unwrap();

        let loaded = LearningRecord::load_last(&store, "extraction").unwrap().unwrap();
        assert_eq!(loaded.run_kind, "extraction");
        // Strategy hits accumulate; zero-hit notes are dropped.
        assert_eq!(loaded.strategy_hits, vec![("strat-1".to_string(), 3)]);
        let wolt = loaded
            .platform_outcomes
            .iter()
            .find(|o| o.platform == "wolt")
            .unwrap();
        assert_eq!(wolt.attempts, 2);
        assert_eq!(wolt.success_rate(), 50.0);
        // Failures grouped by class and ordered by frequency.
        assert_eq!(loaded.common_failures[0].0, "transport");
        assert_eq!(loaded.common_failures[0].1, 2);
        // Kinds keep separate slots.
        assert!(LearningRecord::load_last(&store, "discovery").unwrap().is_none());
    }
}
