//! Human review queue operations.
//!
//! Everything a reviewer can do to a staged venue: approve, approve a
//! subset of its dishes, reject with a reason, bulk-reject. Every mutation
//! writes a change-log entry. Optimistic concurrency: the caller echoes
//! the venue's last-seen `updated_at`; a mismatch surfaces as `Conflict`
//! and the caller re-reads and retries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    ChangeAction, ChangeLogEntry, ChangeSource, DiscoveredVenue, VenueStatus,
};
use crate::storage::{ReviewFilter, Store};

pub struct ReviewQueue<'a> {
    store: &'a Store,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewStats {
    pub pending_total: usize,
    pub by_country: Vec<(String, usize)>,
    pub by_platform: Vec<(String, usize)>,
    /// Confidence histogram buckets: [0,20), [20,40), …, [80,100].
    pub confidence_buckets: [usize; 5],
}

impl<'a> ReviewQueue<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn list_pending(&self, filter: &ReviewFilter) -> anyhow::Result<Vec<DiscoveredVenue>> {
        self.store.list_pending_review(filter)
    }

    /// Load a venue and enforce the optimistic-concurrency check.
    fn load_checked(
        &self,
        venue_id: &str,
        expected_updated_at: DateTime<Utc>,
    ) -> EngineResult<DiscoveredVenue> {
        let venue = self
            .store
            .get_venue(venue_id)
            .map_err(|e| EngineError::Fatal(e.to_string()))?
            .ok_or_else(|| EngineError::Conflict(format!("venue {venue_id} not found")))?;
        if venue.updated_at != expected_updated_at {
            return Err(EngineError::Conflict(format!(
                "venue {venue_id} changed (seen {}, now {})",
                expected_updated_at.to_rfc3339(),
                venue.updated_at.to_rfc3339()
            )));
        }
        if matches!(venue.status, VenueStatus::Promoted | VenueStatus::Rejected) {
            return Err(EngineError::Conflict(format!(
                "venue {venue_id} is terminal ({})",
                venue.status.as_str()
            )));
        }
        Ok(venue)
    }

    /// Approve a venue and all of its dishes.
    pub fn approve(
        &self,
        venue_id: &str,
        expected_updated_at: DateTime<Utc>,
        actor: &str,
    ) -> EngineResult<()> {
        let mut venue = self.load_checked(venue_id, expected_updated_at)?;
        let previous = venue.status;
        venue.status = VenueStatus::Verified;
        venue.needs_review = false;
        venue.updated_at = Utc::now();
        self.persist_venue(&venue, previous, ChangeAction::Verified, actor, None)?;

        let dishes = self
            .store
            .dishes_for_venue(venue_id)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        for mut dish in dishes {
            if dish.status == VenueStatus::Discovered {
                dish.status = VenueStatus::Verified;
                dish.needs_review = false;
                dish.updated_at = Utc::now();
                self.store
                    .upsert_dish(&dish)
                    .map_err(|e| EngineError::Fatal(e.to_string()))?;
            }
        }
        info!(venue = venue_id, actor, "venue approved");
        Ok(())
    }

    /// Approve the venue but only the named subset of its dishes. The
    /// optional feedback string lands in the change log.
    pub fn partial_approve(
        &self,
        venue_id: &str,
        dish_ids: &[String],
        feedback: Option<&str>,
        expected_updated_at: DateTime<Utc>,
        actor: &str,
    ) -> EngineResult<()> {
        let mut venue = self.load_checked(venue_id, expected_updated_at)?;
        let previous = venue.status;
        venue.status = VenueStatus::Verified;
        venue.needs_review = false;
        venue.updated_at = Utc::now();
        self.persist_venue(&venue, previous, ChangeAction::Verified, actor, feedback)?;

        let dishes = self
            .store
            .dishes_for_venue(venue_id)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        for mut dish in dishes {
            if !dish_ids.contains(&dish.id) || dish.status != VenueStatus::Discovered {
                continue;
            }
            dish.status = VenueStatus::Verified;
            dish.needs_review = false;
            dish.updated_at = Utc::now();
            self.store
                .upsert_dish(&dish)
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
        }
        info!(venue = venue_id, approved_dishes = dish_ids.len(), actor, "partial approve");
        Ok(())
    }

    /// Reject with a mandatory reason.
    pub fn reject(
        &self,
        venue_id: &str,
        reason: &str,
        expected_updated_at: DateTime<Utc>,
        actor: &str,
    ) -> EngineResult<()> {
        if reason.trim().is_empty() {
            return Err(EngineError::Policy("rejection requires a reason".to_string()));
        }
        let mut venue = self.load_checked(venue_id, expected_updated_at)?;
        let previous = venue.status;
        venue.status = VenueStatus::Rejected;
        venue.needs_review = false;
        venue.rejection_reason = Some(reason.to_string());
        venue.updated_at = Utc::now();
        self.persist_venue(&venue, previous, ChangeAction::Rejected, actor, Some(reason))?;

        // Dishes never outlive their venue's rejection.
        let dishes = self
            .store
            .dishes_for_venue(venue_id)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        for mut dish in dishes {
            if !matches!(dish.status, VenueStatus::Promoted | VenueStatus::Rejected) {
                dish.status = VenueStatus::Rejected;
                dish.needs_review = false;
                dish.updated_at = Utc::now();
                self.store
                    .upsert_dish(&dish)
                    .map_err(|e| EngineError::Fatal(e.to_string()))?;
            }
        }
        info!(venue = venue_id, actor, reason, "venue rejected");
        Ok(())
    }

    /// Reject several venues with a shared reason. Per-venue conflicts are
    /// collected, not fatal to the batch.
    pub fn bulk_reject(
        &self,
        targets: &[(String, DateTime<Utc>)],
        reason: &str,
        actor: &str,
    ) -> EngineResult<Vec<(String, EngineError)>> {
        if reason.trim().is_empty() {
            return Err(EngineError::Policy("rejection requires a reason".to_string()));
        }
        let mut failures = Vec::new();
        for (venue_id, expected) in targets {
            if let Err(e) = self.reject(venue_id, reason, *expected, actor) {
                failures.push((venue_id.clone(), e));
            }
        }
        Ok(failures)
    }

    pub fn stats(&self) -> anyhow::Result<ReviewStats> {
        let pending = self.store.list_pending_review(&ReviewFilter {
            limit: 100_000,
            ..Default::default()
        })?;
        let mut by_country: Vec<(String, usize)> = Vec::new();
        let mut by_platform: Vec<(String, usize)> = Vec::new();
        let mut confidence_buckets = [0usize; 5];
        for venue in &pending {
            bump(&mut by_country, &venue.address.country);
            for link in &venue.platform_links {
                bump(&mut by_platform, link.platform.as_str());
            }
            let bucket = ((venue.confidence_score / 20.0) as usize).min(4);
            confidence_buckets[bucket] += 1;
        }
        by_country.sort();
        by_platform.sort();
        Ok(ReviewStats {
            pending_total: pending.len(),
            by_country,
            by_platform,
            confidence_buckets,
        })
    }

    fn persist_venue(
        &self,
        venue: &DiscoveredVenue,
        previous: VenueStatus,
        action: ChangeAction,
        actor: &str,
        note: Option<&str>,
    ) -> EngineResult<()> {
        self.store
            .upsert_venue(venue)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        let mut entry = ChangeLogEntry::new(
            action,
            "discovered_venues",
            &venue.id,
            ChangeSource::Manual,
            actor,
        )
        .with_change(
            "status",
            Some(serde_json::json!(previous.as_str())),
            Some(serde_json::json!(venue.status.as_str())),
        );
        if let Some(note) = note {
            entry = entry.with_change("note", None, Some(serde_json::json!(note)));
        }
        self.store
            .append_change_log(&entry)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        Ok(())
    }
}

fn bump(counts: &mut Vec<(String, usize)>, key: &str) {
    match counts.iter_mut().find(|(k, _)| k == key) {
        Some((_, n)) => *n += 1,
        None => counts.push((key.to_string(), 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, DeliveryPlatformLink, DiscoveredDish, OriginTrace, Platform, ProductTag};

    fn staged_venue(store: &Store, name: &str) -> DiscoveredVenue {
        let mut v = DiscoveredVenue::new(
            name.to_string(),
            Address {
                street: None,
                city: "Zurich".to_string(),
                postal_code: None,
                country: "CH".to_string(),
            },
            OriginTrace::default(),
        )
        .with_confidence(60.0);
        v.needs_review = true;
        v.platform_links.push(DeliveryPlatformLink {
            platform: Platform::Wolt,
            url: format!("https://wolt.com/ch/zur/{}", name.to_lowercase()),
            active: None,
        });
        store.upsert_venue(&v).unwrap();
        v
    }

    #[test]
    fn approve_flips_venue_and_dishes() {
        let store = Store::open_in_memory().unwrap();
        let v = staged_venue(&store, "Alpha");
        let dish = DiscoveredDish::new(v.id.clone(), "Planted Kebab".into(), ProductTag::PlantedKebab);
        store.upsert_dish(&dish).unwrap();

        let queue = ReviewQueue::new(&store);
        queue.approve(&v.id, v.updated_at, "reviewer").unwrap();

        assert_eq!(
            store.get_venue(&v.id).unwrap().unwrap().status,
            VenueStatus::Verified
        );
        assert_eq!(
            store.get_dish(&dish.id).unwrap().unwrap().status,
            VenueStatus::Verified
        );
        assert_eq!(store.change_log_for("discovered_venues", &v.id).unwrap().len(), 1);
    }

    #[test]
    fn stale_timestamp_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let v = staged_venue(&store, "Beta");
        let queue = ReviewQueue::new(&store);

        queue.approve(&v.id, v.updated_at, "reviewer").unwrap();
        // Second actor still holds the original timestamp.
        let err = queue.reject(&v.id, "dup", v.updated_at, "other").unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn reject_requires_reason() {
        let store = Store::open_in_memory().unwrap();
        let v = staged_venue(&store, "Gamma");
        let queue = ReviewQueue::new(&store);
        let err = queue.reject(&v.id, "  ", v.updated_at, "reviewer").unwrap_err();
        assert!(matches!(err, EngineError::Policy(_)));
    }

    #[test]
    fn partial_approve_keeps_other_dishes_pending() {
        let store = Store::open_in_memory().unwrap();
        let v = staged_venue(&store, "Delta");
        let keep = DiscoveredDish::new(v.id.clone(), "Planted Kebab".into(), ProductTag::PlantedKebab);
        let drop = DiscoveredDish::new(v.id.clone(), "Odd Dish".into(), ProductTag::PlantedChicken);
        store.upsert_dish(&keep).unwrap();
        store.upsert_dish(&drop).unwrap();

        let queue = ReviewQueue::new(&store);
        queue
            .partial_approve(&v.id, &[keep.id.clone()], Some("kebab only"), v.updated_at, "reviewer")
            .unwrap();

        assert_eq!(
            store.get_dish(&keep.id).unwrap().unwrap().status,
            VenueStatus::Verified
        );
        assert_eq!(
            store.get_dish(&drop.id).unwrap().unwrap().status,
            VenueStatus::Discovered
        );
    }

    #[test]
    fn bulk_reject_collects_failures() {
        let store = Store::open_in_memory().unwrap();
        let a = staged_venue(&store, "Epsilon");
        let b = staged_venue(&store, "Zeta");
        let queue = ReviewQueue::new(&store);

        // Invalidate b's timestamp first.
        queue.approve(&b.id, b.updated_at, "reviewer").unwrap();

        let failures = queue
            .bulk_reject(
                &[(a.id.clone(), a.updated_at), (b.id.clone(), b.updated_at)],
                "not a partner",
                "reviewer",
            )
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, b.id);
        assert_eq!(
            store.get_venue(&a.id).unwrap().unwrap().status,
            VenueStatus::Rejected
        );
    }

    #[test]
    fn stats_buckets() {
        let store = Store::open_in_memory().unwrap();
        staged_venue(&store, "One");
        let queue = ReviewQueue::new(&store);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending_total, 1);
        assert_eq!(stats.confidence_buckets[3], 1); // 60 → [60,80)
        assert_eq!(stats.by_country, vec![("CH".to_string(), 1)]);
    }
}
