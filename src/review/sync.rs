//! Staging → production sync.
//!
//! Preview diffs the two stores without writing; execute promotes an
//! explicit entity set under a named advisory lock, one transaction per
//! entity, collecting per-entity failures into a single history record
//! instead of aborting the batch.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    default_opening_hours, ChangeAction, ChangeLogEntry, ChangeSource, Coordinates,
    DiscoveredDish, DiscoveredVenue, HoursSource, ProductionDish, ProductionStatus,
    ProductionVenue, SyncEntityError, SyncHistoryRecord, VenueStatus,
};
use crate::storage::Store;

pub const SYNC_LOCK: &str = "sync-execute";
const REMOVAL_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct PlannedAddition {
    pub venue_id: String,
    pub name: String,
    pub dish_count: u32,
    pub verified_dish_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedUpdate {
    pub venue_id: String,
    pub production_venue_id: String,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedRemoval {
    pub production_venue_id: String,
    pub name: String,
    pub last_verified: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncPreview {
    pub additions: Vec<PlannedAddition>,
    pub updates: Vec<PlannedUpdate>,
    pub potential_removals: Vec<PlannedRemoval>,
}

impl SyncPreview {
    pub fn totals(&self) -> (usize, usize, usize) {
        (
            self.additions.len(),
            self.updates.len(),
            self.potential_removals.len(),
        )
    }
}

/// What to promote. `sync_all` promotes every eligible staged entity.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub venue_ids: Vec<String>,
    pub dish_ids: Vec<String>,
    pub sync_all: bool,
    pub actor: String,
}

pub struct SyncPlanner<'a> {
    store: &'a Store,
}

impl<'a> SyncPlanner<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Diff staging against production. Dish counts come from one
    /// aggregated query over the whole addition set.
    pub fn preview(&self) -> anyhow::Result<SyncPreview> {
        let mut preview = SyncPreview::default();
        let verified = self.store.list_venues_by_status(VenueStatus::Verified)?;

        let addition_ids: Vec<String> = verified
            .iter()
            .filter(|v| v.production_venue_id.is_none())
            .map(|v| v.id.clone())
            .collect();
        let dish_counts = self.store.dish_counts_by_venue(&addition_ids)?;

        for venue in &verified {
            if venue.production_venue_id.is_some() {
                continue;
            }
            let (dish_count, verified_dish_count) = dish_counts
                .iter()
                .find(|(id, _, _)| id == &venue.id)
                .map(|(_, total, ok)| (*total, *ok))
                .unwrap_or((0, 0));
            preview.additions.push(PlannedAddition {
                venue_id: venue.id.clone(),
                name: venue.name.clone(),
                dish_count,
                verified_dish_count,
            });
        }

        // Updates: promoted staging venues whose production projection has
        // drifted from the stored production record.
        for venue in self.store.list_venues_by_status(VenueStatus::Promoted)? {
            let Some(production_id) = &venue.production_venue_id else {
                continue;
            };
            let Some(existing) = self.store.get_production_venue(production_id)? else {
                continue;
            };
            let projected = project_venue(&venue, Some(&existing));
            let changed = diff_fields(&existing, &projected);
            if !changed.is_empty() {
                preview.updates.push(PlannedUpdate {
                    venue_id: venue.id.clone(),
                    production_venue_id: production_id.clone(),
                    changed_fields: changed,
                });
            }
        }

        let cutoff = Utc::now() - chrono::Duration::days(REMOVAL_AGE_DAYS);
        for venue in self.store.list_production_venues()? {
            if venue.status != ProductionStatus::Archived && venue.last_verified < cutoff {
                preview.potential_removals.push(PlannedRemoval {
                    production_venue_id: venue.id.clone(),
                    name: venue.name.clone(),
                    last_verified: venue.last_verified.to_rfc3339(),
                });
            }
        }

        preview.additions.sort_by(|a, b| a.venue_id.cmp(&b.venue_id));
        preview.updates.sort_by(|a, b| a.venue_id.cmp(&b.venue_id));
        preview
            .potential_removals
            .sort_by(|a, b| a.production_venue_id.cmp(&b.production_venue_id));
        Ok(preview)
    }

    /// Promote the requested set. Serialized process-wide by the advisory
    /// lock; entities are processed in stable id order.
    pub fn execute(&self, request: &SyncRequest) -> EngineResult<SyncHistoryRecord> {
        let holder = format!("{}:{}", request.actor, Uuid::new_v4());
        let acquired = self
            .store
            .try_acquire_lock(SYNC_LOCK, &holder)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        if !acquired {
            return Err(EngineError::Conflict(
                "another sync execute is in progress".to_string(),
            ));
        }
        let result = self.execute_locked(request);
        let _ = self.store.release_lock(SYNC_LOCK, &holder);
        result
    }

    fn execute_locked(&self, request: &SyncRequest) -> EngineResult<SyncHistoryRecord> {
        let mut record = SyncHistoryRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: request.actor.clone(),
            venue_ids: Vec::new(),
            dish_ids: Vec::new(),
            added: 0,
            updated: 0,
            failed: 0,
            errors: Vec::new(),
        };

        let mut venues = self
            .selected_venues(request)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        venues.sort_by(|a, b| a.id.cmp(&b.id));

        for venue in venues {
            match self.promote_venue(&venue, &request.actor) {
                Ok(production_id) => {
                    record.added += 1;
                    record.venue_ids.push(venue.id.clone());
                    info!(venue = %venue.id, production = %production_id, "venue promoted");
                }
                Err(e) => {
                    warn!(venue = %venue.id, error = %e, "venue promotion failed");
                    record.failed += 1;
                    record.errors.push(SyncEntityError {
                        entity_id: venue.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut dishes = self
            .selected_dishes(request)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        dishes.sort_by(|a, b| a.id.cmp(&b.id));

        for dish in dishes {
            match self.promote_dish(&dish, &request.actor) {
                Ok(_) => {
                    record.added += 1;
                    record.dish_ids.push(dish.id.clone());
                }
                Err(e) => {
                    warn!(dish = %dish.id, error = %e, "dish promotion failed");
                    record.failed += 1;
                    record.errors.push(SyncEntityError {
                        entity_id: dish.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.store
            .insert_sync_history(&record)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        metrics::counter!("sync_entities_promoted", record.added as u64);
        info!(
            added = record.added,
            failed = record.failed,
            "sync execute finished"
        );
        Ok(record)
    }

    fn selected_venues(&self, request: &SyncRequest) -> anyhow::Result<Vec<DiscoveredVenue>> {
        let verified = self.store.list_venues_by_status(VenueStatus::Verified)?;
        Ok(verified
            .into_iter()
            .filter(|v| v.production_venue_id.is_none())
            .filter(|v| request.sync_all || request.venue_ids.contains(&v.id))
            .collect())
    }

    fn selected_dishes(&self, request: &SyncRequest) -> anyhow::Result<Vec<DiscoveredDish>> {
        // Dishes ride along with their venue in sync_all mode; an explicit
        // request names them directly.
        let mut dishes = Vec::new();
        if request.sync_all {
            for venue in self.store.list_venues_by_status(VenueStatus::Promoted)? {
                for dish in self.store.dishes_for_venue(&venue.id)? {
                    if dish.status == VenueStatus::Verified && dish.production_dish_id.is_none() {
                        dishes.push(dish);
                    }
                }
            }
        } else {
            for dish_id in &request.dish_ids {
                if let Some(dish) = self.store.get_dish(dish_id)? {
                    if dish.status == VenueStatus::Verified && dish.production_dish_id.is_none() {
                        dishes.push(dish);
                    }
                }
            }
        }
        Ok(dishes)
    }

    /// One venue, one transaction: production insert plus staging flip.
    fn promote_venue(&self, staged: &DiscoveredVenue, actor: &str) -> EngineResult<String> {
        let production = project_venue(staged, None);
        let mut updated = staged.clone();
        updated.status = VenueStatus::Promoted;
        updated.production_venue_id = Some(production.id.clone());
        updated.promoted_at = Some(Utc::now());
        updated.updated_at = Utc::now();

        self.store
            .promote_venue_txn(&production, &updated)
            .map_err(|e| EngineError::Fatal(format!("venue {}: {e}", staged.id)))?;

        let entry = ChangeLogEntry::new(
            ChangeAction::Promoted,
            "discovered_venues",
            &staged.id,
            ChangeSource::Manual,
            actor,
        )
        .with_change(
            "production_venue_id",
            None,
            Some(serde_json::json!(production.id)),
        );
        self.store
            .append_change_log(&entry)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        Ok(production.id)
    }

    fn promote_dish(&self, staged: &DiscoveredDish, actor: &str) -> EngineResult<String> {
        // The owning venue must already be promoted; its production id
        // anchors the production dish.
        let venue = self
            .store
            .get_venue(&staged.venue_id)
            .map_err(|e| EngineError::Fatal(e.to_string()))?
            .ok_or_else(|| {
                EngineError::Fatal(format!("dish {}: venue {} missing", staged.id, staged.venue_id))
            })?;
        let production_venue_id = venue.production_venue_id.ok_or_else(|| {
            EngineError::Policy(format!(
                "dish {}: venue {} is not promoted",
                staged.id, staged.venue_id
            ))
        })?;

        let now = Utc::now();
        let production = ProductionDish {
            id: Uuid::new_v4().to_string(),
            venue_id: production_venue_id,
            name: staged.name.clone(),
            description: staged.description.clone(),
            category: staged.category.clone(),
            product_tag: staged.product_tag,
            prices: staged.prices.clone(),
            image_url: staged.image_url.clone(),
            dietary_tags: staged.dietary_tags.clone(),
            last_verified: now,
            status: ProductionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let mut updated = staged.clone();
        updated.status = VenueStatus::Promoted;
        updated.production_dish_id = Some(production.id.clone());
        updated.promoted_at = Some(now);
        updated.updated_at = now;

        self.store
            .promote_dish_txn(&production, &updated)
            .map_err(|e| EngineError::Fatal(format!("dish {}: {e}", staged.id)))?;

        let entry = ChangeLogEntry::new(
            ChangeAction::Promoted,
            "discovered_dishes",
            &staged.id,
            ChangeSource::Manual,
            actor,
        )
        .with_change(
            "production_dish_id",
            None,
            Some(serde_json::json!(production.id)),
        );
        self.store
            .append_change_log(&entry)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        Ok(production.id)
    }
}

/// Build the production projection of a staged venue, applying the safe
/// defaults: restaurant type, all-week 11:00–22:00 hours, zero
/// coordinates. When updating, identity fields carry over from the
/// existing record.
fn project_venue(staged: &DiscoveredVenue, existing: Option<&ProductionVenue>) -> ProductionVenue {
    let now = Utc::now();
    ProductionVenue {
        id: existing
            .map(|e| e.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: staged.name.clone(),
        venue_type: existing
            .map(|e| e.venue_type.clone())
            .unwrap_or_else(|| "restaurant".to_string()),
        address: staged.address.clone(),
        coordinates: staged
            .coordinates
            .unwrap_or(Coordinates { lat: 0.0, lng: 0.0 }),
        platform_links: staged.platform_links.clone(),
        chain_id: staged.chain_id.clone(),
        opening_hours: existing
            .filter(|e| e.hours_source != HoursSource::Default)
            .map(|e| e.opening_hours.clone())
            .unwrap_or_else(default_opening_hours),
        hours_source: existing
            .filter(|e| e.hours_source != HoursSource::Default)
            .map(|e| e.hours_source)
            .unwrap_or(HoursSource::Default),
        delivery_zones: existing.map(|e| e.delivery_zones.clone()).unwrap_or_default(),
        last_verified: existing.map(|e| e.last_verified).unwrap_or(now),
        status: existing.map(|e| e.status).unwrap_or(ProductionStatus::Active),
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_at: now,
    }
}

/// Deep field compare between two production projections; returns the
/// names of top-level fields that differ. Timestamps are excluded.
fn diff_fields(a: &ProductionVenue, b: &ProductionVenue) -> Vec<String> {
    let mut left = serde_json::to_value(a).unwrap_or_default();
    let mut right = serde_json::to_value(b).unwrap_or_default();
    for value in [&mut left, &mut right] {
        if let Some(map) = value.as_object_mut() {
            map.remove("created_at");
            map.remove("updated_at");
            map.remove("last_verified");
        }
    }
    let (Some(left), Some(right)) = (left.as_object(), right.as_object()) else {
        return Vec::new();
    };
    let mut changed: Vec<String> = left
        .iter()
        .filter(|(key, value)| right.get(*key) != Some(value))
        .map(|(key, _)| key.clone())
        .collect();
    changed.sort();
    changed
}
