//! Deterministic auto-verification rules.
//!
//! Applied to every venue entering `discovered` status. Rules are ordered
//! and the first match decides; a dry run reports the decision without
//! touching state, and must agree with the wet run on identical input.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::RegexSet;
use serde::Serialize;
use tracing::{debug, info};

use crate::discovery::classifier::fuzzy_chain_match;
use crate::models::{
    normalize_delivery_url, ChangeAction, ChangeLogEntry, ChangeSource, DiscoveredVenue,
    VenueStatus,
};
use crate::storage::Store;

const CHAIN_VERIFY_CONFIDENCE: f64 = 90.0;
const UNCONDITIONAL_VERIFY_CONFIDENCE: f64 = 95.0;
const DISH_VERIFY_CONFIDENCE: f64 = 80.0;
const DISH_VERIFY_MIN_DISHES: usize = 2;

lazy_static! {
    /// Names using the brand token for something that is not the brand.
    static ref BRAND_MISUSE: RegexSet = RegexSet::new([
        r"(?i)\bplant(ed)?\s*(shop|store|nursery|garden|center|centre)\b",
        r"(?i)\bplantation\b",
        r"(?i)\bplanted\s*(tank|aquarium)s?\b",
        r"(?i)\bgarden\s*(center|centre|shop)\b",
    ])
    .expect("brand misuse patterns");

    /// URLs that are never an individual venue page.
    static ref REJECT_URLS: RegexSet = RegexSet::new([
        r"(?i)/search([/?]|$)",
        r"(?i)[?&]q=",
        r"(?i)/category/",
        r"(?i)/categories/",
        r"(?i)/help([/?]|$)",
        r"(?i)/support([/?]|$)",
        r"(?i)/blog([/?]|$)",
        r"(?i)/discovery([/?]|$)",
        r"(?i)/brands?/",
        r"(?i)/city/",
    ])
    .expect("reject url patterns");
}

pub fn name_matches_brand_misuse(name: &str) -> bool {
    BRAND_MISUSE.is_match(name)
}

pub fn url_matches_reject_pattern(url: &str) -> bool {
    REJECT_URLS.is_match(url)
}

/// What the rule engine decided, with the rule number that fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    Verify { rule: u8 },
    Reject { rule: u8, reason: String },
    NeedsReview,
}

pub struct AutoVerifier<'a> {
    store: &'a Store,
}

impl<'a> AutoVerifier<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Evaluate the ordered rules without mutating anything.
    pub fn decide(&self, venue: &DiscoveredVenue) -> anyhow::Result<Decision> {
        // Rule 1: brand-misuse names.
        if name_matches_brand_misuse(&venue.name) {
            return Ok(Decision::Reject {
                rule: 1,
                reason: format!("name '{}' matches a brand-misuse pattern", venue.name),
            });
        }

        // Rule 2: non-venue URLs.
        for link in &venue.platform_links {
            if url_matches_reject_pattern(&link.url) {
                return Ok(Decision::Reject {
                    rule: 2,
                    reason: format!("url '{}' matches a reject pattern", link.url),
                });
            }
        }

        // Rule 3: duplicate URL against any live venue.
        for link in &venue.platform_links {
            if let Some(normalized) = normalize_delivery_url(&link.url) {
                let holders = self
                    .store
                    .venue_ids_with_url(&normalized, Some(VenueStatus::Rejected))?;
                if holders.iter().any(|id| id != &venue.id) {
                    return Ok(Decision::Reject {
                        rule: 3,
                        reason: format!("duplicate delivery url '{normalized}'"),
                    });
                }
            }
        }

        // Rule 4: verified-chain name match at high confidence.
        if venue.confidence_score >= CHAIN_VERIFY_CONFIDENCE {
            let chains = self.store.list_chains(true)?;
            if chains.iter().any(|c| fuzzy_chain_match(&venue.name, &c.name)) {
                return Ok(Decision::Verify { rule: 4 });
            }
        }

        // Rule 5: very high confidence verifies unconditionally.
        if venue.confidence_score >= UNCONDITIONAL_VERIFY_CONFIDENCE {
            return Ok(Decision::Verify { rule: 5 });
        }

        // Rule 6: extracted catalog dishes back the venue up.
        if venue.confidence_score >= DISH_VERIFY_CONFIDENCE {
            let dishes = self.store.dishes_for_venue(&venue.id)?;
            if dishes.len() >= DISH_VERIFY_MIN_DISHES {
                return Ok(Decision::Verify { rule: 6 });
            }
        }

        Ok(Decision::NeedsReview)
    }

    /// Decide and, unless `dry_run`, persist the outcome with a change-log
    /// entry.
    pub fn apply(&self, venue: &DiscoveredVenue, dry_run: bool) -> anyhow::Result<Decision> {
        let decision = self.decide(venue)?;
        if dry_run {
            debug!(venue = %venue.id, ?decision, "auto-verify dry run");
            return Ok(decision);
        }

        let mut updated = venue.clone();
        updated.updated_at = Utc::now();
        match &decision {
            Decision::Verify { rule } => {
                updated.status = VenueStatus::Verified;
                updated.needs_review = false;
                self.store.upsert_venue(&updated)?;
                self.store.append_change_log(
                    &ChangeLogEntry::new(
                        ChangeAction::Verified,
                        "discovered_venues",
                        &updated.id,
                        ChangeSource::Scraper,
                        "auto-verifier",
                    )
                    .with_change(
                        "status",
                        Some(serde_json::json!(venue.status.as_str())),
                        Some(serde_json::json!("verified")),
                    )
                    .with_change("rule", None, Some(serde_json::json!(rule))),
                )?;
                info!(venue = %updated.id, rule, "auto-verified");
            }
            Decision::Reject { rule, reason } => {
                updated.status = VenueStatus::Rejected;
                updated.needs_review = false;
                updated.rejection_reason = Some(reason.clone());
                self.store.upsert_venue(&updated)?;
                self.store.append_change_log(
                    &ChangeLogEntry::new(
                        ChangeAction::Rejected,
                        "discovered_venues",
                        &updated.id,
                        ChangeSource::Scraper,
                        "auto-verifier",
                    )
                    .with_change(
                        "status",
                        Some(serde_json::json!(venue.status.as_str())),
                        Some(serde_json::json!("rejected")),
                    )
                    .with_change("reason", None, Some(serde_json::json!(reason)))
                    .with_change("rule", None, Some(serde_json::json!(rule))),
                )?;
                for mut dish in self.store.dishes_for_venue(&updated.id)? {
                    if !matches!(dish.status, VenueStatus::Promoted | VenueStatus::Rejected) {
                        dish.status = VenueStatus::Rejected;
                        dish.updated_at = Utc::now();
                        self.store.upsert_dish(&dish)?;
                    }
                }
                info!(venue = %updated.id, rule, reason, "auto-rejected");
            }
            Decision::NeedsReview => {
                updated.needs_review = true;
                self.store.upsert_venue(&updated)?;
            }
        }
        Ok(decision)
    }

    /// Run the rules over every venue currently in `discovered` status.
    /// Returns (verified, rejected, needs_review) counts.
    pub fn sweep(&self, dry_run: bool) -> anyhow::Result<(u32, u32, u32)> {
        let mut verified = 0;
        let mut rejected = 0;
        let mut needs_review = 0;
        for venue in self.store.list_venues_by_status(VenueStatus::Discovered)? {
            match self.apply(&venue, dry_run)? {
                Decision::Verify { .. } => verified += 1,
                Decision::Reject { .. } => rejected += 1,
                Decision::NeedsReview => needs_review += 1,
            }
        }
        Ok((verified, rejected, needs_review))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, DeliveryPlatformLink, OriginTrace, Platform, ProductTag};

    fn venue(name: &str, url: &str, confidence: f64) -> DiscoveredVenue {
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
        .with_confidence(confidence);
        v.platform_links.push(DeliveryPlatformLink {
            platform: Platform::Wolt,
            url: url.to_string(),
            active: None,
        });
        v
    }

    fn chain(store: &Store, name: &str) {
        let now = Utc::now();
        store
            .upsert_chain(&crate::models::Chain {
                id: format!("chain-{}", name.to_lowercase()),
                name: name.to_string(),
                countries: vec!["CH".to_string()],
                locations_count: 10,
                cities: vec![],
                verified: true,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    #[test]
    fn rule1_brand_misuse() {
        let store = Store::open_in_memory().unwrap();
        let verifier = AutoVerifier::new(&store);
        let v = venue("Planted Garden Center", "https://wolt.com/x", 99.0);
        assert!(matches!(
            verifier.decide(&v).unwrap(),
            Decision::Reject { rule: 1, .. }
        ));
    }

    #[test]
    fn rule2_reject_url() {
        let store = Store::open_in_memory().unwrap();
        let verifier = AutoVerifier::new(&store);
        let v = venue("Happy Bowl", "https://wolt.com/search?q=planted", 99.0);
        assert!(matches!(
            verifier.decide(&v).unwrap(),
            Decision::Reject { rule: 2, .. }
        ));
    }

    #[test]
    fn rule3_duplicate_url() {
        let store = Store::open_in_memory().unwrap();
        let existing = venue("First", "https://wolt.com/ch/zur/one", 80.0);
        store.upsert_venue(&existing).unwrap();

        let verifier = AutoVerifier::new(&store);
        let dup = venue("Second", "https://wolt.com/ch/zur/one", 99.0);
        assert!(matches!(
            verifier.decide(&dup).unwrap(),
            Decision::Reject { rule: 3, .. }
        ));
    }

    #[test]
    fn confidence_boundaries() {
        let store = Store::open_in_memory().unwrap();
        chain(&store, "Hiltl");
        let verifier = AutoVerifier::new(&store);

        // 89 + chain match: below the chain threshold.
        let v = venue("Hiltl Sihlpost", "https://wolt.com/a", 89.0);
        assert_eq!(verifier.decide(&v).unwrap(), Decision::NeedsReview);

        // 90 + chain match: rule 4.
        let v = venue("Hiltl Sihlpost", "https://wolt.com/b", 90.0);
        assert_eq!(verifier.decide(&v).unwrap(), Decision::Verify { rule: 4 });

        // 95 without chain: rule 5.
        let v = venue("Unknown Bistro", "https://wolt.com/c", 95.0);
        assert_eq!(verifier.decide(&v).unwrap(), Decision::Verify { rule: 5 });

        // 94 without chain or dishes: queue.
        let v = venue("Unknown Bistro 2", "https://wolt.com/d", 94.0);
        assert_eq!(verifier.decide(&v).unwrap(), Decision::NeedsReview);
    }

    #[test]
    fn rule6_dish_backed() {
        let store = Store::open_in_memory().unwrap();
        let verifier = AutoVerifier::new(&store);
        let v = venue("Dish Rich", "https://wolt.com/e", 85.0);
        store.upsert_venue(&v).unwrap();
        for i in 0..2 {
            store
                .upsert_dish(&crate::models::DiscoveredDish::new(
                    v.id.clone(),
                    format!("dish-{i}"),
                    ProductTag::PlantedChicken,
                ))
                .unwrap();
        }
        assert_eq!(verifier.decide(&v).unwrap(), Decision::Verify { rule: 6 });

        // One dish is not enough.
        let thin = venue("Dish Poor", "https://wolt.com/f", 85.0);
        store.upsert_venue(&thin).unwrap();
        store
            .upsert_dish(&crate::models::DiscoveredDish::new(
                thin.id.clone(),
                "only".to_string(),
                ProductTag::PlantedKebab,
            ))
            .unwrap();
        assert_eq!(verifier.decide(&thin).unwrap(), Decision::NeedsReview);
    }

    #[test]
    fn dry_run_matches_wet_run() {
        let store = Store::open_in_memory().unwrap();
        let verifier = AutoVerifier::new(&store);
        let v = venue("Some Bistro", "https://wolt.com/g", 96.0);
        store.upsert_venue(&v).unwrap();

        let dry = verifier.apply(&v, true).unwrap();
        // Dry run left the venue untouched.
        assert_eq!(
            store.get_venue(&v.id).unwrap().unwrap().status,
            VenueStatus::Discovered
        );
        let wet = verifier.apply(&v, false).unwrap();
        assert_eq!(dry, wet);
        assert_eq!(
            store.get_venue(&v.id).unwrap().unwrap().status,
            VenueStatus::Verified
        );
    }

    #[test]
    fn needs_review_flag_set() {
        let store = Store::open_in_memory().unwrap();
        let verifier = AutoVerifier::new(&store);
        let v = venue("Border Case", "https://wolt.com/h", 50.0);
        store.upsert_venue(&v).unwrap();
        verifier.apply(&v, false).unwrap();
        let stored = store.get_venue(&v.id).unwrap().unwrap();
        assert!(stored.needs_review);
        assert_eq!(stored.status, VenueStatus::Discovered);
    }
}
