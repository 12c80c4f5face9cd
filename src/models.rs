//! Core entity model shared by every component.
//!
//! Venues and dishes exist twice: once in the staging store (discovered_*)
//! where the pipeline mutates them, and once in the production store
//! (production_*) where only sync writes. Both sides live as rows keyed by
//! stable id; nothing is embedded by value outside transient API
//! projections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery platforms the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    UberEats,
    Wolt,
    Lieferando,
    JustEat,
    Deliveroo,
    Smood,
    EatCh,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::UberEats,
        Platform::Wolt,
        Platform::Lieferando,
        Platform::JustEat,
        Platform::Deliveroo,
        Platform::Smood,
        Platform::EatCh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::UberEats => "uber-eats",
            Platform::Wolt => "wolt",
            Platform::Lieferando => "lieferando",
            Platform::JustEat => "just-eat",
            Platform::Deliveroo => "deliveroo",
            Platform::Smood => "smood",
            Platform::EatCh => "eat-ch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uber-eats" | "ubereats" => Some(Platform::UberEats),
            "wolt" => Some(Platform::Wolt),
            "lieferando" => Some(Platform::Lieferando),
            "just-eat" | "justeat" => Some(Platform::JustEat),
            "deliveroo" => Some(Platform::Deliveroo),
            "smood" => Some(Platform::Smood),
            "eat-ch" | "eat.ch" => Some(Platform::EatCh),
            _ => None,
        }
    }
}

/// Product catalog. Every retained dish maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductTag {
    PlantedChicken,
    PlantedKebab,
    PlantedPulled,
    PlantedSchnitzel,
    PlantedBratwurst,
    PlantedSteak,
    PlantedDuck,
}

impl ProductTag {
    pub const ALL: [ProductTag; 7] = [
        ProductTag::PlantedChicken,
        ProductTag::PlantedKebab,
        ProductTag::PlantedPulled,
        ProductTag::PlantedSchnitzel,
        ProductTag::PlantedBratwurst,
        ProductTag::PlantedSteak,
        ProductTag::PlantedDuck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductTag::PlantedChicken => "planted.chicken",
            ProductTag::PlantedKebab => "planted.kebab",
            ProductTag::PlantedPulled => "planted.pulled",
            ProductTag::PlantedSchnitzel => "planted.schnitzel",
            ProductTag::PlantedBratwurst => "planted.bratwurst",
            ProductTag::PlantedSteak => "planted.steak",
            ProductTag::PlantedDuck => "planted.duck",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planted.chicken" => Some(ProductTag::PlantedChicken),
            "planted.kebab" => Some(ProductTag::PlantedKebab),
            "planted.pulled" => Some(ProductTag::PlantedPulled),
            "planted.schnitzel" => Some(ProductTag::PlantedSchnitzel),
            "planted.bratwurst" => Some(ProductTag::PlantedBratwurst),
            "planted.steak" => Some(ProductTag::PlantedSteak),
            "planted.duck" => Some(ProductTag::PlantedDuck),
            _ => None,
        }
    }
}

/// Staging lifecycle. `Rejected` and `Promoted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueStatus {
    Discovered,
    Verified,
    Rejected,
    Promoted,
}

impl VenueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueStatus::Discovered => "discovered",
            VenueStatus::Verified => "verified",
            VenueStatus::Rejected => "rejected",
            VenueStatus::Promoted => "promoted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(VenueStatus::Discovered),
            "verified" => Some(VenueStatus::Verified),
            "rejected" => Some(VenueStatus::Rejected),
            "promoted" => Some(VenueStatus::Promoted),
            _ => None,
        }
    }
}

/// Production lifecycle driven by the staleness sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Active,
    Stale,
    Archived,
}

impl ProductionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductionStatus::Active => "active",
            ProductionStatus::Stale => "stale",
            ProductionStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProductionStatus::Active),
            "stale" => Some(ProductionStatus::Stale),
            "archived" => Some(ProductionStatus::Archived),
            _ => None,
        }
    }
}

/// A venue's presence on one delivery platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPlatformLink {
    pub platform: Platform,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: String,
    pub postal_code: Option<String>,
    /// ISO 3166-1 alpha-2, uppercase.
    pub country: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Where a staged venue came from, kept for the learning loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginTrace {
    pub strategy_id: Option<String>,
    pub search_query: String,
}

/// A candidate venue staged by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredVenue {
    pub id: String,
    pub name: String,
    pub address: Address,
    pub coordinates: Option<Coordinates>,
    pub platform_links: Vec<DeliveryPlatformLink>,
    pub chain_id: Option<String>,
    /// Overall classifier confidence in [0,100].
    pub confidence_score: f64,
    pub positive_factors: Vec<String>,
    pub negative_factors: Vec<String>,
    pub status: VenueStatus,
    /// Set by the auto-verifier when no rule decided the venue.
    pub needs_review: bool,
    pub rejection_reason: Option<String>,
    pub production_venue_id: Option<String>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub origin: OriginTrace,
    /// Consecutive failed extraction runs. Reset on success.
    pub extraction_failures: u32,
    pub last_extraction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveredVenue {
    pub fn new(name: String, address: Address, origin: OriginTrace) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            address,
            coordinates: None,
            platform_links: Vec::new(),
            chain_id: None,
            confidence_score: 0.0,
            positive_factors: Vec::new(),
            negative_factors: Vec::new(),
            status: VenueStatus::Discovered,
            needs_review: false,
            rejection_reason: None,
            production_venue_id: None,
            promoted_at: None,
            origin,
            extraction_failures: 0,
            last_extraction_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_confidence(mut self, score: f64) -> Self {
        self.confidence_score = score.clamp(0.0, 100.0);
        self
    }

    pub fn with_links(mut self, links: Vec<DeliveryPlatformLink>) -> Self {
        self.platform_links = links;
        self
    }

    pub fn with_chain(mut self, chain_id: String) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    /// Merge platform links from another observation of the same venue.
    /// Returns true when anything new was added.
    pub fn merge_links(&mut self, links: &[DeliveryPlatformLink]) -> bool {
        let mut changed = false;
        for link in links {
            let exists = self
                .platform_links
                .iter()
                .any(|l| l.platform == link.platform && l.url == link.url);
            if !exists {
                self.platform_links.push(link.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Per-factor breakdown behind a dish confidence score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DishConfidence {
    pub name_clarity: f64,
    pub description_evidence: f64,
    pub price_plausibility: f64,
    pub source_reliability: f64,
    pub product_match: f64,
}

impl DishConfidence {
    /// Arithmetic mean of the five factors.
    pub fn overall(&self) -> f64 {
        (self.name_clarity
            + self.description_evidence
            + self.price_plausibility
            + self.source_reliability
            + self.product_match)
            / 5.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    /// ISO 4217 code, e.g. "CHF".
    pub currency: String,
}

/// A brand-containing menu item extracted from a venue page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDish {
    pub id: String,
    pub venue_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub product_tag: ProductTag,
    /// Prices keyed by uppercase country code.
    pub prices: BTreeMap<String, Price>,
    pub image_url: Option<String>,
    pub dietary_tags: Vec<String>,
    pub confidence: DishConfidence,
    pub confidence_score: f64,
    pub needs_review: bool,
    pub status: VenueStatus,
    pub production_dish_id: Option<String>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveredDish {
    pub fn new(venue_id: String, name: String, product_tag: ProductTag) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            venue_id,
            name,
            description: None,
            category: None,
            product_tag,
            prices: BTreeMap::new(),
            image_url: None,
            dietary_tags: Vec::new(),
            confidence: DishConfidence::default(),
            confidence_score: 0.0,
            needs_review: false,
            status: VenueStatus::Discovered,
            production_dish_id: None,
            promoted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_confidence(mut self, breakdown: DishConfidence) -> Self {
        self.confidence_score = breakdown.overall();
        self.needs_review = self.confidence_score < 40.0;
        self.confidence = breakdown;
        self
    }
}

/// Weekday → opening window, "HH:MM" local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningWindow {
    pub open: String,
    pub close: String,
}

/// Where a production venue's hours came from. Defaulted hours exist to
/// satisfy the catalog contract but rank as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoursSource {
    Extracted,
    Manual,
    Default,
}

/// The approved, publicly-served venue projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionVenue {
    pub id: String,
    pub name: String,
    pub venue_type: String,
    pub address: Address,
    pub coordinates: Coordinates,
    pub platform_links: Vec<DeliveryPlatformLink>,
    pub chain_id: Option<String>,
    /// Keyed "mon".."sun".
    pub opening_hours: BTreeMap<String, OpeningWindow>,
    pub hours_source: HoursSource,
    /// Postal codes or "1000-1299" ranges.
    pub delivery_zones: Vec<String>,
    pub last_verified: DateTime<Utc>,
    pub status: ProductionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// All-week 11:00–22:00. Written when a promotion has no extracted hours;
/// `hours_source` stays `Default` so ranking treats them as unknown.
pub fn default_opening_hours() -> BTreeMap<String, OpeningWindow> {
    WEEKDAYS
        .iter()
        .map(|day| {
            (
                day.to_string(),
                OpeningWindow {
                    open: "11:00".to_string(),
                    close: "22:00".to_string(),
                },
            )
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionDish {
    pub id: String,
    pub venue_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub product_tag: ProductTag,
    pub prices: BTreeMap<String, Price>,
    pub image_url: Option<String>,
    pub dietary_tags: Vec<String>,
    pub last_verified: DateTime<Utc>,
    pub status: ProductionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A parameterised query template with usage statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryStrategy {
    pub id: String,
    /// Interpolation slots: `{city}`, `{chain}`, `{platform}`.
    pub template: String,
    pub platform: Option<Platform>,
    pub country: String,
    pub tags: Vec<String>,
    pub uses: u64,
    pub successes: u64,
    pub false_positives: u64,
    pub deprecated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveryStrategy {
    pub fn new(template: String, country: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            template,
            platform: None,
            country,
            tags: Vec::new(),
            uses: 0,
            successes: 0,
            false_positives: 0,
            deprecated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derived success rate in [0,100]. Zero while untested.
    pub fn success_rate(&self) -> f64 {
        if self.uses == 0 {
            return 0.0;
        }
        (self.successes as f64 / self.uses as f64) * 100.0
    }

    /// A strategy with fewer than five uses has no meaningful rate yet.
    pub fn is_untested(&self) -> bool {
        self.uses < 5
    }

    /// Fill the template's slots.
    pub fn interpolate(&self, city: &str, chain: Option<&str>, platform: Option<Platform>) -> String {
        let mut query = self.template.replace("{city}", city);
        if let Some(chain) = chain {
            query = query.replace("{chain}", chain);
        }
        if let Some(platform) = platform.or(self.platform) {
            query = query.replace("{platform}", platform.as_str());
        }
        query
    }
}

/// A search-engine API credential with a shared daily quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCredential {
    pub id: String,
    pub api_key: String,
    pub engine_id: String,
    pub daily_quota: u32,
    pub queries_used_today: u32,
    pub total_queries_all_time: u64,
    /// UTC day ("YYYY-MM-DD") the counter belongs to.
    pub last_reset_date: String,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    /// Consecutive hard failures on `failure_day`; three disable the
    /// credential for the rest of the day.
    pub consecutive_failures: u32,
    pub failure_day: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchCredential {
    pub fn new(id: String, api_key: String, engine_id: String, daily_quota: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            api_key,
            engine_id,
            daily_quota,
            queries_used_today: 0,
            total_queries_all_time: 0,
            last_reset_date: now.format("%Y-%m-%d").to_string(),
            disabled: false,
            disabled_reason: None,
            consecutive_failures: 0,
            failure_day: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_quota(&self) -> bool {
        !self.disabled && self.queries_used_today < self.daily_quota
    }
}

/// A restaurant chain known to serve the brand, used by tier-1 planning
/// and chain-enumeration discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: String,
    pub name: String,
    /// Countries the chain operates in (ISO codes).
    pub countries: Vec<String>,
    /// Known location count across all countries.
    pub locations_count: u32,
    /// Cities with at least one location, as (country, city).
    pub cities: Vec<(String, String)>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chain {
    /// Fraction of known locations present as discovered or promoted
    /// venues, in [0,100].
    pub fn coverage(&self, covered_locations: u32) -> f64 {
        if self.locations_count == 0 {
            return 100.0;
        }
        (covered_locations.min(self.locations_count) as f64 / self.locations_count as f64) * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntityError {
    pub entity_id: String,
    pub message: String,
}

/// One record per sync-execute batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub venue_ids: Vec<String>,
    pub dish_ids: Vec<String>,
    pub added: u32,
    pub updated: u32,
    pub failed: u32,
    pub errors: Vec<SyncEntityError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Archived,
    Restored,
    Verified,
    Rejected,
    Promoted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "updated",
            ChangeAction::Archived => "archived",
            ChangeAction::Restored => "restored",
            ChangeAction::Verified => "verified",
            ChangeAction::Rejected => "rejected",
            ChangeAction::Promoted => "promoted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Manual,
    Scraper,
    Partner,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Manual => "manual",
            ChangeSource::Scraper => "scraper",
            ChangeSource::Partner => "partner",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// Append-only audit entry. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: ChangeAction,
    pub collection: String,
    pub document_id: String,
    pub changes: Vec<FieldChange>,
    pub source: ChangeSource,
    pub actor: String,
}

impl ChangeLogEntry {
    pub fn new(
        action: ChangeAction,
        collection: &str,
        document_id: &str,
        source: ChangeSource,
        actor: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            changes: Vec::new(),
            source,
            actor: actor.to_string(),
        }
    }

    pub fn with_change(
        mut self,
        field: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.changes.push(FieldChange {
            field: field.to_string(),
            before,
            after,
        });
        self
    }
}

/// Normalize a delivery URL to `host + path` for dedup. Query strings,
/// fragments and a trailing slash never distinguish two venues.
pub fn normalize_delivery_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let host = parsed.host_str()?.trim_start_matches("www.");
    let path = parsed.path().trim_end_matches('/');
    Some(format!("{}{}", host.to_ascii_lowercase(), path.to_ascii_lowercase()))
}

/// Dedup key for staged venues: lowercase name + city + normalized URL.
pub fn venue_dedup_key(name: &str, city: &str, url: &str) -> String {
    let normalized = normalize_delivery_url(url).unwrap_or_else(|| url.to_ascii_lowercase());
    format!(
        "{}|{}|{}",
        name.trim().to_lowercase(),
        city.trim().to_lowercase(),
        normalized
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization_strips_query_and_slash() {
        let a = normalize_delivery_url("https://www.wolt.com/de/deu/berlin/restaurant/happy-bowl/?utm=x").unwrap();
        let b = normalize_delivery_url("https://wolt.com/de/deu/berlin/restaurant/happy-bowl").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "wolt.com/de/deu/berlin/restaurant/happy-bowl");
    }

    #[test]
    fn dedup_key_case_insensitive() {
        let a = venue_dedup_key("Happy Bowl", "Berlin", "https://wolt.com/x/Y");
        let b = venue_dedup_key("happy bowl", "BERLIN", "https://wolt.com/x/y");
        assert_eq!(a, b);
    }

    #[test]
    fn strategy_success_rate() {
        let mut s = DiscoveryStrategy::new("planted in {city}".into(), "CH".into());
        assert_eq!(s.success_rate(), 0.0);
        assert!(s.is_untested());
        s.uses = 10;
        s.successes = 5;
        assert_eq!(s.success_rate(), 50.0);
        assert!(!s.is_untested());
    }

    #[test]
    fn strategy_interpolation() {
        let mut s = DiscoveryStrategy::new("{chain} {city} {platform}".into(), "CH".into());
        s.platform = Some(Platform::Wolt);
        let q = s.interpolate("Zurich", Some("Hiltl"), None);
        assert_eq!(q, "Hiltl Zurich wolt");
    }

    #[test]
    fn dish_confidence_mean_and_review_flag() {
        let breakdown = DishConfidence {
            name_clarity: 90.0,
            description_evidence: 80.0,
            price_plausibility: 70.0,
            source_reliability: 60.0,
            product_match: 100.0,
        };
        let dish = DiscoveredDish::new("v1".into(), "Planted Kebab".into(), ProductTag::PlantedKebab)
            .with_confidence(breakdown);
        assert_eq!(dish.confidence_score, 80.0);
        assert!(!dish.needs_review);

        let low = DishConfidence {
            name_clarity: 30.0,
            description_evidence: 30.0,
            price_plausibility: 30.0,
            source_reliability: 30.0,
            product_match: 30.0,
        };
        let dish = DiscoveredDish::new("v1".into(), "Mystery".into(), ProductTag::PlantedChicken)
            .with_confidence(low);
        assert!(dish.needs_review);
    }

    #[test]
    fn chain_coverage() {
        let chain = Chain {
            id: "c1".into(),
            name: "Hiltl".into(),
            countries: vec!["CH".into()],
            locations_count: 20,
            cities: vec![("CH".into(), "Zurich".into())],
            verified: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(chain.coverage(5), 25.0);
        assert_eq!(chain.coverage(25), 100.0);
    }

    #[test]
    fn merge_links_dedupes() {
        let mut v = DiscoveredVenue::new(
            "Happy Bowl".into(),
            Address {
                city: "Berlin".into(),
                country: "DE".into(),
                ..Default::default()
            },
            OriginTrace::default(),
        );
        let link = DeliveryPlatformLink {
            platform: Platform::Wolt,
            url: "https://wolt.com/a".into(),
            active: None,
        };
        assert!(v.merge_links(std::slice::from_ref(&link)));
        assert!(!v.merge_links(std::slice::from_ref(&link)));
        assert_eq!(v.platform_links.len(), 1);
    }
}
