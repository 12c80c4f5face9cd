//! SQLite-backed store for staging and production collections.
//!
//! Every entity is persisted as a JSON document alongside the columns the
//! engine queries on (status, country, chain, coordinates, normalized
//! URLs). WAL mode keeps reads cheap while runs write. A single connection
//! behind a parking_lot mutex is plenty: the write path is the discovery /
//! extraction runs and the review queue, none of which are hot.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::models::{
    normalize_delivery_url, Chain, ChangeLogEntry, DiscoveredDish, DiscoveredVenue,
    DiscoveryStrategy, ProductionDish, ProductionStatus, ProductionVenue, SearchCredential,
    SyncHistoryRecord, VenueStatus,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS discovered_venues (
    id             TEXT PRIMARY KEY,
    name_lower     TEXT NOT NULL,
    city_lower     TEXT NOT NULL,
    country        TEXT NOT NULL,
    chain_id       TEXT,
    status         TEXT NOT NULL,
    needs_review   INTEGER NOT NULL DEFAULT 0,
    confidence     REAL NOT NULL DEFAULT 0,
    updated_at     TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    doc            TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_dv_status ON discovered_venues(status, country);
CREATE INDEX IF NOT EXISTS idx_dv_chain ON discovered_venues(chain_id) WHERE chain_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_dv_created ON discovered_venues(created_at);
CREATE INDEX IF NOT EXISTS idx_dv_city ON discovered_venues(country, city_lower);

-- Normalized platform URLs, one row per link, for dedup and the
-- duplicate-URL reject rule.
CREATE TABLE IF NOT EXISTS venue_links (
    venue_id       TEXT NOT NULL REFERENCES discovered_venues(id) ON DELETE CASCADE,
    platform       TEXT NOT NULL,
    normalized_url TEXT NOT NULL,
    PRIMARY KEY (venue_id, normalized_url)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_links_url ON venue_links(normalized_url);

CREATE TABLE IF NOT EXISTS discovered_dishes (
    id           TEXT PRIMARY KEY,
    venue_id     TEXT NOT NULL,
    status       TEXT NOT NULL,
    needs_review INTEGER NOT NULL DEFAULT 0,
    product_tag  TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    doc          TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_dd_venue ON discovered_dishes(venue_id);
CREATE INDEX IF NOT EXISTS idx_dd_status ON discovered_dishes(status);

CREATE TABLE IF NOT EXISTS production_venues (
    id            TEXT PRIMARY KEY,
    country       TEXT NOT NULL,
    chain_id      TEXT,
    status        TEXT NOT NULL,
    lat           REAL NOT NULL,
    lng           REAL NOT NULL,
    last_verified TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    doc           TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_pv_status ON production_venues(status, country);
CREATE INDEX IF NOT EXISTS idx_pv_coords ON production_venues(lat, lng);
CREATE INDEX IF NOT EXISTS idx_pv_chain ON production_venues(chain_id) WHERE chain_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS production_dishes (
    id          TEXT PRIMARY KEY,
    venue_id    TEXT NOT NULL,
    status      TEXT NOT NULL,
    product_tag TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    doc         TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_pd_venue ON production_dishes(venue_id);
CREATE INDEX IF NOT EXISTS idx_pd_product ON production_dishes(product_tag);

CREATE TABLE IF NOT EXISTS discovery_strategies (
    id              TEXT PRIMARY KEY,
    country         TEXT NOT NULL,
    platform        TEXT,
    uses            INTEGER NOT NULL DEFAULT 0,
    successes       INTEGER NOT NULL DEFAULT 0,
    false_positives INTEGER NOT NULL DEFAULT 0,
    deprecated      INTEGER NOT NULL DEFAULT 0,
    doc             TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_strat_country ON discovery_strategies(country, deprecated);

CREATE TABLE IF NOT EXISTS search_credentials (
    id  TEXT PRIMARY KEY,
    doc TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS chains (
    id       TEXT PRIMARY KEY,
    name     TEXT NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    doc      TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_chains_name ON chains(name);

CREATE TABLE IF NOT EXISTS sync_history (
    id        TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    doc       TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS change_logs (
    id          TEXT PRIMARY KEY,
    timestamp   TEXT NOT NULL,
    collection  TEXT NOT NULL,
    document_id TEXT NOT NULL,
    action      TEXT NOT NULL,
    doc         TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_cl_doc ON change_logs(collection, document_id, timestamp);

CREATE TABLE IF NOT EXISTS system_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

-- Named advisory locks for mutually-exclusive operations (sync execute).
CREATE TABLE IF NOT EXISTS advisory_locks (
    name        TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    acquired_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub const SCHEMA_VERSION: u32 = 1;

/// Thread-safe handle over the SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Filters for review-queue listing.
#[derive(Debug, Clone, Default)]
pub struct ReviewFilter {
    pub country: Option<String>,
    pub platform: Option<String>,
    pub chain_id: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: usize,
    pub offset: usize,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating database directory")?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite at {path}"))?;
        Self::init(conn, path)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, path: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        conn.execute(
            "INSERT INTO system_metadata (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO NOTHING",
            params![SCHEMA_VERSION.to_string()],
        )?;
        info!(path, "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── staging venues ──────────────────────────────────────────────

    pub fn upsert_venue(&self, venue: &DiscoveredVenue) -> Result<()> {
        let doc = serde_json::to_string(venue)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO discovered_venues
                 (id, name_lower, city_lower, country, chain_id, status, needs_review,
                  confidence, updated_at, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 name_lower = excluded.name_lower,
                 city_lower = excluded.city_lower,
                 country = excluded.country,
                 chain_id = excluded.chain_id,
                 status = excluded.status,
                 needs_review = excluded.needs_review,
                 confidence = excluded.confidence,
                 updated_at = excluded.updated_at,
                 doc = excluded.doc",
            params![
                venue.id,
                venue.name.trim().to_lowercase(),
                venue.address.city.trim().to_lowercase(),
                venue.address.country,
                venue.chain_id,
                venue.status.as_str(),
                venue.needs_review as i64,
                venue.confidence_score,
                venue.updated_at.to_rfc3339(),
                venue.created_at.to_rfc3339(),
                doc,
            ],
        )?;

        // Keep the link index in sync with the document.
        conn.execute(
            "DELETE FROM venue_links WHERE venue_id = ?1",
            params![venue.id],
        )?;
        for link in &venue.platform_links {
            if let Some(normalized) = normalize_delivery_url(&link.url) {
                conn.execute(
                    "INSERT OR IGNORE INTO venue_links (venue_id, platform, normalized_url)
                     VALUES (?1, ?2, ?3)",
                    params![venue.id, link.platform.as_str(), normalized],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_venue(&self, id: &str) -> Result<Option<DiscoveredVenue>> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM discovered_venues WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).context("venue doc"))
            .transpose()
    }

    /// Dedup lookup by `(name_lowercase, city_lowercase)`; the caller then
    /// matches the normalized URL against the candidate's links.
    pub fn find_venues_by_name_city(
        &self,
        name_lower: &str,
        city_lower: &str,
    ) -> Result<Vec<DiscoveredVenue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM discovered_venues
             WHERE name_lower = ?1 AND city_lower = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![name_lower, city_lower], |row| {
            row.get::<_, String>(0)
        })?;
        let mut venues = Vec::new();
        for doc in rows {
            venues.push(serde_json::from_str(&doc?)?);
        }
        Ok(venues)
    }

    /// Venues (any status except the excluded one) holding a link with
    /// this normalized URL.
    pub fn venue_ids_with_url(
        &self,
        normalized_url: &str,
        exclude_status: Option<VenueStatus>,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT v.id, v.status FROM venue_links l
             JOIN discovered_venues v ON v.id = l.venue_id
             WHERE l.normalized_url = ?1
             ORDER BY v.id",
        )?;
        let rows = stmt.query_map(params![normalized_url], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut ids = Vec::new();
        for row in rows {
            let (id, status) = row?;
            if let Some(excluded) = exclude_status {
                if status == excluded.as_str() {
                    continue;
                }
            }
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn list_venues_by_status(&self, status: VenueStatus) -> Result<Vec<DiscoveredVenue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM discovered_venues WHERE status = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
        let mut venues = Vec::new();
        for doc in rows {
            venues.push(serde_json::from_str(&doc?)?);
        }
        Ok(venues)
    }

    /// Paginated review queue: venues still `discovered` that the
    /// auto-verifier flagged for a human.
    pub fn list_pending_review(&self, filter: &ReviewFilter) -> Result<Vec<DiscoveredVenue>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT DISTINCT v.doc, v.confidence, v.id FROM discovered_venues v
             LEFT JOIN venue_links l ON l.venue_id = v.id
             WHERE v.status = 'discovered' AND v.needs_review = 1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(country) = &filter.country {
            args.push(Box::new(country.clone()));
            sql.push_str(&format!(" AND v.country = ?{}", args.len()));
        }
        if let Some(chain) = &filter.chain_id {
            args.push(Box::new(chain.clone()));
            sql.push_str(&format!(" AND v.chain_id = ?{}", args.len()));
        }
        if let Some(min) = filter.min_confidence {
            args.push(Box::new(min));
            sql.push_str(&format!(" AND v.confidence >= ?{}", args.len()));
        }
        if let Some(platform) = &filter.platform {
            args.push(Box::new(platform.clone()));
            sql.push_str(&format!(" AND l.platform = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY v.confidence DESC, v.id");
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, filter.offset));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get::<_, String>(0),
        )?;
        let mut venues = Vec::new();
        for doc in rows {
            venues.push(serde_json::from_str(&doc?)?);
        }
        Ok(venues)
    }

    /// Discovered-venue counts per city for one country (tier-3 input).
    pub fn venue_counts_by_city(&self, country: &str) -> Result<Vec<(String, u32)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT city_lower, COUNT(*) FROM discovered_venues
             WHERE country = ?1 AND status != 'rejected'
             GROUP BY city_lower",
        )?;
        let rows = stmt.query_map(params![country], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Covered (discovered or promoted) venue count per chain, and the
    /// covered city set, for tier-1 planning.
    pub fn chain_coverage_counts(&self, chain_id: &str) -> Result<(u32, Vec<String>)> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM discovered_venues
             WHERE chain_id = ?1 AND status != 'rejected'",
            params![chain_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT city_lower FROM discovered_venues
             WHERE chain_id = ?1 AND status != 'rejected'",
        )?;
        let rows = stmt.query_map(params![chain_id], |row| row.get::<_, String>(0))?;
        let mut cities = Vec::new();
        for row in rows {
            cities.push(row?);
        }
        Ok((count, cities))
    }

    /// Venues eligible for extraction: discovered or verified, with at
    /// least one platform link, outside the failure cooldown.
    pub fn venues_pending_extraction(
        &self,
        cooldown: Duration,
        limit: usize,
    ) -> Result<Vec<DiscoveredVenue>> {
        let cutoff = (Utc::now() - cooldown).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM discovered_venues
             WHERE status IN ('discovered', 'verified')
             ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![(limit * 4) as i64], |row| row.get::<_, String>(0))?;
        let mut venues: Vec<DiscoveredVenue> = Vec::new();
        for doc in rows {
            let venue: DiscoveredVenue = serde_json::from_str(&doc?)?;
            if venue.platform_links.is_empty() {
                continue;
            }
            // Three consecutive failures park the venue for the cooldown.
            if venue.extraction_failures >= 3 {
                let last = venue
                    .last_extraction_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                if last.as_str() > cutoff.as_str() {
                    continue;
                }
            }
            venues.push(venue);
            if venues.len() >= limit {
                break;
            }
        }
        Ok(venues)
    }

    // ── staging dishes ──────────────────────────────────────────────

    pub fn upsert_dish(&self, dish: &DiscoveredDish) -> Result<()> {
        let doc = serde_json::to_string(dish)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO discovered_dishes
                 (id, venue_id, status, needs_review, product_tag, updated_at, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 needs_review = excluded.needs_review,
                 product_tag = excluded.product_tag,
                 updated_at = excluded.updated_at,
                 doc = excluded.doc",
            params![
                dish.id,
                dish.venue_id,
                dish.status.as_str(),
                dish.needs_review as i64,
                dish.product_tag.as_str(),
                dish.updated_at.to_rfc3339(),
                dish.created_at.to_rfc3339(),
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn get_dish(&self, id: &str) -> Result<Option<DiscoveredDish>> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM discovered_dishes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).context("dish doc"))
            .transpose()
    }

    pub fn dishes_for_venue(&self, venue_id: &str) -> Result<Vec<DiscoveredDish>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM discovered_dishes WHERE venue_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![venue_id], |row| row.get::<_, String>(0))?;
        let mut dishes = Vec::new();
        for doc in rows {
            dishes.push(serde_json::from_str(&doc?)?);
        }
        Ok(dishes)
    }

    /// Pre-aggregated (total, verified) dish counts per venue: one query
    /// for the whole id set, never per venue.
    pub fn dish_counts_by_venue(&self, venue_ids: &[String]) -> Result<Vec<(String, u32, u32)>> {
        if venue_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=venue_ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT venue_id, COUNT(*),
                    SUM(CASE WHEN status = 'verified' THEN 1 ELSE 0 END)
             FROM discovered_dishes
             WHERE venue_id IN ({placeholders})
             GROUP BY venue_id"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(venue_ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    // ── production ──────────────────────────────────────────────────

    pub fn upsert_production_venue(&self, venue: &ProductionVenue) -> Result<()> {
        let doc = serde_json::to_string(venue)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO production_venues
                 (id, country, chain_id, status, lat, lng, last_verified, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 country = excluded.country,
                 chain_id = excluded.chain_id,
                 status = excluded.status,
                 lat = excluded.lat,
                 lng = excluded.lng,
                 last_verified = excluded.last_verified,
                 doc = excluded.doc",
            params![
                venue.id,
                venue.address.country,
                venue.chain_id,
                venue.status.as_str(),
                venue.coordinates.lat,
                venue.coordinates.lng,
                venue.last_verified.to_rfc3339(),
                venue.created_at.to_rfc3339(),
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn get_production_venue(&self, id: &str) -> Result<Option<ProductionVenue>> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM production_venues WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).context("production venue doc"))
            .transpose()
    }

    pub fn list_production_venues(&self) -> Result<Vec<ProductionVenue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT doc FROM production_venues ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut venues = Vec::new();
        for doc in rows {
            venues.push(serde_json::from_str(&doc?)?);
        }
        Ok(venues)
    }

    /// Bounding-box prefilter for the nearby query; the caller applies the
    /// exact haversine cut afterwards.
    pub fn production_venues_in_bbox(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
    ) -> Result<Vec<ProductionVenue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM production_venues
             WHERE status != 'archived'
               AND lat BETWEEN ?1 AND ?2
               AND lng BETWEEN ?3 AND ?4
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![min_lat, max_lat, min_lng, max_lng], |row| {
            row.get::<_, String>(0)
        })?;
        let mut venues = Vec::new();
        for doc in rows {
            venues.push(serde_json::from_str(&doc?)?);
        }
        Ok(venues)
    }

    pub fn upsert_production_dish(&self, dish: &ProductionDish) -> Result<()> {
        let doc = serde_json::to_string(dish)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO production_dishes
                 (id, venue_id, status, product_tag, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 product_tag = excluded.product_tag,
                 doc = excluded.doc",
            params![
                dish.id,
                dish.venue_id,
                dish.status.as_str(),
                dish.product_tag.as_str(),
                dish.created_at.to_rfc3339(),
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn production_dishes_for_venue(&self, venue_id: &str) -> Result<Vec<ProductionDish>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM production_dishes WHERE venue_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![venue_id], |row| row.get::<_, String>(0))?;
        let mut dishes = Vec::new();
        for doc in rows {
            dishes.push(serde_json::from_str(&doc?)?);
        }
        Ok(dishes)
    }

    /// Promote one venue atomically: production insert + staging flip in a
    /// single transaction.
    pub fn promote_venue_txn(
        &self,
        production: &ProductionVenue,
        staged: &DiscoveredVenue,
    ) -> Result<()> {
        let prod_doc = serde_json::to_string(production)?;
        let staged_doc = serde_json::to_string(staged)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO production_venues
                 (id, country, chain_id, status, lat, lng, last_verified, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                production.id,
                production.address.country,
                production.chain_id,
                production.status.as_str(),
                production.coordinates.lat,
                production.coordinates.lng,
                production.last_verified.to_rfc3339(),
                production.created_at.to_rfc3339(),
                prod_doc,
            ],
        )?;
        tx.execute(
            "UPDATE discovered_venues
             SET status = ?2, updated_at = ?3, doc = ?4
             WHERE id = ?1",
            params![
                staged.id,
                staged.status.as_str(),
                staged.updated_at.to_rfc3339(),
                staged_doc,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Promote one dish atomically, mirroring `promote_venue_txn`.
    pub fn promote_dish_txn(
        &self,
        production: &ProductionDish,
        staged: &DiscoveredDish,
    ) -> Result<()> {
        let prod_doc = serde_json::to_string(production)?;
        let staged_doc = serde_json::to_string(staged)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO production_dishes
                 (id, venue_id, status, product_tag, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                production.id,
                production.venue_id,
                production.status.as_str(),
                production.product_tag.as_str(),
                production.created_at.to_rfc3339(),
                prod_doc,
            ],
        )?;
        tx.execute(
            "UPDATE discovered_dishes
             SET status = ?2, updated_at = ?3, doc = ?4
             WHERE id = ?1",
            params![
                staged.id,
                staged.status.as_str(),
                staged.updated_at.to_rfc3339(),
                staged_doc,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── strategies ──────────────────────────────────────────────────

    pub fn upsert_strategy(&self, strategy: &DiscoveryStrategy) -> Result<()> {
        let doc = serde_json::to_string(strategy)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO discovery_strategies
                 (id, country, platform, uses, successes, false_positives, deprecated, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 country = excluded.country,
                 platform = excluded.platform,
                 uses = excluded.uses,
                 successes = excluded.successes,
                 false_positives = excluded.false_positives,
                 deprecated = excluded.deprecated,
                 doc = excluded.doc",
            params![
                strategy.id,
                strategy.country,
                strategy.platform.map(|p| p.as_str()),
                strategy.uses as i64,
                strategy.successes as i64,
                strategy.false_positives as i64,
                strategy.deprecated as i64,
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn get_strategy(&self, id: &str) -> Result<Option<DiscoveryStrategy>> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM discovery_strategies WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).context("strategy doc"))
            .transpose()
    }

    pub fn list_strategies(&self) -> Result<Vec<DiscoveryStrategy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT doc FROM discovery_strategies ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut strategies = Vec::new();
        for doc in rows {
            strategies.push(serde_json::from_str(&doc?)?);
        }
        Ok(strategies)
    }

    // ── credentials ─────────────────────────────────────────────────

    pub fn load_credentials(&self) -> Result<Vec<SearchCredential>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT doc FROM search_credentials ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut credentials = Vec::new();
        for doc in rows {
            credentials.push(serde_json::from_str(&doc?)?);
        }
        Ok(credentials)
    }

    pub fn save_credential(&self, credential: &SearchCredential) -> Result<()> {
        let doc = serde_json::to_string(credential)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO search_credentials (id, doc) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
            params![credential.id, doc],
        )?;
        Ok(())
    }

    // ── chains ──────────────────────────────────────────────────────

    pub fn upsert_chain(&self, chain: &Chain) -> Result<()> {
        let doc = serde_json::to_string(chain)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chains (id, name, verified, doc) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 verified = excluded.verified,
                 doc = excluded.doc",
            params![chain.id, chain.name, chain.verified as i64, doc],
        )?;
        Ok(())
    }

    pub fn list_chains(&self, verified_only: bool) -> Result<Vec<Chain>> {
        let conn = self.conn.lock();
        let sql = if verified_only {
            "SELECT doc FROM chains WHERE verified = 1 ORDER BY id"
        } else {
            "SELECT doc FROM chains ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut chains = Vec::new();
        for doc in rows {
            chains.push(serde_json::from_str(&doc?)?);
        }
        Ok(chains)
    }

    pub fn get_chain(&self, id: &str) -> Result<Option<Chain>> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM chains WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).context("chain doc"))
            .transpose()
    }

    pub fn find_chain_by_name(&self, name: &str) -> Result<Option<Chain>> {
        let chains = self.list_chains(false)?;
        Ok(chains
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim())))
    }

    // ── sync history / change log ───────────────────────────────────

    pub fn insert_sync_history(&self, record: &SyncHistoryRecord) -> Result<()> {
        let doc = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_history (id, timestamp, doc) VALUES (?1, ?2, ?3)",
            params![record.id, record.timestamp.to_rfc3339(), doc],
        )?;
        Ok(())
    }

    pub fn list_sync_history(&self, limit: usize) -> Result<Vec<SyncHistoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM sync_history ORDER BY timestamp DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for doc in rows {
            records.push(serde_json::from_str(&doc?)?);
        }
        Ok(records)
    }

    /// Append-only; there is deliberately no update or delete path.
    pub fn append_change_log(&self, entry: &ChangeLogEntry) -> Result<()> {
        let doc = serde_json::to_string(entry)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO change_logs (id, timestamp, collection, document_id, action, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.timestamp.to_rfc3339(),
                entry.collection,
                entry.document_id,
                entry.action.as_str(),
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn change_log_for(&self, collection: &str, document_id: &str) -> Result<Vec<ChangeLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT doc FROM change_logs
             WHERE collection = ?1 AND document_id = ?2
             ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(params![collection, document_id], |row| {
            row.get::<_, String>(0)
        })?;
        let mut entries = Vec::new();
        for doc in rows {
            entries.push(serde_json::from_str(&doc?)?);
        }
        Ok(entries)
    }

    // ── system metadata / advisory locks ────────────────────────────

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM system_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Take a named lock, or learn who holds it. Stale locks (older than
    /// one hour) are broken: a crashed process must not wedge sync forever.
    pub fn try_acquire_lock(&self, name: &str, holder: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT holder, acquired_at FROM advisory_locks WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((current_holder, acquired_at)) = existing {
            let stale = DateTime::parse_from_rfc3339(&acquired_at)
                .map(|t| now - t.with_timezone(&Utc) > Duration::hours(1))
                .unwrap_or(true);
            if !stale {
                debug!(name, holder = %current_holder, "advisory lock busy");
                return Ok(false);
            }
            conn.execute("DELETE FROM advisory_locks WHERE name = ?1", params![name])?;
        }

        conn.execute(
            "INSERT INTO advisory_locks (name, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![name, holder, now.to_rfc3339()],
        )?;
        Ok(true)
    }

    pub fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM advisory_locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }

    /// Counts for /health and the CLI summary.
    pub fn collection_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let tables = [
            "discovered_venues",
            "discovered_dishes",
            "production_venues",
            "production_dishes",
            "discovery_strategies",
            "chains",
            "sync_history",
            "change_logs",
        ];
        let mut counts = Vec::new();
        for table in tables {
            let count: u64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            counts.push((table.to_string(), count));
        }
        Ok(counts)
    }
}

/// Apply the staleness rule to every production venue. Returns the ids
/// that transitioned, paired with their new status.
pub fn apply_staleness(
    store: &Store,
    now: DateTime<Utc>,
) -> Result<Vec<(String, ProductionStatus)>> {
    let mut transitions = Vec::new();
    for mut venue in store.list_production_venues()? {
        let age = now - venue.last_verified;
        let next = match venue.status {
            ProductionStatus::Active if age > Duration::days(30) => Some(ProductionStatus::Archived),
            ProductionStatus::Active if age > Duration::days(7) => Some(ProductionStatus::Stale),
            ProductionStatus::Stale if age > Duration::days(30) => Some(ProductionStatus::Archived),
            _ => None,
        };
        if let Some(next) = next {
            venue.status = next;
            venue.updated_at = now;
            store.upsert_production_venue(&venue)?;
            transitions.push((venue.id.clone(), next));
        }
    }
    Ok(transitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, Coordinates, HoursSource, OriginTrace, Platform};

    fn venue(name: &str, city: &str, url: &str) -> DiscoveredVenue {
        let mut v = DiscoveredVenue::new(
            name.to_string(),
            Address {
                street: None,
                city: city.to_string(),
                postal_code: None,
                country: "CH".to_string(),
            },
            OriginTrace::default(),
        );
        v.platform_links.push(crate::models::DeliveryPlatformLink {
            platform: Platform::Wolt,
            url: url.to_string(),
            active: None,
        });
        v
    }

    #[test]
    fn venue_round_trip_and_url_index() {
        let store = Store::open_in_memory().unwrap();
        let v = venue("Happy Bowl", "Zurich", "https://wolt.com/ch/zur/happy-bowl");
        store.upsert_venue(&v).unwrap();

        let loaded = store.get_venue(&v.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Happy Bowl");

        let ids = store
            .venue_ids_with_url("wolt.com/ch/zur/happy-bowl", None)
            .unwrap();
        assert_eq!(ids, vec![v.id.clone()]);

        // Rejected venues can be excluded from duplicate checks.
        let ids = store
            .venue_ids_with_url("wolt.com/ch/zur/happy-bowl", Some(VenueStatus::Discovered))
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn dish_counts_pre_aggregated() {
        let store = Store::open_in_memory().unwrap();
        let v = venue("A", "Zurich", "https://wolt.com/a");
        store.upsert_venue(&v).unwrap();
        for i in 0..3 {
            let mut d = DiscoveredDish::new(
                v.id.clone(),
                format!("dish-{i}"),
                crate::models::ProductTag::PlantedChicken,
            );
            if i == 0 {
                d.status = VenueStatus::Verified;
            }
            store.upsert_dish(&d).unwrap();
        }
        let counts = store.dish_counts_by_venue(&[v.id.clone()]).unwrap();
        assert_eq!(counts, vec![(v.id, 3, 1)]);
    }

    #[test]
    fn advisory_lock_mutual_exclusion() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.try_acquire_lock("sync", "op-1").unwrap());
        assert!(!store.try_acquire_lock("sync", "op-2").unwrap());
        store.release_lock("sync", "op-1").unwrap();
        assert!(store.try_acquire_lock("sync", "op-2").unwrap());
    }

    #[test]
    fn staleness_transitions() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mk = |id: &str, days_old: i64, status: ProductionStatus| ProductionVenue {
            id: id.to_string(),
            name: id.to_string(),
            venue_type: "restaurant".to_string(),
            address: Address {
                city: "Zurich".into(),
                country: "CH".into(),
                ..Default::default()
            },
            coordinates: Coordinates { lat: 47.37, lng: 8.54 },
            platform_links: Vec::new(),
            chain_id: None,
            opening_hours: crate::models::default_opening_hours(),
            hours_source: HoursSource::Default,
            delivery_zones: Vec::new(),
            last_verified: now - Duration::days(days_old),
            status,
            created_at: now,
            updated_at: now,
        };
        store.upsert_production_venue(&mk("fresh", 1, ProductionStatus::Active)).unwrap();
        store.upsert_production_venue(&mk("aging", 10, ProductionStatus::Active)).unwrap();
        store.upsert_production_venue(&mk("old", 40, ProductionStatus::Active)).unwrap();
        store.upsert_production_venue(&mk("stale-old", 35, ProductionStatus::Stale)).unwrap();

        let mut transitions = apply_staleness(&store, now).unwrap();
        transitions.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            transitions,
            vec![
                ("aging".to_string(), ProductionStatus::Stale),
                ("old".to_string(), ProductionStatus::Archived),
                ("stale-old".to_string(), ProductionStatus::Archived),
            ]
        );
    }

    #[test]
    fn change_log_append_and_read() {
        let store = Store::open_in_memory().unwrap();
        let entry = ChangeLogEntry::new(
            crate::models::ChangeAction::Verified,
            "discovered_venues",
            "v-1",
            crate::models::ChangeSource::Scraper,
            "auto-verifier",
        );
        store.append_change_log(&entry).unwrap();
        let read = store.change_log_for("discovered_venues", "v-1").unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].actor, "auto-verifier");
    }
}
