//! Durable plugin catalog backed by sea-orm.
//!
//! One row per plugin id in `plugins`, ratings keyed by (plugin, user) in
//! `plugin_ratings`, download events in `plugin_downloads` and curated
//! groupings in `plugin_collections`. Structured fields are stored as JSON
//! text; decoding never fails a lookup.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{validate_semver, PluginMetadata, PluginType};
use crate::scanner::SecurityScanResult;
use noxpanel_db::entities::{plugin, plugin_collection, plugin_download, plugin_rating};

// ─── Catalog types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    #[default]
    Draft,
    Pending,
    Approved,
    Published,
    Deprecated,
    Archived,
    Rejected,
}

impl PluginStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginStatus::Draft => "draft",
            PluginStatus::Pending => "pending",
            PluginStatus::Approved => "approved",
            PluginStatus::Published => "published",
            PluginStatus::Deprecated => "deprecated",
            PluginStatus::Archived => "archived",
            PluginStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for PluginStatus {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PluginStatus::Draft),
            "pending" => Ok(PluginStatus::Pending),
            "approved" => Ok(PluginStatus::Approved),
            "published" => Ok(PluginStatus::Published),
            "deprecated" => Ok(PluginStatus::Deprecated),
            "archived" => Ok(PluginStatus::Archived),
            "rejected" => Ok(PluginStatus::Rejected),
            other => Err(PluginError::InvalidEntry(format!("unknown status '{other}'"))),
        }
    }
}

/// Usage and rating aggregates. `avg_rating` and `rating_count` are always
/// derived from the ratings table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginStatistics {
    pub download_count: u64,
    pub active_installations: u64,
    pub avg_rating: f64,
    pub rating_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRating {
    pub user_id: String,
    pub rating: u8,
    pub review: String,
    pub helpful_votes: u32,
    pub verified_purchase: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub released_at: DateTime<Utc>,
    #[serde(default)]
    pub changelog: String,
}

/// A catalog entry: metadata plus marketplace-facing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRegistryEntry {
    pub metadata: PluginMetadata,
    pub status: PluginStatus,
    pub publisher_id: String,
    pub category: String,
    pub tags: Vec<String>,
    pub price: f64,
    pub license_type: String,
    pub statistics: PluginStatistics,
    /// Read-only; ratings change through [`PluginRegistry::upsert_rating`].
    pub ratings: Vec<PluginRating>,
    pub security_scan: Option<SecurityScanResult>,
    pub compliance_checks: BTreeMap<String, bool>,
    pub versions: Vec<VersionRecord>,
    pub latest_version: String,
    pub download_url: Option<String>,
    pub package_hash: Option<String>,
    pub package_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl PluginRegistryEntry {
    /// A draft entry for `metadata`, categorised by its plugin type.
    pub fn new(metadata: PluginMetadata, publisher_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: PluginStatus::Draft,
            publisher_id: publisher_id.into(),
            category: metadata.plugin_type.as_str().to_string(),
            tags: Vec::new(),
            price: 0.0,
            license_type: "MIT".to_string(),
            statistics: PluginStatistics::default(),
            ratings: Vec::new(),
            security_scan: None,
            compliance_checks: BTreeMap::new(),
            versions: vec![VersionRecord {
                version: metadata.version.clone(),
                released_at: now,
                changelog: "Initial release".to_string(),
            }],
            latest_version: metadata.version.clone(),
            download_url: None,
            package_hash: None,
            package_size: 0,
            created_at: now,
            updated_at: now,
            published_at: None,
            metadata,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn is_free(&self) -> bool {
        self.price <= 0.0
    }

    /// Required fields and version format.
    pub fn validate(&self) -> PluginResult<()> {
        let meta = &self.metadata;
        if meta.id.trim().is_empty() {
            return Err(PluginError::InvalidEntry("id is required".into()));
        }
        if meta.name.trim().is_empty() {
            return Err(PluginError::InvalidEntry("name is required".into()));
        }
        if meta.version.trim().is_empty() {
            return Err(PluginError::InvalidEntry("version is required".into()));
        }
        if self.publisher_id.trim().is_empty() {
            return Err(PluginError::InvalidEntry("publisher_id is required".into()));
        }
        validate_semver(&meta.version, "version")
            .map_err(|e| PluginError::InvalidEntry(e.to_string()))?;
        if self.price < 0.0 || !self.price.is_finite() {
            return Err(PluginError::InvalidEntry(format!(
                "price must be a non-negative number, got {}",
                self.price
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginCollection {
    pub id: String,
    pub name: String,
    pub description: String,
    pub curator_id: String,
    pub plugin_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Search ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Downloads,
    Rating,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Structured catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub plugin_type: Option<PluginType>,
    pub category: Option<String>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
    pub min_rating: Option<f64>,
    pub max_price: Option<f64>,
    pub free_only: bool,
    /// Status scope; `None` means published only.
    pub status: Option<PluginStatus>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub limit: u64,
    pub offset: u64,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            plugin_type: None,
            category: None,
            tags: Vec::new(),
            min_rating: None,
            max_price: None,
            free_only: false,
            status: None,
            sort_by: SortBy::Relevance,
            sort_order: SortOrder::Desc,
            limit: 20,
            offset: 0,
        }
    }
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub entries: Vec<PluginRegistryEntry>,
    /// Matches before pagination.
    pub total: usize,
}

/// Relevance of an entry for the lower-cased query terms; 0 means no match.
fn relevance(entry: &PluginRegistryEntry, terms: &[String]) -> u32 {
    let name = entry.metadata.name.to_lowercase();
    let id = entry.metadata.id.to_lowercase();
    let description = entry.metadata.description.to_lowercase();
    let category = entry.category.to_lowercase();

    let mut total = 0;
    for term in terms {
        let mut score = 0;
        if name == *term {
            score += 10;
        } else if name.contains(term.as_str()) {
            score += 5;
        }
        if id.contains(term.as_str()) {
            score += 4;
        }
        if category == *term {
            score += 3;
        }
        if entry.tags.iter().any(|t| t.eq_ignore_ascii_case(term)) {
            score += 3;
        }
        if description.contains(term.as_str()) {
            score += 2;
        }
        if score == 0 {
            return 0;
        }
        total += score;
    }
    total
}

// ─── Encoding ───────────────────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> PluginResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON column, falling back to the default on malformed input.
fn decode_or_default<T: DeserializeOwned + Default>(plugin_id: &str, column: &str, raw: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(plugin = %plugin_id, column, "malformed JSON column, using default: {e}");
            T::default()
        }
    }
}

fn decode_metadata(row: &plugin::Model) -> PluginMetadata {
    match serde_json::from_str::<PluginMetadata>(&row.metadata) {
        Ok(mut metadata) => {
            metadata.id.clone_from(&row.id);
            metadata
        }
        Err(e) => {
            tracing::warn!(plugin = %row.id, "malformed metadata column, rebuilding from row: {e}");
            let mut metadata = PluginMetadata::inferred(row.id.clone());
            metadata.name.clone_from(&row.name);
            metadata.version.clone_from(&row.version);
            metadata.description = row.description.clone().unwrap_or_default();
            metadata.plugin_type = row.plugin_type.parse().unwrap_or_default();
            metadata
        }
    }
}

fn decode_scan(row: &plugin::Model) -> Option<SecurityScanResult> {
    let raw = row.security_scan.as_deref()?;
    match serde_json::from_str(raw) {
        Ok(scan) => Some(scan),
        Err(e) => {
            tracing::warn!(plugin = %row.id, "malformed security_scan column, ignoring: {e}");
            None
        }
    }
}

fn rating_from_row(row: plugin_rating::Model) -> PluginRating {
    PluginRating {
        user_id: row.user_id,
        rating: row.rating.clamp(1, 5) as u8,
        review: row.review,
        helpful_votes: row.helpful_votes.max(0) as u32,
        verified_purchase: row.verified_purchase,
        created_at: row.created_at.with_timezone(&Utc),
        updated_at: row.updated_at.with_timezone(&Utc),
    }
}

/// Average and count of a rating set.
pub fn aggregate_ratings(ratings: &[PluginRating]) -> (f64, u64) {
    if ratings.is_empty() {
        return (0.0, 0);
    }
    let sum: u64 = ratings.iter().map(|r| u64::from(r.rating)).sum();
    let count = ratings.len() as u64;
    (sum as f64 / count as f64, count)
}

fn entry_from_row(row: plugin::Model, ratings: Vec<plugin_rating::Model>) -> PluginRegistryEntry {
    let metadata = decode_metadata(&row);
    let mut ratings: Vec<PluginRating> = ratings.into_iter().map(rating_from_row).collect();
    ratings.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let mut statistics: PluginStatistics = decode_or_default(&row.id, "statistics", &row.statistics);
    let (avg_rating, rating_count) = aggregate_ratings(&ratings);
    statistics.avg_rating = avg_rating;
    statistics.rating_count = rating_count;

    let status = row.status.parse::<PluginStatus>().unwrap_or_else(|_| {
        tracing::warn!(plugin = %row.id, status = %row.status, "unknown status, treating as draft");
        PluginStatus::Draft
    });

    PluginRegistryEntry {
        status,
        security_scan: decode_scan(&row),
        tags: decode_or_default(&row.id, "tags", &row.tags),
        compliance_checks: decode_or_default(&row.id, "compliance_checks", &row.compliance_checks),
        versions: decode_or_default(&row.id, "versions", &row.versions),
        statistics,
        ratings,
        metadata,
        publisher_id: row.publisher_id,
        category: row.category,
        price: row.price,
        license_type: row.license_type,
        latest_version: row.latest_version,
        download_url: row.download_url,
        package_hash: row.package_hash,
        package_size: row.package_size.max(0) as u64,
        created_at: row.created_at.with_timezone(&Utc),
        updated_at: row.updated_at.with_timezone(&Utc),
        published_at: row.published_at.map(|t| t.with_timezone(&Utc)),
    }
}

fn collection_from_row(row: plugin_collection::Model) -> PluginCollection {
    PluginCollection {
        plugin_ids: decode_or_default(&row.id, "plugin_ids", &row.plugin_ids),
        id: row.id,
        name: row.name,
        description: row.description,
        curator_id: row.curator_id,
        created_at: row.created_at.with_timezone(&Utc),
        updated_at: row.updated_at.with_timezone(&Utc),
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Catalog of plugins, their ratings, downloads and collections.
pub struct PluginRegistry {
    db: DatabaseConnection,
    /// Per-plugin locks serializing read-modify-write of a catalog row.
    /// Holds only ids with an operation in flight.
    row_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").finish_non_exhaustive()
    }
}

impl PluginRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn row_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        // Entries referenced only by the map are idle.
        locks.retain(|key, lock| key == id || Arc::strong_count(lock) > 1);
        locks.entry(id.to_string()).or_default().clone()
    }

    async fn find_row<C: ConnectionTrait>(conn: &C, id: &str) -> PluginResult<plugin::Model> {
        plugin::Entity::find_by_id(id.to_string())
            .one(conn)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    async fn load_entry<C: ConnectionTrait>(conn: &C, row: plugin::Model) -> PluginResult<PluginRegistryEntry> {
        let ratings = plugin_rating::Entity::find()
            .filter(plugin_rating::Column::PluginId.eq(row.id.clone()))
            .all(conn)
            .await?;
        Ok(entry_from_row(row, ratings))
    }

    /// Load entries for many rows with one ratings query.
    async fn load_entries(&self, rows: Vec<plugin::Model>) -> PluginResult<Vec<PluginRegistryEntry>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut by_plugin: HashMap<String, Vec<plugin_rating::Model>> = HashMap::new();
        for rating in plugin_rating::Entity::find()
            .filter(plugin_rating::Column::PluginId.is_in(ids))
            .all(&self.db)
            .await?
        {
            by_plugin.entry(rating.plugin_id.clone()).or_default().push(rating);
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                let ratings = by_plugin.remove(&row.id).unwrap_or_default();
                entry_from_row(row, ratings)
            })
            .collect())
    }

    // ── Catalog CRUD ────────────────────────────────────────────────────

    /// Add an entry to the catalog. Re-registering an existing id updates it.
    pub async fn register(&self, entry: PluginRegistryEntry) -> PluginResult<PluginRegistryEntry> {
        entry.validate()?;
        let id = entry.id().to_string();
        let lock = self.row_lock(&id).await;
        let _guard = lock.lock().await;

        if plugin::Entity::find_by_id(id.clone()).one(&self.db).await?.is_some() {
            tracing::debug!(plugin = %id, "plugin already registered, updating");
            return self.update_locked(entry).await;
        }

        let now = Utc::now().fixed_offset();
        let published_at = (entry.status == PluginStatus::Published).then_some(now);
        let mut statistics = entry.statistics.clone();
        statistics.avg_rating = 0.0;
        statistics.rating_count = 0;

        let versions = if entry.versions.is_empty() {
            vec![VersionRecord {
                version: entry.metadata.version.clone(),
                released_at: Utc::now(),
                changelog: String::new(),
            }]
        } else {
            entry.versions.clone()
        };

        let row = plugin::ActiveModel {
            id: Set(id.clone()),
            name: Set(entry.metadata.name.clone()),
            version: Set(entry.metadata.version.clone()),
            description: Set(Some(entry.metadata.description.clone())),
            plugin_type: Set(entry.metadata.plugin_type.as_str().to_string()),
            status: Set(entry.status.as_str().to_string()),
            publisher_id: Set(entry.publisher_id.clone()),
            category: Set(entry.category.clone()),
            tags: Set(encode(&entry.tags)?),
            price: Set(entry.price),
            license_type: Set(entry.license_type.clone()),
            metadata: Set(encode(&entry.metadata)?),
            statistics: Set(encode(&statistics)?),
            security_scan: Set(entry.security_scan.as_ref().map(encode).transpose()?),
            compliance_checks: Set(encode(&entry.compliance_checks)?),
            versions: Set(encode(&versions)?),
            latest_version: Set(entry.metadata.version.clone()),
            download_url: Set(entry.download_url.clone()),
            package_hash: Set(entry.package_hash.clone()),
            package_size: Set(entry.package_size as i64),
            created_at: Set(now),
            updated_at: Set(now),
            published_at: Set(published_at),
        };
        let row = row.insert(&self.db).await?;

        tracing::info!(
            plugin = %id,
            version = %entry.metadata.version,
            publisher = %entry.publisher_id,
            "plugin registered"
        );
        Self::load_entry(&self.db, row).await
    }

    /// Replace the mutable fields of an existing entry.
    pub async fn update(&self, entry: PluginRegistryEntry) -> PluginResult<PluginRegistryEntry> {
        entry.validate()?;
        let lock = self.row_lock(entry.id()).await;
        let _guard = lock.lock().await;
        self.update_locked(entry).await
    }

    async fn update_locked(&self, entry: PluginRegistryEntry) -> PluginResult<PluginRegistryEntry> {
        let id = entry.id().to_string();
        let existing = Self::find_row(&self.db, &id).await?;
        let current = Self::load_entry(&self.db, existing.clone()).await?;

        let mut versions = entry.versions.clone();
        if !versions.iter().any(|v| v.version == entry.metadata.version) {
            versions.push(VersionRecord {
                version: entry.metadata.version.clone(),
                released_at: Utc::now(),
                changelog: String::new(),
            });
        }

        // Aggregates stay derived from the ratings table.
        let mut statistics = entry.statistics.clone();
        statistics.avg_rating = current.statistics.avg_rating;
        statistics.rating_count = current.statistics.rating_count;

        let now = Utc::now().fixed_offset();
        let published_at = match (existing.published_at, entry.status) {
            (Some(at), _) => Some(at),
            (None, PluginStatus::Published) => Some(now),
            (None, _) => None,
        };

        let mut row: plugin::ActiveModel = existing.into();
        row.name = Set(entry.metadata.name.clone());
        row.version = Set(entry.metadata.version.clone());
        row.description = Set(Some(entry.metadata.description.clone()));
        row.plugin_type = Set(entry.metadata.plugin_type.as_str().to_string());
        row.status = Set(entry.status.as_str().to_string());
        row.publisher_id = Set(entry.publisher_id.clone());
        row.category = Set(entry.category.clone());
        row.tags = Set(encode(&entry.tags)?);
        row.price = Set(entry.price);
        row.license_type = Set(entry.license_type.clone());
        row.metadata = Set(encode(&entry.metadata)?);
        row.statistics = Set(encode(&statistics)?);
        row.security_scan = Set(entry.security_scan.as_ref().map(encode).transpose()?);
        row.compliance_checks = Set(encode(&entry.compliance_checks)?);
        row.versions = Set(encode(&versions)?);
        row.latest_version = Set(entry.metadata.version.clone());
        row.download_url = Set(entry.download_url.clone());
        row.package_hash = Set(entry.package_hash.clone());
        row.package_size = Set(entry.package_size as i64);
        row.updated_at = Set(now);
        row.published_at = Set(published_at);
        let row = row.update(&self.db).await?;

        tracing::info!(plugin = %id, version = %entry.metadata.version, "plugin updated");
        Self::load_entry(&self.db, row).await
    }

    pub async fn get(&self, id: &str) -> PluginResult<Option<PluginRegistryEntry>> {
        match plugin::Entity::find_by_id(id.to_string()).one(&self.db).await? {
            Some(row) => Ok(Some(Self::load_entry(&self.db, row).await?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing id is an error.
    pub async fn require(&self, id: &str) -> PluginResult<PluginRegistryEntry> {
        self.get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Every entry, optionally restricted to one status, ordered by id.
    pub async fn list(&self, status: Option<PluginStatus>) -> PluginResult<Vec<PluginRegistryEntry>> {
        let mut query = plugin::Entity::find().order_by_asc(plugin::Column::Id);
        if let Some(status) = status {
            query = query.filter(plugin::Column::Status.eq(status.as_str()));
        }
        let rows = query.all(&self.db).await?;
        self.load_entries(rows).await
    }

    /// Move an entry through the publication workflow.
    pub async fn set_status(&self, id: &str, status: PluginStatus) -> PluginResult<PluginRegistryEntry> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let existing = Self::find_row(&self.db, id).await?;
        let now = Utc::now().fixed_offset();
        let stamp_published = status == PluginStatus::Published && existing.published_at.is_none();

        let mut row: plugin::ActiveModel = existing.into();
        row.status = Set(status.as_str().to_string());
        row.updated_at = Set(now);
        if stamp_published {
            row.published_at = Set(Some(now));
        }
        let row = row.update(&self.db).await?;

        tracing::info!(plugin = %id, status = status.as_str(), "plugin status changed");
        Self::load_entry(&self.db, row).await
    }

    pub async fn store_scan_result(&self, id: &str, scan: &SecurityScanResult) -> PluginResult<()> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let existing = Self::find_row(&self.db, id).await?;
        let mut row: plugin::ActiveModel = existing.into();
        row.security_scan = Set(Some(encode(scan)?));
        row.updated_at = Set(Utc::now().fixed_offset());
        row.update(&self.db).await?;

        tracing::info!(plugin = %id, score = scan.score, status = ?scan.status, "scan result stored");
        Ok(())
    }

    // ── Ratings ─────────────────────────────────────────────────────────

    /// Insert or overwrite `user_id`'s rating and recompute the aggregate
    /// from the full rating set.
    pub async fn upsert_rating(
        &self,
        id: &str,
        user_id: &str,
        rating: i32,
        review: &str,
    ) -> PluginResult<PluginStatistics> {
        if !(1..=5).contains(&rating) {
            return Err(PluginError::InvalidRating(rating));
        }
        if user_id.trim().is_empty() {
            return Err(PluginError::InvalidEntry("user_id is required".into()));
        }

        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let txn = self.db.begin().await?;
        let existing = Self::find_row(&txn, id).await?;
        let now = Utc::now().fixed_offset();

        match plugin_rating::Entity::find_by_id((id.to_string(), user_id.to_string()))
            .one(&txn)
            .await?
        {
            Some(current) => {
                let mut row: plugin_rating::ActiveModel = current.into();
                row.rating = Set(rating);
                row.review = Set(review.to_string());
                row.updated_at = Set(now);
                row.update(&txn).await?;
            }
            None => {
                plugin_rating::ActiveModel {
                    plugin_id: Set(id.to_string()),
                    user_id: Set(user_id.to_string()),
                    rating: Set(rating),
                    review: Set(review.to_string()),
                    helpful_votes: Set(0),
                    verified_purchase: Set(false),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        let ratings: Vec<PluginRating> = plugin_rating::Entity::find()
            .filter(plugin_rating::Column::PluginId.eq(id.to_string()))
            .all(&txn)
            .await?
            .into_iter()
            .map(rating_from_row)
            .collect();
        let (avg_rating, rating_count) = aggregate_ratings(&ratings);

        let mut statistics: PluginStatistics =
            decode_or_default(id, "statistics", &existing.statistics);
        statistics.avg_rating = avg_rating;
        statistics.rating_count = rating_count;

        let mut row: plugin::ActiveModel = existing.into();
        row.statistics = Set(encode(&statistics)?);
        row.updated_at = Set(now);
        row.update(&txn).await?;
        txn.commit().await?;

        tracing::info!(
            plugin = %id,
            user = %user_id,
            rating,
            avg_rating,
            rating_count,
            "rating recorded"
        );
        Ok(statistics)
    }

    // ── Downloads ───────────────────────────────────────────────────────

    /// Record a download event and count a new installation.
    pub async fn record_download(&self, id: &str, user_id: Option<&str>) -> PluginResult<PluginStatistics> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let existing = Self::find_row(&self.db, id).await?;
        let now = Utc::now().fixed_offset();

        plugin_download::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            plugin_id: Set(id.to_string()),
            user_id: Set(user_id.map(str::to_string)),
            version: Set(existing.latest_version.clone()),
            downloaded_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        let mut statistics: PluginStatistics =
            decode_or_default(id, "statistics", &existing.statistics);
        statistics.download_count += 1;
        statistics.active_installations += 1;
        self.write_statistics(existing, &statistics).await?;

        tracing::debug!(plugin = %id, downloads = statistics.download_count, "download recorded");
        Ok(statistics)
    }

    /// Count one fewer active installation.
    pub async fn record_uninstall(&self, id: &str) -> PluginResult<PluginStatistics> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let existing = Self::find_row(&self.db, id).await?;
        let mut statistics: PluginStatistics =
            decode_or_default(id, "statistics", &existing.statistics);
        statistics.active_installations = statistics.active_installations.saturating_sub(1);
        self.write_statistics(existing, &statistics).await?;
        Ok(statistics)
    }

    /// Download events for a plugin, newest first.
    pub async fn downloads(&self, id: &str, limit: usize) -> PluginResult<Vec<plugin_download::Model>> {
        let rows = plugin_download::Entity::find()
            .filter(plugin_download::Column::PluginId.eq(id.to_string()))
            .order_by_desc(plugin_download::Column::DownloadedAt)
            .limit(limit as u64)
            .all(&self.db)
            .await?;
        Ok(rows)
    }

    async fn write_statistics(&self, existing: plugin::Model, statistics: &PluginStatistics) -> PluginResult<()> {
        let mut row: plugin::ActiveModel = existing.into();
        row.statistics = Set(encode(statistics)?);
        row.update(&self.db).await?;
        Ok(())
    }

    // ── Search ──────────────────────────────────────────────────────────

    pub async fn search(&self, query: &SearchQuery) -> PluginResult<SearchResults> {
        let status = query.status.unwrap_or(PluginStatus::Published);
        let mut select = plugin::Entity::find().filter(plugin::Column::Status.eq(status.as_str()));
        if let Some(plugin_type) = query.plugin_type {
            select = select.filter(plugin::Column::PluginType.eq(plugin_type.as_str()));
        }
        if let Some(ref category) = query.category {
            select = select.filter(plugin::Column::Category.eq(category.clone()));
        }
        if query.free_only {
            select = select.filter(plugin::Column::Price.lte(0.0));
        }
        if let Some(max_price) = query.max_price {
            select = select.filter(plugin::Column::Price.lte(max_price));
        }
        let rows = select.all(&self.db).await?;
        let entries = self.load_entries(rows).await?;

        let terms: Vec<String> = query
            .text
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let mut scored: Vec<(u32, PluginRegistryEntry)> = entries
            .into_iter()
            .filter(|e| {
                query
                    .tags
                    .iter()
                    .all(|tag| e.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
            })
            .filter(|e| {
                query
                    .min_rating
                    .map_or(true, |min| e.statistics.avg_rating >= min)
            })
            .filter_map(|e| {
                if terms.is_empty() {
                    return Some((0, e));
                }
                match relevance(&e, &terms) {
                    0 => None,
                    score => Some((score, e)),
                }
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            let ordering = match query.sort_by {
                SortBy::Relevance => sa
                    .cmp(sb)
                    .then(a.statistics.download_count.cmp(&b.statistics.download_count)),
                SortBy::Downloads => a.statistics.download_count.cmp(&b.statistics.download_count),
                SortBy::Rating => a
                    .statistics
                    .avg_rating
                    .total_cmp(&b.statistics.avg_rating)
                    .then(a.statistics.rating_count.cmp(&b.statistics.rating_count)),
                SortBy::Updated => a.updated_at.cmp(&b.updated_at),
            };
            let ordering = match query.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.metadata.id.cmp(&b.metadata.id))
        });

        let total = scored.len();
        let entries = scored
            .into_iter()
            .map(|(_, e)| e)
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect();

        Ok(SearchResults { entries, total })
    }

    // ── Collections ─────────────────────────────────────────────────────

    pub async fn create_collection(
        &self,
        name: &str,
        description: &str,
        curator_id: &str,
        plugin_ids: Vec<String>,
    ) -> PluginResult<PluginCollection> {
        if name.trim().is_empty() {
            return Err(PluginError::InvalidEntry("collection name is required".into()));
        }
        let now = Utc::now().fixed_offset();
        let row = plugin_collection::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            name: Set(name.to_string()),
            description: Set(description.to_string()),
            curator_id: Set(curator_id.to_string()),
            plugin_ids: Set(encode(&plugin_ids)?),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        tracing::info!(collection = %name, plugins = plugin_ids.len(), "collection created");
        Ok(collection_from_row(row))
    }

    /// Look a collection up by id or by name.
    pub async fn get_collection(&self, id_or_name: &str) -> PluginResult<Option<PluginCollection>> {
        let row = plugin_collection::Entity::find()
            .filter(
                plugin_collection::Column::Id
                    .eq(id_or_name.to_string())
                    .or(plugin_collection::Column::Name.eq(id_or_name.to_string())),
            )
            .one(&self.db)
            .await?;
        Ok(row.map(collection_from_row))
    }

    pub async fn add_to_collection(&self, collection_id: &str, plugin_id: &str) -> PluginResult<PluginCollection> {
        let row = plugin_collection::Entity::find_by_id(collection_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| PluginError::NotFound(format!("collection {collection_id}")))?;

        let mut plugin_ids: Vec<String> = decode_or_default(&row.id, "plugin_ids", &row.plugin_ids);
        if !plugin_ids.iter().any(|p| p == plugin_id) {
            plugin_ids.push(plugin_id.to_string());
        }

        let mut active: plugin_collection::ActiveModel = row.into();
        active.plugin_ids = Set(encode(&plugin_ids)?);
        active.updated_at = Set(Utc::now().fixed_offset());
        let row = active.update(&self.db).await?;
        Ok(collection_from_row(row))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
