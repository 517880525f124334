use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::RepositoryError;
use crate::models::{Listing, ListingKey, ListingStatus, StoredListing};

pub type Result<T> = std::result::Result<T, RepositoryError>;

const LISTING_COLUMNS: &str = "id, source_id, source_name, title, description, price, revenue, ebitda,
     location, industry, url, days_listed, raw_data, status, reasons,
     first_seen_at, updated_at, processed_at";

/// Which listings `reset_status` returns to `new`. The default matches every listing.
#[derive(Debug, Clone, Default)]
pub struct ResetScope {
    pub status: Option<ListingStatus>,
    pub source_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub by_status: BTreeMap<ListingStatus, usize>,
}

impl Stats {
    pub fn count(&self, status: ListingStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "dealscout") {
            proj_dirs.data_dir().join("dealscout.db")
        } else {
            PathBuf::from("dealscout.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                source_name TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                price INTEGER,
                revenue INTEGER,
                ebitda INTEGER,
                location TEXT,
                industry TEXT,
                url TEXT,
                days_listed INTEGER,
                ebitda_margin REAL,
                asking_multiple REAL,
                raw_data TEXT,
                status TEXT NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'prefilter_pass', 'prefilter_fail', 'researching', 'completed')),
                reasons TEXT NOT NULL DEFAULT '[]',
                first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                processed_at TEXT,
                UNIQUE (source_id, source_name)
            );

            CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
            CREATE INDEX IF NOT EXISTS idx_listings_source ON listings(source_name);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='listings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(RepositoryError::NotInitialized);
        }
        Ok(())
    }

    // --- Writes ---

    /// Inserts a first sighting as `new`, or fills empty fields of the stored copy.
    /// Status is never touched for an existing listing.
    pub fn upsert(&self, listing: &Listing) -> Result<(StoredListing, bool)> {
        let tx = self.begin()?;

        let result = match find_by_key(&tx, &listing.key)? {
            None => {
                let metrics = listing.derived_metrics();
                tx.execute(
                    "INSERT INTO listings (source_id, source_name, title, description, price, revenue,
                         ebitda, location, industry, url, days_listed, ebitda_margin, asking_multiple,
                         raw_data, status, reasons)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, '[]')",
                    params![
                        listing.key.source_id,
                        listing.key.source_name,
                        listing.title,
                        listing.description,
                        listing.price,
                        listing.revenue,
                        listing.ebitda,
                        listing.location,
                        listing.industry,
                        listing.url,
                        listing.days_listed,
                        metrics.ebitda_margin,
                        metrics.asking_multiple,
                        json_text(&listing.raw_data)?,
                        ListingStatus::New,
                    ],
                )?;
                let stored = find_by_key(&tx, &listing.key)?
                    .ok_or_else(|| RepositoryError::NotFound(listing.key.clone()))?;
                debug!(key = %listing.key, "inserted listing");
                (stored, true)
            }
            Some(mut stored) => {
                if stored.listing.fill_blanks(listing) {
                    let merged = &stored.listing;
                    let metrics = merged.derived_metrics();
                    tx.execute(
                        "UPDATE listings SET description = ?1, price = ?2, revenue = ?3, ebitda = ?4,
                             location = ?5, industry = ?6, url = ?7, days_listed = ?8,
                             ebitda_margin = ?9, asking_multiple = ?10, raw_data = ?11,
                             updated_at = datetime('now')
                         WHERE id = ?12",
                        params![
                            merged.description,
                            merged.price,
                            merged.revenue,
                            merged.ebitda,
                            merged.location,
                            merged.industry,
                            merged.url,
                            merged.days_listed,
                            metrics.ebitda_margin,
                            metrics.asking_multiple,
                            json_text(&merged.raw_data)?,
                            stored.id,
                        ],
                    )?;
                    stored = find_by_key(&tx, &listing.key)?
                        .ok_or_else(|| RepositoryError::NotFound(listing.key.clone()))?;
                    debug!(key = %listing.key, "filled blank fields on existing listing");
                }
                (stored, false)
            }
        };

        tx.commit()?;
        Ok(result)
    }

    /// Writes a status and its rejection reasons together.
    /// `prefilter_fail` needs at least one reason; every other status needs none.
    pub fn update_status(
        &self,
        key: &ListingKey,
        status: ListingStatus,
        reasons: &[String],
    ) -> Result<()> {
        if status == ListingStatus::PrefilterFail && reasons.is_empty() {
            return Err(RepositoryError::InvariantViolation(format!(
                "{} cannot become {} without a rejection reason",
                key, status
            )));
        }
        if status != ListingStatus::PrefilterFail && !reasons.is_empty() {
            return Err(RepositoryError::InvariantViolation(format!(
                "{} cannot carry rejection reasons in status {}",
                key, status
            )));
        }

        let tx = self.begin()?;
        let current: ListingStatus = tx
            .query_row(
                "SELECT status FROM listings WHERE source_id = ?1 AND source_name = ?2",
                params![key.source_id, key.source_name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(key.clone()))?;

        if !current.can_transition_to(status) {
            return Err(RepositoryError::InvalidTransition {
                key: key.clone(),
                from: current,
                to: status,
            });
        }

        tx.execute(
            "UPDATE listings SET status = ?1, reasons = ?2, processed_at = datetime('now'),
                 updated_at = datetime('now')
             WHERE source_id = ?3 AND source_name = ?4",
            params![
                status,
                serde_json::to_string(reasons)?,
                key.source_id,
                key.source_name
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns matching listings to `new` and clears their reasons.
    pub fn reset_status(&self, scope: &ResetScope) -> Result<usize> {
        let mut sql = String::from(
            "UPDATE listings SET status = 'new', reasons = '[]', processed_at = NULL,
                 updated_at = datetime('now')
             WHERE status != 'new'",
        );
        let mut values: Vec<String> = vec![];

        if let Some(status) = scope.status {
            values.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(source) = &scope.source_name {
            values.push(source.clone());
            sql.push_str(&format!(" AND source_name = ?{}", values.len()));
        }

        let count = self.conn.execute(&sql, params_from_iter(values.iter()))?;
        info!(count, "reset listings to new");
        Ok(count)
    }

    // --- Reads ---

    pub fn get(&self, key: &ListingKey) -> Result<Option<StoredListing>> {
        find_by_key(&self.conn, key)
    }

    /// Listings in a status, oldest first.
    pub fn find_by_status(
        &self,
        status: ListingStatus,
        limit: Option<usize>,
    ) -> Result<Vec<StoredListing>> {
        let sql = format!(
            "SELECT {} FROM listings WHERE status = ?1 ORDER BY id ASC LIMIT ?2",
            LISTING_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status, sql_limit(limit)], row_to_listing)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recently seen listings first, optionally narrowed to one status.
    pub fn list(&self, status: Option<ListingStatus>, limit: Option<usize>) -> Result<Vec<StoredListing>> {
        let mut stmt;
        let rows = match status {
            Some(s) => {
                stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM listings WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                    LISTING_COLUMNS
                ))?;
                stmt.query_map(params![s, sql_limit(limit)], row_to_listing)?
            }
            None => {
                stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM listings ORDER BY id DESC LIMIT ?1",
                    LISTING_COLUMNS
                ))?;
                stmt.query_map(params![sql_limit(limit)], row_to_listing)?
            }
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Source ids already stored for one source, so a fetcher can skip detail pages.
    pub fn known_source_ids(&self, source_name: &str) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source_id FROM listings WHERE source_name = ?1")?;
        let rows = stmt.query_map([source_name], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    pub fn stats(&self) -> Result<Stats> {
        let mut by_status: BTreeMap<ListingStatus, usize> =
            ListingStatus::ALL.iter().map(|s| (*s, 0)).collect();

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM listings GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, ListingStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            by_status.insert(status, count as usize);
        }

        Ok(Stats {
            total: by_status.values().sum(),
            by_status,
        })
    }

    fn begin(&self) -> Result<Transaction<'_>> {
        // IMMEDIATE takes the write lock up front so read-modify-write on one identity is serialized
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

fn find_by_key(conn: &Connection, key: &ListingKey) -> Result<Option<StoredListing>> {
    let sql = format!(
        "SELECT {} FROM listings WHERE source_id = ?1 AND source_name = ?2",
        LISTING_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![key.source_id, key.source_name], row_to_listing)
        .optional()?)
}

fn row_to_listing(row: &rusqlite::Row) -> rusqlite::Result<StoredListing> {
    let raw_data: Option<String> = row.get(12)?;
    let reasons: String = row.get(14)?;

    Ok(StoredListing {
        id: row.get(0)?,
        listing: Listing {
            key: ListingKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            title: row.get(3)?,
            description: row.get(4)?,
            price: row.get(5)?,
            revenue: row.get(6)?,
            ebitda: row.get(7)?,
            location: row.get(8)?,
            industry: row.get(9)?,
            url: row.get(10)?,
            days_listed: row.get(11)?,
            raw_data: raw_data
                .map(|text| parse_json_column(12, &text))
                .transpose()?,
        },
        status: row.get(13)?,
        reasons: parse_json_column(14, &reasons)?,
        first_seen_at: row.get(15)?,
        updated_at: row.get(16)?,
        processed_at: row.get(17)?,
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_text(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

// SQLite treats a negative LIMIT as unbounded
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

impl ToSql for ListingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ListingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        ListingStatus::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown listing status '{}'", text).into()))
    }
}
