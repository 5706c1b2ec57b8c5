use crate::error::{PhotoError, Result};
use crate::models::{Coordinate, Location, LocationId, NewPhoto, PhotoRecord, PhotoSummary};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

/// Durable mapping from a coordinate to its cached photos and pagination state.
///
/// Every write is all-or-nothing. Operations naming an unknown location fail
/// with [`PhotoError::NotFound`]; storage failures surface as
/// [`PhotoError::StorageError`] and leave the index unchanged.
pub trait LocationPhotoIndex: Send + Sync + 'static {
    /// Creates the location if absent and returns its id. Idempotent.
    fn upsert_location(&self, coordinate: Coordinate) -> Result<LocationId>;

    fn find_location(&self, coordinate: Coordinate) -> Result<Option<Location>>;

    fn get_location(&self, id: LocationId) -> Result<Location>;

    fn list_locations(&self) -> Result<Vec<Location>>;

    /// Raises the stored page count. A smaller count is ignored.
    fn set_page_count(&self, id: LocationId, count: u32) -> Result<()>;

    /// Swaps the whole photo set for `records`.
    fn replace_photos(&self, id: LocationId, records: &[NewPhoto]) -> Result<()>;

    /// Appends `records`. Photos already present keep their position.
    fn add_photos(&self, id: LocationId, records: &[NewPhoto]) -> Result<()>;

    /// `set_page_count` and `replace_photos` as a single transaction.
    fn apply_search_page(&self, id: LocationId, total_pages: u32, records: &[NewPhoto])
        -> Result<()>;

    fn set_image_bytes(&self, id: LocationId, photo_id: &str, bytes: &[u8]) -> Result<()>;

    /// Removes the named photos. Repeated ids count once. Any unknown id fails
    /// the call and nothing is removed.
    fn delete_photos(&self, id: LocationId, photo_ids: &[String]) -> Result<usize>;

    /// Removes the location together with all of its photos.
    fn delete_location(&self, id: LocationId) -> Result<()>;

    /// Photos in insertion order.
    fn list_photos(&self, id: LocationId) -> Result<Vec<PhotoRecord>>;

    /// Same order as `list_photos`, without reading any blob.
    fn list_photo_summaries(&self, id: LocationId) -> Result<Vec<PhotoSummary>>;

    /// Stored bytes of one photo, `None` while it has not been downloaded.
    fn photo_bytes(&self, id: LocationId, photo_id: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Clone)]
pub struct SqliteIndex {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteIndex {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Opening photo index at {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")
        });
        let pool = Pool::new(manager)?;

        let conn = pool.get()?;
        Self::create_tables(&conn)?;

        Ok(Self { pool })
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                page_count INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE (latitude, longitude)
            );

            CREATE TABLE IF NOT EXISTS photos (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id),
                photo_id TEXT NOT NULL,
                image_url TEXT NOT NULL,
                image_bytes BLOB,
                created_at INTEGER NOT NULL,
                UNIQUE (location_id, photo_id)
            );

            CREATE INDEX IF NOT EXISTS idx_photos_location ON photos(location_id);",
        )?;
        Ok(())
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn ensure_location(conn: &Connection, id: LocationId) -> Result<()> {
        let exists = conn
            .query_row("SELECT 1 FROM locations WHERE id = ?1", [id.0], |_| Ok(()))
            .optional()?;
        exists.ok_or_else(|| PhotoError::NotFound(format!("location {} does not exist", id)))
    }

    fn raise_page_count(conn: &Connection, id: LocationId, count: u32) -> Result<()> {
        conn.execute(
            "UPDATE locations SET page_count = ?2
             WHERE id = ?1 AND (page_count IS NULL OR page_count < ?2)",
            params![id.0, count],
        )?;
        Ok(())
    }

    fn insert_photos(conn: &Connection, id: LocationId, records: &[NewPhoto]) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO photos (location_id, photo_id, image_url, image_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (location_id, photo_id) DO UPDATE SET
                image_url = excluded.image_url,
                image_bytes = COALESCE(excluded.image_bytes, photos.image_bytes)",
        )?;
        for record in records {
            stmt.execute(params![
                id.0,
                record.id,
                record.image_url,
                record.image_bytes,
                now
            ])?;
        }
        Ok(())
    }

    fn location_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, f64, f64, Option<u32>, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn build_location(raw: (i64, f64, f64, Option<u32>, i64)) -> Result<Location> {
        let (id, latitude, longitude, page_count, created_at) = raw;
        Ok(Location {
            id: LocationId(id),
            coordinate: Coordinate::new(latitude, longitude),
            page_count,
            created_at: timestamp(created_at)?,
        })
    }
}

fn timestamp(secs: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| PhotoError::StorageError(format!("corrupt timestamp {}: {}", secs, e)))
}

const LOCATION_COLUMNS: &str = "id, latitude, longitude, page_count, created_at";

impl LocationPhotoIndex for SqliteIndex {
    fn upsert_location(&self, coordinate: Coordinate) -> Result<LocationId> {
        coordinate.validate()?;
        let id = self.write(|conn| {
            conn.execute(
                "INSERT INTO locations (latitude, longitude, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (latitude, longitude) DO NOTHING",
                params![
                    coordinate.latitude,
                    coordinate.longitude,
                    OffsetDateTime::now_utc().unix_timestamp()
                ],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM locations WHERE latitude = ?1 AND longitude = ?2",
                params![coordinate.latitude, coordinate.longitude],
                |row| row.get(0),
            )?;
            Ok(LocationId(id))
        })?;
        debug!(location_id = %id, %coordinate, "Upserted location");
        Ok(id)
    }

    fn find_location(&self, coordinate: Coordinate) -> Result<Option<Location>> {
        let conn = self.pool.get()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM locations WHERE latitude = ?1 AND longitude = ?2",
                    LOCATION_COLUMNS
                ),
                params![coordinate.latitude, coordinate.longitude],
                Self::location_from_row,
            )
            .optional()?;
        raw.map(Self::build_location).transpose()
    }

    fn get_location(&self, id: LocationId) -> Result<Location> {
        let conn = self.pool.get()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM locations WHERE id = ?1", LOCATION_COLUMNS),
                [id.0],
                Self::location_from_row,
            )
            .optional()?
            .ok_or_else(|| PhotoError::NotFound(format!("location {} does not exist", id)))?;
        Self::build_location(raw)
    }

    fn list_locations(&self) -> Result<Vec<Location>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM locations ORDER BY id",
            LOCATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], Self::location_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Self::build_location).collect()
    }

    fn set_page_count(&self, id: LocationId, count: u32) -> Result<()> {
        self.write(|conn| {
            Self::ensure_location(conn, id)?;
            Self::raise_page_count(conn, id, count)
        })
    }

    fn replace_photos(&self, id: LocationId, records: &[NewPhoto]) -> Result<()> {
        self.write(|conn| {
            Self::ensure_location(conn, id)?;
            conn.execute("DELETE FROM photos WHERE location_id = ?1", [id.0])?;
            Self::insert_photos(conn, id, records)
        })
    }

    fn add_photos(&self, id: LocationId, records: &[NewPhoto]) -> Result<()> {
        self.write(|conn| {
            Self::ensure_location(conn, id)?;
            Self::insert_photos(conn, id, records)
        })
    }

    fn apply_search_page(
        &self,
        id: LocationId,
        total_pages: u32,
        records: &[NewPhoto],
    ) -> Result<()> {
        self.write(|conn| {
            Self::ensure_location(conn, id)?;
            Self::raise_page_count(conn, id, total_pages)?;
            conn.execute("DELETE FROM photos WHERE location_id = ?1", [id.0])?;
            Self::insert_photos(conn, id, records)
        })
    }

    fn set_image_bytes(&self, id: LocationId, photo_id: &str, bytes: &[u8]) -> Result<()> {
        self.write(|conn| {
            let updated = conn.execute(
                "UPDATE photos SET image_bytes = ?3 WHERE location_id = ?1 AND photo_id = ?2",
                params![id.0, photo_id, bytes],
            )?;
            if updated == 0 {
                Self::ensure_location(conn, id)?;
                return Err(PhotoError::NotFound(format!(
                    "photo {} does not exist at location {}",
                    photo_id, id
                )));
            }
            Ok(())
        })
    }

    fn delete_photos(&self, id: LocationId, photo_ids: &[String]) -> Result<usize> {
        self.write(|conn| {
            Self::ensure_location(conn, id)?;
            let mut stmt = conn
                .prepare_cached("DELETE FROM photos WHERE location_id = ?1 AND photo_id = ?2")?;
            let mut seen = HashSet::new();
            let mut removed = 0;
            for photo_id in photo_ids.iter().filter(|photo_id| seen.insert(photo_id.as_str())) {
                if stmt.execute(params![id.0, photo_id])? == 0 {
                    // dropping the transaction rolls back earlier deletes
                    return Err(PhotoError::NotFound(format!(
                        "photo {} does not exist at location {}",
                        photo_id, id
                    )));
                }
                removed += 1;
            }
            Ok(removed)
        })
    }

    fn delete_location(&self, id: LocationId) -> Result<()> {
        self.write(|conn| {
            Self::ensure_location(conn, id)?;
            let photos = conn.execute("DELETE FROM photos WHERE location_id = ?1", [id.0])?;
            conn.execute("DELETE FROM locations WHERE id = ?1", [id.0])?;
            debug!(location_id = %id, photos, "Deleted location");
            Ok(())
        })
    }

    fn list_photos(&self, id: LocationId) -> Result<Vec<PhotoRecord>> {
        let mut conn = self.pool.get()?;
        // one read transaction so the location check and the listing see the same snapshot
        let tx = conn.transaction()?;
        Self::ensure_location(&tx, id)?;
        let raw = {
            let mut stmt = tx.prepare_cached(
                "SELECT photo_id, image_url, image_bytes, created_at FROM photos
                 WHERE location_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map([id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.finish()?;

        raw.into_iter()
            .map(|(photo_id, image_url, image_bytes, created_at)| {
                Ok(PhotoRecord {
                    id: photo_id,
                    location_id: id,
                    image_url,
                    image_bytes,
                    created_at: timestamp(created_at)?,
                })
            })
            .collect()
    }

    fn list_photo_summaries(&self, id: LocationId) -> Result<Vec<PhotoSummary>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        Self::ensure_location(&tx, id)?;
        let raw = {
            let mut stmt = tx.prepare_cached(
                "SELECT photo_id, image_url, image_bytes IS NOT NULL, created_at FROM photos
                 WHERE location_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map([id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.finish()?;

        raw.into_iter()
            .map(|(photo_id, image_url, has_image, created_at)| {
                Ok(PhotoSummary {
                    id: photo_id,
                    location_id: id,
                    image_url,
                    has_image,
                    created_at: timestamp(created_at)?,
                })
            })
            .collect()
    }

    fn photo_bytes(&self, id: LocationId, photo_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.pool.get()?;
        let found = conn
            .query_row(
                "SELECT image_bytes FROM photos WHERE location_id = ?1 AND photo_id = ?2",
                params![id.0, photo_id],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?;
        match found {
            Some(bytes) => Ok(bytes),
            None => {
                Self::ensure_location(&conn, id)?;
                Err(PhotoError::NotFound(format!(
                    "photo {} does not exist at location {}",
                    photo_id, id
                )))
            }
        }
    }
}
