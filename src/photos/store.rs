use crate::db::{open_connection, run_migrations};
use crate::photos::model::{
    AiConfidence, MediaType, PageDirection, Photo, PhotoGroup, ReviewStatus, SelectionEntry,
    StoredEmbedding,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub const PHOTOS_COUNT_KEY: &str = "photos:count";
pub const EMBEDDINGS_COUNT_KEY: &str = "embeddings:count";
pub const GROUPS_COUNT_KEY: &str = "groups:count";
pub const LAST_EMBEDDING_TIME_KEY: &str = "last_embedding_time";
pub const SETTINGS_KEY: &str = "settings";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("store initialisation failed: {0}")]
    Init(#[source] anyhow::Error),
    #[error("corrupt {kind} record {key}: {reason}")]
    Corrupt {
        kind: &'static str,
        key: String,
        reason: String,
    },
    #[error("photos missing from store: {0:?}")]
    MissingPhotos(Vec<String>),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Persistent, transactional store for photos, embeddings, groups, the
/// selection set, and metadata counters.
///
/// Every read API is streaming, counted, or paginated; nothing here
/// materialises a whole table. The connection sits behind a mutex so the
/// store can be shared across the UI thread and background pipelines
/// (writers serialise, readers take turns).
pub struct PhotoStore {
    conn: Mutex<Connection>,
}

impl PhotoStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path).map_err(StoreError::Init)?;
        run_migrations(&conn).map_err(StoreError::Init)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn).map_err(StoreError::Init)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ── Photos ────────────────────────────────────────────────────────────────

    /// Upsert a batch of photos in one transaction.
    ///
    /// Existing ids silently overwrite the scraper-owned columns (blob,
    /// media type, dates) and keep `has_embedding`, `group_id`, and the AI
    /// fields, so a re-scan never invalidates pipeline state. Returns the
    /// number of net-new rows; the photos counter moves by exactly that.
    pub fn put_photos(&self, photos: &[Photo]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut net_new = 0usize;
        {
            let mut exists_stmt = tx.prepare("SELECT 1 FROM photos WHERE id = ?1")?;
            let mut upsert_stmt = tx.prepare(
                "INSERT INTO photos
                     (id, blob, media_type, date_taken, timestamp,
                      has_embedding, group_id, ai_reason, ai_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     blob = excluded.blob,
                     media_type = excluded.media_type,
                     date_taken = excluded.date_taken,
                     timestamp = excluded.timestamp",
            )?;
            for photo in photos {
                let exists = exists_stmt
                    .query_row(params![photo.id], |_| Ok(()))
                    .optional()?
                    .is_some();
                upsert_stmt.execute(params![
                    photo.id,
                    photo.blob,
                    photo.media_type.as_str(),
                    photo.date_taken,
                    photo.timestamp,
                    photo.has_embedding,
                    photo.group_id,
                    photo.ai_reason,
                    photo.ai_confidence.map(|c| c.as_str()),
                ])?;
                if !exists {
                    net_new += 1;
                }
            }
        }
        bump_counter(&tx, PHOTOS_COUNT_KEY, net_new as i64)?;
        tx.commit()?;
        Ok(net_new)
    }

    pub fn get_photo(&self, id: &str) -> Result<Option<Photo>, StoreError> {
        let conn = self.conn()?;
        get_photo_inner(&conn, id)
    }

    /// Fetch photos in the order the ids were given; missing ids are omitted.
    pub fn get_photos_by_ids(&self, ids: &[String]) -> Result<Vec<Photo>, StoreError> {
        let conn = self.conn()?;
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(photo) = get_photo_inner(&conn, id)? {
                result.push(photo);
            }
        }
        Ok(result)
    }

    /// Delete photos by id, cascading to their embeddings and selection
    /// entries. Counters move by the deletions actually observed.
    pub fn delete_photos(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted_photos = 0i64;
        let mut deleted_embeddings = 0i64;
        for id in ids {
            deleted_embeddings +=
                tx.execute("DELETE FROM embeddings WHERE photo_id = ?1", params![id])? as i64;
            tx.execute(
                "DELETE FROM selected_photos WHERE photo_id = ?1",
                params![id],
            )?;
            deleted_photos += tx.execute("DELETE FROM photos WHERE id = ?1", params![id])? as i64;
        }
        bump_counter(&tx, PHOTOS_COUNT_KEY, -deleted_photos)?;
        bump_counter(&tx, EMBEDDINGS_COUNT_KEY, -deleted_embeddings)?;
        tx.commit()?;
        Ok(deleted_photos as usize)
    }

    pub fn count_photos(&self) -> Result<i64, StoreError> {
        self.counted("photos", PHOTOS_COUNT_KEY)
    }

    pub fn count_embeddings(&self) -> Result<i64, StoreError> {
        self.counted("embeddings", EMBEDDINGS_COUNT_KEY)
    }

    pub fn count_groups(&self) -> Result<i64, StoreError> {
        self.counted("groups", GROUPS_COUNT_KEY)
    }

    /// Photos still waiting for an embedding. Served by the
    /// `has_embedding` index, not a counter.
    pub fn count_unembedded(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM photos WHERE has_embedding = 0",
            [],
            |row| row.get(0),
        )?)
    }

    /// Counter read with a native COUNT(*) fallback that repairs the
    /// counter when it is missing.
    fn counted(&self, table: &str, key: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        if let Some(value) = read_counter(&conn, key)? {
            return Ok(value);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        write_counter(&conn, key, count)?;
        Ok(count)
    }

    /// Cursor-paginated read over the photo timeline. Descending timestamp
    /// is the gallery's natural ordering; an offset at or past the end
    /// yields an empty batch.
    pub fn page_photos(
        &self,
        offset: u64,
        limit: u64,
        direction: PageDirection,
    ) -> Result<Vec<Photo>, StoreError> {
        let conn = self.conn()?;
        let sql = match direction {
            PageDirection::Descending => {
                "SELECT id, blob, media_type, date_taken, timestamp,
                        has_embedding, group_id, ai_reason, ai_confidence
                 FROM photos ORDER BY timestamp DESC, id DESC LIMIT ?1 OFFSET ?2"
            }
            PageDirection::Ascending => {
                "SELECT id, blob, media_type, date_taken, timestamp,
                        has_embedding, group_id, ai_reason, ai_confidence
                 FROM photos ORDER BY timestamp ASC, id ASC LIMIT ?1 OFFSET ?2"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], photo_from_row)?;
        collect_photos(rows)
    }

    /// Stream every photo in batches of `batch_size`, releasing the
    /// connection between batches so the callback can call back into the
    /// store. Cursor state is the last id seen.
    pub fn for_each_photo_batch<E, F>(&self, batch_size: usize, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[Photo]) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut cursor: Option<String> = None;
        loop {
            let batch = self.photo_batch_after(cursor.as_deref(), batch_size)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = Some(last.id.clone());
            f(&batch)?;
        }
    }

    fn photo_batch_after(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Photo>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, blob, media_type, date_taken, timestamp,
                    has_embedding, group_id, ai_reason, ai_confidence
             FROM photos WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor.unwrap_or(""), limit as i64], photo_from_row)?;
        collect_photos(rows)
    }

    /// Stream photos with `has_embedding = false`, oldest first, for the
    /// embedding queue. The cursor survives flag flips mid-iteration, so
    /// the pipeline can persist as it goes.
    pub fn for_each_unembedded_batch<E, F>(&self, batch_size: usize, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[Photo]) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut cursor: Option<(i64, String)> = None;
        loop {
            let batch = self.unembedded_batch_after(&cursor, batch_size)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = Some((last.timestamp, last.id.clone()));
            f(&batch)?;
        }
    }

    /// Stream photos that already have an embedding, oldest first. The
    /// grouper's find phase iterates in this order so results are
    /// deterministic for a fixed seed and input.
    pub fn for_each_embedded_batch<E, F>(&self, batch_size: usize, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[Photo]) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut cursor: Option<(i64, String)> = None;
        loop {
            let batch = self.flagged_batch_after(&cursor, batch_size, true)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = Some((last.timestamp, last.id.clone()));
            f(&batch)?;
        }
    }

    fn unembedded_batch_after(
        &self,
        cursor: &Option<(i64, String)>,
        limit: usize,
    ) -> Result<Vec<Photo>, StoreError> {
        self.flagged_batch_after(cursor, limit, false)
    }

    fn flagged_batch_after(
        &self,
        cursor: &Option<(i64, String)>,
        limit: usize,
        has_embedding: bool,
    ) -> Result<Vec<Photo>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, blob, media_type, date_taken, timestamp,
                    has_embedding, group_id, ai_reason, ai_confidence
             FROM photos
             WHERE has_embedding = ?4
               AND (timestamp > ?1 OR (timestamp = ?1 AND id > ?2))
             ORDER BY timestamp ASC, id ASC LIMIT ?3",
        )?;
        let (after_ts, after_id) = match cursor {
            Some((ts, id)) => (*ts, id.as_str()),
            None => (i64::MIN, ""),
        };
        let rows = stmt.query_map(
            params![after_ts, after_id, limit as i64, has_embedding],
            photo_from_row,
        )?;
        collect_photos(rows)
    }

    /// Batched `group_id` writes, one transaction per call.
    pub fn assign_group_ids(
        &self,
        assignments: &[(String, Option<String>)],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE photos SET group_id = ?2 WHERE id = ?1")?;
            for (photo_id, group_id) in assignments {
                stmt.execute(params![photo_id, group_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read-modify-write on one photo within a single transaction.
    pub fn update_photo_in_place<M>(&self, id: &str, mutate: M) -> Result<(), StoreError>
    where
        M: FnOnce(&mut Photo),
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(mut photo) = get_photo_inner(&tx, id)? else {
            return Err(StoreError::MissingPhotos(vec![id.to_string()]));
        };
        mutate(&mut photo);
        tx.execute(
            "UPDATE photos SET blob = ?2, media_type = ?3, date_taken = ?4, timestamp = ?5,
                    has_embedding = ?6, group_id = ?7, ai_reason = ?8, ai_confidence = ?9
             WHERE id = ?1",
            params![
                id,
                photo.blob,
                photo.media_type.as_str(),
                photo.date_taken,
                photo.timestamp,
                photo.has_embedding,
                photo.group_id,
                photo.ai_reason,
                photo.ai_confidence.map(|c| c.as_str()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Embeddings ────────────────────────────────────────────────────────────

    /// Persist one embedding and flip the photo's flag in the same
    /// transaction, so a crash never leaves the two out of step.
    pub fn put_embedding(&self, photo_id: &str, vector: &[f32]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE photos SET has_embedding = 1 WHERE id = ?1",
            params![photo_id],
        )?;
        if updated == 0 {
            return Err(StoreError::MissingPhotos(vec![photo_id.to_string()]));
        }
        let existed: bool = tx
            .query_row(
                "SELECT 1 FROM embeddings WHERE photo_id = ?1",
                params![photo_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        tx.execute(
            "INSERT INTO embeddings (photo_id, vector, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(photo_id) DO UPDATE SET
                 vector = excluded.vector, created_at = excluded.created_at",
            params![
                photo_id,
                vector_to_blob(vector),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        if !existed {
            bump_counter(&tx, EMBEDDINGS_COUNT_KEY, 1)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_embedding(&self, photo_id: &str) -> Result<Option<StoredEmbedding>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT photo_id, vector, created_at FROM embeddings WHERE photo_id = ?1",
                params![photo_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((photo_id, blob, created_at)) => Ok(Some(StoredEmbedding {
                vector: blob_to_vector(&blob, &photo_id)?,
                photo_id,
                created_at,
            })),
        }
    }

    /// Stream all embeddings in batches keyed by photo id.
    pub fn for_each_embedding_batch<E, F>(&self, batch_size: usize, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[StoredEmbedding]) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut cursor = String::new();
        loop {
            let batch = self.embedding_batch_after(&cursor, batch_size)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = last.photo_id.clone();
            f(&batch)?;
        }
    }

    fn embedding_batch_after(
        &self,
        cursor: &str,
        limit: usize,
    ) -> Result<Vec<StoredEmbedding>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT photo_id, vector, created_at FROM embeddings
             WHERE photo_id > ?1 ORDER BY photo_id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut batch = Vec::new();
        for row in rows {
            let (photo_id, blob, created_at) = row?;
            batch.push(StoredEmbedding {
                vector: blob_to_vector(&blob, &photo_id)?,
                photo_id,
                created_at,
            });
        }
        Ok(batch)
    }

    /// Reset every `has_embedding` flag in batches, then truncate the
    /// embeddings table. Clears the selection set: a re-index invalidates
    /// any in-flight deletion choices.
    pub fn clear_embeddings(&self) -> Result<(), StoreError> {
        loop {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE photos SET has_embedding = 0 WHERE id IN (
                     SELECT id FROM photos WHERE has_embedding = 1 LIMIT 500)",
                [],
            )?;
            if changed == 0 {
                break;
            }
        }
        let conn = self.conn()?;
        conn.execute("DELETE FROM embeddings", [])?;
        write_counter(&conn, EMBEDDINGS_COUNT_KEY, 0)?;
        conn.execute(
            "DELETE FROM metadata WHERE key = ?1",
            params![LAST_EMBEDDING_TIME_KEY],
        )?;
        drop(conn);
        self.clear_selection()?;
        tracing::info!("clear_embeddings: embeddings dropped, flags reset");
        Ok(())
    }

    // ── Groups ────────────────────────────────────────────────────────────────

    pub fn get_group(&self, id: &str) -> Result<Option<PhotoGroup>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, photo_ids, similarity_score, created_at, review_status
                 FROM groups WHERE id = ?1",
                params![id],
                group_row_parts,
            )
            .optional()?;
        row.map(group_from_parts).transpose()
    }

    /// Upsert groups in one transaction; counter moves by net-new rows.
    pub fn put_groups(&self, groups: &[PhotoGroup]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut net_new = 0usize;
        {
            let mut exists_stmt = tx.prepare("SELECT 1 FROM groups WHERE id = ?1")?;
            let mut upsert_stmt = tx.prepare(
                "INSERT INTO groups (id, photo_ids, similarity_score, created_at, review_status)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     photo_ids = excluded.photo_ids,
                     similarity_score = excluded.similarity_score,
                     created_at = excluded.created_at,
                     review_status = excluded.review_status",
            )?;
            for group in groups {
                let exists = exists_stmt
                    .query_row(params![group.id], |_| Ok(()))
                    .optional()?
                    .is_some();
                let photo_ids = serde_json::to_string(&group.photo_ids).map_err(|e| {
                    StoreError::Corrupt {
                        kind: "group",
                        key: group.id.clone(),
                        reason: e.to_string(),
                    }
                })?;
                upsert_stmt.execute(params![
                    group.id,
                    photo_ids,
                    group.similarity_score as f64,
                    group.created_at,
                    group.review_status.as_str(),
                ])?;
                if !exists {
                    net_new += 1;
                }
            }
        }
        bump_counter(&tx, GROUPS_COUNT_KEY, net_new as i64)?;
        tx.commit()?;
        Ok(net_new)
    }

    pub fn page_groups(
        &self,
        offset: u64,
        limit: u64,
        direction: PageDirection,
    ) -> Result<Vec<PhotoGroup>, StoreError> {
        let conn = self.conn()?;
        let sql = match direction {
            PageDirection::Descending => {
                "SELECT id, photo_ids, similarity_score, created_at, review_status
                 FROM groups ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            }
            PageDirection::Ascending => {
                "SELECT id, photo_ids, similarity_score, created_at, review_status
                 FROM groups ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], group_row_parts)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(group_from_parts(row.map_err(StoreError::from)?)?);
        }
        Ok(result)
    }

    pub fn update_group_in_place<M>(&self, id: &str, mutate: M) -> Result<(), StoreError>
    where
        M: FnOnce(&mut PhotoGroup),
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let parts = tx
            .query_row(
                "SELECT id, photo_ids, similarity_score, created_at, review_status
                 FROM groups WHERE id = ?1",
                params![id],
                group_row_parts,
            )
            .optional()?;
        let Some(parts) = parts else {
            return Err(StoreError::Corrupt {
                kind: "group",
                key: id.to_string(),
                reason: "not found".to_string(),
            });
        };
        let mut group = group_from_parts(parts)?;
        mutate(&mut group);
        let photo_ids =
            serde_json::to_string(&group.photo_ids).map_err(|e| StoreError::Corrupt {
                kind: "group",
                key: id.to_string(),
                reason: e.to_string(),
            })?;
        tx.execute(
            "UPDATE groups SET photo_ids = ?2, similarity_score = ?3,
                    created_at = ?4, review_status = ?5 WHERE id = ?1",
            params![
                id,
                photo_ids,
                group.similarity_score as f64,
                group.created_at,
                group.review_status.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Create a group and point every member photo at it, atomically.
    /// Fails without side effects if any photo id is unknown.
    pub fn atomic_group_create(
        &self,
        photo_ids: &[String],
        similarity: f32,
    ) -> Result<PhotoGroup, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut missing = Vec::new();
        {
            let mut exists_stmt = tx.prepare("SELECT 1 FROM photos WHERE id = ?1")?;
            for id in photo_ids {
                if exists_stmt
                    .query_row(params![id], |_| Ok(()))
                    .optional()?
                    .is_none()
                {
                    missing.push(id.clone());
                }
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingPhotos(missing));
        }
        let group = PhotoGroup {
            id: uuid::Uuid::new_v4().to_string(),
            photo_ids: photo_ids.to_vec(),
            similarity_score: similarity,
            created_at: chrono::Utc::now().timestamp_millis(),
            review_status: ReviewStatus::Pending,
        };
        let encoded = serde_json::to_string(&group.photo_ids).map_err(|e| StoreError::Corrupt {
            kind: "group",
            key: group.id.clone(),
            reason: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO groups (id, photo_ids, similarity_score, created_at, review_status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.id,
                encoded,
                group.similarity_score as f64,
                group.created_at,
                group.review_status.as_str(),
            ],
        )?;
        {
            let mut update_stmt = tx.prepare("UPDATE photos SET group_id = ?1 WHERE id = ?2")?;
            for id in photo_ids {
                update_stmt.execute(params![group.id, id])?;
            }
        }
        bump_counter(&tx, GROUPS_COUNT_KEY, 1)?;
        tx.commit()?;
        Ok(group)
    }

    /// Delete groups by id, nulling the member photos' references first.
    /// Counter moves by the deletions actually observed.
    pub fn delete_groups(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0i64;
        for id in ids {
            tx.execute(
                "UPDATE photos SET group_id = NULL WHERE group_id = ?1",
                params![id],
            )?;
            deleted += tx.execute("DELETE FROM groups WHERE id = ?1", params![id])? as i64;
        }
        bump_counter(&tx, GROUPS_COUNT_KEY, -deleted)?;
        tx.commit()?;
        Ok(deleted as usize)
    }

    /// Null out `group_id` across photos in batches, then drop all groups
    /// and reset the counter. Also clears the selection set, since every
    /// recorded choice referred to the old grouping.
    pub fn clear_groups(&self) -> Result<(), StoreError> {
        loop {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE photos SET group_id = NULL WHERE id IN (
                     SELECT id FROM photos WHERE group_id IS NOT NULL LIMIT 500)",
                [],
            )?;
            if changed == 0 {
                break;
            }
        }
        let conn = self.conn()?;
        conn.execute("DELETE FROM groups", [])?;
        write_counter(&conn, GROUPS_COUNT_KEY, 0)?;
        drop(conn);
        self.clear_selection()?;
        tracing::info!("clear_groups: groups dropped, photo references nulled");
        Ok(())
    }

    /// Full reset: every store and every counter.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM selected_photos", [])?;
        tx.execute("DELETE FROM embeddings", [])?;
        tx.execute("DELETE FROM groups", [])?;
        tx.execute("DELETE FROM photos", [])?;
        tx.execute("DELETE FROM metadata", [])?;
        for key in [PHOTOS_COUNT_KEY, EMBEDDINGS_COUNT_KEY, GROUPS_COUNT_KEY] {
            write_counter(&tx, key, 0)?;
        }
        tx.commit()?;
        tracing::info!("clear_all: store reset");
        Ok(())
    }

    // ── Metadata ──────────────────────────────────────────────────────────────

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Grouping knobs persisted alongside the data they shaped. Absent
    /// until the user first configures them; there is no baked-in default.
    pub fn load_settings(&self) -> Result<Option<crate::photos::model::GroupingSettings>, StoreError> {
        let Some(raw) = self.get_metadata(SETTINGS_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                kind: "settings",
                key: SETTINGS_KEY.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn save_settings(
        &self,
        settings: &crate::photos::model::GroupingSettings,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(settings).map_err(|e| StoreError::Corrupt {
            kind: "settings",
            key: SETTINGS_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.set_metadata(SETTINGS_KEY, &raw)
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    pub fn select(&self, photo_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO selected_photos (photo_id, selected_at) VALUES (?1, ?2)
             ON CONFLICT(photo_id) DO NOTHING",
            params![photo_id, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn unselect(&self, photo_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM selected_photos WHERE photo_id = ?1",
            params![photo_id],
        )?;
        Ok(())
    }

    pub fn is_selected(&self, photo_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT 1 FROM selected_photos WHERE photo_id = ?1",
                params![photo_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn selection_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM selected_photos", [], |row| row.get(0))?)
    }

    /// Page through selections oldest-first by `selected_at`.
    pub fn selection_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SelectionEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT photo_id, selected_at FROM selected_photos
             ORDER BY selected_at ASC, photo_id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            Ok(SelectionEntry {
                photo_id: row.get(0)?,
                selected_at: row.get(1)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Stream the whole selection in batches without ever holding it all.
    pub fn for_each_selection<E, F>(&self, batch_size: usize, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[SelectionEntry]) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut cursor: Option<(i64, String)> = None;
        loop {
            let batch = self.selection_batch_after(&cursor, batch_size)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = Some((last.selected_at, last.photo_id.clone()));
            f(&batch)?;
        }
    }

    fn selection_batch_after(
        &self,
        cursor: &Option<(i64, String)>,
        limit: usize,
    ) -> Result<Vec<SelectionEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT photo_id, selected_at FROM selected_photos
             WHERE (selected_at > ?1 OR (selected_at = ?1 AND photo_id > ?2))
             ORDER BY selected_at ASC, photo_id ASC LIMIT ?3",
        )?;
        let (after_at, after_id) = match cursor {
            Some((at, id)) => (*at, id.as_str()),
            None => (i64::MIN, ""),
        };
        let rows = stmt.query_map(params![after_at, after_id, limit as i64], |row| {
            Ok(SelectionEntry {
                photo_id: row.get(0)?,
                selected_at: row.get(1)?,
            })
        })?;
        let mut batch = Vec::new();
        for row in rows {
            batch.push(row?);
        }
        Ok(batch)
    }

    pub fn clear_selection(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM selected_photos", [])?;
        Ok(())
    }
}

// ── Row mapping and counters ──────────────────────────────────────────────────

fn get_photo_inner(conn: &Connection, id: &str) -> Result<Option<Photo>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, blob, media_type, date_taken, timestamp,
                    has_embedding, group_id, ai_reason, ai_confidence
             FROM photos WHERE id = ?1",
            params![id],
            photo_from_row,
        )
        .optional()?;
    Ok(row)
}

fn photo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Photo> {
    let media_type_str: String = row.get(2)?;
    let confidence_str: Option<String> = row.get(8)?;
    Ok(Photo {
        id: row.get(0)?,
        blob: row.get(1)?,
        media_type: MediaType::parse(&media_type_str).unwrap_or(MediaType::Photo),
        date_taken: row.get(3)?,
        timestamp: row.get(4)?,
        has_embedding: row.get(5)?,
        group_id: row.get(6)?,
        ai_reason: row.get(7)?,
        ai_confidence: confidence_str.as_deref().and_then(AiConfidence::parse),
    })
}

fn collect_photos(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Photo>>,
) -> Result<Vec<Photo>, StoreError> {
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

type GroupRowParts = (String, String, f64, i64, String);

fn group_row_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn group_from_parts(parts: GroupRowParts) -> Result<PhotoGroup, StoreError> {
    let (id, photo_ids_json, similarity, created_at, status) = parts;
    let photo_ids: Vec<String> =
        serde_json::from_str(&photo_ids_json).map_err(|e| StoreError::Corrupt {
            kind: "group",
            key: id.clone(),
            reason: e.to_string(),
        })?;
    let review_status = ReviewStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        kind: "group",
        key: id.clone(),
        reason: format!("unknown review status {status:?}"),
    })?;
    Ok(PhotoGroup {
        id,
        photo_ids,
        similarity_score: similarity as f32,
        created_at,
        review_status,
    })
}

pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub(crate) fn blob_to_vector(blob: &[u8], photo_id: &str) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt {
            kind: "embedding",
            key: photo_id.to_string(),
            reason: format!("blob length {} not a multiple of 4", blob.len()),
        });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn read_counter(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}

fn write_counter(conn: &Connection, key: &str, value: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )?;
    Ok(())
}

fn bump_counter(conn: &Connection, key: &str, delta: i64) -> Result<(), StoreError> {
    if delta == 0 {
        return Ok(());
    }
    let current = read_counter(conn, key)?.unwrap_or(0);
    write_counter(conn, key, (current + delta).max(0))
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::photo;
    use super::*;

    fn store() -> PhotoStore {
        PhotoStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_put_counts_net_new_only() {
        let store = store();
        let net = store
            .put_photos(&[photo("a", 1), photo("b", 2)])
            .unwrap();
        assert_eq!(net, 2);
        assert_eq!(store.count_photos().unwrap(), 2);

        // Second put of "b" overwrites, not inserts.
        let net = store
            .put_photos(&[photo("b", 2), photo("c", 3)])
            .unwrap();
        assert_eq!(net, 1);
        assert_eq!(store.count_photos().unwrap(), 3);
    }

    #[test]
    fn test_overwrite_preserves_pipeline_fields() {
        let store = store();
        store.put_photos(&[photo("a", 1)]).unwrap();
        store.put_embedding("a", &[1.0; 4]).unwrap();

        // Scraper re-delivers the same photo with fresh bytes.
        let mut resent = photo("a", 1);
        resent.blob = vec![1, 2, 3];
        store.put_photos(&[resent]).unwrap();

        let got = store.get_photo("a").unwrap().unwrap();
        assert!(got.has_embedding, "re-scan must not reset the flag");
        assert_eq!(got.blob, vec![1, 2, 3]);
        assert_eq!(store.count_embeddings().unwrap(), 1);
    }

    #[test]
    fn test_get_by_ids_in_order_missing_omitted() {
        let store = store();
        store
            .put_photos(&[photo("a", 1), photo("b", 2), photo("c", 3)])
            .unwrap();
        let got = store
            .get_photos_by_ids(&[
                "c".to_string(),
                "missing".to_string(),
                "a".to_string(),
            ])
            .unwrap();
        let ids: Vec<&str> = got.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_delete_cascades_embedding_and_counters() {
        let store = store();
        store.put_photos(&[photo("a", 1), photo("b", 2)]).unwrap();
        store.put_embedding("a", &[0.5; 4]).unwrap();
        store.select("a").unwrap();

        let deleted = store.delete_photos(&["a".to_string(), "nope".to_string()]).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_photos().unwrap(), 1);
        assert_eq!(store.count_embeddings().unwrap(), 0);
        assert!(store.get_embedding("a").unwrap().is_none());
        assert!(!store.is_selected("a").unwrap());
    }

    #[test]
    fn test_embedding_flag_and_row_stay_in_step() {
        let store = store();
        store.put_photos(&[photo("a", 1)]).unwrap();
        store.put_embedding("a", &[1.0, 0.0]).unwrap();

        let got = store.get_photo("a").unwrap().unwrap();
        assert!(got.has_embedding);
        let emb = store.get_embedding("a").unwrap().unwrap();
        assert_eq!(emb.vector, vec![1.0, 0.0]);

        // Unknown photo refuses the write entirely.
        let err = store.put_embedding("ghost", &[1.0]).unwrap_err();
        assert!(matches!(err, StoreError::MissingPhotos(_)));
        assert_eq!(store.count_embeddings().unwrap(), 1);
    }

    #[test]
    fn test_page_photos_descending_and_past_end() {
        let store = store();
        store
            .put_photos(&[photo("a", 100), photo("b", 300), photo("c", 200)])
            .unwrap();

        let page = store.page_photos(0, 2, PageDirection::Descending).unwrap();
        let ids: Vec<&str> = page.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let page = store.page_photos(2, 2, PageDirection::Descending).unwrap();
        let ids: Vec<&str> = page.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        // Offset at or past the end is an empty batch, not an error.
        assert!(store.page_photos(3, 10, PageDirection::Descending).unwrap().is_empty());
        assert!(store.page_photos(99, 10, PageDirection::Ascending).unwrap().is_empty());
    }

    #[test]
    fn test_for_each_photo_batch_sees_every_row_once() {
        let store = store();
        let photos: Vec<Photo> = (0..25).map(|i| photo(&format!("p{i:03}"), i)).collect();
        store.put_photos(&photos).unwrap();

        let mut seen = Vec::new();
        let mut calls = 0;
        store
            .for_each_photo_batch::<StoreError, _>(10, |batch| {
                calls += 1;
                assert!(batch.len() <= 10);
                seen.extend(batch.iter().map(|p| p.id.clone()));
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(seen.len(), 25);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn test_unembedded_stream_is_oldest_first_and_skips_done() {
        let store = store();
        let mut done = photo("done", 50);
        done.has_embedding = false;
        store
            .put_photos(&[photo("new1", 200), done, photo("new2", 100)])
            .unwrap();
        store.put_embedding("done", &[1.0]).unwrap();

        let mut order = Vec::new();
        store
            .for_each_unembedded_batch::<StoreError, _>(10, |batch| {
                order.extend(batch.iter().map(|p| p.id.clone()));
                Ok(())
            })
            .unwrap();
        assert_eq!(order, vec!["new2".to_string(), "new1".to_string()]);
    }

    #[test]
    fn test_callback_can_write_back_into_store() {
        // The cursor must release the connection between batches so the
        // callback can persist without deadlocking.
        let store = store();
        let photos: Vec<Photo> = (0..8).map(|i| photo(&format!("p{i}"), i)).collect();
        store.put_photos(&photos).unwrap();

        store
            .for_each_unembedded_batch::<StoreError, _>(3, |batch| {
                for p in batch {
                    store.put_embedding(&p.id, &[1.0, 0.0])?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(store.count_embeddings().unwrap(), 8);
        assert_eq!(store.count_unembedded().unwrap(), 0);
    }

    #[test]
    fn test_atomic_group_create_links_members() {
        let store = store();
        store.put_photos(&[photo("a", 1), photo("b", 2)]).unwrap();
        let group = store
            .atomic_group_create(&["a".to_string(), "b".to_string()], 0.9)
            .unwrap();

        assert_eq!(store.count_groups().unwrap(), 1);
        for id in ["a", "b"] {
            let p = store.get_photo(id).unwrap().unwrap();
            assert_eq!(p.group_id.as_deref(), Some(group.id.as_str()));
        }
        let loaded = store.get_group(&group.id).unwrap().unwrap();
        assert_eq!(loaded.photo_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(loaded.review_status, ReviewStatus::Pending);
    }

    #[test]
    fn test_atomic_group_create_fails_atomically_on_missing_photo() {
        let store = store();
        store.put_photos(&[photo("a", 1)]).unwrap();
        let err = store
            .atomic_group_create(&["a".to_string(), "ghost".to_string()], 0.9)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingPhotos(ref ids) if ids == &["ghost".to_string()]));
        assert_eq!(store.count_groups().unwrap(), 0);
        let p = store.get_photo("a").unwrap().unwrap();
        assert_eq!(p.group_id, None);
    }

    #[test]
    fn test_delete_group_unlinks_members() {
        let store = store();
        store
            .put_photos(&[photo("a", 1), photo("b", 2), photo("c", 3), photo("d", 4)])
            .unwrap();
        let keep = store
            .atomic_group_create(&["a".to_string(), "b".to_string()], 0.9)
            .unwrap();
        let doomed = store
            .atomic_group_create(&["c".to_string(), "d".to_string()], 0.9)
            .unwrap();

        let deleted = store.delete_groups(&[doomed.id.clone()]).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_groups().unwrap(), 1);
        assert!(store.get_group(&doomed.id).unwrap().is_none());
        assert_eq!(store.get_photo("c").unwrap().unwrap().group_id, None);
        // The surviving group is untouched.
        assert_eq!(
            store.get_photo("a").unwrap().unwrap().group_id.as_deref(),
            Some(keep.id.as_str())
        );
    }

    #[test]
    fn test_clear_groups_nulls_references_and_resets_counter() {
        let store = store();
        store.put_photos(&[photo("a", 1), photo("b", 2)]).unwrap();
        store
            .atomic_group_create(&["a".to_string(), "b".to_string()], 0.9)
            .unwrap();
        store.select("a").unwrap();

        store.clear_groups().unwrap();

        assert_eq!(store.count_groups().unwrap(), 0);
        assert!(store.page_groups(0, 10, PageDirection::Descending).unwrap().is_empty());
        for id in ["a", "b"] {
            assert_eq!(store.get_photo(id).unwrap().unwrap().group_id, None);
        }
        // Re-grouping invalidates the previous selection.
        assert_eq!(store.selection_count().unwrap(), 0);
    }

    #[test]
    fn test_clear_embeddings_resets_flags_and_counter() {
        let store = store();
        store.put_photos(&[photo("a", 1), photo("b", 2)]).unwrap();
        store.put_embedding("a", &[1.0]).unwrap();
        store.put_embedding("b", &[1.0]).unwrap();

        store.clear_embeddings().unwrap();

        assert_eq!(store.count_embeddings().unwrap(), 0);
        assert_eq!(store.count_unembedded().unwrap(), 2);
        assert!(store.get_embedding("a").unwrap().is_none());
    }

    #[test]
    fn test_update_photo_in_place() {
        let store = store();
        store.put_photos(&[photo("a", 1)]).unwrap();
        store
            .update_photo_in_place("a", |p| {
                p.ai_reason = Some("blurry shot".to_string());
                p.ai_confidence = Some(AiConfidence::High);
            })
            .unwrap();
        let got = store.get_photo("a").unwrap().unwrap();
        assert_eq!(got.ai_reason.as_deref(), Some("blurry shot"));
        assert_eq!(got.ai_confidence, Some(AiConfidence::High));
    }

    #[test]
    fn test_update_group_review_status() {
        let store = store();
        store.put_photos(&[photo("a", 1), photo("b", 2)]).unwrap();
        let group = store
            .atomic_group_create(&["a".to_string(), "b".to_string()], 0.9)
            .unwrap();
        store
            .update_group_in_place(&group.id, |g| g.review_status = ReviewStatus::Reviewed)
            .unwrap();
        let got = store.get_group(&group.id).unwrap().unwrap();
        assert_eq!(got.review_status, ReviewStatus::Reviewed);
    }

    #[test]
    fn test_counter_repair_from_native_count() {
        let store = store();
        store.put_photos(&[photo("a", 1)]).unwrap();
        // Sabotage the counter; the next count must repair from COUNT(*).
        {
            let conn = store.conn().unwrap();
            conn.execute("DELETE FROM metadata WHERE key = 'photos:count'", [])
                .unwrap();
        }
        assert_eq!(store.count_photos().unwrap(), 1);
    }

    #[test]
    fn test_vector_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75, 0.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vector(&blob, "x").unwrap(), v);
        assert!(blob_to_vector(&blob[..3], "x").is_err());
    }

    #[test]
    fn test_clear_all() {
        let store = store();
        store.put_photos(&[photo("a", 1)]).unwrap();
        store.put_embedding("a", &[1.0]).unwrap();
        store.select("a").unwrap();
        store.clear_all().unwrap();
        assert_eq!(store.count_photos().unwrap(), 0);
        assert_eq!(store.count_embeddings().unwrap(), 0);
        assert_eq!(store.count_groups().unwrap(), 0);
        assert_eq!(store.selection_count().unwrap(), 0);
        assert!(store.get_photo("a").unwrap().is_none());
    }

    #[test]
    fn test_metadata_round_trip() {
        let store = store();
        assert_eq!(store.get_metadata("k").unwrap(), None);
        store.set_metadata("k", "v1").unwrap();
        store.set_metadata("k", "v2").unwrap();
        assert_eq!(store.get_metadata("k").unwrap(), Some("v2".to_string()));
    }

    #[test]
    fn test_settings_round_trip_and_absent_by_default() {
        use crate::photos::model::GroupingSettings;
        let store = store();
        assert!(store.load_settings().unwrap().is_none());

        let settings = GroupingSettings::new(0.85, 45, 2).unwrap();
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), Some(settings));
    }
}
