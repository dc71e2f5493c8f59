//! SQLite-backed [`VectorIndex`] and [`DocumentRegistry`].
//!
//! Both share one WAL-mode pool (see [`crate::db`]). Vectors are stored as
//! little-endian f32 BLOBs in `chunk_vectors` alongside the metadata needed
//! to answer a query without joins; the registry owns `documents` and
//! `chunks`. Multi-statement writes run inside a transaction, so readers on
//! other connections see either the old or the new state of a document.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::embedding::{blob_to_vec, similarity_score, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    document_id_for, now_millis, rank_order, Chunk, ChunkMetadata, Document, DocumentStatus,
    IndexFilter, NewDocument, PipelineStage, VectorEntry, VectorHit,
};

use super::{DocumentRegistry, VectorIndex};

// ============ Vector index ============

/// SQLite implementation of [`VectorIndex`] over the `chunk_vectors` table.
#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn insert_vector(conn: &mut SqliteConnection, entry: &VectorEntry) -> Result<()> {
    let meta = &entry.metadata;
    let tags_json = serde_json::to_string(&meta.tags).map_err(Error::index_write)?;
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, chunk_index, source, text,
                                   category, tags_json, ingested_at, dims, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            chunk_index = excluded.chunk_index,
            source = excluded.source,
            text = excluded.text,
            category = excluded.category,
            tags_json = excluded.tags_json,
            ingested_at = excluded.ingested_at,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&entry.chunk_id)
    .bind(&meta.document_id)
    .bind(meta.chunk_index as i64)
    .bind(&meta.source)
    .bind(&meta.text)
    .bind(&meta.category)
    .bind(tags_json)
    .bind(meta.ingested_at)
    .bind(entry.vector.len() as i64)
    .bind(vec_to_blob(&entry.vector))
    .execute(conn)
    .await
    .map_err(Error::index_write)?;
    Ok(())
}

fn hit_from_row(row: &SqliteRow, query: &[f32]) -> std::result::Result<VectorHit, sqlx::Error> {
    let blob: Vec<u8> = row.try_get("embedding")?;
    let tags_json: String = row.try_get("tags_json")?;
    let chunk_index: i64 = row.try_get("chunk_index")?;
    let vector = blob_to_vec(&blob);
    Ok(VectorHit {
        chunk_id: row.try_get("chunk_id")?,
        score: similarity_score(query, &vector),
        metadata: ChunkMetadata {
            document_id: row.try_get("document_id")?,
            source: row.try_get("source")?,
            chunk_index: chunk_index as usize,
            text: row.try_get("text")?,
            category: row.try_get("category")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            ingested_at: row.try_get("ingested_at")?,
        },
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(Error::index_write)?;
        insert_vector(&mut *conn, entry).await
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(Error::index_write)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(Error::index_write)?;
        Ok(result.rows_affected())
    }

    async fn replace_document(&self, document_id: &str, entries: &[VectorEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::index_write)?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::index_write)?;

        for entry in entries {
            insert_vector(&mut *tx, entry).await?;
        }

        tx.commit().await.map_err(Error::index_write)?;
        Ok(())
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::index_query)?;
        Ok(n as usize)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::index_query)?;
        Ok(n as usize)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<VectorHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, chunk_index, source, text, category,
                   tags_json, ingested_at, embedding
            FROM chunk_vectors
            WHERE dims = ?
              AND (? IS NULL OR document_id = ?)
              AND (? IS NULL OR source = ?)
              AND (? IS NULL OR category = ?)
            "#,
        )
        .bind(vector.len() as i64)
        .bind(&filter.document_id)
        .bind(&filter.document_id)
        .bind(&filter.source)
        .bind(&filter.source)
        .bind(&filter.category)
        .bind(&filter.category)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::index_query)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let hit = hit_from_row(row, vector).map_err(Error::index_query)?;
            if filter.matches(&hit.metadata) {
                hits.push(hit);
            }
        }

        hits.sort_by(rank_order);
        hits.truncate(top_k);
        Ok(hits)
    }
}

// ============ Document registry ============

/// SQLite implementation of [`DocumentRegistry`] over the `documents` and
/// `chunks` tables.
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const DOCUMENT_COLUMNS: &str = "id, source, content_hash, format, size_bytes, status, stage, \
     metadata_json, discovered_at, last_indexed_at, updated_at, error";

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.try_get("status").map_err(Error::registry)?;
    let stage: Option<String> = row.try_get("stage").map_err(Error::registry)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(Error::registry)?;
    let size_bytes: i64 = row.try_get("size_bytes").map_err(Error::registry)?;
    Ok(Document {
        id: row.try_get("id").map_err(Error::registry)?,
        source: row.try_get("source").map_err(Error::registry)?,
        content_hash: row.try_get("content_hash").map_err(Error::registry)?,
        format: row.try_get("format").map_err(Error::registry)?,
        size_bytes: size_bytes.max(0) as u64,
        status: status.parse().map_err(Error::Registry)?,
        stage: stage
            .map(|s| s.parse::<PipelineStage>())
            .transpose()
            .map_err(Error::Registry)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        discovered_at: row.try_get("discovered_at").map_err(Error::registry)?,
        last_indexed_at: row.try_get("last_indexed_at").map_err(Error::registry)?,
        updated_at: row.try_get("updated_at").map_err(Error::registry)?,
        error: row.try_get("error").map_err(Error::registry)?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> std::result::Result<Chunk, sqlx::Error> {
    let int = |name: &str| -> std::result::Result<usize, sqlx::Error> {
        row.try_get::<i64, _>(name).map(|v| v.max(0) as usize)
    };
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: int("chunk_index")?,
        text: row.try_get("text")?,
        start_token: int("start_token")?,
        end_token: int("end_token")?,
        start_byte: int("start_byte")?,
        end_byte: int("end_byte")?,
        overlap_bytes: int("overlap_bytes")?,
        hash: row.try_get("hash")?,
    })
}

async fn replace_chunk_rows(
    conn: &mut SqliteConnection,
    document_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await
        .map_err(Error::registry)?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, text, start_token, end_token,
                                start_byte, end_byte, overlap_bytes, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(document_id)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.text)
        .bind(chunk.start_token as i64)
        .bind(chunk.end_token as i64)
        .bind(chunk.start_byte as i64)
        .bind(chunk.end_byte as i64)
        .bind(chunk.overlap_bytes as i64)
        .bind(&chunk.hash)
        .execute(&mut *conn)
        .await
        .map_err(Error::registry)?;
    }
    Ok(())
}

impl SqliteRegistry {
    async fn fetch_documents(&self, sql: &str, bind: Option<&str>) -> Result<Vec<Document>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(Error::registry)?;
        rows.iter().map(document_from_row).collect()
    }
}

#[async_trait]
impl DocumentRegistry for SqliteRegistry {
    async fn upsert_document(&self, doc: &NewDocument) -> Result<String> {
        let id = document_id_for(&doc.source);
        let now = now_millis();
        let metadata_json = serde_json::to_string(&doc.metadata).map_err(Error::registry)?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source, content_hash, format, size_bytes, status, stage,
                                   metadata_json, discovered_at, updated_at, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(source) DO UPDATE SET
                content_hash = excluded.content_hash,
                format = excluded.format,
                size_bytes = excluded.size_bytes,
                status = excluded.status,
                stage = excluded.stage,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at,
                error = NULL
            "#,
        )
        .bind(&id)
        .bind(&doc.source)
        .bind(&doc.content_hash)
        .bind(&doc.format)
        .bind(doc.size_bytes as i64)
        .bind(DocumentStatus::Processing.as_str())
        .bind(PipelineStage::Discovered.as_str())
        .bind(metadata_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::registry)?;

        Ok(id)
    }

    async fn record_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::registry)?;
        replace_chunk_rows(&mut *tx, document_id, chunks).await?;
        tx.commit().await.map_err(Error::registry)?;
        Ok(())
    }

    async fn mark_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::registry)?;

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?,
                error = ?,
                updated_at = ?,
                stage = CASE WHEN ? = 'deleted' THEN NULL ELSE stage END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_millis())
        .bind(status.as_str())
        .bind(document_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::registry)?;

        if result.rows_affected() == 0 {
            return Err(Error::Registry(format!("unknown document: {}", document_id)));
        }

        if matches!(status, DocumentStatus::Failed | DocumentStatus::Deleted) {
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::registry)?;
        }

        tx.commit().await.map_err(Error::registry)?;
        Ok(())
    }

    async fn set_stage(&self, document_id: &str, stage: PipelineStage) -> Result<()> {
        sqlx::query("UPDATE documents SET stage = ?, updated_at = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(now_millis())
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(Error::registry)?;
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<Document>> {
        let sql = format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS);
        Ok(self
            .fetch_documents(&sql, Some(document_id))
            .await?
            .into_iter()
            .next())
    }

    async fn get_by_source(&self, source: &str) -> Result<Option<Document>> {
        let sql = format!("SELECT {} FROM documents WHERE source = ?", DOCUMENT_COLUMNS);
        Ok(self.fetch_documents(&sql, Some(source)).await?.into_iter().next())
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE content_hash = ? AND status != 'deleted' \
             ORDER BY (status = 'indexed') DESC, discovered_at ASC LIMIT 1",
            DOCUMENT_COLUMNS
        );
        Ok(self
            .fetch_documents(&sql, Some(content_hash))
            .await?
            .into_iter()
            .next())
    }

    async fn list_stale(&self, since: i64) -> Result<Vec<Document>> {
        let sql = format!(
            r#"
            SELECT {} FROM documents
            WHERE status IN ('pending', 'processing', 'failed')
               OR (status = 'indexed' AND (last_indexed_at IS NULL OR last_indexed_at < ?))
            ORDER BY source
            "#,
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::registry)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn commit_indexed(
        &self,
        document_id: &str,
        expected_hash: &str,
        chunks: &[Chunk],
    ) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.map_err(Error::registry)?;

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, stage = ?, error = NULL, last_indexed_at = ?, updated_at = ?
            WHERE id = ? AND content_hash = ?
            "#,
        )
        .bind(DocumentStatus::Indexed.as_str())
        .bind(PipelineStage::Indexed.as_str())
        .bind(now)
        .bind(now)
        .bind(document_id)
        .bind(expected_hash)
        .execute(&mut *tx)
        .await
        .map_err(Error::registry)?;

        if result.rows_affected() == 0 {
            // Dropping `tx` rolls back.
            return Err(Error::RegistryConflict(document_id.to_string()));
        }

        replace_chunk_rows(&mut *tx, document_id, chunks).await?;
        tx.commit().await.map_err(Error::registry)?;
        Ok(())
    }

    async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, text, start_token, end_token,
                   start_byte, end_byte, overlap_bytes, hash
            FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::registry)?;

        rows.iter()
            .map(|row| chunk_from_row(row).map_err(Error::registry))
            .collect()
    }

    async fn status_counts(&self) -> Result<Vec<(DocumentStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::registry)?;

        let mut counts: Vec<(DocumentStatus, u64)> =
            DocumentStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for row in &rows {
            let status: String = row.try_get("status").map_err(Error::registry)?;
            let n: i64 = row.try_get("n").map_err(Error::registry)?;
            let status: DocumentStatus = status.parse().map_err(Error::Registry)?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = n as u64;
            }
        }
        Ok(counts)
    }

    async fn failures(&self) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE status = 'failed' ORDER BY source",
            DOCUMENT_COLUMNS
        );
        self.fetch_documents(&sql, None).await
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let sql = format!("SELECT {} FROM documents ORDER BY source", DOCUMENT_COLUMNS);
        self.fetch_documents(&sql, None).await
    }

    async fn list_by_source_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE instr(source, ?) = 1 ORDER BY source",
            DOCUMENT_COLUMNS
        );
        self.fetch_documents(&sql, Some(prefix)).await
    }
}
