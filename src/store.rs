//! SQLite + sqlite-vec backed vector store.
//!
//! Chunks and their embeddings live in a plain `chunks` table; the
//! embedding column holds the full float32 vector as a little-endian BLOB.
//! [`VectorStore::finalize`] builds a binary-quantized shadow table
//! (`chunks_qvec`, a vec0 virtual table of `bit[768]` vectors) that serves
//! as the approximate nearest-neighbor index. [`VectorStore::scan`] takes
//! hamming-distance candidates from the shadow table, joins them back to
//! `chunks` (rows deleted since the last quantization simply drop out of
//! the join), and rescores the survivors with exact cosine distance.
//!
//! Quantization is an offline build step: per-batch inserts during a long
//! indexing run never pay its cost. `finalize` runs once per source at the
//! end of ingestion.
//!
//! All SQLite work runs on blocking threads via
//! [`tokio::task::spawn_blocking`]; the embedded store tolerates one
//! writer, so `insert_batch` and `finalize` additionally serialize through
//! an async writer lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};
use thiserror::Error;
use tokio::task::spawn_blocking;
use zerocopy::IntoBytes;

use crate::embedder::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkKind, CodeChunk};

/// Embedding dimensionality. Every vector entering the store must have
/// exactly this many components.
pub const EMBEDDING_DIM: usize = 768;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The sqlite-vec extension could not be registered or exercised.
    /// Fatal to startup.
    #[error("vector extension unavailable: {0}")]
    ExtensionInit(String),

    #[error("sqlite {operation} failed: {cause}")]
    Sqlite { operation: String, cause: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk/embedding count mismatch: {chunks} chunks, {embeddings} embeddings")]
    CountMismatch { chunks: usize, embeddings: usize },

    #[error("store task panicked")]
    TaskJoin,
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn sql_err(operation: &str) -> impl FnOnce(rusqlite::Error) -> StoreError + '_ {
    move |e| StoreError::Sqlite {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

/// A stored chunk row, without its embedding.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub source: String,
    pub file: String,
    pub identifier: String,
    pub kind: ChunkKind,
    pub parent: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
    /// Serializes `insert_batch` and `finalize` so the store sees at most
    /// one writer regardless of how many indexing tasks are active.
    writer: tokio::sync::Mutex<()>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl VectorStore {
    /// Open or create the store at `<dir>/vector.db`.
    ///
    /// Registers the sqlite-vec extension, applies the WAL/busy-timeout
    /// pragmas, creates the schema, and rebuilds the quantized shadow
    /// table when chunk rows already exist (so a fresh process can serve
    /// scans without waiting for the next `finalize`).
    pub fn open(dir: &Path) -> Result<VectorStore> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Sqlite {
            operation: "create data dir".to_string(),
            cause: e.to_string(),
        })?;
        let db_path = dir.join("vector.db");

        // SAFETY: sqlite3_vec_init is the extension entry point exported by
        // the sqlite-vec crate; sqlite3_auto_extension expects it as the C
        // init signature. This is the registration pattern documented by
        // the crate.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut rusqlite::ffi::sqlite3,
                    *mut *mut std::os::raw::c_char,
                    *const rusqlite::ffi::sqlite3_api_routines,
                ) -> std::os::raw::c_int,
            >(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }

        let conn = Connection::open(&db_path).map_err(sql_err("open database"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(sql_err("apply pragmas"))?;

        // Probing the extension up front turns a missing/unloadable binary
        // into a startup failure instead of a mid-query surprise.
        conn.query_row("SELECT vec_version()", [], |_| Ok(()))
            .map_err(|e| StoreError::ExtensionInit(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id          INTEGER PRIMARY KEY,
                source      TEXT NOT NULL,
                file        TEXT NOT NULL,
                identifier  TEXT NOT NULL,
                kind        TEXT NOT NULL,
                parent      TEXT,
                start_line  INTEGER NOT NULL,
                end_line    INTEGER NOT NULL,
                content     TEXT NOT NULL,
                embedding   BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);
            CREATE TABLE IF NOT EXISTS indexed_sources (
                name        TEXT PRIMARY KEY,
                indexed_at  TEXT NOT NULL
            );",
        )
        .map_err(sql_err("create schema"))?;

        let row_count: i64 = conn
            .query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))
            .map_err(sql_err("count chunks"))?;
        if row_count > 0 {
            rebuild_quantized(&conn)?;
        }

        Ok(VectorStore {
            conn: Arc::new(Mutex::new(conn)),
            writer: tokio::sync::Mutex::new(()),
            path: db_path,
        })
    }

    /// Run a closure against the connection on a blocking thread.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn.lock().expect("store mutex poisoned");
            f(&mut guard)
        })
        .await
        .map_err(|_| StoreError::TaskJoin)?
    }

    /// Insert `chunks.len()` rows for one source in a single transaction.
    ///
    /// Does not touch the quantized index; call [`finalize`](Self::finalize)
    /// after the last batch of a source.
    pub async fn insert_batch(
        &self,
        source: &str,
        chunks: Vec<CodeChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<usize> {
        if chunks.len() != embeddings.len() {
            return Err(StoreError::CountMismatch {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
            });
        }
        for embedding in &embeddings {
            if embedding.len() != EMBEDDING_DIM {
                return Err(StoreError::DimensionMismatch {
                    expected: EMBEDDING_DIM,
                    actual: embedding.len(),
                });
            }
        }

        let source = source.to_string();
        let _write = self.writer.lock().await;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err("begin insert batch"))?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO chunks
                         (source, file, identifier, kind, parent, start_line, end_line, content, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )
                    .map_err(sql_err("prepare insert"))?;
                for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
                    stmt.execute(params![
                        source,
                        chunk.file,
                        chunk.identifier,
                        chunk.kind.as_str(),
                        chunk.parent,
                        chunk.start_line as i64,
                        chunk.end_line as i64,
                        chunk.content,
                        vec_to_blob(embedding),
                    ])
                    .map_err(sql_err("insert chunk"))?;
                }
            }
            tx.commit().map_err(sql_err("commit insert batch"))?;
            Ok(chunks.len())
        })
        .await
    }

    /// Rebuild and preload the quantized shadow index. Expensive; called
    /// once per source at the end of ingestion.
    pub async fn finalize(&self) -> Result<()> {
        let _write = self.writer.lock().await;
        self.with_conn(|conn| rebuild_quantized(conn)).await
    }

    pub async fn mark_indexed(&self, source: &str) -> Result<()> {
        let source = source.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO indexed_sources (name, indexed_at) VALUES (?1, ?2)",
                params![source, Utc::now().to_rfc3339()],
            )
            .map_err(sql_err("mark indexed"))?;
            Ok(())
        })
        .await
    }

    pub async fn is_indexed(&self, source: &str) -> Result<bool> {
        let source = source.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM indexed_sources WHERE name = ?1)",
                params![source],
                |r| r.get(0),
            )
            .map_err(sql_err("check indexed"))
        })
        .await
    }

    pub async fn list_indexed(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM indexed_sources ORDER BY name")
                .map_err(sql_err("list indexed"))?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(sql_err("list indexed"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(sql_err("list indexed"))?;
            Ok(names)
        })
        .await
    }

    /// Delete every chunk row and the checkpoint entry for a source.
    ///
    /// The quantized index keeps stale ids until the next `finalize`; the
    /// scan join drops them, so results stay correct.
    pub async fn delete_source(&self, source: &str) -> Result<usize> {
        let source = source.to_string();
        let _write = self.writer.lock().await;
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM chunks WHERE source = ?1", params![source])
                .map_err(sql_err("delete chunks"))?;
            conn.execute(
                "DELETE FROM indexed_sources WHERE name = ?1",
                params![source],
            )
            .map_err(sql_err("delete checkpoint"))?;
            Ok(deleted)
        })
        .await
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))
                .map_err(sql_err("count chunks"))
        })
        .await
    }

    /// Approximate nearest-neighbor scan.
    ///
    /// Takes candidates from the quantized shadow table by hamming
    /// distance, joins them back to `chunks`, applies the optional source
    /// filter, and rescores with exact cosine distance over the stored
    /// float vectors. With a filter the candidate budget is doubled
    /// (`2 * top_k`), the standard post-filter recall safeguard for a
    /// quantized index. Returns `(row, cosine_distance)` tuples in
    /// ascending distance, ties broken by ascending row id, at most
    /// `top_k` of them. An empty store yields an empty list.
    pub async fn scan(
        &self,
        query: Vec<f32>,
        top_k: usize,
        source_filter: Option<Vec<String>>,
    ) -> Result<Vec<(ChunkRow, f32)>> {
        if query.len() != EMBEDDING_DIM {
            return Err(StoreError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: query.len(),
            });
        }

        self.with_conn(move |conn| {
            // vec0 MATCH errors on an empty table; bail early instead.
            let has_rows: bool = conn
                .query_row("SELECT EXISTS(SELECT 1 FROM chunks LIMIT 1)", [], |r| {
                    r.get(0)
                })
                .map_err(sql_err("check store non-empty"))?;
            if !has_rows {
                return Ok(Vec::new());
            }
            let quantized: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'chunks_qvec')",
                    [],
                    |r| r.get(0),
                )
                .map_err(sql_err("check quantized index"))?;
            if !quantized {
                return Ok(Vec::new());
            }

            let candidate_budget = if source_filter.is_some() {
                top_k * 2
            } else {
                top_k
            };

            let mut stmt = conn
                .prepare(
                    "SELECT chunk_id FROM chunks_qvec
                     WHERE embedding MATCH vec_quantize_binary(?1)
                       AND k = ?2",
                )
                .map_err(sql_err("prepare knn scan"))?;
            let candidate_ids = stmt
                .query_map(params![query.as_bytes(), candidate_budget as i64], |r| {
                    r.get::<_, i64>(0)
                })
                .map_err(sql_err("knn scan"))?
                .collect::<std::result::Result<Vec<i64>, _>>()
                .map_err(sql_err("knn scan"))?;
            drop(stmt);

            let mut row_stmt = conn
                .prepare(
                    "SELECT id, source, file, identifier, kind, parent,
                            start_line, end_line, content, embedding
                     FROM chunks WHERE id = ?1",
                )
                .map_err(sql_err("prepare candidate fetch"))?;

            let mut results: Vec<(ChunkRow, f32)> = Vec::new();
            for id in candidate_ids {
                // Stale quantized entries point at deleted rows; skip them.
                let fetched = row_stmt
                    .query_row(params![id], |r| {
                        let kind: String = r.get(4)?;
                        let blob: Vec<u8> = r.get(9)?;
                        Ok((
                            ChunkRow {
                                id: r.get(0)?,
                                source: r.get(1)?,
                                file: r.get(2)?,
                                identifier: r.get(3)?,
                                kind: ChunkKind::parse(&kind),
                                parent: r.get(5)?,
                                start_line: r.get::<_, i64>(6)? as usize,
                                end_line: r.get::<_, i64>(7)? as usize,
                                content: r.get(8)?,
                            },
                            blob,
                        ))
                    })
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(sql_err("fetch candidate")(other)),
                    })?;

                let Some((row, blob)) = fetched else { continue };

                if let Some(ref filter) = source_filter {
                    if !filter.iter().any(|s| s == &row.source) {
                        continue;
                    }
                }

                let stored = blob_to_vec(&blob);
                let distance = 1.0 - cosine_similarity(&query, &stored);
                results.push((row, distance));
            }

            results.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.id.cmp(&b.0.id))
            });
            results.truncate(top_k);
            Ok(results)
        })
        .await
    }
}

/// Drop and rebuild the binary-quantized shadow table from the current
/// `chunks` rows, then preload it with a full-table pass so the first scan
/// does not pay the page-in cost.
fn rebuild_quantized(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS chunks_qvec;
         CREATE VIRTUAL TABLE chunks_qvec USING vec0(
             chunk_id INTEGER PRIMARY KEY,
             embedding bit[{EMBEDDING_DIM}]
         );
         INSERT INTO chunks_qvec (chunk_id, embedding)
             SELECT id, vec_quantize_binary(embedding) FROM chunks;"
    ))
    .map_err(sql_err("rebuild quantized index"))?;

    conn.query_row("SELECT count(*) FROM chunks_qvec", [], |_| Ok(()))
        .map_err(sql_err("preload quantized index"))?;
    Ok(())
}
