//! Output store: append-only byte artifacts on disk, addressed by opaque id.
//!
//! Every execution's captured output lands here as an artifact (one file per
//! artifact under a configured root). Artifacts are the pipeline substrate:
//! a later execution can name an `output_id` as its stdin source and the
//! supervisor streams the bytes in. Readers open their own file handles, so
//! an artifact can be read while the owning execution is still appending --
//! a reader always observes a prefix of the final content.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Artifacts newer than this many hours are never auto-cleaned by default.
const DEFAULT_CLEANUP_AGE_HOURS: u64 = 24;

/// `preserve_recent` default: the newest N artifacts survive auto-cleanup.
const DEFAULT_PRESERVE_RECENT: usize = 10;

/// The stream or origin an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Stdout,
    Stderr,
    Combined,
    Log,
}

/// Metadata for one stored artifact.
#[derive(Debug, Clone, Serialize)]
pub struct OutputArtifact {
    pub output_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    /// On-disk size in bytes.
    pub size: u64,
    /// Originating execution, empty for manually created artifacts.
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`OutputStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub execution_id: Option<String>,
    pub kind: Option<ArtifactKind>,
    pub limit: usize,
    pub offset: usize,
}

/// A suggestion produced by [`OutputStore::cleanup_suggestions`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanupSuggestion {
    pub output_id: String,
    pub reason: String,
    pub size: u64,
    pub age_hours: f64,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub preserved: usize,
    pub reclaimed_bytes: u64,
    pub dry_run: bool,
}

/// Per-id outcome of a delete request.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub output_id: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The content-addressed output store.
#[derive(Clone)]
pub struct OutputStore {
    root: PathBuf,
    index: Arc<Mutex<HashMap<String, OutputArtifact>>>,
}

impl OutputStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Files already present under the root are left alone; they surface as
    /// stale-file warnings in cleanup suggestions rather than being adopted
    /// or removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            ServiceError::system(
                "STORE_INIT_FAILED",
                format!("cannot create output root '{}': {e}", root.display()),
            )
        })?;
        Ok(Self {
            root,
            index: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn path_for(&self, output_id: &str) -> PathBuf {
        self.root.join(format!("{output_id}.out"))
    }

    /// Create a new artifact and return an append handle for its writer.
    pub async fn create(
        &self,
        execution_id: Option<&str>,
        kind: ArtifactKind,
        name: Option<String>,
    ) -> Result<AppendHandle> {
        let output_id = format!("out-{}", uuid::Uuid::new_v4());
        let path = self.path_for(&output_id);
        let file = tokio::fs::File::create(&path).await.map_err(|e| {
            ServiceError::system(
                "STORE_CREATE_FAILED",
                format!("cannot create artifact file '{}': {e}", path.display()),
            )
        })?;

        let artifact = OutputArtifact {
            output_id: output_id.clone(),
            kind,
            name: name.unwrap_or_else(|| output_id.clone()),
            size: 0,
            execution_id: execution_id.unwrap_or_default().to_string(),
            created_at: Utc::now(),
        };
        self.index.lock().await.insert(output_id.clone(), artifact);

        tracing::debug!(output_id = %output_id, ?kind, "artifact created");
        Ok(AppendHandle {
            output_id,
            file,
            store: self.clone(),
        })
    }

    /// Look up artifact metadata.
    pub async fn get(&self, output_id: &str) -> Result<OutputArtifact> {
        self.index
            .lock()
            .await
            .get(output_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::resource(
                    "OUTPUT_NOT_FOUND",
                    format!("no output artifact with id '{output_id}'"),
                )
            })
    }

    /// List artifacts matching the filter, newest first, with the total count
    /// before pagination.
    pub async fn list(&self, filter: &ArtifactFilter) -> (Vec<OutputArtifact>, usize) {
        let index = self.index.lock().await;
        let mut matched: Vec<OutputArtifact> = index
            .values()
            .filter(|a| {
                filter
                    .execution_id
                    .as_deref()
                    .is_none_or(|id| a.execution_id == id)
                    && filter.kind.is_none_or(|k| a.kind == k)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len();
        let limit = if filter.limit == 0 { total } else { filter.limit };
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        (page, total)
    }

    /// Read `[offset, offset + min(size, available - offset))` bytes.
    ///
    /// The reader opens its own file handle, so concurrent appends by the
    /// owning execution are safe; the reader sees a prefix of the final
    /// content.
    pub async fn read(&self, output_id: &str, offset: u64, size: u64) -> Result<(Vec<u8>, u64)> {
        // Existence check against the index first: unknown ids are a RESOURCE
        // error even if a stale file happens to exist on disk.
        self.get(output_id).await?;

        let path = self.path_for(output_id);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            ServiceError::system(
                "STORE_READ_FAILED",
                format!("cannot open artifact '{output_id}': {e}"),
            )
        })?;
        let total = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|e| ServiceError::system("STORE_READ_FAILED", e.to_string()))?;

        if offset >= total {
            return Ok((Vec::new(), total));
        }
        let want = size.min(total - offset);
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| ServiceError::system("STORE_READ_FAILED", e.to_string()))?;
        let mut buf = vec![0u8; want as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| ServiceError::system("STORE_READ_FAILED", e.to_string()))?;
        Ok((buf, total))
    }

    /// Read an artifact's full current contents (pipeline stdin source).
    pub async fn read_all(&self, output_id: &str) -> Result<Vec<u8>> {
        let (bytes, _) = self.read(output_id, 0, u64::MAX).await?;
        Ok(bytes)
    }

    /// Delete artifacts. Refuses outright unless `confirm` is true.
    pub async fn delete(&self, output_ids: &[String], confirm: bool) -> Result<Vec<DeleteOutcome>> {
        if !confirm {
            return Err(ServiceError::param(
                "DELETE_NOT_CONFIRMED",
                "deletion requires confirm=true; no artifacts were removed",
            ));
        }
        let mut outcomes = Vec::with_capacity(output_ids.len());
        let mut index = self.index.lock().await;
        for id in output_ids {
            match index.remove(id) {
                Some(_) => {
                    let err = tokio::fs::remove_file(self.path_for(id)).await.err();
                    outcomes.push(DeleteOutcome {
                        output_id: id.clone(),
                        deleted: err.is_none(),
                        error: err.map(|e| e.to_string()),
                    });
                }
                None => outcomes.push(DeleteOutcome {
                    output_id: id.clone(),
                    deleted: false,
                    error: Some("no such artifact".to_string()),
                }),
            }
        }
        Ok(outcomes)
    }

    /// Suggest artifacts worth cleaning up, plus stale-file warnings.
    pub async fn cleanup_suggestions(
        &self,
        max_size_mb: Option<u64>,
        max_age_hours: Option<u64>,
        include_warnings: bool,
    ) -> (Vec<CleanupSuggestion>, Vec<String>) {
        let size_threshold = max_size_mb.unwrap_or(100) * 1024 * 1024;
        let age_threshold = max_age_hours.unwrap_or(DEFAULT_CLEANUP_AGE_HOURS) as f64;
        let now = Utc::now();

        let index = self.index.lock().await;
        let mut suggestions = Vec::new();
        for artifact in index.values() {
            let age_hours =
                (now - artifact.created_at).num_milliseconds() as f64 / 3_600_000.0;
            if artifact.size >= size_threshold {
                suggestions.push(CleanupSuggestion {
                    output_id: artifact.output_id.clone(),
                    reason: format!("large artifact ({} bytes)", artifact.size),
                    size: artifact.size,
                    age_hours,
                });
            } else if age_hours >= age_threshold {
                suggestions.push(CleanupSuggestion {
                    output_id: artifact.output_id.clone(),
                    reason: format!("older than {age_threshold} hours"),
                    size: artifact.size,
                    age_hours,
                });
            }
        }

        let mut warnings = Vec::new();
        if include_warnings {
            // Files under the root that no live artifact accounts for --
            // typically left over from a previous service run.
            if let Ok(mut entries) = tokio::fs::read_dir(&self.root).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let id = name.strip_suffix(".out").unwrap_or(&name);
                    if !index.contains_key(id) {
                        warnings.push(format!("stale file from a previous run: {name}"));
                    }
                }
            }
        }

        (suggestions, warnings)
    }

    /// Remove artifacts older than `max_age_hours`, keeping at least the
    /// `preserve_recent` newest ones. `dry_run` reports without deleting.
    pub async fn auto_cleanup(
        &self,
        max_age_hours: Option<u64>,
        dry_run: bool,
        preserve_recent: Option<usize>,
    ) -> CleanupReport {
        let age_threshold = max_age_hours.unwrap_or(DEFAULT_CLEANUP_AGE_HOURS) as i64;
        let preserve = preserve_recent.unwrap_or(DEFAULT_PRESERVE_RECENT);
        let cutoff = Utc::now() - chrono::Duration::hours(age_threshold);

        let mut index = self.index.lock().await;
        let mut by_age: Vec<(String, DateTime<Utc>, u64)> = index
            .values()
            .map(|a| (a.output_id.clone(), a.created_at, a.size))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = Vec::new();
        let mut reclaimed = 0u64;
        for (id, created_at, size) in by_age.iter().skip(preserve) {
            if *created_at < cutoff {
                removed.push(id.clone());
                reclaimed += size;
            }
        }

        if !dry_run {
            for id in &removed {
                index.remove(id);
                let _ = tokio::fs::remove_file(self.path_for(id)).await;
            }
            tracing::info!(count = removed.len(), reclaimed, "auto-cleanup removed artifacts");
        }

        CleanupReport {
            preserved: index.len().min(preserve),
            removed,
            reclaimed_bytes: reclaimed,
            dry_run,
        }
    }

    /// Aggregate stats for monitoring: artifact count and total bytes.
    pub async fn stats(&self) -> (usize, u64) {
        let index = self.index.lock().await;
        let total: u64 = index.values().map(|a| a.size).sum();
        (index.len(), total)
    }

    /// The on-disk root (used by tests and diagnostics).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn record_append(&self, output_id: &str, bytes: u64) {
        if let Some(artifact) = self.index.lock().await.get_mut(output_id) {
            artifact.size += bytes;
        }
    }
}

/// Writer handle for one artifact. Exactly one writer exists per artifact;
/// it is owned by the supervisor task draining the corresponding stream.
pub struct AppendHandle {
    output_id: String,
    file: tokio::fs::File,
    store: OutputStore,
}

impl AppendHandle {
    /// The id of the artifact being written.
    #[must_use]
    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    /// Append bytes. Flushes so that concurrent readers observe the bytes
    /// monotonically.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| ServiceError::system("STORE_APPEND_FAILED", e.to_string()))?;
        self.file
            .flush()
            .await
            .map_err(|e| ServiceError::system("STORE_APPEND_FAILED", e.to_string()))?;
        self.store.record_append(&self.output_id, bytes.len() as u64).await;
        Ok(())
    }

    /// Flush and sync the artifact; call when the stream is exhausted.
    pub async fn finalize(mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| ServiceError::system("STORE_FINALIZE_FAILED", e.to_string()))?;
        let _ = self.file.sync_data().await;
        Ok(())
    }
}
