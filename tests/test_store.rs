//! Integration tests for the on-disk output store.

use mcp_shell::error::ErrorCategory;
use mcp_shell::store::{ArtifactFilter, ArtifactKind, OutputStore};

async fn store() -> (OutputStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = OutputStore::open(dir.path()).await.expect("open store");
    (store, dir)
}

// ---------------------------------------------------------------------------
// Create / append / read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_append_read_roundtrip() {
    let (store, _dir) = store().await;
    let mut handle = store
        .create(Some("exec-1"), ArtifactKind::Combined, None)
        .await
        .unwrap();
    let id = handle.output_id().to_string();
    handle.append(b"hello ").await.unwrap();
    handle.append(b"world\n").await.unwrap();
    handle.finalize().await.unwrap();

    let (bytes, total) = store.read(&id, 0, 1024).await.unwrap();
    assert_eq!(bytes, b"hello world\n");
    assert_eq!(total, 12);

    let artifact = store.get(&id).await.unwrap();
    assert_eq!(artifact.size, 12);
    assert_eq!(artifact.execution_id, "exec-1");
}

#[tokio::test]
async fn test_read_offset_and_size_window() {
    let (store, _dir) = store().await;
    let mut handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    let id = handle.output_id().to_string();
    handle.append(b"0123456789").await.unwrap();
    handle.finalize().await.unwrap();

    let (bytes, total) = store.read(&id, 3, 4).await.unwrap();
    assert_eq!(bytes, b"3456");
    assert_eq!(total, 10);

    // Size past the end is clipped.
    let (bytes, _) = store.read(&id, 8, 100).await.unwrap();
    assert_eq!(bytes, b"89");

    // Offset past the end returns empty.
    let (bytes, total) = store.read(&id, 50, 10).await.unwrap();
    assert!(bytes.is_empty());
    assert_eq!(total, 10);
}

#[tokio::test]
async fn test_reader_sees_prefix_while_writing() {
    let (store, _dir) = store().await;
    let mut handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    let id = handle.output_id().to_string();
    handle.append(b"first").await.unwrap();

    // Not finalized yet; the appended prefix is already visible.
    let (bytes, _) = store.read(&id, 0, 1024).await.unwrap();
    assert_eq!(bytes, b"first");

    handle.append(b" second").await.unwrap();
    let (bytes, _) = store.read(&id, 0, 1024).await.unwrap();
    assert_eq!(bytes, b"first second");
    handle.finalize().await.unwrap();
}

#[tokio::test]
async fn test_read_unknown_id_is_resource_error() {
    let (store, _dir) = store().await;
    let err = store.read("out-nope", 0, 10).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Resource);
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_list_filters_by_execution_and_kind() {
    let (store, _dir) = store().await;
    let h1 = store
        .create(Some("exec-a"), ArtifactKind::Combined, None)
        .await
        .unwrap();
    h1.finalize().await.unwrap();
    let h2 = store
        .create(Some("exec-b"), ArtifactKind::Stderr, None)
        .await
        .unwrap();
    h2.finalize().await.unwrap();

    let (all, total) = store.list(&ArtifactFilter::default()).await;
    assert_eq!(total, 2);
    assert_eq!(all.len(), 2);

    let (only_a, total) = store
        .list(&ArtifactFilter {
            execution_id: Some("exec-a".to_string()),
            ..ArtifactFilter::default()
        })
        .await;
    assert_eq!(total, 1);
    assert_eq!(only_a[0].execution_id, "exec-a");

    let (stderr_only, _) = store
        .list(&ArtifactFilter {
            kind: Some(ArtifactKind::Stderr),
            ..ArtifactFilter::default()
        })
        .await;
    assert_eq!(stderr_only.len(), 1);
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_without_confirm_is_param_error_and_noop() {
    let (store, _dir) = store().await;
    let mut handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    let id = handle.output_id().to_string();
    handle.append(b"keep me").await.unwrap();
    handle.finalize().await.unwrap();

    let err = store.delete(&[id.clone()], false).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Param);

    // The artifact is untouched and still readable.
    let (bytes, _) = store.read(&id, 0, 1024).await.unwrap();
    assert_eq!(bytes, b"keep me");
}

#[tokio::test]
async fn test_delete_with_confirm_removes_artifact() {
    let (store, _dir) = store().await;
    let handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    let id = handle.output_id().to_string();
    handle.finalize().await.unwrap();

    let outcomes = store.delete(&[id.clone()], true).await.unwrap();
    assert!(outcomes[0].deleted);
    assert!(store.get(&id).await.is_err());
}

#[tokio::test]
async fn test_delete_unknown_id_reports_per_id_failure() {
    let (store, _dir) = store().await;
    let outcomes = store
        .delete(&["out-missing".to_string()], true)
        .await
        .unwrap();
    assert!(!outcomes[0].deleted);
    assert!(outcomes[0].error.is_some());
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cleanup_suggestions_flags_stale_files() {
    let (store, dir) = store().await;
    // A file on disk that no live artifact accounts for.
    std::fs::write(dir.path().join("out-stale.out"), b"leftover").unwrap();
    let (_, warnings) = store.cleanup_suggestions(None, None, true).await;
    assert!(warnings.iter().any(|w| w.contains("out-stale")));
}

#[tokio::test]
async fn test_auto_cleanup_dry_run_preserves_everything() {
    let (store, _dir) = store().await;
    let handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    let id = handle.output_id().to_string();
    handle.finalize().await.unwrap();

    // max_age_hours=0 makes every artifact eligible, but preserve_recent
    // and dry_run both protect it.
    let report = store.auto_cleanup(Some(0), true, Some(0)).await;
    assert!(report.dry_run);
    assert!(store.get(&id).await.is_ok());
}

#[tokio::test]
async fn test_auto_cleanup_preserves_recent() {
    let (store, _dir) = store().await;
    let handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    let id = handle.output_id().to_string();
    handle.finalize().await.unwrap();

    let report = store.auto_cleanup(Some(0), false, Some(10)).await;
    assert!(report.removed.is_empty());
    assert!(store.get(&id).await.is_ok());
}

#[tokio::test]
async fn test_stats_counts_bytes() {
    let (store, _dir) = store().await;
    let mut handle = store.create(None, ArtifactKind::Stdout, None).await.unwrap();
    handle.append(b"12345").await.unwrap();
    handle.finalize().await.unwrap();
    let (count, bytes) = store.stats().await;
    assert_eq!(count, 1);
    assert_eq!(bytes, 5);
}
