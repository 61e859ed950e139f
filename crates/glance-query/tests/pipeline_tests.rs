//! End-to-end tests of the query pipeline against in-memory collaborators.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::{array, Array2};

use glance_core::config::{GalleryConfig, ModelConfig, QualityConfig, QueryConfig};
use glance_core::error::GlanceError;
use glance_core::types::Quality;
use glance_gallery::{GalleryIndex, GallerySearcher};
use glance_query::{
    content_digest, Embedding, KvStore, MemoryKvStore, QueryError, QueryOrchestrator,
    QueryServices, SearchRequest, TaskState, TypedCache, WaitOutcome,
};
use glance_storage::{Database, RecordStore, SqliteRecordStore};
use glance_vision::{ImageEmbedder, ImageEmbedding, TensorMap, VisionError};

/// Maps the first byte to a fixed direction. Payloads starting with "fail"
/// error out, "panic" panics, "slow" sleeps first.
struct MockEmbedder {
    calls: AtomicUsize,
}

impl MockEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageEmbedding for MockEmbedder {
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if bytes.starts_with(b"fail") {
            return Err(VisionError::InvalidImage(
                String::from_utf8_lossy(bytes).into_owned(),
            ));
        }
        if bytes.starts_with(b"panic") {
            panic!("embedder exploded");
        }
        if bytes.starts_with(b"slow") {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(match bytes.first() {
            Some(b'x') => vec![1.0, 0.0],
            Some(b'y') => vec![0.0, 1.0],
            _ => vec![0.6, 0.8],
        })
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct Harness {
    orchestrator: QueryOrchestrator,
    embedder: Arc<MockEmbedder>,
    records: Arc<SqliteRecordStore>,
    kv: Arc<MemoryKvStore>,
}

fn harness(query: QueryConfig) -> Harness {
    let embedder = Arc::new(MockEmbedder::new());
    let index = GalleryIndex::from_parts(
        Some(array![[1.0, 0.0], [0.0, 1.0], [0.6, 0.8]]),
        vec!["a.jpg".into(), "b.jpg".into(), "c.jpg".into()],
    );
    let searcher = Arc::new(GallerySearcher::new(Arc::new(index), &GalleryConfig::default()));
    let records = Arc::new(SqliteRecordStore::new(Arc::new(Database::in_memory().unwrap())));
    let kv = Arc::new(MemoryKvStore::new(1000));

    let services = QueryServices {
        embedder: embedder.clone(),
        searcher,
        records: records.clone(),
        kv: kv.clone(),
    };
    Harness {
        orchestrator: QueryOrchestrator::new(services, query, QualityConfig::default()),
        embedder,
        records,
        kv,
    }
}

/// Rejects writes of one exact value, passing everything else through.
struct RejectingKv {
    inner: MemoryKvStore,
    rejected: &'static [u8],
}

impl KvStore for RejectingKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QueryError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), QueryError> {
        if value == self.rejected {
            return Err(GlanceError::Io(std::io::Error::other("kv write refused")).into());
        }
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), QueryError> {
        self.inner.delete(key)
    }
}

fn orchestrator_with_kv(kv: Arc<dyn KvStore>) -> (QueryOrchestrator, Arc<SqliteRecordStore>) {
    let index = GalleryIndex::from_parts(
        Some(array![[1.0, 0.0], [0.0, 1.0]]),
        vec!["a.jpg".into(), "b.jpg".into()],
    );
    let records = Arc::new(SqliteRecordStore::new(Arc::new(Database::in_memory().unwrap())));
    let services = QueryServices {
        embedder: Arc::new(MockEmbedder::new()),
        searcher: Arc::new(GallerySearcher::new(Arc::new(index), &GalleryConfig::default())),
        records: records.clone(),
        kv,
    };
    let orchestrator =
        QueryOrchestrator::new(services, QueryConfig::default(), QualityConfig::default());
    (orchestrator, records)
}

fn request(bytes: &[u8], top_k: Option<usize>) -> SearchRequest {
    SearchRequest {
        image: bytes.to_vec(),
        filename: "query.jpg".to_string(),
        top_k,
    }
}

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_successful_query_is_ranked_and_stored() {
    let h = harness(QueryConfig::default());
    let handle = h.orchestrator.submit(request(b"x-image", Some(2))).unwrap();
    let id = handle.request_id;
    assert_eq!(handle.wait(WAIT).await, WaitOutcome::Finished(TaskState::Done));

    let status = h.orchestrator.status(id).unwrap();
    assert_eq!(status.state, TaskState::Done);
    assert!(status.error.is_none());

    let (items, stats) = h.orchestrator.results(id, 10).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].rank, 1);
    assert_eq!(items[0].url, "/gallery/a.jpg");
    assert_eq!(items[0].quality, Quality::Strong);
    assert_eq!(items[1].url, "/gallery/c.jpg");
    assert!((items[1].score - 0.6).abs() < 1e-5);
    assert_eq!(stats.total, 2);

    let record = h.records.get_record(id).unwrap().unwrap();
    assert_eq!(record.query_image, b"x-image");
    assert_eq!(record.query_feat, Some(vec![1.0, 0.0]));
    assert_eq!(record.feat_dim, Some(2));
}

#[tokio::test]
async fn test_top_k_is_clamped() {
    let query = QueryConfig {
        default_top_k: 2,
        max_top_k: 3,
        ..QueryConfig::default()
    };
    let h = harness(query);
    assert_eq!(h.orchestrator.clamp_top_k(None), 2);
    assert_eq!(h.orchestrator.clamp_top_k(Some(0)), 1);
    assert_eq!(h.orchestrator.clamp_top_k(Some(500)), 3);

    let handle = h.orchestrator.submit(request(b"y", Some(0))).unwrap();
    let id = handle.request_id;
    handle.wait(WAIT).await;
    assert_eq!(h.orchestrator.results(id, 50).unwrap().0.len(), 1);
}

#[tokio::test]
async fn test_empty_image_rejected() {
    let h = harness(QueryConfig::default());
    assert!(h.orchestrator.submit(request(b"", None)).is_err());
    assert!(h.records.recent_records(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_identical_bytes_reuse_cached_embedding() {
    let h = harness(QueryConfig::default());
    for _ in 0..3 {
        let handle = h.orchestrator.submit(request(b"x-same", None)).unwrap();
        assert_eq!(handle.wait(WAIT).await, WaitOutcome::Finished(TaskState::Done));
    }
    assert_eq!(h.embedder.calls(), 1);

    let handle = h.orchestrator.submit(request(b"x-other", None)).unwrap();
    handle.wait(WAIT).await;
    assert_eq!(h.embedder.calls(), 2);
}

#[tokio::test]
async fn test_stale_cached_embedding_is_recomputed() {
    let h = harness(QueryConfig::default());
    let image = b"y-stale";
    let embed_cache: TypedCache<Embedding> = TypedCache::new(
        h.kv.clone() as Arc<dyn KvStore>,
        QueryConfig::default().cache_prefix,
        "embed",
        None,
    );
    embed_cache
        .set(&content_digest(image), &Embedding(vec![0.0; 768]))
        .unwrap();

    let handle = h.orchestrator.submit(request(image, None)).unwrap();
    let id = handle.request_id;
    assert_eq!(handle.wait(WAIT).await, WaitOutcome::Finished(TaskState::Done));
    assert_eq!(h.embedder.calls(), 1);
    assert_eq!(
        embed_cache.get(&content_digest(image)).unwrap(),
        Some(Embedding(vec![0.0, 1.0]))
    );
    assert_eq!(h.orchestrator.results(id, 1).unwrap().0[0].url, "/gallery/b.jpg");
}

#[tokio::test]
async fn test_embedding_failure_becomes_error_status() {
    let h = harness(QueryConfig::default());
    let handle = h.orchestrator.submit(request(b"fail: corrupt jpeg", None)).unwrap();
    let id = handle.request_id;
    assert_eq!(handle.wait(WAIT).await, WaitOutcome::Finished(TaskState::Error));

    let status = h.orchestrator.status(id).unwrap();
    assert_eq!(status.state, TaskState::Error);
    assert!(status.error.unwrap().contains("corrupt jpeg"));
    assert!(h.orchestrator.results(id, 10).unwrap().0.is_empty());
    assert!(h.records.get_record(id).unwrap().is_some());
}

#[tokio::test]
async fn test_panic_is_contained_and_worker_survives() {
    let h = harness(QueryConfig::default());
    let bad = h.orchestrator.submit(request(b"panic", None)).unwrap();
    let bad_id = bad.request_id;
    assert_eq!(bad.wait(WAIT).await, WaitOutcome::Finished(TaskState::Error));
    let error = h.orchestrator.status(bad_id).unwrap().error.unwrap();
    assert!(error.contains("embedder exploded"));

    let good = h.orchestrator.submit(request(b"x", None)).unwrap();
    assert_eq!(good.wait(WAIT).await, WaitOutcome::Finished(TaskState::Done));
}

#[tokio::test]
async fn test_error_message_is_truncated() {
    let query = QueryConfig {
        max_error_chars: 20,
        ..QueryConfig::default()
    };
    let h = harness(query);
    let long = format!("fail{}", "z".repeat(500));
    let handle = h.orchestrator.submit(request(long.as_bytes(), None)).unwrap();
    let id = handle.request_id;
    handle.wait(WAIT).await;

    let error = h.orchestrator.status(id).unwrap().error.unwrap();
    assert_eq!(error.chars().count(), 20);
}

#[tokio::test]
async fn test_failed_pending_mark_removes_record() {
    let kv = Arc::new(RejectingKv {
        inner: MemoryKvStore::new(100),
        rejected: b"pending",
    });
    let (orchestrator, records) = orchestrator_with_kv(kv);

    let err = orchestrator.submit(request(b"x", None)).unwrap_err();
    assert!(err.to_string().contains("kv write refused"));
    assert!(records.recent_records(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_done_mark_reports_error() {
    let kv = Arc::new(RejectingKv {
        inner: MemoryKvStore::new(100),
        rejected: b"done",
    });
    let (orchestrator, _records) = orchestrator_with_kv(kv);

    let handle = orchestrator.submit(request(b"x", None)).unwrap();
    let id = handle.request_id;
    assert_eq!(handle.wait(WAIT).await, WaitOutcome::Finished(TaskState::Error));

    let status = orchestrator.status(id).unwrap();
    assert_eq!(status.state, TaskState::Error);
    assert!(status.error.unwrap().contains("Failed to record completion"));
}

#[tokio::test]
async fn test_unknown_request_reads_as_done() {
    let h = harness(QueryConfig::default());
    let status = h.orchestrator.status(987_654).unwrap();
    assert_eq!(status.state, TaskState::Done);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_short_wait_detaches_and_task_completes() {
    let query = QueryConfig {
        sync_wait_ms: 20,
        ..QueryConfig::default()
    };
    let h = harness(query);
    let outcome = h
        .orchestrator
        .submit_and_wait(request(b"slow", None))
        .await
        .unwrap();
    let WaitOutcome::Detached(id) = outcome else {
        panic!("expected detach, got {outcome:?}");
    };
    assert_eq!(h.orchestrator.status(id).unwrap().state, TaskState::Pending);

    let mut state = TaskState::Pending;
    for _ in 0..200 {
        state = h.orchestrator.status(id).unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, TaskState::Done);
    assert_eq!(h.orchestrator.results(id, 10).unwrap().0.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_do_not_cross_write() {
    let h = Arc::new(harness(QueryConfig::default()));
    let mut joins = Vec::new();
    for i in 0..24 {
        let h = h.clone();
        joins.push(tokio::spawn(async move {
            let bytes: Vec<u8> = if i % 3 == 0 {
                format!("fail-{i}").into_bytes()
            } else if i % 3 == 1 {
                format!("x-{i}").into_bytes()
            } else {
                format!("y-{i}").into_bytes()
            };
            let handle = h.orchestrator.submit(request(&bytes, Some(1))).unwrap();
            let id = handle.request_id;
            let outcome = handle.wait(WAIT).await;
            (i, id, outcome)
        }));
    }

    let mut ids = Vec::new();
    for join in joins {
        let (i, id, outcome) = join.await.unwrap();
        ids.push(id);
        let status = h.orchestrator.status(id).unwrap();
        let (items, _) = h.orchestrator.results(id, 10).unwrap();
        match i % 3 {
            0 => {
                assert_eq!(outcome, WaitOutcome::Finished(TaskState::Error));
                assert_eq!(status.error.unwrap(), format!("Embedding failed: Invalid image: fail-{i}"));
                assert!(items.is_empty());
            }
            1 => {
                assert_eq!(status.state, TaskState::Done);
                assert_eq!(items[0].url, "/gallery/a.jpg");
            }
            _ => {
                assert_eq!(status.state, TaskState::Done);
                assert_eq!(items[0].url, "/gallery/b.jpg");
            }
        }
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 24);
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let h = harness(QueryConfig::default());
    let ids: Vec<i64> = (0..5)
        .map(|i| {
            h.orchestrator
                .submit(request(format!("x{i}").as_bytes(), None))
                .unwrap()
                .request_id
        })
        .collect();
    let records = h.records.clone();
    h.orchestrator.shutdown().await;
    for id in ids {
        assert_eq!(records.list_items(id, 10).unwrap().len(), 3);
    }
}

fn png(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(40, 32, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(seed),
            (y as u8).wrapping_add(seed.wrapping_mul(3)),
            seed,
        ])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_with_reference_model() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("tiny.safetensors");
    let model = ModelConfig {
        weights_path: weights.to_string_lossy().into_owned(),
        image_size: 28,
        hidden_size: 8,
        num_heads: 2,
        num_layers: 2,
        ..ModelConfig::default()
    };
    TensorMap::random_init(&model, 2, 4, 5)
        .save_safetensors(&weights)
        .unwrap();
    let embedder = Arc::new(ImageEmbedder::new(model));

    let images: Vec<Vec<u8>> = (1..=4).map(|s| png(s * 37)).collect();
    let mut rows = Vec::new();
    for image in &images {
        rows.extend(embedder.embed_bytes(image).unwrap());
    }
    let features = Array2::from_shape_vec((images.len(), 8), rows).unwrap();
    let paths = (0..images.len()).map(|i| format!("img {i}.png")).collect();
    let searcher = Arc::new(GallerySearcher::new(
        Arc::new(GalleryIndex::from_parts(Some(features), paths)),
        &GalleryConfig::default(),
    ));

    let records = Arc::new(SqliteRecordStore::new(Arc::new(Database::in_memory().unwrap())));
    let orchestrator = QueryOrchestrator::new(
        QueryServices {
            embedder,
            searcher,
            records: records.clone(),
            kv: Arc::new(MemoryKvStore::new(100)),
        },
        QueryConfig::default(),
        QualityConfig::default(),
    );

    let handle = orchestrator
        .submit(SearchRequest {
            image: images[2].clone(),
            filename: "probe.png".into(),
            top_k: Some(3),
        })
        .unwrap();
    let id = handle.request_id;
    assert_eq!(handle.wait(WAIT).await, WaitOutcome::Finished(TaskState::Done));

    let (items, stats) = orchestrator.results(id, 10).unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].url, "/gallery/img%202.png");
    assert!((items[0].score - 1.0).abs() < 1e-4);
    assert!(items.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(stats.best, Some(items[0].score));

    let record = records.get_record(id).unwrap().unwrap();
    assert_eq!(record.filename, "probe.png");
    assert_eq!(record.feat_dim, Some(8));
}
