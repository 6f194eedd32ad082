use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use geo_store::geo::GeoBox;
use geo_store::index::{IndexPoint, ScrollPage};
use geo_store::{
    CheckpointError, CheckpointStore, CoordinateOrder, DistanceKind, EmbedError,
    EmbeddingsProvider, FileCheckpointStore, GeoError, HashingEmbedder, IndexError, IndexedPoint,
    IngestOptions, Ingestor, MemoryCheckpointStore, MemoryIndex, RetryPolicy, SkipReason,
    VectorIndex, VectorSpace,
};
use tokio::sync::watch;

const COLLECTION: &str = "tweets";

fn line(text: &str, lon: f64, lat: f64) -> String {
    serde_json::json!({ "text": text, "coordinates": [lon, lat] }).to_string()
}

fn five_records() -> String {
    [
        line("coffee in soho", -74.0005, 40.7233),
        line("rain again in brooklyn", -73.9442, 40.6782),
        line("sunset at santa monica", -118.4912, 34.0195),
        line("snow in chicago", -87.6298, 41.8781),
        line("marathon in boston", -71.0589, 42.3601),
    ]
    .join("\n")
}

fn options(chunk_size: usize) -> IngestOptions {
    IngestOptions {
        chunk_size,
        resume: true,
        coordinate_order: CoordinateOrder::LonLat,
        upload_retry: RetryPolicy::no_retry(),
        embed_retry: RetryPolicy::no_retry(),
        call_timeout: None,
    }
}

/// Delegates to a [`MemoryIndex`] and fails upserts from the `fail_from`-th call on.
struct ScriptedIndex<'a> {
    inner: &'a MemoryIndex,
    fail_from: u32,
    transient: bool,
    upserts: AtomicU32,
}

impl<'a> ScriptedIndex<'a> {
    fn new(inner: &'a MemoryIndex, fail_from: u32, transient: bool) -> Self {
        Self {
            inner,
            fail_from,
            transient,
            upserts: AtomicU32::new(0),
        }
    }

    fn upserts(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for ScriptedIndex<'_> {
    fn collection(&self) -> &str {
        self.inner.collection()
    }
    async fn collection_exists(&self) -> Result<bool, IndexError> {
        self.inner.collection_exists().await
    }
    async fn create_collection(&self, space: &VectorSpace) -> Result<(), IndexError> {
        self.inner.create_collection(space).await
    }
    async fn create_payload_index(&self, field: &str) -> Result<(), IndexError> {
        self.inner.create_payload_index(field).await
    }
    async fn upsert(&self, points: &[IndexedPoint]) -> Result<usize, IndexError> {
        let n = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.fail_from {
            return Err(if self.transient {
                IndexError::Transport("connection reset".into())
            } else {
                IndexError::Rejected("bad request".into())
            });
        }
        self.inner.upsert(points).await
    }
    async fn query_by_vector(
        &self,
        vector: &[f32],
        limit: usize,
        with_vectors: bool,
    ) -> Result<Vec<IndexPoint>, IndexError> {
        self.inner.query_by_vector(vector, limit, with_vectors).await
    }
    async fn scroll(
        &self,
        limit: usize,
        cursor: Option<u64>,
        filter: Option<&GeoBox>,
        with_vectors: bool,
    ) -> Result<ScrollPage, IndexError> {
        self.inner.scroll(limit, cursor, filter, with_vectors).await
    }
    async fn retrieve(&self, ids: &[u64]) -> Result<Vec<IndexPoint>, IndexError> {
        self.inner.retrieve(ids).await
    }
    async fn count(&self) -> Result<u64, IndexError> {
        self.inner.count().await
    }
}

/// Succeeds for the dimension probe, then fails every call.
struct BrokenEmbedder {
    calls: AtomicU32,
    transient: bool,
}

#[async_trait]
impl EmbeddingsProvider for BrokenEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            return Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect());
        }
        if self.transient {
            Err(EmbedError::Transport("connection refused".into()))
        } else {
            Err(EmbedError::HttpStatus {
                status: 400,
                snippet: "input too long".into(),
            })
        }
    }

    fn model_id(&self) -> &str {
        "broken"
    }
}

/// Moves the checkpoint behind the ingestor's back on every compare-and-swap.
struct RacingStore {
    inner: MemoryCheckpointStore,
}

impl CheckpointStore for RacingStore {
    fn read(&self, collection: &str) -> Result<u64, CheckpointError> {
        self.inner.read(collection)
    }
    fn write(&self, collection: &str, position: u64) -> Result<(), CheckpointError> {
        self.inner.write(collection, position)
    }
    fn compare_and_swap(
        &self,
        collection: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, CheckpointError> {
        self.inner.write(collection, 99)?;
        self.inner.compare_and_swap(collection, expected, new)
    }
}

#[tokio::test]
async fn clean_run_uploads_every_record_and_commits_last_position() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();

    let report = Ingestor::new(&index, &embedder, &store, options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap();

    assert_eq!(report.start_position, 1);
    assert_eq!(report.last_committed, 5);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.records, 5);
    assert_eq!(store.read(COLLECTION).unwrap(), 5);
    assert_eq!(index.ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(index.payload_indexes(), vec!["latitude", "longitude"]);
}

#[tokio::test]
async fn existing_collection_still_gets_payload_indexes() {
    // Collection left behind by a run that died right after creating it.
    let index = MemoryIndex::new(COLLECTION);
    index
        .create_collection(&VectorSpace {
            size: 16,
            distance: DistanceKind::Cosine,
        })
        .await
        .unwrap();
    assert!(index.payload_indexes().is_empty());

    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    let ingestor = Ingestor::new(&index, &embedder, &store, options(2));
    ingestor.run(Cursor::new(five_records())).await.unwrap();
    assert_eq!(index.payload_indexes(), vec!["latitude", "longitude"]);

    // Indexes that already exist are not an error on later runs.
    ingestor.ensure_collection().await.unwrap();
    assert_eq!(index.payload_indexes(), vec!["latitude", "longitude"]);
}

#[tokio::test]
async fn upserted_records_round_trip() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    Ingestor::new(&index, &embedder, &store, options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap();

    let points = index.retrieve(&[1, 3]).await.unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].payload.document.as_deref(), Some("coffee in soho"));
    assert_eq!(points[0].payload.coordinates(), Some((40.7233, -74.0005)));
    assert_eq!(points[1].payload.document.as_deref(), Some("sunset at santa monica"));
    assert_eq!(points[1].payload.coordinates(), Some((34.0195, -118.4912)));
    assert_eq!(
        points[1].vector.as_deref(),
        Some(embedder.embed_one("sunset at santa monica").as_slice())
    );
}

#[tokio::test]
async fn crash_after_first_chunk_resumes_at_next_position() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();

    // Second upload is rejected: chunk 1 (positions 1-2) is the last commit.
    let failing = ScriptedIndex::new(&index, 2, false);
    let err = Ingestor::new(&failing, &embedder, &store, options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();
    assert_eq!(err.last_committed(), Some(2));
    assert!(matches!(err, GeoError::Aborted { .. }));
    assert_eq!(store.read(COLLECTION).unwrap(), 2);
    assert_eq!(index.ids(), vec![1, 2]);

    let report = Ingestor::new(&index, &embedder, &store, options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap();
    assert_eq!(report.start_position, 3);
    assert_eq!(report.last_committed, 5);
    assert_eq!(report.records, 3);
    assert_eq!(index.ids(), vec![1, 2, 3, 4, 5]);

    // Same content as an uninterrupted run.
    let clean = MemoryIndex::new(COLLECTION);
    Ingestor::new(&clean, &embedder, &MemoryCheckpointStore::new(), options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap();
    let ids: Vec<u64> = (1..=5).collect();
    assert_eq!(
        index.retrieve(&ids).await.unwrap(),
        clean.retrieve(&ids).await.unwrap()
    );
}

#[tokio::test]
async fn rerun_from_stale_checkpoint_does_not_duplicate() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    let ingestor = Ingestor::new(&index, &embedder, &store, options(2));

    ingestor.run(Cursor::new(five_records())).await.unwrap();
    let ids: Vec<u64> = (1..=5).collect();
    let before = index.retrieve(&ids).await.unwrap();

    store.write(COLLECTION, 1).unwrap();
    let report = ingestor.run(Cursor::new(five_records())).await.unwrap();
    assert_eq!(report.start_position, 2);
    assert_eq!(report.records, 4);
    assert_eq!(index.count().await.unwrap(), 5);
    assert_eq!(index.retrieve(&ids).await.unwrap(), before);
    assert_eq!(store.read(COLLECTION).unwrap(), 5);
}

#[tokio::test]
async fn fresh_run_never_lowers_the_checkpoint() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    store.write(COLLECTION, 40).unwrap();

    let mut opts = options(2);
    opts.resume = false;
    let report = Ingestor::new(&index, &embedder, &store, opts)
        .run(Cursor::new(five_records()))
        .await
        .unwrap();

    assert_eq!(report.start_position, 1);
    assert_eq!(report.records, 5);
    assert_eq!(report.last_committed, 40);
    assert_eq!(store.read(COLLECTION).unwrap(), 40);
}

#[tokio::test]
async fn skipped_lines_keep_physical_positions() {
    let src = [
        line("first", 10.0, 20.0),
        String::new(),
        "{not json".to_string(),
        r#"{"coordinates": [1, 2]}"#.to_string(),
        line("fifth", 10.0, 20.0),
        r#"{"text": "far out", "coordinates": [500, 20]}"#.to_string(),
        r#"{"text": "no coords"}"#.to_string(),
    ]
    .join("\n");

    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(8);
    let store = MemoryCheckpointStore::new();
    let report = Ingestor::new(&index, &embedder, &store, options(10))
        .run(Cursor::new(src))
        .await
        .unwrap();

    assert_eq!(index.ids(), vec![1, 5]);
    assert_eq!(report.records, 2);
    assert_eq!(report.skipped.total(), 5);
    assert_eq!(report.skipped.count(SkipReason::Blank), 1);
    assert_eq!(report.skipped.count(SkipReason::MalformedJson), 1);
    assert_eq!(report.skipped.count(SkipReason::MissingText), 1);
    assert_eq!(report.skipped.count(SkipReason::InvalidCoordinates), 1);
    assert_eq!(report.skipped.count(SkipReason::MissingCoordinates), 1);
    // Trailing invalid lines are consumed too.
    assert_eq!(report.last_committed, 7);
}

#[tokio::test(start_paused = true)]
async fn exhausted_upload_retries_keep_checkpoint_intact() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    let failing = ScriptedIndex::new(&index, 2, true);

    let mut opts = options(2);
    opts.upload_retry = RetryPolicy {
        max_attempts: 4,
        base: Duration::from_millis(10),
    };
    let err = Ingestor::new(&failing, &embedder, &store, opts)
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();

    match err {
        GeoError::Aborted {
            last_committed,
            source,
        } => {
            assert_eq!(last_committed, 2);
            assert!(matches!(
                *source,
                GeoError::UploadExhausted { attempts: 4, .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    // One successful upload, then four failed attempts for chunk 2.
    assert_eq!(failing.upserts(), 5);
    assert_eq!(store.read(COLLECTION).unwrap(), 2);
    assert_eq!(index.ids(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn rejected_upload_is_not_retried() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    let failing = ScriptedIndex::new(&index, 1, false);

    let mut opts = options(2);
    opts.upload_retry = RetryPolicy::upload_default();
    let err = Ingestor::new(&failing, &embedder, &store, opts)
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();

    assert_eq!(failing.upserts(), 1);
    assert_eq!(err.last_committed(), Some(0));
    assert_eq!(store.read(COLLECTION).unwrap(), 0);
}

#[tokio::test]
async fn encoding_failure_fails_fast_by_default() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = BrokenEmbedder {
        calls: AtomicU32::new(0),
        transient: true,
    };
    let store = MemoryCheckpointStore::new();

    let err = Ingestor::new(&index, &embedder, &store, options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();

    match err {
        GeoError::Aborted { source, .. } => assert!(matches!(*source, GeoError::Embed(_))),
        other => panic!("unexpected error: {other}"),
    }
    // Probe plus a single attempt.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.read(COLLECTION).unwrap(), 0);
    assert!(index.ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn encoding_retry_is_configurable() {
    let index = MemoryIndex::new(COLLECTION);
    let store = MemoryCheckpointStore::new();
    let mut opts = options(2);
    opts.embed_retry = RetryPolicy {
        max_attempts: 3,
        base: Duration::from_millis(10),
    };

    let transient = BrokenEmbedder {
        calls: AtomicU32::new(0),
        transient: true,
    };
    let _ = Ingestor::new(&index, &transient, &store, opts.clone())
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();
    assert_eq!(transient.calls.load(Ordering::SeqCst), 4);

    // A 400 is not worth repeating even when retries are enabled.
    let permanent = BrokenEmbedder {
        calls: AtomicU32::new(0),
        transient: false,
    };
    let other = MemoryIndex::new(COLLECTION);
    let _ = Ingestor::new(&other, &permanent, &store, opts)
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();
    assert_eq!(permanent.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_chunk() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let err = Ingestor::new(&index, &embedder, &store, options(2))
        .with_cancel(rx)
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();

    assert!(matches!(err, GeoError::Cancelled { last_committed: 0 }));
    assert!(index.ids().is_empty());
    assert_eq!(store.read(COLLECTION).unwrap(), 0);
}

#[tokio::test]
async fn concurrent_checkpoint_move_aborts_the_run() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = RacingStore {
        inner: MemoryCheckpointStore::new(),
    };

    let err = Ingestor::new(&index, &embedder, &store, options(2))
        .run(Cursor::new(five_records()))
        .await
        .unwrap_err();

    match err {
        GeoError::Aborted {
            last_committed,
            source,
        } => {
            assert_eq!(last_committed, 0);
            assert!(matches!(
                *source,
                GeoError::CheckpointConflict {
                    expected: 0,
                    found: 99,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn file_source_and_file_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("tweets.jsonl");
    std::fs::write(&source, five_records()).unwrap();
    let checkpoint = dir.path().join("checkpoint.json");

    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = FileCheckpointStore::new(&checkpoint);
    let report = Ingestor::new(&index, &embedder, &store, options(3))
        .run_file(&source)
        .await
        .unwrap();
    assert_eq!(report.last_committed, 5);

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&checkpoint).unwrap()).unwrap();
    assert_eq!(doc, serde_json::json!({ "tweets": 5 }));

    // Nothing left to do on a second run; existing collection is reused.
    let again = Ingestor::new(&index, &embedder, &store, options(3))
        .run_file(&source)
        .await
        .unwrap();
    assert_eq!(again.start_position, 6);
    assert_eq!(again.records, 0);
    assert_eq!(again.last_committed, 5);
}

#[tokio::test]
async fn missing_source_file_is_an_io_error() {
    let index = MemoryIndex::new(COLLECTION);
    let embedder = HashingEmbedder::new(16);
    let store = MemoryCheckpointStore::new();
    let err = Ingestor::new(&index, &embedder, &store, options(3))
        .run_file("/definitely/not/here.jsonl")
        .await
        .unwrap_err();
    assert!(matches!(err, GeoError::Io(_)));
}
