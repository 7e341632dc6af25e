//! End-to-end tests against an in-process import service.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sql2kv_core::pool::{ConnectionPool, PoolConfig};
use sql2kv_core::writer::{
    EnginePipeline, GrpcStreamOpener, WriteStream, WriteStreamOpener, WriterConfig,
};
use sql2kv_core::{EngineId, ImportClient, ImportError, KeyRange};
use sql2kv_proto::import_kv_server::{ImportKv, ImportKvServer};
use sql2kv_proto::*;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

const MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Minimal import service that records what it receives.
#[derive(Default)]
struct Recorded {
    opened: Mutex<Vec<Vec<u8>>>,
    puts: Mutex<HashMap<Vec<u8>, Vec<(u64, Mutation)>>>,
    streams: Mutex<usize>,
    calls: Mutex<Vec<String>>,
    /// Fail the next write stream right after its first batch.
    reset_after_batch: AtomicBool,
}

#[derive(Clone, Default)]
struct RecordingImporter {
    state: Arc<Recorded>,
}

impl RecordingImporter {
    fn known(&self, uuid: &[u8]) -> bool {
        self.state.opened.lock().iter().any(|id| id == uuid)
    }

    fn call(&self, name: String) {
        self.state.calls.lock().push(name);
    }
}

#[tonic::async_trait]
impl ImportKv for RecordingImporter {
    async fn switch_mode(
        &self,
        request: Request<SwitchModeRequest>,
    ) -> Result<Response<SwitchModeResponse>, Status> {
        let request = request.into_inner();
        self.call(format!("switch_mode:{}:{}", request.pd_addr, request.mode));
        Ok(Response::new(SwitchModeResponse::default()))
    }

    async fn open_engine(
        &self,
        request: Request<OpenEngineRequest>,
    ) -> Result<Response<OpenEngineResponse>, Status> {
        let uuid = request.into_inner().uuid;
        if !self.known(&uuid) {
            self.state.opened.lock().push(uuid);
        }
        self.call("open_engine".to_string());
        Ok(Response::new(OpenEngineResponse::default()))
    }

    async fn write_engine(
        &self,
        request: Request<Streaming<WriteEngineRequest>>,
    ) -> Result<Response<WriteEngineResponse>, Status> {
        let mut frames = request.into_inner();
        *self.state.streams.lock() += 1;

        let uuid = match frames.message().await? {
            Some(WriteEngineRequest {
                chunk: Some(write_engine_request::Chunk::Head(head)),
            }) => head.uuid,
            _ => return Err(Status::invalid_argument("first frame must be a head")),
        };

        let mut error = None;
        while let Some(frame) = frames.message().await? {
            let Some(write_engine_request::Chunk::Batch(batch)) = frame.chunk else {
                return Err(Status::invalid_argument("unexpected head"));
            };
            if !self.known(&uuid) {
                error = Some(Error::engine_not_found(uuid.clone()));
                continue;
            }
            {
                let mut puts = self.state.puts.lock();
                let entry = puts.entry(uuid.clone()).or_default();
                entry.extend(batch.mutations.into_iter().map(|m| (batch.commit_ts, m)));
            }
            if self.state.reset_after_batch.swap(false, Ordering::SeqCst) {
                return Err(Status::unavailable("stream reset"));
            }
        }
        Ok(Response::new(WriteEngineResponse { error }))
    }

    async fn close_engine(
        &self,
        request: Request<CloseEngineRequest>,
    ) -> Result<Response<CloseEngineResponse>, Status> {
        let uuid = request.into_inner().uuid;
        self.call("close_engine".to_string());
        let error = (!self.known(&uuid)).then(|| Error::engine_not_found(uuid));
        Ok(Response::new(CloseEngineResponse { error }))
    }

    async fn import_engine(
        &self,
        request: Request<ImportEngineRequest>,
    ) -> Result<Response<ImportEngineResponse>, Status> {
        let request = request.into_inner();
        self.call(format!("import_engine:{}", request.pd_addr));
        Ok(Response::new(ImportEngineResponse::default()))
    }

    async fn cleanup_engine(
        &self,
        request: Request<CleanupEngineRequest>,
    ) -> Result<Response<CleanupEngineResponse>, Status> {
        let uuid = request.into_inner().uuid;
        self.state.opened.lock().retain(|id| *id != uuid);
        self.call("cleanup_engine".to_string());
        Ok(Response::new(CleanupEngineResponse::default()))
    }

    async fn compact_cluster(
        &self,
        request: Request<CompactClusterRequest>,
    ) -> Result<Response<CompactClusterResponse>, Status> {
        let request = request.into_inner();
        let compact = request.request.unwrap_or_default();
        let range = compact.range.unwrap_or_default();
        self.call(format!(
            "compact:{}:{}:{}",
            request.pd_addr,
            range.start.len(),
            compact.output_level
        ));
        Ok(Response::new(CompactClusterResponse::default()))
    }
}

async fn start_importer(importer: RecordingImporter) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(ImportKvServer::new(importer))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr.to_string()
}

/// Importer that can be stopped, closing its listener and connections.
struct StoppableImporter {
    addr: String,
    stop: oneshot::Sender<()>,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl StoppableImporter {
    async fn start(importer: RecordingImporter) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(
            Server::builder()
                .add_service(ImportKvServer::new(importer))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = stopped.await;
                }),
        );
        Self { addr, stop, server }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.server.await.unwrap().unwrap();
    }
}

/// Records when each stream open is attempted.
struct TimedOpener {
    inner: GrpcStreamOpener,
    opens: Mutex<Vec<Instant>>,
}

impl TimedOpener {
    fn new(inner: GrpcStreamOpener) -> Self {
        Self {
            inner,
            opens: Mutex::new(Vec::new()),
        }
    }

    fn opens(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl WriteStreamOpener for TimedOpener {
    async fn open_stream(&self) -> Result<Box<dyn WriteStream>, ImportError> {
        self.opens.lock().push(Instant::now());
        self.inner.open_stream().await
    }
}

async fn wait_for_opens(opener: &TimedOpener, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while opener.opens().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream was not reopened");
}

fn pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::grpc(PoolConfig {
        connections_per_address: 2,
        ..PoolConfig::default()
    }))
}

fn engine() -> EngineId {
    EngineId::from_bytes(std::array::from_fn(|i| i as u8))
}

#[tokio::test]
async fn test_streamed_batch_reaches_the_engine() {
    let importer = RecordingImporter::default();
    let addr = start_importer(importer.clone()).await;
    let pool = pool();

    let client = ImportClient::new(Arc::clone(&pool), addr.clone(), MAX_MESSAGE);
    client.open_engine(engine()).await.unwrap();

    let opener = GrpcStreamOpener::new(Arc::clone(&pool), addr, MAX_MESSAGE);
    let pipeline = EnginePipeline::new(engine(), Arc::new(opener), WriterConfig::default());
    pipeline.open().unwrap();
    pipeline
        .submit(WriteBatch::new(
            100,
            vec![Mutation::put("k1", "v1"), Mutation::put("k2", "v2")],
        ))
        .await
        .unwrap();
    pipeline.close().await;

    let recorded = importer.state.puts.lock()[&engine().to_vec()].clone();
    assert_eq!(
        recorded,
        vec![
            (100, Mutation::put("k1", "v1")),
            (100, Mutation::put("k2", "v2"))
        ]
    );
    assert_eq!(*importer.state.streams.lock(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_stream_lost_while_idle_is_replaced() {
    let importer = RecordingImporter::default();
    importer.state.reset_after_batch.store(true, Ordering::SeqCst);
    let addr = start_importer(importer.clone()).await;
    let pool = pool();
    ImportClient::new(Arc::clone(&pool), addr.clone(), MAX_MESSAGE)
        .open_engine(engine())
        .await
        .unwrap();

    let opener = Arc::new(TimedOpener::new(GrpcStreamOpener::new(
        Arc::clone(&pool),
        addr,
        MAX_MESSAGE,
    )));
    let pipeline = EnginePipeline::new(engine(), opener.clone(), WriterConfig::default());
    pipeline.open().unwrap();

    pipeline
        .submit(WriteBatch::new(100, vec![Mutation::put("k1", "v1")]))
        .await
        .unwrap();
    wait_for_opens(&opener, 2).await;
    pipeline
        .submit(WriteBatch::new(101, vec![Mutation::put("k3", "v3")]))
        .await
        .unwrap();
    pipeline.close().await;

    let recorded = importer.state.puts.lock()[&engine().to_vec()].clone();
    assert_eq!(
        recorded,
        vec![
            (100, Mutation::put("k1", "v1")),
            (101, Mutation::put("k3", "v3"))
        ]
    );
    assert_eq!(*importer.state.streams.lock(), 2);
    pool.close().await;
}

#[tokio::test]
async fn test_stopped_importer_fails_queued_writes_with_backoff() {
    let importer = StoppableImporter::start(RecordingImporter::default()).await;
    let addr = importer.addr.clone();
    let pool = Arc::new(ConnectionPool::grpc(PoolConfig {
        connections_per_address: 1,
        ..PoolConfig::default()
    }));
    pool.get_connection(&addr).await.unwrap();
    importer.stop().await;
    // Let the client observe the closed connection.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let backoff = Duration::from_millis(200);
    let opener = Arc::new(TimedOpener::new(GrpcStreamOpener::new(
        Arc::clone(&pool),
        addr,
        MAX_MESSAGE,
    )));
    let pipeline = Arc::new(EnginePipeline::new(
        engine(),
        opener.clone(),
        WriterConfig {
            reconnect_backoff: backoff,
            ..WriterConfig::default()
        },
    ));
    pipeline.open().unwrap();

    let submissions = (0..5u64).map(|ts| {
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.submit(WriteBatch::new(ts, vec![])).await }
    });
    for result in futures::future::join_all(submissions).await {
        assert!(
            matches!(result, Err(ImportError::StreamOpenFailed(_))),
            "unexpected result: {result:?}"
        );
    }

    wait_for_opens(&opener, 2).await;
    let opens = opener.opens();
    assert!(opens[1] - opens[0] >= backoff);
    pipeline.close().await;
    pool.close().await;
}

#[tokio::test]
async fn test_control_calls() {
    let importer = RecordingImporter::default();
    let addr = start_importer(importer.clone()).await;
    let pool = pool();
    let client = ImportClient::new(Arc::clone(&pool), addr, MAX_MESSAGE);

    client.switch_mode("pd:2379", SwitchMode::Import).await.unwrap();
    client.open_engine(engine()).await.unwrap();
    client.close_engine(engine()).await.unwrap();
    client.import_engine(engine(), "pd:2379").await.unwrap();
    client.cleanup_engine(engine()).await.unwrap();
    client
        .compact_range("pd:2379", &KeyRange::table(5))
        .await
        .unwrap();
    client.switch_mode("pd:2379", SwitchMode::Normal).await.unwrap();

    assert_eq!(
        *importer.state.calls.lock(),
        vec![
            "switch_mode:pd:2379:1",
            "open_engine",
            "close_engine",
            "import_engine:pd:2379",
            "cleanup_engine",
            "compact:pd:2379:9:-1",
            "switch_mode:pd:2379:0",
        ]
    );
    assert_eq!(pool.addresses().await.len(), 1);
}

#[tokio::test]
async fn test_remote_error_is_not_a_transport_error() {
    let importer = RecordingImporter::default();
    let addr = start_importer(importer).await;
    let client = ImportClient::new(pool(), addr, MAX_MESSAGE);

    let err = client.close_engine(engine()).await.unwrap_err();
    match &err {
        ImportError::RemoteApplication(message) => {
            assert_eq!(message, "engine not found: 000102030405060708090a0b0c0d0e0f");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_transport());
}

#[tokio::test]
async fn test_closed_pool_fails_queued_writes() {
    let pool = pool();
    pool.close().await;

    let client = ImportClient::new(Arc::clone(&pool), "127.0.0.1:1", MAX_MESSAGE);
    assert!(matches!(
        client.open_engine(engine()).await,
        Err(ImportError::PoolClosed)
    ));

    let opener = GrpcStreamOpener::new(Arc::clone(&pool), "127.0.0.1:1", MAX_MESSAGE);
    let config = WriterConfig {
        reconnect_backoff: Duration::from_millis(20),
        ..WriterConfig::default()
    };
    let pipeline = EnginePipeline::new(engine(), Arc::new(opener), config);
    pipeline.open().unwrap();
    let result = pipeline.submit(WriteBatch::new(1, vec![])).await;
    assert!(matches!(result, Err(ImportError::PoolClosed)));
    pipeline.close().await;
}
