use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use visitstream::app::{PipelineReport, Supervisor};
use visitstream::broker::MemoryBroker;
use visitstream::config::Config;
use visitstream::storage::SqliteVisitStore;

#[allow(dead_code)]
pub fn create_temp_store() -> (Arc<SqliteVisitStore>, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("visits.db");
    let store =
        SqliteVisitStore::new_with_path(db_path).expect("failed to create sqlite store with path");
    (Arc::new(store), tmp)
}

/// Defaults tuned for fast in-memory runs.
#[allow(dead_code)]
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.kafka.poll_timeout_ms = 20;
    config.kafka.insert_workers = 2;
    config.commit.batch_size = 5;
    config.commit.interval_secs = 60;
    config.shutdown_grace_secs = 5;
    config
}

/// Reserves a free local port by binding and releasing it.
#[allow(dead_code)]
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    listener.local_addr().expect("no local addr")
}

/// A supervisor running on a background task.
#[allow(dead_code)]
pub struct RunningPipeline {
    pub addr: SocketAddr,
    pub broker: MemoryBroker,
    pub store: Arc<SqliteVisitStore>,
    pub cancel: tokio_util::sync::CancellationToken,
    pub handle: tokio::task::JoinHandle<visitstream::Result<PipelineReport>>,
    _dir: TempDir,
}

#[allow(dead_code)]
impl RunningPipeline {
    pub async fn start(config: Config) -> Self {
        let (store, dir) = create_temp_store();
        let broker = MemoryBroker::default();
        let addr = free_local_addr();

        let supervisor = Supervisor::new(config, Arc::new(broker.clone()), store.clone());
        let cancel = supervisor.cancellation_token();
        let handle = tokio::spawn(supervisor.run(addr));
        wait_for_listener(addr).await;

        Self {
            addr,
            broker,
            store,
            cancel,
            handle,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) -> PipelineReport {
        self.cancel.cancel();
        self.handle
            .await
            .expect("supervisor panicked")
            .expect("supervisor failed")
    }
}

#[allow(dead_code)]
pub async fn wait_for_listener(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while tokio::net::TcpStream::connect(addr).await.is_err() {
        assert!(Instant::now() < deadline, "listener did not come up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
