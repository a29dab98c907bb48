//! Scenario and invariant tests driving the pool through a mock factory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thrift_pool::{
    ConnectOptions, ConnectionFactory, MultiplexedConnection, Pool, PoolError, ServerInfo,
    ServiceStubs,
};

/// A connection that bumps a shared counter when dropped, so tests can
/// verify every connection is closed exactly once.
#[derive(Debug)]
struct MockConn {
    id: usize,
    closed: Arc<AtomicUsize>,
}

impl Drop for MockConn {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct MockFactory {
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
    failing: Arc<Mutex<HashSet<ServerInfo>>>,
    fail_all: Arc<AtomicBool>,
}

impl MockFactory {
    fn new() -> MockFactory {
        MockFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            alive: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(Mutex::new(HashSet::new())),
            fail_all: Arc::new(AtomicBool::new(false)),
        }
    }

    fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    fn fail_server(&self, server: &ServerInfo) {
        self.failing.lock().unwrap().insert(server.clone());
    }

    fn heal_server(&self, server: &ServerInfo) {
        self.failing.lock().unwrap().remove(server);
    }

    fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConn;
    type Error = String;

    async fn create(
        &self,
        server: &ServerInfo,
        _opts: &ConnectOptions,
    ) -> Result<MockConn, String> {
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(server) {
            return Err(format!("connection refused by {}", server));
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn {
            id,
            closed: self.closed.clone(),
        })
    }

    async fn is_alive(&self, _conn: &mut MockConn) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn server(n: u16) -> ServerInfo {
    ServerInfo::new("backend", 9090 + n)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn eager_init_seeds_one_connection_per_server() {
    init_tracing();
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .build(factory.clone())
        .await
        .unwrap();

    let state = pool.state();
    assert_eq!(state.total_created(), 1);
    assert_eq!(state.total_available(), 1);
    assert_eq!(factory.created_count(), 1);
    pool.close().await;
}

#[tokio::test]
async fn round_trip_returns_the_same_connection() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(1)
        .build(factory.clone())
        .await
        .unwrap();

    let first = pool.get().await.unwrap();
    let id = first.id;
    first.close();
    // The release is synchronous for a healthy handle.
    assert_eq!(pool.state().total_available(), 1);

    let second = pool.get().await.unwrap();
    assert_eq!(second.id, id);
    drop(second);

    assert_eq!(factory.created_count(), 1);
    pool.close().await;
}

#[tokio::test]
async fn refill_grows_the_partition_to_its_ceiling() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(4)
        .availability_threshold(50)
        .acquire_increment(3)
        .acquire_retry_delay(Duration::from_millis(5))
        .build(factory.clone())
        .await
        .unwrap();

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    let c = pool.get().await.unwrap();
    wait_for(|| pool.state().total_created() == 4).await;

    drop(a);
    drop(b);
    drop(c);
    wait_for(|| pool.state().total_available() == 4).await;
    pool.close().await;
}

#[tokio::test]
async fn acquisition_times_out_when_every_connection_is_held() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(1)
        .connection_timeout(Duration::from_millis(50))
        .build(factory)
        .await
        .unwrap();

    let held = pool.get().await.unwrap();
    let start = Instant::now();
    let err = pool.get().await.unwrap_err();
    let waited = start.elapsed();
    assert_eq!(err, PoolError::TimedOut);
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_secs(1));

    drop(held);
    pool.close().await;
}

#[tokio::test]
async fn broken_connection_is_destroyed_and_replaced() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .acquire_increment(1)
        .acquire_retry_delay(Duration::from_millis(5))
        .build(factory.clone())
        .await
        .unwrap();

    factory.set_alive(false);
    let mut handle = pool.get().await.unwrap();
    let doomed = handle.id;
    handle.mark_possibly_broken();
    drop(handle);

    // The failed probe destroys the connection and the watcher replaces it.
    wait_for(|| factory.closed_count() == 1).await;
    factory.set_alive(true);
    wait_for(|| {
        let state = pool.state();
        state.total_created() >= 1 && state.total_available() >= 1
    })
    .await;
    let replacement = pool.get().await.unwrap();
    assert_ne!(replacement.id, doomed);
    drop(replacement);
    pool.close().await;
}

#[tokio::test]
async fn unreachable_server_trips_the_down_latch_and_recovers() {
    let factory = MockFactory::new();
    let target = server(0);
    factory.fail_server(&target);
    let pool = Pool::builder()
        .server(target.clone())
        .max_connections_per_server(2)
        .lazy_init(true)
        .acquire_retry_attempts(2)
        .acquire_retry_delay(Duration::from_millis(1))
        .max_create_failed_count(2)
        .connection_timeout(Duration::from_millis(100))
        .build(factory.clone())
        .await
        .unwrap();

    let err = pool.get().await.unwrap_err();
    assert_eq!(err, PoolError::TimedOut);
    wait_for(|| {
        let state = pool.state();
        state.partitions[0].server_down && state.partitions[0].growth_blocked
    })
    .await;
    assert_eq!(pool.state().total_created(), 0);

    // The server comes back: the next parked acquisition re-wakes the
    // watcher and succeeds.
    factory.heal_server(&target);
    let handle = pool.get().await.unwrap();
    assert!(!pool.state().partitions[0].server_down);
    drop(handle);
    pool.close().await;
}

#[tokio::test]
async fn bootstrap_drops_servers_that_fail() {
    let factory = MockFactory::new();
    let bad = server(0);
    let good = server(1);
    factory.fail_server(&bad);
    let pool = Pool::builder()
        .servers([bad, good.clone()])
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .build(factory.clone())
        .await
        .unwrap();

    let state = pool.state();
    assert_eq!(state.partitions.len(), 1);
    assert_eq!(state.partitions[0].server, good);
    pool.close().await;
}

#[tokio::test]
async fn bootstrap_fails_when_no_server_survives() {
    let factory = MockFactory::new();
    factory.set_fail_all(true);
    let err = Pool::builder()
        .server(server(0))
        .server(server(1))
        .build(factory)
        .await
        .unwrap_err();
    assert_eq!(err, PoolError::NoServersAvailable);
}

#[tokio::test]
async fn builder_rejects_bad_configurations() {
    let err = Pool::builder().build(MockFactory::new()).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));

    let err = Pool::builder()
        .server(server(0))
        .min_connections_per_server(5)
        .max_connections_per_server(2)
        .build(MockFactory::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

#[tokio::test]
async fn lazy_init_defers_creation_until_demand() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .lazy_init(true)
        .build(factory.clone())
        .await
        .unwrap();

    assert_eq!(factory.created_count(), 0);
    assert_eq!(pool.state().total_created(), 0);

    let handle = pool.get().await.unwrap();
    assert!(factory.created_count() >= 1);
    drop(handle);
    pool.close().await;
}

#[tokio::test]
async fn close_destroys_every_connection_exactly_once() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .server(server(1))
        .min_connections_per_server(2)
        .max_connections_per_server(4)
        .build(factory.clone())
        .await
        .unwrap();

    let held = pool.get().await.unwrap();
    pool.close().await;
    // Idempotent.
    pool.close().await;

    assert_eq!(pool.get().await.unwrap_err(), PoolError::Closed);

    // The borrowed connection is destroyed on release.
    drop(held);
    wait_for(|| factory.closed_count() == factory.created_count()).await;
    assert_eq!(pool.state().total_created(), 0);
}

#[tokio::test]
async fn close_cancels_parked_waiters() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(1)
        .build(factory)
        .await
        .unwrap();

    let held = pool.get().await.unwrap();
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let result = waiter_pool.get().await;
        result.err()
    });
    // Give the waiter time to park, then close underneath it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.close().await;

    let err = waiter.await.unwrap();
    assert_eq!(err, Some(PoolError::Closed));
    drop(held);
}

#[tokio::test]
async fn expired_connection_is_destroyed_on_release() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .max_connection_age(Some(Duration::from_millis(50)))
        .build(factory.clone())
        .await
        .unwrap();

    let handle = pool.get().await.unwrap();
    let doomed = handle.id;
    tokio::time::sleep(Duration::from_millis(80)).await;
    drop(handle);

    wait_for(|| factory.closed_count() >= 1).await;
    let next = pool.get().await.unwrap();
    assert_ne!(next.id, doomed);
    drop(next);
    pool.close().await;
}

#[tokio::test]
async fn age_reaper_retires_old_idle_connections() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .max_connection_age(Some(Duration::from_millis(50)))
        .build(factory.clone())
        .await
        .unwrap();

    wait_for(|| factory.closed_count() >= 1).await;
    pool.close().await;
}

#[tokio::test]
async fn idle_reaper_retires_idle_connections() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .max_connections_per_server(2)
        .idle_max_age(Some(Duration::from_millis(50)))
        .build(factory.clone())
        .await
        .unwrap();

    wait_for(|| factory.closed_count() >= 1).await;
    pool.close().await;
}

#[tokio::test]
async fn idle_probe_failure_destroys_the_connection() {
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .max_connections_per_server(2)
        .idle_test_period(Some(Duration::from_millis(50)))
        .build(factory.clone())
        .await
        .unwrap();

    factory.set_alive(false);
    wait_for(|| factory.closed_count() >= 1).await;
    pool.close().await;
}

#[tokio::test]
async fn dedicated_connection_bypasses_the_pool() {
    let factory = MockFactory::new();
    let target = server(0);
    let pool = Pool::builder()
        .server(target.clone())
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .build(factory.clone())
        .await
        .unwrap();

    let before = pool.state().total_created();
    let conn = pool.dedicated_connection(&target).await.unwrap();
    assert_eq!(pool.state().total_created(), before);
    drop(conn);
    assert!(factory.closed_count() >= 1);
    pool.close().await;
}

mod multiplexed {
    use super::*;
    use thrift_pool::WireProtocol;

    struct EchoStub {
        greeted: usize,
    }

    struct SumStub;

    struct MuxConn {
        stubs: ServiceStubs,
    }

    impl MultiplexedConnection for MuxConn {
        fn stubs(&self) -> &ServiceStubs {
            &self.stubs
        }

        fn stubs_mut(&mut self) -> &mut ServiceStubs {
            &mut self.stubs
        }
    }

    struct MuxFactory;

    #[async_trait]
    impl ConnectionFactory for MuxFactory {
        type Connection = MuxConn;
        type Error = String;

        async fn create(
            &self,
            _server: &ServerInfo,
            opts: &ConnectOptions,
        ) -> Result<MuxConn, String> {
            assert_eq!(opts.protocol, WireProtocol::Compact);
            let mut stubs = ServiceStubs::new();
            stubs.insert("echo", EchoStub { greeted: 0 });
            stubs.insert("sum", SumStub);
            Ok(MuxConn { stubs })
        }
    }

    #[tokio::test]
    async fn named_stubs_dispatch_by_name_and_type() {
        let pool = Pool::builder()
            .server(server(0))
            .min_connections_per_server(1)
            .max_connections_per_server(1)
            .protocol(WireProtocol::Compact)
            .build(MuxFactory)
            .await
            .unwrap();

        let mut handle = pool.get().await.unwrap();
        assert_eq!(handle.stubs().len(), 2);

        let echo = handle.client_named::<EchoStub>("echo").unwrap();
        echo.greeted += 1;
        assert!(handle.client_named::<SumStub>("sum").is_some());
        // Wrong type or unknown name both miss.
        assert!(handle.client_named::<SumStub>("echo").is_none());
        assert!(handle.client_named::<EchoStub>("missing").is_none());

        drop(handle);
        pool.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_load_preserves_partition_invariants() {
    init_tracing();
    let factory = MockFactory::new();
    let pool = Pool::builder()
        .server(server(0))
        .server(server(1))
        .min_connections_per_server(1)
        .max_connections_per_server(3)
        .connection_timeout(Duration::from_secs(2))
        .acquire_retry_delay(Duration::from_millis(5))
        .build(factory.clone())
        .await
        .unwrap();

    let mut workers = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for round in 0..25 {
                let mut handle = pool.get().await.expect("acquisition failed under load");
                tokio::time::sleep(Duration::from_millis(1)).await;
                if (worker + round) % 7 == 0 {
                    // The probe passes (the factory reports alive), so the
                    // connection survives the suspicion.
                    handle.mark_possibly_broken();
                }
                drop(handle);
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let state = pool.state();
    for partition in &state.partitions {
        assert!(partition.available <= partition.created);
        assert!(partition.created <= 3);
    }

    pool.close().await;
    wait_for(|| factory.closed_count() == factory.created_count()).await;
}
