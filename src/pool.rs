//! Pool lifecycle, the acquisition strategy, the release path, and shutdown.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, debug_span, error, warn, Instrument};

use crate::partition::{Handle, Partition};
use crate::reaper::{run_age_reaper, run_idle_reaper};
use crate::watcher::{create_with_retry, run_watcher};
use crate::{
    Builder, ConnectOptions, ConnectionFactory, MultiplexedConnection, PartitionState, PoolError,
    PoolState, ServerInfo,
};

/// How long `close` waits for each background actor to observe the shutdown
/// flag before giving up on it.
const SHUTDOWN_JOIN: Duration = Duration::from_secs(5);

/// The guts of a `Pool`.
pub(crate) struct SharedPool<F>
where
    F: ConnectionFactory,
{
    pub(crate) statics: Builder<F>,
    pub(crate) connect_options: ConnectOptions,
    pub(crate) factory: F,
    pub(crate) partitions: Vec<Partition<F::Connection>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F> SharedPool<F>
where
    F: ConnectionFactory,
{
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Closes a handle's connection and settles the partition's accounting:
    /// growth is unblocked (there is room again) and a refill signal is
    /// posted if availability warrants one.
    pub(crate) fn destroy(&self, handle: Handle<F::Connection>) {
        let partition = &self.partitions[handle.partition];
        drop(handle);
        partition.decrement_created();
        partition.unblock_growth();
        if !self.is_shutting_down() {
            partition.maybe_signal();
        }
    }

    /// Puts a handle back on its partition's free queue, destroying it
    /// instead if shutdown raced in.
    pub(crate) fn reinsert(&self, handle: Handle<F::Connection>) {
        if self.is_shutting_down() {
            self.destroy(handle);
            return;
        }
        let partition = &self.partitions[handle.partition];
        if let Err(handle) = partition.offer_free(handle) {
            error!(
                server = %partition.server,
                "free queue refused a handle below capacity"
            );
            self.destroy(handle);
        }
    }
}

/// A partitioned connection pool.
pub struct Pool<F>
where
    F: ConnectionFactory,
{
    inner: Arc<SharedPool<F>>,
}

impl<F> Clone for Pool<F>
where
    F: ConnectionFactory,
{
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<F> fmt::Debug for Pool<F>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("Pool({:p})", self.inner))
    }
}

impl<F: ConnectionFactory> Builder<F> {
    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// Unless `lazy_init` is set, one connection is opened per configured
    /// server; servers whose connection fails are logged and dropped, and if
    /// none survive the build fails with [`PoolError::NoServersAvailable`].
    /// Surviving partitions are then filled to the configured minimum.
    pub async fn build(self, factory: F) -> Result<Pool<F>, PoolError<F::Error>> {
        if self.servers.is_empty() {
            return Err(PoolError::InvalidConfig("at least one server is required"));
        }
        if self.min_connections_per_server > self.max_connections_per_server {
            return Err(PoolError::InvalidConfig(
                "min_connections_per_server must be no larger than max_connections_per_server",
            ));
        }
        Pool::new_inner(self, factory).await
    }
}

/// Maps the calling OS thread onto a partition index. Tokio worker threads
/// are long-lived, so affinity holds across polls of the same task more
/// often than not.
fn affine_index(partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

impl<F: ConnectionFactory> Pool<F> {
    /// Returns a `Builder` instance to configure a new pool.
    pub fn builder() -> Builder<F> {
        Builder::new()
    }

    async fn new_inner(statics: Builder<F>, factory: F) -> Result<Pool<F>, PoolError<F::Error>> {
        let connect_options = ConnectOptions {
            connect_timeout: statics.connect_timeout,
            protocol: statics.protocol,
        };

        // Bootstrap: one eager connection per server, concurrently. Servers
        // that fail are dropped from the fleet.
        let mut seeded: Vec<(ServerInfo, Option<F::Connection>)> =
            Vec::with_capacity(statics.servers.len());
        if statics.lazy_init {
            for server in &statics.servers {
                seeded.push((server.clone(), None));
            }
        } else {
            let mut probes = FuturesUnordered::new();
            for (index, server) in statics.servers.iter().enumerate() {
                let factory = &factory;
                let opts = &connect_options;
                probes.push(async move { (index, factory.create(server, opts).await) });
            }
            let mut results: Vec<Option<F::Connection>> =
                statics.servers.iter().map(|_| None).collect();
            while let Some((index, result)) = probes.next().await {
                match result {
                    Ok(conn) => results[index] = Some(conn),
                    Err(err) => warn!(
                        server = %statics.servers[index],
                        error = %err,
                        "dropping server that failed its bootstrap connection"
                    ),
                }
            }
            for (server, conn) in statics.servers.iter().zip(results.iter_mut()) {
                if let Some(conn) = conn.take() {
                    seeded.push((server.clone(), Some(conn)));
                }
            }
            if seeded.is_empty() {
                return Err(PoolError::NoServersAvailable);
            }
        }

        let mut partitions = Vec::with_capacity(seeded.len());
        let mut signal_rxs = Vec::with_capacity(seeded.len());
        for (index, (server, seed)) in seeded.into_iter().enumerate() {
            let (partition, signal_rx) = Partition::new(
                server,
                index,
                statics.max_connections_per_server,
                statics.availability_threshold,
            );
            if let Some(conn) = seed {
                partition.increment_created();
                // The builder asserts max >= 1, so the seed always fits.
                if partition.offer_free(Handle::new(conn, index)).is_err() {
                    partition.decrement_created();
                }
            }
            partitions.push(partition);
            signal_rxs.push(signal_rx);
        }

        // Fill each surviving partition to its floor before callers arrive.
        if !statics.lazy_init && statics.min_connections_per_server > 0 {
            for partition in &partitions {
                while partition.created() < statics.min_connections_per_server {
                    match create_with_retry(
                        &factory,
                        partition,
                        &connect_options,
                        statics.acquire_retry_attempts,
                        statics.acquire_retry_delay,
                        statics.max_create_failed_count,
                    )
                    .await
                    {
                        Ok(conn) => {
                            let handle = Handle::new(conn, partition.index);
                            partition.increment_created();
                            if let Err(handle) = partition.offer_free(handle) {
                                error!(
                                    server = %partition.server,
                                    "free queue refused a handle below capacity"
                                );
                                partition.decrement_created();
                                drop(handle);
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(
                                server = %partition.server,
                                error = %err,
                                "could not fill partition to its minimum"
                            );
                            break;
                        }
                    }
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(SharedPool {
            statics,
            connect_options,
            factory,
            partitions,
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        for (index, signal_rx) in signal_rxs.into_iter().enumerate() {
            let span = debug_span!(
                "watcher",
                pool = %shared.statics.pool_name,
                server = %shared.partitions[index].server,
            );
            tasks.push(tokio::spawn(
                run_watcher(Arc::downgrade(&shared), index, signal_rx, shutdown_rx.clone())
                    .instrument(span),
            ));
        }
        let idle_period = match (shared.statics.idle_max_age, shared.statics.idle_test_period) {
            (Some(age), Some(test)) => Some(age.max(test)),
            (Some(age), None) => Some(age),
            (None, Some(test)) => Some(test),
            (None, None) => None,
        };
        if let Some(period) = idle_period {
            for index in 0..shared.partitions.len() {
                let span = debug_span!(
                    "idle_reaper",
                    pool = %shared.statics.pool_name,
                    server = %shared.partitions[index].server,
                );
                tasks.push(tokio::spawn(
                    run_idle_reaper(Arc::downgrade(&shared), index, shutdown_rx.clone(), period)
                        .instrument(span),
                ));
            }
        }
        if let Some(max_age) = shared.statics.max_connection_age {
            for index in 0..shared.partitions.len() {
                let span = debug_span!(
                    "age_reaper",
                    pool = %shared.statics.pool_name,
                    server = %shared.partitions[index].server,
                );
                tasks.push(tokio::spawn(
                    run_age_reaper(Arc::downgrade(&shared), index, shutdown_rx.clone(), max_age)
                        .instrument(span),
                ));
            }
        }
        *shared.tasks.lock().unwrap() = tasks;

        Ok(Pool { inner: shared })
    }

    /// Retrieves a connection from the pool.
    ///
    /// The caller's thread-affine partition is tried first, then the other
    /// partitions in index order, and only if every non-blocking poll misses
    /// does the call park on the affine partition for up to the configured
    /// `connection_timeout`.
    pub async fn get(&self) -> Result<PooledHandle<'_, F>, PoolError<F::Error>> {
        let start = affine_index(self.inner.partitions.len());
        self.get_from(start).await
    }

    pub(crate) async fn get_from(
        &self,
        start: usize,
    ) -> Result<PooledHandle<'_, F>, PoolError<F::Error>> {
        let shared = &self.inner;
        if shared.is_shutting_down() {
            return Err(PoolError::Closed);
        }
        let partitions = shared.partitions.len();
        for index in iter::once(start).chain((0..partitions).filter(|&i| i != start)) {
            if let Some(handle) = shared.partitions[index].poll_free() {
                if !shared.is_shutting_down() {
                    shared.partitions[index].maybe_signal();
                }
                return Ok(PooledHandle {
                    pool: self,
                    handle: Some(handle),
                });
            }
        }

        // Every non-blocking poll missed: park on the affine partition. A
        // parked caller always posts a wake, even past the availability
        // threshold or a tripped latch; the watcher re-reads the counters.
        let partition = &shared.partitions[start];
        partition.signal();
        let mut rx = match partition.poll_or_park() {
            Ok(handle) => {
                return Ok(PooledHandle {
                    pool: self,
                    handle: Some(handle),
                })
            }
            Err(rx) => rx,
        };
        if shared.is_shutting_down() {
            // close() may have cancelled the waiter list just before we
            // parked; don't wait out a timeout that can never be served.
            return Err(PoolError::Closed);
        }

        let wait = shared.statics.connection_timeout;
        let handle = if wait.is_zero() {
            (&mut rx).await.map_err(|_| PoolError::Closed)?
        } else {
            match timeout(wait, &mut rx).await {
                Ok(Ok(handle)) => handle,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    // A hand-off can race the timeout; take it if it landed.
                    match rx.try_recv() {
                        Ok(handle) => handle,
                        Err(_) => return Err(PoolError::TimedOut),
                    }
                }
            }
        };
        Ok(PooledHandle {
            pool: self,
            handle: Some(handle),
        })
    }

    /// Routes a returned handle: expired or shutdown-raced handles are
    /// destroyed, possibly-broken ones are probed off the caller's path, and
    /// healthy ones go back on their partition's free queue.
    pub(crate) fn release(&self, mut handle: Handle<F::Connection>) {
        let shared = &self.inner;
        let now = Instant::now();
        if shared.is_shutting_down()
            || handle.is_expired(shared.statics.max_connection_age, now)
        {
            shared.destroy(handle);
            return;
        }
        if handle.possibly_broken {
            let shared = shared.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move {
                        if shared.factory.is_alive(&mut handle.conn).await
                            && !shared.is_shutting_down()
                        {
                            handle.possibly_broken = false;
                            handle.last_used = Instant::now();
                            shared.reinsert(handle);
                        } else {
                            debug!(
                                server = %shared.partitions[handle.partition].server,
                                "destroying connection that failed its return probe"
                            );
                            shared.destroy(handle);
                        }
                    });
                }
                // No runtime to probe on: treat the connection as lost.
                Err(_) => shared.destroy(handle),
            }
            return;
        }
        handle.last_used = now;
        shared.reinsert(handle);
    }

    /// Returns information about the current state of the pool.
    pub fn state(&self) -> PoolState {
        PoolState {
            partitions: self
                .inner
                .partitions
                .iter()
                .map(|partition| PartitionState {
                    server: partition.server.clone(),
                    created: partition.created(),
                    available: partition.available(),
                    growth_blocked: partition.growth_blocked(),
                    server_down: partition.is_server_down(),
                })
                .collect(),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Shuts the pool down: cancels parked waiters, destroys every free
    /// connection, and joins the background actors with a bounded wait.
    /// Borrowed connections are destroyed as they are released. Idempotent.
    pub async fn close(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        for partition in &self.inner.partitions {
            partition.cancel_waiters();
        }
        for partition in &self.inner.partitions {
            partition.unblock_growth();
            for handle in partition.drain_free() {
                partition.decrement_created();
                drop(handle);
            }
        }
        let tasks = mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            if timeout(SHUTDOWN_JOIN, task).await.is_err() {
                warn!(
                    pool = %self.inner.statics.pool_name,
                    "background task did not stop within the shutdown deadline"
                );
            }
        }
        // The actors are gone; sweep anything a racing release slipped into
        // a free queue after the first drain.
        for partition in &self.inner.partitions {
            for handle in partition.drain_free() {
                partition.decrement_created();
                drop(handle);
            }
        }
        debug!(pool = %self.inner.statics.pool_name, "pool closed");
    }

    /// Opens a dedicated connection to `server` that will not be managed by
    /// the pool. This reuses the factory's configuration but otherwise
    /// bypasses the pool entirely.
    pub async fn dedicated_connection(
        &self,
        server: &ServerInfo,
    ) -> Result<F::Connection, F::Error> {
        self.inner
            .factory
            .create(server, &self.inner.connect_options)
            .await
    }
}

/// A smart pointer wrapping a pooled client connection.
///
/// Dropping the handle (or calling [`close`](PooledHandle::close)) returns
/// the connection to its partition; the transport itself stays open unless
/// the connection is expired or was marked broken and fails its probe.
pub struct PooledHandle<'a, F>
where
    F: ConnectionFactory,
{
    pool: &'a Pool<F>,
    handle: Option<Handle<F::Connection>>,
}

impl<'a, F> PooledHandle<'a, F>
where
    F: ConnectionFactory,
{
    /// The server this connection talks to.
    pub fn server(&self) -> &ServerInfo {
        &self.pool.inner.partitions[self.handle.as_ref().unwrap().partition].server
    }

    /// The user-facing client.
    pub fn client(&self) -> &F::Connection {
        &self.handle.as_ref().unwrap().conn
    }

    /// Mutable access to the user-facing client.
    pub fn client_mut(&mut self) -> &mut F::Connection {
        &mut self.handle.as_mut().unwrap().conn
    }

    /// Flags the connection as possibly broken after a caller-observed I/O
    /// error. On release the pool probes it and destroys it if the probe
    /// fails.
    pub fn mark_possibly_broken(&mut self) {
        self.handle.as_mut().unwrap().possibly_broken = true;
    }

    /// Returns the connection to the pool. Equivalent to dropping the
    /// handle; provided so call sites can make the hand-back explicit.
    pub fn close(self) {}

    /// Replaces the underlying connection while keeping this handle.
    ///
    /// The replacement is created first, under the pool's usual retry
    /// policy, so on failure the previous connection stays in place and the
    /// caller keeps a usable (if suspect) client.
    pub async fn reacquire(&mut self) -> Result<(), PoolError<F::Error>> {
        let shared = &self.pool.inner;
        let handle = self.handle.as_mut().unwrap();
        let partition = &shared.partitions[handle.partition];
        match create_with_retry(
            &shared.factory,
            partition,
            &shared.connect_options,
            shared.statics.acquire_retry_attempts,
            shared.statics.acquire_retry_delay,
            shared.statics.max_create_failed_count,
        )
        .await
        {
            Ok(conn) => {
                handle.conn = conn;
                let now = Instant::now();
                handle.created_at = now;
                handle.last_used = now;
                handle.last_reset = now;
                handle.possibly_broken = false;
                Ok(())
            }
            Err(err) => Err(PoolError::CreateFailed(err)),
        }
    }
}

impl<'a, F> PooledHandle<'a, F>
where
    F: ConnectionFactory,
    F::Connection: MultiplexedConnection,
{
    /// The service stub registered under `name`, for connections built over
    /// a multiplexed protocol.
    pub fn client_named<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.client_mut().stubs_mut().get_mut(name)
    }
}

impl<'a, F> Deref for PooledHandle<'a, F>
where
    F: ConnectionFactory,
{
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        self.client()
    }
}

impl<'a, F> DerefMut for PooledHandle<'a, F>
where
    F: ConnectionFactory,
{
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.client_mut()
    }
}

impl<'a, F> fmt::Debug for PooledHandle<'a, F>
where
    F: ConnectionFactory,
    F::Connection: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.handle.as_ref().unwrap().conn, fmt)
    }
}

impl<'a, F> Drop for PooledHandle<'a, F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct TaggedFactory {
        failing: StdMutex<HashSet<ServerInfo>>,
        alive: AtomicBool,
    }

    impl TaggedFactory {
        fn new() -> TaggedFactory {
            TaggedFactory {
                failing: StdMutex::new(HashSet::new()),
                alive: AtomicBool::new(true),
            }
        }

        fn fail_server(&self, server: &ServerInfo) {
            self.failing.lock().unwrap().insert(server.clone());
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory for Arc<TaggedFactory> {
        type Connection = String;
        type Error = String;

        async fn create(
            &self,
            server: &ServerInfo,
            _opts: &ConnectOptions,
        ) -> Result<String, String> {
            if self.failing.lock().unwrap().contains(server) {
                return Err(format!("connection refused by {}", server));
            }
            Ok(server.to_string())
        }

        async fn is_alive(&self, _conn: &mut String) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn fall_through_scans_in_index_order() {
        let a = ServerInfo::new("a", 1);
        let b = ServerInfo::new("b", 2);
        let c = ServerInfo::new("c", 3);
        let pool = Pool::builder()
            .servers([a.clone(), b.clone(), c.clone()])
            .max_connections_per_server(1)
            .min_connections_per_server(1)
            .build(Arc::new(TaggedFactory::new()))
            .await
            .unwrap();

        // Empty the affine partition, leaving one free handle in each of
        // the other two.
        let affine = pool.get_from(0).await.unwrap();
        assert_eq!(affine.server(), &a);
        // The first non-affine index wins the fall-through.
        let first = pool.get_from(0).await.unwrap();
        assert_eq!(first.server(), &b);
        let second = pool.get_from(0).await.unwrap();
        assert_eq!(second.server(), &c);

        drop(first);
        drop(second);
        drop(affine);
        pool.close().await;
    }

    #[tokio::test]
    async fn affine_index_is_stable_and_in_range() {
        let first = affine_index(3);
        let second = affine_index(3);
        assert_eq!(first, second);
        assert!(first < 3);
    }

    #[tokio::test]
    async fn downed_server_falls_through_to_healthy_partition() {
        let a = ServerInfo::new("a", 1);
        let b = ServerInfo::new("b", 2);
        let factory = Arc::new(TaggedFactory::new());
        let pool = Pool::builder()
            .servers([a.clone(), b.clone()])
            .max_connections_per_server(2)
            .min_connections_per_server(1)
            .acquire_retry_attempts(2)
            .acquire_retry_delay(Duration::from_millis(1))
            .max_create_failed_count(2)
            .connection_timeout(Duration::from_millis(200))
            .build(factory.clone())
            .await
            .unwrap();

        // Kill server a, then lose its only connection to a failed probe.
        factory.fail_server(&a);
        factory.alive.store(false, Ordering::SeqCst);
        let mut broken = pool.get_from(0).await.unwrap();
        assert_eq!(broken.server(), &a);
        broken.mark_possibly_broken();
        drop(broken);

        // Settled state: the connection destroyed, the latch tripped, and
        // the watcher's last failed pass has blocked further growth.
        wait_for(|| {
            let state = pool.state();
            state.partitions[0].server_down
                && state.partitions[0].growth_blocked
                && state.partitions[0].created == 0
        })
        .await;

        // Acquisition affine to the dead partition falls through to b.
        let handle = pool.get_from(0).await.unwrap();
        assert_eq!(handle.server(), &b);
        drop(handle);
        pool.close().await;
    }
}
