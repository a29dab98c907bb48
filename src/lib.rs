//! A partitioned connection pool for Thrift RPC clients, designed for
//! asynchronous tokio-based transports.
//!
//! Opening a new client connection for every RPC is both inefficient and a
//! good way to exhaust file descriptors under load. This pool keeps a bounded
//! set of long-lived client connections per backend server, hands them out to
//! callers, and returns them for reuse when the caller is done.
//!
//! The pool is agnostic to the client type it is managing. Implementors of
//! the [`ConnectionFactory`] trait provide the Thrift-specific logic to open
//! a transport, wrap it in a protocol, and construct the service stubs; the
//! pool never touches the wire itself.
//!
//! Each configured server gets its own partition with a bounded FIFO of free
//! connections. A background watcher per partition refills it on demand, and
//! idle/age reapers retire connections that have outlived their usefulness.
//! Acquisition is thread-affine with fall-through: a caller first tries the
//! partition its OS thread maps to, then scans the others, and only then
//! blocks.
//!
//! # Example
//!
//! Using an imaginary "echo" Thrift service.
//!
//! ```ignore
//! use thrift_pool::{Pool, ServerInfo};
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = echo::EchoClientFactory::new();
//!     let pool = Pool::builder()
//!         .server(ServerInfo::new("10.0.0.1", 9090))
//!         .server(ServerInfo::new("10.0.0.2", 9090))
//!         .max_connections_per_server(8)
//!         .min_connections_per_server(2)
//!         .build(factory)
//!         .await
//!         .unwrap();
//!
//!     let mut client = pool.get().await.unwrap();
//!     client.echo("hello").await.unwrap();
//!     // the connection returns to its partition when `client` drops.
//! }
//! ```
#![deny(missing_docs, missing_debug_implementations)]

use std::any::Any;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

mod partition;
mod pool;
mod reaper;
mod watcher;

pub use crate::pool::{Pool, PooledHandle};

/// Address of one backend server. Identity is host/port equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerInfo {
    host: String,
    port: u16,
}

impl ServerInfo {
    /// Describes a server by host and port.
    pub fn new(host: impl Into<String>, port: u16) -> ServerInfo {
        ServerInfo {
            host: host.into(),
            port,
        }
    }

    /// The server's host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The server's port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Thrift wire protocol the factory should speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireProtocol {
    /// The default binary encoding.
    #[default]
    Binary,
    /// The compact variable-length encoding.
    Compact,
    /// JSON encoding.
    Json,
    /// Tuple encoding.
    Tuple,
}

/// Connect-time parameters handed to the [`ConnectionFactory`] on every
/// create call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Socket-level timeout for establishing the transport.
    pub connect_timeout: Duration,
    /// Wire protocol the client should be built with.
    pub protocol: WireProtocol,
}

/// Traversal direction the reapers use over a partition's free queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceOrder {
    /// Oldest entries first (insertion order).
    #[default]
    Fifo,
    /// Newest entries first.
    Lifo,
}

/// A trait which provides connection-specific functionality.
///
/// The factory is the seam between the pool engine and everything Thrift: it
/// owns the transport setup, the protocol wrapping, and the stub
/// construction. Implementations must be thread-safe; the pool calls
/// `create` concurrently from several background tasks.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The client connection type this factory produces.
    type Connection: Send + 'static;
    /// The error type returned by failed creates.
    type Error: fmt::Display + Send + 'static;

    /// Attempts to open a new client connection to `server`.
    async fn create(
        &self,
        server: &ServerInfo,
        opts: &ConnectOptions,
    ) -> Result<Self::Connection, Self::Error>;

    /// Determines if an existing connection is still usable.
    ///
    /// This is the liveness probe run against connections a caller flagged
    /// as possibly broken and against idle connections on the test period.
    /// The default implementation treats every connection as alive.
    async fn is_alive(&self, _conn: &mut Self::Connection) -> bool {
        true
    }
}

/// The pool's error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError<E> {
    /// The builder was given an unusable configuration.
    InvalidConfig(&'static str),
    /// Every configured server failed its bootstrap connection.
    NoServersAvailable,
    /// The factory failed to produce a connection within the retry budget.
    CreateFailed(E),
    /// No connection became available within the acquisition timeout.
    TimedOut,
    /// The pool has been closed.
    Closed,
}

impl<E> fmt::Display for PoolError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolError::InvalidConfig(what) => write!(f, "invalid pool configuration: {}", what),
            PoolError::NoServersAvailable => write!(f, "no servers available"),
            PoolError::CreateFailed(err) => write!(f, "failed to create connection: {}", err),
            PoolError::TimedOut => write!(f, "timed out waiting for a connection"),
            PoolError::Closed => write!(f, "the pool has been closed"),
        }
    }
}

impl<E> error::Error for PoolError<E> where E: fmt::Display + fmt::Debug {}

/// A name-to-stub map over one multiplexed transport.
///
/// In multiplexed mode the factory builds every service stub up front and
/// registers each under its service name; callers fetch them back by name
/// and type through [`PooledHandle::client_named`].
#[derive(Default)]
pub struct ServiceStubs {
    stubs: HashMap<String, Box<dyn Any + Send>>,
}

impl ServiceStubs {
    /// An empty stub set.
    pub fn new() -> ServiceStubs {
        ServiceStubs::default()
    }

    /// Registers `stub` under `name`, replacing any previous entry.
    pub fn insert<T: Any + Send>(&mut self, name: impl Into<String>, stub: T) {
        self.stubs.insert(name.into(), Box::new(stub));
    }

    /// The stub registered under `name`, if it exists and has type `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.stubs.get(name)?.downcast_ref()
    }

    /// Mutable access to the stub registered under `name`.
    pub fn get_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.stubs.get_mut(name)?.downcast_mut()
    }

    /// The registered service names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stubs.keys().map(|k| k.as_str())
    }

    /// Number of registered stubs.
    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    /// Whether no stubs are registered.
    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

impl fmt::Debug for ServiceStubs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServiceStubs")
            .field("names", &self.stubs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Implemented by connection types that carry a [`ServiceStubs`] set, i.e.
/// clients built over a multiplexed protocol.
pub trait MultiplexedConnection {
    /// The stub set prepared by the factory at create time.
    fn stubs(&self) -> &ServiceStubs;
    /// Mutable access to the stub set.
    fn stubs_mut(&mut self) -> &mut ServiceStubs;
}

/// A builder for a connection pool.
#[derive(Debug)]
pub struct Builder<F: ConnectionFactory> {
    pub(crate) servers: Vec<ServerInfo>,
    pub(crate) max_connections_per_server: u32,
    pub(crate) min_connections_per_server: u32,
    pub(crate) connect_timeout: Duration,
    pub(crate) protocol: WireProtocol,
    pub(crate) idle_max_age: Option<Duration>,
    pub(crate) idle_test_period: Option<Duration>,
    pub(crate) max_connection_age: Option<Duration>,
    pub(crate) lazy_init: bool,
    pub(crate) acquire_increment: u32,
    pub(crate) acquire_retry_attempts: u32,
    pub(crate) acquire_retry_delay: Duration,
    pub(crate) max_create_failed_count: u32,
    pub(crate) connection_timeout: Duration,
    pub(crate) availability_threshold: u32,
    pub(crate) service_order: ServiceOrder,
    pub(crate) pool_name: String,
    _p: PhantomData<F>,
}

impl<F: ConnectionFactory> Default for Builder<F> {
    fn default() -> Self {
        Builder {
            servers: Vec::new(),
            max_connections_per_server: 10,
            min_connections_per_server: 0,
            connect_timeout: Duration::from_secs(5),
            protocol: WireProtocol::Binary,
            idle_max_age: None,
            idle_test_period: None,
            max_connection_age: None,
            lazy_init: false,
            acquire_increment: 3,
            acquire_retry_attempts: 3,
            acquire_retry_delay: Duration::from_millis(250),
            max_create_failed_count: 3,
            connection_timeout: Duration::from_secs(30),
            availability_threshold: 20,
            service_order: ServiceOrder::Fifo,
            pool_name: "thrift-pool".to_owned(),
            _p: PhantomData,
        }
    }
}

impl<F: ConnectionFactory> Builder<F> {
    /// Constructs a new `Builder`.
    ///
    /// Parameters are initialized with their default values.
    pub fn new() -> Builder<F> {
        Default::default()
    }

    /// Adds a backend server to the pool.
    ///
    /// At least one server is required.
    pub fn server(mut self, server: ServerInfo) -> Builder<F> {
        self.servers.push(server);
        self
    }

    /// Replaces the server list wholesale.
    pub fn servers(mut self, servers: impl IntoIterator<Item = ServerInfo>) -> Builder<F> {
        self.servers = servers.into_iter().collect();
        self
    }

    /// Sets the maximum number of connections kept per server.
    ///
    /// Defaults to 10.
    pub fn max_connections_per_server(mut self, max: u32) -> Builder<F> {
        assert!(
            max > 0,
            "max_connections_per_server must be greater than zero!"
        );
        self.max_connections_per_server = max;
        self
    }

    /// Sets the floor the watcher fills each partition up to.
    ///
    /// Defaults to 0.
    pub fn min_connections_per_server(mut self, min: u32) -> Builder<F> {
        self.min_connections_per_server = min;
        self
    }

    /// Sets the socket-level timeout handed to the factory for each connect.
    ///
    /// Defaults to 5 seconds.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Builder<F> {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Selects the Thrift wire protocol handed to the factory.
    ///
    /// Defaults to [`WireProtocol::Binary`].
    pub fn protocol(mut self, protocol: WireProtocol) -> Builder<F> {
        self.protocol = protocol;
        self
    }

    /// Sets the idle TTL. Free connections unused for longer are closed by
    /// the idle reaper. `None` disables idle reaping.
    ///
    /// Defaults to None.
    pub fn idle_max_age(mut self, idle_max_age: Option<Duration>) -> Builder<F> {
        assert!(
            idle_max_age != Some(Duration::from_secs(0)),
            "idle_max_age must be greater than zero!"
        );
        self.idle_max_age = idle_max_age;
        self
    }

    /// Sets the liveness-probe period for idle connections. `None` disables
    /// periodic probing.
    ///
    /// Defaults to None.
    pub fn idle_test_period(mut self, idle_test_period: Option<Duration>) -> Builder<F> {
        assert!(
            idle_test_period != Some(Duration::from_secs(0)),
            "idle_test_period must be greater than zero!"
        );
        self.idle_test_period = idle_test_period;
        self
    }

    /// Sets the absolute TTL for connections. Connections older than this
    /// are closed by the age reaper, or on release while checked out.
    /// `None` disables the age limit.
    ///
    /// Defaults to None.
    pub fn max_connection_age(mut self, max_connection_age: Option<Duration>) -> Builder<F> {
        assert!(
            max_connection_age != Some(Duration::from_secs(0)),
            "max_connection_age must be greater than zero!"
        );
        self.max_connection_age = max_connection_age;
        self
    }

    /// Defers all connection creation until the first demand signal.
    ///
    /// Defaults to false: the pool eagerly opens one connection per server
    /// at build time (dropping servers that fail) and then fills each
    /// partition to the configured minimum.
    pub fn lazy_init(mut self, lazy_init: bool) -> Builder<F> {
        self.lazy_init = lazy_init;
        self
    }

    /// Sets how many connections a watcher creates per refill pass.
    ///
    /// Defaults to 3.
    pub fn acquire_increment(mut self, acquire_increment: u32) -> Builder<F> {
        assert!(
            acquire_increment > 0,
            "acquire_increment must be greater than zero!"
        );
        self.acquire_increment = acquire_increment;
        self
    }

    /// Sets how many times a single create is attempted before giving up.
    ///
    /// Defaults to 3.
    pub fn acquire_retry_attempts(mut self, acquire_retry_attempts: u32) -> Builder<F> {
        assert!(
            acquire_retry_attempts > 0,
            "acquire_retry_attempts must be greater than zero!"
        );
        self.acquire_retry_attempts = acquire_retry_attempts;
        self
    }

    /// Sets the delay between create attempts.
    ///
    /// Defaults to 250 milliseconds.
    pub fn acquire_retry_delay(mut self, acquire_retry_delay: Duration) -> Builder<F> {
        self.acquire_retry_delay = acquire_retry_delay;
        self
    }

    /// Sets how many consecutive create failures mark a server as down.
    ///
    /// Defaults to 3.
    pub fn max_create_failed_count(mut self, max_create_failed_count: u32) -> Builder<F> {
        assert!(
            max_create_failed_count > 0,
            "max_create_failed_count must be greater than zero!"
        );
        self.max_create_failed_count = max_create_failed_count;
        self
    }

    /// Sets how long [`Pool::get`] blocks for a free connection before
    /// failing with [`PoolError::TimedOut`]. `Duration::ZERO` means wait
    /// forever.
    ///
    /// Defaults to 30 seconds.
    pub fn connection_timeout(mut self, connection_timeout: Duration) -> Builder<F> {
        self.connection_timeout = connection_timeout;
        self
    }

    /// Sets the availability percentage at or below which a refill signal is
    /// posted to the partition's watcher.
    ///
    /// Defaults to 20.
    pub fn availability_threshold(mut self, availability_threshold: u32) -> Builder<F> {
        assert!(
            availability_threshold <= 100,
            "availability_threshold is a percentage!"
        );
        self.availability_threshold = availability_threshold;
        self
    }

    /// Sets the traversal direction the reapers use over each free queue.
    ///
    /// Defaults to [`ServiceOrder::Fifo`]. Acquisition order is always FIFO.
    pub fn service_order(mut self, service_order: ServiceOrder) -> Builder<F> {
        self.service_order = service_order;
        self
    }

    /// Labels the pool's background tasks in trace output.
    ///
    /// Defaults to `"thrift-pool"`.
    pub fn pool_name(mut self, pool_name: impl Into<String>) -> Builder<F> {
        self.pool_name = pool_name.into();
        self
    }
}

/// A point-in-time snapshot of one partition's counters.
#[derive(Debug, Clone)]
pub struct PartitionState {
    /// The server this partition fronts.
    pub server: ServerInfo,
    /// Connections currently accounted to this partition, free or borrowed.
    pub created: u32,
    /// Connections currently free for acquisition.
    pub available: u32,
    /// Whether the watcher currently cannot grow the partition, either
    /// because it is at its connection ceiling or because the server is
    /// latched down.
    pub growth_blocked: bool,
    /// Whether the create-failure latch has tripped for this server.
    pub server_down: bool,
}

/// A point-in-time snapshot of the whole pool.
#[derive(Debug, Clone)]
pub struct PoolState {
    /// One entry per partition, in server order.
    pub partitions: Vec<PartitionState>,
}

impl PoolState {
    /// Total connections accounted across all partitions.
    pub fn total_created(&self) -> u32 {
        self.partitions.iter().map(|p| p.created).sum()
    }

    /// Total free connections across all partitions.
    pub fn total_available(&self) -> u32 {
        self.partitions.iter().map(|p| p.available).sum()
    }
}
