//! # Service Shell
//!
//! Coordination only: wire a SQLite driver and the file-backed fabric into a
//! [`Store`], install the application's handlers and migrations, start the
//! store, then hand it to the application's serving loop.
//!
//! The shell takes no CLI arguments; configuration is environmental:
//!
//! - `LIBSDK_FABRIC_DATA_DIR`: shared fabric directory (see
//!   [`fabric_sqlite`](crate::fabric_sqlite))
//! - `LIBSDK_PUBLIC_ADDR`: listen address for apps that serve HTTP,
//!   default `":8080"` (via [`public_addr`])

use async_trait::async_trait;
use tracing::info;

use crate::driver::TxHandler;
use crate::driver_sqlite::SqliteDriver;
use crate::error::Result;
use crate::fabric::{Fabric, ReplayPolicy};
use crate::fabric_sqlite::SqliteFabric;
use crate::store::Store;

/// Environment variable naming the public listen address.
pub const PUBLIC_ADDR_ENV: &str = "LIBSDK_PUBLIC_ADDR";

/// The default public listen address.
pub const DEFAULT_PUBLIC_ADDR: &str = ":8080";

/// An application's logic, as seen by the service shell.
#[async_trait]
pub trait App: Send + Sync {
    /// The app's forward-only database migrations, in order.
    fn migrations(&self) -> Vec<String>;

    /// The named transactions available to the app.
    fn transactions(&self) -> Vec<(String, TxHandler)>;

    /// The app's serving loop. Receives the started store and returns only
    /// on fatal error.
    async fn serve(&self, store: Store) -> Result<()>;
}

/// A libsdk service: a store replicated over the fabric plus the app's
/// external handlers.
pub struct Service {
    name: String,
    store: Store,
}

impl Service {
    /// Creates a service with a SQLite store replicated over the file-backed
    /// fabric.
    pub fn new(name: &str) -> Result<Self> {
        let fabric = SqliteFabric::connect(name)?;
        let replayer = fabric.replayer("store", ReplayPolicy::FromBeginning)?;
        let driver = SqliteDriver::new(name)?;

        Ok(Self::with_store(name, Store::new(driver, replayer)))
    }

    /// Creates a service around an existing store. Useful for alternative
    /// drivers or fabrics.
    pub fn with_store(name: &str, store: Store) -> Self {
        Self {
            name: name.to_string(),
            store,
        }
    }

    /// Registers the app's transactions, migrates and replays the store,
    /// then runs the app's serving loop. Returns only on fatal error.
    pub async fn serve(&self, app: impl App) -> Result<()> {
        for (name, handler) in app.transactions() {
            self.store.register_handler(name, handler)?;
        }

        self.store.start(&app.migrations()).await?;

        info!(service = %self.name, addr = %public_addr(), "service ready");

        app.serve(self.store.clone()).await
    }

    /// The service's store; handlers use it to read and write the
    /// replicated database via [`Store::exec`].
    pub fn store(&self) -> Store {
        self.store.clone()
    }
}

/// A minimum viable [`App`]: migrations, transactions, and an async serving
/// closure.
pub struct SimpleApp<F> {
    migrations: Vec<String>,
    transactions: Vec<(String, TxHandler)>,
    serve_fn: F,
}

impl<F> SimpleApp<F> {
    /// Bundles migrations, transactions, and a serving closure into an app.
    pub fn new(
        migrations: Vec<String>,
        transactions: Vec<(String, TxHandler)>,
        serve_fn: F,
    ) -> Self {
        Self {
            migrations,
            transactions,
            serve_fn,
        }
    }
}

#[async_trait]
impl<F, Fut> App for SimpleApp<F>
where
    F: Fn(Store) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    fn migrations(&self) -> Vec<String> {
        self.migrations.clone()
    }

    fn transactions(&self) -> Vec<(String, TxHandler)> {
        self.transactions.clone()
    }

    async fn serve(&self, store: Store) -> Result<()> {
        (self.serve_fn)(store).await
    }
}

/// The address apps should listen on, from `LIBSDK_PUBLIC_ADDR`.
pub fn public_addr() -> String {
    std::env::var(PUBLIC_ADDR_ENV).unwrap_or_else(|_| DEFAULT_PUBLIC_ADDR.to_string())
}

/// Installs a `tracing` subscriber reading `RUST_LOG`. Call once from main;
/// a second call is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
