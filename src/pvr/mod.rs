//! PVR recording catalog
//!
//! Keeps a local SQLite catalog of recorded TV files in sync with the
//! recorded TV folder and answers the host's recording queries.
//! Discovery runs on the background scheduler; queries run on the caller's
//! thread against pooled connections.

pub mod callbacks;
pub mod condition;
pub mod database;
pub mod discovery;
pub mod error;
pub mod models;
pub mod recordings;
pub mod scheduler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::pvr::callbacks::{AddonCallbacks, PvrCallbacks};
use crate::pvr::condition::ScalarCondition;
use crate::pvr::database::{database_uri, default_open_flags, ConnectionPool};
use crate::pvr::discovery::discover_recordings;
use crate::pvr::models::{PvrProperties, Recording, Settings};
use crate::pvr::scheduler::Scheduler;

/// Scheduler name of the discovery task
pub const DISCOVER_RECORDINGS_TASK: &str = "discover_recordings";

/// Everything the discovery task needs, shared with the scheduler thread
struct DiscoveryContext {
    pool: ConnectionPool,
    settings: Mutex<Settings>,
    addon: Arc<dyn AddonCallbacks>,
    pvr: Arc<dyn PvrCallbacks>,
}

impl DiscoveryContext {
    fn run(&self, cancel: &ScalarCondition<bool>) -> anyhow::Result<()> {
        info!("Initiated recording discovery");

        // Copy the folder up front so the settings lock is not held during the pass
        let folder = self.settings.lock().recordedtv_folder.clone();

        let conn = self.pool.acquire()?;
        let outcome = discover_recordings(&conn, self.addon.as_ref(), &folder, cancel)
            .with_context(|| format!("recording discovery in {:?} failed", folder))?;
        drop(conn);

        if outcome.changed {
            info!("Recording discovery data changed, triggering recording update");
            self.pvr.trigger_recording_update();
        }

        info!("Recording discovery task completed");
        Ok(())
    }
}

/// Host-facing recording service
pub struct PvrService {
    context: Arc<DiscoveryContext>,
    scheduler: Scheduler,
}

impl PvrService {
    /// Open the catalog, schedule the initial discovery and start the scheduler
    pub fn new(
        properties: &PvrProperties,
        settings: Settings,
        addon: Arc<dyn AddonCallbacks>,
        pvr: Arc<dyn PvrCallbacks>,
    ) -> anyhow::Result<Self> {
        info!("Initializing PVR recording service...");

        // The user data path doesn't always exist on a fresh install
        if !properties.user_path.exists() {
            std::fs::create_dir_all(&properties.user_path)
                .map_err(error::Error::Io)
                .with_context(|| {
                    format!("Failed to create user data directory {}", properties.user_path)
                })?;
            info!("Created user data directory {}", properties.user_path);
        }

        // The file name carries the version so incompatible schemas never collide
        let db_path = properties.user_path.join(format!(
            "mcerecordings-v{}.{}.db",
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR")
        ));
        let pool = ConnectionPool::new(&database_uri(&db_path), default_open_flags())
            .context("Failed to open recording database")?;

        let service = Self {
            context: Arc::new(DiscoveryContext {
                pool,
                settings: Mutex::new(settings),
                addon,
                pvr,
            }),
            scheduler: Scheduler::with_logging_sink(),
        };

        service.schedule_discovery(service.discovery_delay());
        service.scheduler.start()?;

        info!("PVR recording service initialized");
        Ok(service)
    }

    fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.context.settings.lock().discovery_delay_ms)
    }

    /// Replace any pending discovery with one that runs after `delay`
    fn schedule_discovery(&self, delay: Duration) {
        let context = self.context.clone();
        self.scheduler.remove(DISCOVER_RECORDINGS_TASK);
        self.scheduler.add(Instant::now() + delay, DISCOVER_RECORDINGS_TASK, move |cancel| {
            context.run(cancel)
        });
    }

    /// Run a discovery pass as soon as possible
    pub fn discover_now(&self) {
        self.schedule_discovery(Duration::ZERO);
    }

    /// Apply a new recorded TV folder; rediscovers only when it changed
    pub fn on_settings_changed(&self, recordedtv_folder: &str) {
        {
            let mut settings = self.context.settings.lock();
            if settings.recordedtv_folder == recordedtv_folder {
                return;
            }
            settings.recordedtv_folder = recordedtv_folder.to_string();
        }

        info!("Setting recordedtv_folder changed to {}", recordedtv_folder);
        self.schedule_discovery(self.discovery_delay());
    }

    /// Host is going to sleep: stop background work and drop pending tasks
    pub fn on_system_sleep(&self) {
        self.scheduler.stop();
        self.scheduler.clear();
    }

    /// Host woke up: rediscover everything and restart background work
    pub fn on_system_wake(&self) -> anyhow::Result<()> {
        self.schedule_discovery(self.discovery_delay());
        self.scheduler.start()
    }

    /// Stop background work (host stop/destroy)
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn settings(&self) -> Settings {
        self.context.settings.lock().clone()
    }

    /// Number of recordings; 0 when the catalog is unavailable
    pub fn recording_count(&self) -> i64 {
        match self.context.pool.acquire() {
            Ok(conn) => recordings::get_recording_count(&conn),
            Err(e) => {
                error!("Unable to count recordings: {}", e);
                0
            }
        }
    }

    /// Invoke `callback` once per presentable recording
    pub fn enumerate_recordings<F>(&self, callback: F) -> error::Result<()>
    where
        F: FnMut(&Recording),
    {
        let conn = self.context.pool.acquire()?;
        recordings::enumerate_recordings(&conn, callback)
    }

    /// Stream URL of a recording; empty when unknown
    pub fn get_recording_stream_url(&self, recording_id: &str) -> error::Result<String> {
        let conn = self.context.pool.acquire()?;
        recordings::get_recording_stream_url(&conn, recording_id)
    }

    /// Delete a recording and its file; `Ok(false)` when it does not exist
    pub fn delete_recording(&self, recording_id: &str) -> error::Result<bool> {
        let conn = self.context.pool.acquire()?;
        recordings::delete_recording(&conn, self.context.addon.as_ref(), recording_id)
    }
}

impl Drop for PvrService {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

/// Initialize logging for recording operations
///
/// When debug_logging is false only INFO and above are shown
pub fn init_logging(debug_logging: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if debug_logging {
        // Show all logs including DEBUG
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info,mcerecordings=info")
    };

    let subscriber = fmt()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(filter)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
