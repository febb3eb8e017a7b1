//! # Sync Coordinator
//!
//! Assembles the pipeline from a [`SyncConfig`] and drives it.
//!
//! ## Overview
//!
//! ```text
//! watcher events ─▶ LocalWatcher ─┐
//!                                 ├─▶ Prep ─▶ Merge ─▶ store ─▶ SyncEngine ─▶ LocalWriter / RemoteWriter
//!   change feed ─▶ RemoteWatcher ─┘
//! ```
//!
//! The host feeds raw filesystem events through [`SyncCoordinator::watcher_events`]
//! and follows progress on [`SyncCoordinator::events`] or
//! [`SyncCoordinator::state`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_runtime::config::SyncConfig;
//! use core_sync::SyncCoordinator;
//! use std::sync::Arc;
//!
//! # async fn example(config: SyncConfig) -> core_sync::Result<()> {
//! let coordinator = Arc::new(SyncCoordinator::new(config).await?);
//! let events = coordinator.watcher_events();
//!
//! let running = tokio::spawn({
//!     let coordinator = coordinator.clone();
//!     async move { coordinator.start().await }
//! });
//! // ... forward WatcherEvents into `events` ...
//! coordinator.stop().await;
//! running.await.ok();
//! # Ok(())
//! # }
//! ```

use bridge_traits::{LocalFileSystem, WatcherEvent};
use core_metadata::{
    create_pool, platform_normalizer, CaseInsensitive, CaseSensitive, DatabaseConfig,
    MetadataStore, Normalizer, SqliteMetadataStore,
};
use core_runtime::config::{CaseSensitivity, DatabaseLocation, SyncConfig};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent, DEFAULT_EVENT_BUFFER_SIZE};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::ignore::IgnoreRules;
use crate::local::{Checksumer, LocalRenamer, LocalWatcher, LocalWriter};
use crate::merge::Merge;
use crate::prep::Prep;
use crate::remote::{RemoteWatcher, RemoteWriter};
use crate::state::{SyncState, SyncStateTracker};

/// Raw watcher events buffered before the local watcher applies back-pressure
const WATCHER_CHANNEL_SIZE: usize = 1024;

pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    state: SyncStateTracker,
    prep: Arc<Prep>,
    local_watcher: Arc<LocalWatcher>,
    remote_watcher: Arc<RemoteWatcher>,
    engine: Arc<SyncEngine>,
    watcher_tx: mpsc::Sender<WatcherEvent>,
    watcher_rx: Mutex<Option<mpsc::Receiver<WatcherEvent>>>,
}

impl SyncCoordinator {
    /// Validate the configuration, open the store and wire every component
    pub async fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let database = match &config.database {
            DatabaseLocation::File(path) => DatabaseConfig::new(path),
            DatabaseLocation::InMemory => DatabaseConfig::in_memory(),
        };
        let pool = create_pool(database).await?;
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(pool).await?);

        let normalizer: Arc<dyn Normalizer> = match config.case_sensitivity {
            CaseSensitivity::Auto => platform_normalizer(),
            CaseSensitivity::Sensitive => Arc::new(CaseSensitive),
            CaseSensitivity::Insensitive => Arc::new(CaseInsensitive),
        };
        let case_insensitive = match config.case_sensitivity {
            CaseSensitivity::Auto => cfg!(any(target_os = "macos", windows)),
            CaseSensitivity::Sensitive => false,
            CaseSensitivity::Insensitive => true,
        };
        let ignore = Arc::new(IgnoreRules::with_defaults(
            &config.ignore_rules,
            config.use_default_ignore_rules,
            case_insensitive,
        )?);

        let events = EventBus::new(DEFAULT_EVENT_BUFFER_SIZE);
        let state = SyncStateTracker::new();
        let fs = config.local_fs.clone();
        let remote = config.remote.clone();

        let local_renamer = Arc::new(LocalRenamer::new(fs.clone(), &config.sync_path));
        let remote_writer = Arc::new(RemoteWriter::new(
            remote.clone(),
            fs.clone(),
            events.clone(),
            &config.sync_path,
        ));
        let merge = Arc::new(Merge::new(
            store.clone(),
            normalizer.clone(),
            config.clock.clone(),
            events.clone(),
            local_renamer.clone(),
            remote_writer.clone(),
        ));
        let prep = Arc::new(Prep::new(merge, ignore.clone(), normalizer));

        let local_writer = Arc::new(LocalWriter::new(
            fs.clone(),
            remote.clone(),
            store.clone(),
            events.clone(),
            &config.sync_path,
            config.tmp_dir(),
            config.use_trash,
        ));
        let local_watcher = Arc::new(LocalWatcher::new(
            &config.sync_path,
            prep.clone(),
            store.clone(),
            Arc::new(Checksumer::new(fs)),
            local_renamer,
            events.clone(),
            config.timings,
        ));
        let remote_watcher = Arc::new(RemoteWatcher::new(
            remote.clone(),
            prep.clone(),
            store.clone(),
            events.clone(),
            config.timings,
        ));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            ignore,
            local_writer,
            remote_writer,
            remote,
            events.clone(),
            state.clone(),
            config.timings,
        ));

        let (watcher_tx, watcher_rx) = mpsc::channel(WATCHER_CHANNEL_SIZE);
        info!(
            path = %config.sync_path.display(),
            mode = config.mode.as_str(),
            "Sync configured"
        );

        Ok(Self {
            config,
            store,
            events,
            state,
            prep,
            local_watcher,
            remote_watcher,
            engine,
            watcher_tx,
            watcher_rx: Mutex::new(Some(watcher_rx)),
        })
    }

    /// Sender the host forwards raw filesystem watcher events to
    pub fn watcher_events(&self) -> mpsc::Sender<WatcherEvent> {
        self.watcher_tx.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> &SyncStateTracker {
        &self.state
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn prep(&self) -> &Arc<Prep> {
        &self.prep
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn local_watcher(&self) -> &Arc<LocalWatcher> {
        &self.local_watcher
    }

    pub fn remote_watcher(&self) -> &Arc<RemoteWatcher> {
        &self.remote_watcher
    }

    /// Run the detectors selected by the sync mode and the engine. Returns
    /// once [`stop`](Self::stop) completed or the first fatal error.
    #[instrument(skip(self), fields(mode = self.config.mode.as_str()))]
    pub async fn start(&self) -> Result<()> {
        let receiver = self
            .watcher_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| SyncError::validation("coordinator", "already started"))?;
        self.config
            .local_fs
            .create_dir_all(&self.config.sync_path)
            .await?;

        let mode = self.config.mode;
        let local = async {
            if mode.watches_local() {
                self.local_watcher.clone().run(receiver).await
            } else {
                drop(receiver);
                Ok(())
            }
        };
        let remote = async {
            if mode.watches_remote() {
                self.remote_watcher.clone().run().await
            } else {
                Ok(())
            }
        };
        let engine = self.engine.run();

        info!("Sync started");
        let result = futures::future::try_join3(local, remote, engine).await;
        match result {
            Ok(_) => {
                info!("Sync stopped");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Sync stopped on error");
                if !matches!(self.state.current(), SyncState::Error { .. }) {
                    self.state.set_fatal(err.to_string());
                    let _ = self.events.emit(CoreEvent::Sync(SyncEvent::Fatal {
                        message: err.to_string(),
                    }));
                }
                self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Stop accepting events, record pending local operations, apply what is
    /// left within `shutdown_grace`, and stop every loop
    pub async fn stop(&self) {
        info!("Stopping sync");
        self.local_watcher.stop().await;
        self.remote_watcher.stop();
        let drained = tokio::time::timeout(
            self.config.timings.shutdown_grace,
            self.engine.sync_pending(),
        )
        .await;
        match drained {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "Could not apply every change before stopping"),
            Err(_) => warn!("Changes still pending at shutdown"),
        }
        self.engine.stop();
    }

    async fn shutdown(&self) {
        self.local_watcher.stop().await;
        self.remote_watcher.stop();
        self.engine.stop();
    }
}
