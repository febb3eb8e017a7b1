//! # Sync Configuration Module
//!
//! Provides configuration management for the sync engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `SyncConfig`
//! holding the collaborators and settings the engine needs. It enforces
//! fail-fast validation so missing bridges are reported before any watcher
//! starts.
//!
//! ## Required Dependencies
//!
//! - `RemoteCloud` - The remote replica
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `LocalFileSystem` - Local writes (desktop default: tokio fs)
//! - `Clock` - Time source (default: system clock)
//! - `LoggerSink` - Host log forwarding
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{SyncConfig, SyncMode};
//! use std::sync::Arc;
//!
//! let config = SyncConfig::builder()
//!     .sync_path("/home/me/Cloud")
//!     .database_path("/home/me/.cloudsync/metadata.db")
//!     .remote(Arc::new(MyRemote::new()))
//!     .mode(SyncMode::Full)
//!     .ignore_rules(["*.log", "/build/"])
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::SyncConfig;
//!
//! // No remote: fails with an actionable error message
//! let config = SyncConfig::builder()
//!     .sync_path("/home/me/Cloud")
//!     .in_memory_database()
//!     .build()
//!     .expect("Should fail - missing remote");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, LocalFileSystem, LoggerSink, RemoteCloud, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Name of the temporary directory kept under the sync root for downloads
pub const TMP_DIR_NAME: &str = ".cloudsync-tmp";

/// Which directions are synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Remote changes are applied locally; local changes are not uploaded
    Pull,
    /// Local changes are uploaded; the remote feed is not watched
    Push,
    /// Both directions
    #[default]
    Full,
}

impl SyncMode {
    pub fn watches_local(&self) -> bool {
        matches!(self, SyncMode::Push | SyncMode::Full)
    }

    pub fn watches_remote(&self) -> bool {
        matches!(self, SyncMode::Pull | SyncMode::Full)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Pull => "pull",
            SyncMode::Push => "push",
            SyncMode::Full => "full",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pull" => Ok(SyncMode::Pull),
            "push" => Ok(SyncMode::Push),
            "full" => Ok(SyncMode::Full),
            _ => Err(Error::Config(format!("Unknown sync mode: {}", s))),
        }
    }
}

/// How paths are compared when deciding whether two documents collide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseSensitivity {
    /// Follow the platform's default filesystem
    #[default]
    Auto,
    Sensitive,
    Insensitive,
}

/// Where the metadata store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    InMemory,
}

/// Delays and polling intervals of the watchers and the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    /// How long a local unlink waits for a matching add before it becomes a delete
    pub unlink_debounce: Duration,
    /// Poll interval while checksums are still being computed
    pub checksum_poll: Duration,
    /// Poll interval of a pending directory delete waiting on its children
    pub unlink_dir_poll: Duration,
    /// Pause after a failed change when the remote is reachable
    pub retry_delay: Duration,
    /// Poll interval while waiting for the remote to come back
    pub availability_poll: Duration,
    /// Interval between two reads of the remote change feed
    pub remote_poll_interval: Duration,
    /// Time given to in-flight work on shutdown
    pub shutdown_grace: Duration,
    /// First remote backoff step
    pub backoff_base: Duration,
    /// Upper bound of the remote backoff
    pub backoff_cap: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            unlink_debounce: Duration::from_millis(1250),
            checksum_poll: Duration::from_millis(100),
            unlink_dir_poll: Duration::from_millis(350),
            retry_delay: Duration::from_secs(3),
            availability_poll: Duration::from_secs(5),
            remote_poll_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl SyncTimings {
    /// Short delays for tests driving real collaborators
    pub fn fast() -> Self {
        Self {
            unlink_debounce: Duration::from_millis(60),
            checksum_poll: Duration::from_millis(5),
            unlink_dir_poll: Duration::from_millis(15),
            retry_delay: Duration::from_millis(10),
            availability_poll: Duration::from_millis(10),
            remote_poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(20),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(50),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all = [
            ("unlink_debounce", self.unlink_debounce),
            ("checksum_poll", self.checksum_poll),
            ("unlink_dir_poll", self.unlink_dir_poll),
            ("availability_poll", self.availability_poll),
            ("remote_poll_interval", self.remote_poll_interval),
            ("backoff_base", self.backoff_base),
        ];
        if let Some((name, _)) = all.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{} must be greater than 0", name)));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(Error::Config(
                "backoff_cap must not be smaller than backoff_base".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine configuration. Use [`SyncConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct SyncConfig {
    /// Absolute path of the local replica
    pub sync_path: PathBuf,

    pub database: DatabaseLocation,

    pub local_fs: Arc<dyn LocalFileSystem>,

    pub remote: Arc<dyn RemoteCloud>,

    pub clock: Arc<dyn Clock>,

    pub logger_sink: Option<Arc<dyn LoggerSink>>,

    pub mode: SyncMode,

    /// User ignore rules, gitignore syntax, one pattern per entry
    pub ignore_rules: Vec<String>,

    /// Prepend the built-in rules (editor swap files, OS metadata, ...)
    pub use_default_ignore_rules: bool,

    pub case_sensitivity: CaseSensitivity,

    /// Send local deletions to the trash instead of removing them
    pub use_trash: bool,

    pub timings: SyncTimings,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("sync_path", &self.sync_path)
            .field("database", &self.database)
            .field("local_fs", &"LocalFileSystem { ... }")
            .field("remote", &"RemoteCloud { ... }")
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("mode", &self.mode)
            .field("ignore_rules", &self.ignore_rules)
            .field("use_default_ignore_rules", &self.use_default_ignore_rules)
            .field("case_sensitivity", &self.case_sensitivity)
            .field("use_trash", &self.use_trash)
            .field("timings", &self.timings)
            .finish()
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Directory downloads are staged in before being moved into place
    pub fn tmp_dir(&self) -> PathBuf {
        self.sync_path.join(TMP_DIR_NAME)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sync_path.as_os_str().is_empty() {
            return Err(Error::Config("Sync path cannot be empty".to_string()));
        }

        if !self.sync_path.is_absolute() {
            return Err(Error::Config(format!(
                "Sync path must be absolute, got {}",
                self.sync_path.display()
            )));
        }

        if let DatabaseLocation::File(path) = &self.database {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("Database path cannot be empty".to_string()));
            }
            if path.starts_with(&self.sync_path) {
                return Err(Error::Config(
                    "Database must not live inside the synchronized directory".to_string(),
                ));
            }
        }

        if self.ignore_rules.iter().any(|rule| rule.contains('\n')) {
            return Err(Error::Config(
                "Ignore rules must be given one pattern per entry".to_string(),
            ));
        }

        self.timings.validate()
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_local_fs() -> Result<Arc<dyn LocalFileSystem>> {
    use bridge_desktop::TokioLocalFileSystem;

    let fs: Arc<dyn LocalFileSystem> = Arc::new(TokioLocalFileSystem::new());
    Ok(fs)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_local_fs() -> Result<Arc<dyn LocalFileSystem>> {
    Err(Error::CapabilityMissing {
        capability: "LocalFileSystem".to_string(),
        message: "LocalFileSystem implementation is required to apply changes locally. \
                 Desktop: enable the 'desktop-shims' feature to use TokioLocalFileSystem. \
                 Other hosts: inject a platform filesystem adapter."
            .to_string(),
    })
}

/// Builder for constructing [`SyncConfig`] instances.
#[derive(Default)]
pub struct SyncConfigBuilder {
    sync_path: Option<PathBuf>,
    database: Option<DatabaseLocation>,
    local_fs: Option<Arc<dyn LocalFileSystem>>,
    remote: Option<Arc<dyn RemoteCloud>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    mode: SyncMode,
    ignore_rules: Vec<String>,
    skip_default_ignore_rules: bool,
    case_sensitivity: CaseSensitivity,
    permanent_delete: bool,
    timings: Option<SyncTimings>,
}

impl SyncConfigBuilder {
    /// Sets the local directory to synchronize.
    pub fn sync_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sync_path = Some(path.into());
        self
    }

    /// Sets the SQLite database file holding the metadata store.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database = Some(DatabaseLocation::File(path.into()));
        self
    }

    /// Keeps the metadata store in memory. State is lost on exit.
    pub fn in_memory_database(mut self) -> Self {
        self.database = Some(DatabaseLocation::InMemory);
        self
    }

    /// Sets the local filesystem implementation.
    ///
    /// If not provided, the desktop default is used when the `desktop-shims`
    /// feature is enabled.
    pub fn local_fs(mut self, fs: Arc<dyn LocalFileSystem>) -> Self {
        self.local_fs = Some(fs);
        self
    }

    /// Sets the remote implementation (required).
    pub fn remote(mut self, remote: Arc<dyn RemoteCloud>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Adds user ignore rules.
    pub fn ignore_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_rules.extend(rules.into_iter().map(Into::into));
        self
    }

    /// Adds rules read from an ignore file's content, one per line.
    pub fn ignore_file_content(mut self, content: &str) -> Self {
        self.ignore_rules
            .extend(content.lines().map(|line| line.to_string()));
        self
    }

    /// Disables the built-in ignore rules.
    pub fn without_default_ignore_rules(mut self) -> Self {
        self.skip_default_ignore_rules = true;
        self
    }

    pub fn case_sensitivity(mut self, case_sensitivity: CaseSensitivity) -> Self {
        self.case_sensitivity = case_sensitivity;
        self
    }

    /// Deletes local files permanently instead of moving them to the trash.
    pub fn permanent_delete(mut self) -> Self {
        self.permanent_delete = true;
        self
    }

    pub fn timings(mut self, timings: SyncTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - `Error::Config` when the sync path or database is missing or invalid
    /// - `Error::CapabilityMissing` when no remote is injected, or no local
    ///   filesystem is available for this platform
    pub fn build(self) -> Result<SyncConfig> {
        let sync_path = self.sync_path.ok_or_else(|| {
            Error::Config("Sync path is required. Use .sync_path() to set it.".to_string())
        })?;

        let database = self.database.ok_or_else(|| {
            Error::Config(
                "Database location is required. Use .database_path() or .in_memory_database()."
                    .to_string(),
            )
        })?;

        let remote = self.remote.ok_or_else(|| Error::CapabilityMissing {
            capability: "RemoteCloud".to_string(),
            message: "RemoteCloud implementation is required to reach the remote replica. \
                     Inject a client for your cloud with .remote()."
                .to_string(),
        })?;

        let local_fs = match self.local_fs {
            Some(fs) => fs,
            None => provide_default_local_fs()?,
        };

        let config = SyncConfig {
            sync_path,
            database,
            local_fs,
            remote,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
            mode: self.mode,
            ignore_rules: self.ignore_rules,
            use_default_ignore_rules: !self.skip_default_ignore_rules,
            case_sensitivity: self.case_sensitivity,
            use_trash: !self.permanent_delete,
            timings: self.timings.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::testing::{MemoryCloud, MemoryFileSystem};

    fn builder() -> SyncConfigBuilder {
        SyncConfig::builder()
            .sync_path("/home/me/Cloud")
            .in_memory_database()
            .local_fs(Arc::new(MemoryFileSystem::new()))
            .remote(Arc::new(MemoryCloud::new()))
    }

    #[test]
    fn test_build_with_defaults() {
        let config = builder().build().unwrap();

        assert_eq!(config.mode, SyncMode::Full);
        assert!(config.use_trash);
        assert!(config.use_default_ignore_rules);
        assert_eq!(config.case_sensitivity, CaseSensitivity::Auto);
        assert_eq!(config.timings, SyncTimings::default());
        assert_eq!(config.tmp_dir(), PathBuf::from("/home/me/Cloud/.cloudsync-tmp"));
    }

    #[test]
    fn test_builder_requires_sync_path() {
        let result = SyncConfig::builder()
            .in_memory_database()
            .remote(Arc::new(MemoryCloud::new()))
            .build();

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Sync path is required"));
    }

    #[test]
    fn test_builder_requires_remote() {
        let result = SyncConfig::builder()
            .sync_path("/home/me/Cloud")
            .in_memory_database()
            .local_fs(Arc::new(MemoryFileSystem::new()))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "RemoteCloud")
            }
            other => panic!("expected missing capability, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_local_fs_without_desktop_shims() {
        let result = SyncConfig::builder()
            .sync_path("/home/me/Cloud")
            .in_memory_database()
            .remote(Arc::new(MemoryCloud::new()))
            .build();

        assert!(matches!(result, Err(Error::CapabilityMissing { .. })));
    }

    #[test]
    fn test_relative_sync_path_rejected() {
        let result = builder().sync_path("Cloud").build();
        assert!(result.unwrap_err().to_string().contains("must be absolute"));
    }

    #[test]
    fn test_database_inside_sync_path_rejected() {
        let result = builder()
            .database_path("/home/me/Cloud/.db/metadata.db")
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must not live inside"));
    }

    #[test]
    fn test_ignore_file_content_splits_lines() {
        let config = builder()
            .ignore_rules(["*.log"])
            .ignore_file_content("/build/\n!keep.log\n")
            .without_default_ignore_rules()
            .permanent_delete()
            .build()
            .unwrap();

        assert_eq!(config.ignore_rules, vec!["*.log", "/build/", "!keep.log"]);
        assert!(!config.use_default_ignore_rules);
        assert!(!config.use_trash);
    }

    #[test]
    fn test_invalid_timings_rejected() {
        let timings = SyncTimings {
            backoff_cap: Duration::from_millis(1),
            ..SyncTimings::default()
        };
        assert!(builder().timings(timings).build().is_err());

        let timings = SyncTimings {
            checksum_poll: Duration::ZERO,
            ..SyncTimings::fast()
        };
        let err = builder().timings(timings).build().unwrap_err();
        assert!(err.to_string().contains("checksum_poll"));
    }

    #[test]
    fn test_sync_mode_directions() {
        assert!(SyncMode::Full.watches_local() && SyncMode::Full.watches_remote());
        assert!(!SyncMode::Pull.watches_local());
        assert!(!SyncMode::Push.watches_remote());
        assert_eq!("push".parse::<SyncMode>().unwrap(), SyncMode::Push);
        assert!("both".parse::<SyncMode>().is_err());
    }
}
