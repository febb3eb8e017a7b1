//! In-memory collaborators for tests
//!
//! [`MemoryFileSystem`] and [`MemoryCloud`] implement the bridge traits over
//! plain maps so engine tests can run without touching the disk or the
//! network. Both record the mutating calls they receive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{BridgeError, Result};
use crate::remote::{
    ChangesPage, RemoteChange, RemoteCloud, RemoteDoc, RemoteDocType, RemotePatch, UploadOptions,
    ROOT_DIR_ID,
};
use crate::storage::{DynAsyncRead, FileStat, LocalFileSystem};
use crate::time::Clock;

fn not_found(path: &Path) -> BridgeError {
    BridgeError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    ))
}

async fn drain(mut content: Box<DynAsyncRead>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    content.read_to_end(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// Clock
// ============================================================================

/// Clock returning a settable instant
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Local filesystem
// ============================================================================

#[derive(Debug, Clone)]
enum Node {
    Dir {
        modified: Option<DateTime<Utc>>,
    },
    File {
        content: Vec<u8>,
        modified: Option<DateTime<Utc>>,
        executable: bool,
    },
}

/// Open read streams, and the most ever open at once
#[derive(Debug, Default)]
struct ReadGauge {
    open: AtomicUsize,
    peak: AtomicUsize,
}

/// Read stream counted as open until dropped
struct GaugedReader {
    inner: std::io::Cursor<Vec<u8>>,
    gauge: Arc<ReadGauge>,
}

impl GaugedReader {
    fn open(gauge: Arc<ReadGauge>) -> Self {
        let open = gauge.open.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(open, Ordering::SeqCst);
        Self {
            inner: std::io::Cursor::new(Vec::new()),
            gauge,
        }
    }
}

impl AsyncRead for GaugedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for GaugedReader {
    fn drop(&mut self) {
        self.gauge.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Map-backed [`LocalFileSystem`]
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
    trashed: Mutex<Vec<PathBuf>>,
    ops: Mutex<Vec<String>>,
    read_delay: Mutex<Option<Duration>>,
    reads: Arc<ReadGauge>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a file (and its ancestors) without recording an operation
    pub fn seed_file(&self, path: impl AsRef<Path>, content: &[u8]) {
        let path = path.as_ref();
        let mut nodes = self.nodes.lock().unwrap();
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir { modified: None });
        }
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                content: content.to_vec(),
                modified: None,
                executable: false,
            },
        );
    }

    pub fn seed_dir(&self, path: impl AsRef<Path>) {
        let mut nodes = self.nodes.lock().unwrap();
        for ancestor in path.as_ref().ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir { modified: None });
        }
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path.as_ref()) {
            Some(Node::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        matches!(
            self.nodes.lock().unwrap().get(path.as_ref()),
            Some(Node::Dir { .. })
        )
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.nodes.lock().unwrap().contains_key(path.as_ref())
    }

    pub fn is_executable(&self, path: impl AsRef<Path>) -> bool {
        matches!(
            self.nodes.lock().unwrap().get(path.as_ref()),
            Some(Node::File {
                executable: true,
                ..
            })
        )
    }

    pub fn modified(&self, path: impl AsRef<Path>) -> Option<DateTime<Utc>> {
        match self.nodes.lock().unwrap().get(path.as_ref()) {
            Some(Node::File { modified, .. }) | Some(Node::Dir { modified }) => *modified,
            None => None,
        }
    }

    /// Every path strictly under `root`, relative to it, in sorted order
    pub fn relative_paths(&self, root: impl AsRef<Path>) -> Vec<String> {
        let root = root.as_ref();
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .filter_map(|p| p.strip_prefix(root).ok())
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    pub fn trashed(&self) -> Vec<PathBuf> {
        self.trashed.lock().unwrap().clone()
    }

    /// Make every read stream take `delay` to open
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Most read streams ever open at the same time
    pub fn peak_open_reads(&self) -> usize {
        self.reads.peak.load(Ordering::SeqCst)
    }

    /// Mutating calls received so far, e.g. `rename a -> b`
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn detach(&self, path: &Path) -> Vec<(PathBuf, Node)> {
        let mut nodes = self.nodes.lock().unwrap();
        let keys: Vec<PathBuf> = nodes
            .keys()
            .filter(|k| k.starts_with(path))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| nodes.remove(&k).map(|n| (k, n)))
            .collect()
    }
}

#[async_trait]
impl LocalFileSystem for MemoryFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.contains(path))
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::Dir { modified }) => Ok(FileStat {
                modified: *modified,
                ..FileStat::directory()
            }),
            Some(Node::File {
                content,
                modified,
                executable,
            }) => Ok(FileStat {
                modified: *modified,
                executable: *executable,
                ..FileStat::file(content.len() as u64)
            }),
            None => Err(not_found(path)),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.seed_dir(path);
        self.record(format!("mkdir {}", path.display()));
        Ok(())
    }

    async fn open_read_stream(&self, path: &Path) -> Result<Box<DynAsyncRead>> {
        let mut reader = GaugedReader::open(self.reads.clone());
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let content = self.read(path).ok_or_else(|| not_found(path))?;
        reader.inner = std::io::Cursor::new(content);
        Ok(Box::new(reader))
    }

    async fn write_stream(&self, path: &Path, content: Box<DynAsyncRead>) -> Result<u64> {
        let content = drain(content).await?;
        let mut nodes = self.nodes.lock().unwrap();
        let parent_ok = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                matches!(nodes.get(parent), Some(Node::Dir { .. }))
            }
            _ => true,
        };
        if !parent_ok {
            return Err(not_found(path));
        }
        let len = content.len() as u64;
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                content,
                modified: None,
                executable: false,
            },
        );
        drop(nodes);
        self.record(format!("write {}", path.display()));
        Ok(len)
    }

    async fn set_modified(&self, path: &Path, at: DateTime<Utc>) -> Result<()> {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(Node::File { modified, .. }) | Some(Node::Dir { modified }) => {
                *modified = Some(at);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    async fn set_executable(&self, path: &Path, value: bool) -> Result<()> {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(Node::File { executable, .. }) => {
                *executable = value;
                Ok(())
            }
            Some(Node::Dir { .. }) => Ok(()),
            None => Err(not_found(path)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if !self.contains(from) {
            return Err(not_found(from));
        }
        let moved = self.detach(from);
        let mut nodes = self.nodes.lock().unwrap();
        for (old, node) in moved {
            let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            nodes.insert(new, node);
        }
        drop(nodes);
        self.record(format!("rename {} -> {}", from.display(), to.display()));
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let has_children = nodes.keys().any(|k| k != path && k.starts_with(path));
        if has_children {
            return Err(BridgeError::OperationFailed(format!(
                "{} is not empty",
                path.display()
            )));
        }
        nodes.remove(path).ok_or_else(|| not_found(path))?;
        drop(nodes);
        self.record(format!("rmdir {}", path.display()));
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        self.detach(path);
        self.record(format!("remove {}", path.display()));
        Ok(())
    }

    async fn trash(&self, path: &Path) -> Result<()> {
        if self.detach(path).is_empty() {
            return Err(not_found(path));
        }
        self.trashed.lock().unwrap().push(path.to_path_buf());
        self.record(format!("trash {}", path.display()));
        Ok(())
    }
}

// ============================================================================
// Remote cloud
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    doc: RemoteDoc,
    content: Vec<u8>,
    trashed: bool,
}

#[derive(Debug, Default)]
struct CloudState {
    entries: BTreeMap<String, Entry>,
    /// id -> seq of its latest change
    feed: HashMap<String, u64>,
    seq: u64,
    next_id: u64,
}

impl CloudState {
    fn bump(&mut self, id: &str) {
        self.seq += 1;
        self.feed.insert(id.to_string(), self.seq);
    }

    fn next_rev(rev: &str) -> String {
        let n: u64 = rev
            .split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        format!("{}-mem", n + 1)
    }

    fn live_by_path(&self, path: &str) -> Option<&Entry> {
        self.entries
            .values()
            .find(|e| !e.trashed && e.doc.path == path)
    }

    fn live(&self, id: &str) -> Result<&Entry> {
        self.entries
            .get(id)
            .filter(|e| !e.trashed)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }

    fn check_rev(&self, id: &str, rev: &str) -> Result<()> {
        let entry = self.live(id)?;
        if entry.doc.rev != rev {
            return Err(BridgeError::Conflict(id.to_string()));
        }
        Ok(())
    }

    fn child_path(&self, dir_id: &str, name: &str) -> Result<String> {
        let dir = self.live(dir_id)?;
        if !dir.doc.is_directory() {
            return Err(BridgeError::NotFound(dir_id.to_string()));
        }
        let path = if dir.doc.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{}", dir.doc.path, name)
        };
        if self.live_by_path(&path).is_some() {
            return Err(BridgeError::Conflict(path));
        }
        Ok(path)
    }

    fn insert(
        &mut self,
        doc_type: RemoteDocType,
        dir_id: &str,
        path: String,
        content: Vec<u8>,
        options: UploadOptions,
    ) -> RemoteDoc {
        self.next_id += 1;
        let id = format!("remote-{}", self.next_id);
        let doc = RemoteDoc {
            id: id.clone(),
            rev: "1-mem".to_string(),
            doc_type,
            path,
            dir_id: Some(dir_id.to_string()),
            md5sum: options.checksum,
            size: (doc_type == RemoteDocType::File).then_some(content.len() as u64),
            executable: options.executable,
            mime: options.mime,
            tags: Vec::new(),
            created_at: options.last_modified,
            updated_at: options.last_modified,
        };
        self.entries.insert(
            id.clone(),
            Entry {
                doc: doc.clone(),
                content,
                trashed: false,
            },
        );
        self.bump(&id);
        doc
    }
}

/// Map-backed [`RemoteCloud`] with a CouchDB-like change feed
///
/// The feed lists each document once, at the sequence of its latest change.
#[derive(Debug)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    online: AtomicBool,
    failures: Mutex<VecDeque<BridgeError>>,
    ops: Mutex<Vec<String>>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        let mut state = CloudState::default();
        state.entries.insert(
            ROOT_DIR_ID.to_string(),
            Entry {
                doc: RemoteDoc {
                    id: ROOT_DIR_ID.to_string(),
                    rev: "1-mem".to_string(),
                    doc_type: RemoteDocType::Directory,
                    path: "/".to_string(),
                    dir_id: None,
                    md5sum: None,
                    size: None,
                    executable: false,
                    mime: None,
                    tags: Vec::new(),
                    created_at: None,
                    updated_at: None,
                },
                content: Vec::new(),
                trashed: false,
            },
        );
        Self {
            state: Mutex::new(state),
            online: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Create a directory at an absolute path, creating missing ancestors
    pub fn seed_directory(&self, path: &str) -> RemoteDoc {
        let mut state = self.state.lock().unwrap();
        let mut dir_id = ROOT_DIR_ID.to_string();
        let mut current = String::new();
        let mut last = state.live(ROOT_DIR_ID).map(|e| e.doc.clone()).ok();
        for part in path.trim_matches('/').split('/').filter(|p| !p.is_empty()) {
            current = format!("{current}/{part}");
            let existing = state.live_by_path(&current).map(|e| e.doc.clone());
            let doc = match existing {
                Some(doc) => doc,
                None => state.insert(
                    RemoteDocType::Directory,
                    &dir_id,
                    current.clone(),
                    Vec::new(),
                    UploadOptions::default(),
                ),
            };
            dir_id = doc.id.clone();
            last = Some(doc);
        }
        last.unwrap_or_else(|| state.entries[ROOT_DIR_ID].doc.clone())
    }

    /// Create a file at an absolute path, creating missing ancestor directories
    pub fn seed_file(&self, path: &str, content: &[u8], checksum: &str) -> RemoteDoc {
        let (parent, _) = path.rsplit_once('/').unwrap_or(("", path));
        let dir = self.seed_directory(parent);
        let mut state = self.state.lock().unwrap();
        state.insert(
            RemoteDocType::File,
            &dir.id,
            path.to_string(),
            content.to_vec(),
            UploadOptions {
                checksum: Some(checksum.to_string()),
                ..UploadOptions::default()
            },
        )
    }

    pub fn by_path(&self, path: &str) -> Option<RemoteDoc> {
        self.state
            .lock()
            .unwrap()
            .live_by_path(path)
            .map(|e| e.doc.clone())
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(id)
            .map(|e| e.content.clone())
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(id)
            .map(|e| e.trashed)
            .unwrap_or(false)
    }

    /// Every live path except the root, sorted
    pub fn paths(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut paths: Vec<String> = state
            .entries
            .values()
            .filter(|e| !e.trashed && e.doc.id != ROOT_DIR_ID)
            .map(|e| e.doc.path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Queue an error returned by the next mutating call or feed read
    pub fn fail_next(&self, err: BridgeError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn take_failure(&self) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BridgeError::Unreachable("offline".to_string()));
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteCloud for MemoryCloud {
    async fn changes(&self, since: &str) -> Result<ChangesPage> {
        self.take_failure()?;
        let since: u64 = since.parse().unwrap_or(0);
        let state = self.state.lock().unwrap();
        let mut entries: Vec<(&String, &u64)> =
            state.feed.iter().filter(|(_, seq)| **seq > since).collect();
        entries.sort_by_key(|(_, seq)| **seq);
        let changes = entries
            .into_iter()
            .filter_map(|(id, seq)| {
                let entry = state.entries.get(id)?;
                Some(RemoteChange {
                    id: id.clone(),
                    seq: seq.to_string(),
                    deleted: entry.trashed,
                    doc: (!entry.trashed).then(|| entry.doc.clone()),
                })
            })
            .collect();
        Ok(ChangesPage {
            changes,
            last_seq: state.seq.to_string(),
        })
    }

    async fn last_seq(&self) -> Result<String> {
        self.take_failure()?;
        Ok(self.state.lock().unwrap().seq.to_string())
    }

    async fn list_by_type(&self, doc_type: RemoteDocType) -> Result<Vec<RemoteDoc>> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        let mut docs: Vec<RemoteDoc> = state
            .entries
            .values()
            .filter(|e| !e.trashed && e.doc.doc_type == doc_type && e.doc.id != ROOT_DIR_ID)
            .map(|e| e.doc.clone())
            .collect();
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn ping(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn find_directory_by_path(&self, path: &str) -> Result<RemoteDoc> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        state
            .live_by_path(path)
            .filter(|e| e.doc.is_directory())
            .map(|e| e.doc.clone())
            .ok_or_else(|| BridgeError::NotFound(path.to_string()))
    }

    async fn create_directory(
        &self,
        dir_id: &str,
        name: &str,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteDoc> {
        self.take_failure()?;
        let doc = {
            let mut state = self.state.lock().unwrap();
            let path = state.child_path(dir_id, name)?;
            state.insert(
                RemoteDocType::Directory,
                dir_id,
                path,
                Vec::new(),
                UploadOptions {
                    last_modified,
                    ..UploadOptions::default()
                },
            )
        };
        self.record(format!("create_directory {}", doc.path));
        Ok(doc)
    }

    async fn upload_file(
        &self,
        dir_id: &str,
        name: &str,
        content: Box<DynAsyncRead>,
        options: UploadOptions,
    ) -> Result<RemoteDoc> {
        self.take_failure()?;
        let content = drain(content).await?;
        let doc = {
            let mut state = self.state.lock().unwrap();
            let path = state.child_path(dir_id, name)?;
            state.insert(RemoteDocType::File, dir_id, path, content, options)
        };
        self.record(format!("upload_file {}", doc.path));
        Ok(doc)
    }

    async fn overwrite_file(
        &self,
        id: &str,
        rev: &str,
        content: Box<DynAsyncRead>,
        options: UploadOptions,
    ) -> Result<RemoteDoc> {
        self.take_failure()?;
        let content = drain(content).await?;
        let doc = {
            let mut state = self.state.lock().unwrap();
            state.check_rev(id, rev)?;
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
            entry.doc.rev = CloudState::next_rev(&entry.doc.rev);
            entry.doc.md5sum = options.checksum;
            entry.doc.size = Some(content.len() as u64);
            entry.doc.executable = options.executable;
            entry.doc.updated_at = options.last_modified.or(entry.doc.updated_at);
            entry.content = content;
            let doc = entry.doc.clone();
            state.bump(id);
            doc
        };
        self.record(format!("overwrite_file {}", doc.path));
        Ok(doc)
    }

    async fn update_attributes(
        &self,
        id: &str,
        rev: &str,
        patch: RemotePatch,
    ) -> Result<RemoteDoc> {
        self.take_failure()?;
        let doc = {
            let mut state = self.state.lock().unwrap();
            state.check_rev(id, rev)?;
            let current = state.live(id)?.doc.clone();
            let new_path = if patch.name.is_some() || patch.dir_id.is_some() {
                let dir_id = patch
                    .dir_id
                    .clone()
                    .or_else(|| current.dir_id.clone())
                    .unwrap_or_else(|| ROOT_DIR_ID.to_string());
                let name = patch
                    .name
                    .clone()
                    .unwrap_or_else(|| current.name().to_string());
                let path = state.child_path(&dir_id, &name).or_else(|err| {
                    // Renaming onto itself is not a clash
                    match &err {
                        BridgeError::Conflict(target) if *target == current.path => {
                            Ok(current.path.clone())
                        }
                        _ => Err(err),
                    }
                })?;
                Some((dir_id, path))
            } else {
                None
            };

            if let Some((dir_id, path)) = &new_path {
                let old_prefix = format!("{}/", current.path);
                let descendants: Vec<String> = state
                    .entries
                    .values()
                    .filter(|e| !e.trashed && e.doc.path.starts_with(&old_prefix))
                    .map(|e| e.doc.id.clone())
                    .collect();
                for child in descendants {
                    if let Some(entry) = state.entries.get_mut(&child) {
                        let rest = entry.doc.path[old_prefix.len()..].to_string();
                        entry.doc.path = format!("{path}/{rest}");
                        entry.doc.rev = CloudState::next_rev(&entry.doc.rev);
                    }
                    state.bump(&child);
                }
                if let Some(entry) = state.entries.get_mut(id) {
                    entry.doc.path = path.clone();
                    entry.doc.dir_id = Some(dir_id.clone());
                }
            }

            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
            if let Some(executable) = patch.executable {
                entry.doc.executable = executable;
            }
            if let Some(tags) = patch.tags {
                entry.doc.tags = tags;
            }
            if patch.updated_at.is_some() {
                entry.doc.updated_at = patch.updated_at;
            }
            entry.doc.rev = CloudState::next_rev(&entry.doc.rev);
            let doc = entry.doc.clone();
            state.bump(id);
            doc
        };
        self.record(format!("update_attributes {} {}", id, doc.path));
        Ok(doc)
    }

    async fn trash(&self, id: &str, rev: &str) -> Result<()> {
        self.take_failure()?;
        let path = {
            let mut state = self.state.lock().unwrap();
            state.check_rev(id, rev)?;
            let path = state.live(id)?.doc.path.clone();
            let prefix = format!("{path}/");
            let doomed: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.doc.id == id || e.doc.path.starts_with(&prefix))
                .map(|e| e.doc.id.clone())
                .collect();
            for doomed_id in doomed {
                if let Some(entry) = state.entries.get_mut(&doomed_id) {
                    entry.trashed = true;
                }
                state.bump(&doomed_id);
            }
            path
        };
        self.record(format!("trash {path}"));
        Ok(())
    }

    async fn download(&self, id: &str) -> Result<Box<DynAsyncRead>> {
        self.take_failure()?;
        let content = self.state.lock().unwrap().live(id)?.content.clone();
        Ok(Box::new(std::io::Cursor::new(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fs_rename_moves_descendants() {
        let fs = MemoryFileSystem::new();
        fs.seed_file("/sync/a/one.txt", b"1");
        fs.seed_file("/sync/a/sub/two.txt", b"2");

        fs.rename(Path::new("/sync/a"), Path::new("/sync/b"))
            .await
            .unwrap();

        assert_eq!(
            fs.relative_paths("/sync"),
            vec!["b", "b/one.txt", "b/sub", "b/sub/two.txt"]
        );
    }

    #[tokio::test]
    async fn test_memory_cloud_feed_lists_latest_change_once() {
        let cloud = MemoryCloud::new();
        let doc = cloud.seed_file("/a.txt", b"hello", "XUFAKrxLKna5cZ2REBfFkg==");
        cloud
            .update_attributes(
                &doc.id,
                &doc.rev,
                RemotePatch {
                    name: Some("b.txt".to_string()),
                    ..RemotePatch::default()
                },
            )
            .await
            .unwrap();

        let page = cloud.changes("0").await.unwrap();
        let files: Vec<_> = page
            .changes
            .iter()
            .filter_map(|c| c.doc.as_ref())
            .filter(|d| !d.is_directory())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/b.txt");
        assert_eq!(files[0].rev, "2-mem");
    }

    #[tokio::test]
    async fn test_memory_cloud_rejects_stale_revision() {
        let cloud = MemoryCloud::new();
        let doc = cloud.seed_file("/a.txt", b"hello", "XUFAKrxLKna5cZ2REBfFkg==");
        let err = cloud.trash(&doc.id, "0-stale").await.unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        assert!(!cloud.is_trashed(&doc.id));
    }
}
