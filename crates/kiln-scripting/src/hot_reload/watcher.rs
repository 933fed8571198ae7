//! Module artifact watcher
//!
//! Watches the directories holding module artifacts and turns file system
//! notifications into debounced [`WatchEvent`]s for the lifecycle manager.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_kernel::HotReloadConfig;
use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watch event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Renamed { from: PathBuf, to: PathBuf },
}

/// Watch event
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Affected artifact; the destination for renames.
    pub path: PathBuf,
    pub timestamp: Instant,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Instant::now(),
        }
    }

    /// The artifact's content may have changed.
    pub fn is_change(&self) -> bool {
        matches!(
            self.kind,
            WatchEventKind::Created | WatchEventKind::Modified | WatchEventKind::Renamed { .. }
        )
    }
}

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period applied per path
    pub debounce: Duration,
    /// Artifact extensions, without the dot
    pub extensions: Vec<String>,
    pub recursive: bool,
    /// `*suffix`, `prefix*` or exact file names
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::from_config(&HotReloadConfig::default())
    }
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HotReloadConfig) -> Self {
        Self {
            debounce: config.watch_debounce(),
            extensions: config.watch_extensions.clone(),
            recursive: false,
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
        }
    }

    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.trim_start_matches('.').to_string());
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    fn mode(&self) -> RecursiveMode {
        if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }

    /// Whether events on `path` concern a module artifact.
    pub fn should_watch(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| e == ext) {
            return false;
        }
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !self
            .ignore_patterns
            .iter()
            .any(|pattern| ignored_by(pattern, file_name))
    }
}

fn ignored_by(pattern: &str, file_name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        file_name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        file_name.starts_with(prefix)
    } else {
        file_name == pattern
    }
}

/// Per-path debounce window.
#[derive(Debug, Default)]
struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    fn admit(&mut self, path: &Path, now: Instant) -> bool {
        match self.last.get(path) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last.insert(path.to_path_buf(), now);
                true
            }
        }
    }
}

/// Translate one notify event kind, pairing rename halves.
fn classify(
    kind: &EventKind,
    path: &Path,
    rename_from: &mut Option<PathBuf>,
) -> Option<WatchEventKind> {
    match kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            Some(WatchEventKind::Created)
        }
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Some(WatchEventKind::Modified)
        }
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            Some(WatchEventKind::Removed)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            *rename_from = Some(path.to_path_buf());
            None
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => match rename_from.take() {
            Some(from) => Some(WatchEventKind::Renamed {
                from,
                to: path.to_path_buf(),
            }),
            None => Some(WatchEventKind::Created),
        },
        _ => None,
    }
}

/// Module artifact watcher
pub struct ModuleWatcher {
    watch_paths: Vec<PathBuf>,
    config: WatchConfig,
    event_tx: mpsc::Sender<WatchEvent>,
    /// Taken by the consumer
    event_rx: Option<mpsc::Receiver<WatchEvent>>,
    watcher: Option<RecommendedWatcher>,
    debouncer: Arc<Mutex<Debouncer>>,
    shutdown: CancellationToken,
}

impl ModuleWatcher {
    pub fn new(config: WatchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            watch_paths: Vec::new(),
            debouncer: Arc::new(Mutex::new(Debouncer::new(config.debounce))),
            config,
            event_tx,
            event_rx: Some(event_rx),
            watcher: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &HotReloadConfig) -> Self {
        Self::new(WatchConfig::from_config(config))
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.event_rx.take()
    }

    /// Add a directory to watch. Missing directories are skipped with a
    /// warning.
    pub fn watch<P: AsRef<Path>>(&mut self, path: P) -> Result<(), notify::Error> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            warn!("Watch path does not exist: {:?}", path);
            return Ok(());
        }
        info!("Watching module directory {:?}", path);
        if !self.watch_paths.contains(&path) {
            self.watch_paths.push(path.clone());
        }
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.watch(&path, self.config.mode())?;
        }
        Ok(())
    }

    pub fn unwatch<P: AsRef<Path>>(&mut self, path: P) -> Result<(), notify::Error> {
        let path = path.as_ref().to_path_buf();
        self.watch_paths.retain(|p| p != &path);
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.unwatch(&path)?;
        }
        Ok(())
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watch_paths
    }

    pub fn is_watching<P: AsRef<Path>>(&self, path: P) -> bool {
        self.watch_paths.iter().any(|p| p == path.as_ref())
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Start the notify backend and the event forwarding task. Must be called
    /// inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), notify::Error> {
        if self.watcher.is_some() {
            return Ok(());
        }
        info!("Starting module watcher");

        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            Config::default().with_poll_interval(Duration::from_millis(100)),
        )?;
        for path in &self.watch_paths {
            watcher.watch(path, self.config.mode())?;
        }
        self.watcher = Some(watcher);

        let event_tx = self.event_tx.clone();
        let config = self.config.clone();
        let debouncer = self.debouncer.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut rename_from: Option<PathBuf> = None;
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                for path in &event.paths {
                    if !config.should_watch(path) {
                        continue;
                    }
                    let Some(kind) = classify(&event.kind, path, &mut rename_from) else {
                        continue;
                    };
                    if !debouncer.lock().admit(path, Instant::now()) {
                        debug!("Debounced event for {:?}", path);
                        continue;
                    }
                    let watch_event = WatchEvent::new(kind, path.clone());
                    debug!("Watch event: {:?}", watch_event);
                    if event_tx.send(watch_event).await.is_err() {
                        debug!("Watch event receiver dropped");
                        return;
                    }
                }
            }
            info!("Module watcher shutting down");
        });
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.shutdown = CancellationToken::new();
        self.watcher = None;
    }

    /// Artifacts already present in the watched directories, sorted.
    pub fn scan_existing(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = self
            .watch_paths
            .iter()
            .filter_map(|dir| std::fs::read_dir(dir).ok())
            .flat_map(|entries| entries.flatten())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.config.should_watch(path))
            .collect();
        found.sort();
        found
    }
}

impl Drop for ModuleWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
