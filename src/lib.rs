pub mod chat_core;
pub mod config;
pub mod inference;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use config::AppConfig;

/// Number of rotated log files kept next to `localchat.log`.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for LocalChat.
///
/// - macOS: `~/Library/Application Support/localchat/`
/// - Windows: `{FOLDERID_RoamingAppData}\localchat\`
/// - Linux: `$XDG_DATA_HOME/localchat/` (fallback `~/.local/share/localchat/`)
///
/// Falls back to `~/.localchat/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("localchat");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".localchat")
}

/// Initialize the tracing subscriber, writing structured logs to the data directory.
///
/// Rotates `localchat.log` → `.1` → `.2` → `.3`, opens a fresh line-flushing
/// log file, and logs a startup banner. Returns the log file path.
pub fn init_tracing() -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("localchat.log");
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("localchat=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== LocalChat starting ==="
    );
    Ok(log_path)
}

/// Shift `base` → `base.1` → … → `base.{keep}`, deleting the oldest.
///
/// Missing files in the chain are skipped.
fn rotate_log_file(base: &Path, keep: u32) {
    let numbered = |n: u32| PathBuf::from(format!("{}.{n}", base.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if base.exists() {
        let _ = std::fs::rename(base, numbered(1));
    }
}

/// Log writer that flushes the file after every write, so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, std::fs::File>> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.lock()?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the SQLite path: the configured one, else `<data_dir>/localchat.db`.
///
/// Creates the parent directory if needed.
pub fn resolve_db_path(config: &AppConfig) -> io::Result<String> {
    let path = config
        .database_path
        .clone()
        .unwrap_or_else(|| data_dir().join("localchat.db"));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path.to_string_lossy().into_owned())
}
