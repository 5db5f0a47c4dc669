//! `console.log`/`warn`/`error` backends, and the [`ConsoleModule`] that
//! binds them into a running script as the `console` global. `spec.md`
//! §4.4: a process console writing through structured logging, and a file
//! console appending RFC 3339-stamped lines — selected by
//! `options.console_output`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::Dynamic;
use vu_types::RunnerError;

use crate::engine::ScriptInstance;
use crate::registry::CustomModule;
use crate::state::ContextCell;

/// Severity a console call was made at. Mirrors `tracing::Level` rather than
/// re-exporting it, so callers that only depend on `vu-types` don't have to
/// pull in `tracing` just to name a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Where `console.*` calls from a running script are written.
pub trait Console: Send + Sync {
    fn log(&self, level: Level, vu_id: u64, iteration: u64, message: &str);
}

/// The default backend: every call becomes a `tracing` event tagged
/// `source="console"`, so it's captured by whatever subscriber the embedder
/// installed (the teacher's own convention — see `tracing_subscriber::fmt`
/// in `main.rs`/test setup).
#[derive(Default)]
pub struct ProcessConsole;

impl Console for ProcessConsole {
    fn log(&self, level: Level, vu_id: u64, iteration: u64, message: &str) {
        let source = "console";
        match level {
            Level::Debug => tracing::debug!(vu = vu_id, iteration, source, "{message}"),
            Level::Info => tracing::info!(vu = vu_id, iteration, source, "{message}"),
            Level::Warn => tracing::warn!(vu = vu_id, iteration, source, "{message}"),
            Level::Error => tracing::error!(vu = vu_id, iteration, source, "{message}"),
        }
    }
}

/// Appends one RFC 3339-timestamped line per call to a file, per
/// `options.console_output`. Opened once in append mode and guarded by a
/// `Mutex` since multiple VUs' threads write to the same handle.
pub struct FileConsole {
    file: Mutex<std::fs::File>,
}

impl FileConsole {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| RunnerError::Config(format!("cannot open console output file: {e}")))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Console for FileConsole {
    fn log(&self, level: Level, _vu_id: u64, _iteration: u64, message: &str) {
        let line = format!(
            "{} {} {message}\n",
            chrono::Utc::now().to_rfc3339(),
            level.as_str(),
        );
        let mut file = self.file.lock();
        // Logging must never abort a running iteration; a write failure is
        // only observable as a missing line.
        let _ = file.write_all(line.as_bytes());
    }
}

/// Build the console backend named by `options.consoleOutput`: `None` or
/// `"stdout"`/`"stderr"` selects [`ProcessConsole`], anything else is
/// treated as a file path for [`FileConsole`].
pub fn build(console_output: Option<&str>) -> Result<Arc<dyn Console>, RunnerError> {
    match console_output {
        None | Some("stdout") | Some("stderr") => Ok(Arc::new(ProcessConsole)),
        Some(path) => Ok(Arc::new(FileConsole::open(path)?)),
    }
}

/// Join a variable argument list the way k6's `console.*` does: stringify
/// each argument and separate with a single space (`spec.md` §4.4).
fn join_args(args: &[Dynamic]) -> String {
    args.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Binds `console.log`/`debug`/`info`/`warn`/`error` into a `ScriptInstance`
/// as native method calls on a single `console` global, reading the calling
/// VU's current `vu_id`/`iteration` through the shared [`ContextCell`]
/// rather than through any script-supplied argument — "the console value
/// exposed to the script is re-bound per call to the VU's current context"
/// (`spec.md` §4.4).
pub struct ConsoleModule {
    backend: Arc<dyn Console>,
}

impl ConsoleModule {
    pub fn new(backend: Arc<dyn Console>) -> Self {
        Self { backend }
    }
}

/// The script-facing `console` value. Holds nothing but the plumbing a
/// native method call needs: the backend to write to and the context cell
/// to read the current iteration from.
#[derive(Clone)]
struct ConsoleHandle {
    backend: Arc<dyn Console>,
    ctx: ContextCell,
}

impl ConsoleHandle {
    fn emit(&mut self, level: Level, args: &[Dynamic]) {
        let (vu_id, iteration) = match self.ctx.current() {
            Some(state) => (state.vu_id, state.iteration),
            None => (0, 0),
        };
        self.backend.log(level, vu_id, iteration, &join_args(args));
    }
}

impl CustomModule for ConsoleModule {
    fn name(&self) -> &str {
        "core/x/console"
    }

    fn init(&self, instance: &mut ScriptInstance, ctx: ContextCell) {
        let handle = ConsoleHandle {
            backend: self.backend.clone(),
            ctx,
        };
        instance.set("console", Dynamic::from(handle.clone()));

        for (name, level) in [
            ("log", Level::Info),
            ("debug", Level::Debug),
            ("info", Level::Info),
            ("warn", Level::Warn),
            ("error", Level::Error),
        ] {
            instance.register_fn(name, move |this: &mut ConsoleHandle| this.emit(level, &[]));
            instance.register_fn(name, move |this: &mut ConsoleHandle, a: Dynamic| this.emit(level, &[a]));
            instance.register_fn(name, move |this: &mut ConsoleHandle, a: Dynamic, b: Dynamic| {
                this.emit(level, &[a, b])
            });
            instance.register_fn(name, move |this: &mut ConsoleHandle, a: Dynamic, b: Dynamic, c: Dynamic| {
                this.emit(level, &[a, b, c])
            });
            instance.register_fn(
                name,
                move |this: &mut ConsoleHandle, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                    this.emit(level, &[a, b, c, d])
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_console_line_matches_the_documented_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let console = FileConsole::open(&path).unwrap();
        console.log(Level::Warn, 1, 0, "hello 42");
        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().unwrap();
        let mut parts = line.splitn(3, ' ');
        let ts = parts.next().unwrap();
        let level = parts.next().unwrap();
        let message = parts.next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert_eq!(level, "WARN");
        assert_eq!(message, "hello 42");
    }

    #[test]
    fn file_console_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let console = FileConsole::open(&path).unwrap();
        console.log(Level::Info, 1, 0, "hello");
        console.log(Level::Info, 1, 1, "world");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("hello"));
        assert!(contents.contains("world"));
    }

    #[test]
    fn build_defaults_to_process_console_for_unset_output() {
        let console = build(None).unwrap();
        console.log(Level::Debug, 0, 0, "noop");
    }

    #[test]
    fn join_args_space_separates_stringified_values() {
        let args = vec![Dynamic::from("hello".to_string()), Dynamic::from(42_i64)];
        assert_eq!(join_args(&args), "hello 42");
    }
}
