//! Error kinds shared between `vu-core` and its embedders.
//!
//! Every error a VU-facing operation can fail with is a variant of
//! [`RunnerError`]. Callers that only care about "did it work" can collapse
//! this into `anyhow::Error` via `?`; callers that need to branch on *why*
//! (the CLI summary printer, a dashboard) match on the enum directly.

use std::time::Duration;
use thiserror::Error;

/// The stage a [`RunnerError::Timeout`] fired during.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Setup => write!(f, "setup"),
            Stage::Teardown => write!(f, "teardown"),
        }
    }
}

/// Errors surfaced by `vu-core` across bundle compilation, VU activation, and
/// iteration execution. See `spec.md` §7 for the contract each variant
/// fulfills.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The script failed to parse or resolve: bad syntax, an unknown module,
    /// a cycle the loader couldn't break, or an illegal top-level `return`
    /// under `CompatibilityMode::Extended`. Aborts all further operations on
    /// the owning `Runner` — no VU can be produced from a failed `Bundle`.
    #[error("compile error in {module}: {message}")]
    Compile { module: String, message: String },

    /// A module path resolved outside the filesystem's declared root.
    /// The file is never opened.
    #[error("module path `{requested}` escapes filesystem root `{root}`")]
    DirectoryTraversal { requested: String, root: String },

    /// Setup or teardown exceeded its configured deadline.
    #[error("{stage} exceeded its {duration:?} deadline")]
    Timeout { stage: Stage, duration: Duration },

    /// An uncaught error raised by the script during an iteration.
    #[error("script error: {0}")]
    Script(String),

    /// The sentinel raised into the interpreter on cancellation, observed at
    /// the RunOnce boundary. Carries the context's own cancellation reason
    /// so callers can distinguish a deadline from an explicit abort.
    #[error("context cancelled: {reason}")]
    Interrupted { reason: String },

    /// Invalid options — an unreadable cert file, an unparseable duration,
    /// a negative RPS — returned synchronously from the call that configured
    /// them.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RunnerError {
    pub fn compile(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
