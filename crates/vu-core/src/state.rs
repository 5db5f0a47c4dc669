//! Per-iteration `State` and the `ContextCell` that publishes it to native
//! bindings. See `spec.md` §3 ("State") and §4.5 (the registry's FFI seam).
//!
//! Native functions registered through [`crate::registry::CustomModule`]
//! never receive `State` as an argument — scripts call them with whatever
//! arguments the script author wrote, and the binding itself has no access
//! to `ActiveVU` internals. Instead every binding closes over a shared
//! [`ContextCell`], which `ActiveVU::run_once` points at the current
//! iteration's `State` immediately before invoking the script and clears
//! immediately after, satisfying invariant I4: "the context cell observable
//! to native bindings always reflects the current iteration's context
//! during execution."

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::Sender;
use tracing::Span;
use vu_types::{Group, Options, SampleContainer, TagSet};

use crate::dialer::BaseDialer;
use crate::rate_limit::RpsLimiter;
use crate::resources::{BufferPool, CookieJar, ResolvedTlsAuth};

/// Everything a running iteration needs besides the interpreter itself:
/// transport, dialer, cookie jar, TLS material, the RPS limiter, the buffer
/// pool, the samples channel, and the tag/group/logger context the trail
/// sample is stamped with. Built once per iteration by
/// [`crate::active_vu::ActiveVU::run_once`] and shared read-only with every
/// native binding invoked during that iteration.
pub struct State {
    pub vu_id: u64,
    pub iteration: u64,
    pub options: Arc<Options>,
    pub group: Group,
    pub tags: TagSet,
    pub logger: Span,

    pub dialer: BaseDialer,
    pub client: reqwest::Client,
    pub cookie_jar: CookieJar,
    pub tls_auth: Arc<Vec<ResolvedTlsAuth>>,
    pub rps_limiter: Option<Arc<RpsLimiter>>,
    pub buffer_pool: Arc<BufferPool>,

    pub samples: Sender<SampleContainer>,
}

impl State {
    /// Build the logger span a VU stamps onto every log line during this
    /// iteration, matching the process console's `vu=<id> iteration=<n>`
    /// field convention (`spec.md` §4.4).
    pub fn make_logger(vu_id: u64, iteration: u64, group: &Group) -> Span {
        tracing::info_span!("iteration", vu = vu_id, iteration, group = %group)
    }

    pub fn emit(&self, sample: SampleContainer) {
        // A full channel means the consumer is behind; dropping here rather
        // than blocking keeps iteration latency independent of reporting
        // throughput (`spec.md` §5, "drop-oldest-with-warn").
        if let Err(_dropped) = self.samples.try_send(sample) {
            tracing::warn!(vu = self.vu_id, iteration = self.iteration, "samples channel full, dropping sample");
        }
    }
}

/// What the currently-bound context represents: nothing bound yet, the
/// narrow init-time context (runtime handle + init-env, no per-iteration
/// resources), or a full iteration's [`State`].
enum Phase {
    Init,
    Iteration(Arc<State>),
}

/// A process-wide mutable single-slot pointer. Every [`crate::vu::VU`] owns
/// one, constructs it once, and clones it into every native binding
/// registered during `Bundle::instantiate` — the bindings themselves are
/// `'static` closures with no other way to reach per-iteration state.
#[derive(Clone)]
pub struct ContextCell(Arc<RwLock<Option<Phase>>>);

impl ContextCell {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(None)))
    }

    /// Bind the narrow init-time context. Called around
    /// `Bundle::instantiate`'s one-time module top-level evaluation and
    /// around init-time registry entry points.
    pub fn enter_init(&self) {
        *self.0.write() = Some(Phase::Init);
    }

    /// Bind a full iteration context. Called at the top of `RunOnce`,
    /// immediately before invoking the exec function.
    pub fn enter_iteration(&self, state: Arc<State>) {
        *self.0.write() = Some(Phase::Iteration(state));
    }

    /// Clear the binding. Called at the end of `RunOnce` and after
    /// `Bundle::instantiate` completes, so a native binding called outside
    /// either window observes nothing rather than stale state.
    pub fn clear(&self) {
        *self.0.write() = None;
    }

    pub fn is_init_time(&self) -> bool {
        matches!(&*self.0.read(), Some(Phase::Init))
    }

    /// The current iteration's `State`, or `None` if no iteration is
    /// currently bound (init-time, or between iterations).
    pub fn current(&self) -> Option<Arc<State>> {
        match &*self.0.read() {
            Some(Phase::Iteration(state)) => Some(state.clone()),
            _ => None,
        }
    }
}

impl Default for ContextCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_cell_exposes_no_state() {
        let cell = ContextCell::new();
        assert!(cell.current().is_none());
        assert!(!cell.is_init_time());
    }

    #[test]
    fn init_phase_exposes_no_state_either() {
        let cell = ContextCell::new();
        cell.enter_init();
        assert!(cell.is_init_time());
        assert!(cell.current().is_none());
    }

    #[test]
    fn clear_drops_the_binding() {
        let cell = ContextCell::new();
        cell.enter_init();
        cell.clear();
        assert!(!cell.is_init_time());
        assert!(cell.current().is_none());
    }
}
