//! `Runner`: owns one compiled `Bundle` and everything shared across every
//! VU minted from it — the dialer, the module registry, the console, the
//! metrics, the samples channel, and the run-level cancellation signal.
//! `spec.md` §3/§4.2.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use vu_types::{Options, RunnerError, SampleContainer, Stage};

use crate::bundle::Bundle;
use crate::console::{self, Console, ConsoleModule};
use crate::dialer::BaseDialer;
use crate::metrics::RunnerMetrics;
use crate::registry::ModuleRegistry;
use crate::vu::VU;

/// Default samples-channel capacity. `spec.md`'s ambient concurrency section
/// calls for a bounded channel with a drop-oldest-with-warn backpressure
/// policy rather than unbounded buffering or blocking producers.
const DEFAULT_SAMPLES_CAPACITY: usize = 1000;

/// Owns a compiled `Bundle` and mints `VU`s from it. One `Runner` per test
/// run; every `VU` it produces shares the same dialer, registry, console,
/// and samples channel.
pub struct Runner {
    bundle: Arc<Bundle>,
    registry: Arc<ModuleRegistry>,
    dialer: BaseDialer,
    console: Arc<dyn Console>,
    metrics: Arc<RunnerMetrics>,
    samples_tx: mpsc::Sender<SampleContainer>,
    setup_data_json: Arc<RwLock<Option<String>>>,
    cancel_tx: watch::Sender<bool>,
    next_vu_id: std::sync::atomic::AtomicU64,
}

impl Runner {
    /// Build a `Runner` over `bundle`. Returns the `Runner` plus the
    /// receiving half of its samples channel, which the embedder drains
    /// (into a reporter, a test assertion, wherever) — `spec.md`'s stated
    /// non-goal is aggregation/reporting, not the channel itself.
    pub fn new(
        bundle: Bundle,
        registry: Arc<ModuleRegistry>,
    ) -> Result<(Self, mpsc::Receiver<SampleContainer>), RunnerError> {
        let console = console::build(bundle.options().console_output.as_deref())?;
        registry.register(Arc::new(ConsoleModule::new(console.clone())));
        let (samples_tx, samples_rx) = mpsc::channel(DEFAULT_SAMPLES_CAPACITY);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let runner = Self {
            bundle: Arc::new(bundle),
            registry,
            dialer: BaseDialer::default(),
            console,
            metrics: Arc::new(RunnerMetrics::default()),
            samples_tx,
            setup_data_json: Arc::new(RwLock::new(None)),
            cancel_tx,
            next_vu_id: std::sync::atomic::AtomicU64::new(1),
        };
        Ok((runner, samples_rx))
    }

    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    pub fn metrics(&self) -> &Arc<RunnerMetrics> {
        &self.metrics
    }

    pub fn console(&self) -> &Arc<dyn Console> {
        &self.console
    }

    /// A receiver bound to this run's cancellation signal, for
    /// `ActiveVU::activate`.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Signal cancellation to every `ActiveVU` watching this run. Idempotent.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Apply caller-supplied overrides on top of the bundle's own declared
    /// options (`spec.md` §6, `other.field` wins wherever set). Hosts and
    /// blacklist updates propagate to the shared DNS cache immediately.
    pub fn set_options(&mut self, overrides: Options) -> Result<(), RunnerError> {
        let merged = self.bundle.options().clone().merged_with(overrides);
        self.dialer.resolver.set_hosts(merged.hosts.clone());
        let blacklist: Vec<std::net::IpAddr> = merged
            .blacklist_ips
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        self.dialer.resolver.set_blacklist(blacklist);
        Arc::get_mut(&mut self.bundle)
            .map(|b| b.set_options(merged))
            .ok_or_else(|| {
                RunnerError::Config("cannot change options while VUs derived from this bundle are alive".to_string())
            })
    }

    /// Mint a fresh `VU`. Cheap relative to `Bundle::compile`: one
    /// `ScriptInstance` evaluation plus an HTTP client build.
    pub fn new_vu(&self) -> Result<VU, RunnerError> {
        let id = self.next_vu_id.fetch_add(1, Ordering::SeqCst);
        self.metrics.vus_active.inc();
        VU::new(
            id,
            self.bundle.clone(),
            self.registry.clone(),
            self.dialer.clone(),
            self.console.clone(),
            self.samples_tx.clone(),
            self.setup_data_json.clone(),
        )
    }

    /// Mint the disposable VU that runs `setup`, `teardown`, and
    /// `handleSummary` — id 0, never counted toward `vus_active` since it
    /// never executes the exec lifecycle a load-generating VU does
    /// (`spec.md` §4.2: "spawns a disposable VU (id = 0)").
    fn new_disposable_vu(&self) -> Result<VU, RunnerError> {
        VU::new(
            0,
            self.bundle.clone(),
            self.registry.clone(),
            self.dialer.clone(),
            self.console.clone(),
            self.samples_tx.clone(),
            self.setup_data_json.clone(),
        )
    }

    /// Run the script's `setup` export (if any) once, under
    /// `options.setupTimeout`, and cache its JSON-serialized return value
    /// for every VU's lazy decode. `spec.md` §4.2/§4.3.
    pub async fn setup(&self) -> Result<(), RunnerError> {
        if !self.bundle.has_export("setup") {
            return Ok(());
        }
        let timeout = self
            .bundle
            .options()
            .setup_timeout
            .unwrap_or(Duration::from_secs(60));
        let mut vu = self.new_disposable_vu()?;
        let interrupt = vu.interrupt_handle();
        let timer = tokio::spawn({
            let interrupt = interrupt.clone();
            async move {
                tokio::time::sleep(timeout).await;
                interrupt.fire("setup timeout");
            }
        });
        let result = tokio::task::block_in_place(|| vu.instance_mut().call("setup", ()));
        timer.abort();
        let result = result.map_err(|e| {
            if e.is_interrupted() {
                RunnerError::Timeout {
                    stage: Stage::Setup,
                    duration: timeout,
                }
            } else {
                e
            }
        })?;

        let value: serde_json::Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| RunnerError::Script(format!("setup() return value not JSON-representable: {e}")))?;
        *self.setup_data_json.write() = Some(
            serde_json::to_string(&value)
                .map_err(|e| RunnerError::Script(format!("failed to serialize setup data: {e}")))?,
        );
        Ok(())
    }

    /// Run the script's `teardown` export (if any) once, under
    /// `options.teardownTimeout`, with setup data decoded and passed as its
    /// sole argument.
    pub async fn teardown(&self) -> Result<(), RunnerError> {
        if !self.bundle.has_export("teardown") {
            return Ok(());
        }
        let timeout = self
            .bundle
            .options()
            .teardown_timeout
            .unwrap_or(Duration::from_secs(60));
        let mut vu = self.new_disposable_vu()?;
        let arg = vu.setup_data()?.unwrap_or(rhai::Dynamic::UNIT);
        let interrupt = vu.interrupt_handle();
        let timer = tokio::spawn({
            let interrupt = interrupt.clone();
            async move {
                tokio::time::sleep(timeout).await;
                interrupt.fire("teardown timeout");
            }
        });
        let result = tokio::task::block_in_place(|| vu.instance_mut().call("teardown", (arg,)));
        timer.abort();
        result.map_err(|e| {
            if e.is_interrupted() {
                RunnerError::Timeout {
                    stage: Stage::Teardown,
                    duration: timeout,
                }
            } else {
                e
            }
        })?;
        Ok(())
    }

    /// Invoke the script's optional `handleSummary(ctx, summary)` export and
    /// return its raw value — this hook only signals the export's presence
    /// and runs it; aggregating run metrics into `summary` and writing the
    /// result anywhere is delegated, per `spec.md` §4.2 ("specified only as
    /// a boundary: the core must provide the hook; the formatting is
    /// delegated"). Returns `Ok(None)` when the script declares no
    /// `handleSummary`.
    pub async fn handle_summary(&self) -> Result<Option<rhai::Dynamic>, RunnerError> {
        if !self.bundle.has_export("handleSummary") {
            return Ok(None);
        }
        let mut vu = self.new_disposable_vu()?;
        let ctx = rhai::Dynamic::UNIT;
        let summary = rhai::Dynamic::from(rhai::Map::new());
        let result =
            tokio::task::block_in_place(|| vu.instance_mut().call("handleSummary", (ctx, summary)))?;
        Ok(Some(result))
    }

    /// Drain a fixed-size batch of samples without blocking past `budget`.
    /// A convenience for an embedder's summary step; the samples channel
    /// itself remains the primary interface.
    pub async fn drain_samples(
        rx: &mut mpsc::Receiver<SampleContainer>,
        budget: Duration,
    ) -> Vec<SampleContainer> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(sample)) => out.push(sample),
                _ => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemoryFilesystem, VirtualFilesystem};
    use std::collections::HashMap;
    use vu_types::CompatibilityMode;

    fn bundle(source: &str) -> Bundle {
        let mut filesystems: HashMap<String, Box<dyn VirtualFilesystem>> = HashMap::new();
        filesystems.insert("file".to_string(), Box::new(MemoryFilesystem::new()));
        Bundle::compile("file:main.rhai", source.as_bytes(), filesystems, CompatibilityMode::Extended).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn setup_without_export_is_a_noop() {
        let (runner, _rx) = Runner::new(bundle("fn default() {}"), Arc::new(ModuleRegistry::new())).unwrap();
        runner.setup().await.unwrap();
        assert!(runner.setup_data_json.read().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn setup_caches_decoded_value_for_new_vus() {
        let (runner, _rx) = Runner::new(
            bundle("fn setup() { #{ token: \"abc\" } }\nfn default() {}"),
            Arc::new(ModuleRegistry::new()),
        )
        .unwrap();
        runner.setup().await.unwrap();
        let mut vu = runner.new_vu().unwrap();
        let data = vu.setup_data().unwrap();
        assert!(data.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_vu_increments_active_gauge() {
        let (runner, _rx) = Runner::new(bundle("fn default() {}"), Arc::new(ModuleRegistry::new())).unwrap();
        let _vu = runner.new_vu().unwrap();
        assert_eq!(runner.metrics().vus_active.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn setup_and_teardown_do_not_count_toward_active_vus() {
        let (runner, _rx) = Runner::new(
            bundle("fn setup() {}\nfn teardown() {}\nfn default() {}"),
            Arc::new(ModuleRegistry::new()),
        )
        .unwrap();
        runner.setup().await.unwrap();
        runner.teardown().await.unwrap();
        assert_eq!(runner.metrics().vus_active.get(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_summary_is_none_when_absent() {
        let (runner, _rx) = Runner::new(bundle("fn default() {}"), Arc::new(ModuleRegistry::new())).unwrap();
        assert!(runner.handle_summary().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_summary_invokes_the_export() {
        let (runner, _rx) = Runner::new(
            bundle("fn default() {}\nfn handleSummary(ctx, summary) { #{ ran: true } }"),
            Arc::new(ModuleRegistry::new()),
        )
        .unwrap();
        let result = runner.handle_summary().await.unwrap().unwrap();
        assert!(result.is_map());
    }
}
