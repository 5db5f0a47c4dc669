//! `ActiveVU`: a `VU` attached to one test run, and `RunOnce`'s six-step
//! iteration state machine. See `spec.md` §4.3.

use std::sync::Arc;
use std::time::Instant;

use rhai::Dynamic;
use tokio::sync::{watch, Mutex, MutexGuard};
use vu_types::{ConnectTiming, Group, RunnerError, SampleContainer, TagSet, Trail};

use crate::engine::InterruptFlag;
use crate::state::State;
use crate::vu::VU;

/// Outcome of one `RunOnce` call, for callers that want the trail without
/// re-deriving it from the samples channel.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub trail: Trail,
    pub error: Option<String>,
}

/// A `VU` bound to a test run's cancellation signal. The VU itself lives
/// behind a single-permit `tokio::sync::Mutex`, which **is** the busy slot
/// `spec.md` §4.3/§9 calls for ("a VU runs at most one iteration
/// concurrently... a single-slot channel is elegant where available"): a
/// second `RunOnce` against the same `ActiveVU` queues on the lock rather
/// than being rejected, and is released the moment the run cancels.
pub struct ActiveVU {
    vu: Mutex<VU>,
    cancel_rx: watch::Receiver<bool>,
}

async fn watch_for_cancel(mut rx: watch::Receiver<bool>, interrupt: InterruptFlag, reason: &'static str) {
    if *rx.borrow() {
        interrupt.fire(reason);
        return;
    }
    if rx.changed().await.is_ok() && *rx.borrow() {
        interrupt.fire(reason);
    }
}

/// Resolves once `rx` carries `true`, without touching any interrupt flag —
/// used to race against acquiring the busy slot itself.
async fn wait_until_cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}

impl ActiveVU {
    /// Attach `vu` to a run. Resets any interrupt left over from a previous
    /// activation ("[Re]Activate is cheap: reuse the existing VU/interpreter,
    /// just attach fresh per-iteration resources").
    pub fn activate(vu: VU, cancel_rx: watch::Receiver<bool>) -> Self {
        vu.interrupt_handle().reset();
        Self {
            vu: Mutex::new(vu),
            cancel_rx,
        }
    }

    /// Lock this VU's execution slot. For callers that need to inspect VU
    /// state between iterations (tests, an embedder's own diagnostics); only
    /// one such guard, or one in-flight `RunOnce`, can exist at a time.
    pub async fn vu(&self) -> MutexGuard<'_, VU> {
        self.vu.lock().await
    }

    /// Run one iteration of `exec` (default `"default"`), merging
    /// `activation_tags` over the run/system tags. Implements the six steps
    /// of `spec.md` §4.3:
    /// 1. admission via the busy slot,
    /// 2. lazy setup-data decode,
    /// 3. exec lookup,
    /// 4. per-iteration `State` composition and context-cell publish,
    /// 5. timed invocation racing the run's cancellation signal,
    /// 6. trail emission, `noVUConnectionReuse`, and `minIterationDuration`.
    pub async fn run_once(
        &self,
        exec: Option<&str>,
        group: Group,
        activation_tags: TagSet,
    ) -> Result<IterationOutcome, RunnerError> {
        let mut wait_cancel = self.cancel_rx.clone();
        let mut vu = tokio::select! {
            guard = self.vu.lock() => guard,
            _ = wait_until_cancelled(&mut wait_cancel) => {
                return Err(RunnerError::Interrupted {
                    reason: "test run cancelled while waiting for this VU's execution slot".to_string(),
                });
            }
        };
        self.run_once_locked(&mut vu, exec, group, activation_tags).await
    }

    async fn run_once_locked(
        &self,
        vu: &mut VU,
        exec: Option<&str>,
        group: Group,
        activation_tags: TagSet,
    ) -> Result<IterationOutcome, RunnerError> {
        // Step 1 (continued): fresh per-iteration resources.
        vu.maybe_reset_cookies();
        vu.interrupt_handle().reset();

        // Step 2: setup-data lazy decode.
        let setup_data = vu.setup_data()?;

        // Step 3: exec lookup.
        let exec_name = exec.unwrap_or("default").to_string();
        let is_default_exec = exec_name == "default";
        if !vu.bundle().has_export(&exec_name) {
            return Err(RunnerError::Script(format!(
                "exec function `{exec_name}` is not exported by this bundle"
            )));
        }

        // Step 4: compose the iteration's State and publish it.
        let options = vu.bundle().options().clone();
        let iteration = vu.next_iteration();

        let mut tags = TagSet::new();
        for (k, v) in &options.run_tags {
            tags.insert(k.clone(), v.clone());
        }
        if options.system_tags.vu {
            tags.insert("vu", vu.id.to_string());
        }
        if options.system_tags.iter {
            tags.insert("iter", iteration.to_string());
        }
        if options.system_tags.group {
            tags.insert("group", group.as_str().to_string());
        }
        let tags = tags.merge(&activation_tags);

        let logger = State::make_logger(vu.id, iteration, &group);
        let state = Arc::new(State {
            vu_id: vu.id,
            iteration,
            options: Arc::new(options.clone()),
            group: group.clone(),
            tags: tags.clone(),
            logger,
            dialer: vu.dialer().clone(),
            client: vu.client().clone(),
            cookie_jar: vu.cookie_jar().clone(),
            tls_auth: vu.tls_auth().clone(),
            rps_limiter: vu.rps_limiter().cloned(),
            buffer_pool: vu.buffer_pool().clone(),
            samples: vu.samples().clone(),
        });

        vu.context().enter_iteration(state.clone());
        let vu_id = vu.id;
        vu.instance_mut().set("__VU", vu_id as i64);
        vu.instance_mut().set("__ITER", iteration as i64);

        // Step 5: timed invocation, racing the run's cancellation signal.
        let args: Dynamic = setup_data.unwrap_or(Dynamic::UNIT);
        let interrupt = vu.interrupt_handle();
        let watcher = tokio::spawn(watch_for_cancel(
            self.cancel_rx.clone(),
            interrupt,
            "test run cancelled",
        ));

        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let call_result = tokio::task::block_in_place(|| vu.instance_mut().call(&exec_name, (args,)));
        let elapsed = start.elapsed();
        watcher.abort();

        vu.context().clear();

        let full_iteration = !matches!(&call_result, Err(e) if e.is_interrupted());
        let error = call_result.as_ref().err().map(|e| e.to_string());

        // Step 6: trail emission, noVUConnectionReuse, minIterationDuration.
        let trail = Trail {
            vu_id: vu.id,
            iteration,
            timings: ConnectTiming::default(),
            tags,
            full_iteration,
            is_default_exec,
            started_at,
            duration: elapsed,
        };
        state.emit(SampleContainer::Trail(trail.clone()));

        if options.no_vu_connection_reuse {
            vu.refresh_client()?;
        }

        // Padding only applies to an iteration that ran to completion; a
        // cancelled/interrupted one must return promptly regardless.
        if full_iteration {
            if let Some(min_duration) = options.min_iteration_duration {
                if elapsed < min_duration {
                    tokio::time::sleep(min_duration - elapsed).await;
                }
            }
        }

        match call_result {
            Ok(_) => Ok(IterationOutcome { trail, error: None }),
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                if options.throw {
                    Err(e)
                } else {
                    Ok(IterationOutcome { trail, error })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ProcessConsole;
    use crate::dialer::BaseDialer;
    use crate::fs::{MemoryFilesystem, VirtualFilesystem};
    use crate::registry::{CustomModule, ModuleRegistry};
    use crate::state::ContextCell;
    use crate::vu::VU;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::time::Duration;
    use vu_types::CompatibilityMode;

    fn active_vu_with_registry(source: &str, registry: Arc<ModuleRegistry>) -> (ActiveVU, watch::Sender<bool>) {
        let mut filesystems: HashMap<String, Box<dyn VirtualFilesystem>> = HashMap::new();
        filesystems.insert("file".to_string(), Box::new(MemoryFilesystem::new()));
        let bundle = Arc::new(
            crate::bundle::Bundle::compile("file:main.rhai", source.as_bytes(), filesystems, CompatibilityMode::Extended)
                .unwrap(),
        );
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let vu = VU::new(
            1,
            bundle,
            registry,
            BaseDialer::default(),
            Arc::new(ProcessConsole),
            tx,
            Arc::new(RwLock::new(None)),
        )
        .unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (ActiveVU::activate(vu, cancel_rx), cancel_tx)
    }

    fn active_vu(source: &str) -> (ActiveVU, watch::Sender<bool>) {
        active_vu_with_registry(source, Arc::new(ModuleRegistry::new()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_iteration_emits_full_trail() {
        let (active, _cancel) = active_vu("fn default() { 1 + 1 }");
        let outcome = active
            .run_once(None, Group::root(), TagSet::new())
            .await
            .unwrap();
        assert!(outcome.trail.full_iteration);
        assert!(outcome.trail.is_default_exec);
        assert!(outcome.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_exec_is_a_script_error() {
        let (active, _cancel) = active_vu("fn default() {}");
        let err = active
            .run_once(Some("notfound"), Group::root(), TagSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Script(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_before_run_once_interrupts_immediately() {
        let (active, cancel_tx) = active_vu("fn default() { while true { } }");
        cancel_tx.send(true).unwrap();
        let err = active
            .run_once(None, Group::root(), TagSet::new())
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
    }

    struct SlowModule;
    impl CustomModule for SlowModule {
        fn name(&self) -> &str {
            "test/x/slow"
        }
        fn init(&self, instance: &mut crate::engine::ScriptInstance, _ctx: ContextCell) {
            instance.register_fn("slow", || {
                std::thread::sleep(Duration::from_millis(150));
            });
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_caller_queues_on_the_busy_slot_instead_of_erroring() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(SlowModule));
        let (active, _cancel) = active_vu_with_registry("fn default() { slow() }", registry);
        let active = Arc::new(active);

        let first = {
            let active = active.clone();
            tokio::spawn(async move { active.run_once(None, Group::root(), TagSet::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        let second = active.run_once(None, Group::root(), TagSet::new()).await;
        assert!(second.is_ok(), "queued caller should succeed, not be refused");
        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "second caller should have waited for the first to release the slot, waited {:?}",
            start.elapsed()
        );

        first.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_while_queued_on_the_busy_slot_returns_promptly() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(SlowModule));
        let (active, cancel_tx) = active_vu_with_registry("fn default() { slow() }", registry);
        let active = Arc::new(active);

        let first = {
            let active = active.clone();
            tokio::spawn(async move { active.run_once(None, Group::root(), TagSet::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).unwrap();

        let start = Instant::now();
        let err = active
            .run_once(None, Group::root(), TagSet::new())
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert!(start.elapsed() < Duration::from_millis(100));

        let _ = first.await.unwrap();
    }
}
