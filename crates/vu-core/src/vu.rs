//! `VU`: the long-lived, reusable handle minted once per virtual user.
//!
//! A `VU` owns everything that survives across iterations — the compiled
//! `Bundle`'s private interpreter instance, the HTTP client, cookie jar, and
//! dialer, the samples channel, and the lazily-decoded setup data — so that
//! re-running the same VU (`spec.md` §4.3, "[Re]Activate is cheap: reuse the
//! existing VU/interpreter, just attach fresh per-iteration resources") never
//! repeats the one-time cost of `Bundle::instantiate`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rhai::Dynamic;
use tokio::sync::mpsc::Sender;
use vu_types::{Options, RunnerError, SampleContainer};

use crate::bundle::Bundle;
use crate::console::Console;
use crate::dialer::BaseDialer;
use crate::engine::ScriptInstance;
use crate::rate_limit::RpsLimiter;
use crate::registry::ModuleRegistry;
use crate::resources::{BufferPool, CookieJar, ResolvedTlsAuth};
use crate::state::ContextCell;

/// Install the script-facing bindings that belong to the runtime itself
/// rather than to any registered module: `__ENV` (a snapshot of the
/// process environment, `spec.md` §6) and `open` (an init-time-only stub —
/// the core models virtual filesystems for bundle resolution, not a
/// general-purpose `open()` for scripts, so outside init it errors per
/// §6's "stub that errors outside init context").
fn install_core_bindings(instance: &mut ScriptInstance, ctx: ContextCell) {
    let env: rhai::Map = std::env::vars().map(|(k, v)| (k.into(), Dynamic::from(v))).collect();
    instance.set("__ENV", env);

    let open_ctx = ctx.clone();
    instance.register_fn("open", move |_path: &str| -> Result<Dynamic, Box<rhai::EvalAltResult>> {
        if !open_ctx.is_init_time() {
            return Err("open() may only be called at init time".into());
        }
        Err("open() is not implemented by this runtime".into())
    });
}

/// Build a `reqwest::Client` for this VU from its resolved options: cookie
/// jar wired in as the shared store, an optional client identity when
/// exactly the matching `tlsAuth` entry applies, and `noConnectionReuse`
/// mapped onto a zero idle-pool size.
fn build_http_client(
    options: &Options,
    dialer: &BaseDialer,
    cookie_jar: &CookieJar,
    tls_auth: &[ResolvedTlsAuth],
) -> Result<reqwest::Client, RunnerError> {
    let mut builder = reqwest::Client::builder()
        .cookie_provider(Arc::new(cookie_jar.clone()))
        .connect_timeout(dialer.config.connect_timeout)
        .tcp_keepalive(dialer.config.keepalive)
        .danger_accept_invalid_certs(options.insecure_skip_tls_verify);

    if options.no_connection_reuse {
        builder = builder.pool_max_idle_per_host(0);
    }

    // A VU with exactly one configured identity applies it unconditionally;
    // multiple host-scoped identities would need a per-request client
    // selection the core doesn't implement (out of scope: the core models
    // `tlsAuth` storage and matching, not a full mTLS proxy).
    if let [only] = tls_auth {
        builder = builder.identity(only.identity()?);
    }

    builder
        .build()
        .map_err(|e| RunnerError::Config(format!("failed to build HTTP client: {e}")))
}

/// A reusable virtual-user handle. `spec.md` §3's "VU" type.
pub struct VU {
    pub id: u64,
    bundle: Arc<Bundle>,
    registry: Arc<ModuleRegistry>,
    instance: ScriptInstance,
    context: ContextCell,

    dialer: BaseDialer,
    client: reqwest::Client,
    cookie_jar: CookieJar,
    tls_auth: Arc<Vec<ResolvedTlsAuth>>,
    rps_limiter: Option<Arc<RpsLimiter>>,
    buffer_pool: Arc<BufferPool>,
    console: Arc<dyn Console>,
    samples: Sender<SampleContainer>,

    /// JSON produced once by `Runner::setup`, shared by every VU. `None`
    /// until setup completes or if the script declares no `setup` export.
    setup_data_json: Arc<RwLock<Option<String>>>,
    /// This VU's own decode of `setup_data_json`, cached after first use so
    /// repeated iterations don't re-parse JSON every call.
    decoded_setup_data: Option<Dynamic>,

    iteration: AtomicU64,
}

impl VU {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        bundle: Arc<Bundle>,
        registry: Arc<ModuleRegistry>,
        dialer: BaseDialer,
        console: Arc<dyn Console>,
        samples: Sender<SampleContainer>,
        setup_data_json: Arc<RwLock<Option<String>>>,
    ) -> Result<Self, RunnerError> {
        let options = bundle.options().clone();
        let cookie_jar = CookieJar::new();
        let tls_auth: Vec<ResolvedTlsAuth> = options
            .tls_auth
            .iter()
            .map(ResolvedTlsAuth::load)
            .collect::<Result<_, _>>()?;
        let client = build_http_client(&options, &dialer, &cookie_jar, &tls_auth)?;
        let rps_limiter = options.rps.map(|rps| Arc::new(RpsLimiter::new(rps)));

        let context = ContextCell::new();
        context.enter_init();
        let mut instance = ScriptInstance::new(bundle.program())?;
        install_core_bindings(&mut instance, context.clone());
        for module in registry.all() {
            module.init(&mut instance, context.clone());
        }
        context.clear();

        Ok(Self {
            id,
            bundle,
            registry,
            instance,
            context,
            dialer,
            client,
            cookie_jar,
            tls_auth: Arc::new(tls_auth),
            rps_limiter,
            buffer_pool: Arc::new(BufferPool::default()),
            console,
            samples,
            setup_data_json,
            decoded_setup_data: None,
            iteration: AtomicU64::new(0),
        })
    }

    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    pub fn context(&self) -> &ContextCell {
        &self.context
    }

    pub fn console(&self) -> &Arc<dyn Console> {
        &self.console
    }

    pub fn instance_mut(&mut self) -> &mut ScriptInstance {
        &mut self.instance
    }

    pub fn interrupt_handle(&self) -> crate::engine::InterruptFlag {
        self.instance.interrupt_handle()
    }

    /// Rebuild this VU's HTTP client from scratch, dropping any pooled
    /// connections. Called at the end of an iteration when
    /// `options.noVUConnectionReuse` is set.
    pub fn refresh_client(&mut self) -> Result<(), RunnerError> {
        let options = self.bundle.options().clone();
        self.client = build_http_client(&options, &self.dialer, &self.cookie_jar, &self.tls_auth)?;
        Ok(())
    }

    pub fn dialer(&self) -> &BaseDialer {
        &self.dialer
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.cookie_jar
    }

    pub fn tls_auth(&self) -> &Arc<Vec<ResolvedTlsAuth>> {
        &self.tls_auth
    }

    pub fn rps_limiter(&self) -> Option<&Arc<RpsLimiter>> {
        self.rps_limiter.as_ref()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn samples(&self) -> &Sender<SampleContainer> {
        &self.samples
    }

    pub fn next_iteration(&self) -> u64 {
        self.iteration.fetch_add(1, Ordering::SeqCst)
    }

    /// Reset the VU's cookie jar unless `noCookiesReset` is set. Called at
    /// the top of every `RunOnce` per `spec.md` §4.3 step 1.
    pub fn maybe_reset_cookies(&self) {
        if !self.bundle.options().no_cookies_reset {
            self.cookie_jar.reset();
        }
    }

    /// Decode the shared setup-data JSON into this VU's own `Dynamic`,
    /// caching the result. `spec.md` §4.3 step 2: "setup-data lazy decode".
    pub fn setup_data(&mut self) -> Result<Option<Dynamic>, RunnerError> {
        if self.decoded_setup_data.is_none() {
            if let Some(json) = self.setup_data_json.read().clone() {
                let value: serde_json::Value = serde_json::from_str(&json)
                    .map_err(|e| RunnerError::Script(format!("corrupt setup data: {e}")))?;
                let dynamic = rhai::serde::to_dynamic(&value)
                    .map_err(|e| RunnerError::Script(format!("setup data not representable: {e}")))?;
                self.decoded_setup_data = Some(dynamic);
            }
        }
        Ok(self.decoded_setup_data.clone())
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ProcessConsole;
    use crate::fs::MemoryFilesystem;
    use crate::fs::VirtualFilesystem;
    use std::collections::HashMap as StdHashMap;
    use vu_types::CompatibilityMode;

    fn test_bundle(source: &str) -> Arc<Bundle> {
        let mut filesystems: StdHashMap<String, Box<dyn VirtualFilesystem>> = StdHashMap::new();
        filesystems.insert("file".to_string(), Box::new(MemoryFilesystem::new()));
        Arc::new(
            Bundle::compile("file:main.rhai", source.as_bytes(), filesystems, CompatibilityMode::Extended).unwrap(),
        )
    }

    fn test_vu(source: &str) -> VU {
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        VU::new(
            1,
            test_bundle(source),
            Arc::new(ModuleRegistry::new()),
            BaseDialer::default(),
            Arc::new(ProcessConsole),
            tx,
            Arc::new(RwLock::new(None)),
        )
        .unwrap()
    }

    #[test]
    fn fresh_vu_has_no_setup_data() {
        let mut vu = test_vu("fn default() {}");
        assert!(vu.setup_data().unwrap().is_none());
    }

    #[test]
    fn setup_data_decodes_and_caches() {
        let mut vu = test_vu("fn default() {}");
        *vu.setup_data_json.write() = Some("{\"token\":\"abc\"}".to_string());
        let first = vu.setup_data().unwrap().unwrap();
        assert!(first.is_map());
        // Second call reuses the cached value; still present.
        assert!(vu.setup_data().unwrap().is_some());
    }

    #[test]
    fn iteration_counter_increments() {
        let vu = test_vu("fn default() {}");
        assert_eq!(vu.next_iteration(), 0);
        assert_eq!(vu.next_iteration(), 1);
    }

    #[test]
    fn env_binding_is_readable_from_a_script_function() {
        std::env::set_var("VU_CORE_TEST_FRESH_VU_ENV", "yes");
        let mut vu = test_vu("fn default() { __ENV.VU_CORE_TEST_FRESH_VU_ENV }");
        let result = vu.instance_mut().call("default", ()).unwrap();
        assert_eq!(result.into_string().unwrap(), "yes");
    }
}
