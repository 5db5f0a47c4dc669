//! # Custom Module Registry
//!
//! A process-wide registry mapping a module name of the form
//! `scheme/x/<identifier>` to a host-provided module object. This is the
//! FFI seam by which extension modules (an HTTP client, a metrics API, …)
//! plug into the runtime, per `spec.md` §4.5.
//!
//! Modules expose two kinds of entry point:
//!
//! - **init-time**: callable only while a `BundleInstance` is being built
//!   (`Bundle::instantiate`), when only the runtime handle and init-env are
//!   bound in the current context.
//! - **vu-time**: callable only during `RunOnce`, when the full per-iteration
//!   [`crate::state::State`] is bound.
//!
//! Registration is expected at process start; after that the map is
//! read-only, so a `parking_lot::RwLock` (matching the rest of the
//! workspace's locking idiom) is sufficient for safe concurrent reads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::ScriptInstance;
use crate::state::ContextCell;

/// A host-provided extension module. Implementations install their entry
/// points into a fresh `ScriptInstance` via [`CustomModule::init`] (run
/// once per `BundleInstance`) and read ambient state back out through the
/// shared [`ContextCell`] rather than through function arguments, mirroring
/// how the embedded runtime itself exposes `__VU`/`__ITER`.
pub trait CustomModule: Send + Sync {
    /// Name this module is registered under, e.g. `"k6/x/metrics"`.
    fn name(&self) -> &str;

    /// Install this module's native functions into `instance`. Called once
    /// per `BundleInstance`, while only the runtime and init-env are bound
    /// in `ctx` — calling a vu-time entry point from here is a programmer
    /// error the module itself must guard against by checking `ctx`.
    fn init(&self, instance: &mut ScriptInstance, ctx: ContextCell);
}

/// Process-wide registry. Safe for concurrent read-after-write-once: all
/// registrations are expected to happen before any `Bundle` is compiled.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<dyn CustomModule>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Arc<dyn CustomModule>) {
        self.modules.write().insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomModule>> {
        self.modules.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn CustomModule>> {
        self.modules.read().values().cloned().collect()
    }
}
