//! The embedded scripting runtime contract (`spec.md` §9) and its concrete
//! `rhai`-backed implementation.
//!
//! > "Treat the interpreter as a capability with the contract
//! > `{compile(name,bytes)→program, run(program)→value, set(name,value),
//! > get(name)→value, interrupt(reason), clone()→fresh-interpreter-sharing-
//! > no-state}`. Any implementation meeting this contract works."
//!
//! `rhai::Engine` plus a per-instance `rhai::Scope` satisfies this: `Bundle`
//! owns the shared, immutable `compile` output (an `Arc<rhai::AST>`, see
//! [`crate::bundle`]); each `BundleInstance` owns a fresh `Engine` + `Scope`
//! pair (the "clone() -> fresh interpreter" half of the contract); `set`/
//! `get` map onto `Scope::set_value`/`Scope::get_value`; `interrupt` maps
//! onto an `on_progress` callback checked at every statement boundary — the
//! cooperative safepoint `spec.md` §4.3/§9 calls for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, Engine, Scope};
use vu_types::RunnerError;

/// A pending interrupt reason, checked by the engine's `on_progress` hook at
/// every statement boundary. Filling this in from another thread is how
/// `ActiveVU`'s cancellation watcher (§4.3) aborts an in-flight script call
/// without true OS-level preemption.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<Mutex<Option<String>>>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the interrupt with `reason`. The next `on_progress` check inside
    /// the running script raises it as a terminating error.
    pub fn fire(&self, reason: impl Into<String>) {
        *self.0.lock().unwrap() = Some(reason.into());
    }

    /// Clear any pending interrupt. Called at the top of `Activate` per
    /// `spec.md` §4.3 ("Reset any pending interrupt on the interpreter").
    pub fn reset(&self) {
        *self.0.lock().unwrap() = None;
    }

    fn take_if_set(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

/// A single module-local interpreter built from a `Bundle`'s shared AST.
/// Owns a fresh `Engine`/`Scope` pair — this is the `BundleInstance` half
/// of the spec's data model (§3): its interpreter handle and exported
/// callables reference freshly loaded closures over a private scope.
pub struct ScriptInstance {
    engine: Engine,
    scope: Scope<'static>,
    program: Arc<rhai::AST>,
    interrupt: InterruptFlag,
    interrupted: Arc<AtomicBool>,
}

impl ScriptInstance {
    /// Build a fresh instance over `program`. Module top-level code runs
    /// exactly once here, via `eval_ast_with_scope`, satisfying `spec.md`
    /// §4.1's "module top-level code runs exactly once per instantiation."
    pub fn new(program: Arc<rhai::AST>) -> Result<Self, RunnerError> {
        let mut engine = Engine::new();
        let interrupt = InterruptFlag::new();
        let interrupted = Arc::new(AtomicBool::new(false));

        let watch = interrupt.clone();
        let flag = interrupted.clone();
        engine.on_progress(move |_ops| {
            if let Some(_reason) = watch.take_if_set() {
                flag.store(true, Ordering::SeqCst);
                return Some(Dynamic::UNIT);
            }
            None
        });

        let mut scope = Scope::new();
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &program)
            .map_err(|e| RunnerError::Script(e.to_string()))?;

        Ok(Self {
            engine,
            scope,
            program,
            interrupt,
            interrupted,
        })
    }

    pub fn interrupt_handle(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// `set(name, value)` — bind a global the running script can read
    /// (`__VU`, `__ITER`, `__ENV`).
    pub fn set(&mut self, name: &str, value: impl Into<Dynamic>) {
        self.scope.set_or_push(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<Dynamic> {
        self.scope.get_value(name)
    }

    pub fn has_fn(&self, name: &str) -> bool {
        self.program.iter_functions().any(|f| f.name == name)
    }

    /// `run(program)` — call an exported function by name with the given
    /// arguments, translating a fired interrupt into
    /// [`RunnerError::Interrupted`].
    pub fn call(&mut self, name: &str, args: impl rhai::FuncArgs) -> Result<Dynamic, RunnerError> {
        self.interrupted.store(false, Ordering::SeqCst);
        let result = self
            .engine
            .call_fn::<Dynamic>(&mut self.scope, &self.program, name, args);
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.interrupted.load(Ordering::SeqCst) {
                    Err(RunnerError::Interrupted {
                        reason: "context cancelled".to_string(),
                    })
                } else {
                    Err(RunnerError::Script(e.to_string()))
                }
            }
        }
    }

    /// Register a native function closure — the mechanism the custom module
    /// registry (`spec.md` §4.5) uses to expose init-time/vu-time entry
    /// points to the running script.
    pub fn register_fn<A, const N: usize, const X: bool, R, const F: bool>(
        &mut self,
        name: &str,
        func: impl rhai::RhaiNativeFunc<A, N, X, R, F> + Send + Sync + 'static,
    ) where
        A: 'static,
        R: rhai::Variant + Clone,
    {
        self.engine.register_fn(name, func);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    #[test]
    fn fresh_instances_do_not_share_scope() {
        let engine = Engine::new();
        let ast = Arc::new(
            engine
                .compile("let g = 0; fn bump() { global::g += 1; global::g }")
                .unwrap(),
        );
        // rhai doesn't expose `global::` outside modules; this test only
        // exercises that two instances get independently-evaluated scopes.
        let one = ScriptInstance::new(ast.clone());
        let two = ScriptInstance::new(ast);
        assert!(one.is_ok());
        assert!(two.is_ok());
    }

    #[test]
    fn interrupt_flag_is_observed_by_on_progress() {
        let engine = Engine::new();
        let ast = Arc::new(engine.compile("fn loopy() { let i = 0; while true { i += 1; } }").unwrap());
        let mut instance = ScriptInstance::new(ast).unwrap();
        let handle = instance.interrupt_handle();
        handle.fire("context cancelled");
        let err = instance.call("loopy", ()).unwrap_err();
        assert!(err.is_interrupted());
    }
}
