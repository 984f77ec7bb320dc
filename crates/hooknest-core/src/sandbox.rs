//! User-script sandbox built on rhai.
//!
//! Scripts receive the in-flight event as a map named `event` and may
//! mutate `status_code`, `response_body`, `response_headers`, and `body`.
//! Execution is wall-clock bounded via the engine's progress hook and has
//! no access to the host filesystem or network. Script failures and
//! timeouts are logged and swallowed: the pipeline never fails because of
//! a faulty script.

use crate::error::{Error, Result};
use rhai::{AST, Dynamic, Engine, Scope};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default wall-clock budget for one script run.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(1);

struct CompiledScript {
    source: String,
    ast: Arc<AST>,
}

/// Compiles and runs user scripts, caching compilation against the source
/// string. Recompilation happens only when the (trimmed) source changes.
#[derive(Default)]
pub struct ScriptSandbox {
    cache: Mutex<Option<CompiledScript>>,
}

fn build_engine(deadline: Instant) -> Engine {
    let mut engine = Engine::new();
    // No filesystem, network, or module access is registered; the default
    // engine only exposes the language and its standard types.
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1024 * 1024);
    engine.set_max_array_size(64 * 1024);
    engine.set_max_map_size(64 * 1024);
    engine.on_progress(move |_| {
        if Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    engine.on_print(|text| tracing::info!(target: "hooknest::script", "{}", text));
    engine.on_debug(|text, _, pos| {
        tracing::debug!(target: "hooknest::script", ?pos, "{}", text);
    });
    engine
}

impl ScriptSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `source` and cache the result. A failed compile clears any
    /// previously cached script so a broken artifact is never applied.
    pub fn prepare(&self, source: &str) -> Result<()> {
        let normalized = source.trim();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.as_ref().is_some_and(|c| c.source == normalized) {
            return Ok(());
        }
        // Compilation does not run user code; a throwaway deadline is fine.
        let engine = build_engine(Instant::now() + Duration::from_secs(5));
        match engine.compile(normalized) {
            Ok(ast) => {
                *cache = Some(CompiledScript {
                    source: normalized.to_string(),
                    ast: Arc::new(ast),
                });
                Ok(())
            }
            Err(e) => {
                *cache = None;
                Err(Error::Script(format!("compile failed: {}", e)))
            }
        }
    }

    /// Drop the cached compilation (used when the config no longer carries
    /// a script, or a reload saw a compile failure).
    pub fn clear(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn compiled_for(&self, source: &str) -> Option<Arc<AST>> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = cache.as_ref()
                && c.source == source.trim()
            {
                return Some(Arc::clone(&c.ast));
            }
        }
        match self.prepare(source) {
            Ok(()) => {
                let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.as_ref().map(|c| Arc::clone(&c.ast))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Custom script failed to compile; skipping transform");
                None
            }
        }
    }

    /// Run the script against `event`, returning the (possibly mutated)
    /// event. Returns `None` when the script failed, timed out, or produced
    /// something that is no longer an object; callers keep the original
    /// event in that case.
    pub async fn run(
        &self,
        source: &str,
        event: serde_json::Value,
        timeout: Duration,
    ) -> Option<serde_json::Value> {
        let ast = self.compiled_for(source)?;

        let result = tokio::task::spawn_blocking(move || run_blocking(&ast, event, timeout)).await;
        match result {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Custom script failed; event left unchanged");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Custom script task panicked; event left unchanged");
                None
            }
        }
    }
}

fn run_blocking(
    ast: &AST,
    event: serde_json::Value,
    timeout: Duration,
) -> std::result::Result<serde_json::Value, String> {
    let started = Instant::now();
    let engine = build_engine(started + timeout);

    let dynamic = rhai::serde::to_dynamic(&event).map_err(|e| e.to_string())?;
    let mut scope = Scope::new();
    scope.push_dynamic("event", dynamic);

    match engine.run_ast_with_scope(&mut scope, ast) {
        Ok(()) => {}
        Err(e) => {
            if matches!(*e, rhai::EvalAltResult::ErrorTerminated(..)) {
                return Err(format!(
                    "script exceeded wall-clock budget of {:?} (ran {:?})",
                    timeout,
                    started.elapsed()
                ));
            }
            return Err(e.to_string());
        }
    }

    let mutated: Dynamic = scope
        .get_value("event")
        .ok_or_else(|| "script removed the event binding".to_string())?;
    let value: serde_json::Value = rhai::serde::from_dynamic(&mutated).map_err(|e| e.to_string())?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("script replaced the event with a non-object value".to_string())
    }
}
