//! Script host interface
//!
//! The engine embeds user scripts (JS or Python) behind this trait; the
//! actual VMs are external collaborators. One host per spider, never shared.
//! Every `call` runs under a hard deadline: on expiry the host is
//! interrupted, given a short grace period, then abandoned.

pub mod bridge;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use bridge::Bridge;

/// Hard per-call deadline.
pub const CALL_DEADLINE: Duration = Duration::from_secs(15);

/// Grace period between interrupt and forced abandonment.
const INTERRUPT_GRACE: Duration = Duration::from_millis(200);

/// Script runtime flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEngine {
    Js,
    Py,
}

impl ScriptEngine {
    /// Infer the engine from a script URL.
    pub fn infer(url: &str) -> Self {
        let lower = url.to_lowercase();
        if lower.ends_with(".py") || lower.contains("hipy") {
            Self::Py
        } else {
            Self::Js
        }
    }
}

/// Embedded VM surface.
///
/// `call` arguments and results cross the boundary as JSON values; the
/// bridge functions in [`bridge`] are injected before any user source runs.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Evaluate user source in the host's global scope.
    async fn eval(&self, source: &str) -> Result<Value>;

    async fn has_fn(&self, name: &str) -> bool;

    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value>;

    /// Signal the host to abort the in-flight call. Idempotent.
    fn interrupt(&self);

    async fn destroy(&self);
}

/// Creates hosts on demand; injected into the spider manager so the VM
/// embedding stays external to this crate.
pub trait ScriptHostFactory: Send + Sync {
    fn create(&self, engine: ScriptEngine, bridge: Arc<Bridge>) -> Result<Box<dyn ScriptHost>>;
}

/// Factory used when no VM is embedded: script spiders degrade to null.
pub struct NoScriptRuntime;

impl ScriptHostFactory for NoScriptRuntime {
    fn create(&self, engine: ScriptEngine, _bridge: Arc<Bridge>) -> Result<Box<dyn ScriptHost>> {
        Err(Error::Script(format!("no {engine:?} runtime embedded")))
    }
}

/// Run `host.call` under the hard deadline with cooperative cancellation.
pub async fn guarded_call(
    host: &dyn ScriptHost,
    name: &str,
    args: Vec<Value>,
    cancel: &CancellationToken,
) -> Result<Value> {
    let call = host.call(name, args);
    tokio::pin!(call);

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            host.interrupt();
            Err(Error::Cancelled)
        }
        result = &mut call => result,
        () = tokio::time::sleep(CALL_DEADLINE) => {
            host.interrupt();
            match tokio::time::timeout(INTERRUPT_GRACE, &mut call).await {
                Ok(result) => result,
                Err(_) => Err(Error::ScriptTimeout(name.to_string())),
            }
        }
    }
}

type Callback = Box<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Host backed by registered Rust callbacks instead of a VM.
///
/// Used by tests and by embedders that want to expose a fixed function set
/// through the script-host seam without shipping an interpreter.
#[derive(Default)]
pub struct CallbackScriptHost {
    functions: HashMap<String, Callback>,
}

impl CallbackScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fn(
        mut self,
        name: &str,
        f: impl Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.to_string(), Box::new(f));
        self
    }
}

#[async_trait]
impl ScriptHost for CallbackScriptHost {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn eval(&self, _source: &str) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn has_fn(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match self.functions.get(name) {
            Some(f) => f(args),
            None => Err(Error::Script(format!("undefined function: {name}"))),
        }
    }

    fn interrupt(&self) {}

    async fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_inference_prefers_python_markers() {
        assert_eq!(ScriptEngine::infer("https://x/spider.py"), ScriptEngine::Py);
        assert_eq!(ScriptEngine::infer("https://x/hipy/base.txt"), ScriptEngine::Py);
        assert_eq!(ScriptEngine::infer("https://x/drpy.min.js"), ScriptEngine::Js);
    }

    #[tokio::test]
    async fn guarded_call_runs_registered_function() {
        let host = CallbackScriptHost::new()
            .with_fn("homeContent", |_| Ok(serde_json::json!({"class": []})));
        let value = guarded_call(
            &host,
            "homeContent",
            vec![Value::Bool(true)],
            &CancellationToken::new(),
        )
        .await
        .expect("call");
        assert_eq!(value, serde_json::json!({"class": []}));
    }

    #[tokio::test]
    async fn guarded_call_cancellation_interrupts() {
        struct SlowHost;
        #[async_trait]
        impl ScriptHost for SlowHost {
            async fn init(&self) -> Result<()> {
                Ok(())
            }
            async fn eval(&self, _source: &str) -> Result<Value> {
                Ok(Value::Null)
            }
            async fn has_fn(&self, _name: &str) -> bool {
                true
            }
            async fn call(&self, _name: &str, _args: Vec<Value>) -> Result<Value> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
            fn interrupt(&self) {}
            async fn destroy(&self) {}
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = guarded_call(&SlowHost, "searchContent", Vec::new(), &cancel)
            .await
            .expect_err("must cancel");
        assert!(matches!(err, Error::Cancelled));
    }
}
