//! Capability registry: the functions a minion can run.
//!
//! Each capability decides once, at registration, whether it is usable on
//! this minion ([`Availability`]). Only available capabilities are callable,
//! under their own name or the alias they asked for.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::MinionConfig;
use crate::error::ExecutionError;
use crate::protocol::JobId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
    /// Available, but exposed under another name
    Aliased(String),
}

/// What a capability may inspect while deciding its availability.
#[derive(Debug, Clone, Copy)]
pub struct LoaderContext<'a> {
    pub minion_id: &'a str,
    pub config: &'a MinionConfig,
    pub grains: &'a Value,
}

/// Return value and optional explicit retcode of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    pub value: Value,
    pub retcode: Option<i32>,
}

impl CallOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            retcode: None,
        }
    }

    pub fn with_retcode(value: impl Into<Value>, retcode: i32) -> Self {
        Self {
            value: value.into(),
            retcode: Some(retcode),
        }
    }

    /// Explicit retcode if the capability set one; otherwise 1 when the value
    /// is a mapping whose `result` or `success` is `false`, else 0.
    pub fn effective_retcode(&self) -> i32 {
        if let Some(code) = self.retcode {
            return code;
        }
        match &self.value {
            Value::Object(map)
                if map.get("result") == Some(&Value::Bool(false))
                    || map.get("success") == Some(&Value::Bool(false)) =>
            {
                1
            }
            _ => 0,
        }
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    /// Dotted name, e.g. `test.ping`.
    fn name(&self) -> &str;

    fn availability(&self, _ctx: &LoaderContext<'_>) -> Availability {
        Availability::Available
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<CallOutput, ExecutionError>;
}

/// Everything a capability call can see: the minion's configuration, its
/// grains and the registry for calling sibling capabilities.
#[derive(Clone)]
pub struct CallContext {
    pub minion_id: String,
    pub config: Arc<MinionConfig>,
    pub grains: Arc<Value>,
    pub job_id: Option<JobId>,
    registry: Arc<CapabilityRegistry>,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("minion_id", &self.minion_id)
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl CallContext {
    pub fn new(
        minion_id: impl Into<String>,
        config: Arc<MinionConfig>,
        grains: Arc<Value>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            minion_id: minion_id.into(),
            config,
            grains,
            job_id: None,
            registry,
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Calls a sibling capability.
    pub async fn call(
        &self,
        function: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<CallOutput, ExecutionError> {
        self.registry.invoke(self, function, args, kwargs).await
    }
}

#[derive(Default)]
pub struct CapabilityRegistry {
    functions: BTreeMap<String, Arc<dyn Capability>>,
    unavailable: BTreeMap<String, String>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("unavailable", &self.unavailable)
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `capability` according to its availability on this minion.
    pub fn register(&mut self, capability: Arc<dyn Capability>, ctx: &LoaderContext<'_>) -> Availability {
        let name = capability.name().to_string();
        let availability = capability.availability(ctx);
        match &availability {
            Availability::Available => {
                self.unavailable.remove(&name);
                self.functions.insert(name, capability);
            }
            Availability::Aliased(alias) => {
                tracing::debug!(function = %name, alias = %alias, "Capability aliased");
                self.unavailable.remove(alias);
                self.functions.insert(alias.clone(), capability);
            }
            Availability::Unavailable(reason) => {
                tracing::debug!(function = %name, reason = %reason, "Capability unavailable");
                if !self.functions.contains_key(&name) {
                    self.unavailable.insert(name, reason.clone());
                }
            }
        }
        availability
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Callable names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn unavailable_reason(&self, name: &str) -> Option<&str> {
        self.unavailable.get(name).map(String::as_str)
    }

    pub async fn invoke(
        &self,
        ctx: &CallContext,
        function: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<CallOutput, ExecutionError> {
        let capability = self.get(function).ok_or_else(|| ExecutionError::NotAvailable {
            function: function.to_string(),
            reason: self.unavailable.get(function).cloned(),
        })?;
        capability.invoke(ctx, args, kwargs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effective_retcode() {
        assert_eq!(CallOutput::new(true).effective_retcode(), 0);
        assert_eq!(CallOutput::with_retcode(true, 3).effective_retcode(), 3);
        assert_eq!(CallOutput::new(json!({"result": false})).effective_retcode(), 1);
        assert_eq!(CallOutput::new(json!({"success": false})).effective_retcode(), 1);
        assert_eq!(CallOutput::new(json!({"result": true})).effective_retcode(), 0);
        assert_eq!(
            CallOutput::with_retcode(json!({"result": false}), 0).effective_retcode(),
            0
        );
    }

    struct Gated(Availability);

    #[async_trait]
    impl Capability for Gated {
        fn name(&self) -> &str {
            "pkg.install"
        }

        fn availability(&self, _ctx: &LoaderContext<'_>) -> Availability {
            self.0.clone()
        }

        async fn invoke(
            &self,
            _ctx: &CallContext,
            _args: &[Value],
            _kwargs: &BTreeMap<String, Value>,
        ) -> Result<CallOutput, ExecutionError> {
            Ok(CallOutput::new("installed"))
        }
    }

    #[tokio::test]
    async fn availability_gates_registration() {
        let config = MinionConfig::new("web1");
        let grains = json!({});
        let ctx = LoaderContext {
            minion_id: "web1",
            config: &config,
            grains: &grains,
        };

        let mut registry = CapabilityRegistry::new();
        registry.register(
            Arc::new(Gated(Availability::Unavailable("no package manager".into()))),
            &ctx,
        );
        assert!(!registry.contains("pkg.install"));
        assert_eq!(
            registry.unavailable_reason("pkg.install"),
            Some("no package manager")
        );

        registry.register(Arc::new(Gated(Availability::Aliased("apt.install".into()))), &ctx);
        assert!(registry.contains("apt.install"));
        assert!(!registry.contains("pkg.install"));

        let registry = Arc::new(registry);
        let call = CallContext::new("web1", Arc::new(config.clone()), Arc::new(grains), registry.clone());
        let out = call.call("apt.install", &[], &BTreeMap::new()).await.unwrap();
        assert_eq!(out.value, json!("installed"));

        let err = call.call("pkg.install", &[], &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "'pkg.install' is not available.");
    }
}
