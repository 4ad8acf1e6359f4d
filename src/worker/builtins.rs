//! Built-in capabilities every minion registers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::ExecutionError;
use crate::worker::capability::{CallContext, CallOutput, Capability, CapabilityRegistry, LoaderContext};
use crate::worker::executor::CmdRun;

/// Positional argument `index`, or keyword `name`.
fn arg<'a>(
    args: &'a [Value],
    kwargs: &'a BTreeMap<String, Value>,
    index: usize,
    name: &str,
) -> Option<&'a Value> {
    args.get(index).or_else(|| kwargs.get(name))
}

macro_rules! capability {
    ($ty:ident, $name:literal, |$ctx:ident, $args:ident, $kwargs:ident| $body:expr) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        #[async_trait]
        impl Capability for $ty {
            fn name(&self) -> &str {
                $name
            }

            async fn invoke(
                &self,
                $ctx: &CallContext,
                $args: &[Value],
                $kwargs: &BTreeMap<String, Value>,
            ) -> Result<CallOutput, ExecutionError> {
                $body
            }
        }
    };
}

capability!(TestPing, "test.ping", |_ctx, _args, _kwargs| Ok(CallOutput::new(true)));

capability!(TestEcho, "test.echo", |_ctx, args, kwargs| {
    let text = arg(args, kwargs, 0, "text")
        .ok_or_else(|| ExecutionError::InvalidArguments("test.echo requires text".into()))?;
    Ok(CallOutput::new(text.clone()))
});

capability!(TestArg, "test.arg", |_ctx, args, kwargs| {
    let kwargs: Map<String, Value> = kwargs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    Ok(CallOutput::new(json!({ "args": args, "kwargs": kwargs })))
});

capability!(TestSleep, "test.sleep", |_ctx, args, kwargs| {
    let length = arg(args, kwargs, 0, "length")
        .and_then(Value::as_f64)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| {
            ExecutionError::InvalidArguments("test.sleep requires a non-negative length".into())
        })?;
    tokio::time::sleep(length).await;
    Ok(CallOutput::new(true))
});

capability!(TestRetcode, "test.retcode", |_ctx, args, kwargs| {
    let code = match arg(args, kwargs, 0, "code") {
        None => 0,
        Some(v) => v
            .as_i64()
            .and_then(|c| i32::try_from(c).ok())
            .ok_or_else(|| ExecutionError::InvalidArguments("test.retcode code must be an integer".into()))?,
    };
    Ok(CallOutput::with_retcode(true, code))
});

capability!(GrainsItems, "grains.items", |ctx, _args, _kwargs| {
    Ok(CallOutput::new((*ctx.grains).clone()))
});

capability!(GrainsGet, "grains.get", |ctx, args, kwargs| {
    let key = arg(args, kwargs, 0, "key")
        .and_then(Value::as_str)
        .ok_or_else(|| ExecutionError::InvalidArguments("grains.get requires a key".into()))?;
    let default = arg(args, kwargs, 1, "default")
        .cloned()
        .unwrap_or_else(|| json!(""));
    let delimiter = kwargs
        .get("delimiter")
        .and_then(Value::as_str)
        .unwrap_or(":");

    let mut node = ctx.grains.as_ref();
    for part in key.split(delimiter) {
        let next = match node {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => node = v,
            None => return Ok(CallOutput::new(default)),
        }
    }
    Ok(CallOutput::new(node.clone()))
});

capability!(SysListFunctions, "sys.list_functions", |ctx, args, kwargs| {
    let prefix = arg(args, kwargs, 0, "module").and_then(Value::as_str);
    let names: Vec<String> = ctx
        .registry()
        .names()
        .into_iter()
        .filter(|n| prefix.map_or(true, |p| n.starts_with(&format!("{p}."))))
        .collect();
    Ok(CallOutput::new(json!(names)))
});

/// Registers every built-in with availability checked against `ctx`.
pub fn register_builtins(registry: &mut CapabilityRegistry, ctx: &LoaderContext<'_>) {
    let builtins: Vec<Arc<dyn Capability>> = vec![
        Arc::new(TestPing),
        Arc::new(TestEcho),
        Arc::new(TestArg),
        Arc::new(TestSleep),
        Arc::new(TestRetcode),
        Arc::new(GrainsItems),
        Arc::new(GrainsGet),
        Arc::new(SysListFunctions),
        Arc::new(CmdRun::new(ctx.config.sandbox.clone())),
    ];
    for capability in builtins {
        registry.register(capability, ctx);
    }
}
