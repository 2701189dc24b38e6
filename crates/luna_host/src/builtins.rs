//! Host functions and objects exposed to scripts.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use luna_bridge::{
    BridgeError, CallContext, CallbackObject, ControlHandle, MethodDef, ScriptEngine, Value,
};

/// `sleep(ms)` — suspend the running script.
fn sleep_callback(ctx: &mut CallContext<'_>) -> Result<Vec<Value>, BridgeError> {
    let ms = ctx.arg(0).to_integer().max(0) as u64;
    thread::sleep(Duration::from_millis(ms));
    Ok(Vec::new())
}

/// The `host` object: process information and a monotonic clock.
struct HostInfo {
    control: ControlHandle,
    started: Instant,
}

impl CallbackObject for HostInfo {
    fn object_type(&self) -> String {
        "host".to_string()
    }

    fn lua_methods(&self) -> Vec<MethodDef> {
        vec![
            MethodDef::new("version"),
            MethodDef::new("platform"),
            MethodDef::new("uptime"),
        ]
    }

    fn invoke(&self, method: &str, _ctx: &mut CallContext<'_>) -> Result<Vec<Value>, BridgeError> {
        match method {
            "version" => Ok(vec![Value::from(luna_bridge::VERSION)]),
            "platform" => Ok(vec![Value::from(std::env::consts::OS)]),
            "uptime" => Ok(vec![Value::Number(self.started.elapsed().as_secs_f64())]),
            other => Err(BridgeError::Runtime(format!("unknown method: {other}"))),
        }
    }

    fn control(&self) -> &ControlHandle {
        &self.control
    }
}

/// Install the host surface: `sleep`, the `host` object and the `args` array.
pub fn install(engine: &ScriptEngine, script_args: &[String]) -> Result<(), BridgeError> {
    let sleep = engine.register_callback(sleep_callback, &[]);
    engine.set_global("sleep", &sleep)?;

    let host = engine.add_managed_object(Arc::new(HostInfo {
        control: ControlHandle::new(),
        started: Instant::now(),
    }));
    engine.set_global("host", &host)?;

    let mut args_value = Value::Nil;
    let items = args_value.new_array();
    for arg in script_args {
        items.push(Value::from(arg.clone()));
    }
    engine.set_global("args", &args_value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_callable() {
        let engine = ScriptEngine::new().expect("engine");
        install(&engine, &["one".to_string(), "two".to_string()]).expect("install");

        let result = engine.execute_sync("return host.version(), host.platform()", "builtins");
        assert!(result.success, "{}", result.error_message);
        assert_eq!(result.results[0], Value::from(luna_bridge::VERSION));

        let result = engine.execute_sync("return #args, args[1], args[2]", "args");
        assert!(result.success, "{}", result.error_message);
        assert_eq!(
            result.results,
            vec![Value::Integer(2), Value::from("one"), Value::from("two")]
        );

        let result = engine.execute_sync("sleep(1) return host.uptime() >= 0", "sleep");
        assert!(result.success, "{}", result.error_message);
        assert_eq!(result.results, vec![Value::Boolean(true)]);
    }
}
