//! The built-in `sys` module, available in every launcher.

use std::collections::BTreeMap;

use capsule_protocol::Value;

use super::code::find_program;
use super::module::{FnModule, ModuleError};

pub fn sys_module() -> FnModule {
    FnModule::new("sys")
        .function("platform", |_| {
            Ok(Value::Str(capsule_env::current_platform().to_string()))
        })
        .function("pid", |_| Ok(Value::Int(i64::from(std::process::id()))))
        .function("cwd", |_| {
            let cwd = std::env::current_dir()
                .map_err(|e| ModuleError::new("OSError", e.to_string()))?;
            Ok(Value::Str(cwd.to_string_lossy().into_owned()))
        })
        .function("getenv", |call| {
            let name: String = call.param(0, "name")?;
            Ok(std::env::var(&name).map(Value::Str).unwrap_or(Value::Null))
        })
        .function("environ", |_| {
            let vars: BTreeMap<String, Value> =
                std::env::vars().map(|(k, v)| (k, Value::Str(v))).collect();
            Ok(Value::Map(vars))
        })
        .function("which", |call| {
            let program: String = call.param(0, "program")?;
            Ok(find_program(&program)
                .map(|p| Value::Str(p.to_string_lossy().into_owned()))
                .unwrap_or(Value::Null))
        })
        .function("echo", |call| {
            Ok(call.value(0, "value").cloned().unwrap_or(Value::Null))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::module::{Call, CallLogger, Module};
    use capsule_protocol::Kwargs;

    fn call(attribute: &str, args: Vec<Value>) -> Result<Value, ModuleError> {
        sys_module().call(attribute, Call::new(args, Kwargs::new(), CallLogger::discard()))
    }

    #[test]
    fn test_attributes() {
        assert_eq!(
            sys_module().attributes(),
            vec!["cwd", "echo", "environ", "getenv", "pid", "platform", "which"]
        );
    }

    #[test]
    fn test_pid_and_platform() {
        assert_eq!(call("pid", vec![]).unwrap(), Value::Int(i64::from(std::process::id())));
        let platform = call("platform", vec![]).unwrap();
        assert!(platform.as_str().is_some_and(|p| !p.is_empty()));
    }

    #[test]
    fn test_getenv_missing_is_null() {
        assert_eq!(
            call("getenv", vec![Value::from("CAPSULE_SURELY_UNSET_VAR")]).unwrap(),
            Value::Null
        );
        assert!(call("environ", vec![]).unwrap().as_map().is_some());
    }

    #[test]
    fn test_echo_returns_argument() {
        let value = Value::List(vec![Value::Int(1), Value::bytes(vec![0, 1])]);
        assert_eq!(call("echo", vec![value.clone()]).unwrap(), value);
        assert_eq!(call("echo", vec![]).unwrap(), Value::Null);
    }

    #[cfg(unix)]
    #[test]
    fn test_which() {
        assert!(call("which", vec![Value::from("sh")]).unwrap().as_str().is_some());
        assert_eq!(
            call("which", vec![Value::from("no-such-program-xyz")]).unwrap(),
            Value::Null
        );
    }
}
