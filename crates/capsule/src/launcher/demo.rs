//! The `demo` module served by `capsule-demo-launcher`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capsule_protocol::Value;

use super::module::{FnModule, ModuleError};

fn add(a: &Value, b: &Value) -> Result<Value, ModuleError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_add(*y)
            .map(Value::Int)
            .ok_or_else(|| ModuleError::new("OverflowError", "integer addition overflowed")),
        (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{}{}", x, y))),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Float(x + y)),
            _ => Err(ModuleError::type_error(format!(
                "unsupported operand types for +: '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

pub fn demo_module() -> FnModule {
    let store: Arc<Mutex<BTreeMap<String, Value>>> = Arc::default();
    let load_store = store.clone();

    FnModule::new("demo")
        .function("add", |call| {
            let a = call
                .value(0, "a")
                .ok_or_else(|| ModuleError::type_error("missing required argument `a`"))?;
            let b = call
                .value(1, "b")
                .ok_or_else(|| ModuleError::type_error("missing required argument `b`"))?;
            add(a, b)
        })
        .function("identity", |call| {
            Ok(call.value(0, "value").cloned().unwrap_or(Value::Null))
        })
        .function("fail", |call| {
            let message: String = call.param(0, "message")?;
            Err(ModuleError::value_error(message)
                .with_traceback("demo.fail raised on request"))
        })
        .function("store", move |call| {
            let key: String = call.param(0, "key")?;
            let value = call.value(1, "value").cloned().unwrap_or(Value::Null);
            let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
            Ok(store.insert(key, value).unwrap_or(Value::Null))
        })
        .function("load", move |call| {
            let key: String = call.param(0, "key")?;
            let store = load_store.lock().unwrap_or_else(|e| e.into_inner());
            store
                .get(&key)
                .cloned()
                .ok_or_else(|| ModuleError::new("KeyError", key))
        })
        .function("chatter", |call| {
            let n: u32 = call.param(0, "n")?;
            for i in 0..n {
                if i % 2 == 0 {
                    call.log.print(format!("line {}", i));
                } else {
                    call.log.eprint(format!("line {}", i));
                }
            }
            Ok(Value::Int(i64::from(n)))
        })
        .function("sleep", |call| {
            let ms: u64 = call.param(0, "ms")?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(Value::Null)
        })
        .function("abort", |_| std::process::abort())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::module::{Call, CallLogger, Module};
    use capsule_protocol::Kwargs;

    fn call(module: &FnModule, attribute: &str, args: Vec<Value>) -> Result<Value, ModuleError> {
        module.call(attribute, Call::new(args, Kwargs::new(), CallLogger::discard()))
    }

    #[test]
    fn test_add() {
        let demo = demo_module();
        assert_eq!(call(&demo, "add", vec![2.into(), 3.into()]).unwrap(), Value::Int(5));
        assert_eq!(
            call(&demo, "add", vec![1.5.into(), 1.into()]).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            call(&demo, "add", vec!["ab".into(), "cd".into()]).unwrap(),
            Value::from("abcd")
        );
        let err = call(&demo, "add", vec![Value::Null, 1.into()]).unwrap_err();
        assert_eq!(err.error_type, "TypeError");
        let err = call(&demo, "add", vec![i64::MAX.into(), 1.into()]).unwrap_err();
        assert_eq!(err.error_type, "OverflowError");
    }

    #[test]
    fn test_fail_carries_message() {
        let err = call(&demo_module(), "fail", vec!["bad".into()]).unwrap_err();
        assert_eq!(err.error_type, "ValueError");
        assert_eq!(err.message, "bad");
    }

    #[test]
    fn test_store_then_load() {
        let demo = demo_module();
        assert_eq!(
            call(&demo, "store", vec!["k".into(), 7.into()]).unwrap(),
            Value::Null
        );
        assert_eq!(call(&demo, "load", vec!["k".into()]).unwrap(), Value::Int(7));
        assert_eq!(
            call(&demo, "load", vec!["missing".into()]).unwrap_err().error_type,
            "KeyError"
        );
    }
}
