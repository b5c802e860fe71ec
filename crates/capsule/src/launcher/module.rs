//! Modules served by the launcher.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use capsule_protocol::{from_value, ErrorPayload, Kwargs, LogPayload, LogStream, SerializationError, Value};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

/// A failure to hand back to the caller as an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleError {
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

impl ModuleError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn attribute_error(module: &str, attribute: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("Module {} has no function {}.", module, attribute),
        )
    }

    pub fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            error_type: self.error_type,
            message: self.message,
            traceback: self.traceback,
        }
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(err: anyhow::Error) -> Self {
        let traceback = err
            .chain()
            .skip(1)
            .map(|cause| format!("Caused by: {}", cause))
            .collect::<Vec<_>>()
            .join("\n");
        Self::new("Error", err.to_string()).with_traceback(traceback)
    }
}

impl From<SerializationError> for ModuleError {
    fn from(err: SerializationError) -> Self {
        Self::new("SerializationError", err.to_string())
    }
}

/// Streams a call's output lines back to the caller as LOG messages.
#[derive(Clone)]
pub struct CallLogger {
    tx: Option<mpsc::UnboundedSender<LogPayload>>,
}

impl CallLogger {
    pub fn new(tx: mpsc::UnboundedSender<LogPayload>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A logger that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn print(&self, text: impl AsRef<str>) {
        self.emit(LogStream::Stdout, text.as_ref());
    }

    pub fn eprint(&self, text: impl AsRef<str>) {
        self.emit(LogStream::Stderr, text.as_ref());
    }

    pub fn emit(&self, stream: LogStream, text: &str) {
        let Some(tx) = &self.tx else { return };
        for line in text.lines() {
            let _ = tx.send(LogPayload {
                stream,
                text: line.to_string(),
            });
        }
    }
}

/// Arguments of one invocation.
pub struct Call {
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub log: CallLogger,
}

impl Call {
    pub fn new(args: Vec<Value>, kwargs: Kwargs, log: CallLogger) -> Self {
        Self { args, kwargs, log }
    }

    /// Positional argument `index`, or keyword `name`.
    pub fn value(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    /// Required argument decoded into `T`.
    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, ModuleError> {
        let value = self
            .value(index, name)
            .ok_or_else(|| ModuleError::type_error(format!("missing required argument `{}`", name)))?;
        from_value(value.clone()).map_err(|e| {
            ModuleError::type_error(format!("argument `{}`: {}", name, e.reason))
        })
    }

    /// Optional argument; absent or null gives `None`.
    pub fn opt_param<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, ModuleError> {
        match self.value(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.param(index, name).map(Some),
        }
    }
}

/// A named set of callables.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Exported callables, sent back on IMPORT.
    fn attributes(&self) -> Vec<String>;

    fn call(&self, attribute: &str, call: Call) -> Result<Value, ModuleError>;
}

type Function = Arc<dyn Fn(Call) -> Result<Value, ModuleError> + Send + Sync>;

/// A module assembled from closures.
///
/// ```ignore
/// let math = FnModule::new("math").function("add", |call| {
///     let a: i64 = call.param(0, "a")?;
///     let b: i64 = call.param(1, "b")?;
///     Ok(Value::Int(a + b))
/// });
/// ```
pub struct FnModule {
    name: String,
    functions: BTreeMap<String, Function>,
}

impl FnModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Call) -> Result<Value, ModuleError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }
}

impl Module for FnModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    fn call(&self, attribute: &str, call: Call) -> Result<Value, ModuleError> {
        match self.functions.get(attribute) {
            Some(f) => f(call),
            None => Err(ModuleError::attribute_error(&self.name, attribute)),
        }
    }
}

thread_local! {
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Record where panics happen so a caught panic can report its location.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let text = format!("{}:{}:{}", location.file(), location.line(), location.column());
                PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(text));
            }
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-text payload".to_string()
    }
}

/// Run a module function, turning a panic into a `Panic` error.
pub fn call_guarded(module: &dyn Module, attribute: &str, call: Call) -> Result<Value, ModuleError> {
    install_panic_hook();
    PANIC_LOCATION.with(|slot| slot.borrow_mut().take());
    match panic::catch_unwind(AssertUnwindSafe(|| module.call(attribute, call))) {
        Ok(result) => result,
        Err(payload) => {
            let location = PANIC_LOCATION
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| "unknown location".to_string());
            let message = panic_message(payload.as_ref());
            Err(ModuleError::new("Panic", message.clone()).with_traceback(format!(
                "{}.{} panicked at {}:\n{}",
                module.name(),
                attribute,
                location,
                message
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn math() -> FnModule {
        FnModule::new("math")
            .function("add", |call| {
                let a: i64 = call.param(0, "a")?;
                let b: i64 = call.param(1, "b")?;
                Ok(Value::Int(a + b))
            })
            .function("boom", |_| panic!("kaboom"))
    }

    #[test]
    fn test_fn_module_dispatch() {
        let module = math();
        assert_eq!(module.attributes(), vec!["add", "boom"]);

        let call = Call::new(vec![Value::Int(2), Value::Int(3)], Kwargs::new(), CallLogger::discard());
        assert_eq!(module.call("add", call).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_kwargs_fill_missing_positionals() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("b".into(), Value::Int(10));
        let call = Call::new(vec![Value::Int(1)], kwargs, CallLogger::discard());
        assert_eq!(math().call("add", call).unwrap(), Value::Int(11));
    }

    #[test]
    fn test_missing_and_mistyped_arguments() {
        let call = Call::new(vec![Value::Int(1)], Kwargs::new(), CallLogger::discard());
        let err = math().call("add", call).unwrap_err();
        assert_eq!(err.error_type, "TypeError");
        assert!(err.message.contains("`b`"));

        let call = Call::new(
            vec![Value::Int(1), Value::from("two")],
            Kwargs::new(),
            CallLogger::discard(),
        );
        let err = math().call("add", call).unwrap_err();
        assert_eq!(err.error_type, "TypeError");
    }

    #[test]
    fn test_unknown_attribute_message() {
        let call = Call::new(vec![], Kwargs::new(), CallLogger::discard());
        let err = math().call("sub", call).unwrap_err();
        assert_eq!(err.error_type, "AttributeError");
        assert_eq!(err.message, "Module math has no function sub.");
    }

    #[test]
    fn test_panic_becomes_error() {
        let module = math();
        let call = Call::new(vec![], Kwargs::new(), CallLogger::discard());
        let err = call_guarded(&module, "boom", call).unwrap_err();
        assert_eq!(err.error_type, "Panic");
        assert_eq!(err.message, "kaboom");
        assert!(err.traceback.contains("math.boom panicked at"));
        assert!(err.traceback.contains("module.rs"));
    }

    #[test]
    fn test_anyhow_chain_becomes_traceback() {
        let err = anyhow::anyhow!("disk full").context("saving results");
        let module_err = ModuleError::from(err);
        assert_eq!(module_err.message, "saving results");
        assert_eq!(module_err.traceback, "Caused by: disk full");
    }

    #[tokio::test]
    async fn test_logger_splits_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = CallLogger::new(tx);
        logger.print("one\ntwo");
        logger.eprint("oops");
        drop(logger);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push((line.stream, line.text));
        }
        assert_eq!(
            lines,
            vec![
                (LogStream::Stdout, "one".to_string()),
                (LogStream::Stdout, "two".to_string()),
                (LogStream::Stderr, "oops".to_string()),
            ]
        );
    }
}
