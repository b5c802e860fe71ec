//! Raw code execution behind the reserved `__code__` module.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Result};
use capsule_protocol::Value;
use log::debug;

use super::module::{Call, CallLogger, Module, ModuleError};

pub const CODE_MODULE: &str = "__code__";
pub const CODE_ATTRIBUTE: &str = "run";

/// Runs a piece of source text and reports its outcome as a value.
pub trait CodeRunner: Send + Sync {
    fn run(&self, source: &str, log: &CallLogger) -> Result<Value, ModuleError>;
}

/// Runs `<program> <args...> <source>` and streams its output lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        #[cfg(windows)]
        let (program, flag) = ("cmd", "/C");
        #[cfg(not(windows))]
        let (program, flag) = ("sh", "-c");

        Self {
            program: PathBuf::from(program),
            args: vec![flag.to_string()],
        }
    }
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Runner for the launcher's `--interpreter` options. The interpreter
    /// must resolve to an existing executable.
    pub fn from_interpreter(interpreter: Option<&str>, args: Vec<String>) -> Result<Self> {
        let Some(interpreter) = interpreter else {
            if !args.is_empty() {
                bail!("--interpreter-arg given without --interpreter");
            }
            return Ok(Self::default());
        };
        if interpreter.trim().is_empty() {
            bail!("--interpreter is empty");
        }
        let Some(program) = find_program(interpreter) else {
            bail!("interpreter `{}` not found", interpreter);
        };
        Ok(Self::new(program, args))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl CodeRunner for CommandRunner {
    fn run(&self, source: &str, log: &CallLogger) -> Result<Value, ModuleError> {
        debug!("[launcher] Running code with {:?}", self.program);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ModuleError::new(
                    "SpawnError",
                    format!("cannot run {}: {}", self.program.display(), e),
                )
            })?;

        let stderr_reader = child.stderr.take().map(|stderr| {
            let log = log.clone();
            std::thread::spawn(move || {
                let mut lines = Vec::new();
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    log.eprint(&line);
                    lines.push(line);
                }
                lines
            })
        });

        let mut stdout = String::new();
        if let Some(out) = child.stdout.take() {
            for line in BufReader::new(out).lines().map_while(|l| l.ok()) {
                log.print(&line);
                stdout.push_str(&line);
                stdout.push('\n');
            }
        }

        let status = child
            .wait()
            .map_err(|e| ModuleError::new("SpawnError", e.to_string()))?;
        let stderr_lines = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        // Killed by a signal has no code.
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            return Err(ModuleError::new(
                "CodeExit",
                format!("command exited with status {}", code),
            )
            .with_traceback(stderr_lines.join("\n")));
        }

        let mut result = BTreeMap::new();
        result.insert("exitCode".to_string(), Value::Int(i64::from(code)));
        result.insert("stdout".to_string(), Value::Str(stdout));
        Ok(Value::Map(result))
    }
}

/// The reserved module serving `execute_code`.
pub struct CodeModule {
    runner: Arc<dyn CodeRunner>,
}

impl CodeModule {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }
}

impl Module for CodeModule {
    fn name(&self) -> &str {
        CODE_MODULE
    }

    fn attributes(&self) -> Vec<String> {
        vec![CODE_ATTRIBUTE.to_string()]
    }

    fn call(&self, attribute: &str, call: Call) -> Result<Value, ModuleError> {
        if attribute != CODE_ATTRIBUTE {
            return Err(ModuleError::attribute_error(CODE_MODULE, attribute));
        }
        let source: String = call.param(0, "source")?;
        self.runner.run(&source, &call.log)
    }
}

/// Resolve `program` the way a shell would: paths as given, bare names
/// through `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let plain = dir.join(program);
        if plain.is_file() {
            return Some(plain);
        }
        let with_suffix = dir.join(format!("{}{}", program, std::env::consts::EXE_SUFFIX));
        with_suffix.is_file().then_some(with_suffix)
    })
}
