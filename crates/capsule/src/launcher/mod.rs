//! The process that runs inside an environment and serves IMPORT/CALL
//! requests over its stdio.
//!
//! stdin carries requests, stdout carries responses, stderr carries the
//! launcher's own log. On Unix the original stdout descriptor is kept for the
//! channel and fd 1 is pointed at stderr, so a stray print from module code
//! lands in the log instead of corrupting a frame.
//!
//! Requests are served one at a time. A module function runs on the blocking
//! pool while its output lines are forwarded as LOG messages, and every LOG
//! for a call is written before that call's RESULT or ERROR.

pub mod builtins;
pub mod code;
pub mod demo;
pub mod module;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use capsule_protocol::{
    channel, CallPayload, ChannelReader, ChannelWriter, Envelope, ImportPayload, LogPayload,
    MessageType, ModuleInfo, ProtocolError, Value, PROTOCOL_VERSION,
};
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub use code::{CodeModule, CodeRunner, CommandRunner, CODE_ATTRIBUTE, CODE_MODULE};
pub use module::{Call, CallLogger, FnModule, Module, ModuleError};
pub use registry::ModuleRegistry;

/// Exit status for a failure before READY was sent.
pub const INIT_FAILURE_EXIT_CODE: i32 = 2;

/// LOG lines longer than this are cut before sending.
pub const MAX_LOG_LINE_BYTES: usize = 1024 * 1024;

/// Cap on each text field of an ERROR payload.
const MAX_ERROR_TEXT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(about = "Serve module calls for a capsule environment over stdio")]
pub struct LauncherArgs {
    /// Name of the environment this launcher serves (used in logs)
    #[arg(long)]
    pub env_name: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Program that runs code sent through execute_code (default: sh -c)
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Argument placed before the source text; repeatable
    #[arg(long = "interpreter-arg", allow_hyphen_values = true)]
    pub interpreter_args: Vec<String>,

    /// Wait this long before announcing READY
    #[arg(long, default_value = "0")]
    pub startup_delay_ms: u64,
}

/// Serves requests against a module registry.
pub struct Launcher {
    registry: ModuleRegistry,
    imported: HashSet<String>,
}

impl Launcher {
    /// The reserved code module is registered and importable without an
    /// IMPORT.
    pub fn new(registry: ModuleRegistry, runner: Arc<dyn CodeRunner>) -> Self {
        let registry = registry.with(CodeModule::new(runner));
        let mut imported = HashSet::new();
        imported.insert(CODE_MODULE.to_string());
        Self { registry, imported }
    }

    pub fn is_imported(&self, module: &str) -> bool {
        self.imported.contains(module)
    }

    /// Serve until SHUTDOWN or until the controller closes the channel.
    pub async fn serve<R, W>(
        &mut self,
        reader: &mut ChannelReader<R>,
        writer: &mut ChannelWriter<W>,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let envelope = match reader.recv().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    info!("[launcher] Controller closed the channel");
                    break;
                }
                Err(ProtocolError::Malformed(reason)) => {
                    warn!("[launcher] Dropping malformed message: {}", reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match envelope.kind {
                MessageType::Import => match envelope.payload_as::<ImportPayload>() {
                    Ok(payload) => self.handle_import(envelope.id, payload, writer).await?,
                    Err(e) => send_error(writer, envelope.id, bad_request(e)).await?,
                },
                MessageType::Call => match envelope.payload_as::<CallPayload>() {
                    Ok(payload) => self.handle_call(envelope.id, payload, writer).await?,
                    Err(e) => send_error(writer, envelope.id, bad_request(e)).await?,
                },
                MessageType::Shutdown => {
                    info!("[launcher] Shutdown requested");
                    break;
                }
                other => {
                    warn!(
                        "[launcher] Ignoring unexpected {} message (id {})",
                        other, envelope.id
                    );
                }
            }
        }
        writer.close().await.ok();
        Ok(())
    }

    async fn handle_import<W: AsyncWrite + Unpin>(
        &mut self,
        id: u64,
        payload: ImportPayload,
        writer: &mut ChannelWriter<W>,
    ) -> Result<(), ProtocolError> {
        let module = match self.registry.lookup(&payload.module) {
            Ok(module) => module,
            Err(e) => {
                info!("[launcher] Import of {} failed: {}", payload.module, e);
                return send_error(writer, id, e).await;
            }
        };
        self.imported.insert(payload.module.clone());
        info!("[launcher] Imported {}", payload.module);
        let info = ModuleInfo {
            module: payload.module,
            attributes: module.attributes(),
        };
        writer.send(&Envelope::module_info(id, &info)?).await
    }

    fn resolve(&self, payload: &CallPayload) -> Result<Arc<dyn Module>, ModuleError> {
        if !self.imported.contains(&payload.module) {
            return Err(ModuleError::new(
                "ModuleNotImported",
                format!("module '{}' has not been imported", payload.module),
            ));
        }
        let module = self.registry.lookup(&payload.module)?;
        if !module.attributes().iter().any(|a| a == &payload.attribute) {
            return Err(ModuleError::attribute_error(&payload.module, &payload.attribute));
        }
        Ok(module)
    }

    async fn handle_call<W: AsyncWrite + Unpin>(
        &mut self,
        id: u64,
        payload: CallPayload,
        writer: &mut ChannelWriter<W>,
    ) -> Result<(), ProtocolError> {
        let target = payload.target();
        let handler = match self.resolve(&payload) {
            Ok(handler) => handler,
            Err(e) => return send_error(writer, id, e).await,
        };
        debug!("[launcher] Calling {} (id {})", target, id);

        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogPayload>();
        let call = Call::new(payload.args, payload.kwargs, CallLogger::new(log_tx));
        let attribute = payload.attribute;
        let mut task = tokio::task::spawn_blocking(move || {
            module::call_guarded(handler.as_ref(), &attribute, call)
        });

        let joined = loop {
            tokio::select! {
                biased;
                Some(line) = log_rx.recv() => send_log(writer, id, line).await?,
                joined = &mut task => break joined,
            }
        };
        while let Ok(line) = log_rx.try_recv() {
            send_log(writer, id, line).await?;
        }

        let outcome = joined.unwrap_or_else(|e| {
            Err(ModuleError::new("Panic", format!("{} did not complete: {}", target, e)))
        });
        match outcome {
            Ok(value) => send_result(writer, id, &value).await,
            Err(e) => {
                debug!("[launcher] {} raised {}", target, e);
                send_error(writer, id, e).await
            }
        }
    }
}

fn bad_request(err: ProtocolError) -> ModuleError {
    ModuleError::new("ProtocolError", err.to_string())
}

/// Cut `text` to at most `limit` bytes on a char boundary, noting how much
/// was dropped.
fn truncate_text(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!(" ... [{} bytes truncated]", dropped));
    text
}

async fn send_log<W: AsyncWrite + Unpin>(
    writer: &mut ChannelWriter<W>,
    id: u64,
    line: LogPayload,
) -> Result<(), ProtocolError> {
    let text = truncate_text(line.text, MAX_LOG_LINE_BYTES);
    writer.send(&Envelope::log(id, line.stream, text)).await
}

/// A result that cannot be framed is reported as an ERROR for the same call;
/// nothing has been written when the frame check fails.
async fn send_result<W: AsyncWrite + Unpin>(
    writer: &mut ChannelWriter<W>,
    id: u64,
    value: &Value,
) -> Result<(), ProtocolError> {
    let envelope = match Envelope::result(id, value) {
        Ok(envelope) => envelope,
        Err(e) => return send_error(writer, id, ModuleError::from(e)).await,
    };
    match writer.send(&envelope).await {
        Err(ProtocolError::FrameTooLarge { size, max }) => {
            warn!("[launcher] Result for request {} is {} bytes, over the frame limit", id, size);
            let err = ModuleError::new(
                "SerializationError",
                format!("result of {} bytes exceeds the {} byte frame limit", size, max),
            );
            send_error(writer, id, err).await
        }
        other => other,
    }
}

async fn send_error<W: AsyncWrite + Unpin>(
    writer: &mut ChannelWriter<W>,
    id: u64,
    err: ModuleError,
) -> Result<(), ProtocolError> {
    let mut payload = err.into_payload();
    payload.message = truncate_text(payload.message, MAX_ERROR_TEXT_BYTES);
    payload.traceback = truncate_text(payload.traceback, MAX_ERROR_TEXT_BYTES);
    writer.send(&Envelope::error(id, &payload)?).await
}

/// Announce that initialization finished.
pub async fn send_ready<W: AsyncWrite + Unpin>(
    writer: &mut ChannelWriter<W>,
) -> Result<(), ProtocolError> {
    writer.send(&Envelope::ready()).await?;
    info!("[launcher] Ready (protocol version {})", PROTOCOL_VERSION);
    Ok(())
}

pub fn init_logging(args: &LauncherArgs) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .target(env_logger::Target::Stderr)
        .init();
}

type ChannelOutput = Box<dyn AsyncWrite + Send + Unpin>;

#[cfg(unix)]
fn channel_output() -> std::io::Result<ChannelOutput> {
    use std::os::unix::io::FromRawFd;

    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    Ok(Box::new(tokio::fs::File::from_std(file)))
}

#[cfg(not(unix))]
fn channel_output() -> std::io::Result<ChannelOutput> {
    Ok(Box::new(tokio::io::stdout()))
}

/// Run a launcher process over stdio. Returns the process exit status.
///
/// The `sys` module is always served in addition to `registry`.
pub async fn run(args: LauncherArgs, registry: ModuleRegistry) -> i32 {
    let env_name = args.env_name.as_deref().unwrap_or("<unnamed>").to_string();
    info!("[launcher] Starting for environment {}", env_name);

    let runner = match CommandRunner::from_interpreter(
        args.interpreter.as_deref(),
        args.interpreter_args.clone(),
    ) {
        Ok(runner) => runner,
        Err(e) => {
            error!("[launcher] Invalid interpreter configuration: {:#}", e);
            return INIT_FAILURE_EXIT_CODE;
        }
    };

    let output = match channel_output() {
        Ok(output) => output,
        Err(e) => {
            error!("[launcher] Cannot open the response channel: {}", e);
            return INIT_FAILURE_EXIT_CODE;
        }
    };

    if args.startup_delay_ms > 0 {
        info!("[launcher] Delaying startup by {} ms", args.startup_delay_ms);
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let mut launcher = Launcher::new(
        registry.with(builtins::sys_module()),
        Arc::new(runner),
    );
    let (mut reader, mut writer) = channel(tokio::io::stdin(), output);

    if let Err(e) = send_ready(&mut writer).await {
        error!("[launcher] Cannot announce READY: {}", e);
        return INIT_FAILURE_EXIT_CODE;
    }

    match launcher.serve(&mut reader, &mut writer).await {
        Ok(()) => {
            info!("[launcher] Environment {} exiting", env_name);
            0
        }
        Err(e) => {
            error!("[launcher] Channel failure: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_protocol::connection::MAX_FRAME_SIZE;
    use capsule_protocol::{ErrorPayload, Kwargs, LogStream};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        rx: ChannelReader<ReadHalf<DuplexStream>>,
        tx: ChannelWriter<WriteHalf<DuplexStream>>,
        server: tokio::task::JoinHandle<Result<(), ProtocolError>>,
    }

    fn start() -> Harness {
        start_with(ModuleRegistry::new().with(demo::demo_module()))
    }

    fn start_with(registry: ModuleRegistry) -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let (rx, tx) = channel(client_read, client_write);

        let mut launcher = Launcher::new(registry, Arc::new(CommandRunner::default()));
        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = channel(server_read, server_write);
            send_ready(&mut writer).await?;
            launcher.serve(&mut reader, &mut writer).await
        });
        Harness { rx, tx, server }
    }

    impl Harness {
        async fn next(&mut self) -> Envelope {
            self.rx.recv().await.unwrap().unwrap()
        }

        async fn call(&mut self, id: u64, module: &str, attribute: &str, args: Vec<Value>) {
            let payload = CallPayload::new(module, attribute, args, Kwargs::new());
            self.tx.send(&Envelope::call(id, &payload).unwrap()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ready_import_call() {
        let mut h = start();
        let ready = h.next().await;
        assert_eq!(ready.kind, MessageType::Ready);
        assert_eq!(ready.id, 0);
        assert_eq!(ready.payload["protocolVersion"], PROTOCOL_VERSION);

        h.tx.send(&Envelope::import(1, "demo")).await.unwrap();
        let reply = h.next().await;
        assert_eq!(reply.kind, MessageType::Result);
        let info: ModuleInfo = reply.payload_as().unwrap();
        assert!(info.attributes.contains(&"add".to_string()));

        h.call(2, "demo", "add", vec![2.into(), 3.into()]).await;
        let reply = h.next().await;
        assert_eq!((reply.id, reply.kind), (2, MessageType::Result));
        assert_eq!(reply.payload_as::<Value>().unwrap(), Value::Int(5));

        h.tx.send(&Envelope::shutdown(3)).await.unwrap();
        assert!(h.rx.recv().await.unwrap().is_none());
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_loop() {
        let mut h = start();
        h.next().await;

        h.tx.send(&Envelope::import(1, "nope")).await.unwrap();
        let reply = h.next().await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.payload_as::<ErrorPayload>().unwrap().error_type, "ModuleNotFound");

        h.call(2, "demo", "add", vec![1.into(), 1.into()]).await;
        let err: ErrorPayload = h.next().await.payload_as().unwrap();
        assert_eq!(err.error_type, "ModuleNotImported");

        h.tx.send(&Envelope::import(3, "demo")).await.unwrap();
        h.next().await;

        h.call(4, "demo", "missing", vec![]).await;
        let err: ErrorPayload = h.next().await.payload_as().unwrap();
        assert_eq!(err.error_type, "AttributeError");
        assert_eq!(err.message, "Module demo has no function missing.");

        h.call(5, "demo", "fail", vec!["bad".into()]).await;
        let err: ErrorPayload = h.next().await.payload_as().unwrap();
        assert_eq!(err.message, "bad");

        h.call(6, "demo", "add", vec![1.into(), 1.into()]).await;
        assert_eq!(h.next().await.payload_as::<Value>().unwrap(), Value::Int(2));

        h.tx.close().await.unwrap();
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_logs_precede_result() {
        let mut h = start();
        h.next().await;
        h.tx.send(&Envelope::import(1, "demo")).await.unwrap();
        h.next().await;

        h.call(2, "demo", "chatter", vec![4.into()]).await;
        let mut lines = Vec::new();
        let result = loop {
            let envelope = h.next().await;
            assert_eq!(envelope.id, 2);
            match envelope.kind {
                MessageType::Log => lines.push(envelope.payload_as::<LogPayload>().unwrap()),
                _ => break envelope,
            }
        };
        assert_eq!(result.kind, MessageType::Result);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].stream, LogStream::Stdout);
        assert_eq!(lines[1].stream, LogStream::Stderr);
        assert_eq!(lines[3].text, "line 3");
    }

    fn oversized_module() -> FnModule {
        FnModule::new("big")
            .function("blob", |_| Ok(Value::Str("a".repeat(MAX_FRAME_SIZE + 1))))
            .function("shout", |call| {
                call.log.print("b".repeat(MAX_LOG_LINE_BYTES + 10));
                Ok(Value::from("done"))
            })
    }

    #[tokio::test]
    async fn test_oversized_output_does_not_stop_the_loop() {
        let mut h = start_with(ModuleRegistry::new().with(oversized_module()));
        h.next().await;
        h.tx.send(&Envelope::import(1, "big")).await.unwrap();
        h.next().await;

        h.call(2, "big", "blob", vec![]).await;
        let reply = h.next().await;
        assert_eq!((reply.id, reply.kind), (2, MessageType::Error));
        let err: ErrorPayload = reply.payload_as().unwrap();
        assert_eq!(err.error_type, "SerializationError");
        assert!(err.message.contains("frame limit"), "{}", err.message);

        h.call(3, "big", "shout", vec![]).await;
        let log = h.next().await;
        assert_eq!((log.id, log.kind), (3, MessageType::Log));
        let line: LogPayload = log.payload_as().unwrap();
        assert!(line.text.len() < MAX_LOG_LINE_BYTES + 64);
        assert!(line.text.ends_with("[10 bytes truncated]"), "{}", &line.text[MAX_LOG_LINE_BYTES..]);
        let reply = h.next().await;
        assert_eq!((reply.id, reply.kind), (3, MessageType::Result));
        assert_eq!(reply.payload_as::<Value>().unwrap(), Value::from("done"));

        h.tx.close().await.unwrap();
        h.server.await.unwrap().unwrap();
    }

    #[test]
    fn test_truncate_text_keeps_char_boundary() {
        assert_eq!(truncate_text("short".to_string(), 16), "short");
        // 'é' is two bytes; a cut at byte 3 falls inside the second one.
        let cut = truncate_text("éééé".to_string(), 3);
        assert_eq!(cut, "é ... [6 bytes truncated]");
    }

    #[tokio::test]
    async fn test_code_module_needs_no_import() {
        let mut h = start();
        h.next().await;
        h.call(1, CODE_MODULE, CODE_ATTRIBUTE, vec!["exit 0".into()]).await;
        let reply = h.next().await;
        assert_eq!(reply.kind, MessageType::Result);
        assert_eq!(reply.payload_as::<Value>().unwrap().get("exitCode"), Some(&Value::Int(0)));
    }

    #[tokio::test]
    async fn test_malformed_call_payload_gets_error() {
        let mut h = start();
        h.next().await;
        let bogus = Envelope {
            id: 7,
            kind: MessageType::Call,
            payload: serde_json::json!({"module": 5}),
        };
        h.tx.send(&bogus).await.unwrap();
        let reply = h.next().await;
        assert_eq!((reply.id, reply.kind), (7, MessageType::Error));
        assert_eq!(reply.payload_as::<ErrorPayload>().unwrap().error_type, "ProtocolError");
    }

    #[test]
    fn test_args_parse() {
        let args = LauncherArgs::parse_from([
            "capsule-launcher",
            "--env-name",
            "demo",
            "--interpreter",
            "python3",
            "--interpreter-arg",
            "-c",
            "--startup-delay-ms",
            "250",
        ]);
        assert_eq!(args.env_name.as_deref(), Some("demo"));
        assert_eq!(args.interpreter_args, vec!["-c"]);
        assert_eq!(args.startup_delay_ms, 250);
        assert_eq!(args.log_level, "info");
    }
}
