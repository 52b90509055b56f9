// logger.rs - Context-scoped structured logging
//
// Two halves. `init_from_env` wires the global tracing subscriber from
// LOG_FORMAT / LOG_LEVEL / LOG_OUTPUT. `RpcLogger` is the per-request value
// threaded through handlers: key-value enrichment, a dot-joined name
// hierarchy, adjustable caller skip, and an optional span-event mirror.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Set by `fatal`; the server loop shuts down once flagged.
static FATAL_FLAG: AtomicBool = AtomicBool::new(false);

pub fn fatal_flagged() -> bool {
    FATAL_FLAG.load(Ordering::SeqCst)
}

/// Initialize the global subscriber from LOG_FORMAT {console, logfmt, json},
/// LOG_LEVEL {debug, info, warn, error, fatal}, LOG_OUTPUT {stderr, stdout,
/// <filepath>}.
pub fn init_from_env() -> Result<(), String> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "console".to_string());
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let output = std::env::var("LOG_OUTPUT").unwrap_or_else(|_| "stderr".to_string());

    // "fatal" is emitted as error-level events with a fatal marker field.
    let filter_level = match level.as_str() {
        "fatal" => "error",
        other => other,
    };
    let filter = EnvFilter::try_new(filter_level).map_err(|e| format!("invalid LOG_LEVEL: {}", e))?;

    macro_rules! install {
        ($writer:expr) => {
            match format.as_str() {
                "json" => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer($writer)
                    .init(),
                "logfmt" => tracing_subscriber::fmt()
                    .compact()
                    .with_ansi(false)
                    .with_env_filter(filter)
                    .with_writer($writer)
                    .init(),
                "console" => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer($writer)
                    .init(),
                other => return Err(format!("invalid LOG_FORMAT: {}", other)),
            }
        };
    }

    match output.as_str() {
        "stderr" => install!(std::io::stderr),
        "stdout" => install!(std::io::stdout),
        path => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open LOG_OUTPUT {}: {}", path, e))?;
            install!(Arc::new(file))
        }
    }
    Ok(())
}

// =============================================================================
// SPAN EVENT MIRROR
// =============================================================================

/// Sink that mirrors structured log events onto a trace span.
pub trait SpanEventRecorder: Send + Sync {
    fn record_event(
        &self,
        level: &str,
        component: &str,
        msg: &str,
        trace_id: &str,
        span_id: &str,
        kv: &[(String, String)],
    );

    /// Marks the span itself as errored.
    fn record_error(&self, msg: &str);
}

// =============================================================================
// LOGGER
// =============================================================================

#[derive(Clone)]
pub struct RpcLogger {
    name: String,
    kv: Vec<(String, String)>,
    caller_skip: usize,
    mirror: Option<Arc<dyn SpanEventRecorder>>,
    trace_id: String,
    span_id: String,
    enabled: bool,
}

impl RpcLogger {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kv: Vec::new(),
            caller_skip: 0,
            mirror: None,
            trace_id: String::new(),
            span_id: String::new(),
            enabled: true,
        }
    }

    /// Discards everything. Returned when a context carries no logger.
    pub fn noop() -> Self {
        Self {
            name: String::new(),
            kv: Vec::new(),
            caller_skip: 0,
            mirror: None,
            trace_id: String::new(),
            span_id: String::new(),
            enabled: false,
        }
    }

    pub fn with_kv(&self, key: &str, value: impl ToString) -> Self {
        let mut next = self.clone();
        next.kv.push((key.to_string(), value.to_string()));
        next
    }

    pub fn with_name(&self, name: &str) -> Self {
        let mut next = self.clone();
        if next.name.is_empty() {
            next.name = name.to_string();
        } else {
            next.name = format!("{}.{}", next.name, name);
        }
        next
    }

    pub fn add_caller_skip(&self, n: usize) -> Self {
        let mut next = self.clone();
        next.caller_skip += n;
        next
    }

    /// Attach a span mirror. Wrapping adds exactly one caller-skip level so
    /// call-site attribution stays on the caller, not the mirror shim.
    pub fn with_recorder(
        &self,
        recorder: Arc<dyn SpanEventRecorder>,
        trace_id: &str,
        span_id: &str,
    ) -> Self {
        let mut next = self.add_caller_skip(1);
        next.mirror = Some(recorder);
        next.trace_id = trace_id.to_string();
        next.span_id = span_id.to_string();
        next
    }

    pub fn all_kv(&self) -> &[(String, String)] {
        &self.kv
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caller_skip(&self) -> usize {
        self.caller_skip
    }

    fn emit(&self, level: Level, fatal: bool, msg: &str, kv: &[(&str, String)]) {
        if !self.enabled {
            return;
        }

        let mut fields = String::new();
        for (key, value) in self.kv.iter() {
            fields.push_str(&format!("{}={} ", key, value));
        }
        for (key, value) in kv {
            fields.push_str(&format!("{}={} ", key, value));
        }
        let fields = fields.trim_end();

        match level {
            Level::DEBUG => tracing::debug!(component = %self.name, fatal, kv = %fields, "{}", msg),
            Level::INFO => tracing::info!(component = %self.name, fatal, kv = %fields, "{}", msg),
            Level::WARN => tracing::warn!(component = %self.name, fatal, kv = %fields, "{}", msg),
            _ => tracing::error!(component = %self.name, fatal, kv = %fields, "{}", msg),
        }

        if let Some(mirror) = &self.mirror {
            let mut merged: Vec<(String, String)> = self.kv.clone();
            merged.extend(kv.iter().map(|(k, v)| (k.to_string(), v.clone())));
            let level_name = if fatal {
                "fatal"
            } else {
                match level {
                    Level::DEBUG => "debug",
                    Level::INFO => "info",
                    Level::WARN => "warn",
                    _ => "error",
                }
            };
            mirror.record_event(level_name, &self.name, msg, &self.trace_id, &self.span_id, &merged);
            if level == Level::ERROR {
                mirror.record_error(msg);
            }
        }
    }

    pub fn debug(&self, msg: &str, kv: &[(&str, String)]) {
        self.emit(Level::DEBUG, false, msg, kv);
    }

    pub fn info(&self, msg: &str, kv: &[(&str, String)]) {
        self.emit(Level::INFO, false, msg, kv);
    }

    pub fn warn(&self, msg: &str, kv: &[(&str, String)]) {
        self.emit(Level::WARN, false, msg, kv);
    }

    pub fn error(&self, msg: &str, kv: &[(&str, String)]) {
        self.emit(Level::ERROR, false, msg, kv);
    }

    /// Logs at error level with the fatal marker and flags the process for
    /// shutdown. The server loop drains and exits once flagged.
    pub fn fatal(&self, msg: &str, kv: &[(&str, String)]) {
        self.emit(Level::ERROR, true, msg, kv);
        FATAL_FLAG.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// REQUEST CONTEXT
// =============================================================================

/// Carrier for the per-request logger. Handlers receive one of these;
/// everything else hangs off AppState.
#[derive(Clone)]
pub struct RequestContext {
    logger: RpcLogger,
}

impl RequestContext {
    pub fn new(logger: RpcLogger) -> Self {
        Self { logger }
    }

    /// Context with no logger attached; logging becomes a no-op.
    pub fn noop() -> Self {
        Self { logger: RpcLogger::noop() }
    }

    pub fn logger(&self) -> &RpcLogger {
        &self.logger
    }
}
