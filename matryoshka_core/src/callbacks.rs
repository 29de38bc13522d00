//! Host application callbacks.
//!
//! The instance reports to the host through three sinks, each with no-op
//! defaults so a host only implements what it cares about. Sinks are called
//! outside of every internal lock and may call back into the instance.

use std::sync::Arc;

use crate::entity::{EntityLocation, EntityName};

/// Receives accepted remote positions and drops.
pub trait LocationSink: Send + Sync + 'static {
    fn on_location(&self, _name: &EntityName, _location: EntityLocation) {}
}

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A protocol event forwarded to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// Receives protocol log records.
pub trait LogSink: Send + Sync + 'static {
    fn on_log(&self, _record: &LogRecord) {}
}

/// Receives auxiliary info fetched once per discovered entity.
pub trait InfoSink: Send + Sync + 'static {
    fn on_render_info(&self, _name: &EntityName, _render_tag: &str) {}
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl LocationSink for NoopCallbacks {}
impl LogSink for NoopCallbacks {}
impl InfoSink for NoopCallbacks {}

/// The set of sinks handed to an instance.
#[derive(Clone)]
pub struct Callbacks {
    pub location: Arc<dyn LocationSink>,
    pub log: Arc<dyn LogSink>,
    pub info: Arc<dyn InfoSink>,
}

impl Callbacks {
    pub fn with_location(mut self, sink: Arc<dyn LocationSink>) -> Self {
        self.location = sink;
        self
    }
    
    pub fn with_log(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = sink;
        self
    }
    
    pub fn with_info(mut self, sink: Arc<dyn InfoSink>) -> Self {
        self.info = sink;
        self
    }
    
    /// Emits `message` through `tracing` and forwards it to the log sink.
    pub fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        self.log.on_log(&LogRecord { level, message });
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        let noop = Arc::new(NoopCallbacks);
        Self {
            location: noop.clone(),
            log: noop.clone(),
            info: noop,
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    
    #[derive(Default)]
    struct Recorder(Mutex<Vec<LogRecord>>);
    
    impl LogSink for Recorder {
        fn on_log(&self, record: &LogRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }
    
    #[test]
    fn test_log_forwards_to_sink() {
        let recorder = Arc::new(Recorder::default());
        let callbacks = Callbacks::default().with_log(recorder.clone());
        callbacks.log(LogLevel::Warn, "malformed frame".into());
        
        let records = recorder.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].message, "malformed frame");
    }
    
    #[test]
    fn test_noop_defaults_do_nothing() {
        let callbacks = Callbacks::default();
        let name = EntityName::new("/hub", "a").unwrap();
        callbacks.location.on_location(&name, EntityLocation::Dropped);
        callbacks.info.on_render_info(&name, "default");
        callbacks.log(LogLevel::Debug, "quiet".into());
    }
}
