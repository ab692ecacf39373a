//! Receiver source abstraction.
//!
//! A source produces a live sequence of [`TelemetrySample`]s plus structured
//! errors on one ordered event channel. A source instance backs exactly one
//! connection attempt; reconnecting means creating a fresh instance. Any
//! reconnect policy belongs to the caller, not the adapter.

use crate::model::{SourceErrorCode, TelemetrySample};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Identity under which a relay session runs; constant for the session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub tenant_id: String,
    pub device_id: String,
}

/// Error surfaced by a receiver source. Carries a structured code when the
/// failure maps to one (licensing, unsupported receiver, transport).
#[derive(Debug, Clone)]
pub struct SourceError {
    pub code: Option<SourceErrorCode>,
    pub message: String,
}

impl SourceError {
    pub fn coded(code: SourceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceEvent {
    Sample(TelemetrySample),
    Error(SourceError),
}

/// A live telemetry source.
#[async_trait]
pub trait ReceiverSource: Send {
    fn name(&self) -> &'static str;

    /// Begin producing samples asynchronously. Must not block the caller;
    /// failures surface on the event channel rather than as a return value.
    async fn connect(&mut self, ctx: SessionContext, events: mpsc::Sender<SourceEvent>);

    /// Terminate the upstream connection and clear cached state. Idempotent;
    /// safe to call even if `connect` never ran or already failed.
    async fn close(&mut self);
}
