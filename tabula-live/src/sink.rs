//! Observability sink for transport errors on live subscriptions.

use tabula_core::{metrics, RecordId};

use crate::transport::TransportError;

/// Receives transport errors that were recovered locally.
pub trait ErrorSink: Send + Sync {
    fn report(&self, record_id: &RecordId, error: &TransportError);
}

/// Logs at error level and counts into `tabula_live_transport_errors_total`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, record_id: &RecordId, error: &TransportError) {
        tracing::error!(record_id = %record_id, error = %error, "Live subscription transport error");
        if let Some(m) = metrics() {
            m.live_transport_errors_total.inc();
        }
    }
}
