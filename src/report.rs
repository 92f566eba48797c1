use crate::control::ControlTransport;
use crate::protocol::{subjects, ClientRole, ErrorReport, SessionId};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Who a diagnostic report is about.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub token: String,
    pub role: ClientRole,
    pub session_id: Option<SessionId>,
}

/// Best-effort diagnostic publisher. Reports are handed to a dedicated
/// drain thread through a channel so reporting latency or publish failure
/// never touches the data path; failures are swallowed.
pub struct ErrorReporter {
    sender: Mutex<Option<mpsc::Sender<ErrorReport>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    identity: ClientIdentity,
}

impl ErrorReporter {
    pub fn spawn(transport: Arc<dyn ControlTransport>, identity: ClientIdentity) -> Self {
        let (sender, receiver) = mpsc::channel::<ErrorReport>();

        let worker = thread::spawn(move || {
            for report in receiver {
                if let Ok(payload) = serde_json::to_vec(&report) {
                    let _ = transport.publish(subjects::CLIENT_ERRORS, &payload);
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            identity,
        }
    }

    /// Queue a diagnostic. No-op after close or if the drain thread died.
    pub fn report(&self, message: impl Into<String>) {
        let report = ErrorReport {
            message: message.into(),
            token: self.identity.token.clone(),
            role: self.identity.role,
            session_id: self.identity.session_id,
            timestamp_ms: now_millis(),
        };

        if let Ok(sender) = self.sender.lock() {
            if let Some(sender) = sender.as_ref() {
                let _ = sender.send(report);
            }
        }
    }

    /// Drain outstanding reports and stop the worker. Idempotent.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for ErrorReporter {
    fn drop(&mut self) {
        self.close();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
