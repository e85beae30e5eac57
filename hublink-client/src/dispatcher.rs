//! Demultiplexes notification frames from the control characteristic:
//! status reports drive the program-running flag, stdout frames feed the
//! debounced traceback scanner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::platform::Peripheral;
use hublink_proto::{Capabilities, Event, FLAG_USER_PROGRAM_RUNNING};

use crate::connection::Status;
use crate::host::{Diagnostics, Observer};
use crate::stdout::{extract_traceback, StdoutAccumulator};

/// How long stdout must stay quiet before the buffer is scanned. Tracebacks
/// arrive split across frames; scanning too early sees half of one.
const STDOUT_QUIESCENCE: Duration = Duration::from_millis(500);

/// State shared between the [`Connection`](crate::Connection) and the
/// notification task. Characteristic handles are non-null exactly while the
/// status is `Connected`.
#[derive(Default)]
pub(crate) struct Shared {
    pub status: Status,
    pub device: Option<Peripheral>,
    pub device_name: Option<String>,
    pub control_char: Option<btleplug::api::Characteristic>,
    pub capabilities_char: Option<btleplug::api::Characteristic>,
    pub capabilities: Option<Capabilities>,
    pub is_program_running: bool,
    pub stdout: StdoutAccumulator,
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    shared: Arc<Mutex<Shared>>,
    diagnostics: Arc<dyn Diagnostics>,
    observer: Arc<dyn Observer>,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<Mutex<Shared>>,
        diagnostics: Arc<dyn Diagnostics>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Dispatcher { shared, diagnostics, observer }
    }

    /// Handle one raw frame. Undecodable frames are logged and dropped;
    /// they never change state.
    pub(crate) fn handle_frame(&self, data: &[u8]) {
        match Event::decode(data) {
            Ok(Event::StatusReport { flags }) => self.handle_status_report(flags),
            Ok(Event::WriteStdout(payload)) => self.handle_stdout(&payload),
            Err(e) => {
                tracing::warn!("ignoring notification: {e}");
                self.diagnostics.log(&format!("[hublink] ignoring notification: {e}\n"));
            }
        }
    }

    /// Status reports are a natural flush boundary: buffered stdout reaches
    /// the sink before the status itself is processed.
    fn handle_status_report(&self, flags: u32) {
        self.flush_stdout();

        let running = flags & FLAG_USER_PROGRAM_RUNNING != 0;
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            let changed = shared.is_program_running != running;
            shared.is_program_running = running;
            changed
        };
        if changed {
            self.observer.running_changed(running);
            self.observer.refresh();
        }
    }

    fn handle_stdout(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        // unbuffered copy for live tailing
        self.diagnostics.log(&text);

        let generation = self.shared.lock().unwrap().stdout.append(&text);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STDOUT_QUIESCENCE).await;
            let current = this.shared.lock().unwrap().stdout.is_current(generation);
            if current {
                this.flush_stdout();
            }
        });
    }

    /// Take the buffered text and scan it once for a traceback. The buffer
    /// is cleared whether or not one is found.
    pub(crate) fn flush_stdout(&self) {
        let text = self.shared.lock().unwrap().stdout.take();
        if text.is_empty() {
            return;
        }
        if let Some(error) = extract_traceback(&text) {
            self.diagnostics.report_error(&error.file, error.line, &error.message);
        }
    }

    /// The notification stream ended. An unexpected drop while connected
    /// becomes a clean transition back to `Disconnected`.
    pub(crate) fn on_link_closed(&self) {
        let name = {
            let mut shared = self.shared.lock().unwrap();
            if shared.status != Status::Connected {
                return;
            }
            shared.device = None;
            shared.control_char = None;
            shared.capabilities_char = None;
            shared.capabilities = None;
            shared.device_name.take()
        };
        tracing::debug!("link to {:?} dropped", name);
        self.diagnostics.clear_errors();
        self.set_status(Status::Disconnected);
    }

    /// Transition the lifecycle status and publish the side effects. An
    /// unchanged status publishes nothing.
    pub(crate) fn set_status(&self, status: Status) {
        let name = {
            let mut shared = self.shared.lock().unwrap();
            if shared.status == status {
                return;
            }
            shared.status = status;
            shared.device_name.clone()
        };
        tracing::debug!("connection status: {status:?}");
        self.observer.status_changed(status, name.as_deref());
        self.observer.refresh();
    }
}
