use crate::connection::Status;

/// Sink for hub output and Python error reports.
pub trait Diagnostics: Send + Sync + 'static {
    /// Raw hub stdout, forwarded as it arrives (may be partial lines)
    fn log(&self, text: &str);

    /// A traceback was extracted from the hub's output. `line` is
    /// zero-based.
    fn report_error(&self, file: &str, line: u32, message: &str);

    /// Drop all previously reported errors
    fn clear_errors(&self);
}

/// Side effects published on every state change: status display, the
/// "program running" flag, and a catch-all refresh signal.
pub trait Observer: Send + Sync + 'static {
    fn status_changed(&self, status: Status, device: Option<&str>);
    fn running_changed(&self, running: bool);
    fn refresh(&self);
}

/// Persists the last successfully connected device name.
pub trait ConfigStore: Send + Sync + 'static {
    fn last_connected(&self) -> Option<String>;
    fn set_last_connected(&self, name: &str);
}
