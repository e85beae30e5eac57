//! BLE client engine for Pybricks hubs
//!
//! Turns a compiled MicroPython program into the chunked write sequence the
//! hub expects, tracks hub lifecycle and program state from notifications,
//! and reconstructs tracebacks from the streamed stdout.
//!
//! The host side (editor, CLI, whatever) plugs in through three small
//! traits: [`Diagnostics`] for logs and error reports, [`Observer`] for
//! state-change side effects, and [`ConfigStore`] for the remembered device
//! name.

mod compile;
mod connection;
mod dispatcher;
mod error;
mod host;
mod retry;
mod stdout;
mod uploader;

pub use compile::{
    build_blob, find_imports, Compiler, DirModuleSource, Module, ModuleSource, MAIN_MODULE,
    MAIN_MODULE_PATH,
};
pub use connection::{default_adapter, Connection, Status, DEFAULT_SCAN_WINDOW};
pub use error::Error;
pub use host::{ConfigStore, Diagnostics, Observer};
pub use retry::{retry, retry_with_cleanup, retry_with_final_cleanup};
pub use stdout::{extract_traceback, PythonError};
pub use uploader::{upload, upload_plan};

pub use hublink_proto::{Capabilities, Command};
