//! Connection lifecycle for one Pybricks hub: scan, connect, subscribe,
//! read capabilities, write commands, disconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use uuid::Uuid;

use hublink_proto::{
    Capabilities, Command, PYBRICKS_CONTROL_EVENT_UUID, PYBRICKS_HUB_CAPABILITIES_UUID,
    PYBRICKS_SERVICE_UUID,
};

use crate::dispatcher::{Dispatcher, Shared};
use crate::error::Error;
use crate::host::{ConfigStore, Diagnostics, Observer};
use crate::retry::{retry, retry_with_final_cleanup, DEFAULT_ATTEMPTS, DEFAULT_DELAY};

/// Default scan window. Scanning runs for the whole window and then stops;
/// there is no open-ended background scan.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// Connection lifecycle. `Error` is not terminal: like `Disconnected`, it
/// allows a fresh connect attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl Status {
    /// A new connect attempt is only legal from the ground states.
    pub fn allows_connect(self) -> bool {
        matches!(self, Status::Disconnected | Status::Error)
    }
}

/// Parse a UUID string constant from hublink-proto
fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("invalid UUID in hublink_proto")
}

/// Get the default Bluetooth adapter
pub async fn default_adapter() -> Result<Adapter, Error> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// One hub connection. Owns the transport handles and the notification
/// task; all shared mutable state lives behind one mutex so the task can
/// observe an unexpected drop.
pub struct Connection {
    adapter: Adapter,
    discovered: HashMap<String, Peripheral>,
    is_scanning: bool,
    shared: Arc<Mutex<Shared>>,
    dispatcher: Dispatcher,
    diagnostics: Arc<dyn Diagnostics>,
    observer: Arc<dyn Observer>,
    config: Arc<dyn ConfigStore>,
    notify_task: Option<tokio::task::JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        adapter: Adapter,
        diagnostics: Arc<dyn Diagnostics>,
        observer: Arc<dyn Observer>,
        config: Arc<dyn ConfigStore>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let dispatcher = Dispatcher::new(shared.clone(), diagnostics.clone(), observer.clone());
        Connection {
            adapter,
            discovered: HashMap::new(),
            is_scanning: false,
            shared,
            dispatcher,
            diagnostics,
            observer,
            config,
            notify_task: None,
        }
    }

    pub fn status(&self) -> Status {
        self.shared.lock().unwrap().status
    }

    /// Advertised name of the connected hub, if any
    pub fn device_name(&self) -> Option<String> {
        self.shared.lock().unwrap().device_name.clone()
    }

    pub fn is_program_running(&self) -> bool {
        self.shared.lock().unwrap().is_program_running
    }

    pub fn is_scanning(&self) -> bool {
        self.is_scanning
    }

    /// Capability record read at connect time, if the read succeeded
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.shared.lock().unwrap().capabilities
    }

    /// Names of hubs seen during the last scan
    pub fn discovered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.discovered.keys().cloned().collect();
        names.sort();
        names
    }

    /// Scan for hubs advertising the Pybricks service for one fixed window,
    /// replacing the discovered set. Retried with a stop-scan cleanup after
    /// every failure, including the last, since a half-open scan blocks the
    /// next attempt.
    pub async fn scan(&mut self, window: Duration) -> Result<Vec<String>, Error> {
        self.discovered.clear();
        self.is_scanning = true;
        let adapter = &self.adapter;
        let result = retry_with_final_cleanup(
            DEFAULT_ATTEMPTS,
            DEFAULT_DELAY,
            || scan_window(adapter, window),
            || stop_scan_quietly(adapter),
        )
        .await;
        self.is_scanning = false;

        self.discovered = result?;
        Ok(self.discovered_names())
    }

    /// Connect to a previously discovered hub by advertised name. A no-op
    /// when already connecting or connected.
    pub async fn connect(&mut self, name: &str) -> Result<(), Error> {
        if !self.status().allows_connect() {
            return Ok(());
        }
        let peripheral = self
            .discovered
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))?;

        self.dispatcher.set_status(Status::Connecting);
        match self.connect_inner(name, peripheral.clone()).await {
            Ok(()) => {
                self.dispatcher.set_status(Status::Connected);
                self.diagnostics.log(&format!("Connected to {name}\n"));
                self.config.set_last_connected(name);
                Ok(())
            }
            Err(source) => {
                self.teardown().await;
                let _ = peripheral.disconnect().await;
                self.dispatcher.set_status(Status::Error);
                Err(Error::Connect { name: name.to_string(), source: Box::new(source) })
            }
        }
    }

    async fn connect_inner(&mut self, name: &str, peripheral: Peripheral) -> Result<(), Error> {
        let transport = peripheral.clone();
        retry(DEFAULT_ATTEMPTS, DEFAULT_DELAY, move || {
            let transport = transport.clone();
            async move {
                transport.connect().await?;
                transport.discover_services().await?;
                Ok::<_, Error>(())
            }
        })
        .await?;

        let control_uuid = parse_uuid(PYBRICKS_CONTROL_EVENT_UUID);
        let capabilities_uuid = parse_uuid(PYBRICKS_HUB_CAPABILITIES_UUID);
        let characteristics = peripheral.characteristics();
        let control = characteristics
            .iter()
            .find(|c| c.uuid == control_uuid)
            .cloned()
            .ok_or(Error::CharacteristicMissing("control/event"))?;
        let capabilities_char = characteristics
            .iter()
            .find(|c| c.uuid == capabilities_uuid)
            .cloned()
            .ok_or(Error::CharacteristicMissing("hub capabilities"))?;

        // Bind the handler before subscribing so no frame is dropped.
        let mut notifications = peripheral.notifications().await?;
        let dispatcher = self.dispatcher.clone();
        self.notify_task = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == control_uuid {
                    dispatcher.handle_frame(&notification.value);
                }
            }
            dispatcher.on_link_closed();
        }));

        peripheral.subscribe(&control).await?;

        {
            let mut shared = self.shared.lock().unwrap();
            shared.device = Some(peripheral);
            shared.device_name = Some(name.to_string());
            shared.control_char = Some(control);
            shared.capabilities_char = Some(capabilities_char);
        }

        // Read capabilities exactly once, right after subscribing. A failed
        // or short read leaves them unavailable; upload rejects later.
        self.read_capabilities().await;
        Ok(())
    }

    /// Read and cache the hub's capability record. Fails closed to `None`
    /// when the characteristic is not bound (i.e. not connected) or the
    /// record is unreadable.
    pub async fn read_capabilities(&self) -> Option<Capabilities> {
        let (device, characteristic) = {
            let shared = self.shared.lock().unwrap();
            (shared.device.clone(), shared.capabilities_char.clone())
        };
        let (Some(device), Some(characteristic)) = (device, characteristic) else {
            return None;
        };
        let capabilities = match device.read(&characteristic).await {
            Ok(data) => match Capabilities::from_bytes(&data) {
                Ok(caps) => Some(caps),
                Err(e) => {
                    tracing::warn!("unreadable capability record: {e}");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("capability read failed: {e}");
                None
            }
        };
        self.shared.lock().unwrap().capabilities = capabilities;
        capabilities
    }

    /// Disconnect and tear down. Errors during disconnect move the status
    /// to `Error` but are not returned; teardown always runs, so no
    /// listener is left dangling.
    pub async fn disconnect(&mut self) {
        let device = self.shared.lock().unwrap().device.clone();
        let Some(device) = device else { return };
        if !device.is_connected().await.unwrap_or(false) {
            return;
        }

        self.dispatcher.set_status(Status::Disconnecting);
        let result = device.disconnect().await;
        self.teardown().await;
        match result {
            Ok(()) => self.dispatcher.set_status(Status::Disconnected),
            Err(e) => {
                tracing::warn!("disconnect failed: {e}");
                self.dispatcher.set_status(Status::Error);
            }
        }
    }

    /// Release everything acquired by connect, in acquisition order:
    /// notification task, subscription, characteristic handles, running
    /// flag visibility.
    async fn teardown(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        let (device, control) = {
            let shared = self.shared.lock().unwrap();
            (shared.device.clone(), shared.control_char.clone())
        };
        if let (Some(device), Some(control)) = (device, control) {
            // best effort; the transport may already be gone
            let _ = device.unsubscribe(&control).await;
        }
        let was_running = {
            let mut shared = self.shared.lock().unwrap();
            shared.device = None;
            shared.device_name = None;
            shared.control_char = None;
            shared.capabilities_char = None;
            shared.capabilities = None;
            std::mem::take(&mut shared.is_program_running)
        };
        if was_running {
            self.observer.running_changed(false);
        }
    }

    /// Write to the control characteristic. A no-op when no characteristic
    /// is bound, which can only happen while not connected; an in-flight
    /// write on a dropped link surfaces as an error.
    pub async fn write(&self, data: &[u8], without_response: bool) -> Result<(), Error> {
        let (device, control) = {
            let shared = self.shared.lock().unwrap();
            (shared.device.clone(), shared.control_char.clone())
        };
        let (Some(device), Some(control)) = (device, control) else {
            return Ok(());
        };
        let write_type = if without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        device.write(&control, data, write_type).await?;
        Ok(())
    }

    pub async fn write_command(&self, command: &Command) -> Result<(), Error> {
        self.write(&command.encode(), false).await
    }

    pub(crate) fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.diagnostics
    }
}

/// Release a half-open scan before the next retry attempt
async fn stop_scan_quietly(adapter: &Adapter) {
    let _ = adapter.stop_scan().await;
}

async fn scan_window(
    adapter: &Adapter,
    window: Duration,
) -> Result<HashMap<String, Peripheral>, Error> {
    let service = parse_uuid(PYBRICKS_SERVICE_UUID);
    adapter.start_scan(ScanFilter { services: vec![service] }).await?;
    tokio::time::sleep(window).await;

    let mut found = HashMap::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            if !props.services.contains(&service) {
                continue;
            }
            if let Some(name) = props.local_name {
                found.insert(name, peripheral);
            }
        }
    }
    adapter.stop_scan().await?;
    Ok(found)
}
