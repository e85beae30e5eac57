/// Everything that can go wrong between the host and the hub. Malformed
/// notifications and unparseable tracebacks are deliberately absent: those
/// are logged and dropped, never surfaced.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("device {0} not found; run a scan first")]
    DeviceNotFound(String),

    /// Connect, discovery or subscription failed after all retry attempts
    #[error("failed to connect to {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0} characteristic not found on the hub")]
    CharacteristicMissing(&'static str),

    #[error("no device connected")]
    NotConnected,

    #[error("hub capabilities unavailable; cannot upload")]
    CapabilitiesUnavailable,

    /// The advertised maximum write size leaves no room for chunk payload
    /// after the write header
    #[error("hub max write size ({0} bytes) too small to carry program data")]
    WriteSizeTooSmall(u16),

    #[error("user program size ({size} bytes) exceeds maximum allowed size ({max} bytes)")]
    ProgramTooLarge { size: usize, max: u32 },

    /// A write during the upload sequence was rejected. The hub may be left
    /// with a cleared but incomplete program; retry the whole upload.
    #[error("program transfer failed: {0}")]
    Transfer(#[source] btleplug::Error),

    #[error("failed to compile {module}: {reason}")]
    Compile { module: String, reason: String },

    #[error(transparent)]
    Ble(#[from] btleplug::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
