//! Command line tool for Pybricks hubs
//!
//! Scans for hubs, compiles MicroPython programs with mpy-cross, uploads
//! them over BLE and tails the hub's output.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hublink_client::{
    build_blob, default_adapter, upload, Compiler, ConfigStore, Connection, Diagnostics,
    DirModuleSource, Error, Observer, Status, DEFAULT_SCAN_WINDOW, MAIN_MODULE_PATH,
};
use hublink_proto::Command as HubCommand;

#[derive(Parser)]
#[command(name = "hublink")]
#[command(about = "Run MicroPython programs on Pybricks hubs over BLE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Pybricks hubs
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Compile a program and run it on the hub
    Run {
        /// Path to the main Python file
        file: PathBuf,
        /// Hub name to connect to (defaults to the last connected hub)
        #[arg(short = 'd', long)]
        device: Option<String>,
        /// Disconnect right after starting instead of tailing output
        #[arg(long)]
        no_wait: bool,
        /// mpy-cross executable to compile with
        #[arg(long, default_value = "mpy-cross")]
        mpy_cross: String,
    },
    /// Start the program already stored on the hub
    Start {
        /// Hub name to connect to (defaults to the last connected hub)
        #[arg(short = 'd', long)]
        device: Option<String>,
    },
    /// Stop the running program
    Stop {
        /// Hub name to connect to (defaults to the last connected hub)
        #[arg(short = 'd', long)]
        device: Option<String>,
    },
}

/// Prints hub output and error reports to the terminal
struct Terminal;

impl Diagnostics for Terminal {
    fn log(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn report_error(&self, file: &str, line: u32, message: &str) {
        // line is zero-based, editors count from 1
        eprintln!("{file}:{}: {message}", line + 1);
    }

    fn clear_errors(&self) {}
}

impl Observer for Terminal {
    fn status_changed(&self, status: Status, device: Option<&str>) {
        // the connect log line already announces Connected
        match status {
            Status::Disconnected => println!("Disconnected."),
            Status::Error => eprintln!("Bluetooth connection error ({device:?})."),
            _ => {}
        }
    }

    fn running_changed(&self, running: bool) {
        tracing::debug!("program running: {running}");
    }

    fn refresh(&self) {}
}

/// Remembers the last connected hub in a JSON file under the user config dir
struct JsonConfig {
    path: PathBuf,
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct ConfigData {
    last_connected_device: Option<String>,
}

impl JsonConfig {
    fn new() -> Self {
        let dir = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        JsonConfig { path: dir.join("hublink").join("config.json") }
    }

    fn load(&self) -> ConfigData {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save(&self, data: &ConfigData) {
        let result = self
            .path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| {
                std::fs::write(&self.path, serde_json::to_string_pretty(data).unwrap_or_default())
            });
        if let Err(e) = result {
            tracing::warn!("could not save config: {e}");
        }
    }
}

impl ConfigStore for JsonConfig {
    fn last_connected(&self) -> Option<String> {
        self.load().last_connected_device
    }

    fn set_last_connected(&self, name: &str) {
        let mut data = self.load();
        data.last_connected_device = Some(name.to_string());
        self.save(&data);
    }
}

/// Compiles modules by shelling out to mpy-cross
struct MpyCross {
    program: String,
    work_dir: PathBuf,
}

impl MpyCross {
    fn new(program: &str) -> Self {
        MpyCross {
            program: program.to_string(),
            work_dir: std::env::temp_dir().join("hublink-mpy"),
        }
    }
}

impl Compiler for MpyCross {
    fn compile(&self, path: &str, source: &str) -> Result<Vec<u8>, Error> {
        let src = self.work_dir.join(path);
        if let Some(parent) = src.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&src, source)?;
        let out = src.with_extension("mpy");

        let output = std::process::Command::new(&self.program)
            .arg("-o")
            .arg(&out)
            .arg(&src)
            .output()
            .map_err(|e| Error::Compile {
                module: path.to_string(),
                reason: format!("could not run {}: {e}", self.program),
            })?;
        if !output.status.success() {
            return Err(Error::Compile {
                module: path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(std::fs::read(&out)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(JsonConfig::new());
    let terminal = Arc::new(Terminal);
    let adapter = default_adapter().await?;
    let mut connection =
        Connection::new(adapter, terminal.clone(), terminal.clone(), config.clone());

    match cli.command {
        Commands::Scan { duration } => {
            println!("Scanning for {duration} seconds...");
            let names = connection.scan(Duration::from_secs(duration)).await?;
            if names.is_empty() {
                println!("No Pybricks hubs found.");
            } else {
                for name in names {
                    println!("  {name}");
                }
            }
        }
        Commands::Run { file, device, no_wait, mpy_cross } => {
            let blob = compile_program(&file, &mpy_cross)?;
            connect(&mut connection, device, &config).await?;
            upload(&connection, &blob).await?;
            println!("User program uploaded ({} bytes) and started.", blob.len());
            if !no_wait {
                tail_until_stopped(&connection).await;
            }
            connection.disconnect().await;
        }
        Commands::Start { device } => {
            connect(&mut connection, device, &config).await?;
            connection.write_command(&HubCommand::LegacyStartUserProgram).await?;
            connection.disconnect().await;
        }
        Commands::Stop { device } => {
            connect(&mut connection, device, &config).await?;
            connection.write_command(&HubCommand::StopUserProgram).await?;
            connection.disconnect().await;
        }
    }

    Ok(())
}

fn compile_program(file: &Path, mpy_cross: &str) -> Result<Vec<u8>, Error> {
    let source = std::fs::read_to_string(file)?;
    let folder = file.parent().unwrap_or(Path::new("."));
    tracing::debug!("compiling {} as {MAIN_MODULE_PATH}", file.display());
    build_blob(&source, &DirModuleSource::new(folder), &MpyCross::new(mpy_cross))
}

/// Scan, then connect to the named hub or the remembered one
async fn connect(
    connection: &mut Connection,
    device: Option<String>,
    config: &JsonConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = device
        .or_else(|| config.last_connected())
        .ok_or("no hub specified and none remembered; use --device after a scan")?;
    connection.scan(DEFAULT_SCAN_WINDOW).await?;
    connection.connect(&name).await?;
    Ok(())
}

/// Wait for the program to finish, streaming its output. The status report
/// notifications drive the running flag; polling it here is enough.
async fn tail_until_stopped(connection: &Connection) {
    let started = tokio::time::Instant::now();
    while !connection.is_program_running() {
        if started.elapsed() > Duration::from_secs(2) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    while connection.is_program_running() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // leave room for the final stdout flush
    tokio::time::sleep(Duration::from_millis(700)).await;
}
