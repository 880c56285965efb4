//! Subprocess management and JSON IPC for the bridge process.
//!
//! ```text
//! SessionManager
//!     └── BridgeLauncher ── spawns: [wine] excel-com-bridge.exe
//!           └── BridgeHost ── JSON lines over stdio ── COM: Excel.Application
//! ```

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use excel_com_protocol::bridge::{Command as BridgeCommand, Request, Response, ResponseResult};
use excel_com_protocol::{ObjectId, Variant};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::deadline::{run_with_deadline, Outcome};
use crate::error::{EngineError, HostFault, Result};
use crate::host::{Host, HostLauncher, LaunchRequest};

const BRIDGE_EXE: &str = "excel-com-bridge.exe";
/// How often `quit` checks whether the bridge has exited.
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Configuration for launching the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to `excel-com-bridge.exe`. If `None`, it is searched for next to
    /// the current binary and in the cross-compilation target directories.
    pub bridge_exe_path: Option<PathBuf>,

    /// WINE executable, used everywhere except Windows. Defaults to `wine`.
    pub wine_path: PathBuf,

    /// Optional WINEPREFIX for an isolated WINE environment.
    pub wine_prefix: Option<PathBuf>,

    /// How long Excel gets to start and open the workbook.
    pub startup_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_exe_path: None,
            wine_path: PathBuf::from("wine"),
            wine_prefix: None,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// Launches one bridge process per session.
#[derive(Debug, Clone, Default)]
pub struct BridgeLauncher {
    config: BridgeConfig,
}

impl BridgeLauncher {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl HostLauncher for BridgeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Arc<dyn Host>> {
        let host = BridgeHost::start(&self.config, request).map_err(|reason| {
            EngineError::HostLaunchFailed {
                file: request.file.to_string(),
                reason,
            }
        })?;
        Ok(Arc::new(host))
    }
}

struct Channel {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Channel {
    /// Send one request and wait for its response. Responses to earlier
    /// requests (left behind by abandoned calls) are skipped.
    fn call(&mut self, id: u64, command: BridgeCommand) -> std::result::Result<Option<Variant>, HostFault> {
        let operation = describe(&command);
        let request = Request { id, command };
        let json = serde_json::to_string(&request)
            .map_err(|e| HostFault::new(&operation, format!("failed to encode request: {e}")))?;

        writeln!(self.stdin, "{json}")
            .and_then(|()| self.stdin.flush())
            .map_err(|e| HostFault::new(&operation, format!("bridge stdin closed: {e}")))?;

        loop {
            let mut line = String::new();
            let read = self
                .stdout
                .read_line(&mut line)
                .map_err(|e| HostFault::new(&operation, format!("failed to read from bridge: {e}")))?;
            if read == 0 {
                return Err(HostFault::new(&operation, "bridge process exited"));
            }

            let response: Response = serde_json::from_str(&line).map_err(|e| {
                HostFault::new(&operation, format!("malformed bridge response: {e}"))
            })?;
            if response.id < id {
                debug!(stale = response.id, expected = id, "discarding stale bridge response");
                continue;
            }
            if response.id != id {
                return Err(HostFault::new(
                    &operation,
                    format!("bridge answered request {} while {id} was pending", response.id),
                ));
            }

            return match response.result {
                ResponseResult::Ok { data } => Ok(data),
                ResponseResult::Error { message, hresult } => Err(HostFault {
                    operation,
                    message,
                    hresult,
                }),
            };
        }
    }
}

fn describe(command: &BridgeCommand) -> String {
    match command {
        BridgeCommand::GetProperty { target, name, .. }
        | BridgeCommand::SetProperty { target, name, .. }
        | BridgeCommand::Invoke { target, name, .. } => {
            format!("{}({name}) on {target}", command.name())
        }
        BridgeCommand::Release { handle } => format!("Release {handle}"),
        other => other.name().to_string(),
    }
}

/// A [`Host`] backed by a bridge subprocess.
pub struct BridgeHost {
    /// Locked only for non-blocking checks and for the kill itself.
    child: Mutex<Child>,
    exited: AtomicBool,
    channel: Mutex<Channel>,
    next_id: AtomicU64,
    root: ObjectId,
    pid: u32,
    /// Where a workbook created by `Init` is saved when no path is given.
    created_path: Option<String>,
}

impl BridgeHost {
    /// Spawn the bridge and open `request.file` in it.
    fn start(config: &BridgeConfig, request: &LaunchRequest) -> std::result::Result<Self, String> {
        let exe_path = config.bridge_exe_path.clone().unwrap_or_else(find_bridge_exe);
        if !exe_path.exists() {
            return Err(format!("bridge executable not found at {}", exe_path.display()));
        }

        let mut cmd = bridge_command(config, &exe_path);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound && cfg!(not(windows)) {
                format!(
                    "WINE not found at '{}'; install WINE and ensure it is in PATH",
                    config.wine_path.display()
                )
            } else {
                format!("failed to spawn bridge process: {e}")
            }
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err("bridge stdio was not captured".to_string());
        };
        let mut channel = Channel {
            stdin,
            stdout: BufReader::new(stdout),
        };

        let file_path = host_path(request.file.path());
        let exists = request.file.path().exists();
        let init = BridgeCommand::Init {
            path: exists.then(|| file_path.clone()),
            visible: request.visible,
        };
        let outcome = run_with_deadline(format!("bridge-init-{pid}"), config.startup_timeout, move || {
            let result = channel.call(1, init);
            (channel, result)
        });

        let (channel, root) = match outcome {
            Ok(Outcome::Completed((channel, Ok(Some(Variant::Object { handle }))))) => (channel, handle),
            Ok(Outcome::Completed((_, Ok(other)))) => {
                let _ = child.kill();
                return Err(format!("bridge Init returned {other:?}, expected the workbook"));
            }
            Ok(Outcome::Completed((_, Err(fault)))) => {
                let _ = child.kill();
                return Err(fault.to_string());
            }
            Ok(Outcome::TimedOut(_)) => {
                let _ = child.kill();
                return Err(format!("Excel did not start within {:?}", config.startup_timeout));
            }
            Ok(Outcome::Panicked(msg)) => {
                let _ = child.kill();
                return Err(format!("bridge startup panicked: {msg}"));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(e.to_string());
            }
        };

        info!(pid, file = %request.file, %root, "bridge started");
        Ok(Self {
            child: Mutex::new(child),
            exited: AtomicBool::new(false),
            channel: Mutex::new(channel),
            next_id: AtomicU64::new(2),
            root,
            pid,
            created_path: (!exists).then_some(file_path),
        })
    }

    fn send(&self, command: BridgeCommand) -> std::result::Result<Option<Variant>, HostFault> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channel.lock().call(id, command)
    }

    /// True once the bridge process has exited and been reaped.
    fn reap(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return true;
        }
        let gone = !matches!(self.child.lock().try_wait(), Ok(None));
        if gone {
            self.exited.store(true, Ordering::SeqCst);
        }
        gone
    }

    fn send_value(&self, command: BridgeCommand) -> std::result::Result<Variant, HostFault> {
        Ok(self.send(command)?.unwrap_or(Variant::Null))
    }
}

impl Host for BridgeHost {
    fn root(&self) -> ObjectId {
        self.root
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn get_property(&self, target: ObjectId, name: &str, args: &[Variant]) -> std::result::Result<Variant, HostFault> {
        self.send_value(BridgeCommand::GetProperty {
            target,
            name: name.to_string(),
            args: args.to_vec(),
        })
    }

    fn set_property(&self, target: ObjectId, name: &str, value: Variant) -> std::result::Result<(), HostFault> {
        self.send(BridgeCommand::SetProperty {
            target,
            name: name.to_string(),
            value,
        })
        .map(drop)
    }

    fn invoke(&self, target: ObjectId, name: &str, args: &[Variant]) -> std::result::Result<Variant, HostFault> {
        self.send_value(BridgeCommand::Invoke {
            target,
            name: name.to_string(),
            args: args.to_vec(),
        })
    }

    fn release(&self, handle: ObjectId) -> std::result::Result<(), HostFault> {
        self.send(BridgeCommand::Release { handle }).map(drop)
    }

    fn ping(&self) -> std::result::Result<(), HostFault> {
        self.send(BridgeCommand::Ping).map(drop)
    }

    fn save(&self, path: Option<&str>) -> std::result::Result<(), HostFault> {
        let path = path
            .map(|p| host_path(Path::new(p)))
            .or_else(|| self.created_path.clone());
        self.send(BridgeCommand::Save { path }).map(drop)
    }

    fn set_visible(&self, visible: bool) -> std::result::Result<(), HostFault> {
        self.send(BridgeCommand::SetVisible { visible }).map(drop)
    }

    fn quit(&self) -> std::result::Result<(), HostFault> {
        self.send(BridgeCommand::Shutdown)?;
        // Poll rather than wait so terminate can still take the child lock.
        while !self.reap() {
            std::thread::sleep(EXIT_POLL);
        }
        Ok(())
    }

    fn terminate(&self) {
        if self.reap() {
            return;
        }
        let mut child = self.child.lock();
        if let Err(e) = child.kill() {
            warn!(pid = self.pid, error = %e, "failed to kill bridge process");
        }
        let _ = child.wait();
        self.exited.store(true, Ordering::SeqCst);
    }
}

impl Drop for BridgeHost {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(windows)]
fn bridge_command(_config: &BridgeConfig, exe_path: &Path) -> std::process::Command {
    std::process::Command::new(exe_path)
}

#[cfg(not(windows))]
fn bridge_command(config: &BridgeConfig, exe_path: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new(&config.wine_path);
    if let Some(prefix) = &config.wine_prefix {
        cmd.env("WINEPREFIX", prefix);
    }
    cmd.arg(exe_path);
    cmd
}

/// The path as the bridge process sees it.
#[cfg(windows)]
fn host_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(not(windows))]
fn host_path(path: &Path) -> String {
    linux_to_wine_path(path)
}

/// Convert a Linux filesystem path to a WINE (Windows) path.
///
/// WINE maps `/` to `Z:\`, so `/home/user/file.xlsx` becomes `Z:\home\user\file.xlsx`.
pub fn linux_to_wine_path(linux_path: &Path) -> String {
    let abs = if linux_path.is_absolute() {
        linux_path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(linux_path)
    };
    format!("Z:{}", abs.display()).replace('/', "\\")
}

fn find_bridge_exe() -> PathBuf {
    if let Ok(mut exe) = std::env::current_exe() {
        exe.pop();
        let candidate = exe.join(BRIDGE_EXE);
        if candidate.exists() {
            return candidate;
        }
    }

    ["release", "debug"]
        .iter()
        .map(|profile| PathBuf::from(format!("target/x86_64-pc-windows-gnu/{profile}/{BRIDGE_EXE}")))
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(BRIDGE_EXE))
}
