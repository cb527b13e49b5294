//! Launching the process (or thread) that hosts the bridged plugins.

use crate::server::{PluginLoader, PluginServer};
use parking_lot::Mutex;
use plugbridge_core::BridgeConfig;
use plugbridge_plugin::PluginError;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Name of the host executable for the native architecture
pub const HOST_EXECUTABLE: &str = "plugin-host";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// CPU architecture a bridge runs plugins for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuArch {
    Amd64,
    I386,
    Aarch64,
    Arm,
    Ppc64,
    Ppc,
    Unknown,
}

impl CpuArch {
    /// Architecture of the running process
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::Amd64
        } else if cfg!(target_arch = "x86") {
            Self::I386
        } else if cfg!(target_arch = "aarch64") {
            Self::Aarch64
        } else if cfg!(target_arch = "arm") {
            Self::Arm
        } else if cfg!(target_arch = "powerpc64") {
            Self::Ppc64
        } else if cfg!(target_arch = "powerpc") {
            Self::Ppc
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::I386 => "i386",
            Self::Aarch64 => "aarch64",
            Self::Arm => "arm",
            Self::Ppc64 => "ppc64",
            Self::Ppc => "ppc",
            Self::Unknown => "unknown",
        }
    }

    /// Executable name of the host app for this architecture
    pub fn host_executable(self) -> String {
        if self == Self::host() {
            HOST_EXECUTABLE.to_string()
        } else {
            format!("{HOST_EXECUTABLE}-{self}")
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Self::Amd64),
            "i386" | "x86" => Ok(Self::I386),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            "arm" => Ok(Self::Arm),
            "ppc64" => Ok(Self::Ppc64),
            "ppc" => Ok(Self::Ppc),
            _ => Err(format!("Unknown CPU architecture '{s}'")),
        }
    }
}

/// The running host, either a child process or an in-process thread
pub enum ProcessHandle {
    Child(Child),
    Thread(Option<JoinHandle<()>>),
}

impl ProcessHandle {
    /// OS process id, if this is a child process
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Child(child) => Some(child.id()),
            Self::Thread(_) => None,
        }
    }

    /// Non-blocking liveness check
    pub fn check_if_running(&mut self) -> bool {
        match self {
            Self::Child(child) => matches!(child.try_wait(), Ok(None)),
            Self::Thread(handle) => handle.as_ref().is_some_and(|h| !h.is_finished()),
        }
    }

    /// Wait for the host to exit, killing a child that takes longer than
    /// `timeout`. Returns the exit code if there is one.
    pub fn wait(&mut self, timeout: Duration) -> Option<i32> {
        match self {
            Self::Child(child) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => return status.code(),
                        Ok(None) if Instant::now() < deadline => {
                            std::thread::sleep(WAIT_POLL_INTERVAL);
                        }
                        Ok(None) => {
                            tracing::warn!("Host process {} didn't quit, killing it", child.id());
                            let _ = child.kill();
                            return child.wait().ok().and_then(|s| s.code());
                        }
                        Err(e) => {
                            tracing::error!("Couldn't wait for host process: {}", e);
                            return None;
                        }
                    }
                }
            }
            Self::Thread(handle) => {
                let handle = handle.take()?;
                if handle.join().is_err() {
                    tracing::error!("Plugin server thread panicked");
                    return None;
                }
                Some(0)
            }
        }
    }

    /// Kill a child process. Threads can't be terminated.
    pub fn terminate(&mut self) -> bool {
        match self {
            Self::Child(child) => child.kill().is_ok(),
            Self::Thread(_) => false,
        }
    }
}

/// Something that can host the server side of a bridge
pub trait HostApp: Send + Sync {
    fn arch(&self) -> CpuArch;

    /// Start hosting the bridge whose shared memory is at `shm_path`.
    /// Log records go to `log_fd`.
    fn bridge(&self, shm_path: &str, log_fd: &OwnedFd) -> Result<ProcessHandle, PluginError>;
}

/// Runs the `plugin-host` executable
#[derive(Debug, Clone)]
pub struct ProcessHostApp {
    arch: CpuArch,
    path: PathBuf,
}

impl ProcessHostApp {
    pub fn new(arch: CpuArch, path: impl Into<PathBuf>) -> Self {
        Self {
            arch,
            path: path.into(),
        }
    }

    /// Find the host executable for `arch`.
    ///
    /// Looks at `BridgeConfig::host_path` (native architecture only), then
    /// next to the current executable and one directory up.
    pub fn locate(arch: CpuArch) -> Option<Self> {
        if arch == CpuArch::host() {
            if let Some(path) = &BridgeConfig::global().host_path {
                return Some(Self::new(arch, path));
            }
        }

        let exe = std::env::current_exe().ok()?;
        let name = arch.host_executable();
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&name))
            .find(|path| path.is_file())
            .map(|path| Self::new(arch, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HostApp for ProcessHostApp {
    fn arch(&self) -> CpuArch {
        self.arch
    }

    #[allow(unsafe_code)]
    fn bridge(&self, shm_path: &str, log_fd: &OwnedFd) -> Result<ProcessHandle, PluginError> {
        let raw_fd = log_fd.as_raw_fd();

        let mut command = Command::new(&self.path);
        command
            .arg("bridge")
            .arg(shm_path)
            .arg("--log-fd")
            .arg(raw_fd.to_string())
            .arg("--parent")
            .arg(std::process::id().to_string())
            .stdin(Stdio::null());

        // SAFETY: fcntl is async-signal-safe
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(raw_fd, libc::F_SETFD, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            PluginError::InitializationFailed(format!(
                "Failed to spawn {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            "Started host process {} ({}) for {}",
            child.id(),
            self.path.display(),
            shm_path
        );

        Ok(ProcessHandle::Child(child))
    }
}

/// Runs the plugin server on a thread of the current process.
///
/// No isolation, but handy for debugging and tests.
pub struct ThreadHostApp {
    loader: Arc<dyn PluginLoader>,
}

impl ThreadHostApp {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self { loader }
    }
}

impl HostApp for ThreadHostApp {
    fn arch(&self) -> CpuArch {
        CpuArch::host()
    }

    fn bridge(&self, shm_path: &str, _log_fd: &OwnedFd) -> Result<ProcessHandle, PluginError> {
        let server = PluginServer::connect(shm_path, None, Arc::clone(&self.loader))?;
        let handle = std::thread::Builder::new()
            .name("plugin-server".to_string())
            .spawn(move || server.run())
            .map_err(|e| {
                PluginError::InitializationFailed(format!("Failed to spawn server thread: {e}"))
            })?;
        Ok(ProcessHandle::Thread(Some(handle)))
    }
}

static HOST_APPS: LazyLock<Mutex<HashMap<CpuArch, Arc<dyn HostApp>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Use `app` for all bridges created for its architecture from now on
pub fn register_host_app(app: Arc<dyn HostApp>) {
    HOST_APPS.lock().insert(app.arch(), app);
}

/// The host app for `arch`, locating the executable on first use
pub fn host_app(arch: CpuArch) -> Result<Arc<dyn HostApp>, PluginError> {
    let mut apps = HOST_APPS.lock();
    if let Some(app) = apps.get(&arch) {
        return Ok(Arc::clone(app));
    }
    let app: Arc<dyn HostApp> = Arc::new(ProcessHostApp::locate(arch).ok_or_else(|| {
        PluginError::SystemError(format!(
            "Can't find {} for {} plugins",
            arch.host_executable(),
            arch
        ))
    })?);
    apps.insert(arch, Arc::clone(&app));
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_names() {
        for arch in [
            CpuArch::Amd64,
            CpuArch::I386,
            CpuArch::Aarch64,
            CpuArch::Arm,
            CpuArch::Ppc64,
            CpuArch::Ppc,
        ] {
            assert_eq!(arch.to_string().parse::<CpuArch>(), Ok(arch));
        }
        assert!("sparc".parse::<CpuArch>().is_err());
    }

    #[test]
    fn test_host_executable() {
        assert_eq!(CpuArch::host().host_executable(), "plugin-host");
        let foreign = if CpuArch::host() == CpuArch::I386 {
            CpuArch::Amd64
        } else {
            CpuArch::I386
        };
        assert!(foreign.host_executable().starts_with("plugin-host-"));
    }

    #[test]
    fn test_child_process_handle() {
        let child = Command::new("sleep").arg("10").spawn().unwrap();
        let mut handle = ProcessHandle::Child(child);
        assert!(handle.id().is_some());
        assert!(handle.check_if_running());

        assert!(handle.terminate());
        assert_eq!(handle.wait(Duration::from_secs(5)), None);
        assert!(!handle.check_if_running());
    }

    #[test]
    fn test_thread_handle() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let thread = std::thread::spawn(move || {
            let _ = rx.recv();
        });
        let mut handle = ProcessHandle::Thread(Some(thread));
        assert!(handle.check_if_running());
        assert!(!handle.terminate());
        drop(tx);
        assert_eq!(handle.wait(Duration::from_secs(5)), Some(0));
        assert!(!handle.check_if_running());
    }
}
