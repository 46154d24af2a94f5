//! Network setup hook. A container either shares the host
//! network namespace (`NoneNetworkManager`) or gets a private namespace
//! wired up by an external helper process (`Slirp4NetnsManager`).
//! Generalized from a single hardcoded slirp4netns invocation into a
//! trait so `network: none` is a real option, reporting failures through
//! the crate's tagged `Error`.

use std::fmt::Debug;
use std::fs::File;
use std::io::Write as _;
use std::panic::RefUnwindSafe;
use std::path::PathBuf;

use crate::clone3::Pid;
use crate::error::Result;

/// An open network resource tied to a running task; torn down on drop.
pub trait NetworkHandle: Send + Sync + Debug + RefUnwindSafe {}

/// Seam for wiring up a task's network namespace once its pid is known
///.
pub trait NetworkManager: Send + Sync + Debug + RefUnwindSafe {
    fn run_network(&self, pid: Pid) -> Result<Option<Box<dyn NetworkHandle>>>;
    fn set_network(&self) -> Result<()>;
}

/// No network isolation: the task shares the host (or parent container's)
/// network namespace, the `network: none` configuration.
#[derive(Debug, Default)]
pub struct NoneNetworkManager;

impl NetworkManager for NoneNetworkManager {
    fn run_network(&self, _pid: Pid) -> Result<Option<Box<dyn NetworkHandle>>> {
        Ok(None)
    }

    fn set_network(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs `slirp4netns` against the task's pid to give it an isolated,
/// unprivileged user-mode network stack.
#[derive(Debug)]
pub struct Slirp4NetnsManager {
    pub binary: PathBuf,
}

impl Slirp4NetnsManager {
    pub fn new() -> Self {
        Self {
            binary: "/bin/slirp4netns".into(),
        }
    }
}

impl Default for Slirp4NetnsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager for Slirp4NetnsManager {
    fn run_network(&self, pid: Pid) -> Result<Option<Box<dyn NetworkHandle>>> {
        let handle = std::process::Command::new(&self.binary)
            .arg("--configure")
            .arg("--mtu=65520")
            .arg("--disable-host-loopback")
            .arg(pid.to_string())
            .arg("tap0")
            .spawn()?;
        Ok(Some(Box::new(Slirp4NetnsHandle { handle })))
    }

    fn set_network(&self) -> Result<()> {
        Ok(File::create("/etc/resolv.conf")?.write_all(b"nameserver 10.0.2.3")?)
    }
}

#[derive(Debug)]
pub struct Slirp4NetnsHandle {
    handle: std::process::Child,
}

impl NetworkHandle for Slirp4NetnsHandle {}

impl Drop for Slirp4NetnsHandle {
    fn drop(&mut self) {
        let _ = self.handle.kill();
        let _ = self.handle.wait();
    }
}
