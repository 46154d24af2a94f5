//! Cgroup controller. Maps a `(subsystem, relative path)` pair to a kernel
//! cgroup directory, resolved by scanning `/proc/self/mountinfo` the way
//! `original_source/cgroup.cpp`'s `TMountState` resolves subsystem
//! mountpoints from `/proc/self/mounts`. Freezer and kill-all follow a
//! strict freeze-then-kill-then-thaw ordering so a frozen process never
//! dodges SIGKILL by forking while the signal is in flight.

use std::fs::{self, File};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{ignore_io, Error, ErrorKind as EK, Result};

const PROC_CGROUP: &str = "/proc/self/cgroup";
const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";
const CGROUP_PROCS: &str = "cgroup.procs";
const FREEZER_STATE: &str = "freezer.state";

/// Recognized cgroup subsystems.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Subsystem {
    Memory,
    Cpu,
    Cpuacct,
    Cpuset,
    Freezer,
    Blkio,
    Devices,
    NetCls,
    Pids,
    Hugetlb,
    PerfEvent,
}

impl Subsystem {
    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Memory => "memory",
            Subsystem::Cpu => "cpu",
            Subsystem::Cpuacct => "cpuacct",
            Subsystem::Cpuset => "cpuset",
            Subsystem::Freezer => "freezer",
            Subsystem::Blkio => "blkio",
            Subsystem::Devices => "devices",
            Subsystem::NetCls => "net_cls",
            Subsystem::Pids => "pids",
            Subsystem::Hugetlb => "hugetlb",
            Subsystem::PerfEvent => "perf_event",
        }
    }

    /// Resolves the kernel mountpoint for this subsystem by scanning
    /// `/proc/self/mountinfo`, falling back to the conventional
    /// `/sys/fs/cgroup/<name>` path (and to the unified `/sys/fs/cgroup`
    /// hierarchy for cgroup v2 systems, where every controller is mounted
    /// at the same point).
    pub fn resolve_mount(&self) -> Result<PathBuf> {
        let name = self.name();
        if let Some(path) = scan_mountinfo(name)? {
            return Ok(path);
        }
        let unified = PathBuf::from("/sys/fs/cgroup");
        if unified.join("cgroup.controllers").exists() {
            return Ok(unified);
        }
        Ok(PathBuf::from("/sys/fs/cgroup").join(name))
    }
}

fn scan_mountinfo(subsystem: &str) -> Result<Option<PathBuf>> {
    let data = match fs::read_to_string(PROC_MOUNTINFO) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for line in data.lines() {
        // mountinfo fields are separated by " - " into pre/post groups.
        let Some((pre, post)) = line.split_once(" - ") else {
            continue;
        };
        let pre_fields: Vec<&str> = pre.split(' ').collect();
        let post_fields: Vec<&str> = post.split(' ').collect();
        if pre_fields.len() < 5 || post_fields.len() < 3 {
            continue;
        }
        let fstype = post_fields[0];
        if fstype != "cgroup" {
            continue;
        }
        let mount_point = pre_fields[4];
        let super_opts = post_fields[2];
        if super_opts.split(',').any(|opt| opt == subsystem) {
            return Ok(Some(PathBuf::from(mount_point)));
        }
    }
    Ok(None)
}

/// A `(subsystem, path)` cgroup node. Created on demand, removed when
/// empty.
#[derive(Clone, Debug)]
pub struct Cgroup {
    subsystem: Subsystem,
    mount_path: PathBuf,
    path: PathBuf,
}

impl Cgroup {
    pub fn new(subsystem: Subsystem, name: impl AsRef<Path>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_absolute() {
            return Err(Error::new(EK::InvalidPath, "cgroup name cannot be absolute"));
        }
        let mount_path = subsystem.resolve_mount()?;
        let path = mount_path.join(name);
        Ok(Self {
            subsystem,
            mount_path,
            path,
        })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn name(&self) -> &Path {
        self.path
            .strip_prefix(&self.mount_path)
            .expect("cgroup path does not start with mount path")
    }

    /// Resolves the calling process's own cgroup for `subsystem` via
    /// `/proc/self/cgroup`.
    pub fn current(subsystem: Subsystem) -> Result<Self> {
        let data = fs::read_to_string(PROC_CGROUP)?;
        for line in data.lines() {
            let parts: Vec<&str> = line.splitn(3, ':').collect();
            if parts.len() < 3 {
                continue;
            }
            let controllers = parts[1];
            let matches = if controllers.is_empty() {
                // cgroup v2 unified hierarchy.
                true
            } else {
                controllers.split(',').any(|c| c == subsystem.name())
            };
            if matches {
                let rel = parts[2].trim_start_matches('/');
                return Cgroup::new(subsystem, rel);
            }
        }
        Err(Error::not_found("cannot resolve current cgroup"))
    }

    pub fn parent(&self) -> Option<Self> {
        let path = self.path.parent()?;
        if path.starts_with(&self.mount_path) && path != self.mount_path {
            Some(Self {
                subsystem: self.subsystem,
                mount_path: self.mount_path.clone(),
                path: path.to_owned(),
            })
        } else {
            None
        }
    }

    pub fn child(&self, name: impl AsRef<Path>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_absolute() {
            return Err(Error::new(EK::InvalidPath, "child cgroup name cannot be absolute"));
        }
        Ok(Self {
            subsystem: self.subsystem,
            mount_path: self.mount_path.clone(),
            path: self.path.join(name),
        })
    }

    /// `Ensure(path)`: recursive mkdir with subsystem-specific defaults.
    pub fn ensure(&self) -> Result<()> {
        ignore_io(fs::create_dir_all(&self.path), std::io::ErrorKind::AlreadyExists)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        fs::remove_dir(&self.path)?;
        Ok(())
    }

    /// `Attach(path, pid)`: writes `pid` into `cgroup.procs`.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        File::options()
            .write(true)
            .open(self.path.join(CGROUP_PROCS))?
            .write_all(pid.to_string().as_bytes())?;
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<String> {
        Ok(fs::read_to_string(self.path.join(key))?.trim_end().to_owned())
    }

    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        File::options()
            .write(true)
            .open(self.path.join(key))?
            .write_all(value.as_bytes())?;
        Ok(())
    }

    pub fn procs(&self) -> Result<Vec<Pid>> {
        let data = self.read(CGROUP_PROCS)?;
        let mut pids = Vec::new();
        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            pids.push(Pid::from_raw(line.parse()?));
        }
        Ok(pids)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.procs()?.is_empty())
    }

    pub fn open(&self) -> Result<File> {
        Ok(File::options()
            .read(true)
            .custom_flags(nix::libc::O_PATH | nix::libc::O_DIRECTORY)
            .open(&self.path)?)
    }

    /// Writes `FROZEN` to `freezer.state` and polls for the transition
    ///. Returns `Busy` and leaves the cgroup in the
    /// observed state if the transition stalls past `timeout`.
    pub fn freeze(&self, timeout: Duration) -> Result<()> {
        self.write(FREEZER_STATE, "FROZEN")?;
        self.wait_state("FROZEN", timeout)
    }

    pub fn thaw(&self, timeout: Duration) -> Result<()> {
        self.write(FREEZER_STATE, "THAWED")?;
        self.wait_state("THAWED", timeout)
    }

    fn wait_state(&self, want: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.read(FREEZER_STATE)?;
            if state == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::busy(format!(
                    "freezer transition to {want} did not complete in time"
                )));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Kill-all: freeze this cgroup, enumerate `cgroup.procs`, SIGKILL
    /// every pid, thaw, wait for the cgroup to drain.
    /// Freezing before SIGKILL prevents fork races during signal delivery.
    /// Assumes `self` is (or has freezer co-mounted with, as on cgroup v2
    /// unified hierarchies) the freezer subsystem for the container's
    /// cgroup path.
    pub fn kill_all(&self, freeze_timeout: Duration, drain_timeout: Duration) -> Result<()> {
        self.freeze(freeze_timeout)?;
        let pids = self.procs()?;
        for pid in &pids {
            let _ = kill(*pid, Signal::SIGKILL);
        }
        self.thaw(freeze_timeout)?;
        let deadline = Instant::now() + drain_timeout;
        loop {
            if self.is_empty()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::busy("cgroup did not drain after kill-all"));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_rejects_absolute_name() {
        let cgroup = Cgroup {
            subsystem: Subsystem::Freezer,
            mount_path: PathBuf::from("/sys/fs/cgroup/freezer"),
            path: PathBuf::from("/sys/fs/cgroup/freezer/demo"),
        };
        assert!(cgroup.child("/abs").is_err());
    }

    #[test]
    fn name_strips_mount_prefix() {
        let cgroup = Cgroup {
            subsystem: Subsystem::Freezer,
            mount_path: PathBuf::from("/sys/fs/cgroup/freezer"),
            path: PathBuf::from("/sys/fs/cgroup/freezer/demo/child"),
        };
        assert_eq!(cgroup.name(), Path::new("demo/child"));
    }

    #[test]
    fn parent_stops_at_mount_root() {
        let cgroup = Cgroup {
            subsystem: Subsystem::Freezer,
            mount_path: PathBuf::from("/sys/fs/cgroup/freezer"),
            path: PathBuf::from("/sys/fs/cgroup/freezer"),
        };
        assert!(cgroup.parent().is_none());
    }
}
