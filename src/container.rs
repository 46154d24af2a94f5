//! Container: the named lifecycle entity — state machine, rootfs, cgroup,
//! mounts, properties/data namespace. The
//! `Container`/`ContainerOptions` builder shape is generalized from a
//! single anonymous container into a named node inside
//! `holder::Holder`'s hierarchy; the state machine's transition table
//! follows `original_source/container.cpp`.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::create_dir;
use std::io::ErrorKind as IoErrorKind;
use std::panic::RefUnwindSafe;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::cgroup::Cgroup;
use crate::error::{ignore_io, Error, ErrorKind as EK, Result};
use crate::network::NetworkManager;
use crate::task::Task;
use crate::user::UserMapper;

/// One filesystem layer prepared inside the container's mount namespace
/// before `pivot_root`.
pub trait Mount: Send + Sync + Debug + RefUnwindSafe {
    fn mount(&self, rootfs: &Path) -> Result<()>;
}

/// Mounts an overlayfs of `lowerdir` (read-only layers, bottom to top)
/// with `upperdir`/`workdir` as the writable layer, directly onto
/// `rootfs`.
#[derive(Debug, Clone)]
pub struct OverlayMount {
    pub lowerdir: Vec<PathBuf>,
    pub upperdir: PathBuf,
    pub workdir: PathBuf,
}

impl OverlayMount {
    pub fn new(lowerdir: Vec<PathBuf>, upperdir: PathBuf, workdir: PathBuf) -> Self {
        Self {
            lowerdir,
            upperdir,
            workdir,
        }
    }
}

impl Mount for OverlayMount {
    fn mount(&self, rootfs: &Path) -> Result<()> {
        let lowerdir: Option<Vec<_>> = self.lowerdir.iter().map(|v| v.as_os_str().to_str()).collect();
        let lowerdir = lowerdir
            .ok_or_else(|| Error::new(EK::InvalidPath, format!("invalid overlay lowerdir: {:?}", self.lowerdir)))?
            .join(":");
        let upperdir = self
            .upperdir
            .as_os_str()
            .to_str()
            .ok_or_else(|| Error::new(EK::InvalidPath, format!("invalid overlay upperdir: {:?}", self.upperdir)))?;
        let workdir = self
            .workdir
            .as_os_str()
            .to_str()
            .ok_or_else(|| Error::new(EK::InvalidPath, format!("invalid overlay workdir: {:?}", self.workdir)))?;
        let data = format!("lowerdir={lowerdir},upperdir={upperdir},workdir={workdir}");
        mount("overlay".into(), rootfs, "overlay".into(), MsFlags::empty(), Some(data.as_str()))?;
        Ok(())
    }
}

/// Sets up the conventional `/proc`, `/sys`, `/dev`, `/dev/pts`,
/// `/dev/shm`, `/dev/mqueue`, and unified cgroup v2 mounts, applied to
/// every container unless a custom mount list overrides it.
#[derive(Debug, Clone, Default)]
pub struct BaseMounts;

impl Mount for BaseMounts {
    fn mount(&self, rootfs: &Path) -> Result<()> {
        setup_mount(rootfs, "sysfs", "/sys", "sysfs", MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY, None)?;
        setup_mount(rootfs, "proc", "/proc", "proc", MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV, None)?;
        setup_mount(rootfs, "tmpfs", "/dev", "tmpfs", MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME, Some("mode=755,size=65536k"))?;
        setup_mount(rootfs, "devpts", "/dev/pts", "devpts", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC, Some("newinstance,ptmxmode=0666,mode=0620"))?;
        setup_mount(rootfs, "tmpfs", "/dev/shm", "tmpfs", MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=1777,size=65536k"))?;
        setup_mount(rootfs, "mqueue", "/dev/mqueue", "mqueue", MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV, None)?;
        setup_mount(rootfs, "cgroup", "/sys/fs/cgroup", "cgroup2", MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RELATIME, None)?;
        Ok(())
    }
}

fn setup_mount(rootfs: &Path, source: &str, target: &str, fstype: &str, flags: MsFlags, data: Option<&str>) -> Result<()> {
    let target = rootfs.join(target.trim_start_matches('/'));
    ignore_io(create_dir(&target), IoErrorKind::AlreadyExists)?;
    mount(source.into(), &target, fstype.into(), flags, data)?;
    Ok(())
}

/// The container lifecycle states. `Meta` covers
/// a container with no task of its own, existing only to hold children
///. `RestoreFailed` covers a node reconcile found in the
/// persisted store but couldn't rebuild (e.g. its rootfs was never
/// recorded); it behaves like `Stopped` except it refuses `start` until
/// explicitly reset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ContainerState {
    Stopped,
    Running,
    Paused,
    Dead,
    Meta,
    RestoreFailed,
}

#[derive(Clone, Debug, Default)]
pub struct ContainerOptions {
    rootfs: Option<PathBuf>,
    cgroup: Option<Cgroup>,
    mounts: Vec<std::sync::Arc<dyn Mount>>,
    hostname: String,
    command: Vec<String>,
    environ: Vec<String>,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn rootfs(mut self, rootfs: PathBuf) -> Self {
        self.rootfs = Some(rootfs);
        self
    }

    pub fn cgroup(mut self, cgroup: Cgroup) -> Self {
        self.cgroup = Some(cgroup);
        self
    }

    pub fn add_mount<T: Mount + 'static>(mut self, mount: T) -> Self {
        self.mounts.push(std::sync::Arc::new(mount));
        self
    }

    pub fn hostname(mut self, hostname: impl ToString) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn environ(mut self, environ: Vec<String>) -> Self {
        self.environ = environ;
        self
    }

    pub fn create(
        self,
        name: String,
        user_mapper: Box<dyn UserMapper>,
        network_manager: Option<Box<dyn NetworkManager>>,
    ) -> Result<Container> {
        let rootfs = self.rootfs.ok_or_else(|| Error::new(EK::InvalidValue, "container rootfs must be specified"))?;
        let cgroup = self.cgroup.ok_or_else(|| Error::new(EK::InvalidValue, "container cgroup must be specified"))?;
        std::fs::create_dir_all(&rootfs)?;
        cgroup.ensure()?;
        Ok(Container {
            name,
            rootfs,
            cgroup,
            mounts: self.mounts,
            hostname: if self.hostname.is_empty() { "container".to_owned() } else { self.hostname },
            command: self.command,
            environ: self.environ,
            user_mapper,
            network_manager,
            state: ContainerState::Stopped,
            task: None,
            properties: BTreeMap::new(),
            data: BTreeMap::new(),
            respawn_count: 0,
        })
    }
}

/// A single named container. Holder-owned: a container never references
/// its parent or children directly — see `holder::Holder`, which keeps
/// the tree and hands out handles, avoiding shared-ownership cycles.
pub struct Container {
    pub(crate) name: String,
    pub(crate) rootfs: PathBuf,
    pub(crate) cgroup: Cgroup,
    pub(crate) mounts: Vec<std::sync::Arc<dyn Mount>>,
    pub(crate) hostname: String,
    pub(crate) command: Vec<String>,
    pub(crate) environ: Vec<String>,
    pub(crate) user_mapper: Box<dyn UserMapper>,
    pub(crate) network_manager: Option<Box<dyn NetworkManager>>,
    pub(crate) state: ContainerState,
    pub(crate) task: Option<Task>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) data: BTreeMap<String, String>,
    pub(crate) respawn_count: u64,
}

impl Container {
    pub fn options() -> ContainerOptions {
        ContainerOptions::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn cgroup(&self) -> &Cgroup {
        &self.cgroup
    }

    pub(crate) fn task_pid(&self) -> Option<Pid> {
        self.task.as_ref().map(Task::as_pid)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.state != ContainerState::Stopped {
            return Err(Error::invalid_state("properties can only be changed while stopped"));
        }
        self.properties.insert(key.into(), value.into());
        Ok(())
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    /// First-run mount-namespace setup: private-ize the host root so our
    /// bind mounts never propagate out, lay down the configured mounts,
    /// then `pivot_root` into the prepared rootfs.
    pub(crate) fn setup_mount_namespace(&self) -> Result<()> {
        mount(None::<&str>, "/", None::<&str>, MsFlags::MS_SLAVE | MsFlags::MS_REC, None::<&str>)?;
        mount(None::<&str>, "/", None::<&str>, MsFlags::MS_PRIVATE, None::<&str>)?;
        mount(Some(&self.rootfs), &self.rootfs, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)?;
        for mount in &self.mounts {
            mount.mount(&self.rootfs)?;
        }
        crate::path::pivot_root(&self.rootfs)
    }

    /// Starts the container's task: `Stopped -> Running` (or, for a
    /// container with an empty command, `Stopped -> Meta`).
    pub fn start(&mut self) -> Result<()> {
        if self.state != ContainerState::Stopped {
            return Err(Error::invalid_state(format!("cannot start container in state {:?}", self.state)));
        }
        if self.command.is_empty() {
            self.state = ContainerState::Meta;
            return Ok(());
        }
        let task = crate::task::TaskOptions::new()
            .command(self.command.clone())
            .environ(self.environ.clone())
            .start(self)?;
        self.task = Some(task);
        self.state = ContainerState::Running;
        Ok(())
    }

    /// Freezes the task's cgroup: `Running -> Paused`.
    pub fn pause(&mut self, timeout: std::time::Duration) -> Result<()> {
        if self.state != ContainerState::Running {
            return Err(Error::invalid_state("pause requires a running container"));
        }
        self.cgroup.freeze(timeout)?;
        self.state = ContainerState::Paused;
        Ok(())
    }

    pub fn resume(&mut self, timeout: std::time::Duration) -> Result<()> {
        if self.state != ContainerState::Paused {
            return Err(Error::invalid_state("resume requires a paused container"));
        }
        self.cgroup.thaw(timeout)?;
        self.state = ContainerState::Running;
        Ok(())
    }

    /// Delivers `sig` to the container's root pid only. No forced
    /// cgroup-wide kill and no state transition — a caller wanting a
    /// guaranteed stop uses `stop` instead.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        match &self.task {
            Some(task) => task.kill(sig),
            None => Err(Error::invalid_state("container has no running task to signal")),
        }
    }

    /// Stops the container: SIGTERM to the root pid, wait up to `grace`
    /// for the cgroup to drain on its own, then a freezer kill-all as a
    /// backstop for anything that ignored the signal. Always lands in
    /// `Stopped`, never `Dead` — `stop` is a managed shutdown, not a
    /// failure.
    pub fn stop(&mut self, grace: std::time::Duration) -> Result<()> {
        if matches!(self.state, ContainerState::Stopped | ContainerState::Dead | ContainerState::RestoreFailed) {
            self.state = ContainerState::Stopped;
            return Ok(());
        }
        if let Some(task) = &self.task {
            let _ = task.kill(Signal::SIGTERM);
        }
        let deadline = std::time::Instant::now() + grace;
        while !self.cgroup.is_empty()? {
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        if !self.cgroup.is_empty()? {
            self.cgroup.kill_all(grace, grace)?;
        }
        if let Some(mut task) = self.task.take() {
            let _ = task.wait();
        }
        self.state = ContainerState::Stopped;
        Ok(())
    }

    /// Adopts a pid discovered alive in this container's cgroup during
    /// reconcile's `/proc` scan: `Stopped -> Running` without going
    /// through `start`, since the process already exists.
    pub(crate) fn adopt_running(&mut self, pid: Pid) {
        self.task = Some(Task::from_reclaimed(pid));
        self.state = ContainerState::Running;
    }

    /// Reaps an exited task without an explicit kill: `Running -> Dead`
    /// (or back to `Stopped` if `respawn` picks it up — see
    /// `holder::Holder::reconcile`).
    pub fn reap(&mut self) -> Result<Option<nix::sys::wait::WaitStatus>> {
        let Some(task) = self.task.as_mut() else {
            return Ok(None);
        };
        let status = task.wait()?;
        self.task = None;
        self.state = ContainerState::Dead;
        Ok(Some(status))
    }

    /// Resets a dead container back to `Stopped`, for respawn or manual
    /// restart.
    pub fn reset(&mut self) -> Result<()> {
        if self.state != ContainerState::Dead {
            return Err(Error::invalid_state("reset requires a dead container"));
        }
        self.respawn_count += 1;
        self.state = ContainerState::Stopped;
        Ok(())
    }

    pub fn respawn_count(&self) -> u64 {
        self.respawn_count
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ContainerState::Running | ContainerState::Paused)
    }
}
