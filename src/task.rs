//! Task: a supervised process running inside a container's namespaces
//!. `TaskOptions::start` clones the namespace-
//! owning init process; `ExecOptions::start` joins a second process to
//! those same namespaces via `setns`, reporting failures through the
//! crate's tagged `Error`.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::catch_unwind;
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, execvpe, fork, sethostname, ForkResult};

use crate::clone3::{
    clone3, exit_child, new_pipe, pidfd_open, read_ok, read_pid, read_result, write_ok, write_pid,
    write_result, CloneArgs, CloneResult, OwnedPid, Pid,
};
use crate::container::Container;
use crate::error::{Error, ErrorKind as EK, Result};
use crate::network::NetworkHandle;
use crate::user::{Gid, Uid};

pub type WaitStatus = nix::sys::wait::WaitStatus;
pub type Signal = nix::sys::signal::Signal;

/// Closes every open file descriptor numbered `from` or above, the way a
/// `close_range`-less daemon prepares a child for `execve` without
/// leaking pipes or listening sockets across the exec.
pub(crate) fn close_exec_from(from: RawFd) -> Result<()> {
    let dir = std::fs::read_dir("/proc/self/fd")?;
    for entry in dir {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(fd) = name.parse::<RawFd>() else {
            continue;
        };
        if fd >= from {
            let _ = nix::unistd::close(fd);
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct TaskOptions {
    command: Vec<String>,
    environ: Vec<String>,
    work_dir: PathBuf,
    uid: Option<Uid>,
    gid: Option<Gid>,
    cgroup: PathBuf,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn environ(mut self, environ: Vec<String>) -> Self {
        self.environ = environ;
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn user(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn cgroup(mut self, cgroup: impl Into<PathBuf>) -> Self {
        self.cgroup = cgroup.into();
        self
    }

    pub fn stdin(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdin = Some(fd.into());
        self
    }

    pub fn stdout(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdout = Some(fd.into());
        self
    }

    pub fn stderr(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stderr = Some(fd.into());
        self
    }

    fn dev_null(&self) -> Result<Option<OwnedFd>> {
        if self.stdin.is_none() || self.stdout.is_none() || self.stderr.is_none() {
            let raw = nix::fcntl::open("/dev/null", OFlag::O_RDWR, nix::sys::stat::Mode::empty())
                .map_err(Error::from)?;
            Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }))
        } else {
            Ok(None)
        }
    }

    /// Clones the namespace-owning init process for `container`'s task:
    /// new user/mount/pid/net/ipc/uts/time/cgroup namespaces, mount
    /// namespace setup, hostname, network, stdio, and `execve`.
    pub fn start(self, container: &Container) -> Result<Task> {
        let dev_null = self.dev_null()?;
        let uid = self.uid.unwrap_or(Uid::from_raw(0));
        if !container.user_mapper.is_uid_mapped(uid) {
            return Err(Error::new(EK::InvalidValue, format!("user {uid} is not mapped")));
        }
        let gid = self.gid.unwrap_or(Gid::from_raw(0));
        if !container.user_mapper.is_gid_mapped(gid) {
            return Err(Error::new(EK::InvalidValue, format!("group {gid} is not mapped")));
        }
        let work_dir = if self.work_dir.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            self.work_dir
        };
        let command = self.command;
        if command.is_empty() {
            return Err(Error::new(EK::InvalidValue, "task command must not be empty"));
        }
        let environ = self.environ;
        let cgroup = if self.cgroup.as_os_str().is_empty() {
            None
        } else {
            let cgroup = container.cgroup.child(&self.cgroup)?;
            cgroup.ensure()?;
            Some(cgroup)
        };
        let stdin = self.stdin;
        let stdout = self.stdout;
        let stderr = self.stderr;
        let cgroup_target = cgroup.as_ref().unwrap_or(&container.cgroup);
        let cgroup_file = cgroup_target.open()?;
        let pipe = new_pipe()?;
        let child_pipe = new_pipe()?;
        let mut clone_args = CloneArgs::default();
        clone_args.flag_newuser();
        clone_args.flag_newns();
        clone_args.flag_newpid();
        clone_args.flag_newnet();
        clone_args.flag_newipc();
        clone_args.flag_newuts();
        clone_args.flag_newtime();
        clone_args.flag_newcgroup();
        clone_args.flag_into_cgroup(&cgroup_file);
        match unsafe { clone3(&clone_args) }.map_err(|e| Error::from(e).context("cannot start task")) {
            Err(e) => Err(e),
            Ok(CloneResult::Child) => {
                let _ = catch_unwind(move || {
                    drop(cgroup_file);
                    let rx = pipe.rx();
                    let tx = child_pipe.tx();
                    exit_child(move || -> Result<Infallible> {
                        read_ok(rx)?;
                        write_result(
                            tx,
                            (move || -> Result<()> {
                                container.setup_mount_namespace()?;
                                sethostname(&container.hostname).map_err(Error::from)?;
                                if let Some(network) = &container.network_manager {
                                    network.set_network()?;
                                }
                                dup2(stdin.as_ref().or(dev_null.as_ref()).unwrap().as_raw_fd(), 0).map_err(Error::from)?;
                                dup2(stdout.as_ref().or(dev_null.as_ref()).unwrap().as_raw_fd(), 1).map_err(Error::from)?;
                                dup2(stderr.as_ref().or(dev_null.as_ref()).unwrap().as_raw_fd(), 2).map_err(Error::from)?;
                                close_exec_from(3)?;
                                chdir(&work_dir).map_err(Error::from)?;
                                container.user_mapper.set_user(uid, gid)
                            })(),
                        )??;
                        let filename = CString::new(command[0].as_bytes())?;
                        let argv: Result<Vec<_>> = command.iter().map(|v| Ok(CString::new(v.as_bytes())?)).collect();
                        let envp: Result<Vec<_>> = environ.iter().map(|v| Ok(CString::new(v.as_bytes())?)).collect();
                        execvpe(&filename, &argv?, &envp?).map_err(Error::from)?;
                        unreachable!()
                    }())
                });
                unsafe { nix::libc::_exit(2) }
            }
            Ok(CloneResult::Parent { child }) => {
                let child = unsafe { OwnedPid::from_raw(child) };
                drop(cgroup_file);
                drop(stdin);
                drop(stdout);
                drop(stderr);
                drop(dev_null);
                let rx = child_pipe.rx();
                let tx = pipe.tx();
                container
                    .user_mapper
                    .run_map_user(child.as_raw())
                    .map_err(|e| e.context("cannot setup user namespace"))?;
                if let Some(cgroup) = &cgroup {
                    cgroup.attach(child.as_raw()).map_err(|e| e.context("cannot add process to cgroup"))?;
                }
                let network_handle = match &container.network_manager {
                    Some(v) => v.run_network(child.as_raw())?,
                    None => None,
                };
                write_ok(tx)?;
                read_result(rx)??;
                Ok(Task {
                    pid: child.into_raw(),
                    _network_handle: network_handle,
                })
            }
        }
    }
}

/// The init process owning a container's namespaces. Reaped explicitly
/// via [`Task::wait`]; dropping without waiting leaks a zombie.
pub struct Task {
    pid: Pid,
    _network_handle: Option<Box<dyn NetworkHandle>>,
}

impl Task {
    pub fn as_pid(&self) -> Pid {
        self.pid
    }

    pub fn wait(&mut self) -> Result<WaitStatus> {
        Ok(waitpid(self.pid, Some(nix::sys::wait::WaitPidFlag::__WALL)).map_err(Error::from)?)
    }

    pub fn kill(&self, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, signal).map_err(Error::from)
    }

    pub fn options() -> TaskOptions {
        TaskOptions::new()
    }

    /// Wraps a pid recovered from a `/proc` cgroup scan rather than one
    /// this process cloned itself — used by reconcile, which has no
    /// network handle to attach since it didn't set the network up.
    pub(crate) fn from_reclaimed(pid: Pid) -> Self {
        Self {
            pid,
            _network_handle: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecOptions {
    command: Vec<String>,
    environ: Vec<String>,
    work_dir: PathBuf,
    uid: Option<Uid>,
    gid: Option<Gid>,
    cgroup: PathBuf,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn environ(mut self, environ: Vec<String>) -> Self {
        self.environ = environ;
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn user(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn cgroup(mut self, cgroup: impl Into<PathBuf>) -> Self {
        self.cgroup = cgroup.into();
        self
    }

    pub fn stdin(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdin = Some(fd.into());
        self
    }

    pub fn stdout(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdout = Some(fd.into());
        self
    }

    pub fn stderr(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stderr = Some(fd.into());
        self
    }

    fn dev_null(&self) -> Result<Option<OwnedFd>> {
        if self.stdin.is_none() || self.stdout.is_none() || self.stderr.is_none() {
            let raw = nix::fcntl::open("/dev/null", OFlag::O_RDWR, nix::sys::stat::Mode::empty())
                .map_err(Error::from)?;
            Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }))
        } else {
            Ok(None)
        }
    }

    /// Joins `task`'s namespaces via `setns` and `execve`s a second
    /// process into them.
    pub fn start(self, container: &Container, task: &Task) -> Result<Exec> {
        let dev_null = self.dev_null()?;
        let uid = self.uid.unwrap_or(Uid::from_raw(0));
        if !container.user_mapper.is_uid_mapped(uid) {
            return Err(Error::new(EK::InvalidValue, format!("user {uid} is not mapped")));
        }
        let gid = self.gid.unwrap_or(Gid::from_raw(0));
        if !container.user_mapper.is_gid_mapped(gid) {
            return Err(Error::new(EK::InvalidValue, format!("group {gid} is not mapped")));
        }
        let work_dir = if self.work_dir.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            self.work_dir
        };
        let cgroup = if self.cgroup.as_os_str().is_empty() {
            None
        } else {
            let cgroup = container.cgroup.child(&self.cgroup)?;
            cgroup.ensure()?;
            Some(cgroup)
        };
        let command = self.command;
        if command.is_empty() {
            return Err(Error::new(EK::InvalidValue, "exec command must not be empty"));
        }
        let environ = self.environ;
        let stdin = self.stdin;
        let stdout = self.stdout;
        let stderr = self.stderr;
        let init_pid = task.as_pid();
        let pid_pipe = new_pipe()?;
        match unsafe { fork() }.map_err(Error::from)? {
            ForkResult::Child => {
                let _ = catch_unwind(move || -> Result<()> {
                    let pid_tx = pid_pipe.tx();
                    let cgroup_file = match &cgroup {
                        Some(v) => v.open(),
                        None => container.cgroup.open(),
                    }?;
                    let pidfd = pidfd_open(init_pid).map_err(Error::from)?;
                    let flags = CloneFlags::CLONE_NEWUSER
                        | CloneFlags::CLONE_NEWNS
                        | CloneFlags::CLONE_NEWPID
                        | CloneFlags::CLONE_NEWNET
                        | CloneFlags::CLONE_NEWIPC
                        | CloneFlags::CLONE_NEWUTS
                        | CloneFlags::from_bits_retain(nix::libc::CLONE_NEWTIME);
                    nix::sched::setns(&pidfd, flags)
                        .map_err(|e| Error::from(e).context("cannot enter task namespaces"))?;
                    let pipe = new_pipe()?;
                    let mut clone_args = CloneArgs::default();
                    clone_args.flags |= nix::libc::CLONE_PARENT as u64;
                    clone_args.flag_into_cgroup(&cgroup_file);
                    match unsafe { clone3(&clone_args) }.map_err(Error::from)? {
                        CloneResult::Child => {
                            let _ = catch_unwind(move || -> Result<Infallible> {
                                drop(cgroup_file);
                                drop(pid_tx);
                                let tx = pipe.tx();
                                write_result(
                                    tx,
                                    (move || -> Result<()> {
                                        nix::sched::setns(&pidfd, CloneFlags::CLONE_NEWCGROUP)
                                            .map_err(|e| Error::from(e).context("cannot enter cgroup namespace"))?;
                                        dup2(stdin.as_ref().or(dev_null.as_ref()).unwrap().as_raw_fd(), 0).map_err(Error::from)?;
                                        dup2(stdout.as_ref().or(dev_null.as_ref()).unwrap().as_raw_fd(), 1).map_err(Error::from)?;
                                        dup2(stderr.as_ref().or(dev_null.as_ref()).unwrap().as_raw_fd(), 2).map_err(Error::from)?;
                                        close_exec_from(3)?;
                                        chdir(&work_dir).map_err(Error::from)?;
                                        container.user_mapper.set_user(uid, gid)
                                    })(),
                                )??;
                                let filename = CString::new(command[0].as_bytes())?;
                                let argv: Result<Vec<_>> = command.iter().map(|v| Ok(CString::new(v.as_bytes())?)).collect();
                                let envp: Result<Vec<_>> = environ.iter().map(|v| Ok(CString::new(v.as_bytes())?)).collect();
                                execvpe(&filename, &argv?, &envp?).map_err(Error::from)?;
                                unreachable!()
                            });
                            unsafe { nix::libc::_exit(2) }
                        }
                        CloneResult::Parent { child } => {
                            exit_child((move || -> Result<()> {
                                drop(stdin);
                                drop(stdout);
                                drop(stderr);
                                drop(dev_null);
                                write_pid(pid_tx, child)?;
                                read_result(pipe.rx())?
                            })())
                        }
                    }
                });
                unsafe { nix::libc::_exit(2) }
            }
            ForkResult::Parent { child } => {
                let child = unsafe { OwnedPid::from_raw(child) };
                drop(stdin);
                drop(stdout);
                drop(stderr);
                drop(dev_null);
                let rx = pid_pipe.rx();
                let sibling = unsafe { OwnedPid::from_raw(read_pid(rx)?) };
                child.wait_success()?;
                Ok(Exec {
                    pid: sibling.into_raw(),
                })
            }
        }
    }
}

/// A second process joined to a task's existing namespaces.
pub struct Exec {
    pid: Pid,
}

impl Exec {
    pub fn as_pid(&self) -> Pid {
        self.pid
    }

    pub fn wait(&mut self) -> Result<WaitStatus> {
        Ok(waitpid(self.pid, Some(nix::sys::wait::WaitPidFlag::__WALL)).map_err(Error::from)?)
    }

    pub fn options() -> ExecOptions {
        ExecOptions::new()
    }
}
