//! Raw `clone3(2)` wrapper and the double-pipe child-setup protocol
//!: a typed `<kind:u32><errno:i32><len:u32><message:len
//! bytes>` framing so a failed child-setup step reports a typed
//! `ErrorKind` back to the parent instead of a flattened string.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use nix::errno::Errno;
use nix::libc::syscall;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

use crate::error::{Error, ErrorKind};

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    pub fn flag_newuser(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUSER as u64;
    }

    pub fn flag_newns(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNS as u64;
    }

    pub fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }

    pub fn flag_newnet(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNET as u64;
    }

    pub fn flag_newipc(&mut self) {
        self.flags |= nix::libc::CLONE_NEWIPC as u64;
    }

    pub fn flag_newuts(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUTS as u64;
    }

    pub fn flag_newtime(&mut self) {
        self.flags |= nix::libc::CLONE_NEWTIME as u64;
    }

    pub fn flag_newcgroup(&mut self) {
        self.flags |= nix::libc::CLONE_NEWCGROUP as u64;
    }

    pub fn flag_into_cgroup<T: AsRawFd>(&mut self, cgroup: &T) {
        self.flags |= 0x2000_0000_0; // CLONE_INTO_CGROUP
        self.cgroup = cgroup.as_raw_fd() as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

/// Safety: the caller must not touch non-async-signal-safe state in the
/// child branch before calling `exit_child` or `_exit`.
pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

pub(crate) fn pidfd_open(pid: Pid) -> Result<File, Errno> {
    let res = unsafe { syscall(nix::libc::SYS_pidfd_open, pid.as_raw(), 0 as nix::libc::c_uint) };
    Errno::result(res).map(|v| unsafe { File::from_raw_fd(v as RawFd) })
}

pub(crate) struct Pipe {
    rx: File,
    tx: File,
}

impl Pipe {
    pub fn rx(self) -> impl Read {
        drop(self.tx);
        self.rx
    }

    pub fn tx(self) -> impl Write {
        drop(self.rx);
        self.tx
    }
}

pub(crate) fn new_pipe() -> Result<Pipe, Error> {
    let (rx, tx) = nix::unistd::pipe()?;
    let rx = File::from(rx);
    let tx = File::from(tx);
    Ok(Pipe { rx, tx })
}

/// Wire format for a child-setup outcome: `<kind:u32><errno:i32><len:u32>`
/// followed by `len` bytes of message. `errno` is `-1` when the error
/// carries no `Errno`. A `kind` of `u32::MAX` means success with no
/// payload at all.
const WIRE_OK: u32 = u32::MAX;

pub(super) fn read_result(mut rx: impl Read) -> Result<Result<(), Error>, Error> {
    let mut header = [0u8; 4];
    rx.read_exact(&mut header)?;
    let kind = u32::from_le_bytes(header);
    if kind == WIRE_OK {
        return Ok(Ok(()));
    }
    let mut errno_buf = [0u8; 4];
    rx.read_exact(&mut errno_buf)?;
    let errno_raw = i32::from_le_bytes(errno_buf);
    let mut len_buf = [0u8; 4];
    rx.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut msg_buf = vec![0u8; len];
    rx.read_exact(&mut msg_buf)?;
    let message = String::from_utf8(msg_buf)?;
    let kind = ErrorKind::from_wire(kind);
    let mut error = Error::new(kind, message);
    if errno_raw >= 0 {
        error = error.with_errno(Errno::from_raw(errno_raw));
    }
    Ok(Err(error))
}

pub(super) fn write_result(mut tx: impl Write, result: Result<(), Error>) -> Result<Result<(), Error>, Error> {
    match result {
        Ok(()) => {
            tx.write_all(&WIRE_OK.to_le_bytes())?;
            Ok(Ok(()))
        }
        Err(err) => {
            tx.write_all(&err.kind().to_wire().to_le_bytes())?;
            tx.write_all(&err.errno().map(|e| e as i32).unwrap_or(-1).to_le_bytes())?;
            let msg = err.to_string();
            tx.write_all(&(msg.as_bytes().len() as u32).to_le_bytes())?;
            tx.write_all(msg.as_bytes())?;
            Ok(Err(err))
        }
    }
}

pub(super) fn read_ok(mut rx: impl Read) -> Result<(), Error> {
    Ok(rx.read_exact(&mut [0; 1])?)
}

pub(super) fn write_ok(mut tx: impl Write) -> Result<(), Error> {
    Ok(tx.write_all(&[0])?)
}

pub(super) fn read_pid(mut rx: impl Read) -> Result<Pid, Error> {
    let mut buf = [0; 4];
    rx.read_exact(&mut buf)?;
    Ok(Pid::from_raw(nix::libc::pid_t::from_le_bytes(buf)))
}

pub(super) fn write_pid(mut tx: impl Write, pid: Pid) -> Result<(), Error> {
    Ok(tx.write_all(&pid.as_raw().to_le_bytes())?)
}

pub(super) fn exit_child<T>(result: Result<T, Error>) -> ! {
    match result {
        Ok(_) => unsafe { nix::libc::_exit(0) },
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
}

pub(super) struct OwnedPid(Option<Pid>);

impl OwnedPid {
    pub unsafe fn from_raw(pid: Pid) -> Self {
        Self(Some(pid))
    }

    pub fn as_raw(&self) -> Pid {
        self.0.unwrap()
    }

    pub fn into_raw(mut self) -> Pid {
        self.0.take().unwrap()
    }

    pub fn wait_success(self) -> Result<(), Error> {
        let status = waitpid(self.into_raw(), Some(WaitPidFlag::__WALL))?;
        match status {
            WaitStatus::Exited(_, 0) => Ok(()),
            WaitStatus::Exited(_, v) => Err(Error::new(ErrorKind::TaskFailed, format!("child exited with: {v}"))),
            WaitStatus::Signaled(_, v, _) => Err(Error::new(ErrorKind::TaskFailed, format!("child killed with: {v}"))),
            _ => Err(Error::new(ErrorKind::System, format!("unexpected wait status: {status:?}"))),
        }
    }
}

impl Drop for OwnedPid {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        }
    }
}
