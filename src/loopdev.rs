//! Loop device allocate/attach/detach, part of the path/mount/file utility
//! layer. Grounded on the ioctl-wrapper idiom used by
//! `orbstack-swift-nio/vinit/src/blockdev.rs` (`nix::ioctl_read!` around a
//! block device fd), serialized process-wide around `/dev/loop-control`
//! to avoid `LOOP_CTL_GET_FREE` races.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::libc::c_ulong;

use crate::error::{Error, ErrorKind as EK, Result};

const LOOP_SET_STATUS64: c_ulong = 0x4C04;

mod ioctl {
    nix::ioctl_none!(ctl_get_free, 0x4C, 0x82);
    nix::ioctl_write_int!(set_fd, 0x4C, 0x00);
    nix::ioctl_none!(clr_fd, 0x4C, 0x01);
}

#[repr(C)]
struct LoopInfo64 {
    device: u64,
    inode: u64,
    rdevice: u64,
    offset: u64,
    size_limit: u64,
    number: u32,
    encrypt_type: u32,
    encrypt_key_size: u32,
    flags: u32,
    file_name: [u8; 64],
    crypt_name: [u8; 64],
    encrypt_key: [u8; 32],
    init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // Safety: all fields are plain integers/byte arrays, so the
        // all-zero bit pattern is a valid value.
        unsafe { std::mem::zeroed() }
    }
}

/// Process-wide mutex: the loop-device control file is covered by a
/// single mutex to avoid kernel `LOOP_CTL_GET_FREE` races under
/// concurrent volume creation.
static LOOP_CONTROL_LOCK: Mutex<()> = Mutex::new(());

/// A loop device bound to a backing file, detached on drop unless
/// [`LoopDevice::keep`] is called (a volume's `Deconstruct` rollback path
/// wants the device released; a successful `Create` wants it kept).
pub struct LoopDevice {
    number: u32,
    path: PathBuf,
    file: Option<File>,
    keep: bool,
}

impl LoopDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Some(file) = self.file.take() {
            let _ = unsafe { ioctl::clr_fd(file.as_raw_fd()) };
        }
    }
}

/// Allocates a free loop device and attaches `backing_file` to it, using
/// the process-wide lock to serialize `LOOP_CTL_GET_FREE` lookups.
pub fn attach(backing_file: &Path, size_limit: u64) -> Result<LoopDevice> {
    let _guard = LOOP_CONTROL_LOCK.lock().unwrap();
    let ctl = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")?;
    let number = unsafe { ioctl::ctl_get_free(ctl.as_raw_fd()) }
        .map_err(|e| Error::from_errno(EK::System, e, "LOOP_CTL_GET_FREE failed"))?;
    let number = number as u32;
    let dev_path = PathBuf::from(format!("/dev/loop{number}"));
    let dev = OpenOptions::new().read(true).write(true).open(&dev_path)?;
    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(backing_file)?;
    unsafe { ioctl::set_fd(dev.as_raw_fd(), backing.as_raw_fd() as u64) }
        .map_err(|e| Error::from_errno(EK::System, e, "LOOP_SET_FD failed"))?;
    let mut info = LoopInfo64::default();
    info.size_limit = size_limit;
    let rc = unsafe {
        nix::libc::ioctl(
            dev.as_raw_fd(),
            LOOP_SET_STATUS64 as _,
            &mut info as *mut LoopInfo64,
        )
    };
    if rc < 0 {
        let err = nix::errno::Errno::last();
        let _ = unsafe { ioctl::clr_fd(dev.as_raw_fd()) };
        return Err(Error::from_errno(EK::System, err, "LOOP_SET_STATUS64 failed"));
    }
    tracing::debug!(loop_device = %dev_path.display(), backing = %backing_file.display(), "attached loop device");
    Ok(LoopDevice {
        number,
        path: dev_path,
        file: Some(dev),
        keep: false,
    })
}
