//! ext4 project quota create/resize/destroy, used by the overlay volume
//! variant's `upper/` directory. Project quotas are set via the
//! `FS_IOC_FSSETXATTR`/`FS_IOC_FSGETXATTR` ioctls on the target directory,
//! the same mechanism `xfs_quota`/`chattr -p` use.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::{Error, ErrorKind as EK, Result};

const FS_PROJINHERIT_FL: u32 = 0x2000_0000;

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct FsxAttr {
    xflags: u32,
    extsize: u32,
    nextents: u32,
    project_id: u32,
    cowextsize: u32,
    pad: [u8; 8],
}

mod ioctl {
    use super::FsxAttr;
    nix::ioctl_read!(fsgetxattr, 0x58, 31, FsxAttr);
    nix::ioctl_write_ptr!(fssetxattr, 0x58, 32, FsxAttr);
}

mod quotactl {
    use nix::libc::c_int;
    const Q_XSETPQLIM: c_int = ((b'Q' as c_int) << 8) | 0x21 | (2 << 24);

    #[repr(C)]
    #[derive(Default)]
    pub struct FsDiskQuota {
        pub version: i8,
        pub flags: i8,
        pub field_mask: u16,
        pub id: u32,
        pub blk_hardlimit: u64,
        pub blk_softlimit: u64,
        pub real_mtime: u64,
        pub ino_hardlimit: u64,
        pub ino_softlimit: u64,
        pub real_ctime: u64,
        pub bcount: u64,
        pub icount: u64,
        pub itimer: i32,
        pub btimer: i32,
        pub iwarns: u16,
        pub bwarns: u16,
        pub padding2: i32,
        pub rtb_hardlimit: u64,
        pub rtb_softlimit: u64,
        pub rtbcount: u64,
        pub rtbtimer: i32,
        pub rtbwarns: u16,
        pub padding3: i16,
        pub padding4: [u8; 8],
    }

    pub unsafe fn set_pquota(dev: &std::ffi::CStr, id: u32, quota: &mut FsDiskQuota) -> i32 {
        nix::libc::quotactl(
            Q_XSETPQLIM,
            dev.as_ptr(),
            id as i32,
            quota as *mut FsDiskQuota as *mut nix::libc::c_char,
        )
    }
}

/// Marks `path` with `FS_PROJINHERIT_FL` and a project id, then applies a
/// block-count hard limit of `bytes` via `quotactl(Q_XSETPQLIM)` against
/// `device` (the ext4 block device backing `path`'s filesystem).
pub fn create(path: &Path, device: &Path, project_id: u32, bytes: u64) -> Result<()> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut attr = FsxAttr::default();
    unsafe { ioctl::fsgetxattr(file.as_raw_fd(), &mut attr) }?;
    attr.xflags |= FS_PROJINHERIT_FL;
    attr.project_id = project_id;
    unsafe { ioctl::fssetxattr(file.as_raw_fd(), &attr) }?;

    let dev_cstr = std::ffi::CString::new(device.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::new(EK::InvalidPath, e.to_string()))?;
    let mut quota = quotactl::FsDiskQuota {
        version: 1,
        flags: 0,
        field_mask: 0x4, // FS_DQ_BHARD
        id: project_id,
        blk_hardlimit: bytes / 512,
        blk_softlimit: bytes / 512,
        ..Default::default()
    };
    let rc = unsafe { quotactl::set_pquota(&dev_cstr, project_id, &mut quota) };
    if rc < 0 {
        return Err(nix::errno::Errno::last().into());
    }
    Ok(())
}

/// Resizes an existing project quota's hard/soft block limit.
pub fn resize(device: &Path, project_id: u32, bytes: u64) -> Result<()> {
    let dev_cstr = std::ffi::CString::new(device.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::new(EK::InvalidPath, e.to_string()))?;
    let mut quota = quotactl::FsDiskQuota {
        version: 1,
        flags: 0,
        field_mask: 0x4,
        id: project_id,
        blk_hardlimit: bytes / 512,
        blk_softlimit: bytes / 512,
        ..Default::default()
    };
    let rc = unsafe { quotactl::set_pquota(&dev_cstr, project_id, &mut quota) };
    if rc < 0 {
        return Err(nix::errno::Errno::last().into());
    }
    Ok(())
}

/// Destroys a project quota by zeroing its limits; tolerates a device that
/// no longer exists, so a second call is a no-op rather than an error.
pub fn destroy(device: &Path, project_id: u32) -> Result<()> {
    match resize(device, project_id, 0) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == EK::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
