//! Path / mount / file utility layer. Every other layer in
//! the crate assumes the invariants provided here: normalized paths never
//! touch the filesystem, mount helpers always log the intended operation
//! before the syscall, and `NormalizedPath` is the only path type callers
//! pass across the cgroup/task/volume boundary.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::fchdir;

use crate::error::{Error, ErrorKind as EK, Result};

pub use crate::error::ignore_io as ignore_kind;

/// A path that has been folded free of `.` and `..` components without
/// touching the filesystem.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NormalizedPath(PathBuf);

impl NormalizedPath {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(normalize(path.as_ref()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Computes this path's placement relative to `base`, i.e. the inner
    /// path a caller would see if `base` were mounted as `/`.
    pub fn inner_path(&self, base: &NormalizedPath) -> Option<PathBuf> {
        self.0.strip_prefix(&base.0).ok().map(|p| p.to_path_buf())
    }

    pub fn join(&self, rest: impl AsRef<Path>) -> Self {
        Self::new(self.0.join(rest))
    }
}

/// Folds `.` and `..` components out of `path` without any filesystem
/// access. `..` at the root is absorbed (mirrors shell/`Path::components`
/// semantics, not symlink-aware resolution).
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match out.components().next_back() {
                    Some(Component::Normal(_)) => {
                        out.pop();
                    }
                    Some(Component::RootDir) | None => {
                        if !path.is_absolute() {
                            out.push("..");
                        }
                    }
                    _ => out.push(".."),
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Recursively removes `path`, refusing to cross a device boundary (the
/// "single-device stop" contract): if a descendant's `st_dev` differs from
/// `path`'s own, that subtree is left in place and `Busy` is returned.
pub fn remove_all_single_device(path: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let root_dev = fs::metadata(path)?.dev();
    remove_all_on_device(path, root_dev)
}

fn remove_all_on_device(path: &Path, root_dev: u64) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::symlink_metadata(path)?;
    if meta.dev() != root_dev {
        return Err(Error::new(
            EK::Busy,
            format!("refusing to cross device boundary at {}", path.display()),
        ));
    }
    if meta.is_dir() && !meta.file_type().is_symlink() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            remove_all_on_device(&entry.path(), root_dev)?;
        }
        fs::remove_dir(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Visitation order reported by [`walk`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkEvent {
    File,
    DirPre,
    DirPost,
    Symlink,
}

/// Walks `root`, invoking `visit(path, event)` for every regular file,
/// directory (both pre- and post-order), and symlink. Errors reading a
/// single entry are reported to `visit` inline rather than aborting the
/// whole walk.
pub fn walk(root: &Path, visit: &mut dyn FnMut(&Path, WalkEvent) -> Result<()>) -> Result<()> {
    let meta = fs::symlink_metadata(root)?;
    if meta.file_type().is_symlink() {
        return visit(root, WalkEvent::Symlink);
    }
    if !meta.is_dir() {
        return visit(root, WalkEvent::File);
    }
    visit(root, WalkEvent::DirPre)?;
    let mut entries: Vec<_> = fs::read_dir(root)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        walk(&entry.path(), visit)?;
    }
    visit(root, WalkEvent::DirPost)
}

/// Writes `data` to `path` atomically via write-then-rename into the same
/// directory (so the rename is guaranteed to be same-filesystem).
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id()
    ));
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Sets an extended attribute, used to translate the aufs `.wh..wh..opq`
/// opaque-directory marker into overlayfs's `trusted.overlay.opaque=y`.
pub fn setxattr(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    let path = CString::new(path.as_os_str().as_bytes())?;
    let name = CString::new(name)?;
    let rc = unsafe {
        nix::libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const nix::libc::c_void,
            value.len(),
            0,
        )
    };
    if rc < 0 {
        return Err(nix::errno::Errno::last().into());
    }
    Ok(())
}

/// `mknod` a character device (used for overlayfs 0:0 whiteouts).
pub fn mknod_char(path: &Path, major: u64, minor: u64) -> Result<()> {
    use nix::sys::stat::{mknod, SFlag};
    mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o000),
        nix::sys::stat::makedev(major, minor),
    )?;
    Ok(())
}

/// Recursive bind mount with flag propagation: read-only/nodev/noexec/
/// nosuid are inherited from the source unless `relax` explicitly clears
/// them, since recursive bind remounts recompute per-submount preserved
/// flags.
pub fn bind_mount(source: &Path, target: &Path, recursive: bool, relax: MsFlags) -> Result<()> {
    tracing::debug!(source = %source.display(), target = %target.display(), "bind mount");
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>)?;
    let preserved = preserved_flags(source)? & !relax;
    if !preserved.is_empty() {
        remount(target, MsFlags::MS_BIND | preserved, recursive)?;
    }
    Ok(())
}

/// Resolves `source`'s own mount flags from `/proc/self/mountinfo` by
/// longest-prefix match on mount point, so a bind mount inherits exactly
/// what its source already had rather than a blanket guess. Falls back to
/// all four hardening flags (read-only, nodev, noexec, nosuid) if
/// mountinfo can't be read or no mount covers `source`, so a caller that
/// doesn't relax anything never ends up less confined than intended.
fn preserved_flags(source: &Path) -> Result<MsFlags> {
    let canonical = fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
    match scan_mountinfo_flags(&canonical)? {
        Some(flags) => Ok(flags),
        None => Ok(MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID),
    }
}

fn scan_mountinfo_flags(target: &Path) -> Result<Option<MsFlags>> {
    let data = match fs::read_to_string("/proc/self/mountinfo") {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut best: Option<(usize, MsFlags)> = None;
    for line in data.lines() {
        let Some((pre, _post)) = line.split_once(" - ") else {
            continue;
        };
        let pre_fields: Vec<&str> = pre.split(' ').collect();
        if pre_fields.len() < 6 {
            continue;
        }
        let mount_point = PathBuf::from(pre_fields[4]);
        if !target.starts_with(&mount_point) {
            continue;
        }
        let depth = mount_point.components().count();
        if best.as_ref().is_some_and(|(best_depth, _)| depth <= *best_depth) {
            continue;
        }
        let mut flags = MsFlags::empty();
        for opt in pre_fields[5].split(',') {
            match opt {
                "ro" => flags |= MsFlags::MS_RDONLY,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                _ => {}
            }
        }
        best = Some((depth, flags));
    }
    Ok(best.map(|(_, flags)| flags))
}

pub fn remount(target: &Path, flags: MsFlags, recursive: bool) -> Result<()> {
    tracing::debug!(target = %target.display(), ?flags, "remount");
    let mut flags = flags | MsFlags::MS_REMOUNT;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)?;
    Ok(())
}

pub fn move_mount(source: &Path, target: &Path) -> Result<()> {
    tracing::debug!(source = %source.display(), target = %target.display(), "move mount");
    mount(Some(source), target, None::<&str>, MsFlags::MS_MOVE, None::<&str>)?;
    Ok(())
}

pub fn umount(target: &Path, lazy: bool) -> Result<()> {
    tracing::debug!(target = %target.display(), lazy, "umount");
    let flags = if lazy {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };
    umount2(target, flags)?;
    Ok(())
}

/// The well-known pivot_root dance: fchdir into the new root, pivot onto
/// itself, make the stacked original root rslave, lazy-unmount it, fchdir
/// back.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    tracing::debug!(new_root = %new_root.display(), "pivot_root");
    let new_root_fd = nix::fcntl::open(new_root, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
    nix::unistd::pivot_root(new_root, new_root)?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    umount2("/", MntFlags::MNT_DETACH)?;
    fchdir(new_root_fd)?;
    Ok(())
}

/// Unpacks a tarball. Spawning a `tar` child process for large archives
/// would avoid holding the whole extraction on one thread, but using the
/// `tar` crate directly keeps the extraction in-process and therefore
/// reportable through the same [`Error`] type.
pub fn unpack_tar(source: &Path, target: &Path) -> Result<()> {
    let file = File::open(source)?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.unpack(target)?;
    Ok(())
}

/// Packs `source` into a gzip-less tar at `target` (export path).
pub fn pack_tar(source: &Path, target: &Path) -> Result<()> {
    let file = File::create(target)?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", source)?;
    builder.finish()?;
    Ok(())
}

/// Translates overlayfs/aufs whiteout conventions found in an unpacked
/// layer tree. In `merge` mode `.wh.<x>`
/// files simply remove `<x>`; otherwise they are converted to overlayfs
/// character-device whiteouts, and the `.wh..wh..opq` marker becomes the
/// `trusted.overlay.opaque` xattr.
pub fn sanitize_whiteouts(root: &Path, merge: bool) -> Result<()> {
    let mut pending = Vec::new();
    walk(root, &mut |path, event| {
        if event != WalkEvent::File && event != WalkEvent::Symlink {
            return Ok(());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == ".wh..wh..opq" {
            pending.push((path.to_path_buf(), None));
        } else if let Some(real) = name.strip_prefix(".wh.") {
            let target = path.with_file_name(real);
            pending.push((path.to_path_buf(), Some(target)));
        }
        Ok(())
    })?;
    for (wh_path, target) in pending {
        match target {
            None => {
                let dir = wh_path.parent().unwrap_or(root);
                if merge {
                    fs::remove_file(&wh_path)?;
                } else {
                    setxattr(dir, "trusted.overlay.opaque", b"y")?;
                    fs::remove_file(&wh_path)?;
                }
            }
            Some(target) => {
                if target.is_dir() {
                    ignore_kind(fs::remove_dir_all(&target), ErrorKind::NotFound)?;
                } else {
                    ignore_kind(fs::remove_file(&target), ErrorKind::NotFound)?;
                }
                if merge {
                    fs::remove_file(&wh_path)?;
                } else {
                    mknod_char(&target, 0, 0)?;
                    fs::remove_file(&wh_path)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for p in ["a/b/../c", "/a/b/../c", "a/./b/c/..", "/", "a/../../b"] {
            let once = normalize(Path::new(p));
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {p}");
        }
    }

    #[test]
    fn normalize_collapses_parent_dir() {
        assert_eq!(normalize(Path::new("a/b/..")), normalize(Path::new("a")));
        assert_eq!(normalize(Path::new("/a/b/..")), PathBuf::from("/a"));
    }

    #[test]
    fn normalize_absolute_parent_at_root_is_absorbed() {
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
    }

    #[test]
    fn inner_path_computes_relative_placement() {
        let base = NormalizedPath::new("/place/volumes/abc");
        let full = NormalizedPath::new("/place/volumes/abc/data/file.txt");
        assert_eq!(
            full.inner_path(&base),
            Some(PathBuf::from("data/file.txt"))
        );
    }
}
