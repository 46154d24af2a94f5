use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::distributions::{Alphanumeric, DistString as _};
use tar::Archive;

use ctnrd::Error;

pub struct TempDir(PathBuf);

impl TempDir {
    #[allow(unused)]
    pub fn new() -> Result<Self, Error> {
        let tmpdir = Path::new(env!("CARGO_TARGET_TMPDIR"));
        let path = loop {
            let path = tmpdir.join(format!("ctnrd-test-{}", rand_string(32)));
            match std::fs::metadata(&path) {
                Ok(_) => continue,
                Err(v) if v.kind() == ErrorKind::NotFound => break path,
                Err(v) => return Err(v.into()),
            }
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.0.join(path)
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[allow(unused)]
pub fn rand_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Resolves the calling process's own cgroup v2 path, suffixed so tests
/// never collide with the process's own cgroup.
#[allow(unused)]
pub fn test_cgroup_name(suffix: &str) -> Result<PathBuf, Error> {
    if let Ok(v) = std::env::var("TEST_CGROUP_PATH") {
        return Ok(PathBuf::from(v).join(suffix));
    }
    let data = std::fs::read_to_string("/proc/self/cgroup")?;
    for line in data.lines() {
        let parts: Vec<_> = line.splitn(3, ':').collect();
        if parts.len() < 3 {
            continue;
        }
        return Ok(PathBuf::from(parts[2].trim_start_matches('/')).join(suffix));
    }
    Err(Error::not_found("could not resolve own cgroup"))
}

/// Fetches (and caches) a minimal root filesystem tarball via
/// `tests/get_rootfs.sh` so container lifecycle tests have a real rootfs
/// to mount without checking a binary fixture into source control.
#[allow(unused)]
pub fn get_rootfs() -> Result<Archive<File>, Error> {
    let status = std::process::Command::new("/bin/sh")
        .arg("./get_rootfs.sh")
        .current_dir("./tests")
        .status()?;
    if !status.success() {
        return Err(Error::not_found("failed to fetch test rootfs"));
    }
    let mut rootfs = Archive::new(File::open("./tests/rootfs.tar")?);
    rootfs.set_preserve_permissions(true);
    rootfs.set_preserve_ownerships(true);
    rootfs.set_unpack_xattrs(true);
    Ok(rootfs)
}
