//! Resource & Volume manager. A `Layer` is a named,
//! content-hashed directory tree imported from a tarball; a `Volume`
//! stacks layers read-only under a private upper/work pair via overlayfs,
//! optionally quota-limited. The privileged-helper-via-`UserMapper`
//! pattern for import/remove generalizes behind the narrower
//! `Privileged` seam below; the import-to-tmp-then-rename-atomically
//! protocol and layer-in-use bookkeeping follow
//! `original_source/src/layer.cpp`.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{ignore_io, Error, ErrorKind as EK, Result};
use crate::loopdev;
use crate::metrics::Metrics;
use crate::path::{pack_tar, sanitize_whiteouts, unpack_tar};
use crate::quota;

const TMP_DIR: &str = "_tmp_";

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name != TMP_DIR
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        return Err(Error::new(EK::InvalidValue, format!("invalid layer name: {name}")));
    }
    Ok(())
}

/// A named, imported filesystem layer.
#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub path: PathBuf,
    pub digest: String,
}

/// Tracks how many live volumes reference each layer, so `RemoveLayer`
/// can refuse a layer still in use (`original_source/layer.cpp`'s
/// `LayerInUse`) and a layer shared by two volumes stays in use until
/// both release it.
struct LayerUsage {
    in_use: BTreeMap<String, u32>,
}

/// Content-hashed layer store plus the overlay volumes built from it
///. All filesystem mutation that needs root (unpack,
/// remove, quota) goes through `privileged`, running as the container's
/// root identity rather than the caller's.
pub struct VolumeManager<P> {
    layers_dir: PathBuf,
    volumes_dir: PathBuf,
    usage: Mutex<LayerUsage>,
    privileged: P,
    metrics: Metrics,
}

/// Runs a closure with root privilege, the seam `VolumeManager` uses for
/// filesystem mutation instead of introducing a second
/// privilege-elevation mechanism alongside the container user mapper.
pub trait Privileged: Send + Sync {
    fn run_as_root(&self, func: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()>;
}

impl<P: Privileged> VolumeManager<P> {
    pub fn new(root: impl Into<PathBuf>, privileged: P) -> Result<Self> {
        let root = root.into();
        let layers_dir = root.join("layers");
        let volumes_dir = root.join("volumes");
        fs::create_dir_all(&layers_dir)?;
        fs::create_dir_all(layers_dir.join(TMP_DIR))?;
        fs::create_dir_all(&volumes_dir)?;
        Ok(Self {
            layers_dir,
            volumes_dir,
            usage: Mutex::new(LayerUsage { in_use: BTreeMap::new() }),
            privileged,
            metrics: Metrics::new(),
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Resolves a layer name to its backing content directory via the
    /// name's alias symlink under `layers_dir`.
    fn layer_path(&self, name: &str) -> Result<PathBuf> {
        fs::read_link(self.layers_dir.join(name)).map_err(|_| Error::new(EK::LayerNotFound, format!("no such layer: {name}")))
    }

    /// Imports `tarball` as layer `name`. A fresh (non-merge) import is
    /// content-addressed: the unpacked tree lives under a directory named
    /// by the hex SHA-256 of the tarball's source path, gated by a
    /// `.done` sentinel so re-importing the same source path is a no-op
    /// past the first time, and `name` becomes a symlink alias to it. A
    /// `merge` re-import instead extracts the new tarball directly onto
    /// the layer's current content in place, so prior files survive
    /// alongside whatever the new tarball adds — a merged layer is
    /// name-specific content, not a shareable cached resource.
    pub fn import_layer(&self, name: &str, tarball: &Path, merge: bool) -> Result<Layer> {
        validate_name(name)?;
        let alias_path = self.layers_dir.join(name);

        if alias_path.exists() {
            if !merge {
                return Err(Error::new(EK::LayerAlreadyExists, format!("layer already exists: {name}")));
            }
            if self.usage.lock().unwrap().in_use.contains_key(name) {
                return Err(Error::busy(format!("layer in use: {name}")));
            }
            let target = fs::canonicalize(&alias_path)?;
            let tarball_owned = tarball.to_path_buf();
            let unpack_target = target.clone();
            self.privileged.run_as_root(Box::new(move || unpack_tar(&tarball_owned, &unpack_target)))?;
            sanitize_whiteouts(&target, merge)?;
            let digest = hash_path(tarball);
            tracing::debug!(layer = name, digest = %digest, "merged tarball onto existing layer content");
            Metrics::inc(&self.metrics.layers_imported);
            return Ok(Layer {
                name: name.to_owned(),
                path: target,
                digest,
            });
        }

        let digest = hash_path(tarball);
        let digest_dir = self.layers_dir.join(&digest);
        let done_marker = digest_dir.join(".done");
        if !done_marker.exists() {
            let digest_tmp = self.layers_dir.join(TMP_DIR).join(&digest);
            ignore_io(fs::remove_dir_all(&digest_tmp), std::io::ErrorKind::NotFound)?;
            fs::create_dir_all(&digest_tmp)?;
            let tarball_owned = tarball.to_path_buf();
            let unpack_target = digest_tmp.clone();
            self.privileged.run_as_root(Box::new(move || unpack_tar(&tarball_owned, &unpack_target)))?;
            sanitize_whiteouts(&digest_tmp, merge)?;
            ignore_io(fs::remove_dir_all(&digest_dir), std::io::ErrorKind::NotFound)?;
            fs::rename(&digest_tmp, &digest_dir)?;
            fs::File::create(&done_marker)?;
            tracing::debug!(layer = name, digest = %digest, "unpacked new layer content");
        } else {
            tracing::debug!(layer = name, digest = %digest, "layer content already unpacked, reusing cached content");
        }
        std::os::unix::fs::symlink(&digest_dir, &alias_path)?;
        Metrics::inc(&self.metrics.layers_imported);
        Ok(Layer {
            name: name.to_owned(),
            path: digest_dir,
            digest,
        })
    }

    pub fn get_layer(&self, name: &str) -> Result<Layer> {
        let path = self.layer_path(name)?;
        let digest = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(Layer {
            name: name.to_owned(),
            path,
            digest,
        })
    }

    /// Removes the name's alias; the underlying content directory is
    /// reclaimed too once no other name aliases it.
    pub fn remove_layer(&self, name: &str) -> Result<()> {
        if self.usage.lock().unwrap().in_use.contains_key(name) {
            return Err(Error::busy(format!("layer in use: {name}")));
        }
        let alias_path = self.layers_dir.join(name);
        let target = fs::canonicalize(self.layer_path(name)?)?;
        fs::remove_file(&alias_path)?;
        if !self.target_still_aliased(&target)? {
            self.privileged.run_as_root(Box::new(move || crate::path::remove_all_single_device(&target)))?;
        }
        Ok(())
    }

    fn target_still_aliased(&self, target: &Path) -> Result<bool> {
        for entry in fs::read_dir(&self.layers_dir)? {
            let entry = entry?;
            if entry.file_name() == TMP_DIR {
                continue;
            }
            if entry.file_type()?.is_symlink() {
                if let Ok(pointee) = fs::canonicalize(entry.path()) {
                    if pointee == target {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    pub fn export_layer(&self, name: &str, target: &Path) -> Result<()> {
        let path = self.layer_path(name)?;
        pack_tar(&path, target)
    }

    pub fn list_layers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.layers_dir)? {
            let entry = entry?;
            if entry.file_name() == TMP_DIR {
                continue;
            }
            if entry.file_type()?.is_symlink() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Stacks `layers` (bottom to top) read-only, with a private
    /// upper/work writable layer, optionally ext4-project-quota limited
    /// to `quota_bytes`.
    pub fn construct(&self, id: &str, layers: &[String], quota_bytes: Option<u64>, device: Option<&Path>) -> Result<Volume> {
        validate_name(id)?;
        let mut usage = self.usage.lock().unwrap();
        let mut lower = Vec::with_capacity(layers.len());
        for name in layers {
            lower.push(self.layer_path(name)?);
        }
        let volume_dir = self.volumes_dir.join(id);
        if volume_dir.exists() {
            return Err(Error::new(EK::VolumeAlreadyExists, format!("volume already exists: {id}")));
        }
        fs::create_dir_all(&volume_dir)?;
        let upper = volume_dir.join("upper");
        let work = volume_dir.join("work");
        fs::create_dir_all(&upper)?;
        fs::create_dir_all(&work)?;
        if let (Some(bytes), Some(device)) = (quota_bytes, device) {
            quota::create(&upper, device, volume_id_to_project(id), bytes)?;
        }
        for name in layers {
            *usage.in_use.entry(name.clone()).or_insert(0) += 1;
        }
        Metrics::inc(&self.metrics.volumes_constructed);
        Ok(Volume {
            id: id.to_owned(),
            path: volume_dir,
            lowerdir: lower,
            upperdir: upper,
            workdir: work,
            layers: layers.to_vec(),
            quota_bytes,
            device: device.map(Path::to_path_buf),
        })
    }

    /// Tears a volume down: releases quota, removes its directory,
    /// releases its layer references. Idempotent: a repeat call on an
    /// already-torn-down volume is a no-op.
    pub fn deconstruct(&self, volume: Volume) -> Result<()> {
        if let (Some(_), Some(device)) = (volume.quota_bytes, &volume.device) {
            quota::destroy(device, volume_id_to_project(&volume.id))?;
        }
        let path = volume.path.clone();
        self.privileged.run_as_root(Box::new(move || {
            crate::path::remove_all_single_device(&path)
        }))?;
        let mut usage = self.usage.lock().unwrap();
        for name in &volume.layers {
            if let Some(count) = usage.in_use.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    usage.in_use.remove(name);
                }
            }
        }
        Metrics::inc(&self.metrics.volumes_deconstructed);
        Ok(())
    }

    /// Allocates a loop-backed sparse image and formats-free-attaches it
    /// for a volume that needs a standalone block device, e.g. a quota
    /// backend when the place directory isn't itself ext4.
    pub fn attach_loop_image(&self, id: &str, size_bytes: u64) -> Result<PathBuf> {
        let image_path = self.volumes_dir.join(id).join("image.img");
        let file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&image_path)?;
        file.set_len(size_bytes)?;
        drop(file);
        let device = loopdev::attach(&image_path, size_bytes)?;
        Ok(device.keep())
    }
}

fn volume_id_to_project(id: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) | 0x8000_0000
}

/// Hex SHA-256 of a tarball's source path (not its content), the layer
/// store's content-addressing key.
fn hash_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_os_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// A constructed overlay volume.
#[derive(Clone, Debug)]
pub struct Volume {
    pub id: String,
    pub path: PathBuf,
    pub lowerdir: Vec<PathBuf>,
    pub upperdir: PathBuf,
    pub workdir: PathBuf,
    pub layers: Vec<String>,
    pub quota_bytes: Option<u64>,
    pub device: Option<PathBuf>,
}

impl Volume {
    /// Builds the `OverlayMount` a container's mount list uses to wire
    /// this volume in as (part of) its rootfs.
    pub fn as_overlay_mount(&self) -> crate::container::OverlayMount {
        crate::container::OverlayMount::new(self.lowerdir.clone(), self.upperdir.clone(), self.workdir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPrivileged;

    impl Privileged for NoopPrivileged {
        fn run_as_root(&self, func: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
            func()
        }
    }

    fn manager() -> (tempfile::TempDir, VolumeManager<NoopPrivileged>) {
        let dir = tempfile::tempdir().unwrap();
        let manager = VolumeManager::new(dir.path(), NoopPrivileged).unwrap();
        (dir, manager)
    }

    fn make_tarball(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/hostname"), b"demo\n").unwrap();
        let tarball = dir.join("layer.tar");
        pack_tar(&src, &tarball).unwrap();
        tarball
    }

    #[test]
    fn import_then_construct_and_deconstruct() {
        let (dir, manager) = manager();
        let tarball = make_tarball(dir.path());
        let layer = manager.import_layer("base", &tarball, false).unwrap();
        assert!(layer.path.join("etc/hostname").exists());

        let volume = manager.construct("v1", &["base".to_owned()], None, None).unwrap();
        assert!(volume.upperdir.exists());
        assert!(manager.remove_layer("base").is_err(), "layer in use by volume");

        manager.deconstruct(volume).unwrap();
        manager.remove_layer("base").unwrap();
        assert!(manager.get_layer("base").is_err());
    }

    #[test]
    fn duplicate_import_without_merge_fails() {
        let (dir, manager) = manager();
        let tarball = make_tarball(dir.path());
        manager.import_layer("base", &tarball, false).unwrap();
        assert!(manager.import_layer("base", &tarball, false).is_err());
        manager.import_layer("base", &tarball, true).unwrap();
    }
}
