mod common;

use std::fs;
use std::path::Path;

use ctnrd::volume::{Privileged, VolumeManager};
use ctnrd::Result as CtnrdResult;

use common::TempDir;

struct DirectPrivileged;

impl Privileged for DirectPrivileged {
    fn run_as_root(&self, func: Box<dyn FnOnce() -> CtnrdResult<()> + Send>) -> CtnrdResult<()> {
        func()
    }
}

fn make_tarball(dir: &Path, file_name: &str, contents: &[u8]) -> std::path::PathBuf {
    let src = dir.join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join(file_name), contents).unwrap();
    let tarball = dir.join(format!("{file_name}.tar"));
    ctnrd::path::pack_tar(&src, &tarball).unwrap();
    fs::remove_dir_all(&src).unwrap();
    tarball
}

/// Two volumes built from the same layer keep it marked in-use until
/// both volumes are torn down.
#[test]
fn shared_layer_stays_in_use_until_all_volumes_release_it() {
    let tmp = TempDir::new().unwrap();
    let manager = VolumeManager::new(tmp.as_path(), DirectPrivileged).unwrap();

    let tarball = make_tarball(tmp.as_path(), "shared.txt", b"shared layer contents\n");
    manager.import_layer("shared", &tarball, false).unwrap();

    let v1 = manager.construct("v1", &["shared".to_owned()], None, None).unwrap();
    let v2 = manager.construct("v2", &["shared".to_owned()], None, None).unwrap();

    let err = manager.remove_layer("shared").unwrap_err();
    assert_eq!(err.kind(), ctnrd::ErrorKind::Busy);

    manager.deconstruct(v1).unwrap();
    assert!(manager.remove_layer("shared").is_err(), "v2 still references the layer");

    manager.deconstruct(v2).unwrap();
    manager.remove_layer("shared").unwrap();
}

/// Importing a layer twice without `merge` fails; with `merge` it
/// succeeds and the layer's files reflect the newer tarball.
#[test]
fn reimport_requires_merge_flag() {
    let tmp = TempDir::new().unwrap();
    let manager = VolumeManager::new(tmp.as_path(), DirectPrivileged).unwrap();

    let first = make_tarball(tmp.as_path(), "a.txt", b"v1\n");
    manager.import_layer("demo", &first, false).unwrap();

    let second = make_tarball(tmp.as_path(), "b.txt", b"v2\n");
    let err = manager.import_layer("demo", &second, false).unwrap_err();
    assert_eq!(err.kind(), ctnrd::ErrorKind::LayerAlreadyExists);

    let layer = manager.import_layer("demo", &second, true).unwrap();
    assert!(layer.path.join("a.txt").exists(), "merge keeps prior files");
    assert!(layer.path.join("b.txt").exists(), "merge adds new files");
}
