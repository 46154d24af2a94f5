mod common;

use std::time::Duration;

use nix::unistd::{Gid, Uid};

use ctnrd::container::{BaseMounts, ContainerOptions, ContainerState, OverlayMount};
use ctnrd::holder::Holder;
use ctnrd::network::NoneNetworkManager;
use ctnrd::user::{run_as_root, NewIdMapper};

use common::{test_cgroup_name, TempDir};

/// Drives a single container through `Holder` end to end: create, start,
/// observe it running via a snapshot, pause/resume, stop, and destroy.
#[test]
#[ignore = "requires root-capable uid/gid delegation and a real cgroup v2 mount"]
fn full_container_lifecycle() {
    let tmpdir = TempDir::new().unwrap();
    let rootfs_dir = tmpdir.join("rootfs");
    let upper_dir = tmpdir.join("upper");
    let work_dir = tmpdir.join("work");
    std::fs::create_dir_all(&upper_dir).unwrap();
    std::fs::create_dir_all(&work_dir).unwrap();

    let user_mapper = NewIdMapper::new_root_subid(Uid::current(), Gid::current()).unwrap();
    {
        let rootfs_dir = rootfs_dir.clone();
        let mut rootfs = common::get_rootfs().unwrap();
        run_as_root(&user_mapper, move || Ok(rootfs.unpack(&rootfs_dir)?)).unwrap();
    }

    let holder = Holder::new(tmpdir.join("kv"), test_cgroup_name("ctnrd-test").unwrap()).unwrap();

    let options = ContainerOptions::new()
        .rootfs(tmpdir.join("merged"))
        .add_mount(OverlayMount::new(vec![rootfs_dir], upper_dir, work_dir))
        .add_mount(BaseMounts)
        .command(vec!["/bin/sleep".into(), "2".into()])
        .hostname("lifecycle-test");

    holder
        .create("lifecycle", options, Box::new(user_mapper), Some(Box::new(NoneNetworkManager)))
        .unwrap();

    holder.start("lifecycle").unwrap();
    assert_eq!(holder.get("lifecycle").unwrap().state, ContainerState::Running);

    holder.pause("lifecycle", Duration::from_secs(2)).unwrap();
    assert_eq!(holder.get("lifecycle").unwrap().state, ContainerState::Paused);

    holder.resume("lifecycle", Duration::from_secs(2)).unwrap();
    assert_eq!(holder.get("lifecycle").unwrap().state, ContainerState::Running);

    holder.stop("lifecycle", Duration::from_secs(2)).unwrap();
    assert_eq!(holder.get("lifecycle").unwrap().state, ContainerState::Stopped);

    holder.destroy("lifecycle").unwrap();
    assert!(holder.get("lifecycle").is_err());
}

/// A container with children can't be destroyed until its children are
///.
#[test]
fn destroy_refuses_while_children_exist() {
    let tmpdir = TempDir::new().unwrap();
    let holder = Holder::new(tmpdir.join("kv"), test_cgroup_name("ctnrd-test-children").unwrap()).unwrap();

    let parent_opts = ContainerOptions::new().rootfs(tmpdir.join("parent-root"));
    holder
        .create("parent", parent_opts, Box::new(ctnrd::user::ProcUserMapper::default()), None)
        .unwrap();

    let child_opts = ContainerOptions::new().rootfs(tmpdir.join("child-root"));
    holder
        .create("parent/child", child_opts, Box::new(ctnrd::user::ProcUserMapper::default()), None)
        .unwrap();

    assert!(holder.destroy("parent").is_err(), "parent still has a child");
    holder.destroy("parent/child").unwrap();
    holder.destroy("parent").unwrap();
}

/// Creating a container under a parent that doesn't exist yet is
/// rejected.
#[test]
fn create_requires_existing_parent() {
    let tmpdir = TempDir::new().unwrap();
    let holder = Holder::new(tmpdir.join("kv"), test_cgroup_name("ctnrd-test-orphan").unwrap()).unwrap();
    let opts = ContainerOptions::new().rootfs(tmpdir.join("root"));
    let err = holder
        .create("missing-parent/child", opts, Box::new(ctnrd::user::ProcUserMapper::default()), None)
        .unwrap_err();
    assert_eq!(err.kind(), ctnrd::ErrorKind::ContainerDoesNotExist);
}
