//! User namespace ID mapping. A container's task runs as a
//! mapped uid/gid inside its user namespace; `UserMapper` is the seam
//! between "map as current process" (suitable for a single-tenant daemon
//! running as root) and "map via newuidmap/newgidmap against /etc/subuid"
//! (suitable for rootless or subuid-delegated tenants).

use std::ffi::CString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::panic::{catch_unwind, RefUnwindSafe, UnwindSafe};
use std::process::Command;
use std::str::FromStr;

use nix::libc::uid_t;
use nix::unistd::{getgid, getgrouplist, getuid, setgid, setgroups, setuid, User};

use crate::clone3::{clone3, exit_child, new_pipe, read_ok, read_result, write_ok, write_result, CloneArgs, CloneResult, OwnedPid, Pid};
use crate::error::{Error, ErrorKind as EK, Result};

pub type Uid = nix::unistd::Uid;
pub type Gid = nix::unistd::Gid;

/// Maps a contiguous range of IDs from the host namespace into the
/// container namespace.
#[derive(Clone, Debug)]
pub struct IdMap<T> {
    pub container_id: T,
    pub host_id: T,
    pub size: u32,
}

impl<T: From<uid_t>> IdMap<T> {
    pub fn new_root(host_id: T) -> Self {
        Self {
            host_id,
            container_id: 0.into(),
            size: 1,
        }
    }
}

/// Seam between "map as the calling process" and "map via
/// newuidmap/newgidmap".
pub trait UserMapper: Send + Sync + std::fmt::Debug + RefUnwindSafe {
    fn run_map_user(&self, pid: Pid) -> Result<()>;
    fn set_user(&self, uid: Uid, gid: Gid) -> Result<()>;
    fn is_uid_mapped(&self, id: Uid) -> bool;
    fn is_gid_mapped(&self, id: Gid) -> bool;
    fn uid_count(&self) -> u32;
    fn gid_count(&self) -> u32;
}

fn is_id_mapped<T>(id_map: &[IdMap<T>], id: T) -> bool
where
    T: Copy + Into<uid_t>,
{
    for v in id_map {
        if v.container_id.into() + v.size <= id.into() {
            continue;
        }
        if v.container_id.into() <= id.into() {
            return true;
        }
    }
    false
}

/// Maps the container's user namespace directly to the calling process's
/// own uid/gid.
#[derive(Clone, Debug)]
pub struct ProcUserMapper {
    pub uid_map: Vec<IdMap<Uid>>,
    pub gid_map: Vec<IdMap<Gid>>,
    pub set_groups: bool,
}

impl ProcUserMapper {
    pub fn new_root(uid: Uid, gid: Gid) -> Self {
        Self {
            uid_map: vec![IdMap::new_root(uid)],
            gid_map: vec![IdMap::new_root(gid)],
            set_groups: false,
        }
    }
}

impl Default for ProcUserMapper {
    fn default() -> Self {
        Self::new_root(getuid(), getgid())
    }
}

impl UserMapper for ProcUserMapper {
    fn run_map_user(&self, _pid: Pid) -> Result<()> {
        // The calling process already owns the identity it maps; no
        // separate mapping step is needed once the user namespace exists.
        Ok(())
    }

    fn set_user(&self, uid: Uid, gid: Gid) -> Result<()> {
        if self.set_groups {
            let groups = match User::from_uid(uid).map_err(Error::from)? {
                Some(user) => getgrouplist(&CString::new(user.name.as_bytes())?, gid).map_err(Error::from)?,
                None => vec![gid],
            };
            setgroups(&groups).map_err(Error::from)?;
        }
        setgid(gid).map_err(Error::from)?;
        setuid(uid).map_err(Error::from)
    }

    fn is_uid_mapped(&self, uid: Uid) -> bool {
        is_id_mapped(&self.uid_map, uid)
    }

    fn is_gid_mapped(&self, gid: Gid) -> bool {
        is_id_mapped(&self.gid_map, gid)
    }

    fn uid_count(&self) -> u32 {
        self.uid_map.iter().fold(0, |acc, x| acc + x.size)
    }

    fn gid_count(&self) -> u32 {
        self.gid_map.iter().fold(0, |acc, x| acc + x.size)
    }
}

/// Maps via `/bin/newuidmap`/`/bin/newgidmap` against `/etc/subuid`/
/// `/etc/subgid` delegations, for rootless or subuid-delegated tenants.
#[derive(Clone, Debug)]
pub struct NewIdMapper {
    pub uid_map: Vec<IdMap<Uid>>,
    pub gid_map: Vec<IdMap<Gid>>,
    pub uid_binary: String,
    pub gid_binary: String,
}

impl NewIdMapper {
    pub fn new_root(uid: Uid, gid: Gid) -> Self {
        Self {
            uid_map: vec![IdMap::new_root(uid)],
            gid_map: vec![IdMap::new_root(gid)],
            uid_binary: "/bin/newuidmap".to_owned(),
            gid_binary: "/bin/newgidmap".to_owned(),
        }
    }

    pub fn new_root_subid(uid: Uid, gid: Gid) -> Result<Self> {
        let user = User::from_uid(uid)
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found(format!("unknown user: {uid}")))?;
        Ok(Self {
            uid_map: Self::get_id_subid_map("/etc/subuid", uid, &user)?,
            gid_map: Self::get_id_subid_map("/etc/subgid", gid, &user)?,
            uid_binary: "/bin/newuidmap".to_owned(),
            gid_binary: "/bin/newgidmap".to_owned(),
        })
    }

    fn get_id_subid_map<T>(path: &str, id: T, user: &User) -> Result<Vec<IdMap<T>>>
    where
        T: Copy + From<uid_t> + Into<uid_t>,
    {
        Ok(match Self::find_subid(path, user)? {
            Some((start, size)) => vec![
                IdMap::new_root(id),
                IdMap {
                    container_id: 1.into(),
                    host_id: start,
                    size,
                },
            ],
            None => vec![IdMap::new_root(id)],
        })
    }

    fn find_subid<T>(path: &str, user: &User) -> Result<Option<(T, u32)>>
    where
        T: From<uid_t>,
    {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            let parts: Vec<_> = line.split(':').collect();
            if parts.len() >= 3 && parts[0] == user.name {
                let start = uid_t::from_str(parts[1])?;
                let size = u32::from_str(parts[2])?;
                return Ok(Some((start.into(), size)));
            }
        }
        Ok(None)
    }

    fn run_id_map<T>(id_map: &[IdMap<T>], binary: &str, pid: Pid) -> Result<()>
    where
        T: Copy + Into<uid_t>,
    {
        let mut cmd = Command::new(binary);
        cmd.arg(pid.as_raw().to_string());
        for v in id_map {
            cmd.arg(v.container_id.into().to_string())
                .arg(v.host_id.into().to_string())
                .arg(v.size.to_string());
        }
        let status = cmd.spawn()?.wait()?;
        if !status.success() {
            return Err(Error::new(
                EK::System,
                format!("{binary} exited with code {}", status.code().unwrap_or(-1)),
            ));
        }
        Ok(())
    }
}

impl Default for NewIdMapper {
    fn default() -> Self {
        Self::new_root(getuid(), getgid())
    }
}

impl UserMapper for NewIdMapper {
    fn run_map_user(&self, pid: Pid) -> Result<()> {
        Self::run_id_map(&self.uid_map, &self.uid_binary, pid).map_err(|e| e.context("mapping uids"))?;
        Self::run_id_map(&self.gid_map, &self.gid_binary, pid).map_err(|e| e.context("mapping gids"))?;
        Ok(())
    }

    fn set_user(&self, uid: Uid, gid: Gid) -> Result<()> {
        let groups = match User::from_uid(uid).map_err(Error::from)? {
            Some(user) => getgrouplist(&CString::new(user.name.as_bytes())?, gid).map_err(Error::from)?,
            None => Vec::new(),
        };
        setgroups(&groups).map_err(Error::from)?;
        setgid(gid).map_err(Error::from)?;
        setuid(uid).map_err(Error::from)
    }

    fn is_uid_mapped(&self, uid: Uid) -> bool {
        is_id_mapped(&self.uid_map, uid)
    }

    fn is_gid_mapped(&self, gid: Gid) -> bool {
        is_id_mapped(&self.gid_map, gid)
    }

    fn uid_count(&self) -> u32 {
        self.uid_map.iter().fold(0, |acc, x| acc + x.size)
    }

    fn gid_count(&self) -> u32 {
        self.gid_map.iter().fold(0, |acc, x| acc + x.size)
    }
}

/// Forks into a fresh user namespace, maps the target identity, and runs
/// `func` there. Used to probe a mapper's validity and to run a
/// namespace-setup step as an unprivileged uid/gid.
pub fn run_as_user<T, F>(user_mapper: &T, uid: Uid, gid: Gid, func: F) -> Result<()>
where
    T: UserMapper + RefUnwindSafe + ?Sized,
    F: FnOnce() -> Result<()> + UnwindSafe,
{
    let pipe = new_pipe()?;
    let child_pipe = new_pipe()?;
    let mut clone_args = CloneArgs::default();
    clone_args.flag_newuser();
    match unsafe { clone3(&clone_args) }.map_err(Error::from)? {
        CloneResult::Child => {
            let _ = catch_unwind(move || {
                let rx = pipe.rx();
                let tx = child_pipe.tx();
                exit_child(move || -> Result<()> {
                    read_ok(rx)?;
                    user_mapper.set_user(uid, gid)?;
                    write_result(tx, func())?
                }())
            });
            unsafe { nix::libc::_exit(2) }
        }
        CloneResult::Parent { child } => {
            let child = unsafe { OwnedPid::from_raw(child) };
            let rx = child_pipe.rx();
            let tx = pipe.tx();
            user_mapper.run_map_user(child.as_raw())?;
            write_ok(tx)?;
            read_result(rx)??;
            child.wait_success()
        }
    }
}

pub fn run_as_root<T, F>(user_mapper: &T, func: F) -> Result<()>
where
    T: UserMapper + RefUnwindSafe + ?Sized,
    F: FnOnce() -> Result<()> + UnwindSafe,
{
    run_as_user(user_mapper, Uid::from_raw(0), Gid::from_raw(0), func)
}
