//! Holder: the named container hierarchy. Owns every
//! `Container` behind a single mutex-guarded map keyed by full dotted
//! name (`"a/b/c"`), persists create/destroy/property changes through
//! `kvalue::KeyValueStore`, and reconciles that persisted state against
//! the live cgroup tree on startup. Grounded on
//! `original_source/meta_root.cpp` (name validation, parent-before-child
//! creation order, destroy-children-first ordering) and
//! `original_source/container.cpp` (the respawn/aging bookkeeping this
//! module schedules and `eventloop` later drives).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::cgroup::{Cgroup, Subsystem};
use crate::container::{Container, ContainerOptions, ContainerState};
use crate::error::{Error, ErrorKind as EK, Result};
use crate::kvalue::KeyValueStore;
use crate::metrics::Metrics;
use crate::network::NetworkManager;
use crate::user::{ProcUserMapper, UserMapper};

/// A point-in-time, lock-released view of a container: `Get` returns a
/// snapshot copy, never a live reference into the holder's map.
#[derive(Clone, Debug)]
pub struct ContainerSnapshot {
    pub name: String,
    pub state: ContainerState,
    pub properties: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
    pub respawn_count: u64,
}

/// One labeled state transition, recorded for `Holder::wait`: waiters are
/// woken only on transitions matching the labels they asked for, not on
/// every update.
#[derive(Clone, Debug)]
struct Transition {
    name: String,
    state: ContainerState,
    labels: BTreeSet<String>,
    seq: u64,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::new(EK::InvalidValue, format!("invalid container name: {name}")));
    }
    for segment in name.split('/') {
        if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) {
            return Err(Error::new(EK::InvalidValue, format!("invalid container name: {name}")));
        }
    }
    Ok(())
}

fn parent_name(name: &str) -> Option<&str> {
    name.rfind('/').map(|i| &name[..i])
}

struct State {
    containers: BTreeMap<String, Container>,
    transitions: Vec<Transition>,
    seq: u64,
}

/// The full named hierarchy of containers, holder-owned per the design
/// note "replace shared-ownership cycles with holder-owned strong records
/// + weak backreferences": children never point back to a
/// parent `Container`, only to its name.
pub struct Holder {
    state: Mutex<State>,
    condvar: Condvar,
    store: KeyValueStore,
    cgroup_root: Cgroup,
    metrics: Metrics,
}

impl Holder {
    pub fn new(kv_root: impl Into<std::path::PathBuf>, cgroup_root_name: impl AsRef<std::path::Path>) -> Result<Self> {
        let cgroup_root = Cgroup::new(Subsystem::Freezer, cgroup_root_name)?;
        cgroup_root.ensure()?;
        Ok(Self {
            state: Mutex::new(State {
                containers: BTreeMap::new(),
                transitions: Vec::new(),
                seq: 0,
            }),
            condvar: Condvar::new(),
            store: KeyValueStore::new(kv_root)?,
            cgroup_root,
            metrics: Metrics::new(),
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Creates a container, persisting it before it becomes visible to
    /// other callers. The parent, if named, must
    /// already exist.
    pub fn create(
        &self,
        name: &str,
        options: ContainerOptions,
        user_mapper: Box<dyn UserMapper>,
        network_manager: Option<Box<dyn NetworkManager>>,
    ) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(name) {
            return Err(Error::new(EK::ContainerAlreadyExists, format!("container already exists: {name}")));
        }
        if let Some(parent) = parent_name(name) {
            if !state.containers.contains_key(parent) {
                return Err(Error::new(EK::ContainerDoesNotExist, format!("parent does not exist: {parent}")));
            }
        }
        let cgroup = self.cgroup_root.child(name)?;
        let container = options.cgroup(cgroup).create(name.to_owned(), user_mapper, network_manager)?;
        self.store.create(&sanitize_node_name(name))?;
        self.persist_locked(&container)?;
        state.containers.insert(name.to_owned(), container);
        Metrics::inc(&self.metrics.containers_created);
        Ok(())
    }

    fn persist_locked(&self, container: &Container) -> Result<()> {
        let mut pairs = vec![
            ("state".to_owned(), format!("{:?}", container.state())),
            ("meta.rootfs".to_owned(), container.rootfs().display().to_string()),
        ];
        for (k, v) in container.properties() {
            pairs.push((format!("prop.{k}"), v.clone()));
        }
        self.store.append(&sanitize_node_name(container.name()), pairs)
    }

    pub fn get(&self, name: &str) -> Result<ContainerSnapshot> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| Error::new(EK::ContainerDoesNotExist, format!("no such container: {name}")))?;
        Ok(ContainerSnapshot {
            name: container.name().to_owned(),
            state: container.state(),
            properties: container.properties().clone(),
            data: container.data().clone(),
            respawn_count: container.respawn_count(),
        })
    }

    pub fn list(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    fn children_of<'a>(containers: &'a BTreeMap<String, Container>, name: &str) -> impl Iterator<Item = &'a str> {
        let prefix = format!("{name}/");
        containers.keys().filter(move |k| k.starts_with(&prefix)).map(String::as_str)
    }

    pub fn start(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = Self::get_mut(&mut state.containers, name)?;
        container.start()?;
        let new_state = container.state();
        self.notify_locked(&mut state, name, new_state, BTreeSet::new());
        Metrics::inc(&self.metrics.containers_running);
        Ok(())
    }

    pub fn pause(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = Self::get_mut(&mut state.containers, name)?;
        container.pause(timeout)?;
        let new_state = container.state();
        self.notify_locked(&mut state, name, new_state, BTreeSet::new());
        Ok(())
    }

    pub fn resume(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = Self::get_mut(&mut state.containers, name)?;
        container.resume(timeout)?;
        let new_state = container.state();
        self.notify_locked(&mut state, name, new_state, BTreeSet::new());
        Ok(())
    }

    /// Delivers `sig` to the container's root pid only: no forced
    /// cgroup-wide kill, no state transition. A caller wanting a
    /// guaranteed, state-changing shutdown uses `stop`.
    pub fn kill(&self, name: &str, sig: Signal) -> Result<()> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| Error::new(EK::ContainerDoesNotExist, format!("no such container: {name}")))?;
        container.signal(sig)
    }

    /// Stops a container: SIGTERM, wait up to `grace`, then a freezer
    /// kill-all backstop. Always lands in `Stopped`.
    pub fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = Self::get_mut(&mut state.containers, name)?;
        container.stop(grace)?;
        let new_state = container.state();
        self.notify_locked(&mut state, name, new_state, BTreeSet::new());
        Metrics::inc(&self.metrics.containers_failed);
        Ok(())
    }

    /// Destroys a container; refuses if it still has children, matching
    /// `original_source/meta_root.cpp`'s "destroy leaves before their
    /// parent" contract.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(name) {
            return Err(Error::new(EK::ContainerDoesNotExist, format!("no such container: {name}")));
        }
        if Self::children_of(&state.containers, name).next().is_some() {
            return Err(Error::new(EK::HasChildren, format!("container has children: {name}")));
        }
        state.containers.remove(name);
        self.store.remove(&sanitize_node_name(name))?;
        Metrics::inc(&self.metrics.containers_destroyed);
        Ok(())
    }

    fn get_mut<'a>(containers: &'a mut BTreeMap<String, Container>, name: &str) -> Result<&'a mut Container> {
        containers
            .get_mut(name)
            .ok_or_else(|| Error::new(EK::ContainerDoesNotExist, format!("no such container: {name}")))
    }

    fn notify_locked(&self, state: &mut State, name: &str, new_state: ContainerState, labels: BTreeSet<String>) {
        state.seq += 1;
        state.transitions.push(Transition {
            name: name.to_owned(),
            state: new_state,
            labels,
            seq: state.seq,
        });
        if state.transitions.len() > 1024 {
            let drop_count = state.transitions.len() - 1024;
            state.transitions.drain(0..drop_count);
        }
        self.condvar.notify_all();
    }

    /// Blocks until a labeled transition matching `names`/`labels` occurs
    /// or `timeout` elapses.
    pub fn wait(&self, names: &[String], labels: &[String], timeout: Duration) -> Result<Option<(String, ContainerState)>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        let mut since = state.seq;
        loop {
            if let Some(t) = state
                .transitions
                .iter()
                .find(|t| t.seq > since && (names.is_empty() || names.contains(&t.name)) && (labels.is_empty() || labels.iter().any(|l| t.labels.contains(l))))
            {
                return Ok(Some((t.name.clone(), t.state)));
            }
            since = state.seq;
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, timeout_result) = self
                .condvar
                .wait_timeout(state, deadline - now)
                .map_err(|_| Error::new(EK::System, "holder state lock poisoned"))?;
            state = guard;
            if timeout_result.timed_out() && state.seq == since {
                return Ok(None);
            }
        }
    }

    /// Re-derives live state from the persisted key-value store on
    /// startup: every persisted node is rebuilt into the container map as
    /// `Stopped` (or `RestoreFailed` if its rootfs was never recorded),
    /// then a `/proc` cgroup scan promotes any container whose cgroup
    /// still holds a live process back to `Running`, matching the
    /// boot-time pass over the persisted container directory that
    /// `original_source/meta_root.cpp` performs.
    pub fn reconcile(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for node in self.store.list()? {
            let name = desanitize_node_name(&node);
            if state.containers.contains_key(&name) {
                continue;
            }
            let map = match self.store.load(&node) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "failed to reconcile container, skipping");
                    Metrics::inc(&self.metrics.reconcile_failures);
                    continue;
                }
            };
            let container = self.rebuild_container(&name, &map)?;
            tracing::debug!(container = %name, state = ?container.state(), "reconciled container from persisted store");
            state.containers.insert(name, container);
        }
        for name in self.reclaim_live_pids(&mut state.containers)? {
            tracing::info!(container = %name, "reclaimed live process on restart");
        }
        Ok(())
    }

    /// Rebuilds one persisted node into a `Container`. Missing
    /// `meta.rootfs` means the node predates that field or its record was
    /// corrupted — such a container can't be safely started until an
    /// operator inspects and resets it, so it comes back `RestoreFailed`
    /// instead of `Stopped`.
    fn rebuild_container(&self, name: &str, map: &BTreeMap<String, String>) -> Result<Container> {
        let cgroup = self.cgroup_root.child(name)?;
        let mut properties = BTreeMap::new();
        for (k, v) in map {
            if let Some(prop) = k.strip_prefix("prop.") {
                properties.insert(prop.to_owned(), v.clone());
            }
        }
        let (rootfs, state) = match map.get("meta.rootfs") {
            Some(rootfs) if !rootfs.is_empty() => (PathBuf::from(rootfs), ContainerState::Stopped),
            _ => {
                Metrics::inc(&self.metrics.reconcile_failures);
                (PathBuf::new(), ContainerState::RestoreFailed)
            }
        };
        Ok(Container {
            name: name.to_owned(),
            rootfs,
            cgroup,
            mounts: Vec::new(),
            hostname: "container".to_owned(),
            command: Vec::new(),
            environ: Vec::new(),
            user_mapper: Box::new(ProcUserMapper::default()),
            network_manager: None,
            state,
            task: None,
            properties,
            data: BTreeMap::new(),
            respawn_count: 0,
        })
    }

    /// Scans `/proc/*/cgroup` for the freezer hierarchy and promotes any
    /// `Stopped` container whose cgroup still contains a live process to
    /// `Running`, adopting the lowest pid found as its root process.
    fn reclaim_live_pids(&self, containers: &mut BTreeMap<String, Container>) -> Result<Vec<String>> {
        let live = scan_proc_cgroups(self.cgroup_root.subsystem())?;
        let mut reclaimed = Vec::new();
        for (name, container) in containers.iter_mut() {
            if container.state() != ContainerState::Stopped {
                continue;
            }
            if let Some(pid) = live.get(container.cgroup().name()) {
                container.adopt_running(*pid);
                reclaimed.push(name.clone());
            }
        }
        Ok(reclaimed)
    }

    /// One tick of the respawn scheduler: any `Dead` container configured
    /// to respawn (tracked via its `respawn` property) is reset to
    /// `Stopped` and restarted.
    pub fn tick_respawn(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let mut respawned = Vec::new();
        let names: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| c.state() == ContainerState::Dead && c.properties().get("respawn").map(String::as_str) == Some("true"))
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            let container = state.containers.get_mut(&name).unwrap();
            container.reset()?;
            container.start()?;
            let new_state = container.state();
            self.notify_locked(&mut state, &name, new_state, BTreeSet::from(["respawn".to_owned()]));
            Metrics::inc(&self.metrics.respawns);
            respawned.push(name);
        }
        Ok(respawned)
    }

    /// Looks up which container owns `pid` as its current task and reaps
    /// it: `Running -> Dead`, waking any `wait` callers. Returns the
    /// container's name, or `None` if `pid` isn't tracked (e.g. it
    /// belongs to a grandchild process the container's task itself
    /// reaped, or the daemon is shutting down mid-reconcile).
    pub fn reap_pid(&self, pid: Pid) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let name = state.containers.iter().find(|(_, c)| c.task_pid() == Some(pid)).map(|(n, _)| n.clone())?;
        let container = state.containers.get_mut(&name).expect("name just found in the same map");
        if let Err(e) = container.reap() {
            tracing::warn!(container = %name, error = %e, "failed to reap exited container task");
            return Some(name);
        }
        let new_state = container.state();
        self.notify_locked(&mut state, &name, new_state, BTreeSet::new());
        Some(name)
    }
}

/// Scans `/proc/<pid>/cgroup` for every live process, returning a map
/// from each process's relative path in `subsystem`'s hierarchy to the
/// lowest pid found there (a reasonable stand-in for "the root process"
/// when reclaiming after a daemon restart, since no pid ordering
/// guarantee survives a crash).
fn scan_proc_cgroups(subsystem: Subsystem) -> Result<BTreeMap<PathBuf, Pid>> {
    let mut map = BTreeMap::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Ok(pid_raw) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(data) = fs::read_to_string(entry.path().join("cgroup")) else {
            continue;
        };
        for line in data.lines() {
            let parts: Vec<&str> = line.splitn(3, ':').collect();
            if parts.len() < 3 {
                continue;
            }
            let controllers = parts[1];
            let matches = if controllers.is_empty() {
                true
            } else {
                controllers.split(',').any(|c| c == subsystem.name())
            };
            if !matches {
                continue;
            }
            let rel = PathBuf::from(parts[2].trim_start_matches('/'));
            let pid = Pid::from_raw(pid_raw);
            map.entry(rel).and_modify(|existing: &mut Pid| {
                if pid.as_raw() < existing.as_raw() {
                    *existing = pid;
                }
            }).or_insert(pid);
        }
    }
    Ok(map)
}

fn sanitize_node_name(name: &str) -> String {
    name.replace('/', "__")
}

fn desanitize_node_name(node: &str) -> String {
    node.replace("__", "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_parent() {
        assert!(parent_name("a/b") == Some("a"));
        assert!(parent_name("a") == None);
    }

    #[test]
    fn validate_name_rejects_dotdot() {
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("a/b-1.2").is_ok());
    }
}
