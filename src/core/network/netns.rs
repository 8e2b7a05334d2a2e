use std::{fs::File, marker::PhantomData, path::PathBuf, thread};

use log::{debug, error};
use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;

use crate::core::error::{RTError, Result};

/// Network namespace of the calling thread, not of the whole process.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

pub fn netns_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// The three primitives a namespace switch is made of.
#[cfg_attr(test, mockall::automock)]
pub trait NsSwitch {
    fn current(&self) -> Result<File>;
    fn open(&self, pid: i32) -> Result<File>;
    fn enter(&self, ns: &File) -> Result<()>;
}

/// `setns(2)` on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Setns;

impl NsSwitch for Setns {
    fn current(&self) -> Result<File> {
        File::open(THREAD_NETNS).map_err(|e| {
            RTError::namespace_error("failed to open current network namespace", Some(Box::new(e)))
        })
    }

    fn open(&self, pid: i32) -> Result<File> {
        let path = netns_path(pid);
        File::open(&path).map_err(|e| {
            RTError::namespace_error(
                &format!("failed to open {}", path.display()),
                Some(Box::new(e)),
            )
        })
    }

    fn enter(&self, ns: &File) -> Result<()> {
        setns(ns, CloneFlags::CLONE_NEWNET).map_err(|e| {
            RTError::namespace_error("failed to set network namespace", Some(Box::new(e)))
        })
    }
}

/// While alive, the current thread sits in another network namespace.
/// Dropping it moves the thread back and closes both handles. Not `Send`,
/// so it cannot leave the thread it was created on.
pub struct NetnsGuard<'a, S: NsSwitch> {
    switch: &'a S,
    origin: File,
    _target: File,
    _pinned: PhantomData<*const ()>,
}

impl<'a, S: NsSwitch> NetnsGuard<'a, S> {
    pub fn enter(switch: &'a S, pid: i32) -> Result<Self> {
        let origin = switch.current()?;
        let target = switch.open(pid)?;
        switch.enter(&target)?;

        debug!(
            "[Netns] thread {:?} entered network namespace of {}",
            thread::current().id(),
            pid
        );

        Ok(Self {
            switch,
            origin,
            _target: target,
            _pinned: PhantomData,
        })
    }
}

impl<S: NsSwitch> Drop for NetnsGuard<'_, S> {
    fn drop(&mut self) {
        match self.switch.enter(&self.origin) {
            Ok(()) => debug!(
                "[Netns] thread {:?} restored its network namespace",
                thread::current().id()
            ),
            Err(e) => error!(
                "Failed to restore network namespace of thread {:?}: {}",
                thread::current().id(),
                e
            ),
        }
    }
}

/// Runs `work` inside the network namespace of `pid` on the current thread.
pub fn with_netns<S, T, F>(switch: &S, pid: i32, work: F) -> Result<T>
where
    S: NsSwitch,
    F: FnOnce() -> Result<T>,
{
    let _guard = NetnsGuard::enter(switch, pid)?;
    work()
}

/// Runs `work` inside the network namespace of `pid` on a dedicated thread
/// that exits afterwards, so no pooled worker is ever left in the container's
/// namespace even if the restore fails.
pub async fn run_in_netns<T, F>(pid: i32, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name(format!("netns-{pid}"))
        .spawn(move || {
            let _ = tx.send(with_netns(&Setns, pid, work));
        })?;

    rx.await.map_err(|_| {
        RTError::namespace_error("namespace worker exited without a result", None)
    })?
}
