//! Cross-process advisory file locking, layering in-process fairness and
//! cancellation safety over OS-level `flock`.
//!
//! Each locked path gets a single dedicated OS thread that owns the
//! `fd_lock::RwLock<File>` for its whole life; all async tasks that want that
//! path's lock talk to the thread over channels. This sidesteps `fd_lock`'s
//! `&mut self`-based API, which otherwise has no safe way to be shared across
//! concurrently-awaiting async tasks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::error::Error;

enum OsRequest {
    AcquireExclusive(oneshot::Sender<()>),
    AcquireShared(oneshot::Sender<()>),
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    /// Someone is in the middle of an OS-level acquire; `true` = exclusive.
    Acquiring(bool),
    Exclusive,
    Shared,
}

struct Inner {
    mode: Mode,
    holders: usize,
    ex_waiting: usize,
}

/// The dedicated-thread OS lock owner for one path.
struct PathLock {
    state: Mutex<Inner>,
    notify: Notify,
    os_tx: mpsc::Sender<OsRequest>,
}

impl PathLock {
    /// Acquire the lock, waiting for any conflicting holders/waiters. Safe to
    /// cancel: if the returned future is dropped before completion, the
    /// background OS-level acquisition (if already underway) still completes
    /// and is immediately released rather than leaking a held lock.
    async fn acquire(self: &Arc<Self>, exclusive: bool) -> Result<LockGuard, Error> {
        if exclusive {
            let mut inner = self.state.lock().unwrap();
            inner.ex_waiting += 1;
        }
        let _dec_ex_waiting = exclusive.then(|| DecrementExWaiting { lock: self.clone() });

        loop {
            let notified = {
                let mut inner = self.state.lock().unwrap();
                match inner.mode {
                    Mode::Idle => {
                        inner.mode = Mode::Acquiring(exclusive);
                        drop(inner);
                        return self.drive_os_acquire(exclusive).await;
                    }
                    Mode::Shared if !exclusive && inner.ex_waiting == 0 => {
                        inner.holders += 1;
                        return Ok(LockGuard {
                            lock: self.clone(),
                            exclusive: false,
                        });
                    }
                    _ => self.notify.notified(),
                }
            };
            notified.await;
        }
    }

    /// Perform the actual OS-level acquire on the dedicated thread, via a
    /// detached task so a cancelled caller can't abandon an in-flight
    /// acquisition: the task always runs to completion and updates state (or
    /// immediately releases) on its own.
    async fn drive_os_acquire(self: &Arc<Self>, exclusive: bool) -> Result<LockGuard, Error> {
        let abandoned = Arc::new(AtomicBool::new(false));
        let lock = self.clone();
        let task_abandoned = abandoned.clone();

        let handle = tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            let req = if exclusive {
                OsRequest::AcquireExclusive(tx)
            } else {
                OsRequest::AcquireShared(tx)
            };
            if lock.os_tx.send(req).is_err() {
                let mut inner = lock.state.lock().unwrap();
                inner.mode = Mode::Idle;
                drop(inner);
                lock.notify.notify_waiters();
                return Err(Error::LockWorkerGone(format!("{:p}", Arc::as_ptr(&lock))));
            }
            // Wait for the OS-level lock to actually be held. The background
            // thread never drops this; losing the receiver just means the
            // thread died, which is itself an error worth surfacing.
            if rx.await.is_err() {
                let mut inner = lock.state.lock().unwrap();
                inner.mode = Mode::Idle;
                drop(inner);
                lock.notify.notify_waiters();
                return Err(Error::LockWorkerGone(format!("{:p}", Arc::as_ptr(&lock))));
            }

            if task_abandoned.load(Ordering::SeqCst) {
                // The caller gave up before we got here: release immediately
                // rather than holding a lock nobody is waiting to use.
                let _ = lock.os_tx.send(OsRequest::Release);
                let mut inner = lock.state.lock().unwrap();
                inner.mode = Mode::Idle;
                drop(inner);
                lock.notify.notify_waiters();
                return Err(Error::Canceled);
            }

            let mut inner = lock.state.lock().unwrap();
            inner.mode = if exclusive { Mode::Exclusive } else { Mode::Shared };
            inner.holders = 1;
            Ok(())
        });

        let guard = AbandonOnDrop {
            abandoned: abandoned.clone(),
            armed: true,
        };

        let result = handle.await.map_err(|e| {
            Error::LockWorkerGone(format!("lock task for path join error: {e}"))
        })?;
        drop(guard);

        result.map(|()| LockGuard {
            lock: self.clone(),
            exclusive,
        })
    }
}

/// Flips `abandoned` on drop. Only matters if it drops while the spawned
/// acquire task is still in flight (i.e. this future itself got cancelled);
/// once the task has already observed the flag, setting it later is a no-op.
struct AbandonOnDrop {
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }
}

struct DecrementExWaiting {
    lock: Arc<PathLock>,
}

impl Drop for DecrementExWaiting {
    fn drop(&mut self) {
        let mut inner = self.lock.state.lock().unwrap();
        inner.ex_waiting = inner.ex_waiting.saturating_sub(1);
        drop(inner);
        self.lock.notify.notify_waiters();
    }
}

/// A held lock. Releasing is purely an in-process state update when other
/// shared holders remain; the last holder out also tells the OS thread to
/// drop its `flock` and, for the exclusive case, to unlink the lock file if
/// nothing else grabbed it in the interim.
pub struct LockGuard {
    lock: Arc<PathLock>,
    #[allow(dead_code)]
    exclusive: bool,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut inner = self.lock.state.lock().unwrap();
        inner.holders = inner.holders.saturating_sub(1);
        if inner.holders == 0 {
            inner.mode = Mode::Idle;
            let _ = self.lock.os_tx.send(OsRequest::Release);
        }
        drop(inner);
        self.lock.notify.notify_waiters();
    }
}

/// Registry of per-path locks. Each path's `PathLock` (and its dedicated OS
/// thread) lives for the remainder of the process once first touched; we
/// accept that small, bounded cost in exchange for never having to
/// coordinate thread teardown with in-flight acquisitions.
pub struct LockManager {
    locks: Mutex<HashMap<PathBuf, Arc<PathLock>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, path: &Path) -> Result<Arc<PathLock>, Error> {
        if let Some(existing) = self.locks.lock().unwrap().get(path) {
            return Ok(existing.clone());
        }

        // Racing callers may both build a PathLock for the same never-seen
        // path; the loser's thread and channel are simply dropped. Cheap,
        // and it keeps the map's mutex held only for quick operations.
        let path_owned = path.to_path_buf();
        let built = tokio::task::spawn_blocking(move || spawn_path_lock(path_owned))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;

        let mut locks = self.locks.lock().unwrap();
        let entry = locks.entry(path.to_path_buf()).or_insert(built);
        Ok(entry.clone())
    }

    pub async fn acquire_shared(&self, path: &Path) -> Result<LockGuard, Error> {
        let lock = self.get_or_create(path).await?;
        lock.acquire(false).await
    }

    pub async fn acquire_exclusive(&self, path: &Path) -> Result<LockGuard, Error> {
        let lock = self.get_or_create(path).await?;
        lock.acquire(true).await
    }
}

fn spawn_path_lock(path: PathBuf) -> Result<Arc<PathLock>, Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)?;

    let (os_tx, os_rx) = mpsc::channel::<OsRequest>();

    std::thread::Builder::new()
        .name(format!("git-cdn-lock-{}", path.display()))
        .spawn(move || run_os_lock_thread(file, path, os_rx))
        .map_err(Error::Io)?;

    Ok(Arc::new(PathLock {
        state: Mutex::new(Inner {
            mode: Mode::Idle,
            holders: 0,
            ex_waiting: 0,
        }),
        notify: Notify::new(),
        os_tx,
    }))
}

/// Body of the dedicated per-path OS thread. Owns the `fd_lock::RwLock<File>`
/// for its entire lifetime; guards never cross a thread boundary.
fn run_os_lock_thread(file: std::fs::File, path: PathBuf, rx: mpsc::Receiver<OsRequest>) {
    let mut rw = fd_lock::RwLock::new(file);

    while let Ok(req) = rx.recv() {
        match req {
            OsRequest::AcquireShared(reply) => {
                let guard = match rw.read() {
                    Ok(g) => g,
                    Err(_) => return,
                };
                let _ = reply.send(());
                // Block until told to release.
                if wait_for_release(&rx).is_break() {
                    drop(guard);
                    return;
                }
                drop(guard);
            }
            OsRequest::AcquireExclusive(reply) => {
                let guard = match rw.write() {
                    Ok(g) => g,
                    Err(_) => return,
                };
                let _ = reply.send(());
                if wait_for_release(&rx).is_break() {
                    drop(guard);
                    return;
                }
                drop(guard);
                // Uncontended on the way out: nobody else is holding or
                // waiting on the OS lock, so the lock file can be unlinked.
                if let Ok(probe) = rw.try_write() {
                    drop(probe);
                    let _ = std::fs::remove_file(&path);
                }
            }
            OsRequest::Release => {
                // A release with nothing held is a protocol error on our
                // part; ignore it rather than panic the lock thread.
            }
        }
    }
}

/// Blocks waiting specifically for a `Release` message. Returns
/// `ControlFlow::Break` if the channel closed (process shutting down) so the
/// caller knows to stop the thread instead of looping forever.
fn wait_for_release(rx: &mpsc::Receiver<OsRequest>) -> std::ops::ControlFlow<()> {
    loop {
        match rx.recv() {
            Ok(OsRequest::Release) => return std::ops::ControlFlow::Continue(()),
            Ok(_other) => continue,
            Err(_) => return std::ops::ControlFlow::Break(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn shared_locks_can_be_held_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let manager = LockManager::new();

        let g1 = manager.acquire_shared(&path).await.unwrap();
        let g2 = tokio::time::timeout(Duration::from_millis(200), manager.acquire_shared(&path))
            .await
            .expect("shared acquire should not block behind another shared holder")
            .unwrap();
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn exclusive_excludes_other_holders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let manager = Arc::new(LockManager::new());

        let ex = manager.acquire_exclusive(&path).await.unwrap();

        let m2 = manager.clone();
        let p2 = path.clone();
        let waiter = tokio::spawn(async move { m2.acquire_shared(&p2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(ex);
        let second = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn exclusive_waiter_blocks_new_shared_acquisitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let manager = Arc::new(LockManager::new());

        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));

        let shared_holder = manager.acquire_shared(&path).await.unwrap();

        let m_ex = manager.clone();
        let p_ex = path.clone();
        let order_ex = order.clone();
        let counter_ex = counter.clone();
        let ex_task = tokio::spawn(async move {
            let g = m_ex.acquire_exclusive(&p_ex).await.unwrap();
            order_ex
                .lock()
                .unwrap()
                .push(("exclusive", counter_ex.fetch_add(1, Ordering::SeqCst)));
            g
        });

        // give the exclusive waiter time to register its ex_waiting intent
        tokio::time::sleep(Duration::from_millis(30)).await;

        let m_sh = manager.clone();
        let p_sh = path.clone();
        let order_sh = order.clone();
        let counter_sh = counter.clone();
        let sh_task = tokio::spawn(async move {
            let g = m_sh.acquire_shared(&p_sh).await.unwrap();
            order_sh
                .lock()
                .unwrap()
                .push(("shared", counter_sh.fetch_add(1, Ordering::SeqCst)));
            g
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(shared_holder);

        let ex_guard = tokio::time::timeout(Duration::from_millis(500), ex_task)
            .await
            .unwrap()
            .unwrap();
        drop(ex_guard);
        let _sh_guard = tokio::time::timeout(Duration::from_millis(500), sh_task)
            .await
            .unwrap()
            .unwrap();

        let recorded = order.lock().unwrap();
        assert_eq!(recorded[0].0, "exclusive");
        assert_eq!(recorded[1].0, "shared");
    }

    #[tokio::test]
    async fn cancelled_waiter_still_releases_once_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let manager = Arc::new(LockManager::new());

        let ex = manager.acquire_exclusive(&path).await.unwrap();

        let m2 = manager.clone();
        let p2 = path.clone();
        let fut = tokio::spawn(async move {
            let acquire = m2.acquire_exclusive(&p2);
            tokio::time::timeout(Duration::from_millis(20), acquire).await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(ex);

        // the waiter's outer timeout fires and drops the acquire future
        // before it resolves; the lock must still become available after.
        let _ = fut.await;

        let g = tokio::time::timeout(Duration::from_millis(500), manager.acquire_exclusive(&path))
            .await
            .expect("lock must not be left held by an abandoned acquirer")
            .unwrap();
        drop(g);
    }
}
