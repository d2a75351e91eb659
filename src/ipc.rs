//! The IPC region (§4.5, §9): a fixed-layout shared-memory segment holding run-status,
//! active-worker count, the slot occupancy table, and an opaque application key/value map,
//! protected by a single named mutex.
//!
//! Grounded on `somatechlat-vortex`'s `vortex-core::shm` module, the closest sibling example in
//! this corpus for mapping a `#[repr(C)]` header into POSIX shared memory via `nix`'s
//! `shm_open`/`mmap`/`ftruncate` wrappers. Unlike that example, the mutual-exclusion primitive
//! here is a named POSIX semaphore (`libc::sem_open`/`sem_wait`/`sem_post`) rather than a
//! lock-free atomics-only design, because this spec requires genuine multi-field critical
//! sections (§4.5: "callers mutating more than one logical field... must hold the mutex across
//! the full operation").
//!
//! Because workers are `fork()`ed directly from the supervisor *after* the region and semaphore
//! are mapped, they inherit the same `MAP_SHARED` mapping and the same semaphore handle for
//! free — no separate "attach" step is needed in a worker. Only the supervisor ever calls
//! [`IpcRegion::create`] or [`IpcRegion::destroy`].

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, msync, shm_open, shm_unlink, MapFlags, MsFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{ResultExt, Severity};

/// Upper bound on concurrently trackable slots. A `repr(C)` fixed array, not a growable
/// collection, since the whole point of this struct is a stable shared-memory layout.
pub const MAX_SLOTS: usize = 256;

/// Upper bound on live application variables.
pub const MAX_APP_VARS: usize = 64;
/// Upper bound on an app-var key's encoded length.
pub const MAX_APP_VAR_KEY: usize = 64;
/// Upper bound on an app-var value's encoded length.
pub const MAX_APP_VAR_VALUE: usize = 1024;

const MAGIC: u64 = 0x4a4f_4253_5550_0001; // "JOBSUP" + version 1

/// `run_status` (§3): monotonic RUN → TERMINATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunStatus {
    Run = 0,
    Terminate = 1,
}

impl RunStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => RunStatus::Terminate,
            _ => RunStatus::Run,
        }
    }
}

/// One slot's occupancy, as seen through shared memory. The owning worker's pid is deliberately
/// *not* stored here — it lives only in the supervisor's local map (§3 `Slot` entity) so that a
/// worker that re-reads this region never mistakes itself for another slot's owner.
#[repr(C)]
struct SlotRecord {
    occupied: AtomicU32,
}

/// A stored application variable. One reserved discriminator byte resolves the spec's own open
/// question about opportunistic deserialization being ambiguous (§4.5, §9): every entry is
/// tagged, even though today there is only one tag, so a future format change doesn't have to
/// guess at what's already stored.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Bytes = 0,
}

#[repr(C)]
struct AppVarEntry {
    in_use: AtomicU32,
    tag: AtomicU32,
    key_len: AtomicU32,
    value_len: AtomicU32,
    key: [std::sync::atomic::AtomicU8; MAX_APP_VAR_KEY],
    value: [std::sync::atomic::AtomicU8; MAX_APP_VAR_VALUE],
}

#[repr(C)]
struct IpcLayout {
    magic: AtomicU64,
    run_status: AtomicU32,
    active_count: AtomicU32,
    slots: [SlotRecord; MAX_SLOTS],
    app_vars: [AppVarEntry; MAX_APP_VARS],
}

/// Size of the fixed-layout region. `SupervisorConfig::ipc_size` defaults to this.
pub const DEFAULT_IPC_SIZE: usize = std::mem::size_of::<IpcLayout>();

/// An RAII handle to the shared-memory region and its governing mutex.
///
/// Only the process that called [`IpcRegion::create`] should call [`IpcRegion::destroy`]; forked
/// workers share the same mapping and semaphore without any extra setup, and must never destroy
/// it (§4.3 orphan-suicide policy depends on this).
pub struct IpcRegion {
    ptr: NonNull<IpcLayout>,
    size: usize,
    sem: *mut libc::sem_t,
    shm_name: CString,
    sem_name: CString,
}

unsafe impl Send for IpcRegion {}
unsafe impl Sync for IpcRegion {}

/// Holds the named mutex for as long as it's alive. Multi-field operations should keep one of
/// these around for their whole critical section (§4.5).
pub struct IpcGuard<'a> {
    region: &'a IpcRegion,
}

impl Drop for IpcGuard<'_> {
    fn drop(&mut self) {
        if unsafe { libc::sem_post(self.region.sem) } != 0 {
            // Releasing a held mutex should never fail; if it does, the region's invariants are
            // no longer trustworthy. There's no good way to recover mid-`Drop`, so this is one of
            // the few places in the crate that logs rather than propagates.
            tracing::event!(tracing::Level::ERROR, "sem_post failed releasing IPC mutex");
        }
    }
}

impl IpcRegion {
    /// Derives a stable name for the shared region and its mutex from `lock_file_path` (§6 "IPC
    /// key derivation"): recreating a supervisor with the same lock-file path reuses the same
    /// region, colliding with (and clobbering) a stale instance's state as intended.
    fn derive_names(lock_file_path: &Path) -> (CString, CString) {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325; // FNV-1a offset basis
        for byte in lock_file_path.as_os_str().as_encoded_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        // One-byte "project id" folded into the hash input, per §6.
        hash ^= 0x4a; // b'J'
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);

        let shm_name = CString::new(format!("/jobsv-{hash:016x}")).unwrap();
        let sem_name = CString::new(format!("/jobsv-{hash:016x}-mtx")).unwrap();
        (shm_name, sem_name)
    }

    /// Creates (or re-creates, colliding with any stale instance) the shared region and its
    /// mutex, and initializes `run_status=RUN`, `active_count=0`, an empty slot table, and an
    /// empty app-var map (§4.1 step 5).
    pub fn create(lock_file_path: &Path, size: usize) -> Result<Self> {
        let size = size.max(DEFAULT_IPC_SIZE);
        let (shm_name, sem_name) = Self::derive_names(lock_file_path);

        let fd = shm_open(
            shm_name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .with_context(|| format!("shm_open({shm_name:?}) failed"))
        .with_severity(Severity::StartupFatal)?;

        ftruncate(&fd, size as i64)
            .context("ftruncate of shared region failed")
            .with_severity(Severity::StartupFatal)?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| anyhow!("zero-sized IPC region"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .context("mmap of shared region failed")
        .with_severity(Severity::StartupFatal)?;

        // A stale semaphore left behind by a crashed supervisor could be stuck decremented to 0,
        // which would deadlock every future startup at the same lock-file path. Unlink it first
        // so we always start from a fresh, unlocked mutex, matching the "recreate collides with
        // a stale instance as intended" semantics of §6.
        unsafe {
            libc::sem_unlink(sem_name.as_ptr());
        }
        let sem = unsafe {
            libc::sem_open(
                sem_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::mode_t,
                1u32,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(std::io::Error::last_os_error())
                .context("sem_open failed")
                .with_severity(Severity::StartupFatal);
        }

        let ptr = ptr.as_ptr() as *mut IpcLayout;
        let region = IpcRegion {
            ptr: NonNull::new(ptr).ok_or_else(|| anyhow!("mmap returned null"))?,
            size,
            sem,
            shm_name,
            sem_name,
        };

        region.layout().magic.store(MAGIC, Ordering::SeqCst);
        region.layout().run_status.store(RunStatus::Run as u32, Ordering::SeqCst);
        region.layout().active_count.store(0, Ordering::SeqCst);
        for slot in region.layout().slots.iter() {
            slot.occupied.store(0, Ordering::SeqCst);
        }
        for entry in region.layout().app_vars.iter() {
            entry.in_use.store(0, Ordering::SeqCst);
        }

        Ok(region)
    }

    fn layout(&self) -> &IpcLayout {
        unsafe { self.ptr.as_ref() }
    }

    /// Acquires the named mutex. Blocks the calling thread (there is exactly one per process
    /// that matters here: the supervisor's dispatcher, or a worker's brief slot-release).
    ///
    /// Mutex acquisition failure is loop-fatal per §5/§7 ("the process can no longer reason
    /// about the shared state"), not process-fatal: it is returned as a
    /// [`Severity::LoopFatal`]-tagged error rather than a panic, so the caller's teardown path
    /// (removing the lock file, destroying the region) still runs instead of being skipped by an
    /// unwind.
    pub fn lock(&self) -> Result<IpcGuard<'_>> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem) };
            if rc == 0 {
                return Ok(IpcGuard { region: self });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err)
                    .context("sem_wait failed acquiring IPC mutex")
                    .with_severity(Severity::LoopFatal);
            }
        }
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_raw(self.layout().run_status.load(Ordering::SeqCst))
    }

    /// §3: `run_status` is monotonic RUN → TERMINATE. A store that would move it back from
    /// `Terminate` to `Run` is silently dropped rather than applied, so §8's "absorbing" property
    /// holds even if an embedder (mis)calls `set_run_status(Run)` after termination has begun.
    pub fn set_run_status(&self, status: RunStatus) {
        self.layout()
            .run_status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if RunStatus::from_raw(current) == RunStatus::Terminate && status == RunStatus::Run {
                    None
                } else {
                    Some(status as u32)
                }
            })
            .ok();
    }

    pub fn active_count(&self) -> u32 {
        self.layout().active_count.load(Ordering::SeqCst)
    }

    pub fn set_active_count(&self, count: u32) {
        self.layout().active_count.store(count, Ordering::SeqCst);
    }

    pub fn increment_active_count(&self) -> u32 {
        self.layout().active_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements `active_count`, clamped at 0. Callers only ever decrement a count they (or a
    /// sibling worker) previously incremented, so this should never actually saturate; the clamp
    /// is defensive so a bug elsewhere can't underflow the counter into a panic.
    pub fn decrement_active_count(&self) -> u32 {
        self.layout()
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }

    /// Panics (via the underlying array index) if `index >= MAX_SLOTS`; callers must bound their
    /// scans by [`MAX_SLOTS`] first, which [`crate::slots::SlotTable`] does.
    pub fn slot_occupied(&self, index: usize) -> bool {
        debug_assert!(index < MAX_SLOTS, "slot index {index} out of range");
        self.layout().slots[index].occupied.load(Ordering::SeqCst) != 0
    }

    /// Panics (via the underlying array index) if `index >= MAX_SLOTS`; see [`Self::slot_occupied`].
    pub fn set_slot_occupied(&self, index: usize, occupied: bool) {
        debug_assert!(index < MAX_SLOTS, "slot index {index} out of range");
        self.layout().slots[index]
            .occupied
            .store(occupied as u32, Ordering::SeqCst);
    }

    /// Stores `value` under `name`, tagged as an opaque byte blob (§4.5). `lock` controls whether
    /// this call acquires the mutex itself or assumes the caller already holds it for a
    /// multi-step transaction.
    pub fn set_app_var(&self, name: &str, value: &[u8], lock: bool) -> Result<()> {
        let _guard = if lock { Some(self.lock()?) } else { None };
        if name.len() > MAX_APP_VAR_KEY {
            return Err(anyhow!("app-var name exceeds {MAX_APP_VAR_KEY} bytes"));
        }
        if value.len() > MAX_APP_VAR_VALUE {
            return Err(anyhow!("app-var value exceeds {MAX_APP_VAR_VALUE} bytes"));
        }

        let slot = self
            .find_app_var(name)
            .or_else(|| self.find_free_app_var())
            .ok_or_else(|| anyhow!("app-var table is full ({MAX_APP_VARS} entries)"))?;

        let entry = &self.layout().app_vars[slot];
        for (i, b) in name.as_bytes().iter().enumerate() {
            entry.key[i].store(*b, Ordering::SeqCst);
        }
        for (i, b) in value.iter().enumerate() {
            entry.value[i].store(*b, Ordering::SeqCst);
        }
        entry.key_len.store(name.len() as u32, Ordering::SeqCst);
        entry.value_len.store(value.len() as u32, Ordering::SeqCst);
        entry.tag.store(ValueTag::Bytes as u32, Ordering::SeqCst);
        entry.in_use.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// Reads back the byte blob stored under `name`, if any (§4.5, §8 round-trip property).
    pub fn get_app_var(&self, name: &str, lock: bool) -> Result<Option<Vec<u8>>> {
        let _guard = if lock { Some(self.lock()?) } else { None };
        let Some(slot) = self.find_app_var(name) else {
            return Ok(None);
        };
        let entry = &self.layout().app_vars[slot];
        let len = entry.value_len.load(Ordering::SeqCst) as usize;
        Ok(Some(entry.value[..len].iter().map(|b| b.load(Ordering::SeqCst)).collect()))
    }

    fn find_app_var(&self, name: &str) -> Option<usize> {
        self.layout().app_vars.iter().position(|entry| {
            entry.in_use.load(Ordering::SeqCst) != 0
                && entry.key_len.load(Ordering::SeqCst) as usize == name.len()
                && entry.key[..name.len()]
                    .iter()
                    .map(|b| b.load(Ordering::SeqCst))
                    .eq(name.bytes())
        })
    }

    fn find_free_app_var(&self) -> Option<usize> {
        self.layout()
            .app_vars
            .iter()
            .position(|entry| entry.in_use.load(Ordering::SeqCst) == 0)
    }

    /// Flushes the region to its backing shared-memory object. Not required for cross-process
    /// visibility (that's handled by the mutex and `MAP_SHARED`), but useful before teardown.
    fn sync(&self) {
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr() as *mut _) };
        let _ = unsafe { msync(ptr, self.size, MsFlags::MS_SYNC) };
    }

    /// Detaches and destroys the region: unmaps the memory, removes the mutex, and unlinks the
    /// shared-memory object. Only the supervisor calls this, as the final step of teardown
    /// (§4.1). Takes `&self` rather than consuming the region because the supervisor's live
    /// handle is shared (via [`crate::supervisor::ControlSurface`]) with the embedding
    /// application for the lifetime of the run, so there is no single owner to move out of.
    pub fn destroy(&self) {
        self.sync();
        unsafe {
            let _ = nix::sys::mman::munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            libc::sem_close(self.sem);
            libc::sem_unlink(self.sem_name.as_ptr());
        }
        let _ = shm_unlink(self.shm_name.as_c_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn app_var_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc-test-1.pid");
        let region = IpcRegion::create(&path, DEFAULT_IPC_SIZE).unwrap();
        region.set_app_var("greeting", b"hello", true).unwrap();
        assert_eq!(region.get_app_var("greeting", true).unwrap(), Some(b"hello".to_vec()));
        region.destroy();
    }

    #[test]
    fn run_status_is_absorbing_once_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc-test-2.pid");
        let region = IpcRegion::create(&path, DEFAULT_IPC_SIZE).unwrap();
        assert_eq!(region.run_status(), RunStatus::Run);
        region.set_run_status(RunStatus::Terminate);
        assert_eq!(region.run_status(), RunStatus::Terminate);
        // §3/§8: monotonic and absorbing — a later attempt to go back to RUN is dropped.
        region.set_run_status(RunStatus::Run);
        assert_eq!(region.run_status(), RunStatus::Terminate);
        region.destroy();
    }

    #[test]
    fn active_count_tracks_slot_claims() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc-test-3.pid");
        let region = IpcRegion::create(&path, DEFAULT_IPC_SIZE).unwrap();
        assert_eq!(region.active_count(), 0);
        assert_eq!(region.increment_active_count(), 1);
        assert_eq!(region.decrement_active_count(), 0);
        region.destroy();
    }

    #[test]
    fn recreating_with_same_path_collides_with_stale_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc-test-4.pid");
        let first = IpcRegion::create(&path, DEFAULT_IPC_SIZE).unwrap();
        first.set_app_var("x", b"1", true).unwrap();
        // Simulate a crash: don't call destroy(), just drop it.
        drop(first);
        let second = IpcRegion::create(&path, DEFAULT_IPC_SIZE).unwrap();
        // Re-creation re-initializes state rather than inheriting the stale value.
        assert_eq!(second.get_app_var("x", true).unwrap(), None);
        second.destroy();
    }
}
