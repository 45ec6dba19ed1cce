//! Guarded memory for session secrets.
//!
//! The session's key material and hot box live on dedicated pages that are
//! pinned to physical memory (`mlock`), excluded from core dumps where the
//! platform supports it, and mapped `PROT_NONE` whenever no public call is
//! in flight. [`Guarded::unlock`] flips the pages read-write and returns an
//! RAII guard; dropping the guard restores no-access, so every exit path of
//! a public call — including error paths — relocks. Dropping the region
//! itself zeroes the pages before unmapping them.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use zeroize::Zeroize;

use crate::error::{VaultError, VaultResult};

/// Disables core dumps for the process.
///
/// Called once at session init so key material can never land in a dump.
///
/// # Errors
///
/// Returns [`VaultError::Syscall`] if the rlimit cannot be lowered.
pub fn disable_core_dumps() -> VaultResult<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain syscall with a stack-local argument.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if rc != 0 {
        return Err(VaultError::syscall("setrlimit(RLIMIT_CORE)"));
    }
    Ok(())
}

/// A page-backed, mlocked allocation that is inaccessible at rest.
///
/// `T` must be plain data: no heap pointers, no destructor side effects that
/// matter, because the region is wiped bytewise on drop. The engine stores
/// fixed-size arrays only.
pub struct Guarded<T> {
    ptr: NonNull<u8>,
    region_len: usize,
    _marker: PhantomData<T>,
}

impl<T> Guarded<T> {
    /// Allocates a guarded region holding `value`.
    ///
    /// The pages come back `PROT_NONE`; use [`Guarded::unlock`] to access
    /// the value.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Memory`] if mapping, locking, or protecting
    /// the pages fails.
    pub fn new(value: T) -> VaultResult<Self> {
        // SAFETY: sysconf has no memory-safety preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            return Err(VaultError::memory("sysconf(_SC_PAGESIZE)"));
        }
        #[allow(clippy::cast_sign_loss)]
        let page = page as usize;
        let region_len = std::mem::size_of::<T>().div_ceil(page).max(1) * page;

        // SAFETY: anonymous private mapping; no file descriptor involved.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                region_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(VaultError::memory("mmap of guarded region"));
        }

        // SAFETY: `raw` is a fresh mapping of `region_len` bytes.
        unsafe {
            if libc::mlock(raw, region_len) != 0 {
                libc::munmap(raw, region_len);
                return Err(VaultError::memory("mlock of guarded region"));
            }
            // Keep the pages out of core dumps as well; advisory, so a
            // failure is not fatal (RLIMIT_CORE is already zero).
            #[cfg(target_os = "linux")]
            libc::madvise(raw, region_len, libc::MADV_DONTDUMP);

            std::ptr::write(raw.cast::<T>(), value);

            if libc::mprotect(raw, region_len, libc::PROT_NONE) != 0 {
                let bytes = std::slice::from_raw_parts_mut(raw.cast::<u8>(), region_len);
                bytes.zeroize();
                libc::munlock(raw, region_len);
                libc::munmap(raw, region_len);
                return Err(VaultError::memory("mprotect(PROT_NONE)"));
            }
        }

        Ok(Self {
            // SAFETY: mmap success excludes null.
            ptr: unsafe { NonNull::new_unchecked(raw.cast::<u8>()) },
            region_len,
            _marker: PhantomData,
        })
    }

    /// Makes the region read-write and returns an access guard.
    ///
    /// The region returns to no-access when the guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Memory`] if the pages cannot be re-protected.
    pub fn unlock(&mut self) -> VaultResult<GuardedMut<'_, T>> {
        // SAFETY: `ptr` is a live mapping of `region_len` bytes.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast(),
                self.region_len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(VaultError::memory("mprotect(PROT_READ|PROT_WRITE)"));
        }
        Ok(GuardedMut { region: self })
    }
}

impl<T> Drop for Guarded<T> {
    fn drop(&mut self) {
        let raw = self.ptr.as_ptr().cast::<libc::c_void>();
        // SAFETY: `raw` is the live mapping created in `new`. The pages are
        // made writable, wiped, unlocked, and unmapped exactly once.
        unsafe {
            if libc::mprotect(raw, self.region_len, libc::PROT_READ | libc::PROT_WRITE) == 0 {
                let bytes = std::slice::from_raw_parts_mut(raw.cast::<u8>(), self.region_len);
                bytes.zeroize();
            } else {
                log::warn!("guarded region could not be unprotected for wiping");
            }
            libc::munlock(raw, self.region_len);
            libc::munmap(raw, self.region_len);
        }
    }
}

/// RAII access to an unlocked [`Guarded`] region.
pub struct GuardedMut<'a, T> {
    region: &'a mut Guarded<T>,
}

impl<T> Deref for GuardedMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard's existence proves the pages are readable.
        unsafe { self.region.ptr.cast::<T>().as_ref() }
    }
}

impl<T> DerefMut for GuardedMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard's existence proves the pages are writable, and
        // `&mut self` excludes aliasing.
        unsafe { self.region.ptr.cast::<T>().as_mut() }
    }
}

impl<T> Drop for GuardedMut<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the mapping outlives the guard.
        let rc = unsafe {
            libc::mprotect(
                self.region.ptr.as_ptr().cast(),
                self.region.region_len,
                libc::PROT_NONE,
            )
        };
        if rc != 0 {
            log::warn!("guarded region could not be returned to no-access");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_lock_cycles() {
        let mut region = Guarded::new([0u8; 64]).unwrap();
        {
            let mut bytes = region.unlock().unwrap();
            bytes[0] = 0xAA;
            bytes[63] = 0x55;
        }
        let bytes = region.unlock().unwrap();
        assert_eq!(bytes[0], 0xAA);
        assert_eq!(bytes[63], 0x55);
    }

    #[test]
    fn test_holds_larger_than_page_values() {
        struct Big {
            a: [u8; 5000],
            b: u32,
        }
        let mut region = Guarded::new(Big { a: [7u8; 5000], b: 42 }).unwrap();
        let mut guard = region.unlock().unwrap();
        assert_eq!(guard.a[4999], 7);
        assert_eq!(guard.b, 42);
        guard.b = 43;
        drop(guard);
        assert_eq!(region.unlock().unwrap().b, 43);
    }

    #[test]
    fn test_disable_core_dumps() {
        disable_core_dumps().unwrap();
    }
}
