//! Locked-memory storage for credential bytes
//!
//! Secrets copied out of greeter messages live here for the short window
//! between arrival and being handed to the PAM conversation. The backing
//! allocation is mlock'd so it cannot be paged to disk, and is wiped with
//! volatile writes before the pages are unlocked and freed.

use std::ptr;

/// A fixed-capacity byte buffer backed by locked pages.
pub struct SecureBuffer {
    data: Vec<u8>,
    locked: bool,
}

impl SecureBuffer {
    /// Allocate a buffer holding a copy of `bytes`, locked into memory.
    ///
    /// mlock can fail for unprivileged processes with a small
    /// RLIMIT_MEMLOCK; the copy still works, it just loses the paging
    /// guarantee, matching the behavior of an optional lock-memory setting.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = Vec::with_capacity(bytes.len().max(1));
        data.extend_from_slice(bytes);

        let locked = unsafe { libc::mlock(data.as_ptr() as *const libc::c_void, data.capacity()) } == 0;

        Self { data, locked }
    }

    pub fn from_str(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    /// Take ownership of a secret that arrived as a plain string, wiping
    /// the source so only the locked copy remains.
    pub fn from_string(mut s: String) -> Self {
        let buf = Self::from_bytes(s.as_bytes());
        wipe_string(&mut s);
        buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the mlock actually took effect.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Wipe the contents now, without waiting for drop.
    pub fn wipe(&mut self) {
        wipe_slice(&mut self.data);
        self.data.clear();
    }
}

impl PartialEq for SecureBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for SecureBuffer {}

// Never print the contents, even in debug output.
impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBuffer({} bytes)", self.data.len())
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        wipe_slice(&mut self.data);
        if self.locked {
            unsafe {
                libc::munlock(self.data.as_ptr() as *const libc::c_void, self.data.capacity());
            }
        }
    }
}

/// Zero a string's bytes in place. For secrets that arrive as plain
/// strings from a wire read and must not linger after use.
pub fn wipe_string(s: &mut String) {
    unsafe {
        wipe_slice(s.as_bytes_mut());
    }
    s.clear();
}

/// Overwrite a byte slice with zeros using volatile writes so the compiler
/// cannot elide the stores.
pub fn wipe_slice(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        unsafe {
            ptr::write_volatile(b, 0);
        }
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

/// Lock the entire address space of the current process, present and
/// future, so password-bearing memory never hits swap. Used by the session
/// child; requires privilege (or CAP_IPC_LOCK).
pub fn lock_process_memory() -> bool {
    unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let buf = SecureBuffer::from_str("hunter2");
        assert_eq!(buf.as_bytes(), b"hunter2");
        assert_eq!(buf.len(), 7);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_empty_secret() {
        let buf = SecureBuffer::from_bytes(b"");
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_wipe_clears_contents() {
        let mut buf = SecureBuffer::from_str("correct horse battery staple");
        buf.wipe();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wipe_slice_zeroes() {
        let mut bytes = *b"secret";
        wipe_slice(&mut bytes);
        assert_eq!(&bytes, &[0u8; 6]);
    }
}
