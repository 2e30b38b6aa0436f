//! Process-wide socket subsystem bootstrap.
//!
//! Some platforms require the socket library to be initialized before any
//! socket is created and torn down after the last one is closed. Every
//! [`FrameReceiver`](crate::receiver::FrameReceiver) holds a
//! [`SocketLibraryGuard`]; the first acquire initializes the subsystem and
//! dropping the last guard releases it.

use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Failure to bring up the platform socket subsystem.
#[derive(Error, Debug)]
pub enum SocketLibraryError {
    #[error("socket library startup failed with code {0}")]
    Startup(i32),

    #[error("socket library state poisoned")]
    Poisoned,
}

static REFCOUNT: Mutex<usize> = Mutex::new(0);

/// Handle to the reference-counted socket subsystem.
pub struct SocketLibrary;

impl SocketLibrary {
    /// Acquires a reference, initializing the subsystem on first use.
    pub fn acquire() -> Result<SocketLibraryGuard, SocketLibraryError> {
        retain(&REFCOUNT, platform::startup)?;
        Ok(SocketLibraryGuard { _private: () })
    }

    /// Number of live guards.
    pub fn active() -> usize {
        REFCOUNT.lock().map(|count| *count).unwrap_or(0)
    }
}

/// Keeps the socket subsystem alive while held.
#[must_use = "the socket library is released when the guard is dropped"]
pub struct SocketLibraryGuard {
    _private: (),
}

impl std::fmt::Debug for SocketLibraryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLibraryGuard").finish()
    }
}

impl Drop for SocketLibraryGuard {
    fn drop(&mut self) {
        release(&REFCOUNT, platform::cleanup);
    }
}

/// Takes a reference on `count`, running `startup` for the first one.
fn retain(
    count: &Mutex<usize>,
    startup: impl FnOnce() -> Result<(), SocketLibraryError>,
) -> Result<(), SocketLibraryError> {
    let mut count = count.lock().map_err(|_| SocketLibraryError::Poisoned)?;
    if *count == 0 {
        startup()?;
        debug!("socket library initialized");
    }
    *count += 1;
    Ok(())
}

/// Drops a reference on `count`, running `cleanup` when it was the last.
fn release(count: &Mutex<usize>, cleanup: impl FnOnce()) {
    let mut count = match count.lock() {
        Ok(count) => count,
        Err(poisoned) => poisoned.into_inner(),
    };
    if *count == 0 {
        return;
    }
    *count -= 1;
    if *count == 0 {
        cleanup();
        debug!("socket library released");
    }
}

#[cfg(windows)]
mod platform {
    use super::SocketLibraryError;
    use windows_sys::Win32::Networking::WinSock::{WSACleanup, WSAStartup, WSADATA};

    const WINSOCK_2_2: u16 = 0x0202;

    pub(super) fn startup() -> Result<(), SocketLibraryError> {
        // SAFETY: WSADATA is plain data; WSAStartup only writes into it.
        let rc = unsafe {
            let mut data: WSADATA = std::mem::zeroed();
            WSAStartup(WINSOCK_2_2, &mut data)
        };
        if rc != 0 {
            tracing::error!(code = rc, "WSAStartup failed");
            return Err(SocketLibraryError::Startup(rc));
        }
        Ok(())
    }

    pub(super) fn cleanup() {
        // SAFETY: paired with a successful WSAStartup in `startup`.
        unsafe {
            WSACleanup();
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::SocketLibraryError;

    pub(super) fn startup() -> Result<(), SocketLibraryError> {
        Ok(())
    }

    pub(super) fn cleanup() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guards_are_counted() {
        let first = SocketLibrary::acquire().unwrap();
        let second = SocketLibrary::acquire().unwrap();
        assert!(SocketLibrary::active() >= 2);
        drop(first);
        assert!(SocketLibrary::active() >= 1);
        drop(second);
    }

    #[test]
    fn test_startup_once_and_cleanup_on_last_release() {
        let count = Mutex::new(0);
        let startups = Cell::new(0);
        let cleanups = Cell::new(0);
        let startup = || {
            startups.set(startups.get() + 1);
            Ok(())
        };

        retain(&count, startup).unwrap();
        retain(&count, startup).unwrap();
        retain(&count, startup).unwrap();
        assert_eq!(startups.get(), 1);
        assert_eq!(*count.lock().unwrap(), 3);

        release(&count, || cleanups.set(cleanups.get() + 1));
        release(&count, || cleanups.set(cleanups.get() + 1));
        assert_eq!(cleanups.get(), 0);
        release(&count, || cleanups.set(cleanups.get() + 1));
        assert_eq!(cleanups.get(), 1);
        assert_eq!(*count.lock().unwrap(), 0);

        // Next acquire starts the library again.
        retain(&count, startup).unwrap();
        assert_eq!(startups.get(), 2);
    }

    #[test]
    fn test_failed_startup_takes_no_reference() {
        let count = Mutex::new(0);
        let err = retain(&count, || Err(SocketLibraryError::Startup(10091))).unwrap_err();

        assert!(matches!(err, SocketLibraryError::Startup(10091)));
        assert_eq!(*count.lock().unwrap(), 0);

        let cleanups = Cell::new(0);
        release(&count, || cleanups.set(cleanups.get() + 1));
        assert_eq!(cleanups.get(), 0);
    }
}
