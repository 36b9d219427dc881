// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Abrupt device removal.
//!
//! When the device disappears the driver hangs up the control path and
//! the process receives `SIGHUP`. At that point queues, pools and locks
//! may be in any state, so the handler touches none of them: it stores a
//! fixed value into the control register, whose address was captured and
//! checked at install time, and exits.
//!
//! The guard is process-wide and one-shot (`SA_RESETHAND`). Only one
//! channel can hold it at a time.

use crate::error::{DmaError, DmaResult};
use crate::regs::{ChannelRegisters, SHUTDOWN_CONTROL};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

/// Control register the handler writes. Null while no guard is installed.
static CONTROL_REGISTER: AtomicPtr<u32> = AtomicPtr::new(ptr::null_mut());

/// Disposition replaced by the installed guard.
static PREVIOUS_ACTION: Mutex<Option<libc::sigaction>> = Mutex::new(None);

/// Exit status used after a hot removal.
const EXIT_DEVICE_REMOVED: libc::c_int = 128 + libc::SIGHUP;

extern "C" fn on_hangup(_sig: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // Async-signal context: one atomic load, one volatile store, _exit.
    let reg = CONTROL_REGISTER.load(Ordering::SeqCst);
    if !reg.is_null() {
        // SAFETY: the pointer was taken from a live register mapping at
        // install time and is cleared before that mapping is released.
        unsafe { ptr::write_volatile(reg, SHUTDOWN_CONTROL) };
    }
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(EXIT_DEVICE_REMOVED) }
}

/// Installed `SIGHUP` handler that stops a channel's dispatcher.
///
/// Dropping the guard restores the previous handler.
#[derive(Debug)]
pub struct HotRemovalGuard {
    active: bool,
}

impl HotRemovalGuard {
    /// Install the handler for the channel behind `regs`.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::SignalHandler`] if:
    /// - The control register is not directly mapped
    /// - Another guard is already installed
    /// - `sigaction` fails
    pub fn install(regs: &ChannelRegisters) -> DmaResult<Self> {
        let control = regs.control_address().ok_or_else(|| {
            DmaError::SignalHandler("control register is not directly mapped".into())
        })?;

        let mut previous = PREVIOUS_ACTION.lock().unwrap_or_else(PoisonError::into_inner);
        if previous.is_some() {
            return Err(DmaError::SignalHandler("hot-removal guard already installed".into()));
        }
        CONTROL_REGISTER.store(control.as_ptr(), Ordering::SeqCst);

        // SAFETY: sigaction is plain data; all-zero is a valid empty value.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = on_hangup as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND;
        // SAFETY: both structs are valid and live for the calls.
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGHUP, &action, &mut old)
        };
        if rc != 0 {
            CONTROL_REGISTER.store(ptr::null_mut(), Ordering::SeqCst);
            return Err(DmaError::SignalHandler(format!(
                "sigaction(SIGHUP): {}",
                std::io::Error::last_os_error()
            )));
        }
        *previous = Some(old);
        log::debug!("hot-removal guard installed for channel at {:#x}", regs.base());
        Ok(Self { active: true })
    }

    /// Put the previous handler back.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::SignalHandler`] if `sigaction` fails.
    pub fn restore(mut self) -> DmaResult<()> {
        self.restore_previous()
    }

    fn restore_previous(&mut self) -> DmaResult<()> {
        if !std::mem::replace(&mut self.active, false) {
            return Ok(());
        }
        let mut previous = PREVIOUS_ACTION.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match previous.take() {
            Some(old) => {
                // SAFETY: `old` was filled in by sigaction at install time.
                let rc = unsafe { libc::sigaction(libc::SIGHUP, &old, ptr::null_mut()) };
                if rc == 0 {
                    Ok(())
                } else {
                    Err(DmaError::SignalHandler(format!(
                        "restoring SIGHUP handler: {}",
                        std::io::Error::last_os_error()
                    )))
                }
            }
            None => Ok(()),
        };
        // Cleared last so the handler never sees a half-restored state.
        CONTROL_REGISTER.store(ptr::null_mut(), Ordering::SeqCst);
        result
    }

    /// True while some guard holds the process `SIGHUP` disposition.
    pub fn is_installed() -> bool {
        PREVIOUS_ACTION
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for HotRemovalGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore_previous() {
            log::warn!("{}", e);
        }
    }
}

/// Serializes tests that touch the process-wide guard.
#[cfg(test)]
pub(crate) static GUARD_TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelKind, Device};
    use crate::regs::RegisterSpace;
    use crate::sim::{SimConfig, SimulatedDevice};
    use std::sync::Arc;

    fn sim_regs() -> (Arc<SimulatedDevice>, ChannelRegisters) {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let regs = ChannelRegisters::new(sim.registers(), sim.channel_layout().base);
        (sim, regs)
    }

    fn current_hup_handler() -> libc::sighandler_t {
        // SAFETY: querying only; a null new action leaves it unchanged.
        unsafe {
            let mut cur: libc::sigaction = std::mem::zeroed();
            assert_eq!(libc::sigaction(libc::SIGHUP, ptr::null(), &mut cur), 0);
            cur.sa_sigaction
        }
    }

    struct Unmapped;

    impl RegisterSpace for Unmapped {
        fn read32(&self, _offset: usize) -> DmaResult<u32> {
            Ok(0)
        }
        fn write32(&self, _offset: usize, _value: u32) -> DmaResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_install_and_restore() {
        let _lock = GUARD_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let (_sim, regs) = sim_regs();
        let before = current_hup_handler();

        let guard = HotRemovalGuard::install(&regs).unwrap();
        assert!(HotRemovalGuard::is_installed());
        assert_eq!(current_hup_handler(), on_hangup as libc::sighandler_t);

        guard.restore().unwrap();
        assert!(!HotRemovalGuard::is_installed());
        assert_eq!(current_hup_handler(), before);
    }

    #[test]
    fn test_second_install_is_rejected() {
        let _lock = GUARD_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let (_sim, regs) = sim_regs();
        let first = HotRemovalGuard::install(&regs).unwrap();
        assert!(matches!(
            HotRemovalGuard::install(&regs),
            Err(DmaError::SignalHandler(_))
        ));
        drop(first);
        HotRemovalGuard::install(&regs).unwrap().restore().unwrap();
    }

    /// A register page that survives `fork`, so the parent can read what
    /// the child's handler wrote.
    struct SharedPage {
        base: ptr::NonNull<u32>,
    }

    // SAFETY: the page is only accessed with volatile word reads and writes.
    unsafe impl Send for SharedPage {}
    unsafe impl Sync for SharedPage {}

    const PAGE_LEN: usize = 4096;

    impl SharedPage {
        fn new() -> Self {
            // SAFETY: fresh anonymous mapping, checked below.
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    PAGE_LEN,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(addr, libc::MAP_FAILED);
            Self {
                base: ptr::NonNull::new(addr.cast()).unwrap(),
            }
        }

        fn word(&self, offset: usize) -> *mut u32 {
            assert!(offset % 4 == 0 && offset < PAGE_LEN);
            // SAFETY: in bounds, checked above.
            unsafe { self.base.as_ptr().add(offset / 4) }
        }
    }

    impl RegisterSpace for SharedPage {
        fn read32(&self, offset: usize) -> DmaResult<u32> {
            // SAFETY: `word` returns an in-bounds, aligned pointer.
            Ok(unsafe { ptr::read_volatile(self.word(offset)) })
        }
        fn write32(&self, offset: usize, value: u32) -> DmaResult<()> {
            // SAFETY: as in read32.
            unsafe { ptr::write_volatile(self.word(offset), value) };
            Ok(())
        }
        fn mapped_address(&self, offset: usize) -> Option<ptr::NonNull<u32>> {
            ptr::NonNull::new(self.word(offset))
        }
    }

    impl Drop for SharedPage {
        fn drop(&mut self) {
            // SAFETY: unmapping the page mapped in `new`.
            unsafe { libc::munmap(self.base.as_ptr().cast(), PAGE_LEN) };
        }
    }

    #[test]
    fn test_hangup_stops_dispatcher_and_exits() {
        let _lock = GUARD_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let page = Arc::new(SharedPage::new());
        let regs = ChannelRegisters::new(page.clone(), 0);
        regs.set_control(crate::regs::ControlFlags::GLOBAL_INTR_EN).unwrap();

        // SAFETY: the child only installs the guard and raises SIGHUP
        // before it exits.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork: {}", std::io::Error::last_os_error());
        if pid == 0 {
            if HotRemovalGuard::install(&regs).is_err() {
                // SAFETY: leaving the forked child without unwinding.
                unsafe { libc::_exit(2) };
            }
            // SAFETY: signal delivery to ourselves; the handler exits.
            unsafe {
                libc::raise(libc::SIGHUP);
                libc::_exit(3);
            }
        }

        let mut status = 0;
        // SAFETY: waiting for the child forked above.
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(waited, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), EXIT_DEVICE_REMOVED);
        assert_eq!(page.read32(crate::regs::CSR_CONTROL).unwrap(), SHUTDOWN_CONTROL);
        // The parent's disposition is untouched.
        assert!(!HotRemovalGuard::is_installed());
    }

    #[test]
    fn test_requires_mapped_control_register() {
        let regs = ChannelRegisters::new(Arc::new(Unmapped), 0);
        assert!(matches!(
            HotRemovalGuard::install(&regs),
            Err(DmaError::SignalHandler(_))
        ));
    }
}
