//! Access to the host's code pages
//!
//! Code patches never touch memory directly; they go through [`CodeMemory`],
//! which owns the protection dance around every edit. [`ProcessCode`] edits the
//! live process on Windows, [`HostImage`] is an in-memory copy of a host code
//! region used to stage and verify patches without a running host.

use crate::patch::PatchError;
use std::sync::{Mutex, PoisonError};

/// A region of executable code that can be edited in place
pub trait CodeMemory {
    /// Runs `edit` over the `len` bytes starting at `address`.
    ///
    /// Implementations make the window writable before calling `edit`, restore
    /// the original protection afterwards and flush the instruction cache for
    /// the window.
    fn with_writable(
        &self,
        address: usize,
        len: usize,
        edit: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), PatchError>;
}

/// In-memory copy of host code mapped at a fictitious base address
#[derive(Debug)]
pub struct HostImage {
    base: usize,
    bytes: Mutex<Vec<u8>>,
    locked: bool,
}

impl HostImage {
    /// Create an image of `bytes` mapped at `base`
    pub fn new(base: usize, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            base,
            bytes: Mutex::new(bytes.into()),
            locked: false,
        }
    }

    /// Make every protection change fail, like a page the process may not touch
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Copy `len` bytes starting at `address`, if the range lies inside the image
    pub fn read(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let start = address.checked_sub(self.base)?;
        let end = start.checked_add(len)?;
        bytes.get(start..end).map(<[u8]>::to_vec)
    }
}

impl CodeMemory for HostImage {
    fn with_writable(
        &self,
        address: usize,
        len: usize,
        edit: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), PatchError> {
        if self.locked {
            return Err(PatchError::ProtectFailed {
                address,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }

        let outside = || PatchError::ProtectFailed {
            address,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("window of {} bytes is outside the host image", len),
            ),
        };

        let start = address.checked_sub(self.base).ok_or_else(outside)?;
        let end = start.checked_add(len).ok_or_else(outside)?;

        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let window = bytes.get_mut(start..end).ok_or_else(outside)?;

        edit(window);
        Ok(())
    }
}

#[cfg(windows)]
pub use self::process::ProcessCode;

#[cfg(windows)]
mod process {
    use super::CodeMemory;
    use crate::patch::PatchError;
    use std::ffi::c_void;
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    /// The code pages of the current process
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ProcessCode;

    impl CodeMemory for ProcessCode {
        fn with_writable(
            &self,
            address: usize,
            len: usize,
            edit: &mut dyn FnMut(&mut [u8]),
        ) -> Result<(), PatchError> {
            let window = address as *const c_void;
            let mut original: PAGE_PROTECTION_FLAGS = 0;

            // SAFETY: VirtualProtect validates the range and fails on unmapped pages
            if unsafe { VirtualProtect(window, len, PAGE_EXECUTE_READWRITE, &mut original) } == 0 {
                return Err(PatchError::ProtectFailed {
                    address,
                    source: std::io::Error::last_os_error(),
                });
            }

            // SAFETY: the range is mapped and writable now; the patch descriptor
            // owns the window so nothing else writes it concurrently
            let bytes = unsafe { std::slice::from_raw_parts_mut(address as *mut u8, len) };
            edit(bytes);

            let mut ignored: PAGE_PROTECTION_FLAGS = 0;
            // SAFETY: same range as above
            unsafe {
                if VirtualProtect(window, len, original, &mut ignored) == 0 {
                    tracing::warn!(
                        error = %std::io::Error::last_os_error(),
                        "Failed to restore code page protection at {:#x}",
                        address
                    );
                }
                FlushInstructionCache(GetCurrentProcess(), window, len);
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_edit_in_range() {
        let image = HostImage::new(0x40_0000, vec![0u8; 16]);
        image
            .with_writable(0x40_0004, 2, &mut |w| w.copy_from_slice(&[0xAA, 0xBB]))
            .unwrap();

        assert_eq!(image.read(0x40_0003, 4).unwrap(), vec![0x00, 0xAA, 0xBB, 0x00]);
    }

    #[test]
    fn test_image_edit_out_of_range() {
        let image = HostImage::new(0x40_0000, vec![0u8; 16]);

        let below = image.with_writable(0x3F_FFFF, 2, &mut |_| {});
        let past_end = image.with_writable(0x40_000E, 5, &mut |_| {});

        assert!(matches!(below, Err(PatchError::ProtectFailed { .. })));
        assert!(matches!(past_end, Err(PatchError::ProtectFailed { .. })));
    }

    #[test]
    fn test_locked_image_rejects_edits() {
        let image = HostImage::new(0x1000, vec![0x90; 8]).locked();
        let mut touched = false;

        let result = image.with_writable(0x1000, 5, &mut |_| touched = true);

        assert!(matches!(result, Err(PatchError::ProtectFailed { address: 0x1000, .. })));
        assert!(!touched);
        assert_eq!(image.read(0x1000, 8).unwrap(), vec![0x90; 8]);
    }
}
