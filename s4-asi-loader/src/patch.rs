//! Relative call redirection
//!
//! Rewrites a 5-byte `E8 rel32` near call inside the host so that it calls a
//! loader-supplied function instead of the host's own callee. The descriptor
//! remembers the original bytes so the redirect can be reverted.

use crate::memory::CodeMemory;
use thiserror::Error;

/// Opcode of `CALL rel32`
pub const CALL_OPCODE: u8 = 0xE8;

/// Length of `CALL rel32`: one opcode byte plus a 32-bit displacement
pub const CALL_LEN: usize = 5;

/// Errors that can occur while installing or removing a call patch
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to change protection of code at {address:#x}: {source}")]
    ProtectFailed {
        address: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Expected a relative call (0xE8) at {address:#x}, found {found:#04x}")]
    PreconditionFailed { address: usize, found: u8 },

    #[error("Callee {callee:#x} is out of rel32 range of the call at {address:#x}")]
    RangeOutOf32Bit { address: usize, callee: usize },

    #[error("Call at {0:#x} is already patched")]
    AlreadyInstalled(usize),

    #[error("Call at {0:#x} is not patched")]
    NotInstalled(usize),
}

/// Compute the rel32 displacement of a call at `address` targeting `callee`.
///
/// The displacement is relative to the end of the instruction. On 32-bit
/// targets the address space wraps, so every callee is reachable.
pub fn call_displacement(address: usize, callee: usize) -> Result<i32, PatchError> {
    let next = address.wrapping_add(CALL_LEN);

    if cfg!(target_pointer_width = "32") {
        return Ok(callee.wrapping_sub(next) as u32 as i32);
    }

    let delta = callee as i128 - next as i128;
    i32::try_from(delta).map_err(|_| PatchError::RangeOutOf32Bit { address, callee })
}

/// Encode `CALL rel32` for a call at `address` targeting `callee`
pub fn encode_call(address: usize, callee: usize) -> Result<[u8; CALL_LEN], PatchError> {
    let displacement = call_displacement(address, callee)?.to_le_bytes();
    let mut call = [CALL_OPCODE; CALL_LEN];
    call[1..].copy_from_slice(&displacement);
    Ok(call)
}

/// A redirect of one host call site to a new callee
#[derive(Debug, Clone)]
pub struct CallPatch {
    address: usize,
    callee: usize,
    original: [u8; CALL_LEN],
    installed: bool,
}

impl CallPatch {
    /// Describe a redirect of the call at `address` to `callee`. Nothing is
    /// written until [`CallPatch::install`].
    pub fn new(address: usize, callee: usize) -> Self {
        Self {
            address,
            callee,
            original: [0; CALL_LEN],
            installed: false,
        }
    }

    /// Address of the patched call instruction
    pub fn address(&self) -> usize {
        self.address
    }

    /// Address the call is redirected to
    pub fn callee(&self) -> usize {
        self.callee
    }

    /// Whether the redirect is currently in place
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Bytes the redirect replaced, valid while installed
    pub fn original_bytes(&self) -> Option<[u8; CALL_LEN]> {
        self.installed.then_some(self.original)
    }

    /// Absolute target of the call the host made before the patch
    pub fn original_callee(&self) -> Option<usize> {
        let original = self.original_bytes()?;
        let displacement = i32::from_le_bytes([original[1], original[2], original[3], original[4]]);
        Some(
            self.address
                .wrapping_add(CALL_LEN)
                .wrapping_add_signed(displacement as isize),
        )
    }

    /// Redirect the call. The window must hold a relative call.
    pub fn install(&mut self, memory: &impl CodeMemory) -> Result<(), PatchError> {
        if self.installed {
            return Err(PatchError::AlreadyInstalled(self.address));
        }

        let call = encode_call(self.address, self.callee)?;
        let address = self.address;
        let mut saved = None;
        let mut found = CALL_OPCODE;

        memory.with_writable(address, CALL_LEN, &mut |window| {
            found = window[0];
            if found != CALL_OPCODE {
                return;
            }
            let mut original = [0; CALL_LEN];
            original.copy_from_slice(window);
            window.copy_from_slice(&call);
            saved = Some(original);
        })?;

        let original = saved.ok_or(PatchError::PreconditionFailed { address, found })?;
        self.original = original;
        self.installed = true;

        tracing::debug!(
            "Redirected call at {:#x} to {:#x} (original bytes {:02x?})",
            address,
            self.callee,
            original
        );
        Ok(())
    }

    /// Put the original call back
    pub fn uninstall(&mut self, memory: &impl CodeMemory) -> Result<(), PatchError> {
        if !self.installed {
            return Err(PatchError::NotInstalled(self.address));
        }

        let original = self.original;
        memory.with_writable(self.address, CALL_LEN, &mut |window| {
            window.copy_from_slice(&original);
        })?;
        self.installed = false;

        tracing::debug!("Restored call at {:#x}", self.address);
        Ok(())
    }
}
