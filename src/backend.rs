//! Backend selection module.
//!
//! Defines the compute backends a [`Handle`](crate::handle::Handle) can be
//! created for, plus a process-wide default used by
//! [`HandleConfig::default`](crate::config::HandleConfig).
//!
//! # Supported Backends
//!
//! - `Cpu`: Pure Rust algorithms parallelised with `rayon` (default).
//! - `Wgpu`: Reserved; handles fall back to the CPU algorithm pack.
//! - `Cuda`: Reserved; handles fall back to the CPU algorithm pack.
//!
//! The default is stored in an `AtomicU8`. It only seeds new configurations;
//! a handle never consults it again after construction.

use core::convert::TryFrom;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu = 0,
    /// GPU backend through `wgpu`.
    Wgpu = 1,
    /// GPU backend through CUDA.
    Cuda = 2,
}

impl Backend {
    /// Whether this crate ships algorithms for the backend.
    #[must_use]
    pub const fn has_native_algorithms(self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            2 => Ok(Self::Cuda),
            _ => Err(()),
        }
    }
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" => Ok(Self::Wgpu),
            "cuda" => Ok(Self::Cuda),
            _ => Err(()),
        }
    }
}

static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend that new configurations start from.
///
/// # Example
/// ```
/// use briny_conv::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the default backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("CPU".parse(), Ok(Backend::Cpu));
        assert_eq!(" wgpu ".parse(), Ok(Backend::Wgpu));
        assert_eq!("cuda".parse(), Ok(Backend::Cuda));
        assert_eq!("tpu".parse::<Backend>(), Err(()));
    }

    #[test]
    fn byte_conversion_rejects_unknown_tags() {
        assert_eq!(Backend::try_from(1), Ok(Backend::Wgpu));
        assert!(Backend::try_from(7).is_err());
    }
}
