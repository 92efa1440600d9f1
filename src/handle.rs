//! Execution context.
//!
//! A [`Handle`] bundles the configuration and the algorithm pack, and is the
//! only way to obtain an operator. It is cheap to clone; every operator keeps a
//! clone so that algorithms can create sub-operators on the same context
//! without any global state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::algo::{AlgoBase, AlgoPack};
use crate::config::HandleConfig;
use crate::error::{ConvError, Result};
use crate::opr::Convolution3dBackwardFilter;

struct HandleInner {
    config: HandleConfig,
    algos: AlgoPack,
    live_operators: AtomicUsize,
}

/// Shared execution context.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

/// Collects extra algorithms before a [`Handle`] is built.
pub struct HandleBuilder {
    config: HandleConfig,
    algos: AlgoPack,
}

impl HandleBuilder {
    /// Appends `algo` after the algorithms registered so far.
    #[must_use]
    pub fn register(mut self, algo: Arc<dyn AlgoBase>) -> Self {
        if self.algos.all().iter().any(|a| a.name() == algo.name()) {
            warn!(
                name = algo.name(),
                "algorithm name already registered, later entry is unreachable by name"
            );
        }
        self.algos.push(algo);
        self
    }

    #[must_use]
    pub fn build(self) -> Handle {
        if !self.config.backend.has_native_algorithms() {
            warn!(
                backend = ?self.config.backend,
                "no native algorithms, falling back to the CPU pack"
            );
        }
        debug!(backend = ?self.config.backend, algos = ?self.algos, "handle created");
        Handle {
            inner: Arc::new(HandleInner {
                config: self.config,
                algos: self.algos,
                live_operators: AtomicUsize::new(0),
            }),
        }
    }
}

impl Handle {
    /// A handle with the built-in algorithms.
    #[must_use]
    pub fn new(config: HandleConfig) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: HandleConfig) -> HandleBuilder {
        HandleBuilder {
            config,
            algos: AlgoPack::builtin(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HandleConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn algo_pack(&self) -> &AlgoPack {
        &self.inner.algos
    }

    /// Operators created from this handle that are still alive.
    #[must_use]
    pub fn live_operators(&self) -> usize {
        self.inner.live_operators.load(Ordering::Acquire)
    }

    /// Creates a backward-filter operator with default param and policy.
    ///
    /// # Errors
    /// - [`ConvError::ResourceExhaustion`] if `max_operators` are alive.
    pub fn create_operator(&self) -> Result<Convolution3dBackwardFilter> {
        let cap = self.inner.config.max_operators.unwrap_or(usize::MAX);
        self.inner
            .live_operators
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
            .map_err(|n| ConvError::ResourceExhaustion(format!("{n} of {cap} operators alive")))?;
        Ok(Convolution3dBackwardFilter::new(self.clone()))
    }

    pub(crate) fn release_operator(&self) {
        self.inner.live_operators.fetch_sub(1, Ordering::AcqRel);
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("config", &self.inner.config)
            .field("algos", &self.inner.algos)
            .field("live_operators", &self.live_operators())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_cap_is_enforced_and_released_on_drop() {
        let handle = Handle::new(HandleConfig::default().with_max_operators(1));
        let first = handle.create_operator().unwrap();
        assert_eq!(handle.live_operators(), 1);
        assert!(matches!(
            handle.create_operator(),
            Err(ConvError::ResourceExhaustion(_))
        ));
        drop(first);
        assert_eq!(handle.live_operators(), 0);
        assert!(handle.create_operator().is_ok());
    }

    #[test]
    fn builtin_pack_order() {
        let handle = Handle::new(HandleConfig::default());
        let names: Vec<_> = handle.algo_pack().all().iter().map(|a| a.name()).collect();
        assert_eq!(names, ["GROUP_CONV_GENERAL", "ACCUMULATE_F64", "NAIVE"]);
    }
}
