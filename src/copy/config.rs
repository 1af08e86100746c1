//! Engine configuration and per-call options

use crate::runtime::{MAX_KERNEL_DIMS, Stream};

/// What to do when two devices have no direct peer path
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PeerFallback {
    /// Copy device → host staging → device
    #[default]
    StageThroughHost,
    /// Fail with `DeviceError::NoPeerPath`
    Reject,
}

/// Engine-wide settings
///
/// # Example
///
/// ```
/// use numr_copy::copy::{CopyConfig, PeerFallback};
///
/// let config = CopyConfig::default()
///     .with_peer_fallback(PeerFallback::Reject)
///     .with_max_device_rank(6);
/// assert_eq!(config.max_device_rank(), 6);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyConfig {
    max_device_rank: usize,
    peer_fallback: PeerFallback,
    parallel_threshold: usize,
}

impl CopyConfig {
    /// Default element count above which host linear steps go parallel
    pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 16;

    /// Highest merged rank a strided device step may have (at most 8)
    pub fn with_max_device_rank(mut self, rank: usize) -> Self {
        self.max_device_rank = rank.clamp(1, MAX_KERNEL_DIMS);
        self
    }

    /// Policy for device pairs without a peer path
    pub fn with_peer_fallback(mut self, fallback: PeerFallback) -> Self {
        self.peer_fallback = fallback;
        self
    }

    /// Element count above which host linear steps use the rayon pool
    pub fn with_parallel_threshold(mut self, elements: usize) -> Self {
        self.parallel_threshold = elements.max(1);
        self
    }

    /// Highest merged rank a strided device step may have
    #[inline]
    pub fn max_device_rank(&self) -> usize {
        self.max_device_rank
    }

    /// Policy for device pairs without a peer path
    #[inline]
    pub fn peer_fallback(&self) -> PeerFallback {
        self.peer_fallback
    }

    /// Element count above which host linear steps go parallel
    #[inline]
    pub fn parallel_threshold(&self) -> usize {
        self.parallel_threshold
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            max_device_rank: MAX_KERNEL_DIMS,
            peer_fallback: PeerFallback::default(),
            parallel_threshold: Self::DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

/// Per-call options
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Wait for completion before returning
    pub blocking: bool,
    /// Queue for steps on `stream.device`; other devices use their default
    pub stream: Option<Stream>,
}

impl CopyOptions {
    /// Options that wait for completion
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            stream: None,
        }
    }

    /// Options that return as soon as device work is enqueued
    pub fn non_blocking() -> Self {
        Self::default()
    }

    /// Run steps on `stream` where its device is involved
    pub fn on_stream(mut self, stream: Stream) -> Self {
        self.stream = Some(stream);
        self
    }
}
