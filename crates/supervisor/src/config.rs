//! The immutable session configuration shared by reference across workers.

use std::path::PathBuf;
use std::thread;

use compress::Algorithm;

/// Video encoding mode for DMABUF surfaces.
///
/// Codec integration lives outside this crate; the mode is carried so the
/// replication layer knows whether full-surface diffs are the transport of
/// record.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum VideoMode {
    /// Surfaces replicate as diffs.
    #[default]
    Off,
    /// Hardware encoding through VA-API.
    Vaapi,
    /// Software encoding.
    Software,
}

/// Options recognized by every waybridge endpoint.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Compression applied to diff payloads.
    pub compression: Algorithm,
    /// Video encoding mode.
    pub video: VideoMode,
    /// Worker pool threads per connection; zero selects a machine-sized
    /// default.
    pub threads: usize,
    /// Render node to import DMABUFs through.
    pub dmabuf_device: Option<PathBuf>,
    /// Disable GPU buffer support entirely.
    pub no_gpu: bool,
}

impl SessionConfig {
    /// Starts building a configuration.
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Pool size to actually spawn: the configured count, or half the
    /// available cores when unset.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        thread::available_parallelism().map_or(1, |cores| (cores.get() / 2).max(1))
    }

    /// Whether DMABUF descriptors may be shadowed at all.
    #[must_use]
    pub fn gpu_enabled(&self) -> bool {
        !self.no_gpu
    }
}

/// Builder for [`SessionConfig`].
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Sets the diff payload compression.
    #[must_use]
    pub fn compression(mut self, algorithm: Algorithm) -> Self {
        self.config.compression = algorithm;
        self
    }

    /// Sets the video mode.
    #[must_use]
    pub fn video(mut self, mode: VideoMode) -> Self {
        self.config.video = mode;
        self
    }

    /// Sets the worker pool size; zero selects a machine-sized default.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    /// Selects the render node for DMABUF import.
    #[must_use]
    pub fn dmabuf_device(mut self, device: Option<PathBuf>) -> Self {
        self.config.dmabuf_device = device;
        self
    }

    /// Disables GPU buffer support.
    #[must_use]
    pub fn no_gpu(mut self, no_gpu: bool) -> Self {
        self.config.no_gpu = no_gpu;
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trips_fields() {
        let config = SessionConfig::builder()
            .compression(Algorithm::Lz4)
            .video(VideoMode::Software)
            .threads(3)
            .no_gpu(true)
            .build();
        assert_eq!(config.compression, Algorithm::Lz4);
        assert_eq!(config.video, VideoMode::Software);
        assert_eq!(config.effective_threads(), 3);
        assert!(!config.gpu_enabled());
    }

    #[test]
    fn zero_threads_selects_a_positive_default() {
        let config = SessionConfig::default();
        assert!(config.effective_threads() >= 1);
    }
}
