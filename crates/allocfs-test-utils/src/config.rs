//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use allocfs_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .alloc_root(alloc.root())
///     .fast_stream()
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn listen_addr(mut self, addr: &str) -> Self {
        self.config.http.listen_addr = addr.to_string();
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.http.listen_port = port;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn alloc_root(mut self, root: &Path) -> Self {
        self.config.alloc.root = root.display().to_string();
        self
    }

    pub fn frame_size(mut self, bytes: usize) -> Self {
        self.config.stream.frame_size = bytes;
        self
    }

    pub fn log_poll_ms(mut self, ms: u64) -> Self {
        self.config.stream.log_poll_ms = ms;
        self
    }

    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.config.stream.drain_timeout_ms = ms;
        self
    }

    pub fn commit_timeout_ms(mut self, ms: u64) -> Self {
        self.config.stream.commit_timeout_ms = ms;
        self
    }

    /// Short timers so streaming tests finish quickly.
    pub fn fast_stream(mut self) -> Self {
        let stream = &mut self.config.stream;
        stream.heartbeat_ms = 50;
        stream.batch_window_ms = 10;
        stream.log_poll_ms = 10;
        stream.drain_timeout_ms = 500;
        stream.commit_timeout_ms = 200;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
