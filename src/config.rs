/// Configuration for an event loop and the listeners attached to it.
#[derive(Clone)]
pub struct Config {
    /// Maximum number of concurrent connections per loop.
    pub max_connections: u32,
    /// TCP listen backlog. Deliberately small: the loop drains `accept` to
    /// `would-block` on every readiness event, so a deep backlog only hides
    /// latency.
    pub backlog: i32,
    /// Set `TCP_NODELAY` on listening sockets so accepted sockets inherit it.
    /// Nagle coalescing delays small pipelined replies by up to ~40ms, which
    /// dominates latency for request/response workloads.
    pub tcp_nodelay: bool,
    /// Maximum readiness events drained per `epoll_wait` call.
    pub event_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            backlog: 5,
            tcp_nodelay: true,
            event_batch: 256,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_connections == 0 || self.max_connections >= (1 << 24) {
            return Err(crate::error::Error::Config(
                "max_connections must be > 0 and < 2^24".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(crate::error::Error::Config("backlog must be > 0".into()));
        }
        if self.event_batch == 0 {
            return Err(crate::error::Error::Config(
                "event_batch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use eventline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .max_connections(256)
///     .backlog(16)
///     .tcp_nodelay(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of concurrent connections per loop.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on listening sockets.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the maximum readiness events drained per poll.
    pub fn event_batch(mut self, n: usize) -> Self {
        self.config.event_batch = n;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
