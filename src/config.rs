use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::transport::{Endpoint, FrameLimits};

/// Configuration for sandboxed execution of job computations.
///
/// When enabled the execution supervisor wraps the computation in
/// `docker run` with the limits below.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Run computations inside a container
    pub enabled: bool,
    /// Docker image used when the job configuration names no environment
    pub image: String,
    /// Docker network to attach; `None` disables container networking
    pub network: Option<String>,
    /// Port range for the worker's side-channel listener (inclusive)
    pub port_range: Option<(u16, u16)>,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:latest".to_string(),
            network: None,
            port_range: None,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Parse a `min:max` port range.
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let invalid = || DispatchError::Config(format!("invalid port range {:?}, expected min:max", s));
    let (min, max) = s.split_once(':').ok_or_else(invalid)?;
    let min: u16 = min.trim().parse().map_err(|_| invalid())?;
    let max: u16 = max.trim().parse().map_err(|_| invalid())?;
    if min == 0 || min > max {
        return Err(invalid());
    }
    Ok((min, max))
}

/// Program the worker launches as execution supervisor for each job.
///
/// The worker appends `supervise` and the per-job arguments to `args`.
#[derive(Debug, Clone)]
pub struct SupervisorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SupervisorCommand {
    /// Re-invoke the running binary.
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: Vec::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind: Endpoint,
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before a worker is presumed dead
    pub liveness: u32,
    /// Pending requests kept per service before rejecting with "Service busy"
    pub max_backlog: usize,
    pub limits: FrameLimits,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::new("0.0.0.0", 5555),
            heartbeat_interval_ms: 1000,
            liveness: 3,
            max_backlog: 1024,
            limits: FrameLimits::default(),
        }
    }
}

impl BrokerConfig {
    pub fn new(bind: Endpoint) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// How long a worker may stay silent before it is presumed dead
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval() * self.liveness
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 || self.liveness == 0 {
            return Err(DispatchError::Config(
                "heartbeat interval and liveness must be positive".to_string(),
            ));
        }
        if self.max_backlog == 0 {
            return Err(DispatchError::Config("max_backlog must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker: Endpoint,
    pub service: String,
    /// Display name sent with READY; a new connection with the same service
    /// and name replaces the broker's old record
    pub name: String,
    /// Installation prefix holding `algorithms/`
    pub prefix: PathBuf,
    /// Job scratch area
    pub cache: PathBuf,
    /// Host the side channel binds to and supervisors connect to
    pub callback_host: String,
    pub heartbeat_interval_ms: u64,
    /// Silent heartbeat intervals tolerated before reconnecting to the broker
    pub liveness: u32,
    /// How long a supervisor that exited without reporting gets for its
    /// result to arrive before the job is failed
    pub exit_grace_ms: u64,
    /// Bound on waiting for a killed supervisor to be reaped
    pub reap_timeout_ms: u64,
    pub supervisor: SupervisorCommand,
    pub sandbox: SandboxConfig,
    pub limits: FrameLimits,
}

impl WorkerConfig {
    pub fn new(broker: Endpoint, service: impl Into<String>, prefix: PathBuf) -> Self {
        let cache = prefix.join("cache");
        Self {
            broker,
            service: service.into(),
            name: format!("worker-{}", std::process::id()),
            prefix,
            cache,
            callback_host: "127.0.0.1".to_string(),
            heartbeat_interval_ms: 1000,
            liveness: 3,
            exit_grace_ms: 500,
            reap_timeout_ms: 5000,
            supervisor: SupervisorCommand {
                program: PathBuf::from("dispatch-lite"),
                args: Vec::new(),
            },
            sandbox: SandboxConfig::default(),
            limits: FrameLimits::default(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorCommand) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }

    /// Startup checks; a failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.service.is_empty() {
            return Err(DispatchError::Config("service name must not be empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 || self.liveness == 0 {
            return Err(DispatchError::Config(
                "heartbeat interval and liveness must be positive".to_string(),
            ));
        }
        if !self.prefix.is_dir() {
            return Err(DispatchError::Config(format!(
                "prefix path {} is not a directory",
                self.prefix.display()
            )));
        }
        if let Some((min, max)) = self.sandbox.port_range {
            if min == 0 || min > max {
                return Err(DispatchError::Config(format!(
                    "invalid port range {}:{}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker: Endpoint,
    /// How long one `recv` waits before reporting no message
    pub poll_timeout_ms: u64,
    pub limits: FrameLimits,
}

impl ClientConfig {
    pub fn new(broker: Endpoint) -> Self {
        Self {
            broker,
            poll_timeout_ms: 2500,
            limits: FrameLimits::default(),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.image, "alpine:latest");
        assert!(cfg.network.is_none());
        assert!(cfg.port_range.is_none());
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!(parse_port_range("50000:50100").unwrap(), (50000, 50100));
        assert_eq!(parse_port_range(" 7 : 7 ").unwrap(), (7, 7));
        assert!(parse_port_range("50100:50000").is_err());
        assert!(parse_port_range("0:10").is_err());
        assert!(parse_port_range("5000").is_err());
        assert!(parse_port_range("a:b").is_err());
    }

    #[test]
    fn broker_config_default() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.bind.to_string(), "tcp://0.0.0.0:5555");
        assert_eq!(cfg.heartbeat_expiry(), Duration::from_millis(3000));
        assert_eq!(cfg.max_backlog, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn broker_config_rejects_zero_backlog() {
        let cfg = BrokerConfig {
            max_backlog: 0,
            ..BrokerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DispatchError::Config(_))));
    }

    #[test]
    fn worker_config_new_derives_cache_from_prefix() {
        let cfg = WorkerConfig::new(
            Endpoint::new("127.0.0.1", 5555),
            "queue",
            PathBuf::from("/srv/prefix"),
        );
        assert_eq!(cfg.cache, PathBuf::from("/srv/prefix/cache"));
        assert_eq!(cfg.service, "queue");
        assert_eq!(cfg.liveness, 3);
        assert_eq!(cfg.exit_grace(), Duration::from_millis(500));
    }

    #[test]
    fn worker_config_missing_prefix_is_fatal() {
        let cfg = WorkerConfig::new(
            Endpoint::new("127.0.0.1", 5555),
            "queue",
            PathBuf::from("/definitely/not/here"),
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn worker_config_validates_existing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WorkerConfig::new(Endpoint::new("127.0.0.1", 5555), "queue", dir.path().into())
            .with_name("w1");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.name, "w1");

        let mut empty_service = cfg.clone();
        empty_service.service.clear();
        assert!(empty_service.validate().is_err());

        let mut bad_range = cfg;
        bad_range.sandbox.port_range = Some((10, 5));
        assert!(bad_range.validate().is_err());
    }

    #[test]
    fn client_config_new() {
        let cfg = ClientConfig::new(Endpoint::new("127.0.0.1", 5555));
        assert_eq!(cfg.poll_timeout(), Duration::from_millis(2500));
    }
}
