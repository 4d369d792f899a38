use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::Framing;

/// Transport a listener serves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// What a shard does with a readiness notification when its channel is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPolicy {
    /// Drop the notification and rearm the descriptor so a later poll
    /// cycle reports it again.
    #[default]
    Drop,
    /// Park the poll loop until the shard has room.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub bind: String,
}

impl ListenerConfig {
    pub fn tcp(bind: impl Into<String>) -> Self {
        ListenerConfig {
            protocol: Protocol::Tcp,
            bind: bind.into(),
        }
    }

    pub fn udp(bind: impl Into<String>) -> Self {
        ListenerConfig {
            protocol: Protocol::Udp,
            bind: bind.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listeners: Vec<ListenerConfig>,
    /// Accept loops per stream listener, 0 means one per available cpu.
    pub accept_concurrency: usize,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub keep_alive: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listeners: vec![ListenerConfig::tcp("127.0.0.1:7086")],
            accept_concurrency: 0,
            send_buffer_size: 4096,
            recv_buffer_size: 4096,
            keep_alive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub sub_reactors: usize,
    pub notify_channel_capacity: usize,
    pub notify_policy: NotifyPolicy,
    pub poll_timeout_ms: u64,
    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            sub_reactors: 16,
            notify_channel_capacity: 1000,
            notify_policy: NotifyPolicy::Drop,
            poll_timeout_ms: 100,
            max_events: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of context pools, must be a power of two.
    pub context_pool_shards: usize,
    /// Idle contexts kept per shard.
    pub context_pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            context_pool_shards: 32,
            context_pool_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub outbound_queue_capacity: usize,
    /// Width in bytes of the big-endian length prefix, 0 selects newline framing.
    pub length_prefix_width: u8,
    /// Largest accepted frame body, 0 means unlimited.
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            outbound_queue_capacity: 64,
            length_prefix_width: 0,
            max_frame_size: 0,
            read_buffer_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig { size: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    pub max_datagram_size: usize,
    /// Seconds a silent peer is kept before it is closed, 0 keeps peers forever.
    pub idle_timeout_secs: u64,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        DatagramConfig {
            max_datagram_size: 64 * 1024,
            idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub debug: bool,
    pub network: NetworkConfig,
    pub reactor: ReactorConfig,
    pub engine: EngineConfig,
    pub connection: ConnectionConfig,
    pub worker_pool: WorkerPoolConfig,
    pub datagram: DatagramConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("SHARDLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Rejects settings the reactor cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let shards = self.engine.context_pool_shards;
        if shards == 0 || !shards.is_power_of_two() {
            return Err(AppError::InvalidValue(format!(
                "engine.context_pool_shards must be a power of two, got {}",
                shards
            )));
        }
        if self.reactor.sub_reactors == 0 {
            return Err(AppError::InvalidValue(
                "reactor.sub_reactors must be at least 1".into(),
            ));
        }
        if self.reactor.notify_channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "reactor.notify_channel_capacity must be at least 1".into(),
            ));
        }
        if self.reactor.max_events == 0 {
            return Err(AppError::InvalidValue(
                "reactor.max_events must be at least 1".into(),
            ));
        }
        if self.worker_pool.size == 0 {
            return Err(AppError::InvalidValue(
                "worker_pool.size must be at least 1".into(),
            ));
        }
        if self.connection.outbound_queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "connection.outbound_queue_capacity must be at least 1".into(),
            ));
        }
        if self.connection.length_prefix_width > 8 {
            return Err(AppError::InvalidValue(format!(
                "connection.length_prefix_width must be within 0..=8, got {}",
                self.connection.length_prefix_width
            )));
        }
        if self.network.listeners.is_empty() {
            return Err(AppError::InvalidValue(
                "network.listeners must name at least one bind address".into(),
            ));
        }
        Ok(())
    }

    pub fn accept_concurrency(&self) -> usize {
        match self.network.accept_concurrency {
            0 => num_cpus::get(),
            n => n,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.reactor.poll_timeout_ms)
    }

    pub fn framing(&self) -> Framing {
        Framing::new(
            self.connection.length_prefix_width,
            self.connection.max_frame_size,
        )
    }
}
