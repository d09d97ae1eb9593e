use std::time::Duration;

use aim_core::DEFAULT_MAX_FRAME_LENGTH;
use serde::Deserialize;
use thiserror::Error;

/// 配置解析或校验失败。
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid container options: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("option `{field}` {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// 容器运行参数，时长以毫秒配置。
///
/// # 教案式注释
/// - **意图 (Why)**：预热、关闭期限与连接保活策略在不同部署间需要调整，统一由一份 TOML 承载；
/// - **契约 (What)**：未出现的字段取默认值（预热 10 s、关闭 10 s、心跳 55 s、读等待 180 s、写等待 10 s、
///   拨号 10 s、单帧 4 MiB）；[`ContainerOptions::validate`] 拒绝零时长与 `heartbeat >= read_wait`；
/// - **风险 (Trade-offs)**：心跳间隔必须小于对端的读等待，否则空闲链路会被对端误判为死连接。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerOptions {
    pub warmup_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub read_wait_ms: u64,
    pub write_wait_ms: u64,
    pub dial_timeout_ms: u64,
    pub max_frame_length: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            warmup_delay_ms: 10_000,
            shutdown_timeout_ms: 10_000,
            heartbeat_ms: 55_000,
            read_wait_ms: 180_000,
            write_wait_ms: 10_000,
            dial_timeout_ms: 10_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ContainerOptions {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, OptionsError> {
        let options: Self = toml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        let durations = [
            ("warmup_delay_ms", self.warmup_delay_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("heartbeat_ms", self.heartbeat_ms),
            ("read_wait_ms", self.read_wait_ms),
            ("write_wait_ms", self.write_wait_ms),
            ("dial_timeout_ms", self.dial_timeout_ms),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(OptionsError::Invalid {
                field,
                reason: "must be greater than zero",
            });
        }
        if self.max_frame_length == 0 {
            return Err(OptionsError::Invalid {
                field: "max_frame_length",
                reason: "must be greater than zero",
            });
        }
        if self.heartbeat_ms >= self.read_wait_ms {
            return Err(OptionsError::Invalid {
                field: "heartbeat_ms",
                reason: "must be shorter than read_wait_ms",
            });
        }
        Ok(())
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
