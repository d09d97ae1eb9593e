//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 容器对外暴露的全部失败语义集中在 [`ContainerError`]：生命周期控制、建链、路由、投递与外部协作者失败；
//! - 每个变体提供稳定错误码（`aim.container.*`），便于告警按维度聚合。
//!
//! ## 设计要求（What）
//! - 生命周期控制（`init`/`start`/`shutdown`）的错误同步返回调用方；
//! - 后台任务中的错误只记录日志，不会以本类型升级为进程级故障；
//! - `forward`/`push` 的错误交给业务调用方决定是否重试，容器自身不重试。

use aim_core::{DecodeError, EncodeError, NamingError, Protocol, TransportError};
use thiserror::Error;

/// 容器错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：业务方只需匹配一个枚举即可区分“配置问题”“状态机误用”“路由不可达”；
/// - **契约 (What)**：所有变体均 `Send + Sync + 'static`；[`ContainerError::code`] 返回稳定错误码；
/// - **设计权衡 (Trade-offs)**：`Connect` 保留底层 [`TransportError`] 作为 `source`，日志可展开完整原因链。
#[derive(Debug, Error)]
pub enum ContainerError {
    /// 启动前缺少必要的协作者或配置非法。
    #[error("container misconfigured: {reason}")]
    Configuration { reason: String },

    /// 在错误的生命周期状态下调用了状态迁移。
    ///
    /// - **契约 (What)**：`expected` 为该操作要求的起始状态，`actual` 为调用时观测到的状态；状态保持不变。
    #[error("`{operation}` requires state `{expected}`, container is `{actual}`")]
    LifecycleViolation {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// 实例声明的传输协议不是本网格支持的协议。
    #[error("instance `{id}` advertises unsupported protocol `{protocol}`")]
    ProtocolMismatch { id: String, protocol: Protocol },

    #[error("no dialer configured")]
    DialerMissing,

    /// 拨号或握手失败。
    #[error("failed to connect instance `{id}` at {address}")]
    Connect {
        id: String,
        address: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    /// 报文超出线上布局的长度上限，未发送任何字节。
    #[error("packet cannot be encoded: {0}")]
    Encode(#[from] EncodeError),

    /// 转发前的报文校验失败。
    #[error("packet field `{field}` must not be empty")]
    Validation { field: &'static str },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("naming failure: {0}")]
    Naming(#[from] NamingError),
}

impl ContainerError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ContainerError::Configuration { .. } => "aim.container.configuration",
            ContainerError::LifecycleViolation { .. } => "aim.container.lifecycle_violation",
            ContainerError::ProtocolMismatch { .. } => "aim.container.protocol_mismatch",
            ContainerError::DialerMissing => "aim.container.dialer_missing",
            ContainerError::Connect { .. } => "aim.container.connect_failed",
            ContainerError::Routing(RoutingError::NotFound { .. }) => {
                "aim.container.routing.not_found"
            }
            ContainerError::Routing(RoutingError::NoReadyInstance { .. }) => {
                "aim.container.routing.no_ready_instance"
            }
            ContainerError::Routing(RoutingError::ConnectionMissing { .. }) => {
                "aim.container.routing.connection_missing"
            }
            ContainerError::Decode(_) => "aim.container.decode",
            ContainerError::Encode(_) => "aim.container.encode",
            ContainerError::Validation { .. } => "aim.container.validation",
            ContainerError::Delivery(DeliveryError::DestinationMismatch { .. }) => {
                "aim.container.delivery.destination_mismatch"
            }
            ContainerError::Delivery(DeliveryError::MissingChannels) => {
                "aim.container.delivery.missing_channels"
            }
            ContainerError::Transport(_) => "aim.container.transport",
            ContainerError::Naming(_) => "aim.container.naming",
        }
    }
}

/// 路由阶段的失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum RoutingError {
    /// 目标服务不在依赖集合中。
    #[error("service `{service}` is not a declared dependency")]
    NotFound { service: String },

    /// 目标服务没有完成预热的实例。
    #[error("service `{service}` has no ready instance")]
    NoReadyInstance { service: String },

    /// 选中的实例在查找前被并发移除。
    #[error("connection to `{service}` instance `{id}` is gone")]
    ConnectionMissing { service: String, id: String },
}

/// 入站本地投递的拒绝原因。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DeliveryError {
    /// 报文的目的实例不是本地服务，常见于拓扑变化后的陈旧路由。
    #[error("packet addressed to `{expected:?}`, local service is `{local}`")]
    DestinationMismatch {
        expected: Option<String>,
        local: String,
    },

    #[error("packet carries no destination channels")]
    MissingChannels,
}
