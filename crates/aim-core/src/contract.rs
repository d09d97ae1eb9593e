//! # contract 模块说明
//!
//! ## 角色定位（Why）
//! - 容器依赖三类外部协作者：本地传输服务器（接受入站连接、按频道推送）、拨号器（建立出站链路并完成握手）、
//!   命名服务（发现、订阅与自注册）。本模块只定义接口，具体实现位于 `aim-transport-tcp` 或部署方代码。
//!
//! ## 设计要求（What）
//! - 所有接口均为 `Send + Sync`，以 `Arc<dyn Trait>` 形式注入容器；
//! - 异步方法通过 `async_trait` 暴露为对象安全的形态；
//! - 错误统一使用 [`TransportError`] 与 [`NamingError`]，容器据此映射为自身的错误分类。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{NamingError, TransportError};
use crate::service::ServiceInstance;

/// 任意可双向读写的异步字节流，TCP 连接与测试用的内存管道都满足。
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 拨号成功后交给容器的已握手字节流。
pub type BoxedStream = Box<dyn AsyncStream>;

/// 单次拨号的上下文。
#[derive(Clone, Debug)]
pub struct DialerContext {
    /// 目标实例 ID。
    pub id: String,
    /// 目标服务名。
    pub name: String,
    /// `host:port`。
    pub address: String,
    /// 连接与握手的总时限。
    pub timeout: Duration,
}

/// 出站链路的拨号与握手策略。
///
/// - **意图 (Why)**：不同部署的握手方式不同（面向网关的令牌握手、服务间的身份声明握手），
///   容器只关心“拿到一条已握手的流”；
/// - **契约 (What)**：实现必须在 `ctx.timeout` 内完成或返回 [`crate::ErrorKind::Timeout`] 类错误；
///   返回的流上不得残留握手阶段未消费的数据。
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<BoxedStream, TransportError>;
}

/// 本地传输服务器。
///
/// # 教案式注释
/// - **意图 (Why)**：容器需要启动/停止本地服务、获知自身身份，并能把报文推送给某个已连接的频道
///   （终端用户会话或以身份握手接入的其它服务实例）；
/// - **逻辑 (How)**：`start` 运行接入循环直到 `shutdown` 被调用；`push` 按频道 ID 找到连接并写入一帧；
/// - **契约 (What)**：
///   - `start` 返回即表示服务循环结束，正常关闭返回 `Ok(())`；
///   - `shutdown(deadline)` 必须在期限内返回，超时以 [`crate::ErrorKind::Timeout`] 报告；
///   - 频道不存在时 `push` 返回 [`crate::ErrorKind::ChannelNotFound`]。
#[async_trait]
pub trait TransportServer: Send + Sync + 'static {
    /// 本地服务的自描述记录，用于自注册与回程地址。
    fn service(&self) -> &ServiceInstance;

    fn service_id(&self) -> &str {
        self.service().id()
    }

    fn service_name(&self) -> &str {
        self.service().name()
    }

    /// 对外公布的地址，空字符串表示不对外暴露。
    fn public_address(&self) -> &str {
        self.service().address()
    }

    /// 对外公布的端口，`0` 表示不对外暴露。
    fn public_port(&self) -> u16 {
        self.service().port()
    }

    async fn start(&self) -> Result<(), TransportError>;

    async fn shutdown(&self, deadline: Duration) -> Result<(), TransportError>;

    async fn push(&self, channel_id: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// 成员变化回调，参数为该服务当前的全部实例。
pub type SubscribeCallback = Arc<dyn Fn(Vec<ServiceInstance>) + Send + Sync>;

/// 服务发现与注册。
///
/// - **契约 (What)**：`subscribe` 的回调可能在任意线程异步触发，实现不得在持锁状态下调用回调；
///   `unsubscribe` 对未订阅的服务名是幂等的。
#[async_trait]
pub trait Naming: Send + Sync + 'static {
    /// 查询某服务当前的实例，`tags` 非空时只返回同时带有全部标签的实例。
    async fn find(&self, name: &str, tags: &[String]) -> Result<Vec<ServiceInstance>, NamingError>;

    async fn subscribe(&self, name: &str, callback: SubscribeCallback) -> Result<(), NamingError>;

    async fn unsubscribe(&self, name: &str) -> Result<(), NamingError>;

    async fn register(&self, service: &ServiceInstance) -> Result<(), NamingError>;

    async fn deregister(&self, id: &str) -> Result<(), NamingError>;
}
