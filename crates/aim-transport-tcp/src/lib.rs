#![deny(unsafe_code)]
#![doc = r#"
# aim-transport-tcp

## 设计动机（Why）
- 为 `aim-core` 定义的 [`TransportServer`](aim_core::TransportServer) 与 [`Dialer`](aim_core::Dialer)
  提供 Tokio TCP 实现，使容器可以在真实网络上组成服务网格。

## 核心契约（What）
- [`TcpServer`]：接入循环 + 每连接任务；首帧握手决定频道 ID，`push` 按频道写帧，
  ping 自动回 pong，静默超时断开；关闭后 `push` 返回 `Cancelled`；
- [`TcpDialer`]：连接后写入一帧 [`InnerHandshake`](aim_core::InnerHandshake) 声明本地实例 ID；
- 所有 IO 失败都映射为带稳定错误码（`aim.transport.tcp.*`）的 [`TransportError`](aim_core::TransportError)。

## 风险与考量（Trade-offs）
- 未实现 TLS 与 WebSocket，`Protocol::Ws` 的实例需由其它传输承载。
"#]

mod dialer;
mod error;
mod server;
mod util;

pub use dialer::TcpDialer;
pub use server::{
    Acceptor, HandshakeAcceptor, MessageListener, TcpServer, TcpServerBuilder, TcpServerOptions,
};
pub use util::TcpSocketConfig;
