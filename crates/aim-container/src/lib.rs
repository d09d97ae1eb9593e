#![deny(unsafe_code)]
#![doc = r#"
# aim-container

## 设计动机（Why）
- **定位**：嵌入每个业务进程的服务网格容器。它把服务发现事件转换为出站连接池，
  为路由流量挑选具体实例（按会话频道粘滞的哈希选择），为新实例提供预热保护，
  并实现让报文从业务逻辑跳转到持有目标频道的网关的转发协议。
- **架构角色**：只面向 `aim-core` 的协作者接口（传输服务器、拨号器、命名服务）编程，
  具体实现由部署方注入。

## 核心契约（What）
- [`Container`]：`init → start → shutdown` 单向生命周期，每次迁移都是 CAS；
- [`ClientRegistry`]：每个依赖服务一张连接表，同一实例至多一条连接；
- [`Selector`] / [`HashSelector`]：CRC-32 取模选择就绪实例；
- `forward` / `push` / `deliver_locally`：出站转发、定向推送与入站本地扇出；
- [`ContainerOptions`]：从 TOML 加载的预热、关闭与保活参数。

## 风险与考量（Trade-offs）
- 连接断开后不会自动重连，重新建链依赖下一次发现事件；
- 候选集合变化时频道可能被映射到其它实例。
"#]

mod builder;
mod connection;
mod container;
mod dispatch;
mod error;
mod forward;
mod options;
mod registry;
mod selector;
mod signal;
mod warmup;

pub use connection::ConnectionHandle;
pub use container::{Container, LifecycleState};
pub use error::{ContainerError, DeliveryError, RoutingError};
pub use forward::DeliveryReport;
pub use options::{ContainerOptions, OptionsError};
pub use registry::ClientRegistry;
pub use selector::{HashSelector, Selector, hash_code};
pub use signal::termination;
