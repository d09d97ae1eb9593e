#![deny(unsafe_code)]
#![doc = r#"
# aim-core

## 设计动机（Why）
- **定位**：服务网格各进程共享的“最小公共语言”：连接上流动的帧、帧里携带的路由报文、
  服务实例的身份与就绪状态，以及容器依赖的三类外部协作者（传输服务器、拨号器、命名服务）。
- **架构角色**：`aim-transport-tcp` 实现这里的协作者接口，`aim-container` 只面向接口编程，
  二者通过本 crate 解耦。

## 核心契约（What）
- [`Frame`] 与 [`FrameCodec`]：一个操作码字节 + 大端 `u32` 长度前缀的负载；
- [`RoutedPacket`]：头部、路由元数据与不透明包体，编解码必须逐位往返一致；
- [`ServiceInstance`]：实例身份 + 原子就绪字段（`young`/`adult`），以及可取消的晋升计时器槽位；
- [`TransportServer`]、[`Dialer`]、[`Naming`]：容器消费的外部接口；[`InMemoryNaming`] 为进程内实现。

## 风险与考量（Trade-offs）
- 报文头使用自定义的大端二进制布局而非通用序列化格式，换取零依赖与可预测的长度计算；
  代价是新增字段需要同时升级编解码两端。
"#]

mod contract;
mod error;
mod frame;
mod handshake;
mod naming;
mod packet;
mod service;

pub use contract::{
    AsyncStream, BoxedStream, Dialer, DialerContext, Naming, SubscribeCallback, TransportServer,
};
pub use error::{DecodeError, EncodeError, ErrorKind, FrameError, NamingError, TransportError};
pub use frame::{DEFAULT_MAX_FRAME_LENGTH, FRAME_HEADER_LEN, Frame, FrameCodec, OpCode};
pub use handshake::{HANDSHAKE_MAGIC, InnerHandshake};
pub use naming::InMemoryNaming;
pub use packet::{
    Flag, Header, META_DEST_CHANNELS, META_DEST_SERVER, Meta, MetaValue, PACKET_MAGIC,
    RoutedPacket, Status,
};
pub use service::{KEY_SERVICE_STATE, Protocol, Readiness, ServiceInstance};
