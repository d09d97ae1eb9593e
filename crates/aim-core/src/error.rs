//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 线协议解码、帧编解码、传输 IO 与命名服务四类失败在此集中定义，
//!   上层 `aim-container` 直接包装这些类型，不再重复分类。
//!
//! ## 设计要求（What）
//! - 所有错误实现 `thiserror::Error`，可跨线程传播（`Send + Sync + 'static`）；
//! - [`TransportError`] 携带稳定错误码（`aim.transport.*`）与 [`ErrorKind`] 分类，
//!   供调用方决定是否重试或直接上报。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// 路由报文或握手负载解码失败的原因。
///
/// - **契约 (What)**：`field` 指向出错的字段名，便于排障时直接定位到布局中的位置；
/// - **风险 (Trade-offs)**：解码错误不会携带原始字节，避免日志放大，需要时由调用方自行十六进制转储。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    /// 剩余字节不足以读取下一个字段。
    #[error("packet truncated while reading `{field}`: need {needed} bytes, {remaining} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// 魔数不匹配，通常意味着对端发送了其它协议的负载。
    #[error("unexpected magic {found:02x?}")]
    BadMagic { found: [u8; 4] },

    /// 字符串字段不是合法 UTF-8。
    #[error("field `{field}` is not valid utf-8")]
    InvalidUtf8 { field: &'static str },

    #[error("unknown packet flag {0}")]
    UnknownFlag(u8),

    #[error("unknown status code {0}")]
    UnknownStatus(u16),

    #[error("unknown meta value tag {0}")]
    UnknownMetaTag(u8),

    /// 报文头长度声明与实际解析结果不一致，或包体之后仍有多余字节。
    #[error("{count} unexpected trailing bytes after `{section}`")]
    TrailingBytes { section: &'static str, count: usize },
}

/// 路由报文编码失败：某个长度超出线上布局的定长字段所能表达的范围。
///
/// - **契约 (What)**：编码前整体检查，失败时不产出任何字节，避免截断后的长度让对端解出另一条报文。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EncodeError {
    /// 元数据条目数超过 `u16` 计数字段的上限。
    #[error("packet carries {count} meta entries, limit is {max}")]
    TooManyMeta { count: usize, max: usize },

    /// 报文头或包体长度超过 `u32` 长度前缀的上限。
    #[error("`{section}` of {len} bytes does not fit a u32 length prefix")]
    SectionTooLong { section: &'static str, len: usize },
}

/// 帧编解码错误，`tokio_util::codec` 要求错误类型可由 `io::Error` 转换而来。
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame io: {0}")]
    Io(#[from] io::Error),

    /// 声明的负载长度超过配置上限；解码端据此拒绝继续缓冲，防止内存被恶意撑爆。
    #[error("frame payload of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("unknown frame opcode {0:#04x}")]
    UnknownOpCode(u8),
}

/// 传输错误的粗粒度分类。
///
/// - **意图 (Why)**：调用方只关心“要不要重试、要不要摘除连接”，不需要理解底层 `io::ErrorKind`；
/// - **契约 (What)**：`Timeout`/`Io` 可能是瞬时故障，`Closed`/`ChannelNotFound` 说明目标已不可达，
///   `Handshake` 表示对端拒绝了身份声明。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Timeout,
    Closed,
    Io,
    Handshake,
    ChannelNotFound,
    Cancelled,
    Protocol,
}

impl ErrorKind {
    /// 是否值得由上层重试。
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Io)
    }
}

/// 传输层的统一错误，形态上对齐“稳定错误码 + 可读文案 + 分类 + 可选底层原因”。
///
/// # 教案式说明
/// - **意图 (Why)**：TCP 实现、测试桩与容器之间只传递这一种错误，日志字段因此保持一致；
/// - **执行 (How)**：通过 [`TransportError::new`] 构造，再用 [`TransportError::with_source`] 附加底层原因；
/// - **契约 (What)**：`code` 为 `'static` 字符串，适合作为告警维度；`message` 面向人类阅读。
#[derive(Debug)]
pub struct TransportError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl TransportError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// 附加底层原因，例如 `io::Error` 或解码错误。
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}

/// 命名服务错误。
#[derive(Debug, Error)]
pub enum NamingError {
    /// 注销或查询的实例不存在。
    #[error("service instance `{id}` is not registered")]
    NotFound { id: String },

    /// 后端（Consul、etcd 等）返回的失败，原样携带文案。
    #[error("naming backend failure: {message}")]
    Backend { message: String },
}
