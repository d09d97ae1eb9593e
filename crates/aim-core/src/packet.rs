//! # RoutedPacket：服务间流转的应用层报文
//!
//! ## 核心意图（Why）
//! - 业务逻辑、容器转发器与网关之间交换的唯一消息形态；头部决定路由（命令、会话频道），
//!   元数据侧表承载转发所需的目的服务与目的频道，包体对容器完全不透明。
//!
//! ## 线上布局（What）
//! 所有整数均为大端：
//!
//! ```text
//! magic(4) = c3 11 a3 65
//! header_len: u32 | header
//!     command: u32 len + utf8
//!     channel_id: u32 len + utf8
//!     sequence: u32
//!     flag: u8          (0 request / 1 response / 2 push)
//!     status: u16
//!     meta_count: u16
//!     meta*: key (u32 len + utf8), tag: u8, value
//!            tag 0 -> u32 len + utf8, tag 1 -> i64, tag 2 -> f64 bits
//! body_len: u32 | body
//! ```
//!
//! ## 风险提示（Trade-offs）
//! - 元数据保持插入顺序（`Vec` 而非映射），保证编解码逐位往返；按键查找为线性扫描，
//!   元数据条目通常只有个位数，开销可忽略。

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};

/// 路由报文魔数。
pub const PACKET_MAGIC: [u8; 4] = [0xc3, 0x11, 0xa3, 0x65];

/// 元数据键：目的服务实例 ID。转发时写入发送方自身 ID 作为回程地址，推送时写入目的实例 ID。
pub const META_DEST_SERVER: &str = "dest.server";

/// 元数据键：目的频道列表，逗号拼接。
pub const META_DEST_CHANNELS: &str = "dest.channels";

/// 报文方向标记。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Flag {
    #[default]
    Request = 0,
    Response = 1,
    Push = 2,
}

impl TryFrom<u8> for Flag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Flag::Request),
            1 => Ok(Flag::Response),
            2 => Ok(Flag::Push),
            other => Err(DecodeError::UnknownFlag(other)),
        }
    }
}

/// 业务状态码。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Status {
    #[default]
    Success = 0,
    NoDestination = 100,
    InvalidPacketBody = 101,
    InvalidCommand = 103,
    Unauthorized = 105,
    SystemException = 300,
    NotImplemented = 301,
    SessionNotFound = 404,
}

impl TryFrom<u16> for Status {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Success),
            100 => Ok(Status::NoDestination),
            101 => Ok(Status::InvalidPacketBody),
            103 => Ok(Status::InvalidCommand),
            105 => Ok(Status::Unauthorized),
            300 => Ok(Status::SystemException),
            301 => Ok(Status::NotImplemented),
            404 => Ok(Status::SessionNotFound),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// 报文头。`command` 与 `channel_id` 为空字符串时视为“未设置”。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Header {
    pub command: String,
    pub channel_id: String,
    pub sequence: u32,
    pub flag: Flag,
    pub status: Status,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command:{} channel:{} seq:{} flag:{:?} status:{:?}",
            self.command, self.channel_id, self.sequence, self.flag, self.status
        )
    }
}

/// 元数据取值。
#[derive(Clone, Debug, PartialEq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl MetaValue {
    /// 仅字符串取值返回 `Some`。
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(value) => Some(value),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            MetaValue::Str(_) => 0,
            MetaValue::Int(_) => 1,
            MetaValue::Float(_) => 2,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

/// 单条元数据。
#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    pub key: String,
    pub value: MetaValue,
}

/// 应用层路由报文。
///
/// # 教案式注释
/// - **意图 (Why)**：统一承载请求、响应与推送三种方向的消息，让容器只需读取头部与两条路由元数据；
/// - **契约 (What)**：`encode` 与 [`RoutedPacket::decode`] 互为逆操作，头部、元数据（含顺序）与包体逐位一致；
/// - **风险 (Trade-offs)**：`set_meta` 对同名键执行覆盖而非追加，避免一条报文多次转发后堆积重复的回程地址。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutedPacket {
    pub header: Header,
    meta: Vec<Meta>,
    pub body: Bytes,
}

impl RoutedPacket {
    /// 以命令字构造请求报文。
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            header: Header {
                command: command.into(),
                ..Header::default()
            },
            meta: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// 基于请求头构造响应：沿用命令、频道与序号，方向改为 `Response`。
    pub fn response_from(request: &Header) -> Self {
        Self {
            header: Header {
                command: request.command.clone(),
                channel_id: request.channel_id.clone(),
                sequence: request.sequence,
                flag: Flag::Response,
                status: Status::Success,
            },
            meta: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.header.channel_id = channel_id.into();
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.header.sequence = sequence;
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.header.flag = flag;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.header.status = status;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.header.command
    }

    pub fn channel_id(&self) -> &str {
        &self.header.channel_id
    }

    pub fn meta(&self) -> &[Meta] {
        &self.meta
    }

    pub fn get_meta(&self, key: &str) -> Option<&MetaValue> {
        self.meta
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    /// 读取字符串元数据；键不存在或取值不是字符串时返回 `None`。
    pub fn get_str_meta(&self, key: &str) -> Option<&str> {
        self.get_meta(key).and_then(MetaValue::as_str)
    }

    /// 写入元数据，同名键覆盖原值并保留原位置。
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        let key = key.into();
        let value = value.into();
        match self.meta.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value,
            None => self.meta.push(Meta { key, value }),
        }
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<MetaValue> {
        let index = self.meta.iter().position(|entry| entry.key == key)?;
        Some(self.meta.remove(index).value)
    }

    /// 编码为线上字节。
    ///
    /// 元数据条目超过 `u16::MAX`，或报文头、包体超过 `u32::MAX` 字节时返回 [`EncodeError`]。
    /// 报文头整体放得进 `u32` 时，其中每个字符串字段的长度前缀也不会溢出。
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let meta_count = u16::try_from(self.meta.len()).map_err(|_| EncodeError::TooManyMeta {
            count: self.meta.len(),
            max: usize::from(u16::MAX),
        })?;
        let header_len = self.header_len();
        let header_prefix = u32::try_from(header_len).map_err(|_| EncodeError::SectionTooLong {
            section: "header",
            len: header_len,
        })?;
        let body_prefix = u32::try_from(self.body.len()).map_err(|_| EncodeError::SectionTooLong {
            section: "body",
            len: self.body.len(),
        })?;

        let mut buf = BytesMut::with_capacity(4 + 4 + header_len + 4 + self.body.len());
        buf.put_slice(&PACKET_MAGIC);
        buf.put_u32(header_prefix);
        put_string(&mut buf, &self.header.command);
        put_string(&mut buf, &self.header.channel_id);
        buf.put_u32(self.header.sequence);
        buf.put_u8(self.header.flag as u8);
        buf.put_u16(self.header.status as u16);
        buf.put_u16(meta_count);
        for entry in &self.meta {
            put_string(&mut buf, &entry.key);
            buf.put_u8(entry.value.tag());
            match &entry.value {
                MetaValue::Str(value) => put_string(&mut buf, value),
                MetaValue::Int(value) => buf.put_i64(*value),
                MetaValue::Float(value) => buf.put_u64(value.to_bits()),
            }
        }
        buf.put_u32(body_prefix);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// 从线上字节解码。输入必须恰好是一条完整报文。
    pub fn decode(src: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader { buf: src };
        let magic = reader.array::<4>("magic")?;
        if magic != PACKET_MAGIC {
            return Err(DecodeError::BadMagic { found: magic });
        }

        let header_len = reader.u32("header_len")? as usize;
        let mut header_reader = Reader {
            buf: reader.take(header_len, "header")?,
        };
        let command = header_reader.string("command")?;
        let channel_id = header_reader.string("channel_id")?;
        let sequence = header_reader.u32("sequence")?;
        let flag = Flag::try_from(header_reader.u8("flag")?)?;
        let status = Status::try_from(header_reader.u16("status")?)?;
        let meta_count = header_reader.u16("meta_count")? as usize;
        let mut meta = Vec::with_capacity(meta_count.min(64));
        for _ in 0..meta_count {
            let key = header_reader.string("meta.key")?;
            let value = match header_reader.u8("meta.tag")? {
                0 => MetaValue::Str(header_reader.string("meta.value")?),
                1 => MetaValue::Int(header_reader.i64("meta.value")?),
                2 => MetaValue::Float(f64::from_bits(header_reader.u64("meta.value")?)),
                other => return Err(DecodeError::UnknownMetaTag(other)),
            };
            meta.push(Meta { key, value });
        }
        header_reader.finish("header")?;

        let body_len = reader.u32("body_len")? as usize;
        let body = Bytes::copy_from_slice(reader.take(body_len, "body")?);
        reader.finish("body")?;

        Ok(Self {
            header: Header {
                command,
                channel_id,
                sequence,
                flag,
                status,
            },
            meta,
            body,
        })
    }

    fn header_len(&self) -> usize {
        let strings = 4 + self.header.command.len() + 4 + self.header.channel_id.len();
        let fixed = 4 + 1 + 2 + 2;
        let meta: usize = self
            .meta
            .iter()
            .map(|entry| {
                4 + entry.key.len()
                    + 1
                    + match &entry.value {
                        MetaValue::Str(value) => 4 + value.len(),
                        MetaValue::Int(_) | MetaValue::Float(_) => 8,
                    }
            })
            .sum();
        strings + fixed + meta
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// 带边界检查的顺序读取器，所有越界都转换为 [`DecodeError::Truncated`]。
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn ensure(&self, needed: usize, field: &'static str) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        self.ensure(len, field)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        self.ensure(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        self.ensure(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        self.ensure(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        self.ensure(8, field)?;
        Ok(self.buf.get_i64())
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32(field)? as usize;
        let raw = self.take(len, field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    fn finish(self, section: &'static str) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes {
                section,
                count: self.buf.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> RoutedPacket {
        let mut packet = RoutedPacket::new("chat.user.talk")
            .with_channel("chan-42")
            .with_sequence(7)
            .with_flag(Flag::Push)
            .with_status(Status::SessionNotFound)
            .with_body(Bytes::from_static(b"\x00\x01hello"));
        packet.set_meta(META_DEST_SERVER, "gateway-01");
        packet.set_meta(META_DEST_CHANNELS, "c1,c2");
        packet.set_meta("retry", 3i64);
        packet.set_meta("weight", 0.5f64);
        packet
    }

    #[test]
    fn encode_then_decode_preserves_header_meta_and_body() {
        let packet = sample();
        let encoded = packet.encode().expect("编码");
        let decoded = RoutedPacket::decode(&encoded).expect("合法报文必须可解码");
        assert_eq!(decoded, packet);
        assert_eq!(decoded.meta()[1].key, META_DEST_CHANNELS, "元数据顺序必须保留");
    }

    #[test]
    fn set_meta_overwrites_in_place() {
        let mut packet = sample();
        packet.set_meta(META_DEST_SERVER, "chat-02");
        assert_eq!(packet.get_str_meta(META_DEST_SERVER), Some("chat-02"));
        assert_eq!(packet.meta().len(), 4);
        assert_eq!(packet.meta()[0].key, META_DEST_SERVER);

        assert_eq!(
            packet.remove_meta(META_DEST_SERVER),
            Some(MetaValue::from("chat-02"))
        );
        assert!(packet.remove_meta(META_DEST_SERVER).is_none());
        assert_eq!(packet.get_str_meta("retry"), None, "整数元数据不是字符串");
    }

    #[test]
    fn decode_rejects_bad_magic_truncation_and_trailing_bytes() {
        let encoded = sample().encode().expect("编码");

        let mut wrong_magic = encoded.to_vec();
        wrong_magic[0] = 0;
        assert!(matches!(
            RoutedPacket::decode(&wrong_magic),
            Err(DecodeError::BadMagic { .. })
        ));

        let truncated = &encoded[..encoded.len() - 1];
        assert!(matches!(
            RoutedPacket::decode(truncated),
            Err(DecodeError::Truncated { field: "body", .. })
        ));

        let mut trailing = encoded.to_vec();
        trailing.push(0xff);
        assert!(matches!(
            RoutedPacket::decode(&trailing),
            Err(DecodeError::TrailingBytes { section: "body", count: 1 })
        ));

        assert!(RoutedPacket::decode(b"").is_err());
    }

    #[test]
    fn response_from_copies_routing_fields() {
        let request = sample();
        let response = RoutedPacket::response_from(&request.header);
        assert_eq!(response.command(), "chat.user.talk");
        assert_eq!(response.channel_id(), "chan-42");
        assert_eq!(response.header.sequence, 7);
        assert_eq!(response.header.flag, Flag::Response);
        assert_eq!(response.header.status, Status::Success);
        assert!(response.meta().is_empty());
    }

    #[test]
    fn encode_refuses_meta_count_beyond_the_u16_field() {
        let mut packet = RoutedPacket::new("cmd").with_channel("c1");
        packet.meta = (0..=usize::from(u16::MAX))
            .map(|index| Meta {
                key: format!("k{index}"),
                value: MetaValue::Int(0),
            })
            .collect();
        assert_eq!(
            packet.encode(),
            Err(EncodeError::TooManyMeta {
                count: 65_536,
                max: 65_535,
            })
        );

        packet.meta.pop();
        let encoded = packet.encode().expect("恰好 u16::MAX 条仍可编码");
        let decoded = RoutedPacket::decode(&encoded).expect("上限处仍可往返");
        assert_eq!(decoded.meta().len(), 65_535);
    }

    fn arb_status() -> impl Strategy<Value = Status> {
        prop_oneof![
            Just(Status::Success),
            Just(Status::NoDestination),
            Just(Status::InvalidCommand),
            Just(Status::SystemException),
            Just(Status::SessionNotFound),
        ]
    }

    proptest! {
        #[test]
        fn prop_arbitrary_packets_survive_the_wire(
            command in ".{0,24}",
            channel in "[a-z0-9-]{0,16}",
            sequence in any::<u32>(),
            flag in 0u8..3,
            status in arb_status(),
            metas in proptest::collection::vec(("[a-z.]{1,8}", ".{0,12}"), 0..4),
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut packet = RoutedPacket::new(command)
                .with_channel(channel)
                .with_sequence(sequence)
                .with_flag(Flag::try_from(flag).unwrap())
                .with_status(status)
                .with_body(body);
            for (key, value) in metas {
                packet.set_meta(key, value);
            }
            let decoded = RoutedPacket::decode(&packet.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
