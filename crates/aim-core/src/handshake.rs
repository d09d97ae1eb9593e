use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::frame::Frame;

/// 内部握手负载魔数，与路由报文魔数仅末字节不同，避免二者被误认。
pub const HANDSHAKE_MAGIC: [u8; 4] = [0xc3, 0x11, 0xa3, 0x66];

/// 服务间链路的身份声明握手。
///
/// - **意图 (Why)**：拨号方在连接建立后的第一帧声明自身实例 ID，服务端以此作为频道 ID 登记连接，
///   之后即可通过 `push(instance_id, ..)` 把报文回送给拨号方；
/// - **契约 (What)**：负载为 `magic(4) + u32 长度 + utf8 服务 ID`，封装在 `Binary` 帧中；
///   空 ID 视为非法。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InnerHandshake {
    pub service_id: String,
}

impl InnerHandshake {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.service_id.len());
        buf.put_slice(&HANDSHAKE_MAGIC);
        buf.put_u32(self.service_id.len() as u32);
        buf.put_slice(self.service_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, DecodeError> {
        if src.len() < 8 {
            return Err(DecodeError::Truncated {
                field: "handshake",
                needed: 8,
                remaining: src.len(),
            });
        }
        let mut magic = [0u8; 4];
        src.copy_to_slice(&mut magic);
        if magic != HANDSHAKE_MAGIC {
            return Err(DecodeError::BadMagic { found: magic });
        }
        let len = src.get_u32() as usize;
        if src.len() < len {
            return Err(DecodeError::Truncated {
                field: "service_id",
                needed: len,
                remaining: src.len(),
            });
        }
        if src.len() > len {
            return Err(DecodeError::TrailingBytes {
                section: "handshake",
                count: src.len() - len,
            });
        }
        let service_id = std::str::from_utf8(src)
            .map_err(|_| DecodeError::InvalidUtf8 { field: "service_id" })?;
        if service_id.is_empty() {
            return Err(DecodeError::Truncated {
                field: "service_id",
                needed: 1,
                remaining: 0,
            });
        }
        Ok(Self::new(service_id))
    }

    pub fn into_frame(self) -> Frame {
        Frame::binary(self.encode())
    }
}
