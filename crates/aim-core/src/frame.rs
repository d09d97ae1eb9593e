use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// 帧头长度：1 字节操作码 + 4 字节大端负载长度。
pub const FRAME_HEADER_LEN: usize = 5;

/// 默认单帧负载上限（4 MiB）。
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// 帧操作码，数值与 WebSocket 操作码保持一致，便于网关在两种传输之间透传。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    /// 是否为承载业务数据的帧；控制帧（ping/pong/close）返回 `false`。
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Binary | OpCode::Text | OpCode::Continuation)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(FrameError::UnknownOpCode(other)),
        }
    }
}

/// 连接上读写的最小单元。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    op_code: OpCode,
    payload: Bytes,
}

impl Frame {
    pub fn new(op_code: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            op_code,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    pub fn ping() -> Self {
        Self::new(OpCode::Ping, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::new(OpCode::Pong, Bytes::new())
    }

    pub fn close() -> Self {
        Self::new(OpCode::Close, Bytes::new())
    }

    pub fn op_code(&self) -> OpCode {
        self.op_code
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// `FrameCodec` 把字节流切分为 [`Frame`]，供 `FramedRead`/`FramedWrite` 使用。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 分发循环需要在“读下一帧 / 心跳 / 取消”之间 `select!`，手写的 `read_exact` 链不具备取消安全性，
///   借助 `tokio_util::codec` 的内部缓冲可以在任意分支胜出后安全地继续读取。
///
/// ## 逻辑 (How)
/// - 解码：先窥视 5 字节帧头，操作码非法或长度超限立即报错，不足一帧时预留空间并返回 `None`；
/// - 编码：写入操作码、大端 `u32` 长度与负载。
///
/// ## 契约 (What)
/// - `max_frame_length` 同时约束读写两端，写入超限帧返回 [`FrameError::TooLarge`] 而不是截断。
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let op_code = OpCode::try_from(src[0])?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_length {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_length,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { op_code, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        if len > self.max_frame_length || len > u32::MAX as usize {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_length,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_u8(item.op_code as u8);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
