use aim_core::{ErrorKind, FrameError, TransportError};
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "aim.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "aim.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "aim.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "aim.transport.tcp.handshake_failed",
    message: "tcp handshake",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "aim.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "aim.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "aim.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "aim.transport.tcp.configure_failed",
    message: "tcp configure",
};

const CANCEL_CODE: &str = "aim.transport.tcp.cancelled";
const TIMEOUT_CODE: &str = "aim.transport.tcp.timeout";
const CHANNEL_NOT_FOUND_CODE: &str = "aim.transport.tcp.channel_not_found";
const ALREADY_STARTED_CODE: &str = "aim.transport.tcp.already_started";

/// 将 IO 错误映射为传输错误，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    let category = categorize_io_error(&error);
    TransportError::new(category, kind.code, format!("{}: {}", kind.message, error))
        .with_source(error)
}

/// 帧层错误：IO 部分沿用 [`map_io_error`]，超限与非法操作码归为协议错误。
pub(crate) fn map_frame_error(kind: OperationKind, error: FrameError) -> TransportError {
    match error {
        FrameError::Io(io) => map_io_error(kind, io),
        other => TransportError::new(
            ErrorKind::Protocol,
            kind.code,
            format!("{}: {}", kind.message, other),
        )
        .with_source(other),
    }
}

/// 构造取消错误。
pub(crate) fn cancelled_error(kind: OperationKind) -> TransportError {
    TransportError::new(
        ErrorKind::Cancelled,
        CANCEL_CODE,
        format!("{} cancelled", kind.message),
    )
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> TransportError {
    TransportError::new(
        ErrorKind::Timeout,
        TIMEOUT_CODE,
        format!("{} timed out", kind.message),
    )
}

pub(crate) fn channel_not_found(channel_id: &str) -> TransportError {
    TransportError::new(
        ErrorKind::ChannelNotFound,
        CHANNEL_NOT_FOUND_CODE,
        format!("channel `{channel_id}` is not connected"),
    )
}

pub(crate) fn already_started() -> TransportError {
    TransportError::new(
        ErrorKind::Protocol,
        ALREADY_STARTED_CODE,
        "tcp server accept loop already started",
    )
}

fn categorize_io_error(error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::TimedOut => ErrorKind::Timeout,
        Io::UnexpectedEof
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe => ErrorKind::Closed,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code_and_category() {
        let err = map_io_error(
            CONNECT,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.code(), "aim.transport.tcp.connect_failed");
        assert_eq!(err.kind(), ErrorKind::Io);

        let reset = map_io_error(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.kind(), ErrorKind::Closed, "对端复位意味着连接已不可用");

        let oversized = map_frame_error(READ, FrameError::TooLarge { len: 9, max: 4 });
        assert_eq!(oversized.kind(), ErrorKind::Protocol);
        assert_eq!(timeout_error(WRITE).kind(), ErrorKind::Timeout);
    }
}
