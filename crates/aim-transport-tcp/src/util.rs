use crate::error::{OperationKind, map_io_error, timeout_error};
use aim_core::TransportError;
use serde::Deserialize;
use socket2::SockRef;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// 在时限内执行 IO Future，超时与 IO 失败分别映射为带操作码的 [`TransportError`]。
pub(crate) async fn run_with_timeout<F, T>(
    kind: OperationKind,
    limit: Duration,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(|err| map_io_error(kind, err)),
        Err(_) => Err(timeout_error(kind)),
    }
}

/// TCP 套接字选项的配置载体。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 网格链路以小报文为主，默认关闭 Nagle 以降低转发时延；
/// - `linger` 决定关闭连接时未发送数据的处理方式，服务端与拨号端应保持一致。
///
/// ## 契约（What）
/// - `nodelay`：是否设置 `TCP_NODELAY`，默认 `true`；
/// - `linger_ms`：`SO_LINGER` 毫秒数，缺省沿用内核默认策略；
/// - **后置条件**：`apply` 返回 `Ok(())` 时选项均已落地。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    pub linger_ms: Option<u64>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger_ms: None,
        }
    }
}

impl TcpSocketConfig {
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|value| value.as_millis() as u64);
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<(), TransportError> {
        stream
            .set_nodelay(self.nodelay)
            .and_then(|()| SockRef::from(stream).set_linger(self.linger()))
            .map_err(|err| map_io_error(crate::error::CONFIGURE, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CONNECT;
    use aim_core::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn run_with_timeout_reports_timeout_with_operation_context() {
        let pending = std::future::pending::<io::Result<()>>();
        let err = run_with_timeout(CONNECT, Duration::from_millis(50), pending)
            .await
            .expect_err("永不完成的操作必须超时");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.message().contains("tcp connect"));
    }

    #[test]
    fn socket_config_deserializes_with_defaults() {
        let config: TcpSocketConfig = toml::from_str("linger_ms = 250").expect("合法配置");
        assert!(config.nodelay);
        assert_eq!(config.linger(), Some(Duration::from_millis(250)));
    }
}
