use tracing::{info, warn};

/// 等待进程终止请求。
///
/// - Unix：SIGINT、SIGTERM、SIGHUP、SIGQUIT 任意其一；
/// - 其它平台：Ctrl-C。
///
/// 信号处理器全部注册失败时永不返回，避免误触发关闭。
pub async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let kinds = [
            ("SIGINT", SignalKind::interrupt()),
            ("SIGTERM", SignalKind::terminate()),
            ("SIGHUP", SignalKind::hangup()),
            ("SIGQUIT", SignalKind::quit()),
        ];
        let mut streams = Vec::with_capacity(kinds.len());
        for (name, kind) in kinds {
            match signal(kind) {
                Ok(stream) => streams.push((name, stream)),
                Err(err) => warn!(signal = name, error = %err, "failed to install signal handler"),
            }
        }
        if streams.is_empty() {
            std::future::pending::<()>().await;
        }
        let waits = streams
            .iter_mut()
            .map(|(name, stream)| Box::pin(async move {
                stream.recv().await;
                *name
            }));
        let (name, _, _) = futures::future::select_all(waits).await;
        info!(signal = name, "termination signal received");
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal = "ctrl-c", "termination signal received"),
            Err(err) => {
                warn!(error = %err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        }
    }
}
