use std::sync::Arc;
use std::time::Duration;

use aim_core::ServiceInstance;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// 为新发现的实例安排一次 `Young -> Adult` 晋升。
///
/// # 教案式注释
/// - **意图 (Why)**：新实例刚上线时可能仍在加载状态，预热期内不参与路由选择；
/// - **逻辑 (How)**：计时任务只持有实例的弱引用，到期后对原子就绪字段执行 CAS；
///   任务的 [`AbortHandle`](tokio::task::AbortHandle) 存放在实例记录上，记录离开注册表时被取消；
///   容器关闭时共享令牌同样会终止它；
/// - **契约 (What)**：晋升只会作用于安排它的那条记录；记录已被释放或已是 `Adult` 时什么也不做。
pub(crate) fn arm_promotion(
    instance: &Arc<ServiceInstance>,
    delay: Duration,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
    runtime: &Handle,
) {
    let weak = Arc::downgrade(instance);
    let task = tracker.spawn_on(
        async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let Some(instance) = weak.upgrade() else {
                        return;
                    };
                    instance.clear_promotion();
                    if instance.promote() {
                        debug!(
                            service = %instance.name(),
                            instance = %instance.id(),
                            "instance promoted to adult"
                        );
                    }
                }
            }
        },
        runtime,
    );
    instance.arm_promotion(task.abort_handle());
}
