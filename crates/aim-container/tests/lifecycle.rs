//! 生命周期状态机契约：每次迁移都是 CAS，错误状态下调用失败且状态不变。

mod support;

use std::sync::Arc;

use aim_container::{Container, ContainerError, LifecycleState};
use aim_core::{InMemoryNaming, Naming, ServiceInstance};
use support::{MemoryDialer, RecordingServer, eventually, spawn_until_shutdown, within};

fn gateway() -> Arc<RecordingServer> {
    RecordingServer::new(ServiceInstance::new("gateway-01", "gateway", "127.0.0.1", 8000))
}

fn assert_violation(result: Result<(), ContainerError>, operation: &str) {
    match result {
        Err(ContainerError::LifecycleViolation { operation: op, .. }) => {
            assert_eq!(op, operation, "错误应指明被拒绝的操作");
        }
        other => panic!("期望 {operation} 返回 LifecycleViolation，实际为 {other:?}"),
    }
}

#[tokio::test]
async fn transitions_are_one_way_and_exclusive() {
    let container = Container::default();
    container.set_naming(Arc::new(InMemoryNaming::new()));

    assert_violation(
        container.start_until(std::future::ready(())).await,
        "start",
    );
    assert_violation(container.shutdown().await, "shutdown");
    assert_eq!(container.state(), LifecycleState::Uninitialized);

    container.init(gateway(), ["chat"]).expect("首次 init 应成功");
    assert_violation(container.init(gateway(), ["chat"]), "init");
    assert_eq!(container.state(), LifecycleState::Initialized);
    assert_violation(container.shutdown().await, "shutdown");

    let running = spawn_until_shutdown(&container);
    eventually("容器进入 started", || container.state() == LifecycleState::Started).await;
    assert_violation(
        container.start_until(std::future::ready(())).await,
        "start",
    );

    container.shutdown().await.expect("started 之后首次 shutdown 应成功");
    assert_eq!(container.state(), LifecycleState::Closed);
    assert_violation(container.shutdown().await, "shutdown");

    let outcome = within(running).await.expect("任务不应 panic");
    assert!(outcome.is_ok(), "其它句柄完成关闭后 start_until 正常返回");
}

#[tokio::test]
async fn start_requires_naming() {
    let container = Container::default();
    container.init(gateway(), Vec::<String>::new()).expect("init");
    let err = container
        .start_until(std::future::ready(()))
        .await
        .expect_err("缺少命名服务时不得启动");
    assert!(matches!(err, ContainerError::Configuration { .. }));
    assert_eq!(err.code(), "aim.container.configuration");
    assert_eq!(
        container.state(),
        LifecycleState::Initialized,
        "失败的 start 不得推进状态"
    );
}

#[tokio::test]
async fn stop_future_triggers_full_shutdown_sequence() {
    let naming = Arc::new(InMemoryNaming::new());
    let server = gateway();
    let container = Container::default();
    container.set_naming(naming.clone());
    let (dialer, _peers) = MemoryDialer::new();
    container.set_dialer(dialer);
    container.init(server.clone(), ["chat", "chat", "group"]).expect("init");
    assert_eq!(container.dependencies(), ["chat", "group"], "依赖集合去重且保序");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = container.clone();
    let task = tokio::spawn(async move {
        running
            .start_until(async {
                let _ = stop_rx.await;
            })
            .await
    });

    eventually("传输服务器已启动", || server.is_started()).await;
    eventually("两个依赖都已订阅", || naming.subscriber_count() == 2).await;
    let registered = naming.find("gateway", &[]).await.expect("find");
    assert_eq!(registered.len(), 1, "具备公开地址的服务应自注册");

    stop_tx.send(()).expect("发送终止请求");
    within(task)
        .await
        .expect("任务不应 panic")
        .expect("终止后关闭应成功");

    assert_eq!(container.state(), LifecycleState::Closed);
    assert!(server.is_stopped(), "关闭流程必须停止传输服务器");
    assert!(
        naming.find("gateway", &[]).await.expect("find").is_empty(),
        "关闭流程必须注销自身"
    );
    assert_eq!(naming.subscriber_count(), 0, "关闭流程必须退订全部依赖");
}

#[tokio::test]
async fn services_without_public_address_skip_registration() {
    let naming = Arc::new(InMemoryNaming::new());
    let server = RecordingServer::new(ServiceInstance::new("worker-01", "worker", "", 0));
    let container = Container::default();
    container.set_naming(naming.clone());
    container.init(server.clone(), Vec::<String>::new()).expect("init");

    let running = spawn_until_shutdown(&container);
    eventually("传输服务器已启动", || server.is_started()).await;
    assert!(naming.find("worker", &[]).await.expect("find").is_empty());

    container.shutdown().await.expect("shutdown");
    within(running).await.expect("join").expect("start_until");
}
