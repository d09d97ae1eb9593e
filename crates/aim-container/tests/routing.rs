//! 发现驱动建链、预热与转发路由。

mod support;

use std::sync::Arc;
use std::time::Duration;

use aim_container::{Container, ContainerError, LifecycleState, RoutingError, Selector, hash_code};
use aim_core::{
    Header, InMemoryNaming, KEY_SERVICE_STATE, META_DEST_SERVER, Naming, OpCode, Protocol,
    RoutedPacket, ServiceInstance,
};
use futures::StreamExt;
use support::{MemoryDialer, RecordingServer, eventually, instance, spawn_until_shutdown, within};

struct Fixture {
    container: Container,
    naming: Arc<InMemoryNaming>,
    dialer: Arc<MemoryDialer>,
    peers: tokio::sync::mpsc::UnboundedReceiver<(
        String,
        tokio_util::codec::Framed<tokio::io::DuplexStream, aim_core::FrameCodec>,
    )>,
    running: tokio::task::JoinHandle<Result<(), ContainerError>>,
}

/// 预先注册 `initial` 中的 chat 实例，然后启动依赖 chat 的 gateway 容器。
///
/// 返回前容器已进入 started 并持有订阅，此后注册的实例一律走预热路径。
async fn start_gateway(initial: &[&str]) -> Fixture {
    let naming = Arc::new(InMemoryNaming::new());
    for id in initial {
        naming.register(&instance(id, "chat")).await.expect("register");
    }
    let (dialer, peers) = MemoryDialer::new();
    let container = Container::default();
    container.set_naming(naming.clone());
    container.set_dialer(dialer.clone());
    container
        .init(
            RecordingServer::new(ServiceInstance::new("gateway-01", "gateway", "", 0)),
            ["chat"],
        )
        .expect("init");
    let running = spawn_until_shutdown(&container);
    eventually("容器已启动且完成订阅", || {
        container.state() == LifecycleState::Started && naming.subscriber_count() == 1
    })
    .await;

    let registry = container.registry("chat").expect("chat 依赖已分配连接表");
    let expected = initial.len();
    eventually("初始实例全部建链", || registry.len() == expected).await;
    Fixture {
        container,
        naming,
        dialer,
        peers,
        running,
    }
}

impl Fixture {
    async fn stop(self) {
        self.container.shutdown().await.expect("shutdown");
        within(self.running).await.expect("join").expect("start_until");
    }
}

fn adult_ids(container: &Container) -> Vec<String> {
    container
        .registry("chat")
        .expect("registry")
        .services(KEY_SERVICE_STATE, "adult")
}

#[tokio::test(start_paused = true)]
async fn forward_rejects_invalid_packets_and_unknown_services() {
    let fixture = start_gateway(&[]).await;
    let container = &fixture.container;

    let err = container
        .forward("chat", RoutedPacket::new("").with_channel("chan-1"))
        .await
        .expect_err("空命令必须被拒绝");
    assert!(matches!(err, ContainerError::Validation { field: "command" }));

    let err = container
        .forward("chat", RoutedPacket::new("chat.talk"))
        .await
        .expect_err("空频道必须被拒绝");
    assert!(matches!(err, ContainerError::Validation { field: "channel_id" }));

    let err = container
        .forward("billing", RoutedPacket::new("chat.talk").with_channel("chan-1"))
        .await
        .expect_err("未声明的依赖");
    assert!(matches!(
        err,
        ContainerError::Routing(RoutingError::NotFound { ref service }) if service == "billing"
    ));

    let err = container
        .forward("chat", RoutedPacket::new("chat.talk").with_channel("chan-1"))
        .await
        .expect_err("没有任何实例");
    assert!(matches!(
        err,
        ContainerError::Routing(RoutingError::NoReadyInstance { .. })
    ));
    fixture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn initial_members_are_adult_and_new_members_warm_up() {
    let mut fixture = start_gateway(&["chat-01"]).await;
    assert_eq!(adult_ids(&fixture.container), vec!["chat-01"], "初始查询的实例立即可用");

    fixture
        .naming
        .register(&instance("chat-02", "chat"))
        .await
        .expect("register");
    let registry = fixture.container.registry("chat").expect("registry");
    eventually("新实例建链", || registry.contains("chat-02")).await;
    assert_eq!(
        adult_ids(&fixture.container),
        vec!["chat-01"],
        "预热期内的实例不参与选择"
    );
    assert_eq!(
        registry.services(KEY_SERVICE_STATE, "young"),
        vec!["chat-02"]
    );

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(adult_ids(&fixture.container), vec!["chat-01", "chat-02"]);

    let dialed = fixture.dialer.dialed();
    assert_eq!(dialed.iter().filter(|id| *id == "chat-02").count(), 1, "同一实例只拨号一次");
    while let Ok((id, _peer)) = fixture.peers.try_recv() {
        assert!(id.starts_with("chat-"));
    }
    fixture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn forward_with_only_young_candidates_reports_no_ready_instance() {
    let fixture = start_gateway(&[]).await;
    fixture
        .naming
        .register(&instance("chat-01", "chat"))
        .await
        .expect("register");
    let registry = fixture.container.registry("chat").expect("registry");
    eventually("新实例建链", || registry.contains("chat-01")).await;

    let err = fixture
        .container
        .forward("chat", RoutedPacket::new("chat.talk").with_channel("chan-1"))
        .await
        .expect_err("全部候选仍在预热");
    assert_eq!(err.code(), "aim.container.routing.no_ready_instance");
    fixture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn forward_selects_by_channel_checksum_and_stamps_return_address() {
    let mut fixture = start_gateway(&["A", "B", "C"]).await;
    let mut peers = std::collections::HashMap::new();
    while peers.len() < 3 {
        let (id, peer) = within(fixture.peers.recv()).await.expect("拨号产生对端");
        peers.insert(id, peer);
    }
    assert_eq!(hash_code("chan-2") % 3, 1);

    fixture
        .container
        .forward(
            "chat",
            RoutedPacket::new("chat.user.talk")
                .with_channel("chan-2")
                .with_body(&b"hi"[..]),
        )
        .await
        .expect("转发应成功");

    let peer_b = peers.get_mut("B").expect("B 的对端");
    let frame = within(peer_b.next())
        .await
        .expect("B 应收到帧")
        .expect("帧合法");
    assert_eq!(frame.op_code(), OpCode::Binary);
    let packet = RoutedPacket::decode(frame.payload()).expect("报文合法");
    assert_eq!(packet.command(), "chat.user.talk");
    assert_eq!(packet.body.as_ref(), b"hi");
    assert_eq!(packet.get_str_meta(META_DEST_SERVER), Some("gateway-01"));

    for id in ["A", "C"] {
        let peer = peers.get_mut(id).expect("对端");
        let nothing = tokio::time::timeout(Duration::from_millis(50), peer.next()).await;
        assert!(nothing.is_err(), "{id} 不应收到报文");
    }
    fixture.stop().await;
}

struct FirstCandidate;

impl Selector for FirstCandidate {
    fn lookup<'a>(&self, _header: &Header, candidates: &'a [String]) -> Option<&'a str> {
        candidates.first().map(String::as_str)
    }
}

#[tokio::test(start_paused = true)]
async fn selector_can_be_swapped_at_runtime() {
    let mut fixture = start_gateway(&["A", "B", "C"]).await;
    let mut peers = std::collections::HashMap::new();
    while peers.len() < 3 {
        let (id, peer) = within(fixture.peers.recv()).await.expect("对端");
        peers.insert(id, peer);
    }

    fixture.container.set_selector(FirstCandidate);
    fixture
        .container
        .forward("chat", RoutedPacket::new("cmd").with_channel("chan-2"))
        .await
        .expect("转发");
    let frame = within(peers.get_mut("A").expect("A").next())
        .await
        .expect("A 应收到帧")
        .expect("帧合法");
    assert_eq!(frame.op_code(), OpCode::Binary);
    fixture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unsupported_protocol_and_refused_dial_leave_registry_untouched() {
    let fixture = start_gateway(&[]).await;
    fixture.dialer.refuse("chat-down");
    fixture
        .naming
        .register(&instance("chat-ws", "chat").with_protocol(Protocol::Ws))
        .await
        .expect("register");
    fixture
        .naming
        .register(&instance("chat-down", "chat"))
        .await
        .expect("register");

    eventually("拒绝的拨号已尝试", || {
        fixture.dialer.dialed().contains(&"chat-down".to_owned())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let registry = fixture.container.registry("chat").expect("registry");
    assert!(registry.is_empty(), "失败的建链不得登记");
    assert!(
        !fixture.dialer.dialed().contains(&"chat-ws".to_owned()),
        "协议不匹配的实例不应被拨号"
    );
    fixture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn peer_disconnect_removes_the_handle() {
    let mut fixture = start_gateway(&["chat-01"]).await;
    let (_, peer) = within(fixture.peers.recv()).await.expect("对端");
    let registry = fixture.container.registry("chat").expect("registry");
    let handle = registry.get("chat-01").expect("已登记");

    drop(peer);
    eventually("断开后移除句柄", || registry.is_empty()).await;
    assert!(handle.is_closed());

    let err = fixture
        .container
        .forward("chat", RoutedPacket::new("cmd").with_channel("chan-1"))
        .await
        .expect_err("没有可用实例");
    assert!(matches!(
        err,
        ContainerError::Routing(RoutingError::NoReadyInstance { .. })
    ));
    fixture.stop().await;
}
