//! 网格回显演示：在同一进程内启动 gateway 与 chat 两个节点，客户端经 gateway 把消息送到 chat 再回到自身。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=aim_container=debug cargo run --bin mesh_echo -- "hello" "world"
//! AIM_OPTIONS=mesh.toml cargo run --bin mesh_echo -- --serve
//! ```
//! - 位置参数：依次发送的消息体，缺省发送一条 `ping`；
//! - `--serve`：发送完毕后继续运行，直到收到终止信号；
//! - `AIM_OPTIONS`：可选，容器参数的 TOML 文件路径（字段见 `ContainerOptions`）。
//!
//! # 设计要点（Why）
//! - 两个节点各持有同一进程内命名服务的一个会话，chat 先于 gateway 注册，gateway 的首次查询即可把它视为就绪实例；
//! - 监听器只把入站报文投递到通道，由持有容器的工作任务处理，监听器不需要反向引用容器。

use std::sync::Arc;
use std::time::Duration;

use aim_container::{Container, ContainerOptions, termination};
use aim_core::{
    Dialer, DialerContext, Frame, FrameCodec, InMemoryNaming, KEY_SERVICE_STATE,
    META_DEST_CHANNELS, META_DEST_SERVER, Naming, OpCode, RoutedPacket, ServiceInstance,
    TransportServer,
};
use aim_transport_tcp::{MessageListener, TcpDialer, TcpServer};
use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("网格回显失败: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut serve = false;
    let mut messages = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--serve" => serve = true,
            flag if flag.starts_with("--") => bail!("未知参数 `{flag}`"),
            _ => messages.push(arg),
        }
    }
    if messages.is_empty() {
        messages.push("ping".to_owned());
    }

    let options = load_options()?;
    let naming = Arc::new(InMemoryNaming::new());

    let (chat, chat_inbox) = Node::start("chat-01", "chat", &[], &options, Arc::new(naming.session())).await?;
    tokio::spawn(chat_worker(chat.container.clone(), chat_inbox));
    wait_until("chat 完成注册", || {
        let naming = naming.clone();
        async move {
            naming
                .find("chat", &[])
                .await
                .is_ok_and(|found| !found.is_empty())
        }
    })
    .await?;

    let (gateway, gateway_inbox) =
        Node::start("gateway-01", "gateway", &["chat"], &options, Arc::new(naming.session())).await?;
    tokio::spawn(gateway_worker(gateway.container.clone(), gateway_inbox));
    let registry = gateway
        .container
        .registry("chat")
        .context("gateway 未声明 chat 依赖")?;
    wait_until("gateway 与 chat 建链", || {
        let ready = !registry.services(KEY_SERVICE_STATE, "adult").is_empty();
        async move { ready }
    })
    .await?;

    let outcome = echo(&gateway, &messages).await;
    if outcome.is_ok() && serve {
        info!("serving, waiting for termination signal");
        termination().await;
    }

    gateway.stop().await;
    chat.stop().await;
    outcome
}

async fn wait_until<F, Fut>(what: &str, mut probe: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(REPLY_TIMEOUT, async {
        while !probe().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    waited.with_context(|| format!("等待超时：{what}"))
}

fn load_options() -> anyhow::Result<ContainerOptions> {
    let Some(path) = std::env::var_os("AIM_OPTIONS") else {
        return Ok(ContainerOptions::default());
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("读取配置文件 {} 失败", path.to_string_lossy()))?;
    ContainerOptions::from_toml_str(&raw).context("解析容器配置失败")
}

/// 监听器：把每个频道上的入站报文交给工作任务。
struct Inbox {
    tx: mpsc::UnboundedSender<(String, Bytes)>,
}

#[async_trait]
impl MessageListener for Inbox {
    async fn receive(&self, channel_id: &str, payload: Bytes) {
        if self.tx.send((channel_id.to_owned(), payload)).is_err() {
            warn!(channel = channel_id, "worker gone, inbound packet dropped");
        }
    }
}

struct Node {
    container: Container,
    server: Arc<TcpServer>,
    running: JoinHandle<Result<(), aim_container::ContainerError>>,
}

impl Node {
    async fn start(
        id: &str,
        name: &str,
        dependencies: &[&str],
        options: &ContainerOptions,
        naming: Arc<InMemoryNaming>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<(String, Bytes)>)> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("绑定回环端口失败")?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(
            TcpServer::builder(
                ServiceInstance::new(id, name, "127.0.0.1", port),
                Arc::new(Inbox { tx }),
            )
            .from_listener(listener)?,
        );

        let container = Container::new(options.clone());
        container.set_naming(naming);
        container.set_dialer(Arc::new(TcpDialer::new(id)));
        container.init(server.clone(), dependencies.iter().copied())?;
        let running = {
            let container = container.clone();
            tokio::spawn(async move { container.start_until(std::future::pending::<()>()).await })
        };
        info!(instance = id, service = name, port, "node started");
        Ok((
            Self {
                container,
                server,
                running,
            },
            rx,
        ))
    }

    async fn stop(self) {
        if let Err(err) = self.container.shutdown().await {
            warn!(error = %err, "shutdown reported an error");
        }
        match self.running.await {
            Ok(Err(err)) => warn!(error = %err, "container exited with error"),
            Err(err) => warn!(error = %err, "container task panicked"),
            Ok(Ok(())) => {}
        }
    }
}

/// gateway：客户端频道上的请求转发给 chat，频道 ID 即客户端身份。
async fn gateway_worker(container: Container, mut inbox: mpsc::UnboundedReceiver<(String, Bytes)>) {
    while let Some((channel, payload)) = inbox.recv().await {
        let packet = match RoutedPacket::decode(&payload) {
            Ok(packet) => packet.with_channel(channel),
            Err(err) => {
                warn!(channel = %channel, error = %err, "client sent an undecodable packet");
                continue;
            }
        };
        if let Err(err) = container.forward("chat", packet).await {
            warn!(error = %err, code = err.code(), "forward to chat failed");
        }
    }
}

/// chat：回显请求体，推回请求携带的回程实例。
async fn chat_worker(container: Container, mut inbox: mpsc::UnboundedReceiver<(String, Bytes)>) {
    while let Some((peer, payload)) = inbox.recv().await {
        let request = match RoutedPacket::decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(peer = %peer, error = %err, "undecodable request");
                continue;
            }
        };
        let Some(origin) = request.get_str_meta(META_DEST_SERVER).map(str::to_owned) else {
            warn!(peer = %peer, command = %request.command(), "request without return address");
            continue;
        };
        let mut reply = RoutedPacket::response_from(&request.header).with_body(request.body.clone());
        reply.set_meta(META_DEST_CHANNELS, request.channel_id());
        if let Err(err) = container.push(&origin, reply).await {
            warn!(origin = %origin, error = %err, "push back failed");
        }
    }
}

async fn echo(gateway: &Node, messages: &[String]) -> anyhow::Result<()> {
    let stream = TcpDialer::new("client-1")
        .dial_and_handshake(&DialerContext {
            id: gateway.server.service_id().to_owned(),
            name: gateway.server.service_name().to_owned(),
            address: gateway.server.local_addr().to_string(),
            timeout: REPLY_TIMEOUT,
        })
        .await
        .context("客户端接入 gateway 失败")?;
    let mut client = Framed::new(stream, FrameCodec::default());

    for (sequence, message) in (1u32..).zip(messages) {
        let request = RoutedPacket::new("demo.echo")
            .with_sequence(sequence)
            .with_body(Bytes::from(message.clone().into_bytes()));
        client.send(Frame::binary(request.encode()?)).await?;

        let reply = tokio::time::timeout(REPLY_TIMEOUT, async {
            loop {
                match client.next().await {
                    Some(Ok(frame)) if frame.op_code() == OpCode::Binary => {
                        return Ok(frame);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(anyhow::Error::new(err)),
                    None => bail!("gateway 关闭了客户端连接"),
                }
            }
        })
        .await
        .context("等待回显超时")??;

        let packet = RoutedPacket::decode(reply.payload())?;
        info!(
            sequence = packet.header.sequence,
            channel = %packet.channel_id(),
            body = %String::from_utf8_lossy(&packet.body),
            "echo received"
        );
        println!("{}", String::from_utf8_lossy(&packet.body));
    }
    Ok(())
}
