//! Liveness side channel of a registered service instance.
//!
//! The agent owns a second socket next to the service socket and answers
//! `Ping` with `Pong`. Resolvers [`probe`] it before evicting an instance
//! reported offline.

use std::{
    net::{SocketAddr, SocketAddrV4},
    time::Duration,
};

use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    net::UdpSocket,
    task::{Lifecycle, Worker},
    wire::{Message, ServiceId},
    Client, Config,
};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Agent {
    worker: Worker,
}

impl Agent {
    /// Registers `socket` as an instance of `service`, advertising a freshly
    /// bound agent socket on the same IP, and starts answering pings on it.
    pub async fn register(
        socket: &UdpSocket,
        config: &Config,
        name: &str,
        service: ServiceId,
    ) -> crate::Result<Self> {
        let agent_socket = UdpSocket::bind((socket.local_addr()?.ip(), 0)).await?;
        let port = agent_socket.local_addr()?.port();
        info!("starting agent for {name} [{service}] on port {port}");
        let span = info_span!("agent", name);
        let mut worker = Worker::start(format!("agent:{name}"), |lifecycle| {
            respond(agent_socket, lifecycle).instrument(span)
        });
        worker.ready().await?;

        let mut client = Client::new(socket.clone(), config.resolvers.clone());
        match client.register(service, port).await {
            Ok(true) => info!("registration successful"),
            Ok(false) => {
                worker.stop().await?;
                crate::bail!("registration of {name} rejected")
            }
            Err(err) => {
                worker.stop().await?;
                return Err(err);
            }
        }
        Ok(Self { worker })
    }

    pub async fn stop(self) -> crate::Result<()> {
        self.worker.stop().await
    }
}

async fn respond(socket: UdpSocket, mut lifecycle: Lifecycle) -> crate::Result<()> {
    lifecycle.ready();
    let pong = Message::Pong;
    let mut buf = vec![0; 512];
    loop {
        let (remote, message) = tokio::select! {
            () = lifecycle.stopped() => break Ok(()),
            received = socket.recv_from(&mut buf) => received?,
        };
        match message {
            Ok(Message::Ping) => socket.send_to(remote, &pong).await?,
            Ok(message) => warn!("unexpected {:?} from {remote}", message.kind()),
            Err(err) => warn!("malformed datagram from {remote}: {err}"),
        }
    }
}

/// Whether the agent at `agent` answers a ping within `timeout`. The ping is
/// sent a second time after half the timeout.
pub async fn probe(agent: SocketAddrV4, timeout: Duration) -> crate::Result<bool> {
    let socket = UdpSocket::bind_ephemeral().await?;
    let agent = SocketAddr::from(agent);
    let start = Instant::now();
    let mut buf = vec![0; 512];
    for deadline in [start + timeout / 2, start + timeout] {
        socket.send_to(agent, &Message::Ping).await?;
        while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
            if let (remote, Ok(Message::Pong)) = received? {
                if remote == agent {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}
