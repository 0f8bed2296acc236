//! Resolver API client with fail-over.
//!
//! The first resolver to query is picked at random. A resolver that answers
//! stays the target of later calls; one that times out is skipped in favor of
//! the next in the configured order. A call fails with
//! [`ClientError::NoResolversAvailable`] once every resolver was tried once.

use std::{
    net::{SocketAddr, SocketAddrV4},
    time::Duration,
};

use rand::Rng;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::{
    directory::InstanceRecord,
    net::UdpSocket,
    wire::{Kind, Message, ServiceId},
    Config,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Offline notifications wait on a liveness probe at the resolver.
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    NoResolversAvailable,
    /// `received` is `None` when the stream stopped before the expected
    /// message.
    ProtocolViolation {
        expected: Kind,
        received: Option<Kind>,
    },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoResolversAvailable => write!(f, "no resolvers available"),
            Self::ProtocolViolation {
                expected,
                received: Some(received),
            } => write!(f, "expected {expected:?}, received {received:?}"),
            Self::ProtocolViolation {
                expected,
                received: None,
            } => write!(f, "expected {expected:?}, received nothing"),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    pub fn of(err: &crate::Error) -> Option<Self> {
        err.downcast_ref().copied()
    }
}

#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    resolvers: Vec<SocketAddr>,
    index: usize,
    buf: Vec<u8>,
}

impl Client {
    pub fn new(socket: UdpSocket, resolvers: Vec<SocketAddr>) -> Self {
        let index = if resolvers.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..resolvers.len())
        };
        Self {
            socket,
            resolvers,
            index,
            buf: vec![0; 65536],
        }
    }

    pub async fn bind(config: &Config) -> crate::Result<Self> {
        Ok(Self::new(
            UdpSocket::bind_ephemeral().await?,
            config.resolvers.clone(),
        ))
    }

    /// Overrides the initial resolver. Fail-over still moves on from there.
    pub fn with_index(mut self, index: usize) -> Self {
        self.set_index(index);
        self
    }

    pub fn set_index(&mut self, index: usize) {
        if !self.resolvers.is_empty() {
            self.index = index % self.resolvers.len()
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub async fn request(&mut self, message: &Message, timeout: Duration) -> crate::Result<Message> {
        for _ in 0..self.resolvers.len() {
            let resolver = self.resolvers[self.index];
            debug!("send {:?} to {resolver}", message.kind());
            self.socket.send_to(resolver, message).await?;
            if let Some(reply) = self.receive(timeout).await? {
                return Ok(reply);
            }
            debug!("no answer from {resolver}, skipping");
            self.index = (self.index + 1) % self.resolvers.len()
        }
        Err(ClientError::NoResolversAvailable.into())
    }

    /// Next message from the current resolver, or `None` on timeout. Traffic
    /// from anyone else and malformed datagrams are dropped.
    async fn receive(&mut self, timeout: Duration) -> crate::Result<Option<Message>> {
        let resolver = self.resolvers[self.index];
        let deadline = Instant::now() + timeout;
        loop {
            let Ok(received) = timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await
            else {
                return Ok(None);
            };
            match received? {
                (remote, _) if remote != resolver => {
                    debug!("ignore datagram from {remote} while waiting on {resolver}")
                }
                (_, Ok(message)) => return Ok(Some(message)),
                (remote, Err(err)) => warn!("malformed reply from {remote}: {err}"),
            }
        }
    }

    pub async fn register(&mut self, service: ServiceId, agent_port: u16) -> crate::Result<bool> {
        let request = Message::RegisterService {
            service,
            agent_port,
        };
        Ok(self.request(&request, DEFAULT_TIMEOUT).await? == Message::Registered)
    }

    pub async fn resolve(&mut self, service: ServiceId) -> crate::Result<Option<SocketAddrV4>> {
        match self
            .request(&Message::RequestService { service }, DEFAULT_TIMEOUT)
            .await?
        {
            Message::ServiceOffer(address) => Ok(address),
            reply => Err(violation(Kind::ServiceOffer, Some(reply))),
        }
    }

    /// Reports an instance as unreachable. Returns whether the caller should
    /// retry the same address.
    pub async fn offline(&mut self, service: ServiceId, address: SocketAddrV4) -> crate::Result<bool> {
        match self
            .request(&Message::ServiceOffline { service, address }, OFFLINE_TIMEOUT)
            .await?
        {
            Message::ServiceThanks { retry } => Ok(retry),
            reply => Err(violation(Kind::ServiceThanks, Some(reply))),
        }
    }

    /// Pulls the full directory of one resolver.
    pub async fn sync(&mut self) -> crate::Result<Vec<InstanceRecord>> {
        let mut reply = Some(self.request(&Message::SyncRequest, DEFAULT_TIMEOUT).await?);
        let mut records = Vec::new();
        loop {
            match reply {
                Some(Message::SyncCommit) => break Ok(records),
                Some(Message::ListAdd {
                    service,
                    address,
                    agent_port,
                }) => records.push(InstanceRecord {
                    service,
                    address,
                    agent_port,
                }),
                reply => break Err(violation(Kind::SyncCommit, reply)),
            }
            reply = self.receive(DEFAULT_TIMEOUT).await?
        }
    }
}

fn violation(expected: Kind, received: Option<Message>) -> crate::Error {
    ClientError::ProtocolViolation {
        expected,
        received: received.as_ref().map(Message::kind),
    }
    .into()
}
