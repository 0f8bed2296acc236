#![allow(dead_code)]

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use compass::{net::UdpSocket, task::Worker, Client, Config, Resolver};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

pub async fn loopback() -> UdpSocket {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
}

pub fn v4(socket: &UdpSocket) -> SocketAddrV4 {
    compass::net::ipv4(socket.local_addr().unwrap()).unwrap()
}

/// Resolvers on loopback sockets bound up front, so configuration and
/// listening never race for a port.
pub struct Cluster {
    pub config: Arc<Config>,
    pub resolvers: Vec<Option<Worker>>,
}

impl Cluster {
    /// Binds `n` resolver sockets without starting any replica.
    pub async fn bind(n: usize, services: u8) -> (Self, Vec<UdpSocket>) {
        let mut sockets = Vec::new();
        for _ in 0..n {
            sockets.push(loopback().await)
        }
        let config = Config {
            resolvers: sockets
                .iter()
                .map(|socket| socket.local_addr().unwrap())
                .collect(),
            services,
        };
        let cluster = Self {
            config: Arc::new(config),
            resolvers: (0..n).map(|_| None).collect(),
        };
        (cluster, sockets)
    }

    /// Every replica up and ready, started one after another.
    pub async fn up(n: usize, services: u8) -> Self {
        let (mut cluster, sockets) = Self::bind(n, services).await;
        for (id, socket) in sockets.into_iter().enumerate() {
            cluster.start_on(id, socket).await
        }
        cluster
    }

    pub async fn start_on(&mut self, id: usize, socket: UdpSocket) {
        assert!(self.resolvers[id].is_none());
        let mut worker = Resolver::start_on(id, self.config.clone(), socket);
        worker.ready().await.unwrap();
        self.resolvers[id] = Some(worker)
    }

    /// (Re)starts replica `id` on its configured address.
    pub async fn start(&mut self, id: usize) {
        assert!(self.resolvers[id].is_none());
        let mut worker = Resolver::start(id, self.config.clone());
        worker.ready().await.unwrap();
        self.resolvers[id] = Some(worker)
    }

    pub async fn stop(&mut self, id: usize) {
        if let Some(worker) = self.resolvers[id].take() {
            worker.stop().await.unwrap()
        }
    }

    pub async fn shutdown(mut self) {
        for id in 0..self.resolvers.len() {
            self.stop(id).await
        }
    }

    pub async fn client(&self) -> Client {
        Client::bind(&self.config).await.unwrap()
    }

    /// A client that asks replica `id` first.
    pub async fn client_of(&self, id: usize) -> Client {
        self.client().await.with_index(id)
    }

    pub fn addr(&self, id: usize) -> SocketAddr {
        self.config.resolvers[id]
    }
}
