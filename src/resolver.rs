//! Resolver replica.
//!
//! A replica owns one copy of the service directory and processes its
//! inbound queue strictly one event at a time; that sequential stream is the
//! only thing serializing directory mutations.
//!
//! Startup runs in the `Sync` state: the directory is imported from a peer
//! through an embedded [`Client`], while the socket listener keeps queueing
//! whatever arrives meanwhile. When the import is done a `SelfReady` marker is
//! appended to the queue, behind every datagram forwarded so far. Until the
//! marker is reached only `ListAdd`/`ListRemove` are applied and everything
//! else is dropped, so replication traffic racing the import is never lost
//! and no client is answered from a half-imported directory.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use derive_more::From;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    agent::{probe, PROBE_TIMEOUT},
    client::ClientError,
    directory::{Directory, InstanceRecord},
    model::{event_channel, EventSender, EventSource},
    net::{ipv4, UdpSocket},
    task::{BackgroundMonitor, BackgroundSpawner, Lifecycle, Worker},
    wire::{decode, Message},
    Client, Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Sync,
    Ready,
}

#[derive(Debug, From)]
pub enum ResolverEvent {
    Datagram(SocketAddr, Bytes),
    #[from(ignore)]
    SelfReady,
    Probed(Probed),
}

/// Outcome of a liveness probe, fed back into the processing stream.
#[derive(Debug)]
pub struct Probed {
    record: InstanceRecord,
    reporter: SocketAddr,
    alive: bool,
}

#[derive(Debug)]
pub struct Resolver {
    id: usize,
    config: Arc<Config>,
    socket: UdpSocket,
    directory: Directory,
    state: RunState,
    event: EventSender<ResolverEvent>,
    spawner: BackgroundSpawner,
}

impl Resolver {
    /// Binds the configured address of replica `id` and runs it.
    pub fn start(id: usize, config: Arc<Config>) -> Worker {
        Worker::start(format!("resolver:{id}"), move |lifecycle| {
            async move {
                let socket = UdpSocket::bind(config.resolver_addr(id)?).await?;
                session(id, config, socket, lifecycle).await
            }
            .instrument(info_span!("resolver", id))
        })
    }

    /// Runs replica `id` on an already bound socket.
    pub fn start_on(id: usize, config: Arc<Config>, socket: UdpSocket) -> Worker {
        Worker::start(format!("resolver:{id}"), move |lifecycle| {
            session(id, config, socket, lifecycle).instrument(info_span!("resolver", id))
        })
    }
}

pub async fn session(
    id: usize,
    config: Arc<Config>,
    socket: UdpSocket,
    mut lifecycle: Lifecycle,
) -> crate::Result<()> {
    info!("listening on {}", socket.local_addr()?);
    let mut monitor = BackgroundMonitor::default();
    let spawner = monitor.spawner();
    let (event, mut source) = event_channel();
    spawner.spawn(socket.clone().listen_loop(event.clone()));
    let mut resolver = Resolver {
        id,
        directory: Directory::new(config.services),
        config,
        socket,
        state: RunState::Sync,
        event,
        spawner,
    };
    let result = tokio::select! {
        result = resolver.run(&mut source, &mut lifecycle) => result,
        result = monitor.wait() => result,
    };
    drop(resolver);
    let shutdown = monitor.shutdown().await;
    info!("resolver stopped");
    result.and(shutdown)
}

impl Resolver {
    async fn run(
        &mut self,
        source: &mut EventSource<ResolverEvent>,
        lifecycle: &mut Lifecycle,
    ) -> crate::Result<()> {
        tokio::select! {
            () = lifecycle.stopped() => return Ok(()),
            result = self.bootstrap() => result?,
        }
        loop {
            let event = tokio::select! {
                () = lifecycle.stopped() => break Ok(()),
                event = source.next() => event?,
            };
            self.handle(event).await?;
            if self.state == RunState::Ready {
                lifecycle.ready()
            }
        }
    }

    async fn bootstrap(&mut self) -> crate::Result<()> {
        let socket = UdpSocket::bind((self.socket.local_addr()?.ip(), 0)).await?;
        let mut client = Client::new(socket, self.config.peer_addrs(self.id));
        match client.sync().await {
            Ok(records) => {
                info!("received {} instances", records.len());
                for record in records {
                    self.directory.register(record);
                }
            }
            Err(err) if ClientError::of(&err) == Some(ClientError::NoResolversAvailable) => {
                info!("no resolver available, starting with an empty directory")
            }
            Err(err) => return Err(err.context("directory synchronization")),
        }
        self.event.send(ResolverEvent::SelfReady)
    }

    async fn handle(&mut self, event: ResolverEvent) -> crate::Result<()> {
        match event {
            ResolverEvent::Datagram(remote, buf) => match decode(&buf) {
                Ok(message) => self.handle_message(remote, message).await,
                Err(err) => {
                    warn!("malformed datagram from {remote}: {err}");
                    Ok(())
                }
            },
            ResolverEvent::SelfReady => {
                if self.state == RunState::Sync {
                    info!("ready with {} instances", self.directory.len());
                    self.state = RunState::Ready
                }
                Ok(())
            }
            ResolverEvent::Probed(probed) => self.handle_probed(probed).await,
        }
    }

    async fn handle_message(&mut self, remote: SocketAddr, message: Message) -> crate::Result<()> {
        if self.state == RunState::Sync && !message.kind().is_replication() {
            debug!("drop {:?} from {remote} while syncing", message.kind());
            return Ok(());
        }
        match message {
            Message::RegisterService {
                service,
                agent_port,
            } => {
                let Some(address) = ipv4(remote) else {
                    warn!("cannot register non-IPv4 instance {remote}");
                    return Ok(());
                };
                if service as usize >= self.directory.num_service() {
                    warn!("registration for unknown service [{service}] from {remote}");
                    return Ok(());
                }
                info!("register [{service}] {address} (agent:{agent_port})");
                let record = InstanceRecord {
                    service,
                    address,
                    agent_port,
                };
                self.directory.register(record);
                self.broadcast(&record.list_add()).await?;
                self.socket.send_to(remote, &Message::Registered).await
            }
            Message::RequestService { service } => {
                let offer = self.directory.issue(service).map(|record| record.address);
                debug!("request for [{service}] from {remote}, offer {offer:?}");
                self.socket
                    .send_to(remote, &Message::ServiceOffer(offer))
                    .await
            }
            Message::ServiceOffline { service, address } => {
                info!("offline notification for [{service}] {address} from {remote}");
                let Some(&record) = self.directory.lookup(service, address) else {
                    let thanks = Message::ServiceThanks { retry: false };
                    return self.socket.send_to(remote, &thanks).await;
                };
                let event = self.event.clone();
                self.spawner.spawn(async move {
                    let alive = probe(record.agent_address(), PROBE_TIMEOUT).await?;
                    event.send(Probed {
                        record,
                        reporter: remote,
                        alive,
                    })
                });
                Ok(())
            }
            Message::SyncRequest => {
                info!("sync request from {remote}");
                for record in self.directory.records() {
                    self.socket.send_to(remote, &record.list_add()).await?
                }
                self.socket.send_to(remote, &Message::SyncCommit).await
            }
            Message::ListAdd {
                service,
                address,
                agent_port,
            } => {
                let added = self.directory.register(InstanceRecord {
                    service,
                    address,
                    agent_port,
                });
                debug!("list add [{service}] {address} from {remote}, added: {added}");
                Ok(())
            }
            Message::ListRemove { service, address } => {
                let removed = self.directory.remove(service, address).is_some();
                debug!("list remove [{service}] {address} from {remote}, removed: {removed}");
                Ok(())
            }
            Message::Registered
            | Message::ServiceOffer(_)
            | Message::ServiceThanks { .. }
            | Message::Ping
            | Message::Pong
            | Message::SyncCommit
            | Message::SelfReady => {
                warn!("unexpected {:?} from {remote}", message.kind());
                Ok(())
            }
        }
    }

    async fn handle_probed(&mut self, probed: Probed) -> crate::Result<()> {
        let Probed {
            record,
            reporter,
            alive,
        } = probed;
        if alive {
            info!("[{}] {} is alive", record.service, record.address)
        } else if self
            .directory
            .remove(record.service, record.address)
            .is_some()
        {
            info!("evict [{}] {}", record.service, record.address);
            self.broadcast(&Message::ListRemove {
                service: record.service,
                address: record.address,
            })
            .await?
        }
        self.socket
            .send_to(reporter, &Message::ServiceThanks { retry: alive })
            .await
    }

    /// Sends to every other configured replica.
    async fn broadcast(&self, message: &Message) -> crate::Result<()> {
        for peer in self.config.peer_addrs(self.id) {
            self.socket.send_to(peer, message).await?
        }
        Ok(())
    }
}
