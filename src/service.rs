//! Sample workloads: request/response loops that register themselves with
//! the resolvers and keep an agent running for liveness probes.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, info_span, Instrument};

use crate::{
    agent::Agent,
    net::UdpSocket,
    task::{Lifecycle, Worker},
    wire::ServiceId,
    Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Sends every datagram back to its sender.
    Echo,
    /// Answers every datagram with the current Unix time in milliseconds,
    /// 8 bytes big-endian.
    Clock,
}

impl Workload {
    pub fn service(self) -> ServiceId {
        match self {
            Self::Echo => 0,
            Self::Clock => 1,
        }
    }

    fn respond(self, request: &[u8]) -> Bytes {
        match self {
            Self::Echo => Bytes::copy_from_slice(request),
            Self::Clock => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u64(now.as_millis() as _);
                buf.freeze()
            }
        }
    }

    pub fn start(self, name: impl Into<String>, config: Arc<Config>) -> Worker {
        let name = name.into();
        let span = info_span!("service", name);
        Worker::start(name.clone(), move |lifecycle| {
            session(self, name, config, lifecycle).instrument(span)
        })
    }
}

async fn session(
    workload: Workload,
    name: String,
    config: Arc<Config>,
    mut lifecycle: Lifecycle,
) -> crate::Result<()> {
    let socket = UdpSocket::bind_ephemeral().await?;
    let agent = Agent::register(&socket, &config, &name, workload.service()).await?;
    info!("{workload:?} service ready");
    lifecycle.ready();
    let result = serve(workload, &socket, &lifecycle).await;
    agent.stop().await?;
    info!("{workload:?} service stopped");
    result
}

async fn serve(workload: Workload, socket: &UdpSocket, lifecycle: &Lifecycle) -> crate::Result<()> {
    let mut buf = vec![0; 512];
    loop {
        let (len, remote) = tokio::select! {
            () = lifecycle.stopped() => break Ok(()),
            received = socket.inner().recv_from(&mut buf) => received?,
        };
        debug!("{len} bytes from {remote}");
        socket
            .inner()
            .send_to(&workload.respond(&buf[..len]), remote)
            .await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_current() {
        let reply = Workload::Clock.respond(b"what time is it");
        assert_eq!(reply.len(), 8);
        let millis = u64::from_be_bytes(reply[..].try_into().unwrap());
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        assert!(now.as_millis() as u64 - millis < 5000);
    }

    #[test]
    fn echo_is_identity() {
        assert_eq!(&Workload::Echo.respond(b"Hello World!")[..], b"Hello World!");
    }
}
