use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use bytes::Bytes;
use derive_more::From;
use tokio::net::ToSocketAddrs;
use tracing::trace;

use crate::{
    model::EventSender,
    wire::{decode, encode, MalformedMessage, Message},
};

/// A shareable datagram socket speaking the resolver wire format.
#[derive(Debug, Clone, From)]
pub struct UdpSocket(Arc<tokio::net::UdpSocket>);

impl From<tokio::net::UdpSocket> for UdpSocket {
    fn from(socket: tokio::net::UdpSocket) -> Self {
        Self(Arc::new(socket))
    }
}

impl UdpSocket {
    pub async fn bind(addr: impl ToSocketAddrs) -> crate::Result<Self> {
        Ok(tokio::net::UdpSocket::bind(addr).await?.into())
    }

    /// Binds an ephemeral port on the unspecified address.
    pub async fn bind_ephemeral() -> crate::Result<Self> {
        Self::bind((Ipv4Addr::UNSPECIFIED, 0)).await
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }

    pub fn inner(&self) -> &tokio::net::UdpSocket {
        &self.0
    }

    pub async fn send_to(&self, destination: SocketAddr, message: &Message) -> crate::Result<()> {
        trace!("send {:?} to {destination}", message.kind());
        self.0.send_to(&encode(message), destination).await?;
        Ok(())
    }

    /// Receives one datagram and decodes it. Transport errors fail the call;
    /// a malformed payload is handed back to the caller to deal with.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> crate::Result<(SocketAddr, Result<Message, MalformedMessage>)> {
        let (len, remote) = self.0.recv_from(buf).await?;
        Ok((remote, decode(&buf[..len])))
    }

    /// Forwards every inbound datagram, undecoded, into the event queue.
    pub async fn listen_loop<E>(self, event: EventSender<E>) -> crate::Result<()>
    where
        E: From<(SocketAddr, Bytes)>,
    {
        let mut buf = vec![0; 65536];
        loop {
            let (len, remote) = self.0.recv_from(&mut buf).await?;
            event.send((remote, Bytes::copy_from_slice(&buf[..len])))?
        }
    }
}

/// Instance addresses are IPv4 on the wire.
pub fn ipv4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(addr) => addr
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, addr.port())),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use crate::model::event_channel;

    use super::*;

    #[test]
    fn ipv4_normalization() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7000);
        assert_eq!(ipv4(addr.into()), Some(addr));
        let mapped = SocketAddr::from((addr.ip().to_ipv6_mapped(), 7000));
        assert_eq!(ipv4(mapped), Some(addr));
        assert_eq!(ipv4(SocketAddr::from((Ipv6Addr::LOCALHOST, 7000))), None);
    }

    #[tokio::test]
    async fn listen_forwards_raw_datagrams() -> crate::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = socket.local_addr()?;
        let (event, mut source) = event_channel::<(SocketAddr, Bytes)>();
        let listen = tokio::spawn(socket.listen_loop(event));

        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        peer.send_to(addr, &Message::Ping).await?;
        peer.inner().send_to(&[0xff], addr).await?;
        let (remote, payload) = source.next().await?;
        assert_eq!(remote, peer.local_addr()?);
        assert_eq!(decode(&payload), Ok(Message::Ping));
        let (_, payload) = source.next().await?;
        assert_eq!(decode(&payload), Err(MalformedMessage::UnknownKind(0xff)));
        listen.abort();
        Ok(())
    }
}
