//! Binary framing of resolver protocol messages.
//!
//! Every datagram carries exactly one message: a leading kind byte (the
//! ordinal of [`Kind`]) followed by the kind's fixed payload. Simple kinds
//! carry no payload. Integers are big-endian, addresses are 4 raw IPv4
//! octets followed by the port widened to 4 bytes.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub type ServiceId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Kind {
    // public, client and replica
    RegisterService,
    Registered,
    RequestService,
    ServiceOffer,
    ServiceOffline,
    ServiceThanks,
    Ping,
    Pong,
    // private, replica and replica
    SyncRequest,
    SyncCommit,
    ListAdd,
    ListRemove,
    SelfReady,
}

impl Kind {
    pub const ALL: [Self; 13] = [
        Self::RegisterService,
        Self::Registered,
        Self::RequestService,
        Self::ServiceOffer,
        Self::ServiceOffline,
        Self::ServiceThanks,
        Self::Ping,
        Self::Pong,
        Self::SyncRequest,
        Self::SyncCommit,
        Self::ListAdd,
        Self::ListRemove,
        Self::SelfReady,
    ];

    /// Whether the kind belongs to the replica-to-replica surface.
    pub fn is_replication(self) -> bool {
        matches!(self, Self::ListAdd | Self::ListRemove)
    }
}

impl TryFrom<u8> for Kind {
    type Error = MalformedMessage;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(MalformedMessage::UnknownKind(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    RegisterService {
        service: ServiceId,
        agent_port: u16,
    },
    Registered,
    RequestService {
        service: ServiceId,
    },
    ServiceOffer(Option<SocketAddrV4>),
    ServiceOffline {
        service: ServiceId,
        address: SocketAddrV4,
    },
    ServiceThanks {
        retry: bool,
    },
    Ping,
    Pong,
    SyncRequest,
    SyncCommit,
    ListAdd {
        service: ServiceId,
        address: SocketAddrV4,
        agent_port: u16,
    },
    ListRemove {
        service: ServiceId,
        address: SocketAddrV4,
    },
    SelfReady,
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Self::RegisterService { .. } => Kind::RegisterService,
            Self::Registered => Kind::Registered,
            Self::RequestService { .. } => Kind::RequestService,
            Self::ServiceOffer(_) => Kind::ServiceOffer,
            Self::ServiceOffline { .. } => Kind::ServiceOffline,
            Self::ServiceThanks { .. } => Kind::ServiceThanks,
            Self::Ping => Kind::Ping,
            Self::Pong => Kind::Pong,
            Self::SyncRequest => Kind::SyncRequest,
            Self::SyncCommit => Kind::SyncCommit,
            Self::ListAdd { .. } => Kind::ListAdd,
            Self::ListRemove { .. } => Kind::ListRemove,
            Self::SelfReady => Kind::SelfReady,
        }
    }

    /// The payload-free message of a simple kind.
    pub fn simple(kind: Kind) -> Option<Self> {
        Some(match kind {
            Kind::Registered => Self::Registered,
            Kind::Ping => Self::Ping,
            Kind::Pong => Self::Pong,
            Kind::SyncRequest => Self::SyncRequest,
            Kind::SyncCommit => Self::SyncCommit,
            Kind::SelfReady => Self::SelfReady,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedMessage {
    Empty,
    UnknownKind(u8),
    Truncated(Kind),
    PortOutOfRange(u32),
}

impl std::fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty datagram"),
            Self::UnknownKind(tag) => write!(f, "unknown message kind {tag}"),
            Self::Truncated(kind) => write!(f, "truncated {kind:?} payload"),
            Self::PortOutOfRange(port) => write!(f, "port {port} out of range"),
        }
    }
}

impl std::error::Error for MalformedMessage {}

pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(message.kind() as u8);
    match *message {
        Message::RegisterService {
            service,
            agent_port,
        } => {
            buf.put_u8(service);
            put_port(&mut buf, agent_port)
        }
        Message::RequestService { service } => buf.put_u8(service),
        Message::ServiceOffer(address) => {
            buf.put_u8(address.is_some() as u8);
            if let Some(address) = address {
                put_address(&mut buf, address)
            }
        }
        Message::ServiceOffline { service, address }
        | Message::ListRemove { service, address } => {
            buf.put_u8(service);
            put_address(&mut buf, address)
        }
        Message::ServiceThanks { retry } => buf.put_u8(retry as u8),
        Message::ListAdd {
            service,
            address,
            agent_port,
        } => {
            buf.put_u8(service);
            put_address(&mut buf, address);
            put_port(&mut buf, agent_port)
        }
        Message::Registered
        | Message::Ping
        | Message::Pong
        | Message::SyncRequest
        | Message::SyncCommit
        | Message::SelfReady => {}
    }
    buf.freeze()
}

pub fn decode(mut buf: &[u8]) -> Result<Message, MalformedMessage> {
    if !buf.has_remaining() {
        return Err(MalformedMessage::Empty);
    }
    let kind = Kind::try_from(buf.get_u8())?;
    if let Some(message) = Message::simple(kind) {
        return Ok(message);
    }
    let mut payload = Payload { buf, kind };
    let message = match kind {
        Kind::RegisterService => Message::RegisterService {
            service: payload.u8()?,
            agent_port: payload.port()?,
        },
        Kind::RequestService => Message::RequestService {
            service: payload.u8()?,
        },
        Kind::ServiceOffer => {
            let available = payload.bool()?;
            Message::ServiceOffer(if available {
                Some(payload.address()?)
            } else {
                None
            })
        }
        Kind::ServiceOffline => Message::ServiceOffline {
            service: payload.u8()?,
            address: payload.address()?,
        },
        Kind::ServiceThanks => Message::ServiceThanks {
            retry: payload.bool()?,
        },
        Kind::ListAdd => Message::ListAdd {
            service: payload.u8()?,
            address: payload.address()?,
            agent_port: payload.port()?,
        },
        Kind::ListRemove => Message::ListRemove {
            service: payload.u8()?,
            address: payload.address()?,
        },
        _ => unreachable!("{kind:?} is simple"),
    };
    Ok(message)
}

fn put_port(buf: &mut BytesMut, port: u16) {
    buf.put_u32(port as _)
}

fn put_address(buf: &mut BytesMut, address: SocketAddrV4) {
    buf.put_slice(&address.ip().octets());
    put_port(buf, address.port())
}

struct Payload<'a> {
    buf: &'a [u8],
    kind: Kind,
}

impl Payload<'_> {
    fn ensure(&self, len: usize) -> Result<(), MalformedMessage> {
        if self.buf.remaining() < len {
            Err(MalformedMessage::Truncated(self.kind))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, MalformedMessage> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool, MalformedMessage> {
        Ok(self.u8()? != 0)
    }

    fn port(&mut self) -> Result<u16, MalformedMessage> {
        self.ensure(4)?;
        let port = self.buf.get_u32();
        u16::try_from(port).map_err(|_| MalformedMessage::PortOutOfRange(port))
    }

    fn address(&mut self) -> Result<SocketAddrV4, MalformedMessage> {
        self.ensure(4)?;
        let mut octets = [0; 4];
        self.buf.copy_to_slice(&mut octets);
        Ok(SocketAddrV4::new(Ipv4Addr::from(octets), self.port()?))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn address() -> impl Strategy<Value = SocketAddrV4> {
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(octets, port)| SocketAddrV4::new(octets.into(), port))
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u8>(), any::<u16>()).prop_map(|(service, agent_port)| {
                Message::RegisterService {
                    service,
                    agent_port,
                }
            }),
            any::<u8>().prop_map(|service| Message::RequestService { service }),
            proptest::option::of(address()).prop_map(Message::ServiceOffer),
            (any::<u8>(), address())
                .prop_map(|(service, address)| Message::ServiceOffline { service, address }),
            any::<bool>().prop_map(|retry| Message::ServiceThanks { retry }),
            (any::<u8>(), address(), any::<u16>()).prop_map(|(service, address, agent_port)| {
                Message::ListAdd {
                    service,
                    address,
                    agent_port,
                }
            }),
            (any::<u8>(), address())
                .prop_map(|(service, address)| Message::ListRemove { service, address }),
            proptest::sample::select(
                Kind::ALL
                    .into_iter()
                    .filter_map(Message::simple)
                    .collect::<Vec<_>>()
            ),
        ]
    }

    proptest! {
        #[test]
        fn round_trip(message in message()) {
            prop_assert_eq!(decode(&encode(&message)), Ok(message));
        }

        #[test]
        fn truncation_is_malformed(message in message()) {
            let buf = encode(&message);
            for len in 1..buf.len() {
                prop_assert_eq!(
                    decode(&buf[..len]),
                    Err(MalformedMessage::Truncated(message.kind()))
                );
            }
        }
    }

    #[test]
    fn boundary_addresses() {
        for address in [
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, u16::MAX),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6000),
        ] {
            let message = Message::ListAdd {
                service: u8::MAX,
                address,
                agent_port: address.port(),
            };
            assert_eq!(decode(&encode(&message)), Ok(message));
            let message = Message::ServiceOffer(Some(address));
            assert_eq!(decode(&encode(&message)), Ok(message));
        }
    }

    #[test]
    fn layout() {
        let address = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6000);
        assert_eq!(
            &encode(&Message::ListAdd {
                service: 1,
                address,
                agent_port: 0x1234,
            })[..],
            &[10, 1, 127, 0, 0, 1, 0, 0, 0x17, 0x70, 0, 0, 0x12, 0x34]
        );
        assert_eq!(&encode(&Message::ServiceOffer(None))[..], &[3, 0]);
        assert_eq!(&encode(&Message::Registered)[..], &[1]);
    }

    #[test]
    fn kind_ordinals() {
        for (ordinal, kind) in Kind::ALL.into_iter().enumerate() {
            assert_eq!(kind as usize, ordinal);
            assert_eq!(Kind::try_from(ordinal as u8), Ok(kind))
        }
    }

    #[test]
    fn malformed() {
        assert_eq!(decode(&[]), Err(MalformedMessage::Empty));
        assert_eq!(decode(&[13]), Err(MalformedMessage::UnknownKind(13)));
        assert_eq!(decode(&[0xff, 0]), Err(MalformedMessage::UnknownKind(0xff)));
        assert_eq!(
            decode(&[0, 0, 0, 1, 0, 0]),
            Err(MalformedMessage::PortOutOfRange(0x10000))
        );
        // trailing bytes are ignored
        assert_eq!(decode(&[7, 7, 7]), Ok(Message::Pong));
    }
}
