use crate::ids::{ActivityId, FragmentNumber, SequenceNumber, SerialNumber};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};

/// The kind of a datagram PDU. Request packets carry call body fragments; everything else is
///  a header-only control response, except Reject and Fault which carry a status code.
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Ping = 1,
    Response = 2,
    Fault = 3,
    Working = 4,
    Nocall = 5,
    Reject = 6,
    Ack = 7,
    Quit = 8,
    Fack = 9,
    Quack = 10,
}

impl PacketType {
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Request => "REQUEST",
            PacketType::Ping => "PING",
            PacketType::Response => "RESPONSE",
            PacketType::Fault => "FAULT",
            PacketType::Working => "WORKING",
            PacketType::Nocall => "NOCALL",
            PacketType::Reject => "REJECT",
            PacketType::Ack => "ACK",
            PacketType::Quit => "QUIT",
            PacketType::Fack => "FACK",
            PacketType::Quack => "QUACK",
        }
    }
}

/// Diagnostic name for a raw packet type code, tolerating codes that no [PacketType] value
///  is assigned to. For logging only.
pub fn packet_type_name(code: u8) -> &'static str {
    PacketType::try_from(code)
        .map(PacketType::name)
        .unwrap_or("UNKNOWN")
}

bitflags! {
    /// Per-packet flags. The upper four bits are unused and must be zero on the wire.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PacketFlags: u8 {
        /// this fragment completes the call body
        const LAST_FRAG = 0x01;
        /// the call body spans multiple fragments
        const FRAG = 0x02;
        /// 'maybe' semantics - the client does not expect a response
        const NO_REPLY = 0x04;
        /// the call may be executed again on retransmission without harm
        const IDEMPOTENT = 0x08;
    }
}

/// Status code carried in the body of Reject and Fault packets.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const COMM_FAILURE: StatusCode = StatusCode(0x1c01_0001);
    pub const PROTOCOL_ERROR: StatusCode = StatusCode(0x1c01_0002);
    pub const WHO_ARE_YOU_FAILED: StatusCode = StatusCode(0x1c01_0003);
    pub const SEQUENCE_REJECTED: StatusCode = StatusCode(0x1c01_0004);
    pub const QUEUE_FULL: StatusCode = StatusCode(0x1c01_0005);
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Fixed-layout header at the start of every datagram - all numbers in network byte order (BE).
///  See the crate documentation for the full wire layout.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub activity: ActivityId,
    /// millis since epoch at the start of the server process this packet refers to, or 0 if the
    ///  sender does not know the server instance yet
    pub server_boot: u64,
    pub sequence: SequenceNumber,
    pub fragment: FragmentNumber,
    pub serial: SerialNumber,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub const SERIALIZED_LEN: usize = 44;

    pub fn new(
        packet_type: PacketType,
        flags: PacketFlags,
        activity: ActivityId,
        server_boot: u64,
        sequence: SequenceNumber,
        fragment: FragmentNumber,
        serial: SerialNumber,
    ) -> PacketHeader {
        PacketHeader {
            packet_type,
            flags,
            activity,
            server_boot,
            sequence,
            fragment,
            serial,
        }
    }

    /// Derive a response header from an inbound request header: same activity, sequence and
    ///  fragment coordinates (so the client can correlate), the server's actual boot epoch
    ///  filled in, and no request-side flags.
    pub fn reply_to(request: &PacketHeader, packet_type: PacketType, server_boot: u64) -> PacketHeader {
        PacketHeader {
            packet_type,
            flags: PacketFlags::empty(),
            activity: request.activity,
            server_boot,
            sequence: request.sequence,
            fragment: request.fragment,
            serial: request.serial,
        }
    }

    pub fn with_packet_type(&self, packet_type: PacketType) -> PacketHeader {
        PacketHeader {
            packet_type,
            ..self.clone()
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.packet_type.into());
        buf.put_u8(self.flags.bits());
        buf.put_u8(0); // reserved
        buf.put_slice(self.activity.as_bytes());
        buf.put_u64(self.server_boot);
        buf.put_u64(self.sequence.to_raw());
        buf.put_u32(self.fragment.to_raw());
        buf.put_u32(self.serial.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let raw_packet_type = buf.try_get_u8()?;
        let packet_type = match PacketType::try_from(raw_packet_type) {
            Ok(packet_type) => packet_type,
            Err(_) => bail!("unassigned packet type code {}", raw_packet_type),
        };

        let raw_flags = buf.try_get_u8()?;
        let flags = match PacketFlags::from_bits(raw_flags) {
            Some(flags) => flags,
            None => bail!("packet flags {:#04x} have reserved bits set", raw_flags),
        };

        let reserved = buf.try_get_u8()?;
        if reserved != 0 {
            bail!("reserved header byte is {}, must be 0", reserved);
        }

        if buf.remaining() < 16 {
            bail!("incomplete activity id");
        }
        let mut raw_activity = [0u8; 16];
        buf.copy_to_slice(&mut raw_activity);

        let server_boot = buf.try_get_u64()?;
        let sequence = buf.try_get_u64()?;
        let fragment = buf.try_get_u32()?;
        let serial = buf.try_get_u32()?;

        Ok(PacketHeader {
            packet_type,
            flags,
            activity: ActivityId::from_bytes(raw_activity),
            server_boot,
            sequence: SequenceNumber::from_raw(sequence),
            fragment: FragmentNumber::from_raw(fragment),
            serial: SerialNumber::from_raw(serial),
        })
    }
}
