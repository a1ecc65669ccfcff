use crate::ids::{FragmentNumber, SerialNumber};
use crate::packet_header::{PacketFlags, PacketHeader};
use bytes::Bytes;

/// One admitted piece of a call's body: the transport payload plus the coordinates the
///  receive queue orders and deduplicates by. Owned exclusively by the queue once admitted.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Fragment {
    pub number: FragmentNumber,
    pub serial: SerialNumber,
    /// true iff this fragment completes the call body
    pub last_frag: bool,
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(number: FragmentNumber, serial: SerialNumber, last_frag: bool, payload: Bytes) -> Fragment {
        Fragment {
            number,
            serial,
            last_frag,
            payload,
        }
    }

    /// Extract the fragment record from a parsed request header and the datagram's body. A
    ///  single-fragment call body is marked 'last' implicitly by the absence of the FRAG flag.
    pub fn from_packet(header: &PacketHeader, payload: Bytes) -> Fragment {
        let last_frag = header.flags.contains(PacketFlags::LAST_FRAG)
            || !header.flags.contains(PacketFlags::FRAG);

        Fragment {
            number: header.fragment,
            serial: header.serial,
            last_frag,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
