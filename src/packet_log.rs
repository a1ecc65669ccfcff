use crate::packet_header::PacketHeader;
use std::fmt::{Display, Formatter};
use tracing::{enabled, trace, Level};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketDirection {
    Inbound,
    Outbound,
}

impl Display for PacketDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketDirection::Inbound => write!(f, "rcvd"),
            PacketDirection::Outbound => write!(f, "sent"),
        }
    }
}

/// What became of the packet - recorded for diagnosis, never acted on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketDisposition {
    Accepted,
    Duplicate,
    Dropped,
    Rejected,
}

impl Display for PacketDisposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketDisposition::Accepted => write!(f, "accepted"),
            PacketDisposition::Duplicate => write!(f, "duplicate"),
            PacketDisposition::Dropped => write!(f, "dropped"),
            PacketDisposition::Rejected => write!(f, "rejected"),
        }
    }
}

/// Per-packet diagnostics hook. Emitted at TRACE level only, so with the default subscriber
///  level the cost on the hot path is a single branch.
pub fn log_packet(
    direction: PacketDirection,
    header: &PacketHeader,
    body_len: usize,
    disposition: PacketDisposition,
) {
    if !enabled!(Level::TRACE) {
        return;
    }

    trace!(
        "{} {} packet: activity {}, seq {}, frag {} serial {}, {} body bytes - {}",
        direction,
        header.packet_type.name(),
        header.activity,
        header.sequence,
        header.fragment,
        header.serial,
        body_len,
        disposition,
    );
}
