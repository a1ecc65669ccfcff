use rustc_hash::FxHasher;
use std::fmt::{Display, Formatter};
use std::hash::Hasher;
use uuid::Uuid;

/// The client-chosen 128-bit identifier naming a logical sequence of related calls. All calls
///  of one activity share sequence/validation state on the server side.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ActivityId(Uuid);

impl Display for ActivityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ActivityId {
    pub fn new_random() -> ActivityId {
        ActivityId(Uuid::new_v4())
    }

    pub fn from_bytes(raw: [u8; 16]) -> ActivityId {
        ActivityId(Uuid::from_bytes(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Shard selector for the connection table: a fast, uniformly distributing (and explicitly
    ///  non-cryptographic) hash of the id's bytes, reduced modulo the shard count.
    pub fn shard_hint(&self, num_shards: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write(self.0.as_bytes());
        (hasher.finish() % num_shards as u64) as usize
    }
}

/// Per-activity call sequence number. Sequence numbers are assigned by the client and strictly
///  increase over the lifetime of an activity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u64);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(
            self.0.checked_add(1)
                .expect("sequence number overflow - activities are bounded far below u64 range")
        )
    }

    /// `None` for the first possible sequence number, i.e. there is no call before it.
    pub fn predecessor(&self) -> Option<SequenceNumber> {
        self.0.checked_sub(1).map(SequenceNumber)
    }
}

/// Position of a fragment in a call's (possibly multi-datagram) body.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FragmentNumber(u32);

impl Display for FragmentNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FragmentNumber {
    pub const ZERO: FragmentNumber = FragmentNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> FragmentNumber {
        FragmentNumber(
            self.0.checked_add(1)
                .expect("fragment number overflow - call bodies are bounded far below u32 fragments")
        )
    }
}

/// Distinguishes distinct transmissions of the same fragment number (retransmissions). Serial
///  numbers increase with every (re)send, independently of the fragment number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SerialNumber(u32);

impl Display for SerialNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SerialNumber {
    pub const ZERO: SerialNumber = SerialNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}
