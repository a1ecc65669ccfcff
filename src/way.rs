use crate::ids::{ActivityId, SequenceNumber};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Tri-state answer to "may this call trust the entry's sequence state?".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ValidationStatus {
    Valid,
    /// the entry was validated, but this call demands fresh proof of the server's current
    ///  boot epoch before trusting it
    NeedsReproof,
    NotValidated,
}

/// The stored validation flag and the per-call re-proof requirement combine into a single
///  status; keeping this a pure function avoids re-deriving the rule at every call site.
pub fn validation_status(way_validated: bool, requires_fresh_proof: bool) -> ValidationStatus {
    match (way_validated, requires_fresh_proof) {
        (true, false) => ValidationStatus::Valid,
        (true, true) => ValidationStatus::NeedsReproof,
        (false, _) => ValidationStatus::NotValidated,
    }
}

/// The client's answer to a WAY ("who are you") challenge.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct WayConfirmation {
    /// the highest call sequence number the client claims for the activity
    pub sequence: SequenceNumber,
}

/// The actual challenge/response exchange is supplied by the security/authentication provider;
///  this crate only sequences it. Mocked away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WayHandshake: Send + Sync + 'static {
    async fn confirm_activity(
        &self,
        activity: ActivityId,
        claimed_seq: SequenceNumber,
        server_boot: u64,
    ) -> anyhow::Result<WayConfirmation>;
}

/// A callback binding for challenging one specific client activity: the handshake provider
///  plus the identity the challenge is about.
pub struct WayBinding {
    handshake: Arc<dyn WayHandshake>,
    activity: ActivityId,
    server_boot: u64,
}

impl WayBinding {
    pub fn new(handshake: Arc<dyn WayHandshake>, activity: ActivityId, server_boot: u64) -> WayBinding {
        WayBinding {
            handshake,
            activity,
            server_boot,
        }
    }

    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    pub async fn confirm(&self, claimed_seq: SequenceNumber) -> anyhow::Result<WayConfirmation> {
        self.handshake
            .confirm_activity(self.activity, claimed_seq, self.server_boot)
            .await
    }
}

/// WAY failure, scoped to the call that required validation - the connection table entry
///  survives it in any case.
#[derive(Debug)]
pub enum WayError {
    /// the round trip did not finish within the configured bound; recoverable, the caller
    ///  may retry
    Timeout,
    /// the client confirmed a sequence number below what this server has already dispatched
    ///  for the activity - replay suspicion
    SequenceMismatch {
        claimed: SequenceNumber,
        confirmed: SequenceNumber,
    },
    /// the provider-level exchange itself failed
    Handshake(anyhow::Error),
}

impl Display for WayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WayError::Timeout => write!(f, "WAY validation timed out"),
            WayError::SequenceMismatch { claimed, confirmed } => {
                write!(f, "WAY validation failed: client confirmed sequence {} below the dispatched sequence {}", confirmed, claimed)
            }
            WayError::Handshake(e) => write!(f, "WAY handshake failed: {}", e),
        }
    }
}

impl std::error::Error for WayError {}
