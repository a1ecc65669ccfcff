use crate::config::{ConnTableConfig, ReceiveQueueConfig, RpcConfig};
use crate::fragment::Fragment;
use crate::ids::{ActivityId, SequenceNumber};
use crate::packet_header::PacketHeader;
use crate::receive_queue::ReceiveQueue;
use crate::send_pipeline::SendPipeline;
use crate::way::{validation_status, ValidationStatus, WayBinding, WayError, WayHandshake};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

/// Server-side per-activity state: sequence progress, WAY validation, and the registration
///  of the call currently in flight. Entries outlive any single call and are shared by all
///  concurrent calls of their activity.
pub struct TableEntry {
    activity: ActivityId,

    /// number of outstanding [EntryRef] checkouts plus the table's own baseline reference
    refs: AtomicU32,

    /// millis since the table's epoch at the time the entry last became idle
    idle_since_millis: AtomicU64,
    epoch: Instant,

    state: Mutex<EntryState>,
}

struct EntryState {
    /// The highest sequence number for which a call was actually dispatched, or `None` if no
    ///  call was dispatched yet. A fresh entry is seeded below its first packet's sequence so
    ///  that packet still starts a call.
    high_seq: Option<SequenceNumber>,
    way_validated: bool,
    active_call: Option<(SequenceNumber, Weak<ServerCall>)>,
}

impl TableEntry {
    const BASELINE_REFS: u32 = 1;

    fn new(activity: ActivityId, first_seq: SequenceNumber, epoch: Instant) -> TableEntry {
        TableEntry {
            activity,
            refs: AtomicU32::new(Self::BASELINE_REFS),
            idle_since_millis: AtomicU64::new(Self::millis_since(epoch)),
            epoch,
            state: Mutex::new(EntryState {
                high_seq: first_seq.predecessor(),
                way_validated: false,
                active_call: None,
            }),
        }
    }

    fn millis_since(epoch: Instant) -> u64 {
        epoch.elapsed().as_millis() as u64
    }

    fn idle_for(&self) -> Duration {
        let now = Self::millis_since(self.epoch);
        let idle_since = self.idle_since_millis.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(idle_since))
    }
}

/// Scoped checkout of a [TableEntry]: creation increments the entry's reference count, and
///  dropping it decrements the count on every exit path - including error paths and
///  cancellation - stamping the idle time when the count returns to the baseline. This is the
///  only way code outside the table gets at an entry.
pub struct EntryRef {
    entry: Arc<TableEntry>,
}

impl EntryRef {
    fn checkout(entry: &Arc<TableEntry>) -> EntryRef {
        let prev = entry.refs.fetch_add(1, Ordering::AcqRel);
        assert!(prev < u32::MAX, "connection table entry reference count saturated - this is a bug");
        EntryRef {
            entry: entry.clone(),
        }
    }

    pub fn activity(&self) -> ActivityId {
        self.entry.activity
    }

    /// The highest sequence number a call was dispatched for, or `None` for a fresh entry.
    pub async fn sequence(&self) -> Option<SequenceNumber> {
        self.entry.state.lock().await.high_seq
    }

    pub async fn is_way_validated(&self) -> bool {
        self.entry.state.lock().await.way_validated
    }

    /// Whether this particular call may trust the entry's sequence state, combining the
    ///  stored validation flag with the call's own freshness requirement.
    pub async fn validation_status(&self, requires_fresh_proof: bool) -> ValidationStatus {
        let state = self.entry.state.lock().await;
        validation_status(state.way_validated, requires_fresh_proof)
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> EntryRef {
        EntryRef::checkout(&self.entry)
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        let prev = self.entry.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > TableEntry::BASELINE_REFS, "connection table entry reference count underflow - this is a bug");
        if prev == TableEntry::BASELINE_REFS + 1 {
            self.entry.idle_since_millis
                .store(TableEntry::millis_since(self.entry.epoch), Ordering::Release);
        }
    }
}

/// Where an inbound request fragment belongs on its entry.
pub enum CallDecision {
    /// part of the call currently in flight
    Existing(Arc<ServerCall>),
    /// a sequence number newer than anything dispatched - the caller should start a call
    ///  via [ConnectionTable::new_call]
    NewCallRequired,
    /// a replay of a sequence number that was already dispatched - to be dropped, or
    ///  answered from a response cache for idempotent calls
    Stale,
}

/// One in-flight server-side call: owns the call's receive queue and holds a reference on
///  its connection table entry for as long as the call lives.
///
/// The call-dispatch layer owns the call's lifetime and must end it through
///  [ServerCall::complete] or [ServerCall::abort].
pub struct ServerCall {
    activity: ActivityId,
    sequence: SequenceNumber,
    peer_addr: SocketAddr,
    reply_pipeline: Arc<SendPipeline>,
    queue: ReceiveQueue,
    entry_ref: std::sync::Mutex<Option<EntryRef>>,
}

impl ServerCall {
    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn queue(&self) -> &ReceiveQueue {
        &self.queue
    }

    /// The pipeline responses and control PDUs for this call go out on.
    pub fn reply_pipeline(&self) -> &Arc<SendPipeline> {
        &self.reply_pipeline
    }

    pub async fn complete(&self) {
        trace!("completing call seq {} of activity {}", self.sequence, self.activity);
        self.tear_down().await;
    }

    pub async fn abort(&self) {
        debug!("aborting call seq {} of activity {}", self.sequence, self.activity);
        self.tear_down().await;
    }

    /// The order matters: no consumer may be left blocked on the queue when it is drained,
    ///  and the entry reference is released only once the queue no longer holds fragments -
    ///  so the reclamation sweep can never see an idle entry whose queue is still populated.
    async fn tear_down(&self) {
        self.queue.cancel().await;
        self.queue.drain().await;

        let entry_ref = self.entry_ref.lock().unwrap().take();
        if let Some(entry_ref) = entry_ref {
            let mut state = entry_ref.entry.state.lock().await;
            let registered_here = matches!(&state.active_call, Some((seq, _)) if *seq == self.sequence);
            if registered_here {
                state.active_call = None;
            }
        }
    }
}

type Shard = FxHashMap<ActivityId, Arc<TableEntry>>;

/// The server-side connection table: maps a client's activity identifier to its persistent
///  sequence/validation state, sharded by a hash of the identifier so concurrent lookups
///  contend per shard, not table-wide. Membership changes and reference-count initialization
///  are atomic under the shard lock; entries are only ever reached through the operations
///  below, never by iteration.
pub struct ConnectionTable {
    config: Arc<ConnTableConfig>,
    queue_config: Arc<ReceiveQueueConfig>,
    way_timeout: Duration,
    way_handshake: Arc<dyn WayHandshake>,
    server_boot: u64,
    epoch: Instant,
    shards: Arc<Vec<Mutex<Shard>>>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl Drop for ConnectionTable {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

impl ConnectionTable {
    pub fn new(config: &RpcConfig, way_handshake: Arc<dyn WayHandshake>) -> anyhow::Result<ConnectionTable> {
        config.validate()?;

        let shards = (0..config.conn_table.num_shards)
            .map(|_| Mutex::new(Shard::default()))
            .collect();

        Ok(ConnectionTable {
            config: Arc::new(config.conn_table.clone()),
            queue_config: Arc::new(config.receive_queue.clone()),
            way_timeout: config.way_timeout,
            way_handshake,
            server_boot: Self::boot_epoch_from_timestamp()?,
            epoch: Instant::now(),
            shards: Arc::new(shards),
            sweep_handle: None,
        })
    }

    /// The boot epoch identifies this server instance: after a restart it is different and
    ///  larger, which is what lets clients (and the WAY exchange) tell a restarted server
    ///  from a continued conversation.
    fn boot_epoch_from_timestamp() -> anyhow::Result<u64> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        if raw > 0xffff_ffff_ffff {
            bail!("system clock is in the future");
        }
        Ok(raw as u64)
    }

    pub fn server_boot(&self) -> u64 {
        self.server_boot
    }

    /// The shard an activity's entry lives in. Compute once per inbound packet and pass to
    ///  [Self::lookup] / [Self::get_or_create].
    pub fn shard_hint(&self, activity: &ActivityId) -> usize {
        activity.shard_hint(self.shards.len())
    }

    /// Purely informational lookup - never creates state. A miss is not an error; it is the
    ///  normal trigger for [Self::get_or_create].
    pub async fn lookup(&self, activity: ActivityId, hint: usize) -> Option<EntryRef> {
        debug_assert_eq!(hint, self.shard_hint(&activity));

        let shard = self.shards[hint].lock().await;
        shard.get(&activity).map(EntryRef::checkout)
    }

    /// The commit path for dispatching a packet: returns the existing entry or atomically
    ///  creates one, seeded just below `sequence` (so the packet carrying that sequence still
    ///  starts a call) and not yet WAY-validated.
    pub async fn get_or_create(&self, activity: ActivityId, hint: usize, sequence: SequenceNumber) -> EntryRef {
        debug_assert_eq!(hint, self.shard_hint(&activity));

        match self.shards[hint].lock().await.entry(activity) {
            Entry::Occupied(e) => EntryRef::checkout(e.get()),
            Entry::Vacant(e) => {
                debug!("creating connection table entry for activity {}", activity);
                let entry = Arc::new(TableEntry::new(activity, sequence, self.epoch));
                let entry_ref = EntryRef::checkout(&entry);
                e.insert(entry);
                entry_ref
            }
        }
    }

    /// Decide whether an inbound request fragment belongs to the call in flight on this
    ///  entry, starts a new call, or replays an old one.
    pub async fn inquire_call(&self, entry: &EntryRef, header: &PacketHeader) -> CallDecision {
        let state = entry.entry.state.lock().await;

        if let Some((seq, call)) = &state.active_call {
            if *seq == header.sequence {
                if let Some(call) = call.upgrade() {
                    return CallDecision::Existing(call);
                }
                // the dispatch layer dropped the call without unregistering it; treat the
                //  registration as dead
            }
        }

        if Self::is_newer(header.sequence, state.high_seq) {
            CallDecision::NewCallRequired
        }
        else {
            trace!("sequence {} of activity {} was already dispatched - stale", header.sequence, entry.activity());
            CallDecision::Stale
        }
    }

    fn is_newer(sequence: SequenceNumber, high_seq: Option<SequenceNumber>) -> bool {
        match high_seq {
            None => true,
            Some(high_seq) => sequence > high_seq,
        }
    }

    /// Create a fresh server call for the given request fragment, advancing the entry's
    ///  sequence and registering the call on the entry. The call holds a reference on the
    ///  entry until it is completed or aborted.
    pub async fn new_call(
        &self,
        entry: &EntryRef,
        reply_pipeline: Arc<SendPipeline>,
        peer_addr: SocketAddr,
        header: &PacketHeader,
        body: Bytes,
    ) -> anyhow::Result<Arc<ServerCall>> {
        let mut state = entry.entry.state.lock().await;

        if !Self::is_newer(header.sequence, state.high_seq) {
            bail!("sequence {} was already dispatched for activity {}", header.sequence, entry.activity());
        }

        debug!("new call seq {} for activity {}", header.sequence, entry.activity());

        let call = Arc::new(ServerCall {
            activity: entry.activity(),
            sequence: header.sequence,
            peer_addr,
            reply_pipeline,
            queue: ReceiveQueue::new(self.queue_config.clone()),
            entry_ref: std::sync::Mutex::new(Some(entry.clone())),
        });

        state.high_seq = Some(header.sequence);
        state.active_call = Some((header.sequence, Arc::downgrade(&call)));
        drop(state);

        let outcome = call.queue.admit(Fragment::from_packet(header, body)).await;
        trace!("admitted initial fragment of call seq {}: {:?}", header.sequence, outcome);

        Ok(call)
    }

    /// Revert a tentative call registration, e.g. because the call failed authorization
    ///  before any work was dispatched: the entry must not stay advanced to a sequence
    ///  number for which no actual call exists.
    pub async fn backout_new_call(&self, entry: &EntryRef, sequence: SequenceNumber) {
        let mut state = entry.entry.state.lock().await;

        let registered = matches!(&state.active_call, Some((seq, _)) if *seq == sequence);
        if registered {
            state.active_call = None;
        }
        if state.high_seq == Some(sequence) {
            state.high_seq = sequence.predecessor();
            debug!("backed out call seq {} of activity {}", sequence, entry.activity());
        }
    }

    /// A callback binding for challenging this entry's client.
    pub fn make_way_binding(&self, entry: &EntryRef) -> WayBinding {
        WayBinding::new(self.way_handshake.clone(), entry.activity(), self.server_boot)
    }

    /// Perform (or re-confirm, with `force`) the WAY challenge/response exchange for this
    ///  entry. Failure is scoped to the call that demanded validation - the entry keeps its
    ///  sequence state and a later call may validate successfully.
    pub async fn way_validate(&self, entry: &EntryRef, force: bool) -> Result<(), WayError> {
        // the state lock is held across the round trip so concurrent calls on the same
        //  activity validate once, not once each
        let mut state = entry.entry.state.lock().await;

        if state.way_validated && !force {
            return Ok(());
        }

        let binding = self.make_way_binding(entry);
        let claimed = state.high_seq.unwrap_or(SequenceNumber::ZERO);

        let confirmation = match tokio::time::timeout(self.way_timeout, binding.confirm(claimed)).await {
            Err(_) => {
                debug!("WAY exchange for activity {} timed out", entry.activity());
                return Err(WayError::Timeout);
            }
            Ok(Err(e)) => {
                debug!("WAY exchange for activity {} failed: {}", entry.activity(), e);
                return Err(WayError::Handshake(e));
            }
            Ok(Ok(confirmation)) => confirmation,
        };

        if let Some(high_seq) = state.high_seq {
            if confirmation.sequence < high_seq {
                warn!("activity {}: client confirmed sequence {} below the dispatched sequence {} - possible replay", entry.activity(), confirmation.sequence, high_seq);
                return Err(WayError::SequenceMismatch {
                    claimed: high_seq,
                    confirmed: confirmation.sequence,
                });
            }
        }

        debug!("activity {} WAY-validated at sequence {}", entry.activity(), confirmation.sequence);
        state.way_validated = true;
        Ok(())
    }

    pub async fn num_entries(&self) -> usize {
        let mut num = 0;
        for shard in self.shards.iter() {
            num += shard.lock().await.len();
        }
        num
    }

    /// One reclamation pass: evict every entry that is at its baseline reference count and
    ///  has been idle longer than the retention window. Returns the number of evictions.
    pub async fn reclaim_idle_entries(&self) -> usize {
        Self::do_reclaim(&self.config, &self.shards).await
    }

    async fn do_reclaim(config: &ConnTableConfig, shards: &[Mutex<Shard>]) -> usize {
        let mut num_reclaimed = 0;

        for shard in shards {
            let mut shard = shard.lock().await;
            shard.retain(|activity, entry| {
                // NB: a checkout from the table needs this shard's lock, and a clone of an
                //      existing EntryRef keeps the count above the baseline - so an entry
                //      seen at its baseline here cannot gain a reference concurrently
                if entry.refs.load(Ordering::Acquire) > TableEntry::BASELINE_REFS {
                    return true;
                }
                if entry.idle_for() < config.idle_retention {
                    return true;
                }

                debug!("reclaiming idle connection table entry for activity {}", activity);
                num_reclaimed += 1;
                false
            });
        }

        num_reclaimed
    }

    pub fn spawn_reclamation_loop(&mut self) {
        if self.sweep_handle.is_some() {
            warn!("reclamation loop already spawned");
            return;
        }
        self.sweep_handle = Some(tokio::spawn(Self::do_loop(self.config.clone(), self.shards.clone())));
    }

    /// Active loop - runs until the table is dropped.
    async fn do_loop(config: Arc<ConnTableConfig>, shards: Arc<Vec<Mutex<Shard>>>) {
        let mut sweep_interval = interval(config.sweep_interval);

        loop {
            sweep_interval.tick().await;
            let num_reclaimed = Self::do_reclaim(&config, &shards).await;
            if num_reclaimed > 0 {
                debug!("reclamation sweep evicted {} idle entries", num_reclaimed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::SendBufferPool;
    use crate::ids::{FragmentNumber, SerialNumber};
    use crate::packet_header::{PacketFlags, PacketType};
    use crate::receive_queue::WaitOutcome;
    use crate::send_pipeline::MockSendSocket;
    use crate::way::{MockWayHandshake, WayConfirmation, WayHandshake};
    use async_trait::async_trait;
    use rstest::rstest;
    use tokio::runtime::Builder;

    fn table_with_handshake(way_handshake: Arc<dyn WayHandshake>) -> ConnectionTable {
        ConnectionTable::new(&RpcConfig::default(), way_handshake).unwrap()
    }

    fn table() -> ConnectionTable {
        table_with_handshake(Arc::new(MockWayHandshake::new()))
    }

    fn pipeline() -> Arc<SendPipeline> {
        Arc::new(SendPipeline::new(
            Arc::new(MockSendSocket::new()),
            Arc::new(SendBufferPool::new(100, 4)),
        ))
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn request_header(activity: ActivityId, sequence: u64) -> PacketHeader {
        PacketHeader::new(
            PacketType::Request,
            PacketFlags::LAST_FRAG,
            activity,
            0,
            SequenceNumber::from_raw(sequence),
            FragmentNumber::ZERO,
            SerialNumber::ZERO,
        )
    }

    #[test]
    fn test_lookup_never_creates() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            assert!(table.lookup(activity, hint).await.is_none());
            assert_eq!(table.num_entries().await, 0);

            let _entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;
            assert!(table.lookup(activity, hint).await.is_some());
            assert_eq!(table.num_entries().await, 1);
        });
    }

    #[test]
    fn test_concurrent_get_or_create_yields_single_entry() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = Arc::new(table());
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let table = table.clone();
                tasks.push(tokio::spawn(async move {
                    table.get_or_create(activity, hint, SequenceNumber::ZERO).await
                }));
            }

            let mut refs = Vec::new();
            for task in tasks {
                refs.push(task.await.unwrap());
            }

            assert_eq!(table.num_entries().await, 1);
            assert_eq!(refs[0].entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 8);

            drop(refs);
            let remaining = table.lookup(activity, hint).await.unwrap();
            assert_eq!(remaining.entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 1);
        });
    }

    #[test]
    fn test_entry_ref_checkout_and_release() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;
            assert_eq!(entry.entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 1);

            let second = entry.clone();
            assert_eq!(entry.entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 2);

            drop(second);
            assert_eq!(entry.entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 1);
        });
    }

    #[test]
    fn test_reclamation_sweep() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let table = table();

            let idle_activity = ActivityId::new_random();
            let busy_activity = ActivityId::new_random();

            let idle_hint = table.shard_hint(&idle_activity);
            let busy_hint = table.shard_hint(&busy_activity);

            let idle_ref = table.get_or_create(idle_activity, idle_hint, SequenceNumber::ZERO).await;
            let busy_ref = table.get_or_create(busy_activity, busy_hint, SequenceNumber::ZERO).await;
            drop(idle_ref);

            // freshly idle: inside the retention window, nothing to reclaim
            assert_eq!(table.reclaim_idle_entries().await, 0);

            tokio::time::advance(Duration::from_secs(301)).await;

            // the busy entry is above its baseline reference count and must survive no
            //  matter how old its idle stamp is
            assert_eq!(table.reclaim_idle_entries().await, 1);
            assert_eq!(table.num_entries().await, 1);
            assert!(table.lookup(busy_activity, busy_hint).await.is_some());
            assert!(table.lookup(idle_activity, idle_hint).await.is_none());

            // once released and aged, the remaining entry goes too
            drop(busy_ref);
            tokio::time::advance(Duration::from_secs(301)).await;
            assert_eq!(table.reclaim_idle_entries().await, 1);
            assert_eq!(table.num_entries().await, 0);
        });
    }

    #[test]
    fn test_release_restarts_idle_clock() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;

            tokio::time::advance(Duration::from_secs(301)).await;
            drop(entry);

            // the entry became idle just now, not at creation time
            assert_eq!(table.reclaim_idle_entries().await, 0);
            assert_eq!(table.num_entries().await, 1);
        });
    }

    #[test]
    fn test_call_decision_flow() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::from_raw(5)).await;

            // the packet that triggered creation starts a call
            assert!(matches!(
                table.inquire_call(&entry, &request_header(activity, 5)).await,
                CallDecision::NewCallRequired
            ));

            let call = table
                .new_call(&entry, pipeline(), peer(), &request_header(activity, 5), Bytes::from_static(b"in"))
                .await
                .unwrap();

            assert!(matches!(
                table.inquire_call(&entry, &request_header(activity, 5)).await,
                CallDecision::Existing(_)
            ));
            assert!(matches!(
                table.inquire_call(&entry, &request_header(activity, 4)).await,
                CallDecision::Stale
            ));
            assert!(matches!(
                table.inquire_call(&entry, &request_header(activity, 6)).await,
                CallDecision::NewCallRequired
            ));

            // after completion a retransmit of the same sequence is a replay
            call.complete().await;
            assert!(matches!(
                table.inquire_call(&entry, &request_header(activity, 5)).await,
                CallDecision::Stale
            ));
        });
    }

    #[test]
    fn test_new_call_rejects_dispatched_sequence() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::from_raw(5)).await;
            let _call = table
                .new_call(&entry, pipeline(), peer(), &request_header(activity, 5), Bytes::new())
                .await
                .unwrap();

            assert!(table
                .new_call(&entry, pipeline(), peer(), &request_header(activity, 5), Bytes::new())
                .await
                .is_err());
        });
    }

    #[test]
    fn test_backout_new_call() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::from_raw(5)).await;
            let call = table
                .new_call(&entry, pipeline(), peer(), &request_header(activity, 5), Bytes::new())
                .await
                .unwrap();

            // setup failed before any work was dispatched
            call.abort().await;
            table.backout_new_call(&entry, SequenceNumber::from_raw(5)).await;

            assert_eq!(entry.sequence().await, Some(SequenceNumber::from_raw(4)));
            assert!(matches!(
                table.inquire_call(&entry, &request_header(activity, 5)).await,
                CallDecision::NewCallRequired
            ));
        });
    }

    #[test]
    fn test_call_teardown_releases_entry_and_wakes_consumer() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = table();
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;
            let header = PacketHeader::new(
                PacketType::Request,
                PacketFlags::FRAG,
                activity,
                0,
                SequenceNumber::ZERO,
                FragmentNumber::ZERO,
                SerialNumber::ZERO,
            );
            let call = table
                .new_call(&entry, pipeline(), peer(), &header, Bytes::from_static(b"partial"))
                .await
                .unwrap();
            assert_eq!(entry.entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 2);

            let waiter = {
                let call = call.clone();
                tokio::spawn(async move { call.queue().wait_deliverable(None).await })
            };
            tokio::task::yield_now().await;

            call.abort().await;

            assert_eq!(waiter.await.unwrap(), WaitOutcome::Cancelled);
            assert_eq!(call.queue().queued_fragments().await, 0);
            assert_eq!(entry.entry.refs.load(Ordering::Acquire), TableEntry::BASELINE_REFS + 1);
        });
    }

    #[test]
    fn test_way_validation_is_monotonic() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut handshake = MockWayHandshake::new();
            handshake.expect_confirm_activity()
                .once()
                .returning(|_, claimed, _| Ok(WayConfirmation { sequence: claimed }));

            let table = table_with_handshake(Arc::new(handshake));
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);
            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;

            assert_eq!(entry.validation_status(false).await, ValidationStatus::NotValidated);

            table.way_validate(&entry, false).await.unwrap();
            assert_eq!(entry.validation_status(false).await, ValidationStatus::Valid);
            assert_eq!(entry.validation_status(true).await, ValidationStatus::NeedsReproof);

            // already validated: the handshake must not run again (the mock would panic)
            table.way_validate(&entry, false).await.unwrap();
        });
    }

    #[test]
    fn test_way_forced_revalidation_runs_handshake_again() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut handshake = MockWayHandshake::new();
            handshake.expect_confirm_activity()
                .times(2)
                .returning(|_, claimed, _| Ok(WayConfirmation { sequence: claimed }));

            let table = table_with_handshake(Arc::new(handshake));
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);
            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;

            table.way_validate(&entry, false).await.unwrap();
            table.way_validate(&entry, true).await.unwrap();
            assert!(entry.is_way_validated().await);
        });
    }

    #[test]
    fn test_way_sequence_mismatch_is_rejected() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut handshake = MockWayHandshake::new();
            handshake.expect_confirm_activity()
                .returning(|_, _, _| Ok(WayConfirmation { sequence: SequenceNumber::from_raw(3) }));

            let table = table_with_handshake(Arc::new(handshake));
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);

            let entry = table.get_or_create(activity, hint, SequenceNumber::from_raw(5)).await;
            let _call = table
                .new_call(&entry, pipeline(), peer(), &request_header(activity, 5), Bytes::new())
                .await
                .unwrap();

            let result = table.way_validate(&entry, false).await;
            assert!(matches!(result, Err(WayError::SequenceMismatch { .. })));

            // the entry survives the failed validation
            assert!(!entry.is_way_validated().await);
            assert_eq!(entry.sequence().await, Some(SequenceNumber::from_raw(5)));
        });
    }

    struct SlowWayHandshake;

    #[async_trait]
    impl WayHandshake for SlowWayHandshake {
        async fn confirm_activity(
            &self,
            _activity: ActivityId,
            claimed_seq: SequenceNumber,
            _server_boot: u64,
        ) -> anyhow::Result<WayConfirmation> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(WayConfirmation { sequence: claimed_seq })
        }
    }

    #[test]
    fn test_way_timeout_is_recoverable() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let table = table_with_handshake(Arc::new(SlowWayHandshake));
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);
            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;

            let result = table.way_validate(&entry, false).await;
            assert!(matches!(result, Err(WayError::Timeout)));
            assert!(!entry.is_way_validated().await);
        });
    }

    #[rstest]
    fn test_way_handshake_error_is_reported() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut handshake = MockWayHandshake::new();
            handshake.expect_confirm_activity()
                .returning(|_, _, _| Err(anyhow::anyhow!("credentials expired")));

            let table = table_with_handshake(Arc::new(handshake));
            let activity = ActivityId::new_random();
            let hint = table.shard_hint(&activity);
            let entry = table.get_or_create(activity, hint, SequenceNumber::ZERO).await;

            let result = table.way_validate(&entry, false).await;
            assert!(matches!(result, Err(WayError::Handshake(_))));
        });
    }
}
