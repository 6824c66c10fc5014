// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The leader-side driver for one follower: request pipeline,
//! response classification, tablet-copy fallback, and heartbeating.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::proxy::{PeerProxy, PeerProxyFactory, RaftPeerInfo};
use super::queue::{ConsensusQueue, PeerStatus};
use crate::error::{Error, Result};
use crate::options::ConsensusOptions;
use crate::proto::{
    ConsensusErrorCode, ConsensusRequestPb, ConsensusResponsePb, RunLeaderElectionRequestPb,
    StartTabletCopyRequestPb, StartTabletCopyResponsePb, TabletServerErrorCode,
};
use crate::util::{PeriodicTimer, ThreadPoolToken};

/// Failed requests are logged on the first occurrence, then every Nth
/// retry.
const NUM_RETRIES_BETWEEN_LOGGING_FAILED_REQUEST: u64 = 5;
const NUM_FAILURES_BETWEEN_LOGGING_PROXY_CREATE: u64 = 10;

struct PeerState {
    /// Request buffer reused across attempts; the immutable
    /// identification fields are set once on first send.
    request: ConsensusRequestPb,
    request_pending: bool,
    closed: bool,
    has_sent_first_request: bool,
    failed_attempts: u64,
}

/// Drives replication to a single remote peer. All sends flow through
/// a per-replica serial pool token; RPC callbacks run on the
/// transport's reactor threads and re-submit heavy work to the token.
pub struct Peer {
    tablet_id: String,
    leader_uuid: String,
    peer_info: RaftPeerInfo,
    queue: Arc<dyn ConsensusQueue>,
    raft_pool_token: ThreadPoolToken,
    proxy_factory: Arc<dyn PeerProxyFactory>,
    proxy: Mutex<Option<Arc<dyn PeerProxy>>>,
    proxy_create_failures: AtomicU64,
    state: Mutex<PeerState>,
    heartbeater: Mutex<Option<PeriodicTimer>>,
    opts: ConsensusOptions,
}

impl Peer {
    /// Builds the peer, registers it with the queue, and starts its
    /// heartbeater.
    pub fn new_remote_peer(
        peer_info: RaftPeerInfo,
        tablet_id: String,
        leader_uuid: String,
        queue: Arc<dyn ConsensusQueue>,
        raft_pool_token: ThreadPoolToken,
        proxy_factory: Arc<dyn PeerProxyFactory>,
        opts: ConsensusOptions,
    ) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            tablet_id,
            leader_uuid,
            peer_info,
            queue,
            raft_pool_token,
            proxy_factory,
            proxy: Mutex::new(None),
            proxy_create_failures: AtomicU64::new(0),
            state: Mutex::new(PeerState {
                request: ConsensusRequestPb::default(),
                request_pending: false,
                closed: false,
                has_sent_first_request: false,
                failed_attempts: 0,
            }),
            heartbeater: Mutex::new(None),
            opts,
        });
        peer.create_proxy_if_needed();
        peer.queue.track_peer(&peer.peer_info.uuid);
        let w_this: Weak<Peer> = Arc::downgrade(&peer);
        let timer = PeriodicTimer::start(peer.opts.raft_heartbeat_interval, move || {
            if let Some(p) = w_this.upgrade() {
                if let Err(e) = p.signal_request(true) {
                    warn!(error = %e, "SignalRequest failed");
                }
            }
        });
        *peer.heartbeater.lock() = Some(timer);
        peer
    }

    pub fn peer_uuid(&self) -> &str {
        &self.peer_info.uuid
    }

    pub fn failed_attempts(&self) -> u64 {
        self.state.lock().failed_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[cfg(test)]
    fn request_pending(&self) -> bool {
        self.state.lock().request_pending
    }

    /// Wakes the send pipeline. Returns immediately when the peer is
    /// closed or an RPC is already in flight; otherwise the actual
    /// send runs on the raft pool token.
    pub fn signal_request(self: &Arc<Self>, even_if_queue_empty: bool) -> Result<()> {
        // Best-effort checks; send_next_request re-checks both flags
        // under the lock.
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::illegal_state("peer closed"));
            }
            if state.request_pending {
                return Ok(());
            }
        }
        let w_this = Arc::downgrade(self);
        self.raft_pool_token.submit(move || {
            if let Some(p) = w_this.upgrade() {
                p.send_next_request(even_if_queue_empty);
            }
        })
    }

    fn send_next_request(self: &Arc<Self>, mut even_if_queue_empty: bool) {
        let mut state = self.state.lock();
        if state.closed || state.request_pending {
            return;
        }
        // The first request is the negotiation round: it goes out even
        // with an empty queue.
        if !state.has_sent_first_request {
            even_if_queue_empty = true;
        }
        // After an error, skip per-op sends and wait for the
        // heartbeat to retry.
        if state.failed_attempts > 0 && !even_if_queue_empty {
            return;
        }

        let commit_index_before = state.request.committed_index.unwrap_or(0);
        let needs_tablet_copy =
            match self.queue.request_for_peer(&self.peer_info.uuid, &mut state.request) {
                Ok(needs) => needs,
                Err(e) => {
                    debug!(peer = %self.peer_info.uuid, error = %e, "could not obtain request");
                    return;
                }
            };
        let commit_index_after = state.request.committed_index.unwrap_or(0);

        // Only checked after request_for_peer so peer-health updates
        // made there still happen.
        if !self.create_proxy_if_needed() {
            return;
        }

        if needs_tablet_copy {
            let mut tc_request = StartTabletCopyRequestPb::default();
            match self.prepare_tablet_copy_request(&mut state, &mut tc_request) {
                Ok(()) => {
                    state.request_pending = true;
                    drop(state);
                    let s_this = self.clone();
                    let proxy = self.proxy.lock().clone().expect("proxy created above");
                    proxy.start_tablet_copy(
                        tc_request,
                        self.opts.consensus_rpc_timeout,
                        Box::new(move |result| {
                            s_this.process_tablet_copy_response(result);
                        }),
                    );
                }
                Err(e) => {
                    warn!(peer = %self.peer_info.uuid, error = %e,
                          "unable to generate tablet copy request for peer");
                }
            }
            return;
        }

        let req_has_ops =
            !state.request.ops.is_empty() || commit_index_after > commit_index_before;
        if !req_has_ops && !even_if_queue_empty {
            return;
        }
        if req_has_ops {
            // Actually sending ops; no need to heartbeat for a while.
            if let Some(hb) = self.heartbeater.lock().as_ref() {
                hb.snooze();
            }
        }
        if !state.has_sent_first_request {
            state.request.tablet_id = self.tablet_id.clone();
            state.request.caller_uuid = self.leader_uuid.clone();
            state.request.dest_uuid = self.peer_info.uuid.clone();
            state.has_sent_first_request = true;
        }

        let request = state.request.clone();
        state.request_pending = true;
        drop(state);

        let s_this = self.clone();
        let proxy = self.proxy.lock().clone().expect("proxy created above");
        proxy.update_consensus(
            request,
            self.opts.consensus_rpc_timeout,
            Box::new(move |result| {
                s_this.process_response(result);
            }),
        );
    }

    /// Classifies the RPC outcome. Runs on the reactor thread: the
    /// heavy path is re-submitted to the raft pool.
    fn process_response(self: &Arc<Self>, result: Result<ConsensusResponsePb>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        assert!(state.request_pending, "response without a pending request");

        let response = match result {
            Err(e) => {
                let status = match e {
                    Error::NetworkError(_) | Error::TimedOut(_) => PeerStatus::RpcLayerError,
                    _ => PeerStatus::RemoteError,
                };
                self.queue
                    .update_peer_status(&self.peer_info.uuid, status, Some(e.clone()));
                self.process_response_error(&mut state, &e);
                return;
            }
            Ok(response) => response,
        };

        if let Some(err) = response
            .status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .filter(|err| err.code == ConsensusErrorCode::CannotPrepare as i32)
        {
            let e = Error::illegal_state(
                err.status
                    .as_ref()
                    .map(|s| s.message.clone())
                    .unwrap_or_else(|| "cannot prepare".to_owned()),
            );
            self.queue.update_peer_status(
                &self.peer_info.uuid,
                PeerStatus::CannotPrepare,
                Some(e.clone()),
            );
            self.process_response_error(&mut state, &e);
            return;
        }

        if let Some(err) = &response.error {
            let status = match TabletServerErrorCode::try_from(err.code) {
                Ok(TabletServerErrorCode::WrongServerUuid)
                | Ok(TabletServerErrorCode::TabletFailed) => PeerStatus::TabletFailed,
                Ok(TabletServerErrorCode::TabletNotFound) => PeerStatus::TabletNotFound,
                _ => PeerStatus::RemoteError,
            };
            let e = Error::RuntimeError(
                err.status
                    .as_ref()
                    .map(|s| s.message.clone())
                    .unwrap_or_else(|| "tablet server error".to_owned()),
            );
            self.queue
                .update_peer_status(&self.peer_info.uuid, status, Some(e.clone()));
            self.process_response_error(&mut state, &e);
            return;
        }

        // The queue's handling of the response may generate IO, and
        // the follow-up send may too; run both on the pool, not the
        // reactor thread.
        let w_this = Arc::downgrade(self);
        let submit_result = self.raft_pool_token.submit(move || {
            if let Some(p) = w_this.upgrade() {
                p.do_process_response(&response);
            }
        });
        if let Err(e) = submit_result {
            warn!(peer = %self.peer_info.uuid, error = %e, "unable to process peer response");
            state.request_pending = false;
        }
    }

    fn do_process_response(self: &Arc<Self>, response: &ConsensusResponsePb) {
        let send_more_immediately = self
            .queue
            .response_from_peer(&self.peer_info.uuid, response);
        {
            let mut state = self.state.lock();
            assert!(state.request_pending);
            state.failed_attempts = 0;
            state.request_pending = false;
        }
        if send_more_immediately {
            self.send_next_request(true);
        }
    }

    /// Asks the remote peer to start an election. Unlike the update
    /// pipeline there may be several outstanding election calls, so
    /// the response travels entirely within the callback.
    pub fn start_election(&self) {
        if !self.create_proxy_if_needed() {
            return;
        }
        let request = RunLeaderElectionRequestPb {
            tablet_id: self.tablet_id.clone(),
            dest_uuid: self.peer_info.uuid.clone(),
        };
        let peer_uuid = self.peer_info.uuid.clone();
        let proxy = self.proxy.lock().clone().expect("proxy created above");
        proxy.run_leader_election(
            request,
            self.opts.consensus_rpc_timeout,
            Box::new(move |result| {
                let failure = match result {
                    Err(e) => Some(e.to_string()),
                    Ok(resp) => resp.error.and_then(|e| e.status).map(|s| s.message),
                };
                if let Some(msg) = failure {
                    warn!(peer = %peer_uuid, error = %msg, "unable to start election on peer");
                }
            }),
        );
    }

    fn prepare_tablet_copy_request(
        &self,
        state: &mut PeerState,
        request: &mut StartTabletCopyRequestPb,
    ) -> Result<()> {
        if !self.opts.enable_tablet_copy {
            state.failed_attempts += 1;
            return Err(Error::NotSupported("tablet copy is disabled".to_owned()));
        }
        self.queue
            .tablet_copy_request_for_peer(&self.peer_info.uuid, request)
    }

    fn process_tablet_copy_response(
        self: &Arc<Self>,
        result: Result<StartTabletCopyResponsePb>,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        assert!(state.request_pending);
        state.request_pending = false;
        drop(state);

        // OK and "already in progress" both mean the copy is underway.
        let throttled = matches!(
            &result,
            Ok(resp) if resp.error.as_ref().map(|e| e.code)
                == Some(TabletServerErrorCode::Throttled as i32)
        );
        match &result {
            Ok(resp)
                if resp.error.is_none()
                    || resp.error.as_ref().map(|e| e.code)
                        == Some(TabletServerErrorCode::AlreadyInprogress as i32) =>
            {
                self.queue
                    .update_peer_status(&self.peer_info.uuid, PeerStatus::Ok, None);
            }
            _ if throttled => {
                // A common answer from an overloaded server; logging
                // it would generate a great deal of spam.
            }
            _ => {
                warn!(peer = %self.peer_info.uuid, "unable to start tablet copy on peer");
            }
        }
    }

    fn process_response_error(&self, state: &mut PeerState, error: &Error) {
        state.failed_attempts += 1;
        if state.failed_attempts % NUM_RETRIES_BETWEEN_LOGGING_FAILED_REQUEST == 1 {
            warn!(
                peer = %self.peer_info.uuid,
                error = %error,
                attempt = state.failed_attempts,
                "couldn't send request to peer; this message will repeat every {}th retry",
                NUM_RETRIES_BETWEEN_LOGGING_FAILED_REQUEST,
            );
        }
        state.request_pending = false;
    }

    fn create_proxy_if_needed(&self) -> bool {
        let mut proxy = self.proxy.lock();
        if proxy.is_some() {
            return true;
        }
        match self.proxy_factory.new_proxy(&self.peer_info) {
            Ok(p) => {
                *proxy = Some(p);
                true
            }
            Err(e) => {
                let failures = self.proxy_create_failures.fetch_add(1, Ordering::Relaxed);
                if failures % NUM_FAILURES_BETWEEN_LOGGING_PROXY_CREATE == 0 {
                    warn!(peer = %self.peer_info.uuid, addr = %self.peer_info.addr,
                          error = %e, "unable to create proxy");
                }
                false
            }
        }
    }

    /// Idempotent: marks the peer closed, untracks it from the queue,
    /// and stops the heartbeater. In-flight callbacks observe the
    /// closed flag and return early.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        debug!(peer = %self.peer_info.uuid, "closing peer");
        self.queue.untrack_peer(&self.peer_info.uuid);
        if let Some(hb) = self.heartbeater.lock().take() {
            hb.stop();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::proto::{AppStatusPb, ConsensusStatusPb, TabletServerErrorPb};
    use crate::util::{ThreadPoolBuilder, TokenMode};

    #[derive(Default)]
    struct MockQueue {
        tracked: Mutex<Vec<String>>,
        untracked: Mutex<Vec<String>>,
        needs_tablet_copy: AtomicBool,
        pending_ops: Mutex<Vec<crate::proto::ReplicateMsgPb>>,
        committed_index: AtomicU64,
        statuses: Mutex<Vec<PeerStatus>>,
        requests_seen: Mutex<Vec<ConsensusRequestPb>>,
        send_more_immediately: AtomicBool,
    }

    impl ConsensusQueue for MockQueue {
        fn track_peer(&self, uuid: &str) {
            self.tracked.lock().push(uuid.to_owned());
        }

        fn untrack_peer(&self, uuid: &str) {
            self.untracked.lock().push(uuid.to_owned());
        }

        fn request_for_peer(
            &self,
            _uuid: &str,
            request: &mut ConsensusRequestPb,
        ) -> Result<bool> {
            request.ops = std::mem::take(&mut *self.pending_ops.lock());
            request.committed_index = Some(self.committed_index.load(Ordering::SeqCst) as i64);
            self.requests_seen.lock().push(request.clone());
            Ok(self.needs_tablet_copy.load(Ordering::SeqCst))
        }

        fn tablet_copy_request_for_peer(
            &self,
            uuid: &str,
            request: &mut StartTabletCopyRequestPb,
        ) -> Result<()> {
            request.dest_uuid = uuid.to_owned();
            Ok(())
        }

        fn update_peer_status(&self, _uuid: &str, status: PeerStatus, _error: Option<Error>) {
            self.statuses.lock().push(status);
        }

        fn response_from_peer(&self, _uuid: &str, _response: &ConsensusResponsePb) -> bool {
            self.send_more_immediately.swap(false, Ordering::SeqCst)
        }
    }

    type CannedResponse = Box<dyn Fn() -> Result<ConsensusResponsePb> + Send + Sync>;

    struct MockProxy {
        response: CannedResponse,
        update_calls: AtomicU64,
        copy_calls: AtomicU64,
        election_calls: AtomicU64,
        copy_response: Mutex<Option<StartTabletCopyResponsePb>>,
        /// When set, callbacks are parked here instead of invoked.
        parked: Mutex<Vec<super::super::proxy::ResponseCallback<ConsensusResponsePb>>>,
        park: AtomicBool,
    }

    impl MockProxy {
        fn ok() -> MockProxy {
            MockProxy {
                response: Box::new(|| Ok(ConsensusResponsePb::default())),
                update_calls: AtomicU64::new(0),
                copy_calls: AtomicU64::new(0),
                election_calls: AtomicU64::new(0),
                copy_response: Mutex::new(None),
                parked: Mutex::new(vec![]),
                park: AtomicBool::new(false),
            }
        }

        fn failing() -> MockProxy {
            let mut p = MockProxy::ok();
            p.response = Box::new(|| Err(Error::NetworkError("injected".to_owned())));
            p
        }
    }

    impl PeerProxy for MockProxy {
        fn update_consensus(
            &self,
            _request: ConsensusRequestPb,
            _timeout: Duration,
            callback: super::super::proxy::ResponseCallback<ConsensusResponsePb>,
        ) {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if self.park.load(Ordering::SeqCst) {
                self.parked.lock().push(callback);
            } else {
                callback((self.response)());
            }
        }

        fn request_consensus_vote(
            &self,
            _request: crate::proto::VoteRequestPb,
            _timeout: Duration,
            _callback: super::super::proxy::ResponseCallback<crate::proto::VoteResponsePb>,
        ) {
            unimplemented!("not exercised");
        }

        fn run_leader_election(
            &self,
            _request: crate::proto::RunLeaderElectionRequestPb,
            _timeout: Duration,
            callback: super::super::proxy::ResponseCallback<
                crate::proto::RunLeaderElectionResponsePb,
            >,
        ) {
            self.election_calls.fetch_add(1, Ordering::SeqCst);
            callback(Ok(crate::proto::RunLeaderElectionResponsePb::default()));
        }

        fn start_tablet_copy(
            &self,
            _request: StartTabletCopyRequestPb,
            _timeout: Duration,
            callback: super::super::proxy::ResponseCallback<StartTabletCopyResponsePb>,
        ) {
            self.copy_calls.fetch_add(1, Ordering::SeqCst);
            let resp = self.copy_response.lock().clone().unwrap_or_default();
            callback(Ok(resp));
        }

        fn peer_name(&self) -> String {
            "mock:0".to_owned()
        }
    }

    struct MockFactory {
        proxy: Arc<MockProxy>,
        fail_creation: AtomicBool,
    }

    impl PeerProxyFactory for MockFactory {
        fn new_proxy(&self, _peer: &RaftPeerInfo) -> Result<Arc<dyn PeerProxy>> {
            if self.fail_creation.load(Ordering::SeqCst) {
                return Err(Error::NetworkError("no route".to_owned()));
            }
            Ok(self.proxy.clone())
        }
    }

    struct Harness {
        queue: Arc<MockQueue>,
        proxy: Arc<MockProxy>,
        peer: Arc<Peer>,
        _pool: Arc<crate::util::ThreadPool>,
    }

    fn harness_with(proxy: MockProxy, opts: ConsensusOptions) -> Harness {
        let queue = Arc::new(MockQueue::default());
        let proxy = Arc::new(proxy);
        let pool = Arc::new(ThreadPoolBuilder::new("raft").max_threads(2).build());
        let token = pool.new_token(TokenMode::Serial);
        let factory = Arc::new(MockFactory {
            proxy: proxy.clone(),
            fail_creation: AtomicBool::new(false),
        });
        let peer = Peer::new_remote_peer(
            RaftPeerInfo {
                uuid: "follower-1".to_owned(),
                addr: "127.0.0.1:0".to_owned(),
            },
            "tablet-1".to_owned(),
            "leader-0".to_owned(),
            queue.clone(),
            token,
            factory,
            opts,
        );
        Harness {
            queue,
            proxy,
            peer,
            _pool: pool,
        }
    }

    fn harness(proxy: MockProxy) -> Harness {
        let opts = ConsensusOptions {
            raft_heartbeat_interval: Duration::from_secs(600),
            ..ConsensusOptions::default()
        };
        harness_with(proxy, opts)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn test_first_request_is_negotiation_with_identity() {
        let h = harness(MockProxy::ok());
        assert_eq!(*h.queue.tracked.lock(), vec!["follower-1".to_owned()]);
        // Even a non-heartbeat signal sends the first (empty) request.
        h.peer.signal_request(false).unwrap();
        settle();
        assert_eq!(h.proxy.update_calls.load(Ordering::SeqCst), 1);
        let state = h.peer.state.lock();
        assert_eq!(state.request.tablet_id, "tablet-1");
        assert_eq!(state.request.caller_uuid, "leader-0");
        assert_eq!(state.request.dest_uuid, "follower-1");
        assert!(state.has_sent_first_request);
    }

    #[test]
    fn test_at_most_one_outstanding_request() {
        let proxy = MockProxy::ok();
        proxy.park.store(true, Ordering::SeqCst);
        let h = harness(proxy);
        h.peer.signal_request(true).unwrap();
        settle();
        assert!(h.peer.request_pending());
        // Further signals return without a second RPC.
        h.peer.signal_request(true).unwrap();
        h.peer.signal_request(true).unwrap();
        settle();
        assert_eq!(h.proxy.update_calls.load(Ordering::SeqCst), 1);
        // Complete the parked RPC; the pipeline drains.
        let cb = h.proxy.parked.lock().pop().unwrap();
        cb(Ok(ConsensusResponsePb::default()));
        settle();
        assert!(!h.peer.request_pending());
        assert_eq!(h.peer.failed_attempts(), 0);
    }

    #[test]
    fn test_failures_count_and_reset_on_success() {
        let h = harness(MockProxy::failing());
        for _ in 0..7 {
            // Heartbeat-style signals retry despite previous failures.
            h.peer.signal_request(true).unwrap();
            settle();
        }
        assert_eq!(h.peer.failed_attempts(), 7);
        assert!(h
            .queue
            .statuses
            .lock()
            .iter()
            .all(|s| *s == PeerStatus::RpcLayerError));
        // Non-heartbeat signals are skipped while errored.
        let calls = h.proxy.update_calls.load(Ordering::SeqCst);
        h.peer.signal_request(false).unwrap();
        settle();
        assert_eq!(h.proxy.update_calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn test_remote_error_classification() {
        let make = |code: TabletServerErrorCode| {
            let mut resp = ConsensusResponsePb::default();
            resp.error = Some(TabletServerErrorPb {
                code: code as i32,
                status: Some(AppStatusPb {
                    code: 0,
                    message: "injected".to_owned(),
                }),
            });
            resp
        };
        for (code, expected) in [
            (TabletServerErrorCode::TabletNotFound, PeerStatus::TabletNotFound),
            (TabletServerErrorCode::TabletFailed, PeerStatus::TabletFailed),
            (TabletServerErrorCode::WrongServerUuid, PeerStatus::TabletFailed),
        ] {
            let mut proxy = MockProxy::ok();
            let resp = make(code);
            proxy.response = Box::new(move || Ok(resp.clone()));
            let h = harness(proxy);
            h.peer.signal_request(true).unwrap();
            settle();
            assert_eq!(h.queue.statuses.lock().as_slice(), &[expected]);
            assert_eq!(h.peer.failed_attempts(), 1);
        }
    }

    #[test]
    fn test_cannot_prepare_classification() {
        let mut proxy = MockProxy::ok();
        proxy.response = Box::new(|| {
            let mut resp = ConsensusResponsePb::default();
            resp.status = Some(ConsensusStatusPb {
                last_received: None,
                last_committed_idx: 0,
                error: Some(crate::proto::ConsensusErrorPb {
                    code: ConsensusErrorCode::CannotPrepare as i32,
                    status: None,
                }),
            });
            Ok(resp)
        });
        let h = harness(proxy);
        h.peer.signal_request(true).unwrap();
        settle();
        assert_eq!(h.queue.statuses.lock().as_slice(), &[PeerStatus::CannotPrepare]);
    }

    #[test]
    fn test_send_more_immediately_chains_sends() {
        let h = harness(MockProxy::ok());
        h.queue.send_more_immediately.store(true, Ordering::SeqCst);
        h.peer.signal_request(true).unwrap();
        settle();
        // First send plus the immediate follow-up.
        assert_eq!(h.proxy.update_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tablet_copy_paths() {
        // Success path.
        let h = harness(MockProxy::ok());
        h.queue.needs_tablet_copy.store(true, Ordering::SeqCst);
        h.peer.signal_request(true).unwrap();
        settle();
        assert_eq!(h.proxy.copy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.statuses.lock().as_slice(), &[PeerStatus::Ok]);
        assert!(!h.peer.request_pending());

        // ALREADY_INPROGRESS is success; THROTTLED is swallowed.
        for (code, expect_ok) in [
            (TabletServerErrorCode::AlreadyInprogress, true),
            (TabletServerErrorCode::Throttled, false),
        ] {
            let proxy = MockProxy::ok();
            *proxy.copy_response.lock() = Some(StartTabletCopyResponsePb {
                error: Some(TabletServerErrorPb {
                    code: code as i32,
                    status: None,
                }),
            });
            let h = harness(proxy);
            h.queue.needs_tablet_copy.store(true, Ordering::SeqCst);
            h.peer.signal_request(true).unwrap();
            settle();
            let statuses = h.queue.statuses.lock();
            if expect_ok {
                assert_eq!(statuses.as_slice(), &[PeerStatus::Ok]);
            } else {
                assert!(statuses.is_empty());
            }
        }
    }

    #[test]
    fn test_tablet_copy_disabled_counts_failure() {
        let opts = ConsensusOptions {
            raft_heartbeat_interval: Duration::from_secs(600),
            enable_tablet_copy: false,
            ..ConsensusOptions::default()
        };
        let h = harness_with(MockProxy::ok(), opts);
        h.queue.needs_tablet_copy.store(true, Ordering::SeqCst);
        h.peer.signal_request(true).unwrap();
        settle();
        assert_eq!(h.proxy.copy_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.peer.failed_attempts(), 1);
    }

    #[test]
    fn test_start_election_is_fire_and_forget() {
        let h = harness(MockProxy::ok());
        h.peer.start_election();
        h.peer.start_election();
        assert_eq!(h.proxy.election_calls.load(Ordering::SeqCst), 2);
        // Elections never occupy the update pipeline.
        assert!(!h.peer.request_pending());
    }

    #[test]
    fn test_close_is_idempotent_and_terminal() {
        let h = harness(MockProxy::ok());
        h.peer.close();
        h.peer.close();
        assert!(h.peer.is_closed());
        assert_eq!(*h.queue.untracked.lock(), vec!["follower-1".to_owned()]);
        let err = h.peer.signal_request(true).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn test_heartbeat_fires_with_empty_queue() {
        let opts = ConsensusOptions {
            raft_heartbeat_interval: Duration::from_millis(20),
            ..ConsensusOptions::default()
        };
        let h = harness_with(MockProxy::ok(), opts);
        std::thread::sleep(Duration::from_millis(120));
        // Several heartbeats went out despite no ops being queued.
        assert!(h.proxy.update_calls.load(Ordering::SeqCst) >= 2);
        assert!(h
            .queue
            .requests_seen
            .lock()
            .iter()
            .all(|r| r.ops.is_empty()));
    }

    #[test]
    fn test_heartbeat_still_issues_after_failure() {
        let opts = ConsensusOptions {
            raft_heartbeat_interval: Duration::from_millis(20),
            ..ConsensusOptions::default()
        };
        let h = harness_with(MockProxy::failing(), opts);
        std::thread::sleep(Duration::from_millis(150));
        // failed_attempts grows monotonically across heartbeats.
        assert!(h.peer.failed_attempts() >= 2);
    }
}
