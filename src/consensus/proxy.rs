// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The RPC seam: proxies to remote consensus peers. The transport is
//! an external collaborator; test doubles implement these traits.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::proto::{
    ConsensusRequestPb, ConsensusResponsePb, RunLeaderElectionRequestPb,
    RunLeaderElectionResponsePb, StartTabletCopyRequestPb, StartTabletCopyResponsePb,
    VoteRequestPb, VoteResponsePb,
};

/// Invoked on the transport's reactor thread when the call completes;
/// it must not block.
pub type ResponseCallback<R> = Box<dyn FnOnce(Result<R>) + Send + 'static>;

/// Identity and address of a remote replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftPeerInfo {
    pub uuid: String,
    pub addr: String,
}

/// Async proxy to one remote peer. `Err` delivered to a callback is a
/// transport-layer failure; application errors travel inside the
/// response message.
pub trait PeerProxy: Send + Sync {
    fn update_consensus(
        &self,
        request: ConsensusRequestPb,
        timeout: Duration,
        callback: ResponseCallback<ConsensusResponsePb>,
    );

    fn request_consensus_vote(
        &self,
        request: VoteRequestPb,
        timeout: Duration,
        callback: ResponseCallback<VoteResponsePb>,
    );

    fn run_leader_election(
        &self,
        request: RunLeaderElectionRequestPb,
        timeout: Duration,
        callback: ResponseCallback<RunLeaderElectionResponsePb>,
    );

    fn start_tablet_copy(
        &self,
        request: StartTabletCopyRequestPb,
        timeout: Duration,
        callback: ResponseCallback<StartTabletCopyResponsePb>,
    );

    fn peer_name(&self) -> String;
}

/// Creates proxies on demand. Creation can fail (e.g. DNS); the peer
/// retries on its next send.
pub trait PeerProxyFactory: Send + Sync {
    fn new_proxy(&self, peer: &RaftPeerInfo) -> Result<Arc<dyn PeerProxy>>;
}
