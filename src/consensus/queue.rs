// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The peer driver's view of the consensus queue.

use crate::error::{Error, Result};
use crate::proto::{ConsensusRequestPb, ConsensusResponsePb, StartTabletCopyRequestPb};

/// Classified outcome of one exchange with a peer. The queue folds
/// these into peer-health decisions and throttling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Ok,
    /// The RPC could not be delivered or timed out at the transport.
    RpcLayerError,
    /// The remote server answered with an unclassified error.
    RemoteError,
    /// The remote replica could not prepare the ops.
    CannotPrepare,
    TabletNotFound,
    /// Covers both a failed tablet and a wrong-server-uuid answer.
    TabletFailed,
}

/// Leader-side queue of replicated operations, owned by the consensus
/// implementation; the peer driver only consumes this interface.
pub trait ConsensusQueue: Send + Sync {
    fn track_peer(&self, uuid: &str);

    fn untrack_peer(&self, uuid: &str);

    /// Populates `request` with the peer's next ops and the committed
    /// index. Returns true when the peer has fallen behind the log and
    /// needs a tablet copy instead.
    fn request_for_peer(&self, uuid: &str, request: &mut ConsensusRequestPb) -> Result<bool>;

    fn tablet_copy_request_for_peer(
        &self,
        uuid: &str,
        request: &mut StartTabletCopyRequestPb,
    ) -> Result<()>;

    /// Reports a classified exchange outcome for peer-health tracking.
    fn update_peer_status(&self, uuid: &str, status: PeerStatus, error: Option<Error>);

    /// Processes a successful response. Returns true when the peer
    /// should be sent more data immediately.
    fn response_from_peer(&self, uuid: &str, response: &ConsensusResponsePb) -> bool;
}
