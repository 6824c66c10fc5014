// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Consensus peer driving: the leader-side pipeline replicating log
//! entries to followers, with health classification and tablet-copy
//! fallback.

mod peer;
mod proxy;
mod queue;

pub use peer::Peer;
pub use proxy::{PeerProxy, PeerProxyFactory, RaftPeerInfo, ResponseCallback};
pub use queue::{ConsensusQueue, PeerStatus};
