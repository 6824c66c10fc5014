// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Protobuf messages for the on-disk formats and the consensus wire.
//!
//! The messages are hand-derived [`prost::Message`] structs: the set is
//! small and keeping it in-tree avoids a protoc build step while staying
//! wire-compatible with generated code.

/// Locates a block inside a CFile or an index/dir file.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct BlockPointerPb {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    #[prost(uint32, tag = "2")]
    pub size: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileMetadataPairPb {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

/// Trailing footer of every CFile. Located by the fixed-size tail
/// (`footer length || magic`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CFileFooterPb {
    #[prost(int32, tag = "1")]
    pub data_type: i32,
    #[prost(int32, tag = "2")]
    pub encoding: i32,
    #[prost(int32, tag = "3")]
    pub compression: i32,
    #[prost(uint64, tag = "4")]
    pub num_values: u64,
    #[prost(bool, tag = "5")]
    pub is_nullable: bool,
    #[prost(bool, tag = "6")]
    pub checksummed: bool,
    #[prost(message, optional, tag = "7")]
    pub posidx_root: ::core::option::Option<BlockPointerPb>,
    #[prost(message, optional, tag = "8")]
    pub validx_root: ::core::option::Option<BlockPointerPb>,
    #[prost(message, optional, tag = "9")]
    pub dict_block_ptr: ::core::option::Option<BlockPointerPb>,
    #[prost(message, repeated, tag = "10")]
    pub metadata: ::prost::alloc::vec::Vec<FileMetadataPairPb>,
}

/// One entry of an index block: the separator key and the child pointer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexEntryPb {
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub block: ::core::option::Option<BlockPointerPb>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnUpdateCountPb {
    #[prost(uint32, tag = "1")]
    pub column_id: u32,
    #[prost(int64, tag = "2")]
    pub count: i64,
}

/// Per-delta-file statistics, stored in the file's footer metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaStatsPb {
    #[prost(uint64, tag = "1")]
    pub min_timestamp: u64,
    #[prost(uint64, tag = "2")]
    pub max_timestamp: u64,
    #[prost(int64, tag = "3")]
    pub delete_count: i64,
    #[prost(int64, tag = "4")]
    pub reinsert_count: i64,
    #[prost(message, repeated, tag = "5")]
    pub update_counts: ::prost::alloc::vec::Vec<ColumnUpdateCountPb>,
}

/// Contents of a data root's instance file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirInstancePb {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub dir_type: ::prost::alloc::string::String,
    /// The full set of sibling UUIDs the deployment expects, this
    /// instance included.
    #[prost(string, repeated, tag = "3")]
    pub all_uuids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct OpIdPb {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(int64, tag = "2")]
    pub index: i64,
}

/// A single replicated operation. The payload is opaque to the peer
/// driver; it is produced and consumed by the log layer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateMsgPb {
    #[prost(message, optional, tag = "1")]
    pub id: ::core::option::Option<OpIdPb>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusRequestPb {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub caller_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub dest_uuid: ::prost::alloc::string::String,
    #[prost(int64, tag = "4")]
    pub caller_term: i64,
    #[prost(message, optional, tag = "5")]
    pub preceding_id: ::core::option::Option<OpIdPb>,
    #[prost(int64, optional, tag = "6")]
    pub committed_index: ::core::option::Option<i64>,
    #[prost(message, repeated, tag = "7")]
    pub ops: ::prost::alloc::vec::Vec<ReplicateMsgPb>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AppStatusCode {
    UnknownError = 0,
    Ok = 1,
    NotFound = 2,
    Corruption = 3,
    IllegalState = 4,
    ServiceUnavailable = 5,
    TimedOut = 6,
    Aborted = 7,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppStatusPb {
    #[prost(enumeration = "AppStatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConsensusErrorCode {
    UnknownConsensusError = 0,
    /// The remote replica could not prepare the transactions in the
    /// request; the leader should back off and retry.
    CannotPrepare = 1,
    InvalidTerm = 2,
    PrecedingEntryDidntMatch = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusErrorPb {
    #[prost(enumeration = "ConsensusErrorCode", tag = "1")]
    pub code: i32,
    #[prost(message, optional, tag = "2")]
    pub status: ::core::option::Option<AppStatusPb>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusStatusPb {
    #[prost(message, optional, tag = "1")]
    pub last_received: ::core::option::Option<OpIdPb>,
    #[prost(int64, tag = "2")]
    pub last_committed_idx: i64,
    #[prost(message, optional, tag = "3")]
    pub error: ::core::option::Option<ConsensusErrorPb>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TabletServerErrorCode {
    UnknownTabletServerError = 0,
    TabletNotFound = 1,
    TabletFailed = 2,
    WrongServerUuid = 3,
    Throttled = 4,
    AlreadyInprogress = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TabletServerErrorPb {
    #[prost(enumeration = "TabletServerErrorCode", tag = "1")]
    pub code: i32,
    #[prost(message, optional, tag = "2")]
    pub status: ::core::option::Option<AppStatusPb>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusResponsePb {
    #[prost(string, tag = "1")]
    pub responder_uuid: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub responder_term: i64,
    #[prost(message, optional, tag = "3")]
    pub status: ::core::option::Option<ConsensusStatusPb>,
    /// Tserver-level error, e.g. tablet not found.
    #[prost(message, optional, tag = "4")]
    pub error: ::core::option::Option<TabletServerErrorPb>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartTabletCopyRequestPb {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub dest_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub caller_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub copy_peer_addr: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub caller_term: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartTabletCopyResponsePb {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<TabletServerErrorPb>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteRequestPb {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub dest_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub candidate_uuid: ::prost::alloc::string::String,
    #[prost(int64, tag = "4")]
    pub candidate_term: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteResponsePb {
    #[prost(string, tag = "1")]
    pub responder_uuid: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
    #[prost(message, optional, tag = "3")]
    pub error: ::core::option::Option<TabletServerErrorPb>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunLeaderElectionRequestPb {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub dest_uuid: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunLeaderElectionResponsePb {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<TabletServerErrorPb>,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_footer_roundtrip() {
        let footer = CFileFooterPb {
            data_type: 3,
            encoding: 1,
            compression: 0,
            num_values: 12345,
            is_nullable: true,
            checksummed: true,
            posidx_root: Some(BlockPointerPb {
                offset: 4096,
                size: 512,
            }),
            validx_root: None,
            dict_block_ptr: None,
            metadata: vec![FileMetadataPairPb {
                key: "deltafile.type".to_owned(),
                value: b"REDO".to_vec(),
            }],
        };
        let bytes = footer.encode_to_vec();
        let decoded = CFileFooterPb::decode(&bytes[..]).unwrap();
        assert_eq!(footer, decoded);
    }

    #[test]
    fn test_unknown_enum_value_is_rejected() {
        assert_eq!(TabletServerErrorCode::try_from(4).ok(), Some(TabletServerErrorCode::Throttled));
        assert!(TabletServerErrorCode::try_from(99).is_err());
    }
}
