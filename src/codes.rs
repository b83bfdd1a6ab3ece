//! Response code taxonomy for remote operations.
//!
//! Every remote operation answers with a numeric code and a human-readable
//! message. The set is closed: each code has exactly one meaning, and partial
//! successes get their own codes so callers can distinguish "already there"
//! from "failed to add".

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ReturnCode {
    Ok = 0,

    // Not-found family.
    TableIsNotExist = 100,
    KeyNotFound = 101,
    IdxNameNotFound = 102,
    TsNameNotFound = 103,
    ReplicatorIsNotExist = 104,
    SnapshotIsNotExist = 105,
    NoFollower = 106,

    // State family.
    TableIsLoading = 110,
    TableStatusIsNotNormal = 111,
    TableStatusIsNotSnapshotPaused = 112,
    TableStatusIsMakingSnapshot = 113,
    TableIsLeader = 114,
    TableIsFollower = 115,
    IsFollowerCluster = 116,
    TableAlreadyExists = 117,
    ReplicatorRoleIsNotLeader = 118,

    // Validation family.
    InvalidParameter = 120,
    InvalidDimensionParameter = 121,
    InvalidConcurrency = 122,
    StLessThanEt = 123,
    TsMustBeGreaterThanZero = 124,
    TtlTypeMismatch = 125,
    TtlIsGreaterThanConfValue = 126,
    TableMetaIsIllegal = 127,
    OperatorNotSupport = 128,

    // Resource family.
    FailToGetDbRootPath = 130,
    FailToGetRecycleRootPath = 131,
    TableDbPathIsNotExist = 132,
    WriteDataFailed = 133,
    FailToCreateFile = 134,

    // Protocol / op family.
    BlockIdMismatch = 140,
    ReceiveDataError = 141,
    CannotFindReceiver = 142,
    FileReceiverInitFailed = 143,
    SnapshotIsSending = 144,
    FailToAppendEntriesToReplicator = 145,
    ReacheTheScanMaxBytesSize = 146,
    ReplicaEndpointAlreadyExists = 147,
    FailToAddReplicaEndpoint = 148,
    AddTaskFailed = 149,

    // Terminal family.
    CreateTableFailed = 150,
    PutFailed = 151,
    DeleteFailed = 152,
    UpdateFailed = 153,
    DumpIndexDataFailed = 154,
    IndexDeleteFailed = 155,
}

impl ReturnCode {
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }
}
