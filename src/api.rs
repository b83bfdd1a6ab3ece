//! Typed request/response records for the remote operations.
//!
//! The wire framework is a collaborator, not part of this crate: a
//! dispatcher hands these records to the tablet and returns the responses.
//! Every response carries a `ReturnCode` and a human-readable message.

use serde::{Deserialize, Serialize};

use crate::binlog::{Dimension, LogEntry, TsDimension};
use crate::codes::ReturnCode;
use crate::meta::{ColumnDesc, ColumnKey, StorageMode, TableMeta, TableMode, TtlDesc};
use crate::snapshot::Manifest;
use crate::storage::iterator::SeekType;
use crate::storage::relational::Datum;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneralResponse {
    pub code: ReturnCode,
    pub msg: String,
}

impl GeneralResponse {
    pub fn ok() -> Self {
        Self { code: ReturnCode::Ok, msg: "ok".to_string() }
    }

    pub fn err(code: ReturnCode, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

// ===== task tracking =====

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    MakeSnapshot,
    PauseSnapshot,
    RecoverSnapshot,
    SendSnapshot,
    LoadTable,
    AddReplica,
    DelReplica,
    DropTable,
    DumpIndexData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Doing,
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub op_id: u64,
    pub task_id: u64,
    pub task_type: TaskType,
    pub status: TaskStatus,
}

impl TaskInfo {
    pub fn new(op_id: u64, task_id: u64, task_type: TaskType) -> Self {
        Self { op_id, task_id, task_type, status: TaskStatus::Doing }
    }
}

// ===== data path =====

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub tid: u32,
    pub pid: u32,
    pub pk: String,
    pub time: u64,
    pub value: Vec<u8>,
    pub dimensions: Vec<Dimension>,
    pub ts_dimensions: Vec<TsDimension>,
}

impl PutRequest {
    pub fn new(tid: u32, pid: u32, pk: impl Into<String>, time: u64, value: Vec<u8>) -> Self {
        Self {
            tid,
            pid,
            pk: pk.into(),
            time,
            value,
            dimensions: Vec::new(),
            ts_dimensions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub tid: u32,
    pub pid: u32,
    pub key: String,
    pub ts: u64,
    pub ts_type: SeekType,
    pub et: u64,
    pub et_type: SeekType,
    pub idx_name: Option<String>,
    pub ts_name: Option<String>,
}

impl GetRequest {
    pub fn new(tid: u32, pid: u32, key: impl Into<String>, ts: u64, ts_type: SeekType) -> Self {
        Self {
            tid,
            pid,
            key: key.into(),
            ts,
            ts_type,
            et: 0,
            et_type: SeekType::Ge,
            idx_name: None,
            ts_name: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub ts: u64,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    pub tid: u32,
    pub pid: u32,
    pub pk: String,
    pub st: u64,
    pub st_type: SeekType,
    pub et: u64,
    pub et_type: SeekType,
    pub limit: u32,
    pub atleast: u32,
    pub idx_name: Option<String>,
    pub ts_name: Option<String>,
    pub enable_remove_duplicated_record: bool,
}

impl ScanRequest {
    pub fn new(tid: u32, pid: u32, pk: impl Into<String>, st: u64, et: u64) -> Self {
        Self {
            tid,
            pid,
            pk: pk.into(),
            st,
            st_type: SeekType::Le,
            et,
            et_type: SeekType::Ge,
            limit: 0,
            atleast: 0,
            idx_name: None,
            ts_name: None,
            enable_remove_duplicated_record: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub count: u32,
    pub pairs: Vec<(u64, Vec<u8>)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CountRequest {
    pub tid: u32,
    pub pid: u32,
    pub key: String,
    pub st: u64,
    pub st_type: SeekType,
    pub et: u64,
    pub et_type: SeekType,
    pub filter_expired_data: bool,
    pub idx_name: Option<String>,
    pub ts_name: Option<String>,
    pub enable_remove_duplicated_record: bool,
}

impl CountRequest {
    pub fn new(tid: u32, pid: u32, key: impl Into<String>) -> Self {
        Self {
            tid,
            pid,
            key: key.into(),
            st: 0,
            st_type: SeekType::Le,
            et: 0,
            et_type: SeekType::Ge,
            filter_expired_data: false,
            idx_name: None,
            ts_name: None,
            enable_remove_duplicated_record: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraverseRequest {
    pub tid: u32,
    pub pid: u32,
    pub idx_name: Option<String>,
    pub ts_name: Option<String>,
    pub pk: Option<String>,
    pub ts: u64,
    pub limit: u32,
    pub enable_remove_duplicated_record: bool,
}

impl TraverseRequest {
    pub fn new(tid: u32, pid: u32) -> Self {
        Self {
            tid,
            pid,
            idx_name: None,
            ts_name: None,
            pk: None,
            ts: 0,
            limit: 100,
            enable_remove_duplicated_record: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraverseResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub count: u32,
    pub pairs: Vec<(String, u64, Vec<u8>)>,
    pub pk: String,
    pub ts: u64,
    pub is_finish: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub tid: u32,
    pub pid: u32,
    pub key: String,
    pub idx_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub tid: u32,
    pub pid: u32,
    pub condition_columns: Vec<(String, Datum)>,
    pub value_columns: Vec<(String, Datum)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchQueryRequest {
    pub tid: u32,
    pub pid: u32,
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchQueryResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub count: u32,
    pub values: Vec<Option<Vec<u8>>>,
}

// ===== table lifecycle =====

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub table_meta: TableMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadTableRequest {
    pub table_meta: TableMeta,
    pub task_info: Option<TaskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropTableRequest {
    pub tid: u32,
    pub pid: u32,
    pub task_info: Option<TaskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRoleRequest {
    pub tid: u32,
    pub pid: u32,
    pub mode: TableMode,
    pub term: u64,
    pub replicas: Vec<String>,
    pub endpoint_tid: Vec<(String, u32)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaRequest {
    pub tid: u32,
    pub pid: u32,
    pub endpoint: String,
    pub remote_tid: Option<u32>,
    pub task_info: Option<TaskInfo>,
}

// ===== replication =====

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub tid: u32,
    pub pid: u32,
    pub pre_log_index: u64,
    pub pre_log_term: u64,
    pub term: u64,
    pub entries: Vec<LogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub log_offset: u64,
}

// ===== snapshot =====

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralRequest {
    pub tid: u32,
    pub pid: u32,
    pub storage_mode: Option<StorageMode>,
    pub task_info: Option<TaskInfo>,
}

impl GeneralRequest {
    pub fn new(tid: u32, pid: u32) -> Self {
        Self { tid, pid, storage_mode: None, task_info: None }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MakeSnapshotRequest {
    pub tid: u32,
    pub pid: u32,
    pub offset: u64,
    pub task_info: Option<TaskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendSnapshotRequest {
    pub tid: u32,
    pub pid: u32,
    pub endpoint: String,
    pub remote_tid: u32,
    pub task_info: Option<TaskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendDataRequest {
    pub tid: u32,
    pub pid: u32,
    pub file_name: String,
    pub block_id: u64,
    pub block_size: u32,
    pub eof: bool,
    pub dir_name: Option<String>,
    pub storage_mode: Option<StorageMode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckFileRequest {
    pub tid: u32,
    pub pid: u32,
    pub file: String,
    pub size: u64,
    pub dir_name: Option<String>,
    pub storage_mode: Option<StorageMode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetManifestResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub manifest: Manifest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTermPairResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub has_table: bool,
    pub is_leader: bool,
    pub term: u64,
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSnapshotOffsets {
    pub tid: u32,
    pub parts: Vec<(u32, u64)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetAllSnapshotOffsetResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub tables: Vec<TableSnapshotOffsets>,
}

// ===== status and admin =====

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTableStatusRequest {
    pub tid: Option<u32>,
    pub pid: Option<u32>,
    pub need_schema: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableStatus {
    pub tid: u32,
    pub pid: u32,
    pub name: String,
    pub mode: TableMode,
    pub state: String,
    pub storage_mode: StorageMode,
    pub ttl_desc: Option<TtlDesc>,
    pub offset: u64,
    pub record_cnt: u64,
    pub record_byte_size: u64,
    pub record_pk_cnt: u64,
    pub idx_cnt: u64,
    pub diskused: u64,
    pub is_expire: bool,
    pub time_offset: i64,
    pub schema: Option<TableMeta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTableStatusResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub all_table_status: Vec<TableStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTableFollowerResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub offset: u64,
    pub follower_info: Vec<(String, u64)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTableSchemaResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub table_meta: Option<TableMeta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateTableMetaForAddFieldRequest {
    pub tid: u32,
    pub column_desc: ColumnDesc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteIndexRequest {
    pub tid: u32,
    pub idx_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpIndexDataRequest {
    pub tid: u32,
    pub pid: u32,
    pub partition_num: u32,
    pub column_key: ColumnKey,
    pub idx: u32,
    pub task_info: Option<TaskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetExpireRequest {
    pub tid: u32,
    pub pid: u32,
    pub is_expire: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetTtlClockRequest {
    pub tid: u32,
    pub pid: u32,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateTtlRequest {
    pub tid: u32,
    pub pid: u32,
    pub ttl_desc: TtlDesc,
    pub ts_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetConcurrencyRequest {
    pub key: String,
    pub max_concurrency: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetModeRequest {
    pub follower: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTaskStatusResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub tasks: Vec<TaskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteTaskRequest {
    pub op_ids: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShowMemPoolResponse {
    pub code: ReturnCode,
    pub msg: String,
    pub mem_release_rate: u32,
    pub table_cnt: u64,
    pub total_record_byte_size: u64,
}
