//! The tablet runtime: owns every partition on this node, drives the
//! partition lifecycle state machine and serves the remote operations.
//!
//! The `(tid, pid)` map is guarded by one mutex; handlers clone the
//! partition's shared handles and drop the lock before doing any work, so a
//! slow scan never blocks the map. Long-running operations (load, drop,
//! snapshot, send-snapshot, index dump) validate inline, then run on the
//! scheduler when one is attached and synchronously otherwise.

pub mod tasks;
pub mod transfer;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::api::*;
use crate::binlog::{Dimension, LogEntry, LogPart, OpType};
use crate::clock::{now_secs, now_time_string, parse_time_string};
use crate::codes::ReturnCode;
use crate::config::TabletConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::hash::{murmur64, select_root, ROOT_HASH_SEED};
use crate::meta::{StorageMode, TableMeta, TableMode, TableType};
use crate::replica::{AddNode, DelNode, PeerConnector, Replicator, Role};
use crate::scheduler::Scheduler;
use crate::snapshot::{Manifest, Snapshot, WriteHandle};
use crate::storage::disk_table::DiskTable;
use crate::storage::mem_table::MemTable;
use crate::storage::query::{self, QueryError};
use crate::storage::relational::RelationalTable;
use crate::storage::{TableStat, TsTable};
use transfer::{FileReceiver, FileSender};

/// Per-operation concurrency key that addresses the whole server.
pub const SERVER_CONCURRENCY_KEY: &str = "server";

#[derive(Clone)]
enum Partition {
    Ts {
        table: Arc<TsTable>,
        snapshot: Arc<Snapshot>,
        replicator: Arc<Replicator>,
    },
    Relational {
        table: Arc<RelationalTable>,
    },
}

type TaskHandle = Arc<Mutex<TaskInfo>>;

pub struct TabletServer {
    config: TabletConfig,
    connector: Arc<dyn PeerConnector>,
    partitions: Mutex<BTreeMap<(u32, u32), Partition>>,
    task_map: Mutex<BTreeMap<u64, Vec<TaskHandle>>>,
    receivers: Mutex<HashMap<String, Arc<Mutex<FileReceiver>>>>,
    sending: Mutex<HashSet<String>>,
    follower_cluster: AtomicBool,
    coordinated: AtomicBool,
    concurrency: Mutex<HashMap<String, i32>>,
    global_concurrency: AtomicI32,
    scheduler: RwLock<Option<Arc<Scheduler>>>,
    _locks: Vec<FileLock>,
}

impl TabletServer {
    pub fn new(config: TabletConfig, connector: Arc<dyn PeerConnector>) -> Result<Arc<Self>> {
        let mut locks = Vec::new();
        for root in config
            .db_root_paths
            .iter()
            .chain(config.ssd_root_paths.iter())
            .chain(config.hdd_root_paths.iter())
        {
            fs::create_dir_all(root)?;
            locks.push(FileLock::lock(root.join("tablet.lock"))?);
        }
        Ok(Arc::new(Self {
            config,
            connector,
            partitions: Mutex::new(BTreeMap::new()),
            task_map: Mutex::new(BTreeMap::new()),
            receivers: Mutex::new(HashMap::new()),
            sending: Mutex::new(HashSet::new()),
            follower_cluster: AtomicBool::new(false),
            coordinated: AtomicBool::new(false),
            concurrency: Mutex::new(HashMap::new()),
            global_concurrency: AtomicI32::new(0),
            scheduler: RwLock::new(None),
            _locks: locks,
        }))
    }

    pub fn config(&self) -> &TabletConfig {
        &self.config
    }

    /// Attach a scheduler and register the background ticks. Without this,
    /// long-running operations execute synchronously in the caller.
    pub fn start(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        *self.scheduler.write().unwrap() = Some(scheduler.clone());
        tasks::register_all(self, scheduler);
    }

    fn dispatch<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler = self.scheduler.read().unwrap().clone();
        match scheduler {
            Some(scheduler) => scheduler.spawn_blocking(move || {
                f();
                Ok(())
            }),
            None => f(),
        }
    }

    // ===== path selection =====

    fn choose_db_root(&self, tid: u32, pid: u32, mode: StorageMode) -> Option<&PathBuf> {
        let roots = self.config.roots(mode);
        if roots.is_empty() {
            return None;
        }
        Some(&roots[select_root(tid, pid, roots.len())])
    }

    fn partition_path(&self, tid: u32, pid: u32, mode: StorageMode) -> Option<PathBuf> {
        self.choose_db_root(tid, pid, mode)
            .map(|root| root.join(format!("{tid}_{pid}")))
    }

    fn choose_recycle_root(&self, tid: u32, pid: u32, mode: StorageMode) -> Option<&PathBuf> {
        let roots = self.config.recycle_roots(mode);
        if roots.is_empty() {
            return None;
        }
        Some(&roots[select_root(tid, pid, roots.len())])
    }

    // ===== partition accessors =====

    fn get_partition(&self, tid: u32, pid: u32) -> Option<Partition> {
        self.partitions.lock().unwrap().get(&(tid, pid)).cloned()
    }

    fn get_ts(&self, tid: u32, pid: u32) -> Option<(Arc<TsTable>, Arc<Snapshot>, Arc<Replicator>)> {
        match self.get_partition(tid, pid) {
            Some(Partition::Ts { table, snapshot, replicator }) => {
                Some((table, snapshot, replicator))
            }
            _ => None,
        }
    }

    fn get_relational(&self, tid: u32, pid: u32) -> Option<Arc<RelationalTable>> {
        match self.get_partition(tid, pid) {
            Some(Partition::Relational { table }) => Some(table),
            _ => None,
        }
    }

    // ===== task tracking =====

    fn add_op_task(
        &self,
        task_info: &Option<TaskInfo>,
        expected: TaskType,
        multi: bool,
    ) -> std::result::Result<Option<TaskHandle>, GeneralResponse> {
        let Some(task_info) = task_info else { return Ok(None) };
        let mut task_map = self.task_map.lock().unwrap();
        let duplicate = task_map.get(&task_info.op_id).map_or(false, |tasks| {
            tasks.iter().any(|t| {
                let t = t.lock().unwrap();
                t.task_type == task_info.task_type && (!multi || t.task_id == task_info.task_id)
            })
        });
        if duplicate {
            tracing::warn!(op_id = task_info.op_id, "task is already running");
            return Err(GeneralResponse::err(ReturnCode::AddTaskFailed, "add task failed"));
        }
        let mut task = task_info.clone();
        task.status = TaskStatus::Doing;
        let handle = Arc::new(Mutex::new(task));
        task_map.entry(task_info.op_id).or_default().push(handle.clone());
        if task_info.task_type != expected {
            handle.lock().unwrap().status = TaskStatus::Failed;
            return Err(GeneralResponse::err(ReturnCode::AddTaskFailed, "task type mismatch"));
        }
        Ok(Some(handle))
    }

    fn finish_task(task: &Option<TaskHandle>, ok: bool) {
        if let Some(task) = task {
            task.lock().unwrap().status = if ok { TaskStatus::Done } else { TaskStatus::Failed };
        }
    }

    // ===== data path =====

    pub fn put(&self, req: &PutRequest) -> GeneralResponse {
        if self.follower_cluster.load(Ordering::Relaxed) {
            return GeneralResponse::err(ReturnCode::IsFollowerCluster, "is follower cluster");
        }
        if let Some(r_table) = self.get_relational(req.tid, req.pid) {
            return match r_table.put(&req.value) {
                Ok(_) => GeneralResponse::ok(),
                Err(e) => GeneralResponse::err(ReturnCode::PutFailed, e.to_string()),
            };
        }
        let Some((table, _, replicator)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if req.time == 0 && req.ts_dimensions.is_empty() {
            return GeneralResponse::err(
                ReturnCode::TsMustBeGreaterThanZero,
                "ts must be greater than zero",
            );
        }
        if !table.core().is_leader() {
            return GeneralResponse::err(ReturnCode::TableIsFollower, "table is follower");
        }
        if table.core().stat() == TableStat::Loading {
            return GeneralResponse::err(ReturnCode::TableIsLoading, "table is loading");
        }

        let mut entry = LogEntry {
            offset: 0,
            term: 0,
            op: OpType::Put,
            pk: req.pk.clone(),
            ts: req.time,
            value: req.value.clone(),
            dimensions: req.dimensions.clone(),
            ts_dimensions: req.ts_dimensions.clone(),
        };
        if let Err(e) = table.apply_entry(&entry) {
            let code = if req.dimensions.is_empty() {
                ReturnCode::PutFailed
            } else {
                ReturnCode::InvalidDimensionParameter
            };
            return GeneralResponse::err(code, e.to_string());
        }
        if let Err(e) = replicator.append_entry(&mut entry) {
            tracing::warn!(tid = req.tid, pid = req.pid, error = %e, "failed to append to binlog");
        }
        GeneralResponse::ok()
    }

    pub fn get(&self, req: &GetRequest) -> GetResponse {
        let fail = |code: ReturnCode, msg: &str| GetResponse {
            code,
            msg: msg.to_string(),
            ts: 0,
            value: Vec::new(),
        };
        if let Some(r_table) = self.get_relational(req.tid, req.pid) {
            return match r_table.get(&req.key) {
                Ok(Some(value)) => GetResponse { code: ReturnCode::Ok, msg: "ok".into(), ts: 0, value },
                Ok(None) => fail(ReturnCode::KeyNotFound, "key not found"),
                Err(e) => fail(ReturnCode::InvalidParameter, &e.to_string()),
            };
        }
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return fail(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.core().stat() == TableStat::Loading {
            return fail(ReturnCode::TableIsLoading, "table is loading");
        }
        let Some(def) = table.resolve_index(req.idx_name.as_deref()) else {
            return fail(ReturnCode::IdxNameNotFound, "idx name not found");
        };
        let Ok(slot) = table.resolve_ts_slot(&def, req.ts_name.as_deref()) else {
            return fail(ReturnCode::TsNameNotFound, "ts name not found");
        };
        let mut it = match table.ts_iterator(def.id, slot, &req.key) {
            Ok(it) => it,
            Err(e) => return fail(ReturnCode::InvalidParameter, &e.to_string()),
        };
        let ttl = table.effective_ttl(&def, slot);
        let expire_time = table.core().expire_time(ttl.abs_ttl);
        let params = query::GetParams {
            st: req.ts,
            st_type: req.ts_type,
            et: req.et,
            et_type: req.et_type,
        };
        match query::get_index(expire_time, ttl.lat_ttl, ttl.ttl_type, it.as_mut(), params) {
            Ok(Some((ts, value))) => GetResponse { code: ReturnCode::Ok, msg: "ok".into(), ts, value },
            Ok(None) => fail(ReturnCode::KeyNotFound, "key not found"),
            Err(QueryError::InvalidArgs) => fail(ReturnCode::InvalidParameter, "invalid args"),
            Err(QueryError::InvalidSeekType) => {
                fail(ReturnCode::InvalidParameter, "st/et sub key type is invalid")
            }
            Err(QueryError::ReachedMaxBytes) => {
                fail(ReturnCode::ReacheTheScanMaxBytesSize, "reach the max scan byte size")
            }
        }
    }

    pub fn scan(&self, req: &ScanRequest) -> ScanResponse {
        let fail = |code: ReturnCode, msg: &str| ScanResponse {
            code,
            msg: msg.to_string(),
            count: 0,
            pairs: Vec::new(),
        };
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return fail(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.core().stat() == TableStat::Loading {
            return fail(ReturnCode::TableIsLoading, "table is loading");
        }
        if req.st > 0 && req.st < req.et {
            return fail(ReturnCode::StLessThanEt, "starttime less than endtime");
        }
        let Some(def) = table.resolve_index(req.idx_name.as_deref()) else {
            return fail(ReturnCode::IdxNameNotFound, "idx name not found");
        };
        let Ok(slot) = table.resolve_ts_slot(&def, req.ts_name.as_deref()) else {
            return fail(ReturnCode::TsNameNotFound, "ts name not found");
        };
        let mut it = match table.ts_iterator(def.id, slot, &req.pk) {
            Ok(it) => it,
            Err(e) => return fail(ReturnCode::InvalidParameter, &e.to_string()),
        };
        let ttl = table.effective_ttl(&def, slot);
        let expire_time = table.core().expire_time(ttl.abs_ttl);
        let params = query::ScanParams {
            st: req.st,
            st_type: req.st_type,
            et: req.et,
            et_type: req.et_type,
            limit: req.limit,
            atleast: req.atleast,
            remove_duplicates: req.enable_remove_duplicated_record,
        };
        match query::scan_index(
            expire_time,
            ttl.lat_ttl,
            ttl.ttl_type,
            it.as_mut(),
            params,
            self.config.scan_max_bytes_size,
        ) {
            Ok(result) => ScanResponse {
                code: ReturnCode::Ok,
                msg: "ok".into(),
                count: result.pairs.len() as u32,
                pairs: result.pairs,
            },
            Err(QueryError::InvalidArgs) => fail(ReturnCode::InvalidParameter, "invalid args"),
            Err(QueryError::InvalidSeekType) => {
                fail(ReturnCode::InvalidParameter, "st/et sub key type is invalid")
            }
            Err(QueryError::ReachedMaxBytes) => {
                fail(ReturnCode::ReacheTheScanMaxBytesSize, "reach the scan max bytes size")
            }
        }
    }

    pub fn count(&self, req: &CountRequest) -> CountResponse {
        let fail = |code: ReturnCode, msg: &str| CountResponse { code, msg: msg.to_string(), count: 0 };
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return fail(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.core().stat() == TableStat::Loading {
            return fail(ReturnCode::TableIsLoading, "table is loading");
        }
        let Some(def) = table.resolve_index(req.idx_name.as_deref()) else {
            return fail(ReturnCode::IdxNameNotFound, "idx name not found");
        };
        let Ok(slot) = table.resolve_ts_slot(&def, req.ts_name.as_deref()) else {
            return fail(ReturnCode::TsNameNotFound, "ts name not found");
        };
        if !req.filter_expired_data {
            // Raw entry count, expired data included.
            if let TsTable::Mem(mem) = table.as_ref() {
                return match mem.get_count(def.id, slot, &req.key) {
                    Ok(count) => CountResponse { code: ReturnCode::Ok, msg: "ok".into(), count },
                    Err(e) => fail(ReturnCode::InvalidParameter, &e.to_string()),
                };
            }
        }
        let mut it = match table.ts_iterator(def.id, slot, &req.key) {
            Ok(it) => it,
            Err(e) => return fail(ReturnCode::InvalidParameter, &e.to_string()),
        };
        let (expire_time, expire_cnt, ttl_type) = if req.filter_expired_data {
            let ttl = table.effective_ttl(&def, slot);
            (table.core().expire_time(ttl.abs_ttl), ttl.lat_ttl, ttl.ttl_type)
        } else {
            (0, 0, table.core().meta().ttl_type())
        };
        let params = query::CountParams {
            st: req.st,
            st_type: req.st_type,
            et: req.et,
            et_type: req.et_type,
            remove_duplicates: req.enable_remove_duplicated_record,
        };
        match query::count_index(expire_time, expire_cnt, ttl_type, it.as_mut(), params) {
            Ok(count) => CountResponse { code: ReturnCode::Ok, msg: "ok".into(), count },
            Err(QueryError::InvalidArgs) => fail(ReturnCode::InvalidParameter, "invalid args"),
            Err(_) => fail(ReturnCode::InvalidParameter, "st/et sub key type is invalid"),
        }
    }

    pub fn traverse(&self, req: &TraverseRequest) -> TraverseResponse {
        let fail = |code: ReturnCode, msg: &str| TraverseResponse {
            code,
            msg: msg.to_string(),
            count: 0,
            pairs: Vec::new(),
            pk: String::new(),
            ts: 0,
            is_finish: false,
        };
        if let Some(r_table) = self.get_relational(req.tid, req.pid) {
            return self.traverse_relational(&r_table, req);
        }
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return fail(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.core().stat() == TableStat::Loading {
            return fail(ReturnCode::TableIsLoading, "table is loading");
        }
        let Some(def) = table.resolve_index(req.idx_name.as_deref()) else {
            return fail(ReturnCode::IdxNameNotFound, "idx name not found");
        };
        let Ok(slot) = table.resolve_ts_slot(&def, req.ts_name.as_deref()) else {
            return fail(ReturnCode::TsNameNotFound, "ts name not found");
        };
        let mut it = match table.traverse_iterator(def.id, slot) {
            Ok(it) => it,
            Err(e) => return fail(ReturnCode::InvalidParameter, &e.to_string()),
        };

        let mut last_pk = String::new();
        let mut last_time = 0u64;
        match &req.pk {
            Some(pk) if !pk.is_empty() => {
                it.seek(pk, req.ts);
                last_pk = pk.clone();
                last_time = req.ts;
            }
            _ => it.seek_to_first(),
        }

        let mut pairs: Vec<(String, u64, Vec<u8>)> = Vec::new();
        while it.valid() {
            if req.limit > 0 && pairs.len() as u32 >= req.limit {
                break;
            }
            if req.enable_remove_duplicated_record
                && last_time == it.ts()
                && last_pk == it.pk()
            {
                it.next();
                continue;
            }
            last_pk = it.pk().to_string();
            last_time = it.ts();
            pairs.push((last_pk.clone(), last_time, it.value().to_vec()));
            if it.steps() >= self.config.max_traverse_cnt {
                break;
            }
            it.next();
        }

        let is_finish = if it.steps() >= self.config.max_traverse_cnt {
            last_pk = it.pk().to_string();
            last_time = it.ts();
            last_pk.is_empty()
        } else {
            (pairs.len() as u32) < req.limit
        };
        TraverseResponse {
            code: ReturnCode::Ok,
            msg: "ok".into(),
            count: pairs.len() as u32,
            pairs,
            pk: last_pk,
            ts: last_time,
            is_finish,
        }
    }

    fn traverse_relational(
        &self,
        table: &RelationalTable,
        req: &TraverseRequest,
    ) -> TraverseResponse {
        let mut it = table.traverse();
        match &req.pk {
            Some(pk) if !pk.is_empty() => {
                if it.seek(table, pk).is_err() {
                    return TraverseResponse {
                        code: ReturnCode::InvalidParameter,
                        msg: "bad traverse key".into(),
                        count: 0,
                        pairs: Vec::new(),
                        pk: String::new(),
                        ts: 0,
                        is_finish: false,
                    };
                }
                it.next();
            }
            _ => it.seek_to_first(),
        }
        let mut pairs = Vec::new();
        while it.valid() {
            if req.limit > 0 && pairs.len() as u32 >= req.limit {
                break;
            }
            pairs.push((String::new(), 0, it.value().to_vec()));
            if it.steps() >= self.config.max_traverse_cnt {
                break;
            }
            it.next();
        }
        let is_finish = !it.valid();
        TraverseResponse {
            code: ReturnCode::Ok,
            msg: "ok".into(),
            count: pairs.len() as u32,
            pairs,
            pk: String::new(),
            ts: 0,
            is_finish,
        }
    }

    pub fn delete(&self, req: &DeleteRequest) -> GeneralResponse {
        if self.follower_cluster.load(Ordering::Relaxed) {
            return GeneralResponse::err(ReturnCode::IsFollowerCluster, "is follower cluster");
        }
        if let Some(r_table) = self.get_relational(req.tid, req.pid) {
            return match r_table.delete(&req.key) {
                Ok(true) => GeneralResponse::ok(),
                Ok(false) => GeneralResponse::err(ReturnCode::DeleteFailed, "delete failed"),
                Err(e) => GeneralResponse::err(ReturnCode::DeleteFailed, e.to_string()),
            };
        }
        let Some((table, _, replicator)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if !table.core().is_leader() {
            return GeneralResponse::err(ReturnCode::TableIsFollower, "table is follower");
        }
        if table.core().stat() == TableStat::Loading {
            return GeneralResponse::err(ReturnCode::TableIsLoading, "table is loading");
        }
        let Some(def) = table.resolve_index(req.idx_name.as_deref()) else {
            return GeneralResponse::err(ReturnCode::IdxNameNotFound, "idx name not found");
        };
        match table.delete(&req.key, def.id) {
            Ok(true) => {}
            Ok(false) => return GeneralResponse::err(ReturnCode::DeleteFailed, "delete failed"),
            Err(e) => return GeneralResponse::err(ReturnCode::DeleteFailed, e.to_string()),
        }
        let mut entry = LogEntry::delete(req.key.clone(), def.id);
        entry.dimensions = vec![Dimension::new(req.key.clone(), def.id)];
        if let Err(e) = replicator.append_entry(&mut entry) {
            tracing::warn!(tid = req.tid, pid = req.pid, error = %e, "failed to append delete");
        }
        GeneralResponse::ok()
    }

    pub fn update(&self, req: &UpdateRequest) -> GeneralResponse {
        if self.follower_cluster.load(Ordering::Relaxed) {
            return GeneralResponse::err(ReturnCode::IsFollowerCluster, "is follower cluster");
        }
        let Some(r_table) = self.get_relational(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        match r_table.update(&req.condition_columns, &req.value_columns) {
            Ok(true) => GeneralResponse::ok(),
            Ok(false) => GeneralResponse::err(ReturnCode::UpdateFailed, "update failed"),
            Err(e) => GeneralResponse::err(ReturnCode::UpdateFailed, e.to_string()),
        }
    }

    pub fn batch_query(&self, req: &BatchQueryRequest) -> BatchQueryResponse {
        let Some(r_table) = self.get_relational(req.tid, req.pid) else {
            return BatchQueryResponse {
                code: ReturnCode::TableIsNotExist,
                msg: "table is not exist".into(),
                count: 0,
                values: Vec::new(),
            };
        };
        match r_table.batch_query(&req.keys) {
            Ok(values) => BatchQueryResponse {
                code: ReturnCode::Ok,
                msg: "ok".into(),
                count: values.iter().filter(|v| v.is_some()).count() as u32,
                values,
            },
            Err(e) => BatchQueryResponse {
                code: ReturnCode::InvalidParameter,
                msg: e.to_string(),
                count: 0,
                values: Vec::new(),
            },
        }
    }

    // ===== table lifecycle =====

    fn build_ts_partition(&self, meta: &TableMeta, db_path: &Path) -> Result<Partition> {
        let table = match meta.storage_mode {
            StorageMode::Memory => TsTable::Mem(MemTable::new(meta.clone())?),
            _ => TsTable::Disk(DiskTable::open(meta.clone(), db_path.join("data"))?),
        };
        let table = Arc::new(table);
        let snapshot = Arc::new(Snapshot::new(meta.tid, meta.pid, db_path.join("snapshot"))?);
        let log_part = Arc::new(LogPart::open(
            db_path.join("binlog"),
            self.config.binlog_single_file_max_size,
        )?);
        let role = if meta.is_leader() { Role::Leader } else { Role::Follower };
        let replicator = Arc::new(Replicator::new(
            meta.tid,
            meta.pid,
            table.clone(),
            log_part,
            role,
            meta.term,
            self.connector.clone(),
        ));
        Ok(Partition::Ts { table, snapshot, replicator })
    }

    pub fn create_table(&self, req: &CreateTableRequest) -> GeneralResponse {
        let meta = &req.table_meta;
        let tid = meta.tid;
        let pid = meta.pid;
        if meta.table_type == TableType::TimeSeries {
            if let Err(e) = meta.validate(self.config.absolute_ttl_max, self.config.latest_ttl_max)
            {
                tracing::warn!(tid, pid, error = %e, "table meta check failed");
                return GeneralResponse::err(ReturnCode::TableMetaIsIllegal, e.to_string());
            }
        }
        if self.get_partition(tid, pid).is_some() {
            return GeneralResponse::err(ReturnCode::TableAlreadyExists, "table already exists");
        }
        let Some(db_path) = self.partition_path(tid, pid, meta.storage_mode) else {
            return GeneralResponse::err(
                ReturnCode::FailToGetDbRootPath,
                "fail to find db root path",
            );
        };
        if let Err(e) = meta.save(&db_path) {
            tracing::warn!(tid, pid, error = %e, "write table meta failed");
            return GeneralResponse::err(ReturnCode::WriteDataFailed, "write data failed");
        }
        let partition = if meta.table_type == TableType::Relational {
            match RelationalTable::new(meta.clone()) {
                Ok(table) => {
                    table.core().set_stat(TableStat::Normal);
                    Partition::Relational { table: Arc::new(table) }
                }
                Err(e) => return GeneralResponse::err(ReturnCode::CreateTableFailed, e.to_string()),
            }
        } else {
            match self.build_ts_partition(meta, &db_path) {
                Ok(partition) => partition,
                Err(e) => return GeneralResponse::err(ReturnCode::CreateTableFailed, e.to_string()),
            }
        };
        self.partitions.lock().unwrap().insert((tid, pid), partition.clone());

        if let Partition::Ts { table, replicator, .. } = &partition {
            table.core().set_stat(TableStat::Normal);
            if table.core().is_leader() {
                for endpoint in &meta.replicas {
                    if let Err(e) = replicator.add_replicate_node(endpoint, None) {
                        tracing::warn!(tid, pid, endpoint, error = %e, "add replicator failed");
                    }
                }
            }
            tracing::info!(tid, pid, name = %meta.name, "created table");
        }
        GeneralResponse::ok()
    }

    pub fn load_table(self: &Arc<Self>, req: &LoadTableRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::LoadTable, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let resp = self.load_table_inner(req, &task);
        if !resp.is_ok() {
            Self::finish_task(&task, false);
        }
        resp
    }

    fn load_table_inner(
        self: &Arc<Self>,
        req: &LoadTableRequest,
        task: &Option<TaskHandle>,
    ) -> GeneralResponse {
        let mut meta = req.table_meta.clone();
        if let Err(e) = meta.validate(self.config.absolute_ttl_max, self.config.latest_ttl_max) {
            return GeneralResponse::err(ReturnCode::TableMetaIsIllegal, e.to_string());
        }
        let tid = meta.tid;
        let pid = meta.pid;
        let Some(db_path) = self.partition_path(tid, pid, meta.storage_mode) else {
            return GeneralResponse::err(
                ReturnCode::FailToGetDbRootPath,
                "fail to get table db root path",
            );
        };
        if !db_path.exists() {
            return GeneralResponse::err(
                ReturnCode::TableDbPathIsNotExist,
                "table db path is not exist",
            );
        }
        if self.get_partition(tid, pid).is_some() {
            return GeneralResponse::err(ReturnCode::TableAlreadyExists, "table already exists");
        }
        // Merge with the on-disk meta: the stored schema wins, the request
        // supplies role, term and replica set. The previous file is kept
        // with a timestamp suffix.
        if let Ok(disk_meta) = TableMeta::load(&db_path) {
            let mut merged = disk_meta;
            merged.mode = meta.mode;
            merged.term = meta.term;
            merged.replicas = meta.replicas.clone();
            meta = merged;
            let backup = db_path.join(format!("table_meta.txt.{}", now_time_string()));
            let _ = fs::rename(db_path.join("table_meta.txt"), backup);
        }
        if let Err(e) = meta.save(&db_path) {
            tracing::warn!(tid, pid, error = %e, "write table meta failed");
            return GeneralResponse::err(ReturnCode::WriteDataFailed, "write data failed");
        }

        if meta.storage_mode == StorageMode::Memory {
            let partition = match self.build_ts_partition(&meta, &db_path) {
                Ok(partition) => partition,
                Err(e) => return GeneralResponse::err(ReturnCode::CreateTableFailed, e.to_string()),
            };
            if let Partition::Ts { table, .. } = &partition {
                table.core().set_stat(TableStat::Loading);
            }
            self.partitions.lock().unwrap().insert((tid, pid), partition);
            let this = self.clone();
            let task = task.clone();
            self.dispatch(move || this.load_table_internal(tid, pid, task));
        } else {
            let this = self.clone();
            let task = task.clone();
            self.dispatch(move || this.load_disk_table_internal(meta, task));
        }
        GeneralResponse::ok()
    }

    fn load_table_internal(self: &Arc<Self>, tid: u32, pid: u32, task: Option<TaskHandle>) {
        let ok = (|| -> Result<()> {
            let (table, snapshot, replicator) = self
                .get_ts(tid, pid)
                .ok_or_else(|| crate::Error::InvalidState("table does not exist".into()))?;
            table.core().set_stat(TableStat::Loading);
            let snapshot_offset = snapshot.recover(&table)?;
            let latest_offset =
                Self::replay_binlog(&table, replicator.log_part(), snapshot_offset)?;
            replicator.set_offset(latest_offset);
            replicator.set_snapshot_log_index(snapshot.offset());
            table.sched_gc()?;
            table.core().set_stat(TableStat::Normal);
            tracing::info!(tid, pid, offset = latest_offset, "load table success");
            Ok(())
        })();
        if let Err(e) = &ok {
            tracing::warn!(tid, pid, error = %e, "load table failed");
            self.delete_table_internal(tid, pid, None);
        }
        Self::finish_task(&task, ok.is_ok());
    }

    fn load_disk_table_internal(self: &Arc<Self>, meta: TableMeta, task: Option<TaskHandle>) {
        let tid = meta.tid;
        let pid = meta.pid;
        let ok = (|| -> Result<()> {
            let db_path = self
                .partition_path(tid, pid, meta.storage_mode)
                .ok_or_else(|| crate::Error::InvalidState("no db root path".into()))?;
            let data_path = db_path.join("data");
            if data_path.exists() {
                fs::remove_dir_all(&data_path)?;
            }
            let snapshot = Snapshot::new(tid, pid, db_path.join("snapshot"))?;
            let snapshot_offset = snapshot.recover_disk(&data_path)?;

            let partition = self.build_ts_partition(&meta, &db_path)?;
            let Partition::Ts { table, replicator, .. } = &partition else { unreachable!() };
            table.core().set_stat(TableStat::Loading);
            let table = table.clone();
            let replicator = replicator.clone();
            let partition = Partition::Ts {
                table: table.clone(),
                snapshot: Arc::new(snapshot),
                replicator: replicator.clone(),
            };
            self.partitions.lock().unwrap().insert((tid, pid), partition);

            let latest_offset =
                Self::replay_binlog(&table, replicator.log_part(), snapshot_offset)?;
            replicator.set_offset(latest_offset);
            // The consumed dump no longer covers the binlog; truncation
            // stays parked until the snapshot below completes.
            table.sched_gc()?;
            table.core().set_stat(TableStat::Normal);
            tracing::info!(tid, pid, offset = latest_offset, "load disk table success");
            // A fresh snapshot replaces the one consumed by recovery.
            self.make_snapshot_internal(tid, pid, 0, None);
            Ok(())
        })();
        if let Err(e) = &ok {
            tracing::warn!(tid, pid, error = %e, "load disk table failed");
            self.delete_table_internal(tid, pid, None);
        }
        Self::finish_task(&task, ok.is_ok());
    }

    fn replay_binlog(table: &TsTable, log: &LogPart, from: u64) -> Result<u64> {
        let mut latest = from;
        for entry in log.reader(from + 1)? {
            let entry = entry?;
            if entry.offset <= latest {
                continue;
            }
            table.apply_entry(&entry)?;
            latest = entry.offset;
        }
        Ok(latest)
    }

    pub fn drop_table(self: &Arc<Self>, req: &DropTableRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::DropTable, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let tid = req.tid;
        let pid = req.pid;
        match self.get_partition(tid, pid) {
            None => {
                Self::finish_task(&task, false);
                GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist")
            }
            Some(Partition::Ts { table, .. }) => {
                if table.core().stat() == TableStat::MakingSnapshot {
                    Self::finish_task(&task, false);
                    return GeneralResponse::err(
                        ReturnCode::TableStatusIsMakingSnapshot,
                        "making snapshot is not done",
                    );
                }
                let this = self.clone();
                self.dispatch(move || {
                    this.delete_table_internal(tid, pid, task);
                });
                GeneralResponse::ok()
            }
            Some(Partition::Relational { .. }) => {
                let this = self.clone();
                self.dispatch(move || {
                    this.delete_table_internal(tid, pid, task);
                });
                GeneralResponse::ok()
            }
        }
    }

    fn delete_table_internal(&self, tid: u32, pid: u32, task: Option<TaskHandle>) {
        let Some(partition) = self.get_partition(tid, pid) else {
            Self::finish_task(&task, false);
            return;
        };
        let mode = match &partition {
            Partition::Ts { table, .. } => table.storage_mode(),
            Partition::Relational { table } => table.core().meta().storage_mode,
        };
        let (Some(db_path), Some(recycle_root)) = (
            self.partition_path(tid, pid, mode),
            self.choose_recycle_root(tid, pid, mode).cloned(),
        ) else {
            tracing::warn!(tid, pid, "fail to get db or recycle root path");
            Self::finish_task(&task, false);
            return;
        };
        self.partitions.lock().unwrap().remove(&(tid, pid));
        if let Partition::Ts { replicator, .. } = &partition {
            replicator.del_all_replicate_node();
        }
        if db_path.exists() {
            if self.config.recycle_bin_enabled {
                let recycle_path =
                    recycle_root.join(format!("{tid}_{pid}_{}", now_time_string()));
                let _ = fs::create_dir_all(&recycle_root);
                if let Err(e) = fs::rename(&db_path, &recycle_path) {
                    tracing::warn!(tid, pid, error = %e, "failed to move table to recycle bin");
                }
            } else if let Err(e) = fs::remove_dir_all(&db_path) {
                tracing::warn!(tid, pid, error = %e, "failed to remove table dir");
            }
        }
        tracing::info!(tid, pid, "drop table ok");
        Self::finish_task(&task, true);
    }

    pub fn change_role(&self, req: &ChangeRoleRequest) -> GeneralResponse {
        let Some((table, _, replicator)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.core().stat() != TableStat::Normal {
            return GeneralResponse::err(
                ReturnCode::TableStatusIsNotNormal,
                "table status is not normal",
            );
        }
        if req.mode == TableMode::Leader {
            if table.core().is_leader() {
                return GeneralResponse::err(ReturnCode::TableIsLeader, "table is leader");
            }
            table.core().set_leader(true);
            replicator.set_role(Role::Leader, req.term);
            tracing::info!(tid = req.tid, pid = req.pid, term = req.term, "change to leader");
            for endpoint in &req.replicas {
                if let Err(e) = replicator.add_replicate_node(endpoint, None) {
                    tracing::warn!(tid = req.tid, pid = req.pid, endpoint, error = %e, "add replicator failed");
                }
            }
            for (endpoint, remote_tid) in &req.endpoint_tid {
                if let Err(e) = replicator.add_replicate_node(endpoint, Some(*remote_tid)) {
                    tracing::warn!(tid = req.tid, pid = req.pid, endpoint, error = %e, "add replicator failed");
                }
            }
        } else {
            if !table.core().is_leader() {
                return GeneralResponse { code: ReturnCode::Ok, msg: "table is follower".into() };
            }
            replicator.set_role(Role::Follower, 0);
            table.core().set_leader(false);
            tracing::info!(tid = req.tid, pid = req.pid, "change to follower");
        }
        GeneralResponse::ok()
    }

    pub fn add_replica(&self, req: &ReplicaRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::AddReplica, true) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let resp = (|| {
            let Some((table, _, replicator)) = self.get_ts(req.tid, req.pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            if !table.core().is_leader() {
                return GeneralResponse::err(ReturnCode::TableIsFollower, "table is follower");
            }
            match replicator.add_replicate_node(&req.endpoint, req.remote_tid) {
                Ok(AddNode::Added) => GeneralResponse::ok(),
                Ok(AddNode::AlreadyExists) => GeneralResponse::err(
                    ReturnCode::ReplicaEndpointAlreadyExists,
                    "replica endpoint already exists",
                ),
                Err(e) => {
                    tracing::warn!(tid = req.tid, pid = req.pid, error = %e, "fail to add replica endpoint");
                    GeneralResponse::err(
                        ReturnCode::FailToAddReplicaEndpoint,
                        "fail to add replica endpoint",
                    )
                }
            }
        })();
        Self::finish_task(
            &task,
            matches!(resp.code, ReturnCode::Ok | ReturnCode::ReplicaEndpointAlreadyExists),
        );
        resp
    }

    pub fn del_replica(&self, req: &ReplicaRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::DelReplica, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let resp = (|| {
            let Some((table, _, replicator)) = self.get_ts(req.tid, req.pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            if !table.core().is_leader() {
                return GeneralResponse::err(ReturnCode::TableIsFollower, "table is follower");
            }
            match replicator.del_replicate_node(&req.endpoint) {
                Ok(DelNode::Removed) => GeneralResponse::ok(),
                Ok(DelNode::NotFound) => {
                    GeneralResponse { code: ReturnCode::Ok, msg: "replica does not exist".into() }
                }
                Err(_) => GeneralResponse::err(
                    ReturnCode::ReplicatorRoleIsNotLeader,
                    "replicator role is not leader",
                ),
            }
        })();
        Self::finish_task(&task, resp.is_ok());
        resp
    }

    pub fn append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        let fail = |code: ReturnCode, msg: &str| AppendEntriesResponse {
            code,
            msg: msg.to_string(),
            log_offset: 0,
        };
        let Some((table, _, replicator)) = self.get_ts(req.tid, req.pid) else {
            return fail(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if !self.follower_cluster.load(Ordering::Relaxed) && table.core().is_leader() {
            return fail(ReturnCode::TableIsLeader, "table is leader");
        }
        if table.core().stat() == TableStat::Loading {
            return fail(ReturnCode::TableIsLoading, "table is loading");
        }
        match replicator.append_entries(req) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(tid = req.tid, pid = req.pid, error = %e, "append entries failed");
                fail(
                    ReturnCode::FailToAppendEntriesToReplicator,
                    "fail to append entries to replicator",
                )
            }
        }
    }

    // ===== snapshot =====

    pub fn make_snapshot(self: &Arc<Self>, req: &MakeSnapshotRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::MakeSnapshot, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let tid = req.tid;
        let pid = req.pid;
        let resp = (|| {
            let Some((table, _, _)) = self.get_ts(tid, pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            if table.core().stat() != TableStat::Normal {
                return GeneralResponse::err(
                    ReturnCode::TableStatusIsNotNormal,
                    "table status is not normal",
                );
            }
            let this = self.clone();
            let end_offset = req.offset;
            let task = task.clone();
            self.dispatch(move || {
                this.make_snapshot_internal(tid, pid, end_offset, task);
            });
            GeneralResponse::ok()
        })();
        if !resp.is_ok() {
            Self::finish_task(&task, false);
        }
        resp
    }

    pub(crate) fn make_snapshot_internal(
        &self,
        tid: u32,
        pid: u32,
        end_offset: u64,
        task: Option<TaskHandle>,
    ) {
        let Some((table, snapshot, replicator)) = self.get_ts(tid, pid) else {
            Self::finish_task(&task, false);
            return;
        };
        if table.core().stat() != TableStat::Normal {
            tracing::warn!(tid, pid, "table state does not allow snapshot");
            Self::finish_task(&task, false);
            return;
        }
        table.core().set_stat(TableStat::MakingSnapshot);
        let cur_offset = replicator.offset();
        let snapshot_offset = snapshot.offset();
        let mut ok = true;
        if cur_offset < snapshot_offset + self.config.make_snapshot_threshold_offset
            && end_offset == 0
        {
            tracing::info!(
                tid,
                pid,
                cur_offset,
                snapshot_offset,
                "offset delta below threshold, skipping snapshot"
            );
        } else {
            let made = match table.as_ref() {
                TsTable::Mem(_) => snapshot.make_snapshot(
                    &table,
                    replicator.log_part(),
                    replicator.term(),
                    end_offset,
                ),
                TsTable::Disk(disk) => {
                    snapshot.make_disk_snapshot(disk, replicator.term(), cur_offset)
                }
            };
            match made {
                Ok(offset) => {
                    replicator.set_snapshot_log_index(offset);
                    if table.is_mem() {
                        table.core().set_make_snapshot_time(now_secs());
                    }
                }
                Err(e) => {
                    tracing::warn!(tid, pid, error = %e, "make snapshot failed");
                    ok = false;
                }
            }
        }
        table.core().set_stat(TableStat::Normal);
        Self::finish_task(&task, ok);
    }

    pub fn pause_snapshot(&self, req: &GeneralRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::PauseSnapshot, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let resp = (|| {
            let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            match table.core().stat() {
                TableStat::SnapshotPaused => {
                    tracing::info!(tid = req.tid, pid = req.pid, "snapshot is already paused");
                    GeneralResponse::ok()
                }
                TableStat::Normal => {
                    table.core().set_stat(TableStat::SnapshotPaused);
                    GeneralResponse::ok()
                }
                _ => GeneralResponse::err(
                    ReturnCode::TableStatusIsNotNormal,
                    "table status is not normal",
                ),
            }
        })();
        Self::finish_task(&task, resp.is_ok());
        resp
    }

    pub fn recover_snapshot(&self, req: &GeneralRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::RecoverSnapshot, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let resp = (|| {
            let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            match table.core().stat() {
                TableStat::Normal => {
                    tracing::info!(tid = req.tid, pid = req.pid, "table is already normal");
                    GeneralResponse::ok()
                }
                TableStat::SnapshotPaused => {
                    table.core().set_stat(TableStat::Normal);
                    GeneralResponse::ok()
                }
                _ => GeneralResponse::err(
                    ReturnCode::TableStatusIsNotSnapshotPaused,
                    "table status is not paused",
                ),
            }
        })();
        Self::finish_task(&task, resp.is_ok());
        resp
    }

    pub fn send_snapshot(self: &Arc<Self>, req: &SendSnapshotRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::SendSnapshot, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let tid = req.tid;
        let pid = req.pid;
        let resp = (|| {
            let Some((table, _, _)) = self.get_ts(tid, pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            if !table.core().is_leader() {
                return GeneralResponse::err(ReturnCode::TableIsFollower, "table is follower");
            }
            if table.core().stat() != TableStat::SnapshotPaused {
                return GeneralResponse::err(
                    ReturnCode::TableStatusIsNotSnapshotPaused,
                    "table status is not paused",
                );
            }
            let sync_key = format!("{}_{tid}_{pid}", req.endpoint);
            {
                let mut sending = self.sending.lock().unwrap();
                if !sending.insert(sync_key) {
                    return GeneralResponse::err(
                        ReturnCode::SnapshotIsSending,
                        "snapshot is sending",
                    );
                }
            }
            let this = self.clone();
            let endpoint = req.endpoint.clone();
            let remote_tid = req.remote_tid;
            let task = task.clone();
            self.dispatch(move || {
                this.send_snapshot_internal(&endpoint, tid, pid, remote_tid, task);
            });
            GeneralResponse::ok()
        })();
        if !resp.is_ok() {
            Self::finish_task(&task, false);
        }
        resp
    }

    fn send_snapshot_internal(
        &self,
        endpoint: &str,
        tid: u32,
        pid: u32,
        remote_tid: u32,
        task: Option<TaskHandle>,
    ) {
        let ok = (|| -> Result<()> {
            let (table, _, _) = self
                .get_ts(tid, pid)
                .ok_or_else(|| crate::Error::InvalidState("table does not exist".into()))?;
            let mode = table.storage_mode();
            let db_path = self
                .partition_path(tid, pid, mode)
                .ok_or_else(|| crate::Error::InvalidState("no db root path".into()))?;
            let client = self.connector.connect(endpoint)?;
            let sender =
                FileSender::new(remote_tid, pid, mode, client, self.config.stream_block_size);

            sender.send_file("table_meta.txt", &db_path.join("table_meta.txt"), None)?;
            let snapshot_dir = db_path.join("snapshot");
            match Manifest::read(&snapshot_dir)? {
                None => {
                    tracing::info!(tid, pid, "no manifest, nothing more to send");
                }
                Some(manifest) => {
                    if mode == StorageMode::Memory {
                        sender.send_file(
                            &manifest.name,
                            &snapshot_dir.join(&manifest.name),
                            None,
                        )?;
                    } else {
                        sender.send_dir(&manifest.name, &snapshot_dir.join(&manifest.name))?;
                    }
                    sender.send_file("MANIFEST", &snapshot_dir.join("MANIFEST"), None)?;
                }
            }
            tracing::info!(tid, pid, endpoint, "send snapshot success");
            Ok(())
        })();
        if let Err(e) = &ok {
            tracing::warn!(tid, pid, endpoint, error = %e, "send snapshot failed");
        }
        self.sending
            .lock()
            .unwrap()
            .remove(&format!("{endpoint}_{tid}_{pid}"));
        Self::finish_task(&task, ok.is_ok());
    }

    /// Receiver side of snapshot shipping.
    pub fn send_data(&self, req: &SendDataRequest, data: &[u8]) -> GeneralResponse {
        let tid = req.tid;
        let pid = req.pid;
        let mode = req.storage_mode.unwrap_or(StorageMode::Memory);
        let Some(db_path) = self.partition_path(tid, pid, mode) else {
            return GeneralResponse::err(
                ReturnCode::FailToGetDbRootPath,
                "fail to get db root path",
            );
        };
        let mut dir = db_path;
        if req.file_name != "table_meta.txt" {
            dir = dir.join("snapshot");
        }
        if let Some(dir_name) = &req.dir_name {
            if !dir_name.is_empty() {
                dir = dir.join(dir_name);
            }
        }
        let combine_key = format!("{tid}_{pid}_{}", req.file_name);

        let receiver = {
            let mut receivers = self.receivers.lock().unwrap();
            if req.block_id == 0 {
                if self.get_partition(tid, pid).is_some() {
                    return GeneralResponse::err(
                        ReturnCode::TableAlreadyExists,
                        "table already exists",
                    );
                }
                let receiver = receivers
                    .entry(combine_key.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(FileReceiver::new(req.file_name.clone(), dir)))
                    })
                    .clone();
                if let Err(e) = receiver.lock().unwrap().init() {
                    tracing::warn!(tid, pid, file = %req.file_name, error = %e, "file receiver init failed");
                    receivers.remove(&combine_key);
                    return GeneralResponse::err(
                        ReturnCode::FileReceiverInitFailed,
                        "file receiver init failed",
                    );
                }
                return GeneralResponse::ok();
            }
            match receivers.get(&combine_key) {
                Some(receiver) => receiver.clone(),
                None => {
                    return GeneralResponse::err(
                        ReturnCode::CannotFindReceiver,
                        "cannot find receiver",
                    )
                }
            }
        };

        let mut receiver = receiver.lock().unwrap();
        if receiver.block_id() == req.block_id {
            // Idempotent retry of the block we already hold.
            return GeneralResponse::ok();
        }
        if req.block_id != receiver.block_id() + 1 {
            tracing::warn!(
                tid,
                pid,
                file = %req.file_name,
                request_block = req.block_id,
                cur_block = receiver.block_id(),
                "block id mismatch"
            );
            return GeneralResponse::err(ReturnCode::BlockIdMismatch, "block_id mismatch");
        }
        if data.len() != req.block_size as usize {
            return GeneralResponse::err(ReturnCode::ReceiveDataError, "receive data error");
        }
        if let Err(e) = receiver.write_data(req.block_id, data) {
            tracing::warn!(tid, pid, file = %req.file_name, error = %e, "receiver write data failed");
            return GeneralResponse::err(ReturnCode::WriteDataFailed, "write data failed");
        }
        if req.eof {
            if let Err(e) = receiver.save_file() {
                tracing::warn!(tid, pid, file = %req.file_name, error = %e, "save file failed");
                return GeneralResponse::err(ReturnCode::WriteDataFailed, "write data failed");
            }
            drop(receiver);
            self.receivers.lock().unwrap().remove(&combine_key);
        }
        GeneralResponse::ok()
    }

    pub fn check_file(&self, req: &CheckFileRequest) -> GeneralResponse {
        let mode = req.storage_mode.unwrap_or(StorageMode::Memory);
        let Some(db_path) = self.partition_path(req.tid, req.pid, mode) else {
            return GeneralResponse::err(
                ReturnCode::FailToGetDbRootPath,
                "fail to get db root path",
            );
        };
        let mut path = db_path;
        if req.file != "table_meta.txt" {
            path = path.join("snapshot");
        }
        if let Some(dir_name) = &req.dir_name {
            if !dir_name.is_empty() {
                path = path.join(dir_name);
            }
        }
        path = path.join(&req.file);
        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                return GeneralResponse::err(ReturnCode::ReceiveDataError, "get size failed")
            }
        };
        if size != req.size {
            tracing::warn!(file = ?path, cur_size = size, expect_size = req.size, "check size failed");
            return GeneralResponse::err(ReturnCode::ReceiveDataError, "check size failed");
        }
        GeneralResponse::ok()
    }

    pub fn get_manifest(&self, req: &GeneralRequest) -> GetManifestResponse {
        let mode = req.storage_mode.unwrap_or(StorageMode::Memory);
        let Some(db_path) = self.partition_path(req.tid, req.pid, mode) else {
            return GetManifestResponse {
                code: ReturnCode::FailToGetDbRootPath,
                msg: "fail to get db root path".into(),
                manifest: Manifest::default(),
            };
        };
        match Manifest::read(&db_path.join("snapshot")) {
            Ok(Some(manifest)) => {
                GetManifestResponse { code: ReturnCode::Ok, msg: "ok".into(), manifest }
            }
            Ok(None) => GetManifestResponse {
                code: ReturnCode::Ok,
                msg: "ok".into(),
                manifest: Manifest::default(),
            },
            Err(e) => GetManifestResponse {
                code: ReturnCode::InvalidParameter,
                msg: e.to_string(),
                manifest: Manifest::default(),
            },
        }
    }

    /// Snapshot offset and term from disk; used when deciding where a
    /// recovering peer should resume.
    fn snapshot_offset_on_disk(&self, tid: u32, pid: u32, mode: StorageMode) -> (u64, u64) {
        let Some(db_path) = self.partition_path(tid, pid, mode) else { return (0, 0) };
        let snapshot_dir = db_path.join("snapshot");
        match Manifest::read(&snapshot_dir) {
            Ok(Some(manifest)) if snapshot_dir.join(&manifest.name).exists() => {
                (manifest.term, manifest.offset)
            }
            _ => (0, 0),
        }
    }

    pub fn get_term_pair(&self, req: &GeneralRequest) -> GetTermPairResponse {
        let mode = req.storage_mode.unwrap_or(StorageMode::Memory);
        match self.get_ts(req.tid, req.pid) {
            None => {
                let (term, offset) = self.snapshot_offset_on_disk(req.tid, req.pid, mode);
                GetTermPairResponse {
                    code: ReturnCode::Ok,
                    msg: "table is not exist".into(),
                    has_table: false,
                    is_leader: false,
                    term,
                    offset,
                }
            }
            Some((table, _, replicator)) => GetTermPairResponse {
                code: ReturnCode::Ok,
                msg: "ok".into(),
                has_table: true,
                is_leader: table.core().is_leader(),
                term: replicator.term(),
                offset: replicator.offset(),
            },
        }
    }

    pub fn get_all_snapshot_offset(&self) -> GetAllSnapshotOffsetResponse {
        use itertools::Itertools;
        let parts: Vec<((u32, u32), StorageMode)> = {
            let partitions = self.partitions.lock().unwrap();
            partitions
                .iter()
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. } => Some((*key, table.storage_mode())),
                    Partition::Relational { .. } => None,
                })
                .collect()
        };
        let tables = parts
            .into_iter()
            .map(|((tid, pid), mode)| {
                let (_, offset) = self.snapshot_offset_on_disk(tid, pid, mode);
                (tid, (pid, offset))
            })
            .into_group_map()
            .into_iter()
            .sorted()
            .map(|(tid, parts)| TableSnapshotOffsets { tid, parts })
            .collect();
        GetAllSnapshotOffsetResponse { code: ReturnCode::Ok, msg: "ok".into(), tables }
    }

    // ===== status =====

    pub fn get_table_status(&self, req: &GetTableStatusRequest) -> GetTableStatusResponse {
        let partitions: Vec<((u32, u32), Partition)> = {
            let map = self.partitions.lock().unwrap();
            map.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let mut all = Vec::new();
        for ((tid, pid), partition) in partitions {
            if req.tid.map_or(false, |want| want != tid) {
                continue;
            }
            if req.pid.map_or(false, |want| want != pid) {
                continue;
            }
            let (table, replicator) = match &partition {
                Partition::Ts { table, replicator, .. } => (table.clone(), replicator.clone()),
                Partition::Relational { .. } => continue,
            };
            let meta = table.core().meta();
            all.push(TableStatus {
                tid,
                pid,
                name: meta.name.clone(),
                mode: if table.core().is_leader() {
                    TableMode::Leader
                } else {
                    TableMode::Follower
                },
                state: format!("{:?}", table.core().stat()),
                storage_mode: table.storage_mode(),
                ttl_desc: meta.ttl_desc,
                offset: replicator.offset(),
                record_cnt: table.record_cnt(),
                record_byte_size: table.record_byte_size(),
                record_pk_cnt: table.record_pk_cnt(),
                idx_cnt: table.record_idx_cnt(),
                diskused: table.core().diskused(),
                is_expire: table.core().expire_enabled(),
                time_offset: table.core().time_offset_ms() / 1000,
                schema: req.need_schema.then(|| meta.clone()),
            });
        }
        GetTableStatusResponse { code: ReturnCode::Ok, msg: "ok".into(), all_table_status: all }
    }

    pub fn get_table_follower(&self, tid: u32, pid: u32) -> GetTableFollowerResponse {
        let fail = |code: ReturnCode, msg: &str| GetTableFollowerResponse {
            code,
            msg: msg.to_string(),
            offset: 0,
            follower_info: Vec::new(),
        };
        let Some((table, _, replicator)) = self.get_ts(tid, pid) else {
            return fail(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if !table.core().is_leader() {
            return fail(ReturnCode::TableIsFollower, "table is follower");
        }
        let info = replicator.get_replicate_info();
        if info.is_empty() {
            return GetTableFollowerResponse {
                code: ReturnCode::NoFollower,
                msg: "has no follower".into(),
                offset: replicator.offset(),
                follower_info: Vec::new(),
            };
        }
        GetTableFollowerResponse {
            code: ReturnCode::Ok,
            msg: "ok".into(),
            offset: replicator.offset(),
            follower_info: info,
        }
    }

    pub fn get_table_schema(&self, tid: u32, pid: u32) -> GetTableSchemaResponse {
        match self.get_partition(tid, pid) {
            Some(Partition::Ts { table, .. }) => GetTableSchemaResponse {
                code: ReturnCode::Ok,
                msg: "ok".into(),
                table_meta: Some(table.core().meta()),
            },
            Some(Partition::Relational { table }) => GetTableSchemaResponse {
                code: ReturnCode::Ok,
                msg: "ok".into(),
                table_meta: Some(table.core().meta()),
            },
            None => GetTableSchemaResponse {
                code: ReturnCode::TableIsNotExist,
                msg: "table is not exist".into(),
                table_meta: None,
            },
        }
    }

    // ===== schema evolution =====

    pub fn update_table_meta_for_add_field(
        &self,
        req: &UpdateTableMetaForAddFieldRequest,
    ) -> GeneralResponse {
        let partitions: Vec<((u32, u32), Arc<TsTable>)> = {
            let map = self.partitions.lock().unwrap();
            map.iter()
                .filter(|((tid, _), _)| *tid == req.tid)
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. } => Some((*key, table.clone())),
                    Partition::Relational { .. } => None,
                })
                .collect()
        };
        if partitions.is_empty() {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        }
        let col_name = &req.column_desc.name;
        for ((tid, pid), table) in partitions {
            let meta = table.core().meta();
            let repeated = meta
                .column_descs
                .iter()
                .chain(meta.added_column_descs.iter())
                .any(|c| &c.name == col_name);
            if repeated {
                tracing::warn!(tid, pid, column = %col_name, "field name repeated in tablet");
                continue;
            }
            let mut new_meta = meta;
            new_meta.added_column_descs.push(req.column_desc.clone());
            table.core().set_meta(new_meta.clone());

            let Some(db_path) = self.partition_path(tid, pid, new_meta.storage_mode) else {
                return GeneralResponse::err(
                    ReturnCode::FailToGetDbRootPath,
                    "fail to get db root path",
                );
            };
            if !db_path.exists() {
                return GeneralResponse::err(
                    ReturnCode::TableDbPathIsNotExist,
                    "table db path is not exist",
                );
            }
            let backup = db_path.join(format!("table_meta.txt.{}", now_time_string()));
            let _ = fs::rename(db_path.join("table_meta.txt"), backup);
            if let Err(e) = new_meta.save(&db_path) {
                tracing::warn!(tid, pid, error = %e, "write table meta failed");
                return GeneralResponse::err(ReturnCode::WriteDataFailed, "write data failed");
            }
        }
        GeneralResponse::ok()
    }

    pub fn delete_index(&self, req: &DeleteIndexRequest) -> GeneralResponse {
        let partitions: Vec<((u32, u32), Arc<TsTable>)> = {
            let map = self.partitions.lock().unwrap();
            map.iter()
                .filter(|((tid, _), _)| *tid == req.tid)
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. } => Some((*key, table.clone())),
                    Partition::Relational { .. } => None,
                })
                .collect()
        };
        if partitions.is_empty() {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        }
        if partitions.iter().any(|(_, table)| !table.is_mem()) {
            return GeneralResponse::err(ReturnCode::OperatorNotSupport, "only support mem table");
        }
        for ((tid, pid), table) in partitions {
            match table.delete_index(&req.idx_name) {
                Ok(true) => {
                    tracing::info!(tid, pid, index = %req.idx_name, "deleted index");
                }
                Ok(false) | Err(_) => {
                    tracing::warn!(tid, pid, index = %req.idx_name, "delete index failed");
                    return GeneralResponse::err(ReturnCode::IndexDeleteFailed, "delete index fail");
                }
            }
        }
        GeneralResponse::ok()
    }

    pub fn dump_index_data(self: &Arc<Self>, req: &DumpIndexDataRequest) -> GeneralResponse {
        let task = match self.add_op_task(&req.task_info, TaskType::DumpIndexData, false) {
            Ok(task) => task,
            Err(resp) => return resp,
        };
        let resp = (|| {
            let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
                return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
            };
            if !table.is_mem() {
                return GeneralResponse::err(
                    ReturnCode::OperatorNotSupport,
                    "only support mem table",
                );
            }
            if table.core().stat() != TableStat::Normal {
                return GeneralResponse::err(
                    ReturnCode::TableStatusIsNotNormal,
                    "table status is not normal",
                );
            }
            if req.partition_num == 0 {
                return GeneralResponse::err(ReturnCode::InvalidParameter, "invalid partition num");
            }
            let Some(db_path) = self.partition_path(req.tid, req.pid, table.storage_mode()) else {
                return GeneralResponse::err(
                    ReturnCode::FailToGetDbRootPath,
                    "fail to get db root path",
                );
            };
            let index_path = db_path.join("index");
            if let Err(e) = fs::create_dir_all(&index_path) {
                tracing::warn!(error = %e, "fail to create index path");
                return GeneralResponse::err(ReturnCode::FailToCreateFile, "fail to create path");
            }
            let mut whs = Vec::new();
            for i in 0..req.partition_num {
                let name = format!("{}_{}_index.data", req.pid, i);
                match WriteHandle::create(&name, &index_path.join(&name)) {
                    Ok(wh) => whs.push(wh),
                    Err(e) => {
                        tracing::warn!(error = %e, "fail to create index data file");
                        return GeneralResponse::err(
                            ReturnCode::FailToCreateFile,
                            "fail to create file",
                        );
                    }
                }
            }
            let this = self.clone();
            let tid = req.tid;
            let pid = req.pid;
            let task = task.clone();
            self.dispatch(move || {
                this.dump_index_data_internal(tid, pid, whs, task);
            });
            GeneralResponse::ok()
        })();
        if !resp.is_ok() {
            Self::finish_task(&task, false);
        }
        resp
    }

    fn dump_index_data_internal(
        &self,
        tid: u32,
        pid: u32,
        mut whs: Vec<WriteHandle>,
        task: Option<TaskHandle>,
    ) {
        let ok = (|| -> Result<()> {
            let (_, snapshot, replicator) = self
                .get_ts(tid, pid)
                .ok_or_else(|| crate::Error::InvalidState("table does not exist".into()))?;
            let (mut offset, _) = snapshot.dump_index_data(&mut whs)?;
            // The binlog span past the snapshot completes the dump.
            for entry in replicator.log_part().reader(offset + 1)? {
                let entry = entry?;
                if entry.op != OpType::Put {
                    continue;
                }
                let slot =
                    (murmur64(entry.pk.as_bytes(), ROOT_HASH_SEED) % whs.len() as u64) as usize;
                whs[slot].append(&entry)?;
                offset = entry.offset;
            }
            for wh in &mut whs {
                wh.end_log()?;
            }
            tracing::info!(tid, pid, offset, "dump index data succeeded");
            Ok(())
        })();
        if let Err(e) = &ok {
            tracing::warn!(tid, pid, error = %e, "dump index data failed");
        }
        Self::finish_task(&task, ok.is_ok());
    }

    // ===== maintenance =====

    pub fn execute_gc(&self, req: &GeneralRequest) -> GeneralResponse {
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table not found");
        };
        match table.sched_gc() {
            Ok(evicted) => {
                tracing::info!(tid = req.tid, pid = req.pid, evicted, "gc executed");
                GeneralResponse::ok()
            }
            Err(e) => GeneralResponse::err(ReturnCode::InvalidParameter, e.to_string()),
        }
    }

    pub fn delete_binlog(&self, req: &GeneralRequest) -> GeneralResponse {
        let mode = req.storage_mode.unwrap_or(StorageMode::Memory);
        let Some(db_path) = self.partition_path(req.tid, req.pid, mode) else {
            return GeneralResponse::err(
                ReturnCode::FailToGetDbRootPath,
                "fail to get db root path",
            );
        };
        let binlog_path = db_path.join("binlog");
        if binlog_path.exists() {
            if self.config.recycle_bin_enabled {
                let Some(recycle_root) = self.choose_recycle_root(req.tid, req.pid, mode) else {
                    return GeneralResponse::err(
                        ReturnCode::FailToGetRecycleRootPath,
                        "fail to get recycle root path",
                    );
                };
                let recycle_path = recycle_root
                    .join(format!("{}_{}_binlog_{}", req.tid, req.pid, now_time_string()));
                let _ = fs::create_dir_all(recycle_root);
                if let Err(e) = fs::rename(&binlog_path, &recycle_path) {
                    tracing::warn!(tid = req.tid, pid = req.pid, error = %e, "failed to recycle binlog");
                } else {
                    tracing::info!(tid = req.tid, pid = req.pid, "binlog moved to recycle bin");
                }
            } else if let Err(e) = fs::remove_dir_all(&binlog_path) {
                tracing::warn!(tid = req.tid, pid = req.pid, error = %e, "failed to remove binlog");
            }
        }
        GeneralResponse::ok()
    }

    pub fn set_expire(&self, req: &SetExpireRequest) -> GeneralResponse {
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.is_mem() {
            table.core().set_expire(req.is_expire);
            tracing::info!(tid = req.tid, pid = req.pid, expire = req.is_expire, "set expire");
        }
        GeneralResponse::ok()
    }

    pub fn set_ttl_clock(&self, req: &SetTtlClockRequest) -> GeneralResponse {
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        if table.is_mem() {
            let cur = now_secs();
            let offset = req.timestamp as i64 - cur;
            table.core().set_time_offset_ms(offset * 1000);
            tracing::info!(tid = req.tid, pid = req.pid, offset, "set ttl clock offset");
        }
        GeneralResponse::ok()
    }

    pub fn update_ttl(&self, req: &UpdateTtlRequest) -> GeneralResponse {
        let Some((table, _, _)) = self.get_ts(req.tid, req.pid) else {
            return GeneralResponse::err(ReturnCode::TableIsNotExist, "table is not exist");
        };
        let desc = req.ttl_desc;
        if desc.ttl_type != table.core().meta().ttl_type() {
            return GeneralResponse::err(ReturnCode::TtlTypeMismatch, "ttl type mismatch");
        }
        if desc.abs_ttl > self.config.absolute_ttl_max || desc.lat_ttl > self.config.latest_ttl_max
        {
            return GeneralResponse::err(
                ReturnCode::TtlIsGreaterThanConfValue,
                format!(
                    "ttl is greater than conf value. max abs_ttl is {}, max lat_ttl is {}",
                    self.config.absolute_ttl_max, self.config.latest_ttl_max
                ),
            );
        }
        let ts_mapping = table.core().meta().ts_mapping();
        match &req.ts_name {
            Some(ts_name) if !ts_name.is_empty() => match ts_mapping.get(ts_name) {
                Some(ts_id) => {
                    table.core().set_ttl(*ts_id, desc.abs_ttl, desc.lat_ttl);
                }
                None => {
                    return GeneralResponse::err(ReturnCode::TsNameNotFound, "ts name not found")
                }
            },
            _ => {
                if ts_mapping.is_empty() {
                    table.core().set_all_ttl(desc.abs_ttl, desc.lat_ttl);
                } else {
                    return GeneralResponse::err(
                        ReturnCode::TsNameNotFound,
                        "set ttl need to specify ts column",
                    );
                }
            }
        }
        tracing::info!(
            tid = req.tid,
            pid = req.pid,
            abs_ttl = desc.abs_ttl,
            lat_ttl = desc.lat_ttl,
            "updated ttl"
        );
        GeneralResponse::ok()
    }

    // ===== node admin =====

    pub fn connect_zk(&self) -> GeneralResponse {
        self.coordinated.store(true, Ordering::SeqCst);
        tracing::info!("connected to coordination service");
        GeneralResponse::ok()
    }

    pub fn disconnect_zk(&self) -> GeneralResponse {
        self.coordinated.store(false, Ordering::SeqCst);
        tracing::info!("disconnected from coordination service");
        GeneralResponse::ok()
    }

    pub fn is_coordinated(&self) -> bool {
        self.coordinated.load(Ordering::SeqCst)
    }

    pub fn set_concurrency(&self, req: &SetConcurrencyRequest) -> GeneralResponse {
        if req.max_concurrency < 0 {
            return GeneralResponse::err(
                ReturnCode::InvalidConcurrency,
                format!("invalid concurrency {}", req.max_concurrency),
            );
        }
        if req.key == SERVER_CONCURRENCY_KEY {
            self.global_concurrency.store(req.max_concurrency, Ordering::SeqCst);
            tracing::info!(max = req.max_concurrency, "updated server max concurrency");
        } else {
            self.concurrency
                .lock()
                .unwrap()
                .insert(req.key.clone(), req.max_concurrency);
            tracing::info!(key = %req.key, max = req.max_concurrency, "updated op max concurrency");
        }
        GeneralResponse::ok()
    }

    pub fn max_concurrency_of(&self, key: &str) -> i32 {
        self.concurrency
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or_else(|| self.global_concurrency.load(Ordering::SeqCst))
    }

    pub fn set_mode(&self, req: &SetModeRequest) -> GeneralResponse {
        self.follower_cluster.store(req.follower, Ordering::Relaxed);
        let mode = if req.follower { "follower" } else { "normal" };
        tracing::info!(mode, "set tablet mode");
        GeneralResponse::ok()
    }

    pub fn get_task_status(&self) -> GetTaskStatusResponse {
        let task_map = self.task_map.lock().unwrap();
        let tasks = task_map
            .values()
            .flat_map(|tasks| tasks.iter().map(|t| t.lock().unwrap().clone()))
            .collect();
        GetTaskStatusResponse { code: ReturnCode::Ok, msg: "ok".into(), tasks }
    }

    pub fn delete_op_task(&self, req: &DeleteTaskRequest) -> GeneralResponse {
        let mut task_map = self.task_map.lock().unwrap();
        for op_id in &req.op_ids {
            if let Some(tasks) = task_map.remove(op_id) {
                tracing::info!(op_id, task_num = tasks.len(), "deleted op tasks");
            }
        }
        GeneralResponse::ok()
    }

    pub fn show_mem_pool(&self) -> ShowMemPoolResponse {
        let partitions = self.partitions.lock().unwrap();
        let mut total = 0u64;
        for partition in partitions.values() {
            if let Partition::Ts { table, .. } = partition {
                total += table.record_byte_size();
            }
        }
        ShowMemPoolResponse {
            code: ReturnCode::Ok,
            msg: "ok".into(),
            mem_release_rate: self.config.mem_release_rate,
            table_cnt: partitions.len() as u64,
            total_record_byte_size: total,
        }
    }

    // ===== background ticks =====

    /// GC pass over every partition of the given storage class.
    pub fn gc_tick(&self, disk: bool) {
        let parts: Vec<((u32, u32), Arc<TsTable>)> = {
            let partitions = self.partitions.lock().unwrap();
            partitions
                .iter()
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. } if table.is_mem() != disk => {
                        Some((*key, table.clone()))
                    }
                    _ => None,
                })
                .collect()
        };
        for ((tid, pid), table) in parts {
            match table.sched_gc() {
                Ok(evicted) if evicted > 0 => {
                    tracing::info!(tid, pid, evicted, "gc pass evicted entries");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(tid, pid, error = %e, "gc pass failed"),
            }
        }
    }

    /// Fsync every partition's binlog.
    pub fn sync_disk_tick(&self) {
        for (key, replicator) in self.ts_replicators() {
            if let Err(e) = replicator.log_part().sync_to_disk() {
                tracing::warn!(tid = key.0, pid = key.1, error = %e, "binlog sync failed");
            }
        }
    }

    /// Retire binlog segments every consumer has passed.
    pub fn delete_binlog_tick(&self) {
        for (key, replicator) in self.ts_replicators() {
            if let Err(e) = replicator.sched_delete_binlog() {
                tracing::warn!(tid = key.0, pid = key.1, error = %e, "binlog truncation failed");
            }
        }
    }

    fn ts_replicators(&self) -> Vec<((u32, u32), Arc<Replicator>)> {
        let partitions = self.partitions.lock().unwrap();
        partitions
            .iter()
            .filter_map(|(key, partition)| match partition {
                Partition::Ts { replicator, .. } => Some((*key, replicator.clone())),
                Partition::Relational { .. } => None,
            })
            .collect()
    }

    /// Nightly snapshot window for memory tables.
    pub fn snapshot_check_tick(&self) {
        if crate::clock::now_hour() != self.config.make_snapshot_time {
            return;
        }
        let now = now_secs();
        let parts: Vec<(u32, u32)> = {
            let partitions = self.partitions.lock().unwrap();
            partitions
                .iter()
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. }
                        if table.is_mem()
                            && now - table.core().make_snapshot_time()
                                > self.config.make_snapshot_offline_interval as i64 =>
                    {
                        Some(*key)
                    }
                    _ => None,
                })
                .collect()
        };
        for (tid, pid) in parts {
            tracing::info!(tid, pid, "start scheduled snapshot");
            self.make_snapshot_internal(tid, pid, 0, None);
        }
    }

    /// Periodic snapshot for disk tables.
    pub fn disk_snapshot_tick(&self) {
        let parts: Vec<(u32, u32)> = {
            let partitions = self.partitions.lock().unwrap();
            partitions
                .iter()
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. } if !table.is_mem() => Some(*key),
                    _ => None,
                })
                .collect()
        };
        for (tid, pid) in parts {
            self.make_snapshot_internal(tid, pid, 0, None);
        }
    }

    /// Reclaim recycle-bin entries older than `recycle_ttl` minutes.
    pub fn recycle_sweep_tick(&self) {
        let ttl_secs = self.config.recycle_ttl as i64 * 60;
        let now = now_secs();
        let roots: Vec<&PathBuf> = self
            .config
            .recycle_bin_root_paths
            .iter()
            .chain(self.config.recycle_ssd_bin_root_paths.iter())
            .chain(self.config.recycle_hdd_bin_root_paths.iter())
            .collect();
        for root in roots {
            let Ok(entries) = fs::read_dir(root) else { continue };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
                let Some(stamp) = name.rsplit('_').next().and_then(parse_time_string) else {
                    continue;
                };
                if now - stamp > ttl_secs {
                    match fs::remove_dir_all(&path) {
                        Ok(_) => tracing::info!(path = %path.display(), "reclaimed recycle entry"),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "recycle sweep failed")
                        }
                    }
                }
            }
        }
    }

    /// Sample per-partition disk usage.
    pub fn diskused_tick(&self) {
        let parts: Vec<((u32, u32), Arc<TsTable>)> = {
            let partitions = self.partitions.lock().unwrap();
            partitions
                .iter()
                .filter_map(|(key, partition)| match partition {
                    Partition::Ts { table, .. } => Some((*key, table.clone())),
                    Partition::Relational { .. } => None,
                })
                .collect()
        };
        for ((tid, pid), table) in parts {
            if let Some(path) = self.partition_path(tid, pid, table.storage_mode()) {
                table.core().set_diskused(dir_size(&path));
            }
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else { return 0 };
    entries
        .filter_map(|e| e.ok())
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ColType, ColumnDesc, ColumnKey, TtlDesc, TtlType};
    use crate::replica::{NullConnector, PeerClient};
    use crate::storage::iterator::SeekType;
    use crate::storage::relational::{encode_row, Datum};

    /// In-process routing between tablet servers, standing in for the
    /// remote-call framework.
    struct LocalCluster {
        servers: Mutex<HashMap<String, Arc<TabletServer>>>,
    }

    impl LocalCluster {
        fn new() -> Arc<Self> {
            Arc::new(Self { servers: Mutex::new(HashMap::new()) })
        }

        fn register(&self, endpoint: &str, server: Arc<TabletServer>) {
            self.servers.lock().unwrap().insert(endpoint.to_string(), server);
        }
    }

    struct LocalClient {
        server: Arc<TabletServer>,
    }

    impl PeerClient for LocalClient {
        fn append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            Ok(self.server.append_entries(req))
        }

        fn send_data(&self, req: &SendDataRequest, data: &[u8]) -> Result<GeneralResponse> {
            Ok(self.server.send_data(req, data))
        }
    }

    struct LocalConnector {
        cluster: Arc<LocalCluster>,
    }

    impl PeerConnector for LocalConnector {
        fn connect(&self, endpoint: &str) -> Result<Arc<dyn PeerClient>> {
            let server = self
                .cluster
                .servers
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .ok_or_else(|| crate::Error::Io(format!("no route to {endpoint}")))?;
            Ok(Arc::new(LocalClient { server }))
        }
    }

    fn test_config(dir: &Path) -> TabletConfig {
        TabletConfig::new(dir)
            .make_snapshot_threshold_offset(0)
            .binlog_single_file_max_size(256)
    }

    fn standalone(dir: &Path) -> Arc<TabletServer> {
        TabletServer::new(test_config(dir), Arc::new(NullConnector)).expect("server failed")
    }

    fn clustered(dir: &Path, cluster: &Arc<LocalCluster>) -> Arc<TabletServer> {
        TabletServer::new(
            test_config(dir),
            Arc::new(LocalConnector { cluster: cluster.clone() }),
        )
        .expect("server failed")
    }

    fn ts_meta(tid: u32, pid: u32, mode: TableMode) -> TableMeta {
        TableMeta::new(format!("t{tid}"), tid, pid).mode(mode)
    }

    fn create(server: &Arc<TabletServer>, meta: TableMeta) {
        let resp = server.create_table(&CreateTableRequest { table_meta: meta });
        assert!(resp.is_ok(), "create failed: {}", resp.msg);
    }

    fn put(server: &Arc<TabletServer>, tid: u32, pid: u32, pk: &str, ts: u64, value: &[u8]) {
        let resp = server.put(&PutRequest::new(tid, pid, pk, ts, value.to_vec()));
        assert!(resp.is_ok(), "put failed: {}", resp.msg);
    }

    fn get(
        server: &Arc<TabletServer>,
        tid: u32,
        pid: u32,
        pk: &str,
        ts: u64,
        ts_type: SeekType,
    ) -> GetResponse {
        server.get(&GetRequest::new(tid, pid, pk, ts, ts_type))
    }

    #[test]
    fn test_put_then_get_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));

        put(&server, 1, 0, "k", 100, b"v1");
        put(&server, 1, 0, "k", 200, b"v2");

        let resp = get(&server, 1, 0, "k", 0, SeekType::Ge);
        assert_eq!(resp.code, ReturnCode::Ok);
        assert_eq!((resp.ts, resp.value.as_slice()), (200, b"v2".as_slice()));

        let resp = get(&server, 1, 0, "k", 100, SeekType::Eq);
        assert_eq!((resp.ts, resp.value.as_slice()), (100, b"v1".as_slice()));

        let resp = get(&server, 1, 0, "missing", 0, SeekType::Ge);
        assert_eq!(resp.code, ReturnCode::KeyNotFound);
    }

    #[test]
    fn test_put_validations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));

        let resp = server.put(&PutRequest::new(1, 0, "k", 0, b"v".to_vec()));
        assert_eq!(resp.code, ReturnCode::TsMustBeGreaterThanZero);

        let resp = server.put(&PutRequest::new(9, 9, "k", 1, b"v".to_vec()));
        assert_eq!(resp.code, ReturnCode::TableIsNotExist);

        create(&server, ts_meta(2, 0, TableMode::Follower));
        let resp = server.put(&PutRequest::new(2, 0, "k", 1, b"v".to_vec()));
        assert_eq!(resp.code, ReturnCode::TableIsFollower);

        server.set_mode(&SetModeRequest { follower: true });
        let resp = server.put(&PutRequest::new(1, 0, "k", 1, b"v".to_vec()));
        assert_eq!(resp.code, ReturnCode::IsFollowerCluster);
        server.set_mode(&SetModeRequest { follower: false });
    }

    #[test]
    fn test_leader_write_and_follower_catch_up() {
        let cluster = LocalCluster::new();
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let leader = clustered(dir_a.path(), &cluster);
        let follower = clustered(dir_b.path(), &cluster);
        cluster.register("peer-b:9520", follower.clone());

        create(&leader, ts_meta(1, 0, TableMode::Leader));
        create(&follower, ts_meta(1, 0, TableMode::Follower));

        put(&leader, 1, 0, "k", 100, b"v1");
        put(&leader, 1, 0, "k", 200, b"v2");

        let resp = leader.add_replica(&ReplicaRequest {
            tid: 1,
            pid: 0,
            endpoint: "peer-b:9520".into(),
            remote_tid: None,
            task_info: None,
        });
        assert!(resp.is_ok(), "{}", resp.msg);
        let dup = leader.add_replica(&ReplicaRequest {
            tid: 1,
            pid: 0,
            endpoint: "peer-b:9520".into(),
            remote_tid: None,
            task_info: None,
        });
        assert_eq!(dup.code, ReturnCode::ReplicaEndpointAlreadyExists);

        for _ in 0..100 {
            let resp = get(&follower, 1, 0, "k", 100, SeekType::Eq);
            if resp.code == ReturnCode::Ok {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let resp = get(&follower, 1, 0, "k", 100, SeekType::Eq);
        assert_eq!(resp.code, ReturnCode::Ok);
        assert_eq!((resp.ts, resp.value.as_slice()), (100, b"v1".as_slice()));

        let followers = leader.get_table_follower(1, 0);
        assert_eq!(followers.code, ReturnCode::Ok);
        assert_eq!(followers.offset, 2);
        assert_eq!(followers.follower_info.len(), 1);
        assert_eq!(followers.follower_info[0].0, "peer-b:9520");
    }

    #[test]
    fn test_snapshot_truncates_binlog_and_load_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let server = standalone(dir.path());
            create(&server, ts_meta(1, 0, TableMode::Leader));
            for i in 1..=100u64 {
                put(&server, 1, 0, &format!("k{}", i % 10), i * 10, format!("v{i}").as_bytes());
            }
            let resp = server.make_snapshot(&MakeSnapshotRequest {
                tid: 1,
                pid: 0,
                offset: 0,
                task_info: None,
            });
            assert!(resp.is_ok(), "{}", resp.msg);
            let manifest = server
                .get_manifest(&GeneralRequest::new(1, 0))
                .manifest;
            assert!(manifest.offset >= 100);

            // Two more writes after the snapshot, then truncation.
            put(&server, 1, 0, "k1", 5000, b"post1");
            put(&server, 1, 0, "k2", 6000, b"post2");
            server.sync_disk_tick();
            server.delete_binlog_tick();
        }

        // Restart: load reaches the pre-shutdown offset and data.
        let server = standalone(dir.path());
        let resp = server.load_table(&LoadTableRequest {
            table_meta: ts_meta(1, 0, TableMode::Leader),
            task_info: None,
        });
        assert!(resp.is_ok(), "{}", resp.msg);
        let status = server.get_table_status(&GetTableStatusRequest {
            tid: Some(1),
            pid: Some(0),
            need_schema: false,
        });
        assert_eq!(status.all_table_status.len(), 1);
        assert_eq!(status.all_table_status[0].offset, 102);
        assert_eq!(status.all_table_status[0].state, "Normal");

        let resp = get(&server, 1, 0, "k1", 5000, SeekType::Eq);
        assert_eq!(resp.value, b"post1".to_vec());
        let resp = get(&server, 1, 0, "k5", 0, SeekType::Ge);
        assert_eq!(resp.code, ReturnCode::Ok);

        // Loading an already present partition is rejected.
        let resp = server.load_table(&LoadTableRequest {
            table_meta: ts_meta(1, 0, TableMode::Leader),
            task_info: None,
        });
        assert_eq!(resp.code, ReturnCode::TableAlreadyExists);
    }

    #[test]
    fn test_ttl_abs_or_lat_scan_keeps_three_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let meta = ts_meta(1, 0, TableMode::Leader).ttl(TtlDesc::new(1, 3, TtlType::AbsOrLat));
        create(&server, meta);

        // Pin the virtual TTL clock at t=5s so the absolute window covers
        // every entry and only the count limit bites.
        server.set_ttl_clock(&SetTtlClockRequest { tid: 1, pid: 0, timestamp: 5 });
        for ts in [1000u64, 2000, 3000, 4000, 5000] {
            put(&server, 1, 0, "k", ts, b"v");
        }
        let resp = server.scan(&ScanRequest::new(1, 0, "k", 0, 0));
        assert_eq!(resp.code, ReturnCode::Ok);
        let ts: Vec<u64> = resp.pairs.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(ts, vec![5000, 4000, 3000]);
    }

    #[test]
    fn test_scan_rejects_st_less_than_et() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));
        put(&server, 1, 0, "k", 100, b"v");
        let resp = server.scan(&ScanRequest::new(1, 0, "k", 100, 200));
        assert_eq!(resp.code, ReturnCode::StLessThanEt);
    }

    #[test]
    fn test_scan_max_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path()).scan_max_bytes_size(8);
        let server = TabletServer::new(config, Arc::new(NullConnector)).expect("server failed");
        create(&server, ts_meta(1, 0, TableMode::Leader));
        for ts in [100u64, 200, 300] {
            put(&server, 1, 0, "k", ts, b"0123456789");
        }
        let resp = server.scan(&ScanRequest::new(1, 0, "k", 0, 0));
        assert_eq!(resp.code, ReturnCode::ReacheTheScanMaxBytesSize);
    }

    #[test]
    fn test_send_data_block_sequencing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());

        let req = |block_id: u64, size: u32, eof: bool| SendDataRequest {
            tid: 9,
            pid: 0,
            file_name: "part.sdb".into(),
            block_id,
            block_size: size,
            eof,
            dir_name: None,
            storage_mode: Some(StorageMode::Memory),
        };

        // Block 0 initializes the receiver.
        assert!(server.send_data(&req(0, 0, false), &[]).is_ok());
        // Skipping block 1 is a mismatch.
        let resp = server.send_data(&req(2, 3, false), b"abc");
        assert_eq!(resp.code, ReturnCode::BlockIdMismatch);
        // Blocks 1 then 2 with eof complete the file.
        assert!(server.send_data(&req(1, 3, false), b"abc").is_ok());
        // Retrying block 1 is a no-op.
        assert!(server.send_data(&req(1, 3, false), b"abc").is_ok());
        let resp = server.send_data(&req(2, 3, true), b"def");
        assert!(resp.is_ok());

        let path = server
            .partition_path(9, 0, StorageMode::Memory)
            .unwrap()
            .join("snapshot")
            .join("part.sdb");
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        // A length lie is rejected.
        assert!(server.send_data(&req(0, 0, false), &[]).is_ok());
        let resp = server.send_data(&req(1, 5, false), b"abc");
        assert_eq!(resp.code, ReturnCode::ReceiveDataError);

        // Check file verifies sizes.
        let resp = server.check_file(&CheckFileRequest {
            tid: 9,
            pid: 0,
            file: "part.sdb".into(),
            size: 6,
            dir_name: None,
            storage_mode: Some(StorageMode::Memory),
        });
        assert!(resp.is_ok());
        let resp = server.check_file(&CheckFileRequest {
            tid: 9,
            pid: 0,
            file: "part.sdb".into(),
            size: 7,
            dir_name: None,
            storage_mode: Some(StorageMode::Memory),
        });
        assert_eq!(resp.code, ReturnCode::ReceiveDataError);
    }

    #[test]
    fn test_send_snapshot_ships_files() {
        let cluster = LocalCluster::new();
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let leader = clustered(dir_a.path(), &cluster);
        let receiver = clustered(dir_b.path(), &cluster);
        cluster.register("peer-b:9520", receiver.clone());

        create(&leader, ts_meta(1, 0, TableMode::Leader));
        for i in 1..=10u64 {
            put(&leader, 1, 0, "k", i * 100, b"v");
        }
        assert!(leader
            .make_snapshot(&MakeSnapshotRequest { tid: 1, pid: 0, offset: 0, task_info: None })
            .is_ok());

        // Send-snapshot requires the paused state.
        let premature = leader.send_snapshot(&SendSnapshotRequest {
            tid: 1,
            pid: 0,
            endpoint: "peer-b:9520".into(),
            remote_tid: 1,
            task_info: None,
        });
        assert_eq!(premature.code, ReturnCode::TableStatusIsNotSnapshotPaused);

        assert!(leader.pause_snapshot(&GeneralRequest::new(1, 0)).is_ok());
        let resp = leader.send_snapshot(&SendSnapshotRequest {
            tid: 1,
            pid: 0,
            endpoint: "peer-b:9520".into(),
            remote_tid: 1,
            task_info: None,
        });
        assert!(resp.is_ok(), "{}", resp.msg);
        assert!(leader.recover_snapshot(&GeneralRequest::new(1, 0)).is_ok());

        // The receiver now has meta, dump and MANIFEST on disk; loading
        // reproduces the leader's data.
        let resp = receiver.load_table(&LoadTableRequest {
            table_meta: ts_meta(1, 0, TableMode::Leader),
            task_info: None,
        });
        assert!(resp.is_ok(), "{}", resp.msg);
        let got = get(&receiver, 1, 0, "k", 0, SeekType::Ge);
        assert_eq!(got.code, ReturnCode::Ok);
        assert_eq!(got.ts, 1000);
    }

    #[test]
    fn test_update_table_meta_for_add_field_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        for pid in 0..2 {
            create(&server, ts_meta(7, pid, TableMode::Leader));
        }
        let req = UpdateTableMetaForAddFieldRequest {
            tid: 7,
            column_desc: ColumnDesc::new("c", ColType::String),
        };
        assert!(server.update_table_meta_for_add_field(&req).is_ok());

        let mut contents = Vec::new();
        for pid in 0..2 {
            let path = server
                .partition_path(7, pid, StorageMode::Memory)
                .unwrap()
                .join("table_meta.txt");
            let text = fs::read_to_string(&path).unwrap();
            let meta = TableMeta::from_text(&text).unwrap();
            assert_eq!(meta.added_column_descs.len(), 1);
            assert_eq!(meta.added_column_descs[0].name, "c");
            contents.push(text);
        }

        // A second identical call leaves each file unchanged.
        assert!(server.update_table_meta_for_add_field(&req).is_ok());
        for pid in 0..2usize {
            let path = server
                .partition_path(7, pid as u32, StorageMode::Memory)
                .unwrap()
                .join("table_meta.txt");
            assert_eq!(fs::read_to_string(&path).unwrap(), contents[pid]);
        }
    }

    #[test]
    fn test_change_role_and_term_pair() {
        let cluster = LocalCluster::new();
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let node = clustered(dir_a.path(), &cluster);
        let peer = clustered(dir_b.path(), &cluster);
        cluster.register("ep1", peer.clone());

        create(&node, ts_meta(1, 0, TableMode::Follower));
        create(&peer, ts_meta(1, 0, TableMode::Follower));

        // A follower rejects writes.
        let resp = node.put(&PutRequest::new(1, 0, "k", 100, b"v".to_vec()));
        assert_eq!(resp.code, ReturnCode::TableIsFollower);

        let resp = node.change_role(&ChangeRoleRequest {
            tid: 1,
            pid: 0,
            mode: TableMode::Leader,
            term: 42,
            replicas: vec!["ep1".into()],
            endpoint_tid: Vec::new(),
        });
        assert!(resp.is_ok(), "{}", resp.msg);

        put(&node, 1, 0, "k", 100, b"v");
        let pair = node.get_term_pair(&GeneralRequest::new(1, 0));
        assert!(pair.has_table);
        assert!(pair.is_leader);
        assert_eq!(pair.term, 42);
        assert_eq!(pair.offset, 1);

        let followers = node.get_table_follower(1, 0);
        assert_eq!(followers.code, ReturnCode::Ok);
        assert_eq!(followers.follower_info[0].0, "ep1");

        // Changing to leader twice is rejected.
        let resp = node.change_role(&ChangeRoleRequest {
            tid: 1,
            pid: 0,
            mode: TableMode::Leader,
            term: 43,
            replicas: Vec::new(),
            endpoint_tid: Vec::new(),
        });
        assert_eq!(resp.code, ReturnCode::TableIsLeader);
    }

    #[test]
    fn test_state_machine_pause_recover() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));

        assert!(server.pause_snapshot(&GeneralRequest::new(1, 0)).is_ok());
        // Pausing again is fine.
        assert!(server.pause_snapshot(&GeneralRequest::new(1, 0)).is_ok());

        // Put stays legal while paused; make-snapshot does not.
        put(&server, 1, 0, "k", 100, b"v");
        let resp = server.make_snapshot(&MakeSnapshotRequest {
            tid: 1,
            pid: 0,
            offset: 0,
            task_info: None,
        });
        assert_eq!(resp.code, ReturnCode::TableStatusIsNotNormal);

        let resp = server.change_role(&ChangeRoleRequest {
            tid: 1,
            pid: 0,
            mode: TableMode::Follower,
            term: 0,
            replicas: Vec::new(),
            endpoint_tid: Vec::new(),
        });
        assert_eq!(resp.code, ReturnCode::TableStatusIsNotNormal);

        assert!(server.recover_snapshot(&GeneralRequest::new(1, 0)).is_ok());
        assert!(server.recover_snapshot(&GeneralRequest::new(1, 0)).is_ok());
        let resp = server.make_snapshot(&MakeSnapshotRequest {
            tid: 1,
            pid: 0,
            offset: 0,
            task_info: None,
        });
        assert!(resp.is_ok());
    }

    #[test]
    fn test_drop_table_recycles_then_sweep_reclaims() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.recycle_ttl = 0;
        let server = TabletServer::new(config, Arc::new(NullConnector)).expect("server failed");
        create(&server, ts_meta(1, 0, TableMode::Leader));
        put(&server, 1, 0, "k", 100, b"v");

        let db_path = server.partition_path(1, 0, StorageMode::Memory).unwrap();
        assert!(db_path.exists());
        assert!(server
            .drop_table(&DropTableRequest { tid: 1, pid: 0, task_info: None })
            .is_ok());
        assert!(!db_path.exists());
        assert!(server.get_partition(1, 0).is_none());

        let recycled: Vec<_> = fs::read_dir(dir.path().join("recycle"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(recycled.len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        server.recycle_sweep_tick();
        let recycled: Vec<_> = fs::read_dir(dir.path().join("recycle"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(recycled.is_empty());
    }

    #[test]
    fn test_delete_index_memory_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let meta = TableMeta::new("t1", 1, 0)
            .column(ColumnDesc::new("card", ColType::String))
            .column(ColumnDesc::new("mcc", ColType::String))
            .column(ColumnDesc::new("ts1", ColType::Int64).ts_col())
            .column_key(ColumnKey::new("card").cols(&["card"]))
            .column_key(ColumnKey::new("mcc").cols(&["mcc"]));
        create(&server, meta);

        let resp = server.delete_index(&DeleteIndexRequest { tid: 1, idx_name: "mcc".into() });
        assert!(resp.is_ok(), "{}", resp.msg);

        // Reads against the deleted index now fail.
        let mut req = GetRequest::new(1, 0, "x", 0, SeekType::Ge);
        req.idx_name = Some("mcc".into());
        assert_eq!(server.get(&req).code, ReturnCode::IdxNameNotFound);

        let resp = server.delete_index(&DeleteIndexRequest { tid: 1, idx_name: "nope".into() });
        assert_eq!(resp.code, ReturnCode::IndexDeleteFailed);
    }

    #[test]
    fn test_task_tracking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));
        put(&server, 1, 0, "k", 100, b"v");

        let task = TaskInfo::new(77, 1, TaskType::MakeSnapshot);
        let resp = server.make_snapshot(&MakeSnapshotRequest {
            tid: 1,
            pid: 0,
            offset: 0,
            task_info: Some(task.clone()),
        });
        assert!(resp.is_ok());
        let status = server.get_task_status();
        assert_eq!(status.tasks.len(), 1);
        assert_eq!(status.tasks[0].op_id, 77);
        assert_eq!(status.tasks[0].status, TaskStatus::Done);

        server.delete_op_task(&DeleteTaskRequest { op_ids: vec![77] });
        assert!(server.get_task_status().tasks.is_empty());
    }

    #[test]
    fn test_update_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let meta = ts_meta(1, 0, TableMode::Leader).ttl(TtlDesc::new(10, 0, TtlType::AbsoluteTime));
        create(&server, meta);

        let resp = server.update_ttl(&UpdateTtlRequest {
            tid: 1,
            pid: 0,
            ttl_desc: TtlDesc::new(20, 0, TtlType::LatestTime),
            ts_name: None,
        });
        assert_eq!(resp.code, ReturnCode::TtlTypeMismatch);

        let resp = server.update_ttl(&UpdateTtlRequest {
            tid: 1,
            pid: 0,
            ttl_desc: TtlDesc::new(u64::MAX, 0, TtlType::AbsoluteTime),
            ts_name: None,
        });
        assert_eq!(resp.code, ReturnCode::TtlIsGreaterThanConfValue);

        let resp = server.update_ttl(&UpdateTtlRequest {
            tid: 1,
            pid: 0,
            ttl_desc: TtlDesc::new(20, 0, TtlType::AbsoluteTime),
            ts_name: None,
        });
        assert!(resp.is_ok());
    }

    #[test]
    fn test_relational_table_ops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let meta = TableMeta::new("r1", 3, 0)
            .table_type(TableType::Relational)
            .column(ColumnDesc::new("id", ColType::Int64))
            .column(ColumnDesc::new("name", ColType::String))
            .column_key(ColumnKey::new("id").cols(&["id"]));
        create(&server, meta);

        let row = encode_row(&[Datum::Int64(7), Datum::Str("alice".into())]).unwrap();
        let resp = server.put(&PutRequest::new(3, 0, "", 0, row));
        assert!(resp.is_ok(), "{}", resp.msg);

        let resp = get(&server, 3, 0, "7", 0, SeekType::Ge);
        assert_eq!(resp.code, ReturnCode::Ok);

        let resp = server.update(&UpdateRequest {
            tid: 3,
            pid: 0,
            condition_columns: vec![("id".into(), Datum::Int64(7))],
            value_columns: vec![("name".into(), Datum::Str("bob".into()))],
        });
        assert!(resp.is_ok());

        let resp = server.batch_query(&BatchQueryRequest {
            tid: 3,
            pid: 0,
            keys: vec!["7".into(), "8".into()],
        });
        assert_eq!(resp.count, 1);

        let resp = server.traverse(&TraverseRequest::new(3, 0));
        assert_eq!(resp.count, 1);
        assert!(resp.is_finish);

        let resp = server.delete(&DeleteRequest { tid: 3, pid: 0, key: "7".into(), idx_name: None });
        assert!(resp.is_ok());
        let resp = get(&server, 3, 0, "7", 0, SeekType::Ge);
        assert_eq!(resp.code, ReturnCode::KeyNotFound);
    }

    #[test]
    fn test_traverse_pagination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));
        for pk in ["a", "b", "c"] {
            for ts in [100u64, 200] {
                put(&server, 1, 0, pk, ts, b"v");
            }
        }

        let mut req = TraverseRequest::new(1, 0);
        req.limit = 4;
        let first = server.traverse(&req);
        assert_eq!(first.count, 4);
        assert!(!first.is_finish);

        req.pk = Some(first.pk.clone());
        req.ts = first.ts;
        let second = server.traverse(&req);
        assert_eq!(second.count, 2);
        assert!(second.is_finish);

        let mut seen: Vec<(String, u64)> = first
            .pairs
            .iter()
            .chain(second.pairs.iter())
            .map(|(pk, ts, _)| (pk.clone(), *ts))
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_count_ops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let meta = ts_meta(1, 0, TableMode::Leader).ttl(TtlDesc::new(0, 2, TtlType::LatestTime));
        create(&server, meta);
        for ts in [100u64, 200, 300, 400] {
            put(&server, 1, 0, "k", ts, b"v");
        }

        // Raw count ignores TTL.
        let resp = server.count(&CountRequest::new(1, 0, "k"));
        assert_eq!(resp.count, 4);

        // Filtered count respects the latest-2 TTL.
        let mut req = CountRequest::new(1, 0, "k");
        req.filter_expired_data = true;
        let resp = server.count(&req);
        assert_eq!(resp.count, 2);
    }

    #[test]
    fn test_disk_table_create_and_reject_composite_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let meta = ts_meta(4, 0, TableMode::Leader).storage(StorageMode::Ssd);
        create(&server, meta);
        put(&server, 4, 0, "k", 100, b"v");
        let resp = get(&server, 4, 0, "k", 0, SeekType::Ge);
        assert_eq!(resp.code, ReturnCode::Ok);
        assert_eq!(resp.ts, 100);

        let bad = ts_meta(4, 1, TableMode::Leader)
            .storage(StorageMode::Ssd)
            .ttl(TtlDesc::new(1, 1, TtlType::AbsAndLat));
        let resp = server.create_table(&CreateTableRequest { table_meta: bad });
        assert_eq!(resp.code, ReturnCode::CreateTableFailed);
    }

    #[test]
    fn test_set_concurrency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        let resp = server.set_concurrency(&SetConcurrencyRequest {
            key: "Scan".into(),
            max_concurrency: -1,
        });
        assert_eq!(resp.code, ReturnCode::InvalidConcurrency);

        assert!(server
            .set_concurrency(&SetConcurrencyRequest { key: "Scan".into(), max_concurrency: 8 })
            .is_ok());
        assert_eq!(server.max_concurrency_of("Scan"), 8);

        assert!(server
            .set_concurrency(&SetConcurrencyRequest {
                key: SERVER_CONCURRENCY_KEY.into(),
                max_concurrency: 16,
            })
            .is_ok());
        assert_eq!(server.max_concurrency_of("Get"), 16);
    }

    #[test]
    fn test_show_mem_pool_and_zk_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = standalone(dir.path());
        create(&server, ts_meta(1, 0, TableMode::Leader));
        put(&server, 1, 0, "k", 100, b"value");

        let resp = server.show_mem_pool();
        assert_eq!(resp.table_cnt, 1);
        assert_eq!(resp.total_record_byte_size, 5);

        assert!(!server.is_coordinated());
        server.connect_zk();
        assert!(server.is_coordinated());
        server.disconnect_zk();
        assert!(!server.is_coordinated());
    }
}
