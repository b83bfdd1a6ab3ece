//! TTL expiry predicates shared by reads, scans and GC.

use crate::meta::TtlType;

/// Whether the entry at `ts`, reached after stepping over `steps` newer
/// entries under the same key, is past its TTL. `expire_time` and
/// `expire_cnt` of zero disable the respective limit.
///
/// Both conditions are monotone along a newest-first walk: `steps` only
/// grows and `ts` only shrinks. Expired entries therefore form a suffix,
/// which is what lets scans stop early and GC unlink a whole tail.
pub fn is_expired(
    ttl_type: TtlType,
    ts: u64,
    steps: u64,
    expire_time: u64,
    expire_cnt: u64,
) -> bool {
    let too_old = expire_time != 0 && ts <= expire_time;
    let too_many = expire_cnt != 0 && steps >= expire_cnt;
    match ttl_type {
        TtlType::AbsoluteTime => too_old,
        TtlType::LatestTime => too_many,
        TtlType::AbsAndLat => too_old && too_many,
        TtlType::AbsOrLat => too_old || too_many,
    }
}
