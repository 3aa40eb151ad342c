//! Time-slice and bucket key formats, plus the slice-claim state machine.
//!
//! Key formats are fixed: other processes (and the recovery tooling) address
//! the same entries in the shared store, so changing them orphans live data.
//!
//! - minute slice: `"YYYY-MM-DD HH:MM"`
//! - bucket: `"<shard>_<YYYY-MM-DD HH:MM>"`
//! - pending window: `"pending_<YYYY-MM-DD HH:M>_<YYYY-MM-DD HH:M+1>"`
//!   (10-minute windows, formed by dropping the last minute digit)
//! - pending member: `"<def_id>_<unix_nanos>"`

use chrono::{DateTime, Utc};

use crate::error::{BelfryError, Result};

/// Sentinel value stored once a slice has been fully fanned out.
pub const SUCCESS_SENTINEL: &str = "success";

/// How long a claimant may hold a slice before a peer may reclaim it.
pub const CLAIM_TIMEOUT_SECS: i64 = 40;

/// TTL of the per-slice mutex bounding the claim critical section.
pub const CLAIM_LOCK_TTL_MS: u64 = 2_000;

/// TTL of slice claim entries.
pub const SLICE_TTL_SECS: u64 = 3 * 24 * 3600;

/// Pending-window TTL, counted from the trigger time.
pub const PENDING_TTL_SECS: i64 = 7 * 24 * 3600;

const SLICE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Format a Unix timestamp (seconds) as a minute-slice key.
pub fn minute_slice(unix_secs: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp(unix_secs, 0).unwrap_or_default();
    dt.format(SLICE_FORMAT).to_string()
}

/// Parse a minute-slice key back to the Unix timestamp of its start.
pub fn slice_start(slice: &str) -> Result<i64> {
    let naive = chrono::NaiveDateTime::parse_from_str(&format!("{}:00", slice), "%Y-%m-%d %H:%M:%S")
        .map_err(|e| BelfryError::Validation(format!("invalid slice '{}': {}", slice, e)))?;
    Ok(naive.and_utc().timestamp())
}

/// Key of the mutex guarding a slice claim.
pub fn slice_lock(slice: &str) -> String {
    format!("LOCK_{}", slice)
}

/// Bucket key for a shard and minute slice.
pub fn bucket_key(shard: u32, slice: &str) -> String {
    format!("{}_{}", shard, slice)
}

/// Split a bucket key back into `(shard, slice)`.
pub fn parse_bucket_key(bucket: &str) -> Result<(u32, String)> {
    let (shard, slice) = bucket
        .split_once('_')
        .ok_or_else(|| BelfryError::Validation(format!("invalid bucket key '{}'", bucket)))?;
    let shard: u32 = shard
        .parse()
        .map_err(|_| BelfryError::Validation(format!("invalid shard in bucket key '{}'", bucket)))?;
    Ok((shard, slice.to_string()))
}

/// Pending-window key for a trigger time. Windows are 10 minutes wide; the
/// window name is the minute slice with the last digit dropped.
pub fn pending_window(unix_secs: i64) -> String {
    format!(
        "pending_{}_{}",
        truncate_window(unix_secs),
        truncate_window(unix_secs + 600)
    )
}

fn truncate_window(unix_secs: i64) -> String {
    let mut s = minute_slice(unix_secs);
    s.pop();
    s
}

/// Pending-set member for a registration.
pub fn pending_member(def_id: &str, unix_nanos: i64) -> String {
    format!("{}_{}", def_id, unix_nanos)
}

/// Deterministic shard assignment: FNV-1a over the definition ID.
///
/// Stable across processes and re-registrations; the shard actually used at
/// registration time is still recorded in the save task and read back rather
/// than recomputed, so a shard-count increase only affects new registrations.
pub fn shard_for(def_id: &str, shard_count: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in def_id.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % u64::from(shard_count.max(1))) as u32
}

/// Outcome of a slice-claim attempt. Losing the claim is routine, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the slice and must fan it out.
    Claimed,
    /// The slice was already fanned out successfully elsewhere.
    AlreadyDone,
    /// A peer holds a live claim (or the claim mutex); try again next tick.
    HeldByPeer,
}

/// Decision for a claim attempt given the stored value, taken under the
/// per-slice mutex. `Write(v)` means: store `v` and treat the slice as won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    Write(String),
    AlreadyDone,
    HeldByPeer,
}

/// Evaluate the claim state machine against the current stored value.
///
/// Absent entry: claim it with a fresh self-timeout. A `"success"` sentinel
/// means the slice is done. A future timestamp means a peer is still inside
/// its claim window. A past (or unparseable) value means the prior claimant
/// is presumed dead and the slice is reclaimed.
pub fn evaluate_claim(existing: Option<&str>, now: i64) -> ClaimDecision {
    let timeout_value = (now + CLAIM_TIMEOUT_SECS).to_string();
    match existing {
        None => ClaimDecision::Write(timeout_value),
        Some(SUCCESS_SENTINEL) => ClaimDecision::AlreadyDone,
        Some(value) => match value.parse::<i64>() {
            Ok(deadline) if now < deadline => ClaimDecision::HeldByPeer,
            Ok(_) => ClaimDecision::Write(timeout_value),
            Err(_) => {
                tracing::warn!(value = %value, "Unparseable slice claim value, reclaiming");
                ClaimDecision::Write(timeout_value)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_slice_format() {
        // 2026-08-27 10:41:30 UTC
        let ts = 1_787_179_290;
        let slice = minute_slice(ts);
        assert_eq!(slice.len(), 16);
        assert!(slice.ends_with(&format!("{:02}", (ts / 60) % 60)));
    }

    #[test]
    fn test_slice_start_round_trip() {
        let ts = 1_700_000_040; // minute-aligned
        let slice = minute_slice(ts);
        assert_eq!(slice_start(&slice).unwrap(), ts);
    }

    #[test]
    fn test_slice_start_truncates_seconds() {
        let ts = 1_700_000_059;
        let slice = minute_slice(ts);
        assert_eq!(slice_start(&slice).unwrap(), ts - 59);
    }

    #[test]
    fn test_bucket_key_round_trip() {
        let slice = minute_slice(1_700_000_040);
        let key = bucket_key(3, &slice);
        let (shard, parsed) = parse_bucket_key(&key).unwrap();
        assert_eq!(shard, 3);
        assert_eq!(parsed, slice);
    }

    #[test]
    fn test_parse_bucket_key_invalid() {
        assert!(parse_bucket_key("no-separator").is_err());
        assert!(parse_bucket_key("x_2024-01-01 10:00").is_err());
    }

    #[test]
    fn test_pending_window_truncation() {
        // 10:41 and 10:43 fall in the same 10-minute window; 10:51 does not.
        let base = slice_start("2026-08-27 10:41").unwrap();
        assert_eq!(pending_window(base), pending_window(base + 120));
        assert_ne!(pending_window(base), pending_window(base + 600));
        assert!(pending_window(base).starts_with("pending_2026-08-27 10:4_"));
        assert!(pending_window(base).ends_with("2026-08-27 10:5"));
    }

    #[test]
    fn test_pending_member_format() {
        assert_eq!(pending_member("def-1", 123456789), "def-1_123456789");
    }

    #[test]
    fn test_shard_for_is_deterministic() {
        let a = shard_for("timer-abc", 8);
        let b = shard_for("timer-abc", 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn test_shard_for_spreads() {
        use std::collections::HashSet;
        let shards: HashSet<u32> = (0..100).map(|i| shard_for(&format!("def-{}", i), 8)).collect();
        assert!(shards.len() > 1);
    }

    #[test]
    fn test_claim_absent_entry() {
        let decision = evaluate_claim(None, 1000);
        assert_eq!(decision, ClaimDecision::Write("1040".to_string()));
    }

    #[test]
    fn test_claim_already_done() {
        assert_eq!(
            evaluate_claim(Some(SUCCESS_SENTINEL), 1000),
            ClaimDecision::AlreadyDone
        );
    }

    #[test]
    fn test_claim_held_by_live_peer() {
        assert_eq!(
            evaluate_claim(Some("1030"), 1000),
            ClaimDecision::HeldByPeer
        );
    }

    #[test]
    fn test_claim_reclaims_expired_peer() {
        // Peer self-timeout elapsed: exactly one re-claim wins.
        assert_eq!(
            evaluate_claim(Some("990"), 1000),
            ClaimDecision::Write("1040".to_string())
        );
        assert_eq!(
            evaluate_claim(Some("1000"), 1000),
            ClaimDecision::Write("1040".to_string())
        );
    }

    #[test]
    fn test_claim_reclaims_garbage_value() {
        assert!(matches!(
            evaluate_claim(Some("not-a-number"), 1000),
            ClaimDecision::Write(_)
        ));
    }
}
