//! Keyspace commands: GET, SET, DEL, EXPIRE, TTL/PTTL, KEYS.
//!
//! Everything here runs on the synchronizer's worker with exclusive access
//! to the store. Expiry times are resolved against the store's clock at
//! execution time, not when the command was built.

use crate::commands::CommandError;
use crate::protocol::RespValue;
use crate::storage::clock::to_unix_millis;
use crate::storage::{SetExpiry, Store};
use bytes::Bytes;
use glob_match::glob_match;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The NX / XX part of SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// NX: only if the key does not exist
    IfMissing,
    /// XX: only if the key exists
    IfExists,
}

/// The EX / PX / KEEPTTL part of SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetTtl {
    /// No flag: any previous expiry is dropped
    #[default]
    Clear,
    Seconds(u64),
    Millis(u64),
    Keep,
}

/// Validated arguments of `SET`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetArgs {
    pub key: Bytes,
    pub value: Bytes,
    pub condition: SetCondition,
    pub ttl: SetTtl,
}

/// Flags of `EXPIRE`. Several may be combined as long as they are compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpireFlags {
    pub nx: bool,
    pub xx: bool,
    pub gt: bool,
    pub lt: bool,
}

impl ExpireFlags {
    /// Whether a key with `current` expiry may be given `target`.
    ///
    /// A key without an expiry counts as never expiring, so GT never
    /// applies to it and LT always does.
    fn allows(&self, current: Option<SystemTime>, target: SystemTime) -> bool {
        (!self.nx || current.is_none())
            && (!self.xx || current.is_some())
            && (!self.gt || current.is_some_and(|at| target > at))
            && (!self.lt || current.map_or(true, |at| target < at))
    }
}

/// Unit of the TTL reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Seconds,
    Millis,
}

pub(crate) fn get(store: &mut Store, key: &[u8]) -> RespValue {
    match store.get(key) {
        Some(value) => RespValue::bulk_string(value),
        None => RespValue::null(),
    }
}

pub(crate) fn set(store: &mut Store, args: SetArgs) -> RespValue {
    let exists = store.contains(&args.key);
    let allowed = match args.condition {
        SetCondition::Always => true,
        SetCondition::IfMissing => !exists,
        SetCondition::IfExists => exists,
    };
    if !allowed {
        return RespValue::null();
    }

    let now = store.now();
    let expiry = match args.ttl {
        SetTtl::Clear => SetExpiry::Clear,
        SetTtl::Keep => SetExpiry::Keep,
        SetTtl::Seconds(secs) => match i64::try_from(secs).ok().and_then(|s| s.checked_mul(1000)) {
            Some(ms) => match deadline(now, ms) {
                Some(at) => SetExpiry::At(at),
                None => return CommandError::InvalidExpireTime("set").into(),
            },
            None => return CommandError::InvalidExpireTime("set").into(),
        },
        SetTtl::Millis(ms) => match i64::try_from(ms).ok().and_then(|ms| deadline(now, ms)) {
            Some(at) => SetExpiry::At(at),
            None => return CommandError::InvalidExpireTime("set").into(),
        },
    };

    store.set(args.key, args.value, expiry);
    RespValue::ok()
}

pub(crate) fn del(store: &mut Store, keys: &[Bytes]) -> RespValue {
    let removed = keys.iter().filter(|key| store.remove(key)).count();
    RespValue::integer(removed as i64)
}

pub(crate) fn expire(store: &mut Store, key: &[u8], seconds: i64, flags: ExpireFlags) -> RespValue {
    let current = match store.expiry(key) {
        Some(current) => current,
        None => return RespValue::integer(0),
    };

    let now = store.now();
    let target = match seconds.checked_mul(1000).and_then(|ms| deadline(now, ms)) {
        Some(target) => target,
        None => return CommandError::InvalidExpireTime("expire").into(),
    };

    if !flags.allows(current, target) {
        return RespValue::integer(0);
    }

    if target <= now {
        store.remove(key);
    } else {
        store.set_expiry(key, Some(target));
    }
    RespValue::integer(1)
}

/// `now + offset_ms`, or `None` when the absolute time in milliseconds
/// would overflow an `i64`. Deadlines before the epoch clamp to it.
fn deadline(now: SystemTime, offset_ms: i64) -> Option<SystemTime> {
    let now_ms = i64::try_from(to_unix_millis(now)).ok()?;
    now_ms.checked_add(offset_ms)?;
    if offset_ms >= 0 {
        now.checked_add(Duration::from_millis(offset_ms.unsigned_abs()))
    } else {
        Some(
            now.checked_sub(Duration::from_millis(offset_ms.unsigned_abs()))
                .unwrap_or(UNIX_EPOCH),
        )
    }
}

pub(crate) fn ttl(store: &mut Store, key: &[u8], unit: TtlUnit) -> RespValue {
    let remaining = match store.time_to_live(key) {
        None => return RespValue::integer(-2),
        Some(None) => return RespValue::integer(-1),
        Some(Some(remaining)) => remaining,
    };

    let millis = i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX);
    match unit {
        TtlUnit::Millis => RespValue::integer(millis),
        TtlUnit::Seconds => RespValue::integer(millis.saturating_add(500) / 1000),
    }
}

pub(crate) fn keys(store: &Store, pattern: &str) -> RespValue {
    let mut matched: Vec<Bytes> = store
        .keys()
        .into_iter()
        .filter(|key| glob_match(pattern, &String::from_utf8_lossy(key)))
        .collect();
    matched.sort();

    RespValue::array(matched.into_iter().map(RespValue::bulk_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Clock, ManualClock};
    use std::sync::Arc;

    fn store() -> (Store, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (Store::new(clock.clone()), clock)
    }

    fn set_args(key: &str, value: &str) -> SetArgs {
        SetArgs {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            condition: SetCondition::Always,
            ttl: SetTtl::Clear,
        }
    }

    #[test]
    fn test_set_get() {
        let (mut store, _) = store();

        assert_eq!(set(&mut store, set_args("key", "value")), RespValue::ok());
        assert_eq!(get(&mut store, b"key"), RespValue::bulk_string("value"));
        assert_eq!(get(&mut store, b"nonexistent"), RespValue::null());
    }

    #[test]
    fn test_set_conditions() {
        let (mut store, _) = store();

        let nx = SetArgs {
            condition: SetCondition::IfMissing,
            ..set_args("key", "first")
        };
        assert_eq!(set(&mut store, nx.clone()), RespValue::ok());
        assert_eq!(set(&mut store, nx), RespValue::null());
        assert_eq!(get(&mut store, b"key"), RespValue::bulk_string("first"));

        let xx = SetArgs {
            condition: SetCondition::IfExists,
            ..set_args("other", "value")
        };
        assert_eq!(set(&mut store, xx), RespValue::null());
        assert_eq!(get(&mut store, b"other"), RespValue::null());
    }

    #[test]
    fn test_set_px_expires() {
        let (mut store, clock) = store();

        let args = SetArgs {
            ttl: SetTtl::Millis(10),
            ..set_args("k", "v")
        };
        set(&mut store, args);

        clock.advance(Duration::from_millis(5));
        assert_eq!(get(&mut store, b"k"), RespValue::bulk_string("v"));

        clock.advance(Duration::from_millis(6));
        assert_eq!(get(&mut store, b"k"), RespValue::null());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_set_rejects_expire_overflow() {
        let (mut store, _) = store();

        let args = SetArgs {
            ttl: SetTtl::Seconds(9_000_000_000_000_000),
            ..set_args("k", "v")
        };
        assert_eq!(
            set(&mut store, args),
            RespValue::error("ERR invalid expire time in 'set' command")
        );
        assert!(!store.contains(b"k"));

        let args = SetArgs {
            ttl: SetTtl::Millis(i64::MAX as u64),
            ..set_args("k", "v")
        };
        assert_eq!(
            set(&mut store, args),
            RespValue::error("ERR invalid expire time in 'set' command")
        );
        assert!(!store.contains(b"k"));
    }

    #[test]
    fn test_expire_rejects_overflow() {
        let (mut store, _) = store();
        set(&mut store, set_args("k", "v"));

        assert_eq!(
            expire(&mut store, b"k", 9_000_000_000_000_000, ExpireFlags::default()),
            RespValue::error("ERR invalid expire time in 'expire' command")
        );
        assert_eq!(
            expire(&mut store, b"k", i64::MIN, ExpireFlags::default()),
            RespValue::error("ERR invalid expire time in 'expire' command")
        );
        assert_eq!(ttl(&mut store, b"k", TtlUnit::Seconds), RespValue::integer(-1));
    }

    #[test]
    fn test_set_keepttl() {
        let (mut store, clock) = store();

        set(
            &mut store,
            SetArgs {
                ttl: SetTtl::Seconds(100),
                ..set_args("k", "v1")
            },
        );
        set(
            &mut store,
            SetArgs {
                ttl: SetTtl::Keep,
                ..set_args("k", "v2")
            },
        );
        assert_eq!(
            store.expiry(b"k"),
            Some(Some(clock.now() + Duration::from_secs(100)))
        );

        set(&mut store, set_args("k", "v3"));
        assert_eq!(store.expiry(b"k"), Some(None));
    }

    #[test]
    fn test_del_counts_live_keys() {
        let (mut store, clock) = store();

        set(&mut store, set_args("key1", "value1"));
        set(&mut store, set_args("key2", "value2"));
        set(
            &mut store,
            SetArgs {
                ttl: SetTtl::Millis(1),
                ..set_args("gone", "x")
            },
        );
        clock.advance(Duration::from_millis(2));

        let keys = [
            Bytes::from("key1"),
            Bytes::from("key2"),
            Bytes::from("key3"),
            Bytes::from("gone"),
        ];
        assert_eq!(del(&mut store, &keys), RespValue::integer(2));
    }

    #[test]
    fn test_expire_and_ttl() {
        let (mut store, _) = store();
        set(&mut store, set_args("key", "value"));

        assert_eq!(ttl(&mut store, b"key", TtlUnit::Seconds), RespValue::integer(-1));
        assert_eq!(ttl(&mut store, b"missing", TtlUnit::Seconds), RespValue::integer(-2));

        assert_eq!(
            expire(&mut store, b"key", 100, ExpireFlags::default()),
            RespValue::integer(1)
        );
        assert_eq!(ttl(&mut store, b"key", TtlUnit::Seconds), RespValue::integer(100));
        assert_eq!(
            ttl(&mut store, b"key", TtlUnit::Millis),
            RespValue::integer(100_000)
        );

        assert_eq!(
            expire(&mut store, b"missing", 100, ExpireFlags::default()),
            RespValue::integer(0)
        );
    }

    #[test]
    fn test_expire_non_positive_deletes() {
        let (mut store, _) = store();
        set(&mut store, set_args("key", "value"));

        assert_eq!(
            expire(&mut store, b"key", 0, ExpireFlags::default()),
            RespValue::integer(1)
        );
        assert_eq!(get(&mut store, b"key"), RespValue::null());

        set(&mut store, set_args("key", "value"));
        assert_eq!(
            expire(&mut store, b"key", -10, ExpireFlags::default()),
            RespValue::integer(1)
        );
        assert!(!store.contains(b"key"));
    }

    #[test]
    fn test_expire_flags() {
        let (mut store, _) = store();
        set(&mut store, set_args("key", "value"));

        let nx = ExpireFlags { nx: true, ..Default::default() };
        let xx = ExpireFlags { xx: true, ..Default::default() };
        let gt = ExpireFlags { gt: true, ..Default::default() };
        let lt = ExpireFlags { lt: true, ..Default::default() };

        // Persistent key
        assert_eq!(expire(&mut store, b"key", 100, xx), RespValue::integer(0));
        assert_eq!(expire(&mut store, b"key", 100, gt), RespValue::integer(0));
        assert_eq!(expire(&mut store, b"key", 100, nx), RespValue::integer(1));

        // Volatile key, 100s left
        assert_eq!(expire(&mut store, b"key", 50, nx), RespValue::integer(0));
        assert_eq!(expire(&mut store, b"key", 50, gt), RespValue::integer(0));
        assert_eq!(expire(&mut store, b"key", 200, gt), RespValue::integer(1));
        assert_eq!(expire(&mut store, b"key", 300, lt), RespValue::integer(0));
        assert_eq!(expire(&mut store, b"key", 50, lt), RespValue::integer(1));
        assert_eq!(ttl(&mut store, b"key", TtlUnit::Seconds), RespValue::integer(50));
    }

    #[test]
    fn test_expire_lt_on_persistent_key() {
        let (mut store, _) = store();
        set(&mut store, set_args("key", "value"));

        let lt = ExpireFlags { lt: true, ..Default::default() };
        assert_eq!(expire(&mut store, b"key", 10, lt), RespValue::integer(1));
        assert_eq!(ttl(&mut store, b"key", TtlUnit::Seconds), RespValue::integer(10));
    }

    #[test]
    fn test_keys_pattern() {
        let (mut store, _) = store();
        for key in ["user:1", "user:2", "session:1"] {
            set(&mut store, set_args(key, "x"));
        }

        assert_eq!(
            keys(&store, "user:*"),
            RespValue::array(vec![
                RespValue::bulk_string("user:1"),
                RespValue::bulk_string("user:2"),
            ])
        );
        assert_eq!(keys(&store, "*").as_array().map(|a| a.len()), Some(3));
        assert_eq!(keys(&store, "nomatch*"), RespValue::array(vec![]));
    }
}
