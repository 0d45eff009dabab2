//! Channel and participant identifiers.

use chrono::{DateTime, Utc};
use livecast_ipc::Actor;
use url::Url;
use uuid::Uuid;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const UID_MASK: u32 = 0x7fff_ffff;
const RECORDER_BIT: u32 = 0x4000_0000;

/// Channel name for a broadcast started by `actor` at `started_at`.
pub fn channel_id(actor: &Actor, started_at: DateTime<Utc>) -> String {
    let prefix: String = actor
        .user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("live_{}_{}", prefix, started_at.timestamp_millis())
}

/// Stable non-zero 31-bit transport id derived from a user id.
pub fn host_uid(user_id: &str) -> u32 {
    let hash = user_id
        .bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ u32::from(b)).wrapping_mul(FNV_PRIME));
    match hash & UID_MASK {
        0 => 1,
        uid => uid,
    }
}

/// Transport id reserved for a recording participant of a host.
pub fn recorder_uid(host_uid: u32) -> u32 {
    match host_uid ^ RECORDER_BIT {
        0 => RECORDER_BIT >> 1,
        uid => uid,
    }
}

/// Random non-zero 31-bit transport id for a viewer, distinct from the
/// reserved ids.
pub fn audience_uid(reserved: &[u32]) -> u32 {
    loop {
        let bytes = Uuid::new_v4().into_bytes();
        let uid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & UID_MASK;
        if uid != 0 && !reserved.contains(&uid) {
            return uid;
        }
    }
}

/// Shareable page URL for a channel.
pub fn share_url(base: &Url, channel: &str) -> Result<Url, url::ParseError> {
    base.join(&format!("/live/{}", channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn channel_uses_sanitized_prefix_and_millis() {
        let actor = Actor::new("did:privy:ab-cd_ef1234567");
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        assert_eq!(channel_id(&actor, at), "live_didprivy_1700000000123");
    }

    #[test]
    fn host_uid_is_stable_and_31_bit() {
        let uid = host_uid("user-1");
        assert_eq!(uid, host_uid("user-1"));
        assert_ne!(uid, host_uid("user-2"));
        assert!(uid > 0 && uid <= UID_MASK);
        assert!(host_uid("") > 0);
    }

    #[test]
    fn recorder_and_audience_ids_avoid_host() {
        let host = host_uid("user-1");
        let recorder = recorder_uid(host);
        assert_ne!(recorder, host);
        assert_ne!(recorder, 0);

        for _ in 0..100 {
            let viewer = audience_uid(&[host, recorder]);
            assert!(viewer != 0 && viewer != host && viewer != recorder);
        }
    }

    #[test]
    fn share_url_replaces_path() {
        let base = Url::parse("https://app.example.com/feed?tab=1").unwrap();
        assert_eq!(
            share_url(&base, "live_abc_1").unwrap().as_str(),
            "https://app.example.com/live/live_abc_1"
        );
    }
}
