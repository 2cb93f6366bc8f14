//! The three record shapes the persistent registry stores (spec §3.2,
//! §6.1): one row per in-flight send-side mirror, receive-side mirror, and
//! standalone copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sxm_common::{DpId, SrId, TapDiskHandle, VdiId};

/// What the destination's `DATA.MIRROR.receive_start2` handed back,
/// persisted alongside the send-side row so a restart can pick the
/// compose step back up (spec §6.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMirrorInfo {
    pub copy_diffs_from: Option<String>,
    pub copy_diffs_to: VdiId,
    pub dummy_vdi: VdiId,
}

/// One row of the send-side table: a mirror this host is driving, writing
/// to a destination host (spec §3.2, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendState {
    /// `sxm_common::ids::mirror_id_of(sr, vdi)`.
    pub id: String,
    pub sr: SrId,
    pub vdi: VdiId,
    pub vm: String,
    pub dest_sr: SrId,
    pub remote_url: String,
    #[serde(default)]
    pub verify_dest: bool,
    pub remote_dp: DpId,
    pub remote_mirror_vdi: VdiId,
    #[serde(default)]
    pub remote_info: Option<RemoteMirrorInfo>,
    pub local_dp: DpId,
    #[serde(default)]
    pub tapdev: Option<TapDiskHandle>,
    #[serde(default)]
    pub failed: bool,
    /// The `ScheduledHandle::id()` of the armed watchdog timer, if one is
    /// currently pending (spec §4.5.3).
    #[serde(default)]
    pub watchdog: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// One row of the receive-side table: a mirror this host is the
/// destination for (spec §3.2, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveState {
    /// `sxm_common::ids::mirror_id_of(sr, vdi)`, matching the sender's id.
    pub id: String,
    pub sr: SrId,
    pub vdi: VdiId,
    pub vm: String,
    pub mirror_vdi: VdiId,
    pub mirror_dp: DpId,
    pub copy_diffs_from: Option<String>,
    pub copy_diffs_to: VdiId,
    pub dummy_vdi: VdiId,
    #[serde(default)]
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

/// One row of the standalone-copy table (spec §3.2, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyState {
    /// `sxm_common::ids::copy_id_of(dest_sr, dest_vdi)`.
    pub id: String,
    pub dest_sr: SrId,
    pub dest_vdi: VdiId,
    pub source_sr: SrId,
    pub source_vdi: VdiId,
    #[serde(default)]
    pub base_vdi: Option<VdiId>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_state_round_trips_through_json() {
        let state = SendState {
            id: "sr-1/vdi-1".to_string(),
            sr: "sr-1".to_string(),
            vdi: "vdi-1".to_string(),
            vm: "vm-1".to_string(),
            dest_sr: "sr-2".to_string(),
            remote_url: "https://dest-host".to_string(),
            verify_dest: false,
            remote_dp: "dp-1".to_string(),
            remote_mirror_vdi: "vdi-mirror-1".to_string(),
            remote_info: None,
            local_dp: "dp-local-1".to_string(),
            tapdev: None,
            failed: false,
            watchdog: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: SendState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, state.id);
        assert!(!back.failed);
    }

    #[test]
    fn send_state_defaults_absent_fields() {
        let minimal = serde_json::json!({
            "id": "sr-1/vdi-1",
            "sr": "sr-1",
            "vdi": "vdi-1",
            "vm": "vm-1",
            "dest_sr": "sr-2",
            "remote_url": "https://dest-host",
            "remote_dp": "dp-1",
            "remote_mirror_vdi": "vdi-mirror-1",
            "local_dp": "dp-local-1",
            "created_at": Utc::now().to_rfc3339(),
        });
        let state: SendState = serde_json::from_value(minimal).unwrap();
        assert!(!state.verify_dest);
        assert!(state.remote_info.is_none());
        assert!(state.tapdev.is_none());
        assert!(!state.failed);
        assert!(state.watchdog.is_none());
    }
}
