//! Shared types and the error taxonomy for the SXM storage-migration coordinator.
//!
//! This crate carries no I/O and no async runtime dependency: it is the
//! vocabulary that both the coordinator engine and (eventually) any other
//! client of it share, the same way `horcrux-common` is the vocabulary
//! shared between the API service and its clients.

pub mod ids;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The coordinator's error taxonomy (spec §7).
///
/// Every fallible boundary (RPC, filesystem, JSON) is mapped into one of
/// these variants at the call site rather than propagated as a foreign
/// error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("not attached: {0}")]
    Unattached(String),

    #[error("backend error {code}: {message}")]
    Backend {
        code: String,
        params: Vec<String>,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("{kind} does not exist: {id}")]
    DoesNotExist { kind: &'static str, id: String },

    #[error("resource closed")]
    ResourceClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn does_not_exist(kind: &'static str, id: impl Into<String>) -> Self {
        Error::DoesNotExist {
            kind,
            id: id.into(),
        }
    }

    pub fn backend(
        code: impl Into<String>,
        params: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Backend {
            code: code.into(),
            params,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A storage repository identifier, as addressed by the storage API.
pub type SrId = String;
/// A virtual disk image identifier within an SR.
pub type VdiId = String;
/// A data-path name reserving a VDI for a consumer.
pub type DpId = String;

/// Information about a VDI as reported by `VDI.create`/`SR.scan` and friends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VdiInfo {
    pub uuid: VdiId,
    pub sr: SrId,
    pub virtual_size: u64,
    pub physical_utilisation: u64,
    /// Opaque tag used for incremental-base selection (§4.4.1).
    pub content_id: Option<String>,
    #[serde(default)]
    pub sm_config: BTreeMap<String, String>,
    #[serde(default)]
    pub is_a_snapshot: bool,
    #[serde(default)]
    pub snapshot_of: Option<VdiId>,
    /// `cbt_metadata` VDIs are filtered out of scans before similarity
    /// search or destination selection (§4.4.2, §4.6).
    #[serde(default)]
    pub cbt_metadata: bool,
}

/// A tap-disk process address: PID plus minor device number (§3.2, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapDiskHandle {
    pub pid: u32,
    pub minor: u32,
}

/// How an attached VDI's backing storage is exposed to the host, resolved
/// in the order the spec lists them (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachBackend {
    File { path: PathBuf },
    BlockDevice { path: PathBuf },
    Nbd { uri: String },
}

/// Result of `VDI.attach3`/`DP.attach_info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachInfo {
    pub backend: AttachBackend,
}

/// Tap-disk reqs/mirror stats, as read by the watchdog and drain hook.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TapDiskStats {
    pub reqs_outstanding: u64,
    pub nbd_mirror_failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_exist_carries_kind_and_id() {
        let err = Error::does_not_exist("mirror", "s1/v1");
        assert_eq!(err.to_string(), "mirror does not exist: s1/v1");
    }

    #[test]
    fn vdi_info_round_trips_through_json() {
        let info = VdiInfo {
            uuid: "v1".into(),
            sr: "s1".into(),
            virtual_size: 1024,
            physical_utilisation: 512,
            content_id: Some("c1".into()),
            sm_config: BTreeMap::new(),
            is_a_snapshot: false,
            snapshot_of: None,
            cbt_metadata: false,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: VdiInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
