//! The two hooks the storage stack calls back into around a VBD unplug
//! (spec §4.7): `pre_deactivate_hook` blocks the unplug until a mirror has
//! drained its outstanding requests, and `post_detach_hook` lets the
//! caller return immediately while finalization keeps running in the
//! background. Neither hook ever throws — a storage stack calling these
//! back expects them to run to completion and record failure in the
//! registry rather than propagate an error up through an unplug.

use crate::mirror_engine::MirrorEngine;
use crate::registry::PersistentStateRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sxm_common::{Error, Result, SrId, TapDiskHandle, TapDiskStats, VdiId};
use tracing::{debug, warn};

/// Reads a tapdisk's live stats off its local control channel. Kept
/// separate from [`crate::storage_api::StorageApi`] because these stats
/// never cross the network — they're read from whichever tapdisk process
/// this host itself is running (spec §4.7, §6.6).
#[async_trait]
pub trait TapStatsReader: Send + Sync {
    async fn read_stats(&self, tapdev: &TapDiskHandle) -> Result<TapDiskStats>;
}

/// Reads `/var/run/blktap-control/stats{pid}`, the conventional path a
/// tapdisk publishes its own status to (same naming convention as the
/// `nbdclient{pid}` control socket used for fd handoff).
pub struct LocalTapStatsReader;

#[async_trait]
impl TapStatsReader for LocalTapStatsReader {
    async fn read_stats(&self, tapdev: &TapDiskHandle) -> Result<TapDiskStats> {
        let path = format!("/var/run/blktap-control/stats{}", tapdev.pid);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Internal(format!("failed to read tapdisk stats {path}: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Internal(format!("malformed tapdisk stats {path}: {e}")))
    }
}

pub struct Hooks {
    registry: Arc<PersistentStateRegistry>,
    stats_reader: Arc<dyn TapStatsReader>,
    poll_interval: Duration,
    drain_timeout: Duration,
    mirror_engine: Arc<MirrorEngine>,
}

impl Hooks {
    pub fn new(
        registry: Arc<PersistentStateRegistry>,
        stats_reader: Arc<dyn TapStatsReader>,
        poll_interval: Duration,
        drain_timeout: Duration,
        mirror_engine: Arc<MirrorEngine>,
    ) -> Self {
        Self {
            registry,
            stats_reader,
            poll_interval,
            drain_timeout,
            mirror_engine,
        }
    }

    /// Block until `sr`/`vdi`'s mirror (if any) has no outstanding
    /// requests, or `drain_timeout` elapses — whichever comes first (spec
    /// §4.7). A VDI with no active mirror drains instantly. Never throws:
    /// any failure along the way (an unreadable stats file, the mirror
    /// itself reporting `nbd_mirror_failed`, or a drain timeout) marks the
    /// mirror `failed` in the registry and returns, so the caller can
    /// proceed with the deactivate regardless.
    pub async fn pre_deactivate_hook(&self, sr: &SrId, vdi: &VdiId) {
        let Some(send_state) = self.registry.find_active_local_mirror(sr, vdi).await else {
            return;
        };
        let Some(tapdev) = send_state.tapdev else {
            return;
        };

        let started = Instant::now();
        loop {
            let stats = match self.stats_reader.read_stats(&tapdev).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(sr = %sr, vdi = %vdi, error = %e, "failed to read tapdisk stats while draining, marking mirror failed");
                    self.mark_failed(sr, vdi).await;
                    return;
                }
            };
            if stats.nbd_mirror_failed {
                warn!(sr = %sr, vdi = %vdi, "mirror failed while draining, deactivating anyway");
                self.mark_failed(sr, vdi).await;
                return;
            }
            if stats.reqs_outstanding == 0 {
                debug!(sr = %sr, vdi = %vdi, "mirror drained");
                return;
            }
            if started.elapsed() >= self.drain_timeout {
                warn!(sr = %sr, vdi = %vdi, "drain timed out with requests still outstanding");
                self.mark_failed(sr, vdi).await;
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn mark_failed(&self, sr: &SrId, vdi: &VdiId) {
        let Some(mut send_state) = self.registry.find_active_local_mirror(sr, vdi).await else {
            return;
        };
        send_state.failed = true;
        if let Err(e) = self.registry.add_send(send_state).await {
            warn!(sr = %sr, vdi = %vdi, error = %e, "failed to persist failed mirror state");
        }
    }

    /// Finalize `sr`/`vdi`'s mirror in the background and return
    /// immediately (spec §4.7). Called once a detach has actually
    /// completed — i.e. once the VM has migrated off this host — which is
    /// the only point at which `receive_finalize` is safe to run.
    pub async fn post_detach_hook(&self, sr: &SrId, vdi: &VdiId) {
        self.mirror_engine.finalize_after_detach(sr, vdi).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy_engine::{ExternalSparseDd, SparseDd};
    use crate::scheduler::TokioScheduler;
    use crate::storage_api::{StorageApi, VhdMirror};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use sxm_common::{AttachInfo, DpId, VdiInfo};
    use tempfile::tempdir;

    struct ScriptedStatsReader {
        responses: StdMutex<Vec<TapDiskStats>>,
    }

    #[async_trait]
    impl TapStatsReader for ScriptedStatsReader {
        async fn read_stats(&self, _tapdev: &TapDiskHandle) -> Result<TapDiskStats> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }
    }

    struct FailingStatsReader;

    #[async_trait]
    impl TapStatsReader for FailingStatsReader {
        async fn read_stats(&self, _tapdev: &TapDiskHandle) -> Result<TapDiskStats> {
            Err(Error::Internal("simulated stats read failure".to_string()))
        }
    }

    /// Never actually invoked by the tests below — `finalize_after_detach`
    /// only touches the registry and a remote client it builds itself.
    struct UnusedApi;

    #[async_trait]
    impl StorageApi for UnusedApi {
        async fn sr_scan(&self, _sr: &SrId) -> Result<Vec<VdiInfo>> {
            unimplemented!()
        }
        async fn sr_scan2(&self, _sr: &SrId) -> Result<Vec<VdiInfo>> {
            unimplemented!()
        }
        async fn sr_update_snapshot_info_dest(
            &self,
            _sr: &SrId,
            _vdi: &VdiId,
            _src_vdi_info: &VdiInfo,
            _snapshot_pairs: &[(VdiId, VdiId)],
        ) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_create(&self, _sr: &SrId, _template: &VdiInfo) -> Result<VdiInfo> {
            unimplemented!()
        }
        async fn vdi_clone(&self, _sr: &SrId, _vdi: &VdiId) -> Result<VdiInfo> {
            unimplemented!()
        }
        async fn vdi_snapshot(&self, _sr: &SrId, _vdi: &VdiId) -> Result<VdiInfo> {
            unimplemented!()
        }
        async fn vdi_snapshot_with_sm_config(
            &self,
            _sr: &SrId,
            _vdi: &VdiId,
            _sm_config: &BTreeMap<String, String>,
        ) -> Result<VdiInfo> {
            unimplemented!()
        }
        async fn vdi_destroy(&self, _sr: &SrId, _vdi: &VdiId) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_resize(&self, _sr: &SrId, _vdi: &VdiId, _new_size: u64) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_attach3(
            &self,
            _dp: &DpId,
            _sr: &SrId,
            _vdi: &VdiId,
            _vm: &str,
            _read_write: bool,
        ) -> Result<AttachInfo> {
            unimplemented!()
        }
        async fn vdi_activate3(&self, _dp: &DpId, _sr: &SrId, _vdi: &VdiId, _vm: &str) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_deactivate(&self, _dp: &DpId, _sr: &SrId, _vdi: &VdiId) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_detach(&self, _dp: &DpId, _sr: &SrId, _vdi: &VdiId) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_set_content_id(&self, _sr: &SrId, _vdi: &VdiId, _content_id: &str) -> Result<()> {
            unimplemented!()
        }
        async fn vdi_similar_content(&self, _sr: &SrId, _vdi: &VdiId) -> Result<Vec<VdiInfo>> {
            unimplemented!()
        }
        async fn vdi_compose(&self, _sr: &SrId, _mirror_vdi: &VdiId, _copy_diffs_to: &VdiId) -> Result<()> {
            unimplemented!()
        }
        async fn dp_create(&self, _sr: &SrId, _vdi: &VdiId) -> Result<DpId> {
            unimplemented!()
        }
        async fn dp_attach_info(&self, _dp: &DpId) -> Result<AttachInfo> {
            unimplemented!()
        }
        async fn dp_destroy(&self, _dbg: &str, _dp: &DpId, _allow_leak: bool) -> Result<()> {
            unimplemented!()
        }
        async fn mirror_receive_start2(
            &self,
            _sr: &SrId,
            _vdi_info: &VdiInfo,
            _id: &str,
            _similar: &[String],
            _vm: &str,
        ) -> Result<VhdMirror> {
            unimplemented!()
        }
        async fn mirror_receive_cancel(&self, _id: &str) -> Result<()> {
            unimplemented!()
        }
        async fn mirror_receive_finalize(&self, _id: &str) -> Result<()> {
            unimplemented!()
        }
        async fn mirror_import_activate(&self, _id: &str) -> Result<String> {
            unimplemented!()
        }
        async fn mirror_stop(&self, _id: &str) -> Result<()> {
            unimplemented!()
        }
    }

    fn test_mirror_engine(registry: Arc<PersistentStateRegistry>) -> Arc<MirrorEngine> {
        let local_api: Arc<dyn StorageApi> = Arc::new(UnusedApi);
        let scheduler = Arc::new(TokioScheduler::new());
        let sparse_dd: Arc<dyn SparseDd> = Arc::new(ExternalSparseDd {
            binary_path: "/bin/true".into(),
        });
        Arc::new(MirrorEngine::new(
            local_api,
            registry,
            scheduler,
            Duration::from_secs(5),
            sparse_dd,
        ))
    }

    #[tokio::test]
    async fn no_active_mirror_drains_instantly() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(PersistentStateRegistry::new(dir.path()));
        let reader = Arc::new(ScriptedStatsReader {
            responses: StdMutex::new(vec![TapDiskStats {
                reqs_outstanding: 5,
                nbd_mirror_failed: false,
            }]),
        });
        let mirror_engine = test_mirror_engine(registry.clone());
        let hooks = Hooks::new(
            registry,
            reader,
            Duration::from_millis(5),
            Duration::from_secs(1),
            mirror_engine,
        );

        // No active mirror for this sr/vdi: must return immediately without panicking.
        hooks
            .pre_deactivate_hook(&"sr-1".to_string(), &"vdi-1".to_string())
            .await;
    }

    #[tokio::test]
    async fn stats_read_failure_marks_mirror_failed() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(PersistentStateRegistry::new(dir.path()));
        registry
            .add_send(crate::registry::records::SendState {
                id: "sr-1/vdi-1".to_string(),
                sr: "sr-1".to_string(),
                vdi: "vdi-1".to_string(),
                vm: "vm-1".to_string(),
                dest_sr: "sr-2".to_string(),
                remote_url: "http://127.0.0.1:1".to_string(),
                verify_dest: false,
                remote_dp: "dp-1".to_string(),
                remote_mirror_vdi: "mirror-1".to_string(),
                remote_info: None,
                local_dp: "dp-local".to_string(),
                tapdev: Some(TapDiskHandle { pid: 1, minor: 0 }),
                failed: false,
                watchdog: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let reader = Arc::new(FailingStatsReader);
        let mirror_engine = test_mirror_engine(registry.clone());
        let hooks = Hooks::new(
            registry.clone(),
            reader,
            Duration::from_millis(5),
            Duration::from_secs(1),
            mirror_engine,
        );

        hooks
            .pre_deactivate_hook(&"sr-1".to_string(), &"vdi-1".to_string())
            .await;

        let state = registry.find_send("sr-1/vdi-1").await.unwrap();
        assert!(state.failed);
    }

    #[tokio::test]
    async fn post_detach_hook_removes_registry_row_despite_unreachable_remote() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(PersistentStateRegistry::new(dir.path()));
        registry
            .add_send(crate::registry::records::SendState {
                id: "sr-1/vdi-1".to_string(),
                sr: "sr-1".to_string(),
                vdi: "vdi-1".to_string(),
                vm: "vm-1".to_string(),
                dest_sr: "sr-2".to_string(),
                remote_url: "http://127.0.0.1:1".to_string(),
                verify_dest: false,
                remote_dp: "dp-1".to_string(),
                remote_mirror_vdi: "mirror-1".to_string(),
                remote_info: None,
                local_dp: "dp-local".to_string(),
                tapdev: None,
                failed: false,
                watchdog: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let mirror_engine = test_mirror_engine(registry.clone());
        let hooks = Hooks::new(
            registry.clone(),
            Arc::new(LocalTapStatsReader),
            Duration::from_millis(5),
            Duration::from_secs(1),
            mirror_engine,
        );

        hooks
            .post_detach_hook(&"sr-1".to_string(), &"vdi-1".to_string())
            .await;

        assert!(registry.find_send("sr-1/vdi-1").await.is_none());
    }
}
