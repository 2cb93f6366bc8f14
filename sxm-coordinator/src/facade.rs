//! The coordinator façade (spec §4.8): the one type an embedder actually
//! holds onto. `start`/`copy` are long-running, so each returns a
//! `JoinHandle` for a task already running in the background; `stop`,
//! `stat`, `list`, and the two unplug hooks are quick enough to just await
//! directly.

use crate::config::CoordinatorConfig;
use crate::copy_engine::{self, ProgressCallback, SparseDd};
use crate::hooks::{Hooks, LocalTapStatsReader};
use crate::mirror_engine::MirrorEngine;
use crate::receive_engine::ReceiveEngine;
use crate::registry::PersistentStateRegistry;
use crate::scheduler::Scheduler;
use crate::storage_api::{StorageApi, VhdMirror};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use sxm_common::{Error, Result, SrId, VdiId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// A snapshot of one send-side mirror's state, safe to hand to callers
/// outside this crate (spec §4.8).
#[derive(Debug, Clone)]
pub struct MirrorStatus {
    pub id: String,
    pub sr: SrId,
    pub vdi: VdiId,
    pub dest_sr: SrId,
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

/// The coordinator: owns the persistent registry and the engines built on
/// top of it, and is the single entry point an embedder calls into.
pub struct Coordinator {
    mirror_engine: Arc<MirrorEngine>,
    receive_engine: Arc<ReceiveEngine>,
    hooks: Arc<Hooks>,
    sparse_dd: Arc<dyn SparseDd>,
    registry: Arc<PersistentStateRegistry>,
    local_api: Arc<dyn StorageApi>,
}

impl Coordinator {
    pub fn new(
        config: &CoordinatorConfig,
        local_api: Arc<dyn StorageApi>,
        scheduler: Arc<dyn Scheduler>,
        sparse_dd: Arc<dyn SparseDd>,
    ) -> Self {
        let registry = Arc::new(PersistentStateRegistry::new(&config.persist_root));
        let mirror_engine = Arc::new(MirrorEngine::new(
            local_api.clone(),
            registry.clone(),
            scheduler,
            Duration::from_secs(config.watchdog_interval_secs),
            sparse_dd.clone(),
        ));
        let receive_engine = Arc::new(ReceiveEngine::new(local_api.clone(), registry.clone()));
        let hooks = Arc::new(Hooks::new(
            registry.clone(),
            Arc::new(LocalTapStatsReader),
            Duration::from_secs(config.drain_poll_interval_secs),
            Duration::from_secs(config.drain_timeout_secs),
            mirror_engine.clone(),
        ));

        Self {
            mirror_engine,
            receive_engine,
            hooks,
            sparse_dd,
            registry,
            local_api,
        }
    }

    /// Start establishing a mirror in the background (spec §4.5). The
    /// returned handle resolves once the mirror either reaches Composed or
    /// fails; a failed join (panic) is flattened into `Error::Internal`.
    pub fn start(
        &self,
        sr: SrId,
        vdi: VdiId,
        vm: String,
        dest_sr: SrId,
        remote_api: Arc<dyn StorageApi>,
        remote_url: String,
        verify_dest: bool,
    ) -> JoinHandle<Result<()>> {
        let engine = self.mirror_engine.clone();
        tokio::spawn(async move {
            engine
                .start(&sr, &vdi, &vm, &dest_sr, remote_api, &remote_url, verify_dest)
                .await
        })
    }

    pub async fn stop(&self, sr: &SrId, vdi: &VdiId) -> Result<()> {
        self.mirror_engine.stop(sr, vdi).await
    }

    /// Tear down every in-flight mirror, receive, and copy this host is
    /// tracking, swallowing individual failures along the way, and finish
    /// by wiping the registry outright (spec §9). Copies have no live
    /// cancellation handle reachable from the registry, so they're only
    /// logged here — `clear_all` is what actually drops their rows.
    pub async fn killall(&self) {
        self.mirror_engine.killall().await;

        let receives = self.registry.list_receives().await;
        for receive in receives {
            if let Err(e) = self.receive_engine.receive_cancel(&receive.id).await {
                warn!(id = %receive.id, error = %e, "killall: failed to cancel receive, continuing");
            }
        }

        let copies = self.registry.list_copies().await;
        for copy in copies {
            warn!(id = %copy.id, "killall: abandoning in-flight copy");
        }

        if let Err(e) = self.registry.clear_all().await {
            error!(error = %e, "killall: failed to clear registry");
        }
    }

    pub async fn stat(&self, sr: &SrId, vdi: &VdiId) -> Result<MirrorStatus> {
        let id = sxm_common::ids::mirror_id_of(sr, vdi);
        self.registry
            .find_active_local_mirror(sr, vdi)
            .await
            .map(|s| MirrorStatus {
                id: s.id,
                sr: s.sr,
                vdi: s.vdi,
                dest_sr: s.dest_sr,
                failed: s.failed,
                created_at: s.created_at,
            })
            .ok_or(Error::DoesNotExist { kind: "mirror", id })
    }

    pub async fn list(&self) -> Vec<MirrorStatus> {
        self.registry
            .list_sends()
            .await
            .into_iter()
            .map(|s| MirrorStatus {
                id: s.id,
                sr: s.sr,
                vdi: s.vdi,
                dest_sr: s.dest_sr,
                failed: s.failed,
                created_at: s.created_at,
            })
            .collect()
    }

    /// Block the calling unplug until a mirror on `sr`/`vdi` has drained,
    /// or `drain_timeout` elapses (spec §4.7). Never fails; a drain
    /// failure is recorded in the registry instead.
    pub async fn pre_deactivate_hook(&self, sr: &SrId, vdi: &VdiId) {
        self.hooks.pre_deactivate_hook(sr, vdi).await
    }

    /// Finalize a mirror on `sr`/`vdi` once its VBD has actually detached
    /// (spec §4.7).
    pub async fn post_detach_hook(&self, sr: &SrId, vdi: &VdiId) {
        self.hooks.post_detach_hook(sr, vdi).await
    }

    /// Copy `source_vdi` into an explicit `dest_vdi` on a remote host in
    /// the background (spec §4.4.1). `remote_api`/`remote_url` must
    /// already be bound to that host.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_into_vdi(
        &self,
        source_sr: SrId,
        source_vdi: VdiId,
        dest_sr: SrId,
        dest_vdi: VdiId,
        vm: String,
        remote_api: Arc<dyn StorageApi>,
        remote_url: String,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let local_api = self.local_api.clone();
        let sparse_dd = self.sparse_dd.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            copy_engine::copy_into_vdi(
                local_api,
                remote_api,
                sparse_dd,
                &registry,
                &source_sr,
                &source_vdi,
                &dest_sr,
                &dest_vdi,
                &vm,
                None,
                &remote_url,
                progress,
                cancel,
            )
            .await
        })
    }

    /// Copy `source_vdi` into the best-matching (or newly created) VDI on
    /// a remote SR in the background (spec §4.4.2). `remote_api`/
    /// `remote_url` must already be bound to the destination host.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_into_sr(
        &self,
        source_sr: SrId,
        source_vdi: VdiId,
        dest_sr: SrId,
        vm: String,
        remote_api: Arc<dyn StorageApi>,
        remote_url: String,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<VdiId>> {
        let local_api = self.local_api.clone();
        let sparse_dd = self.sparse_dd.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            copy_engine::copy_into_sr(
                local_api,
                remote_api,
                sparse_dd,
                &registry,
                &source_sr,
                &source_vdi,
                &dest_sr,
                &vm,
                &remote_url,
                progress,
                cancel,
            )
            .await
        })
    }

    /// Called by the destination host's own RPC surface in response to
    /// `DATA.MIRROR.receive_start2` (spec §4.6.1). Synchronous: the caller
    /// is already inside a request handler and needs the `VhdMirror`
    /// result back directly.
    pub async fn receive_start2(
        &self,
        sr: &SrId,
        vdi_info: &sxm_common::VdiInfo,
        id: &str,
        similar: &[String],
        vm: &str,
    ) -> Result<VhdMirror> {
        self.receive_engine
            .receive_start2(sr, vdi_info, id, similar, vm)
            .await
    }

    pub async fn receive_cancel(&self, id: &str) -> Result<()> {
        self.receive_engine.receive_cancel(id).await
    }

    pub async fn receive_finalize(&self, id: &str) -> Result<()> {
        self.receive_engine.receive_finalize(id).await
    }
}

/// Flatten a spawned task's `JoinHandle` into the same `Result` it would
/// have produced if awaited in place — a panic becomes `Error::Internal`
/// instead of a `JoinError` the caller has to know how to handle (spec
/// §4.8 "error-flattening").
pub async fn flatten<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(join_error) => {
            error!(error = %join_error, "background task panicked");
            Err(Error::Internal(format!("background task panicked: {join_error}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy_engine::ExternalSparseDd;
    use crate::scheduler::TokioScheduler;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use sxm_common::{AttachBackend, AttachInfo, DpId, VdiInfo};
    use tempfile::tempdir;

    struct NoopStorageApi {
        calls: AtomicU32,
    }

    impl Default for NoopStorageApi {
        fn default() -> Self {
            Self { calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl StorageApi for NoopStorageApi {
        async fn sr_scan(&self, _sr: &SrId) -> Result<Vec<VdiInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
        async fn sr_scan2(&self, sr: &SrId) -> Result<Vec<VdiInfo>> {
            self.sr_scan(sr).await
        }
        async fn sr_update_snapshot_info_dest(
            &self,
            _sr: &SrId,
            _vdi: &VdiId,
            _src_vdi_info: &VdiInfo,
            _snapshot_pairs: &[(VdiId, VdiId)],
        ) -> Result<()> {
            Ok(())
        }
        async fn vdi_create(&self, _sr: &SrId, template: &VdiInfo) -> Result<VdiInfo> {
            Ok(template.clone())
        }
        async fn vdi_clone(&self, _sr: &SrId, vdi: &VdiId) -> Result<VdiInfo> {
            Err(Error::does_not_exist("vdi", vdi.clone()))
        }
        async fn vdi_snapshot(&self, _sr: &SrId, vdi: &VdiId) -> Result<VdiInfo> {
            Err(Error::does_not_exist("vdi", vdi.clone()))
        }
        async fn vdi_snapshot_with_sm_config(
            &self,
            _sr: &SrId,
            vdi: &VdiId,
            _sm_config: &BTreeMap<String, String>,
        ) -> Result<VdiInfo> {
            Err(Error::does_not_exist("vdi", vdi.clone()))
        }
        async fn vdi_destroy(&self, _sr: &SrId, _vdi: &VdiId) -> Result<()> {
            Ok(())
        }
        async fn vdi_resize(&self, _sr: &SrId, _vdi: &VdiId, _new_size: u64) -> Result<()> {
            Ok(())
        }
        async fn vdi_attach3(
            &self,
            _dp: &DpId,
            _sr: &SrId,
            _vdi: &VdiId,
            _vm: &str,
            _read_write: bool,
        ) -> Result<AttachInfo> {
            Ok(AttachInfo {
                backend: AttachBackend::File {
                    path: "/tmp/mock.vhd".into(),
                },
            })
        }
        async fn vdi_activate3(&self, _dp: &DpId, _sr: &SrId, _vdi: &VdiId, _vm: &str) -> Result<()> {
            Ok(())
        }
        async fn vdi_deactivate(&self, _dp: &DpId, _sr: &SrId, _vdi: &VdiId) -> Result<()> {
            Ok(())
        }
        async fn vdi_detach(&self, _dp: &DpId, _sr: &SrId, _vdi: &VdiId) -> Result<()> {
            Ok(())
        }
        async fn vdi_set_content_id(&self, _sr: &SrId, _vdi: &VdiId, _content_id: &str) -> Result<()> {
            Ok(())
        }
        async fn vdi_similar_content(&self, _sr: &SrId, _vdi: &VdiId) -> Result<Vec<VdiInfo>> {
            Ok(vec![])
        }
        async fn vdi_compose(&self, _sr: &SrId, _mirror_vdi: &VdiId, _copy_diffs_to: &VdiId) -> Result<()> {
            Ok(())
        }
        async fn dp_create(&self, _sr: &SrId, _vdi: &VdiId) -> Result<DpId> {
            Ok("dp-1".to_string())
        }
        async fn dp_attach_info(&self, _dp: &DpId) -> Result<AttachInfo> {
            Ok(AttachInfo {
                backend: AttachBackend::File {
                    path: "/tmp/mock.vhd".into(),
                },
            })
        }
        async fn dp_destroy(&self, _dbg: &str, _dp: &DpId, _allow_leak: bool) -> Result<()> {
            Ok(())
        }
        async fn mirror_receive_start2(
            &self,
            _sr: &SrId,
            _vdi_info: &VdiInfo,
            _id: &str,
            _similar: &[String],
            _vm: &str,
        ) -> Result<VhdMirror> {
            Err(Error::Internal("not exercised in this test".to_string()))
        }
        async fn mirror_receive_cancel(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn mirror_receive_finalize(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn mirror_import_activate(&self, _id: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn mirror_stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_coordinator(dir: &std::path::Path) -> Coordinator {
        let config = CoordinatorConfig {
            persist_root: dir.to_path_buf(),
            ..CoordinatorConfig::default()
        };
        let local_api: Arc<dyn StorageApi> = Arc::new(NoopStorageApi::default());
        let scheduler = Arc::new(TokioScheduler::new());
        let sparse_dd: Arc<dyn SparseDd> = Arc::new(ExternalSparseDd {
            binary_path: "/bin/true".into(),
        });
        Coordinator::new(&config, local_api, scheduler, sparse_dd)
    }

    #[tokio::test]
    async fn stat_on_unknown_mirror_is_does_not_exist() {
        let dir = tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());

        let result = coordinator.stat(&"sr-1".to_string(), &"vdi-1".to_string()).await;
        assert!(matches!(result, Err(Error::DoesNotExist { .. })));
    }

    #[tokio::test]
    async fn list_on_fresh_coordinator_is_empty() {
        let dir = tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());

        assert!(coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn killall_on_fresh_coordinator_clears_without_panicking() {
        let dir = tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());

        coordinator.killall().await;
        assert!(coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn hooks_are_reachable_from_the_coordinator() {
        let dir = tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());

        // Neither hook panics when there's no active mirror for this sr/vdi.
        coordinator
            .pre_deactivate_hook(&"sr-1".to_string(), &"vdi-1".to_string())
            .await;
        coordinator
            .post_detach_hook(&"sr-1".to_string(), &"vdi-1".to_string())
            .await;
    }
}
