//! The send-side mirror state machine (spec §4.5): establishing a live
//! mirror from a local VDI to a destination host, through
//! Initialising → RemoteReceiving → Mirroring → Snapshotting → Copying →
//! Composed → Terminating, and the watchdog that keeps watching it once
//! established.

use crate::cleanup::CleanupStack;
use crate::copy_engine::{self, ProgressCallback, SparseDd};
use crate::datapath;
use crate::fdhandoff;
use crate::registry::records::{RemoteMirrorInfo, SendState};
use crate::registry::PersistentStateRegistry;
use crate::scheduler::{ScheduledHandle, Scheduler};
use crate::storage_api::{RpcClientFactory, StorageApi};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sxm_common::{ids, Error, Result, SrId, VdiId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct MirrorEngine {
    local_api: Arc<dyn StorageApi>,
    registry: Arc<PersistentStateRegistry>,
    scheduler: Arc<dyn Scheduler>,
    watchdog_interval: Duration,
    client_factory: RpcClientFactory,
    sparse_dd: Arc<dyn SparseDd>,
    /// Live, cancellable watchdog handles keyed by mirror id. `SendState`
    /// only persists a handle's opaque integer id (§6.1) — the
    /// `CancellationToken` that actually cancels it can't survive a
    /// restart, so it lives here instead, rearmed on every (re)arm.
    watchdogs: Arc<StdMutex<HashMap<String, ScheduledHandle>>>,
}

impl MirrorEngine {
    pub fn new(
        local_api: Arc<dyn StorageApi>,
        registry: Arc<PersistentStateRegistry>,
        scheduler: Arc<dyn Scheduler>,
        watchdog_interval: Duration,
        sparse_dd: Arc<dyn SparseDd>,
    ) -> Self {
        Self {
            local_api,
            registry,
            scheduler,
            watchdog_interval,
            client_factory: RpcClientFactory,
            sparse_dd,
            watchdogs: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Establish a mirror of `vdi` on `sr` towards `dest_sr` on the host
    /// reachable through `remote_api`/`remote_url` (spec §4.5.1).
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        sr: &SrId,
        vdi: &VdiId,
        vm: &str,
        dest_sr: &SrId,
        remote_api: Arc<dyn StorageApi>,
        remote_url: &str,
        verify_dest: bool,
    ) -> Result<()> {
        let id = ids::mirror_id_of(sr, vdi);
        if self.registry.find_active_local_mirror(sr, vdi).await.is_some() {
            return Err(Error::Internal(format!("mirror already active for {id}")));
        }

        let mut cleanup = CleanupStack::new();
        let local_api = self.local_api.clone();

        let outcome: Result<SendState> = async {
            // Initialising
            let vdi_info = local_api
                .sr_scan(sr)
                .await?
                .into_iter()
                .find(|v| &v.uuid == vdi)
                .ok_or_else(|| Error::does_not_exist("vdi", vdi.clone()))?;

            // RemoteReceiving
            let receive = remote_api
                .mirror_receive_start2(dest_sr, &vdi_info, &id, &[], vm)
                .await?;
            {
                let remote_api = remote_api.clone();
                let id = id.clone();
                cleanup.add(move || async move {
                    if let Err(e) = remote_api.mirror_receive_cancel(&id).await {
                        warn!(%id, error = %e, "failed to cancel remote receive during unwind");
                    }
                });
            }

            // Mirroring: attach the local vdi read-write so writes can be
            // forwarded to the destination as they happen.
            let local_dp = local_api.dp_create(sr, vdi).await?;
            {
                let api = local_api.clone();
                let dp = local_dp.clone();
                cleanup.add(move || async move {
                    if let Err(e) = api.dp_destroy("mirror start failure", &dp, true).await {
                        warn!(%dp, error = %e, "failed to destroy local datapath during unwind");
                    }
                });
            }

            let attach_info = local_api.vdi_attach3(&local_dp, sr, vdi, vm, true).await?;
            {
                let api = local_api.clone();
                let dp = local_dp.clone();
                let sr = sr.clone();
                let vdi = vdi.clone();
                cleanup.add(move || async move {
                    if let Err(e) = api.vdi_detach(&dp, &sr, &vdi).await {
                        warn!(%dp, error = %e, "failed to detach local vdi during unwind");
                    }
                });
            }

            local_api.vdi_activate3(&local_dp, sr, vdi, vm).await?;
            {
                let api = local_api.clone();
                let dp = local_dp.clone();
                let sr = sr.clone();
                let vdi = vdi.clone();
                cleanup.add(move || async move {
                    if let Err(e) = api.vdi_deactivate(&dp, &sr, &vdi).await {
                        warn!(%dp, error = %e, "failed to deactivate local vdi during unwind");
                    }
                });
            }

            let tapdev = datapath::tapdisk_of_attach_info(&attach_info)?;

            let (dest_host, dest_port) = split_host_port(remote_url)?;
            fdhandoff::hand_off_nbd_socket(
                &dest_host,
                dest_port,
                vm,
                dest_sr,
                &receive.mirror_vdi,
                &receive.mirror_datapath,
                tapdev.pid,
            )
            .await?;

            // Snapshotting: a stable point-in-time source for the copy,
            // stamped with the sm-config keys the backend uses to pair it
            // with this mirror's in-flight writes (spec §4.5.1).
            let mut sm_config = BTreeMap::new();
            sm_config.insert("mirror".to_string(), format!("nbd:{local_dp}"));
            sm_config.insert("base_mirror".to_string(), id.clone());
            let snapshot = local_api
                .vdi_snapshot_with_sm_config(sr, vdi, &sm_config)
                .await?;

            // Copying: stream the snapshot's diffs into the destination's
            // `copy_diffs_to` VDI over NBD (spec §4.4.1, §4.5.1).
            let no_progress: ProgressCallback = Arc::new(|_| {});
            copy_engine::copy_into_vdi(
                local_api.clone(),
                remote_api.clone(),
                self.sparse_dd.clone(),
                &self.registry,
                sr,
                &snapshot.uuid,
                dest_sr,
                &receive.copy_diffs_to,
                vm,
                None,
                remote_url,
                no_progress,
                CancellationToken::new(),
            )
            .await?;

            // Composed: fold the copied diffs into the destination's
            // mirror VDI. `receive_finalize` deliberately does NOT run
            // here — it only runs from `post_detach_hook`, once the VM
            // itself has actually migrated (spec §4.7, §3.4).
            remote_api
                .vdi_compose(dest_sr, &receive.mirror_vdi, &receive.copy_diffs_to)
                .await?;

            Ok(SendState {
                id: id.clone(),
                sr: sr.clone(),
                vdi: vdi.clone(),
                vm: vm.to_string(),
                dest_sr: dest_sr.clone(),
                remote_url: remote_url.to_string(),
                verify_dest,
                remote_dp: receive.mirror_datapath.clone(),
                remote_mirror_vdi: receive.mirror_vdi.clone(),
                remote_info: Some(RemoteMirrorInfo {
                    copy_diffs_from: receive.copy_diffs_from.clone(),
                    copy_diffs_to: receive.copy_diffs_to.clone(),
                    dummy_vdi: receive.dummy_vdi.clone(),
                }),
                local_dp,
                tapdev: Some(tapdev),
                failed: false,
                watchdog: None,
                created_at: Utc::now(),
            })
        }
        .await;

        // Terminating
        match outcome {
            Ok(mut send_state) => {
                let handle_id = self.arm_watchdog(id.clone());
                send_state.watchdog = Some(handle_id);
                self.registry.add_send(send_state).await?;
                info!(%id, "mirror established");
                Ok(())
            }
            Err(e) => {
                error!(%id, error = %e, "mirror setup failed, unwinding");
                cleanup.perform_actions().await;
                Err(e)
            }
        }
    }

    /// Stop a mirror by id (spec §4.5.4): tear down the local attach/activate
    /// that was keeping the mirror live, then best-effort cancel the
    /// remote-side receive if one had been acknowledged. `remote_info` is
    /// `None` only for a mirror still in its setup window, in which case
    /// there is nothing acknowledged on the remote side to cancel.
    pub async fn stop(&self, sr: &SrId, vdi: &VdiId) -> Result<()> {
        let id = ids::mirror_id_of(sr, vdi);
        let send_state = self
            .registry
            .find_active_local_mirror(sr, vdi)
            .await
            .ok_or_else(|| Error::does_not_exist("mirror", id.clone()))?;

        self.disarm_watchdog(&id);

        if let Err(e) = self
            .local_api
            .vdi_deactivate(&send_state.local_dp, sr, vdi)
            .await
        {
            warn!(%id, error = %e, "deactivate failed during stop, continuing");
        }
        if let Err(e) = self.local_api.vdi_detach(&send_state.local_dp, sr, vdi).await {
            warn!(%id, error = %e, "detach failed during stop, continuing");
        }
        if let Err(e) = self
            .local_api
            .dp_destroy("mirror stop", &send_state.local_dp, true)
            .await
        {
            warn!(%id, error = %e, "datapath destroy failed during stop, continuing");
        }

        if send_state.remote_info.is_some() {
            let remote = self
                .client_factory
                .client_for(&send_state.remote_url, send_state.verify_dest);
            if let Err(e) = remote.mirror_receive_cancel(&id).await {
                warn!(%id, error = %e, "remote receive_cancel failed during stop, continuing");
            }
        }

        self.registry.remove_local_mirror(sr, vdi).await?;
        info!(%id, "mirror stopped");
        Ok(())
    }

    /// Stop every active local mirror, swallowing individual failures so
    /// one stuck mirror doesn't block the rest (spec §9 Open Question:
    /// `killall` during a concurrent snapshot races the other mirror's
    /// own `vdi_snapshot` call; this implementation accepts that race and
    /// leaves the loser to be cleaned up by the watchdog on next pass,
    /// rather than taking a global lock across all mirrors).
    ///
    /// This only covers the send side of the registry. Receives and
    /// in-flight copies have no counterpart here — `Coordinator::killall`
    /// (facade.rs) is what tears down all three registry tables.
    pub async fn killall(&self) {
        let sends = self.registry.list_sends().await;
        for send in sends {
            if let Err(e) = self.stop(&send.sr, &send.vdi).await {
                warn!(id = %send.id, error = %e, "killall: failed to stop mirror, continuing");
            }
        }
    }

    /// Run `DATA.MIRROR.receive_finalize` against the mirror most recently
    /// active on `sr`/`vdi`, if any, and drop its registry row and watchdog.
    /// This is the only place `receive_finalize` is ever called from — it
    /// must run after the VM has actually migrated off this host, which is
    /// exactly what `post_detach_hook` signals (spec §4.7, §3.4). The
    /// remote call is best-effort: a host that's already gone by the time
    /// this runs shouldn't prevent the local bookkeeping from clearing.
    pub async fn finalize_after_detach(&self, sr: &SrId, vdi: &VdiId) {
        let Some(send_state) = self.registry.find_active_local_mirror(sr, vdi).await else {
            debug!(%sr, %vdi, "finalize_after_detach: no active mirror, nothing to do");
            return;
        };

        let id = send_state.id.clone();
        self.disarm_watchdog(&id);

        let remote = self
            .client_factory
            .client_for(&send_state.remote_url, send_state.verify_dest);
        if let Err(e) = remote.mirror_receive_finalize(&id).await {
            warn!(%id, error = %e, "remote receive_finalize failed during post-detach finalize, continuing");
        }

        if let Err(e) = self.registry.remove_send(&id).await {
            warn!(%id, error = %e, "failed to remove send registry row after finalize");
        }
        info!(%id, "mirror finalized after detach");
    }

    /// Arm (or re-arm) the watchdog for `id`, returning the handle's
    /// persistable integer id.
    fn arm_watchdog(&self, id: String) -> u64 {
        let local_api = self.local_api.clone();
        let registry = self.registry.clone();
        let scheduler = self.scheduler.clone();
        let watchdogs = self.watchdogs.clone();
        let interval = self.watchdog_interval;
        let id_for_task = id.clone();

        let handle = self.scheduler.one_shot(
            interval,
            Box::new(move || {
                Box::pin(Self::check_once(
                    local_api,
                    registry,
                    scheduler,
                    watchdogs,
                    interval,
                    id_for_task,
                ))
            }),
        );

        let handle_id = handle.id();
        self.watchdogs.lock().unwrap().insert(id, handle);
        debug!(handle_id, "watchdog armed");
        handle_id
    }

    fn disarm_watchdog(&self, id: &str) {
        if let Some(handle) = self.watchdogs.lock().unwrap().remove(id) {
            self.scheduler.cancel(&handle);
        }
    }

    async fn check_once(
        local_api: Arc<dyn StorageApi>,
        registry: Arc<PersistentStateRegistry>,
        scheduler: Arc<dyn Scheduler>,
        watchdogs: Arc<StdMutex<HashMap<String, ScheduledHandle>>>,
        interval: Duration,
        id: String,
    ) {
        let Some(send_state) = registry.find_send(&id).await else {
            debug!(%id, "watchdog: mirror no longer registered, stopping checks");
            watchdogs.lock().unwrap().remove(&id);
            return;
        };

        match local_api.dp_attach_info(&send_state.local_dp).await {
            Ok(_) => {
                // A real implementation reads `TapDiskStats::nbd_mirror_failed`
                // off the tapdisk's status socket; attach_info standing in
                // here confirms the datapath is still alive at all.
                debug!(%id, "watchdog: mirror healthy");
            }
            Err(e) => {
                error!(%id, error = %e, "watchdog: mirror unreachable, marking failed");
                let mut failed_state = send_state.clone();
                failed_state.failed = true;
                if let Err(e) = registry.add_send(failed_state).await {
                    error!(%id, error = %e, "watchdog: failed to persist failed state");
                }
                watchdogs.lock().unwrap().remove(&id);
                return;
            }
        }

        let local_api2 = local_api.clone();
        let registry2 = registry.clone();
        let scheduler2 = scheduler.clone();
        let watchdogs2 = watchdogs.clone();
        let id2 = id.clone();
        let handle = scheduler.one_shot(
            interval,
            Box::new(move || {
                Box::pin(Self::check_once(
                    local_api2, registry2, scheduler2, watchdogs2, interval, id2,
                ))
            }),
        );
        debug!(%id, handle_id = handle.id(), "watchdog rescheduled");
        watchdogs.lock().unwrap().insert(id, handle);
    }
}

fn split_host_port(remote_url: &str) -> Result<(String, u16)> {
    let url = url::Url::parse(remote_url)
        .map_err(|e| Error::Internal(format!("invalid remote url {remote_url}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Internal(format!("remote url missing host: {remote_url}")))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    Ok((host, port))
}
