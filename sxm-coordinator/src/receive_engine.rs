//! The receive-side counterpart to [`crate::mirror_engine`] (spec §4.6):
//! what runs on the destination host in response to
//! `DATA.MIRROR.receive_start2`/`receive_finalize`/`receive_cancel`.
//!
//! This is the logic a destination host's own RPC handler calls into; this
//! crate does not itself serve the HTTP surface (spec §11 Non-goals), it
//! only implements the engine behind it.

use crate::registry::records::ReceiveState;
use crate::registry::PersistentStateRegistry;
use crate::storage_api::{StorageApi, VhdMirror};
use chrono::Utc;
use std::sync::Arc;
use sxm_common::{Error, Result, SrId, VdiId, VdiInfo};
use tracing::{info, warn};

pub struct ReceiveEngine {
    local_api: Arc<dyn StorageApi>,
    registry: Arc<PersistentStateRegistry>,
}

impl ReceiveEngine {
    pub fn new(local_api: Arc<dyn StorageApi>, registry: Arc<PersistentStateRegistry>) -> Self {
        Self { local_api, registry }
    }

    /// Prepare this host to receive a mirror (spec §4.6.1, §6.5): create
    /// the VDI that will take the live writes, a placeholder `dummy_vdi`
    /// that keeps the chain from being garbage-collected mid-mirror, and
    /// pick a `copy_diffs_from` base out of `similar` if one of those VDIs
    /// actually exists on `sr`.
    pub async fn receive_start2(
        &self,
        sr: &SrId,
        vdi_info: &VdiInfo,
        id: &str,
        similar: &[String],
        vm: &str,
    ) -> Result<VhdMirror> {
        if self.registry.find_receive(id).await.is_some() {
            return Err(Error::Internal(format!("receive already active for {id}")));
        }

        let mirror_vdi = self.local_api.vdi_create(sr, vdi_info).await?;

        let mut dummy_template = vdi_info.clone();
        dummy_template.virtual_size = 0;
        dummy_template.content_id = None;
        let dummy_vdi = self.local_api.vdi_create(sr, &dummy_template).await?;

        let copy_diffs_to = self.local_api.vdi_clone(sr, &mirror_vdi.uuid).await?;

        let copy_diffs_from = self.pick_copy_base(sr, similar).await;

        let dp = self.local_api.dp_create(sr, &mirror_vdi.uuid).await?;
        if let Err(e) = self
            .local_api
            .vdi_attach3(&dp, sr, &mirror_vdi.uuid, vm, true)
            .await
        {
            self.cleanup_after_failed_start(sr, &mirror_vdi.uuid, &dummy_vdi.uuid, &copy_diffs_to.uuid, &dp)
                .await;
            return Err(e);
        }
        if let Err(e) = self.local_api.vdi_activate3(&dp, sr, &mirror_vdi.uuid, vm).await {
            self.cleanup_after_failed_start(sr, &mirror_vdi.uuid, &dummy_vdi.uuid, &copy_diffs_to.uuid, &dp)
                .await;
            return Err(e);
        }

        let state = ReceiveState {
            id: id.to_string(),
            sr: sr.clone(),
            vdi: mirror_vdi.uuid.clone(),
            vm: vm.to_string(),
            mirror_vdi: mirror_vdi.uuid.clone(),
            mirror_dp: dp.clone(),
            copy_diffs_from: copy_diffs_from.clone(),
            copy_diffs_to: copy_diffs_to.uuid.clone(),
            dummy_vdi: dummy_vdi.uuid.clone(),
            failed: false,
            created_at: Utc::now(),
        };
        self.registry.add_receive(state).await?;

        info!(%id, mirror_vdi = %mirror_vdi.uuid, "receive prepared");
        Ok(VhdMirror {
            mirror_vdi: mirror_vdi.uuid,
            mirror_datapath: dp,
            copy_diffs_from,
            copy_diffs_to: copy_diffs_to.uuid,
            dummy_vdi: dummy_vdi.uuid,
        })
    }

    async fn pick_copy_base(&self, sr: &SrId, similar: &[String]) -> Option<String> {
        if similar.is_empty() {
            return None;
        }
        let existing = self.local_api.sr_scan(sr).await.ok()?;
        similar
            .iter()
            .find(|candidate| existing.iter().any(|v| &&v.uuid == candidate))
            .cloned()
    }

    async fn cleanup_after_failed_start(
        &self,
        sr: &SrId,
        mirror_vdi: &VdiId,
        dummy_vdi: &VdiId,
        copy_diffs_to: &VdiId,
        dp: &sxm_common::DpId,
    ) {
        if let Err(e) = self.local_api.dp_destroy("receive_start2 failure", dp, true).await {
            warn!(%dp, error = %e, "failed to destroy datapath during receive_start2 unwind");
        }
        for vdi in [mirror_vdi, dummy_vdi, copy_diffs_to] {
            if let Err(e) = self.local_api.vdi_destroy(sr, vdi).await {
                warn!(%vdi, error = %e, "failed to destroy vdi during receive_start2 unwind");
            }
        }
    }

    /// Cancel a receive that never finalized: tear down everything
    /// `receive_start2` created (spec §4.6.3).
    pub async fn receive_cancel(&self, id: &str) -> Result<()> {
        let state = self
            .registry
            .find_receive(id)
            .await
            .ok_or_else(|| Error::does_not_exist("mirror", id.to_string()))?;

        if let Err(e) = self
            .local_api
            .vdi_deactivate(&state.mirror_dp, &state.sr, &state.mirror_vdi)
            .await
        {
            warn!(%id, error = %e, "deactivate failed during receive_cancel, continuing");
        }
        if let Err(e) = self
            .local_api
            .vdi_detach(&state.mirror_dp, &state.sr, &state.mirror_vdi)
            .await
        {
            warn!(%id, error = %e, "detach failed during receive_cancel, continuing");
        }
        if let Err(e) = self
            .local_api
            .dp_destroy("receive_cancel", &state.mirror_dp, true)
            .await
        {
            warn!(%id, error = %e, "datapath destroy failed during receive_cancel, continuing");
        }
        for vdi in [&state.mirror_vdi, &state.dummy_vdi, &state.copy_diffs_to] {
            if let Err(e) = self.local_api.vdi_destroy(&state.sr, vdi).await {
                warn!(%id, %vdi, error = %e, "vdi destroy failed during receive_cancel, continuing");
            }
        }

        self.registry.remove_receive(id).await?;
        info!(%id, "receive cancelled");
        Ok(())
    }

    /// Finalize a receive once the sender has confirmed Composed (spec
    /// §4.6.2): compose the mirrored chain onto `copy_diffs_to` and retire
    /// the registry row. `dummy_vdi` is left alone here — it's only
    /// destroyed on cancel (spec §3.2, §4.6); on finalize it keeps doing
    /// its job of anchoring the chain against garbage collection.
    pub async fn receive_finalize(&self, id: &str) -> Result<()> {
        let state = self
            .registry
            .find_receive(id)
            .await
            .ok_or_else(|| Error::does_not_exist("mirror", id.to_string()))?;

        self.local_api
            .vdi_compose(&state.sr, &state.mirror_vdi, &state.copy_diffs_to)
            .await?;

        self.registry.remove_receive(id).await?;
        info!(%id, "receive finalized");
        Ok(())
    }
}
