//! The standalone copy engine (spec §4.4): copying one VDI's content into
//! another, either against an explicit destination (`copy_into_vdi`) or by
//! auto-selecting the closest existing destination VDI via `content_id`
//! similarity (`copy_into_sr`).
//!
//! The destination always lives on a different host than the source (spec
//! §4.4.1): the source is attached locally and read through a plain path,
//! but the destination is reached over NBD, attached remotely through a
//! caller-supplied `remote_api` and addressed by the URL `sparse_dd` writes
//! into.

use crate::datapath::{resolve_backend, with_activated_disk, ResolvedBackend};
use crate::registry::records::CopyState;
use crate::registry::PersistentStateRegistry;
use crate::storage_api::StorageApi;
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use sxm_common::{ids, Error, Result, SrId, VdiId, VdiInfo};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Progress callback: a fraction in `[0.0, 1.0]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// The black-box copy tool (spec §4.4.3): streams `source` into
/// `dest_nbd_url`, optionally diffing against `base` to copy only the
/// blocks that changed. The destination is always an NBD sink, never a
/// local path — it lives on the remote host the copy is going to.
#[async_trait]
pub trait SparseDd: Send + Sync {
    async fn run(
        &self,
        source: &Path,
        dest_nbd_url: &str,
        base: Option<&Path>,
        progress: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Drives a `sparse_dd`-compatible external binary via `tokio::process`.
pub struct ExternalSparseDd {
    pub binary_path: std::path::PathBuf,
}

#[async_trait]
impl SparseDd for ExternalSparseDd {
    async fn run(
        &self,
        source: &Path,
        dest_nbd_url: &str,
        base: Option<&Path>,
        progress: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.binary_path);
        command
            .arg("--source")
            .arg(source)
            .arg("--dest")
            .arg(dest_nbd_url);
        if let Some(base) = base {
            command.arg("--base").arg(base);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn sparse_dd: {e}")))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::Internal(format!("sparse_dd wait failed: {e}")))?;
                if !status.success() {
                    return Err(Error::backend(
                        "sparse_dd".to_string(),
                        vec![source.display().to_string(), dest_nbd_url.to_string()],
                        format!("exited with {status}"),
                    ));
                }
                progress(0.95);
                Ok(())
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                Err(Error::Cancelled)
            }
        }
    }
}

/// Builds the NBD URL a remote `sparse_dd` sink is addressed by (spec
/// §4.4.1): `{url}/nbd/{vm}/{sr}/{vdi}/{dp}`.
fn build_nbd_url(remote_url: &str, vm: &str, sr: &SrId, vdi: &VdiId, dp: &str) -> String {
    format!(
        "{}/nbd/{}/{}/{}/{}",
        remote_url.trim_end_matches('/'),
        urlencoding::encode(vm),
        urlencoding::encode(sr),
        urlencoding::encode(vdi),
        urlencoding::encode(dp),
    )
}

/// Copy `source_vdi` on `source_sr` into an explicit `dest_vdi` on
/// `dest_sr` (spec §4.4.1). Progress is reported over `[0.05, 0.95]`,
/// leaving the outer 10% for attach/activate and compose bookkeeping.
/// `remote_api` must already be bound to the destination host, and
/// `remote_url` is the base URL that same host is reachable at for the
/// NBD sink `sparse_dd` writes into.
#[allow(clippy::too_many_arguments)]
pub async fn copy_into_vdi(
    local_api: Arc<dyn StorageApi>,
    remote_api: Arc<dyn StorageApi>,
    sparse_dd: Arc<dyn SparseDd>,
    registry: &PersistentStateRegistry,
    source_sr: &SrId,
    source_vdi: &VdiId,
    dest_sr: &SrId,
    dest_vdi: &VdiId,
    vm: &str,
    base_vdi: Option<&VdiId>,
    remote_url: &str,
    progress: ProgressCallback,
    cancel: CancellationToken,
) -> Result<()> {
    let source_info = local_api
        .sr_scan(source_sr)
        .await?
        .into_iter()
        .find(|v| &v.uuid == source_vdi)
        .ok_or_else(|| Error::does_not_exist("vdi", source_vdi.clone()))?;
    let dest_info = remote_api
        .sr_scan(dest_sr)
        .await?
        .into_iter()
        .find(|v| &v.uuid == dest_vdi)
        .ok_or_else(|| Error::does_not_exist("vdi", dest_vdi.clone()))?;
    if source_info.virtual_size > dest_info.virtual_size {
        return Err(Error::CapacityExceeded(format!(
            "source {source_vdi} is {} bytes, destination {dest_vdi} is only {} bytes",
            source_info.virtual_size, dest_info.virtual_size
        )));
    }

    let id = ids::copy_id_of(dest_sr, dest_vdi);
    registry
        .add_copy(CopyState {
            id: id.clone(),
            dest_sr: dest_sr.clone(),
            dest_vdi: dest_vdi.clone(),
            source_sr: source_sr.clone(),
            source_vdi: source_vdi.clone(),
            base_vdi: base_vdi.cloned(),
            progress: 0.0,
            cancelled: false,
            created_at: Utc::now(),
        })
        .await?;

    progress(0.05);

    let result = copy_body(
        local_api,
        remote_api,
        sparse_dd,
        source_sr,
        source_vdi,
        dest_sr,
        dest_vdi,
        vm,
        base_vdi,
        remote_url,
        progress.clone(),
        cancel,
    )
    .await;

    match &result {
        Ok(()) => {
            progress(1.0);
            registry.remove_copy(&id).await?;
            info!(%id, "copy completed");
        }
        Err(e) => {
            warn!(%id, error = %e, "copy failed");
            registry.remove_copy(&id).await?;
        }
    }

    result
}

/// The actual attach/stream choreography, factored out of `copy_into_vdi`
/// so the registry bookkeeping above it stays readable. Attaches the
/// destination remotely (to learn its datapath name and build the NBD
/// URL), the source locally, and — if present — the incremental base
/// locally too, then hands all three to `sparse_dd`.
#[allow(clippy::too_many_arguments)]
async fn copy_body(
    local_api: Arc<dyn StorageApi>,
    remote_api: Arc<dyn StorageApi>,
    sparse_dd: Arc<dyn SparseDd>,
    source_sr: &SrId,
    source_vdi: &VdiId,
    dest_sr: &SrId,
    dest_vdi: &VdiId,
    vm: &str,
    base_vdi: Option<&VdiId>,
    remote_url: &str,
    progress: ProgressCallback,
    cancel: CancellationToken,
) -> Result<()> {
    let source_sr_owned = source_sr.clone();
    let source_vdi_owned = source_vdi.clone();
    let base_vdi_owned = base_vdi.cloned();
    let vm_owned = vm.to_string();
    let remote_url_owned = remote_url.to_string();
    let dest_sr_for_url = dest_sr.clone();
    let dest_vdi_for_url = dest_vdi.clone();

    with_activated_disk(
        remote_api.as_ref(),
        dest_sr,
        dest_vdi,
        vm,
        true,
        move |remote_dp, _dest_attach| {
            let local_api = local_api.clone();
            let sparse_dd = sparse_dd.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            let source_sr = source_sr_owned.clone();
            let source_vdi = source_vdi_owned.clone();
            let base_vdi = base_vdi_owned.clone();
            let vm = vm_owned.clone();
            let nbd_url = build_nbd_url(
                &remote_url_owned,
                &vm_owned,
                &dest_sr_for_url,
                &dest_vdi_for_url,
                &remote_dp,
            );
            async move {
                with_activated_disk(
                    local_api.as_ref(),
                    &source_sr,
                    &source_vdi,
                    &vm,
                    false,
                    move |_source_dp, source_attach| {
                        let local_api = local_api.clone();
                        let sparse_dd = sparse_dd.clone();
                        let cancel = cancel.clone();
                        let progress = progress.clone();
                        let nbd_url = nbd_url.clone();
                        let base_vdi = base_vdi.clone();
                        let source_sr = source_sr.clone();
                        let vm = vm.clone();
                        async move {
                            let source_path = local_path(&source_attach)?;
                            match base_vdi {
                                Some(base_vdi) => {
                                    with_activated_disk(
                                        local_api.as_ref(),
                                        &source_sr,
                                        &base_vdi,
                                        &vm,
                                        false,
                                        move |_base_dp, base_attach| async move {
                                            let base_path = local_path(&base_attach)?;
                                            sparse_dd
                                                .run(
                                                    &source_path,
                                                    &nbd_url,
                                                    Some(&base_path),
                                                    &progress,
                                                    &cancel,
                                                )
                                                .await
                                        },
                                    )
                                    .await
                                }
                                None => {
                                    sparse_dd
                                        .run(&source_path, &nbd_url, None, &progress, &cancel)
                                        .await
                                }
                            }
                        }
                    },
                )
                .await
            }
        },
    )
    .await
}

/// Copy `source_vdi` into the SR identified by `dest_sr`, auto-selecting
/// (or creating) the destination VDI by finding the closest existing
/// content on that SR via `VDI.similar_content` (spec §4.4.2).
///
/// The candidate list is built locally (`vdi_similar_content` against the
/// source SR, in the order the storage API ranks them), then matched
/// against what the destination SR actually has by `content_id`: the
/// nearest remote match identifies both the destination clone base and,
/// since it shares a `content_id` with one of the local candidates, the
/// local incremental base `copy_into_vdi` diffs against.
#[allow(clippy::too_many_arguments)]
pub async fn copy_into_sr(
    local_api: Arc<dyn StorageApi>,
    remote_api: Arc<dyn StorageApi>,
    sparse_dd: Arc<dyn SparseDd>,
    registry: &PersistentStateRegistry,
    source_sr: &SrId,
    source_vdi: &VdiId,
    dest_sr: &SrId,
    vm: &str,
    remote_url: &str,
    progress: ProgressCallback,
    cancel: CancellationToken,
) -> Result<VdiId> {
    let source_info = local_api
        .sr_scan(source_sr)
        .await?
        .into_iter()
        .find(|v| &v.uuid == source_vdi)
        .ok_or_else(|| Error::does_not_exist("vdi", source_vdi.clone()))?;

    let local_candidates: Vec<VdiInfo> = local_api
        .vdi_similar_content(source_sr, source_vdi)
        .await?
        .into_iter()
        .filter(|v| !v.cbt_metadata)
        .collect();
    let similars: Vec<String> = local_candidates
        .iter()
        .filter_map(|v| v.content_id.clone())
        .collect();

    let remote_vdis: Vec<VdiInfo> = remote_api
        .sr_scan(dest_sr)
        .await?
        .into_iter()
        .filter(|v| !v.cbt_metadata)
        .collect();

    let nearest = select_nearest(&similars, &remote_vdis, source_info.virtual_size);
    let local_base = nearest.and_then(|remote_match| {
        local_candidates
            .iter()
            .find(|c| c.content_id == remote_match.content_id)
    });

    let dest_vdi = match nearest {
        Some(candidate) => {
            let cloned = remote_api.vdi_clone(dest_sr, &candidate.uuid).await?;
            if cloned.virtual_size < source_info.virtual_size {
                remote_api
                    .vdi_resize(dest_sr, &cloned.uuid, source_info.virtual_size)
                    .await?;
            }
            cloned
        }
        None => {
            let mut blank = source_info.clone();
            blank.sm_config = Default::default();
            remote_api.vdi_create(dest_sr, &blank).await?
        }
    };

    copy_into_vdi(
        local_api,
        remote_api.clone(),
        sparse_dd,
        registry,
        source_sr,
        source_vdi,
        dest_sr,
        &dest_vdi.uuid,
        vm,
        local_base.map(|v| &v.uuid),
        remote_url,
        progress,
        cancel,
    )
    .await?;

    let snapshot = remote_api.vdi_snapshot(dest_sr, &dest_vdi.uuid).await?;
    if let Err(e) = remote_api.vdi_destroy(dest_sr, &dest_vdi.uuid).await {
        warn!(vdi = %dest_vdi.uuid, error = %e, "failed to destroy mutable copy after snapshotting, leaking it");
    }

    Ok(snapshot.uuid)
}

/// Picks the first entry of `similars` (in the order the storage API
/// ranked them) that also exists on the destination SR at or under
/// `max_virtual_size` (spec §4.4.2: tie-break is similars-list order).
fn select_nearest<'a>(
    similars: &[String],
    remote_vdis: &'a [VdiInfo],
    max_virtual_size: u64,
) -> Option<&'a VdiInfo> {
    similars.iter().find_map(|content_id| {
        remote_vdis.iter().find(|v| {
            v.content_id.as_deref() == Some(content_id.as_str())
                && v.virtual_size <= max_virtual_size
        })
    })
}

fn local_path(attach_info: &sxm_common::AttachInfo) -> Result<std::path::PathBuf> {
    match resolve_backend(attach_info)? {
        ResolvedBackend::File(path) | ResolvedBackend::BlockDevice(path) => Ok(path),
        ResolvedBackend::NbdUri(uri) => Err(Error::Internal(format!(
            "copy engine requires a local path, got nbd uri {uri}"
        ))),
    }
}
