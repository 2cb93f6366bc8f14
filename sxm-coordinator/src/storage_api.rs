//! The storage API contract the coordinator consumes, both locally and on
//! the remote host (spec §6.2), plus the remote RPC façade (§4.1 "Remote
//! RPC façade") that builds a strongly-typed client bound to a URL.
//!
//! This crate treats `SR.*`/`VDI.*`/`DP.*`/`DATA.MIRROR.*` as an external
//! collaborator (spec §1): the trait below is the contract, and
//! [`RpcStorageClient`] is the one concrete transport, a thin JSON-over-HTTP
//! client in the shape of the teacher's own `ApiClient`
//! (`horcrux-cli/src/api.rs`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sxm_common::{AttachInfo, DpId, Error, Result, SrId, VdiId, VdiInfo};

/// Result of `DATA.MIRROR.receive_start2` (spec §4.6, §6.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhdMirror {
    pub mirror_vdi: VdiId,
    pub mirror_datapath: DpId,
    pub copy_diffs_from: Option<String>,
    pub copy_diffs_to: VdiId,
    pub dummy_vdi: VdiId,
}

/// The storage operations the coordinator depends on (spec §6.2). Both the
/// local and the remote side are reached through implementations of this
/// trait — the coordinator does not care whether a given call crosses a
/// network boundary.
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn sr_scan(&self, sr: &SrId) -> Result<Vec<VdiInfo>>;
    async fn sr_scan2(&self, sr: &SrId) -> Result<Vec<VdiInfo>>;
    async fn sr_update_snapshot_info_dest(
        &self,
        sr: &SrId,
        vdi: &VdiId,
        src_vdi_info: &VdiInfo,
        snapshot_pairs: &[(VdiId, VdiId)],
    ) -> Result<()>;

    async fn vdi_create(&self, sr: &SrId, template: &VdiInfo) -> Result<VdiInfo>;
    async fn vdi_clone(&self, sr: &SrId, vdi: &VdiId) -> Result<VdiInfo>;
    async fn vdi_snapshot(&self, sr: &SrId, vdi: &VdiId) -> Result<VdiInfo>;
    /// Like `vdi_snapshot`, but also stamps the given sm-config entries onto
    /// the resulting snapshot (spec §4.5.1's `mirror`/`base_mirror` keys).
    async fn vdi_snapshot_with_sm_config(
        &self,
        sr: &SrId,
        vdi: &VdiId,
        sm_config: &BTreeMap<String, String>,
    ) -> Result<VdiInfo>;
    async fn vdi_destroy(&self, sr: &SrId, vdi: &VdiId) -> Result<()>;
    async fn vdi_resize(&self, sr: &SrId, vdi: &VdiId, new_size: u64) -> Result<()>;
    async fn vdi_attach3(
        &self,
        dp: &DpId,
        sr: &SrId,
        vdi: &VdiId,
        vm: &str,
        read_write: bool,
    ) -> Result<AttachInfo>;
    async fn vdi_activate3(&self, dp: &DpId, sr: &SrId, vdi: &VdiId, vm: &str) -> Result<()>;
    async fn vdi_deactivate(&self, dp: &DpId, sr: &SrId, vdi: &VdiId) -> Result<()>;
    async fn vdi_detach(&self, dp: &DpId, sr: &SrId, vdi: &VdiId) -> Result<()>;
    async fn vdi_set_content_id(&self, sr: &SrId, vdi: &VdiId, content_id: &str) -> Result<()>;
    async fn vdi_similar_content(&self, sr: &SrId, vdi: &VdiId) -> Result<Vec<VdiInfo>>;
    async fn vdi_compose(&self, sr: &SrId, mirror_vdi: &VdiId, copy_diffs_to: &VdiId)
        -> Result<()>;

    async fn dp_create(&self, sr: &SrId, vdi: &VdiId) -> Result<DpId>;
    async fn dp_attach_info(&self, dp: &DpId) -> Result<AttachInfo>;
    async fn dp_destroy(&self, dbg: &str, dp: &DpId, allow_leak: bool) -> Result<()>;

    async fn mirror_receive_start2(
        &self,
        sr: &SrId,
        vdi_info: &VdiInfo,
        id: &str,
        similar: &[String],
        vm: &str,
    ) -> Result<VhdMirror>;
    async fn mirror_receive_cancel(&self, id: &str) -> Result<()>;
    async fn mirror_receive_finalize(&self, id: &str) -> Result<()>;
    /// Returns the Unix socket path the caller should hand the HTTP fd off
    /// to (spec §6.3, §6.4).
    async fn mirror_import_activate(&self, id: &str) -> Result<String>;
    async fn mirror_stop(&self, id: &str) -> Result<()>;
}

/// Builds a [`StorageApi`] client bound to a remote host's base URL,
/// memoised per URL but re-applying `verify_dest` on every call (spec §9
/// "Remote RPC façade").
#[derive(Clone, Default)]
pub struct RpcClientFactory;

impl RpcClientFactory {
    pub fn client_for(&self, base_url: &str, verify_dest: bool) -> RpcStorageClient {
        RpcStorageClient::new(base_url, verify_dest)
    }
}

/// A JSON-over-HTTP `StorageApi` client, analogous in shape to the
/// teacher's `horcrux-cli::api::ApiClient`.
pub struct RpcStorageClient {
    base_url: String,
    client: reqwest::Client,
    verify_dest: bool,
}

impl RpcStorageClient {
    pub fn new(base_url: &str, verify_dest: bool) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_dest)
            .build()
            .expect("reqwest client construction is infallible for this configuration");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            verify_dest,
        }
    }

    pub fn verify_dest(&self) -> bool {
        self.verify_dest
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<B: Serialize + ?Sized, T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}/rpc/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("RPC {method} failed to send: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::backend(
                status.as_str().to_string(),
                vec![method.to_string()],
                text,
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Internal(format!("RPC {method} returned malformed JSON: {e}")))
    }
}

#[async_trait]
impl StorageApi for RpcStorageClient {
    async fn sr_scan(&self, sr: &SrId) -> Result<Vec<VdiInfo>> {
        self.call("SR.scan", &serde_json::json!({ "sr": sr })).await
    }

    async fn sr_scan2(&self, sr: &SrId) -> Result<Vec<VdiInfo>> {
        self.call("SR.scan2", &serde_json::json!({ "sr": sr })).await
    }

    async fn sr_update_snapshot_info_dest(
        &self,
        sr: &SrId,
        vdi: &VdiId,
        src_vdi_info: &VdiInfo,
        snapshot_pairs: &[(VdiId, VdiId)],
    ) -> Result<()> {
        self.call(
            "SR.update_snapshot_info_dest",
            &serde_json::json!({
                "sr": sr,
                "vdi": vdi,
                "src_vdi_info": src_vdi_info,
                "snapshot_pairs": snapshot_pairs,
            }),
        )
        .await
    }

    async fn vdi_create(&self, sr: &SrId, template: &VdiInfo) -> Result<VdiInfo> {
        self.call(
            "VDI.create",
            &serde_json::json!({ "sr": sr, "template": template }),
        )
        .await
    }

    async fn vdi_clone(&self, sr: &SrId, vdi: &VdiId) -> Result<VdiInfo> {
        self.call("VDI.clone", &serde_json::json!({ "sr": sr, "vdi": vdi }))
            .await
    }

    async fn vdi_snapshot(&self, sr: &SrId, vdi: &VdiId) -> Result<VdiInfo> {
        self.call("VDI.snapshot", &serde_json::json!({ "sr": sr, "vdi": vdi }))
            .await
    }

    async fn vdi_snapshot_with_sm_config(
        &self,
        sr: &SrId,
        vdi: &VdiId,
        sm_config: &BTreeMap<String, String>,
    ) -> Result<VdiInfo> {
        self.call(
            "VDI.snapshot_with_sm_config",
            &serde_json::json!({ "sr": sr, "vdi": vdi, "sm_config": sm_config }),
        )
        .await
    }

    async fn vdi_destroy(&self, sr: &SrId, vdi: &VdiId) -> Result<()> {
        self.call("VDI.destroy", &serde_json::json!({ "sr": sr, "vdi": vdi }))
            .await
    }

    async fn vdi_resize(&self, sr: &SrId, vdi: &VdiId, new_size: u64) -> Result<()> {
        self.call(
            "VDI.resize",
            &serde_json::json!({ "sr": sr, "vdi": vdi, "new_size": new_size }),
        )
        .await
    }

    async fn vdi_attach3(
        &self,
        dp: &DpId,
        sr: &SrId,
        vdi: &VdiId,
        vm: &str,
        read_write: bool,
    ) -> Result<AttachInfo> {
        self.call(
            "VDI.attach3",
            &serde_json::json!({ "dp": dp, "sr": sr, "vdi": vdi, "vm": vm, "read_write": read_write }),
        )
        .await
    }

    async fn vdi_activate3(&self, dp: &DpId, sr: &SrId, vdi: &VdiId, vm: &str) -> Result<()> {
        self.call(
            "VDI.activate3",
            &serde_json::json!({ "dp": dp, "sr": sr, "vdi": vdi, "vm": vm }),
        )
        .await
    }

    async fn vdi_deactivate(&self, dp: &DpId, sr: &SrId, vdi: &VdiId) -> Result<()> {
        self.call(
            "VDI.deactivate",
            &serde_json::json!({ "dp": dp, "sr": sr, "vdi": vdi }),
        )
        .await
    }

    async fn vdi_detach(&self, dp: &DpId, sr: &SrId, vdi: &VdiId) -> Result<()> {
        self.call(
            "VDI.detach",
            &serde_json::json!({ "dp": dp, "sr": sr, "vdi": vdi }),
        )
        .await
    }

    async fn vdi_set_content_id(&self, sr: &SrId, vdi: &VdiId, content_id: &str) -> Result<()> {
        self.call(
            "VDI.set_content_id",
            &serde_json::json!({ "sr": sr, "vdi": vdi, "content_id": content_id }),
        )
        .await
    }

    async fn vdi_similar_content(&self, sr: &SrId, vdi: &VdiId) -> Result<Vec<VdiInfo>> {
        self.call(
            "VDI.similar_content",
            &serde_json::json!({ "sr": sr, "vdi": vdi }),
        )
        .await
    }

    async fn vdi_compose(
        &self,
        sr: &SrId,
        mirror_vdi: &VdiId,
        copy_diffs_to: &VdiId,
    ) -> Result<()> {
        self.call(
            "VDI.compose",
            &serde_json::json!({ "sr": sr, "mirror_vdi": mirror_vdi, "copy_diffs_to": copy_diffs_to }),
        )
        .await
    }

    async fn dp_create(&self, sr: &SrId, vdi: &VdiId) -> Result<DpId> {
        self.call("DP.create", &serde_json::json!({ "sr": sr, "vdi": vdi }))
            .await
    }

    async fn dp_attach_info(&self, dp: &DpId) -> Result<AttachInfo> {
        self.call("DP.attach_info", &serde_json::json!({ "dp": dp })).await
    }

    async fn dp_destroy(&self, dbg: &str, dp: &DpId, allow_leak: bool) -> Result<()> {
        self.call(
            "DP.destroy",
            &serde_json::json!({ "dbg": dbg, "dp": dp, "allow_leak": allow_leak }),
        )
        .await
    }

    async fn mirror_receive_start2(
        &self,
        sr: &SrId,
        vdi_info: &VdiInfo,
        id: &str,
        similar: &[String],
        vm: &str,
    ) -> Result<VhdMirror> {
        self.call(
            "DATA.MIRROR.receive_start2",
            &serde_json::json!({
                "sr": sr,
                "vdi_info": vdi_info,
                "id": id,
                "similar": similar,
                "vm": vm,
            }),
        )
        .await
    }

    async fn mirror_receive_cancel(&self, id: &str) -> Result<()> {
        self.call(
            "DATA.MIRROR.receive_cancel",
            &serde_json::json!({ "id": id }),
        )
        .await
    }

    async fn mirror_receive_finalize(&self, id: &str) -> Result<()> {
        self.call(
            "DATA.MIRROR.receive_finalize",
            &serde_json::json!({ "id": id }),
        )
        .await
    }

    async fn mirror_import_activate(&self, id: &str) -> Result<String> {
        self.call(
            "DATA.MIRROR.import_activate",
            &serde_json::json!({ "id": id }),
        )
        .await
    }

    async fn mirror_stop(&self, id: &str) -> Result<()> {
        self.call("DATA.MIRROR.stop", &serde_json::json!({ "id": id })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_strips_trailing_slash() {
        let client = RpcStorageClient::new("https://host:443/", true);
        assert_eq!(client.base_url(), "https://host:443");
        assert!(client.verify_dest());
    }

    #[test]
    fn factory_propagates_verify_dest_per_call() {
        let factory = RpcClientFactory;
        let insecure = factory.client_for("https://host", false);
        let secure = factory.client_for("https://host", true);
        assert!(!insecure.verify_dest());
        assert!(secure.verify_dest());
    }
}
