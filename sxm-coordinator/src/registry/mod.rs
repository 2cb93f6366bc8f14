//! The persistent operation registry (spec §3.2, §4.2): three JSON-backed
//! tables, lazily loaded on first use and written through on every change,
//! so a coordinator restart finds in-flight mirrors and copies where it
//! left them.

pub mod records;

use records::{CopyState, ReceiveState, SendState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use sxm_common::{ids, Error, Result, SrId, VdiId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A single JSON-backed table, lazily loaded and written through on every
/// mutation. Corruption is advisory: a file that fails to parse is logged
/// and treated as empty rather than failing the caller (spec §3.3).
struct Table<T> {
    path: PathBuf,
    rows: Mutex<Option<HashMap<String, T>>>,
}

impl<T> Table<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            rows: Mutex::new(None),
        }
    }

    async fn ensure_loaded<'a>(
        &self,
        guard: &mut tokio::sync::MutexGuard<'a, Option<HashMap<String, T>>>,
    ) {
        if guard.is_some() {
            return;
        }

        let loaded = match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, T>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "registry file corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read registry file, starting empty");
                HashMap::new()
            }
        };

        debug!(path = %self.path.display(), rows = loaded.len(), "registry table loaded");
        **guard = Some(loaded);
    }

    fn persist(&self, map: &HashMap<String, T>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                let _ = std::fs::set_permissions(parent, perms);
            }
        }

        let json = serde_json::to_string_pretty(map)
            .map_err(|e| Error::Internal(format!("failed to serialize registry table: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(Error::Io)?;
        std::fs::rename(&tmp_path, &self.path).map_err(Error::Io)?;
        Ok(())
    }

    async fn add(&self, id: String, record: T) -> Result<()> {
        let mut guard = self.rows.lock().await;
        self.ensure_loaded(&mut guard).await;
        let map = guard.as_mut().expect("just loaded");
        map.insert(id, record);
        self.persist(map)
    }

    async fn find(&self, id: &str) -> Option<T> {
        let mut guard = self.rows.lock().await;
        self.ensure_loaded(&mut guard).await;
        guard.as_ref().expect("just loaded").get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Result<Option<T>> {
        let mut guard = self.rows.lock().await;
        self.ensure_loaded(&mut guard).await;
        let map = guard.as_mut().expect("just loaded");
        let removed = map.remove(id);
        if removed.is_some() {
            self.persist(map)?;
        }
        Ok(removed)
    }

    async fn map_of(&self) -> HashMap<String, T> {
        let mut guard = self.rows.lock().await;
        self.ensure_loaded(&mut guard).await;
        guard.as_ref().expect("just loaded").clone()
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.rows.lock().await;
        let empty = HashMap::new();
        self.persist(&empty)?;
        *guard = Some(empty);
        Ok(())
    }
}

/// The coordinator's full persistent state: one table per phase of the
/// protocol (spec §3.2).
pub struct PersistentStateRegistry {
    send: Table<SendState>,
    receive: Table<ReceiveState>,
    copy: Table<CopyState>,
}

impl PersistentStateRegistry {
    pub fn new(persist_root: &Path) -> Self {
        Self {
            send: Table::new(persist_root.join("storage_mirrors_send.json")),
            receive: Table::new(persist_root.join("storage_mirrors_recv.json")),
            copy: Table::new(persist_root.join("storage_mirrors_copy.json")),
        }
    }

    pub async fn add_send(&self, record: SendState) -> Result<()> {
        self.send.add(record.id.clone(), record).await
    }

    pub async fn find_send(&self, id: &str) -> Option<SendState> {
        self.send.find(id).await
    }

    pub async fn remove_send(&self, id: &str) -> Result<Option<SendState>> {
        self.send.remove(id).await
    }

    pub async fn list_sends(&self) -> Vec<SendState> {
        self.send.map_of().await.into_values().collect()
    }

    pub async fn find_active_local_mirror(&self, sr: &SrId, vdi: &VdiId) -> Option<SendState> {
        self.find_send(&ids::mirror_id_of(sr, vdi)).await
    }

    pub async fn remove_local_mirror(&self, sr: &SrId, vdi: &VdiId) -> Result<Option<SendState>> {
        self.remove_send(&ids::mirror_id_of(sr, vdi)).await
    }

    pub async fn add_receive(&self, record: ReceiveState) -> Result<()> {
        self.receive.add(record.id.clone(), record).await
    }

    pub async fn find_receive(&self, id: &str) -> Option<ReceiveState> {
        self.receive.find(id).await
    }

    pub async fn remove_receive(&self, id: &str) -> Result<Option<ReceiveState>> {
        self.receive.remove(id).await
    }

    pub async fn list_receives(&self) -> Vec<ReceiveState> {
        self.receive.map_of().await.into_values().collect()
    }

    pub async fn find_active_receive_mirror(&self, sr: &SrId, vdi: &VdiId) -> Option<ReceiveState> {
        self.find_receive(&ids::mirror_id_of(sr, vdi)).await
    }

    pub async fn remove_receive_mirror(
        &self,
        sr: &SrId,
        vdi: &VdiId,
    ) -> Result<Option<ReceiveState>> {
        self.remove_receive(&ids::mirror_id_of(sr, vdi)).await
    }

    pub async fn add_copy(&self, record: CopyState) -> Result<()> {
        self.copy.add(record.id.clone(), record).await
    }

    pub async fn find_copy(&self, id: &str) -> Option<CopyState> {
        self.copy.find(id).await
    }

    pub async fn remove_copy(&self, id: &str) -> Result<Option<CopyState>> {
        self.copy.remove(id).await
    }

    pub async fn list_copies(&self) -> Vec<CopyState> {
        self.copy.map_of().await.into_values().collect()
    }

    pub async fn find_active_copy(&self, dest_sr: &SrId, dest_vdi: &VdiId) -> Option<CopyState> {
        self.find_copy(&ids::copy_id_of(dest_sr, dest_vdi)).await
    }

    pub async fn remove_active_copy(
        &self,
        dest_sr: &SrId,
        dest_vdi: &VdiId,
    ) -> Result<Option<CopyState>> {
        self.remove_copy(&ids::copy_id_of(dest_sr, dest_vdi)).await
    }

    /// Clear all three tables. Used by tests and by operators recovering
    /// from a registry they've determined is unrecoverably stale.
    pub async fn clear_all(&self) -> Result<()> {
        self.send.clear().await?;
        self.receive.clear().await?;
        self.copy.clear().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_send(id: &str) -> SendState {
        SendState {
            id: id.to_string(),
            sr: "sr-1".to_string(),
            vdi: "vdi-1".to_string(),
            vm: "vm-1".to_string(),
            dest_sr: "sr-2".to_string(),
            remote_url: "https://dest".to_string(),
            verify_dest: false,
            remote_dp: "dp-1".to_string(),
            remote_mirror_vdi: "vdi-mirror".to_string(),
            remote_info: None,
            local_dp: "dp-local".to_string(),
            tapdev: None,
            failed: false,
            watchdog: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_find_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PersistentStateRegistry::new(dir.path());

        let record = sample_send("sr-1/vdi-1");
        registry.add_send(record.clone()).await.unwrap();

        let found = registry.find_send("sr-1/vdi-1").await.unwrap();
        assert_eq!(found.vm, "vm-1");

        let removed = registry.remove_send("sr-1/vdi-1").await.unwrap();
        assert!(removed.is_some());
        assert!(registry.find_send("sr-1/vdi-1").await.is_none());
    }

    #[tokio::test]
    async fn survives_restart_via_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = PersistentStateRegistry::new(dir.path());
            registry.add_send(sample_send("sr-1/vdi-1")).await.unwrap();
        }

        let reopened = PersistentStateRegistry::new(dir.path());
        let found = reopened.find_send("sr-1/vdi-1").await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn corrupt_file_is_advisory_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("storage_mirrors_send.json"), "not json").unwrap();

        let registry = PersistentStateRegistry::new(dir.path());
        assert!(registry.find_send("anything").await.is_none());
        assert!(registry.list_sends().await.is_empty());
    }

    #[tokio::test]
    async fn active_local_mirror_lookup_uses_mirror_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PersistentStateRegistry::new(dir.path());
        registry
            .add_send(sample_send(&ids::mirror_id_of("sr-1", "vdi-1")))
            .await
            .unwrap();

        let found = registry
            .find_active_local_mirror(&"sr-1".to_string(), &"vdi-1".to_string())
            .await;
        assert!(found.is_some());
    }
}
