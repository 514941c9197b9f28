//! Worker Data Manager (component A): the per-worker subsystem that
//! fetches, caches, and publishes parameter values, per spec §4.5.

use crate::errors::{Result, RuntimeError};
use crate::ids::Renaming;
use crate::types::{ParamType, Parameter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Where the bytes behind a renaming currently live on this worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataLocation {
    File(PathBuf),
    Object(Vec<u8>),
    StorageId(String),
    BindingHandle(String),
}

/// Per-renaming bookkeeping the Data Manager owns locally. Guarded by
/// its own lock so two registers are never locked simultaneously — the
/// map lock (on `DataManager::registers`) is held only for lookup and
/// insert, never across an await.
#[derive(Debug, Default)]
pub struct DataRegister {
    pub locations: Vec<DataLocation>,
    pub in_flight: bool,
}

/// Outcome `fetchParam` reports back to the caller's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    FetchedLocal,
    FetchedValue(Renaming),
    ErrorFetchingValue(String),
}

/// Pull of a renaming onto this worker from any source the param lists.
/// One implementation per transport backend (SSH/NIO/Container/Cloud);
/// the core only ever depends on this trait.
#[async_trait]
pub trait TransferProvider: Send + Sync {
    async fn ask_for_transfer(&self, renaming: &Renaming, sources: &[String]) -> Result<DataLocation>;
}

/// PSCO collaborator. Absence of configuration disables PSCO support
/// silently (spec §6) — callers should treat a `None` backend as "PSCO
/// params always fail with StorageBackendError".
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_by_id(&self, psco_id: &str) -> Result<Vec<u8>>;
    async fn new_replica(&self, psco_id: &str, host: &str) -> Result<String>;
    async fn new_version(&self, psco_id: &str) -> Result<String>;
}

/// Local-filesystem reference `TransferProvider`, grounded in the
/// worker-agent's role as a demonstration backend (no remote transport).
pub struct LocalFsTransferProvider {
    pub root: PathBuf,
}

#[async_trait]
impl TransferProvider for LocalFsTransferProvider {
    async fn ask_for_transfer(&self, renaming: &Renaming, sources: &[String]) -> Result<DataLocation> {
        for source in sources {
            let path = self.root.join(source);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(DataLocation::File(path));
            }
        }
        Err(RuntimeError::Transfer {
            renaming: renaming.to_string(),
            reason: "no live source reachable".into(),
        })
    }
}

pub struct DataManager {
    registers: RwLock<HashMap<Renaming, Arc<Mutex<DataRegister>>>>,
    /// In-process cache for BINDING_OBJECT parameters (checked first,
    /// per the strict fallback order in spec §4.5).
    binding_cache: RwLock<HashMap<Renaming, String>>,
    transfer: Arc<dyn TransferProvider>,
    storage: Option<Arc<dyn StorageBackend>>,
    allow_non_atomic_move: bool,
}

impl DataManager {
    pub fn new(transfer: Arc<dyn TransferProvider>, storage: Option<Arc<dyn StorageBackend>>, allow_non_atomic_move: bool) -> Self {
        Self {
            registers: RwLock::new(HashMap::new()),
            binding_cache: RwLock::new(HashMap::new()),
            transfer,
            storage,
            allow_non_atomic_move,
        }
    }

    async fn register_for(&self, renaming: &Renaming) -> Arc<Mutex<DataRegister>> {
        if let Some(r) = self.registers.read().await.get(renaming) {
            return r.clone();
        }
        let mut map = self.registers.write().await;
        map.entry(renaming.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DataRegister::default())))
            .clone()
    }

    /// Dispatches `fetchParam` by type tag, per the per-kind contracts
    /// of spec §4.5. `preserve_source`: true keeps the source register
    /// intact after a local copy (invariant (ii) — never deletes it).
    pub async fn fetch_param(&self, param: &Parameter, preserve_source: bool) -> Result<FetchOutcome> {
        match param.param_type {
            ParamType::File => self.fetch_file(param, preserve_source).await,
            ParamType::Object => self.fetch_object(param, preserve_source).await,
            ParamType::Psco | ParamType::ExternalPsco => self.fetch_psco(param).await,
            ParamType::BindingObject => self.fetch_binding_object(param, preserve_source).await,
            ParamType::Collection => self.fetch_collection(param, preserve_source).await,
            ParamType::Stream | ParamType::Primitive => Ok(FetchOutcome::FetchedLocal),
        }
    }

    async fn renaming_of(&self, param: &Parameter) -> Option<Renaming> {
        param.read_renaming.clone().or_else(|| param.write_renaming.clone())
    }

    async fn fetch_file(&self, param: &Parameter, preserve_source: bool) -> Result<FetchOutcome> {
        let Some(renaming) = self.renaming_of(param).await else {
            return Err(RuntimeError::Load(String::new(), "parameter has no assigned renaming".into()));
        };
        let register = self.register_for(&renaming).await;
        {
            let guard = register.lock().await;
            if guard.in_flight {
                return Ok(FetchOutcome::FetchedValue(renaming));
            }
            if guard.locations.iter().any(|l| matches!(l, DataLocation::File(p) if p.exists())) {
                return Ok(FetchOutcome::FetchedLocal);
            }
        }

        {
            let mut guard = register.lock().await;
            if let Some(DataLocation::File(existing)) = guard.locations.first().cloned() {
                let target = existing.with_extension("copy");
                if preserve_source {
                    tokio::fs::copy(&existing, &target)
                        .await
                        .map_err(|e| RuntimeError::Load(renaming.to_string(), e.to_string()))?;
                } else {
                    self.move_atomic_with_fallback(&existing, &target).await?;
                }
                guard.locations.push(DataLocation::File(target));
                return Ok(FetchOutcome::FetchedLocal);
            }
        }

        let mut guard = register.lock().await;
        guard.in_flight = true;
        drop(guard);
        let sources = param.prefix.split(',').map(str::to_string).collect::<Vec<_>>();
        let outcome = self.transfer.ask_for_transfer(&renaming, &sources).await;
        let mut guard = register.lock().await;
        guard.in_flight = false;
        match outcome {
            Ok(location) => {
                guard.locations.push(location);
                Ok(FetchOutcome::FetchedValue(renaming))
            }
            Err(e) => Ok(FetchOutcome::ErrorFetchingValue(e.to_string())),
        }
    }

    async fn move_atomic_with_fallback(&self, from: &std::path::Path, to: &std::path::Path) -> Result<()> {
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) if self.allow_non_atomic_move => {
                tracing::warn!(%e, "atomic move failed, falling back to copy+remove");
                tokio::fs::copy(from, to)
                    .await
                    .map_err(|e| RuntimeError::Load(to.display().to_string(), e.to_string()))?;
                let _ = tokio::fs::remove_file(from).await;
                Ok(())
            }
            Err(e) => Err(RuntimeError::Load(to.display().to_string(), e.to_string())),
        }
    }

    async fn fetch_object(&self, param: &Parameter, preserve_source: bool) -> Result<FetchOutcome> {
        let Some(renaming) = self.renaming_of(param).await else {
            return Err(RuntimeError::Load(String::new(), "parameter has no assigned renaming".into()));
        };
        let register = self.register_for(&renaming).await;
        let guard = register.lock().await;
        if let Some(DataLocation::Object(bytes)) = guard.locations.first().cloned() {
            drop(guard);
            let mut guard = register.lock().await;
            if preserve_source {
                // Preserving fetch: the source stays live and the fetched
                // copy is tracked alongside it as its own entry.
                guard.locations.push(DataLocation::Object(bytes));
            } else {
                // Non-preserving fetch: the source value is consumed, so the
                // register collapses to exactly the value being handed over.
                guard.locations = vec![DataLocation::Object(bytes)];
            }
            return Ok(FetchOutcome::FetchedLocal);
        }
        drop(guard);
        let sources = Vec::new();
        match self.transfer.ask_for_transfer(&renaming, &sources).await {
            Ok(location) => {
                register.lock().await.locations.push(location);
                Ok(FetchOutcome::FetchedValue(renaming))
            }
            Err(e) => Ok(FetchOutcome::ErrorFetchingValue(e.to_string())),
        }
    }

    async fn fetch_psco(&self, param: &Parameter) -> Result<FetchOutcome> {
        let Some(storage) = &self.storage else {
            return Err(RuntimeError::StorageBackend("PSCO support disabled (no storage.config)".into()));
        };
        let renaming = self.renaming_of(param).await.unwrap_or_else(|| Renaming(param.formal_name.clone()));
        let psco_id = param.formal_name.clone();
        storage.get_by_id(&psco_id).await?;
        let register = self.register_for(&renaming).await;
        register.lock().await.locations.push(DataLocation::StorageId(psco_id));
        Ok(FetchOutcome::FetchedLocal)
    }

    async fn fetch_binding_object(&self, param: &Parameter, preserve_source: bool) -> Result<FetchOutcome> {
        let Some(renaming) = self.renaming_of(param).await else {
            return Err(RuntimeError::Load(String::new(), "parameter has no assigned renaming".into()));
        };
        if let Some(handle) = self.binding_cache.read().await.get(&renaming).cloned() {
            return Ok(FetchOutcome::FetchedValue(Renaming(handle)));
        }
        // Fallback order is strict: cached source entry, then file, then transfer.
        let register = self.register_for(&renaming).await;
        {
            let guard = register.lock().await;
            if let Some(loc) = guard.locations.first().cloned() {
                drop(guard);
                self.binding_cache.write().await.insert(renaming.clone(), format!("{loc:?}"));
                return Ok(FetchOutcome::FetchedLocal);
            }
        }
        match self.fetch_file(param, preserve_source).await? {
            FetchOutcome::FetchedLocal | FetchOutcome::FetchedValue(_) => Ok(FetchOutcome::FetchedLocal),
            other => Ok(other),
        }
    }

    async fn fetch_collection(&self, param: &Parameter, preserve_source: bool) -> Result<FetchOutcome> {
        if param.elements.is_empty() {
            return Ok(FetchOutcome::FetchedLocal);
        }
        let children = param
            .elements
            .iter()
            .enumerate()
            .map(|(ordinal, child)| async move {
                let outcome = self.fetch_param(child, preserve_source).await?;
                Ok::<_, RuntimeError>((ordinal, child.param_type, outcome))
            });
        let results = futures::future::join_all(children).await;

        let mut manifest_lines = Vec::with_capacity(results.len());
        for r in results {
            let (ordinal, param_type, outcome) = r?;
            if let FetchOutcome::ErrorFetchingValue(reason) = outcome {
                return Err(RuntimeError::Transfer {
                    renaming: param.formal_name.clone(),
                    reason,
                });
            }
            manifest_lines.push(format!("{ordinal} {param_type:?}"));
        }

        if let Some(renaming) = self.renaming_of(param).await {
            let register = self.register_for(&renaming).await;
            if let Some(DataLocation::File(manifest_path)) = register.lock().await.locations.first().cloned() {
                tokio::fs::write(&manifest_path, manifest_lines.join("\n"))
                    .await
                    .map_err(|e| RuntimeError::Load(renaming.to_string(), e.to_string()))?;
            }
        }
        Ok(FetchOutcome::FetchedLocal)
    }

    /// Final cache lookup right before execution: rehydrates an
    /// in-memory object value after any pending transfer drained.
    pub async fn load_param(&self, param: &Parameter) -> Result<Vec<u8>> {
        let Some(renaming) = self.renaming_of(param).await else {
            return Err(RuntimeError::Load(String::new(), "parameter has no assigned renaming".into()));
        };
        let register = self.register_for(&renaming).await;
        let guard = register.lock().await;
        match guard.locations.last() {
            Some(DataLocation::Object(bytes)) => Ok(bytes.clone()),
            Some(DataLocation::File(path)) => {
                let path = path.clone();
                drop(guard);
                tokio::fs::read(&path).await.map_err(|e| RuntimeError::Load(renaming.to_string(), e.to_string()))
            }
            Some(DataLocation::StorageId(id)) => Ok(id.clone().into_bytes()),
            Some(DataLocation::BindingHandle(h)) => Ok(h.clone().into_bytes()),
            None => Err(RuntimeError::NoSources(renaming.to_string())),
        }
    }

    /// Publishes a produced value into the registry after execution.
    pub async fn store_param(&self, param: &Parameter, value: DataLocation) -> Result<()> {
        let Some(renaming) = param.write_renaming.clone() else {
            return Err(RuntimeError::Submission("store_param on a non-write parameter".into()));
        };
        let register = self.register_for(&renaming).await;
        register.lock().await.locations.push(value);
        Ok(())
    }

    /// Evicts file entries for the given renamings; clears associated
    /// registers. Idempotent: calling twice on the same set is a no-op.
    pub async fn remove_obsoletes(&self, renamings: &[Renaming]) -> Result<()> {
        let mut map = self.registers.write().await;
        for renaming in renamings {
            if let Some(register) = map.remove(renaming) {
                let guard = register.lock().await;
                for loc in &guard.locations {
                    if let DataLocation::File(path) = loc {
                        let _ = tokio::fs::remove_file(path).await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn get_object(&self, renaming: &Renaming) -> Result<Vec<u8>> {
        let register = self.register_for(renaming).await;
        let guard = register.lock().await;
        match guard.locations.last() {
            Some(DataLocation::Object(bytes)) => Ok(bytes.clone()),
            Some(DataLocation::File(path)) => {
                let path = path.clone();
                drop(guard);
                tokio::fs::read(&path).await.map_err(|e| RuntimeError::Load(renaming.to_string(), e.to_string()))
            }
            _ => Err(RuntimeError::NoSources(renaming.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMode, Parameter};

    struct AlwaysFails;

    #[async_trait]
    impl TransferProvider for AlwaysFails {
        async fn ask_for_transfer(&self, renaming: &Renaming, _sources: &[String]) -> Result<DataLocation> {
            Err(RuntimeError::Transfer {
                renaming: renaming.to_string(),
                reason: "no sources".into(),
            })
        }
    }

    fn make_manager() -> DataManager {
        DataManager::new(Arc::new(AlwaysFails), None, true)
    }

    #[tokio::test]
    async fn store_then_load_round_trip() {
        let dm = make_manager();
        let mut param = Parameter::new(crate::ids::Did(1), AccessMode::W, ParamType::Object, "x");
        param.write_renaming = Some(Renaming("d1_v1".into()));
        dm.store_param(&param, DataLocation::Object(b"hello".to_vec())).await.unwrap();

        param.read_renaming = param.write_renaming.clone();
        let value = dm.load_param(&param).await.unwrap();
        assert_eq!(value, b"hello");
    }

    #[tokio::test]
    async fn remove_obsoletes_is_idempotent() {
        let dm = make_manager();
        let renaming = Renaming("d2_v1".into());
        dm.remove_obsoletes(&[renaming.clone()]).await.unwrap();
        dm.remove_obsoletes(&[renaming]).await.unwrap();
    }

    #[tokio::test]
    async fn psco_without_storage_backend_fails() {
        let dm = make_manager();
        let mut param = Parameter::new(crate::ids::Did(3), AccessMode::R, ParamType::Psco, "psco-id");
        param.read_renaming = Some(Renaming("d3_v0".into()));
        let err = dm.fetch_param(&param, true).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StorageBackend(_)));
    }

    #[tokio::test]
    async fn fetch_object_preserve_source_keeps_both_entries() {
        let dm = make_manager();
        let renaming = Renaming("d5_v0".into());
        let register = dm.register_for(&renaming).await;
        register.lock().await.locations.push(DataLocation::Object(b"x".to_vec()));

        let mut param = Parameter::new(crate::ids::Did(5), AccessMode::R, ParamType::Object, "in");
        param.read_renaming = Some(renaming.clone());
        dm.fetch_param(&param, true).await.unwrap();

        assert_eq!(dm.register_for(&renaming).await.lock().await.locations.len(), 2);
    }

    #[tokio::test]
    async fn fetch_object_without_preserve_collapses_to_single_entry() {
        let dm = make_manager();
        let renaming = Renaming("d6_v0".into());
        let register = dm.register_for(&renaming).await;
        register.lock().await.locations.push(DataLocation::Object(b"x".to_vec()));

        let mut param = Parameter::new(crate::ids::Did(6), AccessMode::R, ParamType::Object, "in");
        param.read_renaming = Some(renaming.clone());
        dm.fetch_param(&param, false).await.unwrap();

        assert_eq!(dm.register_for(&renaming).await.lock().await.locations.len(), 1);
    }
}
