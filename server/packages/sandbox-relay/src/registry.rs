use std::collections::HashMap;
use std::sync::Arc;

use sandbox_relay_error::SandboxError;
use tokio::sync::{Mutex, RwLock};

use crate::provider::{BackendKind, SandboxBackend, SandboxProvider};

pub const MIN_SANDBOX_ID_LEN: usize = 8;
const MAX_SANDBOX_ID_LEN: usize = 128;

/// Owns the sandbox id → provider map. Every lookup, registration and teardown goes through here.
#[derive(Debug)]
pub struct SandboxRegistry {
    backend: Arc<dyn SandboxBackend>,
    providers: RwLock<HashMap<String, Arc<dyn SandboxProvider>>>,
    attach_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub fn validate_sandbox_id(sandbox_id: &str) -> Result<(), SandboxError> {
    let valid_chars = sandbox_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if sandbox_id.len() < MIN_SANDBOX_ID_LEN || sandbox_id.len() > MAX_SANDBOX_ID_LEN || !valid_chars
    {
        return Err(SandboxError::InvalidRequest {
            message: format!(
                "sandbox id must be {MIN_SANDBOX_ID_LEN}-{MAX_SANDBOX_ID_LEN} characters of [A-Za-z0-9_-]"
            ),
        });
    }
    Ok(())
}

impl SandboxRegistry {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            providers: RwLock::new(HashMap::new()),
            attach_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn get(&self, sandbox_id: &str) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.read().await.get(sandbox_id).cloned()
    }

    /// Returns the registered provider or re-attaches through the backend.
    ///
    /// Concurrent callers for one id share a per-id lock, so at most one attach reaches the
    /// backend and all callers observe the same provider. Returns `Ok(None)` when the backend
    /// cannot produce a live, describable sandbox.
    pub async fn get_or_create(
        &self,
        sandbox_id: &str,
    ) -> Result<Option<Arc<dyn SandboxProvider>>, SandboxError> {
        validate_sandbox_id(sandbox_id)?;
        if let Some(existing) = self.get(sandbox_id).await {
            return Ok(Some(existing));
        }

        let lock = {
            let mut locks = self.attach_locks.lock().await;
            locks
                .entry(sandbox_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let attached = {
            let _guard = lock.lock().await;
            self.attach_once(sandbox_id).await
        };

        // Callers still waiting hold their own clone; the last one out drops the entry.
        let mut locks = self.attach_locks.lock().await;
        let is_ours = locks
            .get(sandbox_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock));
        if is_ours && Arc::strong_count(&lock) <= 2 {
            locks.remove(sandbox_id);
        }
        Ok(attached)
    }

    async fn attach_once(&self, sandbox_id: &str) -> Option<Arc<dyn SandboxProvider>> {
        if let Some(existing) = self.get(sandbox_id).await {
            return Some(existing);
        }

        let attached = match self.backend.attach(sandbox_id).await {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                tracing::info!(sandbox_id, "registry: backend does not know sandbox");
                return None;
            }
            Err(err) => {
                tracing::warn!(sandbox_id, error = %err, "registry: reattach failed");
                return None;
            }
        };

        match attached.describe().await {
            Ok(Some(info)) if info.sandbox_id == sandbox_id => {}
            Ok(_) => {
                tracing::warn!(sandbox_id, "registry: reattached sandbox is not describable");
                return None;
            }
            Err(err) => {
                tracing::warn!(sandbox_id, error = %err, "registry: describe after reattach failed");
                return None;
            }
        }

        self.providers
            .write()
            .await
            .insert(sandbox_id.to_string(), attached.clone());
        tracing::info!(sandbox_id, "registry: sandbox reattached");
        Some(attached)
    }

    /// Like [`Self::get_or_create`] but a missing sandbox is a `SandboxNotFound` error.
    pub async fn resolve(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        self.get_or_create(sandbox_id)
            .await?
            .ok_or_else(|| SandboxError::SandboxNotFound {
                sandbox_id: sandbox_id.to_string(),
            })
    }

    pub async fn register(
        &self,
        sandbox_id: &str,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<(), SandboxError> {
        validate_sandbox_id(sandbox_id)?;
        let mut providers = self.providers.write().await;
        if let Some(existing) = providers.get(sandbox_id) {
            if Arc::ptr_eq(existing, &provider) {
                return Ok(());
            }
            return Err(SandboxError::InvalidRequest {
                message: format!("sandbox '{sandbox_id}' is already registered"),
            });
        }
        providers.insert(sandbox_id.to_string(), provider);
        tracing::info!(sandbox_id, "registry: sandbox registered");
        Ok(())
    }

    /// Terminates a sandbox and removes it. Returns `false` if nothing was registered.
    ///
    /// The entry stays registered until the backend confirms the teardown, so a failed
    /// terminate can be retried.
    pub async fn terminate(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        let Some(provider) = self.get(sandbox_id).await else {
            return Ok(false);
        };
        if let Err(err) = provider.terminate().await {
            tracing::warn!(sandbox_id, error = %err, "registry: terminate failed, keeping entry");
            return Err(err.into());
        }

        let mut providers = self.providers.write().await;
        if providers
            .get(sandbox_id)
            .is_some_and(|current| Arc::ptr_eq(current, &provider))
        {
            providers.remove(sandbox_id);
        }
        tracing::info!(sandbox_id, "registry: sandbox terminated");
        Ok(true)
    }

    pub async fn terminate_all(&self) {
        let providers = {
            let mut guard = self.providers.write().await;
            guard.drain().collect::<Vec<_>>()
        };

        for (sandbox_id, provider) in providers {
            if let Err(err) = provider.terminate().await {
                tracing::warn!(sandbox_id = %sandbox_id, error = %err, "registry: terminate failed during shutdown");
            }
        }
    }

    pub async fn sandbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
