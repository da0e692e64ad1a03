use chrono::Utc;
use costlink_contracts::{SessionMapping, TenantRecord};
use thiserror::Error;

use crate::context::ContextVerifier;
use crate::gateway::Gateway;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Hint,
    SessionMap,
    Verified,
    SingleTenant,
}

impl ResolvedVia {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolvedVia::Hint => "hint",
            ResolvedVia::SessionMap => "session_map",
            ResolvedVia::Verified => "verified",
            ResolvedVia::SingleTenant => "single_tenant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTenant {
    pub account_id: String,
    pub account_name: String,
    pub credential: String,
    pub via: ResolvedVia,
}

impl ResolvedTenant {
    fn from_record(record: &TenantRecord, via: ResolvedVia) -> Option<Self> {
        Some(Self {
            account_id: record.account_id.clone(),
            account_name: record.account_name.clone(),
            credential: record.credential()?.to_string(),
            via,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no active tenant is installed")]
    NoTenants,
    #[error("ambiguous tenant: {count} active tenants and no identifying signal")]
    Ambiguous { count: usize },
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::NoTenants => "no_tenant",
            ResolveError::Ambiguous { .. } => "ambiguous",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ResolveError::NoTenants => {
                "Приложение не установлено ни в одном аккаунте. Переустановите приложение."
                    .to_string()
            }
            ResolveError::Ambiguous { count } => format!(
                "Не удалось определить аккаунт: подключено аккаунтов: {count}. Укажите accountId явно."
            ),
        }
    }
}

pub struct TenantResolver<'a> {
    store: &'a Store,
    gateway: &'a Gateway,
    verifier: &'a ContextVerifier,
}

impl<'a> TenantResolver<'a> {
    pub fn new(store: &'a Store, gateway: &'a Gateway, verifier: &'a ContextVerifier) -> Self {
        Self {
            store,
            gateway,
            verifier,
        }
    }

    pub async fn resolve(
        &self,
        session_key: Option<&str>,
        tenant_hint: Option<&str>,
    ) -> Result<ResolvedTenant, ResolveError> {
        let session_key = session_key.map(str::trim).filter(|k| !k.is_empty());
        let tenant_hint = tenant_hint.map(str::trim).filter(|k| !k.is_empty());

        if let Some(hint) = tenant_hint {
            let tenants = self.store.tenants().await;
            match tenants
                .get(hint)
                .and_then(|r| ResolvedTenant::from_record(r, ResolvedVia::Hint))
            {
                Some(resolved) => return Ok(self.remember(session_key, resolved).await),
                None => tracing::info!(account_id = hint, "tenant hint is not an active tenant"),
            }
        }

        if let Some(key) = session_key {
            if let Some(resolved) = self.from_session_map(key).await {
                return Ok(resolved);
            }
            if let Some(resolved) = self.from_verification(key).await {
                return Ok(self.remember(session_key, resolved).await);
            }
        }

        let tenants = self.store.tenants().await;
        let usable: Vec<&TenantRecord> = tenants.values().filter(|r| r.is_usable()).collect();
        match usable.as_slice() {
            [only] => match ResolvedTenant::from_record(only, ResolvedVia::SingleTenant) {
                Some(resolved) => Ok(self.remember(session_key, resolved).await),
                None => Err(ResolveError::NoTenants),
            },
            [] => {
                tracing::warn!("tenant resolution failed: no active tenants");
                Err(ResolveError::NoTenants)
            }
            many => {
                tracing::warn!(count = many.len(), "tenant resolution ambiguous");
                Err(ResolveError::Ambiguous { count: many.len() })
            }
        }
    }

    async fn from_session_map(&self, key: &str) -> Option<ResolvedTenant> {
        let mut sessions = self.store.sessions().await;
        let mapping = sessions.get(key)?.clone();

        let tenants = self.store.tenants().await;
        if let Some(resolved) = tenants
            .get(&mapping.account_id)
            .and_then(|r| ResolvedTenant::from_record(r, ResolvedVia::SessionMap))
        {
            return Some(resolved);
        }

        tracing::info!(
            account_id = %mapping.account_id,
            "evicting session mapping to an inactive tenant"
        );
        sessions.remove(key);
        if let Err(e) = self.store.save_sessions(sessions).await {
            tracing::warn!(error = %e, "failed to evict stale session mapping");
        }
        None
    }

    async fn from_verification(&self, key: &str) -> Option<ResolvedTenant> {
        let verified = match self.verifier.verify(self.gateway, key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::info!(error = %e, "session context verification unavailable");
                return None;
            }
        };
        let tenants = self.store.tenants().await;
        let mut resolved = tenants
            .get(&verified.account_id)
            .and_then(|r| ResolvedTenant::from_record(r, ResolvedVia::Verified));
        if let (Some(resolved), Some(name)) = (resolved.as_mut(), verified.account_name) {
            if resolved.account_name.trim().is_empty() {
                resolved.account_name = name;
            }
        }
        if resolved.is_none() {
            tracing::info!(
                account_id = %verified.account_id,
                "verified session points at an unknown or inactive tenant"
            );
        }
        resolved
    }

    async fn remember(&self, session_key: Option<&str>, resolved: ResolvedTenant) -> ResolvedTenant {
        let Some(key) = session_key else {
            return resolved;
        };
        let mut sessions = self.store.sessions().await;
        let created_at = match sessions.get(key) {
            Some(existing) if existing.account_id == resolved.account_id => {
                existing.created_at.clone()
            }
            _ => Utc::now().to_rfc3339(),
        };
        sessions.insert(
            key.to_string(),
            SessionMapping {
                account_id: resolved.account_id.clone(),
                account_name: resolved.account_name.clone(),
                created_at,
            },
        );
        if let Err(e) = self.store.save_sessions(sessions).await {
            tracing::warn!(error = %e, "failed to persist session mapping");
        }
        tracing::debug!(
            account_id = %resolved.account_id,
            via = resolved.via.as_str(),
            "session mapped to tenant"
        );
        resolved
    }
}
