use chrono::Utc;
use costlink_contracts::{ActivationPayload, AppStatus, TenantRecord, TenantStatus};

use crate::dictionary::DictionaryManager;
use crate::store::{Store, StoreError};

pub struct Lifecycle<'a> {
    store: &'a Store,
    dictionary: DictionaryManager<'a>,
}

impl<'a> Lifecycle<'a> {
    pub fn new(store: &'a Store, dictionary: DictionaryManager<'a>) -> Self {
        Self { store, dictionary }
    }

    /// Upserts the tenant as active when the payload carries a usable
    /// credential. Without one the record is kept inactive and the vendor is
    /// told settings are required.
    pub async fn on_activate(
        &self,
        tenant_id: &str,
        app_id: &str,
        payload: &ActivationPayload,
    ) -> Result<AppStatus, StoreError> {
        let now = Utc::now().to_rfc3339();
        let credential = payload.first_credential().map(str::to_string);

        let mut tenants = self.store.tenants().await;
        let record = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantRecord {
                account_id: tenant_id.to_string(),
                app_id: app_id.to_string(),
                account_name: String::new(),
                status: TenantStatus::Inactive,
                access_token: None,
                created_at: now.clone(),
                activated_at: None,
                deactivated_at: None,
                tariff: None,
            });
        record.app_id = app_id.to_string();
        if let Some(name) = payload.account_name.as_deref().filter(|n| !n.trim().is_empty()) {
            record.account_name = name.to_string();
        }
        if payload.subscription.is_some() {
            record.tariff = payload.subscription.clone();
        }
        let status = match &credential {
            Some(_) => {
                record.status = TenantStatus::Active;
                record.access_token = credential.clone();
                record.activated_at = Some(now);
                AppStatus::Activated
            }
            None => {
                record.status = TenantStatus::Inactive;
                record.access_token = None;
                AppStatus::SettingsRequired
            }
        };
        self.store.save_tenants(tenants).await?;

        match (&credential, status) {
            (Some(token), AppStatus::Activated) => {
                tracing::info!(
                    account_id = tenant_id,
                    app_id,
                    token_prefix = %token.chars().take(6).collect::<String>(),
                    "tenant activated"
                );
                if let Err(e) = self.dictionary.ensure_dictionary(token, tenant_id).await {
                    tracing::warn!(account_id = tenant_id, error = %e, "dictionary setup after activation failed");
                }
            }
            _ => tracing::warn!(account_id = tenant_id, app_id, "activation without usable credential"),
        }
        Ok(status)
    }

    pub async fn on_deactivate(&self, tenant_id: &str) -> Result<bool, StoreError> {
        let mut tenants = self.store.tenants().await;
        let known = match tenants.get_mut(tenant_id) {
            Some(record) => {
                record.status = TenantStatus::Inactive;
                record.access_token = None;
                record.deactivated_at = Some(Utc::now().to_rfc3339());
                true
            }
            None => false,
        };
        if known {
            self.store.save_tenants(tenants).await?;
        }

        let mut sessions = self.store.sessions().await;
        let before = sessions.len();
        sessions.retain(|_, m| m.account_id != tenant_id);
        let purged = before - sessions.len();
        if purged > 0 {
            self.store.save_sessions(sessions).await?;
        }
        tracing::info!(account_id = tenant_id, known, purged, "tenant deactivated");
        Ok(known)
    }

    pub async fn on_status_query(&self, tenant_id: &str) -> AppStatus {
        match self.store.tenants().await.get(tenant_id) {
            Some(record) if record.is_usable() => AppStatus::Activated,
            _ => AppStatus::SettingsRequired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Gateway;
    use costlink_config::Erp;
    use costlink_contracts::{AccessEntry, SessionMapping};

    fn gateway() -> Gateway {
        Gateway::new(&Erp {
            base_url: "http://127.0.0.1:9".to_string(),
            data_timeout_ms: 200,
            lookup_timeout_ms: 200,
        })
        .unwrap()
    }

    fn payload(token: Option<&str>) -> ActivationPayload {
        ActivationPayload {
            access: vec![AccessEntry {
                resource: Some("api".to_string()),
                scope: vec![],
                access_token: token.map(str::to_string),
            }],
            account_name: Some("Shop".to_string()),
            subscription: Some(serde_json::json!({"tariffId": "t1"})),
        }
    }

    #[tokio::test]
    async fn activation_survives_dictionary_failure() {
        let store = Store::memory(10);
        let gw = gateway();
        let lifecycle = Lifecycle::new(&store, DictionaryManager::new(&store, &gw, "Категории"));

        let status = lifecycle
            .on_activate("acc", "app", &payload(Some("tok")))
            .await
            .unwrap();
        assert_eq!(status, AppStatus::Activated);
        let record = &store.tenants().await["acc"];
        assert_eq!(record.credential(), Some("tok"));
        assert_eq!(record.account_name, "Shop");
        assert!(record.tariff.is_some());
        assert_eq!(lifecycle.on_status_query("acc").await, AppStatus::Activated);
    }

    #[tokio::test]
    async fn activation_without_token_requires_settings() {
        let store = Store::memory(10);
        let gw = gateway();
        let lifecycle = Lifecycle::new(&store, DictionaryManager::new(&store, &gw, "Категории"));

        let status = lifecycle.on_activate("acc", "app", &payload(None)).await.unwrap();
        assert_eq!(status, AppStatus::SettingsRequired);
        assert_eq!(store.tenants().await["acc"].status, TenantStatus::Inactive);
    }

    #[tokio::test]
    async fn deactivation_clears_token_and_purges_sessions() {
        let store = Store::memory(10);
        let gw = gateway();
        let lifecycle = Lifecycle::new(&store, DictionaryManager::new(&store, &gw, "Категории"));
        lifecycle
            .on_activate("acc", "app", &payload(Some("tok")))
            .await
            .unwrap();

        let mut sessions = store.sessions().await;
        for (key, account) in [("s1", "acc"), ("s2", "other")] {
            sessions.insert(
                key.to_string(),
                SessionMapping {
                    account_id: account.to_string(),
                    account_name: String::new(),
                    created_at: Utc::now().to_rfc3339(),
                },
            );
        }
        store.save_sessions(sessions).await.unwrap();

        assert!(lifecycle.on_deactivate("acc").await.unwrap());
        let record = &store.tenants().await["acc"];
        assert_eq!(record.status, TenantStatus::Inactive);
        assert_eq!(record.access_token, None);
        assert!(record.deactivated_at.is_some());

        let sessions = store.sessions().await;
        assert!(!sessions.contains_key("s1"));
        assert!(sessions.contains_key("s2"));
        assert_eq!(
            lifecycle.on_status_query("acc").await,
            AppStatus::SettingsRequired
        );
        assert!(!lifecycle.on_deactivate("never-installed").await.unwrap());
    }
}
