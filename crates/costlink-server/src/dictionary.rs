use chrono::Utc;
use costlink_contracts::{Category, DictionaryBinding, EXPENSE_DICTIONARY_KEY};
use reqwest::Method;
use serde_json::{json, Value};
use thiserror::Error;

use crate::gateway::{ApiResponse, CallTimeout, Gateway};
use crate::store::Store;

const DICTIONARY_PATH: &str = "entity/customentity";
const DICTIONARY_METADATA_PATH: &str = "context/companysettings/metadata/customEntities";

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("erp request failed ({status}): {message}")]
    Gateway { status: u16, message: String },
    #[error("dictionary \"{0}\" exists but could not be located")]
    NotLocated(String),
    #[error("category name is empty")]
    EmptyName,
}

impl DictionaryError {
    fn from_response(resp: &ApiResponse) -> Self {
        DictionaryError::Gateway {
            status: resp.status,
            message: resp.error_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Created(Category),
    AlreadyExists(Category),
}

impl AddOutcome {
    pub fn category(&self) -> &Category {
        match self {
            AddOutcome::Created(c) | AddOutcome::AlreadyExists(c) => c,
        }
    }
}

pub struct DictionaryManager<'a> {
    store: &'a Store,
    gateway: &'a Gateway,
    name: &'a str,
}

impl<'a> DictionaryManager<'a> {
    pub fn new(store: &'a Store, gateway: &'a Gateway, name: &'a str) -> Self {
        Self {
            store,
            gateway,
            name,
        }
    }

    /// Cached binding if still alive, else create, else (on "already
    /// exists") the cached id or a scan by name.
    pub async fn ensure_dictionary(
        &self,
        credential: &str,
        tenant_id: &str,
    ) -> Result<String, DictionaryError> {
        let cached = self
            .store
            .settings()
            .await
            .get(tenant_id)
            .and_then(|s| s.dictionaries.get(EXPENSE_DICTIONARY_KEY))
            .map(|b| b.id.clone());

        if let Some(id) = &cached {
            let probe = self
                .gateway
                .call(
                    Method::GET,
                    &format!("{DICTIONARY_PATH}/{id}"),
                    credential,
                    None,
                    CallTimeout::Lookup,
                )
                .await;
            if probe.is_success() {
                self.bind(tenant_id, id).await;
                return Ok(id.clone());
            }
            tracing::info!(account_id = tenant_id, status = probe.status, "cached dictionary failed liveness check");
        }

        let created = self
            .gateway
            .call(
                Method::POST,
                DICTIONARY_PATH,
                credential,
                Some(&json!({ "name": self.name })),
                CallTimeout::Data,
            )
            .await;
        if created.is_success() {
            let id = created
                .json()
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| DictionaryError::from_response(&created))?;
            tracing::info!(account_id = tenant_id, dictionary_id = %id, "dictionary created");
            self.bind(tenant_id, &id).await;
            return Ok(id);
        }
        if !created.already_exists() {
            return Err(DictionaryError::from_response(&created));
        }

        if let Some(id) = cached {
            return Ok(id);
        }
        match self.find_by_name(credential).await? {
            Some(id) => {
                self.bind(tenant_id, &id).await;
                Ok(id)
            }
            None => Err(DictionaryError::NotLocated(self.name.to_string())),
        }
    }

    pub async fn list_categories(
        &self,
        credential: &str,
        dictionary_id: &str,
    ) -> Result<Vec<Category>, DictionaryError> {
        let resp = self
            .gateway
            .call(
                Method::GET,
                &format!("{DICTIONARY_PATH}/{dictionary_id}"),
                credential,
                None,
                CallTimeout::Data,
            )
            .await;
        if !resp.is_success() {
            return Err(DictionaryError::from_response(&resp));
        }
        Ok(resp.rows().iter().filter_map(category_from).collect())
    }

    /// Duplicate names (case-insensitive) are reported as
    /// [`AddOutcome::AlreadyExists`], not as an error.
    pub async fn add_category(
        &self,
        credential: &str,
        dictionary_id: &str,
        name: &str,
    ) -> Result<AddOutcome, DictionaryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DictionaryError::EmptyName);
        }
        let existing = self.list_categories(credential, dictionary_id).await?;
        if let Some(found) = find_named(&existing, name) {
            return Ok(AddOutcome::AlreadyExists(found));
        }

        let resp = self
            .gateway
            .call(
                Method::POST,
                &format!("{DICTIONARY_PATH}/{dictionary_id}"),
                credential,
                Some(&json!({ "name": name })),
                CallTimeout::Data,
            )
            .await;
        if resp.is_success() {
            let category = resp.json().and_then(category_from).unwrap_or(Category {
                id: String::new(),
                name: name.to_string(),
            });
            return Ok(AddOutcome::Created(category));
        }
        if resp.already_exists() {
            let refreshed = self.list_categories(credential, dictionary_id).await?;
            let found = find_named(&refreshed, name).unwrap_or(Category {
                id: String::new(),
                name: name.to_string(),
            });
            return Ok(AddOutcome::AlreadyExists(found));
        }
        Err(DictionaryError::from_response(&resp))
    }

    async fn find_by_name(&self, credential: &str) -> Result<Option<String>, DictionaryError> {
        let resp = self
            .gateway
            .call(
                Method::GET,
                DICTIONARY_METADATA_PATH,
                credential,
                None,
                CallTimeout::Lookup,
            )
            .await;
        if !resp.is_success() {
            return Err(DictionaryError::from_response(&resp));
        }
        let wanted = self.name.trim().to_lowercase();
        Ok(resp
            .rows()
            .iter()
            .find(|row| {
                row.get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| n.trim().to_lowercase() == wanted)
                    .unwrap_or(false)
            })
            .and_then(dictionary_id_from))
    }

    async fn bind(&self, tenant_id: &str, id: &str) {
        let mut settings = self.store.settings().await;
        settings.entry(tenant_id.to_string()).or_default().dictionaries.insert(
            EXPENSE_DICTIONARY_KEY.to_string(),
            DictionaryBinding {
                id: id.to_string(),
                name: self.name.to_string(),
                verified_at: Utc::now().to_rfc3339(),
            },
        );
        if let Err(e) = self.store.save_settings(&settings).await {
            tracing::warn!(account_id = tenant_id, error = %e, "failed to persist dictionary binding");
        }
    }
}

fn category_from(row: &Value) -> Option<Category> {
    Some(Category {
        id: row.get("id")?.as_str()?.to_string(),
        name: row.get("name")?.as_str()?.to_string(),
    })
}

fn find_named(categories: &[Category], name: &str) -> Option<Category> {
    let wanted = name.to_lowercase();
    categories
        .iter()
        .find(|c| c.name.trim().to_lowercase() == wanted)
        .cloned()
}

/// The id is the last segment of `entityMeta.href` unless given directly.
fn dictionary_id_from(row: &Value) -> Option<String> {
    if let Some(id) = row.get("id").and_then(|v| v.as_str()) {
        return Some(id.to_string());
    }
    let href = row
        .get("entityMeta")
        .and_then(|m| m.get("href"))
        .and_then(|h| h.as_str())?;
    href.split('?')
        .next()?
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
