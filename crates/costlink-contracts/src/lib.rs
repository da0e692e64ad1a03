use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SERVICE_NAME: &str = "costlink";
pub const SERVICE_VERSION: &str = "1.0.0";

pub const EXPENSE_DICTIONARY_KEY: &str = "expense_categories";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Inactive,
}

/// One ERP account integrated through the vendor marketplace. Records are
/// never removed; deactivation only clears the credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantRecord {
    pub account_id: String,
    pub app_id: String,
    #[serde(default)]
    pub account_name: String,
    pub status: TenantStatus,
    #[serde(default)]
    pub access_token: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub activated_at: Option<String>,
    #[serde(default)]
    pub deactivated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tariff: Option<Value>,
}

impl TenantRecord {
    /// The bearer token, but only for an active record with a non-blank token.
    pub fn credential(&self) -> Option<&str> {
        match (&self.status, self.access_token.as_deref()) {
            (TenantStatus::Active, Some(token)) if !token.trim().is_empty() => Some(token),
            _ => None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.credential().is_some()
    }

    /// Restores `active => credential` for records that lost their token.
    pub fn normalize(&mut self) {
        if self.status == TenantStatus::Active && !self.is_usable() {
            self.status = TenantStatus::Inactive;
            self.access_token = None;
        }
        if self.status == TenantStatus::Inactive {
            self.access_token = None;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMapping {
    pub account_id: String,
    #[serde(default)]
    pub account_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DictionaryBinding {
    pub id: String,
    pub name: String,
    pub verified_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantSettings {
    #[serde(default)]
    pub dictionaries: BTreeMap<String, DictionaryBinding>,
}

pub type TenantsDocument = BTreeMap<String, TenantRecord>;
pub type SettingsDocument = BTreeMap<String, TenantSettings>;
pub type SessionsDocument = BTreeMap<String, SessionMapping>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessEntry {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationPayload {
    #[serde(default)]
    pub access: Vec<AccessEntry>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub subscription: Option<Value>,
}

impl ActivationPayload {
    pub fn first_credential(&self) -> Option<&str> {
        self.access
            .iter()
            .filter_map(|a| a.access_token.as_deref())
            .map(str::trim)
            .find(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppStatus {
    Activated,
    SettingsRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: AppStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelContext {
    #[serde(default)]
    pub context_key: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

impl PanelContext {
    pub fn merged(self, other: PanelContext) -> PanelContext {
        PanelContext {
            context_key: non_blank(other.context_key).or_else(|| non_blank(self.context_key)),
            account_id: non_blank(other.account_id).or_else(|| non_blank(self.account_id)),
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        self.context_key.as_deref().filter(|v| !v.trim().is_empty())
    }

    pub fn tenant_hint(&self) -> Option<&str> {
        self.account_id.as_deref().filter(|v| !v.trim().is_empty())
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoriesResponse {
    pub categories: Vec<Category>,
    pub account_id: String,
    pub account_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCategoryRequest {
    pub name: String,
    #[serde(flatten)]
    pub context: PanelContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCategoryResponse {
    pub success: bool,
    pub category: Category,
    pub already_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseItem {
    #[serde(default)]
    pub demand_number: String,
    #[serde(default)]
    pub expense: Value,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExpensesRequest {
    #[serde(default)]
    pub expenses: Vec<ExpenseItem>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(flatten)]
    pub context: PanelContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub demand_number: String,
    pub demand_id: String,
    pub demand_name: String,
    pub category: String,
    pub added: String,
    pub added_minor: i64,
    pub previous_total: String,
    pub new_total: String,
    pub new_total_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub demand_number: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExpensesResponse {
    pub success: bool,
    pub processed: usize,
    pub errors: usize,
    pub results: Vec<ItemResult>,
    pub error_details: Vec<ItemError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}
