use chrono::Utc;
use costlink_contracts::{ExpenseItem, ItemError, ItemResult};
use costlink_kernel::{
    append_audit_line, audit_line, format_minor, parse_amount_minor, pick_candidate,
    stored_minor, year_window, CandidateMatch,
};
use reqwest::Method;
use serde_json::{json, Value};

use crate::gateway::{CallTimeout, Gateway};
use crate::processing_log::ProcessingLog;

const DOCUMENT_PATH: &str = "entity/demand";
const DEFAULT_DISTRIBUTION: &str = "price";
const CANDIDATES_IN_LOG: usize = 5;

#[derive(Debug, Clone)]
pub struct ExpenseBatch {
    pub items: Vec<ExpenseItem>,
    pub category: String,
    pub year: i32,
    pub currency: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub account_id: String,
    pub account_name: String,
}

#[derive(Debug)]
pub struct BatchReport {
    pub processed: usize,
    pub errors: usize,
    pub results: Vec<ItemResult>,
    pub error_details: Vec<ItemError>,
    pub log: ProcessingLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentRef {
    id: String,
    name: String,
}

pub struct ExpensePoster<'a> {
    gateway: &'a Gateway,
}

impl<'a> ExpensePoster<'a> {
    pub fn new(gateway: &'a Gateway) -> Self {
        Self { gateway }
    }

    pub async fn process_batch(
        &self,
        credential: &str,
        tenant: &TenantContext,
        batch: &ExpenseBatch,
    ) -> BatchReport {
        let mut log = ProcessingLog::new(&tenant.account_id, &tenant.account_name);
        log.line(format!(
            "Позиций: {}, год: {}, категория по умолчанию: {}",
            batch.items.len(),
            batch.year,
            batch.category
        ));

        let mut results = Vec::new();
        let mut error_details = Vec::new();
        for item in &batch.items {
            let number = item.demand_number.trim();
            let amount = parse_amount_minor(&item.expense);
            let amount = match amount {
                Some(v) if v > 0 && !number.is_empty() => v,
                _ => {
                    log.line(format!(
                        "Пропуск: номер «{number}», сумма {}",
                        item.expense
                    ));
                    continue;
                }
            };
            let category = item
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(batch.category.as_str());

            match self
                .apply(credential, number, amount, category, batch, &mut log)
                .await
            {
                Ok(result) => {
                    log.line(format!(
                        "OK {}: +{} → {}",
                        result.demand_name, result.added, result.new_total
                    ));
                    results.push(result);
                }
                Err(error) => {
                    log.line(format!("Ошибка {number}: {error}"));
                    error_details.push(ItemError {
                        demand_number: number.to_string(),
                        error,
                    });
                }
            }
        }

        let processed = results.len();
        let errors = error_details.len();
        log.finalize(processed, errors);
        tracing::info!(
            account_id = %tenant.account_id,
            processed,
            errors,
            "expense batch finished"
        );
        BatchReport {
            processed,
            errors,
            results,
            error_details,
            log,
        }
    }

    async fn apply(
        &self,
        credential: &str,
        number: &str,
        amount: i64,
        category: &str,
        batch: &ExpenseBatch,
        log: &mut ProcessingLog,
    ) -> Result<ItemResult, String> {
        let doc = self.find_document(credential, number, batch.year, log).await?;

        let current = self
            .gateway
            .call(
                Method::GET,
                &format!("{DOCUMENT_PATH}/{}", doc.id),
                credential,
                None,
                CallTimeout::Data,
            )
            .await;
        if !current.is_success() {
            return Err(format!("не удалось прочитать документ: {}", current.error_message()));
        }
        let body = current.json().cloned().unwrap_or(Value::Null);
        let overhead = body.get("overhead");
        let previous = match overhead.and_then(|o| o.get("sum")) {
            None | Some(Value::Null) => 0,
            Some(sum) => stored_minor(sum)
                .ok_or_else(|| format!("нечитаемая сумма накладных расходов: {sum}"))?,
        };
        let distribution = overhead
            .and_then(|o| o.get("distribution"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_DISTRIBUTION);
        let new_total = previous
            .checked_add(amount)
            .ok_or_else(|| "переполнение суммы накладных расходов".to_string())?;

        let line = audit_line(Utc::now(), amount, batch.currency.as_deref(), category);
        let description = append_audit_line(body.get("description").and_then(Value::as_str), &line);

        let update = json!({
            "overhead": { "sum": new_total, "distribution": distribution },
            "description": description,
        });
        let written = self
            .gateway
            .call(
                Method::PUT,
                &format!("{DOCUMENT_PATH}/{}", doc.id),
                credential,
                Some(&update),
                CallTimeout::Data,
            )
            .await;
        if !written.is_success() {
            return Err(format!("ERP отклонил обновление: {}", written.error_message()));
        }

        Ok(ItemResult {
            demand_number: number.to_string(),
            demand_id: doc.id,
            demand_name: doc.name,
            category: category.to_string(),
            added: format_minor(amount),
            added_minor: amount,
            previous_total: format_minor(previous),
            new_total: format_minor(new_total),
            new_total_minor: new_total,
        })
    }

    async fn find_document(
        &self,
        credential: &str,
        number: &str,
        year: i32,
        log: &mut ProcessingLog,
    ) -> Result<DocumentRef, String> {
        if number.contains(';') {
            return Err("недопустимый символ «;» в номере документа".to_string());
        }
        let (from, to) = year_window(year);
        let window = format!("moment>={from};moment<={to}");

        let exact = self
            .search(credential, &format!("name={number};{window}"))
            .await?;
        if let Some(doc) = exact.iter().find(|d| d.name == number) {
            return Ok(doc.clone());
        }

        let fuzzy = self
            .search(credential, &format!("name~{number};{window}"))
            .await?;
        let names: Vec<String> = fuzzy.iter().map(|d| d.name.clone()).collect();
        match pick_candidate(number, &names) {
            CandidateMatch::Exact(idx) | CandidateMatch::Unique(idx) => {
                log.line(format!("{number}: найден по частичному совпадению «{}»", names[idx]));
                Ok(fuzzy[idx].clone())
            }
            CandidateMatch::NoMatch => {
                if !names.is_empty() {
                    log.line(format!(
                        "{number}: похожие документы: {}",
                        names
                            .iter()
                            .take(CANDIDATES_IN_LOG)
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                Err(format!("документ не найден за {year} год"))
            }
        }
    }

    async fn search(&self, credential: &str, filter: &str) -> Result<Vec<DocumentRef>, String> {
        let resp = self
            .gateway
            .call_with_query(
                Method::GET,
                DOCUMENT_PATH,
                &[("filter", filter.to_string()), ("limit", "100".to_string())],
                credential,
                None,
                CallTimeout::Data,
            )
            .await;
        if !resp.is_success() {
            return Err(format!("поиск документа не удался: {}", resp.error_message()));
        }
        Ok(resp
            .rows()
            .iter()
            .filter_map(|row| {
                Some(DocumentRef {
                    id: row.get("id")?.as_str()?.to_string(),
                    name: row.get("name")?.as_str()?.to_string(),
                })
            })
            .collect())
    }
}
