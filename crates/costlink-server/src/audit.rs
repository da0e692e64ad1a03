use std::sync::Arc;

use chrono::Utc;
use costlink_kernel::jcs_sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuditRecord {
    pub audit_id: String,
    pub account_id: String,
    pub action: String,
    pub result: String,
    pub detail: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(account_id: &str, action: &str, result: &str, detail: impl Into<String>) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            account_id: account_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            detail: detail.into(),
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn seal_hash(&self) -> Result<String, String> {
        let mut seed = self.clone();
        seed.record_hash.clear();
        let value = serde_json::to_value(&seed).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    immutable_mirror: Option<Arc<Mutex<tokio::fs::File>>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

async fn open_append(path: &str) -> Result<tokio::fs::File, String> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| e.to_string())
}

impl AuditJsonl {
    pub async fn new(path: &str, immutable_mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = open_append(path).await?;
        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(Arc::new(Mutex::new(open_append(path).await?))),
            _ => None,
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            immutable_mirror,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    pub async fn append(&self, mut rec: AuditRecord) {
        // Held for the whole append so concurrent records chain in order.
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash = match rec.seal_hash() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "audit record hash failed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "audit record serialize failed");
                return;
            }
        };

        let mut file = self.file.lock().await;
        let written = match file.write_all(format!("{line}\n").as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "audit append failed");
            return;
        }
        if let Some(mirror) = &self.immutable_mirror {
            let mut mirror_file = mirror.lock().await;
            let written = match mirror_file.write_all(format!("{line}\n").as_bytes()).await {
                Ok(()) => mirror_file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!(error = %e, "audit mirror append failed");
            }
        }
        *last_hash = Some(rec.record_hash);
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .seal_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

pub fn verify_audit_chain_with_mirror(path: &str, mirror: Option<&str>) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let Some(mirror) = mirror else {
        return Ok(summary);
    };
    let primary = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let copy = std::fs::read_to_string(mirror).map_err(|e| e.to_string())?;
    if primary != copy {
        return Err("audit mirror diverges from primary chain".to_string());
    }
    Ok(summary)
}
