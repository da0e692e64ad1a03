use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Ordered, human-readable trace of one expense batch.
#[derive(Debug, Clone)]
pub struct ProcessingLog {
    account_id: String,
    account_name: String,
    started_at: DateTime<Utc>,
    lines: Vec<String>,
    summary: Option<String>,
}

impl ProcessingLog {
    pub fn new(account_id: &str, account_name: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            account_name: account_name.to_string(),
            started_at: Utc::now(),
            lines: Vec::new(),
            summary: None,
        }
    }

    pub fn line(&mut self, message: impl AsRef<str>) {
        self.lines.push(format!(
            "{} {}",
            Utc::now().format("%H:%M:%S"),
            message.as_ref()
        ));
    }

    pub fn finalize(&mut self, processed: usize, errors: usize) -> &str {
        let summary = format!(
            "Итог: обработано {processed}, ошибок {errors} (аккаунт {})",
            if self.account_name.is_empty() {
                &self.account_id
            } else {
                &self.account_name
            }
        );
        self.summary.insert(summary)
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "Обработка расходов {} ({})\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.account_id
        );
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        if let Some(summary) = &self.summary {
            out.push_str(summary);
            out.push('\n');
        }
        out
    }

    pub fn file_name(&self) -> String {
        let account: String = self
            .account_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!(
            "expenses_{account}_{}.log",
            self.started_at.format("%Y%m%d_%H%M%S%3f")
        )
    }

    pub async fn persist(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.file_name());
        tokio::fs::write(&path, self.render()).await?;
        Ok(path)
    }
}
