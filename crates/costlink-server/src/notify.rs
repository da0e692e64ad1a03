use std::time::Duration;

use costlink_config::Notify;
use reqwest::Client;
use serde_json::json;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_CHARS: usize = 4000;

pub enum Notifier {
    Disabled,
    Telegram {
        client: Client,
        api_base: String,
        bot_token: String,
        chat_id: String,
    },
}

impl Notifier {
    pub fn from_config(cfg: &Notify) -> Result<Self, String> {
        match (cfg.kind.as_str(), &cfg.bot_token, &cfg.chat_id) {
            ("telegram", Some(bot_token), Some(chat_id)) => {
                let client = Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .map_err(|e| e.to_string())?;
                Ok(Notifier::Telegram {
                    client,
                    api_base: cfg.api_base.trim_end_matches('/').to_string(),
                    bot_token: bot_token.clone(),
                    chat_id: chat_id.clone(),
                })
            }
            _ => Ok(Notifier::Disabled),
        }
    }

    pub async fn send(&self, text: &str) {
        let Notifier::Telegram {
            client,
            api_base,
            bot_token,
            chat_id,
        } = self
        else {
            return;
        };
        let payload = json!({
            "chat_id": chat_id,
            "text": truncate(text, MAX_MESSAGE_CHARS),
        });
        let url = format!("{api_base}/bot{bot_token}/sendMessage");
        match client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "notification rejected");
            }
            Err(e) => tracing::warn!(error = %e, "notification delivery failed"),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
