use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use tracing::{info, warn};

/// Telegram notifications for lifecycle events. With no bot token the
/// service degrades to log lines, which keeps the sweeps runnable in
/// development.
pub struct NotificationService {
    bot: Option<Bot>,
}

impl NotificationService {
    pub fn new(token: &str) -> Self {
        let bot = if token.is_empty() {
            None
        } else {
            Some(Bot::new(token))
        };
        Self { bot }
    }

    pub async fn send(&self, tg_id: i64, text: &str) {
        match &self.bot {
            Some(bot) => {
                match bot
                    .send_message(ChatId(tg_id), text)
                    .parse_mode(teloxide::types::ParseMode::Html)
                    .await
                {
                    Ok(_) => {}
                    Err(e) => warn!(tg_id, error = %e, "Failed to send notification"),
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            }
            None => info!(tg_id, text, "Notification (no bot token configured)"),
        }
    }

    pub async fn expiry_warning(&self, tg_id: i64, email: &str, expires_at: DateTime<Utc>) {
        self.send(tg_id, &format_expiry_warning(email, expires_at)).await;
    }

    pub async fn expired_notice(&self, tg_id: i64, email: &str) {
        self.send(tg_id, &format_expired_notice(email)).await;
    }

    pub async fn bonus_granted(&self, tg_id: i64, email: &str, expires_at: DateTime<Utc>) {
        self.send(tg_id, &format_bonus_granted(email, expires_at)).await;
    }

    pub async fn bonus_choice_needed(&self, tg_id: i64, emails: &[String]) {
        self.send(tg_id, &format_bonus_choice(emails)).await;
    }
}

fn format_expiry_warning(email: &str, expires_at: DateTime<Utc>) -> String {
    format!(
        "⏳ <b>Subscription expiring soon</b>\n\n\
         Key <code>{}</code> is valid until <b>{}</b> (UTC).\n\
         Extend it now to keep your connection uninterrupted.",
        email,
        expires_at.format("%Y-%m-%d %H:%M")
    )
}

fn format_expired_notice(email: &str) -> String {
    format!(
        "⛔ <b>Subscription expired</b>\n\n\
         Key <code>{}</code> is no longer active.\n\
         It will be removed from the server after 7 days unless extended.",
        email
    )
}

fn format_bonus_granted(email: &str, expires_at: DateTime<Utc>) -> String {
    format!(
        "🎁 <b>Referral bonus applied</b>\n\n\
         Key <code>{}</code> is now valid until <b>{}</b> (UTC).",
        email,
        expires_at.format("%Y-%m-%d %H:%M")
    )
}

fn format_bonus_choice(emails: &[String]) -> String {
    let mut text = String::from(
        "🎁 <b>Referral bonus earned</b>\n\n\
         You have several active keys. Open the app and pick the one to\n\
         extend by 7 days:\n",
    );
    for email in emails {
        text.push_str(&format!("\n• <code>{email}</code>"));
    }
    text
}
