use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TelegramConfig;
use crate::models::{Listing, Search};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Default,
    Priority,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub channel: Channel,
    pub chat_id: String,
    pub text: String,
}

pub trait MessageDispatcher {
    /// Delivers one message; `Ok(false)` means the API rejected it.
    fn send(&self, request: &DispatchRequest) -> Result<bool>;
}

/// Price line of a message: current price or the old-to-new transition,
/// followed by the hint and the range display when present.
pub fn price_block(listing: &Listing) -> String {
    let mut block = match listing.old_price.as_deref() {
        Some(old) if !old.is_empty() => format!("NEW: {} → {}", old, listing.raw_price),
        _ => listing.raw_price.clone(),
    };
    if let Some(hint) = listing.price_hint.as_deref().filter(|h| !h.is_empty()) {
        block.push(' ');
        block.push_str(hint);
    }
    if let Some(range) = listing.price_range_display.as_deref().filter(|r| !r.is_empty()) {
        block.push('\n');
        block.push_str(range);
    }
    block
}

pub fn format_message(listing: &Listing, source_indicator: &str) -> String {
    format!(
        "{}{}\n\n{}\n\n{}\n({})\n\n<a href=\"{}\">{}</a>",
        source_indicator,
        html_escape::encode_text(&listing.title),
        html_escape::encode_text(&price_block(listing)),
        html_escape::encode_text(&listing.shipping_text),
        html_escape::encode_text(&listing.location_text),
        html_escape::encode_double_quoted_attribute(&listing.link),
        html_escape::encode_text(&listing.link),
    )
}

/// Dispatches for one evaluated listing. Nothing is sent unless the listing
/// is worth messaging; priority-eligible listings go out a second time on
/// the priority channel.
pub fn route(
    listing: &Listing,
    search: &Search,
    worth_messaging: bool,
    telegram: &TelegramConfig,
) -> Vec<DispatchRequest> {
    if !worth_messaging {
        return Vec::new();
    }

    let chat_id = search
        .chat_id
        .clone()
        .unwrap_or_else(|| telegram.chat_id.clone());
    let text = format_message(listing, &telegram.source_indicator);

    let priority_chat = telegram
        .priority_chat_id
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| chat_id.clone());

    let mut requests = vec![DispatchRequest {
        channel: Channel::Default,
        chat_id,
        text: text.clone(),
    }];
    if listing.is_priority_eligible {
        requests.push(DispatchRequest {
            channel: Channel::Priority,
            chat_id: priority_chat,
            text,
        });
    }
    requests
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug)]
pub struct TelegramDispatcher {
    client: reqwest::blocking::Client,
    api_base: String,
    bot_token: String,
    priority_bot_token: String,
}

impl TelegramDispatcher {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            priority_bot_token: config.priority_bot_token.clone(),
        })
    }

    fn token_for(&self, channel: Channel) -> &str {
        match channel {
            Channel::Priority if !self.priority_bot_token.is_empty() => &self.priority_bot_token,
            _ => &self.bot_token,
        }
    }
}

impl MessageDispatcher for TelegramDispatcher {
    fn send(&self, request: &DispatchRequest) -> Result<bool> {
        let token = self.token_for(request.channel);
        if token.is_empty() {
            return Err(anyhow!("No bot token configured. Set BOTTOKEN or telegram.bot_token"));
        }
        if request.chat_id.is_empty() {
            return Err(anyhow!("No chat id configured. Set CHAT_ID or telegram.chat_id"));
        }

        let body = SendMessageRequest {
            chat_id: &request.chat_id,
            text: &request.text,
            parse_mode: "HTML",
        };

        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.api_base, token))
            .json(&body)
            .send()
            .context("Failed to send request to Telegram API")?;

        let status = response.status();
        let api_response: TelegramResponse = response
            .json()
            .with_context(|| format!("Failed to parse Telegram API response (status {})", status))?;

        if !api_response.ok {
            warn!(
                chat_id = %request.chat_id,
                %status,
                description = api_response.description.as_deref().unwrap_or(""),
                "Telegram rejected message"
            );
        } else {
            debug!(chat_id = %request.chat_id, channel = ?request.channel, "Message delivered");
        }
        Ok(api_response.ok)
    }
}
