//! Subject/body template rendering.
//!
//! Placeholders look like `{{ lead.name }}` or `{{ lead.company | default("your team") }}`.
//! Lookups go against a flat key/value context; unknown keys render empty.
//! A missing or empty template renders to `""`.

use outreach_core::error::{OutreachError, Result};
use std::collections::HashMap;

use crate::models::{Campaign, Lead, Recipient, Step};

/// Flat key/value context for one recipient.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    values: HashMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    fn set_opt(&mut self, key: &str, value: Option<&str>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Context for one send: recipient, lead (if any), campaign, and step fields.
    pub fn for_recipient(
        recipient: &Recipient,
        lead: Option<&Lead>,
        campaign: &Campaign,
        step: &Step,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.set("email", recipient.email.as_str());
        ctx.set("recipient.email", recipient.email.as_str());
        ctx.set("recipient.id", recipient.id.to_string());
        ctx.set_opt("recipient.variant_label", recipient.variant_label.as_deref());
        if let Some(lead) = lead {
            ctx.set_opt("lead.name", lead.name.as_deref());
            ctx.set_opt("lead.email", lead.email.as_deref());
            ctx.set_opt("lead.company", lead.company.as_deref());
            ctx.set_opt("lead.role", lead.role.as_deref());
            ctx.set_opt("lead.industry", lead.industry.as_deref());
            ctx.set_opt("lead.location", lead.location.as_deref());
        }
        ctx.set("campaign.name", campaign.name.as_str());
        ctx.set_opt("campaign.offer", campaign.offer.as_deref());
        ctx.set("step.order", step.sequence_order.to_string());
        ctx
    }
}

/// Render `template` against `ctx`.
///
/// Errors only on malformed syntax: an unterminated `{{`, an empty or invalid
/// key, or an unknown filter.
pub fn render(template: Option<&str>, ctx: &RenderContext) -> Result<String> {
    let template = match template {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(String::new()),
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| {
            OutreachError::Render(format!("unterminated placeholder at byte {}", offset + start))
        })?;
        out.push_str(&eval(&after_open[..end], ctx)?);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval(expr: &str, ctx: &RenderContext) -> Result<String> {
    let (key, filter) = match expr.split_once('|') {
        Some((k, f)) => (k.trim(), Some(f.trim())),
        None => (expr.trim(), None),
    };

    if key.is_empty() {
        return Err(OutreachError::Render("empty placeholder".into()));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(OutreachError::Render(format!("invalid key '{key}'")));
    }

    let value = ctx.get(key).unwrap_or("");
    match filter {
        None => Ok(value.to_string()),
        Some(f) => {
            let fallback = parse_default(f)?;
            let chosen = if value.is_empty() { fallback } else { value };
            Ok(chosen.to_string())
        }
    }
}

/// `default("text")` or `default('text')`.
fn parse_default(filter: &str) -> Result<&str> {
    let arg = filter
        .strip_prefix("default")
        .map(str::trim_start)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.strip_suffix(')'))
        .map(str::trim)
        .ok_or_else(|| OutreachError::Render(format!("unknown filter '{filter}'")))?;

    for quote in ['"', '\''] {
        if let Some(inner) = arg
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return Ok(inner);
        }
    }
    Err(OutreachError::Render(format!("default() needs a quoted argument, got {arg}")))
}
