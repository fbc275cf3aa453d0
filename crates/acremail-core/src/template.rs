//! Template Renderer - per-recipient mail merge
//!
//! Templates use `{{key}}` placeholders. Keys missing from the context render
//! as an empty string; malformed syntax is a [`RenderError`].

use acremail_storage::models::{Buyer, Property};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Template render failed: {0}")]
pub struct RenderError(#[from] minijinja::Error);

/// Merge data for one recipient
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    values: Map<String, Value>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generic buyer keys shared by every email
    pub fn for_buyer(buyer: &Buyer) -> Self {
        let mut ctx = Self::new();
        ctx.insert("buyerName", buyer.full_name());
        ctx.insert("firstName", buyer.first_name.clone());
        ctx.insert("lastName", buyer.last_name.clone());
        ctx.insert("email", buyer.email.clone());
        ctx.insert("buyerType", buyer.buyer_type.clone().unwrap_or_default());
        ctx.insert("preferredAreas", buyer.preferred_areas.join(", "));
        ctx
    }

    /// Set a key. Nulls are stored as empty strings so they print as nothing.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let value = match value.into() {
            Value::Null => Value::String(String::new()),
            other => other,
        };
        self.values.insert(key.into(), value);
    }

    /// Merge `extra` over the current keys; `extra` wins on collision
    pub fn extend(&mut self, extra: &Map<String, Value>) {
        for (key, value) in extra {
            self.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn as_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// Stateless renderer around a shared minijinja environment
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        Self { env }
    }

    /// Render a plain-text template such as a subject line
    pub fn render(&self, template: &str, ctx: &RenderContext) -> Result<String, RenderError> {
        Ok(self.env.render_str(template, ctx.as_value())?)
    }

    /// Render an HTML body; substituted values are HTML-escaped
    pub fn render_html(&self, template: &str, ctx: &RenderContext) -> Result<String, RenderError> {
        Ok(self
            .env
            .render_named_str("body.html", template, ctx.as_value())?)
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Property merge keys for upload and price-drop emails
pub fn property_context(property: &Property, frontend_url: &str) -> Map<String, Value> {
    let mut map = Map::new();
    let location = [property.city.as_deref(), property.state.as_deref()]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    map.insert("propertyTitle".into(), property.title.clone().into());
    map.insert("propertyPrice".into(), format_price(property.price).into());
    map.insert("propertyLocation".into(), location.into());
    map.insert(
        "propertyUrl".into(),
        format!("{}/properties/{}", frontend_url.trim_end_matches('/'), property.id).into(),
    );
    map.insert(
        "propertyType".into(),
        property.property_type.clone().unwrap_or_default().into(),
    );
    map.insert(
        "propertyArea".into(),
        property.area.clone().unwrap_or_default().into(),
    );
    map.insert("newPrice".into(), format_price(property.price).into());

    if let Some(original) = property.original_price {
        map.insert("originalPrice".into(), format_price(original).into());
        map.insert(
            "savingsAmount".into(),
            format_price(original - property.price).into(),
        );
    }

    map
}

/// `$125,000` style, whole dollars
pub fn format_price(amount: f64) -> String {
    let rounded = amount.round() as i64;
    let digits = rounded.unsigned_abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if rounded < 0 {
        format!("-${}", grouped)
    } else {
        format!("${}", grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn buyer() -> Buyer {
        let now = Utc::now();
        Buyer {
            id: Uuid::new_v4(),
            email: "ana@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: "".to_string(),
            buyer_type: None,
            preferred_areas: vec!["Austin".to_string(), "Waco".to_string()],
            source: None,
            email_opt_in: true,
            email_status: "active".to_string(),
            last_email_sent: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_buyer_keys() {
        let renderer = TemplateRenderer::new();
        let ctx = RenderContext::for_buyer(&buyer());
        let out = renderer
            .render("Hi {{buyerName}} ({{buyerType}}) in {{preferredAreas}}", &ctx)
            .unwrap();
        assert_eq!(out, "Hi Ana () in Austin, Waco");
    }

    #[test]
    fn test_missing_key_is_empty() {
        let renderer = TemplateRenderer::new();
        let out = renderer
            .render("[{{nothingHere}}]", &RenderContext::new())
            .unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_extension_wins() {
        let renderer = TemplateRenderer::new();
        let mut ctx = RenderContext::for_buyer(&buyer());
        let mut extra = Map::new();
        extra.insert("firstName".into(), "Override".into());
        ctx.extend(&extra);
        assert_eq!(renderer.render("{{firstName}}", &ctx).unwrap(), "Override");
    }

    #[test]
    fn test_malformed_template_errors() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.render("{{ unclosed", &RenderContext::new()).is_err());
        assert!(renderer.render("{% if %}", &RenderContext::new()).is_err());
    }

    #[test]
    fn test_html_body_escapes_values() {
        let renderer = TemplateRenderer::new();
        let mut ctx = RenderContext::new();
        ctx.insert("firstName", "<b>Bo</b>");
        let out = renderer.render_html("<p>{{firstName}}</p>", &ctx).unwrap();
        assert_eq!(out, "<p>&lt;b&gt;Bo&lt;/b&gt;</p>");
        assert_eq!(renderer.render("{{firstName}}", &ctx).unwrap(), "<b>Bo</b>");
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(125000.0), "$125,000");
        assert_eq!(format_price(999.4), "$999");
        assert_eq!(format_price(1234567.0), "$1,234,567");
        assert_eq!(format_price(0.0), "$0");
    }

    #[test]
    fn test_property_context() {
        let property = Property {
            id: Uuid::nil(),
            title: "Ranch lot".to_string(),
            price: 90000.0,
            original_price: Some(100000.0),
            property_type: Some("Land".to_string()),
            area: Some("Austin".to_string()),
            city: Some("Austin".to_string()),
            state: Some("TX".to_string()),
            auto_notify_on_upload: true,
            created_at: Utc::now(),
        };
        let map = property_context(&property, "https://landivo.com/");
        assert_eq!(map["propertyLocation"], "Austin, TX");
        assert_eq!(map["savingsAmount"], "$10,000");
        assert_eq!(
            map["propertyUrl"],
            "https://landivo.com/properties/00000000-0000-0000-0000-000000000000"
        );
    }
}
