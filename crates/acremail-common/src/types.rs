//! Common types for acremail

use uuid::Uuid;

/// Unique identifier for buyers (email recipients)
pub type BuyerId = Uuid;

/// Unique identifier for email lists
pub type ListId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for templates
pub type TemplateId = Uuid;

/// Unique identifier for automation rules
pub type RuleId = Uuid;

/// Unique identifier for properties
pub type PropertyId = Uuid;

/// Unique identifier for queue jobs
pub type JobId = Uuid;

/// Normalize an email address for lookups
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Jane.Doe@Example.COM "), "jane.doe@example.com");
    }
}
