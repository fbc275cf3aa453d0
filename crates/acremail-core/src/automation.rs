//! Automation Engine - fires rules against buyers and queues their emails
//!
//! A rule resolves its audience, filters it with the trigger predicate and
//! hands the survivors to the job queue. Delayed rules become delayed jobs,
//! so a restart never drops a pending send.

use crate::audience::AudienceResolver;
use crate::clock::{Clock, SystemClock};
use crate::delivery::{DeliveryEngine, SendOptions};
use crate::queue::{BulkEmailOptions, JobQueue};
use crate::template::property_context;
use acremail_common::types::{BuyerId, PropertyId, RuleId};
use acremail_common::{Error, Result};
use acremail_storage::models::{
    AutomationExecution, AutomationRule, Buyer, ExecutionStatus, NewAutomationExecution,
    Property, TriggerType,
};
use acremail_storage::repository::{
    AutomationRepository, BuyerRepository, PropertyRepository, Repositories, TemplateRepository,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name fragment of the template used for welcome emails
pub const WELCOME_TEMPLATE: &str = "Welcome New Buyer";

const TEST_FROM_NAME: &str = "Landivo Test";

/// Event data a rule is fired with. Stored verbatim as the execution's
/// `triggered_by`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<BuyerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<PropertyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_days: Option<i64>,
}

impl TriggerData {
    pub fn buyer(trigger: TriggerType, buyer_id: BuyerId) -> Self {
        Self {
            event_type: Some(trigger.to_string()),
            buyer_id: Some(buyer_id),
            ..Default::default()
        }
    }

    /// Property fields the predicates look at. A price drop also carries
    /// the reduction from the original price.
    pub fn property(trigger: TriggerType, property: &Property) -> Self {
        let reduction = property
            .original_price
            .map(|original| original - property.price)
            .filter(|r| *r > 0.0);

        Self {
            event_type: Some(trigger.to_string()),
            property_id: Some(property.id),
            property_type: property.property_type.clone(),
            area: property.area.clone(),
            price: Some(property.price),
            reduction: if trigger == TriggerType::PropertyPriceDrop {
                reduction
            } else {
                None
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl PriceRange {
    pub fn contains(&self, price: f64) -> bool {
        self.min.map_or(true, |min| price >= min) && self.max.map_or(true, |max| price <= max)
    }
}

/// Typed view of a rule's `trigger_conditions`. Absent fields are no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConditions {
    #[serde(default)]
    pub property_types: Option<Vec<String>>,
    #[serde(default)]
    pub areas: Option<Vec<String>>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub minimum_reduction: Option<f64>,
    #[serde(default)]
    pub inactive_days: Option<i64>,
}

impl TriggerConditions {
    /// Malformed conditions parse as empty
    pub fn from_rule(rule: &AutomationRule) -> Self {
        serde_json::from_value(rule.trigger_conditions.clone()).unwrap_or_default()
    }
}

/// Whether `buyer` qualifies for `rule` given the trigger's data
pub fn matches_trigger(rule: &AutomationRule, buyer: &Buyer, data: &TriggerData) -> bool {
    if !buyer.can_receive_email() {
        return false;
    }

    let conditions = TriggerConditions::from_rule(rule);

    match rule.trigger() {
        Some(TriggerType::BuyerRegistered) => true,
        Some(TriggerType::PropertyUploaded) => {
            if let (Some(types), Some(property_type)) = (&conditions.property_types, &data.property_type) {
                if !types.contains(property_type) {
                    return false;
                }
            }

            if let (Some(_), Some(area)) = (&conditions.areas, &data.area) {
                if !buyer.preferred_areas.contains(area) {
                    return false;
                }
            }

            if let (Some(range), Some(price)) = (&conditions.price_range, data.price) {
                if !range.contains(price) {
                    return false;
                }
            }

            true
        }
        Some(TriggerType::PropertyPriceDrop) => {
            match (conditions.minimum_reduction, data.reduction) {
                (Some(minimum), Some(reduction)) => reduction >= minimum,
                _ => true,
            }
        }
        // selection already happened in the inactivity scan
        Some(TriggerType::BuyerInactive) => true,
        None => false,
    }
}

pub struct AutomationEngine {
    rules: Arc<dyn AutomationRepository>,
    templates: Arc<dyn TemplateRepository>,
    buyers: Arc<dyn BuyerRepository>,
    properties: Arc<dyn PropertyRepository>,
    audience: AudienceResolver,
    queue: JobQueue,
    delivery: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
    frontend_url: String,
    support_email: Option<String>,
}

impl AutomationEngine {
    pub fn new(
        repos: &Repositories,
        queue: JobQueue,
        delivery: Arc<DeliveryEngine>,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            rules: repos.automation.clone(),
            templates: repos.templates.clone(),
            buyers: repos.buyers.clone(),
            properties: repos.properties.clone(),
            audience: AudienceResolver::new(repos.lists.clone(), repos.buyers.clone()),
            queue,
            delivery,
            clock: Arc::new(SystemClock),
            frontend_url: frontend_url.into().trim_end_matches('/').to_string(),
            support_email: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_support_email(mut self, email: impl Into<String>) -> Self {
        self.support_email = Some(email.into());
        self
    }

    /// Run one rule. Failures are recorded as a `failed` execution and not
    /// returned; only a failure to record the execution itself is an error.
    pub async fn execute_rule(
        &self,
        rule: &AutomationRule,
        data: &TriggerData,
    ) -> Result<AutomationExecution> {
        let (count, status, error_message) = match self.dispatch(rule, data).await {
            Ok(0) => {
                debug!(rule_id = %rule.id, "Automation rule matched no buyers");
                (0, ExecutionStatus::Completed, None)
            }
            Ok(count) => (count, ExecutionStatus::Queued, None),
            Err(e) => {
                error!(rule_id = %rule.id, rule = %rule.name, error = %e, "Automation rule failed");
                (0, ExecutionStatus::Failed, Some(e.to_string()))
            }
        };

        self.rules
            .record_execution(NewAutomationExecution {
                rule_id: rule.id,
                triggered_by: serde_json::to_value(data).unwrap_or_default(),
                recipient_count: i32::try_from(count).unwrap_or(i32::MAX),
                status,
                error_message,
                executed_at: self.clock.now(),
            })
            .await
    }

    /// Resolve, filter and enqueue; returns the number of buyers queued
    async fn dispatch(&self, rule: &AutomationRule, data: &TriggerData) -> Result<usize> {
        let candidates = self.candidates(rule, data).await?;
        let targets: Vec<BuyerId> = candidates
            .iter()
            .filter(|buyer| matches_trigger(rule, buyer, data))
            .map(|buyer| buyer.id)
            .collect();

        if targets.is_empty() {
            return Ok(0);
        }

        if self.templates.get(rule.template_id).await?.is_none() {
            return Err(Error::not_found("template", rule.template_id));
        }

        let mut options = BulkEmailOptions::default();
        if let Some(property) = self.trigger_property(data).await? {
            options.send.context = property_context(&property, &self.frontend_url);
        }

        let delay = rule.delay_duration();
        self.queue
            .enqueue_bulk_emails(&targets, rule.template_id, options, delay)
            .await
            .map_err(Error::Other)?;

        info!(
            rule_id = %rule.id,
            rule = %rule.name,
            recipients = targets.len(),
            delay_secs = delay.num_seconds(),
            "Automation rule queued emails"
        );
        Ok(targets.len())
    }

    /// Buyer-scoped triggers target the triggering buyer, and only when the
    /// rule's lists (if any) include them. Everything else targets the lists.
    async fn candidates(&self, rule: &AutomationRule, data: &TriggerData) -> Result<Vec<Buyer>> {
        let buyer_scoped = matches!(
            rule.trigger(),
            Some(TriggerType::BuyerRegistered) | Some(TriggerType::BuyerInactive)
        );

        match (buyer_scoped, data.buyer_id) {
            (true, Some(buyer_id)) => {
                let Some(buyer) = self.buyers.get(buyer_id).await? else {
                    warn!(buyer_id = %buyer_id, "Triggering buyer not found");
                    return Ok(Vec::new());
                };
                if rule.target_lists.is_empty() {
                    return Ok(vec![buyer]);
                }
                let audience = self.audience.resolve(&rule.target_lists).await?;
                Ok(audience.into_iter().filter(|b| b.id == buyer.id).collect())
            }
            _ => self.audience.resolve(&rule.target_lists).await,
        }
    }

    async fn trigger_property(&self, data: &TriggerData) -> Result<Option<Property>> {
        match data.property_id {
            Some(id) => self.properties.get(id).await,
            None => Ok(None),
        }
    }

    /// Fire every active rule of `trigger`. One rule failing never stops the rest.
    pub async fn fire(&self, trigger: TriggerType, data: &TriggerData) -> Result<Vec<AutomationExecution>> {
        let rules = self.rules.active_rules(trigger).await?;
        let mut executions = Vec::with_capacity(rules.len());

        for rule in &rules {
            match self.execute_rule(rule, data).await {
                Ok(execution) => executions.push(execution),
                Err(e) => {
                    error!(rule_id = %rule.id, error = %e, "Failed to record automation execution")
                }
            }
        }

        Ok(executions)
    }

    /// Fire a rule by id, outside of its schedule
    pub async fn trigger_rule(&self, rule_id: RuleId, data: TriggerData) -> Result<AutomationExecution> {
        let rule = self.load_rule(rule_id).await?;
        if !rule.is_active {
            return Err(Error::InvalidState(format!(
                "automation rule {} is not active",
                rule_id
            )));
        }

        info!(rule_id = %rule_id, rule = %rule.name, "Manually triggering automation rule");
        self.execute_rule(&rule, &data).await
    }

    /// Send the rule's template to `test_email` as a made-up buyer, without tracking
    pub async fn send_test(
        &self,
        rule_id: RuleId,
        test_email: &str,
        test_data: Map<String, Value>,
    ) -> Result<bool> {
        let rule = self.load_rule(rule_id).await?;
        let template = self
            .templates
            .get(rule.template_id)
            .await?
            .ok_or_else(|| Error::not_found("template", rule.template_id))?;

        let now = self.clock.now();
        let buyer = Buyer {
            id: uuid::Uuid::new_v4(),
            email: test_email.to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            buyer_type: Some("Investor".to_string()),
            preferred_areas: Vec::new(),
            source: None,
            email_opt_in: true,
            email_status: "active".to_string(),
            last_email_sent: None,
            created_at: now,
            updated_at: now,
        };
        let options = SendOptions {
            from_name: Some(TEST_FROM_NAME.to_string()),
            context: test_data,
            ..Default::default()
        };

        Ok(self
            .delivery
            .send_single_email(&buyer, &template, &template.subject, &options, None)
            .await)
    }

    /// Send the welcome template to a newly registered buyer. Returns false
    /// when no active welcome template exists or the send failed.
    pub async fn send_welcome_email(&self, buyer: &Buyer) -> Result<bool> {
        let Some(template) = self.templates.find_active_by_name(WELCOME_TEMPLATE).await? else {
            warn!("No active welcome template found");
            return Ok(false);
        };

        let mut context = Map::new();
        context.insert(
            "profileUrl".into(),
            Value::String(format!("{}/profile", self.frontend_url)),
        );
        context.insert(
            "browseUrl".into(),
            Value::String(format!("{}/properties", self.frontend_url)),
        );
        if let Some(support) = &self.support_email {
            context.insert("supportEmail".into(), Value::String(support.clone()));
        }

        let options = SendOptions {
            context,
            ..Default::default()
        };
        Ok(self
            .delivery
            .send_single_email(buyer, &template, &template.subject, &options, None)
            .await)
    }

    async fn load_rule(&self, rule_id: RuleId) -> Result<AutomationRule> {
        self.rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| Error::not_found("automation rule", rule_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobKind, SEND_BULK_EMAILS};
    use crate::testing::{buyer, list, property, rule, template, Harness};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn price_drop_rule(template_id: uuid::Uuid, lists: Vec<uuid::Uuid>) -> AutomationRule {
        let mut r = rule(TriggerType::PropertyPriceDrop, template_id, lists);
        r.trigger_conditions = json!({ "minimumReduction": 10000 });
        r
    }

    #[test]
    fn test_property_uploaded_predicate() {
        let mut r = rule(TriggerType::PropertyUploaded, uuid::Uuid::new_v4(), vec![]);
        r.trigger_conditions = json!({
            "propertyTypes": ["Land"],
            "areas": ["Dallas"],
            "priceRange": { "min": 10000, "max": 50000 }
        });
        let b = buyer("a@x.com");

        let data = TriggerData {
            property_type: Some("Land".into()),
            area: Some("Dallas".into()),
            price: Some(25000.0),
            ..Default::default()
        };
        assert!(matches_trigger(&r, &b, &data));

        let wrong_type = TriggerData { property_type: Some("Farm".into()), ..data.clone() };
        assert!(!matches_trigger(&r, &b, &wrong_type));

        let wrong_area = TriggerData { area: Some("Houston".into()), ..data.clone() };
        assert!(!matches_trigger(&r, &b, &wrong_area));

        let too_expensive = TriggerData { price: Some(90000.0), ..data.clone() };
        assert!(!matches_trigger(&r, &b, &too_expensive));

        // unspecified data is no constraint
        assert!(matches_trigger(&r, &b, &TriggerData::default()));
    }

    #[test]
    fn test_predicate_requires_consent() {
        let r = rule(TriggerType::BuyerRegistered, uuid::Uuid::new_v4(), vec![]);
        let mut b = buyer("a@x.com");
        assert!(matches_trigger(&r, &b, &TriggerData::default()));
        b.email_status = "unsubscribed".into();
        assert!(!matches_trigger(&r, &b, &TriggerData::default()));
    }

    #[test]
    fn test_unknown_trigger_never_matches() {
        let mut r = rule(TriggerType::BuyerRegistered, uuid::Uuid::new_v4(), vec![]);
        r.trigger_type = "property_sold".into();
        assert!(!matches_trigger(&r, &buyer("a@x.com"), &TriggerData::default()));
    }

    #[tokio::test]
    async fn test_price_drop_scenario() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let a = buyer("a@x.com");
        let b = buyer("b@x.com");
        h.store.insert_buyer(a.clone()).await;
        h.store.insert_buyer(b.clone()).await;
        let l = list(None);
        h.store.insert_list(l.clone(), &[a.id, b.id]).await;
        let r = price_drop_rule(tpl.id, vec![l.id]);
        h.store.insert_rule(r.clone()).await;

        let engine = h.automation();

        let small = TriggerData { reduction: Some(5000.0), ..Default::default() };
        let execution = engine.execute_rule(&r, &small).await.unwrap();
        assert_eq!(execution.recipient_count, 0);
        assert_eq!(execution.status, "completed");
        assert!(h.store.jobs().await.is_empty());

        let large = TriggerData { reduction: Some(15000.0), ..Default::default() };
        let execution = engine.execute_rule(&r, &large).await.unwrap();
        assert_eq!(execution.recipient_count, 2);
        assert_eq!(execution.status, "queued");
        assert_eq!(execution.triggered_by, json!({ "reduction": 15000.0 }));

        let jobs = h.store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, SEND_BULK_EMAILS);
        let kind: JobKind = serde_json::from_value(jobs[0].payload.clone()).unwrap();
        match kind {
            JobKind::SendBulkEmails(job) => {
                assert_eq!(job.buyer_ids, vec![a.id, b.id]);
                assert_eq!(job.template_id, tpl.id);
            }
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delay_becomes_future_job() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let a = buyer("a@x.com");
        h.store.insert_buyer(a.clone()).await;
        let l = list(None);
        h.store.insert_list(l.clone(), &[a.id]).await;

        let mut r = rule(TriggerType::PropertyUploaded, tpl.id, vec![l.id]);
        r.delay = 2;
        r.delay_unit = "hours".into();

        let execution = h.automation().execute_rule(&r, &TriggerData::default()).await.unwrap();
        assert_eq!(execution.status, "queued");

        let jobs = h.store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scheduled_at, h.clock.now() + chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn test_property_context_is_attached() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let a = buyer("a@x.com");
        h.store.insert_buyer(a.clone()).await;
        let l = list(None);
        h.store.insert_list(l.clone(), &[a.id]).await;
        let p = property(125000.0);
        h.store.insert_property(p.clone()).await;

        let r = rule(TriggerType::PropertyUploaded, tpl.id, vec![l.id]);
        let data = TriggerData::property(TriggerType::PropertyUploaded, &p);
        h.automation().execute_rule(&r, &data).await.unwrap();

        let jobs = h.store.jobs().await;
        let JobKind::SendBulkEmails(job) = serde_json::from_value::<JobKind>(jobs[0].payload.clone()).unwrap() else {
            panic!("expected a bulk job");
        };
        assert_eq!(job.options.send.context["propertyPrice"], "$125,000");
    }

    #[tokio::test]
    async fn test_missing_template_records_failure() {
        let h = Harness::new().await;
        let a = buyer("a@x.com");
        h.store.insert_buyer(a.clone()).await;
        let l = list(None);
        h.store.insert_list(l.clone(), &[a.id]).await;
        let r = rule(TriggerType::PropertyUploaded, uuid::Uuid::new_v4(), vec![l.id]);

        let execution = h.automation().execute_rule(&r, &TriggerData::default()).await.unwrap();
        assert_eq!(execution.status, "failed");
        assert_eq!(execution.recipient_count, 0);
        assert!(execution.error_message.unwrap().contains("template"));
        assert!(h.store.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_buyer_scoped_trigger_targets_only_that_buyer() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let newcomer = buyer("new@x.com");
        let other = buyer("old@x.com");
        h.store.insert_buyer(newcomer.clone()).await;
        h.store.insert_buyer(other.clone()).await;
        let l = list(None);
        h.store.insert_list(l.clone(), &[other.id]).await;

        let open_rule = rule(TriggerType::BuyerRegistered, tpl.id, vec![]);
        let data = TriggerData::buyer(TriggerType::BuyerRegistered, newcomer.id);
        let execution = h.automation().execute_rule(&open_rule, &data).await.unwrap();
        assert_eq!(execution.recipient_count, 1);

        // rule lists that do not contain the buyer exclude them
        let listed_rule = rule(TriggerType::BuyerRegistered, tpl.id, vec![l.id]);
        let execution = h.automation().execute_rule(&listed_rule, &data).await.unwrap();
        assert_eq!(execution.recipient_count, 0);
        assert_eq!(execution.status, "completed");
    }

    #[tokio::test]
    async fn test_trigger_rule_checks_state() {
        let h = Harness::new().await;
        let engine = h.automation();

        let missing = engine.trigger_rule(uuid::Uuid::new_v4(), TriggerData::default()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let mut inactive = rule(TriggerType::BuyerRegistered, uuid::Uuid::new_v4(), vec![]);
        inactive.is_active = false;
        h.store.insert_rule(inactive.clone()).await;
        let err = engine.trigger_rule(inactive.id, TriggerData::default()).await;
        assert!(matches!(err, Err(Error::InvalidState(_))));
        assert!(h.store.executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_welcome_email_links() {
        let h = Harness::new().await;
        let engine = h.automation().with_support_email("help@landivo.com");
        let newcomer = buyer("new@x.com");

        // no template yet
        assert!(!engine.send_welcome_email(&newcomer).await.unwrap());

        let mut tpl = template();
        tpl.name = "Welcome New Buyer".into();
        tpl.html_content = "<a href=\"{{browseUrl}}\">Browse</a> {{supportEmail}}".into();
        h.store.insert_template(tpl).await;

        assert!(engine.send_welcome_email(&newcomer).await.unwrap());
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        // merged values are html-escaped, so only check the pieces
        assert!(sent[0].html.contains("landivo.com"));
        assert!(sent[0].html.contains("properties"));
        assert!(sent[0].html.contains("help@landivo.com"));
    }

    #[tokio::test]
    async fn test_send_test_uses_fake_buyer() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let r = rule(TriggerType::BuyerRegistered, tpl.id, vec![]);
        h.store.insert_rule(r.clone()).await;

        let sent = h
            .automation()
            .send_test(r.id, "qa@landivo.com", Map::new())
            .await
            .unwrap();
        assert!(sent);

        let outbound = h.transport.sent();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].to, "qa@landivo.com");
        assert_eq!(outbound[0].from_name, TEST_FROM_NAME);
        assert!(outbound[0].html.contains("Hello Test"));
        assert!(h.store.tracking_events().await.is_empty());
    }
}
