//! Audience resolution for email lists

use acremail_common::types::{BuyerId, ListId};
use acremail_common::Result;
use acremail_storage::models::Buyer;
use acremail_storage::repository::{BuyerRepository, EmailListRepository};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns list ids into the buyers that may be emailed
#[derive(Clone)]
pub struct AudienceResolver {
    lists: Arc<dyn EmailListRepository>,
    buyers: Arc<dyn BuyerRepository>,
}

impl AudienceResolver {
    pub fn new(lists: Arc<dyn EmailListRepository>, buyers: Arc<dyn BuyerRepository>) -> Self {
        Self { lists, buyers }
    }

    /// Union of explicit members and criteria matches across `list_ids`,
    /// de-duplicated by id in first-seen order, without non-consenting buyers.
    /// Unknown list ids contribute nobody.
    pub async fn resolve(&self, list_ids: &[ListId]) -> Result<Vec<Buyer>> {
        let mut seen: HashSet<BuyerId> = HashSet::new();
        let mut audience = Vec::new();

        for list_id in list_ids {
            let Some(list) = self.lists.get(*list_id).await? else {
                warn!(list_id = %list_id, "Target list not found");
                continue;
            };

            let mut candidates = self.lists.members(list.id).await?;
            if let Some(criteria) = list.parsed_criteria() {
                if !criteria.is_empty() {
                    candidates.extend(self.buyers.find_matching(&criteria).await?);
                }
            }

            for buyer in candidates {
                if buyer.can_receive_email() && seen.insert(buyer.id) {
                    audience.push(buyer);
                }
            }
        }

        debug!(lists = list_ids.len(), recipients = audience.len(), "Resolved audience");
        Ok(audience)
    }

    /// Consenting buyers among `ids`, in the order given
    pub async fn load_buyers(&self, ids: &[BuyerId]) -> Result<Vec<Buyer>> {
        let mut found = self.buyers.get_many(ids).await?;
        found.retain(|b| b.can_receive_email());
        found.sort_by_key(|b| ids.iter().position(|id| *id == b.id));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{buyer, list, Harness};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_union_and_dedup_across_lists() {
        let h = Harness::new().await;
        let mut austin = buyer("austin@x.com");
        austin.preferred_areas = vec!["Austin".into()];
        let member = buyer("member@x.com");
        let mut unsub = buyer("unsub@x.com");
        unsub.email_status = "unsubscribed".into();
        for b in [&austin, &member, &unsub] {
            h.store.insert_buyer(b.clone()).await;
        }

        let l1 = list(Some(json!({"areas": ["Austin"]})));
        let l2 = list(None);
        h.store.insert_list(l1.clone(), &[member.id, unsub.id]).await;
        h.store.insert_list(l2.clone(), &[member.id, austin.id]).await;

        let resolved = h.audience().resolve(&[l1.id, l2.id, uuid::Uuid::new_v4()]).await.unwrap();
        let emails: Vec<&str> = resolved.iter().map(|b| b.email.as_str()).collect();
        assert_eq!(emails, vec!["member@x.com", "austin@x.com"]);
    }

    #[tokio::test]
    async fn test_vip_criteria() {
        let h = Harness::new().await;
        let mut vip = buyer("vip@x.com");
        vip.source = Some("VIP Buyers List".into());
        h.store.insert_buyer(vip.clone()).await;
        h.store.insert_buyer(buyer("plain@x.com")).await;

        let l = list(Some(json!({"isVIP": true})));
        h.store.insert_list(l.clone(), &[]).await;

        let resolved = h.audience().resolve(&[l.id]).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, vip.id);
    }

    #[tokio::test]
    async fn test_load_buyers_keeps_order_and_filters() {
        let h = Harness::new().await;
        let a = buyer("a@x.com");
        let b = buyer("b@x.com");
        let mut c = buyer("c@x.com");
        c.email_opt_in = false;
        for x in [&a, &b, &c] {
            h.store.insert_buyer(x.clone()).await;
        }

        let loaded = h.audience().load_buyers(&[b.id, c.id, a.id]).await.unwrap();
        assert_eq!(loaded.iter().map(|x| x.id).collect::<Vec<_>>(), vec![b.id, a.id]);
    }
}
