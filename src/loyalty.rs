use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::CustomerId;

/// Visit ledger behind the loyalty program. Only completed reservations
/// are recorded.
#[async_trait]
pub trait LoyaltyLedger: Send + Sync {
    async fn record_visit(&self, customer_id: CustomerId, actor_id: Ulid, note: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    pub actor_id: Ulid,
    pub note: String,
}

#[derive(Default)]
pub struct InMemoryLedger {
    visits: DashMap<CustomerId, Vec<Visit>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visits(&self, customer_id: &CustomerId) -> Vec<Visit> {
        self.visits
            .get(customer_id)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    pub fn visit_count(&self, customer_id: &CustomerId) -> usize {
        self.visits.get(customer_id).map_or(0, |v| v.len())
    }
}

#[async_trait]
impl LoyaltyLedger for InMemoryLedger {
    async fn record_visit(&self, customer_id: CustomerId, actor_id: Ulid, note: &str) -> Result<(), String> {
        self.visits.entry(customer_id).or_default().push(Visit {
            actor_id,
            note: note.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_per_customer() {
        let ledger = InMemoryLedger::new();
        let alice = Ulid::new();
        let staff = Ulid::new();
        ledger.record_visit(alice, staff, "cut").await.unwrap();
        ledger.record_visit(alice, staff, "colour").await.unwrap();
        assert_eq!(ledger.visit_count(&alice), 2);
        assert_eq!(ledger.visits(&alice)[1].note, "colour");
        assert_eq!(ledger.visit_count(&Ulid::new()), 0);
    }
}
