//! Existing-record filter.

use std::collections::HashSet;

use serde::Serialize;
use udise_core::AcademicYear;
use udise_storage::{GatewayError, PersistenceGateway};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingSet {
    /// Identifiers with no stored record for the year, in input order.
    pub pending: Vec<String>,
    /// Deduplicated count minus pending count.
    pub duplicates: usize,
}

/// Dedups `identifiers` and drops the ones already stored for `year`, using a
/// single existence check.
pub async fn filter_pending(
    gateway: &dyn PersistenceGateway,
    identifiers: &[String],
    year: &AcademicYear,
) -> Result<PendingSet, GatewayError> {
    let mut seen = HashSet::new();
    let unique = identifiers
        .iter()
        .filter(|code| seen.insert(code.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if unique.is_empty() {
        return Ok(PendingSet::default());
    }

    let existing = gateway
        .existing_codes(&unique, &year.year_desc)
        .await?
        .into_iter()
        .collect::<HashSet<_>>();
    let pending = unique
        .iter()
        .filter(|code| !existing.contains(*code))
        .cloned()
        .collect::<Vec<_>>();

    Ok(PendingSet {
        duplicates: unique.len() - pending.len(),
        pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use udise_core::FlatRecord;
    use udise_storage::MemoryGateway;

    fn stored(code: &str, ay: &str) -> FlatRecord {
        let mut record = FlatRecord::new(code);
        record.set_academic_year(ay);
        record
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn partitions_in_input_order_with_one_call() {
        let gateway = MemoryGateway::new();
        gateway
            .seed([stored("B", "2023-24"), stored("D", "2022-23")])
            .await;
        let year = AcademicYear::new("10", "2023-24");

        let set = filter_pending(&gateway, &codes(&["D", "B", "A", "B", "C", "a"]), &year)
            .await
            .unwrap();

        assert_eq!(set.pending, codes(&["D", "A", "C", "a"]));
        assert_eq!(set.duplicates, 1);
        assert_eq!(gateway.existence_checks().await, 1);
    }

    #[tokio::test]
    async fn empty_input_skips_the_gateway() {
        let gateway = MemoryGateway::new();
        let set = filter_pending(&gateway, &[], &AcademicYear::new("1", "2023-24"))
            .await
            .unwrap();
        assert!(set.pending.is_empty());
        assert_eq!(set.duplicates, 0);
        assert_eq!(gateway.existence_checks().await, 0);
    }
}
