//! Pricing of GraphQL operations.
//!
//! Every root field of an operation opens a "door" into the backend. The [`CostTable`] says how
//! expensive each door is, and the [`QueryCostExtractor`] finds which doors an operation opens.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

mod extractor;

pub use self::extractor::QueryCost;
pub use self::extractor::QueryCostExtractor;
pub use self::extractor::UNKNOWN_OPERATION;

const DEFAULT_COST: u32 = 2;

/// Static mapping from root operation name to cost.
///
/// Loaded once at startup and never mutated. Names that are not listed cost
/// [`CostTable::default_cost`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CostTable {
    /// Cost of any operation that is not listed
    default: u32,
    /// Cost per root operation name
    operations: HashMap<String, u32>,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            default: DEFAULT_COST,
            operations: HashMap::new(),
        }
    }
}

impl CostTable {
    pub fn new<N: Into<String>>(
        default: u32,
        operations: impl IntoIterator<Item = (N, u32)>,
    ) -> Self {
        Self {
            default,
            operations: operations
                .into_iter()
                .map(|(name, cost)| (name.into(), cost))
                .collect(),
        }
    }

    /// Cost of one root operation. Unknown, missing and empty names cost the default.
    pub fn cost_of(&self, operation_name: Option<&str>) -> u32 {
        operation_name
            .and_then(|name| self.operations.get(name))
            .copied()
            .unwrap_or(self.default)
    }

    pub fn default_cost(&self) -> u32 {
        self.default
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn table() -> CostTable {
        CostTable::new(
            2,
            [
                ("me", 1),
                ("posts", 3),
                ("createPost", 8),
                ("deleteAllPosts", 100),
                ("semanticSearch", 40),
            ],
        )
    }

    #[rstest]
    #[case::cheap_read(Some("me"), 1)]
    #[case::list_read(Some("posts"), 3)]
    #[case::write(Some("createPost"), 8)]
    #[case::bulk_delete(Some("deleteAllPosts"), 100)]
    #[case::vector_search(Some("semanticSearch"), 40)]
    #[case::unknown(Some("somethingElse"), 2)]
    #[case::case_sensitive(Some("Me"), 2)]
    #[case::empty(Some(""), 2)]
    #[case::missing(None, 2)]
    fn cost_of(#[case] operation: Option<&str>, #[case] expected: u32) {
        assert_eq!(table().cost_of(operation), expected);
    }

    #[test]
    fn zero_cost_operations_are_allowed() {
        let table = CostTable::new(2, [("__typename", 0)]);

        assert_eq!(table.cost_of(Some("__typename")), 0);
    }

    #[test]
    fn default_table_only_knows_the_default() {
        let table = CostTable::default();

        assert_eq!(table.default_cost(), 2);
        assert_eq!(table.cost_of(Some("me")), 2);
    }
}
