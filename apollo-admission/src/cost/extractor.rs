use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::Node;

use super::CostTable;

/// Root field label used when no root field could be resolved.
pub const UNKNOWN_OPERATION: &str = "unknown";

/// The root fields an operation selects and what they cost together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryCost {
    /// Root field names, in document order, after fragments have been inlined.
    pub root_fields: Vec<String>,
    pub cost: u64,
}

impl QueryCost {
    /// Root field names joined for logs and error extensions.
    pub fn operation_label(&self) -> String {
        self.root_fields.join(",")
    }
}

/// Prices operations against a [`CostTable`] without executing them.
///
/// Only the root selection set matters: inline fragments and fragment spreads at the root are
/// expanded in place, but sub-selections of root fields are never visited.
#[derive(Clone, Debug)]
pub struct QueryCostExtractor {
    table: Arc<CostTable>,
    max_root_fields: usize,
}

impl QueryCostExtractor {
    pub fn new(table: Arc<CostTable>, max_root_fields: usize) -> Self {
        Self {
            table,
            max_root_fields,
        }
    }

    /// Price an operation, given either an already parsed document or the raw query text.
    ///
    /// A document that cannot be parsed, or that has no operation or no root field, costs the
    /// default. Parse errors are left for the GraphQL layer to report.
    pub fn extract(
        &self,
        document: Option<&ast::Document>,
        query: Option<&str>,
        operation_name: Option<&str>,
    ) -> QueryCost {
        let parsed;
        let document = match (document, query) {
            (Some(document), _) => document,
            (None, Some(query)) => match ast::Document::parse(query, "query.graphql") {
                Ok(document) => {
                    parsed = document;
                    &parsed
                }
                Err(error) => {
                    tracing::debug!(errors = %error.errors, "could not parse query for pricing");
                    return self.unknown();
                }
            },
            (None, None) => return self.unknown(),
        };

        let Some(operation) = select_operation(document, operation_name) else {
            return self.unknown();
        };

        let mut collector = RootFieldCollector::new(document, self.max_root_fields);
        collector.collect(&operation.selection_set);
        let root_fields = collector.names;
        if root_fields.is_empty() {
            return self.unknown();
        }

        let cost = root_fields
            .iter()
            .map(|name| u64::from(self.table.cost_of(Some(name))))
            .sum();
        tracing::debug!(
            root_fields = %root_fields.join(","),
            cost,
            "priced operation"
        );

        QueryCost { root_fields, cost }
    }

    fn unknown(&self) -> QueryCost {
        QueryCost {
            root_fields: vec![UNKNOWN_OPERATION.to_string()],
            cost: u64::from(self.table.default_cost()),
        }
    }
}

/// The named operation if it exists, otherwise the first operation of the document.
fn select_operation<'d>(
    document: &'d ast::Document,
    operation_name: Option<&str>,
) -> Option<&'d Node<ast::OperationDefinition>> {
    let mut operations = document.definitions.iter().filter_map(|definition| {
        match definition {
            ast::Definition::OperationDefinition(operation) => Some(operation),
            _ => None,
        }
    });

    if let Some(name) = operation_name.filter(|name| !name.is_empty()) {
        let named = operations
            .clone()
            .find(|operation| operation.name.as_ref().is_some_and(|n| n.as_str() == name));
        if named.is_some() {
            return named;
        }
        tracing::debug!(
            operation_name = name,
            "operation not found in document, pricing the first operation"
        );
    }

    operations.next()
}

struct RootFieldCollector<'d> {
    fragments: HashMap<&'d str, &'d [ast::Selection]>,
    // Each fragment is inlined at most once, which also stops fragment cycles.
    expanded: HashSet<&'d str>,
    names: Vec<String>,
    limit: usize,
}

impl<'d> RootFieldCollector<'d> {
    fn new(document: &'d ast::Document, limit: usize) -> Self {
        let fragments = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::FragmentDefinition(fragment) => Some((
                    fragment.name.as_str(),
                    fragment.selection_set.as_slice(),
                )),
                _ => None,
            })
            .collect();

        Self {
            fragments,
            expanded: HashSet::new(),
            names: Vec::new(),
            limit,
        }
    }

    /// Walks `selections` in document order. Fragment chains can be arbitrarily long, so the
    /// walk keeps its own stack instead of recursing.
    fn collect(&mut self, selections: &'d [ast::Selection]) {
        let mut stack = vec![selections.iter()];
        while let Some(selections) = stack.last_mut() {
            if self.names.len() >= self.limit {
                return;
            }
            let Some(selection) = selections.next() else {
                stack.pop();
                continue;
            };
            match selection {
                ast::Selection::Field(field) => self.names.push(field.name.to_string()),
                ast::Selection::InlineFragment(inline_fragment) => {
                    stack.push(inline_fragment.selection_set.iter())
                }
                ast::Selection::FragmentSpread(spread) => {
                    let name = spread.fragment_name.as_str();
                    if !self.expanded.insert(name) {
                        continue;
                    }
                    if let Some(selections) = self.fragments.get(name).copied() {
                        stack.push(selections.iter());
                    }
                }
            }
        }
    }
}
