//! Requests evaluated by admission control, and what admission records about them.

use std::sync::Arc;

use apollo_compiler::ast;

use crate::identity::Identity;
use crate::limiter::BucketKey;

/// One GraphQL operation waiting to be admitted.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    /// Raw query text, parsed only if no `document` is supplied.
    pub query: Option<String>,
    pub operation_name: Option<String>,
    /// Already parsed query, reused instead of parsing `query` again.
    pub document: Option<Arc<ast::Document>>,
    pub identity: Identity,
    /// Typed data for services further down the stack. [`Admitted`] is inserted here once the
    /// request has paid for itself.
    pub extensions: http::Extensions,
}

#[buildstructor::buildstructor]
impl AdmissionRequest {
    #[builder(visibility = "pub")]
    fn new(
        query: Option<String>,
        operation_name: Option<String>,
        document: Option<Arc<ast::Document>>,
        identity: Identity,
    ) -> Self {
        Self {
            query,
            operation_name: operation_name.filter(|name| !name.is_empty()),
            document,
            identity,
            extensions: http::Extensions::new(),
        }
    }
}

/// Record of an admitted request.
#[derive(Clone, Debug, PartialEq)]
pub struct Admitted {
    pub key: BucketKey,
    pub cost: u64,
    /// Tokens left in the bucket after this request.
    pub remaining: f64,
    pub root_fields: Vec<String>,
}
