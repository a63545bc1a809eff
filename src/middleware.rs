//! Submission middleware: a chain of checks every `op` frame passes
//! through before it reaches the store. A tower-style layered chain,
//! scoped to the one decision point the wire protocol needs gated rather
//! than a generic HTTP middleware stack.

use async_trait::async_trait;
use std::sync::Arc;

use crate::document::{DocType, Operation};
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait SubmitMiddleware: Send + Sync {
    async fn check(&self, op: &Operation) -> CoreResult<()>;
}

/// Clients may only submit ops against record collections; field/view/table
/// mutations are server-synthesized via [`crate::json0::OpBuilder`], never
/// accepted directly off the wire.
pub struct RecordOnlySubmit;

#[async_trait]
impl SubmitMiddleware for RecordOnlySubmit {
    async fn check(&self, op: &Operation) -> CoreResult<()> {
        let parsed = crate::document::parse_collection(&op.collection);
        if parsed.doc_type != DocType::Record {
            return Err(CoreError::PolicyViolation("only record op can be committed".into()));
        }
        Ok(())
    }
}

/// Rejects malformed ops before they reach a middleware that assumes a
/// valid shape.
pub struct WellFormedSubmit;

#[async_trait]
impl SubmitMiddleware for WellFormedSubmit {
    async fn check(&self, op: &Operation) -> CoreResult<()> {
        if !op.is_well_formed() {
            return Err(CoreError::OperationInvalid(
                "operation must populate exactly one of op, create, del".into(),
            ));
        }
        Ok(())
    }
}

/// An ordered chain of checks, all of which must pass for a submission to
/// proceed.
#[derive(Clone)]
pub struct SubmitChain {
    stages: Vec<Arc<dyn SubmitMiddleware>>,
}

impl SubmitChain {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn with(mut self, stage: Arc<dyn SubmitMiddleware>) -> Self {
        self.stages.push(stage);
        self
    }

    /// The chain every deployment needs regardless of configuration:
    /// well-formedness, then the record-only policy.
    pub fn default_chain() -> Self {
        Self::new()
            .with(Arc::new(WellFormedSubmit))
            .with(Arc::new(RecordOnlySubmit))
    }

    pub async fn run(&self, op: &Operation) -> CoreResult<()> {
        for stage in &self.stages {
            stage.check(op).await?;
        }
        Ok(())
    }
}

impl Default for SubmitChain {
    fn default() -> Self {
        Self::default_chain()
    }
}
