//! Pipelines: ordered operator-factory chains between blocking boundaries.

use std::sync::Arc;

use basalt_common::{EngineError, Result};

use crate::op::{Operator, OperatorFactory};

/// One pipeline: a source factory followed by transforms and a sink factory.
///
/// Expanded at runtime into `degree` drivers, each with its own operator
/// instance chain; leaf pipelines take one driver per morsel instead.
pub struct Pipeline {
    factories: Vec<Arc<dyn OperatorFactory>>,
    degree: usize,
}

impl Pipeline {
    /// Create a pipeline over assembled factories.
    pub fn new(factories: Vec<Arc<dyn OperatorFactory>>, degree: usize) -> Result<Self> {
        let Some(head) = factories.first() else {
            return Err(EngineError::Internal("empty pipeline".to_string()));
        };
        if !head.is_source() {
            return Err(EngineError::Internal(format!(
                "pipeline head {} is not a source",
                head.name()
            )));
        }
        Ok(Self {
            factories,
            degree: degree.max(1),
        })
    }

    /// Parallelism degree (driver count).
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// The factory chain.
    pub fn factories(&self) -> &[Arc<dyn OperatorFactory>] {
        &self.factories
    }

    /// Instantiate the operator chain for driver `driver_seq`.
    pub fn instantiate(&self, driver_seq: usize) -> Result<Vec<Box<dyn Operator>>> {
        self.factories
            .iter()
            .map(|f| f.create(self.degree, driver_seq))
            .collect()
    }

    /// Short description for logs: `scan->filter->exchange_sink`.
    pub fn describe(&self) -> String {
        self.factories
            .iter()
            .map(|f| f.name())
            .collect::<Vec<_>>()
            .join("->")
    }
}
