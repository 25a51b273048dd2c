//! Fragment executor: descriptor in, running drivers out.

use std::sync::Arc;
use std::time::Duration;

use basalt_common::{MemTracker, Result};
use basalt_exec::plan::FragmentPlan;
use basalt_exec::{Driver, RuntimeState};

use crate::builder::FragmentCompiler;
use crate::context::{ExecEnv, FragmentContext};

/// Prepares and launches plan fragments against an execution environment.
pub struct FragmentExecutor {
    env: Arc<ExecEnv>,
}

impl FragmentExecutor {
    /// Create an executor over `env`.
    pub fn new(env: Arc<ExecEnv>) -> Self {
        Self { env }
    }

    /// Prepare a fragment: contexts, trackers, pipelines, one driver per
    /// morsel on leaf pipelines and `degree` drivers elsewhere. Nothing runs
    /// until [`PreparedFragment::submit`].
    pub fn prepare(&self, plan: &FragmentPlan) -> Result<PreparedFragment> {
        match self.prepare_inner(plan) {
            Ok(prepared) => Ok(prepared),
            Err(err) => {
                // Receivers registered during compilation must not leak.
                self.env
                    .receiver_registry()
                    .deregister_instance(plan.instance_id);
                Err(err)
            }
        }
    }

    fn prepare_inner(&self, plan: &FragmentPlan) -> Result<PreparedFragment> {
        let mut config = self.env.config().clone();
        plan.options.apply(&mut config);

        let query_tracker = self.env.query_tracker(plan.query_id);
        let fragment_tracker = MemTracker::child(
            &query_tracker,
            format!("fragment-{}", plan.instance_id),
            Some(config.fragment_mem_limit_bytes),
        );
        let timeout_ms = config.query_timeout_ms;
        let runtime_state = Arc::new(RuntimeState::new(
            plan.query_id,
            plan.instance_id,
            config,
            fragment_tracker,
        ));

        let compiled = FragmentCompiler::compile(plan, &self.env, &runtime_state)?;
        let driver_total: usize = compiled.pipelines.iter().map(|p| p.degree()).sum();
        let context = FragmentContext::new(
            plan.instance_id,
            Arc::clone(&runtime_state),
            Arc::clone(self.env.receiver_registry()),
            driver_total,
            compiled.result,
        );

        let mut drivers = Vec::with_capacity(driver_total);
        for pipeline in &compiled.pipelines {
            tracing::debug!(
                finst = %plan.instance_id,
                pipeline = %pipeline.describe(),
                degree = pipeline.degree(),
                "compiled pipeline"
            );
            for seq in 0..pipeline.degree() {
                let ops = pipeline.instantiate(seq)?;
                let completion_ctx = Arc::clone(&context);
                let mut driver = Driver::new(
                    ops,
                    Arc::clone(&runtime_state),
                    Box::new(move |result| completion_ctx.on_driver_finished(result)),
                );
                driver.prepare()?;
                drivers.push(driver);
            }
        }

        if timeout_ms > 0 {
            let weak = Arc::downgrade(&context);
            self.env.rpc_handle().spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if let Some(ctx) = weak.upgrade() {
                    if !ctx.is_done() {
                        ctx.cancel("query deadline exceeded");
                    }
                }
            });
        }

        Ok(PreparedFragment {
            env: Arc::clone(&self.env),
            context,
            drivers,
        })
    }

    /// Prepare and immediately submit.
    pub fn execute(&self, plan: &FragmentPlan) -> Result<Arc<FragmentContext>> {
        Ok(self.prepare(plan)?.submit())
    }
}

/// A prepared fragment whose drivers are not yet running.
pub struct PreparedFragment {
    env: Arc<ExecEnv>,
    /// The fragment's lifecycle context.
    pub context: Arc<FragmentContext>,
    drivers: Vec<Driver>,
}

impl PreparedFragment {
    /// Number of drivers about to run.
    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Hand every driver to the dispatcher.
    pub fn submit(self) -> Arc<FragmentContext> {
        for driver in self.drivers {
            self.env.driver_executor().submit(driver);
        }
        self.context
    }
}
