//! Multi-step submit pipelines.
//!
//! Some saves need side effects first: creating a remote resource and
//! adopting its id into the draft before the settings are posted. A
//! [`SubmitPipeline`] is an ordered list of named [`SubmitStep`]s run ahead
//! of the final save by
//! [`SettingsHandle::submit_with`](crate::settings::SettingsHandle::submit_with).
//! The first failing step aborts the run and its name is carried in the
//! resulting [`SubmitError`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::SubmitError;
use crate::registry::Registry;
use crate::rest::RestError;
use crate::store::BoxFuture;

type StepFn = Arc<dyn Fn(Registry) -> BoxFuture<'static, Result<(), RestError>> + Send + Sync>;

/// One named step of a submit pipeline.
#[derive(Clone)]
pub struct SubmitStep {
    name: &'static str,
    run: StepFn,
}

impl SubmitStep {
    /// Wrap an async closure as a named step.
    ///
    /// The step receives a registry clone; steps that only apply under some
    /// condition should check it and return `Ok(())` to let the run proceed.
    pub fn new<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: Fn(Registry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RestError>> + Send + 'static,
    {
        Self {
            name,
            run: Arc::new(move |registry| Box::pin(run(registry))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for SubmitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered steps run before a settings save.
#[derive(Clone, Default)]
pub struct SubmitPipeline {
    steps: Vec<SubmitStep>,
}

impl SubmitPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step, builder style.
    pub fn step(mut self, step: SubmitStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a step in place.
    pub fn push(&mut self, step: SubmitStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Step`] naming the step whose [`RestError`]
    /// aborted the run; later steps are not attempted.
    pub async fn run(&self, registry: &Registry) -> Result<(), SubmitError> {
        for step in &self.steps {
            tracing::debug!(step = step.name, "running submit step");
            if let Err(source) = (step.run)(registry.clone()).await {
                tracing::warn!(step = step.name, error = %source, "submit step failed");
                return Err(SubmitError::Step {
                    step: step.name,
                    source,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SubmitPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|step| step.name).collect();
        f.debug_struct("SubmitPipeline").field("steps", &names).finish()
    }
}
