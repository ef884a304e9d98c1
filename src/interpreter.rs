use crate::command::StageStatus;
use crate::env::Environment;
use crate::error::Result;
use crate::launcher::launch;
use crate::pipeline::{Pipeline, build_pipeline};

/// Builds and runs pipelines against one [`Environment`].
///
/// Example
/// ```
/// use shell_pipeline::Interpreter;
/// let mut sh = Interpreter::default();
/// let statuses = sh.run(&["true", "|", "true"]).unwrap();
/// assert!(statuses.iter().all(|s| s.success()));
/// ```
#[derive(Debug, Clone)]
pub struct Interpreter {
    env: Environment,
}

impl Interpreter {
    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// Build the pipeline for `tokens` without launching it.
    pub fn build<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Pipeline> {
        build_pipeline(tokens, &self.env)
    }

    /// Run one tokenized command line and collect every stage's status, in launch order.
    ///
    /// Construction failures are returned before anything is forked. Whether the statuses
    /// add up to success is for the caller to decide.
    pub fn run<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<Vec<StageStatus>> {
        launch(self.build(tokens)?)
    }
}

impl Default for Interpreter {
    /// An interpreter over a snapshot of the current process environment.
    fn default() -> Self {
        Self::new(Environment::new())
    }
}
