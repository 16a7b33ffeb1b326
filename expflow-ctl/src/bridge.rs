//! Trial-runner bridge
//!
//! [`RunnerBridge`] is the controller's [`SessionListener`]: it turns runner
//! notifications into controller messages. The other direction, building a
//! runner block from a block config, goes through [`BlockBuilder`] and the
//! user-supplied [`BlockConfigurator`].

use crate::block::BlockConfig;
use crate::controller::Command;
use crate::error::{FlowError, Result};
use crate::runner::{
    BlockHandle, RunnerEvent, SessionListener, SessionParams, TrialHandle, TrialRunner,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Block config key read by [`TrialCountConfigurator`]
pub const TRIAL_COUNT_KEY: &str = "trial_count";

/// Forwards runner notifications to the controller mailbox
pub struct RunnerBridge {
    mailbox: mpsc::UnboundedSender<Command>,
}

impl RunnerBridge {
    pub(crate) fn new(mailbox: mpsc::UnboundedSender<Command>) -> Self {
        Self { mailbox }
    }

    fn forward(&self, event: RunnerEvent) {
        if self.mailbox.send(Command::Runner(event)).is_err() {
            debug!("Runner notification dropped: controller stopped");
        }
    }
}

impl SessionListener for RunnerBridge {
    fn on_session_begin(&self, params: &SessionParams) {
        self.forward(RunnerEvent::SessionBegin(params.clone()));
    }

    fn on_block_begin(&self, block: BlockHandle) {
        self.forward(RunnerEvent::BlockBegin(block));
    }

    fn on_trial_begin(&self, trial: TrialHandle) {
        self.forward(RunnerEvent::TrialBegin(trial));
    }

    fn on_trial_end(&self, trial: TrialHandle) {
        self.forward(RunnerEvent::TrialEnd(trial));
    }

    fn on_block_end(&self, block: BlockHandle) {
        self.forward(RunnerEvent::BlockEnd(block));
    }

    fn on_session_end(&self) {
        self.forward(RunnerEvent::SessionEnd);
    }
}

/// Access to the runner block being configured
pub struct BlockBuilder<'a> {
    runner: &'a dyn TrialRunner,
    block: BlockHandle,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(runner: &'a dyn TrialRunner, block: BlockHandle) -> Self {
        Self { runner, block }
    }

    pub fn block(&self) -> BlockHandle {
        self.block
    }

    pub fn create_trial(&mut self) -> Result<TrialHandle> {
        Ok(self.runner.create_trial(self.block)?)
    }

    pub fn create_trials(&mut self, count: usize) -> Result<Vec<TrialHandle>> {
        (0..count).map(|_| self.create_trial()).collect()
    }

    pub fn set_setting(&mut self, key: &str, value: Value) {
        self.runner.set_block_setting(self.block, key, value);
    }

    pub fn trial_count(&self) -> usize {
        self.runner.trial_count(self.block)
    }
}

/// Fills a freshly created runner block from its config
///
/// `last_block_cancelled` is true when the previous block was cancelled,
/// so a configurator can, for example, repeat instructions.
pub trait BlockConfigurator: Send + Sync {
    fn configure(
        &self,
        config: &BlockConfig,
        block: &mut BlockBuilder<'_>,
        last_block_cancelled: bool,
    ) -> Result<()>;
}

impl<F> BlockConfigurator for F
where
    F: Fn(&BlockConfig, &mut BlockBuilder<'_>, bool) -> Result<()> + Send + Sync,
{
    fn configure(
        &self,
        config: &BlockConfig,
        block: &mut BlockBuilder<'_>,
        last_block_cancelled: bool,
    ) -> Result<()> {
        self(config, block, last_block_cancelled)
    }
}

/// Configurator used by the binary
///
/// Creates `trial_count` trials (falling back to a fixed default) and copies
/// every extra config field into the block settings.
#[derive(Debug, Clone)]
pub struct TrialCountConfigurator {
    default_trials: usize,
}

impl TrialCountConfigurator {
    pub fn new(default_trials: usize) -> Self {
        Self { default_trials }
    }
}

impl BlockConfigurator for TrialCountConfigurator {
    fn configure(
        &self,
        config: &BlockConfig,
        block: &mut BlockBuilder<'_>,
        last_block_cancelled: bool,
    ) -> Result<()> {
        let trials = match config.extra.get(TRIAL_COUNT_KEY) {
            Some(value) => value.as_u64().ok_or_else(|| {
                FlowError::Configure(format!(
                    "{} of block {} is not a non-negative integer",
                    TRIAL_COUNT_KEY, config.name
                ))
            })? as usize,
            None => self.default_trials,
        };

        for (key, value) in &config.extra {
            block.set_setting(key, value.clone());
        }
        block.create_trials(trials)?;

        debug!(
            block = block.block().number,
            name = %config.name,
            trials,
            last_block_cancelled,
            "Block configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::InMemoryRunner;
    use serde_json::json;

    fn runner_with_block() -> (InMemoryRunner, BlockHandle) {
        let runner = InMemoryRunner::new();
        runner.begin_session(&SessionParams::default()).unwrap();
        let block = runner.create_block().unwrap();
        (runner, block)
    }

    #[test]
    fn test_trial_count_from_config() {
        let (runner, block) = runner_with_block();
        let config = BlockConfig::named("b1")
            .with_extra("trial_count", json!(3))
            .with_extra("conditionVal", json!("fast"));

        let mut builder = BlockBuilder::new(&runner, block);
        TrialCountConfigurator::new(1)
            .configure(&config, &mut builder, false)
            .unwrap();

        assert_eq!(builder.trial_count(), 3);
        assert_eq!(
            runner.block_settings(block).get("conditionVal"),
            Some(&json!("fast"))
        );
    }

    #[test]
    fn test_trial_count_default() {
        let (runner, block) = runner_with_block();
        let mut builder = BlockBuilder::new(&runner, block);
        TrialCountConfigurator::new(2)
            .configure(&BlockConfig::named("b1"), &mut builder, false)
            .unwrap();
        assert_eq!(builder.trial_count(), 2);
    }

    #[test]
    fn test_bad_trial_count_rejected() {
        let (runner, block) = runner_with_block();
        let config = BlockConfig::named("b1").with_extra("trial_count", json!("many"));
        let mut builder = BlockBuilder::new(&runner, block);
        let result = TrialCountConfigurator::new(1).configure(&config, &mut builder, false);
        assert!(matches!(result, Err(FlowError::Configure(_))));
    }

    #[test]
    fn test_closure_configurator() {
        fn configurator<F>(f: F) -> F
        where
            F: Fn(&BlockConfig, &mut BlockBuilder<'_>, bool) -> Result<()>,
        {
            f
        }

        let (runner, block) = runner_with_block();
        let configurator = configurator(|_, builder, cancelled| {
            builder.create_trials(if cancelled { 1 } else { 4 })?;
            Ok(())
        });

        let mut builder = BlockBuilder::new(&runner, block);
        configurator
            .configure(&BlockConfig::named("b1"), &mut builder, true)
            .unwrap();
        assert_eq!(builder.trial_count(), 1);
    }
}
