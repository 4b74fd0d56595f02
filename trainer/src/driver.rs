use std::{path::PathBuf, sync::Arc, time::Instant};

use log::{info, warn};
use machine_learning::{
    arch::Network,
    optimization::{ExponentialDecay, ExponentialMovingAverage, GradientDescent, LossAverage},
    variables::VariableStore,
};
use specs::TrainingSpec;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregation::average_gradients,
    checkpoint::Checkpointer,
    config::TrainerConfig,
    data::{BatchQueue, BatchSource, ensure_data_dir},
    error::{Result, TrainErr},
    metrics::{StepRecord, TrainerMetrics, throughput},
    towers::Towers,
};

/// How a finished run went.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// The step the run resumed from.
    pub first_step: u64,
    /// The global step reached.
    pub last_step: u64,
    pub updates: u64,
    pub last_loss: Option<f32>,
    pub loss_average: f32,
    pub cancelled: bool,
    /// The last checkpoint written by this run.
    pub checkpoint: Option<PathBuf>,
    pub metrics: TrainerMetrics,
}

/// Sequences training steps over the towers of a network.
///
/// Steps are synchronous: every tower finishes its backward pass, the gradients are averaged,
/// and exactly one update is applied to the shared variables before the next step starts.
pub struct Driver {
    config: TrainerConfig,
    network: Arc<Network>,
    store: VariableStore,
    checkpointer: Checkpointer,
    token: CancellationToken,
}

impl Driver {
    /// Creates a new `Driver`.
    ///
    /// # Args
    /// * `config` - The run's execution bounds.
    /// * `network` - The model to train.
    pub fn new(config: TrainerConfig, network: Network) -> Self {
        let checkpointer = Checkpointer::new(config.train_dir(), config.max_to_keep());

        Self {
            store: VariableStore::new(config.seed()),
            network: Arc::new(network),
            checkpointer,
            token: CancellationToken::new(),
            config,
        }
    }

    /// Creates the `Driver` of a task configuration, with the reference cells.
    pub fn from_spec(spec: &TrainingSpec) -> Result<Self> {
        let config = TrainerConfig::from_spec(spec)?;
        Ok(Self::new(config, Network::from_spec(spec)))
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Returns the variables being trained.
    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    /// Returns a token that stops the run after the step in flight.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trains until the configured step is reached or the run is cancelled.
    ///
    /// The network is materialized and the latest checkpoint, if any, restored before the first
    /// step. Checkpoints are saved every `save_interval` and once more at the end of the run.
    ///
    /// # Args
    /// * `source` - Where the towers' batches come from.
    ///
    /// # Errors
    /// Returns `TrainErr::NonFiniteLoss` without saving anything if a step's loss isn't finite.
    pub async fn run<S>(&mut self, source: S) -> Result<TrainingSummary>
    where
        S: BatchSource + 'static,
    {
        ensure_data_dir(self.config.dataset(), self.config.data_dir())?;

        let schedule_spec = *self.config.schedule();
        let params = self.materialize().await?;
        info!(
            params = params,
            towers = self.config.towers();
            "trainable parameters"
        );

        let restored = self
            .checkpointer
            .restore(&self.store, schedule_spec.loss_average_decay)?;

        let (first_step, mut loss_average) = match restored {
            Some(restored) => (
                restored.step,
                restored
                    .loss_average
                    .unwrap_or_else(|| LossAverage::new(schedule_spec.loss_average_decay)),
            ),
            None => (0, LossAverage::new(schedule_spec.loss_average_decay)),
        };

        let max_steps = self.config.max_steps();
        let mut summary = TrainingSummary {
            first_step,
            last_step: first_step,
            updates: 0,
            last_loss: None,
            loss_average: loss_average.value(),
            cancelled: false,
            checkpoint: None,
            metrics: TrainerMetrics::default(),
        };

        if first_step >= max_steps {
            info!(step = first_step, max_steps = max_steps; "nothing left to train");
            return Ok(summary);
        }

        let schedule = ExponentialDecay::from_spec(&schedule_spec, self.config.batch_size());
        let ema = ExponentialMovingAverage::new(schedule_spec.moving_average_decay);
        let towers = Towers::new(
            self.network.clone(),
            self.store.clone(),
            self.config.devices().to_vec(),
        );
        let examples_per_step = self.config.batch_size() * towers.len();
        let log_frequency = self.config.log_frequency();

        let mut queue = BatchQueue::spawn(source, self.config.queue_capacity());
        let mut last_save = Instant::now();
        let mut last_log = Instant::now();

        info!(from = first_step, to = max_steps; "starting training");

        let mut step = first_step;
        let outcome = loop {
            if step >= max_steps {
                break Ok(());
            }
            if self.token.is_cancelled() {
                summary.cancelled = true;
                info!(step = step; "training cancelled");
                break Ok(());
            }

            let loss = match self
                .step(&towers, &mut queue, &schedule, step, &mut summary.metrics)
                .await
            {
                Ok(loss) => loss,
                Err(e) => break Err(e),
            };

            step += 1;
            ema.apply(&self.store, step);
            loss_average.update(loss);

            summary.last_step = step;
            summary.updates += 1;
            summary.last_loss = Some(loss);
            summary.metrics.bump_step();
            summary.metrics.add_samples(examples_per_step);

            if step % log_frequency == 0 {
                let (examples_per_sec, sec_per_batch) =
                    throughput(log_frequency, examples_per_step, last_log.elapsed());
                last_log = Instant::now();

                info!(
                    step = step,
                    loss = loss,
                    loss_average = loss_average.value(),
                    examples_per_sec = examples_per_sec,
                    sec_per_batch = sec_per_batch;
                    "step {step}, loss = {loss:.2} ({examples_per_sec:.1} examples/sec; {sec_per_batch:.3} sec/batch)"
                );

                summary.metrics.records.push(StepRecord {
                    step,
                    loss,
                    examples_per_sec,
                    sec_per_batch,
                });
            }

            if last_save.elapsed() >= self.config.save_interval() && step < max_steps {
                match self.save(&loss_average, step).await {
                    Ok(path) => summary.checkpoint = Some(path),
                    Err(e) => break Err(e),
                }
                summary.metrics.bump_checkpoint();
                last_save = Instant::now();
            }
        };

        queue.shutdown().await;
        outcome?;

        if summary.updates > 0 {
            summary.checkpoint = Some(self.save(&loss_average, step).await?);
            summary.metrics.bump_checkpoint();
        }

        summary.loss_average = loss_average.value();
        info!(
            step = summary.last_step,
            updates = summary.updates,
            loss_average = summary.loss_average;
            "training finished"
        );

        Ok(summary)
    }

    /// Runs one synchronous step and returns the mean of the towers' losses.
    async fn step(
        &self,
        towers: &Towers,
        queue: &mut BatchQueue,
        schedule: &ExponentialDecay,
        step: u64,
        metrics: &mut TrainerMetrics,
    ) -> Result<f32> {
        let start = Instant::now();
        let outputs = towers.step(queue).await?;
        metrics.compute_time += start.elapsed();

        let loss = outputs.iter().map(|o| o.loss).sum::<f32>() / outputs.len().max(1) as f32;
        if !loss.is_finite() {
            return Err(TrainErr::NonFiniteLoss { step, loss });
        }

        let tower_grads: Vec<_> = outputs.into_iter().map(|o| o.grads).collect();
        let grads = average_gradients(&tower_grads)?;

        let optimizer = GradientDescent::new(schedule.learning_rate(step));
        let store = self.store.clone();

        let start = Instant::now();
        let updated = task::spawn_blocking(move || store.apply_gradients(&grads, &optimizer))
            .await
            .map_err(|e| TrainErr::Tower {
                tower: 0,
                reason: format!("apply join error: {e}"),
            })??;
        metrics.apply_time += start.elapsed();

        if updated == 0 {
            warn!(step = step; "no variable received a gradient");
        }

        Ok(loss)
    }

    async fn materialize(&self) -> Result<usize> {
        let network = self.network.clone();
        let store = self.store.clone();
        let shape = self.config.image_shape();

        let params = task::spawn_blocking(move || network.materialize(&store, shape))
            .await
            .map_err(|e| TrainErr::Tower {
                tower: 0,
                reason: format!("materialize join error: {e}"),
            })??;

        Ok(params)
    }

    async fn save(&self, loss_average: &LossAverage, step: u64) -> Result<PathBuf> {
        let checkpointer = self.checkpointer.clone();
        let store = self.store.clone();
        let loss_average = *loss_average;

        task::spawn_blocking(move || checkpointer.save(&store, &loss_average, step))
            .await
            .map_err(|e| TrainErr::checkpoint(self.checkpointer.dir(), e))?
    }
}
