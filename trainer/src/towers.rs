use std::{collections::HashMap, sync::Arc};

use log::debug;
use machine_learning::{
    arch::Network,
    cells::CellContext,
    graph::Graph,
    optimization::GradientTuple,
    variables::{ScopeMode, VariableScope, VariableStore},
};
use tokio::task::JoinSet;

use crate::{
    config::Device,
    data::{Batch, BatchQueue},
    error::{Result, TrainErr},
};

/// What a tower hands back to the aggregation barrier.
#[derive(Debug, Clone)]
pub struct TowerOutput {
    pub tower: usize,
    /// Cross-entropy plus this tower's weight decay.
    pub loss: f32,
    pub cross_entropy: f32,
    pub examples: usize,
    /// One tuple per variable of the store, in creation order.
    pub grads: Vec<GradientTuple>,
}

/// The replicas of a network, one per device, sharing a single `VariableStore`.
///
/// Every replica resolves its parameters by name in `Reuse` mode, so the variables have to be
/// materialized before the first step.
pub struct Towers {
    network: Arc<Network>,
    store: VariableStore,
    devices: Vec<Device>,
}

impl Towers {
    /// Creates a new `Towers`.
    ///
    /// # Args
    /// * `network` - The model every tower replicates.
    /// * `store` - The variables shared by the towers.
    /// * `devices` - The device of each tower.
    pub fn new(network: Arc<Network>, store: VariableStore, devices: Vec<Device>) -> Self {
        Self {
            network,
            store,
            devices,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Runs one forward and backward pass on every tower.
    ///
    /// Each tower takes its own batch from `queue` and runs on the blocking pool. The call
    /// returns once every tower is done, which makes it the barrier before aggregation.
    ///
    /// # Returns
    /// The outputs ordered by tower.
    pub async fn step(&self, queue: &mut BatchQueue) -> Result<Vec<TowerOutput>> {
        let mut join_set = JoinSet::new();
        let mut task_ids = HashMap::with_capacity(self.devices.len());

        for (tower, &device) in self.devices.iter().enumerate() {
            let batch = queue.recv().await?;
            let network = self.network.clone();
            let store = self.store.clone();

            let handle = join_set.spawn_blocking(move || {
                let output = run_tower(&network, store, tower, batch);
                (tower, device, output)
            });
            task_ids.insert(handle.id(), tower);
        }

        let mut outputs = Vec::with_capacity(self.devices.len());
        while let Some(joined) = join_set.join_next().await {
            let (tower, device, output) = joined.map_err(|e| TrainErr::Tower {
                tower: task_ids.get(&e.id()).copied().unwrap_or_default(),
                reason: format!("compute join error: {e}"),
            })?;

            let output = output?;
            debug!(tower = tower, device:? = device, loss = output.loss; "tower done");
            outputs.push(output);
        }

        outputs.sort_by_key(|o| o.tower);
        Ok(outputs)
    }
}

/// Builds a fresh tape for one tower, computes its loss and differentiates it.
fn run_tower(
    network: &Network,
    store: VariableStore,
    tower: usize,
    batch: Batch,
) -> Result<TowerOutput> {
    let Batch { images, labels } = batch;
    let ids = store.ids();

    let mut graph = Graph::new();
    let scope = VariableScope::new(store, ScopeMode::Reuse);
    let mut ctx = CellContext::new(&mut graph, scope, true);

    let images = ctx.input(images.into_dyn());
    let loss = network.tower_loss(&mut ctx, images, &labels)?;

    let mut grads = graph.backward(loss.total)?;
    let grads = ids
        .into_iter()
        .map(|var| GradientTuple {
            grad: grads.remove(&var),
            var,
        })
        .collect();

    Ok(TowerOutput {
        tower,
        loss: graph.scalar(loss.total)?,
        cross_entropy: graph.scalar(loss.cross_entropy)?,
        examples: labels.len(),
        grads,
    })
}
