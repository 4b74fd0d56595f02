use machine_learning::{
    arch::Network,
    cells::CellContext,
    graph::Graph,
    optimization::{ExponentialMovingAverage, GradientDescent, GradientTuple},
    variables::{ScopeMode, VariableScope, VariableStore},
};
use ndarray::{Array, ArrayD};
use serde_json::json;
use specs::{ArchSpec, ClassificationCellSpec, InitCellSpec};

/// Bright images are class 1, dark ones class 0.
fn batch() -> (ArrayD<f32>, Vec<usize>) {
    let labels = vec![0, 1, 0, 1];
    let images = Array::from_shape_fn((4, 4, 4, 1), |(b, h, w, _)| {
        let base = if labels[b] == 1 { 1.0 } else { -1.0 };
        base + 0.05 * ((h * 4 + w) as f32).cos()
    });

    (images.into_dyn(), labels)
}

fn step(network: &Network, store: &VariableStore, lr: f32) -> f32 {
    let (images, labels) = batch();
    let mut graph = Graph::new();
    let scope = VariableScope::new(store.clone(), ScopeMode::Reuse);
    let mut ctx = CellContext::new(&mut graph, scope, true);

    let x = ctx.input(images);
    let loss = network.tower_loss(&mut ctx, x, &labels).unwrap();
    let value = graph.scalar(loss.total).unwrap();

    let mut grads = graph.backward(loss.total).unwrap();
    let tuples: Vec<_> = store
        .ids()
        .into_iter()
        .map(|var| GradientTuple {
            grad: grads.remove(&var),
            var,
        })
        .collect();

    store
        .apply_gradients(&tuples, &GradientDescent::new(lr))
        .unwrap();

    value
}

#[test]
fn gradient_descent_lowers_the_loss() {
    let arch: ArchSpec = serde_json::from_value(json!([
        {"filters": {"conv3x3": {}}, "outputs": 4},
        {"outputs": 2}
    ]))
    .unwrap();

    let network = Network::new(arch, InitCellSpec::new(4), ClassificationCellSpec::new(2));
    let store = VariableStore::new(Some(11));
    network.materialize(&store, [4, 4, 1]).unwrap();

    let ema = ExponentialMovingAverage::new(0.9999);
    let first = step(&network, &store, 0.5);
    let mut last = first;

    for i in 1..=60 {
        last = step(&network, &store, 0.5);
        ema.apply(&store, i);
    }

    assert!(last.is_finite());
    assert!(last < first, "loss went from {first} to {last}");
}
