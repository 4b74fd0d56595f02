use std::{path::Path, time::Duration};

use machine_learning::{arch::Network, optimization::LossAverage, variables::VariableStore};
use ndarray::Array4;
use serde_json::json;
use specs::TrainingSpec;
use trainer::{
    Driver, Result, TrainErr, TrainerConfig,
    checkpoint::{Checkpointer, STATE_FILE, parse_step},
    data::{Batch, BatchSource, SyntheticSource},
};

fn spec(root: &Path, steps: u64, gpus: &[usize], dataset: &str) -> TrainingSpec {
    let value = json!({
        "arch": [
            {"filters": {"conv3x3": {}, "maxpool3x3": {}}, "outputs": 8},
            {"widener": {}},
            {"filters": {"conv3x3": {}}, "outputs": 8, "inputs": "all"},
            {"outputs": 10}
        ],
        "init_cell": {"outputs": 4},
        "classification_cell": {"classes": 10, "weight_decay": 0.004},
        "parameters": {
            "arch_name": "tiny",
            "batch_size": 4,
            "image_size": 8,
            "steps": steps,
            "dataset": dataset,
            "data_dir": root.join("data"),
            "train_dir": root.join("train"),
            "gpus": gpus,
            "log_frequency": 5,
            "seed": 11
        }
    });

    serde_json::from_value(value).unwrap()
}

fn source(spec: &TrainingSpec) -> SyntheticSource {
    let config = TrainerConfig::from_spec(spec).unwrap();
    SyntheticSource::from_config(&config)
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_single_device_run_saves_its_last_step() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 10, &[], "cifar10");

    let mut driver = Driver::from_spec(&spec).unwrap();
    let summary = driver.run(source(&spec)).await.unwrap();

    assert_eq!(summary.first_step, 0);
    assert_eq!(summary.last_step, 10);
    assert_eq!(summary.updates, 10);
    assert!(!summary.cancelled);
    assert!(summary.last_loss.unwrap().is_finite());
    assert_eq!(summary.metrics.samples, 40);

    let records: Vec<_> = summary.metrics.records.iter().map(|r| r.step).collect();
    assert_eq!(records, [5, 10]);

    let checkpoint = summary.checkpoint.unwrap();
    assert_eq!(parse_step(checkpoint.to_str().unwrap()).unwrap(), 10);

    let ckpt = Checkpointer::new(root.path().join("train"), 5);
    let (latest, step) = ckpt.latest().unwrap().unwrap();
    assert_eq!(latest, checkpoint);
    assert_eq!(step, 10);

    // Cifar10 directories are created on demand.
    assert!(root.path().join("data").is_dir());
}

#[tokio::test(flavor = "multi_thread")]
async fn runs_resume_from_the_step_of_their_latest_checkpoint() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 1002, &[], "cifar10");

    // A previous run that stopped at step 1000.
    let previous = VariableStore::new(Some(3));
    Network::from_spec(&spec)
        .materialize(&previous, [8, 8, 3])
        .unwrap();
    let mut avg = LossAverage::new(spec.schedule.loss_average_decay);
    avg.update(2.0);
    Checkpointer::new(root.path().join("train"), 5)
        .save(&previous, &avg, 1000)
        .unwrap();

    let mut driver = Driver::from_spec(&spec).unwrap();
    let summary = driver.run(source(&spec)).await.unwrap();

    assert_eq!(summary.first_step, 1000);
    assert_eq!(summary.updates, 2);
    assert_eq!(summary.last_step, 1002);
    assert!(summary.checkpoint.unwrap().ends_with("model.ckpt-1002"));

    // Trained from the restored values, not from the ones the driver initialized itself.
    assert_eq!(driver.store().names(), previous.names());
    assert_ne!(driver.store().snapshot(), previous.snapshot());
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_runs_have_nothing_left_to_train() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 3, &[], "cifar10");

    let mut driver = Driver::from_spec(&spec).unwrap();
    driver.run(source(&spec)).await.unwrap();

    let mut again = Driver::from_spec(&spec).unwrap();
    let summary = again.run(source(&spec)).await.unwrap();

    assert_eq!(summary.first_step, 3);
    assert_eq!(summary.updates, 0);
    assert_eq!(summary.checkpoint, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn towers_share_one_set_of_variables() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 3, &[0, 1, 2], "cifar10");

    let single = VariableStore::new(Some(0));
    Network::from_spec(&spec)
        .materialize(&single, [8, 8, 3])
        .unwrap();

    let mut driver = Driver::from_spec(&spec).unwrap();
    assert_eq!(driver.config().queue_capacity(), 6);

    let summary = driver.run(source(&spec)).await.unwrap();

    assert_eq!(summary.updates, 3);
    assert_eq!(summary.metrics.samples, 3 * 3 * 4);
    assert_eq!(driver.store().len(), single.len());
    assert_eq!(driver.store().names(), single.names());
}

/// Images full of NaNs, which make every loss NaN.
struct Poisoned;

impl BatchSource for Poisoned {
    fn next_batch(&mut self) -> Result<Batch> {
        Ok(Batch {
            images: Array4::from_elem((4, 8, 8, 3), f32::NAN),
            labels: vec![0; 4],
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn non_finite_losses_abort_without_a_checkpoint() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 10, &[], "cifar10");

    let mut driver = Driver::from_spec(&spec).unwrap();
    let err = driver.run(Poisoned).await.unwrap_err();

    assert!(matches!(err, TrainErr::NonFiniteLoss { step: 0, .. }));
    assert!(!root.path().join("train").join(STATE_FILE).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_runs_stop_between_steps() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 10, &[], "cifar10");

    let mut driver = Driver::from_spec(&spec).unwrap();
    driver.cancellation_token().cancel();
    let summary = driver.run(source(&spec)).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.updates, 0);
    assert_eq!(summary.checkpoint, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_are_also_saved_on_a_timer() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 4, &[], "cifar10");

    let config = TrainerConfig::from_spec(&spec)
        .unwrap()
        .with_save_interval(Duration::ZERO);
    let mut driver = Driver::new(config, Network::from_spec(&spec));
    let summary = driver.run(source(&spec)).await.unwrap();

    assert_eq!(summary.metrics.checkpoints, 4);

    let state = Checkpointer::new(root.path().join("train"), 5)
        .state()
        .unwrap()
        .unwrap();
    assert_eq!(
        state.all_model_checkpoint_paths,
        ["model.ckpt-1", "model.ckpt-2", "model.ckpt-3", "model.ckpt-4"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_imagenet_data_is_a_configuration_error() {
    let root = tempfile::tempdir().unwrap();
    let spec = spec(root.path(), 10, &[], "imagenet");

    let mut driver = Driver::from_spec(&spec).unwrap();
    assert!(matches!(
        driver.run(source(&spec)).await,
        Err(TrainErr::Config(_))
    ));
}
