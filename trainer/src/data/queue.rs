use log::{debug, warn};
use tokio::{
    sync::mpsc,
    task::{self, JoinHandle},
};

use super::{Batch, BatchSource};
use crate::error::{Result, TrainErr};

/// The consuming end of the bounded queue between the batch producer and the towers.
#[derive(Debug)]
pub struct BatchQueue {
    rx: mpsc::Receiver<Result<Batch>>,
    producer: JoinHandle<()>,
}

impl BatchQueue {
    /// Spawns a producer that keeps up to `capacity` batches of `source` ready.
    ///
    /// The producer runs on the blocking pool and stops as soon as the queue is dropped or the
    /// source fails, in which case the error is handed to the next consumer.
    ///
    /// # Args
    /// * `source` - Where batches come from.
    /// * `capacity` - The amount of batches buffered ahead of the towers.
    pub fn spawn<S>(mut source: S, capacity: usize) -> Self
    where
        S: BatchSource + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let producer = task::spawn_blocking(move || {
            let mut produced = 0u64;

            loop {
                let batch = source.next_batch();
                let failed = batch.is_err();

                if tx.blocking_send(batch).is_err() {
                    debug!(produced = produced; "batch queue closed, stopping producer");
                    return;
                }

                if failed {
                    warn!(produced = produced; "batch source failed, stopping producer");
                    return;
                }

                produced += 1;
            }
        });

        Self { rx, producer }
    }

    /// Waits for the next batch.
    ///
    /// # Returns
    /// The batch, the source's error, or `QueueClosed` if the producer is gone.
    pub async fn recv(&mut self) -> Result<Batch> {
        self.rx.recv().await.ok_or(TrainErr::QueueClosed)?
    }

    /// Closes the queue and waits for the producer to notice.
    pub async fn shutdown(self) {
        let Self { rx, producer } = self;
        drop(rx);

        if let Err(e) = producer.await {
            warn!("batch producer join error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticSource;

    struct Failing;

    impl BatchSource for Failing {
        fn next_batch(&mut self) -> Result<Batch> {
            Err(TrainErr::Config("no data".to_string()))
        }
    }

    #[tokio::test]
    async fn batches_flow_until_shutdown() {
        let mut queue = BatchQueue::spawn(SyntheticSource::new(2, [2, 2, 1], 2, Some(0)), 2);

        for _ in 0..5 {
            assert_eq!(queue.recv().await.unwrap().len(), 2);
        }

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn source_errors_reach_the_consumer() {
        let mut queue = BatchQueue::spawn(Failing, 2);

        assert!(matches!(queue.recv().await, Err(TrainErr::Config(_))));
        assert!(matches!(queue.recv().await, Err(TrainErr::QueueClosed)));
    }
}
