use std::time::Duration;

/// One telemetry record, emitted every `log_frequency` steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRecord {
    pub step: u64,
    pub loss: f32,
    pub examples_per_sec: f64,
    pub sec_per_batch: f64,
}

#[derive(Debug, Default, Clone)]
pub struct TrainerMetrics {
    pub compute_time: Duration,
    pub apply_time: Duration,

    pub steps: u64,
    pub samples: u64,
    pub checkpoints: u64,

    pub records: Vec<StepRecord>,
}

impl TrainerMetrics {
    #[inline]
    pub fn bump_step(&mut self) {
        self.steps += 1;
    }

    #[inline]
    pub fn add_samples(&mut self, n: usize) {
        self.samples += n as u64;
    }

    #[inline]
    pub fn bump_checkpoint(&mut self) {
        self.checkpoints += 1;
    }
}

/// Turns the time between two telemetry records into throughput figures.
///
/// # Args
/// * `steps` - The steps run since the previous record.
/// * `examples_per_step` - The examples consumed by one step, across every tower.
/// * `elapsed` - The time taken by those steps.
pub fn throughput(steps: u64, examples_per_step: usize, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || steps == 0 {
        return (0.0, 0.0);
    }

    let examples_per_sec = (steps * examples_per_step as u64) as f64 / secs;
    let sec_per_batch = secs / steps as f64;
    (examples_per_sec, sec_per_batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_over_a_logging_window() {
        let (eps, spb) = throughput(10, 128, Duration::from_secs(2));

        assert_eq!(eps, 640.0);
        assert_eq!(spb, 0.2);
        assert_eq!(throughput(0, 128, Duration::from_secs(1)), (0.0, 0.0));
    }
}
