// Trace arithmetic shared by result derivation and analysis.

/// Block-mean decimation by `factor`. A trailing partial block is dropped.
pub fn downsample(data: &[f64], factor: usize) -> Vec<f64> {
    if factor <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(factor)
        .map(|block| block.iter().sum::<f64>() / factor as f64)
        .collect()
}

/// Pointwise mean of `repetitions` back-to-back copies of a trace.
///
/// Uses the first `repetitions * (len / repetitions)` samples.
pub fn mean_of_repetitions(data: &[f64], repetitions: usize) -> Vec<f64> {
    let repetitions = repetitions.max(1);
    let pulse_len = data.len() / repetitions;
    let mut mean = vec![0.0; pulse_len];
    if pulse_len == 0 {
        return mean;
    }
    for rep in data[..pulse_len * repetitions].chunks_exact(pulse_len) {
        for (acc, &value) in mean.iter_mut().zip(rep) {
            *acc += value;
        }
    }
    for value in &mut mean {
        *value /= repetitions as f64;
    }
    mean
}

pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        None
    } else {
        Some(data.iter().sum::<f64>() / data.len() as f64)
    }
}
