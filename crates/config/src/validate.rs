use mnemo_common::{Error, Result};

use crate::schema::MemoryEngineConfig;

/// Reject configurations the engine cannot run with. Called at load time and
/// again by the engine constructor.
pub fn validate(config: &MemoryEngineConfig) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.window_size_words == 0 {
        return invalid("chunking.window_size_words must be greater than zero");
    }
    if chunking.overlap_words >= chunking.window_size_words {
        return invalid(format!(
            "chunking.overlap_words ({}) must be smaller than window_size_words ({})",
            chunking.overlap_words, chunking.window_size_words
        ));
    }

    let tiers = &config.tiers;
    if tiers.hot_capacity == 0 || tiers.warm_capacity == 0 {
        return invalid("tier capacities must be greater than zero");
    }
    if tiers.cold_capacity == Some(0) {
        return invalid("tiers.cold_capacity must be greater than zero when set");
    }
    if tiers.promotion_window_secs == 0 {
        return invalid("tiers.promotion_window_secs must be greater than zero");
    }

    if config.cache.l1_capacity == 0 {
        return invalid("cache.l1_capacity must be greater than zero");
    }

    let health = &config.partitioning.health;
    let weights = [
        health.error_weight,
        health.latency_weight,
        health.recency_weight,
    ];
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return invalid("partition health weights must be finite and non-negative");
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return invalid("partition health weights must not all be zero");
    }
    if !(health.latency_target_ms.is_finite() && health.latency_target_ms > 0.0) {
        return invalid("partitioning.health.latency_target_ms must be positive");
    }
    if config.partitioning.max_documents_per_partition == Some(0) {
        return invalid("partitioning.max_documents_per_partition must be greater than zero");
    }

    if config.retrieval.default_k == 0 {
        return invalid("retrieval.default_k must be greater than zero");
    }
    let threshold = config.retrieval.default_similarity_threshold;
    if !(-1.0..=1.0).contains(&threshold) {
        return invalid("retrieval.default_similarity_threshold must be within [-1, 1]");
    }

    if config.maintenance.interval_secs == 0 {
        return invalid("maintenance.interval_secs must be greater than zero");
    }
    if config.security.key_env_var.trim().is_empty() {
        return invalid("security.key_env_var must not be empty");
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> Result<()> {
    Err(Error::InvalidConfiguration(message.into()))
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&MemoryEngineConfig::default()).is_ok());
    }

    #[rstest]
    #[case::zero_window(|c: &mut MemoryEngineConfig| c.chunking.window_size_words = 0)]
    #[case::overlap_equals_window(|c: &mut MemoryEngineConfig| c.chunking.overlap_words = c.chunking.window_size_words)]
    #[case::zero_hot(|c: &mut MemoryEngineConfig| c.tiers.hot_capacity = 0)]
    #[case::zero_cold(|c: &mut MemoryEngineConfig| c.tiers.cold_capacity = Some(0))]
    #[case::zero_l1(|c: &mut MemoryEngineConfig| c.cache.l1_capacity = 0)]
    #[case::negative_weight(|c: &mut MemoryEngineConfig| c.partitioning.health.error_weight = -1.0)]
    #[case::all_zero_weights(|c: &mut MemoryEngineConfig| {
        c.partitioning.health.error_weight = 0.0;
        c.partitioning.health.latency_weight = 0.0;
        c.partitioning.health.recency_weight = 0.0;
    })]
    #[case::zero_default_k(|c: &mut MemoryEngineConfig| c.retrieval.default_k = 0)]
    #[case::threshold_out_of_range(|c: &mut MemoryEngineConfig| c.retrieval.default_similarity_threshold = 1.5)]
    #[case::zero_interval(|c: &mut MemoryEngineConfig| c.maintenance.interval_secs = 0)]
    fn rejects_invalid(#[case] mutate: fn(&mut MemoryEngineConfig)) {
        let mut config = MemoryEngineConfig::default();
        mutate(&mut config);
        assert!(matches!(
            validate(&config),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
