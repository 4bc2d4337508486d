use std::sync::LazyLock;

use prometheus::{IntCounterVec, Opts};
use tracing::debug;

/// Log lines received from Loki, partitioned by source URL. Process-wide:
/// several sources in one process share the counter, and registration must
/// survive being raced from multiple acquisitions.
static HITS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "lokisource_hits_total",
            "Total log lines received from the Loki source",
        ),
        &["source"],
    )
    .expect("lokisource_hits_total options are statically valid");

    if let Err(error) = prometheus::default_registry().register(Box::new(counter.clone())) {
        debug!(%error, "lokisource_hits_total is already registered");
    }

    counter
});

pub fn record_hit(source: &str) {
    HITS_TOTAL.with_label_values(&[source]).inc();
}

#[cfg(test)]
mod tests {
    use crate::metrics::{HITS_TOTAL, record_hit};

    #[test]
    fn counts_hits_per_source() {
        record_hit("http://127.0.0.1:3100/");
        record_hit("http://127.0.0.1:3100/");

        assert!(
            HITS_TOTAL
                .with_label_values(&["http://127.0.0.1:3100/"])
                .get()
                >= 2
        );
    }
}
