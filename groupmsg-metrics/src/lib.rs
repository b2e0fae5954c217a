use std::sync::LazyLock;

pub use prometheus::{
    self, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, histogram_opts, opts,
};

/// Registry every group message metric is registered with
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    Registry::new_custom(Some("groupmsg".into()), None).expect("the prefix is valid")
});

/// Render all metrics in [`REGISTRY`] in the prometheus text format
pub fn encode_metrics() -> anyhow::Result<String> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use prometheus::register_int_counter_with_registry;

    use super::*;

    #[test]
    fn registered_counter_is_rendered() {
        let counter = register_int_counter_with_registry!(
            opts!("render_check_total", "Counter used to check rendering"),
            REGISTRY
        )
        .unwrap();
        counter.inc_by(3);

        let rendered = encode_metrics().unwrap();
        assert!(rendered.contains("groupmsg_render_check_total 3"));
    }
}
