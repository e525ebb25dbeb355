// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use relaymint_node::metrics::{names, MetricsSink, PrometheusSink};
use relaymint_node::telemetry::{init_telemetry, render_metrics, TelemetryError};

#[test]
fn prometheus_sink_shows_up_in_exposition() {
    assert!(render_metrics().contains("not initialized"));

    init_telemetry("info").unwrap();
    assert!(matches!(
        init_telemetry("info"),
        Err(TelemetryError::Subscriber(_))
    ));

    let sink = PrometheusSink;
    sink.increment_counter(
        names::RELAYS_PROCESSED,
        3,
        &[("tenant", "t1"), ("service_id", "anvil")],
    );
    sink.set_gauge(names::TENANTS_ACTIVE, 2.0, &[]);

    let text = render_metrics();
    assert!(text.contains("relaymint_relays_processed_total"));
    assert!(text.contains("tenant=\"t1\""));
    assert!(text.contains("relaymint_tenants_active 2"));
}
