//! Runs in its own test binary: installing a global tracing subscriber here
//! would conflict with `#[traced_test]` in the library's unit tests.

use strider::observability::*;
use strider::types::ObservabilityConfig;

#[test]
fn init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    init_tracing_from_config(&ObservabilityConfig::default());
}
