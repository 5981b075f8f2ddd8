//! Subscriber installation runs in its own test binary so it cannot race the
//! capturing subscriber used by unit tests.

use shdr_daq::config::DaqConfig;
use shdr_daq::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json);
    assert!(!tracing::dispatcher::has_been_set());
    assert!(logging::init(config).is_ok());
    assert!(tracing::dispatcher::has_been_set());
    assert!(logging::init(TracingConfig::default()).is_ok());
    assert!(logging::init_from_config(&DaqConfig::default()).is_ok());
}
