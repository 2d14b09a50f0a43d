//! Metrics for provisioning and document traffic

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

pub const PROVISION_DURATION_MS: &str = "zotsync.provision.duration_ms";
pub const PROVISION_TIMEOUTS: &str = "zotsync.provision.timeouts";
pub const DOCUMENTS_WRITTEN: &str = "zotsync.documents.written";
pub const DOCUMENTS_REMOVED: &str = "zotsync.documents.removed";
pub const ERRORS_SUPPRESSED: &str = "zotsync.errors.suppressed";
pub const LIBRARIES_DROPPED: &str = "zotsync.libraries.dropped";

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_histogram!(PROVISION_DURATION_MS, "Library provisioning duration in milliseconds");
    describe_counter!(PROVISION_TIMEOUTS, "Provisioning waits that hit the deadline");
    describe_counter!(DOCUMENTS_WRITTEN, "Documents upserted, by partition");
    describe_counter!(DOCUMENTS_REMOVED, "Documents deleted, by partition");
    describe_counter!(ERRORS_SUPPRESSED, "Failures swallowed by the log error policy");
    describe_counter!(LIBRARIES_DROPPED, "Library scopes dropped");
}

pub fn record_provision_duration(elapsed: Duration) {
    histogram!(PROVISION_DURATION_MS).record(elapsed.as_secs_f64() * 1000.0);
}

pub fn record_provision_timeout() {
    counter!(PROVISION_TIMEOUTS).increment(1);
}

pub fn record_write(partition: &'static str) {
    counter!(DOCUMENTS_WRITTEN, "partition" => partition).increment(1);
}

pub fn record_remove(partition: &'static str) {
    counter!(DOCUMENTS_REMOVED, "partition" => partition).increment(1);
}

pub fn record_suppressed_error(operation: &str) {
    counter!(ERRORS_SUPPRESSED, "operation" => operation.to_string()).increment(1);
}

pub fn record_library_dropped() {
    counter!(LIBRARIES_DROPPED).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_provision_duration(Duration::from_millis(12));
        record_provision_timeout();
        record_write("items");
        record_remove("collections");
        record_suppressed_error("upsert");
        record_library_dropped();
    }
}
