//! Pure admission predicate applied by the discovery loop.

use std::collections::HashSet;

use crate::config::Settings;
use crate::container::{ContainerRecord, ContainerStatus};

/// Decides which containers get a stream worker.
///
/// A decision depends only on the container snapshot and the settings the
/// filter was built from; it is safe to call concurrently and repeatedly.
/// The engine's own service name is always excluded so it never ingests its
/// own output.
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    excluded_names: HashSet<String>,
    include_stopped: bool,
}

impl ExclusionFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut excluded_names: HashSet<String> =
            settings.exclude_containers.iter().cloned().collect();
        excluded_names.insert(settings.service_name.clone());
        Self {
            excluded_names,
            include_stopped: settings.include_stopped,
        }
    }

    /// Returns `true` if the container should be streamed.
    pub fn admit(&self, container: &ContainerRecord) -> bool {
        if self.excluded_names.contains(container.name()) {
            log::debug!("skipping excluded container `{}`", container.name());
            return false;
        }

        match container.status() {
            ContainerStatus::Running => true,
            ContainerStatus::Stopped => self.include_stopped,
            ContainerStatus::Removed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerID;
    use std::collections::HashMap;

    fn settings(exclude: &[&str], include_stopped: bool) -> Settings {
        let mut settings = Settings::for_tests();
        settings.exclude_containers = exclude.iter().map(|s| (*s).to_owned()).collect();
        settings.include_stopped = include_stopped;
        settings
    }

    fn record(name: &str, status: ContainerStatus) -> ContainerRecord {
        ContainerRecord::new(
            ContainerID::new("c0ffee").unwrap(),
            name,
            "busybox",
            HashMap::new(),
            status,
            false,
        )
    }

    #[test]
    fn denies_configured_names() {
        let filter = ExclusionFilter::from_settings(&settings(&["web"], false));
        assert!(!filter.admit(&record("web", ContainerStatus::Running)));
        assert!(filter.admit(&record("api", ContainerStatus::Running)));
    }

    #[test]
    fn always_denies_own_service_name() {
        let filter = ExclusionFilter::from_settings(&settings(&[], false));
        assert!(!filter.admit(&record("logdock", ContainerStatus::Running)));
    }

    #[test]
    fn stopped_containers_follow_include_stopped() {
        let strict = ExclusionFilter::from_settings(&settings(&[], false));
        assert!(!strict.admit(&record("api", ContainerStatus::Stopped)));

        let lenient = ExclusionFilter::from_settings(&settings(&[], true));
        assert!(lenient.admit(&record("api", ContainerStatus::Stopped)));
        assert!(!lenient.admit(&record("api", ContainerStatus::Removed)));
    }

    #[test]
    fn admit_is_idempotent() {
        let filter = ExclusionFilter::from_settings(&settings(&["web"], false));
        let running = record("api", ContainerStatus::Running);
        let excluded = record("web", ContainerStatus::Running);
        for _ in 0..3 {
            assert!(filter.admit(&running));
            assert!(!filter.admit(&excluded));
        }
        // Interleaved order does not change decisions.
        assert!(!filter.admit(&excluded));
        assert!(filter.admit(&running));
    }
}
