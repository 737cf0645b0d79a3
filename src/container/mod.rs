use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

mod error;

pub use error::{Error, Result};

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// A validated container identifier.
///
/// # Examples
///
/// ```
/// # use logdock::container::{ContainerID, Error};
/// let raw_id = "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd";
/// let container_id = ContainerID::new(raw_id).unwrap();
/// assert_eq!(container_id.as_ref(), "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is empty or its
    /// length exceeds [`CONTAINER_ID_MAX_LEN`].
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty() || src.len() > CONTAINER_ID_MAX_LEN {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    pub fn to_arc(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }

    /// Returns the abbreviated form used in diagnostics: the first 12
    /// bytes, backed off to a character boundary so ids with multi-byte
    /// content never split a character.
    pub fn short(&self) -> &str {
        let mut end = self.0.len().min(12);
        while !self.0.is_char_boundary(end) {
            end -= 1;
        }
        &self.0[..end]
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a container as last reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    /// Maps a runtime state string (e.g., `"running"`, `"exited"`) to a status.
    pub fn from_runtime_state(state: &str) -> Self {
        match state {
            "running" | "restarting" | "paused" => Self::Running,
            "removing" | "dead" => Self::Removed,
            _ => Self::Stopped,
        }
    }
}

/// An immutable snapshot of container metadata.
///
/// Created by the discovery loop from runtime enumeration or lifecycle
/// events. Workers capture the snapshot at start and never observe later
/// mutations (e.g., a rename), so name attribution stays stable for the
/// lifetime of a stream.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    id: ContainerID,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    status: ContainerStatus,
    tty: bool,
}

impl ContainerRecord {
    pub fn new(
        id: ContainerID,
        name: impl Into<String>,
        image: impl Into<String>,
        labels: HashMap<String, String>,
        status: ContainerStatus,
        tty: bool,
    ) -> Self {
        let name = name.into();
        // Runtime APIs report names with a leading slash.
        let name = name.strip_prefix('/').map(str::to_owned).unwrap_or(name);
        Self {
            id,
            name,
            image: image.into(),
            labels,
            status,
            tty,
        }
    }

    pub fn id(&self) -> &ContainerID {
        &self.id
    }

    /// The container name without the leading slash; falls back to the
    /// abbreviated id when the runtime reported no name.
    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            self.id.short()
        } else {
            &self.name
        }
    }

    /// Image reference the container was created from.
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn status(&self) -> ContainerStatus {
        self.status
    }

    /// Whether the container was created with a TTY. A TTY container's log
    /// endpoint serves raw bytes instead of the multiplexed framing.
    pub fn tty(&self) -> bool {
        self.tty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_ids() {
        assert!(ContainerID::new("").is_err());
        assert!(ContainerID::new("a".repeat(256)).is_err());
        assert!(ContainerID::new("a".repeat(255)).is_ok());
    }

    #[test]
    fn short_id_is_twelve_chars() {
        let id = ContainerID::new("abcdef0123456789abcdef").unwrap();
        assert_eq!(id.short(), "abcdef012345");

        let tiny = ContainerID::new("abc").unwrap();
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn short_id_never_splits_a_character() {
        // The twelfth byte falls inside the two-byte `é`.
        let id = ContainerID::new("abcdefghijk\u{00e9}x").unwrap();
        assert_eq!(id.short(), "abcdefghijk");
    }

    #[test]
    fn record_strips_leading_slash_from_name() {
        let id = ContainerID::new("deadbeef").unwrap();
        let record = ContainerRecord::new(
            id,
            "/web",
            "nginx:1.27",
            HashMap::new(),
            ContainerStatus::Running,
            false,
        );
        assert_eq!(record.name(), "web");
        assert_eq!(record.image(), "nginx:1.27");
    }

    #[test]
    fn record_falls_back_to_short_id_without_name() {
        let id = ContainerID::new("abcdef0123456789abcdef").unwrap();
        let record = ContainerRecord::new(
            id,
            "",
            "busybox",
            HashMap::new(),
            ContainerStatus::Running,
            false,
        );
        assert_eq!(record.name(), "abcdef012345");
    }

    #[test]
    fn status_mapping_from_runtime_states() {
        assert_eq!(
            ContainerStatus::from_runtime_state("running"),
            ContainerStatus::Running
        );
        assert_eq!(
            ContainerStatus::from_runtime_state("exited"),
            ContainerStatus::Stopped
        );
        assert_eq!(
            ContainerStatus::from_runtime_state("created"),
            ContainerStatus::Stopped
        );
        assert_eq!(
            ContainerStatus::from_runtime_state("dead"),
            ContainerStatus::Removed
        );
    }
}
