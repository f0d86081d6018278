//! Schema version selection.
//!
//! The gateway announces the range of schema versions it speaks; the client
//! knows the oldest version it can still handle and the version it would
//! like.  Selection, in order of precedence:
//!
//! 1. the client's preferred version, if the gateway's range contains it;
//! 2. otherwise, if the gateway's newest version is not older than the
//!    client's minimum, `max(client_min, server_max)`;
//! 3. otherwise the two sides are incompatible.

use crate::domain::connection::SchemaCompatibilityInfo;

/// The schema range this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSchema {
    min: u32,
    preferred: u32,
}

impl ClientSchema {
    /// Creates a range.  A preferred version below `min` is raised to `min`.
    pub fn new(min: u32, preferred: u32) -> Self {
        Self {
            min,
            preferred: preferred.max(min),
        }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn preferred(&self) -> u32 {
        self.preferred
    }
}

impl Default for ClientSchema {
    fn default() -> Self {
        Self::new(13, 21)
    }
}

/// Picks a schema version for the given gateway range.
pub fn negotiate_schema(
    client: ClientSchema,
    server_min: u32,
    server_max: u32,
) -> SchemaCompatibilityInfo {
    let negotiated = if (server_min..=server_max).contains(&client.preferred) {
        Some(client.preferred)
    } else if server_max >= client.min {
        Some(client.min.max(server_max))
    } else {
        None
    };

    SchemaCompatibilityInfo {
        client_min: client.min,
        client_preferred: client.preferred,
        server_min,
        server_max,
        negotiated,
        is_compatible: negotiated.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_version_inside_server_range_wins() {
        let info = negotiate_schema(ClientSchema::new(13, 21), 10, 25);
        assert_eq!(info.negotiated, Some(21));
        assert!(info.is_compatible);
    }

    #[test]
    fn test_older_server_falls_back_to_server_max() {
        // Arrange: client(min=13, preferred=21), peer(min=16, max=18)
        let client = ClientSchema::new(13, 21);

        // Act
        let info = negotiate_schema(client, 16, 18);

        // Assert
        assert_eq!(info.negotiated, Some(18));
        assert!(info.is_compatible);
        assert_eq!(info.server_min, 16);
        assert_eq!(info.server_max, 18);
    }

    #[test]
    fn test_server_entirely_below_client_min_is_incompatible() {
        let info = negotiate_schema(ClientSchema::new(13, 21), 10, 12);
        assert_eq!(info.negotiated, None);
        assert!(!info.is_compatible);
    }

    #[test]
    fn test_server_max_equal_to_client_min_is_compatible() {
        let info = negotiate_schema(ClientSchema::new(13, 21), 5, 13);
        assert_eq!(info.negotiated, Some(13));
    }

    #[test]
    fn test_newer_server_range_above_preferred_uses_server_max() {
        // Preferred 21 is below the server range, so rule 2 picks server_max.
        let info = negotiate_schema(ClientSchema::new(13, 21), 22, 30);
        assert_eq!(info.negotiated, Some(30));
    }

    #[test]
    fn test_preferred_below_min_is_raised() {
        let client = ClientSchema::new(15, 10);
        assert_eq!(client.preferred(), 15);
    }
}
