//! Server capabilities derived from the reported version

use semver::Version;
use std::fmt;

/// What a server version supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFeatures {
    version: Version,
}

impl ServerFeatures {
    /// Features of a parsed version
    #[must_use]
    pub const fn new(version: Version) -> Self {
        Self { version }
    }

    /// Parse a `redis_version` string; `7.0` and `6.2.6-rc1` style values are accepted
    #[must_use]
    pub fn parse(version: &str) -> Option<Self> {
        let version = version.trim();
        if let Ok(parsed) = Version::parse(version) {
            return Some(Self::new(parsed));
        }

        let mut parts = version
            .split(|c: char| !c.is_ascii_digit())
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u64>().ok());
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self::new(Version::new(major, minor, patch)))
    }

    /// The server version
    #[must_use]
    pub const fn version(&self) -> &Version {
        &self.version
    }

    fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        self.version >= Version::new(major, minor, patch)
    }

    /// `HELLO` and RESP3
    #[must_use]
    pub fn resp3(&self) -> bool {
        self.at_least(6, 0, 0)
    }

    /// `CLIENT SETNAME`
    #[must_use]
    pub fn set_name(&self) -> bool {
        self.at_least(2, 6, 9)
    }

    /// `ROLE`
    #[must_use]
    pub fn role(&self) -> bool {
        self.at_least(2, 8, 12)
    }

    /// `TIME`
    #[must_use]
    pub fn time(&self) -> bool {
        self.at_least(2, 6, 0)
    }

    /// `ECHO` and `PING` with an argument on subscription connections
    #[must_use]
    pub fn ping_on_subscriber(&self) -> bool {
        self.at_least(3, 0, 0)
    }

    /// `REPLICAOF` (older servers only know `SLAVEOF`)
    #[must_use]
    pub fn replica_commands(&self) -> bool {
        self.at_least(5, 0, 0)
    }

    /// `UNLINK`
    #[must_use]
    pub fn unlink(&self) -> bool {
        self.at_least(4, 0, 0)
    }

    /// Redis Cluster
    #[must_use]
    pub fn cluster(&self) -> bool {
        self.at_least(3, 0, 0)
    }

    /// ACL users (`AUTH user password`)
    #[must_use]
    pub fn acl(&self) -> bool {
        self.at_least(6, 0, 0)
    }
}

impl Default for ServerFeatures {
    /// A conservative baseline used until the real version is known
    fn default() -> Self {
        Self::new(Version::new(3, 0, 0))
    }
}

impl fmt::Display for ServerFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!(
            ServerFeatures::parse("7.2.4").unwrap().version(),
            &Version::new(7, 2, 4)
        );
        assert_eq!(
            ServerFeatures::parse("7.0").unwrap().version(),
            &Version::new(7, 0, 0)
        );
        assert_eq!(
            ServerFeatures::parse("6.2.6-rc1").unwrap().version(),
            &Version::parse("6.2.6-rc1").unwrap()
        );
        assert!(ServerFeatures::parse("unknown").is_none());
    }

    #[test]
    fn test_feature_gates() {
        let old = ServerFeatures::parse("2.8.0").unwrap();
        assert!(!old.resp3());
        assert!(!old.role());
        assert!(old.set_name());

        let modern = ServerFeatures::parse("7.0.11").unwrap();
        assert!(modern.resp3());
        assert!(modern.role());
        assert!(modern.replica_commands());
        assert!(modern.unlink());
    }
}
