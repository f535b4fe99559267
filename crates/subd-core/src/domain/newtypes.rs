//! Domain newtypes with validation
//!
//! [`Digest`] is the universal content key: two files with identical bytes
//! always share one. The pathname helpers below keep every managed path
//! absolute, normalised and inside the managed root.

use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha512};

use super::errors::DomainError;

// ============================================================================
// Digest
// ============================================================================

/// Width of a content digest in bytes (SHA-512)
pub const DIGEST_LEN: usize = 64;

/// SHA-512 digest of a blob's content
///
/// Serialised as a lowercase hex string so it can be used as a JSON map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wraps raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a digest from a slice, which must be exactly [`DIGEST_LEN`] long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DomainError> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            DomainError::InvalidDigest(format!(
                "expected {DIGEST_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Computes the digest of an in-memory buffer
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Finishes an incremental SHA-512 computation
    #[must_use]
    pub fn from_hasher(hasher: Sha512) -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    /// Returns the raw digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // The full 128 hex characters drown log lines.
        write!(f, "Digest({}…)", &self.to_hex()[..16])
    }
}

impl FromStr for Digest {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| DomainError::InvalidDigest(format!("{s}: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Managed pathnames
// ============================================================================

/// Pathname of the tree root
pub const ROOT_PATH: &str = "/";

/// Joins a directory pathname and an entry name
///
/// `join_path("/", "etc") == "/etc"`, `join_path("/etc", "hosts") == "/etc/hosts"`.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Returns the parent pathname, or `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

/// Returns true if `path` equals `prefix` or lies underneath it
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == ROOT_PATH {
        return path.starts_with('/');
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Validates a managed pathname
///
/// Managed pathnames are absolute, contain no `.` or `..` components, no
/// empty components and no NUL bytes.
pub fn validate_managed_path(path: &str) -> Result<(), DomainError> {
    if !path.starts_with('/') {
        return Err(DomainError::InvalidPath(format!("not absolute: {path}")));
    }
    if path.contains('\0') {
        return Err(DomainError::InvalidPath(format!("contains NUL: {path:?}")));
    }
    if path == ROOT_PATH {
        return Ok(());
    }
    for component in path[1..].split('/') {
        match component {
            "" => return Err(DomainError::InvalidPath(format!("empty component: {path}"))),
            "." | ".." => return Err(DomainError::PathEscapesRoot(path.to_string())),
            _ => {}
        }
    }
    Ok(())
}

/// Resolves a managed pathname to a host path below `root`
///
/// Fails with [`DomainError::PathEscapesRoot`] when the name could leave the
/// managed root.
pub fn resolve_under_root(root: &Path, path: &str) -> Result<PathBuf, DomainError> {
    validate_managed_path(path)?;
    let mut resolved = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => resolved.push(part),
            _ => return Err(DomainError::PathEscapesRoot(path.to_string())),
        }
    }
    Ok(resolved)
}

/// Expresses a host path below `root` as a managed pathname
pub fn managed_path_of(root: &Path, host_path: &Path) -> Result<String, DomainError> {
    let relative = host_path.strip_prefix(root).map_err(|_| {
        DomainError::PathEscapesRoot(host_path.display().to_string())
    })?;
    let mut managed = String::from(ROOT_PATH);
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    DomainError::InvalidPath(format!("not UTF-8: {}", host_path.display()))
                })?;
                managed = join_path(&managed, part);
            }
            _ => return Err(DomainError::PathEscapesRoot(host_path.display().to_string())),
        }
    }
    Ok(managed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_of_hello() {
        let digest = Digest::of(b"hello");
        assert_eq!(
            digest.to_hex(),
            "9b71d224bd62f3785d96d46ad3ea3d73319bfbc2890caadae2dff72519673ca7\
             2323c3d99ba5c11d7c7acc6e14b8c5da0c4663475c2e5c3adef46f73bcdec043"
        );
    }

    #[test]
    fn test_digest_parse_display() {
        let digest = Digest::of(b"content");
        let parsed: Digest = digest.to_string().parse().unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_digest_rejects_short_input() {
        assert!(matches!(
            "abcd".parse::<Digest>(),
            Err(DomainError::InvalidDigest(_))
        ));
        assert!("not-hex".parse::<Digest>().is_err());
    }

    #[test]
    fn test_digest_json_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Digest::of(b"x"), 1u64);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<Digest, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_digest_debug_is_short() {
        let text = format!("{:?}", Digest::of(b"x"));
        assert!(text.len() < 30);
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("/etc", "hosts"), "/etc/hosts");
        assert_eq!(parent_path("/etc/hosts"), Some("/etc"));
        assert_eq!(parent_path("/etc"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/.subd", "/.subd"));
        assert!(is_within("/.subd/objects", "/.subd"));
        assert!(!is_within("/.subdir", "/.subd"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_validate_managed_path() {
        assert!(validate_managed_path("/").is_ok());
        assert!(validate_managed_path("/etc/hosts").is_ok());
        assert!(validate_managed_path("etc").is_err());
        assert!(validate_managed_path("/etc//hosts").is_err());
        assert!(matches!(
            validate_managed_path("/etc/../../root"),
            Err(DomainError::PathEscapesRoot(_))
        ));
    }

    #[test]
    fn test_resolve_under_root() {
        let root = Path::new("/srv/root");
        assert_eq!(
            resolve_under_root(root, "/etc/hosts").unwrap(),
            PathBuf::from("/srv/root/etc/hosts")
        );
        assert_eq!(resolve_under_root(root, "/").unwrap(), PathBuf::from("/srv/root"));
        assert!(resolve_under_root(root, "/../etc").is_err());
    }

    #[test]
    fn test_managed_path_of() {
        let root = Path::new("/srv/root");
        assert_eq!(
            managed_path_of(root, Path::new("/srv/root/etc/hosts")).unwrap(),
            "/etc/hosts"
        );
        assert_eq!(managed_path_of(root, Path::new("/srv/root")).unwrap(), "/");
        assert!(managed_path_of(root, Path::new("/elsewhere")).is_err());
    }
}
