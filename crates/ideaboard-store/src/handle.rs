//! Opaque references to records held by a remote store.

use std::fmt;

use thiserror::Error;

/// Error when parsing a record reference.
#[derive(Debug, Error)]
#[error("invalid record reference: {0}")]
pub struct RecordRefError(String);

/// Store-level handle for a single record.
///
/// Rendered as `at://{repo}/{collection}/{rkey}`. A `RecordRef` is only ever
/// produced by a store (on create or list) and is never derived from an
/// idea's own id; the cache connects the two through its resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    repo: String,
    collection: String,
    rkey: String,
}

impl RecordRef {
    /// Build a reference from its components.
    pub fn new(
        repo: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse a reference string.
    ///
    /// # Example
    ///
    /// ```
    /// use ideaboard_store::RecordRef;
    ///
    /// let handle = RecordRef::parse("at://did:plc:abc123/app.ideaboard.idea/3abc").unwrap();
    /// assert_eq!(handle.repo(), "did:plc:abc123");
    /// assert_eq!(handle.collection(), "app.ideaboard.idea");
    /// assert_eq!(handle.rkey(), "3abc");
    /// ```
    pub fn parse(uri: &str) -> Result<Self, RecordRefError> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| RecordRefError(format!("missing at:// prefix: {uri}")))?;

        let mut parts = rest.splitn(3, '/');
        let (Some(repo), Some(collection), Some(rkey)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RecordRefError(format!(
                "expected repo/collection/rkey: {uri}"
            )));
        };

        if repo.is_empty() || collection.is_empty() || rkey.is_empty() {
            return Err(RecordRefError(format!("empty component in reference: {uri}")));
        }

        Ok(Self::new(repo, collection, rkey))
    }

    /// Repository (account DID) holding the record.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Collection the record lives in.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Record key within the collection.
    pub fn rkey(&self) -> &str {
        &self.rkey
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.repo, self.collection, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_parse_valid_reference() {
        let handle = RecordRef::parse("at://did:plc:xyz/app.ideaboard.idea/3jqfcqzhs3u2v").unwrap();
        assert_eq!(handle.repo(), "did:plc:xyz");
        assert_eq!(handle.collection(), "app.ideaboard.idea");
        assert_eq!(handle.rkey(), "3jqfcqzhs3u2v");
    }

    #[test_case("did:plc:abc/ideas/rkey", "missing at:// prefix" ; "missing prefix")]
    #[test_case("at://did:plc:abc/ideas", "expected repo/collection/rkey" ; "missing rkey")]
    #[test_case("at://did:plc:abc//rkey", "empty component" ; "empty collection")]
    fn test_parse_rejects(input: &str, reason: &str) {
        let err = RecordRef::parse(input).unwrap_err();
        assert!(err.to_string().contains(reason), "unexpected error: {err}");
    }

    #[test]
    fn test_roundtrip() {
        let original = "at://did:plc:abc123/app.ideaboard.idea/xyz789";
        let parsed = RecordRef::parse(original).unwrap();
        assert_eq!(parsed.to_string(), original);
    }
}
