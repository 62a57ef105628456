//! `CodeArtifact`: one version of a generated strategy.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Source code pulled out of a model response, together with the response
/// it came from. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifact {
    source_text: String,
    origin_response: String,
}

impl CodeArtifact {
    pub fn new(source_text: impl Into<String>, origin_response: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            origin_response: origin_response.into(),
        }
    }

    /// Wrap code that did not come from a model (e.g. loaded from disk).
    pub fn from_source(source_text: impl Into<String>) -> Self {
        let source_text = source_text.into();
        Self {
            origin_response: source_text.clone(),
            source_text,
        }
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn origin_response(&self) -> &str {
        &self.origin_response
    }

    /// Short SHA-256 fingerprint of the source, for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.source_text.as_bytes());
        hex::encode(digest)[..12].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_depends_only_on_source() {
        let a = CodeArtifact::new("print(1)", "reply one");
        let b = CodeArtifact::new("print(1)", "reply two");
        let c = CodeArtifact::new("print(2)", "reply one");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 12);
    }

    #[test]
    fn test_from_source_uses_source_as_origin() {
        let artifact = CodeArtifact::from_source("import os");
        assert_eq!(artifact.source_text(), "import os");
        assert_eq!(artifact.origin_response(), "import os");
    }
}
