use crate::error::MqError;

/// Longest name the kernel accepts, not counting the leading `/`.
pub const NAME_MAX: usize = 255;

/// A validated message queue name: a `/` followed by 1 to [`NAME_MAX`] bytes, none of which are
/// `/` or NUL.
///
/// Names live in a single system-wide namespace (mounted at `/dev/mqueue` on Linux). Two
/// unrelated processes opening the same name attach to the same queue.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct QueueName(std::ffi::CString);

impl QueueName {
    pub fn new(name: &str) -> Result<Self, MqError> {
        let invalid = |reason| MqError::NameInvalid { name: name.to_string(), reason, errno: None };

        let Some(rest) = name.strip_prefix('/') else {
            return Err(invalid("missing leading '/'"));
        };
        if rest.is_empty() {
            return Err(invalid("empty"));
        }
        if rest.contains('/') {
            return Err(invalid("contains '/'"));
        }
        if rest.len() > NAME_MAX {
            return Err(invalid("longer than NAME_MAX"));
        }

        std::ffi::CString::new(name).map(Self).map_err(|_| invalid("contains NUL"))
    }

    pub fn as_str(&self) -> &str {
        // Built from a `&str` in `new`, so this cannot fail.
        self.0.to_str().unwrap_or_default()
    }

    pub fn as_c_str(&self) -> &std::ffi::CStr {
        &self.0
    }
}

impl std::fmt::Debug for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[rstest::rstest]
    #[case("/queue")]
    #[case("/q")]
    #[case("/with.dots-and_underscores")]
    fn valid(#[case] name: &str) {
        let parsed = QueueName::new(name).unwrap();
        assert_eq!(parsed.as_str(), name);
        assert_eq!(parsed.as_c_str().to_bytes(), name.as_bytes());
    }

    #[test]
    fn longest_valid() {
        let name = format!("/{}", "a".repeat(NAME_MAX));
        assert!(QueueName::new(&name).is_ok());
    }

    #[rstest::rstest]
    #[case("", "missing leading '/'")]
    #[case("queue", "missing leading '/'")]
    #[case("/", "empty")]
    #[case("/a/b", "contains '/'")]
    #[case("//", "contains '/'")]
    #[case("/a\0b", "contains NUL")]
    fn invalid(#[case] name: &str, #[case] expected: &str) {
        assert_matches::assert_matches!(
            QueueName::new(name),
            Err(MqError::NameInvalid { reason, errno: None, .. }) => assert_eq!(reason, expected)
        );
    }

    #[test]
    fn too_long() {
        let name = format!("/{}", "a".repeat(NAME_MAX + 1));
        assert_matches::assert_matches!(
            QueueName::new(&name),
            Err(MqError::NameInvalid { reason: "longer than NAME_MAX", .. })
        );
    }
}
