use lazy_static::lazy_static;
use regex::Regex;
use std::convert::TryFrom;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// The tag used when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

lazy_static! {
    static ref DIGEST_REGEXP: Regex = Regex::new(r"^([A-Za-z0-9_+.-]+):([A-Fa-f0-9]+)$").unwrap();
}

/// Splits a content digest into its algorithm and hex parts.
///
/// Anything other than `algorithm:hex` is rejected, so the hex part is always
/// safe to use as a file name.
pub fn split_digest(digest: &str) -> Result<(&str, &str), ParseError> {
    let captures = DIGEST_REGEXP
        .captures(digest)
        .ok_or(ParseError::DigestInvalidFormat)?;
    match (captures.get(1), captures.get(2)) {
        (Some(algorithm), Some(hex)) => Ok((algorithm.as_str(), hex.as_str())),
        _ => Err(ParseError::DigestInvalidFormat),
    }
}

/// Reasons an image reference is rejected
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The digest is not `algorithm:hex`
    DigestInvalidFormat,
    /// The registry part is empty
    RegistryEmpty,
    /// The repository path is empty
    NameEmpty,
    /// The repository path exceeds the registry limit
    NameTooLong,
    /// No `/` separates the registry from the repository
    ReferenceInvalidFormat,
    /// The tag is empty
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::RegistryEmpty => write!(f, "registry must not be empty"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::ReferenceInvalidFormat => write!(f, "invalid reference format"),
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// An image in a registry: the registry host, the image path inside it and
/// either a tag or a digest.
///
/// # Examples
///
/// ```
/// use registry_client::Reference;
///
/// let reference: Reference = "registry.gitlab.com/group/project/image:v1".parse().unwrap();
///
/// assert_eq!("registry.gitlab.com", reference.registry());
/// assert_eq!("group/project/image", reference.repository());
/// assert_eq!(Some("v1"), reference.tag());
/// assert_eq!("v1", reference.tag_or_digest());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// Assembles a reference from its parts.
    ///
    /// `tag_or_digest` is treated as a digest when it looks like one
    /// (`sha256:...`), otherwise as a tag.
    pub fn new(
        registry: &str,
        repository: &str,
        tag_or_digest: Option<&str>,
    ) -> Result<Self, ParseError> {
        let (tag, digest) = match tag_or_digest {
            Some(s) if s.contains(':') => (None, Some(s.to_owned())),
            Some(s) => (Some(s.to_owned()), None),
            None => (None, None),
        };
        let reference = Reference {
            registry: registry.trim_end_matches('/').to_owned(),
            repository: repository.trim_matches('/').to_owned(),
            tag,
            digest,
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Returns a reference to another manifest in the same repository.
    pub fn with_digest(&self, digest: &str) -> Self {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_owned()),
        }
    }

    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The last path segment of a manifest URL: the digest if present, else
    /// the tag, else `latest`.
    pub fn tag_or_digest(&self) -> &str {
        self.digest()
            .or_else(|| self.tag())
            .unwrap_or(DEFAULT_TAG)
    }

    /// The token scope that grants read access to this repository.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    /// whole returns the whole reference.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.registry.is_empty() {
            return Err(ParseError::RegistryEmpty);
        }
        if self.repository.is_empty() {
            return Err(ParseError::NameEmpty);
        }
        if self.repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }
        if matches!(self.tag.as_deref(), Some("")) {
            return Err(ParseError::TagInvalidFormat);
        }
        if let Some(d) = self.digest.as_deref() {
            split_digest(d)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let repo_start = s.find('/').ok_or(ParseError::ReferenceInvalidFormat)?;
        let (name, digest) = match s[repo_start + 1..].find('@') {
            Some(at) => {
                let at = repo_start + 1 + at;
                (&s[..at], Some(s[at + 1..].to_owned()))
            }
            None => (s, None),
        };
        // A colon after the last slash starts the tag; earlier colons belong
        // to a registry port.
        let last_slash = name.rfind('/').unwrap_or(repo_start);
        let (name, tag) = match name[last_slash..].find(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name[..colon], Some(name[colon + 1..].to_owned()))
            }
            None => (name, None),
        };

        let reference = Reference {
            registry: name[..repo_start].to_owned(),
            repository: name[repo_start + 1..].to_owned(),
            tag,
            digest,
        };
        reference.validate()?;
        Ok(reference)
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(string: String) -> Result<Self, Self::Error> {
        TryFrom::try_from(string.as_str())
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> String {
        reference.whole()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    mod parse {
        use super::*;

        const DIGEST: &str =
            "sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9";

        fn must_parse(image: &str) -> Reference {
            Reference::try_from(image).expect("could not parse reference")
        }

        fn validate_registry_and_repository(reference: &Reference) {
            assert_eq!(reference.registry(), "registry.example.com");
            assert_eq!(reference.repository(), "group/project/image");
        }

        #[test]
        fn name_too_long() {
            assert_eq!(
                Reference::try_from(format!(
                    "registry.example.com/{}",
                    (0..256).map(|_| "a").collect::<String>()
                ))
                .err(),
                Some(ParseError::NameTooLong)
            );
        }

        #[test]
        fn tag_only() {
            let reference = must_parse("registry.example.com/group/project/image:v1");

            validate_registry_and_repository(&reference);
            assert_eq!(reference.tag(), Some("v1"));
            assert_eq!(reference.digest(), None);
            assert_eq!(reference.tag_or_digest(), "v1");
        }

        #[test]
        fn digest_only() {
            let reference = must_parse(&format!("registry.example.com/group/project/image@{}", DIGEST));

            validate_registry_and_repository(&reference);
            assert_eq!(reference.digest(), Some(DIGEST));
            assert_eq!(reference.tag(), None);
        }

        #[test]
        fn tag_and_digest_prefers_digest_in_urls() {
            let reference =
                must_parse(&format!("registry.example.com/group/project/image:v1@{}", DIGEST));

            validate_registry_and_repository(&reference);
            assert_eq!(reference.tag(), Some("v1"));
            assert_eq!(reference.tag_or_digest(), DIGEST);
        }

        #[test]
        fn no_tag_or_digest() {
            let reference = must_parse("registry.example.com/group/project/image");

            validate_registry_and_repository(&reference);
            assert_eq!(reference.tag_or_digest(), "latest");
        }

        #[test]
        fn registry_port_is_not_a_tag() {
            let reference = must_parse("localhost:5000/group/image:1.2");
            assert_eq!(reference.registry(), "localhost:5000");
            assert_eq!(reference.repository(), "group/image");
            assert_eq!(reference.tag(), Some("1.2"));
        }

        #[test]
        fn missing_slash_char() {
            Reference::try_from("registry.example.com:hello")
                .expect_err("no slash should produce an error");
        }

        #[test]
        fn bad_digest() {
            assert_eq!(
                Reference::try_from("registry.example.com/image@sha256").err(),
                Some(ParseError::DigestInvalidFormat)
            );
        }
    }

    mod digest {
        use super::*;

        #[test]
        fn splits_algorithm_and_hex() {
            assert_eq!(split_digest("sha256:c0FFee"), Ok(("sha256", "c0FFee")));
            assert_eq!(split_digest("sha512+b64.x_y-z:00"), Ok(("sha512+b64.x_y-z", "00")));
        }

        #[test]
        fn rejects_anything_that_is_not_hex() {
            for digest in &[
                "",
                "sha256",
                "sha256:",
                ":abcd",
                "sha256:../../escaped",
                "sha256:ab/cd",
                "sha256:abcd\n",
                "sha/256:abcd",
                "../x:abcd",
                "sha256:xyz",
            ] {
                assert_eq!(
                    split_digest(digest),
                    Err(ParseError::DigestInvalidFormat),
                    "{:?}",
                    digest
                );
            }
        }
    }

    mod assemble {
        use super::*;

        #[test]
        fn from_parts_with_tag() {
            let reference = Reference::new("example.com", "g/p/i", Some("latest"))
                .expect("valid reference");
            assert_eq!(reference.whole(), "example.com/g/p/i:latest");
            assert_eq!(reference.pull_scope(), "repository:g/p/i:pull");
        }

        #[test]
        fn from_parts_with_digest() {
            let reference = Reference::new("example.com/", "/g/p/i/", Some("sha256:abcd"))
                .expect("valid reference");
            assert_eq!(reference.digest(), Some("sha256:abcd"));
            assert_eq!(reference.whole(), "example.com/g/p/i@sha256:abcd");
        }

        #[test]
        fn empty_parts_are_rejected() {
            assert_eq!(
                Reference::new("", "g/p/i", None).err(),
                Some(ParseError::RegistryEmpty)
            );
            assert_eq!(
                Reference::new("example.com", "", None).err(),
                Some(ParseError::NameEmpty)
            );
            assert_eq!(
                Reference::new("example.com", "g/p/i", Some("")).err(),
                Some(ParseError::TagInvalidFormat)
            );
        }
    }
}
