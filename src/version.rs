use std::fmt::{self, Display};

/// The two HTTP versions this server understands.
///
/// HTTP/0.9 is of historic importance only; requests that look like it are
/// just malformed HTTP/1.0 and are rejected the same way. HTTP/2 is out of
/// scope entirely (see the crate's non-goals).
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(bytes: &[u8]) -> Option<Version> {
        match bytes {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        })
    }
}
