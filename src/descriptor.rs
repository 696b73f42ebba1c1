use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing a descriptor string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("empty stream descriptor")]
    Empty,

    #[error("unknown stream kind {kind:?} in descriptor {input:?}")]
    UnknownKind { kind: String, input: String },

    #[error("descriptor {input:?} is missing its target")]
    MissingTarget { input: String },

    #[error("descriptor {input:?} needs HOST:PORT")]
    InvalidAddress { input: String },
}

/// A parsed stream descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Udp(String),
    Tcp(String),
    File(PathBuf),
    Null,
}

impl Descriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Udp(_) => "udp",
            Self::Tcp(_) => "tcp",
            Self::File(_) => "file",
            Self::Null => "null",
        }
    }

    /// Whether packets can be read from this descriptor.
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Udp(_) | Self::File(_) | Self::Null)
    }

    /// Whether results can be written to this descriptor.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::File(_) | Self::Null)
    }
}

fn parse_address(target: &str, input: &str) -> Result<String, DescriptorError> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(target.to_string())
        }
        _ => Err(DescriptorError::InvalidAddress {
            input: input.to_string(),
        }),
    }
}

impl FromStr for Descriptor {
    type Err = DescriptorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DescriptorError::Empty);
        }

        let (kind, target) = input.split_once(':').unwrap_or((input, ""));

        if kind == "null" {
            return Ok(Self::Null);
        }

        if target.is_empty() {
            return Err(DescriptorError::MissingTarget {
                input: input.to_string(),
            });
        }

        match kind {
            "udp" => Ok(Self::Udp(parse_address(target, input)?)),
            "tcp" => Ok(Self::Tcp(parse_address(target, input)?)),
            "file" => Ok(Self::File(PathBuf::from(target))),
            _ => Err(DescriptorError::UnknownKind {
                kind: kind.to_string(),
                input: input.to_string(),
            }),
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(addr) => write!(f, "udp:{addr}"),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Null => f.write_str("null:"),
        }
    }
}
