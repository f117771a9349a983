//! Names of the data-plane cipher and compression methods negotiated during authentication.

use std::{fmt, str::FromStr};

/// A symmetric cipher method applied to every stream of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMethod {
    None,
    Chacha20Poly1305,
    Aes256Gcm,
    Salsa20,
}

impl CipherMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Chacha20Poly1305 => "chacha20poly1305",
            Self::Aes256Gcm => "aes256gcm",
            Self::Salsa20 => "salsa20",
        }
    }

    /// The method picked when none is configured: AES-GCM where the CPU usually has hardware
    /// support for it, ChaCha20-Poly1305 elsewhere.
    pub const fn auto() -> Self {
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Self::Aes256Gcm
        } else {
            Self::Chacha20Poly1305
        }
    }
}

impl FromStr for CipherMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "chacha20poly1305" => Ok(Self::Chacha20Poly1305),
            "aes256gcm" => Ok(Self::Aes256Gcm),
            "salsa20" => Ok(Self::Salsa20),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compressor applied to relayed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressMethod {
    #[default]
    None,
    Snappy,
}

impl CompressMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Snappy => "snappy",
        }
    }
}

impl FromStr for CompressMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "snappy" => Ok(Self::Snappy),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for CompressMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method name that isn't recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown method: {}", self.0)
    }
}

impl std::error::Error for UnknownMethod {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for method in [CipherMethod::None, CipherMethod::Chacha20Poly1305, CipherMethod::Aes256Gcm, CipherMethod::Salsa20] {
            assert_eq!(method.as_str().parse::<CipherMethod>(), Ok(method));
        }

        assert!("rc4".parse::<CipherMethod>().is_err());
        assert_eq!("".parse::<CompressMethod>(), Ok(CompressMethod::None));
        assert_eq!("snappy".parse::<CompressMethod>(), Ok(CompressMethod::Snappy));
        assert_eq!("lz4".parse::<CompressMethod>(), Err(UnknownMethod("lz4".into())));
    }
}
