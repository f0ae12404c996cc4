use std::collections::HashSet;
use std::fmt;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use sha2::{Digest, Sha256};

type TokenDigest = [u8; 32];

/// Why an operator request was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TokenRejection {
    Missing,
    Unreadable,
    Unknown,
}

impl fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenRejection::Missing => "missing bearer token",
            TokenRejection::Unreadable => "unreadable authorization header",
            TokenRejection::Unknown => "unknown bearer token",
        })
    }
}

/// Operator credentials for the `/api` routes. Device tokens never pass through here.
///
/// Only SHA-256 digests of the configured tokens are kept.
#[derive(Clone)]
pub(crate) struct ApiTokens {
    digests: HashSet<TokenDigest>,
}

impl ApiTokens {
    pub(crate) fn new(tokens: &HashSet<String>) -> Self {
        Self {
            digests: tokens.iter().map(|token| digest(token)).collect(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.digests.is_empty()
    }

    pub(crate) fn check(&self, headers: &HeaderMap) -> Result<(), TokenRejection> {
        if self.is_open() {
            return Ok(());
        }

        let header = headers.get(AUTHORIZATION).ok_or(TokenRejection::Missing)?;
        let raw = header
            .to_str()
            .map_err(|_| TokenRejection::Unreadable)?
            .trim();
        let token = match raw.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            None if raw.eq_ignore_ascii_case("bearer") => "",
            _ => raw,
        };
        if token.is_empty() {
            return Err(TokenRejection::Missing);
        }

        if self.digests.contains(&digest(token)) {
            Ok(())
        } else {
            Err(TokenRejection::Unknown)
        }
    }
}

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}
