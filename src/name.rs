//! Server name parsing and normalisation
//!
//! A [`ServerName`] carries both the Unicode and the Punycode (IDNA) form of
//! a DNS host name. Both forms are lower-cased and validated; the Punycode
//! form is what locators and certificate providers key on, the Unicode form
//! is what humans see in logs.
//!
//! The IDNA profile applied is UTS-46 non-transitional (IDNA 2008 semantics)
//! as implemented by the `idna` crate.

use crate::error::{GatewayError, Result};

/// Maximum length of an encoded DNS name on the wire.
const MAX_NAME_OCTETS: usize = 253;

/// Maximum length of a single DNS label.
const MAX_LABEL_OCTETS: usize = 63;

/// A validated, normalised DNS server name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerName {
    /// Lower-cased Unicode form, e.g. `host.dømåin.tld`
    pub unicode: String,
    /// Lower-cased ASCII (Punycode) form, e.g. `host.xn--dmin-mra.tld`
    pub punycode: String,
}

impl ServerName {
    /// Parse a server name that is known to be valid.
    ///
    /// Panics if the input does not parse; use [`ServerName::try_parse`] for
    /// untrusted input.
    pub fn parse(raw: &str) -> ServerName {
        match Self::try_parse(raw) {
            Ok(name) => name,
            Err(e) => panic!("{}", e),
        }
    }

    /// Parse and validate a server name from untrusted input.
    pub fn try_parse(raw: &str) -> Result<ServerName> {
        let invalid = |reason: &str| GatewayError::InvalidServerName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };

        // ASCII-only case folding; full Unicode lower-casing is left to the
        // IDNA mapping so that the two forms stay in agreement.
        let lowered = raw.to_ascii_lowercase();

        if lowered.is_empty() {
            return Err(invalid("empty name"));
        }
        if lowered.starts_with('.') || lowered.starts_with('-') {
            return Err(invalid("leading dot or hyphen"));
        }
        if lowered.ends_with('.') || lowered.ends_with('-') {
            return Err(invalid("trailing dot or hyphen"));
        }
        if lowered.contains("..") || lowered.contains(".-") || lowered.contains("-.") {
            return Err(invalid("empty label or label-edge hyphen"));
        }

        let punycode = idna::domain_to_ascii(&lowered)
            .map_err(|e| invalid(&format!("IDNA conversion failed: {:?}", e)))?;

        if punycode.is_empty() {
            return Err(invalid("empty name after IDNA"));
        }
        if punycode.len() > MAX_NAME_OCTETS {
            return Err(invalid("name longer than 253 octets"));
        }
        if !punycode
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
        {
            return Err(invalid("character outside [a-z0-9.-] after IDNA"));
        }

        for label in punycode.split('.') {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > MAX_LABEL_OCTETS {
                return Err(invalid("label longer than 63 octets"));
            }
        }

        // Decode back to the canonical Unicode form. The round-trip also
        // lower-cases any non-ASCII characters the fold above left alone.
        let (unicode, result) = idna::domain_to_unicode(&punycode);
        if result.is_err() {
            return Err(invalid("IDNA decode failed"));
        }

        Ok(ServerName { unicode, punycode })
    }

    /// Parse a server name from an HTTP `Host` header or `:authority` value,
    /// stripping a trailing `:port` or `:service` suffix if present.
    pub fn from_host(host: &str) -> Result<ServerName> {
        let name = match host.rsplit_once(':') {
            Some((name, _port)) => name,
            None => host,
        };
        Self::try_parse(name)
    }

    /// Number of labels in the name.
    pub fn label_count(&self) -> usize {
        self.punycode.split('.').count()
    }

    /// Iterate over the Punycode labels, left to right.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.punycode.split('.')
    }
}

impl std::fmt::Display for ServerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.unicode)
    }
}
