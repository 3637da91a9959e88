// Absolute-URL splitting. Only the routing parts are extracted; nothing is
// decoded or validated beyond the scheme, and fragments pass through as part
// of the resource.

use std::fmt;

use crate::error::{NetError, NetResult};

const SCHEME_SEPARATOR: &str = "://";
const PORT_DELIMITER: char = ':';

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An absolute `http`/`https` URL split into its routing parts.
///
/// `host` is kept exactly as written, with or without an explicit port;
/// `resource` always begins with `/` and keeps any query string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedUrl {
    pub scheme: Scheme,
    pub host: String,
    pub resource: String,
}

impl ParsedUrl {
    /// Host with an explicit port, as used for pool keying and the `Host`
    /// header.
    pub fn authority(&self) -> String {
        authority_of(self.scheme, &self.host)
    }

    /// Bare host without the port, as sent for SNI.
    pub fn host_name(&self) -> &str {
        host_name_of(&self.host)
    }
}

impl fmt::Display for ParsedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}{}", self.scheme, SCHEME_SEPARATOR, self.host, self.resource)
    }
}

/// Split an absolute URL into scheme, `host[:port]`, and resource path.
///
/// The scheme must be `http` or `https` and the authority must be followed
/// by a `/`; anything else is invalid.
pub fn parse_url(input: &str) -> NetResult<ParsedUrl> {
    let (scheme, rest) = input
        .split_once(SCHEME_SEPARATOR)
        .ok_or_else(|| NetError::InvalidUrl(input.to_string()))?;
    let scheme = match scheme {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return Err(NetError::InvalidUrl(input.to_string())),
    };
    if rest.is_empty() {
        return Err(NetError::InvalidUrl(input.to_string()));
    }
    let slash = rest
        .find('/')
        .ok_or_else(|| NetError::InvalidUrl(input.to_string()))?;
    Ok(ParsedUrl {
        scheme,
        host: rest[..slash].to_string(),
        resource: rest[slash..].to_string(),
    })
}

pub(crate) fn authority_of(scheme: Scheme, host: &str) -> String {
    if host.contains(PORT_DELIMITER) {
        host.to_string()
    } else {
        format!("{host}{PORT_DELIMITER}{}", scheme.default_port())
    }
}

pub(crate) fn host_name_of(host: &str) -> &str {
    host.split(PORT_DELIMITER).next().unwrap_or_default()
}
