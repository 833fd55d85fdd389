//! Channel URIs and their resolution to network endpoints.
//!
//! A channel names a medium and a set of parameters:
//!
//! ```text
//! aeron:udp?endpoint=224.10.9.7:40123|interface=10.0.0.0/8|ttl=4
//! aeron:udp?control=10.0.0.1:40456|control-mode=dynamic
//! aeron:ipc
//! ```
//!
//! The `aeron:` prefix is optional, the medium is case-insensitive, and the
//! parameter list may follow `?` or `:` and use `|` or `;` between pairs.
//!
//! [`ChannelUri::parse`] validates syntax and the key vocabulary;
//! [`UdpChannel::resolve`] turns a UDP channel into a [`ResolvedEndpoint`]
//! with a canonical form used to deduplicate endpoints.

use std::fmt;

use crate::error::{ControlError, Result};

mod interface;
mod udp;

pub use interface::{InterfaceSearchAddress, LocalInterface, find_interface};
pub use udp::{BindPreference, ResolvedEndpoint, UdpChannel, UniqueSuffix};

/// Scheme prefix accepted (and emitted) in front of the medium.
pub const SCHEME: &str = "aeron";

/// Canonical form of every IPC channel.
pub const IPC_CANONICAL_FORM: &str = "IPC";

/// Parameter keys understood by the driver.
pub mod param {
    pub const ENDPOINT: &str = "endpoint";
    pub const INTERFACE: &str = "interface";
    pub const CONTROL: &str = "control";
    pub const CONTROL_MODE: &str = "control-mode";
    pub const TAGS: &str = "tags";
    pub const SESSION_ID: &str = "session-id";
    pub const TERM_LENGTH: &str = "term-length";
    pub const MTU: &str = "mtu";
    pub const LINGER: &str = "linger";
    pub const SPARSE: &str = "sparse";
    pub const EOS: &str = "eos";
    pub const TETHER: &str = "tether";
    pub const GROUP: &str = "group";
    pub const REJOIN: &str = "rejoin";
    pub const FLOW_CONTROL: &str = "fc";
    pub const GROUP_TAG: &str = "gtag";
    pub const CONGESTION_CONTROL: &str = "cc";
    pub const SPIES_SIMULATE_CONNECTION: &str = "ssc";
    pub const ATS: &str = "ats";
    pub const TTL: &str = "ttl";
    pub const INITIAL_TERM_ID: &str = "init-term-id";
    pub const TERM_ID: &str = "term-id";
    pub const TERM_OFFSET: &str = "term-offset";

    pub(super) const ALL: &[&str] = &[
        ENDPOINT,
        INTERFACE,
        CONTROL,
        CONTROL_MODE,
        TAGS,
        SESSION_ID,
        TERM_LENGTH,
        MTU,
        LINGER,
        SPARSE,
        EOS,
        TETHER,
        GROUP,
        REJOIN,
        FLOW_CONTROL,
        GROUP_TAG,
        CONGESTION_CONTROL,
        SPIES_SIMULATE_CONNECTION,
        ATS,
        TTL,
        INITIAL_TERM_ID,
        TERM_ID,
        TERM_OFFSET,
    ];
}

/// Transport medium of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Media {
    Udp,
    Ipc,
}

impl Media {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Ipc => "ipc",
        }
    }
}

/// How a UDP channel's destinations are managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMode {
    /// Destinations are added and removed explicitly by the client.
    Manual,
    /// Receivers register themselves with the publisher's control address.
    Dynamic,
}

/// Channel and publication tags from `tags=channel[,publication]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelTags {
    pub channel_tag: Option<i64>,
    pub publication_tag: Option<i64>,
}

/// A parsed, validated channel URI. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    media: Media,
    params: Vec<(String, String)>,
}

impl ChannelUri {
    /// Parses channel text.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidChannel`] for an unknown medium, a malformed
    /// `key=value` token, an unknown or duplicate key, or a typed parameter
    /// (`control-mode`, `tags`, `session-id`, `ttl`) with an invalid value.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let rest = match trimmed.split_once(':') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case(SCHEME) => rest,
            _ => trimmed,
        };

        let split_at = rest.find(['?', ':']);
        let (media_text, params_text) = match split_at {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };

        let media = if media_text.eq_ignore_ascii_case("udp") {
            Media::Udp
        } else if media_text.eq_ignore_ascii_case("ipc") {
            Media::Ipc
        } else {
            return Err(ControlError::invalid_channel(format!(
                "unknown media `{media_text}` in `{text}`"
            )));
        };

        let mut params: Vec<(String, String)> = Vec::new();
        if !params_text.is_empty() {
            for token in params_text.split(['|', ';']) {
                let Some((key, value)) = token.split_once('=') else {
                    return Err(ControlError::invalid_channel(format!(
                        "malformed parameter `{token}` in `{text}`"
                    )));
                };
                let key = key.trim();
                if key.is_empty() {
                    return Err(ControlError::invalid_channel(format!(
                        "empty parameter key in `{text}`"
                    )));
                }
                if !param::ALL.contains(&key) {
                    return Err(ControlError::invalid_channel(format!(
                        "unknown parameter `{key}` in `{text}`"
                    )));
                }
                if params.iter().any(|(k, _)| k == key) {
                    return Err(ControlError::invalid_channel(format!(
                        "duplicate parameter `{key}` in `{text}`"
                    )));
                }
                params.push((key.to_string(), value.trim().to_string()));
            }
        }

        let uri = Self { media, params };
        uri.validate_typed_params()?;
        Ok(uri)
    }

    #[must_use]
    pub const fn media(&self) -> Media {
        self.media
    }

    #[must_use]
    pub fn is_udp(&self) -> bool {
        self.media == Media::Udp
    }

    #[must_use]
    pub fn is_ipc(&self) -> bool {
        self.media == Media::Ipc
    }

    /// Raw value of a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parameters in the order they were written.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.get(param::ENDPOINT)
    }

    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.get(param::INTERFACE)
    }

    #[must_use]
    pub fn control(&self) -> Option<&str> {
        self.get(param::CONTROL)
    }

    #[must_use]
    pub fn control_mode(&self) -> Option<ControlMode> {
        self.get(param::CONTROL_MODE).and_then(parse_control_mode)
    }

    #[must_use]
    pub fn is_manual_control_mode(&self) -> bool {
        self.control_mode() == Some(ControlMode::Manual)
    }

    #[must_use]
    pub fn tags(&self) -> Option<ChannelTags> {
        self.get(param::TAGS).and_then(|v| parse_tags(v).ok())
    }

    #[must_use]
    pub fn session_id(&self) -> Option<i32> {
        self.get(param::SESSION_ID).and_then(|v| v.parse().ok())
    }

    /// Multicast TTL; `None` means the system default.
    #[must_use]
    pub fn ttl(&self) -> Option<u8> {
        self.get(param::TTL).and_then(|v| v.parse().ok())
    }

    fn validate_typed_params(&self) -> Result<()> {
        if let Some(mode) = self.get(param::CONTROL_MODE)
            && parse_control_mode(mode).is_none()
        {
            return Err(ControlError::invalid_channel(format!(
                "control-mode must be `manual` or `dynamic`, got `{mode}`"
            )));
        }
        if let Some(tags) = self.get(param::TAGS) {
            parse_tags(tags)?;
        }
        if let Some(session_id) = self.get(param::SESSION_ID)
            && session_id.parse::<i32>().is_err()
        {
            return Err(ControlError::invalid_channel(format!(
                "session-id must be an i32, got `{session_id}`"
            )));
        }
        if let Some(ttl) = self.get(param::TTL)
            && ttl.parse::<u8>().is_err()
        {
            return Err(ControlError::invalid_channel(format!(
                "ttl must be in 0..=255, got `{ttl}`"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}:{}", self.media.as_str())?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '|' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ChannelUri {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_control_mode(value: &str) -> Option<ControlMode> {
    match value {
        "manual" => Some(ControlMode::Manual),
        "dynamic" => Some(ControlMode::Dynamic),
        _ => None,
    }
}

fn parse_tags(value: &str) -> Result<ChannelTags> {
    let parse_one = |s: &str| -> Result<Option<i64>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse()
            .map(Some)
            .map_err(|_| ControlError::invalid_channel(format!("invalid tag `{s}`")))
    };

    let (channel, publication) = match value.split_once(',') {
        Some((c, p)) => (c, p),
        None => (value, ""),
    };

    Ok(ChannelTags {
        channel_tag: parse_one(channel)?,
        publication_tag: parse_one(publication)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_with_params() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=224.10.9.7:40123|interface=10.0.0.0/8")
            .unwrap();
        assert!(uri.is_udp());
        assert_eq!(uri.endpoint(), Some("224.10.9.7:40123"));
        assert_eq!(uri.interface(), Some("10.0.0.0/8"));
        assert_eq!(uri.control(), None);
    }

    #[test]
    fn test_parse_accepts_alternate_separators() {
        let uri = ChannelUri::parse("UDP:endpoint=localhost:40123;ttl=4").unwrap();
        assert_eq!(uri.media(), Media::Udp);
        assert_eq!(uri.endpoint(), Some("localhost:40123"));
        assert_eq!(uri.ttl(), Some(4));
    }

    #[test]
    fn test_parse_ipc_without_params() {
        let uri = ChannelUri::parse("aeron:ipc").unwrap();
        assert!(uri.is_ipc());
        assert_eq!(uri.params().count(), 0);
        assert_eq!(uri.to_string(), "aeron:ipc");
    }

    #[test]
    fn test_display_renders_canonical_syntax() {
        let uri = ChannelUri::parse("udp?control=10.0.0.1:40456;control-mode=dynamic").unwrap();
        assert_eq!(
            uri.to_string(),
            "aeron:udp?control=10.0.0.1:40456|control-mode=dynamic"
        );
        assert_eq!(uri.control_mode(), Some(ControlMode::Dynamic));
        assert_eq!(ChannelUri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for text in [
            "aeron:tcp?endpoint=a:1",
            "aeron:udp?endpoint",
            "aeron:udp?=x",
            "aeron:udp?endpoint=a:1|endpoint=b:2",
            "aeron:udp?colour=blue",
            "aeron:udp?control-mode=sometimes",
            "aeron:udp?tags=one",
            "aeron:udp?session-id=abc",
            "aeron:udp?ttl=300",
        ] {
            assert!(
                matches!(ChannelUri::parse(text), Err(ControlError::InvalidChannel(_))),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn test_typed_accessors() {
        let uri = ChannelUri::parse("aeron:udp?tags=1001,1002|session-id=-7|control-mode=manual")
            .unwrap();
        assert_eq!(
            uri.tags(),
            Some(ChannelTags {
                channel_tag: Some(1001),
                publication_tag: Some(1002)
            })
        );
        assert_eq!(uri.session_id(), Some(-7));
        assert!(uri.is_manual_control_mode());

        let uri = ChannelUri::parse("aeron:udp?tags=5").unwrap();
        assert_eq!(
            uri.tags(),
            Some(ChannelTags {
                channel_tag: Some(5),
                publication_tag: None
            })
        );
    }
}
