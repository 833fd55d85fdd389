//! UDP channel resolution and canonical forms.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicI64, Ordering};

use super::interface::{InterfaceSearchAddress, find_interface};
use super::{ChannelUri, ControlMode};
use crate::error::{ControlError, Result};

/// Which side of a channel an endpoint is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindPreference {
    /// Publication side: binds the local data address, sends to the endpoint.
    #[default]
    Sender,
    /// Subscription side: binds the endpoint (or joins the multicast group).
    Receiver,
}

/// Process-wide counter that makes canonical forms unique for channels with
/// nothing else to distinguish them.
///
/// Starts at 0 when the process starts and is shared by every resolution in
/// the process; values are never reused.
pub struct UniqueSuffix;

static UNIQUE_CANONICAL_FORM_VALUE: AtomicI64 = AtomicI64::new(0);

impl UniqueSuffix {
    /// Takes the next suffix value.
    pub fn next() -> i64 {
        UNIQUE_CANONICAL_FORM_VALUE.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`next`](Self::next) will return.
    #[must_use]
    pub fn peek() -> i64 {
        UNIQUE_CANONICAL_FORM_VALUE.load(Ordering::Relaxed)
    }
}

/// Concrete addresses a UDP channel resolves to. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    channel: ChannelUri,
    local_data: SocketAddr,
    local_control: SocketAddr,
    remote_data: SocketAddr,
    remote_control: SocketAddr,
    interface_index: u32,
    multicast: bool,
    multicast_ttl: u8,
    has_explicit_control: bool,
    bind_preference: BindPreference,
    canonical_form: String,
}

impl ResolvedEndpoint {
    /// The channel this endpoint was resolved from.
    #[must_use]
    pub fn channel(&self) -> &ChannelUri {
        &self.channel
    }

    #[must_use]
    pub const fn local_data(&self) -> SocketAddr {
        self.local_data
    }

    #[must_use]
    pub const fn local_control(&self) -> SocketAddr {
        self.local_control
    }

    #[must_use]
    pub const fn remote_data(&self) -> SocketAddr {
        self.remote_data
    }

    #[must_use]
    pub const fn remote_control(&self) -> SocketAddr {
        self.remote_control
    }

    /// OS index of the interface used for multicast, 0 for any.
    #[must_use]
    pub const fn interface_index(&self) -> u32 {
        self.interface_index
    }

    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        self.multicast
    }

    /// Multicast TTL; 0 means the system default.
    #[must_use]
    pub const fn multicast_ttl(&self) -> u8 {
        self.multicast_ttl
    }

    #[must_use]
    pub const fn has_explicit_control(&self) -> bool {
        self.has_explicit_control
    }

    #[must_use]
    pub fn control_mode(&self) -> Option<ControlMode> {
        self.channel.control_mode()
    }

    #[must_use]
    pub fn is_manual_control_mode(&self) -> bool {
        self.channel.is_manual_control_mode()
    }

    #[must_use]
    pub const fn bind_preference(&self) -> BindPreference {
        self.bind_preference
    }

    /// Address a socket for this endpoint should bind.
    #[must_use]
    pub fn bind_address(&self) -> SocketAddr {
        match self.bind_preference {
            BindPreference::Receiver if self.multicast || self.channel.endpoint().is_some() => {
                self.remote_data
            }
            _ => self.local_data,
        }
    }

    /// Identity string; equal canonical forms mean the same logical channel.
    #[must_use]
    pub fn canonical_form(&self) -> &str {
        &self.canonical_form
    }

    #[must_use]
    pub fn canonical_form_length(&self) -> usize {
        self.canonical_form.len()
    }
}

/// Resolver for `udp` channels.
pub struct UdpChannel;

impl UdpChannel {
    /// Resolves a UDP channel into concrete endpoint addresses.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidChannel`] when the channel names none of
    /// `endpoint`, `control` or `tags` outside manual control mode, when
    /// dynamic control mode lacks a control address, when a multicast data
    /// address has an even last byte, or when address text is malformed or
    /// names no local interface or host.
    pub fn resolve(uri: &ChannelUri, bind_preference: BindPreference) -> Result<ResolvedEndpoint> {
        if !uri.is_udp() {
            return Err(ControlError::invalid_channel(format!(
                "UDP channel expected, got `{uri}`"
            )));
        }

        let has_explicit_endpoint = uri.endpoint().is_some();
        let has_explicit_control = uri.control().is_some();
        let has_tag = uri.tags().is_some_and(|t| t.channel_tag.is_some());
        let is_manual = uri.control_mode() == Some(ControlMode::Manual);
        let is_dynamic = uri.control_mode() == Some(ControlMode::Dynamic);

        if !has_explicit_endpoint && !has_explicit_control && !has_tag && !is_manual {
            return Err(ControlError::invalid_channel(format!(
                "UDP channels must specify an endpoint, control, tags, or control-mode=manual: `{uri}`"
            )));
        }

        if is_dynamic && !has_explicit_control {
            return Err(ControlError::invalid_channel(format!(
                "explicit control expected with dynamic control mode: `{uri}`"
            )));
        }

        let has_no_distinguishing_characteristic =
            !has_explicit_endpoint && !has_explicit_control && !has_tag;

        let endpoint_address = uri
            .endpoint()
            .map(|text| resolve_socket_address(text, "endpoint"))
            .transpose()?;
        let explicit_control_address = uri
            .control()
            .map(|text| resolve_socket_address(text, "control"))
            .transpose()?;

        let multicast_ttl = uri.ttl().unwrap_or(0);

        if let Some(endpoint) = endpoint_address
            && endpoint.ip().is_multicast()
        {
            let control = multicast_control_address(endpoint)?;
            let search = match uri.interface() {
                Some(text) => InterfaceSearchAddress::parse(text)?,
                None => InterfaceSearchAddress::wildcard_for(endpoint.ip()),
            };
            let local_interface = find_interface(&search)?;
            let local = SocketAddr::new(local_interface.address(), search.port());

            return Ok(ResolvedEndpoint {
                channel: uri.clone(),
                local_data: local,
                local_control: local,
                remote_data: endpoint,
                remote_control: control,
                interface_index: local_interface.index(),
                multicast: true,
                multicast_ttl,
                has_explicit_control: false,
                bind_preference,
                canonical_form: canonicalise(None, local, endpoint),
            });
        }

        let remote = endpoint_address.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });

        if let Some(control) = explicit_control_address {
            return Ok(ResolvedEndpoint {
                channel: uri.clone(),
                local_data: control,
                local_control: control,
                remote_data: remote,
                remote_control: remote,
                interface_index: 0,
                multicast: false,
                multicast_ttl,
                has_explicit_control: true,
                bind_preference,
                canonical_form: canonicalise(None, control, remote),
            });
        }

        let search = match uri.interface() {
            Some(text) => InterfaceSearchAddress::parse(text)?,
            None => InterfaceSearchAddress::wildcard_for(remote.ip()),
        };
        let (local, interface_index) = if search.address().is_unspecified() {
            (search.socket_address(), 0)
        } else {
            let local_interface = find_interface(&search)?;
            (
                SocketAddr::new(local_interface.address(), search.port()),
                local_interface.index(),
            )
        };

        let unique_suffix = has_no_distinguishing_characteristic.then(UniqueSuffix::next);

        Ok(ResolvedEndpoint {
            channel: uri.clone(),
            local_data: local,
            local_control: local,
            remote_data: remote,
            remote_control: remote,
            interface_index,
            multicast: false,
            multicast_ttl,
            has_explicit_control: false,
            bind_preference,
            canonical_form: canonicalise(unique_suffix, local, remote),
        })
    }
}

/// Control address of a multicast group: the data address with its last
/// byte incremented, wrapping `255` to `0`. The data address must end in an
/// odd byte.
fn multicast_control_address(data: SocketAddr) -> Result<SocketAddr> {
    let control_ip = match data.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            if octets[3] & 1 == 0 {
                return Err(ControlError::invalid_channel(format!(
                    "multicast data address must be odd: {data}"
                )));
            }
            octets[3] = octets[3].wrapping_add(1);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            if octets[15] & 1 == 0 {
                return Err(ControlError::invalid_channel(format!(
                    "multicast data address must be odd: {data}"
                )));
            }
            octets[15] = octets[15].wrapping_add(1);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };

    Ok(SocketAddr::new(control_ip, data.port()))
}

/// `UDP-<local hex>-<local port>-<remote hex>-<remote port>[-<suffix>]`
fn canonicalise(unique_suffix: Option<i64>, local: SocketAddr, remote: SocketAddr) -> String {
    let mut form = String::with_capacity(48);
    form.push_str("UDP-");
    push_hex(&mut form, local.ip());
    let _ = write!(form, "-{}-", local.port());
    push_hex(&mut form, remote.ip());
    let _ = write!(form, "-{}", remote.port());
    if let Some(suffix) = unique_suffix {
        let _ = write!(form, "-{suffix}");
    }
    form
}

fn push_hex(out: &mut String, ip: IpAddr) {
    let bytes: Vec<u8> = match ip {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
}

/// Resolves `host:port` or `[v6]:port` text.
pub(crate) fn resolve_socket_address(text: &str, what: &str) -> Result<SocketAddr> {
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let Some((host, port)) = text.rsplit_once(':') else {
        return Err(ControlError::invalid_channel(format!(
            "{what} address `{text}` has no port"
        )));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ControlError::invalid_channel(format!(
            "malformed {what} address `{text}`"
        )));
    }

    let addrs: Vec<SocketAddr> = text
        .to_socket_addrs()
        .map_err(|err| unknown_host(text, &err.to_string()))?
        .collect();

    addrs
        .iter()
        .copied()
        .find(SocketAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
        .ok_or_else(|| unknown_host(text, "no addresses"))
}

pub(crate) fn unknown_host(text: &str, detail: &str) -> ControlError {
    ControlError::invalid_channel(format!("unknown host `{text}`: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(text: &str) -> Result<ResolvedEndpoint> {
        UdpChannel::resolve(&ChannelUri::parse(text)?, BindPreference::Sender)
    }

    #[test]
    fn test_multicast_odd_address_gets_next_control() {
        let endpoint = resolve("aeron:udp?endpoint=224.10.9.7:40124").unwrap();
        assert!(endpoint.is_multicast());
        assert_eq!(endpoint.remote_data(), "224.10.9.7:40124".parse().unwrap());
        assert_eq!(endpoint.remote_control(), "224.10.9.8:40124".parse().unwrap());
        assert_eq!(endpoint.local_data().ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(endpoint.local_data(), endpoint.local_control());
        assert_eq!(endpoint.canonical_form(), "UDP-00000000-0-e00a0907-40124");
    }

    #[test]
    fn test_multicast_even_address_rejected() {
        let err = resolve("aeron:udp?endpoint=224.10.9.8:40124").unwrap_err();
        assert!(
            matches!(&err, ControlError::InvalidChannel(msg) if msg.contains("multicast data address must be odd"))
        );
    }

    #[test]
    fn test_multicast_control_wraps_last_byte() {
        let endpoint = resolve("aeron:udp?endpoint=224.0.0.255:40000").unwrap();
        assert_eq!(endpoint.remote_control(), "224.0.0.0:40000".parse().unwrap());

        let endpoint = resolve("aeron:udp?endpoint=[ff02::1:ff]:40000").unwrap();
        assert!(endpoint.is_multicast());
        assert_eq!(endpoint.remote_control(), "[ff02::1:0]:40000".parse().unwrap());
    }

    #[test]
    fn test_unresolvable_host_is_invalid_channel() {
        let err = resolve("aeron:udp?endpoint=no-such-host.invalid:40000").unwrap_err();
        assert!(matches!(&err, ControlError::InvalidChannel(msg) if msg.contains("no-such-host.invalid")));
        assert_eq!(err.error_code(), crate::protocol::ErrorCode::InvalidChannel);
    }

    #[test]
    fn test_multicast_ttl() {
        let endpoint = resolve("aeron:udp?endpoint=224.10.9.7:40124|ttl=8").unwrap();
        assert_eq!(endpoint.multicast_ttl(), 8);
        let endpoint = resolve("aeron:udp?endpoint=224.10.9.7:40124").unwrap();
        assert_eq!(endpoint.multicast_ttl(), 0);
    }

    #[test]
    fn test_unicast_endpoint() {
        let endpoint = resolve("aeron:udp?endpoint=192.168.0.1:40456").unwrap();
        assert!(!endpoint.is_multicast());
        assert_eq!(endpoint.remote_data(), "192.168.0.1:40456".parse().unwrap());
        assert_eq!(endpoint.remote_control(), endpoint.remote_data());
        assert_eq!(endpoint.local_data(), "0.0.0.0:0".parse().unwrap());
        assert_eq!(endpoint.canonical_form(), "UDP-00000000-0-c0a80001-40456");
        assert_eq!(endpoint.canonical_form_length(), endpoint.canonical_form().len());
    }

    #[test]
    fn test_explicit_control_address() {
        let endpoint =
            resolve("aeron:udp?endpoint=192.168.0.1:40456|control=192.168.0.2:40457").unwrap();
        assert!(endpoint.has_explicit_control());
        assert_eq!(endpoint.local_control(), "192.168.0.2:40457".parse().unwrap());
        assert_eq!(endpoint.local_data(), endpoint.local_control());
        assert_eq!(endpoint.remote_data(), "192.168.0.1:40456".parse().unwrap());
        assert_eq!(endpoint.canonical_form(), "UDP-c0a80002-40457-c0a80001-40456");
    }

    #[test]
    fn test_canonical_form_is_deterministic() {
        let a = resolve("aeron:udp?endpoint=127.0.0.1:40123").unwrap();
        let b = resolve("udp:endpoint=127.0.0.1:40123;ttl=0").unwrap();
        assert_eq!(a.canonical_form(), b.canonical_form());

        let c = resolve("aeron:udp?endpoint=127.0.0.1:40124").unwrap();
        assert_ne!(a.canonical_form(), c.canonical_form());
    }

    #[test]
    fn test_manual_mode_without_endpoint_is_unique() {
        let a = resolve("aeron:udp?control-mode=manual").unwrap();
        let b = resolve("aeron:udp?control-mode=manual").unwrap();
        assert_ne!(a.canonical_form(), b.canonical_form());
        assert!(a.canonical_form().starts_with("UDP-00000000-0-00000000-0-"));
    }

    #[test]
    fn test_requires_distinguishing_parameter() {
        assert!(matches!(
            resolve("aeron:udp?ttl=1"),
            Err(ControlError::InvalidChannel(_))
        ));
        assert!(resolve("aeron:udp?tags=1001").is_ok());
    }

    #[test]
    fn test_dynamic_mode_requires_control() {
        assert!(matches!(
            resolve("aeron:udp?endpoint=127.0.0.1:40123|control-mode=dynamic"),
            Err(ControlError::InvalidChannel(_))
        ));
        assert!(resolve("aeron:udp?control=127.0.0.1:40124|control-mode=dynamic").is_ok());
    }

    #[test]
    fn test_malformed_addresses() {
        assert!(matches!(
            resolve("aeron:udp?endpoint=127.0.0.1"),
            Err(ControlError::InvalidChannel(_))
        ));
        assert!(matches!(
            resolve("aeron:udp?endpoint=127.0.0.1:notaport"),
            Err(ControlError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_receiver_binds_endpoint() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:40123").unwrap();
        let sender = UdpChannel::resolve(&uri, BindPreference::Sender).unwrap();
        let receiver = UdpChannel::resolve(&uri, BindPreference::Receiver).unwrap();
        assert_eq!(sender.canonical_form(), receiver.canonical_form());
        assert_eq!(sender.bind_address(), "0.0.0.0:0".parse().unwrap());
        assert_eq!(receiver.bind_address(), "127.0.0.1:40123".parse().unwrap());
    }

    #[test]
    fn test_unique_suffix_is_monotonic() {
        let first = UniqueSuffix::next();
        let second = UniqueSuffix::next();
        assert!(second > first);
        assert!(UniqueSuffix::peek() > second);
    }

    #[test]
    fn test_ipc_is_not_udp() {
        let uri = ChannelUri::parse("aeron:ipc").unwrap();
        assert!(UdpChannel::resolve(&uri, BindPreference::Sender).is_err());
    }
}
