//! Local network interface lookup for the `interface` channel parameter.

use std::cmp::Reverse;
use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use super::udp::{resolve_socket_address, unknown_host};
use crate::error::{ControlError, Result};

/// Parsed `address[:port][/prefix]` text naming one or more local interfaces.
///
/// A full-length prefix (the default) asks for an exact address; a shorter
/// prefix matches any interface in that subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceSearchAddress {
    address: IpAddr,
    port: u16,
    prefix: u8,
}

impl InterfaceSearchAddress {
    /// # Errors
    ///
    /// [`ControlError::InvalidChannel`] for malformed text or an out of range
    /// prefix or an unresolvable host name.
    pub fn parse(text: &str) -> Result<Self> {
        let (address_text, prefix_text) = match text.rsplit_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (text, None),
        };

        let (address, port) = if let Ok(socket) = address_text.parse::<SocketAddr>() {
            (socket.ip(), socket.port())
        } else if let Ok(ip) = address_text
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
        {
            (ip, 0)
        } else if address_text.contains(':') {
            let socket = resolve_socket_address(address_text, "interface")?;
            (socket.ip(), socket.port())
        } else {
            let ip = (address_text, 0)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| unknown_host(address_text, "no addresses"))?;
            (ip.ip(), 0)
        };

        let max_prefix = max_prefix_for(address);
        let prefix = match prefix_text {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| {
                    ControlError::invalid_channel(format!("invalid subnet prefix in `{text}`"))
                })?,
            None => max_prefix,
        };

        Ok(Self {
            address,
            port,
            prefix,
        })
    }

    /// Any-address search for the given address family.
    #[must_use]
    pub const fn wildcard_for(family: IpAddr) -> Self {
        let address = match family {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self {
            address,
            port: 0,
            prefix: 0,
        }
    }

    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    #[must_use]
    pub const fn socket_address(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// True if `candidate` is the searched address or lies in its subnet.
    #[must_use]
    pub fn matches(&self, candidate: IpAddr) -> bool {
        match (self.address, candidate) {
            (IpAddr::V4(search), IpAddr::V4(candidate)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(search) & mask == u32::from(candidate) & mask
            }
            (IpAddr::V6(search), IpAddr::V6(candidate)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(search) & mask == u128::from(candidate) & mask
            }
            _ => false,
        }
    }

    fn is_exact(&self) -> bool {
        self.prefix == max_prefix_for(self.address)
    }
}

const fn max_prefix_for(address: IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

const fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) }
}

const fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - prefix as u32) }
}

/// A local interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    name: String,
    index: u32,
    address: IpAddr,
    prefix: u8,
}

impl LocalInterface {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS interface index; 0 for the wildcard interface.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    /// Length of the interface's subnet mask.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }
}

/// Finds the local interface matching `search`.
///
/// A wildcard search returns the any-address without enumerating. Otherwise
/// see [`select_interface`].
///
/// # Errors
///
/// [`ControlError::InvalidChannel`] if no interface matches or interfaces
/// cannot be enumerated.
pub fn find_interface(search: &InterfaceSearchAddress) -> Result<LocalInterface> {
    if search.address().is_unspecified() {
        return Ok(LocalInterface {
            name: String::new(),
            index: 0,
            address: search.address(),
            prefix: 0,
        });
    }

    let interfaces = local_interfaces().map_err(|err| {
        ControlError::invalid_channel(format!("unable to enumerate network interfaces: {err}"))
    })?;

    select_interface(search, &interfaces).cloned().ok_or_else(|| {
        ControlError::invalid_channel(format!(
            "no local interface matches {}/{}",
            search.address(),
            search.prefix()
        ))
    })
}

/// Picks the interface for `search` out of `interfaces`.
///
/// An interface with exactly the searched address wins. A subnet search
/// then takes the matching interface with the longest netmask, the earliest
/// one on ties.
pub fn select_interface<'a>(
    search: &InterfaceSearchAddress,
    interfaces: &'a [LocalInterface],
) -> Option<&'a LocalInterface> {
    let exact = interfaces
        .iter()
        .find(|candidate| candidate.address == search.address());
    if exact.is_some() || search.is_exact() {
        return exact;
    }

    interfaces
        .iter()
        .filter(|candidate| search.matches(candidate.address))
        .min_by_key(|candidate| Reverse(candidate.prefix))
}

/// Enumerates the addresses of all local interfaces via `getifaddrs`.
pub fn local_interfaces() -> io::Result<Vec<LocalInterface>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs allocates the list and stores its head; it is
    // released with freeifaddrs below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut interfaces = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is a live node of the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }

        // SAFETY: ifa_addr is non-null and points to a sockaddr whose
        // concrete type is given by sa_family.
        let address = unsafe {
            match i32::from((*entry.ifa_addr).sa_family) {
                libc::AF_INET => {
                    let sin = &*entry.ifa_addr.cast::<libc::sockaddr_in>();
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
                }
                libc::AF_INET6 => {
                    let sin6 = &*entry.ifa_addr.cast::<libc::sockaddr_in6>();
                    IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
                }
                _ => continue,
            }
        };

        // SAFETY: ifa_name is a non-null NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) };
        let prefix = if entry.ifa_netmask.is_null() {
            0
        } else {
            // SAFETY: ifa_netmask is non-null and has the family of ifa_addr.
            unsafe {
                match address {
                    IpAddr::V4(_) => {
                        let mask = &*entry.ifa_netmask.cast::<libc::sockaddr_in>();
                        u32::from_be(mask.sin_addr.s_addr).leading_ones() as u8
                    }
                    IpAddr::V6(_) => {
                        let mask = &*entry.ifa_netmask.cast::<libc::sockaddr_in6>();
                        u128::from_be_bytes(mask.sin6_addr.s6_addr).leading_ones() as u8
                    }
                }
            }
        };
        // SAFETY: same string as above.
        let index = unsafe { libc::if_nametoindex(entry.ifa_name) };

        interfaces.push(LocalInterface {
            name: name.to_string_lossy().into_owned(),
            index,
            address,
            prefix,
        });
    }

    // SAFETY: head came from a successful getifaddrs and is freed once.
    unsafe { libc::freeifaddrs(head) };

    Ok(interfaces)
}
