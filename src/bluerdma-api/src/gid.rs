//! Network addresses: 16-byte GIDs and the link-layer addresses they are derived from.
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

pub const GID_LEN: usize = 16;

/// Link-local subnet prefix of the default GID.
const LINK_LOCAL_PREFIX: [u8; 2] = [0xfe, 0x80];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gid {
    raw: [u8; GID_LEN],
}

impl Gid {
    #[inline]
    pub const fn new(raw: [u8; GID_LEN]) -> Self {
        Gid { raw }
    }

    #[inline]
    pub const fn raw(&self) -> &[u8; GID_LEN] {
        &self.raw
    }

    #[inline]
    pub fn subnet_prefix(&self) -> u64 {
        let mut half = [0u8; 8];
        half.copy_from_slice(&self.raw[..8]);
        u64::from_be_bytes(half)
    }

    #[inline]
    pub fn interface_id(&self) -> u64 {
        let mut half = [0u8; 8];
        half.copy_from_slice(&self.raw[8..]);
        u64::from_be_bytes(half)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.raw.iter().all(|b| *b == 0)
    }

    /// Builds the link-local GID of a hardware address: `fe80::/64` followed by the modified
    /// EUI-64 of `mac` (universal/local bit flipped, `ff:fe` inserted in the middle).
    pub fn from_mac(mac: MacAddr) -> Self {
        let m = mac.octets();
        let mut raw = [0u8; GID_LEN];
        raw[..2].copy_from_slice(&LINK_LOCAL_PREFIX);
        raw[8] = m[0] ^ 0x02;
        raw[9] = m[1];
        raw[10] = m[2];
        raw[11] = 0xff;
        raw[12] = 0xfe;
        raw[13..].copy_from_slice(&m[3..]);
        Gid { raw }
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Gid::new(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.raw)
    }
}

/// Full, uncompressed IPv6 text form, eight groups of four hex digits.
impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.raw.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

pub const MAC_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; MAC_LEN]);

impl MacAddr {
    /// Locally administered prefix of software-generated adapter addresses.
    pub const DEFAULT_PREFIX: [u8; MAC_LEN - 1] = [0x02, 0xbd, 0xbd, 0x00, 0x00];

    #[inline]
    pub const fn new(octets: [u8; MAC_LEN]) -> Self {
        MacAddr(octets)
    }

    /// An address under [`Self::DEFAULT_PREFIX`] ending in `last`.
    pub const fn with_default_prefix(last: u8) -> Self {
        let p = Self::DEFAULT_PREFIX;
        MacAddr([p[0], p[1], p[2], p[3], p[4], last])
    }

    #[inline]
    pub const fn octets(&self) -> [u8; MAC_LEN] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidArgument(format!("malformed hardware address: {:?}", s));
        let mut octets = [0u8; MAC_LEN];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GidType {
    #[default]
    Ib,
    RoceV1,
    RoceV2,
}

/// Attributes stored next to a GID table entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GidAttr {
    pub gid_type: GidType,
    pub port_num: u8,
    pub index: u32,
    /// Name of the network interface the address is associated with.
    pub ndev: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gid_from_mac() {
        let mac: MacAddr = "02:BD:BD:00:00:01".parse().unwrap();
        let gid = Gid::from_mac(mac);
        assert_eq!(gid.raw()[..8], [0xfe, 0x80, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            gid.raw()[8..],
            [0x00, 0xbd, 0xbd, 0xff, 0xfe, 0x00, 0x00, 0x01]
        );
        assert_eq!(gid.subnet_prefix(), 0xfe80_0000_0000_0000);
        assert_eq!(gid.interface_id(), 0x00bd_bdff_fe00_0001);
    }

    #[test]
    fn universal_bit_is_flipped_both_ways() {
        let gid = Gid::from_mac(MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(gid.raw()[8], 0x02);
        let gid = Gid::from_mac(MacAddr::new([0xff, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(gid.raw()[8], 0xfd);
    }

    #[test]
    fn display_full_form() {
        let gid = Gid::from_mac(MacAddr::with_default_prefix(1));
        assert_eq!(gid.to_string(), "fe80:0000:0000:0000:00bd:bdff:fe00:0001");
        let addr: Ipv6Addr = gid.into();
        assert_eq!(Gid::from(addr), gid);
    }

    #[test]
    fn mac_text_form() {
        let mac = MacAddr::with_default_prefix(0x2a);
        assert_eq!(mac.to_string(), "02:bd:bd:00:00:2a");
        assert_eq!(mac.to_string().parse::<MacAddr>().unwrap(), mac);
        assert!("02:bd:bd:00:00".parse::<MacAddr>().is_err());
        assert!("02:bd:bd:00:00:01:02".parse::<MacAddr>().is_err());
        assert!("02:bd:bd:00:00:zz".parse::<MacAddr>().is_err());
        assert!("02:bd:bd:00:0:001".parse::<MacAddr>().is_err());
    }

    #[test]
    fn mac_serializes_as_text() {
        let mac = MacAddr::with_default_prefix(3);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"02:bd:bd:00:00:03\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
        assert!(serde_json::from_str::<MacAddr>("\"nonsense\"").is_err());
    }
}
