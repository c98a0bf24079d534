//! Peer identities for simulated GATT servers and clients
//!
//! Identities are plain values: two handles naming the same address are the
//! same peer, whatever display name they carry.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A BLE device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl BleAddress {
    /// A fresh, random simulated address.
    pub fn simulated() -> Self {
        BleAddress::Simulated(Uuid::new_v4())
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(mac) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id.simple()),
        }
    }
}

macro_rules! peer_identity {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $name {
            address: BleAddress,
            name: Option<String>,
        }

        impl $name {
            /// Create an identity with a random simulated address.
            pub fn new(name: impl Into<String>) -> Self {
                Self {
                    address: BleAddress::simulated(),
                    name: Some(name.into()),
                }
            }

            /// Create an identity for a known address.
            pub fn with_address(address: BleAddress, name: Option<String>) -> Self {
                Self { address, name }
            }

            pub fn address(&self) -> BleAddress {
                self.address
            }

            pub fn name(&self) -> Option<&str> {
                self.name.as_deref()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.address == other.address
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.address.hash(state);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.name {
                    Some(name) => write!(f, "{} ({})", name, self.address),
                    None => write!(f, "{}", self.address),
                }
            }
        }
    };
}

peer_identity!(
    /// A device exposing a GATT attribute database.
    ServerDevice
);

peer_identity!(
    /// A device consuming a server's attribute database.
    ClientDevice
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ble_address_equality() {
        let addr1 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr2 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr3 = BleAddress::Real([0xFF, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr1, addr2);
        assert_ne!(addr1, addr3);

        let sim = BleAddress::Simulated(Uuid::nil());
        assert_ne!(addr1, sim);
    }

    #[test]
    fn test_identity_equality_ignores_name() {
        let address = BleAddress::Real([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let a = ServerDevice::with_address(address, Some("Blinky".into()));
        let b = ServerDevice::with_address(address, None);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_new_identities_are_distinct() {
        assert_ne!(ClientDevice::new("phone"), ClientDevice::new("phone"));
    }

    #[test]
    fn test_display() {
        let address = BleAddress::Real([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(address.to_string(), "11:22:33:44:55:66");
        let device = ClientDevice::with_address(address, Some("phone".into()));
        assert_eq!(device.to_string(), "phone (11:22:33:44:55:66)");
    }
}
