//! Bluetooth SIG UUID helpers
//!
//! 16-bit assigned numbers are shorthand for UUIDs on the Bluetooth base
//! `0000xxxx-0000-1000-8000-00805F9B34FB`.

use uuid::Uuid;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// The 16-bit assigned number of `uuid`, if it lives on the base UUID.
pub fn as_uuid16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u16;
    if value == (BASE_UUID | ((short as u128) << 96)) {
        Some(short)
    } else {
        None
    }
}

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid16(0x2902);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid16_expansion() {
        assert_eq!(
            uuid16(0x180A).to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIGURATION.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_as_uuid16() {
        assert_eq!(as_uuid16(&uuid16(0x2A19)), Some(0x2A19));
        assert_eq!(as_uuid16(&Uuid::new_v4()), None);
    }
}
