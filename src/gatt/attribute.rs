//! GATT attribute hierarchy
//!
//! A server exposes an ordered list of services, each owning characteristics,
//! each owning descriptors. The shape is fixed once built from configuration;
//! only the value buffers change afterwards, and changing them is a purely
//! local operation.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::WriteType;
use super::uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
use super::GattError;

bitflags::bitflags! {
    /// Declared characteristic properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Properties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
        const EXTENDED_PROPS = 0x80;
    }
}

bitflags::bitflags! {
    /// Access permissions of a characteristic or descriptor.
    ///
    /// Links are never encrypted in the simulator, so the encrypted variants
    /// grant the same access as their plain counterparts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const READ_ENCRYPTED = 1 << 1;
        const WRITE = 1 << 4;
        const WRITE_ENCRYPTED = 1 << 5;
    }
}

impl Permissions {
    fn allows_read(self) -> bool {
        self.intersects(Permissions::READ | Permissions::READ_ENCRYPTED)
    }

    fn allows_write(self) -> bool {
        self.intersects(Permissions::WRITE | Permissions::WRITE_ENCRYPTED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Primary,
    Secondary,
}

/// Address of a characteristic on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// The descriptor `descriptor` of this characteristic.
    pub fn descriptor(self, descriptor: Uuid) -> DescriptorId {
        DescriptorId {
            characteristic: self,
            descriptor,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Address of a descriptor on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub descriptor: Uuid,
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.characteristic, self.descriptor)
    }
}

// ---------------------------------------------------------------------------
// Declarative configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorConfig {
    pub uuid: Uuid,
    pub permissions: Permissions,
    #[serde(default)]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    pub uuid: Uuid,
    pub properties: Properties,
    pub permissions: Permissions,
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
    #[serde(default)]
    pub initial_value: Vec<u8>,
}

impl CharacteristicConfig {
    pub fn new(uuid: Uuid, properties: Properties, permissions: Permissions) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            descriptors: Vec::new(),
            initial_value: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: DescriptorConfig) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn with_initial_value(mut self, value: Vec<u8>) -> Self {
        self.initial_value = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub uuid: Uuid,
    #[serde(default)]
    pub service_type: ServiceType,
    pub characteristics: Vec<CharacteristicConfig>,
}

impl ServiceConfig {
    pub fn new(uuid: Uuid, service_type: ServiceType, characteristics: Vec<CharacteristicConfig>) -> Self {
        Self {
            uuid,
            service_type,
            characteristics,
        }
    }
}

// ---------------------------------------------------------------------------
// Attribute tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    uuid: Uuid,
    permissions: Permissions,
    value: Vec<u8>,
}

impl Descriptor {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    pub(crate) fn check_read(&self, id: &DescriptorId) -> Result<(), GattError> {
        if self.permissions.allows_read() {
            Ok(())
        } else {
            Err(GattError::OperationNotPermitted(format!("read of descriptor {id}")))
        }
    }

    pub(crate) fn check_write(&self, id: &DescriptorId) -> Result<(), GattError> {
        if self.permissions.allows_write() {
            Ok(())
        } else {
            Err(GattError::OperationNotPermitted(format!("write of descriptor {id}")))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    uuid: Uuid,
    properties: Properties,
    permissions: Permissions,
    descriptors: Vec<Descriptor>,
    value: Vec<u8>,
}

impl Characteristic {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn properties(&self) -> Properties {
        self.properties
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    pub fn find_descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }

    pub fn find_descriptor_mut(&mut self, uuid: &Uuid) -> Option<&mut Descriptor> {
        self.descriptors.iter_mut().find(|d| d.uuid == *uuid)
    }

    pub(crate) fn check_read(&self, id: &CharacteristicId) -> Result<(), GattError> {
        if self.properties.contains(Properties::READ) && self.permissions.allows_read() {
            Ok(())
        } else {
            Err(GattError::OperationNotPermitted(format!("read of {id}")))
        }
    }

    pub(crate) fn check_write(
        &self,
        id: &CharacteristicId,
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let required = match write_type {
            WriteType::Default => Properties::WRITE,
            WriteType::NoResponse => Properties::WRITE_WITHOUT_RESPONSE,
            WriteType::Signed => Properties::SIGNED_WRITE,
        };
        if self.properties.contains(required) && self.permissions.allows_write() {
            Ok(())
        } else {
            Err(GattError::OperationNotPermitted(format!(
                "{write_type:?} write of {id}"
            )))
        }
    }

    pub(crate) fn check_notify(&self, id: &CharacteristicId, confirm: bool) -> Result<(), GattError> {
        let required = if confirm {
            Properties::INDICATE
        } else {
            Properties::NOTIFY
        };
        if self.properties.contains(required) {
            Ok(())
        } else {
            let kind = if confirm { "indication" } else { "notification" };
            Err(GattError::OperationNotPermitted(format!("{kind} on {id}")))
        }
    }

    fn from_config(config: &CharacteristicConfig) -> Result<Self, GattError> {
        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(config.descriptors.len() + 1);
        for d in &config.descriptors {
            if !seen.insert(d.uuid) {
                return Err(GattError::InvalidConfiguration(format!(
                    "duplicate descriptor {} in characteristic {}",
                    d.uuid, config.uuid
                )));
            }
            descriptors.push(Descriptor {
                uuid: d.uuid,
                permissions: d.permissions,
                value: d.value.clone(),
            });
        }

        let pushes = config
            .properties
            .intersects(Properties::NOTIFY | Properties::INDICATE);
        if pushes && !seen.contains(&CLIENT_CHARACTERISTIC_CONFIGURATION) {
            descriptors.push(Descriptor {
                uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                permissions: Permissions::READ | Permissions::WRITE,
                value: vec![0x00, 0x00],
            });
        }

        Ok(Self {
            uuid: config.uuid,
            properties: config.properties,
            permissions: config.permissions,
            descriptors,
            value: config.initial_value.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    uuid: Uuid,
    service_type: ServiceType,
    characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }

    pub fn find_characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.uuid == *uuid)
    }

    fn from_config(config: &ServiceConfig) -> Result<Self, GattError> {
        let mut seen = HashSet::new();
        let mut characteristics = Vec::with_capacity(config.characteristics.len());
        for c in &config.characteristics {
            if !seen.insert(c.uuid) {
                return Err(GattError::InvalidConfiguration(format!(
                    "duplicate characteristic {} in service {}",
                    c.uuid, config.uuid
                )));
            }
            characteristics.push(Characteristic::from_config(c)?);
        }
        Ok(Self {
            uuid: config.uuid,
            service_type: config.service_type,
            characteristics,
        })
    }
}

/// The full attribute database of one server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Services {
    services: Vec<Service>,
}

impl Services {
    /// Build the attribute tree, rejecting duplicate identifiers within a parent.
    pub fn from_config(configs: &[ServiceConfig]) -> Result<Self, GattError> {
        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(configs.len());
        for config in configs {
            if !seen.insert(config.uuid) {
                return Err(GattError::InvalidConfiguration(format!(
                    "duplicate service {}",
                    config.uuid
                )));
            }
            services.push(Service::from_config(config)?);
        }
        Ok(Self { services })
    }

    /// Parse a JSON array of service configurations.
    pub fn from_json(json: &str) -> Result<Self, GattError> {
        let configs: Vec<ServiceConfig> =
            serde_json::from_str(json).map_err(|e| GattError::Config(e.to_string()))?;
        Self::from_config(&configs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn find_service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    pub fn find_service_mut(&mut self, uuid: &Uuid) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.uuid == *uuid)
    }

    pub fn characteristic(&self, id: &CharacteristicId) -> Option<&Characteristic> {
        self.find_service(&id.service)?
            .find_characteristic(&id.characteristic)
    }

    pub fn characteristic_mut(&mut self, id: &CharacteristicId) -> Option<&mut Characteristic> {
        self.find_service_mut(&id.service)?
            .find_characteristic_mut(&id.characteristic)
    }

    pub fn descriptor(&self, id: &DescriptorId) -> Option<&Descriptor> {
        self.characteristic(&id.characteristic)?
            .find_descriptor(&id.descriptor)
    }

    pub fn descriptor_mut(&mut self, id: &DescriptorId) -> Option<&mut Descriptor> {
        self.characteristic_mut(&id.characteristic)?
            .find_descriptor_mut(&id.descriptor)
    }

    /// Resolve a characteristic or fail with `AttributeNotFound`.
    pub(crate) fn resolve_characteristic(
        &self,
        id: &CharacteristicId,
    ) -> Result<&Characteristic, GattError> {
        self.characteristic(id)
            .ok_or_else(|| GattError::AttributeNotFound(id.to_string()))
    }

    /// Resolve a descriptor or fail with `AttributeNotFound`.
    pub(crate) fn resolve_descriptor(&self, id: &DescriptorId) -> Result<&Descriptor, GattError> {
        self.descriptor(id)
            .ok_or_else(|| GattError::AttributeNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::uuid::uuid16;

    fn battery_service() -> ServiceConfig {
        ServiceConfig::new(
            uuid16(0x180A),
            ServiceType::Primary,
            vec![
                CharacteristicConfig::new(
                    uuid16(0x2A19),
                    Properties::READ | Properties::NOTIFY,
                    Permissions::READ,
                )
                .with_initial_value(vec![0x64]),
                CharacteristicConfig::new(uuid16(0x2A00), Properties::WRITE, Permissions::WRITE),
            ],
        )
    }

    #[test]
    fn test_lookup_is_exact() {
        let services = Services::from_config(&[battery_service()]).unwrap();
        let service = services.find_service(&uuid16(0x180A)).unwrap();
        assert_eq!(service.service_type(), ServiceType::Primary);
        assert!(service.find_characteristic(&uuid16(0x2A19)).is_some());
        assert!(service.find_characteristic(&uuid16(0x2A1A)).is_none());
        assert!(services.find_service(&uuid16(0x180F)).is_none());
    }

    #[test]
    fn test_cccd_added_for_notifying_characteristics() {
        let services = Services::from_config(&[battery_service()]).unwrap();
        let id = CharacteristicId::new(uuid16(0x180A), uuid16(0x2A19));
        let level = services.characteristic(&id).unwrap();
        let cccd = level.find_descriptor(&CLIENT_CHARACTERISTIC_CONFIGURATION).unwrap();
        assert_eq!(cccd.value(), &[0x00, 0x00]);

        let name = CharacteristicId::new(uuid16(0x180A), uuid16(0x2A00));
        assert!(services.characteristic(&name).unwrap().descriptors().is_empty());
    }

    #[test]
    fn test_duplicate_characteristic_rejected() {
        let mut config = battery_service();
        config.characteristics.push(CharacteristicConfig::new(
            uuid16(0x2A19),
            Properties::READ,
            Permissions::READ,
        ));
        let err = Services::from_config(&[config]).unwrap_err();
        assert!(matches!(err, GattError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let err = Services::from_config(&[battery_service(), battery_service()]).unwrap_err();
        assert!(matches!(err, GattError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_set_value_is_local() {
        let mut services = Services::from_config(&[battery_service()]).unwrap();
        let snapshot = services.clone();
        let id = CharacteristicId::new(uuid16(0x180A), uuid16(0x2A19));
        services.characteristic_mut(&id).unwrap().set_value(vec![0x10]);
        assert_eq!(services.characteristic(&id).unwrap().value(), &[0x10]);
        assert_eq!(snapshot.characteristic(&id).unwrap().value(), &[0x64]);
    }

    #[test]
    fn test_access_checks() {
        let services = Services::from_config(&[battery_service()]).unwrap();
        let level_id = CharacteristicId::new(uuid16(0x180A), uuid16(0x2A19));
        let level = services.characteristic(&level_id).unwrap();
        assert!(level.check_read(&level_id).is_ok());
        assert!(level.check_notify(&level_id, false).is_ok());
        assert!(matches!(
            level.check_notify(&level_id, true),
            Err(GattError::OperationNotPermitted(_))
        ));
        assert!(matches!(
            level.check_write(&level_id, WriteType::Default),
            Err(GattError::OperationNotPermitted(_))
        ));

        let name_id = CharacteristicId::new(uuid16(0x180A), uuid16(0x2A00));
        let name = services.characteristic(&name_id).unwrap();
        assert!(name.check_write(&name_id, WriteType::Default).is_ok());
        assert!(name.check_write(&name_id, WriteType::NoResponse).is_err());
        assert!(name.check_read(&name_id).is_err());
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {
                "uuid": "0000180a-0000-1000-8000-00805f9b34fb",
                "service_type": "secondary",
                "characteristics": [
                    {
                        "uuid": "00002a19-0000-1000-8000-00805f9b34fb",
                        "properties": "READ | INDICATE",
                        "permissions": "READ_ENCRYPTED"
                    }
                ]
            }
        ]"#;
        let services = Services::from_json(json).unwrap();
        let service = services.find_service(&uuid16(0x180A)).unwrap();
        assert_eq!(service.service_type(), ServiceType::Secondary);
        let level = service.find_characteristic(&uuid16(0x2A19)).unwrap();
        assert_eq!(level.properties(), Properties::READ | Properties::INDICATE);
        assert!(level.value().is_empty());
        assert_eq!(level.descriptors().len(), 1);
    }
}
