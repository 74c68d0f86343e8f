//! The `[mock]` table of `sideload.toml`, describing the simulated
//! devices the CLI talks to.
//!
//! ```toml
//! [mock]
//! team = "Example"
//! revoke_certificates = 1
//!
//! [[mock.devices]]
//! udid = "00008030-001A2B3C4D5E6F70"
//! name = "Test iPhone"
//! kinds = ["usb", "network"]
//! pairing_prompts = 1
//! ```

use serde::{Deserialize, Serialize};
use sideload_core::device::ConnectionKind;

use crate::services::{MockProvisioner, sample_certificate};
use crate::transport::{MockDevice, MockTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Team name used to build bundle identifiers.
    pub team: String,
    /// Number of existing certificates that must be revoked first.
    pub revoke_certificates: usize,
    pub devices: Vec<MockDeviceConfig>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            team: "Sideload".to_string(),
            revoke_certificates: 0,
            devices: vec![MockDeviceConfig::default()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockDeviceConfig {
    pub udid: String,
    pub name: String,
    pub kinds: Vec<ConnectionKind>,
    pub pairing_prompts: usize,
    pub locked_prompts: usize,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            udid: "00008030-001A2B3C4D5E6F70".to_string(),
            name: "Mock iPhone".to_string(),
            kinds: vec![ConnectionKind::Usb],
            pairing_prompts: 0,
            locked_prompts: 0,
        }
    }
}

impl MockConfig {
    /// A transport with every configured device attached.
    pub fn transport(&self) -> MockTransport {
        let transport = MockTransport::new();
        for device in &self.devices {
            let mut kinds = device.kinds.iter();
            let Some(first) = kinds.next() else {
                continue;
            };
            let mock = MockDevice::new(&device.udid, &device.name)
                .with_pairing_prompts(device.pairing_prompts)
                .with_locked_prompts(device.locked_prompts);
            transport.add_device(mock, *first);
            for kind in kinds {
                transport.attach(&device.udid, *kind);
            }
        }
        transport
    }

    pub fn provisioner(&self) -> MockProvisioner {
        let revoke = (1..=self.revoke_certificates)
            .map(|n| sample_certificate(&format!("REVOKE{n:04}")))
            .collect();
        MockProvisioner::new(&self.team).revoking(revoke)
    }
}
