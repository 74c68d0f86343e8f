//! In-memory device backend and install collaborators.
//!
//! Used by the test suites and by the CLI, which has no real device stack
//! to talk to.

pub mod config;
pub mod delegate;
pub mod services;
pub mod transport;

pub use config::{MockConfig, MockDeviceConfig};
pub use delegate::{DelegateEvent, RecordingDelegate};
pub use services::{MockInstaller, MockProvisioner, MockSigner, sample_certificate};
pub use transport::{MockDevice, MockHandle, MockTransport, sample_pair_record};
