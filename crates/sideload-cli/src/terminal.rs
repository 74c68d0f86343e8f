//! Terminal front end for install runs and device selection.
//!
//! Uses dialoguer for prompts and console for styling. Prompts block, so
//! they run on the blocking pool.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};

use sideload_core::device::ClientDevice;
use sideload_core::install::{Certificate, InstallDelegate, InstallMessage};

/// One status line: `[Stage] 42%`, or just `[Stage]` when indeterminate.
pub fn stage_line(stage: &str, progress: Option<f64>) -> String {
    match progress {
        Some(p) => format!("[{}] {:.0}%", stage, (p * 100.0).clamp(0.0, 100.0)),
        None => format!("[{}]", stage),
    }
}

/// Human-readable device entry for lists and prompts.
pub fn device_label(device: &ClientDevice) -> String {
    format!("{} [{}]: {}", device.name, device.kind, device.udid)
}

/// Prints install status and asks the user when a decision is needed.
pub struct TerminalDelegate<W: Write + Send = io::Stdout> {
    writer: Mutex<W>,
    /// Answer yes to every prompt.
    assume_yes: bool,
}

impl TerminalDelegate<io::Stdout> {
    pub fn new(assume_yes: bool) -> Self {
        Self::with_writer(io::stdout(), assume_yes)
    }
}

impl<W: Write + Send> TerminalDelegate<W> {
    /// Create a delegate with a custom writer (for testing).
    pub fn with_writer(writer: W, assume_yes: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            assume_yes,
        }
    }

    fn write_line(&self, line: impl std::fmt::Display) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // Nothing sensible to do if the terminal went away
        let _ = writeln!(writer, "{}", line);
        let _ = writer.flush();
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> InstallDelegate for TerminalDelegate<W> {
    fn set_presented_message(&self, message: Option<InstallMessage>) {
        if let Some(message) = message {
            self.write_line(format!("  {} {}", style("!").yellow().bold(), message.text()));
        }
    }

    fn on_stage_progress(&self, stage: &str, progress: Option<f64>) {
        self.write_line(stage_line(stage, progress));
    }

    async fn confirm_revocation(&self, certificates: &[Certificate]) -> bool {
        self.write_line(style("  Existing certificates must be revoked:").bold());
        for certificate in certificates {
            self.write_line(format!(
                "    {} {} (expires {})",
                style(&certificate.serial_number).cyan(),
                certificate.name,
                certificate.expires.format("%Y-%m-%d")
            ));
        }
        if self.assume_yes {
            return true;
        }

        let prompt = tokio::task::spawn_blocking(|| {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Revoke these certificates and continue?")
                .default(false)
                .interact()
        })
        .await;
        matches!(prompt, Ok(Ok(true)))
    }
}

/// Pick the device to install to. A single device (or `--yes`) is taken
/// without asking.
pub async fn choose_device(devices: Vec<ClientDevice>, assume_yes: bool) -> Result<ClientDevice> {
    if devices.len() == 1 || assume_yes {
        return devices
            .into_iter()
            .next()
            .context("No devices found");
    }

    let items: Vec<String> = devices.iter().map(device_label).collect();
    let selection = tokio::task::spawn_blocking(move || {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select device")
            .items(&items)
            .default(0)
            .interact()
    })
    .await
    .context("Device prompt failed")??;

    devices
        .into_iter()
        .nth(selection)
        .context("Selected device is gone")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideload_core::device::ConnectionKind;

    fn device(udid: &str, name: &str) -> ClientDevice {
        ClientDevice {
            udid: udid.to_string(),
            kind: ConnectionKind::Usb,
            name: name.to_string(),
        }
    }

    #[test]
    fn stage_line_shows_whole_percentages() {
        assert_eq!(stage_line("Uploading", Some(0.254)), "[Uploading] 25%");
        assert_eq!(stage_line("Packaging", Some(1.0)), "[Packaging] 100%");
        assert_eq!(stage_line("Unpacking app", None), "[Unpacking app]");
    }

    #[test]
    fn device_label_names_the_link() {
        assert_eq!(device_label(&device("A", "iPhone")), "iPhone [usb]: A");
    }

    #[test]
    fn delegate_writes_status_and_messages() {
        let delegate = TerminalDelegate::with_writer(Vec::new(), true);
        delegate.on_stage_progress("Signing", Some(0.5));
        delegate.set_presented_message(Some(InstallMessage::UnlockDevice));
        delegate.set_presented_message(None);

        let output = String::from_utf8(delegate.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[Signing] 50%");
        assert!(lines[1].contains("Please unlock your device"));
    }

    #[tokio::test]
    async fn assume_yes_accepts_revocation() {
        let delegate = TerminalDelegate::with_writer(Vec::new(), true);
        let certificate = Certificate {
            serial_number: "ABC".into(),
            name: "Apple Development".into(),
            expires: chrono::Utc::now(),
        };
        assert!(delegate.confirm_revocation(&[certificate]).await);
    }

    #[tokio::test]
    async fn single_device_is_chosen_without_prompt() {
        let chosen = choose_device(vec![device("A", "iPhone")], false).await.unwrap();
        assert_eq!(chosen.udid, "A");
    }

    #[tokio::test]
    async fn assume_yes_takes_the_first_device() {
        let chosen = choose_device(vec![device("A", "iPhone"), device("B", "iPad")], true)
            .await
            .unwrap();
        assert_eq!(chosen.udid, "A");
    }

    #[tokio::test]
    async fn no_devices_is_an_error() {
        assert!(choose_device(Vec::new(), true).await.is_err());
    }
}
