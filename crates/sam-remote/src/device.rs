// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared device handle.
//!
//! On the server the device is the local library being shared; on the client
//! it is the pseudo-device standing in for the remote library.

use crate::protocol::FamilySetName;
use parking_lot::Mutex;

/// Device status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Device is reachable.
    pub present: bool,
    /// Device accepts requests.
    pub ready: bool,
    /// Live remote connections (server role).
    pub open_count: u32,
    /// Session port currently in use (client role).
    pub session_port: Option<u16>,
}

/// A remote-sharing device.
#[derive(Debug)]
pub struct Device {
    name: String,
    family_set: FamilySetName,
    eq: u16,
    server_host: Option<String>,
    status: Mutex<DeviceStatus>,
}

impl Device {
    /// Server-side device.
    pub fn server(name: impl Into<String>, family_set: FamilySetName, eq: u16) -> Self {
        Self {
            name: name.into(),
            family_set,
            eq,
            server_host: None,
            status: Mutex::new(DeviceStatus::default()),
        }
    }

    /// Client-side pseudo-device pointing at `server_host`.
    pub fn client(
        name: impl Into<String>,
        family_set: FamilySetName,
        eq: u16,
        server_host: impl Into<String>,
    ) -> Self {
        Self {
            server_host: Some(server_host.into()),
            ..Self::server(name, family_set, eq)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family_set(&self) -> &FamilySetName {
        &self.family_set
    }

    /// Equipment ordinal.
    pub fn eq(&self) -> u16 {
        self.eq
    }

    pub fn server_host(&self) -> Option<&str> {
        self.server_host.as_deref()
    }

    /// Copy of the status register.
    pub fn status(&self) -> DeviceStatus {
        *self.status.lock()
    }

    /// Set or clear `present` and `ready` together.
    pub fn set_online(&self, online: bool) {
        let mut status = self.status.lock();
        status.present = online;
        status.ready = online;
        if !online {
            status.session_port = None;
        }
    }

    pub fn set_session_port(&self, port: Option<u16>) {
        self.status.lock().session_port = port;
    }

    /// Count one more live connection and return the new total.
    pub fn open_connection(&self) -> u32 {
        let mut status = self.status.lock();
        status.open_count += 1;
        status.open_count
    }

    /// Count one less live connection and return the new total.
    pub fn close_connection(&self) -> u32 {
        let mut status = self.status.lock();
        status.open_count = status.open_count.saturating_sub(1);
        status.open_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FamilySetName {
        FamilySetName::new("lib20").unwrap()
    }

    #[test]
    fn test_open_close_counts() {
        let device = Device::server("rs20", fs(), 20);
        assert_eq!(device.open_connection(), 1);
        assert_eq!(device.open_connection(), 2);
        assert_eq!(device.close_connection(), 1);
        assert_eq!(device.close_connection(), 0);
        assert_eq!(device.close_connection(), 0);
    }

    #[test]
    fn test_online_flags() {
        let device = Device::client("sc30", fs(), 30, "tapehost");
        assert_eq!(device.server_host(), Some("tapehost"));

        device.set_online(true);
        device.set_session_port(Some(7120));
        let status = device.status();
        assert!(status.present && status.ready);
        assert_eq!(status.session_port, Some(7120));

        device.set_online(false);
        assert_eq!(device.status(), DeviceStatus::default());
    }
}
