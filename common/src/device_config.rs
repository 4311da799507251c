//! Persisted device configuration record and its store.
//!
//! The record keeps the fixed-width EEPROM layout: each field is preceded by a
//! presence flag byte and padded with NUL. Erased or half-written flash is not
//! zeroed, so a field only counts when its flag equals [`FLAG_SET`].

use log::{info, warn};

use crate::hal::{ConfigStorage, HalResult};

pub const DEFAULT_HOSTNAME: &str = "lolin-ir-blaster";

pub const REGION_SIZE: usize = 256;
pub const HOSTNAME_LEN: usize = 32;
pub const SSID_LEN: usize = 32;
pub const PASSWORD_LEN: usize = 64;

pub const FLAG_SET: u8 = 0x09;
pub const FLAG_NOT_SET: u8 = 0x00;

const HOSTNAME_FLAG_AT: usize = 0;
const HOSTNAME_AT: usize = HOSTNAME_FLAG_AT + 1;
const SSID_FLAG_AT: usize = HOSTNAME_AT + HOSTNAME_LEN;
const SSID_AT: usize = SSID_FLAG_AT + 1;
const PASSWORD_FLAG_AT: usize = SSID_AT + SSID_LEN;
const PASSWORD_AT: usize = PASSWORD_FLAG_AT + 1;

pub const RECORD_LEN: usize = PASSWORD_AT + PASSWORD_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceConfig {
    hostname: Option<String>,
    ssid: Option<String>,
    ssid_password: Option<String>,
}

impl DeviceConfig {
    /// Builds a config from user input. Empty input clears the field, longer
    /// input is truncated to the field width.
    pub fn new(hostname: &str, ssid: &str, ssid_password: &str) -> Self {
        Self {
            hostname: field_value(hostname, HOSTNAME_LEN),
            ssid: field_value(ssid, SSID_LEN),
            ssid_password: field_value(ssid_password, PASSWORD_LEN),
        }
    }

    /// Effective hostname, falling back to the default when none is stored.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME)
    }

    pub fn stored_hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn ssid(&self) -> Option<&str> {
        self.ssid.as_deref()
    }

    pub fn ssid_password(&self) -> Option<&str> {
        self.ssid_password.as_deref()
    }

    pub fn with_credentials(&self, ssid: &str, ssid_password: &str) -> Self {
        Self {
            hostname: self.hostname.clone(),
            ssid: field_value(ssid, SSID_LEN),
            ssid_password: field_value(ssid_password, PASSWORD_LEN),
        }
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut record = [0_u8; RECORD_LEN];

        // An unset hostname still carries the default text, only the flag differs.
        let hostname = self.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME);
        record[HOSTNAME_FLAG_AT] = flag_for(&self.hostname);
        write_field(&mut record[HOSTNAME_AT..SSID_FLAG_AT], hostname);

        record[SSID_FLAG_AT] = flag_for(&self.ssid);
        write_field(
            &mut record[SSID_AT..PASSWORD_FLAG_AT],
            self.ssid.as_deref().unwrap_or_default(),
        );

        record[PASSWORD_FLAG_AT] = flag_for(&self.ssid_password);
        write_field(
            &mut record[PASSWORD_AT..RECORD_LEN],
            self.ssid_password.as_deref().unwrap_or_default(),
        );

        record
    }

    /// Decodes a record. Short input is treated as erased memory.
    pub fn decode(record: &[u8]) -> Self {
        if record.len() < RECORD_LEN {
            return Self::default();
        }

        Self {
            hostname: read_field(
                record[HOSTNAME_FLAG_AT],
                &record[HOSTNAME_AT..SSID_FLAG_AT],
            ),
            ssid: read_field(record[SSID_FLAG_AT], &record[SSID_AT..PASSWORD_FLAG_AT]),
            ssid_password: read_field(
                record[PASSWORD_FLAG_AT],
                &record[PASSWORD_AT..RECORD_LEN],
            ),
        }
    }
}

fn flag_for(value: &Option<String>) -> u8 {
    if value.is_some() {
        FLAG_SET
    } else {
        FLAG_NOT_SET
    }
}

/// Storage ends a field at its first NUL, so the in-memory value does too.
fn field_value(input: &str, max_len: usize) -> Option<String> {
    let input = input.split('\0').next().unwrap_or_default();
    if input.is_empty() {
        return None;
    }

    let mut end = input.len().min(max_len);
    while !input.is_char_boundary(end) {
        end -= 1;
    }

    Some(input[..end].to_string()).filter(|value| !value.is_empty())
}

fn write_field(slot: &mut [u8], value: &str) {
    slot.fill(0);
    let bytes = value.as_bytes();
    let len = bytes.len().min(slot.len());
    slot[..len].copy_from_slice(&bytes[..len]);
}

fn read_field(flag: u8, slot: &[u8]) -> Option<String> {
    if flag != FLAG_SET {
        return None;
    }

    let end = slot.iter().position(|byte| *byte == 0).unwrap_or(slot.len());
    let text = String::from_utf8_lossy(&slot[..end]).into_owned();
    Some(text).filter(|value| !value.is_empty())
}

pub fn load(storage: &mut impl ConfigStorage) -> HalResult<DeviceConfig> {
    let mut region = [0_u8; REGION_SIZE];
    storage.read_region(&mut region)?;
    let config = DeviceConfig::decode(&region);

    info!("        region size: [{REGION_SIZE}]");
    info!("        config size: [{RECORD_LEN}]");
    info!(
        "        config host: [{}] stored: {}",
        config.hostname(),
        config.stored_hostname().is_some()
    );
    info!(
        "        config ssid: [{}] stored: {}",
        config.ssid().unwrap_or_default(),
        config.ssid().is_some()
    );
    info!(
        "    config ssid pwd: stored: {}",
        config.ssid_password().is_some()
    );

    Ok(config)
}

/// Loads the record, treating an unreadable region as an empty one.
pub fn load_or_default(storage: &mut impl ConfigStorage) -> DeviceConfig {
    load(storage).unwrap_or_else(|err| {
        warn!("failed to read config region, using defaults: {err}");
        DeviceConfig::default()
    })
}

pub fn save(storage: &mut impl ConfigStorage, config: &DeviceConfig) -> HalResult<()> {
    let mut region = [0_u8; REGION_SIZE];
    region[..RECORD_LEN].copy_from_slice(&config.encode());
    storage.write_region(&region)
}

pub fn wipe(storage: &mut impl ConfigStorage) -> HalResult<DeviceConfig> {
    let config = DeviceConfig::default();
    save(storage, &config)?;
    info!("Config wiped");
    Ok(config)
}
