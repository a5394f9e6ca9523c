//! Device information reported in answer to a get-device-info request.

use std::collections::BTreeMap;

/// Parsed device information.
///
/// The device answers with comma-separated `Key: Value` pairs, for example
/// `Product: F7FeatherV2, Model: F7Micro, OSVersion: 1.9.0, SerialNo: 3A2B1C0D`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// All reported properties, keyed as sent by the device.
    pub properties: BTreeMap<String, String>,
    /// Unparsed text.
    pub raw: String,
}

impl DeviceInfo {
    /// Parse the device information text. Fragments without a `:` are kept
    /// only in [`DeviceInfo::raw`].
    pub fn from_text(text: &str) -> Self {
        let properties = text
            .split([',', '\n'])
            .filter_map(|pair| {
                let (key, value) = pair.split_once(':')?;
                let key = key.trim();
                (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
            })
            .collect();

        Self {
            properties,
            raw: text.to_string(),
        }
    }

    /// Look up a property, ignoring ASCII case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Product name.
    pub fn product(&self) -> Option<&str> {
        self.get("Product")
    }

    /// Board model.
    pub fn model(&self) -> Option<&str> {
        self.get("Model")
    }

    /// Operating system version.
    pub fn os_version(&self) -> Option<&str> {
        self.get("OSVersion")
    }

    /// Board serial number.
    pub fn serial_number(&self) -> Option<&str> {
        self.get("SerialNo")
    }

    /// Processor identifier.
    pub fn processor_id(&self) -> Option<&str> {
        self.get("ProcessorId")
    }

    /// Hardware revision.
    pub fn hardware_version(&self) -> Option<&str> {
        self.get("Hardware")
    }
}
