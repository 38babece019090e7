//! Button Peripheral Protocol
//!
//! GATT constants and the decoding of characteristic updates into events.

use crate::domain::models::{LinkEvent, TextDecoding};
use tracing::trace;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Value written to the CCCD to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Flag byte value meaning "pressed"
pub const BUTTON_PRESSED: u8 = 0x01;

/// A decoded notification
///
/// # Payload
///
/// ```text
/// [0]    : state flag, 0x01 = pressed, anything else = released
/// [0..]  : UTF-8 text (lossy), with or without the flag byte
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonNotification {
    pub pressed: bool,
    pub text: String,
}

impl ButtonNotification {
    /// The two events this notification produces, state first
    pub fn into_events(self) -> [LinkEvent; 2] {
        [
            LinkEvent::ButtonStateChanged(self.pressed),
            LinkEvent::ButtonStateString(self.text),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationDecoder {
    text_decoding: TextDecoding,
}

impl NotificationDecoder {
    pub fn new(text_decoding: TextDecoding) -> Self {
        Self { text_decoding }
    }

    /// Decode a raw payload. Empty payloads carry nothing and yield `None`.
    pub fn decode(&self, payload: &[u8]) -> Option<ButtonNotification> {
        let (&flag, rest) = payload.split_first()?;

        #[cfg(debug_assertions)]
        trace!("Raw notification: {:02X?}", payload);

        let text_bytes = match self.text_decoding {
            TextDecoding::FullBuffer => payload,
            TextDecoding::AfterFlag => rest,
        };

        Some(ButtonNotification {
            pressed: flag == BUTTON_PRESSED,
            text: String::from_utf8_lossy(text_bytes).into_owned(),
        })
    }
}

/// Parse a `AA:BB:CC:DD:EE:FF` address into its 48-bit value
pub fn parse_address(address: &str) -> Option<u64> {
    let mut value = 0u64;
    let mut octets = 0;
    for part in address.split(':') {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        value = (value << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
        octets += 1;
    }
    (octets == 6).then_some(value)
}

pub fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
