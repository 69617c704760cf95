//! Human-readable labels for class-of-device values.

use crate::domain::models::DeviceClassInfo;

/// Major class used by HID devices (keyboards, mice, gamepads).
pub const MAJOR_PERIPHERAL: u8 = 5;

impl DeviceClassInfo {
    /// Short label for the device kind, refining the peripheral class by its
    /// minor bits.
    pub fn describe(&self) -> &'static str {
        match self.major {
            0 => "Misc",
            1 => "Computer",
            2 => "Phone",
            3 => "LAN AP",
            4 => "Audio/Video",
            MAJOR_PERIPHERAL => describe_peripheral(self.minor),
            6 => "Imaging",
            7 => "Wearable",
            8 => "Toy",
            9 => "Health",
            _ => "Unrecognized",
        }
    }

    pub fn is_peripheral(&self) -> bool {
        self.major == MAJOR_PERIPHERAL
    }
}

// Upper two minor bits say keyboard/pointer, lower four the sub-kind.
fn describe_peripheral(minor: u8) -> &'static str {
    match minor >> 4 {
        0 => match minor & 0x0f {
            1 => "Joystick",
            2 => "Gamepad",
            3 => "Remote",
            4 => "Sensor",
            5 => "Tablet",
            _ => "Peripheral",
        },
        1 => "Keyboard",
        2 => "Mouse",
        3 => "Mouse+KB",
        _ => "Peripheral",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(major: u8, minor: u8) -> DeviceClassInfo {
        DeviceClassInfo { major, minor }
    }

    #[test]
    fn test_gamepad_from_raw_bytes() {
        let info = DeviceClassInfo::from_class_of_device(&[0x08, 0x05, 0x00]);
        assert_eq!(info.describe(), "Gamepad");
        assert!(info.is_peripheral());
    }

    #[test]
    fn test_peripheral_sub_kinds() {
        assert_eq!(class(5, 0x01).describe(), "Joystick");
        assert_eq!(class(5, 0x00).describe(), "Peripheral");
        assert_eq!(class(5, 0x10).describe(), "Keyboard");
        assert_eq!(class(5, 0x20).describe(), "Mouse");
        assert_eq!(class(5, 0x33).describe(), "Mouse+KB");
    }

    #[test]
    fn test_major_labels() {
        assert_eq!(class(1, 0).describe(), "Computer");
        assert_eq!(class(2, 3).describe(), "Phone");
        assert_eq!(class(9, 0).describe(), "Health");
        assert_eq!(class(31, 0).describe(), "Unrecognized");
    }
}
