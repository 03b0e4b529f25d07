/// Hardware abstraction for supported boards.
///
/// Each board module defines pin assignments and capabilities
/// selected at compile time via feature flags.

#[cfg(feature = "board-devkit")]
mod hw {
    pub const STANDBY_LED_PIN: Option<u8> = Some(2);
    pub const STANDBY_LED_ACTIVE_LOW: bool = false;
    pub const SCANNING_LED_PIN: Option<u8> = Some(15);
    pub const BOARD_NAME: &str = "esp32_devkit";
}

#[cfg(feature = "board-xiao")]
mod hw {
    // Single user LED
    pub const STANDBY_LED_PIN: Option<u8> = Some(21);
    pub const STANDBY_LED_ACTIVE_LOW: bool = true;
    pub const SCANNING_LED_PIN: Option<u8> = None;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(not(any(feature = "board-devkit", feature = "board-xiao")))]
mod hw {
    pub const STANDBY_LED_PIN: Option<u8> = None;
    pub const STANDBY_LED_ACTIVE_LOW: bool = false;
    pub const SCANNING_LED_PIN: Option<u8> = None;
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;
