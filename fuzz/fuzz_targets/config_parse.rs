//! Fuzz target for TOML config parsing.
//!
//! Ensures that malformed TOML input doesn't cause panics, and that
//! whatever parses can also be validated.

#![no_main]

use dbus_controller::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = Config::parse(s) {
            let _ = config.validate();
        }
    }
});
