//! Fuzz target for introspection XML parsing.
//!
//! Services hand us arbitrary XML; parsing must fail cleanly, never panic.

#![no_main]

use dbus_controller::dbus::introspect;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(xml) = std::str::from_utf8(data) {
        if let Ok(parsed) = introspect::parse(xml, "/org/example") {
            for node in &parsed.nodes {
                assert!(node.starts_with('/'));
            }
        }
    }
});
