//! Fuzz target for D-Bus signature parsing and argument marshaling.

#![no_main]

use arbitrary::Arbitrary;
use dbus_controller::dbus::marshal;
use dbus_controller::dbus::TypeSpec;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    signature: String,
    /// JSON text for the argument list
    args: String,
}

fuzz_target!(|input: Input| {
    let Ok(types) = TypeSpec::parse_list(&input.signature) else {
        return;
    };

    // A parsed signature must print back to something that parses the same.
    let printed: String = types.iter().map(|t| t.to_string()).collect();
    assert_eq!(TypeSpec::parse_list(&printed).ok(), Some(types.clone()));

    if let Ok(serde_json::Value::Array(args)) = serde_json::from_str(&input.args) {
        if let Ok(values) = marshal::to_values(&args, Some(&types)) {
            for value in &values {
                let _ = marshal::to_json(value);
            }
        }
    }
});
