fn main() {
    // embuild wiring only applies to on-device builds.
    if std::env::var("CARGO_FEATURE_ESP32").is_ok() {
        embuild::espidf::sysenv::output();
    }
}
