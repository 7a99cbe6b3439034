//! The host-process binary (§4.11/§6.3), replacing the teacher's
//! `uniffi-bindgen` bin target now that the UniFFI boundary is gone. Reads
//! a single argument: the path to a `MuteConfig` TOML file (defaulting to
//! `./mute.toml`), then runs the command loop over the five file
//! descriptors it names.

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mute.toml".to_string());

    if let Err(e) = mute_core::host::run(std::path::Path::new(&config_path)) {
        eprintln!("mute: {e}");
        std::process::exit(1);
    }
}
