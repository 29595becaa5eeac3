use hex_conservative::DisplayHex;
use miniscript::bitcoin::hashes::{sha256, Hash, HashEngine};
use rand::{rngs::OsRng, RngCore};
use std::time::SystemTime;

/// return the current timestamp
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("unix timestamp must not fail")
        .as_secs()
}

/// Generate a fresh session id: the sha256 digest of a 32 byte
/// scalar drawn from the OS entropy source, as lowercase hex.
pub fn random_id() -> String {
    let mut scalar = [0u8; 32];
    OsRng.fill_bytes(&mut scalar);
    let mut engine = sha256::Hash::engine();
    engine.input(&scalar);
    sha256::Hash::from_engine(engine)
        .to_byte_array()
        .to_lower_hex_string()
}
