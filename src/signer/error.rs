use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    PasswordMissing(String),
    KeyMaterialMissing,
    Decrypt(String),
    KeyParse(String),
    MissingOutput(String),
    AddressUnknown(String),
    UnsupportedAddressType,
    PocketMismatch(u32, u32),
    PocketMissing,
    Derivation(String),
    SignerRefused,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::PasswordMissing(key) => {
                write!(f, "No live password in the safe for {}", key)
            }
            Error::KeyMaterialMissing => {
                write!(f, "The key source carries no encrypted key material")
            }
            Error::Decrypt(e) => write!(f, "Fail to decrypt key material: {}", e),
            Error::KeyParse(e) => write!(f, "Fail to parse decrypted keys: {}", e),
            Error::MissingOutput(outpoint) => {
                write!(f, "Input spends an output unknown to the wallet: {}", outpoint)
            }
            Error::AddressUnknown(outpoint) => {
                write!(f, "No wallet address for the output at {}", outpoint)
            }
            Error::UnsupportedAddressType => {
                write!(f, "Only keyhash addresses can be signed for a mix")
            }
            Error::PocketMismatch(got, want) => write!(
                f,
                "Input derives from pocket {} but the session mixes pocket {}",
                got, want
            ),
            Error::PocketMissing => write!(f, "The session references no known pocket"),
            Error::Derivation(e) => write!(f, "Key derivation failed: {}", e),
            Error::SignerRefused => write!(f, "The wallet refused to sign the inputs"),
        }
    }
}
