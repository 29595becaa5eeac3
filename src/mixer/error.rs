use crate::{channel, signer};

#[derive(Debug)]
pub enum Error {
    Channel(channel::Error),
    Signer(signer::Error),
    Engine(String),
    Wallet(String),
    TaskTransaction(String),
    Store(String),
}

impl From<channel::Error> for Error {
    fn from(value: channel::Error) -> Self {
        Self::Channel(value)
    }
}

impl From<signer::Error> for Error {
    fn from(value: signer::Error) -> Self {
        Self::Signer(value)
    }
}
