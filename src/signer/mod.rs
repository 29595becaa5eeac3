mod error;
pub use error::Error;

use std::str::FromStr;

use miniscript::bitcoin::{bip32::Xpriv, PrivateKey, Transaction};

use crate::{
    interface::{
        pocket_safe_key, AddressKind, Pocket, PocketKeys, Safe, Task, Wallet, SAFE_MIXER,
        SAFE_SEND,
    },
    session::Session,
};

/// Gather the private keys for `session` under a live safe password and
/// delegate input signing to the wallet. Returns the joint transaction with
/// our signatures installed.
///
/// The key source follows the role: a session carrying a task signs with
/// the host keys persisted on the task, any other session derives guest
/// keys from its pocket's HD roots.
///
/// # Errors
///
/// Any failure here is fatal to the session: missing password, missing or
/// foreign prior output, non-keyhash address, pocket mismatch, derivation
/// failure, or a wallet refusal.
pub fn request_sign_inputs<W, S>(
    wallet: &W,
    safe: &S,
    pockets: &mut [Pocket],
    session: &Session,
) -> Result<Transaction, Error>
where
    W: Wallet,
    S: Safe,
{
    let keys = match session.task.as_ref() {
        Some(task) => host_keys(wallet, safe, task, &session.my_tx)?,
        None => guest_keys(wallet, safe, pockets, session)?,
    };
    let mut tx = session.tx.clone();
    if !wallet.sign_my_inputs(&session.my_tx.input, &mut tx, &keys) {
        return Err(Error::SignerRefused);
    }
    Ok(tx)
}

/// Host keys travel with the task as a JSON array of WIF strings, encrypted
/// under the send password stored for the prepared transaction's hash.
fn host_keys<W, S>(
    wallet: &W,
    safe: &S,
    task: &Task,
    my_tx: &Transaction,
) -> Result<Vec<PrivateKey>, Error>
where
    W: Wallet,
    S: Safe,
{
    let blob = task.priv_keys.as_ref().ok_or(Error::KeyMaterialMissing)?;
    let tx_hash = my_tx.compute_txid().to_string();
    let password = safe
        .get(SAFE_SEND, &tx_hash)
        .ok_or(Error::PasswordMissing(tx_hash))?;
    let json = wallet.decrypt(blob, &password).map_err(Error::Decrypt)?;
    let wifs: Vec<String> =
        serde_json::from_str(&json).map_err(|e| Error::KeyParse(e.to_string()))?;
    wifs.iter()
        .map(|wif| PrivateKey::from_wif(wif).map_err(|e| Error::KeyParse(e.to_string())))
        .collect()
}

/// Guest keys are derived per input from the pocket's HD roots: resolve the
/// prior output, check it is one of our keyhash addresses in the session's
/// pocket, then derive along the main or change branch by the parity of the
/// path's leading component.
fn guest_keys<W, S>(
    wallet: &W,
    safe: &S,
    pockets: &mut [Pocket],
    session: &Session,
) -> Result<Vec<PrivateKey>, Error>
where
    W: Wallet,
    S: Safe,
{
    let index = session.pocket.ok_or(Error::PocketMissing)?;
    let pocket = pockets
        .iter_mut()
        .find(|p| p.index == index)
        .ok_or(Error::PocketMissing)?;
    let roots = pocket_keys(wallet, safe, pocket)?;

    let mut keys = Vec::with_capacity(session.my_tx.input.len());
    for input in &session.my_tx.input {
        let outpoint = format!(
            "{}:{}",
            input.previous_output.txid, input.previous_output.vout
        );
        let output = wallet
            .output(&outpoint)
            .ok_or_else(|| Error::MissingOutput(outpoint.clone()))?;
        let address = output.address.ok_or_else(|| Error::AddressUnknown(outpoint.clone()))?;
        let record = wallet
            .wallet_address(&address)
            .ok_or(Error::AddressUnknown(outpoint))?;
        if record.kind != AddressKind::KeyHash {
            return Err(Error::UnsupportedAddressType);
        }
        let branch = *record
            .path
            .first()
            .ok_or_else(|| Error::Derivation("empty derivation path".into()))?;
        if branch / 2 != index {
            return Err(Error::PocketMismatch(branch / 2, index));
        }
        let root = if branch % 2 == 0 {
            &roots.master
        } else {
            &roots.change
        };
        let key = wallet
            .derive_hd_private_key(&record.path[1..], root)
            .map_err(Error::Derivation)?;
        keys.push(key);
    }
    Ok(keys)
}

/// Decrypt and cache the pocket roots under the pocket's mixer password.
fn pocket_keys<W, S>(wallet: &W, safe: &S, pocket: &mut Pocket) -> Result<PocketKeys, Error>
where
    W: Wallet,
    S: Safe,
{
    if let Some(keys) = &pocket.cached_keys {
        return Ok(keys.clone());
    }
    let key = pocket_safe_key(pocket.index);
    let password = safe
        .get(SAFE_MIXER, &key)
        .ok_or(Error::PasswordMissing(key))?;
    let master_blob = pocket.master_key.as_ref().ok_or(Error::KeyMaterialMissing)?;
    let change_blob = pocket.change_key.as_ref().ok_or(Error::KeyMaterialMissing)?;
    let master = Xpriv::from_str(&wallet.decrypt(master_blob, &password).map_err(Error::Decrypt)?)
        .map_err(|e| Error::KeyParse(e.to_string()))?;
    let change = Xpriv::from_str(&wallet.decrypt(change_blob, &password).map_err(Error::Decrypt)?)
        .map_err(|e| Error::KeyParse(e.to_string()))?;
    let keys = PocketKeys { master, change };
    pocket.cached_keys = Some(keys.clone());
    Ok(keys)
}
