use std::fmt;
use std::str::FromStr;

use bitcoin::{
    address::AddressType, opcodes::all::OP_CHECKMULTISIG, script::Instruction, Address,
    Network as BitcoinNetwork, PublicKey, Script,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// JavaScriptのNumber.MAX_SAFE_INTEGERと同じ上限。UTXO JSONの互換性のため。
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// 正規化済みUTXO。JSONのキー順は address, txid, vout, scriptPubKey, satoshis で固定。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Utxo {
    pub address: String,
    pub txid: String,
    pub vout: u32,
    pub script_pub_key: String,
    pub satoshis: u64,
}

/// 出力指定。最後の要素はおつり用で、金額を持たない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    pub address: String,
    pub satoshis: Option<u64>,
}

impl OutputRequest {
    pub fn new(address: impl Into<String>, satoshis: Option<u64>) -> Self {
        Self { address: address.into(), satoshis }
    }
}

/// 入力金額。前の出力が分からない入力は Unknown になり、0 として扱わない。
/// マップに存在しないアドレスは「なし」を表す。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputAmount {
    Known(u64),
    Unknown,
}

impl InputAmount {
    pub fn combine(self, other: InputAmount) -> InputAmount {
        match (self, other) {
            (InputAmount::Known(a), InputAmount::Known(b)) => InputAmount::Known(a.saturating_add(b)),
            _ => InputAmount::Unknown,
        }
    }
}

impl fmt::Display for InputAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputAmount::Known(sats) => write!(f, "{}", sats),
            InputAmount::Unknown => f.write_str("Unknown amount"),
        }
    }
}

/// ロックスクリプトのテンプレート
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptType {
    P2PKH,
    P2SH,
    P2PK,
    Multisig,
    NullData,
}

impl ScriptType {
    /// 標準テンプレートに一致しない場合は None
    pub fn classify(script: &Script) -> Option<Self> {
        if script.is_p2pkh() {
            Some(ScriptType::P2PKH)
        } else if script.is_p2sh() {
            Some(ScriptType::P2SH)
        } else if script.is_p2pk() {
            Some(ScriptType::P2PK)
        } else if script.is_op_return() {
            Some(ScriptType::NullData)
        } else if is_multisig_out(script) {
            Some(ScriptType::Multisig)
        } else {
            None
        }
    }

    /// 署名可能なスクリプトのみ受け付ける
    pub fn spendable(script: &Script) -> Result<Self, AppError> {
        match Self::classify(script) {
            Some(ScriptType::P2PKH) => Ok(ScriptType::P2PKH),
            _ => Err(AppError::UnknownScriptType { script_hex: script.to_hex_string() }),
        }
    }
}

/// アンロックスクリプトのテンプレート
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputScriptType {
    PubkeyHashIn,
    PubkeyIn,
    MultisigIn,
    ScriptHashIn,
}

impl InputScriptType {
    pub fn classify(script: &Script) -> Option<Self> {
        let pushes = push_only(script)?;
        match pushes.as_slice() {
            [sig, key] if is_signature(sig) && is_public_key(key) => Some(InputScriptType::PubkeyHashIn),
            [sig] if is_signature(sig) => Some(InputScriptType::PubkeyIn),
            [first, sigs @ ..] if first.is_empty() && !sigs.is_empty() && sigs.iter().all(|s| is_signature(s)) => {
                Some(InputScriptType::MultisigIn)
            }
            [_, .., redeem] => match ScriptType::classify(Script::from_bytes(redeem)) {
                Some(ScriptType::NullData) | None => None,
                Some(_) => Some(InputScriptType::ScriptHashIn),
            },
            _ => None,
        }
    }
}

/// ロックスクリプトからアドレスを導出する。P2PKは公開鍵のP2PKHアドレスとして扱う。
pub fn address_from_script(script: &Script, network: BitcoinNetwork) -> Option<Address> {
    match ScriptType::classify(script)? {
        ScriptType::P2PKH | ScriptType::P2SH => Address::from_script(script, network).ok(),
        ScriptType::P2PK => {
            let key = match script.instructions().next()? {
                Ok(Instruction::PushBytes(bytes)) => PublicKey::from_slice(bytes.as_bytes()).ok()?,
                _ => return None,
            };
            Some(Address::p2pkh(key.pubkey_hash(), network))
        }
        ScriptType::Multisig | ScriptType::NullData => None,
    }
}

/// アンロックスクリプトからアドレスを導出する (P2PKH入力とP2SH入力のみ)
pub fn address_from_input_script(script: &Script, network: BitcoinNetwork) -> Option<Address> {
    let pushes = push_only(script)?;
    match InputScriptType::classify(script)? {
        InputScriptType::PubkeyHashIn => {
            let key = PublicKey::from_slice(pushes.last()?).ok()?;
            Some(Address::p2pkh(key.pubkey_hash(), network))
        }
        InputScriptType::ScriptHashIn => Address::p2sh(Script::from_bytes(pushes.last()?), network).ok(),
        InputScriptType::PubkeyIn | InputScriptType::MultisigIn => None,
    }
}

/// BSVで使えるアドレス (P2PKH / P2SH) のみ受け付ける
pub fn parse_address(address_str: &str, network: BitcoinNetwork) -> Result<Address, AppError> {
    let address = Address::from_str(address_str)
        .and_then(|addr| addr.require_network(network))
        .map_err(|e| AppError::InvalidAddress {
            address: address_str.to_string(),
            reason: e.to_string(),
        })?;
    match address.address_type() {
        Some(AddressType::P2pkh) | Some(AddressType::P2sh) => Ok(address),
        other => Err(AppError::InvalidAddress {
            address: address_str.to_string(),
            reason: format!("サポートされないアドレスタイプ: {:?}", other),
        }),
    }
}

fn push_only(script: &Script) -> Option<Vec<Vec<u8>>> {
    if script.is_empty() {
        return None;
    }
    script
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

fn is_signature(bytes: &[u8]) -> bool {
    // DER署名 + sighashタイプ1バイト
    (9..=73).contains(&bytes.len()) && bytes[0] == 0x30
}

fn is_public_key(bytes: &[u8]) -> bool {
    match bytes.len() {
        33 => bytes[0] == 0x02 || bytes[0] == 0x03,
        65 => bytes[0] == 0x04,
        _ => false,
    }
}

fn pushnum(ins: &Instruction) -> Option<usize> {
    match ins {
        Instruction::Op(op) if (0x51..=0x60).contains(&op.to_u8()) => Some((op.to_u8() - 0x50) as usize),
        _ => None,
    }
}

fn is_multisig_out(script: &Script) -> bool {
    let Ok(instructions) = script.instructions().collect::<Result<Vec<_>, _>>() else {
        return false;
    };
    let [first, keys @ .., n, last] = instructions.as_slice() else {
        return false;
    };
    let (Some(m), Some(n)) = (pushnum(first), pushnum(n)) else {
        return false;
    };
    matches!(last, Instruction::Op(op) if *op == OP_CHECKMULTISIG)
        && m <= n
        && keys.len() == n
        && keys.iter().all(|k| matches!(k, Instruction::PushBytes(b) if is_public_key(b.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    const GENESIS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    #[test]
    fn classifies_p2pkh_and_null_data() {
        let address = parse_address(GENESIS, BitcoinNetwork::Bitcoin).unwrap();
        assert_eq!(ScriptType::classify(&address.script_pubkey()), Some(ScriptType::P2PKH));

        let data = ScriptBuf::from_bytes(vec![0x6a, 0x03, 0x01, 0x02, 0x03]);
        assert_eq!(ScriptType::classify(&data), Some(ScriptType::NullData));
        assert_eq!(address_from_script(&data, BitcoinNetwork::Bitcoin), None);
    }

    #[test]
    fn empty_and_garbage_scripts_are_non_standard() {
        assert_eq!(ScriptType::classify(&ScriptBuf::new()), None);
        assert_eq!(InputScriptType::classify(&ScriptBuf::new()), None);
        assert_eq!(ScriptType::classify(&ScriptBuf::from_bytes(vec![0x51, 0x52])), None);
    }

    #[test]
    fn address_round_trips_through_script() {
        let address = parse_address(GENESIS, BitcoinNetwork::Bitcoin).unwrap();
        let derived = address_from_script(&address.script_pubkey(), BitcoinNetwork::Bitcoin).unwrap();
        assert_eq!(derived.to_string(), GENESIS);
    }

    #[test]
    fn rejects_segwit_and_wrong_network_addresses() {
        assert!(parse_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", BitcoinNetwork::Bitcoin).is_err());
        assert!(parse_address(GENESIS, BitcoinNetwork::Testnet).is_err());
        assert!(parse_address("not an address", BitcoinNetwork::Bitcoin).is_err());
    }

    #[test]
    fn unknown_input_amount_absorbs_known() {
        let sum = InputAmount::Known(10).combine(InputAmount::Known(5));
        assert_eq!(sum, InputAmount::Known(15));
        assert_eq!(sum.combine(InputAmount::Unknown), InputAmount::Unknown);
        assert_eq!(InputAmount::Unknown.to_string(), "Unknown amount");
    }
}
