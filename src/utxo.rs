use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use bitcoin::{Network as BitcoinNetwork, ScriptBuf, Txid};
use serde_json::{Map, Value};

use crate::{
    config::split_list,
    error::AppError,
    transaction::{to_tab_indented_json, TxDraft},
    types::{address_from_script, parse_address, ScriptType, Utxo, MAX_SAFE_INTEGER},
};

const NUM_EXPECTED_PROPERTIES: usize = 5;
const SATOSHIS_PER_BSV: f64 = 100_000_000.0;

const TXID_KEYS: [&str; 4] = ["txid", "txId", "prevTxId", "tx_hash"];
const VOUT_KEYS: [&str; 3] = ["vout", "outputIndex", "tx_pos"];
const SCRIPT_KEYS: [&str; 2] = ["scriptPubKey", "script"];
const SATOSHIS_KEYS: [&str; 2] = ["satoshis", "value"];

fn malformed(property: &'static str, reason: impl Into<String>) -> AppError {
    AppError::MalformedUtxo {
        property,
        reason: reason.into(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 正規形の5プロパティだけを持つUTXOか検査する
pub fn check_plain_utxo(value: &Value, network: BitcoinNetwork) -> Result<Utxo, AppError> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("utxo", format!("\"{}\" ではなくオブジェクトである必要があります", type_name(value))))?;

    let address_str = non_empty_str(obj, "address")?;
    let address = parse_address(address_str, network).map_err(|e| malformed("address", e.to_string()))?;

    let txid = non_empty_str(obj, "txid")?;
    Txid::from_str(txid).map_err(|e| malformed("txid", format!("無効なTXID形式 ({}): {}", txid, e)))?;

    let vout = obj
        .get("vout")
        .and_then(Value::as_u64)
        .filter(|vout| *vout <= u32::MAX as u64)
        .ok_or_else(|| malformed("vout", "負でない範囲内の整数である必要があります"))?;

    let script_hex = non_empty_str(obj, "scriptPubKey")?;
    let script = ScriptBuf::from_bytes(
        hex::decode(script_hex).map_err(|e| malformed("scriptPubKey", format!("16進数ではありません: {}", e)))?,
    );
    if let Some(ScriptType::P2PKH | ScriptType::P2SH) = ScriptType::classify(&script) {
        if address_from_script(&script, network).as_ref() != Some(&address) {
            return Err(malformed("scriptPubKey", format!("アドレス {} のロックスクリプトと一致しません", address_str)));
        }
    }

    let satoshis = obj
        .get("satoshis")
        .and_then(Value::as_u64)
        .filter(|sats| (1..=MAX_SAFE_INTEGER).contains(sats))
        .ok_or_else(|| malformed("satoshis", "0より大きく範囲内の整数である必要があります"))?;

    if obj.len() != NUM_EXPECTED_PROPERTIES {
        return Err(malformed(
            "utxo",
            format!("プロパティが {} 個ありますが {} 個である必要があります", obj.len(), NUM_EXPECTED_PROPERTIES),
        ));
    }

    Ok(Utxo {
        address: address_str.to_string(),
        txid: txid.to_string(),
        vout: vout as u32,
        script_pub_key: script_hex.to_string(),
        satoshis,
    })
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, AppError> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed(key, format!("文字列の{}プロパティが必要です", key)))
}

fn first_of<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

/// APIなどから得た冗長なレコードを正規形に変換する。
/// 整数の satoshis は小数の amount より常に優先する。
pub fn format_raw_utxo(raw: &Value, network: BitcoinNetwork) -> Result<Utxo, AppError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| malformed("utxo", format!("\"{}\" ではなくオブジェクトである必要があります", type_name(raw))))?;

    let mut formatted = Map::new();

    let script_hex = first_of(obj, &SCRIPT_KEYS).and_then(Value::as_str).map(str::to_lowercase);
    let address = match obj.get("address") {
        Some(Value::String(address)) => parse_address(address, network)
            .map(|addr| Value::String(addr.to_string()))
            .map_err(|e| malformed("address", e.to_string()))
            .map(Some)?,
        // 文字列以外はそのまま残して検査で報告させる
        Some(other) => Some(other.clone()),
        None => script_hex
            .as_deref()
            .and_then(|hex_str| hex::decode(hex_str).ok())
            .and_then(|bytes| address_from_script(&ScriptBuf::from_bytes(bytes), network))
            .map(|addr| Value::String(addr.to_string())),
    };
    if let Some(address) = address {
        formatted.insert("address".to_string(), address);
    }

    if let Some(txid) = first_of(obj, &TXID_KEYS) {
        let txid = match txid.as_str().map(Txid::from_str) {
            Some(Ok(parsed)) => Value::String(parsed.to_string()),
            _ => txid.clone(),
        };
        formatted.insert("txid".to_string(), txid);
    }
    if let Some(vout) = first_of(obj, &VOUT_KEYS) {
        formatted.insert("vout".to_string(), vout.clone());
    }
    if let Some(script_hex) = script_hex {
        formatted.insert("scriptPubKey".to_string(), Value::String(script_hex));
    }

    let satoshis = SATOSHIS_KEYS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| value.is_u64())
        .cloned()
        .or_else(|| {
            let amount = obj.get("amount")?.as_f64()?;
            let sats = (amount * SATOSHIS_PER_BSV).round();
            (sats >= 0.0 && sats <= MAX_SAFE_INTEGER as f64).then(|| Value::from(sats as u64))
        });
    if let Some(satoshis) = satoshis {
        formatted.insert("satoshis".to_string(), satoshis);
    }

    // 変換後も必ず正規形の検査を通す
    check_plain_utxo(&Value::Object(formatted), network)
}

/// 文字列化 → 重複除去 → 昇順ソート → オブジェクトに戻す
pub fn dedup_and_sort(utxos: Vec<Utxo>) -> Result<Vec<Utxo>, AppError> {
    let unique = utxos
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<BTreeSet<String>, _>>()?;
    unique
        .iter()
        .map(|utxo_string| serde_json::from_str(utxo_string).map_err(AppError::from))
        .collect()
}

pub fn normalize(raw_utxos: &[Value], network: BitcoinNetwork) -> Result<Vec<Utxo>, AppError> {
    let formatted = raw_utxos
        .iter()
        .map(|raw| format_raw_utxo(raw, network))
        .collect::<Result<Vec<_>, _>>()?;
    dedup_and_sort(formatted)
}

/// 重複のないアドレスから取得したUTXOを正規化する。
/// 重複除去で件数が減った場合は取得元の不整合として失敗させる。
pub fn normalize_fetched(raw_utxos: &[Value], network: BitcoinNetwork) -> Result<Vec<Utxo>, AppError> {
    let normalized = normalize(raw_utxos, network)?;
    if normalized.len() != raw_utxos.len() {
        log::error!(
            "UTXO取得元のデータ不整合: 受信 {} 件, 重複除去後 {} 件",
            raw_utxos.len(),
            normalized.len()
        );
        return Err(AppError::UpstreamInconsistency {
            raw: raw_utxos.len(),
            unique: normalized.len(),
        });
    }
    Ok(normalized)
}

/// ユーザーが貼り付けたUTXO JSON (正規形の配列) を読む
pub fn parse_utxos_json(text: &str, network: BitcoinNetwork) -> Result<Vec<Utxo>, AppError> {
    let value: Value = serde_json::from_str(text)?;
    let array = value.as_array().ok_or_else(|| {
        AppError::InputValidation(format!("UTXOは \"{}\" ではなく配列である必要があります", type_name(&value)))
    })?;
    array.iter().map(|utxo| check_plain_utxo(utxo, network)).collect()
}

pub fn utxos_to_json(utxos: &[Utxo]) -> Result<String, AppError> {
    to_tab_indented_json(&utxos)
}

/// 署名済みトランザクションの出力のうち、指定アドレス宛てのものをUTXOとして返す。
/// 署名前はtxidが変わるので未署名トランザクションは受け付けない。
pub fn utxos_from_signed_transaction(
    draft: &TxDraft,
    addresses: &HashSet<String>,
    network: BitcoinNetwork,
) -> Result<Vec<Utxo>, AppError> {
    if !draft.is_fully_signed() {
        return Err(AppError::UnsignedTransactionRejected);
    }
    let txid = draft.txid().to_string();

    let mut utxos = Vec::new();
    for (index, output) in draft.transaction().output.iter().enumerate() {
        let satoshis = output.value.to_sat();
        if satoshis == 0 {
            continue;
        }
        let Some(address) = address_from_script(&output.script_pubkey, network) else {
            continue;
        };
        let address = address.to_string();
        if !addresses.contains(&address) {
            continue;
        }
        let vout = u32::try_from(index).map_err(|e| AppError::Internal(e.to_string()))?;
        let utxo = Utxo {
            address,
            txid: txid.clone(),
            vout,
            script_pub_key: output.script_pubkey.to_hex_string(),
            satoshis,
        };
        utxos.push(check_plain_utxo(&serde_json::to_value(&utxo)?, network)?);
    }
    Ok(utxos)
}

pub fn utxos_from_signed_transactions(
    drafts: &[TxDraft],
    addresses: &HashSet<String>,
    network: BitcoinNetwork,
) -> Result<Vec<Utxo>, AppError> {
    let mut all_utxos = Vec::new();
    for draft in drafts {
        all_utxos.extend(utxos_from_signed_transaction(draft, addresses, network)?);
    }
    Ok(all_utxos)
}

/// 入力欄のテキストをアドレスと署名済みトランザクションに分類した結果
#[derive(Debug, Default)]
pub struct ClassifiedInputs {
    pub addresses: Vec<String>,
    pub signed_transactions: Vec<TxDraft>,
}

/// アドレスまたは署名済みトランザクションのリストを分類する。重複は除去する。
pub fn classify_inputs(text: &str, network: BitcoinNetwork) -> Result<ClassifiedInputs, AppError> {
    let mut seen = HashSet::new();
    let values: Vec<String> = split_list(text).into_iter().filter(|v| seen.insert(v.clone())).collect();

    let mut classified = ClassifiedInputs::default();
    let mut other_values = Vec::new();
    for value in values {
        if let Ok(address) = parse_address(&value, network) {
            classified.addresses.push(address.to_string());
            continue;
        }
        match TxDraft::parse(&value) {
            Ok(draft) if draft.is_fully_signed() => classified.signed_transactions.push(draft),
            _ => other_values.push(value),
        }
    }

    if classified.addresses.is_empty() {
        return Err(AppError::InputValidation("有効な入力アドレスがありません".to_string()));
    }
    if !other_values.is_empty() {
        log::debug!("認識できない入力: {:?}", other_values);
        return Err(AppError::InputValidation(format!(
            "アドレスまたは署名済みトランザクションとして認識できない入力があります: {}",
            other_values.join(", ")
        )));
    }
    Ok(classified)
}
