use bitcoin::{
    absolute::LockTime, consensus::encode, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{
    error::AppError,
    types::{ScriptType, Utxo},
};

// おつりがこの額未満なら出力を作らず手数料に含める
pub const DUST_THRESHOLD_SATS: u64 = 546;

// 手数料見積もり用のダミーP2PKHアンロックスクリプト (署名73バイト + 圧縮公開鍵33バイト)
const DUMMY_SIGNATURE_LEN: usize = 73;
const DUMMY_PUBKEY_LEN: usize = 33;

// ロックタイムを有効にするシーケンス番号
const LOCK_TIME_SEQUENCE: Sequence = Sequence(0xffff_fffe);

/// 構築中・署名済みのトランザクション。
/// `bitcoin::Transaction` に加えて、各入力の前の出力と手数料・おつりの設定を保持する。
#[derive(Debug, Clone, PartialEq)]
pub struct TxDraft {
    tx: Transaction,
    prevouts: Vec<Option<TxOut>>,
    change_script: Option<ScriptBuf>,
    change_index: Option<usize>,
    fee_per_kb: Option<u64>,
    fixed_fee: Option<u64>,
}

/// JSON形式 (署名前の受け渡しに使う)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDocument {
    #[serde(default)]
    pub hash: String,
    pub version: i32,
    pub inputs: Vec<InputDocument>,
    pub outputs: Vec<OutputDocument>,
    pub n_lock_time: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_per_kb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDocument {
    pub prev_tx_id: String,
    pub output_index: u32,
    pub sequence_number: u32,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDocument {
    pub satoshis: u64,
    pub script: String,
}

impl Default for TxDraft {
    fn default() -> Self {
        Self::from_transaction(Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        })
    }
}

impl TxDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// 前の出力が分からないトランザクション (16進数からデコードしたもの) を包む
    pub fn from_transaction(tx: Transaction) -> Self {
        let prevouts = vec![None; tx.input.len()];
        Self {
            tx,
            prevouts,
            change_script: None,
            change_index: None,
            fee_per_kb: None,
            fixed_fee: None,
        }
    }

    /// トリムしたテキストが `{` で始まり `}` で終わればJSON形式、それ以外は16進数として読む
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let text = text.trim();
        if text.starts_with('{') && text.ends_with('}') {
            let document: TransactionDocument = serde_json::from_str(text)?;
            Self::from_document(&document)
        } else {
            let bytes = hex::decode(text)?;
            let tx: Transaction = encode::deserialize(&bytes)?;
            Ok(Self::from_transaction(tx))
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn prevouts(&self) -> &[Option<TxOut>] {
        &self.prevouts
    }

    pub fn change_index(&self) -> Option<usize> {
        self.change_index
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn add_utxo(&mut self, utxo: &Utxo) -> Result<(), AppError> {
        let txid = Txid::from_str(&utxo.txid)
            .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", utxo.txid, e)))?;
        let script_pubkey = ScriptBuf::from_bytes(hex::decode(&utxo.script_pub_key)?);
        ScriptType::spendable(&script_pubkey)?;

        let sequence = if self.tx.lock_time == LockTime::ZERO { Sequence::MAX } else { LOCK_TIME_SEQUENCE };
        self.tx.input.push(TxIn {
            previous_output: OutPoint::new(txid, utxo.vout),
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        });
        self.prevouts.push(Some(TxOut {
            value: Amount::from_sat(utxo.satoshis),
            script_pubkey,
        }));
        log::debug!("入力追加: txid={}, vout={}, satoshis={}", utxo.txid, utxo.vout, utxo.satoshis);
        self.update_change_output()
    }

    pub fn add_output(&mut self, script_pubkey: ScriptBuf, satoshis: u64) -> Result<(), AppError> {
        self.remove_change_output();
        self.tx.output.push(TxOut {
            value: Amount::from_sat(satoshis),
            script_pubkey,
        });
        self.update_change_output()
    }

    pub fn set_fee_per_kb(&mut self, fee_per_kb: u64) -> Result<(), AppError> {
        self.fee_per_kb = Some(fee_per_kb);
        self.update_change_output()
    }

    /// 0以外のロックタイムでは全入力のシーケンスを 0xfffffffe にして有効化する
    pub fn set_lock_time(&mut self, n_lock_time: u32) {
        self.tx.lock_time = LockTime::from_consensus(n_lock_time);
        let sequence = if n_lock_time == 0 { Sequence::MAX } else { LOCK_TIME_SEQUENCE };
        for input in self.tx.input.iter_mut() {
            input.sequence = sequence;
        }
    }

    pub fn set_change(&mut self, script_pubkey: ScriptBuf) -> Result<(), AppError> {
        self.change_script = Some(script_pubkey);
        self.update_change_output()
    }

    /// 手数料を固定する。見積もりは使われなくなる。
    pub fn set_fee(&mut self, fee: u64) -> Result<(), AppError> {
        self.fixed_fee = Some(fee);
        self.update_change_output()
    }

    /// 全入力の前の出力が分かる場合のみ合計を返す
    pub fn input_total(&self) -> Option<u64> {
        self.prevouts
            .iter()
            .map(|prevout| prevout.as_ref().map(|txout| txout.value.to_sat()))
            .sum()
    }

    pub fn output_total(&self) -> u64 {
        self.tx.output.iter().map(|txout| txout.value.to_sat()).sum()
    }

    /// 実際の手数料 (入力合計 - 出力合計)。入力額が不明なら None。
    pub fn fee(&self) -> Option<u64> {
        self.input_total()?.checked_sub(self.output_total())
    }

    /// ダミー署名を入れたコピーのサイズから手数料を見積もる
    pub fn estimate_fee(&self, fee_per_kb: u64) -> u64 {
        let mut sized = self.tx.clone();
        for input in sized.input.iter_mut().filter(|input| input.script_sig.is_empty()) {
            input.script_sig = dummy_script_sig();
        }
        if let (Some(change_script), None) = (&self.change_script, self.change_index) {
            sized.output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: change_script.clone(),
            });
        }
        let size = encode::serialize(&sized).len() as u64;
        let fee = (size * fee_per_kb).div_ceil(1000);
        log::debug!("推定サイズ: {} bytes, 手数料率: {} sats/kB, 計算された手数料: {} sats", size, fee_per_kb, fee);
        fee
    }

    pub fn is_fully_signed(&self) -> bool {
        !self.tx.input.is_empty() && self.tx.input.iter().all(|input| !input.script_sig.is_empty())
    }

    pub(crate) fn set_script_sig(&mut self, input_index: usize, script_sig: ScriptBuf) -> Result<(), AppError> {
        let input = self
            .tx
            .input
            .get_mut(input_index)
            .ok_or_else(|| AppError::Internal(format!("入力インデックス {} が範囲外です", input_index)))?;
        input.script_sig = script_sig;
        Ok(())
    }

    fn remove_change_output(&mut self) {
        if let Some(index) = self.change_index.take() {
            if index < self.tx.output.len() {
                self.tx.output.remove(index);
            }
        }
    }

    fn update_change_output(&mut self) -> Result<(), AppError> {
        self.remove_change_output();
        let Some(change_script) = self.change_script.clone() else {
            return Ok(());
        };
        let input_total = self.input_total().ok_or_else(|| {
            AppError::InputValidation("前の出力が不明な入力があるため、おつりを計算できません".to_string())
        })?;
        let output_total = self.output_total();
        let available = input_total.checked_sub(output_total).ok_or(AppError::InsufficientFunds {
            available: input_total,
            required: output_total,
            fee: 0,
        })?;

        let fee = match self.fixed_fee {
            Some(fee) => fee,
            None => self.estimate_fee(self.fee_per_kb.unwrap_or(crate::config::DEFAULT_FEE_PER_KB)),
        };
        let change = available.checked_sub(fee).ok_or(AppError::InsufficientFunds {
            available: input_total,
            required: output_total + fee,
            fee,
        })?;

        let zero_fee_requested = self.fixed_fee == Some(0) || self.fee_per_kb == Some(0);
        if change >= DUST_THRESHOLD_SATS || (change > 0 && zero_fee_requested) {
            self.tx.output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_script,
            });
            self.change_index = Some(self.tx.output.len() - 1);
            log::debug!("おつり: {} sats, 手数料: {} sats", change, fee);
        } else if change > 0 {
            log::warn!("おつり {} sats はダスト閾値 {} sats 未満のため手数料に含めます。", change, DUST_THRESHOLD_SATS);
        }
        Ok(())
    }

    pub fn to_document(&self) -> TransactionDocument {
        TransactionDocument {
            hash: self.txid().to_string(),
            version: self.tx.version.0,
            inputs: self
                .tx
                .input
                .iter()
                .zip(self.prevouts.iter())
                .map(|(input, prevout)| InputDocument {
                    prev_tx_id: input.previous_output.txid.to_string(),
                    output_index: input.previous_output.vout,
                    sequence_number: input.sequence.0,
                    script: input.script_sig.to_hex_string(),
                    output: prevout.as_ref().map(output_document),
                })
                .collect(),
            outputs: self.tx.output.iter().map(output_document).collect(),
            n_lock_time: self.tx.lock_time.to_consensus_u32(),
            change_script: self.change_script.as_ref().map(|script| script.to_hex_string()),
            change_index: self.change_index,
            fee: self.fixed_fee,
            fee_per_kb: self.fee_per_kb,
        }
    }

    pub fn from_document(document: &TransactionDocument) -> Result<Self, AppError> {
        let mut input = Vec::with_capacity(document.inputs.len());
        let mut prevouts = Vec::with_capacity(document.inputs.len());
        for doc in document.inputs.iter() {
            let txid = Txid::from_str(&doc.prev_tx_id)
                .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", doc.prev_tx_id, e)))?;
            input.push(TxIn {
                previous_output: OutPoint::new(txid, doc.output_index),
                script_sig: ScriptBuf::from_bytes(hex::decode(&doc.script)?),
                sequence: Sequence(doc.sequence_number),
                witness: Witness::new(),
            });
            prevouts.push(doc.output.as_ref().map(tx_out_from_document).transpose()?);
        }
        let output = document
            .outputs
            .iter()
            .map(tx_out_from_document)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(index) = document.change_index {
            if index >= output.len() {
                return Err(AppError::InputValidation(format!(
                    "changeIndex {} は出力数 {} の範囲外です",
                    index,
                    output.len()
                )));
            }
        }
        let change_script = document
            .change_script
            .as_deref()
            .map(hex::decode)
            .transpose()?
            .map(ScriptBuf::from_bytes);

        let draft = Self {
            tx: Transaction {
                version: Version(document.version),
                lock_time: LockTime::from_consensus(document.n_lock_time),
                input,
                output,
            },
            prevouts,
            change_script,
            change_index: document.change_index,
            fee_per_kb: document.fee_per_kb,
            fixed_fee: document.fee,
        };
        if !document.hash.is_empty() && document.hash != draft.txid().to_string() {
            log::debug!("JSONのhash {} と計算したtxid {} が一致しません", document.hash, draft.txid());
        }
        Ok(draft)
    }

    /// 空白なしのJSON (受け渡し用)
    pub fn to_compact_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(&self.to_document())?)
    }

    /// タブインデントのJSON (詳細表示用)
    pub fn to_pretty_json(&self) -> Result<String, AppError> {
        to_tab_indented_json(&self.to_document())
    }

    /// ブロードキャスト可能か検査してから16進数にシリアライズする
    pub fn checked_serialize_hex(&self) -> Result<String, AppError> {
        let unsigned = self.tx.input.iter().filter(|input| input.script_sig.is_empty()).count();
        if unsigned > 0 || self.tx.input.is_empty() {
            return Err(AppError::UnsignedInputs { count: unsigned });
        }
        for (index, output) in self.tx.output.iter().enumerate() {
            let satoshis = output.value.to_sat();
            if satoshis < DUST_THRESHOLD_SATS && !output.script_pubkey.is_op_return() {
                return Err(AppError::DustOutput { index, satoshis });
            }
        }
        if let Some(input_total) = self.input_total() {
            if input_total < self.output_total() {
                return Err(AppError::InsufficientFunds {
                    available: input_total,
                    required: self.output_total(),
                    fee: 0,
                });
            }
        }
        Ok(encode::serialize_hex(&self.tx))
    }
}

pub fn to_tab_indented_json<T: Serialize>(value: &T) -> Result<String, AppError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(buf).map_err(|e| AppError::Internal(e.to_string()))
}

fn output_document(txout: &TxOut) -> OutputDocument {
    OutputDocument {
        satoshis: txout.value.to_sat(),
        script: txout.script_pubkey.to_hex_string(),
    }
}

fn tx_out_from_document(doc: &OutputDocument) -> Result<TxOut, AppError> {
    Ok(TxOut {
        value: Amount::from_sat(doc.satoshis),
        script_pubkey: ScriptBuf::from_bytes(hex::decode(&doc.script)?),
    })
}

fn dummy_script_sig() -> ScriptBuf {
    let mut bytes = Vec::with_capacity(2 + DUMMY_SIGNATURE_LEN + DUMMY_PUBKEY_LEN);
    bytes.push(DUMMY_SIGNATURE_LEN as u8);
    bytes.extend_from_slice(&[0u8; DUMMY_SIGNATURE_LEN]);
    bytes.push(DUMMY_PUBKEY_LEN as u8);
    bytes.extend_from_slice(&[0u8; DUMMY_PUBKEY_LEN]);
    ScriptBuf::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_address;
    use bitcoin::Network as BitcoinNetwork;

    const GENESIS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const EATER: &str = "1BitcoinEaterAddressDontSendf59kuE";

    fn utxo(satoshis: u64) -> Utxo {
        Utxo {
            address: EATER.to_string(),
            txid: "039d527e5c57123f96cb6813bd623268ecd05e99e097f6abd2ecff90ad8feb80".to_string(),
            vout: 0,
            script_pub_key: "76a914759d6677091e973b9e9d99f19c68fbf43e3f05f988ac".to_string(),
            satoshis,
        }
    }

    fn script(address: &str) -> ScriptBuf {
        parse_address(address, BitcoinNetwork::Bitcoin).unwrap().script_pubkey()
    }

    #[test]
    fn change_receives_remainder_after_estimated_fee() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(100_000)).unwrap();
        draft.add_output(script(GENESIS), 40_000).unwrap();
        draft.set_change(script(EATER)).unwrap();

        assert_eq!(draft.change_index(), Some(1));
        let fee = draft.fee().unwrap();
        assert!(fee > 0);
        assert_eq!(draft.transaction().output[1].value.to_sat(), 60_000 - fee);
    }

    #[test]
    fn dust_change_is_folded_into_fee() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(10_000)).unwrap();
        draft.add_output(script(GENESIS), 9_700).unwrap();
        draft.set_change(script(EATER)).unwrap();

        assert_eq!(draft.change_index(), None);
        assert_eq!(draft.transaction().output.len(), 1);
        assert_eq!(draft.fee(), Some(300));
    }

    #[test]
    fn outputs_exceeding_inputs_fail() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(1_000)).unwrap();
        draft.add_output(script(GENESIS), 2_000).unwrap();
        assert!(matches!(
            draft.set_change(script(EATER)),
            Err(AppError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn fixed_fee_overrides_estimate() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(100_000)).unwrap();
        draft.set_change(script(EATER)).unwrap();
        draft.set_fee(0).unwrap();
        assert_eq!(draft.fee(), Some(0));
        assert_eq!(draft.transaction().output[0].value.to_sat(), 100_000);
    }

    #[test]
    fn lock_time_enables_sequences() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(100_000)).unwrap();
        draft.set_lock_time(650_000);
        assert_eq!(draft.transaction().input[0].sequence, LOCK_TIME_SEQUENCE);
        draft.set_lock_time(0);
        assert_eq!(draft.transaction().input[0].sequence, Sequence::MAX);
    }

    #[test]
    fn json_document_restores_state() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(100_000)).unwrap();
        draft.add_output(script(GENESIS), 30_000).unwrap();
        draft.set_fee_per_kb(1_000).unwrap();
        draft.set_change(script(EATER)).unwrap();

        let text = draft.to_compact_json().unwrap();
        assert!(!text.contains(' ') && !text.contains('\n'));
        assert!(text.contains("\"prevTxId\"") && text.contains("\"nLockTime\"") && text.contains("\"feePerKb\":1000"));

        let restored = TxDraft::parse(&format!("  {}\n", text)).unwrap();
        assert_eq!(restored, draft);
    }

    #[test]
    fn hex_form_has_unknown_prevouts() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(100_000)).unwrap();
        draft.add_output(script(GENESIS), 30_000).unwrap();
        draft.set_script_sig(0, ScriptBuf::from_bytes(vec![0x51])).unwrap();

        let hex = draft.checked_serialize_hex().unwrap();
        let parsed = TxDraft::parse(&hex).unwrap();
        assert_eq!(parsed.transaction(), draft.transaction());
        assert_eq!(parsed.prevouts(), &[None]);
        assert_eq!(parsed.input_total(), None);
        assert!(parsed.is_fully_signed());
    }

    #[test]
    fn checked_serialize_refuses_unsigned_and_dust() {
        let mut draft = TxDraft::new();
        draft.add_utxo(&utxo(100_000)).unwrap();
        draft.add_output(script(GENESIS), 100).unwrap();
        assert!(matches!(draft.checked_serialize_hex(), Err(AppError::UnsignedInputs { count: 1 })));

        draft.set_script_sig(0, ScriptBuf::from_bytes(vec![0x51])).unwrap();
        assert!(matches!(
            draft.checked_serialize_hex(),
            Err(AppError::DustOutput { index: 0, satoshis: 100 })
        ));
    }

    #[test]
    fn rejects_non_p2pkh_utxo() {
        let mut bad = utxo(1_000);
        bad.script_pub_key = "a914759d6677091e973b9e9d99f19c68fbf43e3f05f987".to_string();
        assert!(matches!(TxDraft::new().add_utxo(&bad), Err(AppError::UnknownScriptType { .. })));
    }
}
