use bitcoin::{
    consensus::encode,
    hashes::{sha256d, Hash},
    network::Network as BitcoinNetwork,
    script::{Builder, PushBytesBuf},
    secp256k1::{All, Message, Secp256k1},
    NetworkKind, PrivateKey, PublicKey, ScriptBuf, TxOut,
};

use crate::{
    config::split_list,
    error::AppError,
    transaction::TxDraft,
    types::ScriptType,
};

/// SIGHASH_ALL | SIGHASH_FORKID
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

// 署名に必要な情報を一時的に保持するための構造体
struct SigningInfo {
    input_index: usize,
    sighash_message: Message,
    private_key: PrivateKey,
    public_key: PublicKey,
}

/// カンマまたは改行区切りのWIFをパースする
pub fn parse_private_keys(text: &str) -> Result<Vec<PrivateKey>, AppError> {
    split_list(text)
        .iter()
        .map(|wif| PrivateKey::from_wif(wif).map_err(AppError::BitcoinKey))
        .collect()
}

/// 前の出力が分かっている全P2PKH入力に、一致する秘密鍵で署名したコピーを返す。
/// 一致する鍵がない入力は未署名のまま残る。
pub fn sign_transaction(
    draft: &TxDraft,
    private_keys: &[PrivateKey],
    cli_network: BitcoinNetwork,
    secp: &Secp256k1<All>,
) -> Result<TxDraft, AppError> {
    log::info!("トランザクション署名処理を開始します。入力数: {}", draft.transaction().input.len());

    let mut keys = Vec::with_capacity(private_keys.len());
    for private_key in private_keys {
        if private_key.network != NetworkKind::from(cli_network) {
            return Err(AppError::NetworkMismatch {
                cli_network: format!("{:?}", cli_network),
                inferred_network: format!("{:?}", private_key.network),
            });
        }
        let public_key = private_key.public_key(secp);
        keys.push((private_key.clone(), public_key, ScriptBuf::new_p2pkh(&public_key.pubkey_hash())));
    }

    // 1. 署名ハッシュ計算フェーズ
    let mut signing_infos: Vec<SigningInfo> = Vec::new();
    for (input_index, prevout) in draft.prevouts().iter().enumerate() {
        let prevout = prevout.as_ref().ok_or_else(|| {
            AppError::InputValidation(format!("入力 {} の前の出力が不明なため署名できません", input_index))
        })?;
        if ScriptType::spendable(&prevout.script_pubkey).is_err() {
            log::warn!("入力 {} はP2PKHではないため署名しません。", input_index);
            continue;
        }
        let Some((private_key, public_key, _)) = keys.iter().find(|(_, _, script)| *script == prevout.script_pubkey)
        else {
            log::warn!("入力 {} に一致する秘密鍵がありません。", input_index);
            continue;
        };

        let sighash = forkid_signature_hash(draft, input_index, prevout, SIGHASH_ALL_FORKID)?;
        log::debug!("入力 {} の署名ハッシュ: {}", input_index, hex::encode(sighash));
        signing_infos.push(SigningInfo {
            input_index,
            sighash_message: Message::from_digest(sighash),
            private_key: private_key.clone(),
            public_key: *public_key,
        });
    }

    // 2. 署名生成と適用フェーズ
    let mut signed = draft.clone();
    for info in signing_infos {
        let signature = secp.sign_ecdsa(&info.sighash_message, &info.private_key.inner);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(SIGHASH_ALL_FORKID as u8);

        let script_sig = Builder::new()
            .push_slice(PushBytesBuf::try_from(sig_bytes).map_err(|_| {
                AppError::Internal(format!("P2PKH署名のPushBytes変換失敗 (input {})", info.input_index))
            })?)
            .push_key(&info.public_key)
            .into_script();
        signed.set_script_sig(info.input_index, script_sig)?;
        log::debug!("入力 {} (P2PKH) の署名適用完了。", info.input_index);
    }

    if signed.is_fully_signed() {
        log::info!("全ての入力の署名が完了しました。");
    }
    Ok(signed)
}

/// BSVの署名ハッシュ (BIP143のダイジェスト形式 + FORKID)
pub fn forkid_signature_hash(
    draft: &TxDraft,
    input_index: usize,
    prevout: &TxOut,
    sighash_type: u32,
) -> Result<[u8; 32], AppError> {
    let tx = draft.transaction();
    let input = tx
        .input
        .get(input_index)
        .ok_or_else(|| AppError::Internal(format!("入力インデックス {} が範囲外です", input_index)))?;

    let mut prevouts_buf = Vec::new();
    let mut sequence_buf = Vec::new();
    for txin in tx.input.iter() {
        prevouts_buf.extend(encode::serialize(&txin.previous_output));
        sequence_buf.extend(encode::serialize(&txin.sequence));
    }
    let mut outputs_buf = Vec::new();
    for txout in tx.output.iter() {
        outputs_buf.extend(encode::serialize(txout));
    }

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(sha256d::Hash::hash(&prevouts_buf).as_byte_array());
    preimage.extend_from_slice(sha256d::Hash::hash(&sequence_buf).as_byte_array());
    preimage.extend(encode::serialize(&input.previous_output));
    preimage.extend(encode::serialize(&prevout.script_pubkey));
    preimage.extend_from_slice(&prevout.value.to_sat().to_le_bytes());
    preimage.extend(encode::serialize(&input.sequence));
    preimage.extend_from_slice(sha256d::Hash::hash(&outputs_buf).as_byte_array());
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&sighash_type.to_le_bytes());

    Ok(sha256d::Hash::hash(&preimage).to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_address, Utxo};

    // 秘密鍵 = 1 (圧縮)
    const WIF: &str = "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn";
    const GENESIS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    fn funded_draft(secp: &Secp256k1<All>) -> TxDraft {
        let key = PrivateKey::from_wif(WIF).unwrap();
        let address = bitcoin::Address::p2pkh(key.public_key(secp).pubkey_hash(), BitcoinNetwork::Bitcoin);
        let mut draft = TxDraft::new();
        draft
            .add_utxo(&Utxo {
                address: address.to_string(),
                txid: "aa".repeat(32),
                vout: 1,
                script_pub_key: address.script_pubkey().to_hex_string(),
                satoshis: 50_000,
            })
            .unwrap();
        let genesis = parse_address(GENESIS, BitcoinNetwork::Bitcoin).unwrap();
        draft.add_output(genesis.script_pubkey(), 20_000).unwrap();
        draft.set_change(address.script_pubkey()).unwrap();
        draft
    }

    #[test]
    fn signs_matching_p2pkh_inputs() {
        let secp = Secp256k1::new();
        let draft = funded_draft(&secp);
        let keys = parse_private_keys(WIF).unwrap();

        let signed = sign_transaction(&draft, &keys, BitcoinNetwork::Bitcoin, &secp).unwrap();
        assert!(signed.is_fully_signed());
        assert!(!draft.is_fully_signed());

        let script_sig = &signed.transaction().input[0].script_sig;
        assert_eq!(
            crate::types::InputScriptType::classify(script_sig),
            Some(crate::types::InputScriptType::PubkeyHashIn)
        );
        let hex = signed.checked_serialize_hex().unwrap();
        assert!(!hex.is_empty());
    }

    #[test]
    fn signature_verifies_against_forkid_digest() {
        let secp = Secp256k1::new();
        let draft = funded_draft(&secp);
        let key = PrivateKey::from_wif(WIF).unwrap();
        let signed = sign_transaction(&draft, &[key.clone()], BitcoinNetwork::Bitcoin, &secp).unwrap();

        let prevout = draft.prevouts()[0].clone().unwrap();
        let digest = forkid_signature_hash(&signed, 0, &prevout, SIGHASH_ALL_FORKID).unwrap();
        let script_sig = &signed.transaction().input[0].script_sig;
        let sig_push = match script_sig.instructions().next() {
            Some(Ok(bitcoin::script::Instruction::PushBytes(bytes))) => bytes.as_bytes().to_vec(),
            other => panic!("unexpected script_sig: {:?}", other),
        };
        assert_eq!(*sig_push.last().unwrap(), 0x41);
        let signature = bitcoin::secp256k1::ecdsa::Signature::from_der(&sig_push[..sig_push.len() - 1]).unwrap();
        secp.verify_ecdsa(&Message::from_digest(digest), &signature, &key.public_key(&secp).inner)
            .unwrap();
    }

    #[test]
    fn forkid_digest_matches_known_vector() {
        // 入力1つ (aa..aa:1, 50000 sats, 秘密鍵1のP2PKH) と出力1つ (GENESIS宛て 20000 sats)
        let mut draft = TxDraft::new();
        draft
            .add_utxo(&Utxo {
                address: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".to_string(),
                txid: "aa".repeat(32),
                vout: 1,
                script_pub_key: "76a914751e76e8199196d454941c45d1b3a323f1433bd688ac".to_string(),
                satoshis: 50_000,
            })
            .unwrap();
        let genesis = parse_address(GENESIS, BitcoinNetwork::Bitcoin).unwrap();
        draft.add_output(genesis.script_pubkey(), 20_000).unwrap();

        let prevout = draft.prevouts()[0].clone().unwrap();
        let digest = forkid_signature_hash(&draft, 0, &prevout, SIGHASH_ALL_FORKID).unwrap();
        assert_eq!(
            hex::encode(digest),
            "d20a80637607abc4063af54b8812a99d24e42f07d513cc1ac6e46ea626f84d24"
        );
    }

    #[test]
    fn unrelated_key_leaves_input_unsigned() {
        let secp = Secp256k1::new();
        let draft = funded_draft(&secp);
        // 秘密鍵 = 1 (非圧縮) は別のアドレスになる
        let keys = parse_private_keys("5HpHagT65TZzG1PH3CSu63k8DbpvD8s5ip4nEB3kEsreAnchuDf").unwrap();

        let signed = sign_transaction(&draft, &keys, BitcoinNetwork::Bitcoin, &secp).unwrap();
        assert!(!signed.is_fully_signed());
        assert!(matches!(signed.checked_serialize_hex(), Err(AppError::UnsignedInputs { count: 1 })));
    }

    #[test]
    fn network_mismatch_is_rejected() {
        let secp = Secp256k1::new();
        let draft = funded_draft(&secp);
        let keys = parse_private_keys(WIF).unwrap();
        assert!(matches!(
            sign_transaction(&draft, &keys, BitcoinNetwork::Testnet, &secp),
            Err(AppError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn invalid_wif_is_rejected() {
        assert!(matches!(parse_private_keys("notakey"), Err(AppError::BitcoinKey(_))));
    }
}
