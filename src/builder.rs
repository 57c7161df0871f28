use std::collections::HashSet;

use bitcoin::Network as BitcoinNetwork;

use crate::{
    config::BuildSettings,
    error::AppError,
    transaction::TxDraft,
    types::{parse_address, OutputRequest, Utxo},
};

/// 未署名トランザクションを構築する。
///
/// 金額を指定しない出力には `floor(合計 / 出力指定数)` を割り当てる (分母はおつりを含む)。
/// 最後の出力指定はおつりアドレスで、出力と手数料を引いた残りを受け取る。
pub fn create_unsigned_transaction(
    utxos: &[Utxo],
    requests: &[OutputRequest],
    settings: &BuildSettings,
    network: BitcoinNetwork,
) -> Result<TxDraft, AppError> {
    log::info!("未署名トランザクション構築処理を開始します。");

    if utxos.is_empty() {
        return Err(AppError::InputValidation("UTXOがありません".to_string()));
    }
    let (change_request, payment_requests) = requests
        .split_last()
        .ok_or_else(|| AppError::InputValidation("有効な出力アドレスがありません".to_string()))?;
    if let Some(satoshis) = change_request.satoshis {
        return Err(AppError::ChangeAddressHasAmount {
            entry: format!("{}:{}", change_request.address, satoshis),
            suffix: format!(":{}", satoshis),
        });
    }

    // 同じ出力を二重に使うと合計額も水増しされる
    let mut outpoints = HashSet::with_capacity(utxos.len());
    for utxo in utxos {
        if !outpoints.insert((utxo.txid.to_ascii_lowercase(), utxo.vout)) {
            return Err(AppError::DuplicateUtxo {
                txid: utxo.txid.clone(),
                vout: utxo.vout,
            });
        }
    }

    let total_amount = utxos
        .iter()
        .try_fold(0u64, |total, utxo| total.checked_add(utxo.satoshis))
        .ok_or_else(|| AppError::InputValidation("UTXOの合計額がオーバーフローしました".to_string()))?;
    log::info!("UTXOの合計額: {} sats", total_amount);
    if total_amount == 0 {
        return Err(AppError::ZeroFunds);
    }

    // おつりアドレスを除く前の出力指定数で割る
    let split_amount = total_amount / requests.len() as u64;
    if split_amount == 0 {
        return Err(AppError::SplitAmountTooSmall {
            total: total_amount,
            outputs: requests.len(),
        });
    }
    log::debug!("分割額: {} sats ({} 出力)", split_amount, requests.len());

    settings.validate()?;
    let change_address = parse_address(&change_request.address, network)?;

    let mut draft = TxDraft::new();
    for utxo in utxos {
        draft.add_utxo(utxo)?;
    }

    for request in payment_requests {
        let address = parse_address(&request.address, network)?;
        let amount = match request.satoshis {
            Some(0) => {
                return Err(AppError::InvalidOutputAmount {
                    amount: "0".to_string(),
                    reason: "0より大きい必要があります".to_string(),
                });
            }
            Some(satoshis) => satoshis,
            None => split_amount,
        };
        log::debug!("出力追加: address={}, satoshis={}", address, amount);
        draft.add_output(address.script_pubkey(), amount)?;
    }

    if let Some(fee_per_kb) = settings.fee_per_kb {
        draft.set_fee_per_kb(fee_per_kb)?;
    }
    if let Some(n_lock_time) = settings.n_lock_time {
        let n_lock_time = u32::try_from(n_lock_time).map_err(|e| AppError::InvalidAdvancedSetting {
            setting: "nLockTime",
            reason: e.to_string(),
        })?;
        draft.set_lock_time(n_lock_time);
    }

    draft.set_change(change_address.script_pubkey())?;

    // 手数料率0が既定の率に置き換えられていたら手数料を0に固定する
    if settings.fee_per_kb == Some(0) && draft.fee() != Some(0) {
        log::warn!("手数料率0が指定されましたが手数料が {:?} sats になったため0に固定します。", draft.fee());
        draft.set_fee(0)?;
    }

    log::info!(
        "未署名トランザクションを構築しました。入力 {} 個, 出力 {} 個, 手数料 {:?} sats",
        draft.transaction().input.len(),
        draft.transaction().output.len(),
        draft.fee()
    );
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const B: &str = "1BitcoinEaterAddressDontSendf59kuE";
    const CHANGE: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";
    const EATER_SCRIPT: &str = "76a914759d6677091e973b9e9d99f19c68fbf43e3f05f988ac";

    fn utxos(amounts: &[u64]) -> Vec<Utxo> {
        amounts
            .iter()
            .enumerate()
            .map(|(vout, satoshis)| Utxo {
                address: B.to_string(),
                txid: "039d527e5c57123f96cb6813bd623268ecd05e99e097f6abd2ecff90ad8feb80".to_string(),
                vout: vout as u32,
                script_pub_key: EATER_SCRIPT.to_string(),
                satoshis: *satoshis,
            })
            .collect()
    }

    fn build(amounts: &[u64], requests: &[OutputRequest], settings: BuildSettings) -> Result<TxDraft, AppError> {
        create_unsigned_transaction(&utxos(amounts), requests, &settings, BitcoinNetwork::Bitcoin)
    }

    #[test]
    fn split_uses_request_count_including_change() {
        let requests = [
            OutputRequest::new(A, Some(30_000)),
            OutputRequest::new(B, None),
            OutputRequest::new(CHANGE, None),
        ];
        let draft = build(&[50_000, 30_000, 20_000], &requests, BuildSettings::default()).unwrap();
        let outputs = &draft.transaction().output;

        assert_eq!(draft.transaction().input.len(), 3);
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].value.to_sat(), 30_000);
        assert_eq!(outputs[1].value.to_sat(), 33_333);
        assert_eq!(draft.change_index(), Some(2));
        let fee = draft.fee().unwrap();
        assert!(fee > 0);
        assert_eq!(outputs[2].value.to_sat(), 100_000 - 63_333 - fee);
    }

    #[test]
    fn inputs_match_utxos_in_order() {
        let requests = [OutputRequest::new(A, None), OutputRequest::new(CHANGE, None)];
        let draft = build(&[1_000, 2_000, 3_000, 4_000], &requests, BuildSettings::default()).unwrap();
        let vouts: Vec<u32> = draft.transaction().input.iter().map(|i| i.previous_output.vout).collect();
        assert_eq!(vouts, vec![0, 1, 2, 3]);
        assert_eq!(draft.input_total(), Some(10_000));
    }

    #[test]
    fn change_with_amount_fails() {
        let requests = [OutputRequest::new(A, None), OutputRequest::new(CHANGE, Some(1))];
        assert!(matches!(
            build(&[10_000], &requests, BuildSettings::default()),
            Err(AppError::ChangeAddressHasAmount { .. })
        ));
    }

    #[test]
    fn empty_inputs_fail() {
        let requests = [OutputRequest::new(CHANGE, None)];
        assert!(build(&[], &requests, BuildSettings::default()).is_err());
        assert!(build(&[10_000], &[], BuildSettings::default()).is_err());
    }

    #[test]
    fn same_outpoint_twice_fails() {
        let requests = [OutputRequest::new(A, Some(10_000)), OutputRequest::new(CHANGE, None)];
        let mut twice = utxos(&[10_000]);
        twice.push(twice[0].clone());
        assert!(matches!(
            create_unsigned_transaction(&twice, &requests, &BuildSettings::default(), BitcoinNetwork::Bitcoin),
            Err(AppError::DuplicateUtxo { vout: 0, .. })
        ));

        // 表記や金額が違っても同じ出力参照なら拒否する
        let mut conflicting = utxos(&[10_000]);
        let mut other = conflicting[0].clone();
        other.txid = other.txid.to_uppercase();
        other.satoshis = 5_000;
        conflicting.push(other);
        assert!(matches!(
            create_unsigned_transaction(&conflicting, &requests, &BuildSettings::default(), BitcoinNetwork::Bitcoin),
            Err(AppError::DuplicateUtxo { .. })
        ));
    }

    #[test]
    fn zero_funds_fail() {
        let requests = [OutputRequest::new(CHANGE, None)];
        assert!(matches!(build(&[0], &requests, BuildSettings::default()), Err(AppError::ZeroFunds)));
    }

    #[test]
    fn split_amount_too_small_fails() {
        let requests = [
            OutputRequest::new(A, None),
            OutputRequest::new(B, None),
            OutputRequest::new(CHANGE, None),
        ];
        assert!(matches!(
            build(&[2], &requests, BuildSettings::default()),
            Err(AppError::SplitAmountTooSmall { total: 2, outputs: 3 })
        ));
    }

    #[test]
    fn zero_output_amount_fails() {
        let requests = [OutputRequest::new(A, Some(0)), OutputRequest::new(CHANGE, None)];
        assert!(matches!(
            build(&[10_000], &requests, BuildSettings::default()),
            Err(AppError::InvalidOutputAmount { .. })
        ));
    }

    #[test]
    fn zero_fee_rate_gives_zero_fee() {
        let requests = [OutputRequest::new(A, Some(30_000)), OutputRequest::new(CHANGE, None)];
        let settings = BuildSettings { fee_per_kb: Some(0), n_lock_time: None };
        let draft = build(&[100_000], &requests, settings).unwrap();
        assert_eq!(draft.fee(), Some(0));
        assert_eq!(draft.transaction().output[1].value.to_sat(), 70_000);
    }

    #[test]
    fn higher_fee_rate_costs_more() {
        let requests = [OutputRequest::new(A, Some(30_000)), OutputRequest::new(CHANGE, None)];
        let cheap = build(&[100_000], &requests, BuildSettings { fee_per_kb: Some(100), n_lock_time: None }).unwrap();
        let dear = build(&[100_000], &requests, BuildSettings { fee_per_kb: Some(5_000), n_lock_time: None }).unwrap();
        assert!(dear.fee().unwrap() > cheap.fee().unwrap());
    }

    #[test]
    fn fee_rate_over_ceiling_fails() {
        let requests = [OutputRequest::new(CHANGE, None)];
        let settings = BuildSettings { fee_per_kb: Some(10_001), n_lock_time: None };
        assert!(matches!(
            build(&[10_000], &requests, settings),
            Err(AppError::InvalidAdvancedSetting { setting: "feePerKb", .. })
        ));
    }

    #[test]
    fn lock_time_is_applied() {
        let requests = [OutputRequest::new(CHANGE, None)];
        let settings = BuildSettings { fee_per_kb: None, n_lock_time: Some(650_000) };
        let draft = build(&[10_000], &requests, settings).unwrap();
        assert_eq!(draft.transaction().lock_time.to_consensus_u32(), 650_000);
    }

    #[test]
    fn invalid_output_address_fails() {
        let requests = [OutputRequest::new("nope", None), OutputRequest::new(CHANGE, None)];
        assert!(matches!(
            build(&[10_000], &requests, BuildSettings::default()),
            Err(AppError::InvalidAddress { .. })
        ));
    }
}
