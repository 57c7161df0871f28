use std::collections::HashSet;
use std::fmt;

use bitcoin::Network as BitcoinNetwork;
use chrono::{DateTime, SecondsFormat};

use crate::{
    transaction::TxDraft,
    types::{address_from_input_script, address_from_script, InputAmount, InputScriptType, ScriptType},
};

const SUMMARY_INDENT: &str = "   ";

/// トランザクションのアドレス別集計と警告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// 初出順。アドレスを導出できない入力は None にまとめる。
    pub input_address_amounts: Vec<(Option<String>, InputAmount)>,
    pub output_address_amounts: Vec<(Option<String>, u64)>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    LockedUntilBlock(u32),
    /// UNIX秒
    LockedUntilTime(u32),
    NonStandardInputs(usize),
    NonStandardOutputs(usize),
    DuplicateOutputAddress,
    AddressReuse,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::LockedUntilBlock(height) => write!(f, "Locked until block #{}", height),
            Warning::LockedUntilTime(seconds) => match DateTime::from_timestamp(i64::from(*seconds), 0) {
                Some(time) => write!(f, "Locked until {}", time.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => write!(f, "Locked until {}", seconds),
            },
            Warning::NonStandardInputs(count) => write!(f, "{} non standard inputs", count),
            Warning::NonStandardOutputs(count) => write!(f, "{} non standard outputs", count),
            Warning::DuplicateOutputAddress => f.write_str("Multiple outputs with the same address"),
            Warning::AddressReuse => f.write_str("Addresses are being reused"),
        }
    }
}

/// 入力と出力をアドレスごとに集計し、警告を組み立てる
pub fn transaction_info(draft: &TxDraft, network: BitcoinNetwork) -> TransactionInfo {
    let tx = draft.transaction();

    let mut input_address_amounts: Vec<(Option<String>, InputAmount)> = Vec::new();
    let mut non_standard_inputs = 0;
    for (input, prevout) in tx.input.iter().zip(draft.prevouts().iter()) {
        let (address, amount, standard) = match prevout {
            Some(prevout) => (
                address_from_script(&prevout.script_pubkey, network),
                InputAmount::Known(prevout.value.to_sat()),
                ScriptType::classify(&prevout.script_pubkey).is_some(),
            ),
            None => (
                address_from_input_script(&input.script_sig, network),
                InputAmount::Unknown,
                InputScriptType::classify(&input.script_sig).is_some(),
            ),
        };
        if !standard {
            non_standard_inputs += 1;
        }
        let key = address.map(|a| a.to_string());
        match input_address_amounts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, total)) => *total = total.combine(amount),
            None => input_address_amounts.push((key, amount)),
        }
    }

    let mut output_address_amounts: Vec<(Option<String>, u64)> = Vec::new();
    let mut non_standard_outputs = 0;
    let mut resolvable_outputs = 0;
    for output in tx.output.iter() {
        if ScriptType::classify(&output.script_pubkey).is_none() {
            non_standard_outputs += 1;
        }
        let key = address_from_script(&output.script_pubkey, network).map(|a| a.to_string());
        if key.is_some() {
            resolvable_outputs += 1;
        }
        let satoshis = output.value.to_sat();
        match output_address_amounts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, total)) => *total = total.saturating_add(satoshis),
            None => output_address_amounts.push((key, satoshis)),
        }
    }

    let mut warnings = Vec::new();
    let lock_time = tx.lock_time;
    if lock_time.to_consensus_u32() != 0 {
        if lock_time.is_block_height() {
            warnings.push(Warning::LockedUntilBlock(lock_time.to_consensus_u32()));
        } else {
            warnings.push(Warning::LockedUntilTime(lock_time.to_consensus_u32()));
        }
    }
    if non_standard_inputs > 0 {
        warnings.push(Warning::NonStandardInputs(non_standard_inputs));
    }
    if non_standard_outputs > 0 {
        warnings.push(Warning::NonStandardOutputs(non_standard_outputs));
    }

    let output_addresses: HashSet<&str> =
        output_address_amounts.iter().filter_map(|(address, _)| address.as_deref()).collect();
    if output_addresses.len() != resolvable_outputs {
        warnings.push(Warning::DuplicateOutputAddress);
    }
    let input_addresses: HashSet<&str> =
        input_address_amounts.iter().filter_map(|(address, _)| address.as_deref()).collect();
    if !output_addresses.is_disjoint(&input_addresses) {
        warnings.push(Warning::AddressReuse);
    }

    log::debug!(
        "集計完了: 入力アドレス {} 件, 出力アドレス {} 件, 警告 {} 件",
        input_address_amounts.len(),
        output_address_amounts.len(),
        warnings.len()
    );
    TransactionInfo {
        input_address_amounts,
        output_address_amounts,
        warnings,
    }
}

/// 確認用の要約テキスト
pub fn summary_string(info: &TransactionInfo) -> String {
    let mut summary = String::new();
    for warning in info.warnings.iter() {
        summary.push_str(&format!("Warning: {}.\n", warning));
    }
    if !info.warnings.is_empty() {
        summary.push('\n');
    }

    summary.push_str("Input address amounts:");
    for (address, amount) in info.input_address_amounts.iter() {
        summary.push_str(&format!("\n{}{}: {}.", SUMMARY_INDENT, display_address(address), amount));
    }

    summary.push_str("\n\nOutput address amounts:");
    for (address, amount) in info.output_address_amounts.iter() {
        summary.push_str(&format!("\n{}{}: {}.", SUMMARY_INDENT, display_address(address), amount));
    }
    summary
}

fn display_address(address: &Option<String>) -> &str {
    address.as_deref().unwrap_or("Unknown address")
}
