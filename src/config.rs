use bitcoin::Network as BitcoinNetwork;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::types::{parse_address, OutputRequest, MAX_SAFE_INTEGER};

pub const DEFAULT_UTXO_API_BASE: &str = "https://api.bitindex.network/api/v3/main";
pub const DEFAULT_CONNECTIVITY_URLS: [&str; 2] = [
    "https://api.bitindex.network/api/",
    "https://api.whatsonchain.com/v1/bsv/main/woc",
];

/// デフォルトの手数料率 (sats/kB)
pub const DEFAULT_FEE_PER_KB: u64 = 500;
/// 手数料率の安全上限 (sats/kB)
pub const FEE_PER_KB_SAFETY_LIMIT: u64 = 10_000;

const ADDRESS_AMOUNT_DELIMITER: char = ':';

/// 外部APIの接続先
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub utxo_api_base: String,
    pub connectivity_urls: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            utxo_api_base: DEFAULT_UTXO_API_BASE.to_string(),
            connectivity_urls: DEFAULT_CONNECTIVITY_URLS.iter().map(|u| u.to_string()).collect(),
        }
    }
}

/// 詳細設定 JSON: `{"nLockTime": 0, "feePerKb": 500}`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSettings {
    pub n_lock_time: u32,
    pub fee_per_kb: u64,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            n_lock_time: 0,
            fee_per_kb: DEFAULT_FEE_PER_KB,
        }
    }
}

/// ビルダーに渡す上書き設定。None はデフォルトのまま。
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BuildSettings {
    pub fee_per_kb: Option<u64>,
    pub n_lock_time: Option<u64>,
}

impl AdvancedSettings {
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let value: Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or_else(|| {
            AppError::InputValidation("詳細設定はJSONオブジェクトである必要があります".to_string())
        })?;

        let n_lock_time = integer_setting(obj, "nLockTime", u32::MAX as u64)?;
        let fee_per_kb = integer_setting(obj, "feePerKb", FEE_PER_KB_SAFETY_LIMIT)?;

        Ok(Self {
            n_lock_time: n_lock_time as u32,
            fee_per_kb,
        })
    }

    /// デフォルトと異なる値だけを残す
    pub fn difference_from_default(&self) -> BuildSettings {
        let default = Self::default();
        let diff = BuildSettings {
            fee_per_kb: (self.fee_per_kb != default.fee_per_kb).then_some(self.fee_per_kb),
            n_lock_time: (self.n_lock_time != default.n_lock_time).then_some(self.n_lock_time as u64),
        };
        if diff != BuildSettings::default() {
            log::info!("デフォルトから変更された詳細設定: {:?}", diff);
        }
        diff
    }

    pub fn to_pretty_json(&self) -> Result<String, AppError> {
        crate::transaction::to_tab_indented_json(self)
    }
}

impl BuildSettings {
    /// 適用前の検証。上限違反は設定名つきで報告する。
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(fee_per_kb) = self.fee_per_kb {
            if fee_per_kb > FEE_PER_KB_SAFETY_LIMIT {
                return Err(AppError::InvalidAdvancedSetting {
                    setting: "feePerKb",
                    reason: format!("{} は安全上限 {} を超えています", fee_per_kb, FEE_PER_KB_SAFETY_LIMIT),
                });
            }
        }
        if let Some(n_lock_time) = self.n_lock_time {
            if n_lock_time > u32::MAX as u64 {
                return Err(AppError::InvalidAdvancedSetting {
                    setting: "nLockTime",
                    reason: format!("{} は {} 以下である必要があります", n_lock_time, u32::MAX),
                });
            }
        }
        Ok(())
    }
}

fn integer_setting(obj: &Map<String, Value>, key: &'static str, max: u64) -> Result<u64, AppError> {
    let invalid = |reason: String| AppError::InvalidAdvancedSetting { setting: key, reason };
    let value = obj
        .get(key)
        .ok_or_else(|| invalid("必須プロパティがありません (大文字小文字を区別)".to_string()))?;
    let Value::Number(number) = value else {
        return Err(invalid(format!("{} は整数である必要があります", value)));
    };

    if let Some(n) = number.as_u64() {
        if n > max {
            return Err(invalid(format!("{} は {} 以下である必要があります", n, max)));
        }
        return Ok(n);
    }
    if number.as_i64().is_some() {
        return Err(invalid(format!("{} は負の値にできません", number)));
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f < 0.0 => Err(invalid(format!("{} は負の値にできません", number))),
        Some(f) if f.fract() == 0.0 => Err(invalid(format!("{} は {} 以下である必要があります", number, max))),
        _ => Err(invalid(format!("{} は整数である必要があります", number))),
    }
}

/// カンマまたは改行で区切られたリストを分割する。空行は除く。
pub fn split_list(text: &str) -> Vec<String> {
    text.split([',', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// 出力指定テキスト (`address` または `address:amount`) をパースする。
/// 最後のアドレスはおつり用なので金額を付けられない。
pub fn parse_output_requests(text: &str, network: BitcoinNetwork) -> Result<Vec<OutputRequest>, AppError> {
    let entries = split_list(text);
    let mut requests = Vec::with_capacity(entries.len());

    for entry in entries.iter() {
        let (address, amount_str) = match entry.split_once(ADDRESS_AMOUNT_DELIMITER) {
            Some((address, amount)) => (address.trim(), Some(amount)),
            None => (entry.as_str(), None),
        };
        parse_address(address, network)?;
        let satoshis = amount_str.map(parse_output_amount).transpose()?;
        log::debug!("出力指定: address={}, satoshis={:?}", address, satoshis);
        requests.push(OutputRequest::new(address, satoshis));
    }

    let last = requests
        .last()
        .ok_or_else(|| AppError::InputValidation("有効な出力アドレスがありません".to_string()))?;
    if last.satoshis.is_some() {
        let entry = entries.last().cloned().unwrap_or_default();
        let suffix = entry
            .find(ADDRESS_AMOUNT_DELIMITER)
            .map(|i| entry[i..].to_string())
            .unwrap_or_default();
        return Err(AppError::ChangeAddressHasAmount { entry, suffix });
    }

    Ok(requests)
}

fn parse_output_amount(untrimmed: &str) -> Result<u64, AppError> {
    let invalid = |reason: String| AppError::InvalidOutputAmount {
        amount: untrimmed.to_string(),
        reason,
    };
    let trimmed = untrimmed.trim();
    let parsed: i128 = trimmed
        .parse()
        .ok()
        .filter(|n: &i128| n.to_string() == trimmed)
        .ok_or_else(|| invalid("整数である必要があります".to_string()))?;

    if parsed < 1 {
        Err(invalid("0より大きい整数である必要があります".to_string()))
    } else if parsed > MAX_SAFE_INTEGER as i128 {
        Err(invalid(format!("{} 未満の整数である必要があります", MAX_SAFE_INTEGER + 1)))
    } else {
        Ok(parsed as u64)
    }
}
