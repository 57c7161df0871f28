use std::collections::HashSet;

use bitcoin::Network as BitcoinNetwork;
use reqwest::blocking::Client;
use serde_json::Value;

use crate::{
    config::ApiConfig,
    error::AppError,
    types::Utxo,
    utxo::{classify_inputs, normalize_fetched, utxos_from_signed_transactions},
};

/// アドレス検索APIのクライアント。
/// 全てblocking呼び出しで、リトライもタイムアウト設定もしない。
pub struct UtxoClient {
    client: Client,
    config: ApiConfig,
}

impl UtxoClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// `{base}/addr/{a1,a2,...}/utxo` からUTXOを取得して正規化する
    pub fn fetch_address_utxos(&self, addresses: &[String], network: BitcoinNetwork) -> Result<Vec<Utxo>, AppError> {
        let url = utxo_url(&self.config.utxo_api_base, addresses)?;
        log::info!("UTXOを取得します: {}", url);

        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            log::error!("UTXO取得リクエストが拒否されました: {:?}", response);
            return Err(AppError::HttpStatus {
                status: response.status().as_u16(),
            });
        }
        let payload: Value = response.json()?;
        let Value::Array(raw_utxos) = payload else {
            return Err(AppError::UnexpectedResponse(format!(
                "UTXOの配列を期待しましたが {} を受信しました",
                payload
            )));
        };

        let utxos = normalize_fetched(&raw_utxos, network)?;
        log::info!("{} 個のアドレスから {} 個のUTXOを取得しました。", addresses.len(), utxos.len());
        Ok(utxos)
    }

    /// どれか1つでも応答があれば接続中とみなす
    pub fn is_connected(&self) -> bool {
        let mut connected = false;
        for url in self.config.connectivity_urls.iter() {
            match self.client.get(url).send() {
                Ok(_) => connected = true,
                Err(e) => log::debug!("接続確認に失敗しました ({}): {}", url, e),
            }
        }
        connected
    }
}

fn utxo_url(base: &str, addresses: &[String]) -> Result<String, AppError> {
    if addresses.is_empty() {
        return Err(AppError::InputValidation("UTXOを取得するアドレスがありません".to_string()));
    }
    let unique: HashSet<&String> = addresses.iter().collect();
    if unique.len() != addresses.len() {
        return Err(AppError::InputValidation("アドレスが重複しています".to_string()));
    }
    Ok(format!("{}/addr/{}/utxo", base.trim_end_matches('/'), addresses.join(",")))
}

/// アドレスと署名済みトランザクションのリストからUTXOを集める。
/// 署名済みトランザクションがあればその出力を使い、なければAPIから取得する。
pub fn utxos_from_inputs(client: &UtxoClient, text: &str, network: BitcoinNetwork) -> Result<Vec<Utxo>, AppError> {
    let classified = classify_inputs(text, network)?;

    let utxos = if classified.signed_transactions.is_empty() {
        client.fetch_address_utxos(&classified.addresses, network)?
    } else {
        let addresses: HashSet<String> = classified.addresses.iter().cloned().collect();
        let utxos = utxos_from_signed_transactions(&classified.signed_transactions, &addresses, network)?;
        log::info!(
            "{} 個の署名済みトランザクションの {} 個のアドレス宛て出力から {} 個のUTXOを見つけました。",
            classified.signed_transactions.len(),
            classified.addresses.len(),
            utxos.len()
        );
        utxos
    };

    if utxos.is_empty() {
        return Err(AppError::InputValidation("UTXOが見つかりませんでした".to_string()));
    }
    Ok(utxos)
}
