use std::path::PathBuf;
use bitcoin::consensus::encode::Error as BitcoinEncodeError;
use bitcoin::key::FromWifError as BitcoinKeyError; // WIFデコードエラー用
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("16進数デコードエラー: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Bitcoinコンセンサスエンコードエラー: {0}")]
    BitcoinConsensus(#[from] BitcoinEncodeError),

    #[error("Bitcoin秘密鍵(WIF)処理エラー: {0}")]
    BitcoinKey(#[from] BitcoinKeyError),

    #[error("HTTPリクエストエラー: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UTXO取得リクエストがステータス {status} で拒否されました")]
    HttpStatus { status: u16 },

    #[error("予期しないレスポンス: {0}")]
    UnexpectedResponse(String),

    #[error("アドレス \"{address}\" は無効です: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("不正なUTXO (プロパティ {property}): {reason}")]
    MalformedUtxo {
        property: &'static str,
        reason: String,
    },

    #[error("UTXO取得元のデータ不整合: 受信 {raw} 件に対し重複除去後 {unique} 件")]
    UpstreamInconsistency { raw: usize, unique: usize },

    #[error("未署名トランザクションからはUTXOを抽出できません (署名前はtxidが確定しない)")]
    UnsignedTransactionRejected,

    #[error("おつりアドレス (最後の出力アドレス) に金額は指定できません。\"{entry}\" から \"{suffix}\" を削除してください")]
    ChangeAddressHasAmount { entry: String, suffix: String },

    #[error("同じUTXO ({txid}:{vout}) が複数回指定されています")]
    DuplicateUtxo { txid: String, vout: u32 },

    #[error("UTXOの合計額が0です")]
    ZeroFunds,

    #[error("分割額が0になります: 合計 {total} sats を {outputs} 個の出力で分割できません")]
    SplitAmountTooSmall { total: u64, outputs: usize },

    #[error("金額 \"{amount}\" は無効です: {reason}")]
    InvalidOutputAmount { amount: String, reason: String },

    #[error("詳細設定 {setting} が無効です: {reason}")]
    InvalidAdvancedSetting {
        setting: &'static str,
        reason: String,
    },

    #[error("ネットワーク不整合: CLI指定 ({cli_network}) vs WIF/アドレス ({inferred_network})")]
    NetworkMismatch {
        cli_network: String,
        inferred_network: String,
    },

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("資金不足: 利用可能な総額 {available} sats, 要求額 {required} sats (手数料 {fee} sats を含む)")]
    InsufficientFunds {
        available: u64,
        required: u64,
        fee: u64,
    },

    #[error("署名されていない入力が {count} 個あります")]
    UnsignedInputs { count: usize },

    #[error("出力 {index} の金額 {satoshis} sats はダスト閾値未満です")]
    DustOutput { index: usize, satoshis: u64 },

    #[error("不明なスクリプトタイプ: {script_hex}")]
    UnknownScriptType { script_hex: String },

    #[error("内部エラー: {0}")]
    Internal(String),
}
