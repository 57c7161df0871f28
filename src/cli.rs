use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use bitcoin::Network as BitcoinNetwork;
use crate::config::DEFAULT_UTXO_API_BASE;
use crate::error::AppError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 使用するネットワーク ("bitcoin", "mainnet", "testnet", "regtest")
    #[clap(short, long, value_parser, global = true, default_value = "mainnet")]
    pub network: String,

    /// UTXO取得APIのベースURL
    #[clap(long, value_parser, global = true, env = "BSV_UTXO_API_URL", default_value = DEFAULT_UTXO_API_BASE)]
    pub api_url: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// アドレスまたは署名済みトランザクションからUTXOを取得して正規化する
    Utxos(InputsSource),

    /// 未署名トランザクションを作成する (JSON形式で出力)
    Create {
        /// UTXO JSONファイルへのパス
        #[clap(long, value_parser, conflicts_with = "from", required_unless_present = "from")]
        utxos_file: Option<PathBuf>,

        /// アドレスまたは署名済みトランザクション (カンマまたは改行区切り)
        #[clap(long, value_parser)]
        from: Option<String>,

        /// 出力指定 (`address` または `address:amount`、最後はおつりアドレス)
        #[clap(long, value_parser)]
        outputs: String,

        /// 詳細設定JSONファイル (`{"nLockTime": 0, "feePerKb": 500}`)
        #[clap(long, value_parser)]
        settings_file: Option<PathBuf>,

        /// 結果を保存するファイルへのパス
        #[clap(short, long, value_parser)]
        output_file: Option<PathBuf>,
    },

    /// トランザクションに署名する (16進数で出力)
    Sign {
        /// JSONまたは16進数のトランザクションファイルへのパス
        #[clap(long, value_parser)]
        tx_file: PathBuf,

        /// WIF秘密鍵ファイルへのパス (カンマまたは改行区切り)
        #[clap(long, value_parser)]
        keys_file: PathBuf,

        #[clap(short, long, value_parser)]
        output_file: Option<PathBuf>,

        /// オンライン確認を行わない
        #[clap(long)]
        skip_connectivity_check: bool,
    },

    /// 詳細設定ファイルのテンプレート (デフォルト値) を表示する
    Settings,

    /// トランザクションの内容を表示する
    View {
        #[clap(long, value_parser)]
        tx_file: PathBuf,

        /// 要約ではなく全体をJSONで表示する
        #[clap(long)]
        raw: bool,
    },
}

#[derive(Args, Debug)]
#[clap(group(clap::ArgGroup::new("source").required(true).args(["from", "from_file"])))]
pub struct InputsSource {
    /// アドレスまたは署名済みトランザクション (カンマまたは改行区切り)
    #[clap(long, value_parser)]
    pub from: Option<String>,

    /// 上記を記述したファイルへのパス
    #[clap(long, value_parser)]
    pub from_file: Option<PathBuf>,
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}
