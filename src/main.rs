use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use bitcoin::secp256k1::{All as AllContext, Secp256k1};
use clap::Parser;

use bsv_tx_creator::builder::create_unsigned_transaction;
use bsv_tx_creator::cli::{parse_network, CliArgs, Command, InputsSource};
use bsv_tx_creator::config::{parse_output_requests, AdvancedSettings, ApiConfig, BuildSettings};
use bsv_tx_creator::error::AppError;
use bsv_tx_creator::fetch::{utxos_from_inputs, UtxoClient};
use bsv_tx_creator::inspect::{summary_string, transaction_info};
use bsv_tx_creator::signer::{parse_private_keys, sign_transaction};
use bsv_tx_creator::transaction::TxDraft;
use bsv_tx_creator::utxo::{parse_utxos_json, utxos_to_json};

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let cli_network = parse_network(&args.network)?;
    log::info!("指定されたネットワーク: {:?}", cli_network);

    let api_config = ApiConfig {
        utxo_api_base: args.api_url.clone(),
        ..ApiConfig::default()
    };

    match args.command {
        Command::Utxos(source) => {
            let text = read_inputs_source(&source)?;
            let client = UtxoClient::new(api_config);
            let utxos = utxos_from_inputs(&client, &text, cli_network)?;
            println!("{}", utxos_to_json(&utxos)?);
        }
        Command::Create {
            utxos_file,
            from,
            outputs,
            settings_file,
            output_file,
        } => {
            let utxos = match (utxos_file, from) {
                (Some(path), _) => {
                    let content = read_text(&path)?;
                    parse_utxos_json(&content, cli_network).map_err(|e| with_file_path(e, &path))?
                }
                (None, Some(text)) => utxos_from_inputs(&UtxoClient::new(api_config), &text, cli_network)?,
                (None, None) => {
                    return Err(AppError::InputValidation(
                        "--utxos-file または --from を指定してください".to_string(),
                    ));
                }
            };
            log::info!("{} 個のUTXOを使用します。", utxos.len());

            let requests = parse_output_requests(&outputs, cli_network)?;
            let settings = match settings_file {
                Some(path) => {
                    let content = read_text(&path)?;
                    AdvancedSettings::parse(&content)
                        .map_err(|e| with_file_path(e, &path))?
                        .difference_from_default()
                }
                None => BuildSettings::default(),
            };

            let draft = create_unsigned_transaction(&utxos, &requests, &settings, cli_network)?;
            let json = draft.to_compact_json()?;
            println!("{}", json);
            if let Some(path) = output_file {
                write_text(&path, &json)?;
            }
        }
        Command::Sign {
            tx_file,
            keys_file,
            output_file,
            skip_connectivity_check,
        } => {
            if !skip_connectivity_check && UtxoClient::new(api_config).is_connected() {
                log::warn!("インターネットに接続されています。オンラインでの署名は推奨されません。");
            }

            let draft = TxDraft::parse(&read_text(&tx_file)?)?;
            let private_keys = parse_private_keys(&read_text(&keys_file)?)?;
            log::info!("{} 個の秘密鍵を読み込みました。", private_keys.len());

            let secp: Secp256k1<AllContext> = Secp256k1::new();
            let signed = sign_transaction(&draft, &private_keys, cli_network, &secp)?;
            let serialized_tx = signed.checked_serialize_hex()?;
            log::info!("署名済みトランザクションの生成に成功しました。txid: {}", signed.txid());

            println!("{}", serialized_tx);
            if let Some(path) = output_file {
                write_text(&path, &serialized_tx)?;
            }
        }
        Command::Settings => {
            println!("{}", AdvancedSettings::default().to_pretty_json()?);
        }
        Command::View { tx_file, raw } => {
            let draft = TxDraft::parse(&read_text(&tx_file)?)?;
            if raw {
                println!("{}", draft.to_pretty_json()?);
            } else {
                println!("{}", summary_string(&transaction_info(&draft, cli_network)));
            }
        }
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}

fn read_inputs_source(source: &InputsSource) -> Result<String, AppError> {
    match (&source.from, &source.from_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => read_text(path),
        (None, None) => Err(AppError::InputValidation(
            "--from または --from-file を指定してください".to_string(),
        )),
    }
}

fn read_text(path: &Path) -> Result<String, AppError> {
    fs::read_to_string(path).map_err(|e| {
        log::error!("入力ファイルの読み込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })
}

fn write_text(path: &Path, content: &str) -> Result<(), AppError> {
    let mut output_file = File::create(path).map_err(|e| {
        log::error!("出力ファイルの作成に失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    output_file.write_all(content.as_bytes()).map_err(|e| {
        log::error!("出力ファイルへの書き込みに失敗しました。");
        AppError::Io(e)
    })?;
    log::info!("結果を {:?} に保存しました。", path);
    Ok(())
}

fn with_file_path(error: AppError, path: &Path) -> AppError {
    match error {
        AppError::Json(source) => {
            log::error!("入力JSONのパースに失敗しました。");
            AppError::JsonParse {
                file_path: PathBuf::from(path),
                source,
            }
        }
        other => other,
    }
}

