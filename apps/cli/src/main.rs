use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use askai_core_sdk::models::ProviderId;
use askai_core_sdk::server::AppState;
use askai_core_sdk::session::ConversationSession;
use askai_core_sdk::store::{SettingsStore, SqliteStore};
use askai_core_sdk::transport::{HttpTransport, ReqwestTransport};
use askai_core_sdk::{catalog, registry, server, telemetry};

/**
 * \brief CLI 程序入口：多服务商划词/截图问答的终端外壳。
 */
#[derive(Parser, Debug)]
#[command(name = "askai", version, about = "AskAI multi-provider chat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 写入指定服务商的 API Key；空值表示删除。
     */
    Key {
        #[arg(long)]
        provider: String,
        #[arg(long, default_value = "")]
        api_key: String,
    },

    /**
     * \brief 更新或查看设置（主题、划词按钮、遥测开关）。
     */
    Config {
        #[arg(long)]
        theme: Option<String>,
        #[arg(long)]
        selection_button: Option<bool>,
        #[arg(long)]
        telemetry: Option<bool>,
    },

    /**
     * \brief 列出指定服务商的模型目录；未配置凭据时展示后备目录。
     */
    Models {
        #[arg(long)]
        provider: String,
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },

    /**
     * \brief 围绕一段选中文本或截图发起对话。
     * \param context 选中文本，作为会话的前置上下文
     * \param image   截图 data URL（data:image/...;base64,...）
     */
    Ask {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long, default_value_t = false)]
        interactive: bool,
    },

    /**
     * \brief 清空模型目录缓存。
     */
    ClearCache,

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let db_path = std::env::var("ASKAI_DB").unwrap_or_else(|_| "askai.db".to_string());
    let store = Arc::new(SqliteStore::open(&db_path).context("open settings store failed")?);
    let telemetry_enabled = store.telemetry_enabled().await.unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);
    let transport = Arc::new(ReqwestTransport::new());

    match cli.command {
        Commands::Key { provider, api_key } => {
            let provider: ProviderId = provider.parse()?;
            let trimmed = api_key.trim();
            store
                .set_api_key(provider, Some(trimmed))
                .await
                .context("save API key failed")?;
            if trimmed.is_empty() {
                println!("Removed API key for {}", provider);
            } else {
                println!("Saved API key for {}", provider);
            }
        }

        Commands::Config {
            theme,
            selection_button,
            telemetry: telemetry_flag,
        } => {
            if let Some(theme) = theme {
                store
                    .set_theme(theme.parse()?)
                    .await
                    .context("save theme failed")?;
            }
            if let Some(enabled) = selection_button {
                store
                    .set_selection_button_enabled(enabled)
                    .await
                    .context("save selection button failed")?;
            }
            if let Some(enabled) = telemetry_flag {
                store
                    .set_telemetry_enabled(enabled)
                    .await
                    .context("save telemetry failed")?;
                telemetry::set_enabled(enabled);
            }
            print_config(store.as_ref()).await?;
        }

        Commands::Models { provider, refresh } => {
            let provider: ProviderId = provider.parse()?;
            if refresh {
                catalog::clear_model_cache(store.as_ref())
                    .await
                    .context("clear model cache failed")?;
            }
            let fetched = catalog::get_models(store.as_ref(), transport.as_ref(), provider)
                .await
                .context("fetch models failed")?;
            match fetched {
                Some(models) => {
                    for model in models {
                        println!("{}  ({})", model.id, model.name);
                    }
                }
                None => {
                    println!(
                        "No API key configured for {}; showing fallback catalog.",
                        provider
                    );
                    for model in registry::provider_info(provider).fallback_models() {
                        println!("{}  ({})", model.id, model.name);
                    }
                }
            }
        }

        Commands::Ask {
            prompt,
            provider,
            model,
            context,
            image,
            interactive,
        } => {
            let (provider, model) = resolve_target(store.as_ref(), provider, model).await?;
            let mut session = if let Some(data_url) = image {
                ConversationSession::for_screenshot(provider, &model, data_url)
            } else if let Some(selected) = context {
                ConversationSession::for_selection(provider, &model, selected)
            } else {
                ConversationSession::new(provider, &model)
            };
            store
                .set_last_used(provider, &model)
                .await
                .context("save last used failed")?;
            telemetry::log_event(
                "cli.ask",
                &format!(
                    "provider={} model={} prompt_len={}",
                    provider,
                    model,
                    prompt.len()
                ),
            );

            submit(&mut session, store.as_ref(), transport.as_ref(), &prompt).await;

            if interactive {
                loop {
                    print!("> ");
                    io::stdout().flush().ok();
                    let mut line = String::new();
                    if io::stdin().lock().read_line(&mut line)? == 0 {
                        break;
                    }
                    let follow_up = line.trim();
                    if follow_up.is_empty() || follow_up == "exit" {
                        break;
                    }
                    submit(&mut session, store.as_ref(), transport.as_ref(), follow_up).await;
                }
            }
        }

        Commands::ClearCache => {
            catalog::clear_model_cache(store.as_ref())
                .await
                .context("clear model cache failed")?;
            println!("Model cache cleared");
        }

        Commands::Serve { addr } => {
            let state = AppState {
                store: store.clone(),
                transport: transport.clone(),
            };
            server::run(&addr, state).await?;
        }
    }

    Ok(())
}

/**
 * \brief 决定本次会话使用的服务商与模型：显式参数优先，
 *        其次是最近使用项，最后退回注册表目录的第一项。
 */
async fn resolve_target(
    store: &dyn SettingsStore,
    provider: Option<String>,
    model: Option<String>,
) -> Result<(ProviderId, String)> {
    let last_used = store.last_used().await?;
    let provider = match provider {
        Some(raw) => raw.parse()?,
        None => last_used
            .as_ref()
            .map(|(provider, _)| *provider)
            .unwrap_or(ProviderId::OpenAi),
    };
    let model = match model {
        Some(model) => model,
        None => match last_used {
            Some((last_provider, last_model)) if last_provider == provider => last_model,
            _ => registry::provider_info(provider)
                .fallback_models()
                .into_iter()
                .next()
                .map(|entry| entry.id)
                .context("provider has no fallback models")?,
        },
    };
    Ok((provider, model))
}

/**
 * \brief 提交一条提问并打印结果；失败时会话历史保持不变，可直接重试。
 */
async fn submit(
    session: &mut ConversationSession,
    store: &dyn SettingsStore,
    transport: &dyn HttpTransport,
    prompt: &str,
) {
    match session.ask(store, transport, prompt).await {
        Ok(answer) => println!("{}", answer),
        Err(err) => {
            telemetry::log_error("cli.ask", &format!("error={}", err));
            eprintln!("Error: {}", err);
        }
    }
}

async fn print_config(store: &dyn SettingsStore) -> Result<()> {
    println!("theme={}", store.theme().await?.as_str());
    println!(
        "selection_button={}",
        store.selection_button_enabled().await?
    );
    println!("telemetry={}", store.telemetry_enabled().await?);

    let mut configured = Vec::new();
    for provider in ProviderId::ALL {
        if store.api_key(provider).await?.is_some() {
            configured.push(provider.as_str());
        }
    }
    if configured.is_empty() {
        println!("configured=(none)");
    } else {
        println!("configured={}", configured.join(","));
    }

    if let Some((provider, model)) = store.last_used().await? {
        println!("last_used={} {}", provider, model);
    }
    Ok(())
}
