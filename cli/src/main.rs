mod commands;

use access_point::{
    mock::MockTransport,
    sri_service::{SriEndpoints, SriServiceClient},
    FiscalTransport,
};
use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::AppConfig;
use ec_einv_core::models::Environment;
use queue::{AuditLog, InvoiceLifecycle, PipelineStore, PollPolicy, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ec-einv")]
#[command(about = "Electronic invoices for the SRI (Ecuador): build, sign, submit, authorize")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive a 49-digit access key
    AccessKey {
        #[arg(long)]
        tax_id: String,
        /// Emission date, YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        sequential: u32,
        #[arg(long)]
        establishment: Option<String>,
        #[arg(long)]
        emission_point: Option<String>,
        #[arg(long, default_value = "01")]
        document_type: String,
        #[arg(long)]
        numeric_code: Option<u32>,
    },
    /// Validate an access key and print its fields
    CheckKey { key: String },
    /// Render an invoice record (JSON) as the authority's XML
    Build {
        #[arg(long)]
        invoice: PathBuf,
        #[arg(long)]
        sequential: u32,
        #[arg(long)]
        establishment: Option<String>,
        #[arg(long)]
        emission_point: Option<String>,
        #[arg(long)]
        numeric_code: Option<u32>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Check the structure of a rendered invoice XML
    Validate {
        #[arg(long)]
        invoice: PathBuf,
    },
    /// Sign an invoice XML with a PKCS#12 certificate
    Sign {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        certificate: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify the XAdES signature of a signed invoice
    Verify {
        #[arg(long)]
        input: PathBuf,
    },
    /// Build, sign, submit and authorize an invoice record
    Issue {
        #[arg(long)]
        invoice: PathBuf,
        #[arg(long)]
        invoice_id: String,
        /// Next free sequential of the emission point when omitted
        #[arg(long)]
        sequential: Option<u32>,
        #[arg(long)]
        establishment: Option<String>,
        #[arg(long)]
        emission_point: Option<String>,
        #[arg(long)]
        certificate: Option<PathBuf>,
    },
    /// Submit a signed pipeline for reception
    Submit { key: String },
    /// Poll authorization for a received pipeline
    Authorize { key: String },
    /// Continue a pipeline from its stored state
    Resume {
        key: String,
        #[arg(long)]
        certificate: Option<PathBuf>,
    },
    /// Abandon a pipeline that has not been sent
    Cancel { key: String },
    /// Show one pipeline, or all of them
    Status { key: Option<String> },
    /// Inspect or change the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    /// Transport: "sri" or "mock"
    SetProvider { kind: String },
    SetEnvironment {
        #[arg(value_parser = parse_environment)]
        environment: Environment,
    },
    SetCertificate { path: PathBuf },
    /// Store the PKCS#12 passphrase in the OS keychain
    SetPassphrase { passphrase: String },
}

fn parse_environment(s: &str) -> Result<Environment, String> {
    match s {
        "test" | "pruebas" | "1" => Ok(Environment::Test),
        "production" | "produccion" | "2" => Ok(Environment::Production),
        other => Err(format!("unknown environment {other:?}, expected test or production")),
    }
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn create_transport(cfg: &AppConfig) -> Result<Arc<dyn FiscalTransport>> {
    match cfg.provider.kind.as_str() {
        "sri" => {
            let endpoints = |base: &Option<String>, environment| {
                base.as_deref()
                    .map(SriEndpoints::with_base)
                    .unwrap_or_else(|| SriEndpoints::for_environment(environment))
            };
            let test = endpoints(&cfg.provider.test_base_url, Environment::Test);
            let production = endpoints(&cfg.provider.production_base_url, Environment::Production);

            tracing::info!(environment = %cfg.environment, "Using SRI web services");
            Ok(SriServiceClient::with_endpoints(
                test,
                production,
                Duration::from_secs(cfg.provider.timeout_secs),
            )?)
        }
        "mock" => {
            tracing::info!("Using mock transport");
            Ok(MockTransport::shared())
        }
        other => Err(anyhow::anyhow!("Unknown provider kind {other:?}, expected sri or mock")),
    }
}

fn create_lifecycle(cfg: &AppConfig) -> Result<InvoiceLifecycle> {
    let store = PipelineStore::open(&cfg.store.path)?;
    let transport = create_transport(cfg)?;
    Ok(InvoiceLifecycle::new(store, transport)
        .with_audit_log(AuditLog::new(&cfg.store.audit_log))
        .with_retry_policy(RetryPolicy {
            max_attempts: cfg.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry.base_delay_ms),
            multiplier: cfg.retry.multiplier,
        })
        .with_poll_policy(PollPolicy {
            interval: Duration::from_millis(cfg.polling.interval_ms),
            window: Duration::from_secs(cfg.polling.window_secs),
        }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Falling back to default configuration");
        AppConfig::default()
    });

    match cli.command {
        Commands::AccessKey {
            tax_id,
            date,
            sequential,
            establishment,
            emission_point,
            document_type,
            numeric_code,
        } => {
            let seq = commands::sequence(&cfg, establishment, emission_point, sequential)?;
            let key = commands::access_key(&seq, &tax_id, date, &document_type, numeric_code)?;
            println!("{key}");
        }
        Commands::CheckKey { key } => commands::check_key(&key)?,
        Commands::Build {
            invoice,
            sequential,
            establishment,
            emission_point,
            numeric_code,
            out,
        } => {
            let seq = commands::sequence(&cfg, establishment, emission_point, sequential)?;
            let xml = commands::build(&invoice, &seq, numeric_code)?;
            commands::emit(&xml, out.as_deref())?;
        }
        Commands::Validate { invoice } => commands::validate(&invoice)?,
        Commands::Sign {
            input,
            certificate,
            out,
        } => {
            let signed = commands::sign(&cfg, &input, certificate)?;
            commands::emit(&signed, out.as_deref())?;
        }
        Commands::Verify { input } => commands::verify(&input)?,
        Commands::Issue {
            invoice,
            invoice_id,
            sequential,
            establishment,
            emission_point,
            certificate,
        } => {
            let material = commands::signing_material(&cfg, certificate)?;
            let lifecycle = create_lifecycle(&cfg)?;
            let numbering = commands::Numbering {
                establishment,
                emission_point,
                sequential,
            };
            commands::issue(&cfg, &lifecycle, &invoice, &invoice_id, numbering, &material)
                .await?;
        }
        Commands::Submit { key } => {
            let lifecycle = create_lifecycle(&cfg)?;
            let record = lifecycle.submit(&commands::parse_key(&key)?).await?;
            commands::print_record(&record)?;
        }
        Commands::Authorize { key } => {
            let lifecycle = create_lifecycle(&cfg)?;
            let outcome = lifecycle.authorize(&commands::parse_key(&key)?).await?;
            commands::print_outcome(&outcome)?;
        }
        Commands::Resume { key, certificate } => {
            let lifecycle = create_lifecycle(&cfg)?;
            let material = commands::signing_material(&cfg, certificate).ok();
            let outcome = lifecycle
                .resume(&commands::parse_key(&key)?, material.as_ref())
                .await?;
            commands::print_outcome(&outcome)?;
        }
        Commands::Cancel { key } => {
            let lifecycle = create_lifecycle(&cfg)?;
            let record = lifecycle.cancel(&commands::parse_key(&key)?).await?;
            commands::print_record(&record)?;
        }
        Commands::Status { key } => {
            let lifecycle = create_lifecycle(&cfg)?;
            match key {
                Some(key) => {
                    let record = lifecycle.status(&commands::parse_key(&key)?).await?;
                    commands::print_record(&record)?;
                }
                None => commands::print_summaries(&lifecycle.list().await?),
            }
        }
        Commands::Config { action } => {
            let mut cfg = cfg;
            match action {
                ConfigAction::Show => println!("{}", serde_json::to_string_pretty(&cfg)?),
                ConfigAction::Path => println!("{}", config::config_path()?.display()),
                ConfigAction::SetProvider { kind } => {
                    if !matches!(kind.as_str(), "sri" | "mock") {
                        anyhow::bail!("Unknown provider kind {kind:?}, expected sri or mock");
                    }
                    cfg.provider.kind = kind;
                    config::store(&cfg)?;
                }
                ConfigAction::SetEnvironment { environment } => {
                    cfg.environment = environment;
                    config::store(&cfg)?;
                }
                ConfigAction::SetCertificate { path } => {
                    cfg.signing.certificate_path = Some(path);
                    config::store(&cfg)?;
                }
                ConfigAction::SetPassphrase { passphrase } => {
                    config::store_secret(config::P12_PASSPHRASE_KEY, &passphrase)?;
                    println!("Passphrase stored in the OS keychain");
                }
            }
        }
    }

    Ok(())
}
