//! Command-line entry points.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppContext;
use crate::config::Settings;
use crate::generate::GroupProfile;
use crate::worker::{retry_document, upload_document, AmqpBroker, Broker, UploadLimits};

#[derive(Parser)]
#[command(name = "docrig", version, about = "Retrieval-augmented QA over engineering documents")]
struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the vector collection, event schema, and object bucket.
    Init,
    /// Run the ingestion worker loop against the broker.
    Worker,
    /// Upload a local file and dispatch its ingestion job.
    Ingest {
        file: PathBuf,
        #[arg(long)]
        group: i64,
        /// Process inline instead of dispatching to the broker.
        #[arg(long)]
        inline: bool,
    },
    /// Ask a question against one or more groups.
    Ask {
        query: String,
        #[arg(long, required = true)]
        group: Vec<i64>,
        #[arg(long, default_value = "general")]
        profile: String,
    },
    /// Reset a failed document and re-dispatch its job.
    Retry { document_id: i64 },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "docrig=debug"
    } else {
        "docrig=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();

    match cli.command {
        Command::Init => {
            let app = AppContext::init(settings).await?;
            app.index.ensure_index().await?;
            app.event_store.ensure_schema().await?;
            // Bucket creation needs the concrete store; reconnect here.
            let s3 = crate::store::S3ObjectStore::connect(&app.settings.object_store).await;
            s3.ensure_bucket().await?;
            println!("collection, event schema, and bucket are ready");
        }

        Command::Worker => {
            let app = AppContext::init(settings).await?;
            let broker =
                AmqpBroker::connect(&app.settings.broker_url, &app.settings.broker_queue).await?;
            let worker = app.worker();
            tracing::info!("worker started, waiting for jobs");
            broker
                .consume("docrig-worker", |job| {
                    let worker = &worker;
                    async move { worker.run_task(job.document_id).await.map(|_| ()) }
                })
                .await?;
        }

        Command::Ingest {
            file,
            group,
            inline,
        } => {
            let app = AppContext::init(settings).await?;
            let bytes = tokio::fs::read(&file).await?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| anyhow::anyhow!("path has no file name"))?;

            let limits = UploadLimits {
                allowed_extensions: app.settings.ingest.allowed_extensions.clone(),
                max_file_size_bytes: app.settings.max_file_size_bytes(),
            };
            let broker: Arc<dyn Broker> = if inline {
                Arc::new(crate::worker::MemoryBroker::new())
            } else {
                Arc::new(
                    AmqpBroker::connect(&app.settings.broker_url, &app.settings.broker_queue)
                        .await?,
                )
            };

            let record = upload_document(
                &app.documents,
                &app.objects,
                &broker,
                &limits,
                bytes,
                &filename,
                group,
            )
            .await?;
            println!("document {} uploaded ({})", record.id, record.filename);

            if inline {
                let report = app.worker().run_task(record.id).await?;
                println!(
                    "processed inline: {} pages, {} chunks",
                    report.pages, report.chunks
                );
            }
        }

        Command::Ask {
            query,
            group,
            profile,
        } => {
            let app = AppContext::init(settings).await?;
            let agent = app.agent();
            let ctx = crate::agent::QueryContext {
                group_ids: group,
                profile: GroupProfile::parse(&profile),
                ..Default::default()
            };
            let outcome = agent.run(&query, &ctx).await;

            println!("{}", outcome.answer);
            if !outcome.sources.is_empty() {
                println!("\nSources:");
                for source in &outcome.sources {
                    println!(
                        "  [Page {}, {}] score {:.3}",
                        source.page_number, source.filename, source.score
                    );
                }
            }
            tracing::info!(
                intent = %outcome.intent,
                retrieval_ms = outcome.retrieval_ms,
                generation_ms = outcome.generation_ms,
                trace = %outcome.trace_id,
                "query complete"
            );
        }

        Command::Retry { document_id } => {
            let app = AppContext::init(settings).await?;
            let broker: Arc<dyn Broker> = Arc::new(
                AmqpBroker::connect(&app.settings.broker_url, &app.settings.broker_queue).await?,
            );
            retry_document(&app.documents, &broker, document_id).await?;
            println!("document {document_id} reset to pending and re-dispatched");
        }
    }

    Ok(())
}
