use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use tandem::config::Config;
use tandem::deadline::RequestDeadline;
use tandem::dispatch::pool::ProviderPool;
use tandem::generator::ResponseGenerator;
use tandem::sanitizer::PassthroughSanitizer;
use tandem::stream::RacingStreamCoordinator;

const SYSTEM_PROMPT: &str = "You are a concise, accurate assistant.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let mut stream = false;
    let mut questions = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--stream" {
            stream = true;
        } else {
            questions.push(arg);
        }
    }
    if questions.is_empty() {
        anyhow::bail!("usage: tandem [--stream] <question>...");
    }

    let config = Config::load().context("loading config")?;
    let pool = ProviderPool::from_config(&config).context("building provider pool")?;
    tracing::info!(?pool, questions = questions.len(), stream, "tandem starting");
    if config.dispatch.tools_enabled {
        tracing::warn!("tools enabled but the command line has no tool executor; answering without tools");
    }

    let pairs: Vec<(String, String)> = questions
        .into_iter()
        .map(|q| (SYSTEM_PROMPT.to_string(), q))
        .collect();
    let deadline = RequestDeadline::create(config.dispatch.request_timeout());
    let sanitizer = Arc::new(PassthroughSanitizer);

    if stream {
        let coordinator = RacingStreamCoordinator::new(pool, sanitizer, &config.dispatch);
        let streams = coordinator.stream_batch_distributed(&pairs, &deadline);
        let mut stdout = tokio::io::stdout();
        // Printed in question order; later streams keep buffering meanwhile.
        for (i, mut answer) in streams.into_iter().enumerate() {
            stdout.write_all(format!("[{}] ", i + 1).as_bytes()).await?;
            while let Some(chunk) = answer.next().await {
                match chunk {
                    Ok(text) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Err(e) => {
                        stdout.write_all(format!("\n{}", e.user_message()).as_bytes()).await?;
                    }
                }
            }
            stdout.write_all(b"\n").await?;
        }
    } else {
        let generator = ResponseGenerator::new(pool, sanitizer, &config.dispatch);
        let answers = if pairs.len() == 1 {
            let (system, user) = &pairs[0];
            vec![match generator.generate_one(system, user, &deadline).await {
                Ok(text) => text,
                Err(e) => e.user_message(),
            }]
        } else {
            generator.generate_batch(&pairs, &deadline).await
        };
        for (i, answer) in answers.iter().enumerate() {
            println!("[{}] {answer}", i + 1);
        }
    }

    deadline.finish();
    tracing::info!(elapsed_ms = deadline.elapsed_ms(), "tandem done");
    Ok(())
}
