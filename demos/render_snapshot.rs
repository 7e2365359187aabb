//! Render a snapshot through ComfyUI and save the result.
//!
//! Requires a running ComfyUI instance with the Flux-2 Klein models and
//! the `easy loadImageBase64` custom node installed.
//!
//! ```sh
//! RUST_LOG=comfy_render=debug cargo run --example render_snapshot -- \
//!     snapshot.png "photorealistic render, soft daylight" [settings.json]
//! ```
//!
//! Press Ctrl+C once to stop the render.

use comfy_render::{JobOrchestrator, OrchestratorConfig, RenderOutcome, RenderRequest, Settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(snapshot), Some(prompt)) = (args.next(), args.next()) else {
        eprintln!("usage: render_snapshot <snapshot.png> <prompt> [settings.json]");
        return Ok(());
    };
    let settings = match args.next() {
        Some(path) => Settings::load_or_default(&PathBuf::from(path)),
        None => Settings::default(),
    };
    println!("ComfyUI: {}", settings.service_base_url);

    let orchestrator = JobOrchestrator::new(OrchestratorConfig::default());
    let mut status = orchestrator.subscribe();
    let handle = orchestrator.start(RenderRequest::new(snapshot, prompt), &settings)?;

    // Display surface: print each status line as it arrives.
    let printer = tokio::spawn(async move {
        while let Ok(update) = status.recv().await {
            println!("[{}] {}", update.state.as_str(), update.message);
            if update.state.is_terminal() {
                break;
            }
        }
    });

    let stop = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.request();
        }
    });

    let outcome = handle.outcome().await;
    let _ = printer.await;

    match outcome {
        RenderOutcome::Succeeded {
            image,
            artifact,
            seed,
            ..
        } => {
            let path = PathBuf::from("ComfyUI_Render.png");
            std::fs::write(&path, &image)?;
            println!(
                "Saved {} ({} bytes, source {}, seed {})",
                path.display(),
                image.len(),
                artifact.filename,
                seed
            );
        }
        RenderOutcome::Failed(e) => eprintln!("Render failed:\n\n{}", e),
        RenderOutcome::Cancelled => println!("Render stopped."),
    }

    Ok(())
}
