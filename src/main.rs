#[tokio::main]
async fn main() {
    if let Err(e) = lingobot::run().await {
        tracing::error!(error = %e, "lingobot failed to start");
        eprintln!("lingobot: {e}");
        std::process::exit(1);
    }
}
