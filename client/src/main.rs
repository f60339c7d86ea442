mod cli;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // stdout queda para la salida JSON
    let conf = common::config::LoggerConfig {
        level: "warn".into(),
        ..Default::default()
    };
    common::logging::init(&conf, "funnel=warn");
    match cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
