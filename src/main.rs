use clap::Parser;
use tern::app;
use tern::cli::Cli;
use tern::ui::{self, InfoFormat};

#[tokio::main]
async fn main() {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let format = cli
        .info_format
        .parse::<InfoFormat>()
        .unwrap_or(InfoFormat::Line);
    ui::init_tracing(format);

    match app::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let message = format!("{e:#}");
            ui::main_exception(&message);
            std::process::exit(1);
        }
    }
}
