use std::process::ExitCode;

mod app;
mod config;
mod context;
mod coordinator;
mod dom;
mod keyboard;
mod messages;
mod overlay;
mod prefs;
mod shell;
mod speed;
mod tracker;
mod utils;

#[tokio::main]
async fn main() -> ExitCode {
    let result = app::start().await;
    match result {
        Ok(..) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
