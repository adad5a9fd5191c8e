use env_logger::{Builder, Env};
use log::error;

fn init_logger() {
    // Level from RUST_LOG, default info.
    // Example: RUST_LOG=debug bootclone check
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    match bootclone::cli::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}
