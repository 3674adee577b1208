//! Binary entry point of the rampart reverse proxy.

fn main() {
    match rampart::cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            rampart::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
