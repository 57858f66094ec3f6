//! A stress test for refresh caches under concurrent, partly failing workloads.

mod cli;
mod stresstest;
mod workloads;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            coalesce::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
