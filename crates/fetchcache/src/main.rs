//! Fetchcache.
//!
//! Fetchcache resolves resources by URL through a memory cache and a persistent response cache,
//! and makes sure concurrent requests for the same resource cause a single download. This binary
//! drives the cache from the command line and maintains the persistent store.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
