//! A command line client for the fetch cache.
//!
//! `fetchcli fetch <URL>` requests a resource through the same cache tiers an application
//! would use, which makes it handy for inspecting and warming a persistent cache directory.
//! `fetchcli purge` removes expired entries from it.

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            fetchcache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
