//! marketd.
//!
//! marketd keeps derived financial indicators warm: a stale-tolerant cache
//! over a shared Redis store, fronted by a scheduler that refreshes each
//! indicator on a cadence matching its market's trading sessions. Consumers
//! read through the cache and get an old payload rather than no payload
//! while upstreams are slow or down.

mod cli;
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
