// IPC zum Host: NDJSON ueber stdin/stdout.

pub mod protocol;
pub mod server;
