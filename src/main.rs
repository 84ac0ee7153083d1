mod app;
mod assignment;
mod automation;
mod background;
mod classify;
mod config;
mod contacts;
mod conversations;
mod error;
mod gateway;
mod identity;
mod ingest;
mod media;
mod messages;
mod store;
mod types;
mod webhook;

#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() -> Result<(), error::IngestError> {
    app::run().await
}
