use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rentnego::{
    InMemoryDirectory, JsonlCheckpointStore, NegotiationConfig, NegotiationService,
    ScriptedResponder,
};

// Run from the root folder of the repo as follows:
// RUST_LOG=info cargo run --example negotiation_server --features server
//
// Then, in another shell:
// curl -s -X POST localhost:8080/negotiation/create \
//   -H 'content-type: application/json' \
//   -d '{"property_id":"P1","tenant_ids":["T1"],"landlord_id":"L1"}'
// websocat ws://localhost:8080/negotiation/<session_id>/stream   (send: ready)

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    rentnego::init_logger();

    let config = NegotiationConfig::from_env().with_auto_advance(true);
    let store = Arc::new(JsonlCheckpointStore::open(&config.checkpoint_dir)?);
    let responder = ScriptedResponder::new([
        "The flat is £1400 a month, bills excluded.",
        "Would you accept £1250?",
        "I could do £1350 with a twelve month lease.",
        "£1300 and we have a deal?",
        "Agreed, £1300 it is.",
    ])
    .with_fallback("Let me think about that.")
    .streaming()
    .with_chunk_delay(Duration::from_millis(60));

    let directory = InMemoryDirectory::new()
        .with_tenant("T1", "Ana")
        .with_tenant("T2", "Chris")
        .with_landlord("L1", "Ben");

    let service = NegotiationService::new(Arc::new(responder), store, config)
        .with_directory(Arc::new(directory));
    let restored = service.restore_all().await?;
    log::info!("Restored {} session(s) from checkpoints", restored.len());

    let addr: SocketAddr = std::env::var("RENTNEGO_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;
    rentnego::server::serve(Arc::new(service), addr).await
}
