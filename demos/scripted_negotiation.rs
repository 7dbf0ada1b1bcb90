use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use rentnego::{
    CreateSessionRequest, Frame, JsonlCheckpointStore, NegotiationConfig, NegotiationService,
    Role, ScriptedResponder,
};
use serde_json::json;

// Run from the root folder of the repo as follows:
// RUST_LOG=info cargo run --example scripted_negotiation
//
// Checkpoints land in ./negotiation_checkpoints (override with
// RENTNEGO_CHECKPOINT_DIR). Running the demo again restores the earlier
// sessions before starting a new one.

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    rentnego::init_logger();

    let config = NegotiationConfig::from_env().with_first_speaker(Role::Tenant);
    let store = Arc::new(JsonlCheckpointStore::open(&config.checkpoint_dir)?);

    let responder = ScriptedResponder::new([
        "Hi, I love the flat. Would you consider £1200 a month?",
        "It's a popular building. The best I can do is £1400.",
        "I could stretch to £1280 if I sign for eighteen months.",
        "Eighteen months helps. Let's meet at £1320.",
        "Deal, £1320 works for me. Agreement reached!",
    ])
    .streaming()
    .with_chunk_delay(Duration::from_millis(40));

    let service = NegotiationService::new(Arc::new(responder), store, config);

    let restored = service.restore_all().await?;
    if !restored.is_empty() {
        println!("Restored {} earlier session(s):", restored.len());
        for session in &restored {
            println!(
                "  {} [{}] {} turns",
                session.session_id, session.status, session.turn_state.turn_count
            );
        }
        println!();
    }

    let context = json!({
        "address": "Flat 3, 12 Harbour Row",
        "asking_rent": 1400,
        "bedrooms": 2,
        "landlord_private": { "min_rent": 1250 },
        "tenant_private": { "max_budget": 1350 }
    });
    let request = CreateSessionRequest::new("harbour-row-3", ["tenant-ana"], "landlord-ben")
        .with_context(context.as_object().cloned().unwrap_or_default());
    let session = service.create_session(request).await?;

    println!("Scripted Negotiation");
    println!("====================\n");
    println!("Session {}\n", session.session_id);

    let mut viewer = service.subscribe(&session.session_id)?;
    service.start(&session.session_id)?;

    while let Some(frame) = viewer.recv().await? {
        match frame {
            Frame::TurnStarted {
                participant_id,
                role,
                turn,
                ..
            } => {
                print!("[{}] {} ({}): ", turn, participant_id, role);
            }
            Frame::Chunk { text } => {
                print!("{}", text);
                io::stdout().flush()?;
            }
            Frame::TurnCompleted { .. } => println!(),
            Frame::AgreementReached { details } => {
                let price = details
                    .price
                    .map(|p| format!("{:.0} {}", p, details.currency.as_deref().unwrap_or("")))
                    .unwrap_or_else(|| "an unstated price".to_string());
                println!("\nAgreement on turn {} at {}", details.turn, price);
            }
            Frame::SessionCompleted { reason } => {
                println!("Negotiation ended: {}", reason);
            }
            Frame::Error { detail } => eprintln!("\nError: {}", detail),
        }
    }

    let state = service.wait(&session.session_id).await?;
    println!("\n[{} turns taken]", state.turn_count);
    Ok(())
}
