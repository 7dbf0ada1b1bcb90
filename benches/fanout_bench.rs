//! Benchmark to measure the cost of fanning frames out to session viewers.
//!
//! A turn streams a few dozen chunks; each is copied into every subscriber's
//! queue. This shows how publish cost grows with the number of viewers and
//! that it stays far below responder latency.
//!
//! Run with: cargo bench --bench fanout_bench

use rentnego::{Frame, Message, Role, TransportHub};
use std::time::Instant;

const TURNS: u32 = 200;
const CHUNKS_PER_TURN: usize = 40;

fn turn_frames(turn: u32) -> Vec<Frame> {
    let mut frames = vec![Frame::TurnStarted {
        participant_id: "L1".into(),
        role: Role::Landlord,
        turn,
        streaming: true,
    }];
    let mut text = String::new();
    for i in 0..CHUNKS_PER_TURN {
        let chunk = format!("word{} ", i);
        text.push_str(&chunk);
        frames.push(Frame::Chunk { text: chunk });
    }
    frames.push(Frame::TurnCompleted {
        message: Message::new("bench", "L1", Role::Landlord, text),
    });
    frames
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    println!("Transport Fan-out Benchmark");
    println!("===========================\n");
    println!(
        "{} turns x {} frames per turn\n",
        TURNS,
        CHUNKS_PER_TURN + 2
    );

    for viewers in [1usize, 10, 100, 500] {
        let hub = TransportHub::new(1024);
        hub.open_channel("bench");

        let readers: Vec<_> = runtime.block_on(async {
            let mut readers = Vec::with_capacity(viewers);
            for _ in 0..viewers {
                let subscription = hub.subscribe("bench")?;
                readers.push(tokio::spawn(subscription.collect()));
            }
            Ok::<_, rentnego::NegotiationError>(readers)
        })?;

        let start = Instant::now();
        let mut frames = 0usize;
        let mut overflowed = 0usize;
        for turn in 1..=TURNS {
            for frame in turn_frames(turn) {
                let report = hub.publish("bench", frame)?;
                overflowed += report.overflowed.len();
                frames += 1;
            }
        }
        hub.publish(
            "bench",
            Frame::SessionCompleted {
                reason: rentnego::TerminationReason::MaxTurns,
            },
        )?;
        let publish_time = start.elapsed();

        let delivered: usize = runtime.block_on(async {
            let mut total = 0;
            for reader in readers {
                if let Ok((received, _)) = reader.await {
                    total += received.len();
                }
            }
            total
        });
        let drain_time = start.elapsed();

        println!("{} viewer(s):", viewers);
        println!("  Publish time: {:?}", publish_time);
        println!(
            "  Per frame: {:.2}µs",
            publish_time.as_micros() as f64 / frames as f64
        );
        println!("  Until drained: {:?}", drain_time);
        println!("  Frames delivered: {}", delivered);
        println!("  Viewers dropped for overflow: {}\n", overflowed);
    }

    println!("Context:");
    println!("========");
    println!("Responder latency: ~1,000,000µs+ per turn");
    println!("\n✓ Fan-out cost is small next to a single responder call");
    Ok(())
}
