//! Loopback chat example driving two session registries by hand.
//!
//! This example shows how to:
//! - Create an offer and carry it out of band as base64 text
//! - Answer it on the other registry and complete the handshake
//! - Exchange encrypted messages and watch lifecycle events
//! - Compare key fingerprints and close the session

use futures::StreamExt;
use peerlink::{
    transport::MemoryTransport, PeerId, PeerLinkConfig, SessionEvent, SessionRegistry, SessionState,
};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("peerlink - loopback chat example");
    println!("================================");

    let config = PeerLinkConfig::default();
    let transport = Arc::new(MemoryTransport::new());
    let alice_id = PeerId::parse("alice")?;
    let bob_id = PeerId::parse("bob")?;
    let alice = SessionRegistry::new(alice_id.clone(), transport.clone(), &config);
    let bob = SessionRegistry::new(bob_id.clone(), transport, &config);

    let mut bob_events = bob.event_stream();

    // The text form is what a user would paste or scan on the other device
    let offer = alice.connect(&bob_id).await?;
    let offer_text = offer.to_text()?;
    println!("Offer from alice ({} chars):\n  {}", offer_text.len(), offer_text);

    let answer = bob
        .ingest_signal(&offer.to_bytes()?)
        .await?
        .ok_or("bob produced no answer")?;
    println!("Answer from bob ({} chars)", answer.to_text()?.len());
    alice.ingest_signal(&answer.to_bytes()?).await?;

    let alice_session = alice.get(&bob_id).ok_or("alice has no session")?;
    let bob_session = bob.get(&alice_id).ok_or("bob has no session")?;
    let connected = |state: SessionState| state == SessionState::Connected || state.is_terminal();
    let state = timeout(Duration::from_secs(5), alice_session.wait_for(connected)).await?;
    timeout(Duration::from_secs(5), bob_session.wait_for(connected)).await?;
    if state != SessionState::Connected {
        return Err(format!("handshake ended in {state}").into());
    }

    let alice_fp = alice_session.stats().key_fingerprint.unwrap_or_default();
    let bob_fp = bob_session.stats().key_fingerprint.unwrap_or_default();
    println!("Connected. Fingerprints: alice={alice_fp} bob={bob_fp}");

    let lines = ["hi bob", "are you receiving this?", "bye"];
    for line in lines {
        alice_session.send(line.as_bytes())?;
    }

    let mut received = 0;
    while received < lines.len() {
        let event = timeout(Duration::from_secs(5), bob_events.next())
            .await?
            .ok_or("event stream ended")?;
        match event {
            SessionEvent::Message { peer_id, plaintext, .. } => {
                received += 1;
                println!("bob <- {}: {}", peer_id, String::from_utf8_lossy(&plaintext));
            }
            SessionEvent::Lifecycle { peer_id, state, .. } => {
                println!("bob: session with {peer_id} is {state}");
            }
        }
    }

    alice.close(&bob_id).await;
    let final_state = timeout(Duration::from_secs(5), bob_session.wait_for(SessionState::is_terminal)).await?;
    println!("bob's session ended in {final_state}");
    println!("Done");
    Ok(())
}
