//! Fuzz target for envelope decoding.
//!
//! Decoding arbitrary bytes must never panic, and anything that decodes
//! must re-encode to an envelope with the same fingerprint.

#![no_main]

use article_sync::EventEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = EventEnvelope::decode(data) else {
        return;
    };

    assert!(envelope.article_id() > 0);
    assert!(!envelope.timestamp.trim().is_empty());

    let bytes = envelope.encode().expect("decoded envelope re-encodes");
    let again = EventEnvelope::decode(&bytes).expect("re-encoded envelope decodes");
    assert_eq!(again.event_id(), envelope.event_id());

    // The ledger copy is always valid JSON.
    let _ = serde_json::to_vec(&envelope.raw_event()).expect("raw event serializes");
});
