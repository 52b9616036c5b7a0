//! Performance benchmarks for the packet codec.
//!
//! These benchmarks measure the relay's hot paths:
//! - Envelope framing and parsing at typical payload sizes
//! - Incremental decoding over a buffer holding many frames
//! - Session-key encryption of chat text

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay::protocol::{ChatMessage, Envelope, Kind, PacketCodec, SessionKey};

fn message_envelope(text_len: usize) -> Envelope {
    let message = ChatMessage::direct(1, 2, "x".repeat(text_len));
    Envelope::with_body(Kind::SendMessage, &message)
        .unwrap()
        .authenticated(1, "0f8e1c2a-5b7d-4e3f-9a61-2c4d8b0e7f15")
}

/// Benchmark encode and decode of single envelopes.
fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");
    let codec = PacketCodec::new();

    for (label, size) in [("small_16B", 16), ("medium_1KB", 1024), ("large_64KB", 65536)] {
        let envelope = message_envelope(size);
        let frame = codec.encode(&envelope).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_function(format!("encode_{}", label), |b| {
            b.iter(|| codec.encode(black_box(&envelope)).unwrap());
        });

        group.bench_function(format!("decode_{}", label), |b| {
            b.iter(|| codec.decode(black_box(&frame)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark draining a read buffer that holds many back-to-back frames.
fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");
    let codec = PacketCodec::new();

    let mut buffer = Vec::new();
    for _ in 0..256 {
        buffer.extend(codec.encode(&message_envelope(64)).unwrap());
    }
    group.throughput(Throughput::Bytes(buffer.len() as u64));

    group.bench_function("try_decode_256_frames", |b| {
        b.iter(|| {
            let mut offset = 0;
            let mut count = 0;
            while let Some((envelope, used)) = codec.try_decode(&buffer[offset..]).unwrap() {
                black_box(envelope);
                offset += used;
                count += 1;
            }
            count
        });
    });

    group.finish();
}

/// Benchmark secure channel message encryption.
fn bench_session_encryption(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_encryption");
    let key = SessionKey::generate();
    let text = vec![b'a'; 1024];
    let (nonce, ciphertext) = key.encrypt(&text).unwrap();

    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("encrypt_1KB", |b| {
        b.iter(|| key.encrypt(black_box(&text)).unwrap());
    });
    group.bench_function("decrypt_1KB", |b| {
        b.iter(|| key.decrypt(black_box(&nonce), black_box(&ciphertext)).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_codec,
    bench_stream_decode,
    bench_session_encryption
);
criterion_main!(benches);
